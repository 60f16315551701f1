use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Store-assigned row identifier. Unique, monotonically increasing, never
/// reused.
pub type ContactId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// One observed (email, phone) pair plus its link lineage. Field values are
/// immutable after creation; only the link role and target may change when
/// clusters merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }
}

/// A validated, normalized identify input. At least one field is always
/// present; construction is the only way to obtain one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    email: Option<String>,
    phone: Option<String>,
}

impl Observation {
    /// Normalizes raw input: both fields are trimmed, blank values count as
    /// absent, emails are lowercased.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when both fields are absent or
    /// blank after trimming.
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Result<Self, IdentityError> {
        let email = email
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_lowercase);
        let phone = phone
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        if email.is_none() && phone.is_none() {
            return Err(IdentityError::Validation(
                "either email or phoneNumber must be provided".to_string(),
            ));
        }

        Ok(Self { email, phone })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

/// How an observation maps onto the clusters it matched. Computed from a
/// read snapshot; the store executes the plan in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing matched; the observation roots a new cluster.
    CreatePrimary,
    /// Every match resolves to one root. `create_link` is true when the
    /// observation contributes a field value the cluster does not hold yet.
    Extend {
        primary_id: ContactId,
        create_link: bool,
    },
    /// The observation bridges two or more clusters.
    Merge(MergePlan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub surviving_primary_id: ContactId,
    /// Primaries losing their role, in ascending id order.
    pub demoted_primary_ids: Vec<ContactId>,
    /// Secondaries of demoted primaries that must point at the survivor
    /// directly, in ascending id order.
    pub repointed_secondary_ids: Vec<ContactId>,
    pub create_link: bool,
}

/// Decides create / extend / merge for an observation against the matched
/// clusters. `clusters` holds one entry per distinct root primary, each the
/// full membership of that cluster.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when any input cluster is malformed
/// (zero or multiple primaries, or a secondary linked past one hop).
pub fn resolve(
    observation: &Observation,
    clusters: &[Vec<ContactRecord>],
) -> Result<Resolution, IdentityError> {
    let mut primaries = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        primaries.push(verify_cluster(cluster)?);
    }

    if clusters.is_empty() {
        return Ok(Resolution::CreatePrimary);
    }

    // A record already carrying exactly both values means the request adds
    // nothing; resolve its root without touching the store.
    if observation.email().is_some() && observation.phone().is_some() {
        for (cluster, primary) in clusters.iter().zip(&primaries) {
            if cluster.iter().any(|record| {
                record.email.as_deref() == observation.email()
                    && record.phone.as_deref() == observation.phone()
            }) {
                return Ok(Resolution::Extend {
                    primary_id: primary.id,
                    create_link: false,
                });
            }
        }
    }

    if let [cluster] = clusters {
        let members: Vec<&ContactRecord> = cluster.iter().collect();
        return Ok(Resolution::Extend {
            primary_id: primaries[0].id,
            create_link: needs_new_link(observation, &members),
        });
    }

    let survivor = select_survivor(primaries.iter().copied())
        .ok_or_else(|| IdentityError::Invariant("merge with no primaries".to_string()))?;

    let mut demoted_primary_ids: Vec<ContactId> = primaries
        .iter()
        .filter(|primary| primary.id != survivor.id)
        .map(|primary| primary.id)
        .collect();
    demoted_primary_ids.sort_unstable();

    let demoted: BTreeSet<ContactId> = demoted_primary_ids.iter().copied().collect();
    let mut repointed_secondary_ids: Vec<ContactId> = clusters
        .iter()
        .flatten()
        .filter(|record| !record.is_primary())
        .filter(|record| record.linked_id.is_some_and(|linked| demoted.contains(&linked)))
        .map(|record| record.id)
        .collect();
    repointed_secondary_ids.sort_unstable();

    let unified: Vec<&ContactRecord> = clusters.iter().flatten().collect();
    Ok(Resolution::Merge(MergePlan {
        surviving_primary_id: survivor.id,
        demoted_primary_ids,
        repointed_secondary_ids,
        create_link: needs_new_link(observation, &unified),
    }))
}

/// Oldest primary wins; ties break on the smaller id.
fn select_survivor<'a>(
    primaries: impl IntoIterator<Item = &'a ContactRecord>,
) -> Option<&'a ContactRecord> {
    primaries
        .into_iter()
        .min_by_key(|record| (record.created_at, record.id))
}

/// The "new information" test: a secondary row is warranted only when the
/// literal (email, phone) combination is absent from the cluster AND the
/// observation carries an email or phone value no member holds. Granularity
/// is whole field values; re-pairing known values across records still
/// counts as new.
fn needs_new_link(observation: &Observation, records: &[&ContactRecord]) -> bool {
    let combination_exists = records.iter().any(|record| {
        record.email.as_deref() == observation.email()
            && record.phone.as_deref() == observation.phone()
    });
    if combination_exists {
        return false;
    }

    let new_email = observation.email().is_some_and(|email| {
        !records
            .iter()
            .any(|record| record.email.as_deref() == Some(email))
    });
    let new_phone = observation.phone().is_some_and(|phone| {
        !records
            .iter()
            .any(|record| record.phone.as_deref() == Some(phone))
    });

    new_email || new_phone
}

/// Checks the cluster shape and returns its primary: exactly one `Primary`
/// member, every `Secondary` pointing at it in one hop.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] describing the first violation
/// found.
pub fn verify_cluster(records: &[ContactRecord]) -> Result<&ContactRecord, IdentityError> {
    let mut primaries = records.iter().filter(|record| record.is_primary());
    let primary = primaries
        .next()
        .ok_or_else(|| IdentityError::Invariant("cluster has no primary record".to_string()))?;
    if let Some(extra) = primaries.next() {
        return Err(IdentityError::Invariant(format!(
            "cluster has multiple primaries: {} and {}",
            primary.id, extra.id
        )));
    }

    for record in records {
        if record.is_primary() {
            if record.linked_id.is_some() {
                return Err(IdentityError::Invariant(format!(
                    "primary contact {} carries a linked_id",
                    record.id
                )));
            }
            continue;
        }
        match record.linked_id {
            Some(linked) if linked == primary.id => {}
            Some(linked) => {
                return Err(IdentityError::Invariant(format!(
                    "secondary contact {} links to {} instead of primary {}",
                    record.id, linked, primary.id
                )));
            }
            None => {
                return Err(IdentityError::Invariant(format!(
                    "secondary contact {} has no linked_id",
                    record.id
                )));
            }
        }
    }

    Ok(primary)
}

/// Canonical read projection of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidatedView {
    pub primary_id: ContactId,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub secondary_ids: Vec<ContactId>,
}

/// Projects a cluster into its consolidated view: the primary's own values
/// lead each list, the rest follow in creation order, first occurrence wins.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when the cluster is malformed.
pub fn project(records: &[ContactRecord]) -> Result<ConsolidatedView, IdentityError> {
    let primary = verify_cluster(records)?;

    let mut ordered: Vec<&ContactRecord> = records.iter().collect();
    ordered.sort_by_key(|record| (record.created_at, record.id));

    let mut emails = Vec::new();
    let mut phones = Vec::new();
    let mut secondary_ids = Vec::new();

    if let Some(email) = &primary.email {
        emails.push(email.clone());
    }
    if let Some(phone) = &primary.phone {
        phones.push(phone.clone());
    }

    for record in ordered {
        if record.id == primary.id {
            continue;
        }
        if let Some(email) = &record.email {
            if !emails.contains(email) {
                emails.push(email.clone());
            }
        }
        if let Some(phone) = &record.phone {
            if !phones.contains(phone) {
                phones.push(phone.clone());
            }
        }
        secondary_ids.push(record.id);
    }

    Ok(ConsolidatedView {
        primary_id: primary.id,
        emails,
        phones,
        secondary_ids,
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when parsing fails or the offset is
/// not UTC; stored timestamps are written by this crate's formatter, so a
/// mismatch means corrupt data.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IdentityError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IdentityError::Invariant(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IdentityError::Invariant(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IdentityError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IdentityError::Invariant(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
