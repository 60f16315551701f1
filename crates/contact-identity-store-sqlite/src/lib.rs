#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, project, resolve, ConsolidatedView, ContactId,
    ContactRecord, IdentityError, LinkPrecedence, MergePlan, Observation, Resolution,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const CONTACT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CONTACTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked ON contacts(linked_id);
";

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
}

pub struct SqliteContactStore {
    conn: Connection,
}

impl SqliteContactStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CONTACTS_V1)
            .context("failed to apply contact schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CONTACT_MIGRATION_VERSION, now],
            )
            .context("failed to register contact schema migration")?;

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to query schema_migrations")?
            .unwrap_or(0);

        Ok(SchemaStatus {
            current_version,
            target_version: CONTACT_MIGRATION_VERSION,
        })
    }

    /// Resolves one observation: lookup, decision, and every mutation run in
    /// a single immediate transaction, so concurrent requests racing on the
    /// same email/phone serialize instead of both acting as the sole merger.
    pub fn identify(&mut self, observation: &Observation) -> Result<ConsolidatedView> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identify transaction")?;

        let view = identify_in_tx(&tx, observation)?;
        tx.commit().context("failed to commit identify transaction")?;
        Ok(view)
    }

    /// Union match: records equal on the given email or the given phone.
    /// An absent input field constrains nothing and never matches stored
    /// NULLs.
    pub fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>> {
        query_by_email_or_phone(&self.conn, email, phone)
    }

    pub fn find_by_id(&self, id: ContactId) -> Result<Option<ContactRecord>> {
        query_by_id(&self.conn, id)
    }

    /// The primary plus every record linked to it, ordered by `created_at`
    /// ascending with `id` as the tie-break.
    pub fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<ContactRecord>> {
        query_cluster(&self.conn, primary_id)
    }

    /// Walks from any cluster member to its current primary and projects the
    /// consolidated view. Read-only.
    pub fn consolidated_view(&self, contact_id: ContactId) -> Result<ConsolidatedView> {
        let record = query_by_id(&self.conn, contact_id)?
            .ok_or_else(|| anyhow!("contact {contact_id} not found"))?;
        let primary = resolve_root(&self.conn, &record)?;
        let cluster = query_cluster(&self.conn, primary.id)?;
        Ok(project(&cluster)?)
    }

    pub fn list_contacts(&self, limit: Option<usize>) -> Result<Vec<ContactRecord>> {
        let mut query = "SELECT id, email, phone_number, linked_id, link_precedence,
                created_at, updated_at, deleted_at
             FROM contacts
             ORDER BY id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_contact_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn identify_in_tx(conn: &Connection, observation: &Observation) -> Result<ConsolidatedView> {
    let matched = query_by_email_or_phone(conn, observation.email(), observation.phone())?;
    let clusters = load_matched_clusters(conn, &matched)?;

    let primary_id = match resolve(observation, &clusters)? {
        Resolution::CreatePrimary => {
            insert_contact(
                conn,
                observation.email(),
                observation.phone(),
                LinkPrecedence::Primary,
                None,
            )?
            .id
        }
        Resolution::Extend {
            primary_id,
            create_link,
        } => {
            if create_link {
                insert_contact(
                    conn,
                    observation.email(),
                    observation.phone(),
                    LinkPrecedence::Secondary,
                    Some(primary_id),
                )?;
            }
            primary_id
        }
        Resolution::Merge(plan) => {
            apply_merge(conn, &plan)?;
            if plan.create_link {
                insert_contact(
                    conn,
                    observation.email(),
                    observation.phone(),
                    LinkPrecedence::Secondary,
                    Some(plan.surviving_primary_id),
                )?;
            }
            plan.surviving_primary_id
        }
    };

    let cluster = query_cluster(conn, primary_id)?;
    Ok(project(&cluster)?)
}

/// Resolves every matched record to its root primary (deduplicated by id)
/// and loads each root's full cluster.
fn load_matched_clusters(
    conn: &Connection,
    matched: &[ContactRecord],
) -> Result<Vec<Vec<ContactRecord>>> {
    let mut root_ids = BTreeSet::new();
    for record in matched {
        root_ids.insert(resolve_root(conn, record)?.id);
    }

    root_ids
        .into_iter()
        .map(|id| query_cluster(conn, id))
        .collect()
}

/// A primary resolves to itself; a secondary dereferences `linked_id` once.
/// Anything else (dangling link, link landing on another secondary) is
/// corrupt data and surfaces as an error rather than a guessed root.
fn resolve_root(conn: &Connection, record: &ContactRecord) -> Result<ContactRecord> {
    if record.is_primary() {
        return Ok(record.clone());
    }

    let linked_id = record.linked_id.ok_or_else(|| {
        IdentityError::Invariant(format!("secondary contact {} has no linked_id", record.id))
    })?;
    let primary = query_by_id(conn, linked_id)?.ok_or_else(|| {
        IdentityError::Invariant(format!(
            "contact {} links to missing contact {linked_id}",
            record.id
        ))
    })?;
    if !primary.is_primary() {
        return Err(IdentityError::Invariant(format!(
            "contact {} links to secondary contact {linked_id}",
            record.id
        ))
        .into());
    }

    Ok(primary)
}

fn apply_merge(conn: &Connection, plan: &MergePlan) -> Result<()> {
    let stamp = format_rfc3339(now_utc())?;

    for id in &plan.demoted_primary_ids {
        let changed = conn
            .execute(
                "UPDATE contacts
                 SET link_precedence = 'secondary', linked_id = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![plan.surviving_primary_id, stamp, id],
            )
            .with_context(|| format!("failed to demote primary contact {id}"))?;
        if changed != 1 {
            return Err(anyhow!("demoting contact {id} updated {changed} rows"));
        }
    }

    for id in &plan.repointed_secondary_ids {
        let changed = conn
            .execute(
                "UPDATE contacts SET linked_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![plan.surviving_primary_id, stamp, id],
            )
            .with_context(|| format!("failed to re-point secondary contact {id}"))?;
        if changed != 1 {
            return Err(anyhow!("re-pointing contact {id} updated {changed} rows"));
        }
    }

    Ok(())
}

fn insert_contact(
    conn: &Connection,
    email: Option<&str>,
    phone: Option<&str>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<ContactRecord> {
    let now = now_utc();
    let stamp = format_rfc3339(now)?;

    conn.execute(
        "INSERT INTO contacts(email, phone_number, linked_id, link_precedence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![email, phone, linked_id, link_precedence.as_str(), stamp],
    )
    .context("failed to insert contact")?;

    Ok(ContactRecord {
        id: conn.last_insert_rowid(),
        email: email.map(str::to_string),
        phone: phone.map(str::to_string),
        link_precedence,
        linked_id,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

fn query_by_email_or_phone(
    conn: &Connection,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<Vec<ContactRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, phone_number, linked_id, link_precedence,
                created_at, updated_at, deleted_at
         FROM contacts
         WHERE (email = ?1 AND ?1 IS NOT NULL)
            OR (phone_number = ?2 AND ?2 IS NOT NULL)
         ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![email, phone], parse_contact_row)?;
    collect_rows(rows)
}

fn query_by_id(conn: &Connection, id: ContactId) -> Result<Option<ContactRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, phone_number, linked_id, link_precedence,
                created_at, updated_at, deleted_at
         FROM contacts
         WHERE id = ?1",
    )?;

    let row = stmt.query_row(params![id], parse_contact_row).optional()?;
    Ok(row)
}

fn query_cluster(conn: &Connection, primary_id: ContactId) -> Result<Vec<ContactRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, phone_number, linked_id, link_precedence,
                created_at, updated_at, deleted_at
         FROM contacts
         WHERE id = ?1 OR linked_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![primary_id], parse_contact_row)?;
    collect_rows(rows)
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRecord> {
    let precedence_raw: String = row.get(4)?;
    let link_precedence = LinkPrecedence::parse(&precedence_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid link_precedence: {precedence_raw}"),
            )),
        )
    })?;

    let created_at = parse_rfc3339_utc(&row.get::<_, String>(5)?).map_err(to_sql_error)?;
    let updated_at = parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(to_sql_error)?;
    let deleted_at = row
        .get::<_, Option<String>>(7)?
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(to_sql_error)?;

    Ok(ContactRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        phone: row.get(2)?,
        linked_id: row.get(3)?,
        link_precedence,
        created_at,
        updated_at,
        deleted_at,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: IdentityError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteContactStore {
        let store = must(SqliteContactStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn observation(email: Option<&str>, phone: Option<&str>) -> Observation {
        match Observation::new(email, phone) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture observation: {err}"),
        }
    }

    fn seed_contact(
        store: &SqliteContactStore,
        email: Option<&str>,
        phone: Option<&str>,
        linked_id: Option<ContactId>,
        created_at: &str,
    ) -> ContactId {
        let precedence = if linked_id.is_some() {
            "secondary"
        } else {
            "primary"
        };
        must(
            store
                .connection()
                .execute(
                    "INSERT INTO contacts(email, phone_number, linked_id, link_precedence, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![email, phone, linked_id, precedence, created_at],
                )
                .map_err(anyhow::Error::from),
        );
        store.connection().last_insert_rowid()
    }

    fn contact_count(store: &SqliteContactStore) -> i64 {
        must(
            store
                .connection()
                .query_row("SELECT COUNT(*) FROM contacts", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(anyhow::Error::from),
        )
    }

    fn fetch(store: &SqliteContactStore, id: ContactId) -> ContactRecord {
        match must(store.find_by_id(id)) {
            Some(record) => record,
            None => panic!("contact {id} not found"),
        }
    }

    #[test]
    fn migrate_registers_schema_version() {
        let store = fixture_store();
        let status = must(store.schema_status());
        assert_eq!(status.current_version, status.target_version);
    }

    #[test]
    fn first_observation_creates_primary() {
        let mut store = fixture_store();

        let view = must(store.identify(&observation(Some("a@x.com"), Some("111"))));

        assert_eq!(view.emails, vec!["a@x.com"]);
        assert_eq!(view.phones, vec!["111"]);
        assert!(view.secondary_ids.is_empty());

        let record = fetch(&store, view.primary_id);
        assert!(record.is_primary());
        assert_eq!(record.linked_id, None);
        assert_eq!(contact_count(&store), 1);
    }

    #[test]
    fn repeated_observation_is_idempotent() {
        let mut store = fixture_store();

        let first = must(store.identify(&observation(Some("a@x.com"), Some("111"))));
        assert_eq!(contact_count(&store), 1);

        let second = must(store.identify(&observation(Some("a@x.com"), Some("111"))));
        assert_eq!(contact_count(&store), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn new_phone_links_secondary_to_existing_primary() {
        let mut store = fixture_store();
        let primary_id = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );

        let view = must(store.identify(&observation(Some("a@x.com"), Some("222"))));

        assert_eq!(view.primary_id, primary_id);
        assert_eq!(view.emails, vec!["a@x.com"]);
        assert_eq!(view.phones, vec!["111", "222"]);
        assert_eq!(view.secondary_ids.len(), 1);

        let secondary = fetch(&store, view.secondary_ids[0]);
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(secondary.linked_id, Some(primary_id));
        assert_eq!(contact_count(&store), 2);
    }

    #[test]
    fn bridging_observation_merges_into_older_primary() {
        let mut store = fixture_store();
        let older = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );
        let newer = seed_contact(
            &store,
            Some("b@x.com"),
            Some("222"),
            None,
            "2026-01-05T00:00:00Z",
        );

        let view = must(store.identify(&observation(Some("a@x.com"), Some("222"))));

        assert_eq!(view.primary_id, older);
        assert_eq!(view.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(view.phones, vec!["111", "222"]);
        assert_eq!(view.secondary_ids, vec![newer]);
        // Both fields were already covered post-merge, so no new row.
        assert_eq!(contact_count(&store), 2);

        let demoted = fetch(&store, newer);
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(older));
        assert_ne!(
            must(format_rfc3339(demoted.updated_at)),
            "2026-01-05T00:00:00Z"
        );
        assert_eq!(
            must(format_rfc3339(demoted.created_at)),
            "2026-01-05T00:00:00Z"
        );
    }

    #[test]
    fn merge_repoints_nested_secondaries_one_hop() {
        let mut store = fixture_store();
        let older = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );
        let newer = seed_contact(
            &store,
            Some("b@x.com"),
            Some("222"),
            None,
            "2026-01-03T00:00:00Z",
        );
        let nested = seed_contact(
            &store,
            Some("c@x.com"),
            Some("222"),
            Some(newer),
            "2026-01-04T00:00:00Z",
        );

        let view = must(store.identify(&observation(Some("a@x.com"), Some("222"))));

        assert_eq!(view.primary_id, older);
        assert_eq!(view.secondary_ids, vec![newer, nested]);
        assert_eq!(fetch(&store, nested).linked_id, Some(older));
        assert_eq!(fetch(&store, newer).linked_id, Some(older));
    }

    #[test]
    fn known_pair_on_secondary_creates_nothing() {
        let mut store = fixture_store();
        let primary_id = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );
        let secondary_id = seed_contact(
            &store,
            Some("b@x.com"),
            Some("222"),
            Some(primary_id),
            "2026-01-02T00:00:00Z",
        );

        let view = must(store.identify(&observation(Some("b@x.com"), Some("222"))));

        assert_eq!(view.primary_id, primary_id);
        assert_eq!(view.secondary_ids, vec![secondary_id]);
        assert_eq!(contact_count(&store), 2);
    }

    #[test]
    fn phone_only_match_resolves_through_secondary() {
        let mut store = fixture_store();
        let primary_id = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );
        let secondary_id = seed_contact(
            &store,
            Some("b@x.com"),
            Some("222"),
            Some(primary_id),
            "2026-01-02T00:00:00Z",
        );

        let view = must(store.identify(&observation(None, Some("222"))));

        assert_eq!(view.primary_id, primary_id);
        assert_eq!(view.secondary_ids, vec![secondary_id]);
        // (None, 222) is new as a combination, but 222 is a known phone
        // value, so no row is created.
        assert_eq!(contact_count(&store), 2);
    }

    #[test]
    fn merge_tie_breaks_on_smaller_id_for_equal_timestamps() {
        let mut store = fixture_store();
        let first = seed_contact(
            &store,
            Some("a@x.com"),
            None,
            None,
            "2026-01-01T00:00:00Z",
        );
        let second = seed_contact(
            &store,
            None,
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );

        let view = must(store.identify(&observation(Some("a@x.com"), Some("111"))));

        assert_eq!(view.primary_id, first);
        assert_eq!(fetch(&store, second).linked_id, Some(first));
    }

    #[test]
    fn dangling_link_is_an_error_not_a_guess() {
        let store = fixture_store();
        must(
            store
                .connection()
                .execute_batch("PRAGMA foreign_keys = OFF;")
                .map_err(anyhow::Error::from),
        );
        seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            Some(999),
            "2026-01-01T00:00:00Z",
        );

        let mut store = store;
        let result = store.identify(&observation(Some("a@x.com"), None));
        let err = match result {
            Ok(view) => panic!("expected invariant failure, got {view:?}"),
            Err(err) => format!("{err:#}"),
        };
        assert!(err.contains("invariant violation"), "unexpected error: {err}");
        // The failed request must not leave a row behind.
        assert_eq!(contact_count(&store), 1);
    }

    #[test]
    fn link_chain_deeper_than_one_hop_is_an_error() {
        let mut store = fixture_store();
        let root = seed_contact(
            &store,
            Some("a@x.com"),
            None,
            None,
            "2026-01-01T00:00:00Z",
        );
        let middle = seed_contact(
            &store,
            Some("b@x.com"),
            None,
            Some(root),
            "2026-01-02T00:00:00Z",
        );
        seed_contact(
            &store,
            Some("c@x.com"),
            Some("333"),
            Some(middle),
            "2026-01-03T00:00:00Z",
        );

        let result = store.identify(&observation(Some("c@x.com"), None));
        assert!(result.is_err());
    }

    #[test]
    fn consolidated_view_walks_from_any_member() {
        let mut store = fixture_store();
        let primary_id = seed_contact(
            &store,
            Some("a@x.com"),
            Some("111"),
            None,
            "2026-01-01T00:00:00Z",
        );
        let secondary_id = seed_contact(
            &store,
            Some("b@x.com"),
            None,
            Some(primary_id),
            "2026-01-02T00:00:00Z",
        );

        let via_primary = must(store.consolidated_view(primary_id));
        let via_secondary = must(store.consolidated_view(secondary_id));
        assert_eq!(via_primary, via_secondary);
        assert_eq!(via_primary.primary_id, primary_id);
    }

    #[test]
    fn absent_fields_never_match_stored_nulls() {
        let mut store = fixture_store();
        seed_contact(&store, Some("a@x.com"), None, None, "2026-01-01T00:00:00Z");

        let view = must(store.identify(&observation(None, Some("111"))));

        // The email-less record must not be matched by the absent email.
        assert_eq!(view.emails, Vec::<String>::new());
        assert_eq!(view.phones, vec!["111"]);
        assert_eq!(contact_count(&store), 2);
    }

    fn assert_clusters_well_formed(store: &SqliteContactStore) {
        let records = must(store.list_contacts(None));
        let by_id: BTreeMap<ContactId, &ContactRecord> =
            records.iter().map(|record| (record.id, record)).collect();

        for record in &records {
            match record.link_precedence {
                LinkPrecedence::Primary => assert_eq!(record.linked_id, None),
                LinkPrecedence::Secondary => {
                    let linked = match record.linked_id.and_then(|id| by_id.get(&id)) {
                        Some(value) => value,
                        None => panic!("contact {} has a dangling link", record.id),
                    };
                    assert!(
                        linked.is_primary(),
                        "contact {} links past one hop",
                        record.id
                    );
                    assert!(
                        (linked.created_at, linked.id) <= (record.created_at, record.id),
                        "primary {} is junior to its secondary {}",
                        linked.id,
                        record.id
                    );
                }
            }
        }
    }

    fn alphabet_observation(email_code: u8, phone_code: u8) -> Option<Observation> {
        let emails = ["a@x.com", "b@x.com", "c@x.com"];
        let phones = ["111", "222", "333"];
        let email = (email_code > 0).then(|| emails[usize::from(email_code - 1) % emails.len()]);
        let phone = (phone_code > 0).then(|| phones[usize::from(phone_code - 1) % phones.len()]);
        Observation::new(email, phone).ok()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_observation_sequence_keeps_clusters_well_formed(
            inputs in prop::collection::vec((0u8..4, 0u8..4), 1..24)
        ) {
            let mut store = fixture_store();

            for (email_code, phone_code) in inputs {
                let Some(input) = alphabet_observation(email_code, phone_code) else {
                    continue;
                };
                let view = must(store.identify(&input));
                prop_assert!(view.primary_id > 0);
            }

            assert_clusters_well_formed(&store);
        }
    }
}
