//! Embeddable command surface for the contact identity store.
//!
//! Host binaries should enter through [`run_cli`] for full parsed CLI
//! execution, or [`run_command`] to execute a single [`Command`] against an
//! already-open store.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use contact_identity_core::{ConsolidatedView, ContactRecord, Observation};
use contact_identity_store_sqlite::SqliteContactStore;

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity resolution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./contact_identity.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations and report the schema version.
    Migrate,
    /// Resolve one observation and print the consolidated cluster.
    Identify(IdentifyArgs),
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
    Contacts {
        #[command(subcommand)]
        command: ContactsCommand,
    },
}

#[derive(Debug, Args)]
pub struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ClusterCommand {
    /// Print the consolidated view of the cluster containing a contact.
    Show(ClusterShowArgs),
}

#[derive(Debug, Args)]
pub struct ClusterShowArgs {
    #[arg(long)]
    contact_id: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    /// List raw contact records in id order.
    List(ContactsListArgs),
}

#[derive(Debug, Args)]
pub struct ContactsListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

/// Opens the store, migrates it, and executes the parsed command.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, or when
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteContactStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a single command against an open store.
///
/// # Errors
/// Returns an error when input validation or store access fails.
pub fn run_command(command: Command, store: &mut SqliteContactStore) -> Result<()> {
    match command {
        Command::Migrate => {
            let status = store.schema_status()?;
            println!(
                "schema version {} (target {})",
                status.current_version, status.target_version
            );
            Ok(())
        }
        Command::Identify(args) => run_identify(&args, store),
        Command::Cluster {
            command: ClusterCommand::Show(args),
        } => run_cluster_show(&args, store),
        Command::Contacts {
            command: ContactsCommand::List(args),
        } => run_contacts_list(&args, store),
    }
}

fn run_identify(args: &IdentifyArgs, store: &mut SqliteContactStore) -> Result<()> {
    let observation = Observation::new(args.email.as_deref(), args.phone.as_deref())?;
    let view = store.identify(&observation)?;
    print_view(&view, args.json)
}

fn run_cluster_show(args: &ClusterShowArgs, store: &SqliteContactStore) -> Result<()> {
    let view = store.consolidated_view(args.contact_id)?;
    print_view(&view, args.json)
}

fn run_contacts_list(args: &ContactsListArgs, store: &SqliteContactStore) -> Result<()> {
    let records = store.list_contacts(args.limit)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in records {
        println!("{}", describe_record(&record));
    }
    Ok(())
}

fn print_view(view: &ConsolidatedView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
        return Ok(());
    }

    println!("primary: {}", view.primary_id);
    println!("emails: {}", view.emails.join(", "));
    println!("phones: {}", view.phones.join(", "));
    println!(
        "secondaries: {}",
        view.secondary_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn describe_record(record: &ContactRecord) -> String {
    let email = record.email.as_deref().unwrap_or("-");
    let phone = record.phone.as_deref().unwrap_or("-");
    let link = record
        .linked_id
        .map_or_else(String::new, |id| format!(" -> {id}"));
    format!(
        "#{} [{}] email={email} phone={phone}{link}",
        record.id,
        record.link_precedence.as_str()
    )
}
