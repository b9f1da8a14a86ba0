//! Operator command surface for Caseboard case records.
//!
//! - [`run_cli`] executes a fully parsed command line.
//! - [`run_cases_with_db`] executes a [`CasesCommand`] against a `SQLite` DB path.
//! - [`run_cases`] executes against an existing [`CaseService`] and returns the JSON
//!   document that the binary prints.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use caseboard_core::{CaseId, CaseInput, CaseService};
use caseboard_store_sqlite::SqliteCaseStore;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "cb")]
#[command(about = "Caseboard case record CLI")]
pub struct Cli {
    #[arg(long, env = "CASEBOARD_DB", default_value = "./caseboard.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Cases {
        #[command(subcommand)]
        command: CasesCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CasesCommand {
    List,
    Show(IdArgs),
    Create(CaseArgs),
    Update {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        fields: CaseArgs,
    },
    Delete(IdArgs),
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct CaseArgs {
    #[arg(long)]
    case_number: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    status: Option<String>,
}

impl From<CaseArgs> for CaseInput {
    fn from(args: CaseArgs) -> Self {
        Self {
            case_number: args.case_number,
            title: args.title,
            description: args.description,
            status: args.status,
        }
    }
}

/// Executes the parsed top-level CLI command graph and prints the result.
///
/// # Errors
/// Returns an error when store open/migrate fails or the case operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Cases { command } => {
            let output = run_cases_with_db(&cli.db, command)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

/// Executes a parsed cases command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_cases_with_db(db_path: &Path, command: CasesCommand) -> Result<Value> {
    let store = SqliteCaseStore::open(db_path)?;
    store.migrate()?;
    run_cases(command, &CaseService::from_store(store))
}

/// Executes a parsed cases command against an existing service handle.
///
/// # Errors
/// Returns an error when validation, lookup, or persistence fails.
pub fn run_cases(command: CasesCommand, cases: &CaseService) -> Result<Value> {
    match command {
        CasesCommand::List => Ok(json!({ "data": cases.list_all()? })),
        CasesCommand::Show(args) => {
            let id = CaseId(args.id);
            let case = cases.get_by_id(id)?.ok_or_else(|| anyhow!("Case <id: {id}> not found"))?;
            Ok(json!({ "data": case }))
        }
        CasesCommand::Create(args) => {
            let id = cases.insert(&args.into())?;
            tracing::info!(case_id = %id, "case created");
            Ok(json!({ "id": id }))
        }
        CasesCommand::Update { id, fields } => {
            cases.update(CaseId(id), &fields.into())?;
            Ok(json!({ "updated": true, "id": id }))
        }
        CasesCommand::Delete(args) => {
            cases.delete_by_id(CaseId(args.id))?;
            Ok(json!({ "deleted": true, "id": args.id }))
        }
    }
}
