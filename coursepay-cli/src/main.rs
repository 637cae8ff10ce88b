//! Operator CLI for the coursepay reconciliation engine.
//!
//! Works directly against the server's state database: inspect the dead
//! letter queue and requeue entries for manual replay. A requeued event
//! goes back to `received`; the running server's sweep (or its next
//! startup recovery) picks it up.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use coursepay_server::repository::{Repository, SqliteRepository};
use coursepay_server::state_machine::state::ProviderEventId;

/// Coursepay: payment reconciliation operations
#[derive(Parser, Debug)]
#[command(name = "coursepay")]
#[command(about = "Operator tooling for the payment reconciliation engine", long_about = None)]
struct Cli {
    /// Directory holding the server's state database
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List dead-lettered events awaiting manual review
    DeadLetters,
    /// Show one dead letter, including the stored webhook payload
    Show {
        /// Provider event id (evt_...)
        provider_event_id: String,
    },
    /// Requeue a dead-lettered event for replay
    Requeue {
        /// Provider event id (evt_...)
        provider_event_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let db_path = cli.state_dir.join("coursepay-state.db");
    let repository = SqliteRepository::new(&db_path)
        .with_context(|| format!("failed to open state database at {}", db_path.display()))?;

    match cli.command {
        Commands::DeadLetters => list_dead_letters(&repository).await,
        Commands::Show { provider_event_id } => {
            show_dead_letter(&repository, &provider_event_id).await
        }
        Commands::Requeue { provider_event_id } => {
            requeue(&repository, &provider_event_id).await
        }
    }
}

async fn list_dead_letters(repository: &SqliteRepository) -> Result<()> {
    let records = repository.list_dead_letters().await?;

    if records.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!(
        "{:<24} {:<40} {:>8}  {}",
        "EVENT", "REASON", "ATTEMPTS", "CREATED"
    );
    for record in records {
        println!(
            "{:<24} {:<40} {:>8}  {}",
            record.provider_event_id,
            record.reason,
            record.attempts,
            record.created_at.to_rfc3339(),
        );
    }
    Ok(())
}

async fn show_dead_letter(repository: &SqliteRepository, provider_event_id: &str) -> Result<()> {
    let id = ProviderEventId::from(provider_event_id);

    let Some(record) = repository.find_dead_letter(&id).await? else {
        bail!("no dead letter for event {}", provider_event_id);
    };

    println!("event:      {}", record.provider_event_id);
    println!("reason:     {}", record.reason);
    println!("attempts:   {}", record.attempts);
    println!("last error: {}", record.last_error);
    println!("created:    {}", record.created_at.to_rfc3339());

    if let Some(event) = repository.load_event(&id).await? {
        println!("kind:       {}", event.kind);
        println!("hash:       {}", event.payload_hash);
        println!("payload:\n{}", event.payload);
    }
    Ok(())
}

async fn requeue(repository: &SqliteRepository, provider_event_id: &str) -> Result<()> {
    let id = ProviderEventId::from(provider_event_id);

    if repository.requeue_dead_letter(&id).await? {
        println!(
            "Event {} requeued; the server will pick it up on its next sweep.",
            provider_event_id
        );
        Ok(())
    } else {
        bail!("no dead letter for event {}", provider_event_id);
    }
}
