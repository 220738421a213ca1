use std::{collections::HashSet, path::PathBuf};

use anyhow::{anyhow, Result};
use channel_engine::{config::DEFAULT_SETTINGS_FILE, load_settings, prepare_database_url};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use shared::domain::PeerId;
use storage::Storage;
use tracing::info;

/// Inspect and edit the engine's last-read store.
#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; `APP__*` variables still override it.
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    List,
    Set { peer_id: String, epoch_ms: i64 },
    Remove {
        #[arg(required = true)]
        peer_ids: Vec<String>,
    },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli.config);
    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .init();

    let database_url =
        prepare_database_url(cli.database_url.as_deref().unwrap_or(&settings.database_url))?;
    info!(database_url = %database_url, "tools: opening last-read store");
    let storage = Storage::new(&database_url).await?;

    match cli.command {
        Command::List => {
            for row in storage.list_last_reads().await? {
                println!(
                    "{}\t{}\t{}",
                    row.peer_id,
                    row.read_at.to_rfc3339(),
                    row.updated_at.to_rfc3339()
                );
            }
        }
        Command::Set { peer_id, epoch_ms } => {
            let read_at = DateTime::from_timestamp_millis(epoch_ms)
                .ok_or_else(|| anyhow!("timestamp out of range: {epoch_ms}"))?;
            storage
                .upsert_last_read(&PeerId::new(peer_id.clone()), read_at)
                .await?;
            println!("set peer_id={peer_id} read_at={}", read_at.to_rfc3339());
        }
        Command::Remove { peer_ids } => {
            let peers: HashSet<PeerId> = peer_ids.into_iter().map(PeerId::new).collect();
            let removed = storage.delete_last_reads(&peers).await?;
            println!("removed {removed} watermark(s)");
        }
        Command::Clear => {
            let removed = storage.clear_last_reads().await?;
            println!("cleared {removed} watermark(s)");
        }
    }

    Ok(())
}
