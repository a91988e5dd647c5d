use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tigrisfs_cache::config::Settings;
use tigrisfs_cache::index::{CacheIndex, SledCacheIndex};
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(name = "cache-tool")]
#[command(author, version, about = "Admin scaffolding for the write-back cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "config.yaml")]
        path: PathBuf,
    },
    /// Open an existing cache root read-only and print index/upload counts
    Stats {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value = "default")]
        disk_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            println!("Edit the file, then run: cache-tool stats -c {}", path.display());
        }
        Commands::Stats { config, disk_id } => {
            let settings = match Settings::from_file(&config) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("failed to load config: {e:#}");
                    std::process::exit(1);
                }
            };
            print_stats(&settings, &disk_id).await?;
        }
    }

    Ok(())
}

async fn print_stats(settings: &Settings, disk_id: &str) -> Result<()> {
    let cache_root = settings.resolved_cache_dir(disk_id);
    let index = SledCacheIndex::open(cache_root.join("index.db"))
        .context("opening cache index")?;

    let cancel = CancellationToken::new();
    let stats = index.stats(&cancel).await?;
    let files = index.list_lru(0, &cancel).await?;
    let uploads = index.list_uploads(&cancel).await?;

    let queued = uploads
        .iter()
        .filter(|u| u.status == tigrisfs_cache::model::UploadStatus::Queued)
        .count();
    let in_progress = uploads
        .iter()
        .filter(|u| u.status == tigrisfs_cache::model::UploadStatus::InProgress)
        .count();
    let failed = uploads
        .iter()
        .filter(|u| u.status == tigrisfs_cache::model::UploadStatus::Failed)
        .count();
    let total_bytes: u64 = files.iter().map(|m| m.size).sum();

    let mut table = comfy_table::Table::new();
    table.set_header(vec!["metric", "value"]);
    table.add_row(vec!["schema version".to_string(), stats.schema_version.to_string()]);
    table.add_row(vec!["cached files".to_string(), files.len().to_string()]);
    table.add_row(vec![
        "cached bytes".to_string(),
        num_format::ToFormattedString::to_formatted_string(&total_bytes, &num_format::Locale::en),
    ]);
    table.add_row(vec!["uploads queued".to_string(), queued.to_string()]);
    table.add_row(vec!["uploads in progress".to_string(), in_progress.to_string()]);
    table.add_row(vec!["uploads failed".to_string(), failed.to_string()]);

    println!("{table}");
    index.close().await?;
    Ok(())
}
