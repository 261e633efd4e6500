//! Beanrec main entry point
//!
//! Non-interactive driver: loads a ledger snapshot (already-parsed
//! entries as JSON), pulls pending entries from the configured JSON
//! sources, and prints the ranked candidates and reports for each
//! pending entry. Interactive frontends drive the same engine API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beanrec_config::Config;
use beanrec_core::{MemoryLedger, Reconciler};
use beanrec_model::Entry;
use clap::Parser;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "beanrec")]
#[command(version = "0.1.0")]
#[command(about = "A reconciliation and candidate-generation engine for Beancount ledgers", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Ledger snapshot: a JSON file of already-parsed entries
    #[arg(short, long)]
    ledger: Option<PathBuf>,

    /// Maximum number of pending entries to report on
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", Config::generate_default());
        return Ok(());
    }

    let config = if args.config.exists() {
        Config::load(args.config.clone())
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        log::warn!("config file {} not found, using defaults", args.config.display());
        Config::default()
    };

    let store = Arc::new(match &args.ledger {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let entries: Vec<Entry> =
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            log::info!("loaded {} ledger entries from {}", entries.len(), path.display());
            MemoryLedger::from_entries(&config.output.default_file, entries)
        }
        None => MemoryLedger::new(),
    });

    let limit = args.limit;
    let rt = Runtime::new()?;
    rt.block_on(async move {
        let engine = Reconciler::with_json_sources(config, store)?;
        engine.load().await?;

        for error in engine.journal_errors().await.iter() {
            eprintln!("{}", error);
        }

        let uncleared = engine.uncleared_postings().await;
        if !uncleared.is_empty() {
            println!("Uncleared postings:");
            for posting in uncleared.iter() {
                match &posting.amount {
                    Some(amount) => println!(
                        "  {} {} {} ({}:{})",
                        posting.date, posting.account, amount, posting.file, posting.line
                    ),
                    None => println!(
                        "  {} {} ({}:{})",
                        posting.date, posting.account, posting.file, posting.line
                    ),
                }
            }
            println!();
        }

        let pending = engine.pending().await;
        println!("{} pending entries", pending.len());

        for index in 0..pending.len().min(limit) {
            engine.select_pending(index).await?;
            let candidates = engine.candidates().await?;
            let entry = &pending[index];
            println!();
            println!("== [{}] {} ({}) ==", index, entry.id, entry.source);
            println!("{}", entry.formatted);
            for (rank, candidate) in candidates.candidates.iter().enumerate() {
                println!(
                    "-- candidate {} (matched {}, date distance {}) --",
                    rank, candidate.matched_postings, candidate.date_distance
                );
                for substitution in &candidate.substituted_accounts {
                    println!(
                        "   group {}: {} -> {}",
                        substitution.group_number,
                        substitution.original_name,
                        substitution.account_name
                    );
                }
                print!("{}", candidate.change_set.textual_diff());
            }
        }

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
