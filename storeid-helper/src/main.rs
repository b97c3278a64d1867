//! StoreID dedup helper: a Squid `store_id_program`.
//!
//! Loads a rule file, canonicalizes URLs Squid asks about over stdin/stdout,
//! and optionally warms the cache for matches flagged `fetch`. Hot-reloads
//! on SIGHUP or (if `auto_reload` is set) when the rule file changes.
//!
//! CLI surface follows the `clap`-derive style `router-cli`'s `main.rs` uses
//! for its own flags, generalized to this tool's single config path plus
//! logging overrides (§2.1/2.4 of the design notes).

mod config;
mod logging;
mod prefetch;
mod protocol;
mod rules;
mod supervisor;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;

/// Squid StoreID dedup helper.
#[derive(Parser, Debug)]
#[command(name = "storeid-dedup")]
#[command(about = "Canonicalizes URLs for Squid's store_id_program protocol", long_about = None)]
struct Args {
    /// Path to the primary rule file.
    #[arg(short = 'c', long = "config", default_value = "/etc/squid/storeid-dedup.conf")]
    config: PathBuf,

    /// Override the rule file's `loglevel` (Python logging scale: 10=DEBUG .. 50=CRITICAL).
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<i64>,

    /// Override the rule file's `logfile` ("-" means stderr).
    #[arg(long = "log-file")]
    log_file: Option<String>,
}

fn main() {
    let args = Args::parse();

    let mut snapshot = match config::load_initial(&args.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            std::process::exit(1);
        }
    };
    if let Some(level) = args.log_level {
        snapshot.log_level = level;
    }
    if let Some(file) = args.log_file {
        snapshot.log_file = file;
    }

    logging::init(&snapshot);
    log::info!(
        "{}: loaded {} section(s), {} prefetch worker(s), auto_reload={}",
        args.config.display(),
        snapshot.sections.len(),
        snapshot.fetch_workers,
        snapshot.auto_reload,
    );

    let (shutdown, reload_requested) = match supervisor::install_signal_flags() {
        Ok(flags) => flags,
        Err(e) => {
            log::error!("failed to install signal handlers: {e}");
            std::process::exit(1);
        }
    };

    let mut sup = supervisor::Supervisor::new(Arc::new(snapshot), Arc::clone(&shutdown), reload_requested);
    let published = sup.published();
    let prefetch_tx = sup.prefetch_tx();

    let tick_handle = std::thread::Builder::new()
        .name("supervisor".into())
        .spawn(move || sup.run())
        .expect("spawn supervisor thread");

    if let Err(e) = protocol::run(published, prefetch_tx, Arc::clone(&shutdown)) {
        log::error!("protocol loop exited with an I/O error: {e}");
    }

    shutdown.store(true, Ordering::Relaxed);
    let _ = tick_handle.join();
    log::info!("storeid-dedup: shut down");
}
