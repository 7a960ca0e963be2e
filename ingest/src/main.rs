use std::io::Write;

use accounting_data::Sacct;
use chrono::Local;
use clap::Parser as _;
use color_eyre::{eyre::Context as _, Result};
use database::HostStore;
use log::info;

mod cli;
mod config;
mod run;

use crate::{cli::Args, config::Settings};

fn main() -> Result<()> {
    color_eyre::install()?;
    init_logger();
    let args = Args::parse();

    let settings = read_config()?;
    let host = run::resolve_host(args.hostname)?;

    let store_path = HostStore::path_for(&settings.database_dir, &host);
    let store = HostStore::open(&store_path, &settings.table_name)
        .wrap_err_with(|| format!("opening job store for {host}"))?;
    store.set_busy_timeout(settings.busy_timeout.to_std()?)?;

    let sacct = Sacct::new(&settings.sacct_program);
    let window = settings.window_ending(Local::now());
    let result = run::ingest_window(&host, window, &sacct, &store, &settings.spool_dir);

    store.close().wrap_err("closing job store")?;
    let report = result?;
    if !report.dropped.is_empty() || report.commit_failures > 0 {
        info!(
            "{} rows dropped, {} records not committed, see warnings above",
            report.dropped.len(),
            report.commit_failures
        );
    }
    Ok(())
}

/// `INGEST_LOG` takes env_logger filter syntax, e.g. `INGEST_LOG=debug` to see the run phases.
fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("INGEST_LOG", "info"))
        .format(|buf, record| {
            let now = Local::now().format("%Y-%m-%dT%H:%M:%S");
            writeln!(buf, "{now} {:<5} {}: {}", record.level(), record.target(), record.args())
        })
        .init();
}

fn read_config() -> Result<Settings> {
    info!("Loading config");
    Settings::new().context("parsing config file")
}
