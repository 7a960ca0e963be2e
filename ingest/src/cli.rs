use clap::Parser;

/// Ingest the last window of finished Slurm jobs of one node into its job store.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(version)]
pub struct Args {
    /// Node to ingest, defaults to the local host name
    pub hostname: Option<String>,
}
