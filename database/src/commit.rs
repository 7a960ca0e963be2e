use accounting_data::JobAccountingRecord;
use log::{debug, warn};

use crate::{CommitError, HostStore};

#[derive(Debug, Default)]
pub struct CommitSummary {
    pub committed: usize,
    pub failures: Vec<CommitError>,
}

/// Upserts every record of one accounting window.
///
/// Each record is its own atomic statement: a failure is collected into the summary and the
/// remaining records are still written. Re-running a window is safe since rows are keyed by
/// `job_id`.
pub fn commit_window<'a>(
    store: &HostStore,
    records: impl IntoIterator<Item = &'a JobAccountingRecord>,
) -> CommitSummary {
    let mut summary = CommitSummary::default();
    for record in records {
        match store.upsert(record) {
            Ok(()) => {
                debug!("committed job {}", record.job_id);
                summary.committed += 1;
            }
            Err(e) => {
                warn!("{e}: {:#}", e.source);
                summary.failures.push(e);
            }
        }
    }
    summary
}
