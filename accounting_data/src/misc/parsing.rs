use std::collections::HashMap;

use itertools::Itertools as _;
use thiserror::Error;

pub mod duration {
    use std::ops::Deref;

    use color_eyre::eyre::{eyre, Context as _};
    use serde::Deserialize;

    /// Config durations like `500ms`, `35s`, `27m` or `3h`.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
    #[serde(try_from = "String")]
    pub struct DurationWrapper(pub chrono::Duration);

    type Unit = (&'static str, fn(i64) -> Option<chrono::Duration>);

    // `ms` has to be tried before `m` and `s`
    const UNITS: [Unit; 4] = [
        ("ms", chrono::Duration::try_milliseconds),
        ("s", chrono::Duration::try_seconds),
        ("m", chrono::Duration::try_minutes),
        ("h", chrono::Duration::try_hours),
    ];

    impl TryFrom<&str> for DurationWrapper {
        type Error = color_eyre::Report;

        fn try_from(value: &str) -> Result<Self, Self::Error> {
            let (amount, to_duration) = UNITS
                .iter()
                .find_map(|(suffix, to_duration)| value.strip_suffix(suffix).map(|amount| (amount, to_duration)))
                .ok_or_else(|| eyre!("duration `{value}` needs one of the suffixes h, m, s, ms"))?;
            let amount = amount
                .trim()
                .parse::<i64>()
                .wrap_err_with(|| format!("duration `{value}`"))?;
            to_duration(amount)
                .map(DurationWrapper)
                .ok_or_else(|| eyre!("duration `{value}` is out of range"))
        }
    }

    impl TryFrom<String> for DurationWrapper {
        type Error = color_eyre::Report;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::try_from(value.as_str())
        }
    }

    impl Deref for DurationWrapper {
        type Target = chrono::Duration;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
}

pub use duration::DurationWrapper as Duration;

/// A row that could not be mapped onto the header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row has {found} fields, header only has {expected}")]
pub struct TooManyFields {
    pub expected: usize,
    pub found: usize,
}

/// One data row of `sacct --parsable2` output, keyed by header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctRow {
    /// 1-based line number inside the whole output (the header is line 1)
    pub line: usize,
    pub fields: Result<HashMap<String, String>, TooManyFields>,
}

/// Given output from `sacct -P`, parses it into rows of field maps. This works by taking the first
/// line as header. Rows with fewer fields than the header simply lack the trailing keys, blank
/// lines are skipped.
///
/// Returns `None` when the input has no header line at all.
pub fn sacct_parsable2(input: &str) -> Option<(Vec<String>, Vec<SacctRow>)> {
    let mut lines = input.lines().enumerate().filter(|(_, line)| !line.trim().is_empty());
    let (_, header) = lines.next()?;
    let header = header.split('|').map(|name| name.trim().to_owned()).collect_vec();

    let rows = lines
        .map(|(idx, line)| {
            let values = line.split('|').collect_vec();
            let fields = if values.len() > header.len() {
                Err(TooManyFields {
                    expected: header.len(),
                    found: values.len(),
                })
            } else {
                Ok(header
                    .iter()
                    .zip(values)
                    .map(|(key, value)| (key.clone(), value.to_owned()))
                    .collect())
            };
            SacctRow { line: idx + 1, fields }
        })
        .collect_vec();

    Some((header, rows))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is not a slurm duration ([D-]HH:MM:SS, MM:SS or MM:SS.mmm)")]
pub struct SlurmDurationError(pub String);

/// Parses the duration format `sacct` prints for `Elapsed`/`Timelimit`.
///
/// Accepted: `D-HH:MM:SS`, `HH:MM:SS`, `MM:SS`, `MM:SS.mmm`. Sub-second parts are dropped.
pub fn slurm_duration(input: &str) -> Result<chrono::Duration, SlurmDurationError> {
    let err = || SlurmDurationError(input.to_owned());
    let input = input.trim();

    let (days, clock) = match input.split_once('-') {
        Some((days, clock)) => (days.parse::<i64>().map_err(|_| err())?, clock),
        None => (0, input),
    };
    // `MM:SS.mmm` for very short jobs
    let clock = clock.split_once('.').map_or(clock, |(clock, _millis)| clock);

    let parts: Vec<i64> = clock
        .split(':')
        .map(|part| part.parse::<i64>())
        .process_results(|iter| iter.collect())
        .map_err(|_| err())?;

    let (hours, minutes, seconds) = match parts.as_slice() {
        &[h, m, s] => (h, m, s),
        &[m, s] if days == 0 => (0, m, s),
        _ => return Err(err()),
    };
    if [days, hours, minutes, seconds].iter().any(|v| *v < 0) || minutes >= 60 || seconds >= 60 {
        return Err(err());
    }

    // hours and days are unbounded in the input, chrono's range is not
    [
        chrono::Duration::try_days(days),
        chrono::Duration::try_hours(hours),
        chrono::Duration::try_minutes(minutes),
        chrono::Duration::try_seconds(seconds),
    ]
    .into_iter()
    .try_fold(chrono::Duration::zero(), |total, part| total.checked_add(&part?))
    .ok_or_else(err)
}
