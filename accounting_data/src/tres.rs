//! Decoding of the `ReqTRES` column ("trackable resources" requested by a job).
//!
//! `sacct` prints it as `billing=16,cpu=16,gres/gpu=2,mem=4096M,node=2`. The key order is not
//! stable across Slurm versions, and more keys (`energy`, `gres/gpu:a100`, ...) may show up.

use std::{collections::HashMap, num::ParseIntError};

use serde::Serialize;
use thiserror::Error;

/// Unit `sacct --units=M` appends to memory values.
pub const MEMORY_UNIT: char = 'M';

const NODE: &str = "node";
const CPU: &str = "cpu";
const MEM: &str = "mem";
const BILLING: &str = "billing";
const GPU: &str = "gres/gpu";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TresError {
    #[error("required resource field `{0}` is missing")]
    MissingField(&'static str),
    #[error("resource item `{0}` is not of the form key=value")]
    MalformedPair(String),
    #[error("resource field `{key}` has non-integer value `{value}`")]
    InvalidValue {
        key: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    /// The query pins memory to mebibytes, anything else means the output was produced with a
    /// different configuration and must not be reinterpreted.
    #[error("memory request `{0}` is not in mebibytes (expected a trailing `M`)")]
    UnexpectedMemoryUnit(String),
}

/// Numeric view of a job's `ReqTRES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub cpus: u32,
    pub gpus: u32,
    pub memory_mb: u64,
    pub billing: u64,
}

impl ResourceRequest {
    pub fn parse(input: &str) -> Result<Self, TresError> {
        let pairs = split_pairs(input)?;

        let required = |key: &'static str| pairs.get(key).copied().ok_or(TresError::MissingField(key));

        let nodes = parse_int(NODE, required(NODE)?)?;
        let cpus = parse_int(CPU, required(CPU)?)?;
        let memory_mb = parse_memory(required(MEM)?)?;
        let billing = parse_int(BILLING, required(BILLING)?)?;
        let gpus = pairs.get(GPU).map(|value| parse_int(GPU, value)).transpose()?.unwrap_or(0);

        Ok(ResourceRequest {
            nodes,
            cpus,
            gpus,
            memory_mb,
            billing,
        })
    }
}

/// Last occurrence of a key wins.
fn split_pairs(input: &str) -> Result<HashMap<&str, &str>, TresError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .ok_or_else(|| TresError::MalformedPair(item.to_owned()))
        })
        .collect()
}

fn parse_int<T>(key: &'static str, value: &str) -> Result<T, TresError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    value.parse().map_err(|source| TresError::InvalidValue {
        key,
        value: value.to_owned(),
        source,
    })
}

fn parse_memory(value: &str) -> Result<u64, TresError> {
    match value.strip_suffix(MEMORY_UNIT) {
        Some(amount) => parse_int(MEM, amount),
        None => Err(TresError::UnexpectedMemoryUnit(value.to_owned())),
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ResourceRequest__parse__without_gpu() {
        let request = ResourceRequest::parse("node=2,cpu=16,mem=4096M,billing=16").unwrap();
        assert_eq!(
            request,
            ResourceRequest {
                nodes: 2,
                cpus: 16,
                gpus: 0,
                memory_mb: 4096,
                billing: 16,
            }
        );
    }

    #[test]
    fn ResourceRequest__parse__with_gpu_and_extra_keys() {
        let request =
            ResourceRequest::parse("billing=64,cpu=32,gres/gpu=4,gres/gpu:a100=4,mem=256000M,node=1").unwrap();
        assert_eq!(request.gpus, 4);
        assert_eq!(request.cpus, 32);
        assert_eq!(request.memory_mb, 256000);
        assert_eq!(request.billing, 64);
        assert_eq!(request.nodes, 1);
    }

    #[test]
    fn ResourceRequest__parse__missing_mem() {
        let err = ResourceRequest::parse("node=2,cpu=16,billing=16").unwrap_err();
        assert_eq!(err, TresError::MissingField("mem"));
        assert!(err.to_string().contains("`mem`"));
    }

    #[test]
    fn ResourceRequest__parse__missing_each_required_key() {
        for (input, key) in [
            ("cpu=1,mem=1M,billing=1", "node"),
            ("node=1,mem=1M,billing=1", "cpu"),
            ("node=1,cpu=1,mem=1M", "billing"),
        ] {
            assert_eq!(ResourceRequest::parse(input), Err(TresError::MissingField(key)));
        }
    }

    #[test]
    fn ResourceRequest__parse__empty() {
        assert_eq!(ResourceRequest::parse(""), Err(TresError::MissingField("node")));
    }

    #[test]
    fn ResourceRequest__parse__memory_unit() {
        assert!(matches!(
            ResourceRequest::parse("node=1,cpu=1,mem=4G,billing=1"),
            Err(TresError::UnexpectedMemoryUnit(v)) if v == "4G"
        ));
        assert!(matches!(
            ResourceRequest::parse("node=1,cpu=1,mem=4096,billing=1"),
            Err(TresError::UnexpectedMemoryUnit(_))
        ));
        assert!(matches!(
            ResourceRequest::parse("node=1,cpu=1,mem=40.5M,billing=1"),
            Err(TresError::InvalidValue { key: "mem", .. })
        ));
    }

    #[test]
    fn ResourceRequest__parse__malformed() {
        assert_eq!(
            ResourceRequest::parse("node=1,cpu,mem=1M,billing=1"),
            Err(TresError::MalformedPair("cpu".to_owned()))
        );
        assert!(matches!(
            ResourceRequest::parse("node=-1,cpu=1,mem=1M,billing=1"),
            Err(TresError::InvalidValue { key: "node", .. })
        ));
        assert!(matches!(
            ResourceRequest::parse("node=1,cpu=1,mem=1M,billing=1,gres/gpu=two"),
            Err(TresError::InvalidValue { key: "gres/gpu", .. })
        ));
    }

    #[test]
    fn ResourceRequest__parse__duplicate_key_last_wins() {
        let request = ResourceRequest::parse("node=1,cpu=1,mem=1M,billing=1,cpu=8").unwrap();
        assert_eq!(request.cpus, 8);
    }
}
