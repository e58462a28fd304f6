use std::fmt;

use super::InvokeKind;

/// A static misconfiguration of the workload.
///
/// These are never retried: a worker hitting one exits non-zero at startup.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ConfigError {
    MissingValue(&'static str),
    InvalidValue {
        field: &'static str,
        reason: String,
    },
    UnknownOrg(String),
    UnknownPeer(String),
    UnknownOrderer(String),
    ArgIndexOutOfRange {
        kind: InvokeKind,
        field: &'static str,
        index: usize,
        len: usize,
    },
    IncompatibleMode {
        mode: &'static str,
        kind: InvokeKind,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingValue(field) => {
                write!(f, "ConfigError: missing value for '{field}'")
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "ConfigError: invalid value for '{field}': {reason}")
            }
            ConfigError::UnknownOrg(org) => {
                write!(f, "ConfigError: org '{org}' not found in network topology")
            }
            ConfigError::UnknownPeer(peer) => {
                write!(f, "ConfigError: peer '{peer}' not found in network topology")
            }
            ConfigError::UnknownOrderer(orderer) => write!(
                f,
                "ConfigError: orderer '{orderer}' not found in network topology"
            ),
            ConfigError::ArgIndexOutOfRange {
                kind,
                field,
                index,
                len,
            } => write!(
                f,
                "ConfigError: {field} index {index} out of range for {kind} args (len = {len})"
            ),
            ConfigError::IncompatibleMode { mode, kind } => write!(
                f,
                "ConfigError: transaction mode {mode} cannot run {kind} transactions"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
