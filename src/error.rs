//! Error types for reconciliation passes.
//!
//! Errors fall in two groups. Configuration and topology problems
//! (missing labels, unresolvable interfaces, unknown networks) abort a
//! pass before anything is mutated. Failures of individual mutations are
//! collected into an [`AggregateError`] while the rest of the pass carries on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("host {host} is missing label {label}")]
    MissingLabel { host: String, label: String },

    #[error("host {host} has invalid subnet {value:?}")]
    InvalidSubnet { host: String, value: String },

    #[error("host {host} has invalid address {value:?}")]
    InvalidAddress { host: String, value: String },

    #[cfg(any(windows, test))]
    #[error("expected exactly one interface with address {address}, found {found}")]
    AmbiguousInterface { address: String, found: usize },

    #[error("network {0:?} not found")]
    NetworkNotFound(String),

    #[error("metadata request failed: {0}")]
    Metadata(#[from] reqwest::Error),

    #[error("failed to run {command}: {message}")]
    Command { command: String, message: String },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error(transparent)]
    Partial(#[from] AggregateError),
}

impl Error {
    pub(crate) fn decode(what: &'static str, message: impl fmt::Display) -> Self {
        Error::Decode {
            what,
            message: message.to_string(),
        }
    }
}

/// The kind of mutation an [`EntryFailure`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Add => f.write_str("add"),
            Operation::Remove => f.write_str("remove"),
        }
    }
}

/// One failed mutation inside a pass.
#[derive(Debug)]
pub struct EntryFailure {
    pub key: String,
    pub operation: Operation,
    pub error: Error,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.key, self.error)
    }
}

/// Ordered list of per-entry failures from a single pass.
#[derive(Debug, Default, Error)]
pub struct AggregateError {
    pub failures: Vec<EntryFailure>,
}

impl AggregateError {
    pub fn push(&mut self, key: impl Into<String>, operation: Operation, error: Error) {
        self.failures.push(EntryFailure {
            key: key.into(),
            operation,
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate as an error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Partial(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_preserves_order_and_keys() {
        let mut agg = AggregateError::default();
        agg.push("10.0.1.0/24", Operation::Remove, Error::NetworkNotFound("a".into()));
        agg.push(
            "10.0.2.0/24",
            Operation::Add,
            Error::Command {
                command: "ipset".into(),
                message: "boom".into(),
            },
        );

        assert_eq!(agg.failures.len(), 2);
        assert_eq!(agg.failures[0].key, "10.0.1.0/24");
        assert_eq!(agg.failures[1].operation, Operation::Add);
        assert_eq!(
            agg.to_string(),
            "2 operation(s) failed: remove 10.0.1.0/24: network \"a\" not found; \
             add 10.0.2.0/24: failed to run ipset: boom"
        );
    }

    #[test]
    fn empty_aggregate_is_ok() {
        assert!(AggregateError::default().into_result().is_ok());
    }
}
