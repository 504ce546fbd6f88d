//! Decoder for PowerShell `Format-List *` output.
//!
//! The output is a sequence of blocks separated by blank lines. Each block
//! holds `Key : Value` lines; a long value wraps onto following lines that
//! are indented or carry no colon at all.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One decoded block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    /// Raw value of `key`, with empty values treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::decode("format-list record", format!("missing field {key}")))
    }

    /// Parses the value of `key`.
    pub fn parse<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.require(key)?;
        raw.parse().map_err(|e| {
            Error::decode(
                "format-list record",
                format!("field {key} has invalid value {raw:?}: {e}"),
            )
        })
    }

    fn insert(&mut self, key: String, value: String) {
        self.fields.insert(key, value);
    }

    fn append(&mut self, key: &str, more: &str) {
        if let Some(v) = self.fields.get_mut(key) {
            v.push_str(more);
        }
    }
}

/// Splits `output` into records.
pub fn parse_records(output: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut current = Record::default();
    let mut last_key: Option<String> = None;

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.fields.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            last_key = None;
            continue;
        }

        let continuation = line.starts_with(char::is_whitespace) || !line.contains(':');
        if continuation {
            match &last_key {
                Some(key) => current.append(key, line.trim()),
                None => {
                    return Err(Error::decode(
                        "format-list output",
                        format!("{line:?} is not a valid output line"),
                    ))
                }
            }
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            current.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
    }

    if !current.fields.is_empty() {
        records.push(current);
    }
    Ok(records)
}
