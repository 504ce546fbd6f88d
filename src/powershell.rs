//! PowerShell plumbing for the Windows backends.
//!
//! Cmdlet arguments are rendered from explicit per-record parameter tables
//! so every field that reaches the command line is listed in one place.

use crate::decode::{parse_records, Record};
use crate::error::{Error, Result};
use crate::exec::{args, CommandRunner};

const PROGRAM: &str = "powershell";

/// Runs `script` and returns its stdout.
pub async fn run(runner: &dyn CommandRunner, script: &str) -> Result<String> {
    runner
        .run(
            PROGRAM,
            &args(["-NoProfile", "-NonInteractive", "-Command", script]),
        )
        .await
}

/// Runs `script`, expecting `Format-List *` output.
pub async fn query(runner: &dyn CommandRunner, script: &str) -> Result<Vec<Record>> {
    let out = run(runner, script).await?;
    parse_records(&out)
}

/// Runs a mutating `script` that must print nothing on success.
pub async fn exec_silent(runner: &dyn CommandRunner, script: &str) -> Result<()> {
    let out = run(runner, script).await?;
    if out.trim().is_empty() {
        Ok(())
    } else {
        Err(Error::Command {
            command: script.to_string(),
            message: out.trim().to_string(),
        })
    }
}

/// One cmdlet parameter derived from a field of `T`.
pub struct Param<T> {
    pub name: &'static str,
    pub value: fn(&T) -> Option<String>,
    pub required: bool,
}

/// Renders `params` for `item` as ` -Name 'value'` pairs.
pub fn render<T>(params: &[Param<T>], item: &T) -> Result<String> {
    let mut out = String::new();
    for p in params {
        match (p.value)(item) {
            Some(v) => {
                out.push_str(" -");
                out.push_str(p.name);
                out.push(' ');
                out.push_str(&quote(&v));
            }
            None if p.required => {
                return Err(Error::Command {
                    command: PROGRAM.to_string(),
                    message: format!("missing required parameter {}", p.name),
                })
            }
            None => {}
        }
    }
    Ok(out)
}

/// Single-quotes `value` for use as a literal argument.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
