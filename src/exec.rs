//! External tool invocation.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Runs administrative tools (`ipset`, `ip`, `iptables`, `powershell`).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns its stdout.
    /// A non-zero exit is an error carrying the tool's combined output.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands as child processes, each bounded by a timeout.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Executing: {}", command_line);

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(res) => res.map_err(|e| Error::Command {
                command: command_line.clone(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(Error::Timeout {
                    command: command_line,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !message.is_empty() {
                    message.push('\n');
                }
                message.push_str(stderr.trim());
            }
            return Err(Error::Command {
                command: command_line,
                message: format!("{}: {}", output.status, message),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Builds an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records every invocation and answers from a scripted queue of
    /// `(command prefix, response)` pairs; unmatched calls return empty output.
    #[derive(Default)]
    pub struct FakeRunner {
        pub calls: Mutex<Vec<String>>,
        responses: Mutex<VecDeque<(String, Result<String>)>>,
    }

    impl FakeRunner {
        pub fn respond(&self, prefix: &str, response: Result<String>) {
            self.responses
                .lock()
                .unwrap()
                .push_back((prefix.to_string(), response));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<String> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            let mut responses = self.responses.lock().unwrap();
            if let Some(pos) = responses.iter().position(|(p, _)| line.starts_with(p)) {
                if let Some((_, resp)) = responses.remove(pos) {
                    return resp;
                }
            }
            Ok(String::new())
        }
    }
}
