//! External command execution.
//!
//! Probes, fixes, and the `ip l2tp` provisioner all talk to the kernel
//! through `ip`, `sysctl`, and `ping`. They do so through the
//! [`CommandRunner`] seam so tests can substitute an in-memory host.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use crate::error::CommandError;

/// Boxed future alias used by the object-safe traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program with a hard deadline.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, giving up after `timeout`.
    ///
    /// A non-zero exit is `Ok` with `success == false`; only spawn
    /// failures and timeouts are errors.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>>;
}

/// Runs commands on the local host with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>> {
        Box::pin(async move {
            let child = tokio::process::Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output();

            // Dropping the output future on timeout kills the child.
            let output = match tokio::time::timeout(timeout, child).await {
                Ok(Ok(output)) => output,
                Ok(Err(source)) => {
                    return Err(CommandError::Spawn {
                        program: program.to_string(),
                        source,
                    });
                }
                Err(_) => {
                    debug!(%program, ?args, ?timeout, "command timed out");
                    return Err(CommandError::Timeout {
                        program: program.to_string(),
                        after: timeout,
                    });
                }
            };

            Ok(CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Build an owned argument vector from string slices.
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Runner answering every command from a closure, recording each call.
    pub(crate) struct FnRunner<F> {
        respond: F,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl<F> FnRunner<F>
    where
        F: Fn(&str, &[String]) -> Result<CommandOutput, CommandError> + Send + Sync,
    {
        pub(crate) fn new(respond: F) -> Self {
            Self {
                respond,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl<F> CommandRunner for FnRunner<F>
    where
        F: Fn(&str, &[String]) -> Result<CommandOutput, CommandError> + Send + Sync,
    {
        fn run<'a>(
            &'a self,
            program: &'a str,
            args: &'a [String],
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<CommandOutput, CommandError>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            let result = (self.respond)(program, args);
            Box::pin(async move { result })
        }
    }

    pub(crate) fn spawn_error(program: &str) -> CommandError {
        CommandError::Spawn {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        }
    }
}
