use std::fmt::Display;
use std::process::Stdio;
use std::{ffi::OsStr, process::Output};
use tokio::process::Command as BaseCommand;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: tokio::io::Error,
    },

    #[error("command failed ({status}): {command}\n{stderr}")]
    Failure {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Thin wrapper over [`tokio::process::Command`] which captures stderr for
/// error reporting and renders itself as a shell-like string.
#[derive(Debug)]
pub struct Command {
    cmd: BaseCommand,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd.as_std();
        let program = cmd.get_program().to_string_lossy();
        let args = cmd
            .get_args()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if args.is_empty() {
            write!(f, "{program}",)
        } else {
            write!(f, "{program} {args}",)
        }
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            cmd: BaseCommand::new(program),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn env<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.env(key, value);
        self
    }

    pub async fn output(&mut self) -> Result<Output, CommandError> {
        debug!(command = %self, "running");
        self.cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })
    }

    pub async fn run(&mut self) -> Result<Output, CommandError> {
        self.output().await.and_then(|out| {
            if out.status.success() {
                Ok(out)
            } else {
                Err(CommandError::Failure {
                    command: self.to_string(),
                    status: out.status.to_string(),
                    stderr: String::from_utf8_lossy(&out.stderr).trim_end().to_string(),
                })
            }
        })
    }

    /// Run to completion and return captured stdout as (lossy) UTF-8.
    pub async fn run_to_string(&mut self) -> Result<String, CommandError> {
        let output = self.run().await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run and ignore a non-zero exit status, for best-effort cleanup such as
    /// unmounting something that may not be mounted.
    pub async fn run_allow_failure(&mut self) -> Result<bool, CommandError> {
        let output = self.output().await?;
        if !output.status.success() {
            debug!(
                command = %self,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "ignoring failure"
            );
        }
        Ok(output.status.success())
    }
}
