//! External command execution with timeout
//!
//! The hypervisor, cloud and image tooling is driven through their CLIs. Every
//! invocation goes through [`Cmd`], which bounds it with a timeout and turns a
//! non-zero exit into [`Error::Command`] carrying stderr.

use std::ffi::{OsStr, OsString};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default timeout for external commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A command line to run
#[derive(Clone, Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl Cmd {
    /// A command with the default timeout
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Feed bytes on stdin
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Override the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and the first argument, for error messages
    pub fn description(&self) -> String {
        let mut d = self.program.to_string_lossy().to_string();
        if let Some(first) = self.args.first() {
            d.push(' ');
            d.push_str(&first.to_string_lossy());
        }
        d
    }

    /// Arguments as given
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Run to completion and return stdout
    pub async fn output(&self) -> Result<String> {
        let description = self.description();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if self.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        }

        debug!(command = %description, "Running command");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::command(&description, format!("failed to execute: {}", e)))?;

        if let (Some(data), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            use tokio::io::AsyncWriteExt;
            pipe.write_all(&data)
                .await
                .map_err(|e| Error::command(&description, format!("failed to write stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(command = %description, timeout = ?self.timeout, "Command timed out");
                Error::timeout(description.clone(), self.timeout)
            })?
            .map_err(|e| Error::command(&description, format!("failed to execute: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %description, status = ?output.status.code(), error = %stderr, "Command failed");
            Err(Error::command(description, stderr))
        }
    }

    /// Run to completion and parse stdout as JSON
    pub async fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let out = self.output().await?;
        serde_json::from_str(&out).map_err(|e| {
            Error::serialization(format!("{} returned invalid JSON: {}", self.description(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).output().await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .output()
            .await
            .unwrap_err();
        match err {
            Error::Command { command, message } => {
                assert_eq!(command, "sh -c");
                assert_eq!(message, "boom");
            }
            other => panic!("expected command error, got {other}"),
        }
    }

    #[tokio::test]
    async fn times_out() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50))
            .output()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn feeds_stdin_and_parses_json() {
        #[derive(serde::Deserialize)]
        struct Out {
            a: u32,
        }
        let out: Out = Cmd::new("cat").stdin(r#"{"a": 7}"#).json().await.unwrap();
        assert_eq!(out.a, 7);
    }

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let err = Cmd::new("definitely-not-a-real-binary-ocne").output().await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
