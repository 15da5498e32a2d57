// src/commit/notify.rs

//! Post-commit notification
//!
//! Runs after the commit transaction is durable. A failing notifier is
//! logged and otherwise ignored; it never affects the commit.

use crate::trove::TroveTuple;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Receives the troves of each successful commit
pub trait CommitNotifier: Send + Sync {
    fn notify(&self, user: &str, troves: &[TroveTuple]);
}

/// Does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl CommitNotifier for NoopNotifier {
    fn notify(&self, _user: &str, _troves: &[TroveTuple]) {}
}

/// Runs a configured command, feeding `name\nversion\nflavor\n` per trove on stdin
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(troves: &[TroveTuple]) -> String {
        let mut payload = String::new();
        for trove in troves {
            payload.push_str(&format!("{}\n{}\n{}\n", trove.name, trove.version, trove.flavor));
        }
        payload
    }

    fn run(&self, user: &str, troves: &[TroveTuple]) -> std::result::Result<(), String> {
        let parts: Vec<&str> = self.command.split_whitespace().collect();
        let Some((cmd, args)) = parts.split_first() else {
            return Err("empty commit action".to_string());
        };

        let mut child = Command::new(cmd)
            .args(args)
            .env("REPOSERVER_USER", user)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", cmd, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(Self::payload(troves).as_bytes())
                .map_err(|e| format!("failed to write to '{}': {}", cmd, e))?;
        }

        match child.wait_timeout(self.timeout).map_err(|e| e.to_string())? {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                let output = child.wait_with_output().map_err(|e| e.to_string())?;
                Err(format!(
                    "'{}' exited with {}: {}",
                    cmd,
                    status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
            None => {
                let _ = child.kill();
                Err(format!("'{}' timed out after {} seconds", cmd, self.timeout.as_secs()))
            }
        }
    }
}

impl CommitNotifier for CommandNotifier {
    fn notify(&self, user: &str, troves: &[TroveTuple]) {
        if troves.is_empty() {
            return;
        }
        match self.run(user, troves) {
            Ok(()) => debug!("Commit action ran for {} trove(s)", troves.len()),
            Err(e) => warn!("Commit action failed: {}", e),
        }
    }
}
