// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A running download subprocess.
//!
//! [`ProcessHandle`] owns the child, merges its stdout and stderr into one
//! line stream, and knows how to stop it politely before stopping it hard.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::command::DownloadCommand;
use crate::error::SupervisorError;
use crate::progress::LineSplitter;

/// Lines buffered between the pipe readers and the consumer.
const LINE_CHANNEL_CAPACITY: usize = 256;

const READ_CHUNK: usize = 8 * 1024;

/// Handle to one spawned subprocess.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    lines: Option<mpsc::Receiver<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Launch the download utility.
    pub fn start(command: &DownloadCommand) -> Result<Self, SupervisorError> {
        debug!(
            binary = ?command.binary(),
            args = ?command.redacted_args(),
            "Spawning download utility"
        );
        Self::spawn(command.to_command()).map_err(|source| SupervisorError::Spawn {
            binary: command.binary().to_path_buf(),
            source,
        })
    }

    /// Spawn an arbitrary command with piped output.
    pub fn spawn(mut command: Command) -> std::io::Result<Self> {
        let mut child = command.spawn()?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx));
        }

        Ok(Self {
            child,
            pid,
            lines: Some(rx),
            readers,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Combined stdout/stderr, one line at a time.
    ///
    /// Ends once both pipes close. Can be taken only once.
    pub fn output_stream(&mut self) -> Result<ReceiverStream<String>, SupervisorError> {
        self.lines
            .take()
            .map(ReceiverStream::new)
            .ok_or(SupervisorError::StreamTaken)
    }

    /// Wait for exit. `None` means the process was killed by a signal.
    pub async fn wait(&mut self) -> Result<Option<i32>, SupervisorError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Ask the process to stop, then force it after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, SupervisorError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(status.code());
        }

        self.signal("-TERM").await;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!(pid = ?self.pid, grace_secs = grace.as_secs_f64(), "Process ignored SIGTERM; killing");
                self.signal("-KILL").await;
                if let Err(e) = self.child.kill().await {
                    debug!(error = %e, "kill after grace period failed");
                }
                Ok(self.child.wait().await?.code())
            }
        }
    }

    /// Signal the whole process group on unix; elsewhere fall back to kill.
    #[cfg_attr(not(unix), allow(unused_variables))]
    async fn signal(&mut self, signal: &str) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let group = format!("-{}", pid);
                let result = Command::new("kill")
                    .args([signal, "--", group.as_str()])
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status()
                    .await;
                match result {
                    Ok(status) if status.success() => return,
                    Ok(status) => debug!(pid, signal, ?status, "kill reported failure"),
                    Err(e) => debug!(pid, signal, error = %e, "Failed to run kill"),
                }
            }
        }

        let _ = self.child.start_kill();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_line_reader<R>(mut reader: R, sender: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for line in splitter.push(&buf[..read]) {
                if sender.send(line).await.is_err() {
                    return;
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = sender.send(line).await;
        }
    })
}

/// Bounded buffer of the most recent output lines, for diagnostics.
#[derive(Debug)]
pub struct RecentLines {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}
