//! Supervised Child Process
//!
//! Owns a long-running external process (e.g. a foreground balance) and keeps
//! the tail of its stderr so a failure can be reported with the tool's own
//! words.

use crate::domain::ports::{ProcessExit, SupervisedProcess};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A spawned process plus its captured stderr tail
pub struct ChildProcess {
    argv: Vec<String>,
    child: Child,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl ChildProcess {
    /// Launch `argv` with stdout discarded and stderr captured
    pub fn spawn(argv: Vec<String>, tail_lines: usize) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Validation("empty command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;

        let pid = child.id();
        info!(argv = ?argv, pid, "launched supervised process");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(tail_lines)));
        let reader = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock();
                    if tail.len() == tail_lines.max(1) {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        Ok(Self {
            argv,
            child,
            pid,
            stderr_tail,
            reader,
        })
    }

    fn tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl SupervisedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn try_exit(&mut self) -> Result<Option<ProcessExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };

        // Drain whatever stderr is still buffered before reporting
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }

        let exit = ProcessExit {
            return_code: status.code().unwrap_or(-1),
            stderr_tail: self.tail(),
        };
        debug!(argv = ?self.argv, code = exit.return_code, "supervised process exited");
        Ok(Some(exit))
    }

    async fn terminate(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
