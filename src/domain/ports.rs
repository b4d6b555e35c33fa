//! Domain Ports - Core trait definitions for the storage core
//!
//! These traits define the boundaries between the managers and the outside
//! world: the persistence collaborator and the external filesystem tools.
//! Adapters implement these traits to provide concrete functionality.

use crate::domain::model::{Entity, EntityId};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Persistence Port
// =============================================================================

/// Typed create/read/update/delete access to one kind of row
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Insert a row, returning it with its assigned id
    async fn create(&self, entity: T) -> Result<T>;

    /// Fetch a row by id
    async fn get(&self, id: EntityId) -> Result<Option<T>>;

    /// Replace an existing row
    async fn update(&self, entity: T) -> Result<T>;

    /// Apply `edit` to the stored row and return the result. Only the fields
    /// the edit assigns change, so writers of other fields are not undone.
    /// Implementations apply the edit under their row lock.
    async fn modify(&self, id: EntityId, edit: RowEdit<T>) -> Result<T> {
        let mut row = self.require(id).await?;
        edit(&mut row);
        self.update(row).await
    }

    /// Delete a row, returning whether it existed
    async fn delete(&self, id: EntityId) -> Result<bool>;

    /// All rows in id order
    async fn list(&self) -> Result<Vec<T>>;

    /// Rows owned by `parent_id`, in id (creation) order
    async fn list_by_parent(&self, parent_id: EntityId) -> Result<Vec<T>>;

    /// Most recently created row owned by `parent_id`
    async fn latest_by_parent(&self, parent_id: EntityId) -> Result<Option<T>> {
        Ok(self.list_by_parent(parent_id).await?.pop())
    }

    /// Fetch a row that must exist
    async fn require(&self, id: EntityId) -> Result<T> {
        self.get(id)
            .await?
            .ok_or_else(|| crate::error::Error::not_found(T::KIND, id))
    }
}

pub type RepositoryRef<T> = Arc<dyn Repository<T>>;

/// In-place edit of one row, see `Repository::modify`
pub type RowEdit<T> = Box<dyn FnOnce(&mut T) + Send>;

// =============================================================================
// Command Port
// =============================================================================

/// An external tool invocation, passed as a discrete argument vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    /// Bytes written to the process' stdin
    pub input: Option<Vec<u8>>,
    /// Upper bound on the process runtime; `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub acceptable_codes: BTreeSet<i32>,
    /// Retry device-busy failures with backoff
    pub retry_transient: bool,
}

impl CommandRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input: None,
            timeout: None,
            acceptable_codes: BTreeSet::from([0]),
            retry_transient: true,
        }
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn accept(mut self, codes: &[i32]) -> Self {
        self.acceptable_codes.extend(codes.iter().copied());
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry_transient = false;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Captured output of a completed command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub return_code: i32,
}

impl CommandOutput {
    pub fn success(stdout: &str) -> Self {
        Self {
            stdout: split_lines(stdout),
            stderr: Vec::new(),
            return_code: 0,
        }
    }

    pub fn with_code(stdout: &str, stderr: &str, return_code: i32) -> Self {
        Self {
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
            return_code,
        }
    }
}

/// Split captured text into lines, dropping a trailing empty line
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub return_code: i32,
    /// Last lines the process wrote to stderr
    pub stderr_tail: Vec<String>,
}

impl ProcessExit {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}

/// A long-running external process owned by an orchestrator
#[async_trait]
pub trait SupervisedProcess: Send + Sync {
    /// OS process id, if still known
    fn pid(&self) -> Option<u32>;

    /// Non-blocking check for completion
    async fn try_exit(&mut self) -> Result<Option<ProcessExit>>;

    /// Ask the process to stop
    async fn terminate(&mut self) -> Result<()>;
}

/// Port for running external filesystem tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput>;

    /// Launch a command without waiting for it
    async fn spawn(&self, argv: Vec<String>) -> Result<Box<dyn SupervisedProcess>>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
