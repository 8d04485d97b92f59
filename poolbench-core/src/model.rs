//! Core data types shared by the strategies, executor and runner.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A row of the `users` table.
///
/// `id` is `None` until the store assigns one on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Option<i64>,
    pub username: String,
    pub email: String,
}

impl Entity {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            email: email.into(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

/// One of the four CRUD phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Create,
    Read,
    Update,
    Delete,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Create, Phase::Read, Phase::Update, Phase::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Create => "create",
            Phase::Read => "read",
            Phase::Update => "update",
            Phase::Delete => "delete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The statement a work item performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create(Entity),
    Read { id: i64 },
    Update { id: i64, new_email: String },
    Delete { id: i64 },
}

/// One unit of work, consumed exactly once by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub entity_index: usize,
    pub op: Operation,
}

impl WorkItem {
    pub fn create(entity_index: usize, entity: Entity) -> Self {
        Self {
            entity_index,
            op: Operation::Create(entity),
        }
    }

    pub fn read(entity_index: usize, id: i64) -> Self {
        Self {
            entity_index,
            op: Operation::Read { id },
        }
    }

    pub fn update(entity_index: usize, id: i64, new_email: impl Into<String>) -> Self {
        Self {
            entity_index,
            op: Operation::Update {
                id,
                new_email: new_email.into(),
            },
        }
    }

    pub fn delete(entity_index: usize, id: i64) -> Self {
        Self {
            entity_index,
            op: Operation::Delete { id },
        }
    }

    pub fn phase(&self) -> Phase {
        match self.op {
            Operation::Create(_) => Phase::Create,
            Operation::Read { .. } => Phase::Read,
            Operation::Update { .. } => Phase::Update,
            Operation::Delete { .. } => Phase::Delete,
        }
    }
}

/// Outcome of one phase. Produced once at phase end and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub elapsed_seconds: f64,
    pub succeeded: usize,
    /// Includes `skipped`
    pub failed: usize,
    /// Indices never dispatched because their creation failed
    pub skipped: usize,
    /// A phase-fatal error stopped the batch before every item was attempted
    pub aborted: bool,
}

impl PhaseResult {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed - self.skipped
    }
}
