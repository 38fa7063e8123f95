//! Run and output line types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded { code: i32 },
    Failed { code: i32 },
    Crashed { error: String },
}

impl RunState {
    /// Map a process exit code to a terminal state.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Succeeded { code }
        } else {
            Self::Failed { code }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution attempt of the supervised command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: RunState,
}

impl Run {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Move the run into a terminal state. Terminal runs are never changed again.
    pub fn finish(&mut self, state: RunState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// A single decoded output line belonging to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEvent {
    pub run_id: Uuid,
    /// Position within the run, starting at 0 with the session marker.
    pub seq: u64,
    pub text: String,
}
