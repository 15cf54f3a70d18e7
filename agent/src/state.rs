use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;

/// Lifecycle phases of the guest agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Executing,
    Collecting,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Executing => "executing",
            Status::Collecting => "collecting",
            Status::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub status: String,
    pub current_sample: Option<String>,
    pub last_error: Option<String>,
    pub started_at: String,
    pub execution_count: u64,
}

struct Inner {
    status: Status,
    current_sample: Option<String>,
    last_error: Option<String>,
    started_at: String,
    execution_count: u64,
}

/// Thread-safe status tracker for the agent lifecycle.
///
/// Every read and write holds the lock; the lock is never held across I/O.
pub struct AgentState {
    inner: Mutex<Inner>,
}

impl AgentState {
    pub fn new() -> Self {
        AgentState {
            inner: Mutex::new(Inner {
                status: Status::Idle,
                current_sample: None,
                last_error: None,
                started_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                execution_count: 0,
            }),
        }
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    /// Transition to `executing` unless an execution is already in flight.
    ///
    /// The transition happens before the caller acknowledges the request, so
    /// any status probe issued after the acknowledgement observes `executing`
    /// or a later phase.
    pub fn try_begin_execution(&self, sample: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == Status::Executing {
            return Err("Agent is already executing a sample".to_string());
        }
        inner.status = Status::Executing;
        inner.current_sample = Some(sample.to_string());
        Ok(())
    }

    pub fn set_collecting(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Collecting;
    }

    pub fn set_error(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Error;
        inner.last_error = Some(error.to_string());
    }

    /// Return to `idle`, counting one completed run.
    pub fn set_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Idle;
        inner.current_sample = None;
        inner.execution_count += 1;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            status: inner.status.as_str().to_string(),
            current_sample: inner.current_sample.clone(),
            last_error: inner.last_error.clone(),
            started_at: inner.started_at.clone(),
            execution_count: inner.execution_count,
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
