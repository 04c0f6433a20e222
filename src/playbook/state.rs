//! Per-host run state

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Where a host is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Pending,
    Gathering,
    Executing,
    Handling,
    Done,
    Failed,
}

impl HostState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HostState::Done | HostState::Failed)
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition(self, next: HostState) -> bool {
        use HostState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Gathering) | (Pending, Handling) => true,
            (Gathering, Executing) => true,
            (Executing, Gathering) | (Executing, Handling) => true,
            (Handling, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Pending => "pending",
            HostState::Gathering => "gathering",
            HostState::Executing => "executing",
            HostState::Handling => "handling",
            HostState::Done => "done",
            HostState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("host {host}: illegal state transition {from} -> {to}")]
pub struct TransitionError {
    pub host: String,
    pub from: HostState,
    pub to: HostState,
}

/// State holder for one host's worker
#[derive(Debug)]
pub struct HostMachine {
    host: String,
    state: HostState,
}

impl HostMachine {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: HostState::Pending,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Move to `next`; re-entering the current non-terminal state is a no-op
    pub fn advance(&mut self, next: HostState) -> Result<(), TransitionError> {
        if self.state == next && !next.is_terminal() {
            return Ok(());
        }
        if !self.state.can_transition(next) {
            return Err(TransitionError {
                host: self.host.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!(host = %self.host, from = %self.state, state = %next, "host state");
        self.state = next;
        Ok(())
    }

    /// Jump to `failed` from wherever the host is
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!(host = %self.host, from = %self.state, state = "failed", "host state");
            self.state = HostState::Failed;
        }
    }
}
