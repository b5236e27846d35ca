//! Orchestrator lifecycle.
//!
//! `Bootstrapping → Polling ⟲ → Draining → Terminated`. The transition
//! function is pure so every edge can be tested without an engine.

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Bootstrapping,
    Polling,
    Draining,
    Terminated,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Bootstrapping => write!(f, "bootstrapping"),
            OrchestratorState::Polling => write!(f, "polling"),
            OrchestratorState::Draining => write!(f, "draining"),
            OrchestratorState::Terminated => write!(f, "terminated"),
        }
    }
}

/// What the loop saw since the last transition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub elapsed: Duration,
    /// Time since the last cycle that locked a task; `None` while busy.
    pub idle_for: Option<Duration>,
    /// Every known topic has either had a task locked or been part of a
    /// reachable poll that came back empty. An empty poll covers every topic
    /// it asked for, so in practice this holds off draining only for topics
    /// learned after the idle timer started, until a poll has covered them.
    /// A failed poll counts toward neither this nor `idle_for`.
    pub all_topics_processed: bool,
    pub in_flight: usize,
    pub shutdown_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminationPolicy {
    pub idle_grace: Option<Duration>,
    pub absolute_timeout: Option<Duration>,
}

pub fn next_state(state: OrchestratorState, observation: &Observation, policy: &TerminationPolicy) -> OrchestratorState {
    use OrchestratorState::*;

    if state == Terminated {
        return Terminated;
    }
    if policy.absolute_timeout.is_some_and(|limit| observation.elapsed >= limit) {
        return Terminated;
    }

    match state {
        Bootstrapping if observation.shutdown_requested => Draining,
        Bootstrapping => Polling,
        Polling if observation.shutdown_requested => Draining,
        Polling => {
            let drained = match (policy.idle_grace, observation.idle_for) {
                (Some(grace), Some(idle)) => observation.all_topics_processed && idle >= grace,
                _ => false,
            };
            if drained { Draining } else { Polling }
        }
        Draining if observation.in_flight == 0 => Terminated,
        other => other,
    }
}
