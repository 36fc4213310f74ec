//! The live-session state machine and phase timer.
//!
//! `ActiveSession` is a plain value; every mutation goes through a
//! transition method that returns either the next value or a typed error.
//! Persistence and broadcasting are the caller's concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ProjectId, SessionConfig, SessionPhase, SessionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub status: SessionStatus,
    pub phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {op} while the session is {from:?}")]
    InvalidTransition {
        from: SessionStatus,
        op: &'static str,
    },
}

impl ActiveSession {
    pub fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            phase: SessionPhase::Presentation,
            current_project_id: None,
            started_at: None,
            paused_at: None,
        }
    }

    fn completed() -> Self {
        Self {
            status: SessionStatus::Completed,
            ..Self::idle()
        }
    }

    /// Begin a run at the first project's presentation phase. Legal from
    /// `idle` and from `completed` (which restarts the queue).
    pub fn start(
        &self,
        first_project: ProjectId,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        match self.status {
            SessionStatus::Idle | SessionStatus::Completed => Ok(Self {
                status: SessionStatus::Active,
                phase: SessionPhase::Presentation,
                current_project_id: Some(first_project),
                started_at: Some(now),
                paused_at: None,
            }),
            from => Err(TransitionError::InvalidTransition { from, op: "start" }),
        }
    }

    /// Step presentation → qa → break; leaving `break` either enters the
    /// next queued project's presentation or completes the session when
    /// the queue is exhausted. The phase clock restarts on every entry.
    pub fn advance(
        &self,
        next_project: Option<ProjectId>,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        if self.status != SessionStatus::Active {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                op: "advance",
            });
        }
        Ok(match self.phase {
            SessionPhase::Presentation => Self {
                phase: SessionPhase::Qa,
                started_at: Some(now),
                ..self.clone()
            },
            SessionPhase::Qa => Self {
                phase: SessionPhase::Break,
                started_at: Some(now),
                ..self.clone()
            },
            SessionPhase::Break => match next_project {
                Some(project) => Self {
                    status: SessionStatus::Active,
                    phase: SessionPhase::Presentation,
                    current_project_id: Some(project),
                    started_at: Some(now),
                    paused_at: None,
                },
                None => Self::completed(),
            },
        })
    }

    pub fn pause(&self, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self.status {
            SessionStatus::Active => Ok(Self {
                status: SessionStatus::Paused,
                paused_at: Some(now),
                ..self.clone()
            }),
            from => Err(TransitionError::InvalidTransition { from, op: "pause" }),
        }
    }

    /// Shifts the phase clock forward by the paused span so the remaining
    /// time picks up where `pause` left it.
    pub fn resume(&self, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        match (self.status, self.paused_at) {
            (SessionStatus::Paused, Some(paused_at)) => Ok(Self {
                status: SessionStatus::Active,
                started_at: self
                    .started_at
                    .map(|started| started + now.signed_duration_since(paused_at)),
                paused_at: None,
                ..self.clone()
            }),
            (from, _) => Err(TransitionError::InvalidTransition { from, op: "resume" }),
        }
    }

    /// Force-complete from any non-idle state.
    pub fn end(&self) -> Result<Self, TransitionError> {
        match self.status {
            SessionStatus::Idle => Err(TransitionError::InvalidTransition {
                from: SessionStatus::Idle,
                op: "end",
            }),
            _ => Ok(Self::completed()),
        }
    }
}

pub fn phase_duration_ms(phase: SessionPhase, config: &SessionConfig) -> i64 {
    let minutes = match phase {
        SessionPhase::Presentation => config.duration_per_project_min,
        SessionPhase::Qa => config.question_duration_min,
        SessionPhase::Break => config.break_duration_min,
    };
    minutes * 60_000
}

/// Remaining milliseconds in the current phase. Zero whenever the session
/// is not actively running; clients re-evaluate this against wall-clock
/// instead of the server ticking.
pub fn remaining_ms(session: &ActiveSession, config: &SessionConfig, now: DateTime<Utc>) -> i64 {
    let (SessionStatus::Active, Some(started_at)) = (session.status, session.started_at) else {
        return 0;
    };
    let elapsed = now.signed_duration_since(started_at).num_milliseconds();
    (phase_duration_ms(session.phase, config) - elapsed).max(0)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
