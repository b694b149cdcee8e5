//! Health evaluation for agent sessions.
//!
//! Pure function from observed facts to a verdict. The Zero-Failure-Crash
//! rule fixes the signal priority when state is ambiguous: pane liveness
//! beats pid liveness beats whatever the database says. A session whose
//! pane is gone is a zombie no matter how fresh its recorded activity looks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{AgentSession, SessionState};

/// Escalation level at which a session is terminated outright.
pub const TERMINAL_ESCALATION_LEVEL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    None,
    Nudge,
    Escalate,
    Terminate,
}

/// Verdict for one session at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub reason: String,
    pub suggested_action: SuggestedAction,
    pub checked_at: DateTime<Utc>,
}

/// Evaluate a session against observed pane liveness.
///
/// Rules fire in order, first match wins:
/// 1. pane dead -> zombie / terminate (reconcile the database)
/// 2. completed -> healthy / none
/// 3. idle past threshold at level 0 -> stale / nudge
/// 4. idle past threshold at level 1-2 -> stale / escalate
/// 5. level >= 3 -> zombie / terminate
/// 6. otherwise -> healthy / none
pub fn evaluate(
    session: &AgentSession,
    is_alive: bool,
    stall_threshold: Duration,
    now: DateTime<Utc>,
) -> HealthCheck {
    let check = |status, reason: String, suggested_action| HealthCheck {
        status,
        reason,
        suggested_action,
        checked_at: now,
    };

    if !is_alive {
        return check(
            HealthStatus::Zombie,
            format!(
                "pane '{}' is not alive but state is {}",
                session.pane_name, session.state
            ),
            SuggestedAction::Terminate,
        );
    }

    if session.state == SessionState::Completed {
        return check(
            HealthStatus::Healthy,
            "session completed".to_string(),
            SuggestedAction::None,
        );
    }

    let idle = (now - session.last_activity)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let stalled = idle > stall_threshold;

    if stalled && session.escalation_level == 0 {
        return check(
            HealthStatus::Stale,
            format!("no activity for {:?} (threshold {:?})", idle, stall_threshold),
            SuggestedAction::Nudge,
        );
    }

    if stalled && (1..TERMINAL_ESCALATION_LEVEL).contains(&session.escalation_level) {
        return check(
            HealthStatus::Stale,
            format!(
                "still stalled at escalation level {}",
                session.escalation_level
            ),
            SuggestedAction::Escalate,
        );
    }

    if session.escalation_level >= TERMINAL_ESCALATION_LEVEL {
        return check(
            HealthStatus::Zombie,
            format!("escalation exhausted at level {}", session.escalation_level),
            SuggestedAction::Terminate,
        );
    }

    check(
        HealthStatus::Healthy,
        "recent activity".to_string(),
        SuggestedAction::None,
    )
}
