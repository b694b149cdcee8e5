//! The watchdog daemon.
//!
//! Every poll interval the watchdog enumerates active sessions, probes pane
//! liveness, evaluates health and applies the progressive escalation
//! ladder. Monitoring must never crash the monitor: failure recording and
//! event recording are strictly fire-and-forget, and every driver call is
//! deadline-bounded.
//!
//! Escalation ladder, keyed by the session's current level:
//!
//! | level | action                                                      |
//! |-------|-------------------------------------------------------------|
//! | 0     | warn, mark stalled, raise to 1, nudge the pane              |
//! | 1     | nudge again, raise to 2                                     |
//! | 2     | AI triage when enabled, else raise to 3                     |
//! | 3     | kill the process tree, close the pane, transition to zombie |

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::ai::AiRunner;
use crate::config::WatchdogConfig;
use crate::log::AgentLogDir;
use crate::orchestration::health::{self, SuggestedAction, TERMINAL_ESCALATION_LEVEL};
use crate::procs;
use crate::session::{AgentSession, SessionState};
use crate::sink::BestEffortSink;
use crate::store::{EventKind, EventLevel, EventStore, SessionStore, StoredEvent};
use crate::tmux::MuxDriver;
use crate::{olog, olog_debug, olog_trace, olog_warn, Result};

/// Lines of session log shown to the triage model.
const TRIAGE_LOG_LINES: usize = 50;

/// Text typed into a stalled pane.
const NUDGE_TEXT: &str =
    "overstory: no activity detected. If you are stuck, summarize where you are and continue; \
     if blocked, mail your lead with type=question.";

/// Single-token verdict from Tier-1 triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageVerdict {
    /// Re-nudge, do not advance the ladder this tick.
    Retry,
    /// Skip straight to termination.
    Terminate,
    /// Grant one free tick.
    Extend,
}

/// Parse a triage response. Anything unrecognizable means `Extend`:
/// a broken triage pipeline must never get an agent killed.
pub fn parse_triage_verdict(response: &str) -> TriageVerdict {
    let token = response
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    match token.as_str() {
        "retry" => TriageVerdict::Retry,
        "terminate" => TriageVerdict::Terminate,
        "extend" => TriageVerdict::Extend,
        _ => TriageVerdict::Extend,
    }
}

/// Failure report offered to the best-effort sink for later delivery to the
/// expertise service.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub agent_name: String,
    pub bead_id: String,
    pub reason: String,
    pub escalation_level: u8,
}

/// Counters from one watchdog tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub nudged: usize,
    pub escalated: usize,
    pub terminated: usize,
    pub runs_completed: usize,
}

pub struct Watchdog<M: MuxDriver> {
    sessions: Arc<SessionStore>,
    events: Arc<EventStore>,
    mux: M,
    config: WatchdogConfig,
    triage: Option<AiRunner>,
    logs_root: PathBuf,
    failures: Arc<BestEffortSink<FailureRecord>>,
}

impl<M: MuxDriver> Watchdog<M> {
    pub fn new(
        sessions: Arc<SessionStore>,
        events: Arc<EventStore>,
        mux: M,
        config: WatchdogConfig,
        logs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sessions,
            events,
            mux,
            config,
            triage: None,
            logs_root: logs_root.into(),
            failures: Arc::new(BestEffortSink::new(256)),
        }
    }

    /// Enable Tier-1 AI triage at escalation level 2.
    pub fn with_triage(mut self, runner: AiRunner) -> Self {
        self.triage = Some(runner);
        self
    }

    /// Undelivered failure records (drained by the expertise recorder).
    pub fn failure_sink(&self) -> Arc<BestEffortSink<FailureRecord>> {
        Arc::clone(&self.failures)
    }

    /// Run until cancelled. One tick per poll interval; a failing tick is
    /// logged and the loop keeps going.
    pub async fn run(&self, cancel: CancellationToken) {
        olog!(
            "Watchdog started: poll={:?} stall={:?} triage={}",
            self.config.poll_interval(),
            self.config.stall_threshold(),
            self.triage.is_some()
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    olog!("Watchdog stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    match self.tick().await {
                        Ok(report) => olog_trace!("Watchdog tick: {:?}", report),
                        Err(e) => olog_warn!("Watchdog tick failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over every active session.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let active = self.sessions.get_active()?;
        report.checked = active.len();

        for session in active {
            if let Err(e) = self.handle_session(&session, &mut report).await {
                // One broken session must not stop the sweep
                olog_warn!("Watchdog: session '{}' handling failed: {}", session.agent_name, e);
            }
        }

        report.runs_completed = self.check_run_completion()?;
        Ok(report)
    }

    async fn handle_session(&self, session: &AgentSession, report: &mut TickReport) -> Result<()> {
        let now = Utc::now();
        let is_alive = self.mux.is_pane_alive(&session.pane_name).await;
        let mut check = health::evaluate(session, is_alive, self.config.stall_threshold(), now);

        // Hard-kill backstop: a session idle past this bound dies this tick
        // even if intermittent activity kept resetting the ladder.
        let idle = (now - session.last_activity).to_std().unwrap_or_default();
        if check.suggested_action != SuggestedAction::Terminate
            && session.state != SessionState::Completed
            && idle > self.config.hard_kill_threshold()
        {
            check.suggested_action = SuggestedAction::Terminate;
            check.reason = format!(
                "idle {:?} exceeds hard-kill threshold {:?}",
                idle,
                self.config.hard_kill_threshold()
            );
        }

        olog_trace!(
            "Watchdog: '{}' level={} -> {:?}",
            session.agent_name,
            session.escalation_level,
            check.suggested_action
        );

        match check.suggested_action {
            SuggestedAction::None => {}
            SuggestedAction::Nudge => {
                self.first_escalation(session, &check.reason).await?;
                report.nudged += 1;
            }
            SuggestedAction::Escalate => {
                self.escalate(session, report).await?;
            }
            SuggestedAction::Terminate => {
                self.terminate(session, &check.reason).await?;
                report.terminated += 1;
            }
        }
        Ok(())
    }

    /// Ladder level 0: warn, mark stalled, raise to 1, nudge.
    async fn first_escalation(&self, session: &AgentSession, reason: &str) -> Result<()> {
        olog_warn!(
            "Watchdog: '{}' stalled ({}), escalating to level 1",
            session.agent_name,
            reason
        );
        // Completed/zombie sessions never reach here, but a concurrent
        // terminal transition would make this a no-op rejection; ignore it.
        if session.state != SessionState::Stalled {
            let _ = self
                .sessions
                .update_state(&session.agent_name, SessionState::Stalled);
        }
        self.sessions
            .update_escalation(&session.agent_name, 1, Some(Utc::now()))?;
        self.nudge(session).await;
        Ok(())
    }

    /// Ladder levels 1 and 2.
    async fn escalate(&self, session: &AgentSession, report: &mut TickReport) -> Result<()> {
        match session.escalation_level {
            1 => {
                self.nudge(session).await;
                self.sessions.update_escalation(
                    &session.agent_name,
                    2,
                    session.stalled_since,
                )?;
                report.escalated += 1;
            }
            2 => {
                if self.triage.is_some() {
                    match self.run_triage(session).await {
                        TriageVerdict::Retry => {
                            // Re-nudge without advancing the ladder
                            self.nudge(session).await;
                            report.nudged += 1;
                        }
                        TriageVerdict::Extend => {
                            olog_debug!(
                                "Watchdog: triage extended '{}' one tick",
                                session.agent_name
                            );
                        }
                        TriageVerdict::Terminate => {
                            self.sessions.update_escalation(
                                &session.agent_name,
                                TERMINAL_ESCALATION_LEVEL,
                                session.stalled_since,
                            )?;
                            self.terminate(session, "triage verdict: terminate").await?;
                            report.terminated += 1;
                        }
                    }
                } else {
                    self.sessions.update_escalation(
                        &session.agent_name,
                        TERMINAL_ESCALATION_LEVEL,
                        session.stalled_since,
                    )?;
                    report.escalated += 1;
                }
            }
            other => {
                olog_warn!(
                    "Watchdog: escalate called at unexpected level {} for '{}'",
                    other,
                    session.agent_name
                );
            }
        }
        Ok(())
    }

    /// Ladder level 3 (and ZFC reconciliation): kill the tree, close the
    /// pane, mark the session zombie. The row is kept so observers see the
    /// terminal state.
    async fn terminate(&self, session: &AgentSession, reason: &str) -> Result<()> {
        olog!(
            "Watchdog: terminating '{}' ({})",
            session.agent_name,
            reason
        );

        if let Some(pid) = session.pid {
            let killed = procs::kill_tree(pid, self.config.grace_period()).await;
            olog_debug!(
                "Watchdog: '{}' tree kill: {} term, {} kill",
                session.agent_name,
                killed.terminated.len(),
                killed.killed.len()
            );
        }

        if let Err(e) = self.mux.kill_pane(&session.pane_name).await {
            olog_warn!(
                "Watchdog: pane kill for '{}' failed: {}",
                session.agent_name,
                e
            );
        }

        // Already-terminal is fine: ZFC may race a normal completion.
        if let Err(e) = self
            .sessions
            .update_state(&session.agent_name, SessionState::Zombie)
        {
            olog_trace!(
                "Watchdog: zombie transition for '{}' rejected: {}",
                session.agent_name,
                e
            );
        }

        self.record_failure(session, reason);
        self.record_event(
            StoredEvent::new(&session.agent_name, EventKind::SessionEnd)
                .with_level(EventLevel::Error)
                .with_payload(
                    serde_json::json!({ "terminated_by": "watchdog", "reason": reason })
                        .to_string(),
                ),
        );
        Ok(())
    }

    /// Type a nudge into the pane and record the equivalent of a mail_sent
    /// event. Both are best-effort.
    async fn nudge(&self, session: &AgentSession) {
        if let Err(e) = self.mux.send_keys(&session.pane_name, NUDGE_TEXT).await {
            olog_warn!("Watchdog: nudge to '{}' failed: {}", session.agent_name, e);
            return;
        }
        self.record_event(
            StoredEvent::new(&session.agent_name, EventKind::MailSent)
                .with_level(EventLevel::Warn)
                .with_payload(
                    serde_json::json!({ "kind": "nudge", "level": session.escalation_level })
                        .to_string(),
                ),
        );
    }

    /// Tier-1 triage: feed the tail of the session log to the AI tool and
    /// parse a single-token verdict. Any failure defaults to Extend.
    async fn run_triage(&self, session: &AgentSession) -> TriageVerdict {
        let Some(runner) = &self.triage else {
            return TriageVerdict::Extend;
        };
        let Some(log_dir) = AgentLogDir::latest(&self.logs_root, &session.agent_name) else {
            olog_debug!(
                "Watchdog: no session log for '{}', triage extends",
                session.agent_name
            );
            return TriageVerdict::Extend;
        };
        let Some(tail) = log_dir.session_tail(TRIAGE_LOG_LINES) else {
            return TriageVerdict::Extend;
        };

        let prompt = format!(
            "An autonomous coding agent has been inactive past its stall threshold.\n\
             Agent: {} (task {})\n\
             Escalation level: {}\n\n\
             Last {} lines of its session log:\n{}\n\n\
             Answer with exactly one word: retry (nudge it again), terminate (it is wedged), \
             or extend (it is doing legitimate slow work).",
            session.agent_name,
            session.bead_id,
            session.escalation_level,
            TRIAGE_LOG_LINES,
            tail
        );

        match runner.invoke(&prompt).await {
            Ok(response) => {
                let verdict = parse_triage_verdict(&response);
                olog_debug!(
                    "Watchdog: triage for '{}' -> {:?}",
                    session.agent_name,
                    verdict
                );
                verdict
            }
            Err(e) => {
                olog_warn!(
                    "Watchdog: triage for '{}' failed ({}), extending",
                    session.agent_name,
                    e
                );
                TriageVerdict::Extend
            }
        }
    }

    /// Complete runs whose non-persistent workers have all reached a
    /// terminal state. Coordinators and monitors do not hold a run open.
    fn check_run_completion(&self) -> Result<usize> {
        let Some(run) = self.sessions.get_active_run()? else {
            return Ok(0);
        };
        if run.agent_count == 0 {
            return Ok(0);
        }
        let counts = self.sessions.active_worker_counts()?;
        if counts.get(&run.run_id).copied().unwrap_or(0) > 0 {
            return Ok(0);
        }
        self.sessions.complete_run(&run.run_id)?;
        olog!("Watchdog: run '{}' completed", run.run_id);
        self.record_event(
            StoredEvent::new("watchdog", EventKind::Custom)
                .with_run(run.run_id.clone())
                .with_payload(serde_json::json!({ "kind": "run_completed" }).to_string()),
        );
        Ok(1)
    }

    /// Fire-and-forget failure recording.
    fn record_failure(&self, session: &AgentSession, reason: &str) {
        self.failures.offer(FailureRecord {
            agent_name: session.agent_name.clone(),
            bead_id: session.bead_id.clone(),
            reason: reason.to_string(),
            escalation_level: session.escalation_level,
        });
    }

    /// Fire-and-forget event recording: a full events store must never take
    /// the watchdog down with it.
    fn record_event(&self, event: StoredEvent) {
        if let Err(e) = self.events.insert(&event) {
            olog_trace!("Watchdog: event insert swallowed: {}", e);
        }
    }
}
