//! Retry and backoff for viewer and broadcast sessions
//!
//! `ConnectionSupervisor` is a pure decision object: feed it failures and
//! successes, it answers with `Retry`, `GiveUp` or `Ignore`. The spawned
//! driver returned by `supervise` watches a session's health and acts on
//! those decisions through the public `Supervised` contract only.

use crate::error::FailureKind;
use crate::session::{BroadcastSession, ViewerSession};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnection policy: capped exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Delay before the first retry in milliseconds (default: 1000ms)
    pub initial_backoff_ms: u64,
    /// Upper bound for any delay in milliseconds (default: 30000ms)
    pub max_backoff_ms: u64,
    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (default: 0.2, i.e. +-20%)
    pub jitter_ratio: f64,
    /// Attempts before giving up; `None` retries forever (default)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectionPolicy {
    /// Create a policy with aggressive reconnection (for low-latency scenarios)
    pub fn aggressive() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            multiplier: 1.5,
            jitter_ratio: 0.2,
            max_attempts: Some(10),
        }
    }

    /// Create a policy with conservative reconnection (for stable connections)
    pub fn conservative() -> Self {
        Self {
            initial_backoff_ms: 2000,
            max_backoff_ms: 60_000,
            multiplier: 2.5,
            jitter_ratio: 0.2,
            max_attempts: Some(3),
        }
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(Error::InvalidConfig(
                "initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::InvalidConfig(
                "max_backoff_ms must be at least initial_backoff_ms".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(Error::InvalidConfig(
                "jitter_ratio must be in [0.0, 1.0)".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidConfig(
                "max_attempts must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let backoff_ms = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(backoff_ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff(attempt).as_millis() as f64;
        let factor = if self.jitter_ratio > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio)
        } else {
            1.0
        };
        Duration::from_millis((base_ms * factor).round() as u64)
    }

    /// Check if retry number `attempt` (1-based) is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// What to do about one observed failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorDecision {
    /// Retry after `delay`
    Retry {
        /// 1-based attempt number
        attempt: u32,
        /// Backoff before the attempt
        delay: Duration,
    },
    /// Stop retrying and surface the failure
    GiveUp {
        /// Retries made before giving up
        attempts: u32,
    },
    /// Nothing to do
    Ignore,
}

/// Backoff bookkeeping for one supervised session
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    policy: ReconnectionPolicy,
    attempts: u32,
    gave_up: bool,
}

impl ConnectionSupervisor {
    /// Create a supervisor applying `policy`
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            gave_up: false,
        }
    }

    /// Policy in use
    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// Retries issued since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the supervisor has given up
    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    /// Decide how to react to a failure of kind `kind`
    pub fn on_failure(&mut self, kind: FailureKind) -> SupervisorDecision {
        if self.gave_up {
            return SupervisorDecision::Ignore;
        }

        if kind.is_fatal() {
            warn!("Fatal failure {:?}; not retrying", kind);
            self.gave_up = true;
            return SupervisorDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        let attempt = self.attempts + 1;
        if !self.policy.should_retry(attempt) {
            warn!("Giving up after {} attempts", self.attempts);
            self.gave_up = true;
            return SupervisorDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        self.attempts = attempt;
        let delay = self.policy.calculate_backoff(attempt);
        debug!("Retry attempt {} after {:?} ({:?})", attempt, delay, kind);
        SupervisorDecision::Retry { attempt, delay }
    }

    /// Reset after the session became healthy
    pub fn on_success(&mut self) {
        if self.attempts > 0 {
            info!("Session recovered after {} attempts", self.attempts);
        }
        self.attempts = 0;
        self.gave_up = false;
    }
}

/// Coarse session health as seen by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    /// Not started or stopped by its owner
    Idle,
    /// Connecting, starting or stopping
    Pending,
    /// Connected or live
    Healthy,
    /// Ended with a failure of this kind
    Failed(FailureKind),
}

/// Public contract a session offers to its supervisor
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Tear down and try again
    async fn retry(&self) -> Result<()>;

    /// Stop the session and release everything
    async fn stop(&self) -> Result<()>;

    /// Watch health changes
    fn health(&self) -> watch::Receiver<SessionHealth>;
}

/// Supervisor driver status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    /// No reconnection needed
    Idle,
    /// Waiting for backoff delay
    WaitingForBackoff,
    /// Attempting reconnection
    Reconnecting,
    /// Reconnection succeeded
    Succeeded,
    /// Reconnection failed (gave up)
    Failed,
}

/// What the driver does when its handle lets go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverCommand {
    Run,
    Detach,
    Stop,
}

/// Handle to a running supervisor driver
pub struct SupervisorHandle {
    command_tx: watch::Sender<DriverCommand>,
    status: watch::Receiver<ReconnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Current driver status
    pub fn status(&self) -> ReconnectionState {
        *self.status.borrow()
    }

    /// Watch driver status changes
    pub fn subscribe(&self) -> watch::Receiver<ReconnectionState> {
        self.status.clone()
    }

    /// Stop supervising; the session is left as it is
    pub async fn detach(mut self) {
        self.finish(DriverCommand::Detach).await;
    }

    /// Stop supervising and stop the session through `Supervised::stop`
    pub async fn shutdown(mut self) {
        self.finish(DriverCommand::Stop).await;
    }

    async fn finish(&mut self, command: DriverCommand) {
        let _ = self.command_tx.send(command);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Supervise a viewer session
pub fn supervise_viewer(session: ViewerSession, policy: ReconnectionPolicy) -> SupervisorHandle {
    supervise(Arc::new(session), policy)
}

/// Supervise a broadcast session
pub fn supervise_broadcast(
    session: BroadcastSession,
    policy: ReconnectionPolicy,
) -> SupervisorHandle {
    supervise(Arc::new(session), policy)
}

/// Spawn a driver that retries `session` according to `policy`
///
/// Fatal failures and exhausted attempts leave the session in its failed
/// state and move the driver to `ReconnectionState::Failed`; the driver keeps
/// watching, so a later manual `start` that succeeds is still reported.
/// Only `SupervisorHandle::shutdown` calls `Supervised::stop`.
pub fn supervise<S>(session: Arc<S>, policy: ReconnectionPolicy) -> SupervisorHandle
where
    S: Supervised + 'static,
{
    let (command_tx, command_rx) = watch::channel(DriverCommand::Run);
    let (status_tx, status_rx) = watch::channel(ReconnectionState::Idle);
    let task = tokio::spawn(drive(session, policy, command_rx, status_tx));

    SupervisorHandle {
        command_tx,
        status: status_rx,
        task: Some(task),
    }
}

async fn drive<S: Supervised>(
    session: Arc<S>,
    policy: ReconnectionPolicy,
    mut command_rx: watch::Receiver<DriverCommand>,
    status: watch::Sender<ReconnectionState>,
) {
    let mut supervisor = ConnectionSupervisor::new(policy);
    let mut health = session.health();

    loop {
        let current = health.borrow_and_update().clone();

        match current {
            SessionHealth::Healthy => {
                if supervisor.attempts() > 0 {
                    status.send_replace(ReconnectionState::Succeeded);
                }
                supervisor.on_success();
            }
            SessionHealth::Failed(kind) => match supervisor.on_failure(kind) {
                SupervisorDecision::Retry { attempt, delay } => {
                    status.send_replace(ReconnectionState::WaitingForBackoff);
                    info!("Retrying session (attempt {}) in {:?}", attempt, delay);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = command_rx.changed() => break,
                    }

                    status.send_replace(ReconnectionState::Reconnecting);
                    if let Err(e) = session.retry().await {
                        warn!("Retry attempt {} failed: {}", attempt, e);
                    }
                    continue;
                }
                SupervisorDecision::GiveUp { attempts } => {
                    warn!("Supervisor gave up after {} attempts ({:?})", attempts, kind);
                    status.send_replace(ReconnectionState::Failed);
                }
                SupervisorDecision::Ignore => {}
            },
            SessionHealth::Idle | SessionHealth::Pending => {}
        }

        tokio::select! {
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = command_rx.changed() => break,
        }
    }

    if *command_rx.borrow() == DriverCommand::Stop {
        if let Err(e) = session.stop().await {
            warn!("Failed to stop supervised session: {}", e);
        }
    }

    debug!("Supervisor driver stopped");
}
