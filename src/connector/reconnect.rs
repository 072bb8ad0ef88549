//! Reconnection Controller
//!
//! The connection lifecycle as plain data. Each transition takes the current
//! state by reference and returns the next one; the runner owns the timers.
//!
//! ```text
//! disconnected -> connecting -> connected
//!                     ^   \         |
//!                     |    v        v
//!                   reconnecting <--+
//!                         |
//!                         v
//!                      failed
//! ```

use serde::Serialize;
use std::time::Duration;

use crate::feed::ReconnectionConfig;

/// Lifecycle phase of a feed connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Runtime state of one feed connector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Consecutive failures since the last success
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Activation, including explicit re-activation after `failed`
    pub fn activate(&self) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            attempt: 0,
            last_error: None,
        }
    }

    /// Adapter opened
    pub fn opened(&self) -> Self {
        Self {
            phase: ConnectionPhase::Connected,
            attempt: 0,
            last_error: None,
        }
    }

    /// Open failure or runtime disconnect.
    ///
    /// Returns the next state and, when reconnecting, the delay before the
    /// next `connecting` phase.
    pub fn failed(&self, error: impl Into<String>, policy: &ReconnectionConfig) -> (Self, Option<Duration>) {
        let attempt = self.attempt.saturating_add(1);
        let last_error = Some(error.into());

        if !policy.enabled || attempt > policy.max_attempts {
            return (
                Self {
                    phase: ConnectionPhase::Failed,
                    attempt,
                    last_error,
                },
                None,
            );
        }

        (
            Self {
                phase: ConnectionPhase::Reconnecting,
                attempt,
                last_error,
            },
            Some(backoff_delay(policy, attempt)),
        )
    }

    /// Backoff delay elapsed
    pub fn retry(&self) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            ..self.clone()
        }
    }

    /// Explicit deactivation
    pub fn deactivate(&self) -> Self {
        Self::default()
    }

    /// A polling tick failed; the phase is unchanged
    pub fn poll_failed(&self, error: impl Into<String>) -> Self {
        Self {
            phase: self.phase,
            attempt: self.attempt.saturating_add(1),
            last_error: Some(error.into()),
        }
    }

    /// A polling tick succeeded
    pub fn poll_succeeded(&self) -> Self {
        Self {
            phase: self.phase,
            attempt: 0,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == ConnectionPhase::Failed
    }
}

/// Linear backoff: `delayMs * attempt`
pub fn backoff_delay(policy: &ReconnectionConfig, attempt: u32) -> Duration {
    Duration::from_millis(policy.delay_ms.saturating_mul(attempt as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectionConfig {
        ReconnectionConfig {
            enabled: true,
            delay_ms: 100,
            max_attempts,
        }
    }

    #[test]
    fn test_happy_path() {
        let state = ConnectionState::default();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);

        let state = state.activate();
        assert_eq!(state.phase, ConnectionPhase::Connecting);

        let state = state.opened();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.attempt, 0);
    }

    #[test]
    fn test_backoff_is_linear_and_monotonic_until_failed() {
        let policy = policy(4);
        let mut state = ConnectionState::default().activate();
        let mut delays = Vec::new();

        loop {
            let (next, delay) = state.failed("connection refused", &policy);
            state = next;
            match delay {
                Some(delay) => {
                    assert_eq!(state.phase, ConnectionPhase::Reconnecting);
                    delays.push(delay);
                    state = state.retry();
                }
                None => break,
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(400),
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert_eq!(state.attempt, 5);
        assert_eq!(state.last_error.as_deref(), Some("connection refused"));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_success_resets_attempt() {
        let policy = policy(5);
        let state = ConnectionState::default().activate();
        let (state, _) = state.failed("refused", &policy);
        let (state, _) = state.retry().failed("refused", &policy);
        assert_eq!(state.attempt, 2);

        let state = state.retry().opened();
        assert_eq!(state.attempt, 0);
        assert_eq!(state.last_error, None);

        let (state, delay) = state.failed("dropped", &policy);
        assert_eq!(state.attempt, 1);
        assert_eq!(delay, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_disabled_reconnection_fails_immediately() {
        let policy = ReconnectionConfig {
            enabled: false,
            ..policy(5)
        };
        let (state, delay) = ConnectionState::default()
            .activate()
            .opened()
            .failed("socket closed", &policy);

        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert_eq!(delay, None);
    }

    #[test]
    fn test_reactivation_after_failure() {
        let (failed, _) = ConnectionState::default()
            .activate()
            .failed("refused", &policy(0));
        assert!(failed.is_terminal());

        let state = failed.activate();
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert_eq!(state.attempt, 0);
    }

    #[test]
    fn test_poll_health_signal() {
        let state = ConnectionState::default().activate().opened();
        let state = state.poll_failed("HTTP 503").poll_failed("timeout");

        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.attempt, 2);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));

        let state = state.poll_succeeded();
        assert_eq!(state.attempt, 0);
        assert_eq!(state.last_error, None);
    }
}
