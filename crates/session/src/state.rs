// Session lifecycle: one named-state enum, one transition function.

use std::time::Duration;

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before the session falls back to
    /// local-only editing.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(30), max_attempts: 5 }
    }
}

impl ReconnectPolicy {
    /// Backoff before the attempt that follows `failures` failed ones.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(7);
        let delay = DurationSaturatingMul::saturating_mul(self.base_delay, 1u64 << exp);
        delay.min(self.max_delay)
    }

    pub fn should_reconnect(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOnlyReason {
    NoEndpoint,
    TooManyFailures,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Waiting for (or backing off before) a transport handshake. `failures`
    /// counts attempts since the last time the session reached sync.
    Connecting { failures: u32 },
    ConnectedUnsynced { failures: u32 },
    ConnectedSynced,
    LocalOnly { reason: LocalOnlyReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Mount { has_endpoint: bool },
    HandshakeCompleted,
    /// The engine merged the authoritative update set (sync step 2).
    SyncCompleted,
    ConnectFailed,
    TransportDropped,
    GoLocalOnly,
    /// Leave local-only mode and try the endpoint again.
    Retry { has_endpoint: bool },
    Unmount,
}

/// What the UI may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiStatus {
    Disconnected,
    Connecting,
    Synced,
    LocalOnly,
}

impl UiStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Synced => "synced",
            Self::LocalOnly => "local_only",
        }
    }
}

impl SessionState {
    pub fn ui_status(self) -> UiStatus {
        match self {
            Self::Disconnected => UiStatus::Disconnected,
            Self::Connecting { .. } | Self::ConnectedUnsynced { .. } => UiStatus::Connecting,
            Self::ConnectedSynced => UiStatus::Synced,
            Self::LocalOnly { .. } => UiStatus::LocalOnly,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedUnsynced { .. } | Self::ConnectedSynced)
    }

    pub fn is_synced(self) -> bool {
        matches!(self, Self::ConnectedSynced)
    }

    pub fn is_local_only(self) -> bool {
        matches!(self, Self::LocalOnly { .. })
    }

    /// Failed attempts that count toward the local-only threshold.
    pub fn failures(self) -> u32 {
        match self {
            Self::Connecting { failures } | Self::ConnectedUnsynced { failures } => failures,
            _ => 0,
        }
    }
}

/// The single transition function. Events that make no sense in the current
/// state leave it unchanged.
pub fn transition(state: SessionState, event: SessionEvent, policy: &ReconnectPolicy) -> SessionState {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (_, E::Unmount) => S::Disconnected,

        (S::Disconnected, E::Mount { has_endpoint: true }) => S::Connecting { failures: 0 },
        (S::Disconnected, E::Mount { has_endpoint: false }) => {
            S::LocalOnly { reason: LocalOnlyReason::NoEndpoint }
        }

        (S::Connecting { failures }, E::HandshakeCompleted) => S::ConnectedUnsynced { failures },

        (S::ConnectedUnsynced { .. } | S::ConnectedSynced, E::SyncCompleted) => S::ConnectedSynced,

        (S::Connecting { failures }, E::ConnectFailed)
        | (S::ConnectedUnsynced { failures }, E::TransportDropped) => {
            let failures = failures.saturating_add(1);
            if policy.should_reconnect(failures) {
                S::Connecting { failures }
            } else {
                S::LocalOnly { reason: LocalOnlyReason::TooManyFailures }
            }
        }
        (S::ConnectedSynced, E::TransportDropped) => S::Connecting { failures: 0 },

        (S::Connecting { .. } | S::ConnectedUnsynced { .. } | S::ConnectedSynced, E::GoLocalOnly) => {
            S::LocalOnly { reason: LocalOnlyReason::Requested }
        }

        (S::LocalOnly { .. }, E::Retry { has_endpoint: true }) => S::Connecting { failures: 0 },

        (state, _) => state,
    }
}

// ── Backoff helper (for Duration::saturating_mul with u64) ──────────

trait DurationSaturatingMul {
    fn saturating_mul(self, rhs: u64) -> Self;
}

impl DurationSaturatingMul for Duration {
    fn saturating_mul(self, rhs: u64) -> Self {
        let nanos = self.as_nanos().saturating_mul(rhs as u128);
        if nanos > u64::MAX as u128 {
            Duration::from_secs(u64::MAX)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}
