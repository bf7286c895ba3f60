use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

/// Why a connection attempt was refused before the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RejectReason {
    Unauthenticated,
    Throttled,
    Timeout,
    Unavailable,
}

impl RejectReason {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
        }
    }
}

/// What happened to one inbound message on the command socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageOutcome {
    Processed,
    Duplicate,
    Throttled,
    Malformed,
}

impl MessageOutcome {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Throttled => "throttled",
            Self::Malformed => "malformed",
        }
    }
}

/// Which socket family a room hub serves; each reports its own room gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoomKind {
    Command,
    Replication,
}

impl RoomKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Replication => "replication",
        }
    }
}

#[derive(Default)]
pub struct GatewayMetrics {
    connections_accepted_total: AtomicU64,
    connections_rejected_total: Mutex<BTreeMap<RejectReason, u64>>,
    messages_total: Mutex<BTreeMap<MessageOutcome, u64>>,
    active_connections: AtomicI64,
    active_rooms: Mutex<BTreeMap<RoomKind, u64>>,
}

static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_connection_accepted() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_accepted();
    }
}

pub fn record_connection_rejected(reason: RejectReason) {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_rejected(reason);
    }
}

pub fn record_message(outcome: MessageOutcome) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message(outcome);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn set_active_rooms(kind: RoomKind, count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_rooms(kind, count);
    }
}

impl GatewayMetrics {
    pub fn record_connection_accepted(&self) {
        self.connections_accepted_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connection_rejected(&self, reason: RejectReason) {
        increment(&self.connections_rejected_total, reason);
    }

    pub fn record_message(&self, outcome: MessageOutcome) {
        increment(&self.messages_total, outcome);
    }

    pub fn set_active_rooms(&self, kind: RoomKind, count: usize) {
        lock(&self.active_rooms).insert(kind, count as u64);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(
            "# HELP gateway_connections_accepted_total Connections admitted and upgraded.\n",
        );
        output.push_str("# TYPE gateway_connections_accepted_total counter\n");
        output.push_str(&format!(
            "gateway_connections_accepted_total {}\n",
            self.connections_accepted_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_connections_rejected_total Connection attempts refused by reason.\n",
        );
        output.push_str("# TYPE gateway_connections_rejected_total counter\n");
        {
            let guard = lock(&self.connections_rejected_total);
            for reason in [
                RejectReason::Unauthenticated,
                RejectReason::Throttled,
                RejectReason::Timeout,
                RejectReason::Unavailable,
            ] {
                output.push_str(&format!(
                    "gateway_connections_rejected_total{{reason=\"{}\"}} {}\n",
                    reason.label(),
                    guard.get(&reason).copied().unwrap_or(0)
                ));
            }
        }

        output.push_str("# HELP gateway_messages_total Command socket messages by outcome.\n");
        output.push_str("# TYPE gateway_messages_total counter\n");
        {
            let guard = lock(&self.messages_total);
            for outcome in [
                MessageOutcome::Processed,
                MessageOutcome::Duplicate,
                MessageOutcome::Throttled,
                MessageOutcome::Malformed,
            ] {
                output.push_str(&format!(
                    "gateway_messages_total{{outcome=\"{}\"}} {}\n",
                    outcome.label(),
                    guard.get(&outcome).copied().unwrap_or(0)
                ));
            }
        }

        output.push_str("# HELP gateway_active_connections Currently open sockets.\n");
        output.push_str("# TYPE gateway_active_connections gauge\n");
        output.push_str(&format!(
            "gateway_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP gateway_active_rooms Rooms with at least one member.\n");
        output.push_str("# TYPE gateway_active_rooms gauge\n");
        {
            let guard = lock(&self.active_rooms);
            for kind in [RoomKind::Command, RoomKind::Replication] {
                output.push_str(&format!(
                    "gateway_active_rooms{{kind=\"{}\"}} {}\n",
                    kind.label(),
                    guard.get(&kind).copied().unwrap_or(0)
                ));
            }
        }

        output
    }
}

fn lock<K>(map: &Mutex<BTreeMap<K, u64>>) -> std::sync::MutexGuard<'_, BTreeMap<K, u64>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn increment<K: Ord>(map: &Mutex<BTreeMap<K, u64>>, key: K) {
    let mut guard = lock(map);
    let value = guard.entry(key).or_insert(0);
    *value = value.saturating_add(1);
}
