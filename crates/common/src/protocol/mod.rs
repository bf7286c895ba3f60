// Wire protocol for the gateway's realtime command socket.

pub mod command;
pub mod envelope;

/// Close code sent when a connection exhausts its per-user message budget.
///
/// Distinct from auth or protocol failures so clients can tell "slow down"
/// apart from "reconnect".
pub const CLOSE_MESSAGE_RATE_LIMITED: u16 = 4429;

/// Close code sent when the gateway is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Query parameter carrying the bearer credential on connection URIs.
pub const TOKEN_QUERY_PARAM: &str = "token";
