// Admission gateway: the checks every realtime connection and every inbound
// message passes before any application logic runs.
//
// Connection admission runs before the socket upgrade:
//   1. one token from the per-IP connection bucket
//   2. bearer credential from the `token` query parameter
// Message admission runs per frame, strictly in arrival order:
//   1. idempotency claim on (userId, requestId)
//   2. one token from the per-user message bucket
//
// Coordinator failures fail closed: the connection or message is refused.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtAccessTokenService;
use crate::auth::query::token_from_uri;
use crate::config::GatewayConfig;
use crate::coordinator::{
    connection_bucket_key, idempotency_key, message_bucket_key, BucketSpec, Coordinator,
    TokenDecision,
};
use crate::error::{ErrorCode, GatewayError};
use crate::metrics::RejectReason;

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Everything known about a connection attempt before the upgrade.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub peer: SocketAddr,
}

/// Identity bound to an admitted socket. Lives exactly as long as the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub connection_id: String,
    pub user_id: String,
    pub roles: Vec<String>,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(SessionIdentity),
    Rejected { reason: RejectReason, retry_after: Option<Duration> },
}

impl Admission {
    fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason, retry_after: None }
    }

    /// Render a rejection as the pre-upgrade HTTP error.
    pub fn rejection_error(reason: RejectReason, retry_after: Option<Duration>) -> GatewayError {
        let error = match reason {
            RejectReason::Unauthenticated => GatewayError::from_code(ErrorCode::AuthInvalidToken),
            RejectReason::Throttled => GatewayError::from_code(ErrorCode::AdmissionThrottled),
            RejectReason::Timeout => GatewayError::from_code(ErrorCode::AdmissionTimeout),
            RejectReason::Unavailable => GatewayError::new(
                ErrorCode::InternalError,
                "admission state is temporarily unavailable",
            ),
        };
        match retry_after {
            Some(retry_after) => error.with_retry_after(retry_after),
            None => error,
        }
    }
}

/// Result of admitting one message on an open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAdmission {
    Accepted,
    Duplicate,
    /// Budget exhausted. The idempotency claim has been released.
    Throttled { retry_after: Duration },
}

#[derive(Clone)]
pub struct AdmissionGateway {
    jwt_service: Arc<JwtAccessTokenService>,
    coordinator: Coordinator,
    connection_limit: BucketSpec,
    message_limit: BucketSpec,
    idempotency_ttl: Duration,
    handshake_timeout: Duration,
    trust_forwarded_for: bool,
}

impl AdmissionGateway {
    pub fn new(
        config: &GatewayConfig,
        jwt_service: Arc<JwtAccessTokenService>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            jwt_service,
            coordinator,
            connection_limit: config.connection_limit,
            message_limit: config.message_limit,
            idempotency_ttl: config.idempotency_ttl,
            handshake_timeout: config.handshake_timeout,
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Decide whether a connection attempt may be upgraded.
    pub async fn accept(&self, request: &ConnectionRequest) -> Admission {
        match tokio::time::timeout(self.handshake_timeout, self.admit_connection(request)).await {
            Ok(admission) => admission,
            Err(_) => {
                warn!(peer = %request.peer, "admission timed out");
                Admission::rejected(RejectReason::Timeout)
            }
        }
    }

    async fn admit_connection(&self, request: &ConnectionRequest) -> Admission {
        let ip = client_ip(&request.headers, request.peer, self.trust_forwarded_for);

        match self.coordinator.take_token(&connection_bucket_key(ip), self.connection_limit).await {
            Ok(TokenDecision::Granted { .. }) => {}
            Ok(TokenDecision::Exhausted { retry_after }) => {
                debug!(%ip, retry_after_ms = retry_after.as_millis() as u64, "connection throttled");
                return Admission::Rejected {
                    reason: RejectReason::Throttled,
                    retry_after: Some(retry_after),
                };
            }
            Err(error) => {
                warn!(error = ?error, %ip, "connection budget check failed");
                return Admission::rejected(RejectReason::Unavailable);
            }
        }

        let Some(token) = token_from_uri(&request.uri) else {
            return Admission::rejected(RejectReason::Unauthenticated);
        };
        let identity = match self.jwt_service.validate_token(&token) {
            Ok(identity) => identity,
            Err(error) => {
                debug!(error = %error, %ip, "credential rejected");
                return Admission::rejected(RejectReason::Unauthenticated);
            }
        };

        Admission::Accepted(SessionIdentity {
            connection_id: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            roles: identity.roles,
            ip,
        })
    }

    /// Claim the request id, then spend one message token.
    pub async fn admit_message(
        &self,
        identity: &SessionIdentity,
        request_id: &str,
    ) -> anyhow::Result<MessageAdmission> {
        let key = idempotency_key(&identity.user_id, request_id);
        if !self.coordinator.set_if_absent(&key, self.idempotency_ttl).await? {
            return Ok(MessageAdmission::Duplicate);
        }

        let decision = match self
            .coordinator
            .take_token(&message_bucket_key(&identity.user_id), self.message_limit)
            .await
        {
            Ok(decision) => decision,
            Err(error) => {
                self.release_claim(&key).await;
                return Err(error);
            }
        };

        match decision {
            TokenDecision::Granted { .. } => Ok(MessageAdmission::Accepted),
            TokenDecision::Exhausted { retry_after } => {
                self.release_claim(&key).await;
                Ok(MessageAdmission::Throttled { retry_after })
            }
        }
    }

    /// Give back the claim on a request id whose command failed, so the same
    /// id may be retried.
    pub async fn release_message(&self, identity: &SessionIdentity, request_id: &str) {
        self.release_claim(&idempotency_key(&identity.user_id, request_id)).await;
    }

    async fn release_claim(&self, key: &str) {
        if let Err(error) = self.coordinator.release(key).await {
            warn!(error = ?error, "failed to release idempotency claim");
        }
    }
}

/// Client IP for rate limiting. `X-Forwarded-For` is honored only behind a
/// trusted proxy, otherwise any client could pick its own bucket.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}
