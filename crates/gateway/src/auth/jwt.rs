use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    iat: i64,
    exp: i64,
}

/// Identity attached to a socket for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token. Used by tests and local tooling; production tokens come
    /// from the identity provider sharing the secret.
    pub fn issue_token(&self, user_id: &str, roles: &[&str]) -> anyhow::Result<String> {
        self.issue_token_at(user_id, roles, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: &str, roles: &[&str], issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_owned(),
            roles: roles.iter().map(|role| (*role).to_owned()).collect(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn validate_token(&self, token: &str) -> anyhow::Result<VerifiedIdentity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = claims.sub.trim();
        if user_id.is_empty() {
            bail!("access token subject is empty");
        }

        Ok(VerifiedIdentity { user_id: user_id.to_owned(), roles: claims.roles })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtAccessTokenService, ACCESS_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    #[test]
    fn short_secrets_are_rejected() {
        assert!(JwtAccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn issues_and_validates_tokens_with_roles() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");

        let token = service.issue_token("user-42", &["editor"]).expect("token should be issued");
        let identity = service.validate_token(&token).expect("token should validate");

        assert_eq!(identity.user_id, "user-42");
        assert_eq!(identity.roles, vec!["editor".to_string()]);
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_token("user-1", &[]).expect("token should be issued");

        assert!(service.validate_token(&format!("{token}x")).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let other = JwtAccessTokenService::new("another_secret_that_is_also_long_enough_ok")
            .expect("service should initialize");
        let token = other.issue_token("user-1", &[]).expect("token should be issued");

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token =
            service.issue_token_at("user-1", &[], issued_at).expect("token should be issued");

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_blank_subjects_and_defaults_missing_roles() {
        #[derive(Serialize)]
        struct BareClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let sign = |sub: &'static str| {
            encode(
                &Header::new(Algorithm::HS256),
                &BareClaims { sub, iat: now, exp: now + ACCESS_TOKEN_TTL_SECONDS },
                &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
            )
            .expect("token should encode")
        };

        assert!(service.validate_token(&sign("  ")).is_err());
        let identity = service.validate_token(&sign("user-7")).expect("roles are optional");
        assert!(identity.roles.is_empty());
    }
}
