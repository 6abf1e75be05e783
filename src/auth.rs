//! JWT session authorization for WebSocket subscribers.
//!
//! Tokens are HS256-signed with a shared secret and carry the user, a
//! maximum session duration and an absolute expiry. The audience claim must
//! overlap the sub-protocols this server advertises.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

pub const ISSUER: &str = "urn:mah.priv.at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user
    pub usr: String,
    /// Maximum session duration in seconds from connect
    pub dur: u64,
    /// Absolute expiry, Unix seconds
    pub exp: i64,
    pub iss: String,
    pub aud: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    /// The session ends at whichever comes first: the duration budget or
    /// the token's absolute expiry.
    pub fn session_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_duration = now + chrono::Duration::seconds(self.dur as i64);
        let by_expiry = Utc
            .timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(now);
        by_duration.min(by_expiry)
    }
}

pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: Vec<String>,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, audience: &[&str]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            issuer: ISSUER.to_string(),
            audience: audience.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build from the `JWT_SECRET` environment variable. A missing secret
    /// is a configuration error and refuses startup.
    pub fn from_env(audience: &[&str]) -> Result<Self> {
        let secret =
            std::env::var("JWT_SECRET").context("JWT_SECRET environment variable not set")?;
        if secret.is_empty() {
            anyhow::bail!("JWT_SECRET environment variable is empty");
        }
        Ok(Self::new(&secret, audience))
    }

    /// Verify signature, issuer, audience overlap and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&self.audience);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = 0;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .context("token verification failed")
    }

    /// Mint a token for `user`, valid for at most `duration_secs` per
    /// session and absolutely until `expires_on`.
    pub fn mint(&self, user: &str, duration_secs: u64, expires_on: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            usr: user.to_string(),
            dur: duration_secs,
            exp: expires_on.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: Some(Utc::now().timestamp()),
        };
        encode(&Header::default(), &claims, &self.encoding_key).context("encoding token")
    }
}
