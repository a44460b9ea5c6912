//! Probe identities
//!
//! Short-lived HS256 tokens signed with the secret the REST layer trusts.
//! They exist only so verification can act as two distinct users.

use crate::error::AppError;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Probe tokens expire quickly; a verification run takes seconds
const PROBE_TOKEN_EXPIRATION_MINUTES: i64 = 10;

pub const PROBE_ROLE: &str = "authenticated";

/// Claims the REST layer and the caller identity functions read
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProbeClaims {
    pub sub: Uuid,
    pub org_id: Uuid,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct ProbeIdentity {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub token: String,
}

impl ProbeIdentity {
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Mint a fresh identity with its own user and org ids
pub fn mint(secret: &str) -> Result<ProbeIdentity, AppError> {
    let now = Utc::now();
    let claims = ProbeClaims {
        sub: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        role: PROBE_ROLE.to_string(),
        exp: (now + Duration::minutes(PROBE_TOKEN_EXPIRATION_MINUTES)).timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Internal(format!("Failed to sign probe token: {}", e)))?;

    Ok(ProbeIdentity {
        user_id: claims.sub,
        org_id: claims.org_id,
        token,
    })
}

/// Decode a probe token; used by tests and the fake gateway
pub fn decode_probe(token: &str, secret: &str) -> Result<ProbeClaims, AppError> {
    let data = decode::<ProbeClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map_err(|e| AppError::VerificationProbe(format!("Probe token rejected: {}", e)))?;
    Ok(data.claims)
}
