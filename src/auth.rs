use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::models::Identity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub guest: bool,
    pub exp: usize,
}

/// Resolves a bearer token to an identity. Tokens are issued out-of-band by
/// the auth service; the coordinator only verifies them.
pub fn verify_token(token: &str, secret: &str) -> Result<Identity, jsonwebtoken::errors::Error> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(Identity {
        id: data.claims.sub,
        name: data.claims.name,
        guest: data.claims.guest,
    })
}

/// Mints a short-lived token for the given identity. Used by the test
/// harness and local tooling; production tokens come from the auth service.
pub fn issue_token(
    identity: &Identity,
    secret: &str,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: identity.id.clone(),
        name: identity.name.clone(),
        guest: identity.guest,
        exp: (chrono::Utc::now().timestamp() + ttl_secs) as usize,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
