use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The claims body of a bearer token issued to an authenticated device.
///
/// A session uses this token to re-check the device against the directory on each read loop
/// iteration, so the token must remain valid for the lifetime of the connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceClaims {
    /// The JWT ID of this token, a UUID unique to the token's creation.
    pub jti: String,
    /// The ID of the device this token was issued to.
    pub sub: String,
}

impl DeviceClaims {
    /// Create a new instance.
    pub fn new(device_id: &str) -> Self {
        Self {
            jti: Uuid::new_v4().to_string(),
            sub: device_id.into(),
        }
    }

    /// Encode this claims body as a JWT.
    pub fn encode(&self, key: &EncodingKey) -> jsonwebtoken::errors::Result<String> {
        let header = Header::new(Algorithm::HS512);
        jsonwebtoken::encode(&header, &self, key)
    }

    /// Decode and verify the given string as a JWT with a `DeviceClaims` body.
    pub fn decode(token: impl AsRef<str>, key: &DecodingKey) -> jsonwebtoken::errors::Result<Self> {
        let validation = Validation {
            algorithms: vec![Algorithm::HS512],
            validate_exp: false,
            validate_nbf: false,
            ..Default::default()
        };
        jsonwebtoken::decode(token.as_ref(), key, &validation).map(|body| body.claims)
    }
}
