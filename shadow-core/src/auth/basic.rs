use anyhow::{bail, Result};

use crate::error::AppError;

/// Basic credentials presented in the username & password fields of an MQTT Connect packet.
///
/// The password carries the base64 encoding of the device's credential fingerprint.
#[derive(Clone, Debug)]
pub struct BasicCredentials {
    username: String,
    password: Vec<u8>,
}

impl BasicCredentials {
    /// Extract credentials from the optional username & password of a Connect packet.
    pub fn from_connect(username: Option<&str>, password: Option<&[u8]>) -> Result<Self> {
        let username = match username {
            Some(username) if !username.is_empty() => username.to_string(),
            _ => bail!(AppError::InvalidCredentials("connect payload username is empty".into())),
        };
        let password = match password {
            Some(password) if !password.is_empty() => password.to_vec(),
            _ => bail!(AppError::InvalidCredentials("connect payload password is empty".into())),
        };
        Ok(Self { username, password })
    }

    /// The username claimed by the client.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Decode the credential fingerprint carried by the password.
    pub fn fingerprint(&self) -> Result<Vec<u8>> {
        match base64::decode(&self.password) {
            Ok(fingerprint) => Ok(fingerprint),
            Err(_) => bail!(AppError::InvalidCredentials("could not base64 decode basic auth password".into())),
        }
    }
}
