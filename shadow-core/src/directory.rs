//! The device directory contract, through which the pipeline resolves device identities.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A device known to the directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub enabled: bool,
    /// Whether the device may authenticate with MQTT username & password.
    #[serde(default)]
    pub basic_enabled: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// The bearer token issued by the directory for this device, used for re-checks.
    #[serde(skip)]
    pub token: String,
}

/// A lookup service for devices.
#[async_trait::async_trait]
pub trait DeviceDirectory: Send + Sync + 'static {
    /// Find the device owning the given credential fingerprint.
    ///
    /// Returns `AppError::ResourceNotFound` when no device matches.
    async fn get_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Device>;

    /// Find the device to which the given bearer token was issued.
    ///
    /// Returns `AppError::UnknownToken` when the token is invalid or its device no longer exists.
    async fn get_by_token(&self, token: &str) -> Result<Device>;
}

/// Find the device owning the given fingerprint and verify it with the given predicate.
///
/// A device which fails the predicate is reported as not found, so callers can not tell the two
/// cases apart.
pub async fn get_by_fingerprint_and_verify<D, F>(directory: &D, fingerprint: &[u8], predicate: F) -> Result<Device>
where
    D: DeviceDirectory + ?Sized,
    F: FnOnce(&Device) -> bool,
{
    let device = directory.get_by_fingerprint(fingerprint).await?;
    if !predicate(&device) {
        return Err(AppError::ResourceNotFound.into());
    }
    Ok(device)
}
