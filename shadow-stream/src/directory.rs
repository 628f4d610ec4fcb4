//! An in-memory device directory loaded from a JSON registry file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shadow_core::auth::DeviceClaims;
use shadow_core::directory::{Device, DeviceDirectory};
use shadow_core::AppError;

/// The interval at which the registry file is checked for changes.
const RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// A device entry of the registry file.
#[derive(Deserialize)]
struct DeviceEntry {
    #[serde(flatten)]
    device: Device,
    /// The base64 encoded credential fingerprint of the device.
    fingerprint: String,
}

#[derive(Default)]
struct Registry {
    by_fingerprint: HashMap<Vec<u8>, Arc<Device>>,
    by_id: HashMap<String, Arc<Device>>,
}

/// A device directory holding its whole registry in memory.
///
/// The registry may be swapped out at runtime without blocking lookups.
pub struct StaticDirectory {
    registry: ArcSwap<Registry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey<'static>,
}

impl StaticDirectory {
    /// Create a new instance holding the given devices & their fingerprints.
    pub fn new(hmac_key: &[u8], devices: Vec<(Device, Vec<u8>)>) -> Self {
        Self {
            registry: ArcSwap::from_pointee(Registry::build(devices)),
            encoding_key: EncodingKey::from_secret(hmac_key),
            decoding_key: DecodingKey::from_secret(hmac_key).into_static(),
        }
    }

    /// Create a new instance from the registry file at the given path.
    pub async fn from_file(hmac_key: &[u8], path: &str) -> Result<Self> {
        let devices = load_file(path).await?;
        Ok(Self::new(hmac_key, devices))
    }

    /// Replace the full registry.
    pub fn replace(&self, devices: Vec<(Device, Vec<u8>)>) {
        let registry = Registry::build(devices);
        tracing::debug!(len = registry.by_id.len(), "device registry replaced");
        self.registry.store(Arc::new(registry));
    }

    /// Spawn a task reloading the registry whenever the file at the given path changes.
    pub fn spawn_reloader(self: Arc<Self>, path: String, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_modified = modified_at(&path).await;
            let mut interval = tokio::time::interval(RELOAD_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => (),
                    _ = shutdown.recv() => break,
                }
                let modified = modified_at(&path).await;
                if modified.is_none() || modified == last_modified {
                    continue;
                }
                match load_file(&path).await {
                    Ok(devices) => {
                        self.replace(devices);
                        last_modified = modified;
                    }
                    Err(err) => tracing::error!(error = ?err, %path, "error reloading device registry"),
                }
            }
        })
    }

    fn issue_token(&self, device: &Device) -> Result<String> {
        DeviceClaims::new(&device.id)
            .encode(&self.encoding_key)
            .map_err(|err| AppError::Ise(anyhow::anyhow!("error encoding device token: {}", err)).into())
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn get_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Device> {
        let registry = self.registry.load();
        let found = registry.by_fingerprint.get(fingerprint).ok_or(AppError::ResourceNotFound)?;
        let mut device = found.as_ref().clone();
        device.token = self.issue_token(&device)?;
        Ok(device)
    }

    async fn get_by_token(&self, token: &str) -> Result<Device> {
        let claims = DeviceClaims::decode(token, &self.decoding_key).map_err(|_| AppError::UnknownToken)?;
        let registry = self.registry.load();
        let found = registry.by_id.get(&claims.sub).ok_or(AppError::UnknownToken)?;
        let mut device = found.as_ref().clone();
        device.token = token.to_string();
        Ok(device)
    }
}

impl Registry {
    fn build(devices: Vec<(Device, Vec<u8>)>) -> Self {
        devices.into_iter().fold(Self::default(), |mut acc, (device, fingerprint)| {
            let device = Arc::new(device);
            acc.by_id.insert(device.id.clone(), device.clone());
            acc.by_fingerprint.insert(fingerprint, device);
            acc
        })
    }
}

/// Read and decode the registry file at the given path.
async fn load_file(path: &str) -> Result<Vec<(Device, Vec<u8>)>> {
    let raw = tokio::fs::read(path).await.with_context(|| format!("error reading device registry {}", path))?;
    let entries: Vec<DeviceEntry> = serde_json::from_slice(&raw).context("error decoding device registry")?;
    entries
        .into_iter()
        .map(|entry| {
            let fingerprint = base64::decode(&entry.fingerprint).with_context(|| format!("invalid fingerprint of device {}", entry.device.id))?;
            Ok((entry.device, fingerprint))
        })
        .collect()
}

async fn modified_at(path: &str) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}
