//! MQTT device connectivity.
//!
//! A device connection is authenticated from its Connect packet, either by the basic credentials
//! it carries or by the fingerprint of the peer certificate of its transport, and then driven by a
//! `Session` until either side closes it.

pub mod codec;
#[cfg(test)]
mod codec_test;
mod session;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use shadow_core::auth::BasicCredentials;
use shadow_core::directory::{get_by_fingerprint_and_verify, Device, DeviceDirectory};
use shadow_core::AppError;

use crate::mqtt::codec::ConnectPacket;
pub use session::{Session, SessionContext};

const METRIC_BASIC_AUTH_FAILED: &str = "mqtt_bridge_basic_auth_device_auth_failed_total";
const METRIC_TLS_AUTH_FAILED: &str = "mqtt_bridge_tls_bad_certificate_total";

/// A method of resolving the device behind a new connection.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve the device presenting the given Connect packet.
    ///
    /// Any error means the connection must be closed. The error is for logging only and must never
    /// be written back to the client.
    async fn authenticate(&self, directory: &dyn DeviceDirectory, connect: &ConnectPacket) -> Result<Device>;
}

/// Authentication by the username & password of the Connect packet.
///
/// The password is the base64 encoded credential fingerprint of the device, and the username must
/// be the title or the ID of the device owning it. The device must be enabled for basic auth.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicAuthenticator;

impl BasicAuthenticator {
    pub fn new() -> Self {
        metrics::register_counter!(
            METRIC_BASIC_AUTH_FAILED,
            metrics::Unit::Count,
            "the number of basic auth connections closed because the device is unknown, disabled or otherwise not allowed to connect"
        );
        Self
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, directory: &dyn DeviceDirectory, connect: &ConnectPacket) -> Result<Device> {
        let res: Result<Device> = async {
            let creds = BasicCredentials::from_connect(connect.username.as_deref(), connect.password.as_deref())?;
            let fingerprint = creds.fingerprint()?;
            get_by_fingerprint_and_verify(directory, &fingerprint, |device| {
                if device.title != creds.username() && device.id != creds.username() {
                    tracing::warn!(device = %device.id, username = creds.username(), "basic auth username does not match the device");
                    false
                } else if !device.basic_enabled {
                    tracing::warn!(device = %device.id, "device is not enabled for basic auth");
                    false
                } else if !device.enabled {
                    tracing::warn!(device = %device.id, "device is not enabled");
                    false
                } else {
                    true
                }
            })
            .await
        }
        .await;
        if res.is_err() {
            metrics::increment_counter!(METRIC_BASIC_AUTH_FAILED);
        }
        res
    }
}

/// Authentication by the peer certificate of the connection's transport.
///
/// The fingerprint of a certificate is the SHA-256 digest of its raw bytes.
#[derive(Clone, Debug)]
pub struct CertificateAuthenticator {
    fingerprint: Option<Vec<u8>>,
}

impl CertificateAuthenticator {
    /// Create an instance for a connection which presented the given raw peer certificate.
    pub fn new(peer_certificate: Option<&[u8]>) -> Self {
        metrics::register_counter!(
            METRIC_TLS_AUTH_FAILED,
            metrics::Unit::Count,
            "the number of connections closed because the certificate is absent, bad or its device is not allowed to connect"
        );
        Self {
            fingerprint: peer_certificate.map(certificate_fingerprint),
        }
    }
}

#[async_trait]
impl Authenticator for CertificateAuthenticator {
    async fn authenticate(&self, directory: &dyn DeviceDirectory, _connect: &ConnectPacket) -> Result<Device> {
        let res: Result<Device> = async {
            let fingerprint = self
                .fingerprint
                .as_ref()
                .ok_or_else(|| AppError::InvalidCredentials("no peer certificate given".into()))?;
            get_by_fingerprint_and_verify(directory, fingerprint, |device| {
                if !device.enabled {
                    tracing::warn!(device = %device.id, "device is not enabled");
                }
                device.enabled
            })
            .await
        }
        .await;
        if res.is_err() {
            metrics::increment_counter!(METRIC_TLS_AUTH_FAILED);
        }
        res
    }
}

/// The credential fingerprint of a raw certificate.
pub fn certificate_fingerprint(cert: &[u8]) -> Vec<u8> {
    Sha256::digest(cert).to_vec()
}

/// Serve a connection whose transport presented the given peer certificate, such as an accepted
/// TLS stream. The device is resolved from the certificate alone.
pub async fn handle_certificate_connection<S>(ctx: SessionContext, stream: S, peer_certificate: Option<&[u8]>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let auth = CertificateAuthenticator::new(peer_certificate);
    Session::handle(ctx, stream, &auth).await
}
