//! The network servers of the node.

mod mqtt;
#[cfg(test)]
mod mod_test;
mod prom;

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use shadow_core::models::{Shadow, StateKey};

use crate::config::Config;
use crate::error::{AppErrorExt, RpcResult};
use crate::grpc::{GetRequest, GetResponse, PatchRequest, RemoveRequest, ShadowDocument, Shadows, ShadowsServer, StreamShadowRequest};
use crate::shadow::ShadowService;

pub use mqtt::MqttServer;
pub use prom::spawn_prom_server;

/// The shadow API gRPC server.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The shadow service backing every call.
    service: ShadowService,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, service: ShadowService, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, service, shutdown }
    }

    /// Spawn the gRPC server, which triggers a shutdown of the node if it fails.
    pub fn spawn(self) -> JoinHandle<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.grpc_port));
        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());
        let service = ShadowsServer::new(self);
        let fut = Server::builder().add_service(service).serve_with_shutdown(addr, async move {
            let _res = shutdown_rx.recv().await;
        });
        tracing::info!(%addr, "shadow API gRPC server is listening");
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(error = ?err, "error from shadow API gRPC server");
            }
            let _res = shutdown.send(());
        })
    }
}

#[tonic::async_trait]
impl Shadows for AppServer {
    type StreamShadowStream = BoxStream<'static, RpcResult<ShadowDocument>>;

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn get(&self, request: Request<GetRequest>) -> RpcResult<Response<GetResponse>> {
        let shadows = self.service.get(&request.into_inner().devices).await?;
        Ok(Response::new(GetResponse {
            shadows: shadows.into_iter().map(ShadowDocument::from).collect(),
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn patch(&self, request: Request<PatchRequest>) -> RpcResult<Response<ShadowDocument>> {
        let doc = request.into_inner().shadow.ok_or_else(|| Status::invalid_argument("no shadow given"))?;
        let patch = Shadow::try_from(doc).map_err(AppErrorExt::into_status)?;
        let shadow = self.service.patch(patch).await?;
        Ok(Response::new(shadow.into()))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn remove(&self, request: Request<RemoveRequest>) -> RpcResult<Response<ShadowDocument>> {
        let req = request.into_inner();
        let shadow = self.service.remove(&req.device, StateKey::from_wire(req.kind), &req.key).await?;
        Ok(Response::new(shadow.into()))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn stream_shadow(&self, request: Request<StreamShadowRequest>) -> RpcResult<Response<Self::StreamShadowStream>> {
        let req = request.into_inner();
        let stream = self.service.stream_shadow(req.devices, req.sync).await?;
        Ok(Response::new(stream.map(|res| res.map(ShadowDocument::from)).boxed()))
    }
}
