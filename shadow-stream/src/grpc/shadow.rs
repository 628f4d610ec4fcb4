///////////////////////////////////////////////////////////////////////////////
// Components /////////////////////////////////////////////////////////////////

/// A versioned JSON state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShadowState {
    /// The version of this state, incremented on every stored change.
    #[prost(uint64, tag = "1")]
    pub version: u64,
    /// The JSON encoded state document.
    #[prost(string, tag = "2")]
    pub data: ::prost::alloc::string::String,
    /// The unix timestamp in milliseconds of the last change.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}
/// The connection state of a device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShadowConnection {
    #[prost(bool, tag = "1")]
    pub connected: bool,
    #[prost(string, tag = "2")]
    pub client_id: ::prost::alloc::string::String,
    /// The unix timestamp in milliseconds of the last connect or disconnect.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}
/// The shadow of a single device, absent states being unset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShadowDocument {
    #[prost(string, tag = "1")]
    pub device: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub reported: ::core::option::Option<ShadowState>,
    #[prost(message, optional, tag = "3")]
    pub desired: ::core::option::Option<ShadowState>,
    #[prost(message, optional, tag = "4")]
    pub connection: ::core::option::Option<ShadowConnection>,
}
///////////////////////////////////////////////////////////////////////////////
// Requests ///////////////////////////////////////////////////////////////////

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(string, repeated, tag = "1")]
    pub devices: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetResponse {
    #[prost(message, repeated, tag = "1")]
    pub shadows: ::prost::alloc::vec::Vec<ShadowDocument>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PatchRequest {
    /// The device & the partial states to merge. Versions & timestamps are ignored.
    #[prost(message, optional, tag = "1")]
    pub shadow: ::core::option::Option<ShadowDocument>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRequest {
    #[prost(string, tag = "1")]
    pub device: ::prost::alloc::string::String,
    #[prost(enumeration = "StateKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamShadowRequest {
    #[prost(string, repeated, tag = "1")]
    pub devices: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Send the current shadow of every device before any change.
    #[prost(bool, tag = "2")]
    pub sync: bool,
}
/// The kinds of state held by a shadow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StateKind {
    Reported = 0,
    Desired = 1,
    Connection = 2,
}
#[doc = r" Generated server implementations."]
pub mod shadows_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with ShadowsServer."]
    #[async_trait]
    pub trait Shadows: Send + Sync + 'static {
        #[doc = " Fetch the shadows of a pool of devices."]
        async fn get(&self, request: tonic::Request<super::GetRequest>) -> Result<tonic::Response<super::GetResponse>, tonic::Status>;
        #[doc = " Merge reported and/or desired state into the shadow of a device."]
        async fn patch(&self, request: tonic::Request<super::PatchRequest>) -> Result<tonic::Response<super::ShadowDocument>, tonic::Status>;
        #[doc = " Remove a top-level key from the reported or desired state of a device."]
        async fn remove(&self, request: tonic::Request<super::RemoveRequest>) -> Result<tonic::Response<super::ShadowDocument>, tonic::Status>;
        #[doc = "Server streaming response type for the StreamShadow method."]
        type StreamShadowStream: futures_core::Stream<Item = Result<super::ShadowDocument, tonic::Status>> + Send + 'static;
        #[doc = " Stream the shadows of a set of devices as they change."]
        async fn stream_shadow(&self, request: tonic::Request<super::StreamShadowRequest>) -> Result<tonic::Response<Self::StreamShadowStream>, tonic::Status>;
    }
    #[doc = " The device shadow interface."]
    #[derive(Debug)]
    pub struct ShadowsServer<T: Shadows> {
        inner: _Inner<T>,
        accept_compression_encodings: (),
        send_compression_encodings: (),
    }
    struct _Inner<T>(Arc<T>);
    impl<T: Shadows> ShadowsServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner);
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
            }
        }
        pub fn with_interceptor<F>(inner: T, interceptor: F) -> InterceptedService<Self, F>
        where
            F: tonic::service::Interceptor,
        {
            InterceptedService::new(Self::new(inner), interceptor)
        }
    }
    impl<T, B> tonic::codegen::Service<http::Request<B>> for ShadowsServer<T>
    where
        T: Shadows,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/shadow.Shadows/Get" => {
                    #[allow(non_camel_case_types)]
                    struct GetSvc<T: Shadows>(pub Arc<T>);
                    impl<T: Shadows> tonic::server::UnaryService<super::GetRequest> for GetSvc<T> {
                        type Response = super::GetResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<super::GetRequest>) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).get(request).await };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = GetSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec).apply_compression_config(accept_compression_encodings, send_compression_encodings);
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/shadow.Shadows/Patch" => {
                    #[allow(non_camel_case_types)]
                    struct PatchSvc<T: Shadows>(pub Arc<T>);
                    impl<T: Shadows> tonic::server::UnaryService<super::PatchRequest> for PatchSvc<T> {
                        type Response = super::ShadowDocument;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<super::PatchRequest>) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).patch(request).await };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = PatchSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec).apply_compression_config(accept_compression_encodings, send_compression_encodings);
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/shadow.Shadows/Remove" => {
                    #[allow(non_camel_case_types)]
                    struct RemoveSvc<T: Shadows>(pub Arc<T>);
                    impl<T: Shadows> tonic::server::UnaryService<super::RemoveRequest> for RemoveSvc<T> {
                        type Response = super::ShadowDocument;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<super::RemoveRequest>) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).remove(request).await };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = RemoveSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec).apply_compression_config(accept_compression_encodings, send_compression_encodings);
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/shadow.Shadows/StreamShadow" => {
                    #[allow(non_camel_case_types)]
                    struct StreamShadowSvc<T: Shadows>(pub Arc<T>);
                    impl<T: Shadows> tonic::server::ServerStreamingService<super::StreamShadowRequest> for StreamShadowSvc<T> {
                        type Response = super::ShadowDocument;
                        type ResponseStream = T::StreamShadowStream;
                        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<super::StreamShadowRequest>) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).stream_shadow(request).await };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = StreamShadowSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec).apply_compression_config(accept_compression_encodings, send_compression_encodings);
                        let res = grpc.server_streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: Shadows> Clone for ShadowsServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
            }
        }
    }
    impl<T: Shadows> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: Shadows> tonic::transport::NamedService for ShadowsServer<T> {
        const NAME: &'static str = "shadow.Shadows";
    }
}
