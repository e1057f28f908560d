use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sling::stream::{Consumer, ReplyStream};
use sling::{Call, Client, ClientConfig, ClientStreaming, DuplexStreaming, Result};
use sling::{ServerStreaming, Service, Unary};

pub const SERVICE_NAME: &str = "helloworld.GreeterService";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { name }
    }
}

pub trait Greeter: Send + Sync + 'static {
    fn say_hello(&self, request: HelloRequest) -> impl Future<Output = Result<HelloReply>> + Send;

    fn it_keeps_talking(
        &self,
        requests: Consumer<HelloRequest>,
    ) -> impl Future<Output = Result<HelloReply>> + Send;

    fn it_keeps_replying(&self, request: HelloRequest) -> ReplyStream<HelloReply>;

    fn stream_hellos(&self, requests: Consumer<HelloRequest>) -> ReplyStream<HelloReply>;

    /// Registers every method under [`SERVICE_NAME`].
    fn into_service(self) -> Service
    where
        Self: Sized,
    {
        let greeter = Arc::new(self);
        let (g1, g2, g3, g4) = (
            greeter.clone(),
            greeter.clone(),
            greeter.clone(),
            greeter,
        );

        Service::new(SERVICE_NAME)
            .unary("SayHello", move |req: HelloRequest| {
                let greeter = g1.clone();
                async move { greeter.say_hello(req).await }
            })
            .client_streaming("ItKeepsTalking", move |reqs: Consumer<HelloRequest>| {
                let greeter = g2.clone();
                async move { greeter.it_keeps_talking(reqs).await }
            })
            .server_streaming("ItKeepsReplying", move |req: HelloRequest| {
                g3.it_keeps_replying(req)
            })
            .duplex_streaming("StreamHellos", move |reqs: Consumer<HelloRequest>| {
                g4.stream_hellos(reqs)
            })
    }
}

/// Typed calls to a remote [`Greeter`].
#[derive(Clone)]
pub struct GreeterClient {
    client: Client,
}

impl GreeterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn say_hello(&self) -> Call<Unary, HelloRequest, HelloReply> {
        self.client.unary(SERVICE_NAME, "SayHello")
    }

    pub fn it_keeps_talking(&self) -> Call<ClientStreaming, HelloRequest, HelloReply> {
        self.client.client_streaming(SERVICE_NAME, "ItKeepsTalking")
    }

    pub fn it_keeps_replying(&self) -> Call<ServerStreaming, HelloRequest, HelloReply> {
        self.client.server_streaming(SERVICE_NAME, "ItKeepsReplying")
    }

    pub fn stream_hellos(&self) -> Call<DuplexStreaming, HelloRequest, HelloReply> {
        self.client.duplex_streaming(SERVICE_NAME, "StreamHellos")
    }

    pub fn close(&self) {
        self.client.close();
    }
}

impl Deref for GreeterClient {
    type Target = ClientConfig;
    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for GreeterClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}
