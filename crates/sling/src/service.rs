use std::any::Any;
use std::collections::HashMap;
use std::future::{ready, Future};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::{FutureExt as _, Stream, StreamExt as _};

use crate::server::method_handlers::MethodHandler;
use crate::stream::Consumer;
use crate::types::Flags;
use crate::{Result, Status};

/// How many elements travel in each direction of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl CallShape {
    pub fn streams_requests(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::DuplexStreaming)
    }

    pub fn streams_replies(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::DuplexStreaming)
    }

    /// The flags a `Request` frame opening a call of this shape carries.
    pub fn request_flags(self) -> Flags {
        if self.streams_requests() {
            // the requests follow as data frames
            Flags::REMOTE_OPEN | Flags::NO_DATA
        } else {
            // the only request travels within the frame
            Flags::REMOTE_CLOSED
        }
    }
}

pub(crate) struct UnaryMethod<Req, Rep, F> {
    pub method: F,
    _phantom: PhantomData<fn(Req) -> Rep>,
}

pub(crate) struct ClientStreamingMethod<Req, Rep, F> {
    pub method: F,
    _phantom: PhantomData<fn(Req) -> Rep>,
}

pub(crate) struct ServerStreamingMethod<Req, Rep, F> {
    pub method: F,
    _phantom: PhantomData<fn(Req) -> Rep>,
}

pub(crate) struct DuplexStreamingMethod<Req, Rep, F> {
    pub method: F,
    _phantom: PhantomData<fn(Req) -> Rep>,
}

macro_rules! method_wrapper {
    ($name:ident) => {
        impl<Req, Rep, F> $name<Req, Rep, F> {
            fn new(method: F) -> Self {
                Self {
                    method,
                    _phantom: PhantomData,
                }
            }
        }
    };
}

method_wrapper!(UnaryMethod);
method_wrapper!(ClientStreamingMethod);
method_wrapper!(ServerStreamingMethod);
method_wrapper!(DuplexStreamingMethod);

/// A named set of methods a [`Server`](crate::Server) dispatches calls to.
///
/// ```no_run
/// # use sling::{Service, Status};
/// # #[derive(Clone, PartialEq, prost::Message)]
/// # struct Ping { #[prost(string, tag = "1")] text: String }
/// let service = Service::new("ping.Pinger").unary("Ping", |ping: Ping| async move {
///     if ping.text.is_empty() {
///         return Err(Status::invalid_argument("Nothing to echo"));
///     }
///     Ok(ping)
/// });
/// ```
#[derive(Clone)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Service {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> impl '_ + Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn method(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    fn with_method(mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn unary<Req, Rep, F, Fut>(self, name: impl Into<String>, method: F) -> Self
    where
        Req: prost::Message + Default + 'static,
        Rep: prost::Message + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep>> + Send + 'static,
    {
        self.with_method(name, UnaryMethod::new(method))
    }

    #[must_use]
    pub fn client_streaming<Req, Rep, F, Fut>(self, name: impl Into<String>, method: F) -> Self
    where
        Req: prost::Message + Default + 'static,
        Rep: prost::Message + 'static,
        F: Fn(Consumer<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep>> + Send + 'static,
    {
        self.with_method(name, ClientStreamingMethod::new(method))
    }

    #[must_use]
    pub fn server_streaming<Req, Rep, F, S>(self, name: impl Into<String>, method: F) -> Self
    where
        Req: prost::Message + Default + 'static,
        Rep: prost::Message + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Rep>> + Send + 'static,
    {
        self.with_method(name, ServerStreamingMethod::new(method))
    }

    #[must_use]
    pub fn duplex_streaming<Req, Rep, F, S>(self, name: impl Into<String>, method: F) -> Self
    where
        Req: prost::Message + Default + 'static,
        Rep: prost::Message + 'static,
        F: Fn(Consumer<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Rep>> + Send + 'static,
    {
        self.with_method(name, DuplexStreamingMethod::new(method))
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> Status {
    let msg = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<unknown>");
    log::error!("Service method panicked: {msg}");
    Status::internal_error()
}

/// Runs a method returning a future, turning panics into `Internal`.
pub(crate) async fn guard_future<T, Fut>(start: impl FnOnce() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let fut = match catch_unwind(AssertUnwindSafe(start)) {
        Ok(fut) => fut,
        Err(panic) => return Err(panicked(panic)),
    };
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panicked(panic)))
}

/// Runs a method returning a stream, turning panics into `Internal`.
pub(crate) fn guard_stream<T, S>(start: impl FnOnce() -> S) -> impl Stream<Item = Result<T>>
where
    S: Stream<Item = Result<T>>,
{
    match catch_unwind(AssertUnwindSafe(start)) {
        Ok(stream) => AssertUnwindSafe(stream)
            .catch_unwind()
            .map(|item| item.unwrap_or_else(|panic| Err(panicked(panic))))
            .left_stream(),
        Err(panic) => futures::stream::once(ready(Err(panicked(panic)))).right_stream(),
    }
}
