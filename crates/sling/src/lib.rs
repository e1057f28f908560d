//! A transport-agnostic RPC runtime.
//!
//! Services register named methods of four shapes (unary, client streaming,
//! server streaming and duplex streaming) with a [`Server`]. A [`Client`]
//! calls them over any bidirectional byte stream. Every stream is driven by
//! consumer demand, across the connection included, so a fast producer never
//! overruns a slow consumer.

mod client;
mod config;
mod context;
mod io;
mod macros;
mod server;
mod service;
mod status;
pub mod stream;
pub mod transport;
mod types;

pub type Result<T, E = Status> = std::result::Result<T, E>;

pub use client::{
    Call, Client, ClientExt, ClientStreaming, DuplexStreaming, PendingReply, ServerStreaming,
    Unary,
};
pub use config::{ClientConfig, ServerConfig};
pub use context::deadline::Timeout;
pub use context::metadata::Metadata;
pub use context::{get_context, try_get_context, CallId, Context};
pub use server::{Server, ServerConnection, ServerHandle};
pub use service::{CallShape, Service};
pub use status::{Any, Code, Status, StatusExt};
pub use types::KeyValue;

#[doc(hidden)]
pub mod prelude {
    pub use std::future::Future;

    pub use futures::stream::Stream;

    pub use crate::stream::{Consumer, ReplyStream};
    pub use crate::{ClientExt as _, Result, StatusExt as _};
}
