use std::fmt::{Debug, Display};

pub use prost_types::Any;
use thiserror::Error;

/// The closed set of outcomes a call can terminate with.
///
/// Values and names follow the gRPC status codes so that they stay meaningful
/// to peers written against other runtimes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// The terminal outcome of a call: a [`Code`] plus a human readable description.
///
/// This is the only error type that crosses the boundary between a service
/// and its callers.
#[derive(Clone, PartialEq, prost::Message, Error)]
#[error("Error code {}: {message}", code_to_str(*.code))]
pub struct Status {
    /// The status code, which should be an enum value of `Code`.
    #[prost(enumeration = "Code", tag = "1")]
    pub code: i32,

    /// A developer-facing description of the outcome.
    #[prost(string, tag = "2")]
    pub message: String,

    /// Optional structured details.
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

macro_rules! constructor {
    ($method:ident, $variant:ident) => {
        pub fn $method(message: impl Into<String>) -> Self {
            Self::new(Code::$variant, message)
        }
    };
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            details: vec![],
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    constructor! {cancelled, Cancelled}
    constructor! {unknown, Unknown}
    constructor! {invalid_argument, InvalidArgument}
    constructor! {deadline_exceeded, DeadlineExceeded}
    constructor! {not_found, NotFound}
    constructor! {already_exists, AlreadyExists}
    constructor! {permission_denied, PermissionDenied}
    constructor! {unauthenticated, Unauthenticated}
    constructor! {resource_exhausted, ResourceExhausted}
    constructor! {failed_precondition, FailedPrecondition}
    constructor! {aborted, Aborted}
    constructor! {out_of_range, OutOfRange}
    constructor! {unimplemented, Unimplemented}
    constructor! {internal, Internal}
    constructor! {unavailable, Unavailable}
    constructor! {data_loss, DataLoss}

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok as i32
    }

    /// Only transport level failures are safe to retry blindly.
    pub fn is_retryable(&self) -> bool {
        self.code == Code::Unavailable as i32
    }

    /// Wraps a failure that carries no status of its own.
    ///
    /// The error is logged locally and replaced by a generic `Internal` status
    /// so that no implementation detail reaches the remote peer.
    pub fn from_error(err: impl Display) -> Self {
        log::error!("Internal error: {err}");
        Self::internal_error()
    }

    pub(crate) fn internal_error() -> Self {
        Self::internal("Internal error")
    }

    pub(crate) fn stream_cancelled() -> Self {
        Self::cancelled("Stream was cancelled")
    }

    pub(crate) fn client_closed() -> Self {
        Self::cancelled("Client was closed")
    }

    pub(crate) fn server_shutdown() -> Self {
        Self::cancelled("Server is shutting down")
    }

    pub(crate) fn peer_cancelled() -> Self {
        Self::cancelled("Call was cancelled by the peer")
    }

    pub(crate) fn caller_gone() -> Self {
        Self::cancelled("Call was abandoned by the caller")
    }

    pub(crate) fn connection_lost() -> Self {
        Self::cancelled("Connection lost")
    }

    pub(crate) fn connection_closed() -> Self {
        Self::unavailable("Connection closed")
    }

    pub(crate) fn timeout() -> Self {
        Self::deadline_exceeded("Deadline exceeded")
    }

    pub(crate) fn wait_timeout(waited: std::time::Duration) -> Self {
        Self::deadline_exceeded(format!("Timed out after {waited:?} waiting for reply"))
    }

    pub(crate) fn demand_exceeded() -> Self {
        Self::internal("Producer exceeded the granted demand")
    }

    pub(crate) fn out_of_stream_ids() -> Self {
        Self::resource_exhausted("Ran out of stream ids")
    }

    pub(crate) fn stream_in_use(stream_id: u32) -> Self {
        Self::unavailable(format!("Stream id `{stream_id}` is still in use"))
    }

    pub(crate) fn invalid_stream_id(stream_id: u32) -> Self {
        Self::invalid_argument(format!("Stream id must be odd, found `{stream_id}`"))
    }

    pub(crate) fn invalid_request_flags(expected: impl Debug, found: impl Debug) -> Self {
        Self::invalid_argument(format!(
            "Invalid request flags: expected {expected:?}, found {found:?}"
        ))
    }

    pub(crate) fn method_not_found(service: impl Display, method: impl Display) -> Self {
        Self::unimplemented(format!("/{service}/{method} is not supported"))
    }

    #[allow(clippy::needless_pass_by_value)]
    pub(crate) fn failed_to_decode(err: impl Display) -> Self {
        Self::invalid_argument(format!("Error decoding message: {err}"))
    }

    #[allow(clippy::needless_pass_by_value)]
    pub(crate) fn send_error(err: impl Display) -> Self {
        Self::unavailable(format!("Error sending message: {err}"))
    }

    pub(crate) fn unexpected_message(stream_id: u32, what: impl Display) -> Self {
        Self::invalid_argument(format!("Unexpected {what} on stream `{stream_id}`"))
    }
}

pub trait StatusExt {
    type Output;
    fn or_status(self, code: Code) -> Result<Self::Output, Status>;
}

impl<T, E: ToString> StatusExt for Result<T, E> {
    type Output = T;
    fn or_status(self, code: Code) -> Result<Self::Output, Status> {
        self.map_err(|err| Status::new(code, err.to_string()))
    }
}

impl From<std::io::Error> for Status {
    fn from(error: std::io::Error) -> Self {
        Status::from_error(error)
    }
}

#[cfg(feature = "anyhow")]
impl From<anyhow::Error> for Status {
    fn from(error: anyhow::Error) -> Self {
        Status::from_error(format!("{error:#}"))
    }
}

fn code_to_str(code: i32) -> &'static str {
    let Ok(code) = Code::try_from(code) else {
        return "<None>";
    };
    code.as_str_name()
}
