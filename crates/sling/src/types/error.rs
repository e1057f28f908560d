use std::borrow::Cow;
use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid input: {0}")]
pub struct InvalidInput(pub Cow<'static, str>);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Oversized payload: {0} bytes > {max} bytes", max = super::frame::MAX_DATA_LENGTH)]
    Oversized(usize),

    #[error("Wrong message type: expected {expected:?}, found {found:?}")]
    WrongType {
        expected: super::MessageType,
        found: super::MessageType,
    },

    #[error("Invalid protobuf stream: {0}")]
    InvalidProtobufStream(#[from] prost::DecodeError),
}

impl<T: Into<Cow<'static, str>>> From<T> for InvalidInput {
    fn from(msg: T) -> Self {
        Self(msg.into())
    }
}

impl From<InvalidInput> for IoError {
    fn from(value: InvalidInput) -> Self {
        IoError::new(IoErrorKind::InvalidInput, value)
    }
}
