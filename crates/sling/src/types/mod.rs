pub mod error;
pub mod flags;
pub mod frame;
pub mod message;

pub use error::InvalidInput;
pub use flags::Flags;
pub use frame::{Frame, StreamFrame};
pub use message::{Cancel, Demand, KeyValue, Message, MessageType, Request, Response};
