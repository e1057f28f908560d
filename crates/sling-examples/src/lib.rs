//! The greeter service, served and called through sling.

pub mod greeter;
pub mod helloworld;

pub use greeter::GreeterServiceImpl;
pub use helloworld::{Greeter, GreeterClient, HelloReply, HelloRequest};
