use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;

use tokio::task::futures::TaskLocalFuture;
use tokio::time::Instant;
use uuid::Uuid;

pub mod deadline;
pub mod metadata;

use deadline::Timeout;
use metadata::Metadata;

/// Identifies one call within the process that created its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Everything a call carries besides its messages.
///
/// A context is created when a call starts, on the client when it is invoked
/// and on the server when the request arrives. It is never modified
/// afterwards and is dropped with the call.
#[derive(Clone, Debug)]
pub struct Context {
    pub id: CallId,
    pub metadata: Metadata,
    pub deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Metadata::default(), None)
    }
}

impl Context {
    pub fn new(metadata: Metadata, deadline: Option<Instant>) -> Self {
        let id = CallId::new();
        Self {
            id,
            metadata,
            deadline,
        }
    }

    /// Time left before the deadline, `Timeout::None` without one.
    pub fn timeout(&self) -> Timeout {
        Timeout::until(self.deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

tokio::task_local! {
    static CONTEXT: Arc<Context>;
}

/// The context of the call being handled by the current task.
///
/// # Panics
///
/// Panics when called outside of a service method.
pub fn get_context() -> Arc<Context> {
    CONTEXT.with(Clone::clone)
}

pub fn try_get_context() -> Option<Arc<Context>> {
    CONTEXT.try_with(Clone::clone).ok()
}

pub trait WithContext: Future {
    fn with_context(self, ctx: impl Into<Arc<Context>>) -> TaskLocalFuture<Arc<Context>, Self>
    where
        Self: Sized,
    {
        CONTEXT.scope(ctx.into(), self)
    }
}

impl<F: Future> WithContext for F {}
