use crate::{Metadata, Timeout};

const DEFAULT_WINDOW: u32 = 16;

/// Defaults applied to every call made through a [`Client`](crate::Client).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub timeout: Timeout,
    pub metadata: Metadata,
    /// Replies requested ahead of consumption on streaming calls.
    pub reply_window: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Timeout::None,
            metadata: Metadata::default(),
            reply_window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Requests fetched ahead of consumption on streaming calls.
    pub request_window: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_window: DEFAULT_WINDOW,
        }
    }
}
