//! Options for the listener and the client call.
//!
//! Options are plain values handed to `listen` / `request`; nothing is read
//! from process-wide state, so several listeners and clients can coexist in
//! one process with different settings.

use std::time::Duration;

use bytes::Bytes;

use crate::frame::{FrameCodec, LengthPrefix, DEFAULT_MAX_PAYLOAD_BYTES};

/// Default pending-connection queue depth.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default bound on a single server-side read or write stall.
pub const DEFAULT_SERVER_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on draining in-flight connections at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// What the listener does when the handler fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Close the connection without writing a response.
    #[default]
    Close,
    /// Write the given marker payload as the response, then close.
    Respond(Bytes),
}

/// What happens to in-flight connections once the accept loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Let them finish, bounded by `ServerOptions::shutdown_grace` if set.
    #[default]
    Drain,
    /// Abort them right away.
    Abort,
}

/// Listener configuration. Immutable for the lifetime of a listen call.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_payload_bytes: usize,
    pub length_prefix: LengthPrefix,
    /// Bound on each individual read or write stall. An idle peer holds a
    /// connection slot for at most this long.
    pub io_timeout: Option<Duration>,
    pub backlog: u32,
    pub max_connections: usize,
    pub on_handler_error: HandlerErrorPolicy,
    pub shutdown: ShutdownPolicy,
    /// Upper bound on draining; `None` waits for every connection.
    pub shutdown_grace: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            length_prefix: LengthPrefix::U32,
            io_timeout: Some(DEFAULT_SERVER_IO_TIMEOUT),
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            on_handler_error: HandlerErrorPolicy::Close,
            shutdown: ShutdownPolicy::Drain,
            shutdown_grace: Some(DEFAULT_SHUTDOWN_GRACE),
        }
    }
}

impl ServerOptions {
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    pub fn with_length_prefix(mut self, prefix: LengthPrefix) -> Self {
        self.length_prefix = prefix;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_handler_error_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.on_handler_error = policy;
        self
    }

    pub fn with_shutdown(mut self, policy: ShutdownPolicy, grace: Option<Duration>) -> Self {
        self.shutdown = policy;
        self.shutdown_grace = grace;
        self
    }

    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.length_prefix)
            .with_max_payload_bytes(self.max_payload_bytes)
            .with_io_timeout(self.io_timeout)
    }
}

/// Client call configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_payload_bytes: usize,
    pub length_prefix: LengthPrefix,
    pub connect_timeout: Option<Duration>,
    /// Bound on each individual read or write stall.
    pub io_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            length_prefix: LengthPrefix::U32,
            connect_timeout: None,
            io_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    pub fn with_length_prefix(mut self, prefix: LengthPrefix) -> Self {
        self.length_prefix = prefix;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.length_prefix)
            .with_max_payload_bytes(self.max_payload_bytes)
            .with_io_timeout(self.io_timeout)
    }
}
