//! Synchronous wrappers that own a tokio runtime.
//!
//! These must not be called from inside an async context; use
//! [`crate::server`] and [`crate::client`] there instead.

use std::future::Future;

use bytes::Bytes;
use tokio::runtime::{Builder, Runtime};

use crate::client;
use crate::config::{ClientOptions, ServerOptions};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::server;

/// Serve on `host:port` until a fatal accept error. Blocks the thread.
pub fn listen<H: Handler>(host: &str, port: u16, handler: H, options: ServerOptions) -> Result<()> {
    multi_thread()?.block_on(server::listen(host, port, handler, options))
}

/// Serve on `host:port` until `shutdown` completes. Blocks the thread.
pub fn listen_until<H, F>(
    host: &str,
    port: u16,
    handler: H,
    options: ServerOptions,
    shutdown: F,
) -> Result<()>
where
    H: Handler,
    F: Future<Output = ()>,
{
    multi_thread()?.block_on(server::listen_until(host, port, handler, options, shutdown))
}

/// One exchange against `host:port`. Blocks the thread.
pub fn request(host: &str, port: u16, payload: &[u8], options: &ClientOptions) -> Result<Bytes> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?
        .block_on(client::request(host, port, payload, options))
}

fn multi_thread() -> Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)
}
