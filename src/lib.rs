//! # tcpserv
//!
//! Helpers for stateless request/response services over TCP.
//!
//! Every exchange uses its own connection: the client sends one
//! length-prefixed frame, the listener hands the payload to a handler and
//! writes the result back as one frame, then the connection is closed.
//!
//! ## Example
//!
//! ```no_run
//! use tcpserv::{handler::builtin, ClientOptions, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> tcpserv::Result<()> {
//!     let server = tcpserv::Server::bind("localhost", 55555, builtin::reverse, ServerOptions::default()).await?;
//!     tokio::spawn(server.run());
//!
//!     let response = tcpserv::request("localhost", 55555, b"hello", &ClientOptions::default()).await?;
//!     assert_eq!(response, "olleh");
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod server;

pub use client::{request, Client};
pub use config::{ClientOptions, HandlerErrorPolicy, ServerOptions, ShutdownPolicy};
pub use error::{Error, HandlerError, ProtocolError, Result};
pub use frame::{encode_frame, FrameCodec, LengthPrefix};
pub use handler::Handler;
pub use server::{listen, listen_until, Server};
