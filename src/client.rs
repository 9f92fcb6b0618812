//! One request/response exchange per call, each on a fresh connection.

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::ClientOptions;
use crate::error::{Error, Phase, ProtocolError, Result};

/// A remote listener address plus the options used for every call.
#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
    options: ClientOptions,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Send `payload`, return the response payload.
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes> {
        request(&self.host, self.port, payload, &self.options).await
    }
}

/// Open a connection to `host:port`, send one frame, read one frame, close.
///
/// A payload larger than `options.max_payload_bytes` is refused before any
/// connection is made.
pub async fn request(
    host: &str,
    port: u16,
    payload: &[u8],
    options: &ClientOptions,
) -> Result<Bytes> {
    if payload.len() > options.max_payload_bytes {
        return Err(ProtocolError::MalformedLength {
            declared: payload.len() as u64,
            max: options.max_payload_bytes as u64,
        }
        .into());
    }

    let mut stream = connect(host, port, options).await?;
    let codec = options.codec();

    codec.write_frame(&mut stream, payload).await?;
    trace!(host, port, len = payload.len(), "Request sent");

    let response = codec.read_frame(&mut stream).await?;
    trace!(host, port, len = response.len(), "Response received");

    // Dropping the stream closes the connection.
    Ok(response)
}

async fn connect(host: &str, port: u16, options: &ClientOptions) -> Result<TcpStream> {
    let stream = match options.connect_timeout {
        Some(after) => tokio::time::timeout(after, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout {
                phase: Phase::Connect,
                after,
            })??,
        None => TcpStream::connect((host, port)).await?,
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_oversized_request_refused_locally() {
        // Nothing listens on port 9; the size check must fire first.
        let options = ClientOptions::default().with_max_payload_bytes(4);
        let err = request("127.0.0.1", 9, b"too long", &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedLength {
                declared: 8,
                max: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let options = ClientOptions::default().with_connect_timeout(Duration::from_secs(5));
        let err = request("127.0.0.1", port, b"hi", &options).await.unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
    }

    #[test]
    fn test_client_keeps_options() {
        let client = Client::new("localhost", 55555)
            .with_options(ClientOptions::default().with_io_timeout(Duration::from_secs(1)));
        assert_eq!(client.options().io_timeout, Some(Duration::from_secs(1)));
    }
}
