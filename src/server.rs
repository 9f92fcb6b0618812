//! TCP listener serving one request/response exchange per connection.
//!
//! Each accepted connection gets its own task which reads one frame,
//! hands the payload to the handler on the blocking pool, writes the
//! handler's result back as one frame and closes. Failures stay inside
//! that task; only a fatal accept error ends the accept loop.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::{HandlerErrorPolicy, ServerOptions, ShutdownPolicy};
use crate::error::{Error, HandlerError, Result};
use crate::frame::FrameCodec;
use crate::handler::Handler;

/// Back-off after the process ran out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one served connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Reading,
    Handling,
    Writing,
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Accepted, Reading)
                | (Accepted, Closed)
                | (Reading, Handling)
                | (Reading, Closed)
                | (Handling, Writing)
                | (Handling, Closed)
                | (Writing, Closed)
        )
    }
}

/// One accepted connection, owned by the task driving it.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    fn transition(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Shared, read-only context handed to every connection task.
struct Service {
    handler: Arc<dyn Handler>,
    codec: FrameCodec,
    on_handler_error: HandlerErrorPolicy,
}

/// A bound listener, ready to serve.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    service: Arc<Service>,
    options: ServerOptions,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind `host:port`. Bind failures surface here, before serving starts.
    pub async fn bind<H: Handler>(
        host: &str,
        port: u16,
        handler: H,
        options: ServerOptions,
    ) -> Result<Self> {
        if options.max_connections == 0 {
            return Err(Error::Bind {
                addr: format!("{host}:{port}"),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "max_connections must be at least 1",
                ),
            });
        }
        let listener = bind_listener(host, port, options.backlog).await?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
        info!(address = %local_addr, "Server listening");

        let service = Arc::new(Service {
            handler: Arc::new(handler),
            codec: options.codec(),
            on_handler_error: options.on_handler_error.clone(),
        });

        Ok(Server {
            listener,
            local_addr,
            service,
            connection_limit: Arc::new(Semaphore::new(options.max_connections)),
            options,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until a fatal accept error.
    pub async fn run(self) -> Result<()> {
        self.run_until(future::pending()).await
    }

    /// Serve until `shutdown` completes or a fatal accept error occurs.
    ///
    /// On shutdown the listening socket is closed first, so no new
    /// connection is accepted; in-flight connections are then drained or
    /// aborted per `ServerOptions::shutdown`.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            local_addr,
            service,
            options,
            connection_limit,
        } = self;
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(address = %local_addr, "Shutdown requested, no longer accepting");
                    break Ok(());
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }

                accepted = accept_with_permit(&listener, &connection_limit) => {
                    match accepted {
                        Ok(Some((stream, peer, permit))) => {
                            debug!(peer = %peer, "New connection");
                            let service = Arc::clone(&service);
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(Connection::new(stream, peer), &service).await {
                                    match &e {
                                        Error::Protocol(_) => warn!(peer = %peer, error = %e, "Protocol error"),
                                        Error::Handler(_) => warn!(peer = %peer, error = %e, "Handler failed"),
                                        _ => debug!(peer = %peer, error = %e, "Connection error"),
                                    }
                                }
                                debug!(peer = %peer, "Connection closed");
                                drop(permit);
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            break Err(Error::Connection(e));
                        }
                    }
                }
            }
        };

        drop(listener);
        finish_in_flight(tasks, options.shutdown, options.shutdown_grace).await;
        outcome
    }
}

/// Bind `host:port` and serve until a fatal accept error.
pub async fn listen<H: Handler>(
    host: &str,
    port: u16,
    handler: H,
    options: ServerOptions,
) -> Result<()> {
    Server::bind(host, port, handler, options).await?.run().await
}

/// Bind `host:port` and serve until `shutdown` completes.
pub async fn listen_until<H, F>(
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
    Server::bind(host, port, handler, options)
        .await?
        .run_until(shutdown)
        .await
}

/// Wait for a connection slot, then accept.
///
/// `Ok(None)` means a transient failure that only concerns the connection
/// being accepted; the loop keeps going.
async fn accept_with_permit(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> io::Result<Option<(TcpStream, SocketAddr, tokio::sync::OwnedSemaphorePermit)>> {
    let permit = match Arc::clone(limit).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(io::Error::other("connection limit closed")),
    };

    match listener.accept().await {
        Ok((stream, peer)) => Ok(Some((stream, peer, permit))),
        Err(e) if is_transient_accept_error(&e) => {
            debug!(error = %e, "Transient accept failure");
            Ok(None)
        }
        Err(e) if is_fd_exhaustion(&e) => {
            warn!(error = %e, "Out of file descriptors, backing off");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

async fn finish_in_flight(mut tasks: JoinSet<()>, policy: ShutdownPolicy, grace: Option<Duration>) {
    if tasks.is_empty() {
        return;
    }
    let in_flight = tasks.len();
    match policy {
        ShutdownPolicy::Abort => {
            info!(in_flight, "Aborting in-flight connections");
            tasks.shutdown().await;
        }
        ShutdownPolicy::Drain => {
            info!(in_flight, ?grace, "Draining in-flight connections");
            let drain = async { while tasks.join_next().await.is_some() {} };
            match grace {
                Some(grace) => {
                    if tokio::time::timeout(grace, drain).await.is_err() {
                        warn!(remaining = tasks.len(), "Grace period elapsed, aborting");
                        tasks.shutdown().await;
                    }
                }
                None => drain.await,
            }
        }
    }
}

/// Bind with socket2 so the backlog is honoured. Every resolved address is
/// tried in order.
async fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let bind_err = |source| Error::Bind {
        addr: format!("{host}:{port}"),
        source,
    };

    let addrs = tokio::net::lookup_host((host, port)).await.map_err(bind_err)?;
    let mut last_err = None;
    for addr in addrs {
        match create_listener(addr, backlog) {
            Ok(std_listener) => return TcpListener::from_std(std_listener).map_err(bind_err),
            Err(e) => {
                debug!(address = %addr, error = %e, "Bind attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(bind_err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "host resolved to no addresses")
    })))
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Drive one exchange: read, handle, write, close.
async fn handle_connection(mut conn: Connection, service: &Service) -> Result<()> {
    let result = exchange(&mut conn, service).await;
    conn.transition(ConnState::Closed);
    result
}

async fn exchange(conn: &mut Connection, service: &Service) -> Result<()> {
    if let Err(e) = conn.stream.set_nodelay(true) {
        trace!(peer = %conn.peer, error = %e, "Failed to set TCP_NODELAY");
    }

    conn.transition(ConnState::Reading);
    let request = service.codec.read_frame(&mut conn.stream).await?;
    trace!(peer = %conn.peer, len = request.len(), "Request received");

    conn.transition(ConnState::Handling);
    let response = match invoke(Arc::clone(&service.handler), request).await {
        Ok(response) => response,
        Err(e) => match &service.on_handler_error {
            HandlerErrorPolicy::Close => return Err(e.into()),
            HandlerErrorPolicy::Respond(marker) => {
                warn!(peer = %conn.peer, error = %e, "Handler failed, sending error response");
                marker.clone()
            }
        },
    };

    conn.transition(ConnState::Writing);
    service.codec.write_frame(&mut conn.stream, &response).await?;
    trace!(peer = %conn.peer, len = response.len(), "Response sent");

    // Orderly FIN so the client sees end-of-stream right after the frame.
    conn.stream.shutdown().await?;
    Ok(())
}

/// Run the handler on the blocking pool; a panic becomes a `HandlerError`.
async fn invoke(handler: Arc<dyn Handler>, request: Bytes) -> std::result::Result<Bytes, HandlerError> {
    match tokio::task::spawn_blocking(move || handler.handle(request)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::new("handler panicked")),
        Err(e) => Err(HandlerError::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::builtin;

    #[test]
    fn test_conn_state_transitions() {
        use ConnState::*;
        assert!(Accepted.can_transition_to(Reading));
        assert!(Reading.can_transition_to(Handling));
        assert!(Handling.can_transition_to(Writing));
        assert!(Writing.can_transition_to(Closed));
        assert!(Reading.can_transition_to(Closed));

        assert!(!Reading.can_transition_to(Writing));
        assert!(!Writing.can_transition_to(Reading));
        assert!(!Closed.can_transition_to(Reading));
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EINVAL)));
    }

    #[tokio::test]
    async fn test_invoke_maps_panic() {
        let err = invoke(
            Arc::new(|_: Bytes| -> Bytes { panic!("boom") }),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "handler panicked");

        let ok = invoke(Arc::new(builtin::reverse), Bytes::from_static(b"ab"))
            .await
            .unwrap();
        assert_eq!(ok, "ba");
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = Server::bind("127.0.0.1", 0, builtin::echo, ServerOptions::default())
            .await
            .unwrap();
        assert!(server.local_addr().port() != 0);
    }

    #[tokio::test]
    async fn test_zero_max_connections_rejected() {
        let options = ServerOptions::default().with_max_connections(0);
        let err = Server::bind("127.0.0.1", 0, builtin::echo, options)
            .await
            .err()
            .unwrap();
        match err {
            Error::Bind { source, .. } => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Server::bind("127.0.0.1", 0, builtin::echo, ServerOptions::default())
            .await
            .unwrap();
        let port = first.local_addr().port();
        // SO_REUSEADDR does not allow two active listeners on one port.
        let err = Server::bind("127.0.0.1", port, builtin::echo, ServerOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
