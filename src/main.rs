//! tcpserv: run a stateless request/response listener or make one call.
//!
//! - `tcpserv serve` binds and serves a built-in handler until Ctrl-C
//! - `tcpserv request <PAYLOAD>` sends one request and prints the response

mod cli;

use cli::{Action, BuiltinHandler, Config};
use tcpserv::handler::builtin;
use tcpserv::{ClientOptions, Server, ServerOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.action {
        Action::Serve {
            host,
            port,
            handler,
            options,
        } => serve(&host, port, handler, options).await,
        Action::Request {
            host,
            port,
            payload,
            options,
        } => request(&host, port, &payload, &options).await,
    }
}

async fn serve(
    host: &str,
    port: u16,
    handler: BuiltinHandler,
    options: ServerOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host,
        port,
        handler = ?handler,
        max_payload_bytes = options.max_payload_bytes,
        shutdown = ?options.shutdown,
        "Starting tcpserv"
    );

    let server = match handler {
        BuiltinHandler::Echo => Server::bind(host, port, builtin::echo, options).await?,
        BuiltinHandler::Reverse => Server::bind(host, port, builtin::reverse, options).await?,
    };

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn request(
    host: &str,
    port: u16,
    payload: &[u8],
    options: &ClientOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = tcpserv::request(host, port, payload, options).await?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
