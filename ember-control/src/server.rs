//! Control server implementation

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use ember_common::Signal;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, Result,
    protocol::{read_frame, write_frame},
};

/// Largest request the server will read
const MAX_REQUEST_SIZE: u32 = 1_000_000;

/// Per-connection read and write timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler trait for processing control requests
///
/// Implement this trait to handle specific command types
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a request and return a response
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be processed
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

/// Control server for managing ember via a Unix domain socket
pub struct ControlServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    /// Create a new control server
    ///
    /// # Errors
    ///
    /// Returns an error if the socket path is empty
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.trim().is_empty() {
            return Err(ControlError::InvalidSocketPath(
                "control socket path is empty".to_string(),
            ));
        }

        Ok(Self {
            socket_path,
            handler,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Start the control server
    ///
    /// This function runs until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another running instance owns the socket
    /// - The socket cannot be bound
    /// - A fatal I/O error occurs
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Socket already in use by running instance: {}",
                        self.socket_path
                    ),
                )));
            }
            // Stale socket from crashed process
            info!("Removing stale socket file: {}", self.socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner read/write only
        #[cfg(unix)]
        {
            let metadata = tokio::fs::metadata(&self.socket_path).await?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms).await?;
            info!(
                "Control socket created with mode 0600 (owner only): {}",
                self.socket_path
            );
        }
        #[cfg(not(unix))]
        {
            info!("Control server listening on: {}", self.socket_path);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    error!("Error handling control connection: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting control connection: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("Control server shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("Control server shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if socket_path.exists() {
            debug!("Removing socket file: {}", self.socket_path);
            if let Err(e) = tokio::fs::remove_file(socket_path).await {
                warn!("Could not remove socket file {}: {e}", self.socket_path);
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    ///
    /// A connection may carry several requests; it is closed when the client
    /// hangs up.
    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        loop {
            let request = match tokio::time::timeout(
                CONNECTION_TIMEOUT,
                read_frame::<_, Request>(&mut stream, MAX_REQUEST_SIZE),
            )
            .await
            {
                Ok(Ok(request)) => request,
                Ok(Err(ControlError::ConnectionClosed)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ControlError::Timeout),
            };

            trace!("Received request: {request:?}");

            let response = if request.is_version_compatible() {
                match handler.handle_request(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Error handling request: {e}");
                        Response::error(e.to_string())
                    }
                }
            } else {
                warn!(
                    client = request.version,
                    server = PROTOCOL_VERSION,
                    "Rejecting request with incompatible protocol version"
                );
                Response::error(format!(
                    "Incompatible protocol version: server={PROTOCOL_VERSION}, client={}",
                    request.version
                ))
            };

            trace!("Sending response: {response:?}");

            tokio::time::timeout(CONNECTION_TIMEOUT, write_frame(&mut stream, &response))
                .await
                .map_err(|_| ControlError::Timeout)??;
        }
    }
}
