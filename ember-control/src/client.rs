//! Client for connecting to the control socket

use std::{path::Path, sync::Arc, time::Duration};

use tokio::{net::UnixStream, sync::Mutex};
use tracing::{debug, trace, warn};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, ResponsePayload, Result,
    protocol::{read_frame, write_frame},
};

/// Largest response the client will read
const MAX_RESPONSE_SIZE: u32 = 10_000_000;

/// Client for communicating with the ember control server
pub struct ControlClient {
    socket_path: String,
    timeout: Duration,
    /// Connection reused across requests in watch mode
    persistent_connection: Option<Arc<Mutex<Option<UnixStream>>>>,
}

impl ControlClient {
    /// Create a new control client with the given socket path
    #[must_use]
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
            persistent_connection: None,
        }
    }

    /// Set the request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Keep one connection open across requests, reconnecting once if it
    /// has gone away
    #[must_use]
    pub fn with_persistent_connection(mut self) -> Self {
        self.persistent_connection = Some(Arc::new(Mutex::new(None)));
        self
    }

    async fn connect(&self) -> Result<UnixStream> {
        debug!("Connecting to control socket: {}", self.socket_path);
        Ok(UnixStream::connect(&self.socket_path).await?)
    }

    /// Send a request and receive a response
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Connection fails
    /// - Protocol error occurs
    /// - Request times out
    /// - Server returns an error
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.send_request_internal(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn send_request_internal(&self, request: Request) -> Result<Response> {
        if let Some(persistent) = &self.persistent_connection {
            self.send_request_persistent(request, persistent).await
        } else {
            let mut stream = self.connect().await?;
            Self::send_and_receive(&mut stream, &request).await
        }
    }

    async fn send_request_persistent(
        &self,
        request: Request,
        persistent: &Arc<Mutex<Option<UnixStream>>>,
    ) -> Result<Response> {
        let mut guard = persistent.lock().await;

        if let Some(stream) = guard.as_mut() {
            match Self::send_and_receive(stream, &request).await {
                Err(ControlError::ServerError(e)) => return Err(ControlError::ServerError(e)),
                Err(e) => {
                    warn!(
                        "Persistent connection failed ({e}), reconnecting to {}",
                        self.socket_path
                    );
                    *guard = None;
                }
                ok => return ok,
            }
        }

        let mut stream = self.connect().await?;
        let result = Self::send_and_receive(&mut stream, &request).await;
        if !matches!(
            result,
            Err(ControlError::Io(_) | ControlError::ConnectionClosed)
        ) {
            *guard = Some(stream);
        }
        result
    }

    /// Send a request and read the reply on an open stream
    async fn send_and_receive(stream: &mut UnixStream, request: &Request) -> Result<Response> {
        trace!("Sending request: {request:?}");
        write_frame(stream, request).await?;

        let response: Response = read_frame(stream, MAX_RESPONSE_SIZE).await?;
        trace!("Received response: {response:?}");

        if !response.is_version_compatible() {
            return Err(ControlError::IncompatibleVersion {
                server: response.version,
                client: PROTOCOL_VERSION,
            });
        }

        if let ResponsePayload::Error(err) = response.payload {
            return Err(ControlError::ServerError(err));
        }

        Ok(response)
    }

    /// Check if the control socket exists
    ///
    /// # Errors
    ///
    /// Returns an error if the socket doesn't exist
    pub fn check_socket_exists(&self) -> Result<()> {
        if !Path::new(&self.socket_path).exists() {
            return Err(ControlError::InvalidSocketPath(format!(
                "Socket does not exist: {}",
                self.socket_path
            )));
        }
        Ok(())
    }
}
