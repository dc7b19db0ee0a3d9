use std::sync::{Arc, LazyLock};

use ember_common::{
    Signal, internal,
    logging::{self, LogFormat},
    tracing,
};
use ember_control::{ControlServer, DEFAULT_CONTROL_SOCKET};
use ember_delivery::{
    CampaignProcessor, CampaignService, Collaborators, LoggingTransport, StaticRecipientSource,
};
use ember_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{control_handler::EmberControlHandler, seed::Seed};

fn default_control_socket() -> String {
    DEFAULT_CONTROL_SOCKET.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Path of the Unix socket `emberctl` talks to
    #[serde(default = "default_control_socket")]
    pub socket: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_control_socket(),
        }
    }
}

/// Top-level daemon configuration, read from `ember.config.ron`
#[derive(Debug, Default, Deserialize)]
pub struct Ember {
    #[serde(default)]
    store: StoreConfig,
    #[serde(alias = "delivery", default)]
    processor: CampaignProcessor,
    #[serde(default)]
    control: ControlConfig,
    #[serde(default)]
    log_format: LogFormat,
    #[serde(default)]
    seed: Seed,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// The engine and its control socket, wired together and ready to serve
pub struct Daemon {
    processor: Arc<CampaignProcessor>,
    control: ControlServer,
}

impl Ember {
    #[must_use]
    pub fn control_socket(&self) -> &str {
        &self.control.socket
    }

    /// Build the store, load seed data and initialise the processor
    ///
    /// # Errors
    ///
    /// If seeding fails, the processor configuration is unusable or the
    /// control socket path is empty
    pub async fn assemble(self) -> anyhow::Result<Daemon> {
        let Self {
            store,
            mut processor,
            control,
            seed,
            ..
        } = self;

        let store = store.into_store();
        let recipients = Arc::new(StaticRecipientSource::new());

        if !seed.is_empty() {
            internal!(level = INFO, "Loading seed data");
            seed.apply(&store, &recipients).await?;
        }

        processor.init(Collaborators::new(
            store,
            Arc::new(LoggingTransport::new()),
            recipients,
        ))?;
        let processor = Arc::new(processor);

        let handler = Arc::new(EmberControlHandler::new(
            Arc::clone(&processor) as Arc<dyn CampaignService>
        ));
        let control = ControlServer::new(control.socket, handler)?;

        Ok(Daemon { processor, control })
    }

    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if any part of the daemon fails
    /// to initialise, or the control socket cannot be bound.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init_with(self.log_format);

        let daemon = self.assemble().await?;

        internal!(level = INFO, "Controller running");

        let ret = tokio::select! {
            r = daemon.serve(&SHUTDOWN_BROADCAST) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

impl Daemon {
    #[must_use]
    pub const fn processor(&self) -> &Arc<CampaignProcessor> {
        &self.processor
    }

    #[must_use]
    pub fn control_socket(&self) -> &str {
        self.control.socket_path()
    }

    /// Serve campaigns and the control socket until `signal` says stop
    ///
    /// # Errors
    ///
    /// If recovery fails or the control socket cannot be bound
    pub async fn serve(self, signal: &broadcast::Sender<Signal>) -> anyhow::Result<()> {
        let Self { processor, control } = self;
        let engine_signal = signal.subscribe();
        let control_signal = signal.subscribe();

        let engine = async move {
            processor
                .serve(engine_signal)
                .await
                .map_err(anyhow::Error::from)
        };
        let socket = async move {
            control
                .serve(control_signal)
                .await
                .map_err(anyhow::Error::from)
        };

        tokio::try_join!(engine, socket)?;
        Ok(())
    }
}
