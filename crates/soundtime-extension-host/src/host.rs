//! The serve loop: one reader, one writer, one task per host message.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use soundtime_extensions::{
    Envelope, EnvelopeCodec, ExtensionError, ExtensionFinder, ExtensionHandler, ExtensionManager, InMemoryRegistry,
    OutboundReceiver, RequestBus, Sandbox,
};

use crate::config::HostConfig;
use crate::dispatcher::{Dispatched, Dispatcher, LogLevelSetter};
use crate::error::HostError;

pub struct ExtensionHost {
    handler: Arc<ExtensionHandler>,
    bus: RequestBus,
    outbound: OutboundReceiver,
    log_level: Option<LogLevelSetter>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("handler", &self.handler)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl ExtensionHost {
    pub fn new(config: &HostConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let (bus, outbound) = RequestBus::new(config.request_timeout);
        let manager = ExtensionManager::new(InMemoryRegistry::new().into_handle(), sandbox, bus.clone())
            .with_install_path(config.install_path.clone());
        let finder = ExtensionFinder::new(config.extension_paths.clone(), config.discovery_max_retries);

        Self {
            handler: Arc::new(ExtensionHandler::new(finder, manager)),
            bus,
            outbound,
            log_level: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_log_level(mut self, setter: LogLevelSetter) -> Self {
        self.log_level = Some(setter);
        self
    }

    pub fn handler(&self) -> &Arc<ExtensionHandler> {
        &self.handler
    }

    /// Cancelling this token stops every extension and ends [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the host channel until shutdown or until the channel closes.
    ///
    /// Shutdown stops every extension and returns `Ok`. A closed channel
    /// returns [`ExtensionError::ChannelClosed`] without stopping anything.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            handler,
            bus,
            outbound,
            log_level,
            shutdown,
        } = self;

        let (ready_tx, ready_rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(handler.clone(), ready_rx);
        if let Some(setter) = log_level {
            dispatcher = dispatcher.with_log_level(setter);
        }
        let dispatcher = Arc::new(dispatcher);

        tokio::spawn(initialize(handler.clone(), ready_tx));

        let closed = CancellationToken::new();
        let stopped = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(
            FramedWrite::new(writer, EnvelopeCodec::new()),
            outbound,
            stopped.clone(),
            closed.clone(),
        ));

        let mut frames = FramedRead::new(reader, EnvelopeCodec::new());
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = closed.cancelled() => break Err(ExtensionError::ChannelClosed),
                frame = frames.next() => match frame {
                    Some(Ok(envelope)) => accept(&bus, &dispatcher, &shutdown, envelope),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "failed to read from host channel");
                        break Err(ExtensionError::ChannelClosed);
                    }
                    None => {
                        tracing::info!("host closed the channel");
                        break Err(ExtensionError::ChannelClosed);
                    }
                },
            }
        };

        if let Err(e) = result {
            writer_task.abort();
            return Err(e.into());
        }

        tracing::info!("shutting down, stopping extensions");
        let stop_all = handler.stop_all_extensions();
        tokio::pin!(stop_all);
        // Extensions may still call the host while stopping, so replies keep
        // being resolved until every extension is stopped.
        loop {
            tokio::select! {
                () = &mut stop_all => break,
                _ = closed.cancelled() => {
                    tracing::warn!("host channel failed while stopping extensions");
                    break;
                }
                frame = frames.next() => match frame {
                    Some(Ok(envelope)) => {
                        if let Err(envelope) = bus.resolve(envelope) {
                            tracing::debug!(kind = %envelope.kind, "ignoring host message during shutdown");
                        }
                    }
                    Some(Err(_)) | None => {
                        tracing::warn!("host channel closed while stopping extensions");
                        break;
                    }
                },
            }
        }

        stopped.cancel();
        if let Err(e) = writer_task.await {
            tracing::warn!(error = %e, "writer task failed");
        }
        Ok(())
    }
}

/// Initial registration pass. Messages wait on `ready` until it finishes.
async fn initialize(handler: Arc<ExtensionHandler>, ready: watch::Sender<bool>) {
    match handler.register_plugins().await {
        Ok(registered) => tracing::info!(registered, "initial extension scan complete"),
        Err(e) => tracing::error!(error = %e, "initial extension scan failed"),
    }
    ready.send_replace(true);
    handler.start_all().await;
}

/// Route one inbound envelope: a reply completes a pending request, anything
/// else is dispatched on its own task and answered on the same channel.
fn accept(bus: &RequestBus, dispatcher: &Arc<Dispatcher>, shutdown: &CancellationToken, envelope: Envelope) {
    let envelope = match bus.resolve(envelope) {
        Ok(()) => return,
        Err(envelope) => envelope,
    };

    let bus = bus.clone();
    let dispatcher = dispatcher.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let (data, stop) = match dispatcher.dispatch(&envelope).await {
            Dispatched::Reply(data) => (data, false),
            Dispatched::Shutdown => (Value::Null, true),
        };
        if let Err(e) = bus.reply(envelope.reply(Some(data))) {
            tracing::debug!(channel = %envelope.channel, error = %e, "reply dropped");
        }
        if stop {
            tracing::info!("stop requested by host");
            shutdown.cancel();
        }
    });
}

/// Single writer for the channel. Once `stopped` fires it flushes what is
/// queued and returns.
async fn write_loop<W>(
    mut sink: FramedWrite<W, EnvelopeCodec>,
    mut outbound: OutboundReceiver,
    stopped: CancellationToken,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => return,
            },
            _ = stopped.cancelled() => {
                while let Ok(envelope) = outbound.try_recv() {
                    if sink.feed(envelope).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = SinkExt::<Envelope>::flush(&mut sink).await {
                    tracing::debug!(error = %e, "final flush failed");
                }
                return;
            }
        };

        let channel = envelope.channel.clone();
        if let Err(e) = sink.send(envelope).await {
            tracing::error!(%channel, error = %e, "failed to write to host channel");
            closed.cancel();
            return;
        }
    }
}
