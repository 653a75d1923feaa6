use neuroband_types::BridgeResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::StatusApi;
use crate::config::BridgeConfig;
use crate::polling::{callback, AdaptivePoller};
use crate::stream::StreamClient;
use crate::supervisor::BackendSupervisor;
use crate::telemetry::TelemetryBuffers;

const POLL_KEY_BACKEND: &str = "backend_watch";
const POLL_KEY_HEALTH: &str = "backend_health";
const POLL_KEY_STREAM: &str = "stream_watch";

/// Wires the supervisor, stream client, poller and buffers together and
/// owns the ordered shutdown: polling first, then the stream, then the
/// backend process, reversing the start-up dependency order.
pub struct Bridge {
    config: BridgeConfig,
    poller: Arc<AdaptivePoller>,
    supervisor: Arc<BackendSupervisor>,
    stream: Arc<StreamClient>,
    buffers: Arc<TelemetryBuffers>,
    api: Arc<StatusApi>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;

        let poller = Arc::new(AdaptivePoller::new());
        let buffers = Arc::new(TelemetryBuffers::new(config.telemetry.capacity));
        let supervisor = Arc::new(BackendSupervisor::new(config.backend.clone(), poller.clone()));
        let stream = Arc::new(StreamClient::new(
            config.stream.clone(),
            supervisor.state_watch(),
            buffers.clone(),
        ));
        let api = Arc::new(StatusApi::new(
            config.polling.base_url(config.backend.port),
            Duration::from_secs(config.polling.request_timeout_secs),
        )?);

        Ok(Self {
            config,
            poller,
            supervisor,
            stream,
            buffers,
            api,
        })
    }

    pub fn supervisor(&self) -> &Arc<BackendSupervisor> {
        &self.supervisor
    }

    pub fn stream(&self) -> &Arc<StreamClient> {
        &self.stream
    }

    pub fn poller(&self) -> &Arc<AdaptivePoller> {
        &self.poller
    }

    pub fn buffers(&self) -> &Arc<TelemetryBuffers> {
        &self.buffers
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Starts the backend, registers the standing polls and opens the
    /// stream. A stream that cannot connect yet is not fatal: the stream
    /// watch poll keeps trying on its cadence.
    pub async fn start(&self) -> BridgeResult<()> {
        self.supervisor.start().await?;
        self.register_polls().await;

        if let Err(e) = self.stream.connect().await {
            warn!("Initial stream connect failed: {}", e);
        }

        info!("Bridge started");
        Ok(())
    }

    async fn register_polls(&self) {
        let spec = self.config.polling.status_spec();

        let supervisor = self.supervisor.clone();
        self.poller
            .start_adaptive_polling(
                POLL_KEY_BACKEND,
                callback(move || {
                    let supervisor = supervisor.clone();
                    async move { supervisor.maintenance().await }
                }),
                spec,
            )
            .await;

        let api = self.api.clone();
        self.poller
            .start_adaptive_polling(
                POLL_KEY_HEALTH,
                callback(move || {
                    let api = api.clone();
                    async move { api.health().await.map(|_| ()) }
                }),
                spec,
            )
            .await;

        let stream = self.stream.clone();
        self.poller
            .start_adaptive_polling(
                POLL_KEY_STREAM,
                callback(move || {
                    let stream = stream.clone();
                    async move {
                        if stream.is_open().await {
                            Ok(())
                        } else {
                            stream.connect().await
                        }
                    }
                }),
                spec,
            )
            .await;
    }

    /// Explicit user-triggered recovery: every poll fires immediately and a
    /// reconnect is attempted right away.
    pub async fn recover(&self) -> BridgeResult<()> {
        info!("Manual recovery requested");
        self.poller.force_immediate_check_all().await;
        self.stream.connect().await
    }

    /// Restarts the backend and re-opens the stream. The poller's init
    /// window is re-armed by the supervisor on a successful restart.
    pub async fn restart_backend(&self) -> BridgeResult<()> {
        self.stream.disconnect().await;
        self.supervisor.restart().await?;
        self.stream.connect().await
    }

    pub async fn shutdown(&self) -> BridgeResult<()> {
        info!("Shutting down bridge");
        self.poller.shutdown().await;
        self.stream.disconnect().await;
        self.supervisor.stop().await?;
        info!("Bridge shut down");
        Ok(())
    }
}
