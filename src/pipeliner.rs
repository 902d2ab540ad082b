//! Webhook endpoint and pipeline orchestration
//!
//! A [`Pipeliner`] verifies each inbound webhook, acknowledges it with `200`
//! whatever the outcome, and queues authenticated ones for processing:
//! classify, emit, run the repository's scripts, notify. Processing happens
//! on a [`SequentialQueue`], so scripts never overlap and run in the order
//! their webhooks were accepted.

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State as AxumState},
    http::{HeaderMap, StatusCode},
    routing,
};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelinerConfig;
use crate::emitter::{EventEmitter, PipelineEvent};
use crate::error::{PipelinerError, Result};
use crate::notify::{LogNotifier, Notifier, notify_best_effort};
use crate::queue::SequentialQueue;
use crate::script::{ScriptContext, ScriptDispatcher};
use crate::signature::{self, SIGNATURE_HEADER};
use crate::webhook::{WebhookRequest, classify};

/// GitHub caps webhook payloads at 25 MiB.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Lifecycle of a [`Pipeliner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinerState {
    Uninitialized,
    Listening,
    Stopped,
}

struct OwnedServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

enum Listener {
    Uninitialized,
    /// `None` when the routes are served by an external app.
    Listening(Option<OwnedServer>),
    Stopped,
}

/// State shared between the endpoint handler and queued tasks
struct Pipeline {
    hmac_secret: String,
    queue: SequentialQueue,
    emitter: EventEmitter,
    dispatcher: ScriptDispatcher,
    notifier: RwLock<Arc<dyn Notifier>>,
}

pub struct Pipeliner {
    config: PipelinerConfig,
    external_app: bool,
    pipeline: Arc<Pipeline>,
    listener: Listener,
}

impl Pipeliner {
    /// Creates a pipeliner that binds its own listener on `config.port` in [`Pipeliner::init`].
    pub fn new(config: PipelinerConfig) -> Result<Self> {
        Self::build(config, false)
    }

    /// Creates a pipeliner whose routes are served by the caller's own app:
    /// merge [`Pipeliner::router`] into it. Such an instance can not be stopped.
    pub fn with_external_app(config: PipelinerConfig) -> Result<Self> {
        Self::build(config, true)
    }

    fn build(config: PipelinerConfig, external_app: bool) -> Result<Self> {
        config.validate(external_app)?;

        let dispatcher = ScriptDispatcher::new(config.scripts_path.clone())
            .with_interpreter(config.interpreter.clone())
            .with_timeout(config.script_timeout());

        let pipeline = Arc::new(Pipeline {
            hmac_secret: config.hmac_secret.clone(),
            queue: SequentialQueue::new(),
            emitter: EventEmitter::new(),
            dispatcher,
            notifier: RwLock::new(Arc::new(LogNotifier) as Arc<dyn Notifier>),
        });

        Ok(Self {
            config,
            external_app,
            pipeline,
            listener: Listener::Uninitialized,
        })
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.pipeline.emitter
    }

    pub fn queue(&self) -> &SequentialQueue {
        &self.pipeline.queue
    }

    /// Replaces the notifier receiving script results.
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self
            .pipeline
            .notifier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = notifier;
    }

    pub fn state(&self) -> PipelinerState {
        match self.listener {
            Listener::Uninitialized => PipelinerState::Uninitialized,
            Listener::Listening(_) => PipelinerState::Listening,
            Listener::Stopped => PipelinerState::Stopped,
        }
    }

    /// Address of the owned listener, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Listening(Some(server)) => Some(server.local_addr),
            _ => None,
        }
    }

    /// Router serving the webhook endpoint at the configured path.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.endpoint_path, routing::post(handle_webhook))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(Arc::clone(&self.pipeline))
    }

    /// Starts listening for webhooks. Binds the owned listener unless an
    /// external app serves the routes. Calling it again while listening is a no-op.
    pub async fn init(&mut self) -> Result<()> {
        if let Listener::Listening(_) = self.listener {
            debug!("Pipeliner already listening");
            return Ok(());
        }

        if self.external_app {
            info!(
                "Webhook endpoint {} served by external app",
                self.config.endpoint_path
            );
            self.listener = Listener::Listening(None);
            return Ok(());
        }

        let port = self.config.port.ok_or_else(|| {
            PipelinerError::ConfigError("Provide either \"port\" or an external app".to_string())
        })?;
        let address = SocketAddr::new(self.config.host, port);
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| PipelinerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let serve = axum::serve(listener, self.router()).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move { serve.await });

        info!(
            "Listening for webhooks on {}{}",
            local_addr, self.config.endpoint_path
        );
        self.listener = Listener::Listening(Some(OwnedServer {
            local_addr,
            shutdown,
            handle,
        }));
        Ok(())
    }

    /// Closes the owned listener. A no-op unless listening; an error when the
    /// routes are served by an external app.
    pub async fn stop(&mut self) -> Result<()> {
        let server = match std::mem::replace(&mut self.listener, Listener::Stopped) {
            Listener::Listening(Some(server)) => server,
            Listener::Listening(None) => {
                self.listener = Listener::Listening(None);
                return Err(PipelinerError::ExternalServer);
            }
            other => {
                self.listener = other;
                return Ok(());
            }
        };

        let _ = server.shutdown.send(());
        match server.handle.await {
            Ok(Ok(())) => info!("Stopped listening on {}", server.local_addr),
            Ok(Err(e)) => error!("Webhook server failed: {}", e),
            Err(e) => error!("Webhook server task failed: {}", e),
        }
        Ok(())
    }

    /// Verifies and queues one webhook, as the endpoint does. For HTTP layers
    /// other than [`Pipeliner::router`].
    ///
    /// Must be called within a tokio runtime; panics otherwise.
    pub fn accept_webhook(&self, headers: HeaderMap, body: Bytes) {
        self.pipeline.accept(headers, body);
    }
}

/// Handles the GitHub webhook POST request.
///
/// Always answers `200`. Verification and queueing do not wait on scripts or
/// subscribers, and an unauthenticated sender learns nothing from the response.
async fn handle_webhook(
    AxumState(pipeline): AxumState<Arc<Pipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    pipeline.accept(headers, body);
    StatusCode::OK
}

impl Pipeline {
    fn accept(self: &Arc<Self>, headers: HeaderMap, body: Bytes) {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !signature::is_valid(signature, &body, &self.hmac_secret) {
            warn!("Rejected webhook with missing or invalid signature");
            self.emit_detached(PipelineEvent::Unauthorized(headers));
            return;
        }

        let request = match WebhookRequest::from_raw(headers, body) {
            Ok(request) => Arc::new(request),
            Err(e) => {
                warn!("Could not parse JSON body of signed webhook: {}", e);
                return;
            }
        };

        let pipeline = Arc::clone(self);
        self.queue.add(move || async move { pipeline.process(request).await });
    }

    /// Runs subscribers on the blocking pool, apart from the request being answered.
    fn emit_detached(self: &Arc<Self>, event: PipelineEvent) {
        let pipeline = Arc::clone(self);
        let emit = tokio::task::spawn_blocking(move || pipeline.emitter.emit(event));
        tokio::spawn(async move {
            if let Err(e) = emit.await {
                error!("Event subscriber failed: {}", e);
            }
        });
    }

    async fn process(&self, request: Arc<WebhookRequest>) {
        let delivery = request
            .delivery_id()
            .map(String::from)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let span = info_span!(
            "webhook",
            delivery = %delivery,
            event = request.event_header().unwrap_or("-")
        );

        async {
            let classified = Arc::new(classify(Arc::clone(&request)));

            match classified.event() {
                Some(event) => {
                    info!(
                        "Received {} for {}/{}",
                        event,
                        classified.organization.as_deref().unwrap_or("?"),
                        classified.repository.as_deref().unwrap_or("?")
                    );
                    self.emitter
                        .emit(PipelineEvent::Classified(Arc::clone(&classified)));
                }
                None => debug!("Webhook does not map to a pipeline event"),
            }

            self.emitter.emit(PipelineEvent::Webhook(request));

            let Some((organization, repository, event)) = classified.script_target() else {
                debug!("No script target, skipping script lookup");
                return;
            };

            let results = self
                .dispatcher
                .dispatch(ScriptContext {
                    organization,
                    repository,
                    event,
                    data: classified.data.as_ref(),
                })
                .await;

            for result in results {
                let notifier = self
                    .notifier
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                notify_best_effort(notifier, result).await;
            }
        }
        .instrument(span)
        .await
    }
}
