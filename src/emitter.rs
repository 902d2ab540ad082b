//! Observer registration for pipeline events
//!
//! Subscribers register a callback per [`Channel`]: one channel per
//! [`EventKind`], plus the fixed `Webhook` channel (every authenticated
//! request, classified or not) and `Unauthorized` channel (requests that
//! failed signature verification). Callbacks run synchronously, in
//! registration order, on the task that emits.
//!
//! Every emitted event is also published on a broadcast channel, available as
//! an async stream through [`EventEmitter::stream`].

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::webhook::{ClassifiedEvent, EventKind, WebhookRequest};

const BROADCAST_CAPACITY: usize = 64;

/// Where a subscriber listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Event(EventKind),
    Webhook,
    Unauthorized,
}

/// Something the pipeline emitted
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A classified webhook; always carries event data.
    Classified(Arc<ClassifiedEvent>),
    Webhook(Arc<WebhookRequest>),
    /// Headers of a request whose signature did not verify.
    Unauthorized(HeaderMap),
}

impl PipelineEvent {
    /// `None` for a classified event without a kind, which is never emitted.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            PipelineEvent::Classified(classified) => classified.event().map(Channel::Event),
            PipelineEvent::Webhook(_) => Some(Channel::Webhook),
            PipelineEvent::Unauthorized(_) => Some(Channel::Unauthorized),
        }
    }
}

type Callback = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

pub struct EventEmitter {
    subscribers: RwLock<HashMap<Channel, Vec<Callback>>>,
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Registers `callback` on `channel`, after any existing subscribers.
    pub fn on<F>(&self, channel: Channel, callback: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn on_event<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&ClassifiedEvent) + Send + Sync + 'static,
    {
        self.on(Channel::Event(kind), move |event| {
            if let PipelineEvent::Classified(classified) = event {
                callback(classified);
            }
        });
    }

    pub fn on_webhook<F>(&self, callback: F)
    where
        F: Fn(&WebhookRequest) + Send + Sync + 'static,
    {
        self.on(Channel::Webhook, move |event| {
            if let PipelineEvent::Webhook(request) = event {
                callback(request);
            }
        });
    }

    pub fn on_unauthorized<F>(&self, callback: F)
    where
        F: Fn(&HeaderMap) + Send + Sync + 'static,
    {
        self.on(Channel::Unauthorized, move |event| {
            if let PipelineEvent::Unauthorized(headers) = event {
                callback(headers);
            }
        });
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Calls every subscriber of the event's channel, then broadcasts it.
    pub fn emit(&self, event: PipelineEvent) {
        let Some(channel) = event.channel() else {
            return;
        };

        // Snapshot so callbacks may register further subscribers.
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .cloned()
            .unwrap_or_default();

        for callback in &callbacks {
            callback(&event);
        }

        // No stream subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Stream of every event emitted from now on. Slow consumers skip the
    /// events they lagged behind on.
    pub fn stream(&self) -> impl Stream<Item = PipelineEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|result| result.ok())
    }
}
