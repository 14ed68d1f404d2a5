//! Link - event bus glued to one transport endpoint.
//!
//! Inbound: a single pump task reads frames in arrival order. Each decoded
//! envelope is published twice on the bus: first on [`RAW_MESSAGE_TOPIC`]
//! with the whole envelope, then on its own event name with its `data`.
//! Every handler for a publish runs before the next frame is read.
//!
//! Outbound: `send` frames the envelope and writes it under the writer lock.
//! A detached transport has no writer; sends are discarded and reported as
//! [`SendOutcome::Discarded`].
//!
//! The same type serves both ends of the relationship. What happens on a
//! `"stop"` event is decided by the [`StopPolicy`] in [`LinkConfig`], never by
//! the Link itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    CLOSED_TOPIC, Envelope, MALFORMED_TOPIC, RAW_MESSAGE_TOPIC, READY_EVENT, STOP_EVENT,
    is_local_topic, is_reply_event,
};
use crate::bridge::transport::{BoxedReader, BoxedWriter, Transport, TransportKind};
use crate::request::{RandomReplyIds, ReplyIdGenerator};

type StandingHandler = Arc<dyn Fn(Value) + Send + Sync>;
type OnceHandler = Box<dyn FnOnce(Value) + Send + Sync>;
type EnvelopeWriter = FramedWrite<BoxedWriter, JsonCodec<Envelope>>;
type EnvelopeReader = FramedRead<BoxedReader, JsonCodec<Envelope>>;

/// Handle returned by subscribe calls, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the transport.
    Delivered,
    /// No live peer; the message went nowhere.
    Discarded,
}

/// Why a Link stopped carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer's stream ended or failed.
    PeerClosed,
    /// Closed locally (controller kill).
    Closed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid event name {0:?}")]
    InvalidEvent(String),
    #[error("link is closed")]
    Closed,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Decides what a Link does when the peer sends `"stop"`.
pub trait StopPolicy: Send + Sync + 'static {
    fn stop_requested(&self);
}

/// Observe `"stop"` and do nothing. Default for every Link.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreStop;

impl StopPolicy for IgnoreStop {
    fn stop_requested(&self) {
        tracing::debug!("Stop observed, ignoring");
    }
}

/// Exit the current process with status 0 on `"stop"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnStop;

impl StopPolicy for ExitOnStop {
    fn stop_requested(&self) {
        tracing::info!("Got stop event, exiting process");
        std::process::exit(0);
    }
}

/// Cancel a token on `"stop"`; the application awaits it and shuts down itself.
#[derive(Debug, Clone)]
pub struct CancelOnStop {
    token: CancellationToken,
}

impl CancelOnStop {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl StopPolicy for CancelOnStop {
    fn stop_requested(&self) {
        tracing::info!("Got stop event, cancelling");
        self.token.cancel();
    }
}

#[derive(Clone)]
pub struct LinkConfig {
    pub name: String,
    pub stop_policy: Arc<dyn StopPolicy>,
    pub reply_ids: Arc<dyn ReplyIdGenerator>,
    /// Deadline applied by `send_request`. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "link".to_string(),
            stop_policy: Arc::new(IgnoreStop),
            reply_ids: Arc::new(RandomReplyIds),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl LinkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_stop_policy(mut self, policy: Arc<dyn StopPolicy>) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_reply_ids(mut self, ids: Arc<dyn ReplyIdGenerator>) -> Self {
        self.reply_ids = ids;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

enum Callback {
    Standing(StandingHandler),
    Once(OnceHandler),
}

struct Subscription {
    id: SubscriptionId,
    callback: Callback,
}

pub(crate) struct LinkInner {
    config: LinkConfig,
    kind: TransportKind,
    writer: tokio::sync::Mutex<Option<EnvelopeWriter>>,
    handlers: DashMap<String, Vec<Subscription>>,
    next_subscription: AtomicU64,
    closed: CancellationToken,
    close_reason: StdMutex<Option<CloseReason>>,
}

/// Bidirectional event bus over one transport. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

/// Non-owning handle, held by handlers the Link stores in its own registry.
pub(crate) struct WeakLink(Weak<LinkInner>);

impl WeakLink {
    pub(crate) fn upgrade(&self) -> Option<Link> {
        self.0.upgrade().map(|inner| Link { inner })
    }
}

/// Reads frames and routes them. Spawned separately so callers can subscribe
/// before the first frame is dispatched.
pub(crate) struct InboundPump {
    link: Weak<LinkInner>,
    closed: CancellationToken,
    reader: EnvelopeReader,
}

impl InboundPump {
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = self.reader.next() => frame,
            };

            let Some(inner) = self.link.upgrade() else {
                break;
            };
            let link = Link { inner };

            match frame {
                Some(Ok(Ok(envelope))) => link.route(envelope),
                Some(Ok(Err(malformed))) => {
                    link.report_malformed(malformed.to_string());
                }
                Some(Err(e)) => {
                    tracing::error!(link = %link.name(), error = %e, "Transport read failed");
                    link.mark_closed(CloseReason::PeerClosed);
                    break;
                }
                None => {
                    tracing::debug!(link = %link.name(), "Peer stream ended");
                    link.mark_closed(CloseReason::PeerClosed);
                    break;
                }
            }
        }
        tracing::trace!("Inbound pump exiting");
    }
}

impl Link {
    /// Bind a Link to `transport` and start reading. Must run inside a tokio runtime.
    pub fn connect(transport: Transport, config: LinkConfig) -> Self {
        let (link, pump) = Self::unstarted(transport, config);
        if let Some(pump) = pump {
            pump.spawn();
        }
        link
    }

    pub(crate) fn unstarted(transport: Transport, config: LinkConfig) -> (Self, Option<InboundPump>) {
        let (kind, reader, writer) = transport.into_parts();
        let stop_policy = Arc::clone(&config.stop_policy);

        tracing::debug!(link = %config.name, transport = kind.as_str(), "Creating link");

        let inner = Arc::new(LinkInner {
            config,
            kind,
            writer: tokio::sync::Mutex::new(
                writer.map(|w| FramedWrite::new(w, JsonCodec::<Envelope>::new())),
            ),
            handlers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            closed: CancellationToken::new(),
            close_reason: StdMutex::new(None),
        });

        let link = Self { inner };
        link.subscribe(STOP_EVENT, move |_| stop_policy.stop_requested());

        let pump = reader.map(|r| InboundPump {
            link: Arc::downgrade(&link.inner),
            closed: link.inner.closed.clone(),
            reader: FramedRead::new(r, JsonCodec::<Envelope>::new()),
        });

        (link, pump)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn has_peer(&self) -> bool {
        self.inner.kind != TransportKind::Detached
    }

    /// Send `event` with `data` to the peer.
    pub async fn send(&self, event: &str, data: impl Serialize) -> Result<SendOutcome, LinkError> {
        if event.is_empty() || is_local_topic(event) {
            return Err(LinkError::InvalidEvent(event.to_string()));
        }
        let data = serde_json::to_value(data)?;
        self.send_envelope(Envelope::new(event, data)).await
    }

    /// Tell the parent this side has installed its handlers.
    pub async fn send_ready(&self) -> Result<SendOutcome, LinkError> {
        self.send(READY_EVENT, Value::Null).await
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<SendOutcome, LinkError> {
        if self.close_reason() == Some(CloseReason::Closed) {
            return Err(LinkError::Closed);
        }

        if self.inner.kind == TransportKind::Detached {
            tracing::warn!(
                link = %self.name(),
                event = %envelope.event,
                "No parent process, message discarded"
            );
            return Ok(SendOutcome::Discarded);
        }

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Closed)?;

        tracing::debug!(link = %self.name(), event = %envelope.event, "Sending message");
        writer.send(envelope).await?;
        Ok(SendOutcome::Delivered)
    }

    /// Register a handler for every `event` notification.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.register(event.into(), Callback::Standing(Arc::new(handler)))
    }

    /// Register a handler for the next `event` notification only.
    pub fn subscribe_once<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: FnOnce(Value) + Send + Sync + 'static,
    {
        self.register(event.into(), Callback::Once(Box::new(handler)))
    }

    fn register(&self, event: String, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .entry(event)
            .or_default()
            .push(Subscription { id, callback });
        id
    }

    /// Remove a handler. Returns false if it already fired (once) or was never registered.
    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let removed = match self.inner.handlers.get_mut(event) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            None => false,
        };
        self.inner.handlers.remove_if(event, |_, subs| subs.is_empty());
        removed
    }

    /// Number of requests sent on this Link still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .handlers
            .iter()
            .filter(|entry| is_reply_event(entry.key()))
            .count()
    }

    pub(crate) fn downgrade(&self) -> WeakLink {
        WeakLink(Arc::downgrade(&self.inner))
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .get(event)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Publish `event` on the local bus only. Nothing is sent to the peer.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.publish(event, data)
    }

    /// Invoke every handler for `topic` in registration order; returns how many ran.
    fn publish(&self, topic: &str, data: Value) -> usize {
        let to_fire: Vec<Callback> = {
            let Some(mut subs) = self.inner.handlers.get_mut(topic) else {
                return 0;
            };
            let mut fire = Vec::with_capacity(subs.len());
            let mut keep = Vec::with_capacity(subs.len());
            for sub in std::mem::take(&mut *subs) {
                match sub.callback {
                    Callback::Standing(handler) => {
                        fire.push(Callback::Standing(Arc::clone(&handler)));
                        keep.push(Subscription {
                            id: sub.id,
                            callback: Callback::Standing(handler),
                        });
                    }
                    once @ Callback::Once(_) => fire.push(once),
                }
            }
            *subs = keep;
            fire
        };
        self.inner.handlers.remove_if(topic, |_, subs| subs.is_empty());

        let count = to_fire.len();
        for callback in to_fire {
            match callback {
                Callback::Standing(handler) => handler(data.clone()),
                Callback::Once(handler) => handler(data.clone()),
            }
        }
        count
    }

    fn route(&self, envelope: Envelope) {
        if !envelope.is_valid() {
            self.report_malformed("envelope has an empty event name".to_string());
            return;
        }
        if is_local_topic(&envelope.event) {
            self.report_malformed(format!(
                "peer sent reserved local topic {:?}",
                envelope.event
            ));
            return;
        }

        tracing::debug!(link = %self.name(), event = %envelope.event, "Received message");

        let raw = json!({ "event": envelope.event, "data": envelope.data });
        self.publish(RAW_MESSAGE_TOPIC, raw);
        self.publish(&envelope.event, envelope.data);
    }

    pub(crate) fn report_malformed(&self, error: String) {
        tracing::warn!(link = %self.name(), %error, "Malformed message");
        self.publish(MALFORMED_TOPIC, json!({ "error": error }));
    }

    /// Record the close reason once, wake `closed()` waiters, notify
    /// `$$closed` subscribers and settle pending requests.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        {
            let mut current = match self.inner.close_reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }

        self.inner.closed.cancel();
        self.publish(CLOSED_TOPIC, json!({ "reason": reason.as_str() }));

        // Dropping a reply handler drops its oneshot sender, which settles the
        // waiting request with an error derived from the close reason.
        self.inner.handlers.retain(|topic, _| !is_reply_event(topic));
        true
    }

    /// Stop reading, drop the writer and every handler. Sends fail with
    /// [`LinkError::Closed`] afterwards.
    pub(crate) async fn close(&self) {
        if self.mark_closed(CloseReason::Closed) {
            tracing::debug!(link = %self.name(), "Link closed");
        } else if let Ok(mut reason) = self.inner.close_reason.lock() {
            // Peer already gone; a local close still forbids further sends.
            *reason = Some(CloseReason::Closed);
        }
        self.inner.writer.lock().await.take();
        self.inner.handlers.clear();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.inner.close_reason.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Completes when the peer's stream ends or the Link is closed locally.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name())
            .field("transport", &self.inner.kind)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
