//! Request/reply on top of a Link.
//!
//! A request is an ordinary envelope whose `data` is
//! `{ data, replyEvent }`. The requester subscribes once to `replyEvent`
//! before sending; the responder answers on that event with
//! `{ data }` or `{ error }`. Replies are matched only by `replyEvent`, so
//! they may arrive in any order.
//!
//! A pending request is just that one-shot subscription. It is removed when
//! the reply arrives, when the deadline passes, when the caller drops the
//! future, or when the Link closes (dropping the handler settles the future).

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{ReplyPayload, RequestPayload, reply_event_name};
use crate::link::{CloseReason, Link, LinkError, SendOutcome, SubscriptionId};

/// Source of the disambiguator in reply event names.
///
/// Must not repeat while a request is in flight on the same Link.
pub trait ReplyIdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// UUID v4 disambiguators. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReplyIds;

impl ReplyIdGenerator for RandomReplyIds {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Counter disambiguators starting at 1. Deterministic, for tests.
#[derive(Debug)]
pub struct SequentialReplyIds {
    next: AtomicU64,
}

impl SequentialReplyIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialReplyIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyIdGenerator for SequentialReplyIds {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The remote handler failed; carries its message only.
    #[error("{0}")]
    Remote(String),

    #[error("no reply to {event:?} within {timeout:?}")]
    Timeout { event: String, timeout: Duration },

    #[error("request {0:?} was not delivered: no peer")]
    NotDelivered(String),

    #[error("peer closed before replying to {0:?}")]
    PeerClosed(String),

    #[error("link closed before reply to {0:?}")]
    LinkClosed(String),

    #[error("malformed reply to {event:?}: {reason}")]
    Decode { event: String, reason: String },
}

impl RequestError {
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(message) => Some(message),
            _ => None,
        }
    }
}

/// Unsubscribes the reply handler if the request ends without a reply.
struct PendingReply {
    link: Link,
    reply_event: String,
    id: SubscriptionId,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.link.unsubscribe(&self.reply_event, self.id) {
            tracing::trace!(reply_event = %self.reply_event, "Pending request abandoned");
        }
    }
}

impl Link {
    /// Send a request and wait for its reply, bounded by the configured
    /// `request_timeout`.
    pub async fn send_request(
        &self,
        event: &str,
        data: impl Serialize,
    ) -> Result<Value, RequestError> {
        let timeout = self.config().request_timeout;
        self.request(event, data, timeout).await
    }

    /// Send a request and wait at most `timeout` for its reply.
    pub async fn send_request_timeout(
        &self,
        event: &str,
        data: impl Serialize,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        self.request(event, data, Some(timeout)).await
    }

    async fn request(
        &self,
        event: &str,
        data: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let data = serde_json::to_value(data).map_err(LinkError::from)?;
        let reply_event = reply_event_name(event, &self.config().reply_ids.next_id());

        let (tx, rx) = oneshot::channel::<Value>();
        let id = self.subscribe_once(reply_event.clone(), move |payload| {
            let _ = tx.send(payload);
        });
        let _pending = PendingReply {
            link: self.clone(),
            reply_event: reply_event.clone(),
            id,
        };

        // Checked after subscribing: a close that raced the subscription has
        // already recorded its reason, and nothing would settle this entry.
        match self.close_reason() {
            Some(CloseReason::PeerClosed) => {
                return Err(RequestError::PeerClosed(event.to_string()));
            }
            Some(CloseReason::Closed) => return Err(LinkError::Closed.into()),
            None => {}
        }

        let outcome = self
            .send(event, RequestPayload::new(data, reply_event.clone()))
            .await?;
        if outcome == SendOutcome::Discarded {
            return Err(RequestError::NotDelivered(event.to_string()));
        }
        tracing::debug!(link = %self.name(), %event, %reply_event, "Request sent");

        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
                tracing::warn!(link = %self.name(), %event, ?timeout, "Request timed out");
                RequestError::Timeout {
                    event: event.to_string(),
                    timeout,
                }
            })?,
            None => rx.await,
        };

        let payload = received.map_err(|_| match self.close_reason() {
            Some(CloseReason::PeerClosed) => RequestError::PeerClosed(event.to_string()),
            _ => RequestError::LinkClosed(event.to_string()),
        })?;

        let reply: ReplyPayload =
            serde_json::from_value(payload).map_err(|e| RequestError::Decode {
                event: event.to_string(),
                reason: e.to_string(),
            })?;
        reply.into_result().map_err(RequestError::Remote)
    }

    /// Answer every request on `event` with `handler`.
    ///
    /// `Ok(value)` is sent back as `{ data: value }`, `Err(e)` as
    /// `{ error: e.to_string() }`. A request without `replyEvent` is reported
    /// on the malformed-message topic and the handler is not called.
    pub fn on_request<F, Fut, T, E>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let event = event.into();
        let weak = self.downgrade();

        self.subscribe(event.clone(), move |payload| {
            let Some(link) = weak.upgrade() else {
                return;
            };

            let request: RequestPayload = match serde_json::from_value(payload) {
                Ok(request) => request,
                Err(e) => {
                    link.report_malformed(format!("request {event:?} has an invalid payload: {e}"));
                    return;
                }
            };
            let Some(reply_event) = request.reply_event else {
                tracing::error!(%event, "Must provide replyEvent for request/reply");
                link.report_malformed(format!("request {event:?} is missing replyEvent"));
                return;
            };

            let pending = handler(request.data);
            let event = event.clone();
            tokio::spawn(async move {
                let reply = match pending.await {
                    Ok(value) => match serde_json::to_value(value) {
                        Ok(data) => ReplyPayload::success(data),
                        Err(e) => ReplyPayload::failure(format!("failed to encode reply: {e}")),
                    },
                    Err(e) => {
                        let message = e.to_string();
                        tracing::debug!(%event, error = %message, "Request handler failed");
                        ReplyPayload::failure(message)
                    }
                };
                if let Err(e) = link.send(&reply_event, reply).await {
                    tracing::warn!(%event, %reply_event, error = %e, "Failed to send reply");
                }
            });
        })
    }
}
