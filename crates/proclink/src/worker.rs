//! Child side of the link.
//!
//! The parent side (spawning, ready handshake, stop/kill) is in controller.rs.
//!
//! A child connects to whatever channel its parent advertised in the
//! environment, installs its handlers, then calls [`ParentConnection::ready`].
//! A `"stop"` from the parent cancels the connection's stop token; the child
//! decides how to wind down, typically by awaiting
//! [`ParentConnection::wait_for_shutdown`] and returning from `main`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::transport::Transport;
use crate::link::{CancelOnStop, Link, LinkConfig, LinkError, SendOutcome};

/// Why the child should shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The parent sent `"stop"`.
    StopRequested,
    /// The parent's end of the channel went away.
    ParentGone,
    /// SIGINT or SIGTERM.
    Signal,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopRequested => "stop_requested",
            Self::ParentGone => "parent_gone",
            Self::Signal => "signal",
        }
    }
}

/// The child's Link to its parent plus the token `"stop"` cancels.
pub struct ParentConnection {
    link: Link,
    stop: CancellationToken,
}

impl ParentConnection {
    /// Connect over the channel named by the environment. With no parent the
    /// Link is detached: sends are discarded and no stop ever arrives.
    pub fn from_env(config: LinkConfig) -> Self {
        Self::over(Transport::from_env(), config)
    }

    /// Connect over an explicit transport. Overrides the config's stop policy.
    pub fn over(transport: Transport, config: LinkConfig) -> Self {
        let stop = CancellationToken::new();
        let config = config.with_stop_policy(Arc::new(CancelOnStop::new(stop.clone())));
        let link = Link::connect(transport, config);
        Self { link, stop }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn has_parent(&self) -> bool {
        self.link.has_peer()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Announce that handlers are installed.
    pub async fn ready(&self) -> Result<SendOutcome, LinkError> {
        self.link.send_ready().await
    }

    /// Resolve when the parent asks to stop, the parent goes away, or the
    /// process receives SIGINT/SIGTERM.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let reason = tokio::select! {
            _ = self.stop.cancelled() => ShutdownReason::StopRequested,
            _ = self.link.closed() => ShutdownReason::ParentGone,
            _ = ctrl_c => ShutdownReason::Signal,
            _ = terminate => ShutdownReason::Signal,
        };
        tracing::info!(reason = reason.as_str(), "Child shutting down");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{READY_EVENT, STOP_EVENT};
    use serde_json::Value;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn stop_from_parent_resolves_shutdown() {
        let (parent_side, child_side) = Transport::pair();
        let parent = Link::connect(parent_side, LinkConfig::new("parent"));
        let child = ParentConnection::over(child_side, LinkConfig::new("child"));

        let (tx, rx) = tokio::sync::oneshot::channel();
        parent.subscribe_once(READY_EVENT, move |_| {
            let _ = tx.send(());
        });
        assert_eq!(child.ready().await.unwrap(), SendOutcome::Delivered);
        tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();

        parent.send(STOP_EVENT, Value::Null).await.unwrap();
        let reason = tokio::time::timeout(WAIT, child.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::StopRequested);
        assert!(child.stop_token().is_cancelled());
    }

    #[tokio::test]
    async fn parent_going_away_resolves_shutdown() {
        let (parent_side, child_side) = Transport::pair();
        let parent = Link::connect(parent_side, LinkConfig::new("parent"));
        let child = ParentConnection::over(child_side, LinkConfig::new("child"));

        parent.close().await;
        drop(parent);

        let reason = tokio::time::timeout(WAIT, child.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::ParentGone);
    }

    #[tokio::test]
    async fn standalone_child_has_no_parent() {
        let child = ParentConnection::over(Transport::detached(), LinkConfig::new("child"));
        assert!(!child.has_parent());
        assert_eq!(child.ready().await.unwrap(), SendOutcome::Discarded);
    }
}
