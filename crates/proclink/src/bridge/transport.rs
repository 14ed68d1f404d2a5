//! Duplex byte transports a Link can sit on.
//!
//! - **ChildProcess**: a spawned child's stdin (outbound) and stdout (inbound)
//! - **CurrentProcess**: this process's stdout (outbound) and stdin (inbound)
//! - **Stream**: any AsyncRead/AsyncWrite pair (sockets, in-memory duplex)
//! - **Detached**: no peer at all; outbound messages are discarded

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// Environment variable the parent sets so the child knows its stdio is a channel.
pub const CHANNEL_ENV: &str = "PROCLINK_CHANNEL";

/// Value of [`CHANNEL_ENV`] selecting the stdin/stdout channel.
pub const STDIO_CHANNEL: &str = "stdio";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ChildProcess,
    CurrentProcess,
    Stream,
    Detached,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChildProcess => "child_process",
            Self::CurrentProcess => "current_process",
            Self::Stream => "stream",
            Self::Detached => "detached",
        }
    }
}

/// One end of a duplex channel.
pub struct Transport {
    kind: TransportKind,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl Transport {
    /// Take a spawned child's stdin/stdout. Both must have been piped.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "stdout not captured"))?;

        Ok(Self {
            kind: TransportKind::ChildProcess,
            reader: Some(Box::new(stdout)),
            writer: Some(Box::new(stdin)),
        })
    }

    /// This process's own stdin/stdout. Only meaningful when a parent set up
    /// the pipes; see [`Transport::from_env`]. Must run inside a tokio runtime.
    pub fn current_process() -> Self {
        Self {
            kind: TransportKind::CurrentProcess,
            reader: Some(stdin_reader()),
            writer: Some(Box::new(tokio::io::stdout())),
        }
    }

    /// Pick the channel advertised by the parent, or detach when there is none.
    pub fn from_env() -> Self {
        let channel = std::env::var(CHANNEL_ENV).ok();
        Self::from_channel(channel.as_deref())
    }

    pub fn from_channel(channel: Option<&str>) -> Self {
        match channel {
            Some(STDIO_CHANNEL) => Self::current_process(),
            Some(other) => {
                tracing::warn!(channel = other, "Unknown channel kind, running detached");
                Self::detached()
            }
            None => {
                tracing::debug!("No parent channel advertised, running detached");
                Self::detached()
            }
        }
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            kind: TransportKind::Stream,
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }

    /// A transport with no peer. Sends are discarded, nothing is ever received.
    pub fn detached() -> Self {
        Self {
            kind: TransportKind::Detached,
            reader: None,
            writer: None,
        }
    }

    /// Two connected in-memory transports.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::from_io(a_read, a_write),
            Self::from_io(b_read, b_write),
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn has_peer(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn into_parts(self) -> (TransportKind, Option<BoxedReader>, Option<BoxedWriter>) {
        (self.kind, self.reader, self.writer)
    }
}

/// Inbound half for [`Transport::current_process`].
///
/// `tokio::io::stdin` reads on a blocking thread that runtime shutdown waits
/// for, and that read never finishes while the parent holds the pipe open.
/// A pipe on fd 0 is read through the reactor instead.
#[cfg(unix)]
fn stdin_reader() -> BoxedReader {
    use std::os::fd::AsFd;
    use tokio::net::unix::pipe;

    let receiver = std::io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .and_then(|fd| pipe::Receiver::from_file(std::fs::File::from(fd)));
    match receiver {
        Ok(receiver) => Box::new(receiver),
        Err(e) => {
            tracing::debug!(error = %e, "stdin is not a pipe, reading on a blocking thread");
            Box::new(tokio::io::stdin())
        }
    }
}

#[cfg(not(unix))]
fn stdin_reader() -> BoxedReader {
    Box::new(tokio::io::stdin())
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("has_peer", &self.has_peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_channel_detaches() {
        let t = Transport::from_channel(None);
        assert_eq!(t.kind(), TransportKind::Detached);
        assert!(!t.has_peer());
    }

    #[test]
    fn unknown_channel_detaches() {
        let t = Transport::from_channel(Some("carrier-pigeon"));
        assert_eq!(t.kind(), TransportKind::Detached);
    }

    #[tokio::test]
    async fn stdio_channel_uses_current_process() {
        let t = Transport::from_channel(Some(STDIO_CHANNEL));
        assert_eq!(t.kind(), TransportKind::CurrentProcess);
        assert!(t.has_peer());
    }

    #[tokio::test]
    async fn pair_is_connected() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = Transport::pair();
        let (_, _, a_writer) = a.into_parts();
        let (_, b_reader, _) = b.into_parts();

        let mut a_writer = a_writer.unwrap();
        let mut b_reader = b_reader.unwrap();

        a_writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
