//! Process controller - owns a child process and the Link to it.
//!
//! Flow:
//! 1. Spawn the child with piped stdin/stdout
//! 2. Build a Link over the pipes, subscribe to `"ready"`, start reading
//! 3. Wait for `"ready"` (bounded), or fail if the child exits first
//! 4. Running: application traffic over `link()`
//! 5. `stop_child` asks the child to exit; `kill_child` terminates it
//!
//! A monitor task owns the `Child`, reaps it and publishes the exit outcome
//! on a watch channel, so any number of callers can wait for completion.

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::bridge::protocol::{READY_EVENT, STOP_EVENT};
use crate::bridge::transport::{CHANNEL_ENV, STDIO_CHANNEL, Transport};
use crate::link::{Link, LinkConfig, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Killed,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Killed => "killed",
            Self::Terminated => "terminated",
        }
    }

    /// States in which the child may still be alive.
    pub fn has_live_child(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Read-only description of the spawned child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub target: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("must specify process target")]
    MissingTarget,
}

/// Extension point for different spawn strategies.
///
/// Implementations must pipe stdin and stdout; stderr is left to the
/// implementation.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, target: &str, args: &[String]) -> Result<Child, SpawnError>;
}

/// Runs `target` directly with the stdio channel advertised in the environment.
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, target: &str, args: &[String]) -> Result<Child, SpawnError> {
        let child = Command::new(OsStr::new(target))
            .args(args)
            .env(CHANNEL_ENV, STDIO_CHANNEL)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Clone)]
pub struct ControllerConfig {
    pub link: LinkConfig,
    /// Bound on the ready handshake. `None` waits forever.
    pub ready_timeout: Option<Duration>,
    /// How long a killed child has to exit after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::new("child"),
            ready_timeout: Some(Duration::from_secs(30)),
            kill_grace: Duration::from_secs(5),
            spawner: Arc::new(CommandSpawner),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("child did not send ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("child exited before sending ready ({})", describe_exit(.0))]
    ExitedBeforeReady(Option<ExitOutcome>),
    #[error("child exit status unavailable")]
    ExitUnknown,
    #[error(transparent)]
    Link(#[from] LinkError),
}

fn describe_exit(outcome: &Option<ExitOutcome>) -> String {
    match outcome {
        Some(outcome) => outcome.to_string(),
        None => "unknown exit status".to_string(),
    }
}

/// Owns one child process and the Link to it.
pub struct ProcessController {
    config: ControllerConfig,
    state: LifecycleState,
    link: Option<Link>,
    process: Option<ProcessInfo>,
    exit_rx: Option<watch::Receiver<Option<ExitOutcome>>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl ProcessController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            state: LifecycleState::Unstarted,
            link: None,
            process: None,
            exit_rx: None,
            kill_tx: None,
        }
    }

    /// Create a controller and start `target` in one step.
    pub async fn spawn<I, A>(
        target: &str,
        args: I,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError>
    where
        I: IntoIterator<Item = A>,
        A: ToString,
    {
        let mut controller = Self::new(config);
        controller.start(target, args).await?;
        Ok(controller)
    }

    /// Spawn `target` and wait for its `"ready"`. Valid once per controller.
    pub async fn start<I, A>(&mut self, target: &str, args: I) -> Result<(), ControllerError>
    where
        I: IntoIterator<Item = A>,
        A: ToString,
    {
        self.require("start", |s| s == LifecycleState::Unstarted)?;
        if target.is_empty() {
            return Err(SpawnError::MissingTarget.into());
        }

        let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
        self.state = LifecycleState::Starting;

        tracing::info!(%target, ?args, "Spawning child process");
        let mut child = match self.spawn_child(target, &args) {
            Ok(child) => child,
            Err(e) => {
                self.state = LifecycleState::Terminated;
                return Err(e.into());
            }
        };
        let transport = match Transport::from_child(&mut child) {
            Ok(transport) => transport,
            Err(e) => {
                self.state = LifecycleState::Terminated;
                return Err(SpawnError::Spawn(e).into());
            }
        };
        let pid = child.id();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor_child(child, kill_rx, exit_tx, self.config.kill_grace));

        let (link, pump) = Link::unstarted(transport, self.config.link.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        link.subscribe_once(READY_EVENT, move |_| {
            let _ = ready_tx.send(());
        });
        if let Some(pump) = pump {
            pump.spawn();
        }

        self.link = Some(link.clone());
        self.process = Some(ProcessInfo {
            target: target.to_string(),
            args,
            pid,
        });
        self.exit_rx = Some(exit_rx.clone());
        self.kill_tx = Some(kill_tx);

        tracing::debug!(%target, ?pid, "Waiting for ready from child");
        let handshake = await_ready(&link, ready_rx, exit_rx);
        let result = match self.config.ready_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(%target, ?timeout, "Child did not send ready in time");
                    Err(ControllerError::ReadyTimeout(timeout))
                }
            },
            None => handshake.await,
        };

        match result {
            Ok(()) => {
                tracing::info!(%target, ?pid, "Child says it's ready");
                self.state = LifecycleState::Running;
                Ok(())
            }
            Err(ControllerError::ExitedBeforeReady(outcome)) => {
                tracing::error!(%target, exit = %describe_exit(&outcome), "Child exited before ready");
                self.state = LifecycleState::Terminated;
                Err(ControllerError::ExitedBeforeReady(outcome))
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_child(&self, target: &str, args: &[String]) -> Result<Child, SpawnError> {
        self.config.spawner.spawn(target, args)
    }

    /// Wait for the child to terminate. Any number of callers may wait; all
    /// observe the same outcome.
    pub async fn wait_for_completion(&self) -> Result<ExitOutcome, ControllerError> {
        let Some(exit_rx) = self.exit_rx.clone() else {
            return Err(ControllerError::InvalidState {
                operation: "wait for completion",
                state: self.state(),
            });
        };
        wait_for_exit(exit_rx).await.ok_or(ControllerError::ExitUnknown)
    }

    /// Ask the child to shut itself down. Does not wait for exit.
    pub async fn stop_child(&mut self) -> Result<(), ControllerError> {
        self.require("stop", |s| s == LifecycleState::Running)?;
        let link = self.link()?.clone();

        tracing::info!(link = %link.name(), "Sending stop to child");
        link.send(STOP_EVENT, Value::Null).await?;
        self.state = LifecycleState::Stopping;
        Ok(())
    }

    /// Cooperative stop bounded by `timeout`; kills the child if it does not
    /// exit in time. Returns within `timeout` plus the configured kill grace.
    pub async fn stop_and_wait(&mut self, timeout: Duration) -> Result<ExitOutcome, ControllerError> {
        self.stop_child().await?;
        match tokio::time::timeout(timeout, self.wait_for_completion()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?timeout, "Child ignored stop, killing");
                self.kill_child().await?;
                self.wait_for_completion().await
            }
        }
    }

    /// Terminate the child and release the Link. The controller is spent
    /// afterwards; pending requests fail with a link-closed error.
    pub async fn kill_child(&mut self) -> Result<(), ControllerError> {
        self.require("kill", |s| s.has_live_child())?;

        tracing::info!(pid = ?self.process.as_ref().and_then(|p| p.pid), "Killing child");
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.state = LifecycleState::Killed;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        if self.state.has_live_child() && self.has_exited() {
            LifecycleState::Terminated
        } else {
            self.state
        }
    }

    fn has_exited(&self) -> bool {
        self.exit_rx
            .as_ref()
            .map(|rx| rx.borrow().is_some())
            .unwrap_or(false)
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: impl Fn(LifecycleState) -> bool,
    ) -> Result<(), ControllerError> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(ControllerError::InvalidState { operation, state })
        }
    }

    /// The Link to the child. Unavailable before start and after kill.
    pub fn link(&self) -> Result<&Link, ControllerError> {
        self.link.as_ref().ok_or(ControllerError::InvalidState {
            operation: "access link",
            state: self.state(),
        })
    }

    pub fn process(&self) -> Option<&ProcessInfo> {
        self.process.as_ref()
    }
}

async fn await_ready(
    link: &Link,
    mut ready_rx: oneshot::Receiver<()>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
) -> Result<(), ControllerError> {
    tokio::select! {
        biased;

        ready = &mut ready_rx => ready.map_err(|_| ControllerError::Link(LinkError::Closed)),
        outcome = wait_for_exit(exit_rx) => {
            // A child may send ready and exit right away; let the pump drain
            // what is left on the pipe before deciding.
            let _ = tokio::time::timeout(Duration::from_secs(1), link.closed()).await;
            match ready_rx.try_recv() {
                Ok(()) => Ok(()),
                Err(_) => Err(ControllerError::ExitedBeforeReady(outcome)),
            }
        }
    }
}

async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitOutcome>>) -> Option<ExitOutcome> {
    match exit_rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => *outcome,
        Err(_) => None,
    }
}

/// Reap the child. Terminates it when `kill_rx` fires or its sender is
/// dropped (the controller went away). A child still alive `grace` after
/// SIGTERM is killed outright.
async fn monitor_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            terminate(&mut child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?grace, "Child still running after SIGTERM, sending SIGKILL");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "Failed to kill child");
                    }
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => {
            let outcome = ExitOutcome::from(status);
            tracing::info!(code = ?outcome.code, signal = ?outcome.signal, "Child exited");
            let _ = exit_tx.send(Some(outcome));
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for child");
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM, forcing kill");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_state_strings() {
        assert_eq!(LifecycleState::Unstarted.to_string(), "unstarted");
        assert_eq!(LifecycleState::Stopping.as_str(), "stopping");
        assert!(LifecycleState::Running.has_live_child());
        assert!(!LifecycleState::Killed.has_live_child());
        assert!(!LifecycleState::Terminated.has_live_child());
    }

    #[test]
    fn exit_outcome_display() {
        let ok = ExitOutcome {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        assert_eq!(ok.to_string(), "exit code 0");

        let signalled = ExitOutcome {
            code: None,
            signal: Some(15),
        };
        assert!(!signalled.success());
        assert_eq!(signalled.to_string(), "signal 15");
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let mut controller = ProcessController::default();
        assert_eq!(controller.state(), LifecycleState::Unstarted);

        assert!(matches!(
            controller.stop_child().await,
            Err(ControllerError::InvalidState {
                state: LifecycleState::Unstarted,
                ..
            })
        ));
        assert!(matches!(
            controller.kill_child().await,
            Err(ControllerError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.wait_for_completion().await,
            Err(ControllerError::InvalidState { .. })
        ));
        assert!(controller.link().is_err());
        assert!(controller.process().is_none());
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let mut controller = ProcessController::default();
        let err = controller.start("", Vec::<String>::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Spawn(SpawnError::MissingTarget)));
        assert_eq!(controller.state(), LifecycleState::Unstarted);
    }

    #[tokio::test]
    async fn failed_spawn_spends_the_controller() {
        let mut controller = ProcessController::default();
        let err = controller
            .start("/nonexistent/proclink-test-binary", [1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Spawn(SpawnError::Spawn(_))));
        assert_eq!(controller.state(), LifecycleState::Terminated);

        let again = controller
            .start("/nonexistent/proclink-test-binary", [1])
            .await
            .unwrap_err();
        assert!(matches!(again, ControllerError::InvalidState { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_escalates_when_child_ignores_sigterm() {
        // Sends a framed "ready" envelope (29 bytes), then ignores SIGTERM.
        let script = r#"trap '' TERM; printf '\000\000\000\035{"event":"ready","data":null}'; exec sleep 30"#;
        let config = ControllerConfig::new()
            .with_ready_timeout(Some(Duration::from_secs(5)))
            .with_kill_grace(Duration::from_millis(200));
        let mut controller = ProcessController::spawn("/bin/sh", ["-c", script], config)
            .await
            .unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            controller.stop_and_wait(Duration::from_millis(200)),
        )
        .await
        .expect("stop_and_wait must be bounded")
        .unwrap();
        assert_eq!(outcome.signal, Some(9));
        assert_eq!(controller.state(), LifecycleState::Killed);
    }

    #[test]
    fn exited_before_ready_message() {
        let err = ControllerError::ExitedBeforeReady(Some(ExitOutcome {
            code: Some(3),
            signal: None,
        }));
        assert_eq!(err.to_string(), "child exited before sending ready (exit code 3)");
    }
}
