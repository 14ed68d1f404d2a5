//! proclink: typed events and request/reply between a parent process and its child.

pub mod bridge;
pub mod controller;
pub mod link;
pub mod logging;
pub mod request;
pub mod worker;

pub use bridge::protocol::{Envelope, READY_EVENT, STOP_EVENT};
pub use bridge::transport::{Transport, TransportKind};
pub use controller::{
    CommandSpawner, ControllerConfig, ControllerError, ExitOutcome, LifecycleState,
    ProcessController, ProcessInfo, ProcessSpawner, SpawnError,
};
pub use link::{
    CancelOnStop, CloseReason, ExitOnStop, IgnoreStop, Link, LinkConfig, LinkError, SendOutcome,
    StopPolicy, SubscriptionId,
};
pub use request::{RandomReplyIds, ReplyIdGenerator, RequestError, SequentialReplyIds};
pub use worker::{ParentConnection, ShutdownReason};
