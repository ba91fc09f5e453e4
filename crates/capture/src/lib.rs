//! Protocol state machines of the capture runtime: the client of
//! pull-style captures, the server of push-style captures, and their
//! shared transaction coordinator.

use proto_flow::capture::{PullResponse, PushRequest};

mod coordinator;
pub use coordinator::PendingCommit;

pub mod lifecycle;
pub use lifecycle::read_push_checkpoint;

mod pull;
pub use pull::PullClient;

mod push;
pub use push::{Push, PushOptions, PushServer, Pusher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("binding {binding} is out of range (task has {count} bindings)")]
    BindingRange { binding: u32, count: usize },
    #[error("protocol error (expected {expected}): got {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
    #[error(transparent)]
    Validate(#[from] proto_flow::ValidateError),
    #[error("too many documents without a checkpoint ({bytes} bytes vs max of {max})")]
    CheckpointOverflow { bytes: usize, max: usize },
    #[error("unexpected EOF while a transaction is still in flight")]
    UnexpectedEof,
    #[error("capture task was cancelled")]
    Cancelled,
    #[error("capture {0:?} is not served here")]
    CaptureNotFound(String),
    #[error("recovery log commit")]
    LogCommit(#[source] link::OpError),
    #[error("combiner.combine_right: {0:#}")]
    CombineRight(anyhow::Error),
    #[error("reducing driver checkpoint")]
    ReduceCheckpoint(#[from] proto_flow::flow::ReduceError),
    #[error("building combiner for binding {binding}: {error:#}")]
    NewCombiner { binding: usize, error: anyhow::Error },
    #[error("{0:#}")]
    Transport(anyhow::Error),
    #[error("capture loop has terminated: {0}")]
    Terminated(String),
}

// Names of set message variants, for protocol errors.

fn pull_response_name(resp: &PullResponse) -> &'static str {
    if resp.opened.is_some() {
        "Opened"
    } else if resp.documents.is_some() {
        "Documents"
    } else if resp.checkpoint.is_some() {
        "Checkpoint"
    } else {
        "(empty)"
    }
}

fn push_request_name(req: &PushRequest) -> &'static str {
    if req.open.is_some() {
        "Open"
    } else if req.documents.is_some() {
        "Documents"
    } else if req.checkpoint.is_some() {
        "Checkpoint"
    } else {
        "(empty)"
    }
}
