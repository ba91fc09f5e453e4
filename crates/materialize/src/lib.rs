//! Protocol state machines of the materialization runtime: the
//! transaction client driving the five-phase materialization transaction,
//! and the driver-side serve loop hosting a [`Transactor`].

use proto_flow::materialize::Response;

pub mod lifecycle;

mod client;
pub use client::{Options, TxnClient};

mod server;
pub use server::{
    serve, Load, LoadIterator, LoadedPublisher, Store, StoreIterator, Transactor,
};

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
    #[error("unexpected EOF while a transaction is still in flight")]
    UnexpectedEof,
    #[error("transaction is full: commit it and defer the document to the next transaction")]
    TransactionFull,
    #[error("the prior transaction must be acknowledged before Flush")]
    MissingAcknowledge,
    #[error("loaded key {key} was not requested")]
    LoadedKeyNotRequested { key: String },
    #[error("combiner of binding {binding} drained {drained} documents, but only {flighted} keys are flighted")]
    DrainedExcessDocuments {
        binding: u32,
        drained: usize,
        flighted: usize,
    },
    #[error("awaiting Acknowledged of the prior transaction")]
    Acknowledged(#[source] link::OpError),
    #[error("combiner.combine_right: {0:#}")]
    CombineRight(anyhow::Error),
    #[error("combiner.reduce_left: {0:#}")]
    ReduceLeft(anyhow::Error),
    #[error("combiner.drain: {0:#}")]
    Drain(anyhow::Error),
    #[error("building combiner for binding {binding}: {error:#}")]
    NewCombiner { binding: usize, error: anyhow::Error },
    #[error("{0:#}")]
    Transport(anyhow::Error),
    #[error("the transactions stream has already failed")]
    AlreadyFailed,
}

fn response_name(resp: &Response) -> &'static str {
    if resp.opened.is_some() {
        "Opened"
    } else if resp.loaded.is_some() {
        "Loaded"
    } else if resp.flushed.is_some() {
        "Flushed"
    } else if resp.started_commit.is_some() {
        "StartedCommit"
    } else if resp.acknowledged.is_some() {
        "Acknowledged"
    } else {
        "(empty)"
    }
}

fn request_name(req: &proto_flow::materialize::Request) -> &'static str {
    if req.open.is_some() {
        "Open"
    } else if req.load.is_some() {
        "Load"
    } else if req.flush.is_some() {
        "Flush"
    } else if req.store.is_some() {
        "Store"
    } else if req.start_commit.is_some() {
        "StartCommit"
    } else if req.acknowledge.is_some() {
        "Acknowledge"
    } else {
        "(empty)"
    }
}
