//! Driver-side serve loop of the materialization Transactions RPC,
//! hosting a user-supplied [`Transactor`].

use crate::{lifecycle, request_name};
use anyhow::Context;
use link::OpFuture;
use proto_flow::flow;
use proto_flow::materialize::{request, response, Request, Response};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Transactor is a driver's implementation of materialization transactions.
///
/// `load` runs concurrently with `commit` and `acknowledge` of the prior
/// transaction, so receivers are shared and implementations guard their
/// own mutable state. Established implementation patterns:
///
/// * Remote store is authoritative: await `prior_committed` before reading
///   the store, to honor read-committed semantics.
/// * Recovery log is authoritative with an idempotent apply: await
///   `prior_acknowledged` before reading the store, and keep draining the
///   load iterator meanwhile to avoid a deadlock.
/// * Recovery log with a non-transactional store: both signals may be
///   ignored.
#[async_trait::async_trait]
pub trait Transactor: Send + Sync {
    /// Load requested keys which may exist in the store, producing their
    /// documents via `loaded`, until the iterator is drained.
    async fn load(
        &self,
        loads: &mut LoadIterator<'_>,
        prior_committed: OpFuture,
        prior_acknowledged: OpFuture,
        loaded: &LoadedPublisher,
    ) -> anyhow::Result<()>;

    /// All Loaded documents are sent: optionally stage a connector state
    /// to carry on Flushed (the protocol's historical position).
    async fn flush(&self) -> anyhow::Result<Option<flow::ConnectorState>>;

    /// Consume stored documents until the iterator is drained, after which
    /// its `runtime_checkpoint` is available to stage transactionally.
    /// An optionally-returned connector state is carried on the
    /// transaction's StartedCommit.
    async fn store(&self, stores: &mut StoreIterator<'_>)
        -> anyhow::Result<Option<flow::ConnectorState>>;

    /// Commit the staged transaction to the driver's store.
    async fn commit(&self) -> anyhow::Result<()>;

    /// The runtime's recovery log has committed: apply any deferred work.
    /// Must be idempotent, and may be called multiple times per commit.
    async fn acknowledge(&self) -> anyhow::Result<()>;
}

/// One key to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Load {
    pub binding: u32,
    pub packed_key: Vec<u8>,
}

/// One document to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub binding: u32,
    pub packed_key: Vec<u8>,
    pub packed_values: Vec<u8>,
    pub doc_json: Vec<u8>,
    pub exists: bool,
}

#[derive(Debug, Clone, Copy)]
enum Ending {
    Flush,
    Eof,
}

/// LoadIterator yields keys to load until the transaction's Flush.
/// It also surfaces the Acknowledge request which arrives during the load
/// phase, unblocking the concurrent commit-acknowledge task.
pub struct LoadIterator<'s> {
    rx: &'s mut link::ServerRecv<Request>,
    bindings: usize,
    ack: Option<oneshot::Sender<()>>,
    batch: Option<(request::Load, usize)>,
    total_keys: usize,
    ended: Option<Ending>,
    failed: bool,
}

impl LoadIterator<'_> {
    pub async fn next(&mut self) -> Option<anyhow::Result<Load>> {
        loop {
            if let Some((batch, index)) = &mut self.batch {
                if let Some(slice) = batch.packed_keys.get(*index) {
                    *index += 1;
                    self.total_keys += 1;
                    return Some(Ok(Load {
                        binding: batch.binding,
                        packed_key: slice.of(&batch.arena).to_vec(),
                    }));
                }
                self.batch = None;
            }
            if self.ended.is_some() || self.failed {
                return None;
            }

            let req = match self.rx.recv().await {
                Some(req) => req,
                None => {
                    // EOF is a graceful shutdown only at a transaction
                    // boundary. Dropping an un-signalled Acknowledge also
                    // fails the concurrent acknowledge task.
                    let mid_flight = self.ack.is_some() || self.total_keys != 0;
                    self.ack = None;

                    if mid_flight {
                        self.failed = true;
                        return Some(Err(anyhow::anyhow!(
                            "unexpected EOF during the load phase"
                        )));
                    }
                    self.ended = Some(Ending::Eof);
                    return None;
                }
            };
            if let Err(err) = req.validate() {
                self.failed = true;
                return Some(Err(err.into()));
            }
            let received = request_name(&req);

            if let Some(load) = req.load {
                if load.binding as usize >= self.bindings {
                    self.failed = true;
                    return Some(Err(anyhow::anyhow!(
                        "binding {} is out of range (task has {} bindings)",
                        load.binding,
                        self.bindings,
                    )));
                }
                self.batch = Some((load, 0));
            } else if req.flush.is_some() {
                if self.ack.is_some() {
                    self.ack = None;
                    self.failed = true;
                    return Some(Err(anyhow::anyhow!(
                        "Flush precedes the Acknowledge of the prior transaction"
                    )));
                }
                self.ended = Some(Ending::Flush);
                return None;
            } else if req.acknowledge.is_some() {
                match self.ack.take() {
                    Some(signal) => {
                        let _ = signal.send(());
                    }
                    None => {
                        self.failed = true;
                        return Some(Err(anyhow::anyhow!(
                            "unexpected extra Acknowledge during the load phase"
                        )));
                    }
                }
            } else {
                self.failed = true;
                return Some(Err(anyhow::anyhow!(
                    "protocol error (expected Load, Flush, or Acknowledge): got {received}",
                )));
            }
        }
    }
}

/// StoreIterator yields documents to store until the transaction's
/// StartCommit, whose runtime checkpoint it then exposes.
pub struct StoreIterator<'s> {
    rx: &'s mut link::ServerRecv<Request>,
    bindings: usize,
    batch: Option<(request::Store, usize)>,
    runtime_checkpoint: Option<Vec<u8>>,
    failed: bool,
}

impl StoreIterator<'_> {
    pub async fn next(&mut self) -> Option<anyhow::Result<Store>> {
        loop {
            if let Some((batch, index)) = &mut self.batch {
                if let Some(slice) = batch.packed_keys.get(*index) {
                    let i = *index;
                    *index += 1;
                    return Some(Ok(Store {
                        binding: batch.binding,
                        packed_key: slice.of(&batch.arena).to_vec(),
                        packed_values: batch.packed_values[i].of(&batch.arena).to_vec(),
                        doc_json: batch.docs_json[i].of(&batch.arena).to_vec(),
                        exists: batch.exists[i],
                    }));
                }
                self.batch = None;
            }
            if self.runtime_checkpoint.is_some() || self.failed {
                return None;
            }

            let req = match self.rx.recv().await {
                Some(req) => req,
                None => {
                    self.failed = true;
                    return Some(Err(anyhow::anyhow!(
                        "unexpected EOF during the store phase"
                    )));
                }
            };
            if let Err(err) = req.validate() {
                self.failed = true;
                return Some(Err(err.into()));
            }
            let received = request_name(&req);

            if let Some(store) = req.store {
                if store.binding as usize >= self.bindings {
                    self.failed = true;
                    return Some(Err(anyhow::anyhow!(
                        "binding {} is out of range (task has {} bindings)",
                        store.binding,
                        self.bindings,
                    )));
                }
                self.batch = Some((store, 0));
            } else if let Some(start) = req.start_commit {
                self.runtime_checkpoint = Some(start.runtime_checkpoint);
                return None;
            } else {
                self.failed = true;
                return Some(Err(anyhow::anyhow!(
                    "protocol error (expected Store or StartCommit): got {received}",
                )));
            }
        }
    }

    /// The runtime checkpoint of this transaction's StartCommit,
    /// available once the iterator has drained.
    pub fn runtime_checkpoint(&self) -> Option<&[u8]> {
        self.runtime_checkpoint.as_deref()
    }
}

/// LoadedPublisher stages Loaded documents back to the runtime.
/// Batches are sent under the transmit lock, so a Loaded response is
/// never interleaved with a commit in progress.
pub struct LoadedPublisher {
    tx: Arc<Mutex<link::ServerSend<Response>>>,
    staged: std::sync::Mutex<Option<response::Loaded>>,
}

impl LoadedPublisher {
    pub async fn loaded(&self, binding: u32, doc_json: &[u8]) -> anyhow::Result<()> {
        let flushed = {
            let mut staged = self.staged.lock().unwrap();
            lifecycle::stage_loaded(&mut staged, binding, doc_json)
        };
        if let Some(loaded) = flushed {
            self.tx
                .lock()
                .await
                .send(Response {
                    loaded: Some(loaded),
                    ..Default::default()
                })
                .await;
        }
        Ok(())
    }

    async fn flush_staged(&self) {
        let staged = self.staged.lock().unwrap().take();
        if let Some(loaded) = staged {
            self.tx
                .lock()
                .await
                .send(Response {
                    loaded: Some(loaded),
                    ..Default::default()
                })
                .await;
        }
    }
}

// Commit and acknowledgement state of the prior transaction,
// settled within the following round.
struct PriorState {
    committed_op: link::AsyncOperation,
    acknowledged_op: link::AsyncOperation,
    state: Option<flow::ConnectorState>,
}

/// Serve materialization transactions over the RPC, hosting the
/// Transactor built by `new_transactor` from the stream's Open.
pub async fn serve<T, F, Fut>(
    server: link::Server<Request, Response>,
    new_transactor: F,
) -> anyhow::Result<()>
where
    T: Transactor,
    F: FnOnce(request::Open) -> Fut,
    Fut: Future<Output = anyhow::Result<(T, response::Opened)>>,
{
    let (mut rx, tx) = server.into_parts();
    let tx = Arc::new(Mutex::new(tx));

    let result = serve_inner(&mut rx, &tx, new_transactor).await;
    if let Err(err) = &result {
        tracing::error!(error = ?err, "materialization transactions failed");
        tx.lock().await.fail(anyhow::anyhow!("{err:#}")).await;
    }
    result
}

async fn serve_inner<T, F, Fut>(
    rx: &mut link::ServerRecv<Request>,
    tx: &Arc<Mutex<link::ServerSend<Response>>>,
    new_transactor: F,
) -> anyhow::Result<()>
where
    T: Transactor,
    F: FnOnce(request::Open) -> Fut,
    Fut: Future<Output = anyhow::Result<(T, response::Opened)>>,
{
    let req = rx
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("unexpected EOF while awaiting Open"))?;
    req.validate()?;
    let received = request_name(&req);
    let Some(open) = req.open else {
        anyhow::bail!("protocol error (expected Open): got {received}");
    };
    let bindings = open
        .materialization
        .as_ref()
        .map(|m| m.bindings.len())
        .unwrap_or_default();

    let (transactor, opened) = new_transactor(open).await?;
    tx.lock()
        .await
        .send(Response {
            opened: Some(opened),
            ..Default::default()
        })
        .await;

    let publisher = LoadedPublisher {
        tx: tx.clone(),
        staged: std::sync::Mutex::new(None),
    };

    let mut prior: Option<PriorState> = None;
    let mut prior_committed = OpFuture::resolved();
    let mut prior_acknowledged = OpFuture::resolved();
    let mut round = 0usize;

    loop {
        let (ack_signal_tx, ack_signal_rx) = oneshot::channel::<()>();
        let mut loads = LoadIterator {
            rx: &mut *rx,
            bindings,
            ack: Some(ack_signal_tx),
            batch: None,
            total_keys: 0,
            ended: None,
            failed: false,
        };
        let this_prior = prior.take();

        let commit_ack = async {
            // Loaded responses cannot be sent while the prior transaction
            // is committing: the transmit lock is held across commit().
            let acknowledged_op = {
                let mut tx = tx.lock().await;
                match this_prior {
                    Some(p) => {
                        transactor.commit().await.context("transactor.commit")?;
                        p.committed_op.resolve(Ok(()));
                        tx.send(Response {
                            started_commit: Some(response::StartedCommit { state: p.state }),
                            ..Default::default()
                        })
                        .await;
                        Some(p.acknowledged_op)
                    }
                    None => None,
                }
            };

            // Await the client's Acknowledge, surfaced by the load iterator.
            if ack_signal_rx.await.is_err() {
                anyhow::bail!("stream closed before the prior transaction was acknowledged");
            }
            transactor
                .acknowledge()
                .await
                .context("transactor.acknowledge")?;
            tx.lock()
                .await
                .send(Response {
                    acknowledged: Some(response::Acknowledged {}),
                    ..Default::default()
                })
                .await;
            if let Some(op) = acknowledged_op {
                op.resolve(Ok(()));
            }
            Ok::<(), anyhow::Error>(())
        };

        let load = async {
            transactor
                .load(
                    &mut loads,
                    prior_committed.clone(),
                    prior_acknowledged.clone(),
                    &publisher,
                )
                .await
                .context("transactor.load")
        };

        tokio::try_join!(commit_ack, load)?;

        // Drain any loads the transactor left unconsumed,
        // and send any partial Loaded batch ahead of Flushed.
        while let Some(load) = loads.next().await {
            let _ = load?;
        }
        publisher.flush_staged().await;

        let ending = loads.ended;
        std::mem::drop(loads);

        match ending {
            Some(Ending::Eof) => return Ok(()),
            Some(Ending::Flush) => (),
            None => anyhow::bail!("load phase ended without a Flush"),
        }

        let flushed_state = transactor.flush().await.context("transactor.flush")?;
        tx.lock()
            .await
            .send(Response {
                flushed: Some(response::Flushed {
                    state: flushed_state,
                }),
                ..Default::default()
            })
            .await;

        let mut stores = StoreIterator {
            rx: &mut *rx,
            bindings,
            batch: None,
            runtime_checkpoint: None,
            failed: false,
        };
        let state = transactor
            .store(&mut stores)
            .await
            .context("transactor.store")?;
        while let Some(store) = stores.next().await {
            let _ = store?;
        }
        if stores.runtime_checkpoint.is_none() {
            anyhow::bail!("store phase ended without a StartCommit");
        }

        tracing::debug!(round, "transaction round complete");
        round += 1;

        let (committed_op, committed_fut) = link::async_op();
        let (acknowledged_op, acknowledged_fut) = link::async_op();
        prior = Some(PriorState {
            committed_op,
            acknowledged_op,
            state,
        });
        prior_committed = committed_fut;
        prior_acknowledged = acknowledged_fut;
    }
}
