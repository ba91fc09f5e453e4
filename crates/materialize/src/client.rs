//! Runtime-side client of the materialization Transactions RPC.

use crate::{lifecycle, response_name, Error};
use fxhash::FxHashMap;
use link::{async_op, AsyncOperation, OpFuture};
use std::collections::hash_map::Entry;
use proto_flow::materialize::{request, response, Request, Response};
use proto_flow::{flow, Combiner};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Bound of keys which may be flighted within a single transaction.
pub const MAX_FLIGHTED_KEYS: usize = 10_000_000;
/// Bound of documents retained per binding across transactions.
pub const CACHED_DOCUMENT_BOUND: usize = 2048;
/// Bound of a single retained document's size.
pub const CACHED_DOCUMENT_MAX_SIZE: usize = 1 << 15; // 32 KiB

#[derive(Debug, Clone)]
pub struct Options {
    pub max_flighted_keys: usize,
    pub cached_document_bound: usize,
    pub cached_document_max_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_flighted_keys: MAX_FLIGHTED_KEYS,
            cached_document_bound: CACHED_DOCUMENT_BOUND,
            cached_document_max_size: CACHED_DOCUMENT_MAX_SIZE,
        }
    }
}

// Combiners and flighted-key maps of the current transaction, shared
// between the foreground caller and the background Loaded reader.
#[derive(Debug)]
struct Round<C: Combiner> {
    combiners: Vec<C>,
    // Per-binding map of packed key to an optional retained document.
    // None marks a key touched within this transaction; Some retains the
    // document stored by the prior transaction for reduction without a Load.
    flighted: Vec<FxHashMap<Vec<u8>, Option<Vec<u8>>>>,
    // Resolver of the prior transaction's Acknowledged.
    ack_slot: Option<AsyncOperation>,
}

#[derive(Debug)]
enum ReadEvent {
    Flushed(response::Flushed),
    StartedCommit(response::StartedCommit),
}

/// TxnClient drives materialization transactions over an opened RPC:
/// documents are added and combined, novel keys of non-delta-updates
/// bindings are loaded, and each transaction then flushes, stores, and
/// starts to commit, pipelined such that the next transaction's documents
/// are added while the prior transaction's commit is still in flight.
#[derive(Debug)]
pub struct TxnClient<C: Combiner> {
    tx: link::SendHalf<Request>,
    shared: Arc<Mutex<Round<C>>>,
    events: mpsc::Receiver<ReadEvent>,
    reader: Option<tokio::task::JoinHandle<Result<(), Error>>>,
    // Acknowledged future of the transaction now committing,
    // and whether its Acknowledge request has been sent.
    pending_ack: Option<(OpFuture, bool)>,
    staged_load: Option<request::Load>,
    // Connector state staged by Flushed, the protocol's historical
    // position. StartedCommit's state is preferred when both are set.
    staged_state: Option<flow::ConnectorState>,
    delta_updates: Vec<bool>,
    runtime_checkpoint: Vec<u8>,
    options: Options,
}

impl<C: Combiner> TxnClient<C> {
    /// Open materialization transactions over the given RPC client,
    /// building per-binding combiners via `new_combiner`. The opening
    /// handshake re-acknowledges the prior commit, which may have been
    /// unfinished when the RPC last closed, and completes before return:
    /// a Flush may never precede the first Acknowledged.
    pub async fn open<F>(
        client: link::Client<Request, Response>,
        spec: flow::MaterializationSpec,
        version: String,
        range: flow::RangeSpec,
        state_json: Vec<u8>,
        options: Options,
        mut new_combiner: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(&flow::materialization_spec::Binding) -> anyhow::Result<C>,
    {
        let mut combiners = Vec::with_capacity(spec.bindings.len());
        for (index, binding) in spec.bindings.iter().enumerate() {
            combiners.push(new_combiner(binding).map_err(|error| Error::NewCombiner {
                binding: index,
                error,
            })?);
        }
        let delta_updates: Vec<bool> =
            spec.bindings.iter().map(|b| b.delta_updates).collect();
        let flighted = vec![FxHashMap::default(); delta_updates.len()];

        let open = Request {
            open: Some(request::Open {
                materialization: Some(spec),
                version,
                range: Some(range),
                state_json,
            }),
            ..Default::default()
        };
        open.validate()?;

        let (mut tx, mut rx) = client.into_parts();
        tx.send(open)
            .await
            .map_err(|closed| Error::Transport(closed.into()))?;

        let resp = Self::recv(&mut rx).await?;
        let received = response_name(&resp);
        let Some(opened) = resp.opened else {
            return Err(Error::UnexpectedMessage {
                expected: "Opened",
                received,
            });
        };

        tx.send(Request {
            acknowledge: Some(request::Acknowledge {}),
            ..Default::default()
        })
        .await
        .map_err(|closed| Error::Transport(closed.into()))?;

        let resp = Self::recv(&mut rx).await?;
        if resp.acknowledged.is_none() {
            return Err(Error::UnexpectedMessage {
                expected: "Acknowledged",
                received: response_name(&resp),
            });
        }

        let shared = Arc::new(Mutex::new(Round {
            combiners,
            flighted,
            ack_slot: None,
        }));
        let (events_tx, events_rx) = mpsc::channel(1);

        let reader = tokio::spawn({
            let shared = shared.clone();
            async move {
                let result = read_loop(rx, &shared, events_tx).await;
                if let Err(err) = &result {
                    // Wake any observer of the pending acknowledgement.
                    if let Some(op) = shared.lock().unwrap().ack_slot.take() {
                        op.resolve(Err(anyhow::anyhow!("transactions stream failed: {err}")));
                    }
                }
                result
            }
        });

        Ok(Self {
            tx,
            shared,
            events: events_rx,
            reader: Some(reader),
            pending_ack: None,
            staged_load: None,
            staged_state: None,
            delta_updates,
            runtime_checkpoint: opened.runtime_checkpoint,
            options,
        })
    }

    /// The runtime checkpoint which the driver's Opened requested to
    /// resume from, or empty if it had no stateful opinion.
    pub fn runtime_checkpoint(&self) -> &[u8] {
        &self.runtime_checkpoint
    }

    /// Add a document of the current transaction, combining it over prior
    /// documents of its key and loading the key's stored document when the
    /// binding requires it. Returns [`Error::TransactionFull`] once the
    /// flighted-key bound is reached: the caller must commit this
    /// transaction and defer the document to the next one.
    pub async fn add_document(
        &mut self,
        binding: u32,
        packed_key: &[u8],
        doc_json: &[u8],
    ) -> Result<(), Error> {
        let delta = *self
            .delta_updates
            .get(binding as usize)
            .ok_or(Error::BindingRange {
                binding,
                count: self.delta_updates.len(),
            })?;

        let send_load = {
            let mut round = self.shared.lock().unwrap();
            let round = &mut *round;

            let total: usize = round.flighted.iter().map(|m| m.len()).sum();
            let combiner = &mut round.combiners[binding as usize];
            let flighted = &mut round.flighted[binding as usize];

            match flighted.entry(packed_key.to_vec()) {
                Entry::Occupied(mut entry) => {
                    // If the key retains a document of the prior
                    // transaction's store, reduce it first, honoring the
                    // cache. Only non-delta-updates bindings ever retain.
                    if let Some(retained) = entry.get_mut().take() {
                        combiner.reduce_left(&retained).map_err(Error::ReduceLeft)?;
                    }
                    combiner
                        .combine_right(doc_json)
                        .map_err(Error::CombineRight)?;
                    false
                }
                // Novel key.
                Entry::Vacant(entry) => {
                    if total >= self.options.max_flighted_keys {
                        return Err(Error::TransactionFull);
                    }
                    combiner
                        .combine_right(doc_json)
                        .map_err(Error::CombineRight)?;
                    entry.insert(None);
                    !delta
                }
            }
        };

        // The state mutex is never held across a send.
        if send_load {
            if let Some(load) = lifecycle::stage_load(&mut self.staged_load, binding, packed_key) {
                self.send(Request {
                    load: Some(load),
                    ..Default::default()
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Flush the current transaction: all loads are sent and their Loaded
    /// responses fully reduced once this returns. Requires that the prior
    /// transaction was acknowledged.
    pub async fn flush(&mut self) -> Result<(), Error> {
        // Await the prior transaction's Acknowledged: its Acknowledge
        // must precede our Flush on the stream.
        if let Some((fut, sent)) = self.pending_ack.take() {
            if !sent {
                return Err(Error::MissingAcknowledge);
            }
            fut.await.map_err(Error::Acknowledged)?;
        }

        if let Some(load) = self.staged_load.take() {
            self.send(Request {
                load: Some(load),
                ..Default::default()
            })
            .await?;
        }
        self.send(Request {
            flush: Some(request::Flush {}),
            ..Default::default()
        })
        .await?;

        match self.events.recv().await {
            Some(ReadEvent::Flushed(flushed)) => {
                if flushed.state.is_some() {
                    self.staged_state = flushed.state;
                }
                Ok(())
            }
            Some(ReadEvent::StartedCommit(_)) => Err(Error::UnexpectedMessage {
                expected: "Flushed",
                received: "StartedCommit",
            }),
            None => Err(self.reader_terminal().await),
        }
    }

    /// Drain the transaction's combiners into Store requests, retaining a
    /// bounded cache of stored documents for the next transaction.
    pub async fn store(&mut self) -> Result<(), Error> {
        let staged = {
            let mut round = self.shared.lock().unwrap();
            let round = &mut *round;
            let mut staged = Vec::new();

            for (index, (combiner, flighted)) in round
                .combiners
                .iter_mut()
                .zip(round.flighted.iter_mut())
                .enumerate()
            {
                let binding = index as u32;
                let delta = self.delta_updates[index];

                // Garbage-collect retained documents which were not
                // touched by this transaction.
                flighted.retain(|_, entry| entry.is_none());
                let num_flighted = flighted.len();

                let mut stager = lifecycle::StoreStager::new(binding);
                let mut retained = 0;
                let mut drained = 0;
                let mut failure: Option<Error> = None;

                let result = combiner.drain(&mut |doc| {
                    drained += 1;

                    if !flighted.contains_key(doc.packed_key) {
                        failure = Some(Error::LoadedKeyNotRequested {
                            key: String::from_utf8_lossy(doc.packed_key).into_owned(),
                        });
                        anyhow::bail!("drained a key which was never flighted");
                    }
                    if drained > num_flighted {
                        failure = Some(Error::DrainedExcessDocuments {
                            binding,
                            drained,
                            flighted: num_flighted,
                        });
                        anyhow::bail!("drained more documents than flighted keys");
                    }

                    stager.add(
                        &mut staged,
                        doc.packed_key,
                        doc.packed_values,
                        doc.doc_json,
                        doc.full,
                    );

                    if delta
                        || retained >= self.options.cached_document_bound
                        || doc.doc_json.len() > self.options.cached_document_max_size
                    {
                        flighted.remove(doc.packed_key);
                    } else {
                        flighted.insert(doc.packed_key.to_vec(), Some(doc.doc_json.to_vec()));
                        retained += 1;
                    }
                    Ok(())
                });

                if let Some(err) = failure {
                    tracing::error!(binding, error = %err, "driver implementation error");
                    return Err(err);
                }
                let _stats = result.map_err(Error::Drain)?;
                stager.finish(&mut staged);
            }
            staged
        };

        for request in staged {
            self.send(request).await?;
        }
        Ok(())
    }

    /// Start this transaction's commit, carrying the runtime checkpoint.
    /// Returns the driver's connector state and a future resolved when the
    /// driver's Acknowledged of this transaction is read. The caller next
    /// commits its recovery log, calls [`TxnClient::acknowledge`], and may
    /// meanwhile add documents of the next transaction.
    pub async fn start_commit(
        &mut self,
        runtime_checkpoint: Vec<u8>,
    ) -> Result<(Option<flow::ConnectorState>, OpFuture), Error> {
        self.send(Request {
            start_commit: Some(request::StartCommit { runtime_checkpoint }),
            ..Default::default()
        })
        .await?;

        match self.events.recv().await {
            Some(ReadEvent::StartedCommit(started)) => {
                // Prefer the newer StartedCommit position of the connector
                // state over one staged by Flushed.
                let state = started.state.or(self.staged_state.take());

                let (op, fut) = async_op();
                self.shared.lock().unwrap().ack_slot = Some(op);
                self.pending_ack = Some((fut.clone(), false));

                Ok((state, fut))
            }
            Some(ReadEvent::Flushed(_)) => Err(Error::UnexpectedMessage {
                expected: "StartedCommit",
                received: "Flushed",
            }),
            None => Err(self.reader_terminal().await),
        }
    }

    /// Acknowledge the driver: the runtime's recovery-log commit of the
    /// prior transaction is durable.
    pub async fn acknowledge(&mut self) -> Result<(), Error> {
        self.send(Request {
            acknowledge: Some(request::Acknowledge {}),
            ..Default::default()
        })
        .await?;

        if let Some((_, sent)) = &mut self.pending_ack {
            *sent = true;
        }
        Ok(())
    }

    /// Close the client, returning the reader's terminal error if it was
    /// not already delivered. A clean EOF maps to Ok.
    pub async fn close(mut self) -> Result<(), Error> {
        self.tx.close_send();
        // Unblock a reader stuck forwarding an event nobody will consume.
        self.events.close();

        match self.reader.take() {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join) => Err(Error::Transport(anyhow::Error::new(join))),
            },
        }
    }

    async fn send(&mut self, request: Request) -> Result<(), Error> {
        if self.tx.send(request).await.is_ok() {
            return Ok(());
        }
        // The send raced a closed RPC: surface the reader's causal error.
        Err(self.reader_terminal().await)
    }

    async fn reader_terminal(&mut self) -> Error {
        self.events.close();

        match self.reader.take() {
            None => Error::AlreadyFailed,
            Some(handle) => match handle.await {
                Ok(Ok(())) => Error::UnexpectedEof,
                Ok(Err(err)) => err,
                Err(join) => Error::Transport(anyhow::Error::new(join)),
            },
        }
    }

    async fn recv(rx: &mut link::RecvHalf<Response>) -> Result<Response, Error> {
        match rx.recv().await {
            None => Err(Error::UnexpectedEof),
            Some(Err(err)) => Err(Error::Transport(err)),
            Some(Ok(resp)) => {
                resp.validate()?;
                Ok(resp)
            }
        }
    }
}

// Background reader of driver responses: Loaded documents reduce into
// the shared combiners, Acknowledged resolves the pending operation, and
// Flushed / StartedCommit forward to the foreground.
async fn read_loop<C: Combiner>(
    mut rx: link::RecvHalf<Response>,
    shared: &Arc<Mutex<Round<C>>>,
    events: mpsc::Sender<ReadEvent>,
) -> Result<(), Error> {
    loop {
        let resp = match rx.recv().await {
            None => {
                // Clean EOF is legal only between transactions.
                let round = shared.lock().unwrap();
                if round.ack_slot.is_some() {
                    return Err(Error::UnexpectedEof);
                }
                return Ok(());
            }
            Some(Err(err)) => return Err(Error::Transport(err)),
            Some(Ok(resp)) => resp,
        };
        resp.validate()?;
        let received = response_name(&resp);

        if let Some(loaded) = resp.loaded {
            let mut round = shared.lock().unwrap();
            let round = &mut *round;
            let combiner = round
                .combiners
                .get_mut(loaded.binding as usize)
                .ok_or(Error::BindingRange {
                    binding: loaded.binding,
                    count: round.flighted.len(),
                })?;

            for slice in &loaded.docs_json {
                combiner
                    .reduce_left(slice.of(&loaded.arena))
                    .map_err(Error::ReduceLeft)?;
            }
        } else if resp.acknowledged.is_some() {
            let op = shared.lock().unwrap().ack_slot.take();
            match op {
                Some(op) => op.resolve(Ok(())),
                None => {
                    return Err(Error::UnexpectedMessage {
                        expected: "Loaded, Flushed, or StartedCommit",
                        received: "Acknowledged",
                    })
                }
            }
        } else if let Some(flushed) = resp.flushed {
            if events.send(ReadEvent::Flushed(flushed)).await.is_err() {
                return Ok(()); // The client was dropped.
            }
        } else if let Some(started) = resp.started_commit {
            if events
                .send(ReadEvent::StartedCommit(started))
                .await
                .is_err()
            {
                return Ok(());
            }
        } else {
            return Err(Error::UnexpectedMessage {
                expected: "Loaded, Flushed, StartedCommit, or Acknowledged",
                received,
            });
        }
    }
}
