//! Server of push-style captures: drivers push Documents and Checkpoints
//! in, and are acknowledged as each checkpoint commits to the recovery log.

use crate::coordinator::{Coordinator, PendingCommit, Reply};
use crate::{lifecycle, Error};
use proto_flow::capture::{
    push_response, Acknowledge, Documents, PushRequest, PushResponse,
};
use proto_flow::flow;
use proto_flow::Combiner;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

/// One pushed transaction: Documents batches, their closing Checkpoint,
/// and a channel signalled once the checkpoint has durably committed.
pub struct Push {
    pub documents: Vec<Documents>,
    pub checkpoint: flow::DriverCheckpoint,
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Stop accepting pushes into a transaction already holding this many
    /// combined bytes, committing it separately instead.
    pub combiner_byte_threshold: usize,
    /// Maximum bytes a single pushed transaction may stage on the wire
    /// before its Checkpoint.
    pub push_max_bytes: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            combiner_byte_threshold: 1 << 24, // 16 MiB
            push_max_bytes: 1 << 22,          // 4 MiB
        }
    }
}

/// PushServer serves the receive side of a push-style capture.
/// Pushes arrive in-process via [`PushServer::push`], or over the wire
/// as Documents and Checkpoint requests which are bridged onto `push`
/// and acknowledged with Acknowledge responses in commit order.
pub struct PushServer<C: Combiner> {
    push_tx: mpsc::Sender<Push>,
    commits: mpsc::Receiver<PendingCommit<C>>,
    handle: Option<tokio::task::JoinHandle<Result<(), Error>>>,
    cancel_tx: Option<watch::Sender<()>>,
    terminal_msg: Arc<Mutex<Option<String>>>,
}

impl<C: Combiner> PushServer<C> {
    /// Open the push-style capture over the given RPC server,
    /// building per-binding combiners via `new_combiner`.
    pub async fn open<F>(
        server: link::Server<PushRequest, PushResponse>,
        spec: flow::CaptureSpec,
        key_begin: u32,
        key_end: u32,
        driver_checkpoint_json: Vec<u8>,
        options: PushOptions,
        mut new_combiner: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(&flow::capture_spec::Binding) -> anyhow::Result<C>,
    {
        let (mut rx, mut tx) = server.into_parts();

        // The driver must open before anything else.
        let req = rx.recv().await.ok_or(Error::UnexpectedEof)?;
        req.validate()?;
        let received = crate::push_request_name(&req);
        let Some(open) = req.open else {
            return Err(Error::UnexpectedMessage {
                expected: "Open",
                received,
            });
        };

        if open.capture != spec.name {
            tx.send(PushResponse {
                opened: Some(push_response::Opened {
                    status: push_response::Status::CaptureNotFound as i32,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;
            return Err(Error::CaptureNotFound(open.capture));
        }

        let mut combiners = Vec::with_capacity(spec.bindings.len());
        let mut spare = Vec::with_capacity(spec.bindings.len());
        for (index, binding) in spec.bindings.iter().enumerate() {
            for vec in [&mut combiners, &mut spare] {
                vec.push(new_combiner(binding).map_err(|error| Error::NewCombiner {
                    binding: index,
                    error,
                })?);
            }
        }
        let bindings = spec.bindings.len();

        tx.send(PushResponse {
            opened: Some(push_response::Opened {
                status: push_response::Status::Ok as i32,
                capture: Some(spec),
                key_begin,
                key_end,
                driver_checkpoint_json,
            }),
            ..Default::default()
        })
        .await;

        let (push_tx, push_rx) = mpsc::channel(1);
        let (commits_tx, commits_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(());
        let (wire_tx, wire_rx) = mpsc::channel(16);
        let terminal_msg = Arc::new(Mutex::new(None));

        // Bridge wire reads onto `push`, and forward commit
        // acknowledgements back as Acknowledge responses.
        tokio::spawn(serve_reads(
            rx,
            push_tx.clone(),
            wire_tx,
            options.push_max_bytes,
        ));
        tokio::spawn(forward_acks(wire_rx, tx));

        let coord = Coordinator::new(bindings, combiners, spare, commits_tx);
        let handle = tokio::spawn({
            let terminal_msg = terminal_msg.clone();
            async move {
                serve(
                    coord,
                    push_rx,
                    options.combiner_byte_threshold,
                    cancel_rx,
                )
                .await
                .map_err(|err| {
                    *terminal_msg.lock().unwrap() = Some(err.to_string());
                    err
                })
            }
        });

        Ok(Self {
            push_tx,
            commits: commits_rx,
            handle: Some(handle),
            cancel_tx: Some(cancel_tx),
            terminal_msg,
        })
    }

    /// Push one transaction, blocking until the serve loop accepts it.
    /// The returned channel is signalled once the transaction's checkpoint
    /// has committed to the recovery log.
    pub async fn push(
        &self,
        documents: Vec<Documents>,
        checkpoint: flow::DriverCheckpoint,
    ) -> Result<oneshot::Receiver<()>, Error> {
        self.pusher().push(documents, checkpoint).await
    }

    /// A cloneable handle with which concurrent producers push.
    pub fn pusher(&self) -> Pusher {
        Pusher {
            push_tx: self.push_tx.clone(),
            terminal_msg: self.terminal_msg.clone(),
        }
    }

    /// The next transaction which is ready to commit.
    /// A terminal loop error is delivered exactly once, here or by close.
    pub async fn next_commit(&mut self) -> Result<Option<PendingCommit<C>>, Error> {
        if let Some(commit) = self.commits.recv().await {
            return Ok(Some(commit));
        }
        match self.terminal().await {
            None => Ok(None),
            Some(err) => Err(err),
        }
    }

    /// Close the capture, cancelling it if it's still running, and return
    /// its undelivered terminal error. EOF and cancellation map to Ok.
    pub async fn close(mut self) -> Result<(), Error> {
        self.cancel_tx.take();
        // Unblock a loop stuck emitting a commit nobody will consume.
        self.commits.close();

        match self.terminal().await {
            None | Some(Error::Cancelled) => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn terminal(&mut self) -> Option<Error> {
        let handle = self.handle.take()?;
        match handle.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(join) => Some(Error::Transport(anyhow::Error::new(join))),
        }
    }
}

/// Pusher is a cloneable producer handle of a [`PushServer`].
#[derive(Clone)]
pub struct Pusher {
    push_tx: mpsc::Sender<Push>,
    terminal_msg: Arc<Mutex<Option<String>>>,
}

impl Pusher {
    /// Push one transaction, blocking until the serve loop accepts it.
    /// The returned channel is signalled once the transaction's checkpoint
    /// has committed to the recovery log.
    pub async fn push(
        &self,
        documents: Vec<Documents>,
        checkpoint: flow::DriverCheckpoint,
    ) -> Result<oneshot::Receiver<()>, Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push_tx
            .send(Push {
                documents,
                checkpoint,
                ack: ack_tx,
            })
            .await
            .map_err(|_| {
                let msg = self
                    .terminal_msg
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| "capture loop has stopped".to_string());
                Error::Terminated(msg)
            })?;
        Ok(ack_rx)
    }
}

enum Event<C: Combiner> {
    Reply(Result<Reply<C>, oneshot::error::RecvError>),
    LogCommitted(Result<(), link::OpError>),
    Push(Option<Push>),
    Cancel,
}

async fn serve<C: Combiner>(
    mut coord: Coordinator<C>,
    push_rx: mpsc::Receiver<Push>,
    combiner_byte_threshold: usize,
    mut cancel: watch::Receiver<()>,
) -> Result<(), Error> {
    let mut push_rx = Some(push_rx);
    let mut prior_acks: Vec<oneshot::Sender<()>> = Vec::new();
    let mut next_acks: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        if coord.should_rotate() {
            prior_acks = std::mem::take(&mut next_acks);
            coord.maybe_rotate().await?;
        }
        if push_rx.is_none() && coord.drained() {
            return Ok(());
        }

        // Decline further pushes into an already-large transaction,
        // committing it separately once the prior commit completes.
        let full = coord.next_bytes() >= combiner_byte_threshold;

        let event = {
            let reply_rx = &mut coord.reply_rx;
            let op = &mut coord.log_committed_op;

            tokio::select! {
                reply = async { reply_rx.as_mut().unwrap().await }, if reply_rx.is_some() => {
                    Event::Reply(reply)
                }
                result = async { op.as_mut().unwrap().await }, if op.is_some() => {
                    Event::LogCommitted(result)
                }
                push = async { push_rx.as_mut().unwrap().recv().await }, if push_rx.is_some() && !full => {
                    Event::Push(push)
                }
                _ = cancel.changed() => Event::Cancel,
            }
        };

        match event {
            Event::Reply(reply) => coord.on_reply(reply)?,

            Event::LogCommitted(result) => {
                let _ = coord.on_log_committed(result)?;

                for ack in prior_acks.drain(..) {
                    // A departed pusher doesn't observe its acknowledgement.
                    let _ = ack.send(());
                }
            }

            Event::Push(None) => push_rx = None,
            Event::Push(Some(push)) => {
                for documents in push.documents {
                    coord.on_documents(documents)?;
                }
                coord.on_checkpoint(push.checkpoint)?;
                next_acks.push(push.ack);
            }

            Event::Cancel => return Err(Error::Cancelled),
        }
    }
}

enum WireAck {
    Ack(oneshot::Receiver<()>),
    Fail(Error),
}

// Read pushed transactions off the wire and forward them onto the loop.
async fn serve_reads(
    mut rx: link::ServerRecv<PushRequest>,
    push_tx: mpsc::Sender<Push>,
    wire_tx: mpsc::Sender<WireAck>,
    push_max_bytes: usize,
) {
    loop {
        match lifecycle::read_push_checkpoint(&mut rx, push_max_bytes).await {
            // Clean wire EOF.
            Ok(None) => return,
            Ok(Some((documents, checkpoint))) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let push = Push {
                    documents,
                    checkpoint,
                    ack: ack_tx,
                };
                if push_tx.send(push).await.is_err() {
                    return; // The loop has terminated.
                }
                if wire_tx.send(WireAck::Ack(ack_rx)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read pushed transaction");
                let _ = wire_tx.send(WireAck::Fail(err)).await;
                return;
            }
        }
    }
}

// Acknowledge wire pushes in commit order.
async fn forward_acks(
    mut wire_rx: mpsc::Receiver<WireAck>,
    mut tx: link::ServerSend<PushResponse>,
) {
    while let Some(ack) = wire_rx.recv().await {
        match ack {
            WireAck::Ack(rx) => match rx.await {
                Ok(()) => {
                    tx.send(PushResponse {
                        acknowledge: Some(Acknowledge {}),
                        ..Default::default()
                    })
                    .await;
                }
                // The loop terminated before this push committed.
                Err(_) => return,
            },
            WireAck::Fail(err) => {
                tx.fail(anyhow::Error::new(err)).await;
                return;
            }
        }
    }
}
