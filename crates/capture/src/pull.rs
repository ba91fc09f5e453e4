//! Client of a pull-style capture RPC.

use crate::coordinator::{Coordinator, PendingCommit, Reply};
use crate::Error;
use proto_flow::capture::{pull_request, Acknowledge, PullRequest, PullResponse};
use proto_flow::flow;
use proto_flow::Combiner;
use tokio::sync::{mpsc, oneshot, watch};

/// PullClient is a client of a driver's pull-style capture RPC.
/// It opens a long-lived stream and runs a background serve loop which
/// combines captured documents, reduces driver checkpoints, and surfaces
/// ready-to-commit transactions to the caller as [`PendingCommit`]s.
///
/// The prior transaction's recovery-log commit runs concurrently with the
/// accumulation of the next transaction. After each commit resolves, the
/// client acknowledges the driver once per checkpoint of the committed
/// transaction.
pub struct PullClient<C: Combiner> {
    commits: mpsc::Receiver<PendingCommit<C>>,
    handle: Option<tokio::task::JoinHandle<Result<(), Error>>>,
    cancel_tx: Option<watch::Sender<()>>,
}

impl<C: Combiner> PullClient<C> {
    /// Open a pull of the capture over the given RPC client,
    /// building per-binding combiners via `new_combiner`.
    pub async fn open<F>(
        client: link::Client<PullRequest, PullResponse>,
        spec: flow::CaptureSpec,
        version: String,
        key_begin: u32,
        key_end: u32,
        driver_checkpoint_json: Vec<u8>,
        tail: bool,
        mut new_combiner: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(&flow::capture_spec::Binding) -> anyhow::Result<C>,
    {
        // Both transaction slots carry a combiner vector,
        // which thereafter alternate across rotations.
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

        let open = PullRequest {
            open: Some(pull_request::Open {
                capture: Some(spec),
                version,
                key_begin,
                key_end,
                driver_checkpoint_json,
                tail,
            }),
            ..Default::default()
        };
        open.validate()?;

        let (mut tx, mut rx) = client.into_parts();
        tx.send(open)
            .await
            .map_err(|closed| Error::Transport(closed.into()))?;

        // The driver must respond with Opened before anything else.
        match rx.recv().await {
            None => return Err(Error::UnexpectedEof),
            Some(Err(err)) => return Err(Error::Transport(err)),
            Some(Ok(resp)) => {
                resp.validate()?;
                if resp.opened.is_none() {
                    return Err(Error::UnexpectedMessage {
                        expected: "Opened",
                        received: crate::pull_response_name(&resp),
                    });
                }
            }
        }

        let (commits_tx, commits_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(());
        let coord = Coordinator::new(bindings, combiners, spare, commits_tx);

        let handle = tokio::spawn(serve(coord, tx, Some(rx), cancel_rx));

        Ok(Self {
            commits: commits_rx,
            handle: Some(handle),
            cancel_tx: Some(cancel_tx),
        })
    }

    /// The next transaction which is ready to commit.
    /// Returns None once the capture has gracefully drained after EOF.
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

enum Event<C: Combiner> {
    Reply(Result<Reply<C>, oneshot::error::RecvError>),
    LogCommitted(Result<(), link::OpError>),
    Read(Option<anyhow::Result<PullResponse>>),
    Cancel,
}

async fn serve<C: Combiner>(
    mut coord: Coordinator<C>,
    mut tx: link::SendHalf<PullRequest>,
    mut rx: Option<link::RecvHalf<PullResponse>>,
    mut cancel: watch::Receiver<()>,
) -> Result<(), Error> {
    loop {
        coord.maybe_rotate().await?;

        if rx.is_none() && coord.drained() {
            return Ok(());
        }

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
                read = async { rx.as_mut().unwrap().recv().await }, if rx.is_some() => {
                    Event::Read(read)
                }
                _ = cancel.changed() => Event::Cancel,
            }
        };

        match event {
            Event::Reply(reply) => coord.on_reply(reply)?,

            Event::LogCommitted(result) => {
                let acks = coord.on_log_committed(result)?;

                // Send errors of acknowledgements are ignored: the server
                // controls RPC termination, and its descriptive error
                // arrives on the read side.
                for _ in 0..acks {
                    let _ = tx
                        .send(PullRequest {
                            acknowledge: Some(Acknowledge {}),
                            ..Default::default()
                        })
                        .await;
                }
            }

            Event::Read(None) => {
                coord.on_source_eof()?;
                rx = None;
            }
            Event::Read(Some(Err(err))) => return Err(Error::Transport(err)),
            Event::Read(Some(Ok(resp))) => {
                resp.validate()?;
                let received = crate::pull_response_name(&resp);

                if let Some(docs) = resp.documents {
                    coord.on_documents(docs)?;
                } else if let Some(checkpoint) = resp.checkpoint {
                    coord.on_checkpoint(checkpoint)?;
                } else {
                    return Err(Error::UnexpectedMessage {
                        expected: "Documents or Checkpoint",
                        received,
                    });
                }
            }

            Event::Cancel => return Err(Error::Cancelled),
        }
    }
}
