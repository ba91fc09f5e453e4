//! Shared transaction coordination of the Pull client and Push server:
//! a pair of (prior, next) transaction slots where the prior transaction
//! commits to the recovery log while the next accumulates documents.

use crate::Error;
use link::OpFuture;
use proto_flow::capture::Documents;
use proto_flow::flow;
use proto_flow::Combiner;
use tokio::sync::{mpsc, oneshot};

/// PendingCommit is a transaction which is ready to commit: its documents
/// are combined and its driver checkpoint is fully reduced. The caller
/// drains the combiners, persists the checkpoint with its recovery-log
/// write, and hands back the (emptied) combiners along with the commit
/// operation via set_log_committed_op.
#[derive(Debug)]
pub struct PendingCommit<C: Combiner> {
    combiners: Vec<C>,
    checkpoint: flow::DriverCheckpoint,
    num_checkpoints: u32,
    reply: oneshot::Sender<Reply<C>>,
}

#[derive(Debug)]
pub(crate) struct Reply<C> {
    pub combiners: Vec<C>,
    pub op: OpFuture,
}

impl<C: Combiner> PendingCommit<C> {
    /// Combiners of this transaction, one per capture binding,
    /// which the caller must fully drain.
    pub fn combiners(&mut self) -> &mut [C] {
        &mut self.combiners
    }

    /// Reduced driver checkpoint of this transaction.
    pub fn driver_checkpoint(&self) -> &flow::DriverCheckpoint {
        &self.checkpoint
    }

    /// Number of driver checkpoints reduced into this transaction.
    pub fn num_checkpoints(&self) -> u32 {
        self.num_checkpoints
    }

    /// Supply the recovery-log commit operation of this transaction,
    /// returning the drained combiners for re-use. The serve loop
    /// acknowledges the driver once the operation resolves.
    pub fn set_log_committed_op(self, op: OpFuture) {
        // If the loop has exited, its terminal error is already on its way
        // to the caller, and the combiners are simply dropped.
        let _ = self.reply.send(Reply {
            combiners: self.combiners,
            op,
        });
    }
}

// One transaction slot, accumulating documents and checkpoints.
struct Transaction<C> {
    combiners: Vec<C>,
    checkpoint: flow::DriverCheckpoint,
    num_checkpoints: u32,
    num_documents: usize,
    num_bytes: usize,
    // True while this transaction awaits a checkpoint before it may commit.
    pending: bool,
}

impl<C> Transaction<C> {
    fn new(combiners: Vec<C>) -> Self {
        Self {
            combiners,
            checkpoint: flow::DriverCheckpoint::default(),
            num_checkpoints: 0,
            num_documents: 0,
            num_bytes: 0,
            pending: true,
        }
    }
}

pub(crate) struct Coordinator<C: Combiner> {
    bindings: usize,
    next: Transaction<C>,
    // Combiner vector drained and returned by the caller, for re-use.
    spare: Option<Vec<C>>,
    // Checkpoints of the transaction now committing, to acknowledge.
    prior_checkpoints: u32,
    // In-flight recovery-log commit of the prior transaction.
    pub(crate) log_committed_op: Option<OpFuture>,
    log_committed_done: bool,
    // Rendezvous for the caller's set_log_committed_op of the current commit.
    pub(crate) reply_rx: Option<oneshot::Receiver<Reply<C>>>,
    commits_tx: mpsc::Sender<PendingCommit<C>>,
}

impl<C: Combiner> Coordinator<C> {
    pub fn new(
        bindings: usize,
        combiners: Vec<C>,
        spare: Vec<C>,
        commits_tx: mpsc::Sender<PendingCommit<C>>,
    ) -> Self {
        Self {
            bindings,
            next: Transaction::new(combiners),
            spare: Some(spare),
            prior_checkpoints: 0,
            log_committed_op: None,
            log_committed_done: true,
            reply_rx: None,
            commits_tx,
        }
    }

    /// Combine a batch of documents into the next transaction.
    pub fn on_documents(&mut self, docs: Documents) -> Result<(), Error> {
        let binding = docs.binding;
        let combiner = self
            .next
            .combiners
            .get_mut(binding as usize)
            .ok_or(Error::BindingRange {
                binding,
                count: self.bindings,
            })?;

        for doc in docs.iter() {
            combiner.combine_right(doc).map_err(Error::CombineRight)?;
        }
        self.next.num_documents += docs.docs_json.len();
        self.next.num_bytes += docs.arena.len();
        self.next.pending = true;

        Ok(())
    }

    /// Reduce a driver checkpoint into the next transaction,
    /// marking it ready to commit.
    pub fn on_checkpoint(&mut self, checkpoint: flow::DriverCheckpoint) -> Result<(), Error> {
        if self.next.num_checkpoints == 0 {
            self.next.checkpoint = checkpoint;
        } else {
            self.next.checkpoint.reduce(checkpoint)?;
        }
        self.next.num_checkpoints += 1;
        self.next.pending = false;

        Ok(())
    }

    /// Accept the caller's reply of drained combiners and commit operation.
    pub fn on_reply(&mut self, reply: Result<Reply<C>, oneshot::error::RecvError>) -> Result<(), Error> {
        // A dropped PendingCommit abandons the capture.
        let reply = reply.map_err(|_| Error::Cancelled)?;

        self.spare = Some(reply.combiners);
        self.log_committed_op = Some(reply.op);
        self.reply_rx = None;

        Ok(())
    }

    /// Observe the resolution of the recovery-log commit.
    /// Returns the number of driver acknowledgements now owed.
    pub fn on_log_committed(&mut self, result: Result<(), link::OpError>) -> Result<u32, Error> {
        result.map_err(Error::LogCommit)?;

        self.log_committed_op = None;
        self.log_committed_done = true;

        Ok(std::mem::take(&mut self.prior_checkpoints))
    }

    /// A transaction rotation is due when the next transaction holds a
    /// checkpoint and the prior transaction has fully committed.
    pub fn should_rotate(&self) -> bool {
        self.log_committed_done && !self.next.pending
    }

    /// Rotate transactions: the next transaction becomes the committing
    /// prior, and a fresh next re-uses the previously drained combiners.
    /// Returns the commit to emit to the caller.
    pub fn rotate(&mut self) -> PendingCommit<C> {
        let spare = self.spare.take().expect("spare combiners are returned before rotation");
        let prior = std::mem::replace(&mut self.next, Transaction::new(spare));

        tracing::debug!(
            num_documents = prior.num_documents,
            num_bytes = prior.num_bytes,
            num_checkpoints = prior.num_checkpoints,
            "rotating capture transaction",
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        self.prior_checkpoints = prior.num_checkpoints;
        self.log_committed_done = false;
        self.reply_rx = Some(reply_rx);

        PendingCommit {
            combiners: prior.combiners,
            checkpoint: prior.checkpoint,
            num_checkpoints: prior.num_checkpoints,
            reply: reply_tx,
        }
    }

    /// Emit a due rotation to the caller.
    pub async fn maybe_rotate(&mut self) -> Result<(), Error> {
        if !self.should_rotate() {
            return Ok(());
        }
        let commit = self.rotate();
        self.commits_tx
            .send(commit)
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// The source has reached EOF. This is clean only when no transaction
    /// is mid-flight: combined documents without their checkpoint are lost.
    pub fn on_source_eof(&self) -> Result<(), Error> {
        if self.next.pending && self.next.num_documents != 0 {
            Err(Error::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    /// Whether a closed source has fully drained: the next transaction is
    /// empty and the prior transaction's commit has settled.
    pub fn drained(&self) -> bool {
        self.log_committed_done && self.next.num_documents == 0 && self.next.num_checkpoints == 0
    }

    /// Bytes accumulated into the next transaction.
    pub fn next_bytes(&self) -> usize {
        self.next.num_bytes
    }
}
