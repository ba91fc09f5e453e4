//! In-process bindings of a protocol server to a protocol client,
//! with the observable semantics of a real bidirectional RPC:
//! requests and responses are ordered, the server's terminal error
//! surfaces on the client's read side, and a client send races a
//! "server is done" signal so that a closed RPC behaves as EOF.

use tokio::sync::{mpsc, watch};

mod op;
pub use op::{async_op, AsyncOperation, OpError, OpFuture};

/// Closed is returned by client transport operations after the
/// server has finished and torn down the RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the RPC transport is closed")]
pub struct Closed;

/// Build a connected client/server pair exchanging `Req` and `Resp`
/// messages over bounded channels of the given capacity.
pub fn pipe<Req, Resp>(capacity: usize) -> (Client<Req, Resp>, Server<Req, Resp>) {
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    let (done_tx, done_rx) = watch::channel(());

    (
        Client {
            tx: SendHalf {
                tx: Some(req_tx),
                done: done_rx.clone(),
            },
            rx: RecvHalf {
                rx: resp_rx,
                done: done_rx,
            },
        },
        Server {
            rx: ServerRecv { rx: req_rx },
            tx: ServerSend {
                tx: resp_tx,
                _done: done_tx,
            },
        },
    )
}

/// Client is the runtime's handle of an in-process RPC.
pub struct Client<Req, Resp> {
    pub tx: SendHalf<Req>,
    pub rx: RecvHalf<Resp>,
}

impl<Req: Send, Resp> Client<Req, Resp> {
    pub async fn send(&mut self, req: Req) -> Result<(), Closed> {
        self.tx.send(req).await
    }

    pub async fn recv(&mut self) -> Option<anyhow::Result<Resp>> {
        self.rx.recv().await
    }

    /// Split into independently-owned send and receive halves.
    pub fn into_parts(self) -> (SendHalf<Req>, RecvHalf<Resp>) {
        (self.tx, self.rx)
    }
}

/// SendHalf is the client's request transmit path.
#[derive(Debug)]
pub struct SendHalf<Req> {
    tx: Option<mpsc::Sender<Req>>,
    done: watch::Receiver<()>,
}

impl<Req: Send> SendHalf<Req> {
    /// Send a request, racing the server-done signal: if the server has
    /// already finished, the send behaves as a transport EOF rather than
    /// blocking forever against an RPC nobody is reading.
    pub async fn send(&mut self, req: Req) -> Result<(), Closed> {
        let Some(tx) = &self.tx else { return Err(Closed) };

        tokio::select! {
            result = tx.send(req) => result.map_err(|_| Closed),
            _ = self.done.changed() => Err(Closed),
        }
    }

    /// Close the request channel, signalling a graceful end of input.
    pub fn close_send(&mut self) {
        self.tx = None;
    }
}

/// RecvHalf is the client's response receive path.
pub struct RecvHalf<Resp> {
    rx: mpsc::Receiver<anyhow::Result<Resp>>,
    done: watch::Receiver<()>,
}

impl<Resp> RecvHalf<Resp> {
    /// Receive the next response. Yields None at a clean server EOF,
    /// and the server's terminal error as the final item otherwise.
    pub async fn recv(&mut self) -> Option<anyhow::Result<Resp>> {
        self.rx.recv().await
    }
}

/// Server is the driver's handle of an in-process RPC.
pub struct Server<Req, Resp> {
    pub rx: ServerRecv<Req>,
    pub tx: ServerSend<Resp>,
}

impl<Req, Resp: Send> Server<Req, Resp> {
    pub async fn recv(&mut self) -> Option<Req> {
        self.rx.recv().await
    }

    pub async fn send(&mut self, resp: Resp) {
        self.tx.send(resp).await
    }

    /// Split into independently-owned receive and send halves.
    pub fn into_parts(self) -> (ServerRecv<Req>, ServerSend<Resp>) {
        (self.rx, self.tx)
    }
}

/// ServerRecv is the server's request receive path.
pub struct ServerRecv<Req> {
    rx: mpsc::Receiver<Req>,
}

impl<Req> ServerRecv<Req> {
    /// Receive the next request, or None once the client closed its send.
    pub async fn recv(&mut self) -> Option<Req> {
        self.rx.recv().await
    }
}

/// ServerSend is the server's response transmit path. Dropping it marks
/// the server done, which client sends and receives then observe.
pub struct ServerSend<Resp> {
    tx: mpsc::Sender<anyhow::Result<Resp>>,
    _done: watch::Sender<()>,
}

impl<Resp: Send> ServerSend<Resp> {
    /// Send a response. The server controls RPC termination, so a broken
    /// transport is not modelled: a send to a departed client is dropped.
    pub async fn send(&mut self, resp: Resp) {
        let _ = self.tx.send(Ok(resp)).await;
    }

    /// Report the server's terminal error as the final response item.
    pub async fn fail(&mut self, err: anyhow::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// MessageSink abstracts the transmit path of either RPC endpoint,
/// so staging helpers can feed both.
#[async_trait::async_trait]
pub trait MessageSink<M: Send>: Send {
    async fn send_message(&mut self, msg: M) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<M: Send + 'static> MessageSink<M> for SendHalf<M> {
    async fn send_message(&mut self, msg: M) -> anyhow::Result<()> {
        self.send(msg).await.map_err(anyhow::Error::new)
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> MessageSink<M> for ServerSend<M> {
    async fn send_message(&mut self, msg: M) -> anyhow::Result<()> {
        self.send(msg).await;
        Ok(())
    }
}
