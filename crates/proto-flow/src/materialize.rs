/// Request is the request type of the materialization Transactions RPC,
/// sent by the runtime client to the materialization driver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub open: Option<request::Open>,
    #[prost(message, optional, tag = "2")]
    pub load: Option<request::Load>,
    #[prost(message, optional, tag = "3")]
    pub flush: Option<request::Flush>,
    #[prost(message, optional, tag = "4")]
    pub store: Option<request::Store>,
    #[prost(message, optional, tag = "5")]
    pub start_commit: Option<request::StartCommit>,
    #[prost(message, optional, tag = "6")]
    pub acknowledge: Option<request::Acknowledge>,
}

pub mod request {
    use crate::flow;

    /// Open a materialization stream, resuming from a prior connector state.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Open {
        #[prost(message, optional, tag = "1")]
        pub materialization: Option<flow::MaterializationSpec>,
        /// Version of the opened MaterializationSpec.
        #[prost(string, tag = "2")]
        pub version: String,
        #[prost(message, optional, tag = "3")]
        pub range: Option<flow::RangeSpec>,
        /// Last-committed connector state, or empty if this is a new task.
        #[prost(bytes = "vec", tag = "4")]
        pub state_json: Vec<u8>,
    }

    /// Load one or more keys, which may or may not exist in the store.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Load {
        /// Index of the materialization binding of this batch.
        #[prost(uint32, tag = "1")]
        pub binding: u32,
        /// Arena holding the packed keys of this message.
        #[prost(bytes = "vec", tag = "2")]
        pub arena: Vec<u8>,
        /// Packed tuples of collection keys, as Slices of the arena.
        #[prost(message, repeated, tag = "3")]
        pub packed_keys: Vec<flow::Slice>,
    }

    /// Flush tells the driver that no further Loads are forthcoming
    /// in this transaction.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Flush {}

    /// Store documents of this transaction commit.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Store {
        /// Index of the materialization binding of this batch.
        #[prost(uint32, tag = "1")]
        pub binding: u32,
        /// Arena holding the keys, values, and documents of this message.
        #[prost(bytes = "vec", tag = "2")]
        pub arena: Vec<u8>,
        /// Packed tuples of collection keys.
        #[prost(message, repeated, tag = "3")]
        pub packed_keys: Vec<flow::Slice>,
        /// Packed tuples of selected, projected document values.
        #[prost(message, repeated, tag = "4")]
        pub packed_values: Vec<flow::Slice>,
        /// Full JSON documents.
        #[prost(message, repeated, tag = "5")]
        pub docs_json: Vec<flow::Slice>,
        /// Whether each document is a full reduction,
        /// having existed in the store or been retained from a prior commit.
        #[prost(bool, repeated, tag = "6")]
        pub exists: Vec<bool>,
    }

    /// StartCommit requests the driver start committing its transaction,
    /// holding the runtime's opaque recovery-log checkpoint.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StartCommit {
        #[prost(bytes = "vec", tag = "1")]
        pub runtime_checkpoint: Vec<u8>,
    }

    /// Acknowledge tells the driver that the runtime's recovery-log
    /// checkpoint has committed.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Acknowledge {}
}

/// Response is the response type of the materialization Transactions RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub opened: Option<response::Opened>,
    #[prost(message, optional, tag = "2")]
    pub loaded: Option<response::Loaded>,
    #[prost(message, optional, tag = "3")]
    pub flushed: Option<response::Flushed>,
    #[prost(message, optional, tag = "4")]
    pub started_commit: Option<response::StartedCommit>,
    #[prost(message, optional, tag = "5")]
    pub acknowledged: Option<response::Acknowledged>,
}

pub mod response {
    use crate::flow;

    /// Opened responds to a Request.Open.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Opened {
        /// A previously-committed runtime checkpoint to resume from,
        /// or empty if the driver has no stateful opinion.
        #[prost(bytes = "vec", tag = "1")]
        pub runtime_checkpoint: Vec<u8>,
    }

    /// Loaded responds to Request.Loads of the transaction with documents
    /// that were found in the store.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Loaded {
        /// Index of the materialization binding of this batch.
        #[prost(uint32, tag = "1")]
        pub binding: u32,
        /// Arena holding the document content of this message.
        #[prost(bytes = "vec", tag = "2")]
        pub arena: Vec<u8>,
        /// Loaded JSON documents, as Slices of the arena.
        #[prost(message, repeated, tag = "3")]
        pub docs_json: Vec<flow::Slice>,
    }

    /// Flushed tells the runtime that all Loaded responses have been sent.
    /// Older drivers stage their connector state here rather than on
    /// StartedCommit; readers accept both positions and prefer the newer.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Flushed {
        #[prost(message, optional, tag = "1")]
        pub state: Option<flow::ConnectorState>,
    }

    /// StartedCommit tells the runtime that the driver has started to
    /// commit, and carries its updated connector state.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StartedCommit {
        #[prost(message, optional, tag = "1")]
        pub state: Option<flow::ConnectorState>,
    }

    /// Acknowledged tells the runtime that the driver's commit is complete,
    /// and that the next transaction may itself commit.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Acknowledged {}
}
