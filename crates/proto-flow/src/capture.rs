use crate::flow;

/// PullRequest is the request type of the pull-style capture RPC,
/// sent by the runtime client to the capture driver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullRequest {
    #[prost(message, optional, tag = "1")]
    pub open: Option<pull_request::Open>,
    /// Tell the driver that its Checkpoint has committed to the recovery log.
    #[prost(message, optional, tag = "2")]
    pub acknowledge: Option<Acknowledge>,
}

pub mod pull_request {
    use crate::flow;

    /// Open a pull of this capture, resuming from a prior driver checkpoint.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Open {
        #[prost(message, optional, tag = "1")]
        pub capture: Option<flow::CaptureSpec>,
        /// Version of the opened CaptureSpec.
        #[prost(string, tag = "2")]
        pub version: String,
        #[prost(fixed32, tag = "3")]
        pub key_begin: u32,
        #[prost(fixed32, tag = "4")]
        pub key_end: u32,
        /// Last-committed driver checkpoint, or empty if this is a new capture.
        #[prost(bytes = "vec", tag = "5")]
        pub driver_checkpoint_json: Vec<u8>,
        /// If true, perform a blocking tail of the capture.
        /// If false, produce all ready output and then close the RPC.
        #[prost(bool, tag = "6")]
        pub tail: bool,
    }
}

/// Acknowledge confirms the commit of one driver checkpoint
/// to the runtime's recovery log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acknowledge {}

/// PullResponse is the response type of the pull-style capture RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullResponse {
    #[prost(message, optional, tag = "1")]
    pub opened: Option<pull_response::Opened>,
    #[prost(message, optional, tag = "2")]
    pub documents: Option<Documents>,
    #[prost(message, optional, tag = "3")]
    pub checkpoint: Option<flow::DriverCheckpoint>,
}

pub mod pull_response {
    /// Opened responds to a PullRequest.Open.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Opened {}
}

/// Documents is a batch of captured documents of a single binding.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Documents {
    /// Index of the capture binding for this batch.
    #[prost(uint32, tag = "1")]
    pub binding: u32,
    /// Arena holding the document content of this message.
    #[prost(bytes = "vec", tag = "2")]
    pub arena: Vec<u8>,
    /// Documents of this batch, as Slices of the arena.
    #[prost(message, repeated, tag = "3")]
    pub docs_json: Vec<flow::Slice>,
}

impl Documents {
    /// Iterate over the documents of this (validated) batch.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.docs_json.iter().map(|slice| slice.of(&self.arena))
    }
}

/// PushRequest is the request type of the push-style capture RPC,
/// sent by the pushing driver to the runtime.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushRequest {
    #[prost(message, optional, tag = "1")]
    pub open: Option<push_request::Open>,
    #[prost(message, optional, tag = "2")]
    pub documents: Option<Documents>,
    #[prost(message, optional, tag = "3")]
    pub checkpoint: Option<flow::DriverCheckpoint>,
}

pub mod push_request {
    /// Open a push of a named capture.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Open {
        /// Name of the capture to push into.
        #[prost(string, tag = "1")]
        pub capture: String,
    }
}

/// PushResponse is the response type of the push-style capture RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushResponse {
    #[prost(message, optional, tag = "1")]
    pub opened: Option<push_response::Opened>,
    #[prost(message, optional, tag = "2")]
    pub acknowledge: Option<Acknowledge>,
}

pub mod push_response {
    use crate::flow;

    /// Status of an attempt to open a push.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Ok = 0,
        /// The named capture does not exist.
        CaptureNotFound = 1,
        /// The capture exists but is not currently serving pushes.
        CaptureStopped = 2,
    }

    /// Opened responds to a PushRequest.Open.
    /// When `status` is not Ok, all other fields are unset.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Opened {
        #[prost(enumeration = "Status", tag = "1")]
        pub status: i32,
        #[prost(message, optional, tag = "2")]
        pub capture: Option<flow::CaptureSpec>,
        #[prost(fixed32, tag = "3")]
        pub key_begin: u32,
        #[prost(fixed32, tag = "4")]
        pub key_end: u32,
        /// Last-committed driver checkpoint of the capture.
        #[prost(bytes = "vec", tag = "5")]
        pub driver_checkpoint_json: Vec<u8>,
    }

}
