/// Slice is a contiguous range of bytes within an associated arena.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Slice {
    #[prost(uint32, tag = "1")]
    pub begin: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
}

impl Slice {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin as usize..self.end as usize
    }

    /// Resolve this Slice against its arena.
    /// The Slice must have been validated against the arena bounds.
    pub fn of<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        &arena[self.range()]
    }
}

/// RangeSpec describes the percent-encoded key and r-clock ranges
/// assigned to a task shard.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangeSpec {
    #[prost(fixed32, tag = "2")]
    pub key_begin: u32,
    #[prost(fixed32, tag = "3")]
    pub key_end: u32,
    #[prost(fixed32, tag = "4")]
    pub r_clock_begin: u32,
    #[prost(fixed32, tag = "5")]
    pub r_clock_end: u32,
}

/// CaptureSpec describes a capture task and its bindings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CaptureSpec {
    /// Name of this capture.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub bindings: Vec<capture_spec::Binding>,
}

pub mod capture_spec {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Binding {
        /// Name of the collection into which this binding captures.
        #[prost(string, tag = "1")]
        pub collection: String,
        /// Driver-defined route to the captured resource.
        #[prost(string, repeated, tag = "2")]
        pub resource_path: Vec<String>,
    }
}

/// MaterializationSpec describes a materialization task and its bindings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaterializationSpec {
    /// Name of this materialization.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub bindings: Vec<materialization_spec::Binding>,
}

pub mod materialization_spec {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Binding {
        /// Name of the collection from which this binding materializes.
        #[prost(string, tag = "1")]
        pub collection: String,
        /// Driver-defined route to the materialized resource.
        #[prost(string, repeated, tag = "2")]
        pub resource_path: Vec<String>,
        /// Whether the driver receives delta updates only, and never loads.
        #[prost(bool, tag = "4")]
        pub delta_updates: bool,
    }
}

/// DriverCheckpoint is an opaque driver progress state.
/// When `rfc7396_merge_patch` is set, the checkpoint is a partial update
/// to be reduced into a prior checkpoint via RFC 7396 merge-patch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DriverCheckpoint {
    #[prost(bytes = "vec", tag = "1")]
    pub driver_checkpoint_json: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub rfc7396_merge_patch: bool,
}

/// ConnectorState is the newer-protocol rendering of a driver checkpoint,
/// carried by materialization Flushed and StartedCommit responses.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectorState {
    #[prost(bytes = "vec", tag = "1")]
    pub updated_json: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub merge_patch: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("parsing current checkpoint state")]
    ParseState(#[source] serde_json::Error),
    #[error("parsing checkpoint merge patch")]
    ParsePatch(#[source] serde_json::Error),
    #[error("encoding reduced checkpoint")]
    Encode(#[source] serde_json::Error),
}

impl DriverCheckpoint {
    /// Reduce `rhs` into this checkpoint. A non-patch `rhs` fully replaces
    /// this checkpoint; a merge-patch `rhs` is applied per RFC 7396.
    pub fn reduce(&mut self, rhs: Self) -> Result<(), ReduceError> {
        let (json, patch) = reduce_json(
            std::mem::take(&mut self.driver_checkpoint_json),
            self.rfc7396_merge_patch,
            rhs.driver_checkpoint_json,
            rhs.rfc7396_merge_patch,
        )?;
        self.driver_checkpoint_json = json;
        self.rfc7396_merge_patch = patch;
        Ok(())
    }
}

impl ConnectorState {
    /// Reduce `rhs` into this state. A non-patch `rhs` fully replaces
    /// this state; a merge-patch `rhs` is applied per RFC 7396.
    pub fn reduce(&mut self, rhs: Self) -> Result<(), ReduceError> {
        let (json, patch) = reduce_json(
            std::mem::take(&mut self.updated_json),
            self.merge_patch,
            rhs.updated_json,
            rhs.merge_patch,
        )?;
        self.updated_json = json;
        self.merge_patch = patch;
        Ok(())
    }
}

fn reduce_json(
    lhs: Vec<u8>,
    lhs_patch: bool,
    rhs: Vec<u8>,
    rhs_patch: bool,
) -> Result<(Vec<u8>, bool), ReduceError> {
    if !rhs_patch {
        return Ok((rhs, false));
    }
    let mut base: serde_json::Value = if lhs.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&lhs).map_err(ReduceError::ParseState)?
    };
    let patch: serde_json::Value =
        serde_json::from_slice(&rhs).map_err(ReduceError::ParsePatch)?;

    json_patch::merge(&mut base, &patch);

    let json = serde_json::to_vec(&base).map_err(ReduceError::Encode)?;
    // A patch applied to a patch composes into a (larger) patch,
    // while a patch applied to a full state remains a full state.
    Ok((json, lhs_patch))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn cp(v: serde_json::Value, patch: bool) -> DriverCheckpoint {
        DriverCheckpoint {
            driver_checkpoint_json: v.to_string().into_bytes(),
            rfc7396_merge_patch: patch,
        }
    }

    fn parsed(cp: &DriverCheckpoint) -> serde_json::Value {
        serde_json::from_slice(&cp.driver_checkpoint_json).unwrap()
    }

    #[test]
    fn test_checkpoint_replacement_and_merge() {
        let mut base = cp(json!({"a": 1}), false);

        // Merge patches fold in, preserving unrelated fields.
        base.reduce(cp(json!({"b": 1}), true)).unwrap();
        assert_eq!(parsed(&base), json!({"a": 1, "b": 1}));
        assert!(!base.rfc7396_merge_patch);

        // Null-valued patch properties remove fields.
        base.reduce(cp(json!({"a": null, "c": {"d": 2}}), true))
            .unwrap();
        assert_eq!(parsed(&base), json!({"b": 1, "c": {"d": 2}}));

        // A non-patch checkpoint replaces wholesale.
        base.reduce(cp(json!({"z": true}), false)).unwrap();
        assert_eq!(parsed(&base), json!({"z": true}));
    }

    #[test]
    fn test_patch_reduced_into_empty_base() {
        let mut base = DriverCheckpoint::default();
        base.reduce(cp(json!({"a": 1}), true)).unwrap();
        assert_eq!(parsed(&base), json!({"a": 1}));
    }

    #[test]
    fn test_patch_over_patch_remains_patch() {
        let mut base = cp(json!({"a": 1}), true);
        base.reduce(cp(json!({"b": 2}), true)).unwrap();
        assert_eq!(parsed(&base), json!({"a": 1, "b": 2}));
        assert!(base.rfc7396_merge_patch);
    }

    #[test]
    fn test_invalid_checkpoint_json() {
        let mut base = cp(json!({"a": 1}), false);
        let rhs = DriverCheckpoint {
            driver_checkpoint_json: b"{invalid".to_vec(),
            rfc7396_merge_patch: true,
        };
        assert!(matches!(base.reduce(rhs), Err(ReduceError::ParsePatch(_))));
    }
}
