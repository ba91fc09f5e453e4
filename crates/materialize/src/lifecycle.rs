//! Staging of Load, Store, and Loaded messages into arena-backed batches.

use proto_flow::flow::Slice;
use proto_flow::materialize::{request, response, Request};

/// Capacity of a staged batch's arena.
pub const ARENA_CAPACITY: usize = 1 << 14; // 16 KiB
/// Capacity of a staged batch's slices.
pub const DOCS_CAPACITY: usize = 32;

/// Stage a packed key into the current Load batch, returning a batch
/// which must now be sent. Batches flush on binding changes, arena
/// overflow, and slice capacity.
pub fn stage_load(
    current: &mut Option<request::Load>,
    binding: u32,
    packed_key: &[u8],
) -> Option<request::Load> {
    let flushed = match current {
        Some(cur)
            if cur.binding != binding
                || packed_key.len() > ARENA_CAPACITY - cur.arena.len().min(ARENA_CAPACITY)
                || cur.packed_keys.len() == DOCS_CAPACITY =>
        {
            current.take()
        }
        _ => None,
    };

    let cur = current.get_or_insert_with(|| request::Load {
        binding,
        arena: Vec::with_capacity(ARENA_CAPACITY),
        packed_keys: Vec::with_capacity(DOCS_CAPACITY),
    });

    let begin = cur.arena.len() as u32;
    cur.arena.extend_from_slice(packed_key);
    cur.packed_keys.push(Slice {
        begin,
        end: cur.arena.len() as u32,
    });

    flushed
}

/// Stage a loaded document into the current Loaded batch, returning a
/// batch which must now be sent.
pub fn stage_loaded(
    current: &mut Option<response::Loaded>,
    binding: u32,
    doc_json: &[u8],
) -> Option<response::Loaded> {
    let flushed = match current {
        Some(cur)
            if cur.binding != binding
                || doc_json.len() > ARENA_CAPACITY - cur.arena.len().min(ARENA_CAPACITY)
                || cur.docs_json.len() == DOCS_CAPACITY =>
        {
            current.take()
        }
        _ => None,
    };

    let cur = current.get_or_insert_with(|| response::Loaded {
        binding,
        arena: Vec::with_capacity(ARENA_CAPACITY),
        docs_json: Vec::with_capacity(DOCS_CAPACITY),
    });

    let begin = cur.arena.len() as u32;
    cur.arena.extend_from_slice(doc_json);
    cur.docs_json.push(Slice {
        begin,
        end: cur.arena.len() as u32,
    });

    flushed
}

/// StoreStager batches the stored documents of one binding's drain,
/// collecting completed Store requests for the caller to send.
pub struct StoreStager {
    binding: u32,
    current: Option<request::Store>,
}

impl StoreStager {
    pub fn new(binding: u32) -> Self {
        Self {
            binding,
            current: None,
        }
    }

    /// Stage one stored document, pushing the prior batch onto `out`
    /// if the document doesn't fit.
    pub fn add(
        &mut self,
        out: &mut Vec<Request>,
        packed_key: &[u8],
        packed_values: &[u8],
        doc_json: &[u8],
        exists: bool,
    ) {
        let added = packed_key.len() + packed_values.len() + doc_json.len();

        if let Some(cur) = &self.current {
            if added > ARENA_CAPACITY - cur.arena.len().min(ARENA_CAPACITY)
                || cur.docs_json.len() == DOCS_CAPACITY
            {
                self.flush(out);
            }
        }

        let cur = self.current.get_or_insert_with(|| request::Store {
            binding: self.binding,
            arena: Vec::with_capacity(ARENA_CAPACITY),
            packed_keys: Vec::with_capacity(DOCS_CAPACITY),
            packed_values: Vec::with_capacity(DOCS_CAPACITY),
            docs_json: Vec::with_capacity(DOCS_CAPACITY),
            exists: Vec::with_capacity(DOCS_CAPACITY),
        });

        for (field, content) in [
            (&mut cur.packed_keys, packed_key),
            (&mut cur.packed_values, packed_values),
            (&mut cur.docs_json, doc_json),
        ] {
            let begin = cur.arena.len() as u32;
            cur.arena.extend_from_slice(content);
            field.push(Slice {
                begin,
                end: cur.arena.len() as u32,
            });
        }
        cur.exists.push(exists);
    }

    /// Push the final partial batch onto `out`.
    pub fn finish(mut self, out: &mut Vec<Request>) {
        self.flush(out);
    }

    fn flush(&mut self, out: &mut Vec<Request>) {
        if let Some(store) = self.current.take() {
            out.push(Request {
                store: Some(store),
                ..Default::default()
            });
        }
    }
}
