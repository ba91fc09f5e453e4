/// DrainedDoc is one document drained from a Combiner.
#[derive(Debug)]
pub struct DrainedDoc<'a> {
    /// Whether the document is a full reduction: true iff any reduce_left
    /// was applied for this key.
    pub full: bool,
    /// Combined JSON document.
    pub doc_json: &'a [u8],
    /// Packed tuple of the document's key.
    pub packed_key: &'a [u8],
    /// Packed tuple of the document's selected values.
    pub packed_values: &'a [u8],
}

/// DrainStats summarize a completed Combiner drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub documents: usize,
    pub bytes: usize,
}

/// Combiner reduces multiple input documents sharing a key into one
/// representative document. It's an externally-provided capability:
/// implementations validate and reduce documents per their collection
/// schema, and this crate treats them opaquely.
pub trait Combiner: Send + 'static {
    /// Combine a right-hand side document into the accumulator.
    fn combine_right(&mut self, doc_json: &[u8]) -> anyhow::Result<()>;

    /// Reduce a fully-reduced left-hand side document into the accumulator,
    /// marking its key's combined output as a full reduction.
    fn reduce_left(&mut self, doc_json: &[u8]) -> anyhow::Result<()>;

    /// Drain the accumulator, invoking `each` exactly once per unique key
    /// after all of its inputs have been combined. The combiner is empty
    /// and ready for re-use after a successful drain.
    fn drain(
        &mut self,
        each: &mut dyn FnMut(DrainedDoc<'_>) -> anyhow::Result<()>,
    ) -> anyhow::Result<DrainStats>;
}
