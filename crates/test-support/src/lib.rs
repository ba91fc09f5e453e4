//! Test fixtures shared by protocol crates.

use anyhow::Context;
use proto_flow::{Combiner, DrainStats, DrainedDoc};
use serde_json::Value;

/// Encode a JSON value as document bytes.
pub fn doc(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

/// The packed key a [`TestCombiner`] extracts for a document:
/// its "k" property if it's an object having one, or the whole document.
pub fn packed_key(value: &Value) -> Vec<u8> {
    let key = match value {
        Value::Object(obj) => obj.get("k").unwrap_or(value),
        _ => value,
    };
    serde_json::to_vec(key).unwrap()
}

#[derive(Debug, Default)]
struct Entry {
    left: Option<Value>,
    rights: Vec<Value>,
}

/// TestCombiner is a deterministic in-memory combiner over JSON documents,
/// keyed on each document's "k" property (or the whole document when it
/// has none). Right-hand documents shallow-merge in arrival order over an
/// optional reduced left-hand document, and drain preserves first-arrival
/// key order.
#[derive(Debug, Default)]
pub struct TestCombiner {
    // Insertion-ordered (packed key, entry).
    entries: Vec<(Vec<u8>, Entry)>,
}

impl TestCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, packed: Vec<u8>) -> &mut Entry {
        if let Some(index) = self.entries.iter().position(|(key, _)| *key == packed) {
            &mut self.entries[index].1
        } else {
            self.entries.push((packed, Entry::default()));
            &mut self.entries.last_mut().unwrap().1
        }
    }
}

impl Combiner for TestCombiner {
    fn combine_right(&mut self, doc_json: &[u8]) -> anyhow::Result<()> {
        let value: Value =
            serde_json::from_slice(doc_json).context("parsing combined document")?;
        self.entry(packed_key(&value)).rights.push(value);
        Ok(())
    }

    fn reduce_left(&mut self, doc_json: &[u8]) -> anyhow::Result<()> {
        let value: Value =
            serde_json::from_slice(doc_json).context("parsing reduced document")?;
        let entry = self.entry(packed_key(&value));
        anyhow::ensure!(
            entry.left.is_none(),
            "key already has a reduced left-hand document"
        );
        entry.left = Some(value);
        Ok(())
    }

    fn drain(
        &mut self,
        each: &mut dyn FnMut(DrainedDoc<'_>) -> anyhow::Result<()>,
    ) -> anyhow::Result<DrainStats> {
        let mut stats = DrainStats::default();

        for (packed, entry) in self.entries.drain(..) {
            let full = entry.left.is_some();
            let mut reduced = Value::Null;

            for value in entry.left.into_iter().chain(entry.rights) {
                reduced = merge(reduced, value);
            }

            let doc_json = serde_json::to_vec(&reduced)?;
            let packed_values = match &reduced {
                Value::Object(obj) => match obj.get("v") {
                    Some(v) => serde_json::to_vec(v)?,
                    None => Vec::new(),
                },
                _ => Vec::new(),
            };

            stats.documents += 1;
            stats.bytes += doc_json.len();

            each(DrainedDoc {
                full,
                doc_json: &doc_json,
                packed_key: &packed,
                packed_values: &packed_values,
            })?;
        }

        Ok(stats)
    }
}

// Shallow-merge `rhs` over `lhs`: objects merge property-wise,
// everything else is last-writer-wins.
fn merge(lhs: Value, rhs: Value) -> Value {
    match (lhs, rhs) {
        (Value::Object(mut lhs), Value::Object(rhs)) => {
            for (key, value) in rhs {
                lhs.insert(key, value);
            }
            Value::Object(lhs)
        }
        (_, rhs) => rhs,
    }
}
