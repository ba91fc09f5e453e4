use crate::{capture, flow, materialize};

/// ValidateError is a failure of a message to meet its structural invariants.
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("message must set exactly one of {expected}")]
    ExactlyOneOf { expected: &'static str },
    #[error("missing required {0}")]
    Missing(&'static str),
    #[error("expected key_end >= key_begin ({key_begin:#010x} vs {key_end:#010x})")]
    KeyRange { key_begin: u32, key_end: u32 },
    #[error("task range must span the full r-clock range ({r_clock_begin:#010x}, {r_clock_end:#010x})")]
    RClockRange { r_clock_begin: u32, r_clock_end: u32 },
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("checkpoint cannot be empty when rfc7396_merge_patch is set")]
    EmptyMergePatch,
    #[error("{field} slice [{begin}, {end}) is not contained by its {arena}-byte arena")]
    SliceBounds {
        field: &'static str,
        begin: u32,
        end: u32,
        arena: usize,
    },
    #[error("Store keys, values, documents, and exists must have equal lengths ({keys}, {values}, {docs}, {exists})")]
    StoreLengths {
        keys: usize,
        values: usize,
        docs: usize,
        exists: usize,
    },
    #[error("Opened status is {status}, but capture fields are set")]
    OpenedStatusFields { status: i32 },
}

fn one_of(set: &[bool], expected: &'static str) -> Result<(), ValidateError> {
    if set.iter().filter(|s| **s).count() != 1 {
        Err(ValidateError::ExactlyOneOf { expected })
    } else {
        Ok(())
    }
}

fn slices_of(
    field: &'static str,
    slices: &[flow::Slice],
    arena: &[u8],
) -> Result<(), ValidateError> {
    for slice in slices {
        if slice.begin > slice.end || slice.end as usize > arena.len() {
            return Err(ValidateError::SliceBounds {
                field,
                begin: slice.begin,
                end: slice.end,
                arena: arena.len(),
            });
        }
    }
    Ok(())
}

fn checkpoint(cp: &flow::DriverCheckpoint) -> Result<(), ValidateError> {
    if cp.rfc7396_merge_patch && cp.driver_checkpoint_json.is_empty() {
        Err(ValidateError::EmptyMergePatch)
    } else {
        Ok(())
    }
}

impl flow::RangeSpec {
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.key_end < self.key_begin {
            return Err(ValidateError::KeyRange {
                key_begin: self.key_begin,
                key_end: self.key_end,
            });
        }
        // Splitting tasks on r-clock is not supported.
        if self.r_clock_begin != 0 || self.r_clock_end != u32::MAX {
            return Err(ValidateError::RClockRange {
                r_clock_begin: self.r_clock_begin,
                r_clock_end: self.r_clock_end,
            });
        }
        Ok(())
    }
}

impl capture::Documents {
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.docs_json.is_empty() {
            return Err(ValidateError::Empty("Documents.docs_json"));
        }
        slices_of("Documents.docs_json", &self.docs_json, &self.arena)
    }
}

impl capture::PullRequest {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[self.open.is_some(), self.acknowledge.is_some()],
            "Open, Acknowledge",
        )?;

        if let Some(open) = &self.open {
            if open.capture.is_none() {
                return Err(ValidateError::Missing("Open.capture"));
            }
            if open.key_end < open.key_begin {
                return Err(ValidateError::KeyRange {
                    key_begin: open.key_begin,
                    key_end: open.key_end,
                });
            }
        }
        Ok(())
    }
}

impl capture::PullResponse {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[
                self.opened.is_some(),
                self.documents.is_some(),
                self.checkpoint.is_some(),
            ],
            "Opened, Documents, Checkpoint",
        )?;

        if let Some(docs) = &self.documents {
            docs.validate()?;
        }
        if let Some(cp) = &self.checkpoint {
            checkpoint(cp)?;
        }
        Ok(())
    }
}

impl capture::PushRequest {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[
                self.open.is_some(),
                self.documents.is_some(),
                self.checkpoint.is_some(),
            ],
            "Open, Documents, Checkpoint",
        )?;

        if let Some(open) = &self.open {
            if open.capture.is_empty() {
                return Err(ValidateError::Empty("Open.capture"));
            }
        }
        if let Some(docs) = &self.documents {
            docs.validate()?;
        }
        if let Some(cp) = &self.checkpoint {
            checkpoint(cp)?;
        }
        Ok(())
    }
}

impl capture::PushResponse {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[self.opened.is_some(), self.acknowledge.is_some()],
            "Opened, Acknowledge",
        )?;

        if let Some(opened) = &self.opened {
            let ok = opened.status() == capture::push_response::Status::Ok;
            if ok && opened.capture.is_none() {
                return Err(ValidateError::Missing("Opened.capture"));
            }
            if !ok
                && (opened.capture.is_some()
                    || opened.key_begin != 0
                    || opened.key_end != 0
                    || !opened.driver_checkpoint_json.is_empty())
            {
                return Err(ValidateError::OpenedStatusFields {
                    status: opened.status,
                });
            }
        }
        Ok(())
    }
}

impl materialize::Request {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[
                self.open.is_some(),
                self.load.is_some(),
                self.flush.is_some(),
                self.store.is_some(),
                self.start_commit.is_some(),
                self.acknowledge.is_some(),
            ],
            "Open, Load, Flush, Store, StartCommit, Acknowledge",
        )?;

        if let Some(open) = &self.open {
            if open.materialization.is_none() {
                return Err(ValidateError::Missing("Open.materialization"));
            }
            match &open.range {
                None => return Err(ValidateError::Missing("Open.range")),
                Some(range) => range.validate()?,
            }
        }
        if let Some(load) = &self.load {
            if load.packed_keys.is_empty() {
                return Err(ValidateError::Empty("Load.packed_keys"));
            }
            slices_of("Load.packed_keys", &load.packed_keys, &load.arena)?;
        }
        if let Some(store) = &self.store {
            let (keys, values, docs, exists) = (
                store.packed_keys.len(),
                store.packed_values.len(),
                store.docs_json.len(),
                store.exists.len(),
            );
            if keys != values || keys != docs || keys != exists {
                return Err(ValidateError::StoreLengths {
                    keys,
                    values,
                    docs,
                    exists,
                });
            }
            if keys == 0 {
                return Err(ValidateError::Empty("Store.packed_keys"));
            }
            slices_of("Store.packed_keys", &store.packed_keys, &store.arena)?;
            slices_of("Store.packed_values", &store.packed_values, &store.arena)?;
            slices_of("Store.docs_json", &store.docs_json, &store.arena)?;
        }
        Ok(())
    }
}

impl materialize::Response {
    pub fn validate(&self) -> Result<(), ValidateError> {
        one_of(
            &[
                self.opened.is_some(),
                self.loaded.is_some(),
                self.flushed.is_some(),
                self.started_commit.is_some(),
                self.acknowledged.is_some(),
            ],
            "Opened, Loaded, Flushed, StartedCommit, Acknowledged",
        )?;

        if let Some(loaded) = &self.loaded {
            if loaded.docs_json.is_empty() {
                return Err(ValidateError::Empty("Loaded.docs_json"));
            }
            slices_of("Loaded.docs_json", &loaded.docs_json, &loaded.arena)?;
        }
        Ok(())
    }
}
