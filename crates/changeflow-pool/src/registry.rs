//! Reference-counted tracking of in-flight change resources.
//!
//! A change resource is tracked under its serialized identifier from the moment
//! a job referencing it is created until the last such job is acknowledged.
//! Only this registry calls [`ChangeResource::release`] on tracked resources.

use std::collections::HashMap;

use tracing::debug;

use crate::error::PoolError;

/// An external change object handed to the pool by a producer.
pub trait ChangeResource: Send + 'static {
    /// Stable identifier. Must be pure and deterministic: two handles to the
    /// same underlying resource serialize to the same string.
    fn serialize(&self) -> String;

    /// Free the underlying resource. Consumes the handle, so it runs once.
    fn release(self: Box<Self>);
}

struct Entry {
    resource: Box<dyn ChangeResource>,
    ref_count: usize,
}

/// Outcome of an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledged {
    /// Other jobs still reference the resource.
    Retained { remaining: usize },
    /// The last reference was acknowledged and the resource released.
    Released,
}

/// Registry of change resources keyed by serialized identifier.
#[derive(Default)]
pub struct ChangeRegistry {
    entries: HashMap<String, Entry>,
}

impl ChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or add) a reference to `resource` and return its identifier.
    ///
    /// When the identifier is already tracked the count goes up and the new
    /// handle is dropped without release: the tracked handle stands for the
    /// shared resource.
    pub fn track(&mut self, resource: Box<dyn ChangeResource>) -> String {
        let change_id = resource.serialize();
        match self.entries.get_mut(&change_id) {
            Some(entry) => {
                entry.ref_count += 1;
                debug!(change_id = %change_id, ref_count = entry.ref_count, "Change reference added");
            }
            None => {
                debug!(change_id = %change_id, "Tracking change resource");
                self.entries.insert(
                    change_id.clone(),
                    Entry {
                        resource,
                        ref_count: 1,
                    },
                );
            }
        }
        change_id
    }

    /// Drop one reference; release the resource when none remain.
    pub fn acknowledge(&mut self, change_id: &str) -> Result<Acknowledged, PoolError> {
        let entry = self
            .entries
            .get_mut(change_id)
            .ok_or_else(|| PoolError::UnknownChangeId {
                change_id: change_id.to_string(),
            })?;

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(Acknowledged::Retained {
                remaining: entry.ref_count,
            });
        }

        if let Some(entry) = self.entries.remove(change_id) {
            debug!(change_id, "Releasing change resource");
            entry.resource.release();
        }
        Ok(Acknowledged::Released)
    }

    /// Current reference count, or `None` if not tracked.
    pub fn ref_count(&self, change_id: &str) -> Option<usize> {
        self.entries.get(change_id).map(|e| e.ref_count)
    }

    pub fn contains(&self, change_id: &str) -> bool {
        self.entries.contains_key(change_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ChangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, e)| (id, e.ref_count)))
            .finish()
    }
}
