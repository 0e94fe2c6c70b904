//! Lifecycle owners and the transitions they report

use derive_more::Display;

/// A UI-scoped object whose lifecycle gates delivery to its registrations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LifecycleOwner {
    /// Unique id of the owner instance
    pub id: u64,
    /// Kind of the owner, matched against the exclusion list
    pub kind: String,
}

impl LifecycleOwner {
    /// Create a new lifecycle owner
    pub fn new(id: u64, kind: impl Into<String>) -> Self {
        Self { id, kind: kind.into() }
    }
}

/// Lifecycle transition of an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LifecycleTransition {
    /// The owner is in the foreground
    Resume,
    /// The owner left the foreground
    Pause,
    /// The owner is gone for good
    Destroy,
}
