//! Primary key generation rules.

use std::sync::atomic::{AtomicU64, Ordering};

/// Rule that produces primary keys for new entities submitted without one.
///
/// Returning `None` means the type has no generation rule; the service then
/// rejects the submission with `Error::InvalidArgument`.
pub trait IdRule<Id>: Send + Sync {
    /// Produce the next primary key.
    fn next_id(&self) -> Option<Id>;
}

/// Rule for entity types whose keys are always assigned by the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIdRule;

impl<Id> IdRule<Id> for NoIdRule {
    fn next_id(&self) -> Option<Id> {
        None
    }
}

/// Monotonic in-process sequence.
///
/// Typically seeded with the current maximum id read from the database at
/// startup.
#[derive(Debug)]
pub struct SequenceIdRule {
    next: AtomicU64,
}

impl SequenceIdRule {
    /// Create a sequence whose first generated value is `start`.
    pub fn starting_at(start: u64) -> Self {
        SequenceIdRule {
            next: AtomicU64::new(start),
        }
    }

    /// Peek at the value the next call will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for SequenceIdRule {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdRule<u64> for SequenceIdRule {
    fn next_id(&self) -> Option<u64> {
        Some(self.next.fetch_add(1, Ordering::AcqRel))
    }
}

/// Closures work as ad-hoc rules.
impl<Id, F> IdRule<Id> for F
where
    F: Fn() -> Option<Id> + Send + Sync,
{
    fn next_id(&self) -> Option<Id> {
        self()
    }
}
