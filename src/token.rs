use std::sync::atomic::{AtomicU64, Ordering};

// Both counters start at 1 so that a default observer (0) is never up to date.
static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);
static NEXT_RECONSTRUCT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

/// ChangeToken is a cheap version stamp owned by a producer.
///
/// The producer calls [`ChangeToken::invalidate`] whenever its observable state
/// changes. Consumers keep a [`TokenObserver`] and compare it against the
/// producer's current token to detect staleness, so the producer never needs
/// to know who is watching.
///
/// Revisions are drawn from a process-wide counter, so a token is strictly
/// increasing and two different tokens never share a revision. An observer
/// that matches therefore guarantees no change happened in between.
///
/// # Examples
///
/// ```
/// # use layer_flow::{ChangeToken, TokenObserver};
/// let mut token = ChangeToken::new();
/// let mut observer = TokenObserver::default();
/// assert!(!token.is_up_to_date(&observer));
///
/// token.update(&mut observer);
/// assert!(token.is_up_to_date(&observer));
///
/// token.invalidate();
/// assert!(!token.is_up_to_date(&observer));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeToken {
    revision: u64,
}

impl Default for ChangeToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeToken {
    /// Create a token with a fresh revision.
    pub fn new() -> Self {
        Self {
            revision: next_revision(),
        }
    }

    /// Mark the producer as changed.
    pub fn invalidate(&mut self) {
        self.revision = next_revision();
    }

    /// Current revision of this token.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns true if `observer` was last synced to this exact revision.
    pub fn is_up_to_date(&self, observer: &TokenObserver) -> bool {
        observer.0 == self.revision
    }

    /// Sync `observer` to this token.
    pub fn update(&self, observer: &mut TokenObserver) {
        observer.0 = self.revision;
    }

    /// Returns an observer already synced to this token.
    pub fn observer(&self) -> TokenObserver {
        TokenObserver(self.revision)
    }
}

/// A consumer's saved copy of a producer's [`ChangeToken`].
///
/// The default observer is never up to date with any token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TokenObserver(u64);

/// ReconstructHandle identifies a single computation pass.
///
/// Handles are allocated from a process-wide, monotonically increasing counter.
/// Two results carrying the same handle come from the same pass; a later pass
/// always carries a strictly greater handle, even across layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconstructHandle(pub u64);

impl ReconstructHandle {
    /// Allocate the next handle.
    pub fn next() -> Self {
        ReconstructHandle(NEXT_RECONSTRUCT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ReconstructHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
