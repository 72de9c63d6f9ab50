//! Cancellation plumbing: identity-bearing client tokens and the rented
//! cancellation source pool.
//!
//! Cancellation in the core is layered:
//!
//! - a [`ClientToken`] is the promise-scoped cancellation a single client
//!   holds; it carries a stable numeric identity so registrations can be
//!   keyed by it and so a cancellation error can be told apart from a
//!   foreign one,
//! - a [`RentedCancellation`] is a pooled source that lives for one macro
//!   job run; it is rented at enumeration time, swapped out and fired on
//!   cancel, and returned to the pool only if it was never triggered.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::SluiceError;

static NEXT_CLIENT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// A client's promise-scoped cancellation handle.
///
/// Clones share the same underlying token and the same identity; equality
/// and hashing are identity-based, never state-based.
#[derive(Clone)]
pub struct ClientToken {
    id: u64,
    token: CancellationToken,
}

impl ClientToken {
    pub fn new() -> Self {
        Self {
            id: NEXT_CLIENT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    /// Stable identity of this token across clones.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ClientToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientToken {}

impl Hash for ClientToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientToken")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Rented Sources
// =============================================================================

struct PooledSlot {
    token: CancellationToken,
    generation: u64,
}

/// A cancellation source rented from a [`CancellationPool`] for the lifetime
/// of one macro job run.
///
/// Move semantics enforce the return-once rule: giving the source back or
/// firing it consumes it, so a second return is unrepresentable. The
/// generation counts how many times the slot has cycled through the pool
/// and is carried for diagnostics.
pub struct RentedCancellation {
    token: CancellationToken,
    generation: u64,
}

impl RentedCancellation {
    /// Token of this rental. Clones handed out to watchers stay valid for
    /// the duration of the rental only.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Trigger the source, consuming the rental. A fired source never goes
    /// back to the pool.
    pub fn fire(self) {
        self.token.cancel();
    }
}

impl fmt::Debug for RentedCancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RentedCancellation")
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Free-list of reusable cancellation sources.
#[derive(Default)]
pub struct CancellationPool {
    free: Mutex<Vec<PooledSlot>>,
}

impl CancellationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent a source, reusing a pooled slot when one is available.
    pub fn rent(&self) -> RentedCancellation {
        let slot = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or(PooledSlot {
                token: CancellationToken::new(),
                generation: 0,
            });
        RentedCancellation {
            token: slot.token,
            generation: slot.generation,
        }
    }

    /// Return an untriggered source to the pool.
    ///
    /// # Errors
    ///
    /// Refused with [`SluiceError::SchedulingInvariant`] when the source has
    /// been triggered: a fired token can never be reset, so handing it to
    /// the next renter would cancel work that was never asked to stop. The
    /// source is dropped instead of pooled. This must never happen in
    /// correct code.
    pub fn give_back(&self, rented: RentedCancellation) -> Result<(), SluiceError> {
        if rented.token.is_cancelled() {
            return Err(SluiceError::SchedulingInvariant(
                "a triggered cancellation source was returned to the pool",
            ));
        }
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PooledSlot {
                token: rented.token,
                generation: rented.generation + 1,
            });
        Ok(())
    }

    /// Sources currently sitting in the free list.
    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn client_tokens_have_identity_semantics() {
        let a = ClientToken::new();
        let b = ClientToken::new();
        let a2 = a.clone();

        assert_eq!(a, a2);
        assert_ne!(a, b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&a2));
        assert!(!set.contains(&b));

        a2.cancel();
        assert!(a.is_cancelled());
        // Cancellation does not change identity.
        assert_eq!(a, a2);
    }

    #[test]
    fn pool_recycles_untriggered_sources() {
        let pool = CancellationPool::new();
        let first = pool.rent();
        assert_eq!(first.generation(), 0);

        pool.give_back(first).unwrap();
        assert_eq!(pool.idle_count(), 1);

        let second = pool.rent();
        assert_eq!(second.generation(), 1);
        assert!(!second.token().is_cancelled());
    }

    #[test]
    fn fired_sources_do_not_return() {
        let pool = CancellationPool::new();
        let rented = pool.rent();
        let watcher = rented.token().clone();

        rented.fire();
        assert!(watcher.is_cancelled());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn returning_a_triggered_source_is_refused() {
        let pool = CancellationPool::new();
        let rented = pool.rent();
        rented.token().cancel();

        match pool.give_back(rented) {
            Err(SluiceError::SchedulingInvariant(_)) => {}
            other => panic!("expected an invariant violation, got {other:?}"),
        }
        // The triggered source was dropped, never pooled.
        assert_eq!(pool.idle_count(), 0);
    }
}
