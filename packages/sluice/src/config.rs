//! Server configuration.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::SluiceError;

/// Bounds applied to `hash_index_size`.
pub const MIN_HASH_INDEX_SIZE: i64 = 256;
pub const MAX_HASH_INDEX_SIZE: i64 = 1 << 40;

/// Options recognized by the job server core.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ServerOptions {
    /// Filesystem path for the blob store's log device. Empty means
    /// memory-only.
    #[builder(default, setter(into))]
    pub path: String,

    /// Pre-size the log device. Honored by stores that support it; the sled
    /// store ignores it.
    #[builder(default)]
    pub preallocate: bool,

    /// Unlink the blob store's backing files on teardown.
    #[builder(default)]
    pub delete_on_dispose: bool,

    /// Entries in the blob store's in-memory hash index. Clamped to
    /// `[MIN_HASH_INDEX_SIZE, MAX_HASH_INDEX_SIZE]`.
    #[builder(default = 1 << 20)]
    pub hash_index_size: i64,

    /// How long a client queue may sit idle before it is removed.
    #[builder(default = Duration::from_secs(60))]
    pub expiry_ticks: Duration,

    /// Buckets in the shared expiry timer wheel.
    #[builder(default = 20)]
    pub expiry_bucket_count: u32,

    /// Number of priority classes.
    #[builder(default = 3)]
    pub count_priorities: u32,

    /// Identity component baked into every minted promise id.
    #[builder(default = 1)]
    pub service_id: u32,

    /// Worker tasks draining the dispatch channel.
    #[builder(default = 4)]
    pub worker_count: usize,

    /// Capacity of the dispatcher-to-worker channel.
    #[builder(default = 32)]
    pub dispatch_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerOptions {
    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), SluiceError> {
        if self.count_priorities == 0 {
            return Err(SluiceError::user_input(
                "count_priorities must be at least 1",
            ));
        }
        if self.expiry_bucket_count == 0 {
            return Err(SluiceError::user_input(
                "expiry_bucket_count must be at least 1",
            ));
        }
        if self.expiry_ticks.is_zero() {
            return Err(SluiceError::user_input("expiry_ticks must be non-zero"));
        }
        if self.worker_count == 0 {
            return Err(SluiceError::user_input("worker_count must be at least 1"));
        }
        if self.dispatch_capacity == 0 {
            return Err(SluiceError::user_input(
                "dispatch_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// `hash_index_size` clamped to its supported range.
    pub fn clamped_hash_index_size(&self) -> i64 {
        self.hash_index_size
            .clamp(MIN_HASH_INDEX_SIZE, MAX_HASH_INDEX_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ServerOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_priorities_is_rejected() {
        let options = ServerOptions::builder().count_priorities(0).build();
        match options.validate() {
            Err(SluiceError::UserInput(message)) => assert!(message.contains("count_priorities")),
            other => panic!("expected user input error, got {other:?}"),
        }
    }

    #[test]
    fn hash_index_size_is_clamped_both_ways() {
        let small = ServerOptions::builder().hash_index_size(1).build();
        assert_eq!(small.clamped_hash_index_size(), MIN_HASH_INDEX_SIZE);

        let large = ServerOptions::builder().hash_index_size(i64::MAX).build();
        assert_eq!(large.clamped_hash_index_size(), MAX_HASH_INDEX_SIZE);

        let fine = ServerOptions::builder().hash_index_size(4096).build();
        assert_eq!(fine.clamped_hash_index_size(), 4096);
    }

    #[test]
    fn zero_buckets_and_zero_workers_are_rejected() {
        assert!(ServerOptions::builder()
            .expiry_bucket_count(0)
            .build()
            .validate()
            .is_err());
        assert!(ServerOptions::builder()
            .worker_count(0)
            .build()
            .validate()
            .is_err());
    }
}
