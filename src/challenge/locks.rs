//! In-process serialization of work on the same challenge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per challenge id. Operations on different challenges
/// never wait on each other.
#[derive(Default)]
pub struct ChallengeLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl ChallengeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `challenge_id`. Released on drop.
    pub async fn acquire(&self, challenge_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Forget locks nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(challenge_id).or_default().clone()
        };

        lock.lock_owned().await
    }
}
