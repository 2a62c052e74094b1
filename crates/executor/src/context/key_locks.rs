// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_types::ContextId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Per-block key-lock table. A lock is held by a whole call chain (context),
/// not an individual frame: nested frames of the same transaction re-acquire
/// for free, while a different transaction queues up and is granted strictly
/// in request order once the holder's chain completes.
#[derive(Default)]
pub struct KeyLockManager {
    locks: Mutex<HashMap<String, KeyLock>>,
}

struct KeyLock {
    holder: ContextId,
    waiters: VecDeque<ContextId>,
}

/// A lock grant produced by a release: `context` now holds `key` and its
/// suspended executive can be resumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockGrant {
    pub key: String,
    pub context: ContextId,
}

impl KeyLockManager {
    pub fn new() -> Self { KeyLockManager::default() }

    /// Tries to take `key` for `context`. Re-acquiring a key the chain
    /// already holds is a no-op success. On contention the context is
    /// enqueued (once) and `false` is returned; the caller must suspend.
    pub fn acquire(&self, context: ContextId, key: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get_mut(key) {
            None => {
                locks.insert(
                    key.to_owned(),
                    KeyLock {
                        holder: context,
                        waiters: VecDeque::new(),
                    },
                );
                true
            }
            Some(lock) if lock.holder == context => true,
            Some(lock) => {
                if !lock.waiters.contains(&context) {
                    lock.waiters.push_back(context);
                }
                trace!(
                    "key lock contended: key={} holder={} waiter={}",
                    key,
                    lock.holder,
                    context
                );
                false
            }
        }
    }

    pub fn holds(&self, context: ContextId, key: &str) -> bool {
        self.locks
            .lock()
            .get(key)
            .map_or(false, |lock| lock.holder == context)
    }

    /// Releases every lock `context` holds. Each freed key is handed to the
    /// front of its wait queue; keys without waiters are dropped. The caller
    /// resumes the granted contexts.
    pub fn release_context(&self, context: ContextId) -> Vec<LockGrant> {
        let mut locks = self.locks.lock();
        let mut grants = Vec::new();

        locks.retain(|key, lock| {
            // A completed chain also stops waiting everywhere.
            lock.waiters.retain(|waiter| *waiter != context);

            if lock.holder != context {
                return true;
            }
            match lock.waiters.pop_front() {
                Some(next) => {
                    lock.holder = next;
                    grants.push(LockGrant {
                        key: key.clone(),
                        context: next,
                    });
                    true
                }
                None => false,
            }
        });

        grants
    }
}
