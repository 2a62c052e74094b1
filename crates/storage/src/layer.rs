// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::{
    collections::{
        hash_map::{DefaultHasher, Entry as MapEntry},
        HashMap,
    },
    hash::{Hash as StdHash, Hasher as StdHasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    backend::ReadOnlyStore,
    entry::Entry,
    error::{Error, Result},
    hasher::Hasher,
    recorder::{Change, Recorder},
};
use kestrel_types::{BlockNumber, H256};

/// One block's copy-on-write view of world state.
///
/// A layer records only its own mutations; every read that misses locally is
/// delegated to the parent, which is either the previous block's layer or a
/// durable backend. Layers form a singly-linked chain pruned from the root as
/// commits land.
///
/// Mutations are sharded over buckets keyed by `(table, key)` so concurrent
/// writers to different keys never contend on one lock.
pub struct StateLayer {
    block_number: BlockNumber,
    buckets: Vec<Mutex<HashMap<(String, String), Entry>>>,
    prev: RwLock<Option<Arc<dyn ReadOnlyStore>>>,
    read_only: AtomicBool,
}

impl StateLayer {
    pub fn new(
        block_number: BlockNumber, prev: Option<Arc<dyn ReadOnlyStore>>,
    ) -> Self {
        let bucket_count = num_cpus::get().max(1);
        let buckets =
            (0..bucket_count).map(|_| Mutex::new(HashMap::new())).collect();
        StateLayer {
            block_number,
            buckets,
            prev: RwLock::new(prev),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn block_number(&self) -> BlockNumber { self.block_number }

    pub fn is_read_only(&self) -> bool { self.read_only.load(Ordering::Acquire) }

    /// Marks the layer read-only. Done once the next block's layer stacks on
    /// top of this one; from then on only a child layer may shadow its rows.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Re-parents the layer. Used when the old parent layer has been
    /// committed and pruned: the swap is what makes the prune atomic for
    /// readers, which see either the full old chain or the full new one.
    pub fn set_prev(&self, prev: Option<Arc<dyn ReadOnlyStore>>) {
        *self.prev.write() = prev;
    }

    fn bucket(&self, table: &str, key: &str) -> &Mutex<HashMap<(String, String), Entry>> {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }

    /// The visible value of `(table, key)`: the local mutation if present
    /// (tombstones read as absent), else whatever the parent chain holds.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Entry>> {
        {
            let bucket = self.bucket(table, key).lock();
            if let Some(entry) = bucket.get(&(table.to_owned(), key.to_owned()))
            {
                if entry.is_deleted() {
                    return Ok(None);
                }
                return Ok(Some(entry.clone()));
            }
        }

        let prev = self.prev.read().clone();
        match prev {
            Some(prev) => prev.get(table, key),
            None => Ok(None),
        }
    }

    /// Records a local mutation (including tombstones) and returns the local
    /// entry it replaced, if any. Fails on read-only layers; mutating a
    /// sealed block is always a caller bug.
    pub fn set(
        &self, table: &str, key: &str, entry: Entry,
    ) -> Result<Option<Entry>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let mut bucket = self.bucket(table, key).lock();
        Ok(bucket.insert((table.to_owned(), key.to_owned()), entry))
    }

    /// `set` that logs the displaced value into `recorder` so the write can
    /// be undone by [`StateLayer::rollback`].
    pub fn set_recorded(
        &self, recorder: &mut Recorder, table: &str, key: &str, entry: Entry,
    ) -> Result<()> {
        let previous = self.set(table, key, entry)?;
        recorder.log(Change {
            table: table.to_owned(),
            key: key.to_owned(),
            previous,
        });
        Ok(())
    }

    /// Restores the layer image to what it was before the recorded changes,
    /// most recent change first. A missing rollback target means the log and
    /// the layer diverged — surfaced, never ignored.
    pub fn rollback(&self, recorder: Recorder) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        for change in recorder.drain_reverse() {
            let mut bucket = self.bucket(&change.table, &change.key).lock();
            let slot = (change.table.clone(), change.key.clone());
            match change.previous {
                Some(previous) => {
                    bucket.insert(slot, previous);
                }
                None => match bucket.entry(slot) {
                    MapEntry::Occupied(occupied) => {
                        occupied.remove();
                    }
                    MapEntry::Vacant(_) => {
                        return Err(Error::Rollback {
                            table: change.table,
                            key: change.key,
                        });
                    }
                },
            }
        }
        Ok(())
    }

    /// Visits every local mutation. The visitor returns `false` to stop.
    pub fn traverse(
        &self, mut f: impl FnMut(&str, &str, &Entry) -> bool,
    ) {
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for ((table, key), entry) in bucket.iter() {
                if !f(table, key, entry) {
                    return;
                }
            }
        }
    }

    /// Number of local mutations, tombstones included.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Copies every local mutation into `target`. The target is not visible
    /// to any reader chain during the merge; visibility flips atomically when
    /// the chain is re-parented with [`StateLayer::set_prev`].
    pub fn merge_into(&self, target: &StateLayer) -> Result<usize> {
        if std::ptr::eq(self, target) {
            return Err(Error::Msg("cannot merge a layer into itself".into()));
        }

        let mut count = 0usize;
        let mut result = Ok(());
        self.traverse(|table, key, entry| {
            match target.set(table, key, entry.clone()) {
                Ok(_) => {
                    count += 1;
                    true
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result?;

        debug!(
            "merged layer {} into cache, records={}",
            self.block_number, count
        );
        Ok(count)
    }

    /// Deterministic content hash of the layer: the XOR of per-row hashes,
    /// independent of bucket layout and of the order mutations were applied
    /// by parallel workers.
    pub fn hash(&self, hasher: &dyn Hasher) -> H256 {
        let mut total = H256::zero();
        self.traverse(|table, key, entry| {
            let row_hash = hasher.hash(table.as_bytes())
                ^ hasher.hash(key.as_bytes())
                ^ hasher.hash(&entry.hash_image());
            total ^= row_hash;
            true
        });
        total
    }
}

impl ReadOnlyStore for StateLayer {
    fn get(&self, table: &str, key: &str) -> Result<Option<Entry>> {
        StateLayer::get(self, table, key)
    }
}
