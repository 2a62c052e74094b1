// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::{
    entry::Entry,
    error::{Error, Result},
    layer::StateLayer,
};
use kestrel_types::{BlockNumber, TwoPcParams};

/// Read access to a store: a parent layer or a durable backend. This is the
/// only capability a [`StateLayer`] needs from its parent.
pub trait ReadOnlyStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<Entry>>;
}

/// The durability contract a physical storage engine must honor. All three
/// calls are keyed by block number; a number that does not match the staged
/// round is a protocol error surfaced to the caller.
///
/// `prepare` stages a layer's mutations without making them visible;
/// `commit` makes the staged mutations durable bit-exactly; `rollback`
/// restores the backend to its pre-`prepare` image.
pub trait TransactionalBackend: ReadOnlyStore {
    fn prepare(&self, params: &TwoPcParams, layer: &StateLayer) -> Result<()>;
    fn commit(&self, params: &TwoPcParams) -> Result<()>;
    fn rollback(&self, params: &TwoPcParams) -> Result<()>;
}

/// In-memory reference backend. Production deployments bind RocksDB or TiKV
/// behind [`TransactionalBackend`]; this implementation exists for tests and
/// for single-process tooling.
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<HashMap<(String, String), Entry>>,
    staged: Mutex<Option<Staging>>,
}

struct Staging {
    number: BlockNumber,
    records: Vec<(String, String, Entry)>,
}

impl MemoryBackend {
    pub fn new() -> Self { MemoryBackend::default() }

    /// Test helper: writes a row directly, bypassing two-phase commit.
    pub fn put(&self, table: &str, key: &str, entry: Entry) {
        self.rows
            .write()
            .insert((table.to_owned(), key.to_owned()), entry);
    }

    pub fn row_count(&self) -> usize { self.rows.read().len() }
}

impl ReadOnlyStore for MemoryBackend {
    fn get(&self, table: &str, key: &str) -> Result<Option<Entry>> {
        Ok(self
            .rows
            .read()
            .get(&(table.to_owned(), key.to_owned()))
            .cloned())
    }
}

impl TransactionalBackend for MemoryBackend {
    fn prepare(&self, params: &TwoPcParams, layer: &StateLayer) -> Result<()> {
        let mut staged = self.staged.lock();
        if let Some(staging) = staged.as_ref() {
            return Err(Error::PreparedMismatch {
                requested: params.number,
                prepared: staging.number,
            });
        }

        let mut records = Vec::with_capacity(layer.len());
        layer.traverse(|table, key, entry| {
            records.push((table.to_owned(), key.to_owned(), entry.clone()));
            true
        });

        debug!(
            "prepare block={} staged_records={}",
            params.number,
            records.len()
        );
        *staged = Some(Staging {
            number: params.number,
            records,
        });
        Ok(())
    }

    fn commit(&self, params: &TwoPcParams) -> Result<()> {
        let mut staged = self.staged.lock();
        let staging = match staged.take() {
            Some(staging) if staging.number == params.number => staging,
            Some(staging) => {
                let prepared = staging.number;
                *staged = Some(staging);
                return Err(Error::PreparedMismatch {
                    requested: params.number,
                    prepared,
                });
            }
            None => return Err(Error::NotPrepared(params.number)),
        };

        let mut rows = self.rows.write();
        for (table, key, entry) in staging.records {
            if entry.is_deleted() {
                rows.remove(&(table, key));
            } else {
                rows.insert((table, key), entry);
            }
        }
        info!("commit block={} done", params.number);
        Ok(())
    }

    fn rollback(&self, params: &TwoPcParams) -> Result<()> {
        let mut staged = self.staged.lock();
        match staged.take() {
            // Nothing was applied at prepare time, so dropping the staging
            // area restores the exact pre-prepare image.
            Some(staging) if staging.number == params.number => Ok(()),
            Some(staging) => {
                let prepared = staging.number;
                *staged = Some(staging);
                Err(Error::PreparedMismatch {
                    requested: params.number,
                    prepared,
                })
            }
            None => Err(Error::NotPrepared(params.number)),
        }
    }
}
