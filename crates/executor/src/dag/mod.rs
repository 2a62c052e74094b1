// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod critical;
mod txdag;

pub use critical::{
    extract_conflict_fields, ConflictFieldDef, ConflictKindDef, CriticalFields,
    CriticalKey, CriticalKind, ExtractEnv, FunctionAbi,
};
pub use txdag::{TxDag, DAG_BATCH_TIMEOUT};

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Cache of parsed parallel descriptors keyed by `(contract, selector)`.
/// Misses are cached too, so contracts without a parallel section are not
/// re-parsed every batch. Wiped wholesale when it outgrows its capacity.
pub struct AbiCache {
    capacity: usize,
    entries: RwLock<HashMap<(String, [u8; 4]), Option<Arc<FunctionAbi>>>>,
}

impl AbiCache {
    pub fn new(capacity: usize) -> Self {
        AbiCache {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(
        &self, contract: &str, selector: [u8; 4],
    ) -> Option<Option<Arc<FunctionAbi>>> {
        self.entries
            .read()
            .get(&(contract.to_owned(), selector))
            .cloned()
    }

    pub fn insert(
        &self, contract: String, selector: [u8; 4],
        abi: Option<Arc<FunctionAbi>>,
    ) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.clear();
        }
        entries.insert((contract, selector), abi);
    }
}
