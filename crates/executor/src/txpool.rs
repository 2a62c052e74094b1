// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::error::{Error, Result};
use kestrel_types::{Transaction, H256};
use parking_lot::RwLock;
use std::collections::HashMap;

/// The transaction pool collaborator. `TXHASH` messages carry only a hash;
/// the executor resolves the body here before execution.
pub trait TxPool: Send + Sync {
    /// Resolves every hash to its transaction, in the same order. Any missing
    /// transaction fails the whole request.
    fn fill_block(&self, hashes: &[H256]) -> Result<Vec<Transaction>>;
}

/// In-memory pool for tests and tooling.
#[derive(Default)]
pub struct MemoryTxPool {
    transactions: RwLock<HashMap<H256, Transaction>>,
}

impl MemoryTxPool {
    pub fn new() -> Self { MemoryTxPool::default() }

    pub fn insert(&self, tx: Transaction) {
        self.transactions.write().insert(tx.hash, tx);
    }
}

impl TxPool for MemoryTxPool {
    fn fill_block(&self, hashes: &[H256]) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read();
        hashes
            .iter()
            .map(|hash| {
                transactions.get(hash).cloned().ok_or_else(|| {
                    Error::TxPool(format!(
                        "transaction does not exist: {:x}",
                        hash
                    ))
                })
            })
            .collect()
    }
}
