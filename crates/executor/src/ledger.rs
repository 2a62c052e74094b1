// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::error::Result;

/// Chain configuration values read from the ledger when a block context is
/// constructed. The ledger is the authoritative source; the executor only
/// caches per-block.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub block_gas_limit: u64,
    /// Protocol version active at the chain head; individual blocks may pin
    /// an older version in their header.
    pub version: u32,
    pub consensus_nodes: Vec<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            chain_id: 1,
            block_gas_limit: 3_000_000_000,
            version: crate::machine::params::PROTOCOL_VERSION_LATEST,
            consensus_nodes: Vec::new(),
        }
    }
}

/// Read-only ledger collaborator.
pub trait Ledger: Send + Sync {
    fn chain_config(&self) -> Result<ChainConfig>;
}

/// Fixed-config ledger for tests and tooling.
#[derive(Default)]
pub struct StaticLedger {
    config: ChainConfig,
}

impl StaticLedger {
    pub fn new(config: ChainConfig) -> Self { StaticLedger { config } }
}

impl Ledger for StaticLedger {
    fn chain_config(&self) -> Result<ChainConfig> { Ok(self.config.clone()) }
}
