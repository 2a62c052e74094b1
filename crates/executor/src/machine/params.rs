// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

/// Earliest protocol version this executor understands.
pub const PROTOCOL_VERSION_V1: u32 = 1;
/// Version that activated privileged precompiled gating and frame gas
/// repricing.
pub const PROTOCOL_VERSION_V2: u32 = 2;
/// Current head version.
pub const PROTOCOL_VERSION_LATEST: u32 = PROTOCOL_VERSION_V2;

/// Chain-wide execution parameters, fixed for the lifetime of one executor
/// instance. Per-block variation (gas repricing, precompiled activation) is
/// derived from these via [`crate::machine::Machine::schedule`].
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub chain_id: u64,
    /// Contract addresses are BFS-style names and deploy input is the module
    /// itself, instead of EVM hex addresses and init bytecode.
    pub is_wasm: bool,
    /// Evaluate the authorization predicate before every call and deploy.
    pub is_auth_check: bool,
    pub block_gas_limit: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            chain_id: 1,
            is_wasm: false,
            is_auth_check: false,
            block_gas_limit: 3_000_000_000,
        }
    }
}
