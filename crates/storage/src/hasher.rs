// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_types::H256;

/// The hash implementation used for layer content hashes and address
/// derivation. Always injected explicitly; no component reads a process-wide
/// hash singleton.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> H256;
}

/// Keccak-256, the default for EVM-compatible deployments.
#[derive(Clone, Copy, Debug, Default)]
pub struct Keccak256Hasher;

impl Hasher for Keccak256Hasher {
    fn hash(&self, data: &[u8]) -> H256 { keccak_hash::keccak(data) }
}
