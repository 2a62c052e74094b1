// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{BlockNumber, Bytes, H256};
use serde_derive::{Deserialize, Serialize};

/// The subset of a block header the executor needs to seed a block context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: BlockNumber,
    pub hash: H256,
    pub timestamp: u64,
    /// Protocol version the block was sealed under; gates gas schedule and
    /// precompiled activation.
    pub version: u32,
    pub gas_limit: u64,
}

impl BlockHeader {
    pub fn new(number: BlockNumber) -> Self {
        BlockHeader {
            number,
            ..Default::default()
        }
    }
}

/// A transaction body resolved from the pool. The executor never verifies
/// signatures; the pool only returns verified transactions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: H256,
    pub sender: String,
    pub to: String,
    pub input: Bytes,
    /// Contract ABI carried on deploy transactions, stored next to the code.
    pub abi: String,
}

/// Parameters of one two-phase-commit round, keyed by block number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoPcParams {
    pub number: BlockNumber,
    pub timestamp: u64,
}

impl TwoPcParams {
    pub fn new(number: BlockNumber) -> Self {
        TwoPcParams {
            number,
            timestamp: 0,
        }
    }
}
