// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod block;
mod message;

pub use self::{
    block::{BlockHeader, Transaction, TwoPcParams},
    message::{contract_table_name, ExecutionMessage, LogEntry, MessageKind},
};

pub use ethereum_types::{H256, U256};

pub type Bytes = Vec<u8>;

/// Block numbers are signed in the scheduler protocol: `-1` denotes "no
/// committed block yet".
pub type BlockNumber = i64;

/// Identifier of one top-level transaction context within a block.
pub type ContextId = i64;

/// Call sequence inside a transaction context. The top-level call is seq 0,
/// every nested external call allocates the next value.
pub type Seq = i64;
