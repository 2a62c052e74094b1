// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{Bytes, ContextId, Seq, H256, U256};
use serde_derive::{Deserialize, Serialize};

/// The kind of an [`ExecutionMessage`] travelling between the external
/// scheduler and the executor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub enum MessageKind {
    /// A transaction referenced only by hash; the executor resolves the body
    /// from the transaction pool.
    TxHash,
    /// A fully-populated call request, either top-level or the request side of
    /// a nested external call.
    #[default]
    Message,
    /// Terminal success of a call; as an input it resumes the suspended
    /// caller frame.
    Finished,
    /// Terminal revert of a call; as an input it resumes the suspended caller
    /// frame on its failure path.
    Revert,
    /// A key-lock wait notification (executor to scheduler) or a lock grant
    /// (scheduler to executor).
    KeyLock,
    /// The transaction could not be scheduled on the parallel path and must be
    /// resubmitted through the sequential one.
    SendBack,
    /// Abort of a call chain that is blocked on a key lock held by a chain
    /// which itself failed.
    RevertKeyLock,
}

/// A single contract event, accumulated per call and carried on the terminal
/// message of the call chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// The request/response unit exchanged with the external scheduler. One
/// message describes either a call to start, a result to deliver back into a
/// suspended call chain, or a key-lock event; see [`MessageKind`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub kind: MessageKind,
    pub context_id: ContextId,
    pub seq: Seq,

    /// Set only for `TxHash` messages.
    pub transaction_hash: Option<H256>,

    /// Sender of the original transaction, stable across the call chain.
    pub origin: String,
    pub from: String,
    pub to: String,

    pub input: Bytes,
    pub gas_available: u64,
    pub value: U256,

    pub static_call: bool,
    pub create: bool,
    pub create_salt: Option<U256>,

    /// Key locks held by this call chain, passed along so a nested callee on
    /// another executor can keep honoring them.
    pub key_locks: Vec<String>,
    /// The key lock this chain is waiting for (`KeyLock` messages only).
    pub key_lock_acquired: Option<String>,

    pub status: i32,
    pub message: String,
    pub log_entries: Vec<LogEntry>,
    /// Address of the contract created by this call, if any.
    pub new_contract_address: String,
}

impl ExecutionMessage {
    pub fn new_tx_hash(
        context_id: ContextId, seq: Seq, hash: H256, to: String,
    ) -> Self {
        ExecutionMessage {
            kind: MessageKind::TxHash,
            context_id,
            seq,
            transaction_hash: Some(hash),
            to,
            ..Default::default()
        }
    }

    /// Whether this message carries a terminal result rather than a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, MessageKind::Finished | MessageKind::Revert)
    }
}

/// Reserved prefix of system tables; user contracts may never write below it.
pub const SYS_TABLE_PREFIX: &str = "/sys/";

/// Prefix of per-contract tables.
pub const APPS_TABLE_PREFIX: &str = "/apps/";

/// Derives the storage table backing a contract address.
pub fn contract_table_name(address: &str) -> String {
    let address = address.trim_start_matches('/');
    format!("{}{}", APPS_TABLE_PREFIX, address)
}
