// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::status::TransactionStatus;
use kestrel_types::{
    Bytes, ContextId, ExecutionMessage, LogEntry, MessageKind, Seq, Transaction,
    U256,
};

/// What a [`CallParameters`] value represents inside the core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallKind {
    /// A call request entering or leaving an executive.
    #[default]
    Message,
    /// A key-lock wait leaving an executive, or a lock grant entering one.
    KeyLock,
    /// Successful completion.
    Finished,
    /// Reverted completion.
    Revert,
}

/// The in-core representation of one call: constructed from an
/// [`ExecutionMessage`] at the boundary, transformed by the executive stack
/// and the DAG scheduler, and converted back on the way out.
#[derive(Clone, Debug, Default)]
pub struct CallParameters {
    pub kind: CallKind,
    pub context_id: ContextId,
    pub seq: Seq,

    pub origin: String,
    pub sender_address: String,
    pub receive_address: String,
    /// The contract whose code runs; differs from `receive_address` only for
    /// delegate-style calls.
    pub code_address: String,

    pub data: Bytes,
    pub gas: u64,
    pub value: U256,

    pub static_call: bool,
    pub create: bool,
    pub create_salt: Option<U256>,
    /// ABI document carried on deploys, stored next to the code.
    pub abi: String,

    /// Key locks held by this call chain.
    pub key_locks: Vec<String>,
    /// The key lock the chain is waiting to acquire (`KeyLock` kind only).
    pub acquire_key_lock: Option<String>,

    pub status: TransactionStatus,
    pub message: String,
    pub log_entries: Vec<LogEntry>,
    pub new_contract_address: String,
}

impl CallParameters {
    pub fn new(kind: CallKind) -> Self {
        CallParameters {
            kind,
            ..Default::default()
        }
    }

    /// Builds call parameters from a scheduler message that already carries
    /// the full call body (everything except `TxHash`/`SendBack`).
    pub fn from_message(input: &ExecutionMessage, static_call: bool) -> Self {
        let kind = match input.kind {
            MessageKind::Revert => CallKind::Revert,
            MessageKind::Finished => CallKind::Finished,
            MessageKind::KeyLock => CallKind::KeyLock,
            MessageKind::Message
            | MessageKind::TxHash
            | MessageKind::SendBack
            | MessageKind::RevertKeyLock => CallKind::Message,
        };

        CallParameters {
            kind,
            context_id: input.context_id,
            seq: input.seq,
            origin: input.origin.clone(),
            sender_address: input.from.clone(),
            receive_address: input.to.clone(),
            code_address: input.to.clone(),
            data: input.input.clone(),
            gas: input.gas_available,
            value: input.value,
            static_call,
            create: input.create,
            create_salt: input.create_salt,
            abi: String::new(),
            key_locks: input.key_locks.clone(),
            acquire_key_lock: None,
            status: TransactionStatus::from_i32(input.status),
            message: input.message.clone(),
            log_entries: Vec::new(),
            new_contract_address: input.new_contract_address.clone(),
        }
    }

    /// Builds call parameters by merging a `TxHash` message with the
    /// transaction body resolved from the pool.
    pub fn from_transaction(input: &ExecutionMessage, tx: &Transaction) -> Self {
        CallParameters {
            kind: CallKind::Message,
            context_id: input.context_id,
            seq: input.seq,
            origin: tx.sender.clone(),
            sender_address: tx.sender.clone(),
            receive_address: input.to.clone(),
            code_address: input.to.clone(),
            data: tx.input.clone(),
            gas: input.gas_available,
            value: input.value,
            static_call: input.static_call,
            create: input.create,
            create_salt: input.create_salt,
            abi: tx.abi.clone(),
            key_locks: input.key_locks.clone(),
            acquire_key_lock: None,
            status: TransactionStatus::Ok,
            message: String::new(),
            log_entries: Vec::new(),
            new_contract_address: String::new(),
        }
    }

    /// Converts the parameters back into a scheduler-facing message.
    /// Terminal results swap from/to so the message addresses the caller.
    pub fn into_message(self) -> ExecutionMessage {
        let (kind, from, to) = match self.kind {
            CallKind::Message => {
                (MessageKind::Message, self.sender_address, self.receive_address)
            }
            CallKind::KeyLock => (
                MessageKind::KeyLock,
                self.sender_address.clone(),
                self.sender_address,
            ),
            CallKind::Finished => {
                (MessageKind::Finished, self.receive_address, self.sender_address)
            }
            CallKind::Revert => {
                (MessageKind::Revert, self.receive_address, self.sender_address)
            }
        };

        ExecutionMessage {
            kind,
            context_id: self.context_id,
            seq: self.seq,
            transaction_hash: None,
            origin: self.origin,
            from,
            to,
            input: self.data,
            gas_available: self.gas,
            value: self.value,
            static_call: self.static_call,
            create: self.create,
            create_salt: self.create_salt,
            key_locks: self.key_locks,
            key_lock_acquired: self.acquire_key_lock,
            status: self.status.as_i32(),
            message: self.message,
            log_entries: self.log_entries,
            new_contract_address: self.new_contract_address,
        }
    }
}
