// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_types::{BlockNumber, ContextId, Seq};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("block number mismatch: request {requested}, current {current}")]
    BlockNumberMismatch {
        requested: BlockNumber,
        current: BlockNumber,
    },

    #[error("no active block context")]
    EmptyBlockContext,

    #[error("executive slot occupied: contextID {context_id}, seq {seq}")]
    SlotOccupied { context_id: ContextId, seq: Seq },

    #[error("executive not found: contextID {context_id}, seq {seq}")]
    ExecutiveNotFound { context_id: ContextId, seq: Seq },

    #[error("call context exists: contextID {context_id}, seq {seq}")]
    CallContextExists { context_id: ContextId, seq: Seq },

    #[error("call context not found: contextID {context_id}, seq {seq}")]
    CallContextNotFound { context_id: ContextId, seq: Seq },

    #[error("resume on a non-suspended executive: contextID {context_id}, seq {seq}")]
    NotSuspended { context_id: ContextId, seq: Seq },

    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(String),

    #[error("block context of the executive is gone")]
    DanglingBlockContext,

    #[error("transaction pool error: {0}")]
    TxPool(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("executor is stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] kestrel_storage::Error),

    #[error(transparent)]
    Vm(#[from] kestrel_vm_types::VmError),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<String> for Error {
    fn from(e: String) -> Self { Error::Msg(e) }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self { Error::Msg(e.into()) }
}
