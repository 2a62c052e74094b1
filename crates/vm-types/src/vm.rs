// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{call_parameters::CallParameters, status::TransactionStatus};
use kestrel_storage::Entry;
use kestrel_types::{BlockNumber, Bytes, LogEntry, U256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Storage(#[from] kestrel_storage::Error),

    #[error("bad instruction: {0}")]
    BadInstruction(String),

    #[error("{0}")]
    Msg(String),
}

impl From<String> for VmError {
    fn from(e: String) -> Self { VmError::Msg(e) }
}

/// The host interface a virtual machine executes against. Storage access is
/// scoped to the executing contract's table and goes through the owning
/// executive's recorder, so a revert undoes everything the VM wrote.
pub trait VmContext {
    fn storage_get(&mut self, key: &str) -> crate::Result<Option<Entry>>;
    fn storage_set(&mut self, key: &str, entry: Entry) -> crate::Result<()>;

    fn block_number(&self) -> BlockNumber;
    fn timestamp(&self) -> u64;
    fn is_wasm(&self) -> bool;

    /// Whether the current call chain may touch `key` right now. `false`
    /// means another chain holds the lock and the VM must trap with
    /// [`VmOutcome::KeyLock`] instead of retrying.
    fn try_acquire_key_lock(&mut self, key: &str) -> bool;

    fn log(&mut self, entry: LogEntry);
}

/// Final result of a code run.
#[derive(Clone, Debug)]
pub struct VmResult {
    pub status: TransactionStatus,
    pub output: Bytes,
    pub gas_left: u64,
    /// Keep the state changes of this frame. False on any revert path.
    pub apply_state: bool,
}

impl VmResult {
    pub fn finished(output: Bytes, gas_left: u64) -> Self {
        VmResult {
            status: TransactionStatus::Ok,
            output,
            gas_left,
            apply_state: true,
        }
    }

    pub fn reverted(
        status: TransactionStatus, message: impl Into<Bytes>, gas_left: u64,
    ) -> Self {
        VmResult {
            status,
            output: message.into(),
            gas_left,
            apply_state: false,
        }
    }
}

/// A nested call the VM wants performed before it can continue.
#[derive(Clone, Debug)]
pub struct VmCallRequest {
    pub to: String,
    pub input: Bytes,
    pub gas: u64,
    pub value: U256,
    pub create: bool,
    /// Storage keys the callee chain will need locked on behalf of this
    /// chain.
    pub key_locks: Vec<String>,
}

/// Resumes a run suspended on a nested external call, with the callee's
/// result folded in.
pub trait ResumeExternal: Send {
    fn resume(self: Box<Self>, result: VmResult) -> Box<dyn VmExec>;
}

/// Resumes a run suspended on a key-lock wait, once the lock is granted.
pub trait ResumeKeyLock: Send {
    fn resume(self: Box<Self>) -> Box<dyn VmExec>;
}

/// One step of a code run: either a terminal result or a suspension carrying
/// the continuation that picks the run back up.
pub enum VmOutcome {
    Done(VmResult),
    ExternalCall(VmCallRequest, Box<dyn ResumeExternal>),
    KeyLock(String, Box<dyn ResumeKeyLock>),
}

/// A resumable unit of contract code execution. Implementations are consumed
/// by `exec`; suspensions hand back a continuation object instead of holding
/// a thread.
pub trait VmExec: Send {
    fn exec(self: Box<Self>, context: &mut dyn VmContext)
        -> crate::Result<VmOutcome>;
}

/// Creates VM instances for contract code. The interpreter behind this is an
/// external collaborator; the core only relies on the trap-style contract of
/// [`VmExec`].
pub trait VmFactory: Send + Sync {
    fn create_vm(
        &self, params: &CallParameters, code: Bytes,
    ) -> Box<dyn VmExec>;
}

/// The executable used for calls that carry no code: plain value transfers
/// and balance probes. Completes immediately without touching storage.
pub struct NoopVm {
    pub gas: u64,
}

impl VmExec for NoopVm {
    fn exec(
        self: Box<Self>, _context: &mut dyn VmContext,
    ) -> crate::Result<VmOutcome> {
        Ok(VmOutcome::Done(VmResult::finished(Bytes::new(), self.gas)))
    }
}
