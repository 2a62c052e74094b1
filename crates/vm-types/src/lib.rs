// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod call_parameters;
mod status;
mod vm;

pub use self::{
    call_parameters::{CallKind, CallParameters},
    status::TransactionStatus,
    vm::{
        NoopVm, ResumeExternal, ResumeKeyLock, VmCallRequest, VmContext,
        VmError, VmExec, VmFactory, VmOutcome, VmResult,
    },
};

pub type Result<T> = std::result::Result<T, VmError>;
