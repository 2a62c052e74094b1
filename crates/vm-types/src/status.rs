// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

/// Terminal status of a call, carried on FINISHED/REVERT messages. The
/// numeric values are part of the scheduler protocol and must stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum TransactionStatus {
    #[default]
    Ok = 0,
    Unknown = 1,
    OutOfGas = 2,
    RevertInstruction = 3,
    PrecompiledError = 4,
    PermissionDenied = 5,
    ContractFrozen = 6,
    ContractNotFound = 7,
    InternalError = 8,
}

impl TransactionStatus {
    pub fn as_i32(self) -> i32 { self as i32 }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => TransactionStatus::Ok,
            2 => TransactionStatus::OutOfGas,
            3 => TransactionStatus::RevertInstruction,
            4 => TransactionStatus::PrecompiledError,
            5 => TransactionStatus::PermissionDenied,
            6 => TransactionStatus::ContractFrozen,
            7 => TransactionStatus::ContractNotFound,
            8 => TransactionStatus::InternalError,
            _ => TransactionStatus::Unknown,
        }
    }
}
