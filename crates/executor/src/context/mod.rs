// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod block_context;
mod key_locks;

pub use block_context::BlockContext;
pub use key_locks::{KeyLockManager, LockGrant};
