// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

#[macro_use]
extern crate log;

pub mod context;
pub mod dag;
mod error;
pub mod executive;
pub mod executor;
pub mod ledger;
pub mod machine;
pub mod precompiled;
pub mod txpool;

pub use self::{
    error::{Error, Result},
    executor::{ExecutorFactory, ExecutorSwitch, TransactionExecutor},
};

#[cfg(test)]
mod tests;
