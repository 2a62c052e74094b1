// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

#[macro_use]
extern crate log;

mod backend;
mod entry;
mod error;
mod hasher;
mod layer;
mod recorder;

pub use self::{
    backend::{MemoryBackend, ReadOnlyStore, TransactionalBackend},
    entry::{Entry, EntryStatus},
    error::{Error, Result},
    hasher::{Hasher, Keccak256Hasher},
    layer::StateLayer,
    recorder::{Change, Recorder},
};
