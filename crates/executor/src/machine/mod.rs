// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

pub mod params;
mod schedule;

pub use params::ChainParams;
pub use schedule::Schedule;

use crate::precompiled::PrecompiledMap;
use kestrel_storage::Hasher;
use kestrel_types::Bytes;
use kestrel_vm_types::{CallParameters, NoopVm, VmExec, VmFactory};
use std::sync::Arc;

/// The chain rule set shared by every block an executor instance processes:
/// fixed parameters, the VM factory, and the precompiled registry. Per-block
/// state lives in `BlockContext`, never here.
pub struct Machine {
    params: ChainParams,
    vm_factory: Arc<dyn VmFactory>,
    precompiled: Arc<PrecompiledMap>,
}

impl Machine {
    pub fn new(
        params: ChainParams, vm_factory: Arc<dyn VmFactory>,
        precompiled: Arc<PrecompiledMap>,
    ) -> Machine {
        Machine {
            params,
            vm_factory,
            precompiled,
        }
    }

    /// A machine with the default precompiled set and the transfer-only VM;
    /// real deployments install an interpreter factory instead.
    pub fn new_with_builtin(
        params: ChainParams, hasher: &dyn Hasher,
    ) -> Machine {
        let precompiled = Arc::new(PrecompiledMap::new_builtin(hasher));
        Machine::new(params, Arc::new(NativeVmFactory), precompiled)
    }

    pub fn params(&self) -> &ChainParams { &self.params }

    /// The fee table for a block sealed under `version`.
    pub fn schedule(&self, version: u32) -> Schedule { Schedule::new(version) }

    pub fn vm_factory(&self) -> &Arc<dyn VmFactory> { &self.vm_factory }

    pub fn precompiled(&self) -> &Arc<PrecompiledMap> { &self.precompiled }
}

/// Factory of the built-in executable: everything is a code-less transfer.
/// Stands in for the EVM/WASM interpreter collaborators in tests and tooling.
pub struct NativeVmFactory;

impl VmFactory for NativeVmFactory {
    fn create_vm(
        &self, params: &CallParameters, _code: Bytes,
    ) -> Box<dyn VmExec> {
        Box::new(NoopVm { gas: params.gas })
    }
}
