// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};

use super::key_locks::KeyLockManager;
use crate::{
    error::{Error, Result},
    executive::{Executive, ExecutiveFlow},
    machine::{Machine, Schedule},
};
use kestrel_storage::{Hasher, ReadOnlyStore, StateLayer};
use kestrel_types::{BlockHeader, BlockNumber, ContextId, Seq, H256};

/// The shared state scoping all execution for one block: the active storage
/// layer, the chain rules resolved for this block's version, and the registry
/// of live executives keyed by `(contextID, seq)`.
///
/// Exactly one block context accepts new top-level transactions at a time;
/// the facade replaces it on every `next_block_header`.
pub struct BlockContext {
    number: BlockNumber,
    hash: H256,
    timestamp: u64,
    version: u32,

    storage: Arc<StateLayer>,
    /// The previous block's sealed layer (or committed store), readable for
    /// cross-block checks but never writable from this block.
    prev_storage: Option<Arc<dyn ReadOnlyStore>>,

    schedule: Schedule,
    is_wasm: bool,
    is_auth_check: bool,

    machine: Arc<Machine>,
    hasher: Arc<dyn Hasher>,

    registry: RwLock<HashMap<(ContextId, Seq), Arc<Mutex<Executive>>>>,
    flows: RwLock<HashMap<String, Arc<ExecutiveFlow>>>,
    key_locks: KeyLockManager,
}

impl BlockContext {
    pub fn new(
        header: &BlockHeader, storage: Arc<StateLayer>,
        prev_storage: Option<Arc<dyn ReadOnlyStore>>, machine: Arc<Machine>,
        hasher: Arc<dyn Hasher>,
    ) -> Self {
        let schedule = machine.schedule(header.version);
        let params = machine.params();
        BlockContext {
            number: header.number,
            hash: header.hash,
            timestamp: header.timestamp,
            version: header.version,
            storage,
            prev_storage,
            schedule,
            is_wasm: params.is_wasm,
            is_auth_check: params.is_auth_check,
            machine,
            hasher,
            registry: RwLock::new(HashMap::new()),
            flows: RwLock::new(HashMap::new()),
            key_locks: KeyLockManager::new(),
        }
    }

    pub fn number(&self) -> BlockNumber { self.number }

    pub fn hash(&self) -> H256 { self.hash }

    pub fn timestamp(&self) -> u64 { self.timestamp }

    pub fn version(&self) -> u32 { self.version }

    pub fn storage(&self) -> &Arc<StateLayer> { &self.storage }

    pub fn prev_storage(&self) -> Option<&Arc<dyn ReadOnlyStore>> {
        self.prev_storage.as_ref()
    }

    pub fn schedule(&self) -> &Schedule { &self.schedule }

    pub fn is_wasm(&self) -> bool { self.is_wasm }

    pub fn is_auth_check(&self) -> bool { self.is_auth_check }

    pub fn machine(&self) -> &Arc<Machine> { &self.machine }

    pub fn hasher(&self) -> &Arc<dyn Hasher> { &self.hasher }

    pub fn key_locks(&self) -> &KeyLockManager { &self.key_locks }

    /// Registers a live executive. The slot must be empty: a double insert
    /// means the caller's call-tree bookkeeping has diverged from ours.
    pub fn insert_executive(
        &self, context_id: ContextId, seq: Seq,
        executive: Arc<Mutex<Executive>>,
    ) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.contains_key(&(context_id, seq)) {
            return Err(Error::SlotOccupied { context_id, seq });
        }
        registry.insert((context_id, seq), executive);
        Ok(())
    }

    pub fn get_executive(
        &self, context_id: ContextId, seq: Seq,
    ) -> Option<Arc<Mutex<Executive>>> {
        self.registry.read().get(&(context_id, seq)).cloned()
    }

    pub fn erase_executive(
        &self, context_id: ContextId, seq: Seq,
    ) -> Option<Arc<Mutex<Executive>>> {
        self.registry.write().remove(&(context_id, seq))
    }

    pub fn live_executives(&self) -> usize { self.registry.read().len() }

    /// The executive flow serving `code_address`, created on first use and
    /// cached for the rest of the block.
    pub fn executive_flow(
        self: &Arc<Self>, code_address: &str,
    ) -> Arc<ExecutiveFlow> {
        if let Some(flow) = self.flows.read().get(code_address) {
            return flow.clone();
        }
        let mut flows = self.flows.write();
        flows
            .entry(code_address.to_owned())
            .or_insert_with(|| Arc::new(ExecutiveFlow::new(Arc::downgrade(self))))
            .clone()
    }

    /// Drops every live executive and cached flow, e.g. when a batch failed
    /// wholesale and the scheduler will replay the block.
    pub fn clear(&self) {
        self.registry.write().clear();
        self.flows.write().clear();
    }

    pub fn downgrade(self: &Arc<Self>) -> Weak<BlockContext> {
        Arc::downgrade(self)
    }
}
