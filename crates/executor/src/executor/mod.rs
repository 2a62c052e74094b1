// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod switch;

pub use switch::{ExecutorFactory, ExecutorSwitch};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;

use crate::{
    context::BlockContext,
    dag::{
        extract_conflict_fields, AbiCache, CriticalFields, CriticalKey,
        ExtractEnv, FunctionAbi, TxDag, DAG_BATCH_TIMEOUT,
    },
    error::{Error, Result},
    executive::{ROW_ABI, ROW_CODE},
    ledger::Ledger,
    machine::Machine,
    txpool::TxPool,
};
use kestrel_storage::{
    Entry, Hasher, ReadOnlyStore, StateLayer, TransactionalBackend,
};
use kestrel_types::{
    contract_table_name, BlockHeader, BlockNumber, Bytes, ContextId,
    ExecutionMessage, MessageKind, Seq, TwoPcParams, H256,
};
use kestrel_vm_types::{CallParameters, TransactionStatus};

/// Capacity of the parallel-descriptor cache, matching the original's small
/// clock cache.
const ABI_CACHE_CAPACITY: usize = 1024;

/// Adapts the transactional backend to the read-only parent interface of a
/// state layer.
struct BackendReader(Arc<dyn TransactionalBackend>);

impl ReadOnlyStore for BackendReader {
    fn get(&self, table: &str, key: &str) -> kestrel_storage::Result<Option<Entry>> {
        self.0.get(table, key)
    }
}

/// Tracks requests in flight so `stop` can drain instead of aborting.
#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn enter(&self) -> InflightGuard {
        *self.count.lock() += 1;
        InflightGuard { inflight: self }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

struct InflightGuard<'a> {
    inflight: &'a Inflight,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.inflight.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inflight.drained.notify_all();
        }
    }
}

/// The execution engine facade. The external scheduler drives the block
/// lifecycle (`next_block_header` → execute… → `prepare` →
/// `commit`/`rollback`) and routes every call-chain message through here.
pub struct TransactionExecutor {
    name: String,
    ledger: Arc<dyn Ledger>,
    txpool: Arc<dyn TxPool>,
    backend: Arc<dyn TransactionalBackend>,
    backend_reader: Arc<dyn ReadOnlyStore>,
    /// Optional mergeable cache fronting the backend; committed layers merge
    /// here before being pruned.
    cache: Option<Arc<StateLayer>>,
    hasher: Arc<dyn Hasher>,
    machine: Arc<Machine>,
    abi_cache: AbiCache,

    /// Uncommitted layers, oldest first. The front is the only layer
    /// prepare/commit/rollback may address; the back is the only one
    /// `next_block_header` may stack onto.
    state_layers: RwLock<VecDeque<Arc<StateLayer>>>,
    block_context: RwLock<Option<Arc<BlockContext>>>,
    /// Static-call contexts, keyed like executives. Lives outside the block
    /// lifecycle.
    called_contexts: RwLock<HashMap<(ContextId, Seq), Arc<BlockContext>>>,

    last_committed: AtomicI64,
    scheduler_term: AtomicI64,
    running: AtomicBool,
    dag_workers: AtomicUsize,
    inflight: Inflight,
}

impl TransactionExecutor {
    pub fn new(
        name: impl Into<String>, ledger: Arc<dyn Ledger>,
        txpool: Arc<dyn TxPool>, backend: Arc<dyn TransactionalBackend>,
        machine: Arc<Machine>, hasher: Arc<dyn Hasher>, with_cache: bool,
    ) -> Arc<Self> {
        let backend_reader: Arc<dyn ReadOnlyStore> =
            Arc::new(BackendReader(backend.clone()));
        let cache = with_cache.then(|| {
            Arc::new(StateLayer::new(-1, Some(backend_reader.clone())))
        });

        Arc::new(TransactionExecutor {
            name: name.into(),
            ledger,
            txpool,
            backend,
            backend_reader,
            cache,
            hasher,
            machine,
            abi_cache: AbiCache::new(ABI_CACHE_CAPACITY),
            state_layers: RwLock::new(VecDeque::new()),
            block_context: RwLock::new(None),
            called_contexts: RwLock::new(HashMap::new()),
            last_committed: AtomicI64::new(-1),
            scheduler_term: AtomicI64::new(-1),
            running: AtomicBool::new(true),
            dag_workers: AtomicUsize::new(num_cpus::get().max(1)),
            inflight: Inflight::default(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn machine(&self) -> &Arc<Machine> { &self.machine }

    pub fn last_committed_block_number(&self) -> BlockNumber {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Overrides the DAG worker-pool size; defaults to hardware concurrency.
    pub fn set_dag_worker_count(&self, workers: usize) {
        self.dag_workers.store(workers.max(1), Ordering::Release);
    }

    /// The committed view new layers and static calls read through.
    fn committed_store(&self) -> Arc<dyn ReadOnlyStore> {
        match &self.cache {
            Some(cache) => cache.clone() as Arc<dyn ReadOnlyStore>,
            None => self.backend_reader.clone(),
        }
    }

    fn guard(&self) -> Result<InflightGuard> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        Ok(self.inflight.enter())
    }

    /// Opens block `header.number`: stacks a fresh layer on the newest
    /// uncommitted one (which becomes read-only) and installs the block
    /// context every subsequent transaction of the block executes in.
    pub fn next_block_header(
        &self, scheduler_term_id: i64, header: &BlockHeader,
    ) -> Result<()> {
        let _guard = self.guard()?;
        info!(
            "NextBlockHeader request: number={} term={}",
            header.number, scheduler_term_id
        );

        let current_term = self.scheduler_term.load(Ordering::Acquire);
        if scheduler_term_id < current_term {
            return Err(Error::Msg(format!(
                "stale scheduler term: {} < {}",
                scheduler_term_id, current_term
            )));
        }
        self.scheduler_term.store(scheduler_term_id, Ordering::Release);

        // The ledger is the source of chain configuration; a header newer
        // than the chain's known head version would execute under rules this
        // node does not have.
        let config = self
            .ledger
            .chain_config()
            .map_err(|e| Error::Ledger(e.to_string()))?;
        if header.version > config.version {
            return Err(Error::Ledger(format!(
                "unsupported block version: {} > {}",
                header.version, config.version
            )));
        }

        let mut layers = self.state_layers.write();
        let prev: Arc<dyn ReadOnlyStore> = match layers.back() {
            Some(prev) => {
                if header.number != prev.block_number() + 1 {
                    let current = prev.block_number();
                    error!(
                        "Block number mismatch! request: {} - 1, current: {}",
                        header.number, current
                    );
                    return Err(Error::BlockNumberMismatch {
                        requested: header.number,
                        current,
                    });
                }
                prev.set_read_only(true);
                prev.clone() as Arc<dyn ReadOnlyStore>
            }
            None => self.committed_store(),
        };

        let layer = Arc::new(StateLayer::new(header.number, Some(prev.clone())));
        let context = Arc::new(BlockContext::new(
            header,
            layer.clone(),
            Some(prev),
            self.machine.clone(),
            self.hasher.clone(),
        ));
        layers.push_back(layer);
        *self.block_context.write() = Some(context);

        info!("NextBlockHeader success: number={}", header.number);
        Ok(())
    }

    /// Executes or resumes one call chain of the active block.
    pub fn execute_transaction(
        &self, input: ExecutionMessage,
    ) -> Result<ExecutionMessage> {
        let _guard = self.guard()?;
        trace!(
            "ExecuteTransaction request: contextID={} seq={} type={:?} to={}",
            input.context_id,
            input.seq,
            input.kind,
            input.to
        );

        let context = self
            .block_context
            .read()
            .clone()
            .ok_or(Error::EmptyBlockContext)?;
        self.async_execute(&context, input, false)
    }

    /// Read-only call path. Static calls execute against the committed view
    /// in their own context registry, so they never interact with the block
    /// lifecycle.
    pub fn call(&self, input: ExecutionMessage) -> Result<ExecutionMessage> {
        let _guard = self.guard()?;
        let slot = (input.context_id, input.seq);

        let context = match input.kind {
            MessageKind::Message => {
                let context = self.call_context();
                let mut called = self.called_contexts.write();
                if called.contains_key(&slot) {
                    return Err(Error::CallContextExists {
                        context_id: slot.0,
                        seq: slot.1,
                    });
                }
                called.insert(slot, context.clone());
                context
            }
            MessageKind::Finished | MessageKind::Revert => self
                .called_contexts
                .read()
                .get(&slot)
                .cloned()
                .ok_or(Error::CallContextNotFound {
                    context_id: slot.0,
                    seq: slot.1,
                })?,
            other => {
                return Err(Error::UnexpectedMessageType(format!(
                    "{:?} on the call path",
                    other
                )))
            }
        };

        let result = self.async_execute(&context, input, true)?;
        if result.is_terminal() {
            let removed = self.called_contexts.write().remove(&slot);
            if removed.is_none() {
                return Err(Error::CallContextNotFound {
                    context_id: slot.0,
                    seq: slot.1,
                });
            }
        }
        Ok(result)
    }

    fn call_context(&self) -> Arc<BlockContext> {
        let number = self.last_committed_block_number();
        let layer =
            Arc::new(StateLayer::new(number, Some(self.committed_store())));
        let header = BlockHeader {
            number,
            hash: H256::zero(),
            timestamp: 0,
            version: crate::machine::params::PROTOCOL_VERSION_LATEST,
            gas_limit: 0,
        };
        Arc::new(BlockContext::new(
            &header,
            layer,
            Some(self.committed_store()),
            self.machine.clone(),
            self.hasher.clone(),
        ))
    }

    /// Resolves the transaction body if needed and feeds the message through
    /// the executive flow of its target contract.
    fn async_execute(
        &self, context: &Arc<BlockContext>, input: ExecutionMessage,
        static_call: bool,
    ) -> Result<ExecutionMessage> {
        let params = match input.kind {
            MessageKind::TxHash => {
                let hash = input.transaction_hash.ok_or_else(|| {
                    Error::TxPool("TXHASH message without a hash".into())
                })?;
                let transactions = self.txpool.fill_block(&[hash])?;
                CallParameters::from_transaction(&input, &transactions[0])
            }
            MessageKind::RevertKeyLock => {
                return self.abort_suspended(context, &input)
            }
            MessageKind::Message
            | MessageKind::Finished
            | MessageKind::Revert
            | MessageKind::KeyLock => CallParameters::from_message(
                &input,
                static_call || input.static_call,
            ),
            other => {
                return Err(Error::UnexpectedMessageType(format!(
                    "{:?}",
                    other
                )))
            }
        };

        let flow = context.executive_flow(&params.code_address);
        let result = flow.execute(params)?;
        Ok(result.into_message())
    }

    /// Tears down a suspended call chain the scheduler has given up on. The
    /// frame's writes roll back, its lock table entries (held and waiting)
    /// are dropped, and the slot resolves with a revert.
    fn abort_suspended(
        &self, context: &Arc<BlockContext>, input: &ExecutionMessage,
    ) -> Result<ExecutionMessage> {
        let (context_id, seq) = (input.context_id, input.seq);
        let executive = context.get_executive(context_id, seq).ok_or(
            Error::ExecutiveNotFound { context_id, seq },
        )?;

        let result = executive.lock().abort()?;
        context.erase_executive(context_id, seq);
        let grants = context.key_locks().release_context(context_id);
        for grant in &grants {
            debug!(
                "key lock handover after abort: key={} to contextID={}",
                grant.key, grant.context
            );
        }
        info!(
            "aborted suspended chain: contextID={} seq={}",
            context_id, seq
        );
        Ok(result.into_message())
    }

    /// Sequential batch execution against one contract's flow. Used by the
    /// external scheduler for serial per-contract scheduling, including
    /// SEND_BACK replays.
    pub fn execute_transactions(
        &self, contract_address: &str, inputs: Vec<ExecutionMessage>,
    ) -> Result<Vec<ExecutionMessage>> {
        let _guard = self.guard()?;
        let context = self
            .block_context
            .read()
            .clone()
            .ok_or(Error::EmptyBlockContext)?;

        let params = self.resolve_batch(inputs)?;
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            let flow = context.executive_flow(contract_address);
            results.push(flow.execute(p)?.into_message());
        }
        Ok(results)
    }

    /// Resolves the `TxHash` entries of a batch through one pool request,
    /// preserving input order.
    fn resolve_batch(
        &self, inputs: Vec<ExecutionMessage>,
    ) -> Result<Vec<CallParameters>> {
        let mut hashes = Vec::new();
        for input in &inputs {
            if input.kind == MessageKind::TxHash {
                hashes.push(input.transaction_hash.ok_or_else(|| {
                    Error::TxPool("TXHASH message without a hash".into())
                })?);
            }
        }
        let mut transactions =
            if hashes.is_empty() {
                Vec::new()
            } else {
                self.txpool.fill_block(&hashes)?
            }
            .into_iter();

        inputs
            .into_iter()
            .map(|input| {
                Ok(match input.kind {
                    MessageKind::TxHash => {
                        let tx = transactions.next().expect("one tx per hash");
                        CallParameters::from_transaction(&input, &tx)
                    }
                    MessageKind::Message
                    | MessageKind::Finished
                    | MessageKind::Revert
                    | MessageKind::KeyLock => {
                        let static_call = input.static_call;
                        CallParameters::from_message(&input, static_call)
                    }
                    other => {
                        return Err(Error::UnexpectedMessageType(format!(
                            "{:?}",
                            other
                        )))
                    }
                })
            })
            .collect()
    }

    /// Parallel batch execution: derives conflict keys, builds the DAG and
    /// runs independent transactions concurrently. Every input slot is
    /// resolved exactly once — executed, reverted, or tagged SEND_BACK for
    /// the serial path.
    pub fn dag_execute_transactions(
        &self, inputs: Vec<ExecutionMessage>,
    ) -> Result<Vec<ExecutionMessage>> {
        let _guard = self.guard()?;
        let context = self
            .block_context
            .read()
            .clone()
            .ok_or(Error::EmptyBlockContext)?;

        let params = self.resolve_batch(inputs)?;
        let total = params.len();

        let results: Vec<OnceLock<ExecutionMessage>> =
            (0..total).map(|_| OnceLock::new()).collect();
        let slots: Vec<Mutex<Option<CallParameters>>> =
            params.into_iter().map(|p| Mutex::new(Some(p))).collect();

        // Conflict-key derivation, one slot at a time, in parallel. Slots
        // that cannot be parallelized resolve immediately.
        let criticals_vec: Vec<Option<Vec<CriticalKey>>> = (0..total)
            .into_par_iter()
            .map(|i| {
                let mut slot = slots[i].lock();
                let params = slot.as_ref().expect("unresolved slot");
                match self.derive_conflict_keys(&context, params) {
                    ConflictDerivation::Keys(keys) => Some(keys),
                    ConflictDerivation::SendBack => {
                        let params = slot.take().expect("unresolved slot");
                        let mut message = params.into_message();
                        message.kind = MessageKind::SendBack;
                        results[i].set(message).ok();
                        None
                    }
                    ConflictDerivation::NoContract => {
                        let params = slot.take().expect("unresolved slot");
                        let mut message = params.into_message();
                        message.kind = MessageKind::Revert;
                        message.status =
                            TransactionStatus::ContractNotFound.as_i32();
                        message.message =
                            "no contract deployed at target".into();
                        results[i].set(message).ok();
                        None
                    }
                }
            })
            .collect();

        let mut criticals = CriticalFields::new(total);
        for (i, keys) in criticals_vec.into_iter().enumerate() {
            criticals.put(i, keys);
        }

        let dag = TxDag::new(&criticals);
        let workers = self.dag_workers.load(Ordering::Acquire);
        dag.run(workers, DAG_BATCH_TIMEOUT, |id| {
            let Some(params) = slots[id].lock().take() else {
                // Already resolved as SEND_BACK or revert.
                return;
            };
            let (context_id, seq) = (params.context_id, params.seq);
            let flow = context.executive_flow(&params.code_address);
            let message = match flow.execute(params) {
                Ok(result) => result.into_message(),
                Err(e) => {
                    // The slot must still resolve; a lost slot would
                    // desynchronize the scheduler.
                    error!("DAG execution error: id={} error={}", id, e);
                    let mut message = ExecutionMessage::default();
                    message.kind = MessageKind::Revert;
                    message.context_id = context_id;
                    message.seq = seq;
                    message.status = TransactionStatus::InternalError.as_i32();
                    message.message = e.to_string();
                    message
                }
            };
            results[id].set(message).ok();
        });

        let mut output = Vec::with_capacity(total);
        for (i, result) in results.into_iter().enumerate() {
            match result.into_inner() {
                Some(message) => output.push(message),
                None => {
                    return Err(Error::Msg(format!(
                        "DAG left slot {} unresolved",
                        i
                    )))
                }
            }
        }
        Ok(output)
    }

    fn derive_conflict_keys(
        &self, context: &Arc<BlockContext>, params: &CallParameters,
    ) -> ConflictDerivation {
        // Deploys always take the serial path.
        if params.create {
            return ConflictDerivation::SendBack;
        }

        let to = &params.receive_address;
        let precompiled = context.machine().precompiled();
        if precompiled.is_reserved(to) {
            let Some(handler) =
                precompiled.resolve(to, context.version(), || true)
            else {
                return ConflictDerivation::SendBack;
            };
            if !handler.is_parallel() {
                debug!("precompiled is not parallel: address={}", to);
                return ConflictDerivation::SendBack;
            }
            let tags = handler.parallel_tag(&params.data, context.is_wasm());
            if tags.is_empty() {
                return ConflictDerivation::SendBack;
            }
            let to_hash = self.hasher.hash(to.as_bytes());
            let slot = u64::from_be_bytes(to_hash[..8].try_into().unwrap());
            return ConflictDerivation::Keys(
                tags.into_iter()
                    .map(|tag| CriticalKey::payload(slot, tag.into_bytes()))
                    .collect(),
            );
        }

        let Some(selector_bytes) = params.data.get(..4) else {
            return ConflictDerivation::SendBack;
        };
        let selector: [u8; 4] = selector_bytes.try_into().unwrap();

        let abi = match self.abi_cache.get(to, selector) {
            Some(cached) => cached,
            None => {
                let loaded = self.load_function_abi(context, to, selector);
                // Unparseable documents are cached as misses as well; a
                // contract with a broken parallel section stays serial
                // without re-reading storage every batch.
                self.abi_cache.insert(to.clone(), selector, loaded.clone());
                loaded
            }
        };

        let Some(abi) = abi else {
            // Distinguish "not deployed" from "no parallel descriptor".
            let table = contract_table_name(to);
            match context.storage().get(&table, ROW_CODE) {
                Ok(Some(_)) => return ConflictDerivation::SendBack,
                Ok(None) => return ConflictDerivation::NoContract,
                Err(_) => return ConflictDerivation::SendBack,
            }
        };

        let env = ExtractEnv {
            hasher: self.hasher.as_ref(),
            is_wasm: context.is_wasm(),
            block_number: context.number(),
            timestamp: context.timestamp(),
        };
        match extract_conflict_fields(&abi, params, &env) {
            Some(keys) if !keys.is_empty() => ConflictDerivation::Keys(keys),
            _ => ConflictDerivation::SendBack,
        }
    }

    fn load_function_abi(
        &self, context: &Arc<BlockContext>, contract: &str, selector: [u8; 4],
    ) -> Option<Arc<FunctionAbi>> {
        let table = contract_table_name(contract);
        let entry = context.storage().get(&table, ROW_ABI).ok()??;
        let abi_json = String::from_utf8_lossy(entry.field(0)).into_owned();
        FunctionAbi::find(&abi_json, selector).map(Arc::new)
    }

    /// The deterministic content hash of the newest uncommitted layer.
    pub fn get_hash(&self, number: BlockNumber) -> Result<H256> {
        let _guard = self.guard()?;
        let layers = self.state_layers.read();
        let last = layers
            .back()
            .ok_or_else(|| Error::Msg("no uncommitted state".into()))?;
        if last.block_number() != number {
            return Err(Error::BlockNumberMismatch {
                requested: number,
                current: last.block_number(),
            });
        }
        let hash = last.hash(self.hasher.as_ref());
        info!("GetHash success: number={} hash={:x}", number, hash);
        Ok(hash)
    }

    /// First phase of commit: stages the oldest in-flight layer.
    pub fn prepare(&self, params: TwoPcParams) -> Result<()> {
        let _guard = self.guard()?;
        info!("Prepare request: number={}", params.number);

        let layers = self.state_layers.read();
        let first = layers
            .front()
            .ok_or_else(|| Error::Msg("Prepare error: no uncommitted state".into()))?;
        if first.block_number() != params.number {
            return Err(Error::BlockNumberMismatch {
                requested: params.number,
                current: first.block_number(),
            });
        }
        self.backend.prepare(&params, first)?;
        Ok(())
    }

    /// Second phase: makes the staged layer durable, then merges and prunes
    /// it from the chain.
    pub fn commit(&self, params: TwoPcParams) -> Result<()> {
        let _guard = self.guard()?;
        trace!("Commit request: number={}", params.number);

        {
            let layers = self.state_layers.read();
            let first = layers.front().ok_or_else(|| {
                Error::Msg("Commit error: no uncommitted state".into())
            })?;
            if first.block_number() != params.number {
                return Err(Error::BlockNumberMismatch {
                    requested: params.number,
                    current: first.block_number(),
                });
            }
        }

        self.backend.commit(&params)?;
        self.last_committed.store(params.number, Ordering::Release);
        self.remove_committed_state();
        debug!("Commit success: number={}", params.number);
        Ok(())
    }

    /// Discards a staged-but-uncommitted round in the backend. The in-memory
    /// layer chain is untouched; the scheduler decides whether to retry or
    /// reset.
    pub fn rollback(&self, params: TwoPcParams) -> Result<()> {
        let _guard = self.guard()?;
        info!("Rollback request: number={}", params.number);

        let layers = self.state_layers.read();
        let first = layers.front().ok_or_else(|| {
            Error::Msg("Rollback error: no uncommitted state".into())
        })?;
        if first.block_number() != params.number {
            return Err(Error::BlockNumberMismatch {
                requested: params.number,
                current: first.block_number(),
            });
        }
        self.backend.rollback(&params)?;
        Ok(())
    }

    /// Prunes the committed layer: merge into the cache layer if one is
    /// configured, then re-parent the new oldest layer onto the committed
    /// store. Readers atomically switch from the full old chain to the full
    /// new one at the re-parent.
    fn remove_committed_state(&self) {
        let mut layers = self.state_layers.write();
        let Some(committed) = layers.pop_front() else {
            error!("Remove committed state failed, empty states");
            return;
        };

        if let Some(cache) = &self.cache {
            match committed.merge_into(cache) {
                Ok(count) => debug!(
                    "merged committed layer: number={} records={}",
                    committed.block_number(),
                    count
                ),
                Err(e) => {
                    error!("merge committed layer failed: {}", e);
                }
            }
        }

        if let Some(next) = layers.front() {
            next.set_prev(Some(self.committed_store()));
        }
    }

    /// Drops every uncommitted layer and live context.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.state_layers.write().clear();
        *self.block_context.write() = None;
        self.called_contexts.write().clear();
        info!("reset: dropped all uncommitted state");
        Ok(())
    }

    /// Reads deployed code from the committed view.
    pub fn get_code(&self, address: &str) -> Result<Bytes> {
        let _guard = self.guard()?;
        let table = contract_table_name(address);
        let code = self
            .committed_store()
            .get(&table, ROW_CODE)?
            .map(|entry| entry.field(0).to_vec())
            .unwrap_or_default();
        if code.is_empty() {
            warn!("get_code: empty code, address={}", address);
        }
        Ok(code)
    }

    /// Reads the stored ABI document from the committed view.
    pub fn get_abi(&self, address: &str) -> Result<String> {
        let _guard = self.guard()?;
        let table = contract_table_name(address);
        Ok(self
            .committed_store()
            .get(&table, ROW_ABI)?
            .map(|entry| String::from_utf8_lossy(entry.field(0)).into_owned())
            .unwrap_or_default())
    }

    pub fn start(&self) { self.running.store(true, Ordering::Release); }

    /// Rejects new requests and blocks until in-flight ones drain.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("executor stopping: name={}", self.name);
        self.inflight.wait_drained();
        info!("executor stopped: name={}", self.name);
    }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }
}

enum ConflictDerivation {
    Keys(Vec<CriticalKey>),
    SendBack,
    NoContract,
}
