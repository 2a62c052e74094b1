// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod flow;
mod storage_wrapper;

pub use flow::ExecutiveFlow;
pub use storage_wrapper::{
    TableStorage, ROW_ABI, ROW_ACL, ROW_CODE, ROW_CODE_HASH, ROW_FROZEN,
    SYS_TABLES,
};

use std::sync::Weak;

use crate::{
    context::BlockContext,
    error::{Error, Result},
    precompiled::{GasPricer, PrecompiledContext, PrecompiledError},
};
use kestrel_storage::{Entry, Recorder};
use kestrel_types::{
    contract_table_name, Bytes, ContextId, LogEntry, Seq,
};
use kestrel_vm_types::{
    CallKind, CallParameters, TransactionStatus, VmContext, VmExec, VmOutcome,
    VmResult,
};

/// Life cycle of a call frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Created,
    Running,
    /// Waiting for the result of a nested external call.
    SuspendedExternalCall,
    /// Waiting for a key lock held by another call chain.
    SuspendedKeyLock,
    Finished,
    Reverted,
}

/// Per-frame data that survives a suspension.
struct Frame {
    params: CallParameters,
    recorder: Recorder,
    logs: Vec<LogEntry>,
    /// Locks this frame acquired while running; outgoing messages carry
    /// them so the rest of the chain keeps honoring them.
    held_locks: Vec<String>,
    /// The key this frame is blocked on while `SuspendedKeyLock`.
    pending_lock: Option<String>,
}

impl Frame {
    /// Every lock the chain holds as far as this frame knows: the ones the
    /// message carried in plus the ones acquired here.
    fn chain_locks(&self) -> Vec<String> {
        let mut locks = self.params.key_locks.clone();
        for key in &self.held_locks {
            if !locks.contains(key) {
                locks.push(key.clone());
            }
        }
        locks
    }
}

/// One in-progress contract invocation: owns the VM interaction, the frame's
/// storage change log, and the suspend/resume boundary for nested calls.
///
/// The executive holds a non-owning handle to its block context; the context
/// owns the executive through its registry. A dangling handle means the
/// caller kept an executive past its block and is a usage error.
pub struct Executive {
    block_context: Weak<BlockContext>,
    contract_address: String,
    context_id: ContextId,
    seq: Seq,
    status: ExecStatus,
    frame: Option<Frame>,
    resume_external: Option<Box<dyn kestrel_vm_types::ResumeExternal>>,
    resume_key_lock: Option<Box<dyn kestrel_vm_types::ResumeKeyLock>>,
    next_child_seq: Seq,
}

impl Executive {
    pub fn new(
        block_context: Weak<BlockContext>, contract_address: String,
        context_id: ContextId, seq: Seq,
    ) -> Self {
        Executive {
            block_context,
            contract_address,
            context_id,
            seq,
            status: ExecStatus::Created,
            frame: None,
            resume_external: None,
            resume_key_lock: None,
            next_child_seq: seq + 1,
        }
    }

    pub fn context_id(&self) -> ContextId { self.context_id }

    pub fn seq(&self) -> Seq { self.seq }

    pub fn status(&self) -> ExecStatus { self.status }

    pub fn contract_address(&self) -> &str { &self.contract_address }

    fn upgrade(&self) -> Result<std::sync::Arc<BlockContext>> {
        self.block_context.upgrade().ok_or(Error::DanglingBlockContext)
    }

    /// Runs the frame from its beginning. Returns either a terminal result,
    /// a nested call request, or a key-lock wait; in the latter two cases
    /// the executive stays registered and must be fed via [`Executive::resume`].
    pub fn start(&mut self, input: CallParameters) -> Result<CallParameters> {
        if self.status != ExecStatus::Created {
            return Err(Error::Msg(format!(
                "start on a used executive: contextID {}, seq {}",
                self.context_id, self.seq
            )));
        }
        let ctx = self.upgrade()?;
        self.status = ExecStatus::Running;

        trace!(
            "executive start: contextID={} seq={} to={} create={}",
            self.context_id,
            self.seq,
            input.receive_address,
            input.create
        );

        // Locks carried on the message already belong to this chain;
        // re-acquiring marks them in this block's lock table.
        for key in &input.key_locks {
            ctx.key_locks().acquire(self.context_id, key);
        }

        let mut frame = Frame {
            params: input,
            recorder: Recorder::new(),
            logs: Vec::new(),
            held_locks: Vec::new(),
            pending_lock: None,
        };

        if ctx.is_auth_check() && !frame.params.static_call {
            if let Some((status, message)) = self.check_auth(&ctx, &frame)? {
                let gas = frame.params.gas;
                return self.finish(
                    &ctx,
                    frame,
                    VmResult::reverted(status, message.clone().into_bytes(), gas),
                    message,
                );
            }
        }

        if frame.params.create {
            self.create(&ctx, frame)
        } else {
            self.call(&ctx, frame)
        }
    }

    /// Feeds a nested call result or a key-lock grant back into the
    /// suspended frame and continues execution.
    pub fn resume(&mut self, input: CallParameters) -> Result<CallParameters> {
        let ctx = self.upgrade()?;
        match self.status {
            ExecStatus::SuspendedExternalCall => {
                if !matches!(input.kind, CallKind::Finished | CallKind::Revert)
                {
                    return Err(Error::UnexpectedMessageType(format!(
                        "{:?} while waiting for a call result",
                        input.kind
                    )));
                }
                let mut frame = self.take_frame()?;
                let resumer = self.resume_external.take().ok_or_else(|| {
                    Error::Msg("suspended executive lost its resumer".into())
                })?;

                let result = VmResult {
                    status: input.status,
                    output: input.data,
                    gas_left: input.gas,
                    apply_state: input.kind == CallKind::Finished,
                };
                // Locks the callee chain picked up stay with this chain.
                for key in &input.key_locks {
                    if !frame.params.key_locks.contains(key) {
                        frame.params.key_locks.push(key.clone());
                        ctx.key_locks().acquire(self.context_id, key);
                    }
                }

                self.status = ExecStatus::Running;
                let vm = resumer.resume(result);
                self.run(&ctx, frame, vm)
            }
            ExecStatus::SuspendedKeyLock => {
                let mut frame = self.take_frame()?;
                let key = frame.pending_lock.clone().unwrap_or_default();

                // The grant may be delivered out of order; FIFO is enforced
                // by the lock table, so stay suspended until we really hold
                // the key.
                if !ctx.key_locks().acquire(self.context_id, &key) {
                    debug!(
                        "spurious key lock grant: contextID={} key={}",
                        self.context_id, key
                    );
                    self.frame = Some(frame);
                    return Ok(self.key_lock_wait_message(key));
                }

                if !frame.held_locks.contains(&key) {
                    frame.held_locks.push(key.clone());
                }
                frame.pending_lock = None;
                let resumer = self.resume_key_lock.take().ok_or_else(|| {
                    Error::Msg("suspended executive lost its resumer".into())
                })?;

                self.status = ExecStatus::Running;
                let vm = resumer.resume();
                self.run(&ctx, frame, vm)
            }
            _ => Err(Error::NotSuspended {
                context_id: self.context_id,
                seq: self.seq,
            }),
        }
    }

    /// Aborts a suspended frame without a result: rolls its writes back and
    /// produces the terminal revert. Used when the scheduler gives up on a
    /// chain that is blocked behind a failed lock holder.
    pub fn abort(&mut self) -> Result<CallParameters> {
        if !matches!(
            self.status,
            ExecStatus::SuspendedKeyLock | ExecStatus::SuspendedExternalCall
        ) {
            return Err(Error::NotSuspended {
                context_id: self.context_id,
                seq: self.seq,
            });
        }
        let ctx = self.upgrade()?;
        let frame = self.take_frame()?;
        self.resume_external = None;
        self.resume_key_lock = None;

        let gas = frame.params.gas;
        self.finish(
            &ctx,
            frame,
            VmResult::reverted(
                TransactionStatus::RevertInstruction,
                Bytes::new(),
                gas,
            ),
            "aborted while suspended".into(),
        )
    }

    fn take_frame(&mut self) -> Result<Frame> {
        self.frame.take().ok_or_else(|| {
            Error::Msg(format!(
                "suspended executive lost its frame: contextID {}, seq {}",
                self.context_id, self.seq
            ))
        })
    }

    /// Deploy path: derive the contract address, create its table, store the
    /// code, then run the initializer.
    fn create(
        &mut self, ctx: &std::sync::Arc<BlockContext>, mut frame: Frame,
    ) -> Result<CallParameters> {
        let schedule = ctx.schedule();
        if frame.params.gas < schedule.create_gas {
            let gas = frame.params.gas;
            return self.finish(
                ctx,
                frame,
                VmResult::reverted(TransactionStatus::OutOfGas, Bytes::new(), gas),
                "create out of gas".into(),
            );
        }
        frame.params.gas -= schedule.create_gas;

        let address = if !frame.params.receive_address.is_empty() {
            frame.params.receive_address.clone()
        } else if ctx.is_wasm() {
            // WASM deploys address by module name; an empty name has nowhere
            // to live.
            let gas = frame.params.gas;
            return self.finish(
                ctx,
                frame,
                VmResult::reverted(
                    TransactionStatus::RevertInstruction,
                    Bytes::new(),
                    gas,
                ),
                "empty module name".into(),
            );
        } else {
            self.new_contract_address(ctx, &frame)
        };
        self.contract_address = address.clone();
        frame.params.receive_address = address.clone();
        frame.params.code_address = address.clone();

        let code = frame.params.data.clone();
        let code_gas =
            schedule.create_data_gas.saturating_mul(code.len() as u64);
        if frame.params.gas < code_gas {
            let gas = frame.params.gas;
            return self.finish(
                ctx,
                frame,
                VmResult::reverted(TransactionStatus::OutOfGas, Bytes::new(), gas),
                "create data out of gas".into(),
            );
        }
        frame.params.gas -= code_gas;

        let table = contract_table_name(&address);
        {
            let mut storage =
                TableStorage::new(ctx.storage(), &mut frame.recorder);
            if !storage.create_table(&table, "value")? {
                let gas = frame.params.gas;
                return self.finish(
                    ctx,
                    frame,
                    VmResult::reverted(
                        TransactionStatus::RevertInstruction,
                        Bytes::new(),
                        gas,
                    ),
                    format!("contract address already used: {}", address),
                );
            }
            let code_hash = ctx.hasher().hash(&code);
            storage.set_row(&table, ROW_CODE, Entry::from_value(code.clone()))?;
            storage.set_row(
                &table,
                ROW_CODE_HASH,
                Entry::from_value(code_hash.as_bytes().to_vec()),
            )?;
            if !frame.params.abi.is_empty() {
                storage.set_row(
                    &table,
                    ROW_ABI,
                    Entry::from_value(frame.params.abi.clone().into_bytes()),
                )?;
            }
        }
        info!(
            "deploy contract: address={} codeLen={} contextID={}",
            address,
            code.len(),
            self.context_id
        );

        let vm = ctx.machine().vm_factory().create_vm(&frame.params, code);
        self.run(ctx, frame, vm)
    }

    /// Call path: precompiled dispatch for reserved addresses, otherwise the
    /// VM over the target's stored code; code-less targets degrade to a
    /// plain transfer executable.
    fn call(
        &mut self, ctx: &std::sync::Arc<BlockContext>, mut frame: Frame,
    ) -> Result<CallParameters> {
        let schedule = ctx.schedule();
        if frame.params.gas < schedule.call_gas {
            let gas = frame.params.gas;
            return self.finish(
                ctx,
                frame,
                VmResult::reverted(TransactionStatus::OutOfGas, Bytes::new(), gas),
                "call out of gas".into(),
            );
        }
        frame.params.gas -= schedule.call_gas;

        let precompiled_map = ctx.machine().precompiled().clone();
        if precompiled_map.is_reserved(&frame.params.receive_address) {
            return self.call_precompiled(ctx, frame, &precompiled_map);
        }

        let table = contract_table_name(&frame.params.code_address);
        let code = ctx
            .storage()
            .get(&table, ROW_CODE)?
            .map(|entry| entry.field(0).to_vec());

        let vm: Box<dyn VmExec> = match code {
            Some(code) => {
                ctx.machine().vm_factory().create_vm(&frame.params, code)
            }
            None => Box::new(kestrel_vm_types::NoopVm {
                gas: frame.params.gas,
            }),
        };
        self.run(ctx, frame, vm)
    }

    fn call_precompiled(
        &mut self, ctx: &std::sync::Arc<BlockContext>, mut frame: Frame,
        map: &crate::precompiled::PrecompiledMap,
    ) -> Result<CallParameters> {
        let address = frame.params.receive_address.clone();
        let version = ctx.version();
        let sender_ok = self.auth_predicate(ctx, &frame)?;

        let Some(handler) = map.resolve(&address, version, || sender_ok)
        else {
            let gas = frame.params.gas;
            return self.finish(
                ctx,
                frame,
                VmResult::reverted(
                    TransactionStatus::ContractNotFound,
                    Bytes::new(),
                    gas,
                ),
                format!("precompiled not available: {}", address),
            );
        };

        let schedule = ctx.schedule();
        let gas_before = frame.params.gas;
        let (result, charged) = {
            let mut storage =
                TableStorage::new(ctx.storage(), &mut frame.recorder);
            let mut pctx = PrecompiledContext {
                storage: &mut storage,
                pricer: GasPricer::new(schedule),
                origin: &frame.params.origin,
                sender: &frame.params.sender_address,
                address: &address,
                input: &frame.params.data,
                is_wasm: ctx.is_wasm(),
                block_number: ctx.number(),
                timestamp: ctx.timestamp(),
            };
            let result = handler.call(&mut pctx);
            let charged = pctx.pricer.total_gas();
            (result, charged)
        };

        match result {
            Ok(_) if charged > gas_before => {
                info!("revert: precompiled out of gas, address={}", address);
                self.finish(
                    ctx,
                    frame,
                    VmResult::reverted(
                        TransactionStatus::OutOfGas,
                        Bytes::new(),
                        0,
                    ),
                    "precompiled out of gas".into(),
                )
            }
            Ok(output) => {
                let gas_left = gas_before - charged;
                self.finish(
                    ctx,
                    frame,
                    VmResult::finished(output, gas_left),
                    String::new(),
                )
            }
            Err(PrecompiledError::Storage(e)) => Err(e.into()),
            Err(e) => {
                let status = TransactionStatus::PrecompiledError;
                let message = e.to_string();
                info!(
                    "revert: precompiled error, address={} error={}",
                    address, message
                );
                self.finish(
                    ctx,
                    frame,
                    VmResult::reverted(
                        status,
                        message.clone().into_bytes(),
                        gas_before.saturating_sub(charged),
                    ),
                    message,
                )
            }
        }
    }

    /// Drives one VM step and turns its outcome into the frame's next
    /// protocol message.
    fn run(
        &mut self, ctx: &std::sync::Arc<BlockContext>, mut frame: Frame,
        vm: Box<dyn VmExec>,
    ) -> Result<CallParameters> {
        let outcome = {
            let mut host = HostContext {
                context: ctx.as_ref(),
                table: contract_table_name(&self.contract_address),
                address: self.contract_address.clone(),
                context_id: self.context_id,
                recorder: &mut frame.recorder,
                logs: &mut frame.logs,
                held_locks: &mut frame.held_locks,
            };
            vm.exec(&mut host)
        };

        match outcome {
            Ok(VmOutcome::Done(result)) => {
                let message = if result.apply_state {
                    String::new()
                } else {
                    String::from_utf8_lossy(&result.output).into_owned()
                };
                self.finish(ctx, frame, result, message)
            }
            Ok(VmOutcome::ExternalCall(request, resumer)) => {
                self.resume_external = Some(resumer);
                self.status = ExecStatus::SuspendedExternalCall;

                let child_seq = self.next_child_seq;
                self.next_child_seq += 1;

                let mut key_locks = frame.chain_locks();
                for key in &request.key_locks {
                    if !key_locks.contains(key) {
                        key_locks.push(key.clone());
                    }
                }

                let out = CallParameters {
                    kind: CallKind::Message,
                    context_id: self.context_id,
                    seq: child_seq,
                    origin: frame.params.origin.clone(),
                    sender_address: self.contract_address.clone(),
                    receive_address: request.to.clone(),
                    code_address: request.to,
                    data: request.input,
                    gas: request.gas,
                    value: request.value,
                    static_call: frame.params.static_call,
                    create: request.create,
                    create_salt: None,
                    abi: String::new(),
                    key_locks,
                    acquire_key_lock: None,
                    status: TransactionStatus::Ok,
                    message: String::new(),
                    log_entries: Vec::new(),
                    new_contract_address: String::new(),
                };
                self.frame = Some(frame);
                Ok(out)
            }
            Ok(VmOutcome::KeyLock(key, resumer)) => {
                // The VM names the row; the block-wide lock key is qualified
                // by the contract table, exactly as the host interface
                // acquires it.
                let qualified = self.qualified_lock(&key);
                self.resume_key_lock = Some(resumer);
                self.status = ExecStatus::SuspendedKeyLock;
                frame.pending_lock = Some(qualified.clone());
                self.frame = Some(frame);
                Ok(self.key_lock_wait_message(qualified))
            }
            Err(e) => {
                // Execution failures never escape as crashes; they become a
                // terminal revert with a status code.
                warn!(
                    "execution error: contextID={} seq={} error={}",
                    self.context_id, self.seq, e
                );
                let message = e.to_string();
                self.finish(
                    ctx,
                    frame,
                    VmResult::reverted(
                        TransactionStatus::Unknown,
                        message.clone().into_bytes(),
                        0,
                    ),
                    message,
                )
            }
        }
    }

    fn qualified_lock(&self, key: &str) -> String {
        format!("{}:{}", contract_table_name(&self.contract_address), key)
    }

    fn key_lock_wait_message(&self, key: String) -> CallParameters {
        let frame = self.frame.as_ref().expect("suspended frame present");
        CallParameters {
            kind: CallKind::KeyLock,
            context_id: self.context_id,
            seq: self.seq,
            origin: frame.params.origin.clone(),
            sender_address: self.contract_address.clone(),
            receive_address: self.contract_address.clone(),
            code_address: self.contract_address.clone(),
            data: Bytes::new(),
            gas: frame.params.gas,
            value: Default::default(),
            static_call: frame.params.static_call,
            create: false,
            create_salt: None,
            abi: String::new(),
            key_locks: frame.chain_locks(),
            acquire_key_lock: Some(key),
            status: TransactionStatus::Ok,
            message: String::new(),
            log_entries: Vec::new(),
            new_contract_address: String::new(),
        }
    }

    /// Seals the frame: keeps or rolls back its storage changes and builds
    /// the terminal message for the caller.
    fn finish(
        &mut self, ctx: &std::sync::Arc<BlockContext>, frame: Frame,
        result: VmResult, message: String,
    ) -> Result<CallParameters> {
        let apply_state =
            result.apply_state && result.status == TransactionStatus::Ok;

        let chain_locks = frame.chain_locks();
        let Frame {
            params,
            recorder,
            logs,
            ..
        } = frame;

        if apply_state {
            self.status = ExecStatus::Finished;
        } else {
            ctx.storage().rollback(recorder)?;
            self.status = ExecStatus::Reverted;
        }
        Ok(CallParameters {
            kind: if apply_state {
                CallKind::Finished
            } else {
                CallKind::Revert
            },
            context_id: self.context_id,
            seq: self.seq,
            origin: params.origin,
            sender_address: params.sender_address,
            receive_address: params.receive_address,
            code_address: params.code_address,
            data: result.output,
            gas: result.gas_left,
            value: params.value,
            static_call: params.static_call,
            create: params.create,
            create_salt: params.create_salt,
            abi: String::new(),
            key_locks: chain_locks,
            acquire_key_lock: None,
            status: result.status,
            message,
            log_entries: if apply_state { logs } else { Vec::new() },
            new_contract_address: if apply_state && params.create {
                self.contract_address.clone()
            } else {
                String::new()
            },
        })
    }

    fn new_contract_address(
        &self, ctx: &std::sync::Arc<BlockContext>, frame: &Frame,
    ) -> String {
        let hasher = ctx.hasher();
        let hash = match frame.params.create_salt {
            Some(salt) => {
                let mut image =
                    frame.params.sender_address.clone().into_bytes();
                image.extend_from_slice(&frame.params.data);
                let mut word = [0u8; 32];
                salt.to_big_endian(&mut word);
                image.extend_from_slice(&word);
                hasher.hash(&image)
            }
            None => {
                let mut image = Vec::with_capacity(24);
                image.extend_from_slice(&ctx.number().to_be_bytes());
                image.extend_from_slice(&self.context_id.to_be_bytes());
                image.extend_from_slice(&self.seq.to_be_bytes());
                hasher.hash(&image)
            }
        };
        hex::encode(&hash.as_bytes()[12..])
    }

    /// Whether the sender passes the contract's access list, consulted for
    /// privileged precompiled resolution and, in auth-check mode, for every
    /// call.
    fn auth_predicate(
        &self, ctx: &std::sync::Arc<BlockContext>, frame: &Frame,
    ) -> Result<bool> {
        if !ctx.is_auth_check() {
            return Ok(true);
        }
        let table = contract_table_name(&frame.params.receive_address);
        let acl = ctx.storage().get(&table, ROW_ACL)?;
        Ok(match acl {
            None => true,
            Some(entry) => {
                let allowed = String::from_utf8_lossy(entry.field(0))
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .any(|s| s == frame.params.sender_address);
                allowed || entry.field(0).is_empty()
            }
        })
    }

    /// Auth-check-mode gate run before call and deploy. Returns the revert
    /// status when access is denied.
    fn check_auth(
        &self, ctx: &std::sync::Arc<BlockContext>, frame: &Frame,
    ) -> Result<Option<(TransactionStatus, String)>> {
        if frame.params.create {
            // Deploys create a fresh table; there is no ACL to consult yet.
            return Ok(None);
        }
        let table = contract_table_name(&frame.params.receive_address);

        if let Some(entry) = ctx.storage().get(&table, ROW_FROZEN)? {
            if entry.field(0) == b"1" {
                return Ok(Some((
                    TransactionStatus::ContractFrozen,
                    format!(
                        "contract is frozen: {}",
                        frame.params.receive_address
                    ),
                )));
            }
        }

        if !self.auth_predicate(ctx, frame)? {
            return Ok(Some((
                TransactionStatus::PermissionDenied,
                format!(
                    "sender is not allowed: {}",
                    frame.params.sender_address
                ),
            )));
        }
        Ok(None)
    }
}

/// The host interface one frame exposes to its VM. Storage is scoped to the
/// executing contract's table and logged into the frame recorder.
struct HostContext<'a> {
    context: &'a BlockContext,
    table: String,
    address: String,
    context_id: ContextId,
    recorder: &'a mut Recorder,
    logs: &'a mut Vec<LogEntry>,
    held_locks: &'a mut Vec<String>,
}

impl VmContext for HostContext<'_> {
    fn storage_get(
        &mut self, key: &str,
    ) -> kestrel_vm_types::Result<Option<Entry>> {
        Ok(self.context.storage().get(&self.table, key)?)
    }

    fn storage_set(
        &mut self, key: &str, entry: Entry,
    ) -> kestrel_vm_types::Result<()> {
        self.context
            .storage()
            .set_recorded(self.recorder, &self.table, key, entry)?;
        Ok(())
    }

    fn block_number(&self) -> kestrel_types::BlockNumber {
        self.context.number()
    }

    fn timestamp(&self) -> u64 { self.context.timestamp() }

    fn is_wasm(&self) -> bool { self.context.is_wasm() }

    fn try_acquire_key_lock(&mut self, key: &str) -> bool {
        let qualified = format!("{}:{}", self.table, key);
        let acquired =
            self.context.key_locks().acquire(self.context_id, &qualified);
        if acquired && !self.held_locks.contains(&qualified) {
            self.held_locks.push(qualified);
        }
        acquired
    }

    fn log(&mut self, mut entry: LogEntry) {
        if entry.address.is_empty() {
            entry.address = self.address.clone();
        }
        self.logs.push(entry);
    }
}
