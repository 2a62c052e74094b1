// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/


use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    context::BlockContext,
    error::Error,
    executive::Executive,
    executor::{ExecutorFactory, ExecutorSwitch, TransactionExecutor},
    ledger::StaticLedger,
    machine::{
        params::{PROTOCOL_VERSION_LATEST, PROTOCOL_VERSION_V1},
        ChainParams, Machine,
    },
    precompiled::{
        ArgWriter, KvStorePrecompiled, ParallelTransferPrecompiled,
        Precompiled, PrecompiledContext, PrecompiledError, PrecompiledMap,
        KV_STORE_ADDRESS, PARALLEL_TRANSFER_ADDRESS,
        PARALLEL_TRANSFER_TABLE,
    },
    txpool::MemoryTxPool,
};
use kestrel_storage::{
    Entry, Keccak256Hasher, MemoryBackend, ReadOnlyStore, StateLayer,
};
use kestrel_types::{
    contract_table_name, BlockHeader, BlockNumber, Bytes, ContextId,
    ExecutionMessage, MessageKind, Transaction, TwoPcParams, H256, U256,
};
use kestrel_vm_types::TransactionStatus;

use script_vm::ScriptVmFactory;

struct Fixture {
    executor: Arc<TransactionExecutor>,
    backend: Arc<MemoryBackend>,
    txpool: Arc<MemoryTxPool>,
}

fn machine_with(params: ChainParams) -> Arc<Machine> {
    Arc::new(Machine::new(
        params,
        Arc::new(ScriptVmFactory),
        Arc::new(PrecompiledMap::new_builtin(&Keccak256Hasher)),
    ))
}

fn fixture_with(machine: Arc<Machine>, with_cache: bool) -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    let txpool = Arc::new(MemoryTxPool::new());
    let executor = TransactionExecutor::new(
        "test-executor",
        Arc::new(StaticLedger::default()),
        txpool.clone(),
        backend.clone(),
        machine,
        Arc::new(Keccak256Hasher),
        with_cache,
    );
    Fixture {
        executor,
        backend,
        txpool,
    }
}

fn fixture() -> Fixture {
    fixture_with(machine_with(ChainParams::default()), true)
}

fn header(number: BlockNumber) -> BlockHeader {
    BlockHeader {
        number,
        hash: H256::from_low_u64_be(number as u64),
        timestamp: 1_600_000_000 + number as u64,
        version: PROTOCOL_VERSION_LATEST,
        gas_limit: 3_000_000_000,
    }
}

fn next_block(fixture: &Fixture, number: BlockNumber) {
    fixture
        .executor
        .next_block_header(0, &header(number))
        .unwrap();
}

fn message(context_id: ContextId, to: &str, input: Bytes) -> ExecutionMessage {
    ExecutionMessage {
        kind: MessageKind::Message,
        context_id,
        seq: 0,
        origin: "eoa".into(),
        from: "eoa".into(),
        to: to.into(),
        input,
        gas_available: 100_000_000,
        ..Default::default()
    }
}

fn transfer_handler() -> ParallelTransferPrecompiled {
    ParallelTransferPrecompiled::new(&Keccak256Hasher)
}

fn user_add(user: &str, amount: u64) -> Bytes {
    let handler = transfer_handler();
    ArgWriter::new(handler.selector_of("userAdd(string,uint256)").unwrap())
        .write_string(user)
        .write_u256(U256::from(amount))
        .finish()
}

fn user_transfer(from: &str, to: &str, amount: u64) -> Bytes {
    let handler = transfer_handler();
    ArgWriter::new(
        handler
            .selector_of("userTransfer(string,string,uint256)")
            .unwrap(),
    )
    .write_string(from)
    .write_string(to)
    .write_u256(U256::from(amount))
    .finish()
}

fn user_balance(user: &str) -> Bytes {
    let handler = transfer_handler();
    ArgWriter::new(handler.selector_of("userBalance(string)").unwrap())
        .write_string(user)
        .finish()
}

fn kv_set(key: &str, value: &[u8]) -> Bytes {
    let handler = KvStorePrecompiled::new(&Keccak256Hasher);
    ArgWriter::new(handler.selector_of("set(string,bytes)").unwrap())
        .write_string(key)
        .write_bytes(value)
        .finish()
}

fn seed_users(fixture: &Fixture, users: &[(&str, u64)]) {
    for (i, (user, amount)) in users.iter().enumerate() {
        let result = fixture
            .executor
            .execute_transaction(message(
                1000 + i as ContextId,
                PARALLEL_TRANSFER_ADDRESS,
                user_add(user, *amount),
            ))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished, "seeding {}", user);
    }
}

fn deploy_script(
    fixture: &Fixture, context_id: ContextId, script: &str,
) -> String {
    let mut input = message(context_id, "", script.as_bytes().to_vec());
    input.create = true;
    let result = fixture.executor.execute_transaction(input).unwrap();
    assert_eq!(result.kind, MessageKind::Finished);
    assert!(!result.new_contract_address.is_empty());
    result.new_contract_address
}

fn balance_entry(amount: u64) -> Entry {
    let mut word = [0u8; 32];
    U256::from(amount).to_big_endian(&mut word);
    Entry::from_value(word.to_vec())
}

mod block_lifecycle {
    use super::*;

    #[test]
    fn block_numbers_must_be_consecutive() {
        let fixture = fixture();
        next_block(&fixture, 3);

        let err = fixture
            .executor
            .next_block_header(0, &header(5))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BlockNumberMismatch {
                requested: 5,
                current: 3,
            }
        ));

        // The failed request left the chain unchanged.
        fixture.executor.next_block_header(0, &header(4)).unwrap();
    }

    #[test]
    fn execute_without_block_context_fails() {
        let fixture = fixture();
        let err = fixture
            .executor
            .execute_transaction(message(1, PARALLEL_TRANSFER_ADDRESS, vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::EmptyBlockContext));
    }

    #[test]
    fn get_hash_requires_matching_number() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);

        assert!(fixture.executor.get_hash(1).is_ok());
        assert!(matches!(
            fixture.executor.get_hash(2),
            Err(Error::BlockNumberMismatch { .. })
        ));
    }

    #[test]
    fn get_hash_is_stable_across_prepare_and_reflects_writes() {
        let fixture = fixture();
        next_block(&fixture, 1);
        let empty = fixture.executor.get_hash(1).unwrap();

        seed_users(&fixture, &[("alice", 100)]);
        let written = fixture.executor.get_hash(1).unwrap();
        assert_ne!(empty, written);

        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        assert_eq!(fixture.executor.get_hash(1).unwrap(), written);
    }

    #[test]
    fn commit_applies_and_prunes() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);

        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();
        assert_eq!(fixture.executor.last_committed_block_number(), 1);

        assert_eq!(
            fixture
                .backend
                .get(PARALLEL_TRANSFER_TABLE, "alice")
                .unwrap(),
            Some(balance_entry(100))
        );

        // Committed value stays visible to the next block through the cache.
        next_block(&fixture, 2);
        let result = fixture
            .executor
            .execute_transaction(message(
                1,
                PARALLEL_TRANSFER_ADDRESS,
                user_balance("alice"),
            ))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        assert_eq!(U256::from_big_endian(&result.input), U256::from(100u64));
    }

    #[test]
    fn prepare_must_address_the_oldest_layer() {
        let fixture = fixture();
        next_block(&fixture, 1);
        next_block(&fixture, 2);

        assert!(matches!(
            fixture.executor.prepare(TwoPcParams::new(2)),
            Err(Error::BlockNumberMismatch {
                requested: 2,
                current: 1,
            })
        ));
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
    }

    #[test]
    fn rollback_restores_backend_image() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);

        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.rollback(TwoPcParams::new(1)).unwrap();
        assert_eq!(fixture.backend.row_count(), 0);

        // The in-memory layer is untouched; the round can be replayed.
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();
        assert!(fixture.backend.row_count() > 0);
    }

    #[test]
    fn writes_of_next_block_stay_out_of_sealed_layer() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);
        let sealed_hash = fixture.executor.get_hash(1).unwrap();

        next_block(&fixture, 2);
        let result = fixture
            .executor
            .execute_transaction(message(
                50,
                PARALLEL_TRANSFER_ADDRESS,
                user_add("bob", 7),
            ))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished);

        // Block 1's committed content carries none of block 2's writes.
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();
        assert_eq!(
            fixture.backend.get(PARALLEL_TRANSFER_TABLE, "bob").unwrap(),
            None
        );
        assert_ne!(sealed_hash, H256::zero());
    }

    #[test]
    fn reset_drops_uncommitted_state() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);

        fixture.executor.reset().unwrap();
        assert!(matches!(
            fixture.executor.prepare(TwoPcParams::new(1)),
            Err(Error::Msg(_))
        ));
        // A fresh chain can start over at any number.
        next_block(&fixture, 1);
    }

    #[test]
    fn stopped_executor_fails_fast() {
        let fixture = fixture();
        next_block(&fixture, 1);
        fixture.executor.stop();

        assert!(matches!(
            fixture
                .executor
                .execute_transaction(message(1, PARALLEL_TRANSFER_ADDRESS, vec![])),
            Err(Error::Stopped)
        ));
        assert!(matches!(
            fixture.executor.get_hash(1),
            Err(Error::Stopped)
        ));

        fixture.executor.start();
        assert!(fixture.executor.get_hash(1).is_ok());
    }
}

mod executive_stack {
    use super::*;

    #[test]
    fn external_call_suspends_and_resumes() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let callee = "0000000000000000000000000000000000009999";
        let contract = deploy_script(
            &fixture,
            1,
            &format!("call {} 5000\necho", callee),
        );

        // The chain suspends with a request message for the callee.
        let request = fixture
            .executor
            .execute_transaction(message(7, &contract, vec![]))
            .unwrap();
        assert_eq!(request.kind, MessageKind::Message);
        assert_eq!(request.to, callee);
        assert_eq!(request.from, contract);
        assert_eq!(request.context_id, 7);
        assert_eq!(request.seq, 1);

        // Delivering the callee result resumes the suspended frame.
        let mut response = ExecutionMessage {
            kind: MessageKind::Finished,
            context_id: 7,
            seq: 0,
            input: b"callee-output".to_vec(),
            gas_available: 4_000,
            ..Default::default()
        };
        response.from = callee.into();
        response.to = contract.clone();

        let result = fixture.executor.execute_transaction(response).unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        assert_eq!(result.input, b"callee-output".to_vec());
    }

    #[test]
    fn nested_revert_resumes_on_failure_path() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let contract =
            deploy_script(&fixture, 1, "call 00aa 5000\nout after-revert");
        let request = fixture
            .executor
            .execute_transaction(message(9, &contract, vec![]))
            .unwrap();
        assert_eq!(request.kind, MessageKind::Message);

        let response = ExecutionMessage {
            kind: MessageKind::Revert,
            context_id: 9,
            seq: 0,
            status: TransactionStatus::RevertInstruction.as_i32(),
            ..Default::default()
        };
        // The caller decides what a callee revert means; this script simply
        // carries on.
        let result = fixture.executor.execute_transaction(response).unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        assert_eq!(result.input, b"after-revert".to_vec());
    }

    #[test]
    fn resume_of_unknown_executive_is_a_protocol_error() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let response = ExecutionMessage {
            kind: MessageKind::Finished,
            context_id: 999,
            seq: 7,
            ..Default::default()
        };
        assert!(matches!(
            fixture.executor.execute_transaction(response),
            Err(Error::ExecutiveNotFound {
                context_id: 999,
                seq: 7,
            })
        ));
    }

    #[test]
    fn wrong_resume_kind_is_a_protocol_error() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let contract = deploy_script(&fixture, 1, "call 00aa 5000");
        let request = fixture
            .executor
            .execute_transaction(message(11, &contract, vec![]))
            .unwrap();
        assert_eq!(request.kind, MessageKind::Message);

        // A plain MESSAGE addressed at the suspended slot is not a valid
        // call result.
        let bogus = message(11, &contract, vec![]);
        assert!(matches!(
            fixture.executor.execute_transaction(bogus),
            Err(Error::UnexpectedMessageType(_))
        ));

        // The executive is still suspended and can be finished properly.
        let response = ExecutionMessage {
            kind: MessageKind::Finished,
            context_id: 11,
            seq: 0,
            ..Default::default()
        };
        let result = fixture.executor.execute_transaction(response).unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
    }

    #[test]
    fn execution_failure_becomes_revert_with_rollback() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let contract =
            deploy_script(&fixture, 1, "set poison 1\nfail deliberate failure");
        let result = fixture
            .executor
            .execute_transaction(message(13, &contract, vec![]))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Revert);
        assert_eq!(
            result.status,
            TransactionStatus::RevertInstruction.as_i32()
        );
        assert_eq!(result.input, b"deliberate failure".to_vec());

        // The frame's write was rolled back; only the deploy rows remain
        // visible for the contract.
        let probe = fixture
            .executor
            .execute_transaction(message(14, &contract, vec![]))
            .unwrap();
        assert_eq!(probe.kind, MessageKind::Revert);
    }

    #[test]
    fn deploy_writes_code_and_abi() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let script = b"out deployed".to_vec();
        let hash = H256::from_low_u64_be(42);
        fixture.txpool.insert(Transaction {
            hash,
            sender: "deployer".into(),
            to: String::new(),
            input: script.clone(),
            abi: "[]".into(),
        });

        let mut input = ExecutionMessage::new_tx_hash(21, 0, hash, String::new());
        input.create = true;
        input.gas_available = 100_000_000;

        let result = fixture.executor.execute_transaction(input).unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        let address = result.new_contract_address.clone();
        assert!(!address.is_empty());

        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();

        assert_eq!(fixture.executor.get_code(&address).unwrap(), script);
        assert_eq!(fixture.executor.get_abi(&address).unwrap(), "[]");
        assert!(fixture.executor.get_code("missing").unwrap().is_empty());
    }

    #[test]
    fn registry_rejects_double_insert() {
        let machine = machine_with(ChainParams::default());
        let ctx = Arc::new(BlockContext::new(
            &header(1),
            Arc::new(StateLayer::new(1, None)),
            None,
            machine,
            Arc::new(Keccak256Hasher),
        ));
        let executive = Arc::new(Mutex::new(Executive::new(
            ctx.downgrade(),
            "contract".into(),
            1,
            0,
        )));
        ctx.insert_executive(1, 0, executive.clone()).unwrap();
        assert!(matches!(
            ctx.insert_executive(1, 0, executive),
            Err(Error::SlotOccupied {
                context_id: 1,
                seq: 0,
            })
        ));
        assert!(ctx.get_executive(1, 0).is_some());
        ctx.erase_executive(1, 0);
        assert!(ctx.get_executive(1, 0).is_none());
    }

    #[test]
    fn missing_pool_transaction_is_an_error() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let input = ExecutionMessage::new_tx_hash(
            22,
            0,
            H256::from_low_u64_be(777),
            PARALLEL_TRANSFER_ADDRESS.into(),
        );
        assert!(matches!(
            fixture.executor.execute_transaction(input),
            Err(Error::TxPool(_))
        ));
    }
}

mod key_locks {
    use super::*;

    fn lock_script() -> String {
        "lock k\ncall 0000000000000000000000000000000000009999 1000\nset k done\nout fin"
            .to_owned()
    }

    fn finish_response(context_id: ContextId) -> ExecutionMessage {
        ExecutionMessage {
            kind: MessageKind::Finished,
            context_id,
            seq: 0,
            gas_available: 100,
            ..Default::default()
        }
    }

    fn key_lock_grant(context_id: ContextId) -> ExecutionMessage {
        ExecutionMessage {
            kind: MessageKind::KeyLock,
            context_id,
            seq: 0,
            ..Default::default()
        }
    }

    #[test]
    fn contended_lock_waits_until_holder_completes() {
        let fixture = fixture();
        next_block(&fixture, 1);
        let contract = deploy_script(&fixture, 1, &lock_script());
        let lock_name = format!("{}:k", contract_table_name(&contract));

        // A takes the lock and suspends on its external call, still holding;
        // the outgoing request advertises the held lock.
        let a_request = fixture
            .executor
            .execute_transaction(message(100, &contract, vec![]))
            .unwrap();
        assert_eq!(a_request.kind, MessageKind::Message);
        assert!(a_request.key_locks.contains(&lock_name));

        // B hits the held lock and suspends waiting.
        let b_wait = fixture
            .executor
            .execute_transaction(message(200, &contract, vec![]))
            .unwrap();
        assert_eq!(b_wait.kind, MessageKind::KeyLock);
        assert_eq!(b_wait.key_lock_acquired, Some(lock_name.clone()));

        // A premature grant leaves B waiting; FIFO is enforced by the lock
        // table, not by message arrival order.
        let still_waiting = fixture
            .executor
            .execute_transaction(key_lock_grant(200))
            .unwrap();
        assert_eq!(still_waiting.kind, MessageKind::KeyLock);

        // A's callee returns; A completes and releases its locks.
        let a_result = fixture
            .executor
            .execute_transaction(finish_response(100))
            .unwrap();
        assert_eq!(a_result.kind, MessageKind::Finished);

        // Now the grant takes: B proceeds to its own external call and then
        // to completion.
        let b_request = fixture
            .executor
            .execute_transaction(key_lock_grant(200))
            .unwrap();
        assert_eq!(b_request.kind, MessageKind::Message);

        let b_result = fixture
            .executor
            .execute_transaction(finish_response(200))
            .unwrap();
        assert_eq!(b_result.kind, MessageKind::Finished);
        assert_eq!(b_result.input, b"fin".to_vec());
    }

    #[test]
    fn revert_key_lock_aborts_a_waiting_chain() {
        let fixture = fixture();
        next_block(&fixture, 1);
        let contract = deploy_script(&fixture, 1, &lock_script());

        let a_request = fixture
            .executor
            .execute_transaction(message(100, &contract, vec![]))
            .unwrap();
        assert_eq!(a_request.kind, MessageKind::Message);

        let b_wait = fixture
            .executor
            .execute_transaction(message(200, &contract, vec![]))
            .unwrap();
        assert_eq!(b_wait.kind, MessageKind::KeyLock);

        // The scheduler gives up on B; the slot resolves with a revert.
        let abort = ExecutionMessage {
            kind: MessageKind::RevertKeyLock,
            context_id: 200,
            seq: 0,
            ..Default::default()
        };
        let aborted = fixture.executor.execute_transaction(abort).unwrap();
        assert_eq!(aborted.kind, MessageKind::Revert);

        // A completes; the lock frees with no stale grant left for B, so a
        // fresh chain acquires it immediately.
        let a_result = fixture
            .executor
            .execute_transaction(finish_response(100))
            .unwrap();
        assert_eq!(a_result.kind, MessageKind::Finished);

        let c_request = fixture
            .executor
            .execute_transaction(message(300, &contract, vec![]))
            .unwrap();
        assert_eq!(c_request.kind, MessageKind::Message);
        let c_result = fixture
            .executor
            .execute_transaction(finish_response(300))
            .unwrap();
        assert_eq!(c_result.kind, MessageKind::Finished);
    }

    #[test]
    fn reentrant_lock_is_not_a_deadlock() {
        let fixture = fixture();
        next_block(&fixture, 1);
        // The same chain acquires the same key twice.
        let contract =
            deploy_script(&fixture, 1, "lock k\nlock k\nset k v\nout ok");
        let result = fixture
            .executor
            .execute_transaction(message(300, &contract, vec![]))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        assert_eq!(result.input, b"ok".to_vec());
    }
}

mod dag_scheduling {
    use super::*;

    /// The four-transfer scenario: alice/bob and charlie/david form two
    /// independent conflict components until the last two transfers link
    /// them transitively.
    fn run_transfer_batch(workers: usize) -> (H256, Fixture) {
        let fixture = fixture();
        fixture.executor.set_dag_worker_count(workers);
        next_block(&fixture, 1);
        seed_users(
            &fixture,
            &[
                ("alice", 1000),
                ("bob", 300),
                ("charlie", 2000),
                ("david", 500),
            ],
        );

        let batch = vec![
            message(10, PARALLEL_TRANSFER_ADDRESS, user_transfer("alice", "bob", 1000)),
            message(11, PARALLEL_TRANSFER_ADDRESS, user_transfer("charlie", "david", 2000)),
            message(12, PARALLEL_TRANSFER_ADDRESS, user_transfer("bob", "david", 200)),
            message(13, PARALLEL_TRANSFER_ADDRESS, user_transfer("david", "alice", 400)),
        ];
        let results = fixture.executor.dag_execute_transactions(batch).unwrap();
        assert_eq!(results.len(), 4);
        for result in &results {
            assert_eq!(result.kind, MessageKind::Finished);
        }

        let hash = fixture.executor.get_hash(1).unwrap();
        (hash, fixture)
    }

    #[test]
    fn transfer_batch_settles_identically_for_any_worker_count() {
        let (serial_hash, fixture) = run_transfer_batch(1);
        let (parallel_hash, _) = run_transfer_batch(8);
        assert_eq!(serial_hash, parallel_hash);

        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();
        for (user, expected) in
            [("alice", 400), ("bob", 1100), ("charlie", 0), ("david", 2300)]
        {
            assert_eq!(
                fixture
                    .backend
                    .get(PARALLEL_TRANSFER_TABLE, user)
                    .unwrap(),
                Some(balance_entry(expected)),
                "balance of {}",
                user
            );
        }
    }

    #[test]
    fn send_back_is_complete_and_order_preserving() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 1000), ("bob", 0)]);

        let mut create = message(21, "", b"out x".to_vec());
        create.create = true;

        let batch = vec![
            // Not parallel: the kv store declares no tags.
            message(20, KV_STORE_ADDRESS, kv_set("k", b"v")),
            // Deploys always go serial.
            create,
            // Queries yield no tags.
            message(22, PARALLEL_TRANSFER_ADDRESS, user_balance("alice")),
            // A well-tagged transfer executes.
            message(23, PARALLEL_TRANSFER_ADDRESS, user_transfer("alice", "bob", 10)),
        ];
        let results = fixture.executor.dag_execute_transactions(batch).unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].kind, MessageKind::SendBack);
        assert_eq!(results[0].context_id, 20);
        assert_eq!(results[1].kind, MessageKind::SendBack);
        assert_eq!(results[1].context_id, 21);
        assert_eq!(results[2].kind, MessageKind::SendBack);
        assert_eq!(results[2].context_id, 22);
        assert_eq!(results[3].kind, MessageKind::Finished);
        assert_eq!(results[3].context_id, 23);

        // The sent-back transaction replays fine on the serial path.
        let replayed = fixture
            .executor
            .execute_transactions(
                KV_STORE_ADDRESS,
                vec![message(20, KV_STORE_ADDRESS, kv_set("k", b"v"))],
            )
            .unwrap();
        assert_eq!(replayed[0].kind, MessageKind::Finished);
    }

    #[test]
    fn call_to_missing_contract_reverts_in_batch() {
        let fixture = fixture();
        next_block(&fixture, 1);

        let batch = vec![message(
            30,
            "00000000000000000000000000000000000000aa",
            vec![1, 2, 3, 4, 5],
        )];
        let results = fixture.executor.dag_execute_transactions(batch).unwrap();
        assert_eq!(results[0].kind, MessageKind::Revert);
        assert_eq!(
            results[0].status,
            TransactionStatus::ContractNotFound.as_i32()
        );
    }

    #[test]
    fn abi_descriptor_drives_contract_call_scheduling() {
        let fixture = fixture();
        next_block(&fixture, 1);

        // Deploy through the pool so the ABI document rides along.
        let script = b"set x 1\nout ok".to_vec();
        let abi = r#"[{
            "selector": "aabbccdd",
            "name": "touch",
            "inputs": ["string"],
            "conflictFields": [{"kind": "Var", "value": [0], "slot": 0}]
        }]"#;
        let hash = H256::from_low_u64_be(9);
        fixture.txpool.insert(Transaction {
            hash,
            sender: "deployer".into(),
            to: String::new(),
            input: script,
            abi: abi.into(),
        });
        let mut deploy = ExecutionMessage::new_tx_hash(40, 0, hash, String::new());
        deploy.create = true;
        deploy.gas_available = 100_000_000;
        let deployed = fixture.executor.execute_transaction(deploy).unwrap();
        let address = deployed.new_contract_address.clone();

        // EVM-style calldata: selector, head word with tail offset, tail.
        let calldata = |user: &str| {
            let mut data = vec![0xaa, 0xbb, 0xcc, 0xdd];
            let mut head = [0u8; 32];
            head[24..].copy_from_slice(&32u64.to_be_bytes());
            data.extend_from_slice(&head);
            let mut len = [0u8; 32];
            len[24..].copy_from_slice(&(user.len() as u64).to_be_bytes());
            data.extend_from_slice(&len);
            data.extend_from_slice(user.as_bytes());
            data
        };

        let batch = vec![
            message(41, &address, calldata("alice")),
            message(42, &address, calldata("alice")),
            message(43, &address, calldata("bob")),
        ];
        let results = fixture.executor.dag_execute_transactions(batch).unwrap();
        for result in &results {
            assert_eq!(result.kind, MessageKind::Finished);
        }

        // Without a descriptor for the selector, the call goes serial.
        let unknown = vec![message(44, &address, vec![0xde, 0xad, 0xbe, 0xef])];
        let results =
            fixture.executor.dag_execute_transactions(unknown).unwrap();
        assert_eq!(results[0].kind, MessageKind::SendBack);
    }

    /// A parallel-declared handler that records whether two calls sharing a
    /// conflict key ever overlap in time.
    struct ConflictProbe {
        active: Mutex<std::collections::HashMap<String, usize>>,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ConflictProbe {
        fn new() -> Self {
            ConflictProbe {
                active: Mutex::new(std::collections::HashMap::new()),
                overlaps: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn key_of(input: &[u8]) -> String {
            String::from_utf8_lossy(input.get(4..).unwrap_or(&[])).into_owned()
        }
    }

    impl Precompiled for ConflictProbe {
        fn call(
            &self, ctx: &mut PrecompiledContext,
        ) -> Result<Bytes, PrecompiledError> {
            let key = Self::key_of(ctx.input);
            {
                let mut active = self.active.lock();
                let entry = active.entry(key.clone()).or_insert(0);
                if *entry > 0 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                *entry += 1;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            *self.active.lock().get_mut(&key).unwrap() -= 1;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::new())
        }

        fn is_parallel(&self) -> bool { true }

        fn parallel_tag(&self, input: &[u8], _is_wasm: bool) -> Vec<String> {
            let key = Self::key_of(input);
            if key.is_empty() {
                Vec::new()
            } else {
                vec![key]
            }
        }
    }

    #[test]
    fn conflicting_keys_never_run_concurrently() {
        const PROBE_ADDRESS: &str = "0000000000000000000000000000000000005999";

        let probe = Arc::new(ConflictProbe::new());
        let mut map = PrecompiledMap::new();
        map.register(PROBE_ADDRESS, probe.clone(), PROTOCOL_VERSION_V1, false);
        let machine = Arc::new(Machine::new(
            ChainParams::default(),
            Arc::new(ScriptVmFactory),
            Arc::new(map),
        ));
        let fixture = fixture_with(machine, true);
        fixture.executor.set_dag_worker_count(8);
        next_block(&fixture, 1);

        let mut batch = Vec::new();
        for i in 0..16 {
            let key = if i % 2 == 0 { "x" } else { "y" };
            let mut input = vec![0u8; 4];
            input.extend_from_slice(key.as_bytes());
            batch.push(message(500 + i, PROBE_ADDRESS, input));
        }
        let results = fixture.executor.dag_execute_transactions(batch).unwrap();
        for result in &results {
            assert_eq!(result.kind, MessageKind::Finished);
        }

        assert_eq!(probe.calls.load(Ordering::SeqCst), 16);
        assert_eq!(
            probe.overlaps.load(Ordering::SeqCst),
            0,
            "transactions sharing a conflict key overlapped in time"
        );
    }
}

mod static_calls {
    use super::*;

    #[test]
    fn call_executes_against_committed_view() {
        let fixture = fixture();
        next_block(&fixture, 1);
        seed_users(&fixture, &[("alice", 100)]);
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();

        let result = fixture
            .executor
            .call(message(1, PARALLEL_TRANSFER_ADDRESS, user_balance("alice")))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
        assert_eq!(U256::from_big_endian(&result.input), U256::from(100u64));
    }

    #[test]
    fn call_result_for_unknown_context_is_an_error() {
        let fixture = fixture();
        let bogus = ExecutionMessage {
            kind: MessageKind::Finished,
            context_id: 5,
            seq: 5,
            ..Default::default()
        };
        assert!(matches!(
            fixture.executor.call(bogus),
            Err(Error::CallContextNotFound {
                context_id: 5,
                seq: 5,
            })
        ));
    }

    #[test]
    fn call_rejects_txhash_messages() {
        let fixture = fixture();
        let input = ExecutionMessage::new_tx_hash(
            1,
            0,
            H256::zero(),
            PARALLEL_TRANSFER_ADDRESS.into(),
        );
        assert!(matches!(
            fixture.executor.call(input),
            Err(Error::UnexpectedMessageType(_))
        ));
    }
}

mod precompiled_gating {
    use super::*;

    #[test]
    fn old_block_version_hides_newer_precompiled() {
        let fixture = fixture();
        let mut old = header(1);
        old.version = PROTOCOL_VERSION_V1;
        fixture.executor.next_block_header(0, &old).unwrap();

        let result = fixture
            .executor
            .execute_transaction(message(1, KV_STORE_ADDRESS, kv_set("k", b"v")))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Revert);
        assert_eq!(
            result.status,
            TransactionStatus::ContractNotFound.as_i32()
        );
    }

    #[test]
    fn current_block_version_resolves_it() {
        let fixture = fixture();
        next_block(&fixture, 1);
        let result = fixture
            .executor
            .execute_transaction(message(1, KV_STORE_ADDRESS, kv_set("k", b"v")))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
    }

    #[test]
    fn precompiled_business_error_reverts_with_status() {
        let fixture = fixture();
        next_block(&fixture, 1);
        // Draw from a user that does not exist.
        let handler = transfer_handler();
        let input = ArgWriter::new(
            handler.selector_of("userDraw(string,uint256)").unwrap(),
        )
        .write_string("ghost")
        .write_u256(U256::from(1u64))
        .finish();

        let result = fixture
            .executor
            .execute_transaction(message(1, PARALLEL_TRANSFER_ADDRESS, input))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Revert);
        assert_eq!(
            result.status,
            TransactionStatus::PrecompiledError.as_i32()
        );
        assert!(result.message.contains("ghost"));
    }
}

mod auth_check {
    use super::*;

    #[test]
    fn frozen_contract_rejects_calls() {
        let params = ChainParams {
            is_auth_check: true,
            ..Default::default()
        };
        let fixture = fixture_with(machine_with(params), false);

        next_block(&fixture, 1);
        let contract = deploy_script(&fixture, 1, "out ok");
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();

        fixture.backend.put(
            &contract_table_name(&contract),
            "frozen",
            Entry::from_value(b"1".to_vec()),
        );

        next_block(&fixture, 2);
        let result = fixture
            .executor
            .execute_transaction(message(2, &contract, vec![]))
            .unwrap();
        assert_eq!(result.kind, MessageKind::Revert);
        assert_eq!(result.status, TransactionStatus::ContractFrozen.as_i32());
    }

    #[test]
    fn acl_restricts_senders() {
        let params = ChainParams {
            is_auth_check: true,
            ..Default::default()
        };
        let fixture = fixture_with(machine_with(params), false);

        next_block(&fixture, 1);
        let contract = deploy_script(&fixture, 1, "out ok");
        fixture.executor.prepare(TwoPcParams::new(1)).unwrap();
        fixture.executor.commit(TwoPcParams::new(1)).unwrap();

        fixture.backend.put(
            &contract_table_name(&contract),
            "acl",
            Entry::from_value(b"trusted".to_vec()),
        );

        next_block(&fixture, 2);
        let denied = fixture
            .executor
            .execute_transaction(message(3, &contract, vec![]))
            .unwrap();
        assert_eq!(denied.kind, MessageKind::Revert);
        assert_eq!(
            denied.status,
            TransactionStatus::PermissionDenied.as_i32()
        );

        let mut allowed = message(4, &contract, vec![]);
        allowed.from = "trusted".into();
        let result = fixture.executor.execute_transaction(allowed).unwrap();
        assert_eq!(result.kind, MessageKind::Finished);
    }
}

mod executor_switch {
    use super::*;

    struct TestFactory {
        machine: Arc<Machine>,
        built: Mutex<Vec<Arc<TransactionExecutor>>>,
    }

    impl TestFactory {
        fn new(machine: Arc<Machine>) -> Self {
            TestFactory {
                machine,
                built: Mutex::new(Vec::new()),
            }
        }
    }

    impl ExecutorFactory for TestFactory {
        fn build(
            &self, scheduler_term_id: i64,
        ) -> crate::Result<Arc<TransactionExecutor>> {
            let executor = TransactionExecutor::new(
                format!("executor-{}", scheduler_term_id),
                Arc::new(StaticLedger::default()),
                Arc::new(MemoryTxPool::new()),
                Arc::new(MemoryBackend::new()),
                self.machine.clone(),
                Arc::new(Keccak256Hasher),
                true,
            );
            self.built.lock().push(executor.clone());
            Ok(executor)
        }
    }

    #[test]
    fn new_term_swaps_and_drains_the_old_epoch() {
        let switch = ExecutorSwitch::new(Box::new(TestFactory::new(
            machine_with(ChainParams::default()),
        )));

        let e1 = switch.executor_for_term(1).unwrap();
        assert_eq!(e1.name(), "executor-1");
        assert!(Arc::ptr_eq(&e1, &switch.executor_for_term(1).unwrap()));

        let e2 = switch.executor_for_term(2).unwrap();
        assert!(!Arc::ptr_eq(&e1, &e2));
        assert_eq!(switch.current_term(), Some(2));

        // The displaced epoch was drained and now fails fast, while the new
        // epoch serves requests.
        assert!(!e1.is_running());
        assert!(matches!(
            e1.get_hash(0),
            Err(Error::Stopped)
        ));
        e2.next_block_header(2, &header(0)).unwrap();

        // Stale terms are protocol errors.
        assert!(switch.executor_for_term(1).is_err());

        switch.stop();
        assert!(!e2.is_running());
    }

    /// A handler that blocks inside its call until the test releases it,
    /// pinning a request in flight.
    struct GatePrecompiled {
        entered: (Mutex<bool>, parking_lot::Condvar),
        release: (Mutex<bool>, parking_lot::Condvar),
    }

    impl GatePrecompiled {
        fn new() -> Self {
            GatePrecompiled {
                entered: (Mutex::new(false), parking_lot::Condvar::new()),
                release: (Mutex::new(false), parking_lot::Condvar::new()),
            }
        }

        fn wait_entered(&self) {
            let mut entered = self.entered.0.lock();
            while !*entered {
                self.entered.1.wait(&mut entered);
            }
        }

        fn open(&self) {
            *self.release.0.lock() = true;
            self.release.1.notify_all();
        }
    }

    impl Precompiled for GatePrecompiled {
        fn call(
            &self, _ctx: &mut PrecompiledContext,
        ) -> Result<Bytes, PrecompiledError> {
            *self.entered.0.lock() = true;
            self.entered.1.notify_all();

            let mut released = self.release.0.lock();
            while !*released {
                self.release.1.wait(&mut released);
            }
            Ok(Bytes::new())
        }
    }

    #[test]
    fn in_flight_requests_finish_against_their_epoch() {
        const GATE_ADDRESS: &str = "0000000000000000000000000000000000005998";

        let gate = Arc::new(GatePrecompiled::new());
        let mut map = PrecompiledMap::new();
        map.register(GATE_ADDRESS, gate.clone(), PROTOCOL_VERSION_V1, false);
        let machine = Arc::new(Machine::new(
            ChainParams::default(),
            Arc::new(ScriptVmFactory),
            Arc::new(map),
        ));

        let switch = Arc::new(ExecutorSwitch::new(Box::new(
            TestFactory::new(machine),
        )));
        let e1 = switch.executor_for_term(1).unwrap();
        e1.next_block_header(1, &header(0)).unwrap();

        // Pin a request inside the old epoch.
        let pinned = {
            let e1 = e1.clone();
            std::thread::spawn(move || {
                e1.execute_transaction(message(1, GATE_ADDRESS, vec![0; 4]))
            })
        };
        gate.wait_entered();

        // The switch drains the old epoch, so it cannot complete until the
        // pinned request does.
        let switching = {
            let switch = switch.clone();
            std::thread::spawn(move || switch.executor_for_term(2))
        };

        gate.open();
        let result = pinned.join().unwrap().unwrap();
        assert_eq!(result.kind, MessageKind::Finished);

        let e2 = switching.join().unwrap().unwrap();
        assert!(e2.is_running());
        assert!(!e1.is_running());
        assert_eq!(switch.current_term(), Some(2));
    }
}
