// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod gas;
mod kv_store;
mod parallel_transfer;

pub use gas::{GasPricer, TableOp};
pub use kv_store::{KvStorePrecompiled, KV_STORE_TABLE};
pub use parallel_transfer::{
    ParallelTransferPrecompiled, PARALLEL_TRANSFER_TABLE,
};

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    executive::TableStorage,
    machine::params::{PROTOCOL_VERSION_V1, PROTOCOL_VERSION_V2},
};
use kestrel_storage::Hasher;
use kestrel_types::{BlockNumber, Bytes, U256};
use thiserror::Error;

/// Reserved address of the parallel transfer precompiled.
pub const PARALLEL_TRANSFER_ADDRESS: &str =
    "0000000000000000000000000000000000005100";
/// Reserved address of the key-value store precompiled.
pub const KV_STORE_ADDRESS: &str = "0000000000000000000000000000000000005101";

#[derive(Error, Debug)]
pub enum PrecompiledError {
    /// Handler-level failure; reverts the call with `PrecompiledError`
    /// status and the message as output.
    #[error("{0}")]
    Business(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error(transparent)]
    Storage(#[from] kestrel_storage::Error),
}

/// Everything a handler sees for one invocation. Storage runs through the
/// calling frame's recorder, so a later revert of the frame undoes handler
/// writes too.
pub struct PrecompiledContext<'a, 'b> {
    pub storage: &'a mut TableStorage<'b>,
    pub pricer: GasPricer<'a>,
    pub origin: &'a str,
    pub sender: &'a str,
    /// The precompiled's own reserved address.
    pub address: &'a str,
    pub input: &'a [u8],
    pub is_wasm: bool,
    pub block_number: BlockNumber,
    pub timestamp: u64,
}

/// An in-process handler reachable at a reserved address, bypassing the VM.
pub trait Precompiled: Send + Sync {
    /// Executes the call and returns the output bytes. Gas is charged
    /// through `ctx.pricer`; the executive settles the total afterwards.
    fn call(
        &self, ctx: &mut PrecompiledContext,
    ) -> std::result::Result<Bytes, PrecompiledError>;

    /// Whether the handler declares DAG-safe conflict keys. Handlers that do
    /// not are never parallelized.
    fn is_parallel(&self) -> bool { false }

    /// The conflict keys of `input`, for parallel handlers. An empty result
    /// marks the transaction serial-only.
    fn parallel_tag(&self, input: &[u8], is_wasm: bool) -> Vec<String> {
        let _ = (input, is_wasm);
        Vec::new()
    }
}

struct PrecompiledEntry {
    handler: Arc<dyn Precompiled>,
    /// First protocol version the handler resolves under.
    activate_at: u32,
    /// Privileged handlers additionally require the caller-supplied
    /// authorization predicate to pass.
    privileged: bool,
}

/// Registry mapping reserved addresses to handlers. Resolution is gated by
/// the block's protocol version and, for privileged contracts, by an
/// authorization predicate evaluated at the call site.
#[derive(Default)]
pub struct PrecompiledMap {
    map: BTreeMap<String, PrecompiledEntry>,
}

impl PrecompiledMap {
    pub fn new() -> Self { PrecompiledMap::default() }

    /// The default registry shipped with the executor.
    pub fn new_builtin(hasher: &dyn Hasher) -> Self {
        let mut map = PrecompiledMap::new();
        map.register(
            PARALLEL_TRANSFER_ADDRESS,
            Arc::new(ParallelTransferPrecompiled::new(hasher)),
            PROTOCOL_VERSION_V1,
            false,
        );
        map.register(
            KV_STORE_ADDRESS,
            Arc::new(KvStorePrecompiled::new(hasher)),
            PROTOCOL_VERSION_V2,
            false,
        );
        map
    }

    pub fn register(
        &mut self, address: &str, handler: Arc<dyn Precompiled>,
        activate_at: u32, privileged: bool,
    ) {
        self.map.insert(
            address.to_owned(),
            PrecompiledEntry {
                handler,
                activate_at,
                privileged,
            },
        );
    }

    /// Whether `address` names a precompiled at all, active or not. Used to
    /// keep reserved addresses out of the ordinary code path.
    pub fn is_reserved(&self, address: &str) -> bool {
        self.map.contains_key(address)
    }

    /// Resolves `address` under `version`; `auth` is consulted only for
    /// privileged handlers.
    pub fn resolve(
        &self, address: &str, version: u32, auth: impl FnOnce() -> bool,
    ) -> Option<&Arc<dyn Precompiled>> {
        let entry = self.map.get(address)?;
        if version < entry.activate_at {
            return None;
        }
        if entry.privileged && !auth() {
            return None;
        }
        Some(&entry.handler)
    }
}

// Argument codec shared by the shipped handlers: 4-byte selector, then
// fields; strings are u32-BE-length-prefixed, numbers are 32-byte BE words.
// Full ABI compatibility is an explicit non-goal.

pub(crate) fn selector(hasher: &dyn Hasher, signature: &str) -> [u8; 4] {
    let hash = hasher.hash(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub(crate) fn split_selector(
    input: &[u8],
) -> std::result::Result<([u8; 4], &[u8]), PrecompiledError> {
    if input.len() < 4 {
        return Err(PrecompiledError::BadParameter("input too short".into()));
    }
    Ok(([input[0], input[1], input[2], input[3]], &input[4..]))
}

pub(crate) struct ArgReader<'a> {
    data: &'a [u8],
}

impl<'a> ArgReader<'a> {
    pub fn new(data: &'a [u8]) -> Self { ArgReader { data } }

    pub fn read_string(&mut self) -> std::result::Result<String, PrecompiledError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| PrecompiledError::BadParameter("non-utf8 string".into()))
    }

    pub fn read_bytes(&mut self) -> std::result::Result<Bytes, PrecompiledError> {
        if self.data.len() < 4 {
            return Err(PrecompiledError::BadParameter(
                "truncated length prefix".into(),
            ));
        }
        let len = u32::from_be_bytes(self.data[..4].try_into().unwrap()) as usize;
        if self.data.len() < 4 + len {
            return Err(PrecompiledError::BadParameter(
                "truncated field".into(),
            ));
        }
        let out = self.data[4..4 + len].to_vec();
        self.data = &self.data[4 + len..];
        Ok(out)
    }

    pub fn read_u256(&mut self) -> std::result::Result<U256, PrecompiledError> {
        if self.data.len() < 32 {
            return Err(PrecompiledError::BadParameter(
                "truncated uint256".into(),
            ));
        }
        let value = U256::from_big_endian(&self.data[..32]);
        self.data = &self.data[32..];
        Ok(value)
    }
}

/// Builder counterpart of [`ArgReader`], used by callers and tests.
#[derive(Default)]
pub struct ArgWriter {
    data: Bytes,
}

impl ArgWriter {
    pub fn new(selector: [u8; 4]) -> Self {
        ArgWriter {
            data: selector.to_vec(),
        }
    }

    pub fn write_string(self, value: &str) -> Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_bytes(mut self, value: &[u8]) -> Self {
        self.data
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.data.extend_from_slice(value);
        self
    }

    pub fn write_u256(mut self, value: U256) -> Self {
        let mut word = [0u8; 32];
        value.to_big_endian(&mut word);
        self.data.extend_from_slice(&word);
        self
    }

    pub fn finish(self) -> Bytes { self.data }
}
