// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use serde_derive::Deserialize;

use kestrel_storage::Hasher;
use kestrel_types::Bytes;
use kestrel_vm_types::CallParameters;

/// How a critical key constrains scheduling within its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CriticalKind {
    /// Conflicts only with equal payloads in the same slot.
    Payload,
    /// Conflicts with every key in the slot (whole-container access).
    Whole,
    /// Conflicts with every key in the slot (container length access).
    Len,
}

/// One declared conflict key of a transaction. Keys are compared through an
/// explicit tagged encoding: a kind tag, the big-endian slot, then the
/// payload bytes. No in-memory representation is ever reinterpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CriticalKey {
    pub slot: u64,
    pub kind: CriticalKind,
    pub payload: Bytes,
}

impl CriticalKey {
    pub fn payload(slot: u64, payload: Bytes) -> Self {
        CriticalKey {
            slot,
            kind: CriticalKind::Payload,
            payload,
        }
    }

    pub fn whole(slot: u64) -> Self {
        CriticalKey {
            slot,
            kind: CriticalKind::Whole,
            payload: Bytes::new(),
        }
    }

    pub fn len(slot: u64) -> Self {
        CriticalKey {
            slot,
            kind: CriticalKind::Len,
            payload: Bytes::new(),
        }
    }

    /// Stable byte image: tag, slot big-endian, payload.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(9 + self.payload.len());
        out.push(match self.kind {
            CriticalKind::Payload => 0u8,
            CriticalKind::Whole => 1,
            CriticalKind::Len => 2,
        });
        out.extend_from_slice(&self.slot.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// The per-batch table of declared conflict keys. `None` marks a transaction
/// that is not parallel-eligible and must be sent back for serial execution.
pub struct CriticalFields {
    fields: Vec<Option<Vec<CriticalKey>>>,
}

impl CriticalFields {
    pub fn new(size: usize) -> Self {
        let mut fields = Vec::with_capacity(size);
        fields.resize_with(size, || None);
        CriticalFields { fields }
    }

    pub fn put(&mut self, index: usize, keys: Option<Vec<CriticalKey>>) {
        self.fields[index] = keys;
    }

    pub fn get(&self, index: usize) -> Option<&Vec<CriticalKey>> {
        self.fields[index].as_ref()
    }

    pub fn len(&self) -> usize { self.fields.len() }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
}

/// Declared conflict behavior of one function parameter slot, parsed from
/// the parallel section of a contract's stored ABI document.
#[derive(Clone, Debug, Deserialize)]
pub struct ConflictFieldDef {
    pub kind: ConflictKindDef,
    #[serde(default)]
    pub value: Vec<u64>,
    #[serde(default)]
    pub slot: Option<u64>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ConflictKindDef {
    All,
    Len,
    Env,
    Var,
    Const,
    None,
}

/// Environment values a conflict field may bind to.
const ENV_CALLER: u64 = 0;
const ENV_ORIGIN: u64 = 1;
const ENV_NOW: u64 = 2;
const ENV_BLOCK_NUMBER: u64 = 3;
const ENV_ADDR: u64 = 4;

/// One function's parallel descriptor inside a contract ABI document. The
/// document is a JSON array of these entries; everything else a full ABI
/// would carry is out of scope here.
#[derive(Clone, Debug, Deserialize)]
pub struct FunctionAbi {
    /// Hex of the 4-byte function selector.
    pub selector: String,
    #[serde(default)]
    pub name: String,
    /// Parameter type names, in order: "string", "bytes", "uint256",
    /// "address".
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, rename = "conflictFields")]
    pub conflict_fields: Vec<ConflictFieldDef>,
}

impl FunctionAbi {
    /// Finds the entry for `selector` inside an ABI document.
    pub fn find(abi_json: &str, selector: [u8; 4]) -> Option<FunctionAbi> {
        let entries: Vec<FunctionAbi> = serde_json::from_str(abi_json).ok()?;
        let wanted = hex::encode(selector);
        entries
            .into_iter()
            .find(|entry| entry.selector.eq_ignore_ascii_case(&wanted))
    }
}

/// Environment of one extraction: the block values env-kind fields bind to.
pub struct ExtractEnv<'a> {
    pub hasher: &'a dyn Hasher,
    pub is_wasm: bool,
    pub block_number: i64,
    pub timestamp: u64,
}

/// Derives the conflict keys of a plain contract call from its registered
/// parallel descriptor. `None` means the transaction cannot be scheduled in
/// parallel — the caller marks it SEND_BACK.
pub fn extract_conflict_fields(
    abi: &FunctionAbi, params: &CallParameters, env: &ExtractEnv,
) -> Option<Vec<CriticalKey>> {
    if abi.conflict_fields.is_empty() {
        return None;
    }

    // Slots are seeded by the receiver so equal parameter values on
    // different contracts never collide.
    let to_hash = env.hasher.hash(params.receive_address.as_bytes());
    let base_slot = u64::from_be_bytes(to_hash[..8].try_into().unwrap());

    let mut keys = Vec::with_capacity(abi.conflict_fields.len());
    for field in &abi.conflict_fields {
        let slot = base_slot.wrapping_add(field.slot.unwrap_or(0));

        let key = match field.kind {
            ConflictKindDef::All => CriticalKey::whole(slot),
            ConflictKindDef::Len => CriticalKey::len(slot),
            // A None field constrains nothing; a descriptor made only of
            // None fields therefore yields no keys and goes serial.
            ConflictKindDef::None => continue,
            ConflictKindDef::Const => CriticalKey::payload(
                slot,
                field.value.iter().map(|v| *v as u8).collect(),
            ),
            ConflictKindDef::Env => {
                let env_kind = *field.value.first()?;
                let payload = match env_kind {
                    ENV_CALLER => params.sender_address.clone().into_bytes(),
                    ENV_ORIGIN => params.origin.clone().into_bytes(),
                    ENV_NOW => env.timestamp.to_be_bytes().to_vec(),
                    ENV_BLOCK_NUMBER => {
                        env.block_number.to_be_bytes().to_vec()
                    }
                    ENV_ADDR => params.receive_address.clone().into_bytes(),
                    _ => {
                        warn!(
                            "unknown env kind in conflict field: {}",
                            env_kind
                        );
                        return None;
                    }
                };
                CriticalKey::payload(slot, payload)
            }
            ConflictKindDef::Var => {
                let index = *field.value.first()? as usize;
                let type_name = abi.inputs.get(index)?;
                let argument = if env.is_wasm {
                    wasm_argument(&abi.inputs, index, &params.data)?
                } else {
                    evm_argument(type_name, index, &params.data)?
                };
                CriticalKey::payload(slot, argument)
            }
        };
        keys.push(key);
    }
    Some(keys)
}

/// Reads argument `index` from EVM-style call data: 32-byte heads after the
/// selector, dynamic types resolved through their offset word.
fn evm_argument(type_name: &str, index: usize, data: &[u8]) -> Option<Bytes> {
    let args = data.get(4..)?;
    let head_start = index.checked_mul(32)?;
    let head = args.get(head_start..head_start + 32)?;

    if type_name == "string" || type_name == "bytes" {
        let offset = be_word_to_usize(head)?;
        let len_bytes = args.get(offset..offset + 32)?;
        let len = be_word_to_usize(len_bytes)?;
        Some(args.get(offset + 32..offset + 32 + len)?.to_vec())
    } else {
        Some(head.to_vec())
    }
}

/// Reads argument `index` from the compact WASM calldata layout: strings and
/// bytes are u32-length-prefixed, numeric words take 32 bytes.
fn wasm_argument(inputs: &[String], index: usize, data: &[u8]) -> Option<Bytes> {
    let mut cursor = data.get(4..)?;
    for (i, type_name) in inputs.iter().enumerate() {
        let (field, rest) = if type_name == "string" || type_name == "bytes" {
            let len =
                u32::from_be_bytes(cursor.get(..4)?.try_into().ok()?) as usize;
            (cursor.get(4..4 + len)?, cursor.get(4 + len..)?)
        } else {
            (cursor.get(..32)?, cursor.get(32..)?)
        };
        if i == index {
            return Some(field.to_vec());
        }
        cursor = rest;
    }
    None
}

fn be_word_to_usize(word: &[u8]) -> Option<usize> {
    if word.len() != 32 || word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    Some(u64::from_be_bytes(word[24..].try_into().unwrap()) as usize)
}
