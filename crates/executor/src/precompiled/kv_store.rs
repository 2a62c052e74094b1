// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use super::{
    split_selector, ArgReader, Precompiled, PrecompiledContext,
    PrecompiledError, TableOp,
};
use kestrel_storage::{Entry, Hasher};
use kestrel_types::Bytes;

// interface:
//   set(string,bytes)
//   get(string) -> bytes
//   remove(string)
const SIG_SET: &str = "set(string,bytes)";
const SIG_GET: &str = "get(string)";
const SIG_REMOVE: &str = "remove(string)";

pub const KV_STORE_TABLE: &str = "/tables/kv_store";

/// A plain key-value store. Deliberately not parallel: the DAG scheduler
/// must route every call through the serial SEND_BACK path.
pub struct KvStorePrecompiled {
    sel_set: [u8; 4],
    sel_get: [u8; 4],
    sel_remove: [u8; 4],
}

impl KvStorePrecompiled {
    pub fn new(hasher: &dyn Hasher) -> Self {
        KvStorePrecompiled {
            sel_set: super::selector(hasher, SIG_SET),
            sel_get: super::selector(hasher, SIG_GET),
            sel_remove: super::selector(hasher, SIG_REMOVE),
        }
    }

    pub fn selector_of(&self, signature: &str) -> Option<[u8; 4]> {
        match signature {
            SIG_SET => Some(self.sel_set),
            SIG_GET => Some(self.sel_get),
            SIG_REMOVE => Some(self.sel_remove),
            _ => None,
        }
    }
}

impl Precompiled for KvStorePrecompiled {
    fn call(
        &self, ctx: &mut PrecompiledContext,
    ) -> Result<Bytes, PrecompiledError> {
        let (selector, data) = split_selector(ctx.input)?;
        let mut args = ArgReader::new(data);
        ctx.pricer.update_mem_used(ctx.input.len());

        ctx.pricer.append_op(TableOp::OpenTable);
        if ctx.storage.create_table(KV_STORE_TABLE, "value")? {
            ctx.pricer.append_op(TableOp::CreateTable);
        }

        if selector == self.sel_set {
            let key = args.read_string()?;
            let value = args.read_bytes()?;
            ctx.pricer.append_op_sized(TableOp::Insert, value.len());
            ctx.storage.set_row(KV_STORE_TABLE, &key, Entry::from_value(value))?;
            Ok(Bytes::new())
        } else if selector == self.sel_get {
            let key = args.read_string()?;
            ctx.pricer.append_op(TableOp::Select);
            let value = ctx
                .storage
                .get_row(KV_STORE_TABLE, &key)?
                .map(|entry| entry.field(0).to_vec())
                .unwrap_or_default();
            ctx.pricer.update_mem_used(value.len());
            Ok(value)
        } else if selector == self.sel_remove {
            let key = args.read_string()?;
            ctx.pricer.append_op(TableOp::Remove);
            ctx.storage.remove_row(KV_STORE_TABLE, &key)?;
            Ok(Bytes::new())
        } else {
            Err(PrecompiledError::BadParameter(format!(
                "unknown selector: {}",
                hex::encode(selector)
            )))
        }
    }
}
