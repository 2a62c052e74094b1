// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use super::{
    split_selector, ArgReader, Precompiled, PrecompiledContext,
    PrecompiledError, TableOp,
};
use kestrel_storage::{Entry, Hasher};
use kestrel_types::{Bytes, U256};

// interface:
//   userAdd(string,uint256)
//   userSave(string,uint256)
//   userDraw(string,uint256)
//   userBalance(string) -> uint256
//   userTransfer(string,string,uint256)
const SIG_USER_ADD: &str = "userAdd(string,uint256)";
const SIG_USER_SAVE: &str = "userSave(string,uint256)";
const SIG_USER_DRAW: &str = "userDraw(string,uint256)";
const SIG_USER_BALANCE: &str = "userBalance(string)";
const SIG_USER_TRANSFER: &str = "userTransfer(string,string,uint256)";

/// Balance ledger keyed by user name, one row per user. Every mutating
/// method declares the touched user names as its parallel tag, so transfers
/// over disjoint users schedule concurrently on the DAG path.
pub struct ParallelTransferPrecompiled {
    sel_add: [u8; 4],
    sel_save: [u8; 4],
    sel_draw: [u8; 4],
    sel_balance: [u8; 4],
    sel_transfer: [u8; 4],
}

/// Data table of the handler.
pub const PARALLEL_TRANSFER_TABLE: &str = "/tables/parallel_transfer";

const FIELD_BALANCE: usize = 0;

impl ParallelTransferPrecompiled {
    pub fn new(hasher: &dyn Hasher) -> Self {
        ParallelTransferPrecompiled {
            sel_add: super::selector(hasher, SIG_USER_ADD),
            sel_save: super::selector(hasher, SIG_USER_SAVE),
            sel_draw: super::selector(hasher, SIG_USER_DRAW),
            sel_balance: super::selector(hasher, SIG_USER_BALANCE),
            sel_transfer: super::selector(hasher, SIG_USER_TRANSFER),
        }
    }

    pub fn selector_of(&self, signature: &str) -> Option<[u8; 4]> {
        match signature {
            SIG_USER_ADD => Some(self.sel_add),
            SIG_USER_SAVE => Some(self.sel_save),
            SIG_USER_DRAW => Some(self.sel_draw),
            SIG_USER_BALANCE => Some(self.sel_balance),
            SIG_USER_TRANSFER => Some(self.sel_transfer),
            _ => None,
        }
    }

    fn balance_of(
        ctx: &mut PrecompiledContext, user: &str,
    ) -> Result<U256, PrecompiledError> {
        ctx.pricer.append_op(TableOp::Select);
        match ctx.storage.get_row(PARALLEL_TRANSFER_TABLE, user)? {
            Some(entry) => {
                Ok(U256::from_big_endian(entry.field(FIELD_BALANCE)))
            }
            None => Err(PrecompiledError::Business(format!(
                "user does not exist: {}",
                user
            ))),
        }
    }

    fn store_balance(
        ctx: &mut PrecompiledContext, user: &str, balance: U256, fresh: bool,
    ) -> Result<(), PrecompiledError> {
        let mut word = [0u8; 32];
        balance.to_big_endian(&mut word);
        ctx.pricer.append_op_sized(
            if fresh { TableOp::Insert } else { TableOp::Update },
            word.len(),
        );
        ctx.storage.set_row(
            PARALLEL_TRANSFER_TABLE,
            user,
            Entry::from_value(word.to_vec()),
        )?;
        Ok(())
    }

    fn ensure_table(
        ctx: &mut PrecompiledContext,
    ) -> Result<(), PrecompiledError> {
        ctx.pricer.append_op(TableOp::OpenTable);
        if ctx.storage.create_table(PARALLEL_TRANSFER_TABLE, "balance")? {
            ctx.pricer.append_op(TableOp::CreateTable);
        }
        Ok(())
    }

    fn user_add(
        ctx: &mut PrecompiledContext, user: String, amount: U256,
    ) -> Result<Bytes, PrecompiledError> {
        Self::ensure_table(ctx)?;
        ctx.pricer.append_op(TableOp::Select);
        if ctx.storage.get_row(PARALLEL_TRANSFER_TABLE, &user)?.is_some() {
            return Err(PrecompiledError::Business(format!(
                "user already exists: {}",
                user
            )));
        }
        Self::store_balance(ctx, &user, amount, true)?;
        Ok(Bytes::new())
    }

    fn user_save(
        ctx: &mut PrecompiledContext, user: String, amount: U256,
    ) -> Result<Bytes, PrecompiledError> {
        Self::ensure_table(ctx)?;
        let balance = Self::balance_of(ctx, &user)?;
        let updated = balance.checked_add(amount).ok_or_else(|| {
            PrecompiledError::Business("balance overflow".into())
        })?;
        Self::store_balance(ctx, &user, updated, false)?;
        Ok(Bytes::new())
    }

    fn user_draw(
        ctx: &mut PrecompiledContext, user: String, amount: U256,
    ) -> Result<Bytes, PrecompiledError> {
        let balance = Self::balance_of(ctx, &user)?;
        let updated = balance.checked_sub(amount).ok_or_else(|| {
            PrecompiledError::Business(format!(
                "insufficient balance: {}",
                user
            ))
        })?;
        Self::store_balance(ctx, &user, updated, false)?;
        Ok(Bytes::new())
    }

    fn user_balance(
        ctx: &mut PrecompiledContext, user: String,
    ) -> Result<Bytes, PrecompiledError> {
        let balance = Self::balance_of(ctx, &user)?;
        let mut word = [0u8; 32];
        balance.to_big_endian(&mut word);
        ctx.pricer.update_mem_used(word.len());
        Ok(word.to_vec())
    }

    fn user_transfer(
        ctx: &mut PrecompiledContext, from: String, to: String, amount: U256,
    ) -> Result<Bytes, PrecompiledError> {
        let from_balance = Self::balance_of(ctx, &from)?;
        let to_balance = Self::balance_of(ctx, &to)?;

        let from_updated = from_balance.checked_sub(amount).ok_or_else(|| {
            PrecompiledError::Business(format!(
                "insufficient balance: {}",
                from
            ))
        })?;
        let to_updated = to_balance.checked_add(amount).ok_or_else(|| {
            PrecompiledError::Business("balance overflow".into())
        })?;

        Self::store_balance(ctx, &from, from_updated, false)?;
        Self::store_balance(ctx, &to, to_updated, false)?;
        Ok(Bytes::new())
    }
}

impl Precompiled for ParallelTransferPrecompiled {
    fn call(
        &self, ctx: &mut PrecompiledContext,
    ) -> Result<Bytes, PrecompiledError> {
        let (selector, data) = split_selector(ctx.input)?;
        let mut args = ArgReader::new(data);
        ctx.pricer.update_mem_used(ctx.input.len());

        if selector == self.sel_add {
            let user = args.read_string()?;
            let amount = args.read_u256()?;
            Self::user_add(ctx, user, amount)
        } else if selector == self.sel_save {
            let user = args.read_string()?;
            let amount = args.read_u256()?;
            Self::user_save(ctx, user, amount)
        } else if selector == self.sel_draw {
            let user = args.read_string()?;
            let amount = args.read_u256()?;
            Self::user_draw(ctx, user, amount)
        } else if selector == self.sel_balance {
            let user = args.read_string()?;
            Self::user_balance(ctx, user)
        } else if selector == self.sel_transfer {
            let from = args.read_string()?;
            let to = args.read_string()?;
            let amount = args.read_u256()?;
            Self::user_transfer(ctx, from, to, amount)
        } else {
            Err(PrecompiledError::BadParameter(format!(
                "unknown selector: {}",
                hex::encode(selector)
            )))
        }
    }

    fn is_parallel(&self) -> bool { true }

    /// The touched user names. Invalid input yields no tags, which sends the
    /// transaction down the serial path where the failure reproduces
    /// deterministically.
    fn parallel_tag(&self, input: &[u8], _is_wasm: bool) -> Vec<String> {
        let Ok((selector, data)) = split_selector(input) else {
            return Vec::new();
        };
        let mut args = ArgReader::new(data);

        if selector == self.sel_add
            || selector == self.sel_save
            || selector == self.sel_draw
        {
            match args.read_string() {
                Ok(user) if !user.is_empty() => vec![user],
                _ => Vec::new(),
            }
        } else if selector == self.sel_transfer {
            match (args.read_string(), args.read_string()) {
                (Ok(from), Ok(to)) if !from.is_empty() && !to.is_empty() => {
                    vec![from, to]
                }
                _ => Vec::new(),
            }
        } else {
            // Queries and unknown selectors stay serial.
            Vec::new()
        }
    }
}
