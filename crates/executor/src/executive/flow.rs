// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Executive;
use crate::{
    context::BlockContext,
    error::{Error, Result},
};
use kestrel_vm_types::{CallKind, CallParameters};

/// Multiplexes the executives of one code address: a `Message` for a fresh
/// `(contextID, seq)` slot enters a new call frame, results and lock grants
/// resume the suspended one, and terminal outcomes retire the slot.
///
/// The flow holds a non-owning handle to its block context; contexts own
/// their flows and executives.
pub struct ExecutiveFlow {
    block_context: Weak<BlockContext>,
}

impl ExecutiveFlow {
    pub fn new(block_context: Weak<BlockContext>) -> Self {
        ExecutiveFlow { block_context }
    }

    fn upgrade(&self) -> Result<Arc<BlockContext>> {
        self.block_context.upgrade().ok_or(Error::DanglingBlockContext)
    }

    /// Feeds one message through the call-stack machinery and returns the
    /// next protocol message of that call chain: a nested call request, a
    /// key-lock wait, or the terminal result.
    pub fn execute(&self, input: CallParameters) -> Result<CallParameters> {
        let ctx = self.upgrade()?;
        let context_id = input.context_id;
        let seq = input.seq;

        let (result, created) = match input.kind {
            CallKind::Message => {
                match ctx.get_executive(context_id, seq) {
                    // A message addressed to a live slot resumes it; the
                    // scheduler uses this for call-result delivery on
                    // executors that route everything as MESSAGE.
                    Some(executive) => {
                        let result = executive.lock().resume(input);
                        (result, false)
                    }
                    None => {
                        let executive = Arc::new(Mutex::new(Executive::new(
                            ctx.downgrade(),
                            input.code_address.clone(),
                            context_id,
                            seq,
                        )));
                        ctx.insert_executive(
                            context_id,
                            seq,
                            executive.clone(),
                        )?;
                        let result = executive.lock().start(input);
                        (result, true)
                    }
                }
            }
            CallKind::Finished | CallKind::Revert | CallKind::KeyLock => {
                let executive = ctx
                    .get_executive(context_id, seq)
                    .ok_or(Error::ExecutiveNotFound { context_id, seq })?;
                let result = executive.lock().resume(input);
                (result, false)
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                // A failed slot must not linger: the caller may legitimately
                // retry the same (contextID, seq) after fixing its request.
                if created {
                    ctx.erase_executive(context_id, seq);
                }
                return Err(e);
            }
        };

        if matches!(result.kind, CallKind::Finished | CallKind::Revert) {
            ctx.erase_executive(context_id, seq);

            // The context boundary: when the top-level frame retires, the
            // chain's key locks free up and FIFO waiters become holders.
            if seq == 0 {
                let grants = ctx.key_locks().release_context(context_id);
                for grant in &grants {
                    debug!(
                        "key lock handover: key={} to contextID={}",
                        grant.key, grant.context
                    );
                }
            }
        }

        Ok(result)
    }
}
