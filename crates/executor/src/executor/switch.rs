// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::sync::Arc;

use parking_lot::RwLock;

use super::TransactionExecutor;
use crate::error::{Error, Result};

/// Builds a fresh executor for a scheduler epoch.
pub trait ExecutorFactory: Send + Sync {
    fn build(&self, scheduler_term_id: i64) -> Result<Arc<TransactionExecutor>>;
}

/// Epoch-versioned executor host. When the external scheduler starts a new
/// term, a replacement executor is installed atomically: requests that
/// already hold the old epoch's handle finish against it, new requests
/// resolve the current handle, and the old instance drains on its own
/// in-flight counter — an event join, not a poll loop.
pub struct ExecutorSwitch {
    factory: Box<dyn ExecutorFactory>,
    current: RwLock<Option<Epoch>>,
}

struct Epoch {
    term: i64,
    executor: Arc<TransactionExecutor>,
}

impl ExecutorSwitch {
    pub fn new(factory: Box<dyn ExecutorFactory>) -> Self {
        ExecutorSwitch {
            factory,
            current: RwLock::new(None),
        }
    }

    /// The executor handle of the current epoch.
    pub fn handle(&self) -> Result<Arc<TransactionExecutor>> {
        self.current
            .read()
            .as_ref()
            .map(|epoch| epoch.executor.clone())
            .ok_or_else(|| Error::Msg("no executor epoch installed".into()))
    }

    pub fn current_term(&self) -> Option<i64> {
        self.current.read().as_ref().map(|epoch| epoch.term)
    }

    /// Resolves the executor serving `scheduler_term_id`, replacing the
    /// current epoch when the term moved forward. A stale term is a protocol
    /// error; an equal term reuses the installed instance.
    pub fn executor_for_term(
        &self, scheduler_term_id: i64,
    ) -> Result<Arc<TransactionExecutor>> {
        {
            let current = self.current.read();
            match current.as_ref() {
                Some(epoch) if epoch.term == scheduler_term_id => {
                    return Ok(epoch.executor.clone())
                }
                Some(epoch) if epoch.term > scheduler_term_id => {
                    return Err(Error::Msg(format!(
                        "stale scheduler term: {} < {}",
                        scheduler_term_id, epoch.term
                    )))
                }
                _ => {}
            }
        }

        let replacement = self.factory.build(scheduler_term_id)?;
        let old = {
            let mut current = self.current.write();
            // Someone else may have switched while the new instance was
            // built; the higher term wins.
            if let Some(epoch) = current.as_ref() {
                if epoch.term >= scheduler_term_id {
                    return Ok(epoch.executor.clone());
                }
            }
            info!(
                "executor switch: term {:?} -> {}",
                current.as_ref().map(|e| e.term),
                scheduler_term_id
            );
            current.replace(Epoch {
                term: scheduler_term_id,
                executor: replacement.clone(),
            })
        };

        // Drain the displaced epoch after the swap: new requests already
        // route to the replacement, in-flight ones finish where they are.
        if let Some(epoch) = old {
            epoch.executor.stop();
        }
        Ok(replacement)
    }

    /// Stops the current epoch, draining its in-flight work.
    pub fn stop(&self) {
        let epoch = self.current.write().take();
        if let Some(epoch) = epoch {
            epoch.executor.stop();
        }
    }
}
