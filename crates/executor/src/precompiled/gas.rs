// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::machine::Schedule;

/// Table operations a precompiled handler is charged for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableOp {
    OpenTable,
    CreateTable,
    Select,
    Insert,
    Update,
    Remove,
}

/// Accumulates the gas charge of one precompiled invocation: a fixed price
/// per table operation, a size-proportional part for the bytes an operation
/// moves, and a charge for peak working memory. The total is settled once,
/// after the handler returns.
pub struct GasPricer<'a> {
    schedule: &'a Schedule,
    op_gas: u64,
    mem_used: usize,
}

impl<'a> GasPricer<'a> {
    pub fn new(schedule: &'a Schedule) -> Self {
        GasPricer {
            schedule,
            op_gas: 0,
            mem_used: 0,
        }
    }

    pub fn append_op(&mut self, op: TableOp) { self.append_op_sized(op, 0) }

    /// Charges `op` plus the word cost of the `bytes` it reads or writes.
    pub fn append_op_sized(&mut self, op: TableOp, bytes: usize) {
        let base = match op {
            TableOp::OpenTable => self.schedule.open_table_gas,
            TableOp::CreateTable => self.schedule.create_table_gas,
            TableOp::Select => self.schedule.select_gas,
            TableOp::Insert => self.schedule.insert_gas,
            TableOp::Update => self.schedule.update_gas,
            TableOp::Remove => self.schedule.remove_gas,
        };
        self.op_gas += base + words(bytes) * self.schedule.memory_word_gas;
    }

    /// Records peak working-memory usage; only the maximum is charged.
    pub fn update_mem_used(&mut self, bytes: usize) {
        self.mem_used = self.mem_used.max(bytes);
    }

    pub fn total_gas(&self) -> u64 {
        self.op_gas + words(self.mem_used) * self.schedule.memory_word_gas
    }
}

fn words(bytes: usize) -> u64 { ((bytes + 31) / 32) as u64 }
