// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_storage::{Entry, Recorder, Result, StateLayer};

/// Registry table mapping a table name to its value schema. A table exists
/// iff it has a row here.
pub const SYS_TABLES: &str = "/sys/tables";

/// Well-known rows of a contract table.
pub const ROW_CODE: &str = "code";
pub const ROW_CODE_HASH: &str = "codeHash";
pub const ROW_ABI: &str = "abi";
pub const ROW_FROZEN: &str = "frozen";
pub const ROW_ACL: &str = "acl";

/// Table access bound to one call frame: every write is logged into the
/// frame's recorder so a revert restores the layer image exactly.
pub struct TableStorage<'a> {
    layer: &'a StateLayer,
    recorder: &'a mut Recorder,
}

impl<'a> TableStorage<'a> {
    pub fn new(layer: &'a StateLayer, recorder: &'a mut Recorder) -> Self {
        TableStorage { layer, recorder }
    }

    pub fn get_row(&self, table: &str, key: &str) -> Result<Option<Entry>> {
        self.layer.get(table, key)
    }

    pub fn set_row(
        &mut self, table: &str, key: &str, entry: Entry,
    ) -> Result<()> {
        self.layer.set_recorded(self.recorder, table, key, entry)
    }

    pub fn remove_row(&mut self, table: &str, key: &str) -> Result<()> {
        self.layer
            .set_recorded(self.recorder, table, key, Entry::tombstone())
    }

    /// Whether `table` has been created.
    pub fn open_table(&self, table: &str) -> Result<bool> {
        Ok(self.layer.get(SYS_TABLES, table)?.is_some())
    }

    /// Creates `table` with the given value schema. Returns `false` when the
    /// table already exists, matching the idempotent deploy paths.
    pub fn create_table(
        &mut self, table: &str, value_schema: &str,
    ) -> Result<bool> {
        if self.open_table(table)? {
            return Ok(false);
        }
        self.layer.set_recorded(
            self.recorder,
            SYS_TABLES,
            table,
            Entry::from_value(value_schema.as_bytes().to_vec()),
        )?;
        Ok(true)
    }
}
