// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_types::Bytes;

/// Visibility status of an [`Entry`] inside its layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryStatus {
    #[default]
    Normal,
    /// A tombstone: the key is logically removed from this layer and all
    /// descendants until a descendant overwrites it.
    Deleted,
}

/// One table row. Field order follows the table schema; the executor core
/// only ever relies on field positions, never names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    fields: Vec<Bytes>,
    status: EntryStatus,
}

impl Entry {
    pub fn new(fields: Vec<Bytes>) -> Self {
        Entry {
            fields,
            status: EntryStatus::Normal,
        }
    }

    /// Convenience constructor for single-value tables.
    pub fn from_value(value: impl Into<Bytes>) -> Self {
        Entry::new(vec![value.into()])
    }

    pub fn tombstone() -> Self {
        Entry {
            fields: Vec::new(),
            status: EntryStatus::Deleted,
        }
    }

    pub fn status(&self) -> EntryStatus { self.status }

    pub fn is_deleted(&self) -> bool { self.status == EntryStatus::Deleted }

    pub fn field(&self, index: usize) -> &[u8] {
        self.fields.get(index).map_or(&[], |f| f.as_slice())
    }

    pub fn fields(&self) -> &[Bytes] { &self.fields }

    pub fn set_field(&mut self, index: usize, value: Bytes) {
        if self.fields.len() <= index {
            self.fields.resize(index + 1, Bytes::new());
        }
        self.fields[index] = value;
    }

    /// Approximate in-memory size, used for capacity accounting.
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.len()).sum()
    }

    /// Stable byte image fed into the layer content hash: each field is
    /// length-prefixed so that field boundaries cannot be confused, followed
    /// by one status byte.
    pub(crate) fn hash_image(&self) -> Bytes {
        let mut image = Vec::with_capacity(self.size() + 8 * self.fields.len());
        for field in &self.fields {
            image.extend_from_slice(&(field.len() as u64).to_be_bytes());
            image.extend_from_slice(field);
        }
        image.push(match self.status {
            EntryStatus::Normal => 0,
            EntryStatus::Deleted => 1,
        });
        image
    }
}
