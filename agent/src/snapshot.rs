//! Pristine copies of the two JNI function tables.

use crate::jni::HandleKind;
use std::sync::OnceLock;

/// One immutable table copy per handle kind, written at most once.
pub struct TableSnapshots {
    tables: [OnceLock<Box<[usize]>>; 2],
}

impl Default for TableSnapshots {
    fn default() -> Self {
        Self::new()
    }
}

impl TableSnapshots {
    pub const fn new() -> Self {
        Self {
            tables: [OnceLock::new(), OnceLock::new()],
        }
    }

    /// Copy `kind.table_len()` words from `live_table`, unless a snapshot of
    /// `kind` already exists. Returns `true` only for the call that copied.
    ///
    /// Racing first calls collapse into a single copy; the losers block until
    /// it is published and then return `false`.
    ///
    /// # Safety
    /// `live_table` must be readable for `kind.table_len()` words.
    pub unsafe fn capture(&self, kind: HandleKind, live_table: *const usize) -> bool {
        let mut copied = false;
        self.tables[kind.index()].get_or_init(|| {
            copied = true;
            core::slice::from_raw_parts(live_table, kind.table_len()).into()
        });
        copied
    }

    pub fn get(&self, kind: HandleKind) -> Option<&[usize]> {
        self.tables[kind.index()].get().map(|t| &**t)
    }

    pub fn slot(&self, kind: HandleKind, index: usize) -> Option<usize> {
        self.get(kind)?.get(index).copied()
    }

    pub fn is_captured(&self, kind: HandleKind) -> bool {
        self.tables[kind.index()].get().is_some()
    }
}
