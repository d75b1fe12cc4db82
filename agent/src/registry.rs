//! Handles the translation layer has handed to guest code.

use crate::cache::home_slot;
use crate::jni::HandleKind;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity set of addresses. Slot value 0 means empty, which is why
/// null can never be a member.
struct HandleSet {
    slots: Box<[AtomicUsize]>,
    mask: usize,
}

impl HandleSet {
    fn with_capacity(capacity: usize) -> Self {
        let size = capacity.max(2).next_power_of_two();
        Self {
            slots: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            mask: size - 1,
        }
    }

    fn contains(&self, handle: usize) -> bool {
        if handle == 0 {
            return false;
        }
        let start = home_slot(handle, self.mask);
        for i in 0..self.slots.len() {
            match self.slots[(start + i) & self.mask].load(Ordering::Acquire) {
                0 => return false,
                h if h == handle => return true,
                _ => {}
            }
        }
        false
    }

    /// `true` only when this call added `handle`.
    fn insert(&self, handle: usize) -> bool {
        if handle == 0 {
            return false;
        }
        let start = home_slot(handle, self.mask);
        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];
            match slot.compare_exchange(0, handle, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(existing) if existing == handle => return false,
                Err(_) => {}
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }
}

pub struct HandleRegistry {
    sets: [HandleSet; 2],
}

impl HandleRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sets: [
                HandleSet::with_capacity(capacity),
                HandleSet::with_capacity(capacity),
            ],
        }
    }

    /// Record `handle` as a `kind` handle. Returns `true` on first sighting;
    /// repeats, null and a full registry all return `false`.
    pub fn observe(&self, kind: HandleKind, handle: usize) -> bool {
        self.sets[kind.index()].insert(handle)
    }

    pub fn is_known(&self, kind: HandleKind, address: usize) -> bool {
        self.sets[kind.index()].contains(address)
    }

    /// Which kind of handle `address` is, `JavaVm` checked first.
    pub fn classify(&self, address: usize) -> Option<HandleKind> {
        HandleKind::ALL
            .into_iter()
            .find(|&kind| self.is_known(kind, address))
    }

    pub fn len(&self, kind: HandleKind) -> usize {
        self.sets[kind.index()].len()
    }
}
