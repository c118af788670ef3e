use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::NodeHandle;

#[derive(Default)]
pub(crate) struct Scratch {
    pub(crate) visited: HashSet<NodeHandle>,
}

/// Fixed pool of per-reader scratch space. Readers are never refused: when
/// every slot is busy the caller waits on one of them.
pub(crate) struct ReadSlots {
    slots: Vec<Mutex<Scratch>>,
    next: AtomicUsize,
}

impl ReadSlots {
    pub(crate) fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            slots: (0..count).map(|_| Mutex::new(Scratch::default())).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn acquire(&self) -> ReadSlot<'_> {
        let n = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        for step in 0..n {
            let index = (start + step) % n;
            if let Some(guard) = self.slots[index].try_lock() {
                return ReadSlot { index, guard };
            }
        }
        ReadSlot {
            index: start,
            guard: self.slots[start].lock(),
        }
    }
}

/// Exclusive use of one read slot. Released on drop.
pub struct ReadSlot<'a> {
    index: usize,
    guard: MutexGuard<'a, Scratch>,
}

impl ReadSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn scratch(&mut self) -> &mut Scratch {
        &mut self.guard
    }
}
