use super::VectorSet;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LeaseState {
    readers: usize,
    draining: bool,
}

/// Reader/writer drain barrier. Readers are background operations working
/// on a set; the single writer is the destruction of that set, which waits
/// for every reader to leave and refuses new ones meanwhile.
#[derive(Debug, Default)]
pub struct LifetimeLock {
    state: Mutex<LeaseState>,
    released: Condvar,
}

impl LifetimeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.draining {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    /// Never returns while a shared holder remains. Must not be called by a
    /// thread that itself holds a shared lease.
    pub fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        state.draining = true;
        while state.readers > 0 {
            self.released.wait(&mut state);
        }
    }

    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }
}

/// Shared hold on a set's lifetime lock, released on drop. Background
/// workers carry one for as long as they touch the set.
pub struct BackgroundLease {
    set: Arc<VectorSet>,
}

impl BackgroundLease {
    pub(crate) fn acquire(set: &Arc<VectorSet>) -> Option<Self> {
        if !set.lifetime().try_acquire_shared() {
            return None;
        }
        Some(Self { set: set.clone() })
    }

    pub fn set(&self) -> &Arc<VectorSet> {
        &self.set
    }
}

impl Deref for BackgroundLease {
    type Target = VectorSet;

    fn deref(&self) -> &VectorSet {
        &self.set
    }
}

impl Drop for BackgroundLease {
    fn drop(&mut self) {
        self.set.lifetime().release_shared();
    }
}
