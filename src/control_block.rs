//! Control blocks: out-of-line liveness records backing `WeakRef`.
//!
//! One block exists per object that has ever been weakly observed. The
//! process-wide `ControlBlockRegistry` maps object address -> block and is
//! consulted when the first `WeakRef` is taken and when the object dies.
//!
//! Lifetime protocol
//! - Created lazily by `get_control_block`, while the caller holds a strong
//!   reference (so the object cannot die concurrently).
//! - `remove_control_block` runs once, after the strong count reached zero
//!   and before the object's memory is freed. It unregisters the block and
//!   marks it dead; the block is freed right away when no weak holder
//!   remains, otherwise by the last `dec_weak_count`.
//! - Both the "mark dead" step and the "last weak holder leaves" step take
//!   the block's own mutex, so exactly one of them frees the block.
//! - `WeakRef::lock` holds the same mutex while it checks liveness and
//!   bumps the strong count, which keeps the object allocated for the
//!   duration of that check.

use crate::countable::RefCount;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use hashbrown::HashMap;
use log::trace;
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Liveness record for one object, shared by all of its weak observers.
#[derive(Debug)]
pub struct ControlBlock {
    addr: usize,
    alive: Mutex<bool>,
    weak: AtomicU32,
}

impl ControlBlock {
    fn new(addr: usize) -> Self {
        Self {
            addr,
            alive: Mutex::new(true),
            weak: AtomicU32::new(0),
        }
    }

    /// Address of the observed object (meaningful only while alive).
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.lock()
    }

    pub fn weak_count(&self) -> u32 {
        self.weak.load(Ordering::Acquire)
    }

    /// Caller must either hold a weak unit already or have just obtained the
    /// block from the registry while holding a strong reference.
    pub fn inc_weak_count(&self) -> u32 {
        let prev = self.weak.fetch_add(1, Ordering::Relaxed);
        if prev == u32::MAX {
            std::process::abort();
        }
        prev + 1
    }

    /// Return one weak unit; frees the block when it was the last unit and
    /// the object is already dead. Returns true if the block was freed.
    ///
    /// # Safety
    /// `this` must point to a block that has not been freed, and the caller
    /// must own the weak unit being returned. The pointer is dangling
    /// afterwards if this returns true.
    pub unsafe fn dec_weak_count(this: NonNull<Self>) -> bool {
        let free = {
            let block = this.as_ref();
            let alive = block.alive.lock();
            let prev = block.weak.fetch_sub(1, Ordering::AcqRel);
            assert!(prev != 0, "weak count is already 0");
            prev == 1 && !*alive
        };
        if free {
            trace!("control block {:#x}: last weak observer left", this.as_ref().addr);
            drop(Box::from_raw(this.as_ptr()));
        }
        free
    }

    /// Run `f` with the liveness flag pinned. The owner cannot mark the
    /// block dead, and therefore cannot free the object, until `f` returns.
    pub(crate) fn with_alive<R>(&self, f: impl FnOnce(bool) -> R) -> R {
        let alive = self.alive.lock();
        f(*alive)
    }

    /// Mark the object dead. Returns true if no weak holder remains and the
    /// caller must free the block.
    fn mark_dead(&self) -> bool {
        let mut alive = self.alive.lock();
        *alive = false;
        self.weak.load(Ordering::Acquire) == 0
    }
}

/// Address -> block table, one per process.
pub struct ControlBlockRegistry {
    blocks: Mutex<HashMap<usize, NonNull<ControlBlock>>>,
}

// Thread-safe: the table is only touched under its mutex, and the blocks it
// points to are themselves Sync.
unsafe impl Send for ControlBlockRegistry {}
unsafe impl Sync for ControlBlockRegistry {}

static REGISTRY: OnceLock<ControlBlockRegistry> = OnceLock::new();

impl ControlBlockRegistry {
    fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry, created on first use. Blocks still
    /// registered when the process exits are never swept.
    pub fn global() -> &'static Self {
        REGISTRY.get_or_init(Self::new)
    }

    /// Return the block for the object at `addr`, creating it on first use.
    /// A null address yields `None`.
    ///
    /// The caller must hold a strong reference to the object, and `counter`
    /// must be that object's count.
    pub fn get_control_block(
        &self,
        addr: usize,
        counter: &RefCount,
    ) -> Option<NonNull<ControlBlock>> {
        if addr == 0 {
            return None;
        }
        let mut blocks = self.blocks.lock();
        let block = *blocks.entry(addr).or_insert_with(|| {
            trace!("control block {:#x}: created", addr);
            NonNull::from(Box::leak(Box::new(ControlBlock::new(addr))))
        });
        counter.mark_tracked();
        Some(block)
    }

    /// Sever the block for the object at `addr`, which is being destroyed.
    /// Called once per object, before its memory is reclaimed. No-op when the
    /// object was never weakly observed.
    pub fn remove_control_block(&self, addr: usize) {
        if addr == 0 {
            return;
        }
        let Some(block) = self.blocks.lock().remove(&addr) else {
            return;
        };
        // SAFETY: a registered block is only freed after it is marked dead,
        // which happens here and nowhere else.
        let free = unsafe { block.as_ref() }.mark_dead();
        if free {
            trace!("control block {:#x}: freed with object", addr);
            // SAFETY: dead, unregistered, and no weak holder can reach it.
            drop(unsafe { Box::from_raw(block.as_ptr()) });
        } else {
            trace!("control block {:#x}: severed, outlives object", addr);
        }
    }

    /// Whether an object at `addr` currently has a registered block.
    pub fn contains(&self, addr: usize) -> bool {
        self.blocks.lock().contains_key(&addr)
    }

    /// Number of registered blocks (live, weakly observed objects).
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A private registry per test keeps the assertions independent of other
    // tests running against the global one.
    fn fresh() -> ControlBlockRegistry {
        ControlBlockRegistry::new()
    }

    #[test]
    fn null_address_has_no_block() {
        let reg = fresh();
        let rc = RefCount::new();
        assert!(reg.get_control_block(0, &rc).is_none());
        assert!(!rc.is_tracked());
        reg.remove_control_block(0);
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_reuses_block_and_marks_tracked() {
        let reg = fresh();
        let rc = RefCount::new();
        let a = reg.get_control_block(0x1000, &rc).unwrap();
        let b = reg.get_control_block(0x1000, &rc).unwrap();
        assert_eq!(a, b);
        assert!(rc.is_tracked());
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(0x1000));
        assert_eq!(unsafe { a.as_ref() }.addr(), 0x1000);
        reg.remove_control_block(0x1000);
        assert!(!reg.contains(0x1000));
    }

    #[test]
    fn block_outlives_object_until_last_weak() {
        let reg = fresh();
        let rc = RefCount::new();
        let block = reg.get_control_block(0x2000, &rc).unwrap();
        unsafe { block.as_ref() }.inc_weak_count();
        unsafe { block.as_ref() }.inc_weak_count();

        reg.remove_control_block(0x2000);
        assert!(!reg.contains(0x2000));
        assert!(!unsafe { block.as_ref() }.is_alive());
        assert_eq!(unsafe { block.as_ref() }.weak_count(), 2);

        assert!(!unsafe { ControlBlock::dec_weak_count(block) });
        assert!(unsafe { ControlBlock::dec_weak_count(block) });
    }

    #[test]
    fn weak_drop_while_alive_keeps_block() {
        let reg = fresh();
        let rc = RefCount::new();
        let block = reg.get_control_block(0x3000, &rc).unwrap();
        unsafe { block.as_ref() }.inc_weak_count();
        assert!(!unsafe { ControlBlock::dec_weak_count(block) });
        assert!(reg.contains(0x3000));
        assert!(unsafe { block.as_ref() }.is_alive());
        // No observers left: removal frees immediately.
        reg.remove_control_block(0x3000);
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_unknown_address_is_noop() {
        let reg = fresh();
        reg.remove_control_block(0x4000);
        assert!(reg.is_empty());
    }
}
