//! Debug-only set of object addresses currently owned by `Ref`s.
//!
//! Enabled by the `live-refs` feature. An address enters the set whenever a
//! `Ref` adopts the object (boxed or raw) and leaves it when the object is
//! destroyed, so `is_live` answers "is this pointer still a managed object?"
//! for diagnostics. Every adoption and destruction takes a global mutex.

use hashbrown::HashSet;
use log::debug;
use parking_lot::Mutex;
use std::sync::OnceLock;

static LIVE: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();

fn live_set() -> &'static Mutex<HashSet<usize>> {
    LIVE.get_or_init(|| {
        debug!("live reference tracking enabled");
        Mutex::new(HashSet::new())
    })
}

pub(crate) fn insert(addr: usize) {
    live_set().lock().insert(addr);
}

pub(crate) fn remove(addr: usize) {
    live_set().lock().remove(&addr);
}

/// Whether `ptr` addresses an object currently owned by at least one `Ref`.
pub fn is_live<T: ?Sized>(ptr: *const T) -> bool {
    let addr = ptr as *const () as usize;
    live_set().lock().contains(&addr)
}

/// Number of managed objects alive right now.
pub fn count() -> usize {
    live_set().lock().len()
}
