//! intrusive-ref: thread-safe intrusive reference counting with weak
//! observers, meant as the default ownership idiom of a larger codebase
//! (renderer resources, assets, devices).
//!
//! Internal Design:
//!
//! Summary
//! - Goal: shared ownership where the count lives inside the object, with
//!   weak observers that can tell when the object is gone and never hand
//!   out a pointer to freed or half-destroyed memory.
//! - Layers:
//!   - RefCount / Countable: the embedded atomic strong count. A type opts
//!     in with `impl_countable!`.
//!   - tokens: linear zero-sized tokens; each `Ref` holds the token for the
//!     one unit it contributes and must hand it back to release.
//!   - ControlBlock / ControlBlockRegistry: out-of-line liveness record per
//!     weakly observed object, found through a process-wide address table.
//!   - Ref<T>: owning handle. WeakRef<T>: non-owning observer.
//!
//! Constraints
//! - Thread-safe: counts are atomics; `Ref<T>`/`WeakRef<T>` are `Send` and
//!   `Sync` when `T` is.
//! - Objects live in their own `Box` allocation; `Ref` is pointer-sized.
//! - Objects that are never weakly observed never touch the registry.
//!
//! Destruction and weak observers
//! - The last `Ref` to release (strong count reaches zero) tears the object
//!   down in this order: sever its control block (if it ever had one),
//!   then drop and free the object.
//! - `WeakRef::lock` checks the block and increments the strong count under
//!   the block's own mutex, and only increments a nonzero count. It either
//!   sees the object alive and takes a unit before the count can hit zero,
//!   or it returns a null handle.
//! - The registry mutex guards only map lookups and removals and is never
//!   held while touching an object.
//!
//! Control-block identity
//! - Blocks are keyed by object address, not by the static handle type. A
//!   `WeakRef<dyn Trait>` and a `WeakRef<Concrete>` to one object share a
//!   block and expire together no matter which view released last.
//!
//! Failure semantics
//! - Releasing a count that is already zero panics (double release).
//! - Dereferencing a null `Ref` panics.
//! - Counts beyond `i32::MAX` abort the process, matching `Rc`.
//! - Expected failures (locking an expired observer, a failed
//!   `dynamic_cast`) return a null `Ref`; `WeakRef::try_lock` turns that
//!   into `Err(Expired)`.
//!
//! Notes and non-goals
//! - No cycle collection: a cycle of `Ref`s leaks. Break cycles with `WeakRef`.
//! - `Ref::is_unique` and `use_count` are advisory under concurrency.
//! - Control blocks still registered when the process exits are leaked.

#[cfg(feature = "bench_internal")]
pub mod control_block;
// Registry diagnostics are only reachable from tests and benches.
#[cfg(not(feature = "bench_internal"))]
#[allow(dead_code)]
mod control_block;
mod countable;
#[cfg(feature = "live-refs")]
pub mod live;
mod ref_ptr;
pub mod tokens;
mod weak_ref;

// Public surface
pub use countable::{Countable, RefCount, Upcast};
pub use ref_ptr::Ref;
pub use weak_ref::{Expired, WeakRef};

/// Unique ownership counterpart of `Ref`.
pub type Scope<T> = Box<T>;

/// Allocate `value` with unique ownership.
pub fn create_scope<T>(value: T) -> Scope<T> {
    Box::new(value)
}

/// Allocate `value` and return the first strong handle to it.
pub fn create_ref<T: Countable>(value: T) -> Ref<T> {
    Ref::new(value)
}
