use crate::control_block::{ControlBlock, ControlBlockRegistry};
use crate::countable::{addr_of, Countable, Upcast};
use crate::ref_ptr::Ref;
use crate::tokens::Count;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

// Typed object pointer (dangling once expired) and the shared block.
struct Observed<T: ?Sized> {
    ptr: NonNull<T>,
    block: NonNull<ControlBlock>,
}

/// Non-owning observer of a `Ref`-managed object. Does not keep the object
/// alive; `lock` recovers a strong handle while it still exists.
pub struct WeakRef<T: ?Sized + Countable> {
    observed: Option<Observed<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: ?Sized + Countable + Send + Sync> Send for WeakRef<T> {}
unsafe impl<T: ?Sized + Countable + Send + Sync> Sync for WeakRef<T> {}

/// Error returned by `WeakRef::try_lock` when the object is gone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Expired;

impl fmt::Display for Expired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("weak reference has expired")
    }
}

impl std::error::Error for Expired {}

impl<T: ?Sized + Countable> WeakRef<T> {
    /// An observer of nothing; always expired.
    pub const fn new() -> Self {
        Self {
            observed: None,
            _marker: PhantomData,
        }
    }

    /// Observe the object held by `strong`. A null handle yields an empty
    /// observer.
    pub fn from_ref(strong: &Ref<T>) -> Self {
        let Some(ptr) = strong.as_ptr() else {
            return Self::new();
        };
        // SAFETY: `strong` keeps the object alive during the lookup.
        let counter = unsafe { ptr.as_ref() }.ref_counter();
        let Some(block) = ControlBlockRegistry::global().get_control_block(addr_of(ptr), counter)
        else {
            return Self::new();
        };
        unsafe { block.as_ref() }.inc_weak_count();
        Self {
            observed: Some(Observed { ptr, block }),
            _marker: PhantomData,
        }
    }

    /// True when nothing is observed or the object has been destroyed.
    pub fn expired(&self) -> bool {
        match &self.observed {
            // SAFETY: our weak unit keeps the block allocated.
            Some(o) => !unsafe { o.block.as_ref() }.is_alive(),
            None => true,
        }
    }

    /// A new strong handle to the object, or a null handle if it is gone or
    /// in the middle of being destroyed.
    pub fn lock(&self) -> Ref<T> {
        let Some(o) = &self.observed else {
            return Ref::null();
        };
        let block = unsafe { o.block.as_ref() };
        block.with_alive(|alive| {
            if !alive {
                return Ref::null();
            }
            // SAFETY: the owner marks the block dead before freeing the
            // object and cannot do so while we hold the block lock.
            let counter = unsafe { o.ptr.as_ref() }.ref_counter();
            match counter.try_get() {
                Some(token) => unsafe { Ref::from_parts(o.ptr, token) },
                // Count already hit zero: destruction is under way.
                None => Ref::null(),
            }
        })
    }

    /// Like `lock`, but reports a dead object as an error.
    pub fn try_lock(&self) -> Result<Ref<T>, Expired> {
        let strong = self.lock();
        if strong.is_valid() {
            Ok(strong)
        } else {
            Err(Expired)
        }
    }

    /// Stop observing.
    pub fn reset(&mut self) {
        if let Some(o) = self.observed.take() {
            // SAFETY: we owned one weak unit on this block.
            unsafe { ControlBlock::dec_weak_count(o.block) };
        }
    }

    /// Strong count of the object, 0 once expired.
    pub fn use_count(&self) -> u32 {
        match &self.observed {
            Some(o) => unsafe { o.block.as_ref() }.with_alive(|alive| {
                if alive {
                    unsafe { o.ptr.as_ref() }.ref_count()
                } else {
                    0
                }
            }),
            None => 0,
        }
    }

    /// Number of weak observers sharing this object's control block.
    pub fn weak_count(&self) -> u32 {
        self.observed
            .as_ref()
            .map_or(0, |o| unsafe { o.block.as_ref() }.weak_count())
    }

    /// Observe the same object through a view `U`.
    pub fn upcast<U: ?Sized + Countable>(&self) -> WeakRef<U>
    where
        T: Upcast<U>,
    {
        self.clone().into_upcast()
    }

    /// Convert this observer into one of view `U`, sharing the same block.
    pub fn into_upcast<U: ?Sized + Countable>(mut self) -> WeakRef<U>
    where
        T: Upcast<U>,
    {
        match self.observed.take() {
            Some(Observed { ptr, block }) => WeakRef {
                observed: Some(Observed {
                    ptr: T::upcast_ptr(ptr),
                    block,
                }),
                _marker: PhantomData,
            },
            None => WeakRef::new(),
        }
    }

    fn block_ptr(&self) -> Option<NonNull<ControlBlock>> {
        self.observed.as_ref().map(|o| o.block)
    }
}

impl<T: ?Sized + Countable> Drop for WeakRef<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized + Countable> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        match &self.observed {
            Some(o) => {
                unsafe { o.block.as_ref() }.inc_weak_count();
                Self {
                    observed: Some(Observed {
                        ptr: o.ptr,
                        block: o.block,
                    }),
                    _marker: PhantomData,
                }
            }
            None => Self::new(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.block_ptr() == source.block_ptr() {
            return;
        }
        let incoming = source.clone();
        *self = incoming;
    }
}

impl<T: ?Sized + Countable> Default for WeakRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + Countable> From<&Ref<T>> for WeakRef<T> {
    fn from(strong: &Ref<T>) -> Self {
        Self::from_ref(strong)
    }
}

/// Observers are equal when they share a control block (same object), or
/// when both observe nothing.
impl<T: ?Sized + Countable, U: ?Sized + Countable> PartialEq<WeakRef<U>> for WeakRef<T> {
    fn eq(&self, other: &WeakRef<U>) -> bool {
        self.block_ptr() == other.block_ptr()
    }
}

impl<T: ?Sized + Countable> Eq for WeakRef<T> {}

impl<T: ?Sized + Countable> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.expired() {
            f.write_str("WeakRef(expired)")
        } else {
            f.write_str("WeakRef(live)")
        }
    }
}
