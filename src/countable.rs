//! Intrusive strong-count header and the `Countable` capability.
//!
//! A type opts into `Ref` management by embedding a `RefCount` and
//! implementing `Countable` (usually through `impl_countable!`). The count
//! belongs to the object's identity: cloning a value that contains a
//! `RefCount` produces a fresh counter at zero.

use crate::tokens::{Count, Token};
use core::any::TypeId;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

/// Counts above this abort the process rather than risk wrapping.
const MAX_REFCOUNT: u32 = i32::MAX as u32;

/// Per-object strong-reference count.
pub struct RefCount {
    strong: AtomicU32,
    // Set once a control block has been registered for the owning object.
    tracked: AtomicBool,
}

impl RefCount {
    pub const fn new() -> Self {
        Self {
            strong: AtomicU32::new(0),
            tracked: AtomicBool::new(false),
        }
    }

    /// Increment and return the new count.
    #[inline]
    pub fn inc_ref(&self) -> u32 {
        // Relaxed is enough: a new reference can only be formed from an
        // existing one, which already synchronizes with the object.
        let prev = self.strong.fetch_add(1, Ordering::Relaxed);
        if prev >= MAX_REFCOUNT {
            // Follow Rc semantics: abort on overflow rather than continue unsafely.
            std::process::abort();
        }
        prev + 1
    }

    /// Increment unless the count is zero. Returns the new count.
    #[inline]
    pub fn try_inc_ref(&self) -> Option<u32> {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            if current >= MAX_REFCOUNT {
                std::process::abort();
            }
            match self.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement and return the new count.
    ///
    /// Panics if the count is already zero: that is a double release.
    ///
    /// # Safety
    /// The caller must give back a unit it owns. Releasing a unit that a
    /// live `Ref` still accounts for lets the object be freed under it.
    #[inline]
    pub unsafe fn dec_ref(&self) -> u32 {
        let prev = self.strong.fetch_sub(1, Ordering::Release);
        if prev == 0 {
            self.strong.fetch_add(1, Ordering::Relaxed);
            panic!("reference count is already 0");
        }
        if prev == 1 {
            // Synchronize with every earlier release before the owner
            // tears the object down.
            fence(Ordering::Acquire);
        }
        prev - 1
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.strong.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_tracked(&self) {
        self.tracked.store(true, Ordering::Release);
    }

    /// Whether a weak observer has ever been taken for the owning object.
    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RefCount {
    /// A copied object is a new identity and starts unowned.
    fn clone(&self) -> Self {
        Self::new()
    }

    /// Assigning one object's contents to another leaves its count alone.
    fn clone_from(&mut self, _source: &Self) {}
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCount")
            .field("strong", &self.ref_count())
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

impl Count for RefCount {
    type Token<'a>
        = Token<'a, Self>
    where
        Self: 'a;

    #[inline]
    fn get(&self) -> Self::Token<'static> {
        self.inc_ref();
        Token::<'static, Self>::new()
    }

    #[inline]
    fn try_get(&self) -> Option<Self::Token<'static>> {
        self.try_inc_ref()?;
        Some(Token::<'static, Self>::new())
    }

    #[inline]
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool {
        // Consume the token first so a double-release panic unwinds cleanly.
        core::mem::forget(t);
        // SAFETY: the token was the proof of one owned unit.
        unsafe { self.dec_ref() == 0 }
    }
}

/// Capability of objects that can be owned by `Ref` and observed by `WeakRef`.
///
/// # Safety
/// `ref_counter` must return the same `RefCount` on every call, embedded in
/// `self` and used by no other object. `object_type_id` must keep its
/// provided definition; `Ref::dynamic_cast` trusts it to name the concrete
/// type behind a trait object.
pub unsafe trait Countable: 'static {
    fn ref_counter(&self) -> &RefCount;

    #[inline]
    fn inc_ref(&self) -> u32 {
        self.ref_counter().inc_ref()
    }

    /// # Safety
    /// See `RefCount::dec_ref`.
    #[inline]
    unsafe fn dec_ref(&self) -> u32 {
        self.ref_counter().dec_ref()
    }

    #[inline]
    fn ref_count(&self) -> u32 {
        self.ref_counter().ref_count()
    }

    #[doc(hidden)]
    #[inline]
    fn object_type_id(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

/// Declared-safe pointer conversion between two views of one object,
/// typically a concrete type and a trait object it implements.
///
/// # Safety
/// `upcast_ptr` must return a pointer to the same object (same allocation,
/// same `RefCount`) and must not dereference its argument: weak handles
/// convert pointers to objects that may already be destroyed.
pub unsafe trait Upcast<U: ?Sized + Countable>: Countable {
    fn upcast_ptr(ptr: NonNull<Self>) -> NonNull<U>;
}

/// Object identity used for registry keys and handle equality.
#[inline]
pub(crate) fn addr_of<T: ?Sized>(ptr: NonNull<T>) -> usize {
    ptr.cast::<u8>().as_ptr() as usize
}

/// Implement `Countable` for a type by naming its `RefCount` field.
///
/// ```
/// use intrusive_ref::{impl_countable, RefCount};
///
/// struct Texture {
///     rc: RefCount,
///     width: u32,
/// }
/// impl_countable!(Texture, rc);
/// ```
#[macro_export]
macro_rules! impl_countable {
    ($ty:ty, $field:ident) => {
        unsafe impl $crate::Countable for $ty {
            #[inline]
            fn ref_counter(&self) -> &$crate::RefCount {
                &self.$field
            }
        }
    };
}

/// Implement `Upcast` from a concrete type to one or more trait objects
/// (or other unsized views) it coerces to.
///
/// ```
/// use intrusive_ref::{impl_countable, impl_upcast, Countable, Ref, RefCount};
///
/// trait Resource: Countable {
///     fn name(&self) -> &str;
/// }
///
/// struct Buffer {
///     rc: RefCount,
/// }
/// impl_countable!(Buffer, rc);
/// impl Resource for Buffer {
///     fn name(&self) -> &str {
///         "buffer"
///     }
/// }
/// impl_upcast!(Buffer => dyn Resource);
///
/// let buf = Ref::new(Buffer { rc: RefCount::new() });
/// let res: Ref<dyn Resource> = buf.upcast();
/// assert_eq!(res.name(), "buffer");
/// assert_eq!(buf.use_count(), 2);
/// ```
#[macro_export]
macro_rules! impl_upcast {
    ($from:ty => $($to:ty),+ $(,)?) => {
        $(
            unsafe impl $crate::Upcast<$to> for $from {
                #[inline]
                fn upcast_ptr(ptr: ::core::ptr::NonNull<Self>) -> ::core::ptr::NonNull<$to> {
                    ptr
                }
            }
        )+
    };
}
