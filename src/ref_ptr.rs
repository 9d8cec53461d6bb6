use crate::control_block::ControlBlockRegistry;
use crate::countable::{addr_of, Countable, RefCount, Upcast};
use crate::tokens::{Count, Token};
use crate::weak_ref::WeakRef;
use core::any::TypeId;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use std::sync::Arc;

// Pointer plus the token for the one strong unit this handle contributes.
struct Held<T: ?Sized> {
    ptr: NonNull<T>,
    token: Token<'static, RefCount>,
}

/// Owning handle to a `Countable` object. Clone increments the object's
/// count; dropping the last handle destroys the object and expires its
/// weak observers.
pub struct Ref<T: ?Sized + Countable> {
    held: Option<Held<T>>,
    _owns: PhantomData<T>,
}

unsafe impl<T: ?Sized + Countable + Send + Sync> Send for Ref<T> {}
unsafe impl<T: ?Sized + Countable + Send + Sync> Sync for Ref<T> {}

impl<T: Countable> Ref<T> {
    /// Allocate `value` and return the first handle to it.
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }
}

impl<T: ?Sized + Countable> Ref<T> {
    /// A handle to nothing.
    pub const fn null() -> Self {
        Self {
            held: None,
            _owns: PhantomData,
        }
    }

    /// Adopt a boxed object. Its count goes up by one.
    pub fn from_box(value: Box<T>) -> Self {
        let ptr = NonNull::from(Box::leak(value));
        // SAFETY: freshly leaked from a Box, so valid and Box-owned.
        unsafe { Self::adopt(ptr) }
    }

    /// Adopt a raw object pointer, incrementing its count. Null yields a
    /// null handle.
    ///
    /// # Safety
    /// A non-null `ptr` must come from `Box::into_raw`, `Ref::as_ptr` or
    /// `Ref::into_raw`, and the object must still be alive (either owned by
    /// another `Ref`, or never adopted yet). The object must not be owned
    /// outside the reference-counted discipline.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        match NonNull::new(ptr as *mut T) {
            Some(p) => Self::adopt(p),
            None => Self::null(),
        }
    }

    /// Take back a pointer produced by `into_raw` without touching the count.
    ///
    /// # Safety
    /// `ptr` must come from `Ref::into_raw` and each such pointer may be
    /// taken back only once.
    pub unsafe fn from_raw_owned(ptr: NonNull<T>) -> Self {
        Self::from_parts(ptr, Token::new())
    }

    /// Give up this handle without releasing its unit. The object stays
    /// alive until the pointer is passed to `from_raw_owned` and dropped.
    pub fn into_raw(mut self) -> Option<NonNull<T>> {
        self.held.take().map(|Held { ptr, token }| {
            token.leak();
            ptr
        })
    }

    unsafe fn adopt(ptr: NonNull<T>) -> Self {
        let token = ptr.as_ref().ref_counter().get();
        #[cfg(feature = "live-refs")]
        crate::live::insert(addr_of(ptr));
        Self::from_parts(ptr, token)
    }

    pub(crate) unsafe fn from_parts(ptr: NonNull<T>, token: Token<'static, RefCount>) -> Self {
        Self {
            held: Some(Held { ptr, token }),
            _owns: PhantomData,
        }
    }

    /// Borrow the object, or `None` for a null handle.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: our unit keeps the object alive for as long as we are.
        self.held.as_ref().map(|h| unsafe { h.ptr.as_ref() })
    }

    /// Mutably borrow the object when this is the only handle and the
    /// object has never been weakly observed.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let h = self.held.as_mut()?;
        let counter = unsafe { h.ptr.as_ref() }.ref_counter();
        if counter.ref_count() == 1 && !counter.is_tracked() {
            // SAFETY: no other handle exists and none can be formed while we
            // hold `&mut self`; no weak observer can lock it either.
            Some(unsafe { h.ptr.as_mut() })
        } else {
            None
        }
    }

    /// The object pointer, without transferring ownership.
    #[inline]
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.held.as_ref().map(|h| h.ptr)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.held.is_some()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.held.is_none()
    }

    /// Current strong count of the object, 0 for a null handle.
    pub fn use_count(&self) -> u32 {
        self.get().map_or(0, |v| v.ref_count())
    }

    /// Whether this is the only strong handle. Advisory under concurrency.
    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// Release the object (destroying it if this was the last handle) and
    /// become null.
    pub fn reset(&mut self) {
        *self = Self::null();
    }

    /// Release the current object and adopt `value`.
    pub fn reset_with(&mut self, value: Box<T>) {
        *self = Self::from_box(value);
    }

    /// Release the current object and adopt `ptr` (see `from_raw`). The new
    /// object is counted before the old one is released, so resetting to the
    /// object already held is harmless.
    ///
    /// # Safety
    /// Same contract as `from_raw`.
    pub unsafe fn reset_raw(&mut self, ptr: *const T) {
        let incoming = Self::from_raw(ptr);
        *self = incoming;
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(self, other);
    }

    /// Same object (or both null).
    #[inline]
    pub fn ptr_eq<U: ?Sized + Countable>(&self, other: &Ref<U>) -> bool {
        self.addr() == other.addr()
    }

    /// Compare the objects themselves. Identical handles are equal without
    /// consulting `T`; a null handle equals only another null handle.
    pub fn equals_object(&self, other: &Self) -> bool
    where
        T: PartialEq,
    {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.get(), other.get()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Take a weak observer of the object.
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef::from_ref(self)
    }

    /// Share ownership through a view `U` of the same object.
    pub fn upcast<U: ?Sized + Countable>(&self) -> Ref<U>
    where
        T: Upcast<U>,
    {
        self.clone().into_upcast()
    }

    /// Convert this handle into a view `U` of the same object. The count is
    /// unchanged.
    pub fn into_upcast<U: ?Sized + Countable>(mut self) -> Ref<U>
    where
        T: Upcast<U>,
    {
        match self.held.take() {
            Some(Held { ptr, token }) => Ref {
                held: Some(Held {
                    ptr: T::upcast_ptr(ptr),
                    token,
                }),
                _owns: PhantomData,
            },
            None => Ref::null(),
        }
    }

    /// Share ownership as a `U` without checking the object's type.
    ///
    /// # Safety
    /// The object must really be a `U`.
    pub unsafe fn cast_unchecked<U: Countable>(&self) -> Ref<U> {
        match &self.held {
            Some(h) => Ref::adopt(h.ptr.cast::<U>()),
            None => Ref::null(),
        }
    }

    /// Share ownership as a `U` if the object's concrete type is `U`,
    /// otherwise return a null handle.
    pub fn dynamic_cast<U: Countable>(&self) -> Ref<U> {
        match &self.held {
            // SAFETY: the type check makes the cast exact.
            Some(h) if self.is_instance_of::<U>() => unsafe { Ref::adopt(h.ptr.cast::<U>()) },
            _ => Ref::null(),
        }
    }

    fn is_instance_of<U: Countable>(&self) -> bool {
        self.get()
            .is_some_and(|v| v.object_type_id() == TypeId::of::<U>())
    }

    /// Hand one strong unit to `std::sync::Arc`. The unit is released when
    /// the last `Arc` clone drops. `None` for a null handle.
    pub fn to_shared_ptr(&self) -> Option<Arc<Ref<T>>> {
        self.is_valid().then(|| Arc::new(self.clone()))
    }

    /// Take a strong handle out of an `Arc`-shared one.
    pub fn from_shared_ptr(shared: &Arc<Ref<T>>) -> Self {
        Ref::clone(&**shared)
    }

    #[inline]
    fn addr(&self) -> usize {
        self.held.as_ref().map_or(0, |h| addr_of(h.ptr))
    }
}

/// Tear down an object whose count just reached zero.
unsafe fn destroy<T: ?Sized + Countable>(ptr: NonNull<T>) {
    let addr = addr_of(ptr);
    if ptr.as_ref().ref_counter().is_tracked() {
        ControlBlockRegistry::global().remove_control_block(addr);
    }
    #[cfg(feature = "live-refs")]
    crate::live::remove(addr);
    drop(Box::from_raw(ptr.as_ptr()));
}

impl<T: ?Sized + Countable> Drop for Ref<T> {
    fn drop(&mut self) {
        if let Some(Held { ptr, token }) = self.held.take() {
            // SAFETY: our unit kept the object alive up to this point.
            let now_zero = unsafe { ptr.as_ref() }.ref_counter().put(token);
            if now_zero {
                unsafe { destroy(ptr) };
            }
        }
    }
}

impl<T: ?Sized + Countable> Clone for Ref<T> {
    fn clone(&self) -> Self {
        match &self.held {
            // SAFETY: we hold a unit, so the object is alive.
            Some(h) => unsafe { Self::adopt(h.ptr) },
            None => Self::null(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.ptr_eq(source) {
            return;
        }
        // Count the incoming object before releasing the old one.
        let incoming = source.clone();
        *self = incoming;
    }
}

impl<T: ?Sized + Countable> Default for Ref<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized + Countable> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(v) => v,
            None => panic!("Dereferencing null Ref"),
        }
    }
}

impl<T: ?Sized + Countable> From<Box<T>> for Ref<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T: ?Sized + Countable> From<&WeakRef<T>> for Ref<T> {
    fn from(weak: &WeakRef<T>) -> Self {
        weak.lock()
    }
}

impl<T: ?Sized + Countable, U: ?Sized + Countable> PartialEq<Ref<U>> for Ref<T> {
    fn eq(&self, other: &Ref<U>) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: ?Sized + Countable> Eq for Ref<T> {}

impl<T: ?Sized + Countable> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized + Countable + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => f.debug_tuple("Ref").field(&v).finish(),
            None => f.write_str("Ref(null)"),
        }
    }
}

impl<T: ?Sized + Countable> fmt::Pointer for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&(self.addr() as *const ()), f)
    }
}
