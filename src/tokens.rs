//! Lifetime-tied linear tokens and counting traits.
//!
//! Tokens are zero-sized proofs that one unit was acquired from a
//! particular counter. Dropping a token panics; the only valid way to
//! dispose of it is to return it to the originating counter via
//! `Count::put`. Every non-null `Ref` carries exactly one token for the
//! strong unit it contributes to its object's `RefCount`.

use core::marker::PhantomData;

/// Zero-sized, linear token tied to its originating counter via lifetime.
pub struct Token<'a, C: ?Sized> {
    // Lifetime is tracked separately from the counter type to avoid
    // imposing `'a` bounds on `C`.
    _lt: PhantomData<&'a ()>,
    _ctr: PhantomData<*const C>,
}

impl<'a, C: ?Sized> Token<'a, C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            _lt: PhantomData,
            _ctr: PhantomData,
        }
    }

    /// Give up the token without returning its unit to the counter.
    ///
    /// The unit stays counted; whoever holds the matching raw pointer is now
    /// responsible for it (see `Ref::into_raw`).
    #[inline]
    pub(crate) fn leak(self) {
        core::mem::forget(self);
    }
}

impl<'a, C: ?Sized> Drop for Token<'a, C> {
    fn drop(&mut self) {
        // Intentional fail-fast on misuse: token must be consumed by Count::put.
        panic!("Token dropped without Count::put");
    }
}

/// A source of counted references, enforced by linear Token flow.
pub trait Count {
    /// The token type minted by this counter.
    type Token<'a>: Sized
    where
        Self: 'a;

    /// Acquire one counted reference and return a linear token for it.
    ///
    /// Tokens are minted with a 'static lifetime parameter. The token is
    /// still branded to this counter via its type parameter, and can be
    /// covariantly shortened when returning it via `put`.
    fn get(&self) -> Self::Token<'static>;

    /// Acquire one counted reference unless the count has already reached
    /// zero. A counter at zero belongs to an object that is being destroyed.
    fn try_get(&self) -> Option<Self::Token<'static>>;

    /// Return (consume) a previously acquired token.
    /// Returns true if the count is now zero.
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefCount;

    #[test]
    fn get_and_put_balance() {
        let c = RefCount::new();
        let t1 = c.get();
        let t2 = c.get();
        assert_eq!(c.ref_count(), 2);
        assert!(!c.put(t1));
        assert!(c.put(t2));
        assert_eq!(c.ref_count(), 0);
    }

    #[test]
    fn try_get_refuses_zero() {
        let c = RefCount::new();
        assert!(c.try_get().is_none());
        let t = c.get();
        let t2 = c.try_get().expect("count is live");
        assert!(!c.put(t2));
        assert!(c.put(t));
        assert!(c.try_get().is_none());
    }

    #[test]
    fn dropped_token_panics() {
        let res = std::panic::catch_unwind(|| {
            let _t: Token<'static, RefCount> = Token::new();
        });
        assert!(res.is_err(), "dropping a token must fail fast");
    }

    #[test]
    fn leaked_token_keeps_unit() {
        let c = RefCount::new();
        c.get().leak();
        assert_eq!(c.ref_count(), 1);
    }
}
