//! Ordering policies for the tree engine.
//!
//! A comparator must be a strict weak order. `Compare<L, R>` compares a
//! stored element (`L`) against a query (`R`); the engine derives both
//! "element < key" and "key < element" from the single `Ordering`, so one
//! direction is enough for heterogeneous lookups.

use core::borrow::Borrow;
use core::cmp::Ordering;

pub trait Compare<L: ?Sized, R: ?Sized = L> {
    fn compare(&self, l: &L, r: &R) -> Ordering;
}

/// `Ord` of the element, or of any type it borrows as.
#[derive(Copy, Clone, Debug, Default)]
pub struct Natural;

impl<L, R> Compare<L, R> for Natural
where
    L: ?Sized + Borrow<R>,
    R: ?Sized + Ord,
{
    #[inline]
    fn compare(&self, l: &L, r: &R) -> Ordering {
        l.borrow().cmp(r)
    }
}

/// Inverts another comparator.
#[derive(Copy, Clone, Debug, Default)]
pub struct Reverse<C>(pub C);

impl<L, R, C> Compare<L, R> for Reverse<C>
where
    L: ?Sized,
    R: ?Sized,
    C: Compare<L, R>,
{
    #[inline]
    fn compare(&self, l: &L, r: &R) -> Ordering {
        self.0.compare(l, r).reverse()
    }
}

/// Adapts a closure `Fn(&T, &T) -> Ordering`.
#[derive(Copy, Clone, Debug)]
pub struct FnCompare<F>(pub F);

impl<T, F> Compare<T, T> for FnCompare<F>
where
    T: ?Sized,
    F: Fn(&T, &T) -> Ordering,
{
    #[inline]
    fn compare(&self, l: &T, r: &T) -> Ordering {
        (self.0)(l, r)
    }
}
