//! Debug-only reentrancy tracking for the engines.
//!
//! Comparators, `Hash` and `Eq` are user code that runs while an engine is
//! in the middle of a lookup or insertion. If such a callback reaches back
//! into the same engine (through a raw pointer or interior mutability), it
//! would observe a half-finished operation. In debug builds the first
//! nested entry panics; in release builds the tracker is zero-sized.

use core::marker::PhantomData;

#[cfg(debug_assertions)]
use core::cell::Cell;
#[cfg(debug_assertions)]
use std::rc::Rc;

/// Embedded once per engine. Public operations that call user code open a
/// section with `let _g = self.reentrancy.enter();`. The section owns its
/// handle to the flag, so the engine stays free for `&mut self` helpers
/// while it is held.
#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    active: Rc<Cell<bool>>,
    // Engines are single-threaded; this marker keeps them !Send + !Sync.
    _single_thread: PhantomData<*mut ()>,
}

impl DebugReentrancy {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            active: Rc::new(Cell::new(false)),
            _single_thread: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn enter(&self) -> Section {
        #[cfg(debug_assertions)]
        {
            assert!(
                !self.active.replace(true),
                "engine re-entered from a comparator, hasher or equality callback"
            );
            return Section {
                active: Rc::clone(&self.active),
            };
        }

        #[cfg(not(debug_assertions))]
        {
            return Section { _z: () };
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// Open section; closes on drop, including during unwinding, so a panicking
/// comparator does not leave the engine permanently locked.
pub(crate) struct Section {
    #[cfg(debug_assertions)]
    active: Rc<Cell<bool>>,
    #[cfg(not(debug_assertions))]
    _z: (),
}

impl Drop for Section {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.active.set(false);
    }
}
