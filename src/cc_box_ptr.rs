// Copyright 2015 The Rust Project Developers. See the COPYRIGHT file at the
// top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;

use crate::trace::Tracer;
use crate::{CcBoxData, Color};

/// A trait to group all of the operations we need to be able to do on
/// `CcBox<T>`'s, potentially across different `T` types.
pub trait CcBoxPtr {
    /// Get this node's reference counting and coloring data.
    fn data(&self) -> &CcBoxData;

    /// Invoke the tracer on each node reachable through a strong edge from
    /// this node's value. Does nothing once the value has been dropped.
    fn trace_value(&self, tracer: &mut Tracer<'_>);

    /// Run the value's finalizer. Does nothing once the value has been
    /// dropped.
    fn finalize_value(&self);

    /// Destroy the value in place, leaving the node record allocated so that
    /// handles held by other dying values can still read the counters.
    ///
    /// # Safety
    ///
    /// No reference to the value may be live across this call.
    unsafe fn drop_value(&self);

    /// Get this node's strong count.
    #[inline]
    fn strong(&self) -> usize {
        self.data().strong()
    }

    /// Get this node's weak count.
    #[inline]
    fn weak(&self) -> usize {
        self.data().weak()
    }

    /// Get this node's current color.
    #[inline]
    fn color(&self) -> Color {
        self.data().color()
    }

    /// True if this node is currently in the suspected roots buffer.
    #[inline]
    fn buffered(&self) -> bool {
        self.data().buffered()
    }
}

/// Release the node record's keepalive weak reference. The value must already
/// have been destroyed. Deallocates the record if no weak handles remain;
/// otherwise the last `Weak<T>` to be dropped deallocates it.
pub unsafe fn free(s: NonNull<dyn CcBoxPtr>) {
    debug_assert_eq!(s.as_ref().strong(), 0);
    debug_assert!(!s.as_ref().buffered());
    debug_assert!(s.as_ref().data().is_dropped());

    // Remove the implicit "strong weak" pointer now that we've destroyed the
    // contents.
    s.as_ref().data().dec_weak();

    if s.as_ref().weak() == 0 {
        crate::deallocate(s);
    }
}
