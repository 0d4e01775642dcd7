// Copyright 2015 The Rust Project Developers. See the COPYRIGHT file at the
// top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local reference-counted boxes (the `Cc<T>` type) that also reclaim
//! reference cycles.
//!
//! The `Cc<T>` type provides shared ownership of an immutable value, with two
//! additions over plain reference counting:
//!
//! * **Cycle collection.** When a handle is dropped and the value's strong
//!   count stays above zero, the value is remembered as a suspected cycle
//!   root. A synchronous three-pass collection ("A Pure Reference Counting
//!   Garbage Collector", Bacon et al., 2001) later walks the suspected
//!   subgraphs and reclaims the cycles that turned out to be garbage. By
//!   default a pass runs whenever a handle drop leaves suspects buffered;
//!   see [`AutoCollect`] for the policy knob and [`collect_cycles`] to run
//!   one by hand.
//! * **Finalization.** Every managed type carries a [`Finalize`] hook. When
//!   a group of values is reclaimed, all of their finalizers run before any
//!   of their values is dropped, so a finalizer may still look at the dying
//!   peers its value points to.
//!
//! For the collector to find cycles, every managed type implements
//! [`Trace`], enumerating the handles its values own. Handles are not
//! sendable between threads and each thread runs its own collector.
//!
//! The `downgrade` method can be used to create a non-owning [`Weak<T>`]
//! handle. A `Weak<T>` can be upgraded back to a `Cc<T>`, but this returns
//! `None` if the value has already been dropped.
//!
//! # Examples
//!
//! Consider a scenario where a set of `Gadget`s are owned by a given
//! `Owner`. We want gadgets to share their owner, and the owner to stay
//! allocated as long as any gadget points at it:
//!
//! ```rust
//! use cycle_rc::{collect_cycles, Cc, Finalize, Trace, Tracer};
//!
//! struct Owner {
//!     name: String,
//! }
//!
//! impl Finalize for Owner {}
//! impl Trace for Owner {
//!     // Nothing to trace; `Owner` doesn't own any Cc<T> things.
//!     fn trace(&self, _tracer: &mut Tracer<'_>) {}
//! }
//!
//! struct Gadget {
//!     id: i32,
//!     owner: Cc<Owner>,
//! }
//!
//! impl Finalize for Gadget {}
//! impl Trace for Gadget {
//!     fn trace(&self, tracer: &mut Tracer<'_>) {
//!         self.owner.trace(tracer);
//!     }
//! }
//!
//! fn main() {
//!     let gadget_owner: Cc<Owner> = Cc::new(Owner {
//!         name: String::from("Gadget Man"),
//!     });
//!
//!     // Cloning the handle increments the strong count.
//!     let gadget1 = Gadget { id: 1, owner: gadget_owner.clone() };
//!     let gadget2 = Gadget { id: 2, owner: gadget_owner.clone() };
//!
//!     drop(gadget_owner);
//!
//!     // Despite dropping our own handle, the owner is kept alive by the
//!     // gadgets' handles.
//!     println!("Gadget {} owned by {}", gadget1.id, gadget1.owner.name);
//!     println!("Gadget {} owned by {}", gadget2.id, gadget2.owner.name);
//!
//!     drop(gadget1);
//!     drop(gadget2);
//!     collect_cycles();
//! }
//! ```
//!
//! If we also want to traverse from `Owner` to its `Gadget`s, a `Cc<T>` in
//! each direction would form a cycle; the collector would reclaim it, but
//! the back edges carry no ownership, which is what [`Weak<T>`] expresses:
//!
//! ```rust
//! use cycle_rc::{collect_cycles, Cc, Finalize, Trace, Tracer, Weak};
//! use std::cell::RefCell;
//!
//! struct Owner {
//!     name: String,
//!     gadgets: RefCell<Vec<Weak<Gadget>>>,
//! }
//!
//! impl Finalize for Owner {}
//! impl Trace for Owner {
//!     fn trace(&self, _tracer: &mut Tracer<'_>) {
//!         // Weak handles are not traced.
//!     }
//! }
//!
//! struct Gadget {
//!     id: i32,
//!     owner: Cc<Owner>,
//! }
//!
//! impl Finalize for Gadget {}
//! impl Trace for Gadget {
//!     fn trace(&self, tracer: &mut Tracer<'_>) {
//!         self.owner.trace(tracer);
//!     }
//! }
//!
//! fn main() {
//!     let gadget_owner: Cc<Owner> = Cc::new(Owner {
//!         name: "Gadget Man".to_string(),
//!         gadgets: RefCell::new(Vec::new()),
//!     });
//!
//!     let gadget1 = Cc::new(Gadget { id: 1, owner: gadget_owner.clone() });
//!     let gadget2 = Cc::new(Gadget { id: 2, owner: gadget_owner.clone() });
//!
//!     gadget_owner.gadgets.borrow_mut().push(gadget1.downgrade());
//!     gadget_owner.gadgets.borrow_mut().push(gadget2.downgrade());
//!
//!     for gadget_opt in gadget_owner.gadgets.borrow().iter() {
//!         // Weak handles can't guarantee their value is still allocated, so
//!         // upgrade to a strong handle first.
//!         let gadget = gadget_opt.upgrade().unwrap();
//!         println!("Gadget {} owned by {}", gadget.id, gadget.owner.name);
//!     }
//!
//!     drop((gadget_owner, gadget1, gadget2));
//!     collect_cycles();
//! }
//! ```

#![deny(missing_docs)]

use core::cell::{Cell, UnsafeCell};
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::mem::{forget, ManuallyDrop};
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::alloc::{dealloc, Layout};

/// Tracing traits, types, and implementations for common standard library
/// types.
pub mod trace;
pub use trace::{Finalize, Trace, Tracer};

/// Implementation of cycle detection and collection.
pub mod collect;
pub use collect::{
    auto_collect, collect_cycles, number_of_roots_buffered, set_auto_collect,
    AccessGarbageCycleError, AutoCollect,
};

#[doc(hidden)]
pub mod cc_box_ptr;
use cc_box_ptr::CcBoxPtr;

#[cfg(feature = "derive")]
pub use cycle_rc_derive::{Finalize, Trace};

/// The color of a node, used by the collector's traversals to partition
/// suspected subgraphs into live and garbage regions. Only Black and Purple
/// can be observed outside a collection; the paper's extra colors for its
/// concurrent variants are not used here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[doc(hidden)]
pub enum Color {
    /// In use or free.
    Black,

    /// Possible member of a cycle.
    Gray,

    /// Member of a garbage cycle.
    White,

    /// Possible root of cycle.
    Purple,
}

/// The bookkeeping attached to every managed value: reference counts, the
/// collector's color, and buffering state.
#[derive(Debug)]
#[doc(hidden)]
pub struct CcBoxData {
    strong: Cell<usize>,
    weak: Cell<usize>,
    buffered: Cell<bool>,
    dropped: Cell<bool>,
    color: Cell<Color>,
}

impl CcBoxData {
    fn new() -> CcBoxData {
        // There is an implicit weak pointer owned by all the strong pointers,
        // which ensures that the weak destructor never frees the allocation
        // while the strong destructor is running, even if the weak pointer is
        // stored inside the strong one.
        CcBoxData {
            strong: Cell::new(1),
            weak: Cell::new(1),
            buffered: Cell::new(false),
            dropped: Cell::new(false),
            color: Cell::new(Color::Black),
        }
    }

    /// Get the strong count.
    #[inline]
    pub fn strong(&self) -> usize {
        self.strong.get()
    }

    /// Get the weak count, including the keepalive held on behalf of the
    /// strong handles.
    #[inline]
    pub fn weak(&self) -> usize {
        self.weak.get()
    }

    /// Get the current color.
    #[inline]
    pub fn color(&self) -> Color {
        self.color.get()
    }

    /// True while the node sits in the suspected roots buffer.
    #[inline]
    pub fn buffered(&self) -> bool {
        self.buffered.get()
    }

    /// True once the value has been destroyed.
    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.dropped.get()
    }

    /// A new external reference proves the node is not garbage.
    #[inline]
    pub(crate) fn increment(&self) {
        self.strong.set(self.strong.get() + 1);
        self.color.set(Color::Black);
    }

    // Raw count adjustments used by the collector's traversals. These do not
    // touch the color; trial deletion and its undo must not disturb the
    // Gray/White marking.

    #[inline]
    pub(crate) fn inc_strong(&self) {
        self.strong.set(self.strong.get() + 1);
    }

    #[inline]
    pub(crate) fn dec_strong(&self) {
        debug_assert!(self.strong.get() > 0);
        self.strong.set(self.strong.get() - 1);
    }

    #[inline]
    pub(crate) fn inc_weak(&self) {
        self.weak.set(self.weak.get() + 1);
    }

    #[inline]
    pub(crate) fn dec_weak(&self) {
        debug_assert!(self.weak.get() > 0);
        self.weak.set(self.weak.get() - 1);
    }

    #[inline]
    pub(crate) fn set_color(&self, color: Color) {
        self.color.set(color);
    }

    #[inline]
    pub(crate) fn set_buffered(&self, buffered: bool) {
        self.buffered.set(buffered);
    }

    #[inline]
    fn mark_dropped(&self) {
        debug_assert!(!self.dropped.get());
        self.dropped.set(true);
    }
}

// The bookkeeping leads the value so that handles created by `Cc::cast`,
// which view the value at a different type, agree on where it lives.
#[repr(C)]
struct CcBox<T: Trace> {
    data: CcBoxData,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T: Trace> CcBox<T> {
    #[inline]
    unsafe fn value(&self) -> &T {
        debug_assert!(!self.data.is_dropped());
        &**self.value.get()
    }
}

impl<T: Trace> CcBoxPtr for CcBox<T> {
    #[inline(always)]
    fn data(&self) -> &CcBoxData {
        &self.data
    }

    fn trace_value(&self, tracer: &mut Tracer<'_>) {
        if self.data.is_dropped() {
            return;
        }
        unsafe { self.value().trace(tracer) }
    }

    fn finalize_value(&self) {
        if self.data.is_dropped() {
            return;
        }
        unsafe { self.value().finalize() }
    }

    unsafe fn drop_value(&self) {
        if !self.data.is_dropped() {
            // Flip the flag first: a destructor that reaches back into this
            // value through a handle hits the dead-value panic instead of
            // reading a half-dropped value.
            self.data.mark_dropped();
            ManuallyDrop::drop(&mut *self.value.get());
        }
    }
}

/// A reference-counted pointer type over an immutable value with cycle
/// collection.
///
/// See the [module level documentation](./) for more details.
pub struct Cc<T: 'static + Trace> {
    // FIXME #12808: strange names to try to avoid interfering with field
    // accesses of the contained type via Deref
    _ptr: NonNull<CcBox<T>>,
}

impl<T: Trace> Cc<T> {
    /// Constructs a new `Cc<T>`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::Cc;
    ///
    /// let five = Cc::new(5);
    /// ```
    pub fn new(value: T) -> Cc<T> {
        unsafe {
            Cc {
                _ptr: NonNull::new_unchecked(Box::into_raw(Box::new(CcBox {
                    data: CcBoxData::new(),
                    value: UnsafeCell::new(ManuallyDrop::new(value)),
                }))),
            }
        }
    }

    /// Downgrades the `Cc<T>` to a `Weak<T>` handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::Cc;
    ///
    /// let five = Cc::new(5);
    ///
    /// let weak_five = five.downgrade();
    /// ```
    pub fn downgrade(&self) -> Weak<T> {
        self.data().inc_weak();
        Weak { _ptr: self._ptr }
    }

    /// Reinterpret this handle as a handle to a value of type `U`. Both
    /// handles share one node: they contribute to the same strong count and
    /// are traced, finalized, and collected together.
    ///
    /// # Safety
    ///
    /// `U` must be layout compatible with `T` (same size and alignment, with
    /// any contained handles at the same offsets), `U`'s `Trace` must report
    /// exactly the same outgoing edges as `T`'s, and `U`'s `Finalize` and
    /// `Drop` must be correct for the underlying value. Transparent wrapper
    /// types are the intended use.
    pub unsafe fn cast<U: Trace>(&self) -> Cc<U> {
        self.data().increment();
        Cc { _ptr: self._ptr.cast() }
    }

    #[inline(always)]
    fn data(&self) -> &CcBoxData {
        unsafe {
            // Safe to assume this here, as if it weren't true, we'd be
            // breaking the contract anyway. This allows the null check to be
            // elided in the destructor if we manipulated the reference count
            // in the same function.
            &self._ptr.as_ref().data
        }
    }

    #[inline]
    fn strong(&self) -> usize {
        self.data().strong()
    }

    #[inline]
    fn weak(&self) -> usize {
        self.data().weak()
    }

    #[inline]
    fn color(&self) -> Color {
        self.data().color()
    }

    #[inline]
    fn buffered(&self) -> bool {
        self.data().buffered()
    }

    unsafe fn release(&mut self) {
        debug_assert!(self.strong() == 0);

        self.data().set_color(Color::Black);

        // A dead node has no business in the suspected roots buffer; pull it
        // out so that the free queue becomes the record's only owner and the
        // value dies promptly even when no pass is coming.
        let ptr: NonNull<dyn CcBoxPtr> = self._ptr;
        if self.buffered() {
            self.data().set_buffered(false);
            collect::forget_root(ptr);
        }

        // The value is finalized and dropped once no traversal can be
        // holding pointers into the graph.
        collect::defer_free(ptr);
    }

    fn possible_root(&mut self) {
        debug_assert!(self.strong() > 0);

        if self.color() == Color::Purple {
            return;
        }

        self.data().set_color(Color::Purple);
        if self.buffered() {
            return;
        }

        self.data().set_buffered(true);
        let ptr: NonNull<dyn CcBoxPtr> = self._ptr;
        collect::add_root(ptr);
    }
}

impl<T: 'static + Trace> Cc<T> {
    /// Returns true if there are no other `Cc` or `Weak<T>` values that
    /// share the same inner value.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::{collect_cycles, Cc};
    /// {
    ///     let five = Cc::new(5);
    ///     assert_eq!(five.is_unique(), true);
    ///
    ///     let another_five = five.clone();
    ///     assert_eq!(five.is_unique(), false);
    ///     assert_eq!(another_five.is_unique(), false);
    /// }
    /// collect_cycles();
    /// ```
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.weak_count() == 0 && self.strong_count() == 1
    }

    /// Unwraps the contained value if the `Cc<T>` is unique.
    ///
    /// If the `Cc<T>` is not unique, an `Err` is returned with the same
    /// `Cc<T>`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::{collect_cycles, Cc};
    /// {
    ///     let x = Cc::new(3);
    ///     assert_eq!(x.try_unwrap(), Ok(3));
    ///
    ///     let x = Cc::new(4);
    ///     let _y = x.clone();
    ///     assert_eq!(x.try_unwrap(), Err(Cc::new(4)));
    /// }
    /// collect_cycles();
    /// ```
    #[inline]
    pub fn try_unwrap(self) -> Result<T, Cc<T>> {
        if !self.is_unique() {
            return Err(self);
        }
        unsafe {
            // A unique handle can still be buffered as a suspected root; the
            // buffer must not be left holding a pointer into a freed record.
            if self.buffered() {
                self.data().set_buffered(false);
                collect::forget_root(self._ptr);
            }
            // Copy the contained object.
            let val = ptr::read(&*self);
            // Destruct the box and skip our Drop. We can ignore the refcounts
            // because we know we're unique.
            dealloc(self._ptr.cast().as_ptr(), Layout::new::<CcBox<T>>());
            forget(self);
            Ok(val)
        }
    }

    /// Returns a mutable reference to the contained value if the `Cc<T>` is
    /// unique.
    ///
    /// Returns `None` if the `Cc<T>` is not unique.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::{collect_cycles, Cc};
    /// {
    ///     let mut x = Cc::new(3);
    ///     *x.get_mut().unwrap() = 4;
    ///     assert_eq!(*x, 4);
    ///
    ///     let _y = x.clone();
    ///     assert!(x.get_mut().is_none());
    /// }
    /// collect_cycles();
    /// ```
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.is_unique() {
            unsafe { Some(&mut **self._ptr.as_mut().value.get_mut()) }
        } else {
            None
        }
    }

    /// Get the number of strong references to this value.
    #[inline]
    pub fn strong_count(&self) -> usize {
        self.strong()
    }

    /// Get the number of weak references to this value, not counting the
    /// keepalive the strong handles share.
    #[inline]
    pub fn weak_count(&self) -> usize {
        self.weak() - 1
    }
}

impl<T: 'static + Clone + Trace> Cc<T> {
    /// Make a mutable reference from the given `Cc<T>`.
    ///
    /// This is also referred to as a copy-on-write operation because the
    /// inner data is cloned if the reference count is greater than one.
    #[inline]
    pub fn make_unique(&mut self) -> &mut T {
        if !self.is_unique() {
            *self = Cc::new((**self).clone())
        }
        // This unsafety is ok because we're guaranteed that the pointer
        // returned is the *only* pointer that will ever be returned to T. Our
        // reference count is guaranteed to be 1 at this point, and we
        // required the `Cc<T>` itself to be `mut`, so we're returning the
        // only possible reference to the inner value.
        unsafe { &mut **self._ptr.as_mut().value.get_mut() }
    }
}

impl<T: Trace> Cc<T> {
    /// Returns `true` if the two `Cc`s point to the same allocation (in a
    /// vein similar to [`ptr::eq`]).
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::{collect_cycles, Cc};
    /// {
    ///     let five = Cc::new(5);
    ///     let same_five = Cc::clone(&five);
    ///     let other_five = Cc::new(5);
    ///
    ///     assert!(Cc::ptr_eq(&five, &same_five));
    ///     assert!(!Cc::ptr_eq(&five, &other_five));
    /// }
    /// collect_cycles();
    /// ```
    ///
    /// [`ptr::eq`]: core::ptr::eq
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this._ptr.as_ptr() == other._ptr.as_ptr()
    }
}

impl<T: Trace> Deref for Cc<T> {
    type Target = T;

    /// Dereference the handle.
    ///
    /// # Panics
    ///
    /// Panics if the value has already been destroyed by the collector. This
    /// can only be observed from the `Drop` implementation of a value dying
    /// in the same garbage cycle; implement [`Finalize`] for teardown that
    /// needs to look at peers.
    #[inline(always)]
    fn deref(&self) -> &T {
        if self.data().is_dropped() {
            panic!("{}", collect::AccessGarbageCycleError);
        }
        unsafe { self._ptr.as_ref().value() }
    }
}

impl<T: Trace> Drop for Cc<T> {
    /// Drops the `Cc<T>`.
    ///
    /// This decrements the strong count. If the strong count reaches zero
    /// the value is finalized and dropped; otherwise the value is remembered
    /// as a suspected cycle root. Either way the collector gets a chance to
    /// run, subject to the current [`AutoCollect`] mode.
    fn drop(&mut self) {
        unsafe {
            if self.strong() > 0 {
                self.data().dec_strong();
                if self.strong() == 0 {
                    self.release();
                } else {
                    self.possible_root();
                }
            }
        }
        collect::collect_on_drop();
    }
}

impl<T: Trace> Clone for Cc<T> {
    /// Makes a clone of the `Cc<T>`: another pointer to the same value,
    /// incrementing the strong count.
    #[inline]
    fn clone(&self) -> Cc<T> {
        self.data().increment();
        Cc { _ptr: self._ptr }
    }
}

impl<T: Default + Trace> Default for Cc<T> {
    /// Creates a new `Cc<T>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Cc<T> {
        Cc::new(Default::default())
    }
}

impl<T: PartialEq + Trace> PartialEq for Cc<T> {
    /// Two `Cc<T>`s are equal if their inner values are equal.
    #[inline(always)]
    fn eq(&self, other: &Cc<T>) -> bool {
        **self == **other
    }
}

impl<T: Eq + Trace> Eq for Cc<T> {}

impl<T: PartialOrd + Trace> PartialOrd for Cc<T> {
    /// Partial comparison for two `Cc<T>`s, delegating to the inner values.
    #[inline(always)]
    fn partial_cmp(&self, other: &Cc<T>) -> Option<Ordering> {
        (**self).partial_cmp(&**other)
    }
}

impl<T: Ord + Trace> Ord for Cc<T> {
    /// Comparison for two `Cc<T>`s, delegating to the inner values.
    #[inline]
    fn cmp(&self, other: &Cc<T>) -> Ordering {
        (**self).cmp(&**other)
    }
}

impl<T: Hash + Trace> Hash for Cc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (**self).hash(state);
    }
}

impl<T: fmt::Display + Trace> fmt::Display for Cc<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: fmt::Debug + Trace> fmt::Debug for Cc<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Trace> fmt::Pointer for Cc<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self._ptr, f)
    }
}

impl<T: Trace> Finalize for Cc<T> {}

impl<T: Trace> Trace for Cc<T> {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        unsafe { tracer(self._ptr.as_ref()) }
    }
}

/// A weak version of `Cc<T>`.
///
/// Weak handles do not count when determining if the inner value should be
/// dropped, and they are invisible to the cycle collector; a cycle closed
/// only by a weak edge is not a cycle at all.
///
/// See the [module level documentation](./) for more.
pub struct Weak<T: Trace> {
    // FIXME #12808: strange names to try to avoid interfering with field
    // accesses of the contained type via Deref
    _ptr: NonNull<CcBox<T>>,
}

impl<T: Trace> Weak<T> {
    /// Upgrades the `Weak<T>` to a `Cc<T>`, if the value is still alive.
    ///
    /// Returns `None` if there were no strong handles left and the value has
    /// been destroyed.
    ///
    /// # Examples
    ///
    /// ```
    /// use cycle_rc::{collect_cycles, Cc};
    ///
    /// let five = Cc::new(5);
    ///
    /// let weak_five = five.downgrade();
    ///
    /// let strong_five: Option<Cc<_>> = weak_five.upgrade();
    /// assert!(strong_five.is_some());
    ///
    /// drop((five, strong_five));
    /// assert!(weak_five.upgrade().is_none());
    /// collect_cycles();
    /// ```
    pub fn upgrade(&self) -> Option<Cc<T>> {
        if self.strong() == 0 {
            None
        } else {
            self.data().increment();
            Some(Cc { _ptr: self._ptr })
        }
    }

    #[inline(always)]
    fn data(&self) -> &CcBoxData {
        unsafe {
            // We specifically avoid taking a reference to the whole CcBox
            // because it would cover the contained value, and there may
            // already be a mutable reference to that on the stack; we can be
            // called from the drop of a strong Cc<T> to the same node. The
            // standard library does the same sort of thing using `WeakInner`.
            &(*self._ptr.as_ptr()).data
        }
    }

    #[inline]
    fn strong(&self) -> usize {
        self.data().strong()
    }

    #[inline]
    fn weak(&self) -> usize {
        self.data().weak()
    }
}

impl<T: Trace> Drop for Weak<T> {
    /// Drops the `Weak<T>`, decrementing the weak count. The last weak
    /// handle to a dead value deallocates the node record.
    fn drop(&mut self) {
        unsafe {
            if self.weak() > 0 {
                self.data().dec_weak();
                // The weak count starts at one and only reaches zero once
                // the strong count has hit zero and the value has been
                // destroyed, so whoever takes the count to zero is the last
                // holder of the record.
                if self.weak() == 0 {
                    debug_assert!(self.data().is_dropped());
                    dealloc(self._ptr.cast().as_ptr(), Layout::new::<CcBox<T>>())
                }
            }
        }
    }
}

impl<T: Trace> Clone for Weak<T> {
    /// Makes a clone of the `Weak<T>`, incrementing the weak count.
    #[inline]
    fn clone(&self) -> Weak<T> {
        self.data().inc_weak();
        Weak { _ptr: self._ptr }
    }
}

impl<T: fmt::Debug + Trace> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(Weak)")
    }
}

impl<T: Trace> Finalize for Weak<T> {}

impl<T: Trace> Trace for Weak<T> {
    fn trace(&self, _tracer: &mut Tracer<'_>) {
        // Weak references should not be traced.
    }
}

pub(crate) unsafe fn deallocate(ptr: NonNull<dyn CcBoxPtr>) {
    dealloc(ptr.cast().as_ptr(), Layout::for_value(ptr.as_ref()));
}

#[cfg(test)]
mod tests {
    use super::{collect_cycles, Cc, Finalize, Trace, Tracer, Weak};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    static_assertions::assert_not_impl_any!(Cc<u32>: Send, Sync);
    static_assertions::assert_not_impl_any!(Weak<u32>: Send, Sync);

    // Tests copied from `Rc<T>`.

    #[test]
    fn test_clone() {
        {
            let x = Cc::new(RefCell::new(5));
            let y = x.clone();
            *x.borrow_mut() = 20;
            assert_eq!(*y.borrow(), 20);
        }
        collect_cycles();
    }

    #[test]
    fn test_simple() {
        let x = Cc::new(5);
        assert_eq!(*x, 5);
    }

    #[test]
    fn test_simple_clone() {
        {
            let x = Cc::new(5);
            let y = x.clone();
            assert_eq!(*x, 5);
            assert_eq!(*y, 5);
        }
        collect_cycles();
    }

    #[test]
    fn test_destructor() {
        let x: Cc<Box<_>> = Cc::new(Box::new(5));
        assert_eq!(**x, 5);
    }

    #[test]
    fn test_live() {
        {
            let x = Cc::new(5);
            let y = x.downgrade();
            assert!(y.upgrade().is_some());
        }
        collect_cycles();
    }

    #[test]
    fn test_dead() {
        let x = Cc::new(5);
        let y = x.downgrade();
        drop(x);
        assert!(y.upgrade().is_none());
    }

    #[test]
    fn weak_self_cyclic() {
        {
            struct Cycle {
                x: RefCell<Option<Weak<Cycle>>>,
            }

            impl Finalize for Cycle {}
            impl Trace for Cycle {
                fn trace(&self, _: &mut Tracer<'_>) {}
            }

            let a = Cc::new(Cycle {
                x: RefCell::new(None),
            });
            let b = a.clone().downgrade();
            *a.x.borrow_mut() = Some(b);
        }
        collect_cycles();
        // hopefully we don't double-free (or leak)...
    }

    #[test]
    fn is_unique() {
        {
            let x = Cc::new(3);
            assert!(x.is_unique());
            let y = x.clone();
            assert!(!x.is_unique());
            drop(y);
            assert!(x.is_unique());
            let w = x.downgrade();
            assert!(!x.is_unique());
            drop(w);
            assert!(x.is_unique());
        }
        collect_cycles();
    }

    #[test]
    fn test_strong_count() {
        {
            let a = Cc::new(0u32);
            assert!(a.strong_count() == 1);
            let w = a.downgrade();
            assert!(a.strong_count() == 1);
            let b = w.upgrade().expect("upgrade of live rc failed");
            assert!(b.strong_count() == 2);
            drop(w);
            drop(a);
            assert!(b.strong_count() == 1);
            let c = b.clone();
            assert!(b.strong_count() == 2);
            assert!(c.strong_count() == 2);
        }
        collect_cycles();
    }

    #[test]
    fn test_weak_count() {
        {
            let a = Cc::new(0u32);
            assert!(a.strong_count() == 1);
            assert!(a.weak_count() == 0);
            let w = a.downgrade();
            assert!(a.strong_count() == 1);
            assert!(a.weak_count() == 1);
            drop(w);
            assert!(a.strong_count() == 1);
            assert!(a.weak_count() == 0);
            let c = a.clone();
            assert!(a.strong_count() == 2);
            assert!(a.weak_count() == 0);
            drop(c);
        }
        collect_cycles();
    }

    #[test]
    fn try_unwrap() {
        {
            let x = Cc::new(3);
            assert_eq!(x.try_unwrap(), Ok(3));
            let x = Cc::new(4);
            let _y = x.clone();
            assert_eq!(x.try_unwrap(), Err(Cc::new(4)));
            let x = Cc::new(5);
            let _w = x.downgrade();
            assert_eq!(x.try_unwrap(), Err(Cc::new(5)));
        }
        collect_cycles();
    }

    #[test]
    fn try_unwrap_buffered() {
        use crate::{number_of_roots_buffered, set_auto_collect, AutoCollect};

        // A unique handle that is also a suspected root must leave the
        // buffer when its record is released.
        set_auto_collect(AutoCollect::Never);
        let x = Cc::new(7);
        drop(x.clone());
        assert_eq!(number_of_roots_buffered(), 1);
        assert_eq!(x.try_unwrap(), Ok(7));
        assert_eq!(number_of_roots_buffered(), 0);
        set_auto_collect(AutoCollect::Always);
    }

    #[test]
    fn get_mut() {
        {
            let mut x = Cc::new(3);
            *x.get_mut().unwrap() = 4;
            assert_eq!(*x, 4);
            let y = x.clone();
            assert!(x.get_mut().is_none());
            drop(y);
            assert!(x.get_mut().is_some());
            let _w = x.downgrade();
            assert!(x.get_mut().is_none());
        }
        collect_cycles();
    }

    #[test]
    fn test_cowrc_clone_make_unique() {
        {
            let mut cow0 = Cc::new(75);
            let mut cow1 = cow0.clone();
            let mut cow2 = cow1.clone();

            assert!(75 == *cow0.make_unique());
            assert!(75 == *cow1.make_unique());
            assert!(75 == *cow2.make_unique());

            *cow0.make_unique() += 1;
            *cow1.make_unique() += 2;
            *cow2.make_unique() += 3;

            assert!(76 == *cow0);
            assert!(77 == *cow1);
            assert!(78 == *cow2);

            // none should point to the same backing memory
            assert!(*cow0 != *cow1);
            assert!(*cow0 != *cow2);
            assert!(*cow1 != *cow2);
        }
        collect_cycles();
    }

    #[test]
    fn test_cowrc_clone_weak() {
        {
            let mut cow0 = Cc::new(75);
            let cow1_weak = cow0.downgrade();

            assert!(75 == *cow0);
            assert!(75 == *cow1_weak.upgrade().unwrap());

            *cow0.make_unique() += 1;

            assert!(76 == *cow0);
            assert!(cow1_weak.upgrade().is_none());
        }
        collect_cycles();
    }

    #[test]
    fn test_show() {
        let foo = Cc::new(75);
        assert_eq!(format!("{:?}", foo), "75");
    }

    #[test]
    fn test_map() {
        let mut map = std::collections::HashMap::new();

        map.insert("Foo".to_string(), 4);

        let x = Cc::new(map);
        assert_eq!(x.get("Foo"), Some(&4));
    }

    #[test]
    fn cast_shares_the_node() {
        #[repr(transparent)]
        struct Celsius(f64);

        impl Finalize for Celsius {}
        impl Trace for Celsius {
            fn trace(&self, _: &mut Tracer<'_>) {}
        }

        let raw = Cc::new(36.6f64);
        let typed: Cc<Celsius> = unsafe { raw.cast() };
        assert_eq!(raw.strong_count(), 2);
        assert_eq!(typed.0, 36.6);
        drop(raw);
        assert_eq!(typed.strong_count(), 1);
        collect_cycles();
    }

    #[test]
    fn list_cycle() {
        struct List(Vec<Cc<RefCell<List>>>);

        impl Finalize for List {}
        impl Trace for List {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.0.trace(tracer);
            }
        }

        {
            let a = Cc::new(RefCell::new(List(Vec::new())));
            let b = Cc::new(RefCell::new(List(Vec::new())));
            {
                let mut a = a.borrow_mut();
                a.0.push(b.clone());
            }
            {
                let mut b = b.borrow_mut();
                b.0.push(a.clone());
            }
        }
        collect_cycles();
    }

    #[test]
    fn test_retain_weak() {
        let retained_weak_a;
        {
            struct A {
                x: Cc<RefCell<Option<A>>>,
            }
            struct WeakA {
                _x: Weak<RefCell<Option<A>>>,
            }
            impl A {
                fn downgrade(this: &Self) -> WeakA {
                    WeakA {
                        _x: this.x.downgrade(),
                    }
                }
            }
            impl Clone for A {
                fn clone(&self) -> Self {
                    A { x: self.x.clone() }
                }
            }
            impl Finalize for A {}
            impl Trace for A {
                fn trace(&self, tracer: &mut Tracer<'_>) {
                    self.x.trace(tracer);
                }
            }
            let a = A {
                x: Cc::new(RefCell::new(None)),
            };
            *a.x.borrow_mut() = Some(a.clone());
            retained_weak_a = A::downgrade(&a);
        }
        collect_cycles();
        let _x = retained_weak_a;
    }

    #[test]
    fn test_no_leak_with_double_indirection() {
        struct S {
            ty: Cc<Cc<i32>>,
        }

        // If either of the drops below is missing, we don't get a leak
        let ty = Cc::new(5);
        drop(ty.clone());
        let s = S { ty: Cc::new(ty) };
        drop(s.ty.clone());

        std::mem::drop(s);
        collect_cycles();
    }

    #[test]
    fn test_double_visit_scan_black() {
        let count = Rc::new(Cell::new(0));
        struct A {
            count: Rc<Cell<i32>>,
            next_op: Cc<RefCell<Option<A>>>,
        }
        impl Clone for A {
            fn clone(&self) -> Self {
                self.count.set(self.count.get() + 1);
                A {
                    count: self.count.clone(),
                    next_op: self.next_op.clone(),
                }
            }
        }
        impl Finalize for A {}
        impl Trace for A {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.next_op.trace(tracer);
            }
        }
        impl A {
            fn new(count: Rc<Cell<i32>>, next_op: Option<A>) -> A {
                count.set(count.get() + 1);
                A {
                    count,
                    next_op: Cc::new(RefCell::new(next_op)),
                }
            }
        }
        impl Drop for A {
            fn drop(&mut self) {
                self.count.set(self.count.get() - 1);
            }
        }
        {
            let q;
            {
                let z = A::new(count.clone(), None);
                let y = A::new(count.clone(), Some(z.clone()));
                let x = A::new(count.clone(), Some(y));
                *z.next_op.borrow_mut() = Some(x.clone());
                q = x;
            }
            collect_cycles();
            *q.next_op.borrow_mut() = None;
        }
        collect_cycles();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn extra_free() {
        struct Env {
            pub closures: Vec<Cc<RefCell<Clos>>>,
            pub next: Option<Cc<Env>>,
        }
        impl Finalize for Env {}
        impl Trace for Env {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.closures.trace(tracer);
                self.next.trace(tracer);
            }
        }
        struct Clos {
            pub env: Cc<Env>,
        }
        impl Finalize for Clos {}
        impl Trace for Clos {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.env.trace(tracer);
            }
        }

        let live_env = {
            let base_env = Cc::new(Env {
                closures: vec![],
                next: None,
            });

            let env_a = Cc::new(Env {
                closures: vec![Cc::new(RefCell::new(Clos {
                    env: base_env.clone(),
                }))],
                next: Some(base_env.clone()),
            });

            let circular_env = Cc::new(Env {
                closures: vec![Cc::new(RefCell::new(Clos {
                    env: base_env.clone(),
                }))],
                next: Some(env_a.clone()),
            });
            circular_env.closures[0].replace(Clos {
                env: circular_env.clone(),
            });

            let live_env = Cc::new(Env {
                closures: vec![],
                next: Some(env_a.clone()),
            });

            drop(base_env); // don't need the stack ref
            drop(env_a); // don't need the stack ref
            collect_cycles();

            drop(circular_env); // cycle root
            collect_cycles();

            live_env
        };

        // Collecting the dead circular environment must not have freed the
        // environment chain that is still reachable from live_env.
        if let Some(a) = &live_env.next {
            assert_eq!(a.closures.len(), 1);
        }
        drop(live_env);
        collect_cycles();
    }

    #[test]
    fn weak_cycle() {
        type Owner = RefCell<Option<Weak<Gadget>>>;
        struct Gadget {
            owner: Cc<Owner>,
        }

        impl Finalize for Gadget {}
        impl Trace for Gadget {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.owner.trace(tracer);
            }
        }

        let gadget_owner = Cc::new(RefCell::new(None));
        let gadget = Cc::new(Gadget {
            owner: gadget_owner.clone(),
        });

        *gadget_owner.borrow_mut() = Some(gadget.downgrade());

        drop(gadget_owner);
        drop(gadget);
        collect_cycles();
    }
}
