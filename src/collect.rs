// Copyright 2015 The Rust Project Developers. See the COPYRIGHT file at the
// top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cycle detection and collection.
//!
//! The algorithm is the synchronous collector from "A Pure Reference
//! Counting Garbage Collector" (Bacon, Attanasio, Rajan, Smith; 2001):
//! decrements that leave a non-zero strong count buffer the node as a
//! suspected cycle root, and a collection pass runs three traversals over
//! the buffered subgraphs (`mark_roots`, `scan_roots`, `collect_roots`)
//! before destroying whatever turned out to be garbage.
//!
//! All state is per thread. Handles cannot be sent across threads, so each
//! thread owns an independent roots buffer and runs its own passes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;

use log::debug;
use thiserror::Error;

use crate::cc_box_ptr::{self, CcBoxPtr};
use crate::Color;

/// The error used as a panic message when user code dereferences a `Cc<T>`
/// whose value has already been destroyed by the collector. This is only
/// reachable from `Drop` implementations of values dying in the same garbage
/// cycle; use `Finalize` for teardown that needs to look at peers.
#[derive(Debug, Error)]
#[error(
    "attempt to access a Cc<T> value that has been reclaimed as part of a \
     garbage cycle; don't touch Cc<T> handles from Drop implementations, \
     implement Finalize instead"
)]
pub struct AccessGarbageCycleError;

/// Controls when a thread's collector runs a cycle collection pass of its
/// own accord. Configure it with [`set_auto_collect`].
///
/// Regardless of the mode, values whose strong count reaches zero through
/// plain reference counting are finalized and dropped promptly when a handle
/// is dropped; the mode only controls the cycle hunt over the suspected
/// roots buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AutoCollect {
    /// Run a pass on every strong handle drop that leaves suspected roots
    /// buffered. This is the default; it cannot leak cycles but does the
    /// most tracing work.
    Always,
    /// Run a pass on a strong handle drop once at least this many suspected
    /// roots are buffered.
    Threshold(usize),
    /// Never collect automatically. Cycles are reclaimed only by explicit
    /// [`collect_cycles`] calls.
    Never,
}

struct CollectContext {
    /// Suspected cycle roots. A node appears here exactly once, iff its
    /// `buffered` flag is set.
    roots: RefCell<Vec<NonNull<dyn CcBoxPtr>>>,
    /// Nodes whose strong count reached zero, waiting to be finalized,
    /// dropped, and released. Destroying them on the spot would invalidate
    /// pointers held by an in-progress traversal, so everything funnels
    /// through this queue.
    to_be_freed: RefCell<VecDeque<NonNull<dyn CcBoxPtr>>>,
    /// Reentrancy guard. Handle drops from inside finalizers and destructors
    /// enqueue new work but must not start a nested pass.
    collecting: Cell<bool>,
    auto_collect: Cell<AutoCollect>,
}

thread_local!(static CONTEXT: CollectContext = CollectContext {
    roots: RefCell::new(Vec::new()),
    to_be_freed: RefCell::new(VecDeque::new()),
    collecting: Cell::new(false),
    auto_collect: Cell::new(AutoCollect::Always),
});

#[doc(hidden)]
pub fn add_root(box_ptr: NonNull<dyn CcBoxPtr>) {
    // Silently dropping the root on a dead TLS context only happens during
    // thread teardown, where leaking is the best remaining option.
    let _ = CONTEXT.try_with(|ctx| {
        let mut roots = ctx.roots.borrow_mut();
        debug_assert!(
            !roots
                .iter()
                .any(|r| r.as_ptr() as *mut () == box_ptr.as_ptr() as *mut ()),
            "a node was buffered as a suspected root twice"
        );
        roots.push(box_ptr);
    });
}

/// Queue a node whose strong count reached zero for finalize + drop + record
/// release once no traversal is walking the heap.
pub(crate) fn defer_free(box_ptr: NonNull<dyn CcBoxPtr>) {
    let _ = CONTEXT.try_with(|ctx| {
        ctx.to_be_freed.borrow_mut().push_back(box_ptr);
    });
}

/// Remove a node from the suspected roots buffer, if present. Used when a
/// unique handle's record is about to be released out from under the
/// collector.
pub(crate) fn forget_root(box_ptr: NonNull<dyn CcBoxPtr>) {
    let _ = CONTEXT.try_with(|ctx| {
        ctx.roots
            .borrow_mut()
            .retain(|r| r.as_ptr() as *mut () != box_ptr.as_ptr() as *mut ());
    });
}

/// Return the number of potential cycle roots currently buffered for cycle
/// collection.
///
/// Whenever a `Cc<T>`'s reference count is decremented to a non-zero value,
/// it has the possibility of being the root of some cycle that is no longer
/// live and can now be reclaimed. These possible roots are buffered for
/// cycle detection at a later point in time. With automatic collection
/// disabled this lets library users pick a convenient moment to trace, for
/// example once the buffer crosses some threshold.
///
/// ```rust
/// use cycle_rc::{collect_cycles, number_of_roots_buffered,
///                set_auto_collect, AutoCollect, Cc, Finalize, Trace, Tracer};
/// use std::cell::RefCell;
///
/// struct Gadget {
///     other: RefCell<Option<Cc<Gadget>>>,
/// }
///
/// impl Finalize for Gadget {}
/// impl Trace for Gadget {
///     fn trace(&self, tracer: &mut Tracer<'_>) {
///         self.other.trace(tracer);
///     }
/// }
///
/// set_auto_collect(AutoCollect::Never);
/// assert_eq!(number_of_roots_buffered(), 0);
///
/// {
///     let a = Cc::new(Gadget { other: RefCell::new(None) });
///     let b = Cc::new(Gadget { other: RefCell::new(Some(a.clone())) });
///     *a.other.borrow_mut() = Some(b.clone());
/// }
///
/// // The two gadgets are unreachable, but their cycle keeps both strong
/// // counts above zero, so both were buffered as suspected roots.
/// assert_eq!(number_of_roots_buffered(), 2);
///
/// collect_cycles();
/// assert_eq!(number_of_roots_buffered(), 0);
/// set_auto_collect(AutoCollect::Always);
/// ```
pub fn number_of_roots_buffered() -> usize {
    CONTEXT.with(|ctx| ctx.roots.borrow().len())
}

/// Get the current thread's automatic collection mode.
pub fn auto_collect() -> AutoCollect {
    CONTEXT.with(|ctx| ctx.auto_collect.get())
}

/// Set the current thread's automatic collection mode. See [`AutoCollect`].
pub fn set_auto_collect(mode: AutoCollect) {
    CONTEXT.with(|ctx| ctx.auto_collect.set(mode));
}

/// Invoke cycle collection for all `Cc<T>`s on this thread.
///
/// This happens in three phases over the buffered suspected roots:
///
/// 1. `mark_roots`: trial deletion. We traverse the subgraphs hanging off
///    the suspected roots, marking them Gray and subtracting the strong
///    count contributed by every internal edge as we go. Afterwards each
///    node's strong count holds only the references external to the
///    traversed region.
///
/// 2. `scan_roots`: a second traversal colors nodes that still have a
///    non-zero strong count Black and restores the counts subtracted in
///    phase 1 for everything reachable from them; what remains at zero is
///    provisionally dead and colored White.
///
/// 3. `collect_roots`: the buffer is emptied and every White node is
///    queued for destruction.
///
/// Queued victims are then destroyed: first every finalizer runs, then every
/// value is dropped, then the node records are released. Calling this from
/// inside a finalizer, a destructor, or a trace is a no-op; the work is
/// picked up by the collection already on the stack.
pub fn collect_cycles() {
    CONTEXT.with(run_collection);
}

/// The strong-handle drop hook: run a pass if the automatic collection mode
/// asks for one, and flush pending non-cyclic deaths either way.
pub(crate) fn collect_on_drop() {
    let _ = CONTEXT.try_with(|ctx| {
        if ctx.collecting.get() {
            return;
        }

        let run_pass = match ctx.auto_collect.get() {
            AutoCollect::Always => !ctx.roots.borrow().is_empty(),
            AutoCollect::Threshold(n) => ctx.roots.borrow().len() >= n,
            AutoCollect::Never => false,
        };

        if run_pass {
            run_collection(ctx);
        } else if !ctx.to_be_freed.borrow().is_empty() {
            ctx.collecting.set(true);
            drain_free_queue(ctx);
            ctx.collecting.set(false);
        }
    });
}

fn run_collection(ctx: &CollectContext) {
    if ctx.collecting.get() {
        return;
    }
    if ctx.roots.borrow().is_empty() && ctx.to_be_freed.borrow().is_empty() {
        return;
    }

    ctx.collecting.set(true);
    let examined = ctx.roots.borrow().len();

    mark_roots(ctx);
    scan_roots(ctx);
    collect_roots(ctx);
    let reclaimed = drain_free_queue(ctx);

    ctx.collecting.set(false);

    debug!(
        "cycle collection: examined {} suspected roots, reclaimed {} nodes",
        examined, reclaimed
    );
}

/// Consider every node that has been buffered since the last collection. If
/// the node is still Purple, then the last operation on it was a decrement
/// of its strong count and it is potentially the root of a garbage cycle, so
/// we mark its subgraph Gray, subtracting internal edges as we go. Anything
/// else has been touched since it was buffered and leaves the buffer; if its
/// strong count already reached zero it was only being kept for us and is
/// queued for destruction.
fn mark_roots(ctx: &CollectContext) {
    let old_roots: Vec<_> = ctx.roots.borrow_mut().drain(..).collect();
    let mut new_roots = Vec::with_capacity(old_roots.len());

    for s in old_roots {
        let node = unsafe { s.as_ref() };
        if node.color() == Color::Purple && node.strong() > 0 {
            mark_gray(node);
            new_roots.push(s);
        } else {
            node.data().set_buffered(false);
            if node.color() == Color::Black && node.strong() == 0 {
                ctx.to_be_freed.borrow_mut().push_back(s);
            }
        }
    }

    *ctx.roots.borrow_mut() = new_roots;
}

fn mark_gray(s: &(dyn CcBoxPtr + 'static)) {
    if s.color() == Color::Gray {
        return;
    }

    s.data().set_color(Color::Gray);
    s.trace_value(&mut |t| {
        debug_assert!(
            t.strong() > 0,
            "every traced edge must be reflected in the target's strong count"
        );
        t.data().dec_strong();
        mark_gray(t);
    });
}

/// The second traversal, after marking. Nodes the trial deletion left with a
/// strong count of zero are only referenced from within the traversed
/// region; color them White. Nodes with external references get their
/// subgraphs restored to Black, undoing the trial deletion.
fn scan_roots(ctx: &CollectContext) {
    let roots: Vec<_> = ctx.roots.borrow().clone();
    for s in roots {
        scan(unsafe { s.as_ref() });
    }
}

fn scan(s: &(dyn CcBoxPtr + 'static)) {
    if s.color() != Color::Gray {
        return;
    }

    if s.strong() > 0 {
        scan_black(s);
    } else {
        s.data().set_color(Color::White);
        s.trace_value(&mut |t| {
            scan(t);
        });
    }
}

fn scan_black(s: &(dyn CcBoxPtr + 'static)) {
    s.data().set_color(Color::Black);
    s.trace_value(&mut |t| {
        t.data().inc_strong();
        if t.color() != Color::Black {
            scan_black(t);
        }
    });
}

/// Empty the roots buffer, queueing every member of a dead (White) cycle for
/// destruction. A White node that something re-buffered stays where it is
/// and is picked up by the next collection's `mark_roots`.
fn collect_roots(ctx: &CollectContext) {
    let roots: Vec<_> = ctx.roots.borrow_mut().drain(..).collect();
    for s in roots {
        let node = unsafe { s.as_ref() };
        node.data().set_buffered(false);
        collect_white(ctx, node);
    }
}

fn collect_white(ctx: &CollectContext, s: &(dyn CcBoxPtr + 'static)) {
    if s.color() == Color::White && !s.buffered() {
        s.data().set_color(Color::Black);
        s.trace_value(&mut |t| {
            collect_white(ctx, t);
        });
        // Trial deletion already subtracted every edge this value holds, and
        // dropping the value will decrement each child once more. Children
        // that are still live get a balancing increment now; dying peers sit
        // at zero, where the handle drop is a no-op.
        s.trace_value(&mut |t| {
            if t.strong() > 0 {
                t.data().inc_strong();
            }
        });
        ctx.to_be_freed.borrow_mut().push_back(NonNull::from(s));
    }
}

/// Destroy everything queued on `to_be_freed`.
///
/// Within a batch, every finalizer runs before any value is dropped, so
/// finalizers can still read the values of peers dying alongside them. The
/// records are released last: dying values hold handles into each other, and
/// dropping a handle reads its record's counters, so a record must stay
/// allocated until the whole batch has been dropped.
///
/// Dropping a batch can release further nodes (a dying value was the last
/// owner of some acyclic structure); those land back on the queue and are
/// destroyed by the next round of the loop instead of recursively.
fn drain_free_queue(ctx: &CollectContext) -> usize {
    debug_assert!(ctx.collecting.get());
    let mut reclaimed = 0;

    loop {
        let batch: Vec<_> = ctx.to_be_freed.borrow_mut().drain(..).collect();
        if batch.is_empty() {
            break;
        }
        reclaimed += batch.len();

        for s in &batch {
            unsafe { s.as_ref().finalize_value() };
        }
        for s in &batch {
            unsafe { s.as_ref().drop_value() };
        }
        for s in &batch {
            unsafe { cc_box_ptr::free(*s) };
        }
    }

    reclaimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cc, Finalize, Trace};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct Linked {
        next: RefCell<Option<Cc<Linked>>>,
        alive: Rc<Cell<i32>>,
    }

    impl Linked {
        fn new(alive: &Rc<Cell<i32>>) -> Cc<Linked> {
            alive.set(alive.get() + 1);
            Cc::new(Linked {
                next: RefCell::new(None),
                alive: alive.clone(),
            })
        }
    }

    impl Finalize for Linked {}

    impl Trace for Linked {
        fn trace(&self, tracer: &mut crate::Tracer<'_>) {
            self.next.trace(tracer);
        }
    }

    impl Drop for Linked {
        fn drop(&mut self) {
            self.alive.set(self.alive.get() - 1);
        }
    }

    #[test]
    fn suspected_root_without_cycle_is_retained() {
        let alive = Rc::new(Cell::new(0));
        let a = Linked::new(&alive);
        let b = Linked::new(&alive);
        *a.next.borrow_mut() = Some(b.clone());

        // Dropping our handle to b leaves it purple with a's edge keeping it
        // alive; collection must decide it is not garbage.
        drop(b);
        collect_cycles();
        assert_eq!(alive.get(), 2);
        assert_eq!(number_of_roots_buffered(), 0);

        drop(a);
        collect_cycles();
        assert_eq!(alive.get(), 0);
    }

    #[test]
    fn explicit_collection_with_auto_collect_off() {
        let alive = Rc::new(Cell::new(0));
        set_auto_collect(AutoCollect::Never);

        {
            let a = Linked::new(&alive);
            let b = Linked::new(&alive);
            *a.next.borrow_mut() = Some(b.clone());
            *b.next.borrow_mut() = Some(a.clone());
        }

        // The pair is cyclic garbage, but nothing collects until asked.
        assert_eq!(alive.get(), 2);
        assert!(number_of_roots_buffered() > 0);

        collect_cycles();
        assert_eq!(alive.get(), 0);
        assert_eq!(number_of_roots_buffered(), 0);

        set_auto_collect(AutoCollect::Always);
    }

    #[test]
    fn threshold_mode_waits_for_enough_roots() {
        let alive = Rc::new(Cell::new(0));
        set_auto_collect(AutoCollect::Threshold(5));

        let make_dead_pair = || {
            let a = Linked::new(&alive);
            let b = Linked::new(&alive);
            *a.next.borrow_mut() = Some(b.clone());
            *b.next.borrow_mut() = Some(a.clone());
        };

        make_dead_pair();
        make_dead_pair();
        // Four suspected roots buffered; under the threshold, so both dead
        // pairs are still uncollected.
        assert_eq!(number_of_roots_buffered(), 4);
        assert_eq!(alive.get(), 4);

        // The drop that buffers the fifth root triggers a pass. It runs
        // while the third pair is still externally reachable, so only the
        // first two pairs are reclaimed by it.
        make_dead_pair();
        assert_eq!(alive.get(), 2);

        collect_cycles();
        assert_eq!(alive.get(), 0);
        assert_eq!(number_of_roots_buffered(), 0);

        set_auto_collect(AutoCollect::Always);
    }

    #[test]
    fn acyclic_deaths_flush_even_with_auto_collect_off() {
        let alive = Rc::new(Cell::new(0));
        set_auto_collect(AutoCollect::Never);

        let a = Linked::new(&alive);
        let b = Linked::new(&alive);
        *a.next.borrow_mut() = Some(b.clone());
        drop(b);
        drop(a);

        // No cycle was involved, so plain reference counting destroyed both
        // values without a pass.
        assert_eq!(alive.get(), 0);

        collect_cycles();
        set_auto_collect(AutoCollect::Always);
    }
}
