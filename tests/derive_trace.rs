//! Exercises the derive macros through the public API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cycle_rc::{collect_cycles, Cc};
use cycle_rc_derive::{Finalize, Trace};

/// Deliberately implements neither `Trace` nor `Finalize`; it only compiles
/// inside a managed type because the field carrying it is ignored.
struct WindowHandle {
    _raw: u64,
}

#[derive(Trace, Finalize)]
struct Gadget {
    next: RefCell<Option<Cc<Gadget>>>,
    #[ignore_trace]
    window: WindowHandle,
    alive: Rc<Cell<i32>>,
}

impl Gadget {
    fn new(alive: &Rc<Cell<i32>>) -> Cc<Gadget> {
        alive.set(alive.get() + 1);
        Cc::new(Gadget {
            next: RefCell::new(None),
            window: WindowHandle { _raw: 0 },
            alive: alive.clone(),
        })
    }
}

impl Drop for Gadget {
    fn drop(&mut self) {
        self.alive.set(self.alive.get() - 1);
    }
}

#[test]
fn derived_trace_reclaims_a_cycle() {
    let alive = Rc::new(Cell::new(0));

    {
        let a = Gadget::new(&alive);
        let b = Gadget::new(&alive);
        *a.next.borrow_mut() = Some(b.clone());
        *b.next.borrow_mut() = Some(a.clone());
    }

    assert_eq!(alive.get(), 0);
    collect_cycles();
}

#[derive(Trace, Finalize)]
struct Wrapper<T> {
    inner: T,
}

#[test]
fn derived_trace_on_generic_struct() {
    let plain = Cc::new(Wrapper { inner: 5i32 });
    assert_eq!(plain.inner, 5);

    // A handle inside the wrapper is traced through the derived impl.
    let nested = Cc::new(Wrapper {
        inner: Cc::new(String::from("inner")),
    });
    drop(nested.clone());
    drop(nested);
    collect_cycles();
}

#[derive(Trace, Finalize)]
enum Slot {
    Empty,
    Full(Cc<Wrapper<i32>>),
}

#[test]
fn derived_trace_on_enum() {
    let empty = Cc::new(Slot::Empty);
    let full = Cc::new(Slot::Full(Cc::new(Wrapper { inner: 9 })));

    if let Slot::Full(ref inner) = *full {
        assert_eq!(inner.inner, 9);
    } else {
        panic!("expected the full variant");
    }

    drop(full.clone());
    drop((empty, full));
    collect_cycles();
}
