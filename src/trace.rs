// Copyright 2015 The Rust Project Developers. See the COPYRIGHT file at the
// top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cc_box_ptr::CcBoxPtr;

/// A `Tracer` is a callback function that is invoked for each node owned by
/// an instance of something.
pub type Tracer<'a> = dyn FnMut(&(dyn CcBoxPtr + 'static)) + 'a;

/// A trait that informs the cycle collector how to find memory that is owned
/// by a `Trace` instance and managed by the cycle collector.
pub trait Trace: Finalize {
    /// Invoke the `Tracer` on each of the `Cc<T>`s owned by this `Trace`
    /// instance.
    ///
    /// Failing to invoke the tracer on every owned `Cc<T>` can lead to
    /// leaking cycles. Invoking it on anything else, or on the same handle
    /// twice, corrupts the reference counts. Weak handles must not be
    /// traced. Tracing must be purely structural; do not create, clone, or
    /// drop handles from inside `trace`.
    fn trace(&self, tracer: &mut Tracer<'_>);
}

/// An application-level teardown hook, run on every reclaimed value before
/// any reclaimed value is dropped.
///
/// When a garbage cycle is collected, first every member's `finalize` runs,
/// then every member's value is dropped. A finalizer may therefore still
/// read the values of its dying peers through the handles its own value
/// holds. It must not store a strong handle to a dying value anywhere that
/// survives the collection.
pub trait Finalize {
    /// Called exactly once per reclaimed value, before that value (or any of
    /// its dying peers) is dropped. The default does nothing.
    fn finalize(&self) {}
}

mod impls {
    use super::{Finalize, Trace, Tracer};

    /// Leaf types own no handles, so there is nothing to trace and nothing
    /// to finalize.
    macro_rules! leaf_impls {
        ($($ty:ty),* $(,)?) => {
            $(
                impl Finalize for $ty {}

                impl Trace for $ty {
                    #[inline]
                    fn trace(&self, _tracer: &mut Tracer<'_>) {}
                }
            )*
        }
    }

    leaf_impls! {
        (),
        bool,
        char,
        f32,
        f64,
        i8,
        i16,
        i32,
        i64,
        i128,
        isize,
        u8,
        u16,
        u32,
        u64,
        u128,
        usize,
        str,
        String,
        std::ffi::CStr,
        std::ffi::CString,
        std::ffi::OsStr,
        std::ffi::OsString,
        std::path::Path,
        std::path::PathBuf,
    }

    mod cell {
        use super::*;
        use std::cell;

        impl<T: Copy> Finalize for cell::Cell<T> {}

        impl<T: Copy + Trace> Trace for cell::Cell<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                self.get().trace(tracer);
            }
        }

        impl<T: ?Sized> Finalize for cell::RefCell<T> {}

        impl<T: Trace + ?Sized> Trace for cell::RefCell<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                // If the RefCell is currently mutably borrowed we assume
                // there is an outstanding reference to this cycle, so it is
                // ok not to trace through it. If the borrow gets leaked
                // somehow then we are going to leak the cycle.
                if let Ok(x) = self.try_borrow() {
                    x.trace(tracer);
                }
            }
        }
    }

    mod collections {
        use super::*;
        use std::collections;
        use std::hash;

        impl<K, V> Finalize for collections::BTreeMap<K, V> {}

        impl<K: Trace, V: Trace> Trace for collections::BTreeMap<K, V> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for (k, v) in self {
                    k.trace(tracer);
                    v.trace(tracer);
                }
            }
        }

        impl<K, V> Finalize for collections::HashMap<K, V> {}

        impl<K: Eq + hash::Hash + Trace, V: Trace> Trace for collections::HashMap<K, V> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for (k, v) in self {
                    k.trace(tracer);
                    v.trace(tracer);
                }
            }
        }

        impl<T> Finalize for collections::LinkedList<T> {}

        impl<T: Trace> Trace for collections::LinkedList<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for t in self {
                    t.trace(tracer);
                }
            }
        }

        impl<T> Finalize for collections::VecDeque<T> {}

        impl<T: Trace> Trace for collections::VecDeque<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for t in self {
                    t.trace(tracer);
                }
            }
        }
    }

    mod vec {
        use super::*;

        impl<T> Finalize for Vec<T> {}

        impl<T: Trace> Trace for Vec<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for t in self {
                    t.trace(tracer);
                }
            }
        }

        impl<T, const N: usize> Finalize for [T; N] {}

        impl<T: Trace, const N: usize> Trace for [T; N] {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for t in self {
                    t.trace(tracer);
                }
            }
        }

        impl<T> Finalize for [T] {}

        impl<T: Trace> Trace for [T] {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                for t in self {
                    t.trace(tracer);
                }
            }
        }
    }

    mod boxed {
        use super::*;

        impl<T: ?Sized> Finalize for Box<T> {}

        impl<T: Trace + ?Sized> Trace for Box<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                (**self).trace(tracer);
            }
        }
    }

    mod option {
        use super::*;

        impl<T> Finalize for Option<T> {}

        impl<T: Trace> Trace for Option<T> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                if let Some(ref t) = *self {
                    t.trace(tracer);
                }
            }
        }
    }

    mod result {
        use super::*;

        impl<T, U> Finalize for Result<T, U> {}

        impl<T: Trace, U: Trace> Trace for Result<T, U> {
            fn trace(&self, tracer: &mut Tracer<'_>) {
                match *self {
                    Ok(ref t) => t.trace(tracer),
                    Err(ref u) => u.trace(tracer),
                }
            }
        }
    }

    mod shared {
        use super::*;
        use std::rc;
        use std::sync;

        // Shared-ownership containers are not traced. A single handle stored
        // behind an `Rc` contributes one strong edge no matter how many
        // managed values hold a clone of the `Rc`, so tracing through it
        // from every owner would visit that edge more than once.

        impl<T: ?Sized> Finalize for rc::Rc<T> {}

        impl<T: ?Sized> Trace for rc::Rc<T> {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }

        impl<T: ?Sized> Finalize for rc::Weak<T> {}

        impl<T: ?Sized> Trace for rc::Weak<T> {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }

        impl<T: ?Sized> Finalize for sync::Arc<T> {}

        impl<T: ?Sized> Trace for sync::Arc<T> {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }

        impl<T: ?Sized> Finalize for sync::Mutex<T> {}

        impl<T: ?Sized> Trace for sync::Mutex<T> {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }

        impl<T: ?Sized> Finalize for sync::RwLock<T> {}

        impl<T: ?Sized> Trace for sync::RwLock<T> {
            fn trace(&self, _tracer: &mut Tracer<'_>) {}
        }
    }
}
