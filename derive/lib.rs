//! Derive macros for `cycle_rc`: `#[derive(Trace)]` generates a `trace`
//! implementation that visits every field, and `#[derive(Finalize)]`
//! generates the default empty finalizer.
//!
//! Fields whose type is not managed can be skipped with `#[ignore_trace]`:
//!
//! ```ignore
//! #[derive(Trace, Finalize)]
//! struct Gadget {
//!     owner: Cc<Owner>,
//!     #[ignore_trace]
//!     window_handle: RawHandle,
//! }
//! ```

use quote::quote;
use synstructure::{decl_derive, AddBounds, Structure};

decl_derive!([Trace, attributes(ignore_trace)] => derive_trace);
decl_derive!([Finalize] => derive_finalize);

fn derive_trace(mut s: Structure<'_>) -> proc_macro2::TokenStream {
    s.filter(|binding| {
        !binding
            .ast()
            .attrs
            .iter()
            .any(|attr| attr.path().is_ident("ignore_trace"))
    });
    s.add_bounds(AddBounds::Generics);

    let trace_body = s.each(|binding| {
        quote! {
            ::cycle_rc::Trace::trace(#binding, tracer);
        }
    });

    s.gen_impl(quote! {
        gen impl ::cycle_rc::Trace for @Self {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&self, tracer: &mut ::cycle_rc::Tracer<'_>) {
                match *self {
                    #trace_body
                }
            }
        }
    })
}

fn derive_finalize(mut s: Structure<'_>) -> proc_macro2::TokenStream {
    s.add_bounds(AddBounds::None);
    s.gen_impl(quote! {
        gen impl ::cycle_rc::Finalize for @Self {}
    })
}
