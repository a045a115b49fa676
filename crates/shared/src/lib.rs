/* Copyright (c) 2017-2021 Jeremy Davis (jeremydavis519@gmail.com)
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy of this software
 * and associated documentation files (the "Software"), to deal in the Software without restriction,
 * including without limitation the rights to use, copy, modify, merge, publish, distribute,
 * sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all copies or
 * substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
 * NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
 * NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
 * DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
 */

//! Helper functions, macros, and types shared by the rest of the kernel. It's basically a
//! stripped-down and specialized kind of standard library, so it can't depend on anything else in
//! the kernel and stays pretty self-contained.
//!
//! The low-level per-architecture primitives this crate used to carry directly (wait-for-event,
//! interrupt masking, CPU enumeration) now live behind the `Arch` trait in `kernel-arch`, which is
//! the single seam the rest of the kernel goes through for architecture-specific behavior.

#![no_std]

#![feature(unsize)]
#![feature(coerce_unsized)]

#![deny(warnings, missing_docs)]

extern crate alloc;

#[macro_use] extern crate macros_unreachable;

pub mod ffi;
#[macro_use] pub mod once;
pub mod static_array;
pub mod sync;

lazy_static! {
    unsafe {
        /// The current version of the kernel (defined in Cargo.toml)
        pub static ref KERNEL_VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");
        /// The homepage for the kernel's documentation (defined in Cargo.toml)
        pub static ref KERNEL_HOMEPAGE: Option<&'static str> = option_env!("CARGO_PKG_HOMEPAGE");
    }
}

/// Applies the same attributes to any number of items in order to reduce boilerplate code size.
#[macro_export]
macro_rules! attr {
    // Internal rules
    ( @attr_tuple $attrs:tt $($item:item)+ ) => { $(attr!(@expand $attrs $item);)+ };
    ( @expand ( $(#[$attr:meta]),+ ) $item:item ) => { $(#[$attr])+ $item };

    // The rule that should be used externally
    ( $(#[$attr:meta])+ $($item:item)+ ) => { attr!(@attr_tuple ($(#[$attr]),+) $($item)+); };
}
