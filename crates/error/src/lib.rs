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

//! An extremely barebones implementation of some of std::error from the Rust standard library.

#![no_std]

#![deny(warnings, missing_docs)]
#![feature(allocator_api)]

extern crate alloc;

use {
    alloc::{
        alloc::AllocError,
        string::FromUtf8Error
    },
    core::fmt::{Debug, Display}
};

/// Base functionality for all errors in Rust.
pub trait Error: Debug + Display {
    // The `description` and `cause` functions are both deprecated in the Rust standard library.

    /// Indicates the error that led to this one, if any.
    fn source(&self) -> Option<&'static dyn Error> {
        None
    }

    // TODO: Add the `backtrace` method and the `Backtrace` type.
}

impl Error for AllocError {}
impl Error for FromUtf8Error {}

/// The error kinds that any kernel operation can report. These are protocol-level results, not
/// debugging aids; every syscall-reachable failure is one of these, and user-visible text (for
/// logging or for returning a message to a fault handler) is produced separately, e.g. by `i18n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum KernelError {
    /// Memory exhausted. Non-atomic callers are retried after a reclaim pass; atomic callers see
    /// this directly.
    NoMem,
    /// Malformed argument. Always returned to the caller; never a panic.
    Inval,
    /// The target (phone, handle, area, ...) does not exist.
    NoEnt,
    /// A quota was exceeded (phone slots, in-flight async calls, IPC queue depth, ...).
    Limit,
    /// The peer closed its end (a phone was hung up).
    Hangup,
    /// An `INTERRUPTIBLE` sleep was interrupted by a signal.
    Intr,
    /// A deadline passed before the operation completed.
    Timeout,
    /// The payload was larger than the negotiated buffer.
    Overflow,
    /// The operation is not supported by this backend (e.g. resizing a physical area).
    NotSup
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(match *self {
            Self::NoMem => "out of memory",
            Self::Inval => "invalid argument",
            Self::NoEnt => "no such entity",
            Self::Limit => "quota exceeded",
            Self::Hangup => "peer hung up",
            Self::Intr => "interrupted",
            Self::Timeout => "timed out",
            Self::Overflow => "payload too large",
            Self::NotSup => "operation not supported"
        })
    }
}

impl Error for KernelError {}

/// The result type used throughout the kernel for fallible operations. `OK` from spec.md's error
/// table is just `Ok(value)`.
pub type KernelResult<T> = Result<T, KernelError>;
