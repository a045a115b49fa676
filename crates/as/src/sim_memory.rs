/* Copyright (c) 2023 Jeremy Davis (jeremydavis519@gmail.com)
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

//! A simulated flat physical memory, used only so tests can observe the *contents* of a frame
//! `kernel-frame` handed out. `kernel-frame` itself only ever does accounting -- it never models
//! what's actually stored at a physical address -- so there's nothing for the `Anonymous` and `Elf`
//! backends to write real bytes into outside of a test build. This module is that missing piece,
//! and only that: no production code path reads or writes it.

use alloc::collections::BTreeMap;

use frame::{PAGE_SIZE, Pfn};
use locks::Mutex;

static MEMORY: Mutex<BTreeMap<usize, [u8; PAGE_SIZE]>> = Mutex::new(BTreeMap::new());

fn with_page<R>(pfn: Pfn, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
    loop {
        if let Ok(mut mem) = MEMORY.try_lock() {
            let page = mem.entry(pfn.0).or_insert([0u8; PAGE_SIZE]);
            return f(page);
        }
    }
}

/// Ensures `pfn` reads as all zeroes. New frames default to zero already (see `with_page`), so
/// this mostly documents the call site; it's still correct to call on a frame this module has
/// already seen.
pub(crate) fn zero_frame(pfn: Pfn) {
    with_page(pfn, |page| *page = [0u8; PAGE_SIZE]);
}

/// Reads one byte at `offset` into the frame `pfn`.
pub(crate) fn read_byte(pfn: Pfn, offset: usize) -> u8 {
    with_page(pfn, |page| page[offset])
}

/// Writes one byte at `offset` into the frame `pfn`.
pub(crate) fn write_byte(pfn: Pfn, offset: usize, value: u8) {
    with_page(pfn, |page| page[offset] = value);
}

/// Overwrites the whole frame `pfn` with `page`.
pub(crate) fn write_page(pfn: Pfn, page: [u8; PAGE_SIZE]) {
    with_page(pfn, |p| *p = page);
}

/// Clears every simulated frame. Only meaningful between tests, which otherwise share this
/// module's state across every test function in the crate.
#[cfg(test)]
pub(crate) fn reset() {
    loop {
        if let Ok(mut mem) = MEMORY.try_lock() {
            mem.clear();
            return;
        }
    }
}
