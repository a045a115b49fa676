/* Copyright (c) 2018-2021 Jeremy Davis (jeremydavis519@gmail.com)
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

//! A single loadable piece of an ELF image, independent of how it was parsed.

/// What kind of segment this is. Only `PT_LOAD` entries ever become a `Segment`; every other
/// program header type (`PT_INTERP`, `PT_DYNAMIC`, `PT_NOTE`, ...) is skipped while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    /// Corresponds to `PT_LOAD`.
    Load
}

bitflags! {
    /// Permissions an ELF backend area should carry for a segment, taken directly from the
    /// program header's `p_flags` field (`PF_X`, `PF_W`, `PF_R` share these exact bit values).
    pub struct SegmentFlags: u32 {
        /// `PF_X`: the segment may be executed.
        const EXECUTABLE = 0x1;
        /// `PF_W`: the segment may be written.
        const WRITABLE   = 0x2;
        /// `PF_R`: the segment may be read.
        const READABLE   = 0x4;
    }
}

/// One `PT_LOAD` program header, describing a contiguous range of an address space to be
/// populated from (a prefix of) the ELF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Always `SegmentType::Load` today; kept as a field so a future segment type doesn't need a
    /// parallel array.
    pub seg_type: SegmentType,
    /// The access permissions the mapped area should have.
    pub flags: SegmentFlags,
    /// Byte offset of the segment's data within the ELF file.
    pub file_offset: u32,
    /// Virtual address the segment is to be loaded at.
    pub vaddr: u32,
    /// Number of bytes to copy from the file.
    pub file_sz: u32,
    /// Number of bytes the segment occupies in memory. Anything beyond `file_sz` (typically a
    /// `.bss` section) must be zero-filled rather than read from the file.
    pub mem_sz: u32
}

impl Segment {
    /// The open range of virtual addresses this segment occupies.
    pub fn vaddr_range(&self) -> core::ops::Range<u32> {
        self.vaddr .. self.vaddr.wrapping_add(self.mem_sz)
    }

    /// Whether `addr` falls inside this segment's mapped range.
    pub fn contains(&self, addr: u32) -> bool {
        self.vaddr_range().contains(&addr)
    }
}
