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

//! The error type returned by a failed ELF parse.
//!
//! `i18n::Text` borrows some of its fields, which is fine for a value built and displayed in the
//! same stack frame but awkward for something that has to outlive the byte slice it describes.
//! `ElfError` stores owned copies of the same data and reconstructs the matching `Text` variant
//! only inside `Display::fmt`, so callers get the exact same message without a lifetime tangled
//! into every `Result`.

use core::fmt;

use error::KernelError;
use i18n::Text;

/// Everything that can go wrong while parsing an ELF32 image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The buffer is too short to hold even a fixed ELF header.
    ImageTooShort,
    /// The buffer is too short to hold the program header table it claims to have.
    ProgramHeaderTableTooShort,
    /// Magic number didn't match `\x7fELF`.
    BadMagic([u8; 4]),
    /// `e_ident[EI_CLASS]` wasn't `ELFCLASS32`.
    WrongClass(u8),
    /// `e_ident[EI_DATA]` wasn't `ELFDATA2LSB`.
    WrongEndianness(u8),
    /// `e_phentsize` was smaller than `sizeof(Elf32_Phdr)`.
    PhentsizeTooSmall(u16, u16),
    /// A `PT_LOAD` segment's file offset and virtual address disagree modulo the page size.
    SegmentMisaligned(u32, u32),
    /// Two `PT_LOAD` segments overlap in virtual memory.
    SegmentsOverlap,
    /// `p_filesz` exceeded `p_memsz` for a `PT_LOAD` segment.
    SegmentFileszExceedsMemsz,
    /// The entry point isn't contained in any loaded segment.
    EntryNotMapped(u32)
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ElfError::ImageTooShort => write!(f, "ELF image is too short to contain a valid header"),
            ElfError::ProgramHeaderTableTooShort =>
                write!(f, "ELF image is too short to contain its own program header table"),
            ElfError::BadMagic(found) => write!(f, "{}", Text::ElfBadMagic(found)),
            ElfError::WrongClass(class) => write!(f, "{}", Text::ElfWrongClass(class)),
            ElfError::WrongEndianness(data) => write!(f, "{}", Text::ElfWrongEndianness(data)),
            ElfError::PhentsizeTooSmall(expected, actual) =>
                write!(f, "{}", Text::ElfPhentsizeTooSmall(&expected, &actual)),
            ElfError::SegmentMisaligned(offset, vaddr) =>
                write!(f, "{}", Text::ElfSegmentMisaligned(&offset, &vaddr)),
            ElfError::SegmentsOverlap => write!(f, "{}", Text::ElfSegmentsOverlap),
            ElfError::SegmentFileszExceedsMemsz => write!(f, "{}", Text::ElfSegmentFileszExceedsMemsz),
            ElfError::EntryNotMapped(entry) => write!(f, "{}", Text::ElfEntryNotMapped(&entry))
        }
    }
}

impl error::Error for ElfError {}

impl From<ElfError> for KernelError {
    fn from(_: ElfError) -> KernelError {
        KernelError::Inval
    }
}
