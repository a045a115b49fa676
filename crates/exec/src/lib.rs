/* Copyright (c) 2018-2022 Jeremy Davis (jeremydavis519@gmail.com)
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

//! A pure, allocation-free ELF32 parser: given a byte slice holding a whole ELF file, validates
//! its header and program header table and hands back a sorted, overlap-checked list of `PT_LOAD`
//! segments. Used by the ELF address-space backend to decide what to map and what to demand-page
//! in; owns no file handle and does no I/O of its own.
//!
//! Only the subset of ELF32 this kernel's own executables need is understood: little-endian,
//! 32-bit, and only `PT_LOAD` segments. Anything else in the program header table (`PT_INTERP`,
//! `PT_DYNAMIC`, `PT_NOTE`, ...) is silently skipped.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod error;
mod segment;

use alloc::vec::Vec;

pub use error::ElfError;
pub use segment::{Segment, SegmentFlags, SegmentType};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;

/// The fixed ELF32 header is 52 bytes long.
const EHDR_SIZE: usize = 52;
/// `sizeof(Elf32_Phdr)`.
const PHDR_SIZE: u16 = 32;
/// Every segment's file offset and virtual address must agree modulo this value.
const PAGE_SIZE: u32 = 4096;

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// A parsed, validated ELF32 executable image, borrowing its bytes from the caller.
#[derive(Debug)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    entry: u32,
    segments: Vec<Segment>
}

impl<'a> ElfImage<'a> {
    /// Parses and validates `data` as a little-endian ELF32 executable.
    ///
    /// Checks, in order: the magic number; the class and endianness bytes; that the program
    /// header entries are at least as large as `Elf32_Phdr`; for every `PT_LOAD` entry, that its
    /// file offset and virtual address agree modulo the page size and that `p_filesz <= p_memsz`;
    /// that no two loaded segments overlap in virtual memory; and that the entry point is
    /// contained in one of them.
    pub fn parse(data: &'a [u8]) -> Result<ElfImage<'a>, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::ImageTooShort);
        }
        if data[0 .. 4] != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&data[0 .. 4]);
            return Err(ElfError::BadMagic(found));
        }
        if data[EI_CLASS] != ELFCLASS32 {
            return Err(ElfError::WrongClass(data[EI_CLASS]));
        }
        if data[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::WrongEndianness(data[EI_DATA]));
        }

        let entry = read_u32(data, 24);
        let phoff = read_u32(data, 28) as usize;
        let phentsize = read_u16(data, 42);
        let phnum = read_u16(data, 44);

        if phentsize < PHDR_SIZE {
            return Err(ElfError::PhentsizeTooSmall(PHDR_SIZE, phentsize));
        }

        let mut segments = Vec::with_capacity(phnum as usize);
        for i in 0 .. phnum as usize {
            let ph_offset = phoff + i * phentsize as usize;
            if ph_offset + PHDR_SIZE as usize > data.len() {
                return Err(ElfError::ProgramHeaderTableTooShort);
            }

            let p_type = read_u32(data, ph_offset);
            if p_type != PT_LOAD {
                continue;
            }

            let file_offset = read_u32(data, ph_offset + 4);
            let vaddr = read_u32(data, ph_offset + 8);
            let file_sz = read_u32(data, ph_offset + 16);
            let mem_sz = read_u32(data, ph_offset + 20);
            let p_flags = read_u32(data, ph_offset + 24);

            if file_offset % PAGE_SIZE != vaddr % PAGE_SIZE {
                return Err(ElfError::SegmentMisaligned(file_offset, vaddr));
            }
            if file_sz > mem_sz {
                return Err(ElfError::SegmentFileszExceedsMemsz);
            }

            segments.push(Segment {
                seg_type: SegmentType::Load,
                flags: SegmentFlags::from_bits_truncate(p_flags),
                file_offset,
                vaddr,
                file_sz,
                mem_sz
            });
        }

        segments.sort_by_key(|seg| seg.vaddr);
        for pair in segments.windows(2) {
            if pair[0].vaddr.wrapping_add(pair[0].mem_sz) > pair[1].vaddr {
                return Err(ElfError::SegmentsOverlap);
            }
        }

        if !segments.iter().any(|seg| seg.contains(entry)) {
            return Err(ElfError::EntryNotMapped(entry));
        }

        Ok(ElfImage { data, entry, segments })
    }

    /// The virtual address execution should begin at.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// The image's `PT_LOAD` segments, sorted by virtual address and guaranteed not to overlap.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the portion of the underlying file backing `segment`'s `file_sz` bytes. The
    /// remaining `mem_sz - file_sz` bytes (if any) are not present in the file and must be
    /// zero-filled by the caller.
    pub fn segment_file_data(&self, segment: &Segment) -> &'a [u8] {
        let start = segment.file_offset as usize;
        let end = start + segment.file_sz as usize;
        &self.data[start .. end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u16(buf: &mut Vec<u8>, v: u16) { buf.extend_from_slice(&v.to_le_bytes()); }
    fn push_u32(buf: &mut Vec<u8>, v: u32) { buf.extend_from_slice(&v.to_le_bytes()); }

    /// Builds a minimal ELF32 image with the given entry point and `PT_LOAD` segments, each
    /// described as `(vaddr, file_sz, mem_sz, flags)` with no data beyond what `file_sz` needs.
    fn build_image(entry: u32, segs: &[(u32, u32, u32, u32)]) -> Vec<u8> {
        let phoff = EHDR_SIZE as u32;
        let phnum = segs.len() as u16;
        let data_start = phoff + phnum as u32 * PHDR_SIZE as u32;

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(ELFCLASS32);
        buf.push(ELFDATA2LSB);
        buf.push(1); // EI_VERSION
        buf.resize(16, 0); // pad e_ident
        push_u16(&mut buf, 2); // e_type = ET_EXEC
        push_u16(&mut buf, 0); // e_machine
        push_u32(&mut buf, 1); // e_version
        push_u32(&mut buf, entry);
        push_u32(&mut buf, phoff);
        push_u32(&mut buf, 0); // e_shoff
        push_u32(&mut buf, 0); // e_flags
        push_u16(&mut buf, EHDR_SIZE as u16);
        push_u16(&mut buf, PHDR_SIZE);
        push_u16(&mut buf, phnum);
        push_u16(&mut buf, 0); // e_shentsize
        push_u16(&mut buf, 0); // e_shnum
        push_u16(&mut buf, 0); // e_shstrndx
        assert_eq!(buf.len(), EHDR_SIZE);

        let mut file_offset = data_start;
        let mut offsets = Vec::new();
        for &(_, file_sz, _, _) in segs {
            offsets.push(file_offset);
            file_offset += file_sz;
        }

        for (i, &(vaddr, file_sz, mem_sz, flags)) in segs.iter().enumerate() {
            push_u32(&mut buf, PT_LOAD);
            push_u32(&mut buf, offsets[i]);
            push_u32(&mut buf, vaddr);
            push_u32(&mut buf, vaddr); // p_paddr, unused
            push_u32(&mut buf, file_sz);
            push_u32(&mut buf, mem_sz);
            push_u32(&mut buf, flags);
            push_u32(&mut buf, PAGE_SIZE); // p_align
        }

        buf.resize(file_offset as usize, 0xAA);
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = build_image(0x1000, &[(0x1000, 4, 4, 0x5)]);
        image[0] = 0x00;
        assert_eq!(ElfImage::parse(&image), Err(ElfError::BadMagic([0x00, b'E', b'L', b'F'])));
    }

    #[test]
    fn parses_single_segment() {
        let image = build_image(0x1000, &[(0x1000, 4, 4, 0x5)]);
        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.entry(), 0x1000);
        assert_eq!(elf.segments().len(), 1);
        assert_eq!(elf.segments()[0].flags, SegmentFlags::EXECUTABLE | SegmentFlags::READABLE);
    }

    #[test]
    fn bss_tail_is_not_in_the_file() {
        let image = build_image(0x1000, &[(0x1000, 4, 0x2000, 0x6)]);
        let elf = ElfImage::parse(&image).unwrap();
        let seg = &elf.segments()[0];
        assert_eq!(elf.segment_file_data(seg).len(), 4);
        assert!(seg.mem_sz > seg.file_sz);
    }

    #[test]
    fn rejects_overlapping_segments() {
        let image = build_image(0x1000, &[
            (0x1000, PAGE_SIZE, PAGE_SIZE, 0x5),
            (0x1000 + PAGE_SIZE / 2, PAGE_SIZE, PAGE_SIZE, 0x6)
        ]);
        assert_eq!(ElfImage::parse(&image), Err(ElfError::SegmentsOverlap));
    }

    #[test]
    fn rejects_misaligned_segment() {
        let image = build_image(0x1000, &[(0x1001, 4, 4, 0x5)]);
        let file_offset = EHDR_SIZE as u32 + PHDR_SIZE as u32;
        assert_eq!(ElfImage::parse(&image), Err(ElfError::SegmentMisaligned(file_offset, 0x1001)));
    }

    #[test]
    fn rejects_entry_outside_every_segment() {
        let image = build_image(0x9000, &[(0x1000, 4, 4, 0x5)]);
        assert_eq!(ElfImage::parse(&image), Err(ElfError::EntryNotMapped(0x9000)));
    }
}
