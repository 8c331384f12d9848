//! PE image parsing and section queries.
//!
//! This module provides types for parsing the PE headers of a memory-mapped
//! module and answering containment queries against its sections, either for
//! raw addresses or for image-base offsets.

use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

/// Offset of `e_lfanew` inside the DOS header.
const DOS_LFANEW_OFFSET: usize = 0x3C;
/// Offset of the section count inside the PE header.
const PE_SECTION_COUNT_OFFSET: usize = 0x06;
/// Offset of the optional header size inside the PE header.
const PE_OPT_HEADER_SIZE_OFFSET: usize = 0x14;
/// Offset of the section table relative to the PE signature, before adding
/// the optional header size.
const PE_SECTION_TABLE_BASE: usize = 0x18;
/// Size of one section header on disk.
const SECTION_HEADER_SIZE: usize = 0x28;

/// A signed 32-bit image-base offset.
///
/// An `Ibo32` is a byte delta from a module's load base. It round-trips with
/// a raw address given the base, and is ordered so it can be range-tested
/// against section bounds directly.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ibo32(i32);

impl Ibo32 {
    /// Create an offset from a raw value.
    #[inline]
    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    /// Compute the offset of an address from a module base.
    #[inline]
    pub fn from_addr(addr: usize, base: *const u8) -> Self {
        Self(addr.wrapping_sub(base as usize) as i32)
    }

    /// Resolve the offset against a module base, yielding a raw address.
    #[inline]
    pub fn to_addr(self, base: *const u8) -> usize {
        (base as usize).wrapping_add_signed(self.0 as isize)
    }

    /// Resolve the offset against a module base, yielding a typed pointer.
    #[inline]
    pub fn to_ptr<T>(self, base: *const u8) -> *const T {
        self.to_addr(base) as *const T
    }

    /// The raw offset value.
    #[inline]
    pub const fn get(self) -> i32 {
        self.0
    }
}

/// A section of a mapped executable image.
///
/// The on-disk name (8 bytes, NUL padded) is canonicalized to a string.
/// Multiple sections may share a name; lookups return all of them in
/// encounter order.
#[derive(Clone, Debug)]
pub struct Section {
    /// Section name, trimmed of trailing NUL bytes.
    pub name: String,
    /// Virtual size of the section.
    pub virtual_size: u32,
    /// Start of the section as an image-base offset.
    pub start: Ibo32,
    /// End of the section (`start + virtual_size`).
    pub end: Ibo32,
}

impl Section {
    /// Check whether an image-base offset falls inside this section.
    #[inline]
    pub fn contains_ibo(&self, ibo: Ibo32) -> bool {
        ibo >= self.start && ibo < self.end
    }

    /// Check whether a raw address falls inside this section.
    #[inline]
    pub fn contains_addr(&self, addr: usize, base: *const u8) -> bool {
        addr >= self.start.to_addr(base) && addr < self.end.to_addr(base)
    }
}

/// Parsed section map of a single mapped module.
///
/// Constructed once from the module's base address and loaded size, immutable
/// afterwards. All queries borrow from the map.
#[derive(Debug)]
pub struct ImageMap {
    /// Base address of the module in memory.
    base: *const u8,
    /// Loaded size of the module (SizeOfImage).
    size: usize,
    /// Sections in header order.
    sections: Vec<Section>,
}

impl ImageMap {
    /// Parse the PE headers of a memory-mapped module.
    ///
    /// # Safety
    /// The caller must ensure that `base` points to at least `size` bytes of
    /// readable memory laid out the way the Windows loader maps an image.
    pub unsafe fn parse(base: *const u8, size: usize) -> Result<Self> {
        let read_u16 = |off: usize| -> Result<u16> {
            if off + 2 > size {
                return Err(Error::Truncated {
                    expected: off + 2,
                    actual: size,
                });
            }
            // SAFETY: bounds checked against `size` above
            Ok(unsafe { (base.add(off) as *const u16).read_unaligned() })
        };
        let read_u32 = |off: usize| -> Result<u32> {
            if off + 4 > size {
                return Err(Error::Truncated {
                    expected: off + 4,
                    actual: size,
                });
            }
            // SAFETY: bounds checked against `size` above
            Ok(unsafe { (base.add(off) as *const u32).read_unaligned() })
        };

        if read_u16(0)? != DOS_MAGIC {
            return Err(Error::NotAnImage(0));
        }

        let pe_offset = read_u32(DOS_LFANEW_OFFSET)? as usize;
        if read_u32(pe_offset)? != PE_SIGNATURE {
            return Err(Error::NotAnImage(pe_offset));
        }

        let section_count = read_u16(pe_offset + PE_SECTION_COUNT_OFFSET)? as usize;
        let opt_header_size = read_u16(pe_offset + PE_OPT_HEADER_SIZE_OFFSET)? as usize;
        let table_offset = pe_offset + PE_SECTION_TABLE_BASE + opt_header_size;

        let table_end = table_offset + section_count * SECTION_HEADER_SIZE;
        if table_end > size {
            return Err(Error::Truncated {
                expected: table_end,
                actual: size,
            });
        }

        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let hdr = table_offset + i * SECTION_HEADER_SIZE;

            // name: 8 bytes, trimmed at the first NUL
            let name_bytes = std::slice::from_raw_parts(base.add(hdr), 8);
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

            let virtual_size = read_u32(hdr + 0x08)?;
            let virtual_address = read_u32(hdr + 0x0C)?;

            let start = Ibo32::new(virtual_address as i32);
            sections.push(Section {
                name,
                virtual_size,
                start,
                end: Ibo32::new(start.get().wrapping_add(virtual_size as i32)),
            });
        }

        Ok(Self {
            base,
            size,
            sections,
        })
    }

    /// All sections with a matching name, in encounter order.
    ///
    /// Returns `None` when no section carries the name. A single image can
    /// legitimately have several sections with identical names.
    pub fn sections_by_name(&self, name: &str) -> Option<Vec<&Section>> {
        let matches: Vec<&Section> = self.sections.iter().filter(|s| s.name == name).collect();
        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }

    /// Check whether a raw address lies inside any of the given sections.
    #[inline]
    pub fn contains_addr(&self, addr: usize, sections: &[&Section]) -> bool {
        sections.iter().any(|s| s.contains_addr(addr, self.base))
    }

    /// Check whether an image-base offset lies inside any of the given sections.
    #[inline]
    pub fn contains_ibo(ibo: Ibo32, sections: &[&Section]) -> bool {
        sections.iter().any(|s| s.contains_ibo(ibo))
    }

    /// All sections in header order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Module base address.
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Loaded module size.
    pub fn size(&self) -> usize {
        self.size
    }
}

// SAFETY: ImageMap only holds the base address of an image mapped for the
// whole process; queries never write through it.
unsafe impl Send for ImageMap {}
unsafe impl Sync for ImageMap {}

/// Fabricated-image helpers shared by the unit tests of this crate.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::{DOS_MAGIC, PE_SIGNATURE};

    /// Build a minimal in-memory PE image with the given section headers
    /// (name, virtual_size, virtual_address). The buffer is sized to back
    /// every declared section so their contents can be filled in afterwards.
    pub(crate) fn build_image(sections: &[(&str, u32, u32)]) -> Vec<u8> {
        let pe_offset = 0x80usize;
        let opt_size = 0xF0usize;
        let image_size = sections
            .iter()
            .map(|&(_, vsize, vaddr)| (vaddr + vsize) as usize)
            .max()
            .unwrap_or(0)
            .max(0x1000);
        let mut image = vec![0u8; image_size];

        image[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        image[0x3C..0x40].copy_from_slice(&(pe_offset as u32).to_le_bytes());
        image[pe_offset..pe_offset + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        image[pe_offset + 0x06..pe_offset + 0x08]
            .copy_from_slice(&(sections.len() as u16).to_le_bytes());
        image[pe_offset + 0x14..pe_offset + 0x16].copy_from_slice(&(opt_size as u16).to_le_bytes());

        let table = pe_offset + 0x18 + opt_size;
        for (i, (name, vsize, vaddr)) in sections.iter().enumerate() {
            let hdr = table + i * 0x28;
            let bytes = name.as_bytes();
            image[hdr..hdr + bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
            image[hdr + 0x08..hdr + 0x0C].copy_from_slice(&vsize.to_le_bytes());
            image[hdr + 0x0C..hdr + 0x10].copy_from_slice(&vaddr.to_le_bytes());
        }

        image
    }
}
