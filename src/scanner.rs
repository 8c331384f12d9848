//! SIMD-optimized scanning for RTTI candidates.
//!
//! Two strategies are provided. The instruction-pattern scan walks `.text`
//! looking for the pair a MSVC constructor uses to install a vtable pointer
//! at object offset 0:
//!
//! ```text
//! REX.W lea r??, [rip+disp32]
//! REX.W mov [r??], r??
//! ```
//!
//! The pointer sweep instead walks `.rdata` directly, treating it as an
//! array of pointer-sized slots and looking for a CompleteObjectLocator
//! pointer immediately followed by a plausible first vtable entry.
//!
//! Both emit raw candidates; validation of the RTTI record chain lives in
//! [`crate::rtti`].

use crate::pe::{ImageMap, Section};

/// A scan candidate: the address of a CompleteObjectLocator and the vtable
/// it belongs to. Nothing beyond section containment has been checked yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    /// Address of the candidate CompleteObjectLocator.
    pub col: usize,
    /// Address of the vtable's first entry.
    pub vft: usize,
}

/// Matched length of the instruction pair.
const PATTERN_LEN: usize = 10;

/// Signature bytes of the pair. Bytes 3..7 are the `lea` displacement and
/// are fully wildcarded; bytes 10..16 only pad the compare window.
const PATTERN: [u8; 16] = [
    0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00, 0x48, 0x89, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Care mask: a window byte participates in the compare only where its mask
/// bit is set. The REX.R bit of the `lea` (byte 0), REX.R/REX.B of the `mov`
/// (byte 7) and both reg fields (bytes 2 and 9) are wildcarded and checked
/// structurally afterwards.
const CARE: [u8; 16] = [
    0xFB, 0xFF, 0xC7, 0x00, 0x00, 0x00, 0x00, 0xFA, 0xFF, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Masked compare of the pattern at `offset`, without SIMD.
#[inline]
fn matches_at(bytes: &[u8], offset: usize) -> bool {
    if offset + PATTERN_LEN > bytes.len() {
        return false;
    }
    bytes[offset..offset + PATTERN_LEN]
        .iter()
        .zip(CARE.iter().zip(PATTERN.iter()))
        .all(|(&b, (&care, &pattern))| b & care == pattern)
}

/// Post-match verification that both instructions operate on the same
/// register.
///
/// The bitwise pattern wildcards the register fields, so a match is only
/// confirmed when:
/// - the `mov` does not degenerate to a RIP-relative store (`mod` = 00 with
///   `rm` = 101) and does not take a SIB byte (`rm` = 100),
/// - the REX.R bits of `lea` and `mov` agree,
/// - the reg fields of both ModR/M bytes name the same register.
#[inline]
fn registers_consistent(bytes: &[u8], offset: usize) -> bool {
    let lea_rex = bytes[offset];
    let lea_modrm = bytes[offset + 2];
    let mov_rex = bytes[offset + 7];
    let mov_modrm = bytes[offset + 9];

    let mov_mod = mov_modrm >> 6;
    let mov_rm = mov_modrm & 0b111;

    if mov_mod == 0b00 && mov_rm == 0b101 {
        return false;
    }
    if mov_rm == 0b100 {
        return false;
    }
    if (lea_rex ^ mov_rex) & 0b0000_0100 != 0 {
        return false;
    }
    if (lea_modrm ^ mov_modrm) & 0b0011_1000 != 0 {
        return false;
    }

    true
}

/// Find all confirmed pattern matches in a byte buffer, returning their
/// offsets.
pub(crate) fn find_constructor_patterns(bytes: &[u8]) -> Vec<usize> {
    let mut matches = Vec::new();

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: SSE2 is part of the x86-64 baseline
        unsafe { find_patterns_sse2(bytes, &mut matches) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        find_patterns_scalar(bytes, &mut matches);
    }

    matches
}

/// Scalar search, also used for the tail the vector loop cannot cover.
#[allow(dead_code)]
fn find_patterns_scalar(bytes: &[u8], matches: &mut Vec<usize>) {
    if bytes.len() < PATTERN_LEN {
        return;
    }
    for offset in 0..=bytes.len() - PATTERN_LEN {
        if matches_at(bytes, offset) && registers_consistent(bytes, offset) {
            matches.push(offset);
        }
    }
}

/// SSE2 search over 16-byte windows.
///
/// Candidate positions are located by comparing the masked first byte across
/// a window and taking the trailing-zero count of the comparison bitmap;
/// each candidate is then confirmed with one masked 16-byte compare.
#[cfg(target_arch = "x86_64")]
unsafe fn find_patterns_sse2(bytes: &[u8], matches: &mut Vec<usize>) {
    use std::arch::x86_64::*;

    if bytes.len() < PATTERN_LEN {
        return;
    }

    let first_sig = _mm_set1_epi8(PATTERN[0] as i8);
    let first_care = _mm_set1_epi8(CARE[0] as i8);
    let pattern = _mm_loadu_si128(PATTERN.as_ptr() as *const __m128i);
    let care = _mm_loadu_si128(CARE.as_ptr() as *const __m128i);

    let mut pos = 0usize;
    while pos + 16 <= bytes.len() {
        let window = _mm_loadu_si128(bytes.as_ptr().add(pos) as *const __m128i);
        let masked = _mm_and_si128(window, first_care);
        let eq = _mm_cmpeq_epi8(masked, first_sig);
        let bitmap = _mm_movemask_epi8(eq) as u32;

        if bitmap == 0 {
            pos += 16;
            continue;
        }

        let candidate = pos + bitmap.trailing_zeros() as usize;

        if candidate + 16 <= bytes.len() {
            let window = _mm_loadu_si128(bytes.as_ptr().add(candidate) as *const __m128i);
            let masked = _mm_and_si128(window, care);
            let eq = _mm_cmpeq_epi8(masked, pattern);
            if _mm_movemask_epi8(eq) == 0xFFFF && registers_consistent(bytes, candidate) {
                matches.push(candidate);
            }
        } else if matches_at(bytes, candidate) && registers_consistent(bytes, candidate) {
            matches.push(candidate);
        }

        pos = candidate + 1;
    }

    // candidate starts the vector loop could not reach
    let tail_start = bytes.len().saturating_sub(15).max(pos);
    for offset in tail_start..=bytes.len() - PATTERN_LEN {
        if matches_at(bytes, offset) && registers_consistent(bytes, offset) {
            matches.push(offset);
        }
    }
}

/// Read a pointer-sized value, unaligned.
///
/// # Safety
/// `addr` must point to at least `size_of::<usize>()` readable bytes.
#[inline]
unsafe fn read_ptr(addr: usize) -> usize {
    (addr as *const usize).read_unaligned()
}

/// Clamp a section's address range to the mapped image.
fn section_range(image: &ImageMap, section: &Section) -> (usize, usize) {
    let base = image.base();
    let image_end = base as usize + image.size();
    let start = section.start.to_addr(base).min(image_end);
    let end = section.end.to_addr(base).min(image_end);
    (start, end)
}

/// Strategy A: scan `.text` sections for constructor instruction patterns.
///
/// A confirmed pattern at `P` names the vtable at `P + 7 + disp32`; the slot
/// directly above the vtable must hold the CompleteObjectLocator pointer,
/// and both the slot and its target must lie in `.rdata`.
pub(crate) fn scan_text_sections(
    image: &ImageMap,
    text: &[&Section],
    rdata: &[&Section],
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for section in text {
        let (start, end) = section_range(image, section);
        if end <= start {
            continue;
        }

        // SAFETY: the range was clamped to the mapped image
        let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, end - start) };

        for offset in find_constructor_patterns(bytes) {
            let at = start + offset;
            let disp = i32::from_le_bytes([
                bytes[offset + 3],
                bytes[offset + 4],
                bytes[offset + 5],
                bytes[offset + 6],
            ]);

            // the lea target is the vtable; the COL pointer sits one slot above
            let vft = (at + 7).wrapping_add_signed(disp as isize);
            let col_slot = vft.wrapping_sub(std::mem::size_of::<usize>());
            if !image.contains_addr(col_slot, rdata) {
                continue;
            }

            // SAFETY: col_slot was just confirmed to lie inside .rdata
            let col = unsafe { read_ptr(col_slot) };
            if !image.contains_addr(col, rdata) {
                continue;
            }

            candidates.push(Candidate { col, vft });
        }
    }

    candidates
}

/// Strategy B: sweep `.rdata` sections as pointer arrays.
///
/// A slot qualifies when it holds a pointer back into `.rdata` (the
/// CompleteObjectLocator) and the following slot holds a pointer into
/// `.text` (a plausible first vtable entry). Every pointer-aligned slot is
/// visited exactly once.
pub(crate) fn scan_rdata_sections(
    image: &ImageMap,
    text: &[&Section],
    rdata: &[&Section],
) -> Vec<Candidate> {
    const PTR: usize = std::mem::size_of::<usize>();
    let mut candidates = Vec::new();

    for section in rdata {
        let (start, end) = section_range(image, section);
        if end <= start + PTR {
            continue;
        }

        let mut slot = start;
        while slot + 2 * PTR <= end {
            // SAFETY: both reads stay inside the clamped section range
            let col = unsafe { read_ptr(slot) };
            let first_entry = unsafe { read_ptr(slot + PTR) };

            if image.contains_addr(col, rdata) && image.contains_addr(first_entry, text) {
                candidates.push(Candidate {
                    col,
                    vft: slot + PTR,
                });
            }

            slot += PTR;
        }
    }

    candidates
}
