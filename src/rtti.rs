//! Microsoft RTTI record layouts and the class index.
//!
//! The scanner surfaces candidate CompleteObjectLocator addresses; this
//! module validates the cross-section pointer chain behind each candidate
//! (COL -> TypeDescriptor / ClassHierarchyDescriptor -> BaseClassDescriptor)
//! and builds a map from demangled class name to the recovered records.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::os::OsApi;
use crate::pe::{Ibo32, ImageMap, Section};
use crate::scanner::{self, Candidate};

/// `CompleteObjectLocator`, as emitted by the MSVC toolchain for x86-64
/// images (signature 1, image-relative references).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CompleteObjectLocator {
    pub signature: u32,
    pub offset: u32,
    pub constructor_disp: u32,
    pub ibo_type_descriptor: Ibo32,
    pub ibo_class_descriptor: Ibo32,
}

/// `TypeDescriptor` header. The mangled name follows the two pointers as a
/// NUL terminated byte string.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TypeDescriptor {
    pub type_info_vft: *const *const (),
    pub spare: *const (),
    // name bytes follow
}

/// Offset of the mangled name inside a `TypeDescriptor`.
pub const TYPE_DESCRIPTOR_NAME_OFFSET: usize = std::mem::size_of::<TypeDescriptor>();

/// Longest mangled name the validator will follow.
const MAX_MANGLED_NAME: usize = 256;

/// `ClassHierarchyDescriptor`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ClassHierarchyDescriptor {
    pub signature: u32,
    pub flags: u32,
    pub num_base_classes: u32,
    pub ibo_base_class_array: Ibo32,
}

/// `BaseClassDescriptor`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BaseClassDescriptor {
    pub ibo_type_descriptor: Ibo32,
    pub num_extended_classes: u32,
    pub displacements: [i32; 3],
    pub flags: u32,
    pub ibo_class_descriptor: Ibo32,
}

/// Recovered RTTI for one class.
///
/// Addresses point into the scanned module; the records they name stay valid
/// for as long as the module remains mapped.
#[derive(Clone, Debug)]
pub struct Rtti {
    /// Address of the first vtable entry.
    pub vft: usize,
    /// Address of the CompleteObjectLocator.
    pub col: usize,
    /// Address of the TypeDescriptor.
    pub td: usize,
    /// Address of the ClassHierarchyDescriptor.
    pub chd: usize,
    /// Address of the BaseClassDescriptor array.
    pub bcd: usize,
    /// Demangled class name; also the index key.
    pub name: String,
}

/// The `.text`/`.data`/`.rdata` sections a scan works against.
struct SectionSet<'a> {
    text: Vec<&'a Section>,
    data: Vec<&'a Section>,
    rdata: Vec<&'a Section>,
}

impl<'a> SectionSet<'a> {
    fn resolve(image: &'a ImageMap) -> Result<Self> {
        Ok(Self {
            text: image
                .sections_by_name(".text")
                .ok_or(Error::MissingSection(".text"))?,
            data: image
                .sections_by_name(".data")
                .ok_or(Error::MissingSection(".data"))?,
            rdata: image
                .sections_by_name(".rdata")
                .ok_or(Error::MissingSection(".rdata"))?,
        })
    }
}

/// Map from demangled class name to recovered RTTI.
///
/// Built once per scan; immutable and safe to share between threads
/// afterwards. Rebuilding produces a new index, it does not mutate an
/// existing one under concurrent readers.
#[derive(Debug, Default)]
pub struct RttiIndex {
    classes: HashMap<String, Rtti>,
}

impl RttiIndex {
    /// Scan the image's `.text` sections for constructor instruction
    /// patterns and recover RTTI for every class they reference.
    pub fn scan(image: &ImageMap, os: &dyn OsApi) -> Result<Self> {
        let sections = SectionSet::resolve(image)?;
        let candidates = scanner::scan_text_sections(image, &sections.text, &sections.rdata);
        Ok(Self::from_candidates(image, os, &sections, candidates))
    }

    /// Sweep the image's `.rdata` sections directly for vtable/COL pairs and
    /// recover RTTI from them.
    ///
    /// This finds classes whose constructors were inlined away or are
    /// otherwise absent from `.text`, at the price of a larger candidate set.
    pub fn scan_rdata(image: &ImageMap, os: &dyn OsApi) -> Result<Self> {
        let sections = SectionSet::resolve(image)?;
        let candidates = scanner::scan_rdata_sections(image, &sections.text, &sections.rdata);
        Ok(Self::from_candidates(image, os, &sections, candidates))
    }

    fn from_candidates(
        image: &ImageMap,
        os: &dyn OsApi,
        sections: &SectionSet<'_>,
        candidates: Vec<Candidate>,
    ) -> Self {
        let total = candidates.len();
        let mut classes: HashMap<String, Rtti> = HashMap::new();

        for candidate in candidates {
            let Some(rtti) = validate_candidate(image, os, sections, candidate) else {
                continue;
            };

            match classes.entry(rtti.name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(rtti);
                }
                Entry::Occupied(existing) => {
                    trace!(
                        "duplicate class name {:?}: keeping vft {:#X}, dropping {:#X}",
                        rtti.name,
                        existing.get().vft,
                        rtti.vft
                    );
                }
            }
        }

        debug!(
            "rtti scan complete: {} candidates, {} classes",
            total,
            classes.len()
        );

        Self { classes }
    }

    /// Look up the RTTI of a class by its demangled name.
    pub fn get(&self, name: &str) -> Option<&Rtti> {
        self.classes.get(name)
    }

    /// Iterate over all recovered classes.
    pub fn iter(&self) -> impl Iterator<Item = &Rtti> {
        self.classes.values()
    }

    /// Number of recovered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the scan recovered nothing.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Validate a candidate's record chain and build the public record.
///
/// Every rejection is silent; a scan only reports what survived.
fn validate_candidate(
    image: &ImageMap,
    os: &dyn OsApi,
    sections: &SectionSet<'_>,
    candidate: Candidate,
) -> Option<Rtti> {
    let base = image.base();

    // SAFETY: the scanner confirmed the COL address lies inside .rdata
    let col = unsafe { (candidate.col as *const CompleteObjectLocator).read_unaligned() };

    // signature 1 marks the image-relative x86-64 layout
    if col.signature != 1 {
        return None;
    }

    // the linker places TypeDescriptors in .data, though some configurations
    // fold them into .rdata
    if !ImageMap::contains_ibo(col.ibo_type_descriptor, &sections.data)
        && !ImageMap::contains_ibo(col.ibo_type_descriptor, &sections.rdata)
    {
        return None;
    }
    if !ImageMap::contains_ibo(col.ibo_class_descriptor, &sections.rdata) {
        return None;
    }

    let td = col.ibo_type_descriptor.to_addr(base);
    let chd_addr = col.ibo_class_descriptor.to_addr(base);

    // SAFETY: the CHD offset was confirmed to lie inside .rdata
    let chd = unsafe { (chd_addr as *const ClassHierarchyDescriptor).read_unaligned() };
    if !ImageMap::contains_ibo(chd.ibo_base_class_array, &sections.rdata) {
        return None;
    }
    let bcd = chd.ibo_base_class_array.to_addr(base);

    let name = demangle_type_name(image, os, td)?;
    if name.is_empty() {
        return None;
    }

    Some(Rtti {
        vft: candidate.vft,
        col: candidate.col,
        td,
        chd: chd_addr,
        bcd,
        name,
    })
}

/// Read and demangle the mangled name of a TypeDescriptor.
///
/// In-memory mangled names may carry a leading `.`, which is not passed to
/// the demangler. Returns `None` when no NUL terminator shows up within
/// bounds.
fn demangle_type_name(image: &ImageMap, os: &dyn OsApi, td: usize) -> Option<String> {
    let name_start = td + TYPE_DESCRIPTOR_NAME_OFFSET;
    let image_end = image.base() as usize + image.size();
    if name_start >= image_end {
        return None;
    }

    let max_len = MAX_MANGLED_NAME.min(image_end - name_start);
    // SAFETY: the range is confined to the mapped image
    let bytes = unsafe { std::slice::from_raw_parts(name_start as *const u8, max_len) };

    let len = bytes.iter().position(|&b| b == 0)?;
    let mut name = &bytes[..len];
    if name.first() == Some(&b'.') {
        name = &name[1..];
    }

    Some(os.demangle(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal demangler for tests: understands `?AVName@Ns@@` shapes the
    /// way UnDecorateSymbolName would render them with NAME_ONLY.
    pub(crate) struct MockOs;

    impl OsApi for MockOs {
        fn module_base_and_size(&self) -> Result<(*const u8, usize)> {
            unreachable!("not used by scans")
        }

        fn alloc_exec(&self, _size: usize) -> Result<*mut u8> {
            unreachable!("not used by scans")
        }

        unsafe fn free_exec(&self, _base: *mut u8) -> Result<()> {
            unreachable!("not used by scans")
        }

        unsafe fn protect(&self, _addr: usize, _len: usize, _flags: u32) -> Result<u32> {
            unreachable!("not used by scans")
        }

        fn demangle(&self, mangled: &[u8]) -> String {
            let Ok(s) = std::str::from_utf8(mangled) else {
                return String::new();
            };
            let Some(body) = s
                .strip_prefix("?AV")
                .or_else(|| s.strip_prefix("?AU"))
                .and_then(|rest| rest.strip_suffix("@@"))
            else {
                return String::new();
            };
            if body.is_empty() {
                return String::new();
            }
            let mut parts: Vec<&str> = body.split('@').collect();
            parts.reverse();
            parts.join("::")
        }
    }

    // Fabricated image layout used by the scan tests.
    const TEXT_VA: usize = 0x1000;
    const RDATA_VA: usize = 0x2000;
    const DATA_VA: usize = 0x3000;
    const SECTION_SIZE: u32 = 0x800;

    const COL_OFF: usize = RDATA_VA + 0x100;
    const CHD_OFF: usize = RDATA_VA + 0x200;
    const BCD_OFF: usize = RDATA_VA + 0x300;
    const COL_SLOT_OFF: usize = RDATA_VA + 0x3F8;
    const VFT_OFF: usize = RDATA_VA + 0x400;
    const TD_OFF: usize = DATA_VA + 0x10;

    /// A fabricated module: headers plus populated .text/.rdata/.data with
    /// one complete RTTI chain for `CS::PlayerIns`.
    struct FakeModule {
        image: Vec<u8>,
    }

    impl FakeModule {
        fn new() -> Self {
            let mut module = Self {
                image: crate::pe::tests_support::build_image(&[
                    (".text", SECTION_SIZE, TEXT_VA as u32),
                    (".rdata", SECTION_SIZE, RDATA_VA as u32),
                    (".data", SECTION_SIZE, DATA_VA as u32),
                ]),
            };
            module.install_class(
                COL_OFF,
                CHD_OFF,
                BCD_OFF,
                COL_SLOT_OFF,
                VFT_OFF,
                TD_OFF,
                b"?AVPlayerIns@CS@@",
            );
            module
        }

        fn base(&self) -> usize {
            self.image.as_ptr() as usize
        }

        fn write_usize(&mut self, offset: usize, value: usize) {
            self.image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn write_u32(&mut self, offset: usize, value: u32) {
            self.image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        /// Lay out a full COL/CHD/BCD/TD chain plus the vtable slot pair.
        #[allow(clippy::too_many_arguments)]
        fn install_class(
            &mut self,
            col: usize,
            chd: usize,
            bcd: usize,
            col_slot: usize,
            vft: usize,
            td: usize,
            mangled: &[u8],
        ) {
            let base = self.base();

            // COL: signature 1, image-relative TD and CHD offsets
            self.write_u32(col, 1);
            self.write_u32(col + 12, td as u32);
            self.write_u32(col + 16, chd as u32);

            // CHD: one base class, array in .rdata
            self.write_u32(chd + 8, 1);
            self.write_u32(chd + 12, bcd as u32);

            // TD: two pointers then the mangled name
            let name_at = td + TYPE_DESCRIPTOR_NAME_OFFSET;
            self.image[name_at..name_at + mangled.len()].copy_from_slice(mangled);

            // vtable: COL pointer one slot above the first entry, which
            // points into .text
            self.write_usize(col_slot, base + col);
            self.write_usize(vft, base + TEXT_VA + 0x100);
        }

        /// Plant a constructor instruction pair in .text whose lea resolves
        /// to the vtable.
        fn install_constructor(&mut self, at: usize, vft: usize) {
            let disp = (vft as i64 - (at + 7) as i64) as i32;
            self.image[at..at + 3].copy_from_slice(&[0x48, 0x8D, 0x05]);
            self.image[at + 3..at + 7].copy_from_slice(&disp.to_le_bytes());
            self.image[at + 7..at + 10].copy_from_slice(&[0x48, 0x89, 0x01]);
        }

        fn map(&self) -> ImageMap {
            unsafe { ImageMap::parse(self.image.as_ptr(), self.image.len()) }.unwrap()
        }
    }

    #[test]
    fn test_scan_rdata_recovers_class() {
        let module = FakeModule::new();
        let map = module.map();

        let index = RttiIndex::scan_rdata(&map, &MockOs).unwrap();
        assert_eq!(index.len(), 1);

        let rtti = index.get("CS::PlayerIns").expect("class should be found");
        assert_eq!(rtti.vft, module.base() + VFT_OFF);
        assert_eq!(rtti.col, module.base() + COL_OFF);
        assert_eq!(rtti.td, module.base() + TD_OFF);
        assert_eq!(rtti.chd, module.base() + CHD_OFF);
        assert_eq!(rtti.bcd, module.base() + BCD_OFF);
        assert_eq!(rtti.name, "CS::PlayerIns");
    }

    #[test]
    fn test_scan_text_recovers_class() {
        let mut module = FakeModule::new();
        module.install_constructor(TEXT_VA + 0x40, VFT_OFF);
        let map = module.map();

        let index = RttiIndex::scan(&map, &MockOs).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get("CS::PlayerIns").unwrap().vft,
            module.base() + VFT_OFF
        );
    }

    #[test]
    fn test_scan_text_without_constructor_finds_nothing() {
        let module = FakeModule::new();
        let map = module.map();

        let index = RttiIndex::scan(&map, &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_scan_requires_core_sections() {
        let image = crate::pe::tests_support::build_image(&[
            (".text", SECTION_SIZE, TEXT_VA as u32),
            (".rdata", SECTION_SIZE, RDATA_VA as u32),
        ]);
        let map = unsafe { ImageMap::parse(image.as_ptr(), image.len()) }.unwrap();

        let err = RttiIndex::scan_rdata(&map, &MockOs).unwrap_err();
        assert!(matches!(err, Error::MissingSection(".data")));
    }

    #[test]
    fn test_rejects_wrong_signature() {
        let mut module = FakeModule::new();
        module.write_u32(COL_OFF, 2);

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_rejects_td_outside_data_sections() {
        let mut module = FakeModule::new();
        // point the TD offset at the PE headers
        module.write_u32(COL_OFF + 12, 0x40);

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_rejects_chd_outside_rdata() {
        let mut module = FakeModule::new();
        module.write_u32(COL_OFF + 16, (DATA_VA + 0x100) as u32);

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_rejects_bcd_outside_rdata() {
        let mut module = FakeModule::new();
        module.write_u32(CHD_OFF + 12, (TEXT_VA + 0x100) as u32);

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_rejects_undemanglable_name() {
        let mut module = FakeModule::new();
        let name_at = TD_OFF + TYPE_DESCRIPTOR_NAME_OFFSET;
        module.image[name_at..name_at + 18].copy_from_slice(b"garbage name\0\0\0\0\0\0");

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_skips_leading_dot_before_demangling() {
        let mut module = FakeModule::new();
        let name_at = TD_OFF + TYPE_DESCRIPTOR_NAME_OFFSET;
        // overwrite with a dotted name; "." + "?AVFoo@@" + NUL
        module.image[name_at..name_at + 32].fill(0);
        module.image[name_at..name_at + 9].copy_from_slice(b".?AVFoo@@");

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert!(index.get("Foo").is_some());
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let mut module = FakeModule::new();
        // second chain further up .rdata with the same TD (and thus name)
        module.install_class(
            RDATA_VA + 0x500,
            RDATA_VA + 0x540,
            RDATA_VA + 0x560,
            RDATA_VA + 0x5F8,
            RDATA_VA + 0x600,
            TD_OFF,
            b"?AVPlayerIns@CS@@",
        );

        let index = RttiIndex::scan_rdata(&module.map(), &MockOs).unwrap();
        assert_eq!(index.len(), 1);
        // slots are swept in ascending address order; the earlier chain wins
        assert_eq!(
            index.get("CS::PlayerIns").unwrap().vft,
            module.base() + VFT_OFF
        );
    }

    #[test]
    fn test_record_layouts() {
        assert_eq!(std::mem::size_of::<CompleteObjectLocator>(), 20);
        assert_eq!(std::mem::size_of::<ClassHierarchyDescriptor>(), 16);
        assert_eq!(std::mem::size_of::<BaseClassDescriptor>(), 28);
        assert_eq!(TYPE_DESCRIPTOR_NAME_OFFSET, 16);
    }
}
