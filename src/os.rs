//! OS capability interface.
//!
//! The core never calls platform APIs directly; everything it needs from the
//! host is behind the [`OsApi`] trait so the scanner and hook engine can be
//! exercised against fabricated images and mock implementations. The
//! [`WindowsOs`] implementation backs the trait with the usual Win32 calls.

use crate::error::Result;

#[cfg(target_os = "windows")]
use crate::error::Error;

/// Page protection constants, kept as raw values so the trait stays free of
/// platform types.
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// Capabilities the core needs from the host process.
///
/// All methods may be called from any thread.
pub trait OsApi: Send + Sync {
    /// Base address and loaded size of the target module.
    fn module_base_and_size(&self) -> Result<(*const u8, usize)>;

    /// Allocate `size` bytes of executable + writable memory at a fresh
    /// address.
    fn alloc_exec(&self, size: usize) -> Result<*mut u8>;

    /// Release an allocation made by [`OsApi::alloc_exec`].
    ///
    /// # Safety
    /// `base` must be a pointer previously returned by `alloc_exec` on the
    /// same implementation, and must not be freed twice.
    unsafe fn free_exec(&self, base: *mut u8) -> Result<()>;

    /// Change the protection of `[addr, addr + len)` to `flags`, returning
    /// the previous protection so it can be restored.
    ///
    /// # Safety
    /// `addr` must lie inside committed memory of the current process.
    unsafe fn protect(&self, addr: usize, len: usize, flags: u32) -> Result<u32>;

    /// Demangle a Microsoft-mangled type name.
    ///
    /// Returns an empty string when the name does not demangle.
    fn demangle(&self, mangled: &[u8]) -> String;
}

/// [`OsApi`] implementation for the current Windows process.
#[cfg(target_os = "windows")]
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsOs;

#[cfg(target_os = "windows")]
mod windows_impl {
    use super::*;

    use windows::Win32::System::LibraryLoader::GetModuleHandleA;
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE as WIN_PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    };
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;
    use windows::core::PCSTR;

    // UnDecorateSymbolName flag values, matching DbgHelp.h.
    const UNDNAME_NO_LEADING_UNDERSCORES: u32 = 0x0001;
    const UNDNAME_NO_MS_KEYWORDS: u32 = 0x0002;
    const UNDNAME_32_BIT_DECODE: u32 = 0x0800;
    const UNDNAME_NAME_ONLY: u32 = 0x1000;
    const UNDNAME_NO_ARGUMENTS: u32 = 0x2000;

    #[link(name = "dbghelp")]
    extern "system" {
        fn UnDecorateSymbolName(
            name: *const u8,
            output_string: *mut u8,
            max_string_length: u32,
            flags: u32,
        ) -> u32;
    }

    impl OsApi for WindowsOs {
        fn module_base_and_size(&self) -> Result<(*const u8, usize)> {
            let hmodule = unsafe { GetModuleHandleA(PCSTR::null()) }?;

            let mut mod_info = MODULEINFO::default();
            unsafe {
                GetModuleInformation(
                    GetCurrentProcess(),
                    hmodule,
                    &mut mod_info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )?;
            }

            Ok((
                mod_info.lpBaseOfDll as *const u8,
                mod_info.SizeOfImage as usize,
            ))
        }

        fn alloc_exec(&self, size: usize) -> Result<*mut u8> {
            let base = unsafe {
                VirtualAlloc(
                    None,
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    WIN_PAGE_EXECUTE_READWRITE,
                )
            };

            if base.is_null() {
                return Err(Error::AllocFailed { size });
            }
            Ok(base as *mut u8)
        }

        unsafe fn free_exec(&self, base: *mut u8) -> Result<()> {
            VirtualFree(base as *mut _, 0, MEM_RELEASE)?;
            Ok(())
        }

        unsafe fn protect(&self, addr: usize, len: usize, flags: u32) -> Result<u32> {
            let mut old = PAGE_PROTECTION_FLAGS::default();

            VirtualProtect(
                addr as *const _,
                len,
                PAGE_PROTECTION_FLAGS(flags),
                &mut old,
            )
            .map_err(|_| Error::ProtectFailed { addr, size: len })?;

            Ok(old.0)
        }

        fn demangle(&self, mangled: &[u8]) -> String {
            // the demangler expects a NUL terminated string
            let mut name = Vec::with_capacity(mangled.len() + 1);
            name.extend_from_slice(mangled);
            name.push(0);

            let mut output = [0u8; 256];
            let len = unsafe {
                UnDecorateSymbolName(
                    name.as_ptr(),
                    output.as_mut_ptr(),
                    output.len() as u32,
                    UNDNAME_NO_ARGUMENTS
                        | UNDNAME_NAME_ONLY
                        | UNDNAME_32_BIT_DECODE
                        | UNDNAME_NO_MS_KEYWORDS
                        | UNDNAME_NO_LEADING_UNDERSCORES,
                )
            };

            if len == 0 {
                return String::new();
            }
            String::from_utf8_lossy(&output[..len as usize]).into_owned()
        }
    }
}

/// Parse the primary module of the current process.
///
/// Thin convenience over [`OsApi::module_base_and_size`] and
/// [`crate::ImageMap::parse`] for the common in-process case.
pub fn current_module(os: &dyn OsApi) -> Result<crate::ImageMap> {
    let (base, size) = os.module_base_and_size()?;
    // SAFETY: the loader keeps the primary module mapped for the lifetime of
    // the process.
    unsafe { crate::ImageMap::parse(base, size) }
}
