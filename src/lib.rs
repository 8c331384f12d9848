//! # rttihook
//!
//! A runtime toolkit for Windows x86-64 processes that discovers C++ class
//! RTTI already present in a loaded executable image and installs chained
//! virtual function table hooks on the classes it finds.
//!
//! ## Overview
//!
//! Three layers, leaves first:
//!
//! 1. [`ImageMap`] parses the PE headers of the mapped module and answers
//!    "is this address or image-base offset inside section X".
//! 2. [`RttiIndex`] scans for Microsoft-layout `CompleteObjectLocator`
//!    records, either by matching constructor instruction patterns in
//!    `.text` or by sweeping `.rdata` directly, validates the cross-section
//!    record chains, and maps demangled class names to their vtables.
//! 3. [`VftHook`] allocates an executable trampoline, patches a VFT slot,
//!    and chains with hooks other parties installed into the same slot, so
//!    any hook can be removed from any position without corrupting its
//!    neighbors.
//!
//! Platform services (module lookup, executable allocation, page
//! protection, symbol demangling) are consumed through the [`OsApi`]
//! capability trait; [`WindowsOs`] implements it for the current process.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use rttihook::{current_module, RttiIndex, VftHook, WindowsOs};
//!
//! extern "system" fn on_update(instance: usize) {
//!     // runs before the original virtual function, same arguments
//! }
//!
//! let os = Arc::new(WindowsOs);
//! let image = current_module(os.as_ref())?;
//! let index = RttiIndex::scan(&image, os.as_ref())?;
//!
//! let hook = VftHook::install(&index, "CS::PlayerIns", 20, on_update as usize, os)?;
//! // dropping `hook` unhooks
//! # Ok::<(), rttihook::Error>(())
//! ```

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod hook;
pub mod os;
pub mod pe;
pub mod rtti;
mod scanner;
pub mod template;

pub use error::{Error, Result};
pub use hook::{rdata_write, HookRecord, VftHook, HEADER_SIZE, HOOK_MAGIC};
pub use os::{current_module, OsApi};
pub use pe::{Ibo32, ImageMap, Section};
pub use rtti::{Rtti, RttiIndex};
pub use template::{HookContext, TrampolineTemplate};

#[cfg(target_os = "windows")]
pub use os::WindowsOs;
