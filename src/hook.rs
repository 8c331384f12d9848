//! Chained virtual function table hooking.
//!
//! Every hook is one executable allocation: a [`HookRecord`] header followed
//! by a trampoline body, with the VFT slot pointing at the body. Hooks
//! installed into the same slot by independent parties form a chain linked
//! through the `previous` field; the chain is recognized by the magic
//! sentinel at the start of each header, and terminates at the **anchor**,
//! the VFT slot itself. The topmost hook (the one whose `previous` is the
//! anchor) is the chain **head**, and its lock serializes every edit to the
//! chain.
//!
//! Two reclamation gaps are inherited from this design and documented rather
//! than solved: the trampoline page is freed as soon as a hook is removed,
//! so a thread still executing inside the body races the free; and the very
//! first install into an unhooked slot has no lock to take, so two threads
//! racing the initial install of the same slot can lose a hook. Chain locks
//! themselves are reference counted and stay alive for any thread still
//! blocked on them.

use std::mem::offset_of;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::os::{OsApi, PAGE_EXECUTE_READWRITE};
use crate::rtti::RttiIndex;
use crate::template::{HeaderField, HookContext, TrampolineTemplate};

/// Sentinel marking an allocation as a hook record.
pub const HOOK_MAGIC: u64 = u64::from_le_bytes(*b"RttiHook");

/// Header at the start of every hook allocation, directly followed by the
/// trampoline body.
///
/// The layout is load-bearing: the body's RIP-relative operands are patched
/// against these field offsets, and foreign hooks recognize each other by
/// reading `magic` at a fixed negative offset from a slot's target. All
/// fields are managed by the hooking system; `extra` is free for hook
/// callbacks to use, except while a context-style trampoline briefly parks
/// its return address there.
#[repr(C)]
#[derive(Debug)]
pub struct HookRecord {
    /// [`HOOK_MAGIC`] for a live hook.
    pub magic: u64,
    pub _reserved: u64,
    /// Lock serializing edits of the chain this hook belongs to. Only the
    /// head's lock is ever taken.
    pub chain_lock: *const Mutex<()>,
    /// Per-hook register save area.
    pub context: *mut HookContext,
    /// The next hook toward the slot, or the anchor (the slot itself).
    pub previous: usize,
    /// User callback.
    pub fn_new: usize,
    /// What this hook displaced: an older hook's body, or the original
    /// function.
    pub fn_hooked: usize,
    /// Scratch pointer, owned by the hook user.
    pub extra: usize,
}

/// Size of the header, and therefore the offset of the body inside every
/// hook allocation.
pub const HEADER_SIZE: usize = std::mem::size_of::<HookRecord>();

/// Byte offset of a patched header field.
fn field_offset(field: HeaderField) -> usize {
    match field {
        HeaderField::Context => offset_of!(HookRecord, context),
        HeaderField::FnNew => offset_of!(HookRecord, fn_new),
        HeaderField::FnHooked => offset_of!(HookRecord, fn_hooked),
        HeaderField::Extra => offset_of!(HookRecord, extra),
    }
}

/// Write a pointer-sized value to memory that may be mapped read-only, such
/// as a VFT slot in `.rdata`, restoring the page protection afterwards.
///
/// A failure to make the page writable aborts with [`Error::ProtectFailed`]
/// and writes nothing; there is no retry.
pub fn rdata_write(os: &dyn OsApi, dest: usize, value: usize) -> Result<()> {
    const LEN: usize = std::mem::size_of::<usize>();

    // SAFETY: dest names committed memory of this process; the caller either
    // owns it (hook headers) or holds the chain lock for it (VFT slots).
    unsafe {
        let old = os.protect(dest, LEN, PAGE_EXECUTE_READWRITE)?;
        fence(Ordering::SeqCst);
        (dest as *mut usize).write_volatile(value);
        os.protect(dest, LEN, old)?;
    }
    Ok(())
}

/// Read the magic sentinel of a would-be [`HookRecord`] at `addr`.
///
/// `addr` is routinely *not* a hook record: chain walks probe the memory
/// below a slot target to decide whether it is one. Only this single
/// unaligned load at a fixed offset is ever performed on unknown memory;
/// nothing else is dereferenced unless the sentinel matches.
#[inline]
unsafe fn read_magic(addr: usize) -> u64 {
    (addr as *const u64).read_unaligned()
}

/// Candidate hook record above a slot target.
#[inline]
fn record_below(code: usize) -> usize {
    code.wrapping_sub(HEADER_SIZE)
}

/// Follow `previous` links from a known hook record to the chain head.
///
/// # Safety
/// `record` must point at a live `HookRecord`.
unsafe fn find_head(record: *const HookRecord) -> *const HookRecord {
    let mut head = record;
    loop {
        let previous = std::ptr::addr_of!((*head).previous).read();
        if read_magic(previous) == HOOK_MAGIC {
            head = previous as *const HookRecord;
        } else {
            return head;
        }
    }
}

/// Acquire a chain lock through its raw pointer.
///
/// The returned `Arc` keeps the mutex alive even if the owning hook is
/// uninstalled while we hold or wait for it.
///
/// # Safety
/// `lock` must have been produced by `Arc::into_raw`. The owning reference
/// is never released (see [`release_record_resources`]), so the strong
/// count stays positive for the lifetime of the process.
unsafe fn clone_chain_lock(lock: *const Mutex<()>) -> Arc<Mutex<()>> {
    Arc::increment_strong_count(lock);
    Arc::from_raw(lock)
}

/// An installed VFT hook. Dropping the handle uninstalls it.
pub struct VftHook {
    record: *mut HookRecord,
    os: Arc<dyn OsApi>,
    active: bool,
}

impl std::fmt::Debug for VftHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VftHook")
            .field("record", &self.record)
            .field("active", &self.active)
            .finish()
    }
}

// SAFETY: the hook operates on process-wide memory; every chain edit is
// serialized by the chain head's lock.
unsafe impl Send for VftHook {}
unsafe impl Sync for VftHook {}

impl VftHook {
    /// Hook a virtual function of a class found by name, using the entry
    /// trampoline.
    ///
    /// `fn_new` is called with the hooked function's arguments (a class
    /// instance pointer first, virtual functions being thiscall) before
    /// control continues into the original.
    pub fn install(
        index: &RttiIndex,
        class_name: &str,
        vft_index: u32,
        fn_new: usize,
        os: Arc<dyn OsApi>,
    ) -> Result<Self> {
        Self::install_with(
            &crate::template::ENTRY,
            index,
            class_name,
            vft_index,
            fn_new,
            os,
        )
    }

    /// Hook a virtual function of a class found by name, with an explicit
    /// trampoline shape.
    pub fn install_with(
        template: &'static TrampolineTemplate,
        index: &RttiIndex,
        class_name: &str,
        vft_index: u32,
        fn_new: usize,
        os: Arc<dyn OsApi>,
    ) -> Result<Self> {
        let rtti = index
            .get(class_name)
            .ok_or_else(|| Error::ClassNotFound(class_name.to_string()))?;
        Self::install_raw_with(template, rtti.vft, vft_index, fn_new, os)
    }

    /// Hook a slot of an explicitly supplied virtual function table, using
    /// the entry trampoline.
    pub fn install_raw(
        vft: usize,
        vft_index: u32,
        fn_new: usize,
        os: Arc<dyn OsApi>,
    ) -> Result<Self> {
        Self::install_raw_with(&crate::template::ENTRY, vft, vft_index, fn_new, os)
    }

    /// Hook a slot of an explicitly supplied virtual function table, with an
    /// explicit trampoline shape.
    pub fn install_raw_with(
        template: &'static TrampolineTemplate,
        vft: usize,
        vft_index: u32,
        fn_new: usize,
        os: Arc<dyn OsApi>,
    ) -> Result<Self> {
        if vft == 0 {
            return Err(Error::NullVft);
        }
        let slot = vft + vft_index as usize * std::mem::size_of::<usize>();

        let alloc = os.alloc_exec(HEADER_SIZE + template.len())?;
        let record = alloc as *mut HookRecord;

        // SAFETY: alloc is a fresh RWX allocation large enough for header
        // and body; slot is a live VFT slot by the caller's contract.
        match unsafe { install_into_slot(template, record, slot, fn_new, os.as_ref()) } {
            Ok(()) => {
                debug!(
                    "installed {} hook at slot {:#X}, body {:#X}",
                    template.name(),
                    slot,
                    alloc as usize + HEADER_SIZE
                );
                Ok(Self {
                    record,
                    os,
                    active: true,
                })
            }
            Err(err) => {
                // never leak a partial install
                let _ = unsafe { os.free_exec(alloc) };
                Err(err)
            }
        }
    }

    /// Address of the trampoline body (what the VFT slot points at while
    /// this hook is the chain head).
    pub fn body(&self) -> usize {
        self.record as usize + HEADER_SIZE
    }

    /// The user callback this hook dispatches to.
    pub fn fn_new(&self) -> usize {
        // SAFETY: the record is owned by this handle
        unsafe { std::ptr::addr_of!((*self.record).fn_new).read() }
    }

    /// What this hook currently forwards to: an older hook's body or the
    /// original function.
    pub fn fn_hooked(&self) -> usize {
        // SAFETY: the record is owned by this handle
        unsafe { std::ptr::addr_of!((*self.record).fn_hooked).read_volatile() }
    }

    /// The `previous` link: the next hook toward the slot, or the anchor.
    pub fn previous(&self) -> usize {
        // SAFETY: the record is owned by this handle
        unsafe { std::ptr::addr_of!((*self.record).previous).read_volatile() }
    }

    /// The per-hook register save area.
    pub fn context(&self) -> *mut HookContext {
        // SAFETY: the record is owned by this handle
        unsafe { std::ptr::addr_of!((*self.record).context).read() }
    }

    /// Read the user scratch field.
    pub fn extra(&self) -> usize {
        // SAFETY: the record is owned by this handle
        unsafe { std::ptr::addr_of!((*self.record).extra).read_volatile() }
    }

    /// Set the user scratch field.
    pub fn set_extra(&self, value: usize) {
        // SAFETY: the record is owned by this handle and stays writable
        unsafe { std::ptr::addr_of_mut!((*self.record).extra).write_volatile(value) }
    }

    /// Remove the hook, consuming the handle.
    pub fn uninstall(mut self) -> Result<()> {
        self.uninstall_inner()
    }

    fn uninstall_inner(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        // SAFETY: the record was installed by us and is still chained
        unsafe { uninstall_from_chain(self.record, self.os.as_ref()) }?;

        debug!(
            "removed hook with body {:#X}",
            self.record as usize + HEADER_SIZE
        );

        // SAFETY: the record is unreachable from the chain now
        unsafe {
            release_record_resources(self.record);
            self.os.free_exec(self.record as *mut u8)?;
        }
        Ok(())
    }
}

impl Drop for VftHook {
    fn drop(&mut self) {
        let _ = self.uninstall_inner();
    }
}

/// Copy and patch the template, then link the record into the slot's chain.
///
/// # Safety
/// `record` must point at a fresh allocation of at least `HEADER_SIZE +
/// template.len()` writable bytes; `slot` must be a live VFT slot.
unsafe fn install_into_slot(
    template: &TrampolineTemplate,
    record: *mut HookRecord,
    slot: usize,
    fn_new: usize,
    os: &dyn OsApi,
) -> Result<()> {
    let body = record as usize + HEADER_SIZE;

    std::ptr::copy_nonoverlapping(template.bytes().as_ptr(), body as *mut u8, template.len());
    for patch in template.patches() {
        let target = field_offset(patch.field) as i64;
        let next_ip = (HEADER_SIZE + patch.disp_at + 4) as i64;
        ((body + patch.disp_at) as *mut i32).write_unaligned((target - next_ip) as i32);
    }

    let context = Box::into_raw(Box::new(HookContext::default()));
    let chain_lock = Arc::into_raw(Arc::new(Mutex::new(())));

    // snapshot the slot under a full fence so a racing installer's write is
    // observed
    fence(Ordering::SeqCst);
    let fn_hooked = (slot as *const usize).read_volatile();

    record.write(HookRecord {
        magic: HOOK_MAGIC,
        _reserved: 0,
        chain_lock,
        context,
        previous: slot,
        fn_new,
        fn_hooked,
        extra: 0,
    });

    let link = link_into_chain(record, slot, os);
    if link.is_err() {
        release_record_resources(record);
    }
    link
}

/// Publish a fully initialized record at its slot, joining a pre-existing
/// chain when the slot already targets a hook.
unsafe fn link_into_chain(record: *mut HookRecord, slot: usize, os: &dyn OsApi) -> Result<()> {
    loop {
        let fn_hooked = std::ptr::addr_of!((*record).fn_hooked).read();
        let prev = record_below(fn_hooked);

        if read_magic(prev) != HOOK_MAGIC {
            // unhooked slot: nothing to coordinate with, just claim it
            fence(Ordering::SeqCst);
            let current = (slot as *const usize).read_volatile();
            if current != fn_hooked {
                std::ptr::addr_of_mut!((*record).fn_hooked).write(current);
                continue;
            }
            return rdata_write(os, slot, record as usize + HEADER_SIZE);
        }

        // a chain exists; its head is what the slot points at, and the
        // head's lock serializes every edit
        let prev_record = prev as *mut HookRecord;
        let lock = clone_chain_lock(std::ptr::addr_of!((*prev_record).chain_lock).read());
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // re-read the slot under the lock; if the head moved while we were
        // waiting, the lock we hold is not the head's anymore
        fence(Ordering::SeqCst);
        let current = (slot as *const usize).read_volatile();
        if current != fn_hooked {
            std::ptr::addr_of_mut!((*record).fn_hooked).write(current);
            drop(guard);
            continue;
        }

        rdata_write(
            os,
            std::ptr::addr_of_mut!((*prev_record).previous) as usize,
            record as usize,
        )?;
        if let Err(err) = rdata_write(os, slot, record as usize + HEADER_SIZE) {
            // roll the predecessor back to the anchor it had as head
            let _ = rdata_write(
                os,
                std::ptr::addr_of_mut!((*prev_record).previous) as usize,
                slot,
            );
            return Err(err);
        }

        drop(guard);
        return Ok(());
    }
}

/// Unlink a record from its chain, restoring the slot when the record is the
/// last hop before the anchor.
unsafe fn uninstall_from_chain(record: *mut HookRecord, os: &dyn OsApi) -> Result<()> {
    loop {
        let head = find_head(record);
        let lock = clone_chain_lock(std::ptr::addr_of!((*head).chain_lock).read());
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // the chain may have gained or lost a head while we were waiting;
        // only the current head's lock protects the edit
        if find_head(record) != head {
            drop(guard);
            continue;
        }

        let fn_hooked = std::ptr::addr_of!((*record).fn_hooked).read();
        let previous = std::ptr::addr_of!((*record).previous).read();

        // a hook below us still names us as its fn_hooked target; the hook
        // below sits above fn_hooked in memory
        let next = record_below(fn_hooked);
        if read_magic(next) == HOOK_MAGIC {
            rdata_write(
                os,
                std::ptr::addr_of_mut!((*(next as *mut HookRecord)).previous) as usize,
                previous,
            )?;
        }

        if read_magic(previous) == HOOK_MAGIC {
            // a newer hook chains through us: it now forwards to whatever we
            // forwarded to
            rdata_write(
                os,
                std::ptr::addr_of_mut!((*(previous as *mut HookRecord)).fn_hooked) as usize,
                fn_hooked,
            )?;
        } else {
            // we are the head; the anchor slot gets our target back
            rdata_write(os, previous, fn_hooked)?;
        }

        drop(guard);
        return Ok(());
    }
}

/// Free the side allocations owned by a record.
///
/// The context area is reclaimed. The chain lock is deliberately leaked: a
/// racing installer or uninstaller may have read the raw lock pointer just
/// before this hook was unlinked and must still be able to take a reference
/// on it. A mutex per uninstalled hook is the price of that window.
///
/// # Safety
/// The record must be unreachable from any chain.
unsafe fn release_record_resources(record: *mut HookRecord) {
    drop(Box::from_raw(std::ptr::addr_of!((*record).context).read()));
}
