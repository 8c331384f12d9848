//! Trampoline body templates.
//!
//! Each hook allocation is a [`crate::hook::HookRecord`] header immediately
//! followed by one of the hand-assembled machine-code bodies below. The
//! bodies reference header fields through RIP-relative operands; the
//! displacement slots are left zeroed here and patched at install time from
//! the actual header field offsets, so a body never bakes in the header
//! layout.
//!
//! Two displacement forms cannot be patched that way and constrain the
//! header instead: the `lea rax,[r10+0x54]` resume-label loads assume the
//! `context` field sits exactly 40 bytes before the body, and the
//! `mov [r10+0x20],rax` stores assume `extra` sits 32 bytes after
//! `context`. Both are asserted against the header layout in the hook
//! module's tests.

/// Register save area referenced by the trampoline bodies.
///
/// The integer slots are written at the fixed displacements the bodies
/// encode (`rcx` at +0x10, `r8` at +0x40, first SIMD slot at +0x80), so the
/// field order must not change. SIMD slots are 32 bytes wide to leave room
/// for ymm state even though the stock bodies only move xmm registers.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug)]
pub struct HookContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub xmm: [[u8; 32]; 16],
}

impl Default for HookContext {
    fn default() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            xmm: [[0; 32]; 16],
        }
    }
}

/// Header field a RIP-relative operand refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeaderField {
    Context,
    FnNew,
    FnHooked,
    Extra,
}

/// One displacement slot to patch: the byte offset of a disp32 inside the
/// body, and the header field its instruction must land on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RipPatch {
    pub disp_at: usize,
    pub field: HeaderField,
}

/// A trampoline shape: verbatim body bytes plus the displacement slots the
/// installer fills in.
#[derive(Clone, Copy, Debug)]
pub struct TrampolineTemplate {
    name: &'static str,
    bytes: &'static [u8],
    patches: &'static [RipPatch],
}

impl TrampolineTemplate {
    /// Template name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The body bytes, displacement slots still zeroed.
    pub(crate) fn bytes(&self) -> &'static [u8] {
        self.bytes
    }

    /// The displacement slots to patch at install time.
    pub(crate) fn patches(&self) -> &'static [RipPatch] {
        self.patches
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the body is empty; never true for the built-in shapes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Calls the hook function before the hooked one.
///
/// RCX/RDX/R8/R9 are captured into the context area, handed to the hook
/// function, restored, and control continues into the hooked function with
/// the caller's original return address.
pub static ENTRY: TrampolineTemplate = TrampolineTemplate {
    name: "entry",
    bytes: &[
        0x4C, 0x8D, 0x15, 0x00, 0x00, 0x00, 0x00, // lea    r10,[context]
        0x49, 0x8B, 0x02, //                          mov    rax,[r10]
        0x48, 0x89, 0x48, 0x10, //                    mov    [rax+0x10],rcx
        0x48, 0x89, 0x50, 0x18, //                    mov    [rax+0x18],rdx
        0x4C, 0x89, 0x40, 0x40, //                    mov    [rax+0x40],r8
        0x4C, 0x89, 0x48, 0x48, //                    mov    [rax+0x48],r9
        0x49, 0x8D, 0x42, 0x54, //                    lea    rax,[resume]
        0x48, 0x87, 0x04, 0x24, //                    xchg   [rsp],rax
        0x49, 0x89, 0x42, 0x20, //                    mov    [extra],rax
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_new]
        0x4C, 0x8B, 0x15, 0x00, 0x00, 0x00, 0x00, // mov    r10,[context]  <- resume
        0x49, 0x8B, 0x4A, 0x10, //                    mov    rcx,[r10+0x10]
        0x49, 0x8B, 0x52, 0x18, //                    mov    rdx,[r10+0x18]
        0x4D, 0x8B, 0x42, 0x40, //                    mov    r8,[r10+0x40]
        0x4D, 0x8B, 0x4A, 0x48, //                    mov    r9,[r10+0x48]
        0xFF, 0x35, 0x00, 0x00, 0x00, 0x00, //        push   [extra]
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_hooked]
    ],
    patches: &[
        RipPatch { disp_at: 3, field: HeaderField::Context },
        RipPatch { disp_at: 40, field: HeaderField::FnNew },
        RipPatch { disp_at: 47, field: HeaderField::Context },
        RipPatch { disp_at: 69, field: HeaderField::Extra },
        RipPatch { disp_at: 75, field: HeaderField::FnHooked },
    ],
};

/// Calls the hooked function first, the hook function after it.
///
/// The hooked function's return value is preserved across the hook function
/// call.
pub static EXIT: TrampolineTemplate = TrampolineTemplate {
    name: "exit",
    bytes: &[
        0x4C, 0x8D, 0x15, 0x00, 0x00, 0x00, 0x00, // lea    r10,[context]
        0x49, 0x8B, 0x02, //                          mov    rax,[r10]
        0x48, 0x89, 0x48, 0x10, //                    mov    [rax+0x10],rcx
        0x48, 0x89, 0x50, 0x18, //                    mov    [rax+0x18],rdx
        0x4C, 0x89, 0x40, 0x40, //                    mov    [rax+0x40],r8
        0x4C, 0x89, 0x48, 0x48, //                    mov    [rax+0x48],r9
        0x49, 0x8D, 0x42, 0x54, //                    lea    rax,[resume]
        0x48, 0x87, 0x04, 0x24, //                    xchg   [rsp],rax
        0x49, 0x89, 0x42, 0x20, //                    mov    [extra],rax
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_hooked]
        0x4C, 0x8B, 0x15, 0x00, 0x00, 0x00, 0x00, // mov    r10,[context]  <- resume
        0x49, 0x89, 0x02, //                          mov    [r10],rax
        0x49, 0x8B, 0x4A, 0x10, //                    mov    rcx,[r10+0x10]
        0x49, 0x8B, 0x52, 0x18, //                    mov    rdx,[r10+0x18]
        0x4D, 0x8B, 0x42, 0x40, //                    mov    r8,[r10+0x40]
        0x4D, 0x8B, 0x4A, 0x48, //                    mov    r9,[r10+0x48]
        0xFF, 0x15, 0x00, 0x00, 0x00, 0x00, //        call   [fn_new]
        0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, // mov    rax,[context]
        0x48, 0x8B, 0x00, //                          mov    rax,[rax]
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [extra]
    ],
    patches: &[
        RipPatch { disp_at: 3, field: HeaderField::Context },
        RipPatch { disp_at: 40, field: HeaderField::FnHooked },
        RipPatch { disp_at: 47, field: HeaderField::Context },
        RipPatch { disp_at: 72, field: HeaderField::FnNew },
        RipPatch { disp_at: 79, field: HeaderField::Context },
        RipPatch { disp_at: 88, field: HeaderField::Extra },
    ],
};

/// Calls the hooked function first, then tail-calls the hook function so
/// its return value replaces the hooked one's.
pub static RETURN_OVERRIDE: TrampolineTemplate = TrampolineTemplate {
    name: "return-override",
    bytes: &[
        0x4C, 0x8D, 0x15, 0x00, 0x00, 0x00, 0x00, // lea    r10,[context]
        0x49, 0x8B, 0x02, //                          mov    rax,[r10]
        0x48, 0x89, 0x48, 0x10, //                    mov    [rax+0x10],rcx
        0x48, 0x89, 0x50, 0x18, //                    mov    [rax+0x18],rdx
        0x4C, 0x89, 0x40, 0x40, //                    mov    [rax+0x40],r8
        0x4C, 0x89, 0x48, 0x48, //                    mov    [rax+0x48],r9
        0x49, 0x8D, 0x42, 0x54, //                    lea    rax,[resume]
        0x48, 0x87, 0x04, 0x24, //                    xchg   [rsp],rax
        0x49, 0x89, 0x42, 0x20, //                    mov    [extra],rax
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_hooked]
        0x4C, 0x8B, 0x15, 0x00, 0x00, 0x00, 0x00, // mov    r10,[context]  <- resume
        0x49, 0x8B, 0x4A, 0x10, //                    mov    rcx,[r10+0x10]
        0x49, 0x8B, 0x52, 0x18, //                    mov    rdx,[r10+0x18]
        0x4D, 0x8B, 0x42, 0x40, //                    mov    r8,[r10+0x40]
        0x4D, 0x8B, 0x4A, 0x48, //                    mov    r9,[r10+0x48]
        0xFF, 0x35, 0x00, 0x00, 0x00, 0x00, //        push   [extra]
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_new]
    ],
    patches: &[
        RipPatch { disp_at: 3, field: HeaderField::Context },
        RipPatch { disp_at: 40, field: HeaderField::FnHooked },
        RipPatch { disp_at: 47, field: HeaderField::Context },
        RipPatch { disp_at: 69, field: HeaderField::Extra },
        RipPatch { disp_at: 75, field: HeaderField::FnNew },
    ],
};

/// Captures every integer register into the context area and passes a
/// pointer to it as the hook function's only argument
/// (`fn(*mut HookContext)`). Registers are restored from the possibly
/// modified context before the hooked function runs.
pub static CONTEXT: TrampolineTemplate = TrampolineTemplate {
    name: "context",
    bytes: &[
        0x50, //                                      push   rax
        0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, // mov    rax,[context]
        0x8F, 0x00, //                                pop    [rax]
        0x48, 0x89, 0x58, 0x08, //                    mov    [rax+0x08],rbx
        0x48, 0x89, 0x48, 0x10, //                    mov    [rax+0x10],rcx
        0x48, 0x89, 0x50, 0x18, //                    mov    [rax+0x18],rdx
        0x48, 0x89, 0x60, 0x20, //                    mov    [rax+0x20],rsp
        0x48, 0x89, 0x68, 0x28, //                    mov    [rax+0x28],rbp
        0x48, 0x89, 0x70, 0x30, //                    mov    [rax+0x30],rsi
        0x48, 0x89, 0x78, 0x38, //                    mov    [rax+0x38],rdi
        0x4C, 0x89, 0x40, 0x40, //                    mov    [rax+0x40],r8
        0x4C, 0x89, 0x48, 0x48, //                    mov    [rax+0x48],r9
        0x4C, 0x89, 0x50, 0x50, //                    mov    [rax+0x50],r10
        0x4C, 0x89, 0x58, 0x58, //                    mov    [rax+0x58],r11
        0x4C, 0x89, 0x60, 0x60, //                    mov    [rax+0x60],r12
        0x4C, 0x89, 0x68, 0x68, //                    mov    [rax+0x68],r13
        0x4C, 0x89, 0x70, 0x70, //                    mov    [rax+0x70],r14
        0x4C, 0x89, 0x78, 0x78, //                    mov    [rax+0x78],r15
        0x48, 0x89, 0xC1, //                          mov    rcx,rax
        0x48, 0x8D, 0x05, 0x11, 0x00, 0x00, 0x00, // lea    rax,[resume]
        0x48, 0x87, 0x04, 0x24, //                    xchg   [rsp],rax
        0x48, 0x87, 0x05, 0x00, 0x00, 0x00, 0x00, // xchg   [extra],rax
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_new]
        0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, // mov    rax,[context]  <- resume
        0x48, 0x8B, 0x58, 0x08, //                    mov    rbx,[rax+0x08]
        0x48, 0x8B, 0x48, 0x10, //                    mov    rcx,[rax+0x10]
        0x48, 0x8B, 0x50, 0x18, //                    mov    rdx,[rax+0x18]
        0x48, 0x8B, 0x68, 0x28, //                    mov    rbp,[rax+0x28]
        0x48, 0x8B, 0x70, 0x30, //                    mov    rsi,[rax+0x30]
        0x48, 0x8B, 0x78, 0x38, //                    mov    rdi,[rax+0x38]
        0x4C, 0x8B, 0x40, 0x40, //                    mov    r8,[rax+0x40]
        0x4C, 0x8B, 0x48, 0x48, //                    mov    r9,[rax+0x48]
        0x4C, 0x8B, 0x60, 0x60, //                    mov    r12,[rax+0x60]
        0x4C, 0x8B, 0x68, 0x68, //                    mov    r13,[rax+0x68]
        0x4C, 0x8B, 0x70, 0x70, //                    mov    r14,[rax+0x70]
        0x4C, 0x8B, 0x78, 0x78, //                    mov    r15,[rax+0x78]
        0xFF, 0x35, 0x00, 0x00, 0x00, 0x00, //        push   [extra]
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, //        jmp    [fn_hooked]
    ],
    patches: &[
        RipPatch { disp_at: 4, field: HeaderField::Context },
        RipPatch { disp_at: 87, field: HeaderField::Extra },
        RipPatch { disp_at: 93, field: HeaderField::FnNew },
        RipPatch { disp_at: 100, field: HeaderField::Context },
        RipPatch { disp_at: 154, field: HeaderField::Extra },
        RipPatch { disp_at: 160, field: HeaderField::FnHooked },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> [&'static TrampolineTemplate; 4] {
        [&ENTRY, &EXIT, &RETURN_OVERRIDE, &CONTEXT]
    }

    #[test]
    fn test_body_lengths() {
        assert_eq!(ENTRY.len(), 79);
        assert_eq!(EXIT.len(), 92);
        assert_eq!(RETURN_OVERRIDE.len(), 79);
        assert_eq!(CONTEXT.len(), 164);
    }

    #[test]
    fn test_patch_slots_are_zeroed_and_in_bounds() {
        for template in all() {
            for patch in template.patches() {
                assert!(
                    patch.disp_at + 4 <= template.len(),
                    "{}: patch at {} runs past the body",
                    template.name(),
                    patch.disp_at
                );
                assert_eq!(
                    &template.bytes()[patch.disp_at..patch.disp_at + 4],
                    &[0, 0, 0, 0],
                    "{}: displacement slot at {} not zeroed",
                    template.name(),
                    patch.disp_at
                );
            }
        }
    }

    #[test]
    fn test_every_template_reaches_both_functions() {
        for template in all() {
            let fields: Vec<HeaderField> = template.patches().iter().map(|p| p.field).collect();
            assert!(fields.contains(&HeaderField::FnNew), "{}", template.name());
            assert!(
                fields.contains(&HeaderField::FnHooked),
                "{}",
                template.name()
            );
        }
    }

    #[test]
    fn test_context_resume_label() {
        // lea rax,[rip+0x11] at offset 73 must land on the resume block
        let bytes = CONTEXT.bytes();
        assert_eq!(&bytes[73..76], &[0x48, 0x8D, 0x05]);
        let disp = i32::from_le_bytes(bytes[76..80].try_into().unwrap());
        assert_eq!(73 + 7 + disp as usize, 97);
        // the resume block starts with mov rax,[context]
        assert_eq!(&bytes[97..100], &[0x48, 0x8B, 0x05]);
    }

    #[test]
    fn test_context_layout() {
        use std::mem::offset_of;

        assert_eq!(offset_of!(HookContext, rax), 0x00);
        assert_eq!(offset_of!(HookContext, rcx), 0x10);
        assert_eq!(offset_of!(HookContext, rsp), 0x20);
        assert_eq!(offset_of!(HookContext, r8), 0x40);
        assert_eq!(offset_of!(HookContext, r15), 0x78);
        assert_eq!(offset_of!(HookContext, xmm), 0x80);
        assert_eq!(std::mem::align_of::<HookContext>(), 16);
    }
}
