//! AArch64 implementation of [`Platform`](super::Platform).

use core::arch::{asm, global_asm};

use super::{Platform, SmcResponse, TrampolineInfo, PSCI_SYSTEM_OFF, PSCI_SYSTEM_RESET};
use crate::recovery::{RecoveryContext, CONTEXT_BYTES, TRAMPOLINE_SENTINEL};

// One page holding both the armed call and the trampoline, so the region
// advertised to the applet covers every instruction the resume path runs.
//
// Recovery context slots (u64): 0..=10 x19..x29, 11 x30, 12 sp, 13..=20 d8..d15.
// x19 holds DAIF across the call; the caller's x19/x30 sit on the stack.
global_asm!(
    ".text",
    ".balign 4096",
    ".global sl_trampoline_page",
    "sl_trampoline_page:",
    "",
    // x0 = fid, x1..x3 = args, x4 = recovery context
    ".global sl_armed_smc",
    "sl_armed_smc:",
    "    stp     x19, x30, [sp, #-16]!",
    "    mrs     x19, daif",
    "    stp     x19, x20, [x4, #0]",
    "    stp     x21, x22, [x4, #16]",
    "    stp     x23, x24, [x4, #32]",
    "    stp     x25, x26, [x4, #48]",
    "    stp     x27, x28, [x4, #64]",
    "    stp     x29, x30, [x4, #80]",
    "    mov     x9, sp",
    "    str     x9, [x4, #96]",
    "    stp     d8, d9, [x4, #104]",
    "    stp     d10, d11, [x4, #120]",
    "    stp     d12, d13, [x4, #136]",
    "    stp     d14, d15, [x4, #152]",
    "    mrs     x9, ctr_el0",
    "    ubfx    x9, x9, #16, #4",
    "    mov     x10, #4",
    "    lsl     x10, x10, x9",
    "    sub     x11, x10, #1",
    "    bic     x12, x4, x11",
    "    add     x13, x4, #{ctx_bytes}",
    "2:  dc      civac, x12",
    "    add     x12, x12, x10",
    "    cmp     x12, x13",
    "    b.lo    2b",
    "    dsb     sy",
    "    msr     daifset, #2",
    "    smc     #0",
    "sl_armed_smc_return:",
    "    msr     daif, x19",
    "    ldp     x19, x30, [sp], #16",
    "    ret",
    "",
    // x0 = &TzArgs::tb_data, whose first word is the recovery context
    ".global sl_trampoline_entry",
    "sl_trampoline_entry:",
    "    ldr     x4, [x0]",
    "    ldp     x19, x20, [x4, #0]",
    "    ldp     x21, x22, [x4, #16]",
    "    ldp     x23, x24, [x4, #32]",
    "    ldp     x25, x26, [x4, #48]",
    "    ldp     x27, x28, [x4, #64]",
    "    ldp     x29, x30, [x4, #80]",
    "    ldr     x9, [x4, #96]",
    "    mov     sp, x9",
    "    ldp     d8, d9, [x4, #104]",
    "    ldp     d10, d11, [x4, #120]",
    "    ldp     d12, d13, [x4, #136]",
    "    ldp     d14, d15, [x4, #152]",
    "    movz    x0, #{s0}",
    "    movk    x0, #{s1}, lsl #16",
    "    movk    x0, #{s2}, lsl #32",
    "    movk    x0, #{s3}, lsl #48",
    "    b       sl_armed_smc_return",
    "",
    ".balign 4096",
    ".global sl_trampoline_page_end",
    "sl_trampoline_page_end:",
    ctx_bytes = const CONTEXT_BYTES,
    s0 = const TRAMPOLINE_SENTINEL & 0xffff,
    s1 = const (TRAMPOLINE_SENTINEL >> 16) & 0xffff,
    s2 = const (TRAMPOLINE_SENTINEL >> 32) & 0xffff,
    s3 = const (TRAMPOLINE_SENTINEL >> 48) & 0xffff,
);

extern "C" {
    fn sl_armed_smc(fid: u64, a1: u64, a2: u64, a3: u64, context: *mut RecoveryContext) -> u64;
    fn sl_trampoline_entry();
    static sl_trampoline_page: u8;
    static sl_trampoline_page_end: u8;
}

/// Masks IRQs until dropped, then restores the previous DAIF value.
pub struct IrqGuard {
    daif: u64,
}

impl IrqGuard {
    #[inline(always)]
    pub fn new() -> Self {
        let daif: u64;
        unsafe {
            asm!(
                "mrs {0}, daif",
                "msr daifset, #2",
                out(reg) daif,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self { daif }
    }
}

impl Drop for IrqGuard {
    #[inline(always)]
    fn drop(&mut self) {
        unsafe {
            asm!(
                "msr daif, {0}",
                in(reg) self.daif,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

fn dcache_line_size() -> u64 {
    let ctr: u64;
    unsafe { asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags)) };
    4 << ((ctr >> 16) & 0xf)
}

/// `smc #0` following SMCCC: x0..x3 in, x0..x17 may be clobbered.
fn raw_smc(fid: u32, args: [u64; 6]) -> SmcResponse {
    let mut regs = [0u64; 7];
    let _irq = IrqGuard::new();
    unsafe {
        asm!(
            "smc #0",
            inout("x0") u64::from(fid) => regs[0],
            inout("x1") args[0] => regs[1],
            inout("x2") args[1] => regs[2],
            inout("x3") args[2] => regs[3],
            inout("x4") args[3] => regs[4],
            inout("x5") args[4] => regs[5],
            inout("x6") args[5] => regs[6],
            out("x7") _, out("x8") _, out("x9") _, out("x10") _, out("x11") _,
            out("x12") _, out("x13") _, out("x14") _, out("x15") _, out("x16") _,
            out("x17") _,
            options(nostack)
        );
    }
    regs.into()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64;

impl Platform for Aarch64 {
    fn current_el(&self) -> u8 {
        let el: u64;
        unsafe { asm!("mrs {0}, CurrentEL", out(reg) el, options(nomem, nostack, preserves_flags)) };
        ((el >> 2) & 0x3) as u8
    }

    fn clean_dcache_range(&self, start: u64, len: u64) {
        let line = dcache_line_size();
        let end = start.saturating_add(len);
        let mut addr = start & !(line - 1);
        while addr < end {
            unsafe { asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags)) };
            addr += line;
        }
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
    }

    fn smc(&self, fid: u32, args: [u64; 3]) -> u64 {
        raw_smc(fid, [args[0], args[1], args[2], 0, 0, 0]).status()
    }

    fn smc_ext(&self, fid: u32, args: [u64; 6]) -> SmcResponse {
        raw_smc(fid, args)
    }

    fn armed_smc(&self, context: &mut RecoveryContext, fid: u32, args: [u64; 3]) -> u64 {
        // The asm routine masks IRQs itself and restores DAIF on both paths.
        unsafe { sl_armed_smc(u64::from(fid), args[0], args[1], args[2], context) }
    }

    fn trampoline(&self) -> TrampolineInfo {
        let base = unsafe { core::ptr::addr_of!(sl_trampoline_page) } as u64;
        let end = unsafe { core::ptr::addr_of!(sl_trampoline_page_end) } as u64;
        TrampolineInfo {
            entry: sl_trampoline_entry as usize as u64,
            base,
            size: end - base,
        }
    }

    fn reset(&self) -> ! {
        self.smc(PSCI_SYSTEM_RESET, [0; 3]);
        self.spin()
    }

    fn power_off(&self) -> ! {
        self.smc(PSCI_SYSTEM_OFF, [0; 3]);
        self.spin()
    }

    fn spin(&self) -> ! {
        loop {
            unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
        }
    }
}
