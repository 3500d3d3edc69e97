//! RV32 machine-mode back end.
//!
//! Named CSRs go through the `riscv` crate. The PMP CSRs are indexed, so
//! they are reached with inline `csrr`/`csrw` on a CSR number computed at
//! compile time for each index:
//!
//!   - `pmpcfg0..3`   = 0x3A0..0x3A3, four 8-bit entry configs each
//!   - `pmpaddr0..15` = 0x3B0..0x3BF
//!
//! The binary linking this module must export
//! `extern "C" fn handle_trap(frame: &mut TrapFrame)` and provide the
//! `_trap_stack_top` symbol. `handle_trap` returning means "restore and
//! `mret`".

use core::arch::{asm, naked_asm};

use riscv::register::{
    mcause, mcycle, mcycleh, mepc, minstret, minstreth, mscratch, mstatus, mtval, mtvec,
};

use crate::machine::{CounterCsr, Machine, Privilege, UserEntry};
use crate::trap::TrapFrame;

const PMPCFG0: usize = 0x3A0;
const PMPADDR0: usize = 0x3B0;
const PMP_ENTRIES: usize = 16;

macro_rules! csr_read_indexed {
    ($base:expr, $index:expr; $($n:literal)*) => {
        match $index {
            $($n => {
                let value: u32;
                unsafe { asm!("csrr {0}, {csr}", out(reg) value, csr = const $base + $n) };
                value
            })*
            _ => 0,
        }
    };
}

macro_rules! csr_write_indexed {
    ($base:expr, $index:expr, $value:expr; $($n:literal)*) => {
        match $index {
            $($n => unsafe { asm!("csrw {csr}, {0}", in(reg) $value, csr = const $base + $n) },)*
            _ => {}
        }
    };
}

fn read_pmpcfg(reg: usize) -> u32 {
    csr_read_indexed!(PMPCFG0, reg; 0 1 2 3)
}

fn write_pmpcfg(reg: usize, value: u32) {
    csr_write_indexed!(PMPCFG0, reg, value; 0 1 2 3)
}

fn read_pmpaddr(index: usize) -> u32 {
    csr_read_indexed!(PMPADDR0, index; 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15)
}

fn write_pmpaddr(index: usize, value: u32) {
    csr_write_indexed!(PMPADDR0, index, value; 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15)
}

/// The hart this code runs on.
pub struct Hart {
    _private: (),
}

impl Hart {
    /// # Safety
    ///
    /// Single hart, M-mode only. Every live `Hart` drives the same CSRs, so
    /// callers must not let two of them interleave within one trap.
    pub unsafe fn claim() -> Self {
        Hart { _private: () }
    }

    /// Point `mtvec` at [`trap_entry`] and `mscratch` at the trap stack.
    pub fn install_trap_vector(&mut self) {
        extern "C" {
            static _trap_stack_top: u8;
        }
        let stack_top = unsafe { core::ptr::addr_of!(_trap_stack_top) } as usize;
        #[allow(unused_unsafe)]
        unsafe {
            mscratch::write(stack_top);
            mtvec::write(trap_entry as usize, mtvec::TrapMode::Direct);
        }
    }
}

impl Machine for Hart {
    fn pmp_entry_count(&self) -> usize {
        PMP_ENTRIES
    }

    fn pmpcfg(&self, index: usize) -> u8 {
        let shift = (index % 4) * 8;
        (read_pmpcfg(index / 4) >> shift) as u8
    }

    fn pmpaddr(&self, index: usize) -> u32 {
        read_pmpaddr(index)
    }

    fn write_pmp(&mut self, index: usize, cfg: u8, addr: u32) {
        write_pmpaddr(index, addr);

        let shift = (index % 4) * 8;
        let reg = read_pmpcfg(index / 4);
        let value = (reg & !(0xFF << shift)) | (u32::from(cfg) << shift);
        write_pmpcfg(index / 4, value);
    }

    fn trap_cause(&self) -> u32 {
        mcause::read().bits() as u32
    }

    fn trap_value(&self) -> u32 {
        mtval::read() as u32
    }

    fn resume_address(&self) -> u32 {
        mepc::read() as u32
    }

    fn set_resume_address(&mut self, addr: u32) {
        #[allow(unused_unsafe)]
        unsafe {
            mepc::write(addr as usize)
        };
    }

    fn previous_privilege(&self) -> Privilege {
        match mstatus::read().mpp() {
            mstatus::MPP::User => Privilege::User,
            mstatus::MPP::Supervisor => Privilege::Supervisor,
            mstatus::MPP::Machine => Privilege::Machine,
        }
    }

    fn set_previous_privilege(&mut self, privilege: Privilege) {
        let mpp = match privilege {
            Privilege::User => mstatus::MPP::User,
            Privilege::Supervisor => mstatus::MPP::Supervisor,
            Privilege::Machine => mstatus::MPP::Machine,
        };
        #[allow(unused_unsafe)]
        unsafe {
            mstatus::set_mpp(mpp)
        };
    }

    fn mask_interrupts(&mut self) {
        #[allow(unused_unsafe)]
        unsafe {
            mstatus::clear_mie()
        };
    }

    fn read_counter(&self, csr: CounterCsr) -> u32 {
        (match csr {
            CounterCsr::Cycle => mcycle::read(),
            CounterCsr::CycleH => mcycleh::read(),
            CounterCsr::Instret => minstret::read(),
            CounterCsr::InstretH => minstreth::read(),
        }) as u32
    }

    fn fetch_halfword(&self, addr: u32) -> u16 {
        unsafe { (addr as usize as *const u16).read_volatile() }
    }

    fn user_bytes(&self, addr: u32, len: u32) -> &[u8] {
        unsafe { core::slice::from_raw_parts(addr as usize as *const u8, len as usize) }
    }

    fn user_bytes_mut(&mut self, addr: u32, len: u32) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(addr as usize as *mut u8, len as usize) }
    }

    fn enter_user(&mut self, entry: &UserEntry) -> ! {
        unsafe {
            asm!(
                // Traps from U-mode swap onto the trap stack through mscratch.
                "la     t0, _trap_stack_top",
                "csrw   mscratch, t0",
                "mv     sp, {sp}",
                "mret",
                sp = in(reg) entry.stack_top,
                in("a0") entry.a0,
                in("a1") entry.a1,
                out("t0") _,
                options(noreturn),
            );
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            unsafe { asm!("wfi") };
        }
    }
}

/// Trap vector.
///
/// Swaps onto the trap stack, spills x1..x31 into a [`TrapFrame`] (the
/// interrupted `sp` comes out of `mscratch`), calls `handle_trap`, then
/// re-arms `mscratch`, restores every register with `sp` last and `mret`s.
#[unsafe(naked)]
#[no_mangle]
#[link_section = ".text.trap"]
pub unsafe extern "C" fn trap_entry() {
    naked_asm!(
        "csrrw  sp, mscratch, sp",
        "addi   sp, sp, -128",

        "sw     x1,   4(sp)",
        "sw     x3,  12(sp)",
        "sw     x4,  16(sp)",
        "sw     x5,  20(sp)",
        "sw     x6,  24(sp)",
        "sw     x7,  28(sp)",
        "sw     x8,  32(sp)",
        "sw     x9,  36(sp)",
        "sw     x10, 40(sp)",
        "sw     x11, 44(sp)",
        "sw     x12, 48(sp)",
        "sw     x13, 52(sp)",
        "sw     x14, 56(sp)",
        "sw     x15, 60(sp)",
        "sw     x16, 64(sp)",
        "sw     x17, 68(sp)",
        "sw     x18, 72(sp)",
        "sw     x19, 76(sp)",
        "sw     x20, 80(sp)",
        "sw     x21, 84(sp)",
        "sw     x22, 88(sp)",
        "sw     x23, 92(sp)",
        "sw     x24, 96(sp)",
        "sw     x25, 100(sp)",
        "sw     x26, 104(sp)",
        "sw     x27, 108(sp)",
        "sw     x28, 112(sp)",
        "sw     x29, 116(sp)",
        "sw     x30, 120(sp)",
        "sw     x31, 124(sp)",
        "csrr   t0, mscratch",
        "sw     t0,   8(sp)",
        "sw     zero, 0(sp)",

        "mv     a0, sp",
        "call   handle_trap",

        "addi   t0, sp, 128",
        "csrw   mscratch, t0",

        "lw     x1,   4(sp)",
        "lw     x3,  12(sp)",
        "lw     x4,  16(sp)",
        "lw     x5,  20(sp)",
        "lw     x6,  24(sp)",
        "lw     x7,  28(sp)",
        "lw     x8,  32(sp)",
        "lw     x9,  36(sp)",
        "lw     x10, 40(sp)",
        "lw     x11, 44(sp)",
        "lw     x12, 48(sp)",
        "lw     x13, 52(sp)",
        "lw     x14, 56(sp)",
        "lw     x15, 60(sp)",
        "lw     x16, 64(sp)",
        "lw     x17, 68(sp)",
        "lw     x18, 72(sp)",
        "lw     x19, 76(sp)",
        "lw     x20, 80(sp)",
        "lw     x21, 84(sp)",
        "lw     x22, 88(sp)",
        "lw     x23, 92(sp)",
        "lw     x24, 96(sp)",
        "lw     x25, 100(sp)",
        "lw     x26, 104(sp)",
        "lw     x27, 108(sp)",
        "lw     x28, 112(sp)",
        "lw     x29, 116(sp)",
        "lw     x30, 120(sp)",
        "lw     x31, 124(sp)",
        "lw     sp,   8(sp)",
        "mret",
    )
}

// The frame layout above is hard-coded.
const _: () = assert!(core::mem::size_of::<TrapFrame>() == 128);
