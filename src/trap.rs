//! Trap classification.
//!
//! Every synchronous exception and every interrupt lands in the same
//! assembly entry, which spills the integer registers into a [`TrapFrame`]
//! and hands it to the supervisor. This module decodes `mcause` and decides
//! where the trap goes: the syscall trampoline, the machine-ecall hook, or a
//! fatal halt.

use core::fmt;

use crate::machine::Machine;

// Register indices into `TrapFrame::regs` (x0..x31).
pub const REG_A0: usize = 10;
pub const REG_A1: usize = 11;
pub const REG_A7: usize = 17;

/// `mcause` bit 31: set for interrupts, clear for exceptions.
const INTERRUPT_BIT: u32 = 1 << 31;

/// Integer register file as saved by the trap entry. Slot 0 is never written;
/// slot 2 holds the interrupted `sp`, recovered from `mscratch`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: [u32; 32],
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame { regs: [0; 32] }
    }

    pub fn a0(&self) -> u32 {
        self.regs[REG_A0]
    }

    pub fn a1(&self) -> u32 {
        self.regs[REG_A1]
    }

    pub fn a7(&self) -> u32 {
        self.regs[REG_A7]
    }

    pub fn set_a0(&mut self, value: u32) {
        self.regs[REG_A0] = value;
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Synchronous exception codes (`mcause` values, privileged ISA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    SupervisorEnvCall,
    MachineEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(u32),
}

impl From<u32> for Exception {
    fn from(code: u32) -> Self {
        match code {
            0 => Exception::InstructionMisaligned,
            1 => Exception::InstructionFault,
            2 => Exception::IllegalInstruction,
            3 => Exception::Breakpoint,
            4 => Exception::LoadMisaligned,
            5 => Exception::LoadFault,
            6 => Exception::StoreMisaligned,
            7 => Exception::StoreFault,
            8 => Exception::UserEnvCall,
            9 => Exception::SupervisorEnvCall,
            11 => Exception::MachineEnvCall,
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            other => Exception::Unknown(other),
        }
    }
}

/// Decoded `mcause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Interrupt(u32),
    Exception(Exception),
}

impl TrapCause {
    pub fn from_mcause(mcause: u32) -> Self {
        let code = mcause & !INTERRUPT_BIT;
        if mcause & INTERRUPT_BIT != 0 {
            TrapCause::Interrupt(code)
        } else {
            TrapCause::Exception(Exception::from(code))
        }
    }
}

/// Everything that stops the hart for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalFault {
    InstructionMisaligned { mepc: u32, mtval: u32 },
    InstructionFault { mepc: u32, mtval: u32 },
    IllegalInstruction { mepc: u32, instruction: u32 },
    Breakpoint { mepc: u32 },
    LoadFault { mepc: u32, addr: u32 },
    StoreFault { mepc: u32, addr: u32 },
    Interrupt { code: u32, mepc: u32 },
    /// Any other exception code.
    Unexpected { cause: u32, mepc: u32, mtval: u32 },
    /// `ecall` from M-mode with no hook installed.
    MachineEcall { mepc: u32 },
    UnknownSyscall { id: u32, mepc: u32 },
    /// A trap arrived after the supervisor had already halted.
    AlreadyHalted,
}

fn interrupt_name(code: u32) -> &'static str {
    match code {
        3 => "machine software",
        7 => "machine timer",
        11 => "machine external",
        16..=31 => "platform (fast)",
        _ => "reserved",
    }
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FatalFault::InstructionMisaligned { mepc, mtval } => write!(
                f,
                "instruction address misaligned: mtval={:#010x} mepc={:#010x}",
                mtval, mepc
            ),
            FatalFault::InstructionFault { mepc, mtval } => write!(
                f,
                "instruction access fault: mtval={:#010x} mepc={:#010x}",
                mtval, mepc
            ),
            FatalFault::IllegalInstruction { mepc, instruction } => write!(
                f,
                "illegal instruction {:#010x} at mepc={:#010x}",
                instruction, mepc
            ),
            FatalFault::Breakpoint { mepc } => write!(f, "breakpoint at mepc={:#010x}", mepc),
            FatalFault::LoadFault { mepc, addr } => write!(
                f,
                "load access fault: mtval={:#010x} mepc={:#010x}",
                addr, mepc
            ),
            FatalFault::StoreFault { mepc, addr } => write!(
                f,
                "store access fault: mtval={:#010x} mepc={:#010x}",
                addr, mepc
            ),
            FatalFault::Interrupt { code, mepc } => write!(
                f,
                "unexpected {} interrupt {} at mepc={:#010x}",
                interrupt_name(code),
                code,
                mepc
            ),
            FatalFault::Unexpected { cause, mepc, mtval } => write!(
                f,
                "unexpected trap: mcause={:#010x} mtval={:#010x} mepc={:#010x}",
                cause, mtval, mepc
            ),
            FatalFault::MachineEcall { mepc } => {
                write!(f, "ecall from M-mode at mepc={:#010x}", mepc)
            }
            FatalFault::UnknownSyscall { id, mepc } => {
                write!(f, "unknown syscall id {} at mepc={:#010x}", id, mepc)
            }
            FatalFault::AlreadyHalted => write!(f, "trap after halt"),
        }
    }
}

/// What the assembly trap entry does once the supervisor returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Restore the frame and `mret`.
    Resume,
    /// Stop the hart.
    Halt(FatalFault),
}

/// Where a trap is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapRoute {
    UserEcall,
    MachineEcall,
    Fatal(FatalFault),
}

/// Read `mcause`/`mtval`/`mepc` and pick a route.
pub fn classify<M: Machine>(machine: &M) -> TrapRoute {
    let cause = machine.trap_cause();
    let mepc = machine.resume_address();
    let mtval = machine.trap_value();

    let exception = match TrapCause::from_mcause(cause) {
        TrapCause::Interrupt(code) => return TrapRoute::Fatal(FatalFault::Interrupt { code, mepc }),
        TrapCause::Exception(e) => e,
    };

    let fault = match exception {
        Exception::UserEnvCall => return TrapRoute::UserEcall,
        Exception::MachineEnvCall => return TrapRoute::MachineEcall,
        Exception::InstructionMisaligned => FatalFault::InstructionMisaligned { mepc, mtval },
        Exception::InstructionFault => FatalFault::InstructionFault { mepc, mtval },
        Exception::IllegalInstruction => FatalFault::IllegalInstruction {
            mepc,
            instruction: mtval,
        },
        Exception::Breakpoint => FatalFault::Breakpoint { mepc },
        Exception::LoadFault => FatalFault::LoadFault { mepc, addr: mtval },
        Exception::StoreFault => FatalFault::StoreFault { mepc, addr: mtval },
        _ => FatalFault::Unexpected { cause, mepc, mtval },
    };
    TrapRoute::Fatal(fault)
}

/// Optional handler for `ecall` issued by M-mode code. Returning
/// [`TrapOutcome::Resume`] resumes after the `ecall` instruction.
pub type MachineEcallHook = fn(&mut TrapFrame) -> TrapOutcome;
