//! M-mode supervisor for a PMP-fenced U-mode sandbox on RV32.
//!
//! The supervisor programs the PMP so the untrusted payload can only reach
//! its own code and data, drops into U-mode, and from then on only regains
//! control through traps. A U-mode `ecall` is the one way back in that
//! returns to the sandbox; everything else halts the hart.
//!
//! All hardware access goes through [`machine::Machine`], so everything
//! except `hal::riscv32` builds and tests on the host.

#![cfg_attr(not(test), no_std)]

pub mod hal;
pub mod machine;
pub mod pmp;
pub mod privilege;
pub mod region;
pub mod service;
pub mod supervisor;
pub mod syscall;
pub mod trap;

pub use machine::{CounterCsr, Machine, Privilege, UserEntry};
pub use pmp::{InstalledPmp, IsolationLevel, PmpError, SandboxLayout, Window};
pub use privilege::{LaunchError, LaunchRequest, PrivilegeContext};
pub use region::{EncodeError, MemoryRegion, Permissions, ProtectionEntry};
pub use service::{
    DataWindow, InferDelivery, InferenceEngine, InferenceError, Rejection, ServiceResult,
    TextProtocol, Uart,
};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorState};
pub use syscall::{SyscallId, SyscallRequest};
pub use trap::{FatalFault, TrapFrame, TrapOutcome};
