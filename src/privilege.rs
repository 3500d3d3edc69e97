//! The one-way drop from M-mode into the sandbox.

use core::fmt;

use log::info;

use crate::machine::{Machine, Privilege, UserEntry};
use crate::pmp::{InstalledPmp, PmpError};

/// RISC-V psABI stack alignment.
const STACK_ALIGN: u32 = 16;

/// Where and how the sandbox starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub entry: u32,
    pub stack_top: u32,
    /// Passed in `a0`/`a1`. `(0, 0)` for none.
    pub buffer: u32,
    pub buffer_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    Pmp(PmpError),
    /// The supervisor is not in the privileged, pre-launch state.
    AlreadyLaunched,
    EntryOutsideCode { entry: u32 },
    StackOutsideData { stack_top: u32 },
    MisalignedStack { stack_top: u32 },
    BufferOutsideData { ptr: u32, len: u32 },
    /// The Infer window reaches memory the sandbox cannot address.
    ServiceWindowOutsideData,
}

impl From<PmpError> for LaunchError {
    fn from(e: PmpError) -> Self {
        LaunchError::Pmp(e)
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::Pmp(e) => write!(f, "PMP setup failed: {}", e),
            LaunchError::AlreadyLaunched => write!(f, "sandbox already launched"),
            LaunchError::EntryOutsideCode { entry } => {
                write!(f, "entry {:#010x} outside the code window", entry)
            }
            LaunchError::StackOutsideData { stack_top } => {
                write!(f, "stack top {:#010x} outside the data window", stack_top)
            }
            LaunchError::MisalignedStack { stack_top } => {
                write!(f, "stack top {:#010x} not 16-byte aligned", stack_top)
            }
            LaunchError::BufferOutsideData { ptr, len } => {
                write!(f, "buffer ({:#010x}, len={}) outside the data window", ptr, len)
            }
            LaunchError::ServiceWindowOutsideData => {
                write!(f, "service data window not covered by the sandbox data window")
            }
        }
    }
}

/// Validated register state for the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeContext {
    target: Privilege,
    resume: u32,
    user: UserEntry,
}

impl PrivilegeContext {
    /// Check `request` against the windows that are actually installed.
    pub fn for_sandbox(installed: &InstalledPmp, request: &LaunchRequest) -> Result<Self, LaunchError> {
        let windows = installed.windows();

        if request.entry % 2 != 0 || !windows.code.contains(request.entry, 2) {
            return Err(LaunchError::EntryOutsideCode {
                entry: request.entry,
            });
        }

        let stack_top = request.stack_top;
        if stack_top % STACK_ALIGN != 0 {
            return Err(LaunchError::MisalignedStack { stack_top });
        }
        // The first push lands just below the top.
        if stack_top <= windows.data.base() || u64::from(stack_top) > windows.data.end() {
            return Err(LaunchError::StackOutsideData { stack_top });
        }

        if request.buffer_len != 0 && !windows.data.contains(request.buffer, request.buffer_len) {
            return Err(LaunchError::BufferOutsideData {
                ptr: request.buffer,
                len: request.buffer_len,
            });
        }

        Ok(PrivilegeContext {
            target: Privilege::User,
            resume: request.entry,
            user: UserEntry {
                stack_top,
                a0: request.buffer,
                a1: request.buffer_len,
            },
        })
    }

    pub fn target(&self) -> Privilege {
        self.target
    }

    pub fn resume(&self) -> u32 {
        self.resume
    }

    pub fn user(&self) -> &UserEntry {
        &self.user
    }
}

/// Set `mepc` and `MPP`, load `sp`/`a0`/`a1` and `mret`.
pub fn switch_to_sandbox<M: Machine>(machine: &mut M, context: PrivilegeContext) -> ! {
    info!(
        "[LAUNCH] entering U-mode at {:#010x}, sp={:#010x}",
        context.resume, context.user.stack_top
    );
    machine.set_resume_address(context.resume);
    machine.set_previous_privilege(context.target);
    machine.enter_user(&context.user)
}
