//! The U-mode `ecall` path.
//!
//! ABI: syscall id in `a7`, arguments in `a0`/`a1`, result (if any) in `a0`.
//!
//! | id | call         | a0          | a1  | returns     |
//! |----|--------------|-------------|-----|-------------|
//! | 0  | Infer        | ptr         | len | -           |
//! | 1  | UartPutchar  | byte        | -   | -           |
//! | 2  | UartGetchar  | -           | -   | byte in a0  |
//! | 99 | ReadCounters | ptr or 0    | len | -           |

use log::{trace, warn};

use crate::machine::{Machine, Privilege};
use crate::service::{InferenceEngine, ServiceResult, ServiceTable, TextProtocol, Uart};
use crate::trap::{FatalFault, TrapFrame};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallId {
    Infer = 0,
    UartPutchar = 1,
    UartGetchar = 2,
    ReadCounters = 99,
}

impl TryFrom<u32> for SyscallId {
    type Error = u32;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(SyscallId::Infer),
            1 => Ok(SyscallId::UartPutchar),
            2 => Ok(SyscallId::UartGetchar),
            99 => Ok(SyscallId::ReadCounters),
            other => Err(other),
        }
    }
}

/// Raw call as the sandbox issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub id: u32,
    pub arg0: u32,
    pub arg1: u32,
}

impl SyscallRequest {
    pub fn from_frame(frame: &TrapFrame) -> Self {
        SyscallRequest {
            id: frame.a7(),
            arg0: frame.a0(),
            arg1: frame.a1(),
        }
    }
}

/// Length of the instruction whose first halfword is `halfword`: 4 when the
/// low two bits are `0b11`, 2 for a compressed instruction.
pub fn instruction_length(halfword: u16) -> u32 {
    if halfword & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

/// Move `mepc` past the instruction it points at.
pub fn skip_instruction<M: Machine>(machine: &mut M) {
    let mepc = machine.resume_address();
    let len = instruction_length(machine.fetch_halfword(mepc));
    machine.set_resume_address(mepc.wrapping_add(len));
}

/// Service one U-mode `ecall` and prepare the return to the sandbox.
///
/// A rejected call still resumes the sandbox, past the `ecall`, with `a0`
/// unchanged. Only an unknown id is fatal, and then `mepc` is left alone.
pub fn trampoline<M, U, E, P>(
    machine: &mut M,
    frame: &mut TrapFrame,
    services: &mut ServiceTable<U, E, P>,
) -> Result<(), FatalFault>
where
    M: Machine,
    U: Uart,
    E: InferenceEngine,
    P: TextProtocol,
{
    let request = SyscallRequest::from_frame(frame);
    let id = SyscallId::try_from(request.id).map_err(|id| FatalFault::UnknownSyscall {
        id,
        mepc: machine.resume_address(),
    })?;
    trace!(
        "[SYSCALL] {:?} a0={:#010x} a1={:#010x}",
        id,
        request.arg0,
        request.arg1
    );

    match services.dispatch(machine, id, &request) {
        Ok(ServiceResult::Value(v)) => frame.set_a0(v),
        Ok(ServiceResult::None) => {}
        Err(rejection) => warn!("[SYSCALL] {:?} rejected: {}", id, rejection),
    }

    skip_instruction(machine);
    machine.set_previous_privilege(Privilege::User);
    Ok(())
}
