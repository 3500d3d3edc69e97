//! The M-mode supervisor: one owned context holding the hart, the installed
//! PMP windows and the service table.
//!
//! ```text
//!   Privileged --launch--> Sandboxed --trap--> Trapped --resume--> Sandboxed
//!                                                 |
//!                                                 +--fatal--> Halted
//! ```
//!
//! `Halted` is terminal. Every trap taken after it reports
//! [`FatalFault::AlreadyHalted`] without looking at the sandbox again.

use core::convert::Infallible;

use log::{debug, error, info};

use crate::machine::Machine;
use crate::pmp::{self, InstalledPmp, PmpDump, SandboxLayout};
use crate::privilege::{self, LaunchError, LaunchRequest, PrivilegeContext};
use crate::service::{
    DataWindow, InferDelivery, InferenceEngine, ServiceTable, TextProtocol, Uart, DEFAULT_SENTINEL,
};
use crate::syscall;
use crate::trap::{self, FatalFault, MachineEcallHook, TrapFrame, TrapOutcome, TrapRoute};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Privileged,
    Sandboxed,
    Trapped,
    Halted,
}

/// Board-level choices fixed at build time.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub layout: SandboxLayout,
    /// Range Infer and ReadCounters accept buffers from. Defaults to the
    /// installed data window.
    pub data_window: Option<DataWindow>,
    pub delivery: InferDelivery,
    pub sentinel: u8,
    pub machine_ecall: Option<MachineEcallHook>,
}

impl SupervisorConfig {
    pub const fn new(layout: SandboxLayout) -> Self {
        SupervisorConfig {
            layout,
            data_window: None,
            delivery: InferDelivery::Forward,
            sentinel: DEFAULT_SENTINEL,
            machine_ecall: None,
        }
    }

    pub const fn data_window(mut self, window: DataWindow) -> Self {
        self.data_window = Some(window);
        self
    }

    pub const fn delivery(mut self, delivery: InferDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub const fn sentinel(mut self, sentinel: u8) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub const fn machine_ecall(mut self, hook: MachineEcallHook) -> Self {
        self.machine_ecall = Some(hook);
        self
    }
}

pub struct Supervisor<M, U, E, P> {
    machine: M,
    services: ServiceTable<U, E, P>,
    layout: SandboxLayout,
    explicit_window: bool,
    machine_ecall: Option<MachineEcallHook>,
    installed: Option<InstalledPmp>,
    state: SupervisorState,
}

impl<M, U, E, P> Supervisor<M, U, E, P>
where
    M: Machine,
    U: Uart,
    E: InferenceEngine,
    P: TextProtocol,
{
    pub fn new(machine: M, uart: U, engine: E, protocol: P, config: SupervisorConfig) -> Self {
        // Without an explicit window nothing is accepted until `arm` installs
        // the PMP and adopts its data window.
        let window = config.data_window.unwrap_or(DataWindow::new(0, 0));
        let services = ServiceTable::new(uart, engine, protocol, window, config.delivery)
            .with_sentinel(config.sentinel);
        Supervisor {
            machine,
            services,
            layout: config.layout,
            explicit_window: config.data_window.is_some(),
            machine_ecall: config.machine_ecall,
            installed: None,
            state: SupervisorState::Privileged,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn installed(&self) -> Option<&InstalledPmp> {
        self.installed.as_ref()
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn services(&self) -> &ServiceTable<U, E, P> {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceTable<U, E, P> {
        &mut self.services
    }

    /// Install the sandbox windows. Idempotent once it has succeeded.
    pub fn arm(&mut self) -> Result<InstalledPmp, LaunchError> {
        if self.state != SupervisorState::Privileged {
            return Err(LaunchError::AlreadyLaunched);
        }
        if let Some(installed) = self.installed {
            return Ok(installed);
        }

        // Checked before any PMP write.
        let data = self.layout.windows()?.data;
        if self.explicit_window && !self.services.window().within(&data) {
            return Err(LaunchError::ServiceWindowOutsideData);
        }

        let installed = pmp::install_layout(&mut self.machine, &self.layout)?;
        if !self.explicit_window {
            self.services.set_window(DataWindow::from_region(&installed.windows().data));
        }
        debug!(
            "[PMP] entries:\n{}",
            PmpDump::new(&self.machine, installed.entries())
        );
        self.installed = Some(installed);
        Ok(installed)
    }

    /// Arm if needed, validate `request` against the installed windows and
    /// move to `Sandboxed`. The caller performs the switch itself with
    /// [`privilege::switch_to_sandbox`].
    pub fn prepare_launch(&mut self, request: &LaunchRequest) -> Result<PrivilegeContext, LaunchError> {
        let installed = self.arm()?;
        let context = PrivilegeContext::for_sandbox(&installed, request)?;
        info!(
            "[LAUNCH] sandbox entry={:#010x} buffer={:#010x}+{}",
            request.entry, request.buffer, request.buffer_len
        );
        self.state = SupervisorState::Sandboxed;
        Ok(context)
    }

    /// Install the PMP and drop into the sandbox. Only returns on error.
    pub fn launch(&mut self, request: &LaunchRequest) -> Result<Infallible, LaunchError> {
        let context = self.prepare_launch(request)?;
        privilege::switch_to_sandbox(&mut self.machine, context)
    }

    /// Route one trap. The caller restores the frame and `mret`s on
    /// [`TrapOutcome::Resume`] and halts the hart otherwise.
    pub fn handle_trap(&mut self, frame: &mut TrapFrame) -> TrapOutcome {
        if self.state == SupervisorState::Halted {
            return TrapOutcome::Halt(FatalFault::AlreadyHalted);
        }
        let resumed = self.state;
        self.state = SupervisorState::Trapped;
        self.machine.mask_interrupts();
        let from = self.machine.previous_privilege();

        let outcome = match trap::classify(&self.machine) {
            TrapRoute::UserEcall => {
                match syscall::trampoline(&mut self.machine, frame, &mut self.services) {
                    Ok(()) => TrapOutcome::Resume,
                    Err(fault) => TrapOutcome::Halt(fault),
                }
            }
            TrapRoute::MachineEcall => match self.machine_ecall {
                Some(hook) => {
                    let outcome = hook(frame);
                    if outcome == TrapOutcome::Resume {
                        syscall::skip_instruction(&mut self.machine);
                    }
                    outcome
                }
                None => TrapOutcome::Halt(FatalFault::MachineEcall {
                    mepc: self.machine.resume_address(),
                }),
            },
            TrapRoute::Fatal(fault) => TrapOutcome::Halt(fault),
        };

        match outcome {
            TrapOutcome::Resume => self.state = resumed,
            TrapOutcome::Halt(fault) => {
                error!("[TRAP] {} (from {:?} mode)", fault, from);
                error!("[TRAP] system halted");
                self.state = SupervisorState::Halted;
            }
        }
        outcome
    }

    /// Stop for good.
    pub fn halt(&mut self) -> ! {
        self.state = SupervisorState::Halted;
        self.machine.halt()
    }
}
