//! The privileged operations the supervisor needs from the hart.
//!
//! Everything that touches a CSR, executes `mret`/`wfi`, or dereferences a
//! sandbox address goes through [`Machine`]. The trap, syscall, PMP and launch
//! logic above it is ordinary control flow and runs unchanged against a mock
//! on the host; `hal::riscv32` provides the real implementation.

/// Privilege level recorded in `mstatus.MPP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
}

/// 32-bit halves of the performance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCsr {
    Cycle,
    CycleH,
    Instret,
    InstretH,
}

/// Register values the sandbox starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub stack_top: u32,
    pub a0: u32,
    pub a1: u32,
}

pub trait Machine {
    /// Number of PMP entries implemented by the hart.
    fn pmp_entry_count(&self) -> usize;

    /// Raw `pmpcfg` octet of entry `index`.
    fn pmpcfg(&self, index: usize) -> u8;

    /// Raw `pmpaddr` of entry `index`.
    fn pmpaddr(&self, index: usize) -> u32;

    /// Program entry `index`. The address must be written before the config
    /// octet: once `L` is set both are frozen until reset.
    fn write_pmp(&mut self, index: usize, cfg: u8, addr: u32);

    /// `mcause`.
    fn trap_cause(&self) -> u32;

    /// `mtval`: faulting address or instruction bits, cause dependent.
    fn trap_value(&self) -> u32;

    /// `mepc`.
    fn resume_address(&self) -> u32;

    fn set_resume_address(&mut self, addr: u32);

    /// `mstatus.MPP`: the privilege `mret` will drop to.
    fn previous_privilege(&self) -> Privilege;

    fn set_previous_privilege(&mut self, privilege: Privilege);

    /// Clear `mstatus.MIE`.
    fn mask_interrupts(&mut self);

    fn read_counter(&self, csr: CounterCsr) -> u32;

    /// Fetch the halfword at `addr`, used to size the trapping instruction.
    fn fetch_halfword(&self, addr: u32) -> u16;

    /// Borrow sandbox memory. Callers bounds-check against the granted window
    /// first; implementations do not.
    fn user_bytes(&self, addr: u32, len: u32) -> &[u8];

    fn user_bytes_mut(&mut self, addr: u32, len: u32) -> &mut [u8];

    /// Load `sp`/`a0`/`a1` and `mret` into the sandbox. `mepc` and `MPP` are
    /// already set by the caller.
    fn enter_user(&mut self, entry: &UserEntry) -> !;

    /// Stop the hart for good.
    fn halt(&mut self) -> !;
}
