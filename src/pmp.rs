//! Installing the sandbox windows into the PMP.
//!
//! RISC-V PMP rules (RV32, 16 entries here):
//!   - Entries are checked in priority order (0 = highest), first match wins
//!   - M-mode bypasses PMP unless the entry is Locked (L bit)
//!   - With no matching entry: M-mode = full access, U-mode = no access
//!
//! Installation is all-or-nothing as far as software can make it: every
//! window is encoded and every target entry checked before the first CSR
//! write, and each written entry is read back. The only way to obtain an
//! [`InstalledPmp`] (which the launch path requires) is a fully successful
//! [`install_layout`].

use core::fmt;

use heapless::Vec;
use log::{debug, info, warn};

use crate::machine::Machine;
use crate::region::{self, AddressMode, EncodeError, MemoryRegion, Permissions, ProtectionEntry};

/// Upper bound on entries any plan may use.
pub const MAX_PMP_ENTRIES: usize = 16;

/// A requested `[base, base + length)` window, before rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub base: u32,
    pub length: u32,
}

impl Window {
    pub const fn new(base: u32, length: u32) -> Self {
        Window { base, length }
    }
}

/// How strongly the installed windows separate code from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Code window executable and not writable, data window writable and not
    /// executable.
    Split,
    /// One RWX window: the sandbox can write code it then executes.
    Degraded,
}

/// The sandbox memory map the supervisor is asked to enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxLayout {
    Split {
        code: Window,
        data: Window,
        peripheral: Option<Window>,
    },
    Combined {
        span: Window,
        peripheral: Option<Window>,
    },
}

/// The rounded windows of a layout, as they are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxWindows {
    pub code: MemoryRegion,
    pub data: MemoryRegion,
    pub peripheral: Option<MemoryRegion>,
    pub isolation: IsolationLevel,
}

impl SandboxLayout {
    /// Round every window to its NAPOT cover and assign permissions.
    ///
    /// The split code window keeps `R` next to `X`: the entry is locked, so
    /// it binds M-mode as well, and the trampoline has to read the trapping
    /// instruction back out of it.
    pub fn windows(&self) -> Result<SandboxWindows, PmpError> {
        let peripheral_window = match self {
            SandboxLayout::Split { peripheral, .. } | SandboxLayout::Combined { peripheral, .. } => {
                *peripheral
            }
        };
        let peripheral = peripheral_window
            .map(|w| MemoryRegion::covering(w.base, w.length, Permissions::RW, true))
            .transpose()?;

        let windows = match *self {
            SandboxLayout::Split { code, data, .. } => {
                let code = MemoryRegion::covering(code.base, code.length, Permissions::RX, true)?;
                let data = MemoryRegion::covering(data.base, data.length, Permissions::RW, true)?;
                if overlaps(&code, &data) {
                    return Err(PmpError::Overlap);
                }
                SandboxWindows {
                    code,
                    data,
                    peripheral,
                    isolation: IsolationLevel::Split,
                }
            }
            SandboxLayout::Combined { span, .. } => {
                let span = MemoryRegion::covering(span.base, span.length, Permissions::RWX, true)?;
                SandboxWindows {
                    code: span,
                    data: span,
                    peripheral,
                    isolation: IsolationLevel::Degraded,
                }
            }
        };

        if let Some(p) = &windows.peripheral {
            if overlaps(p, &windows.code) || overlaps(p, &windows.data) {
                return Err(PmpError::Overlap);
            }
        }
        Ok(windows)
    }
}

impl SandboxWindows {
    pub fn plan(&self) -> Result<PmpPlan, PmpError> {
        let mut plan = PmpPlan::new();
        plan.push_region(&self.code)?;
        if self.isolation == IsolationLevel::Split {
            plan.push_region(&self.data)?;
        }
        if let Some(p) = &self.peripheral {
            plan.push_region(p)?;
        }
        Ok(plan)
    }
}

fn overlaps(a: &MemoryRegion, b: &MemoryRegion) -> bool {
    u64::from(a.base()) < b.end() && u64::from(b.base()) < a.end()
}

/// Ordered entries to write starting at PMP entry 0.
#[derive(Debug, Clone, Default)]
pub struct PmpPlan {
    entries: Vec<ProtectionEntry, MAX_PMP_ENTRIES>,
}

impl PmpPlan {
    pub fn new() -> Self {
        PmpPlan { entries: Vec::new() }
    }

    pub fn push_region(&mut self, region: &MemoryRegion) -> Result<(), PmpError> {
        self.push(region.entry())
    }

    /// Append a TOR window, which takes two consecutive entries.
    pub fn push_tor(
        &mut self,
        start: u32,
        end: u32,
        permissions: Permissions,
        locked: bool,
    ) -> Result<(), PmpError> {
        let pair = region::encode_tor(start, end, permissions, locked)?;
        if self.entries.len() + pair.len() > MAX_PMP_ENTRIES {
            return Err(PmpError::TooManyEntries {
                needed: self.entries.len() + pair.len(),
                available: MAX_PMP_ENTRIES,
            });
        }
        for entry in pair {
            self.push(entry)?;
        }
        Ok(())
    }

    fn push(&mut self, entry: ProtectionEntry) -> Result<(), PmpError> {
        self.entries
            .push(entry)
            .map_err(|_| PmpError::TooManyEntries {
                needed: MAX_PMP_ENTRIES + 1,
                available: MAX_PMP_ENTRIES,
            })
    }

    pub fn entries(&self) -> &[ProtectionEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpError {
    Encode(EncodeError),
    /// Two sandbox windows round to overlapping NAPOT regions.
    Overlap,
    TooManyEntries { needed: usize, available: usize },
    /// A target entry is locked from an earlier boot stage.
    EntryLocked { index: usize },
    /// The hardware did not retain what was written (WARL field, coarser
    /// granularity, or a lock we could not see).
    Readback {
        index: usize,
        wrote: ProtectionEntry,
        read: ProtectionEntry,
    },
}

impl From<EncodeError> for PmpError {
    fn from(e: EncodeError) -> Self {
        PmpError::Encode(e)
    }
}

impl fmt::Display for PmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmpError::Encode(e) => write!(f, "cannot encode window: {}", e),
            PmpError::Overlap => write!(f, "sandbox windows overlap after rounding"),
            PmpError::TooManyEntries { needed, available } => {
                write!(f, "plan needs {} PMP entries, {} available", needed, available)
            }
            PmpError::EntryLocked { index } => write!(f, "PMP entry {} is already locked", index),
            PmpError::Readback { index, wrote, read } => write!(
                f,
                "PMP entry {} read back cfg={:#04x} addr={:#010x}, wrote cfg={:#04x} addr={:#010x}",
                index,
                read.cfg(),
                read.addr(),
                wrote.cfg(),
                wrote.addr()
            ),
        }
    }
}

/// Proof that a layout's windows are live in hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledPmp {
    windows: SandboxWindows,
    entries: usize,
}

impl InstalledPmp {
    pub fn windows(&self) -> &SandboxWindows {
        &self.windows
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Write `plan` into entries `0..plan.len()`.
///
/// Nothing is written unless every entry fits and none of the targets is
/// locked. Unused entries above the plan are switched off so nothing left
/// behind by an earlier stage keeps granting access.
pub fn install<M: Machine>(machine: &mut M, plan: &PmpPlan) -> Result<(), PmpError> {
    let entries = plan.entries();
    let available = machine.pmp_entry_count().min(MAX_PMP_ENTRIES);
    if entries.len() > available {
        return Err(PmpError::TooManyEntries {
            needed: entries.len(),
            available,
        });
    }
    for index in 0..entries.len() {
        let current = ProtectionEntry::from_raw(machine.pmpcfg(index), machine.pmpaddr(index));
        if current.is_locked() {
            return Err(PmpError::EntryLocked { index });
        }
    }

    for (index, entry) in entries.iter().enumerate() {
        machine.write_pmp(index, entry.cfg(), entry.addr());
    }
    for (index, wrote) in entries.iter().enumerate() {
        let read = ProtectionEntry::from_raw(machine.pmpcfg(index), machine.pmpaddr(index));
        if read != *wrote {
            return Err(PmpError::Readback {
                index,
                wrote: *wrote,
                read,
            });
        }
    }

    for index in entries.len()..available {
        let current = ProtectionEntry::from_raw(machine.pmpcfg(index), machine.pmpaddr(index));
        if current.is_locked() {
            if current.mode() != AddressMode::Off {
                warn!("[PMP] entry {} locked by an earlier stage: {:?}", index, current);
            }
            continue;
        }
        if current.mode() != AddressMode::Off {
            debug!("[PMP] clearing stale entry {}", index);
            machine.write_pmp(index, 0, 0);
        }
    }
    Ok(())
}

/// Encode `layout` and install it.
pub fn install_layout<M: Machine>(
    machine: &mut M,
    layout: &SandboxLayout,
) -> Result<InstalledPmp, PmpError> {
    let windows = layout.windows()?;
    let plan = windows.plan()?;
    install(machine, &plan)?;

    if windows.isolation == IsolationLevel::Degraded {
        warn!(
            "[PMP] combined RWX window {:#010x}+{:#x}: weaker isolation, sandbox may execute what it writes",
            windows.code.base(),
            windows.code.length()
        );
    }
    info!(
        "[PMP] installed {} entries ({:?} isolation)",
        plan.entries().len(),
        windows.isolation
    );
    Ok(InstalledPmp {
        windows,
        entries: plan.entries().len(),
    })
}

/// `Display` adapter listing the first `count` entries as the hardware holds
/// them.
pub struct PmpDump<'a, M: Machine> {
    machine: &'a M,
    count: usize,
}

impl<'a, M: Machine> PmpDump<'a, M> {
    pub fn new(machine: &'a M, count: usize) -> Self {
        PmpDump {
            machine,
            count: count.min(machine.pmp_entry_count()),
        }
    }
}

impl<M: Machine> fmt::Display for PmpDump<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prev_addr = 0;
        for i in 0..self.count {
            let entry = ProtectionEntry::from_raw(self.machine.pmpcfg(i), self.machine.pmpaddr(i));
            match entry.span(prev_addr) {
                Some((start, end)) => writeln!(
                    f,
                    "  [{:02}]: start={:#010x}, end={:#010x}, cfg={:#04x} ({}) ({}{})",
                    i,
                    start,
                    end.saturating_sub(1),
                    entry.cfg(),
                    entry.mode(),
                    if entry.is_locked() { "l" } else { "-" },
                    entry.permissions(),
                )?,
                None => writeln!(f, "  [{:02}]: pmpaddr={:#010x} (OFF)", i, entry.addr())?,
            }
            prev_addr = entry.addr();
        }
        Ok(())
    }
}
