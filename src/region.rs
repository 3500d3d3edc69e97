//! PMP region encoding.
//!
//! A `pmpaddrX` CSR holds bits 33:2 of a physical address. How the value is
//! interpreted depends on the `A` field of the matching `pmpcfg` octet:
//!
//!   - OFF:   entry disabled
//!   - TOR:   top of range, the window is `[pmpaddr(i-1), pmpaddr(i))`
//!   - NAPOT: naturally aligned power of two, the trailing ones of the
//!             value encode the size: `pmpaddr = (base >> 2) | ((size >> 3) - 1)`
//!
//! Everything in this module is pure arithmetic. An off-by-one here silently
//! grants the sandbox more memory than intended, so the encoder never trusts
//! its caller to hand it an already-aligned window.

use core::fmt;

use bitflags::bitflags;
use tock_registers::{register_bitfields, LocalRegisterCopy};

/// Smallest window a NAPOT entry can describe.
pub const MIN_NAPOT_SIZE: u32 = 8;

/// Physical addresses are 32 bits wide on this core.
const ADDRESS_SPACE: u64 = 1 << 32;

register_bitfields![u8,
    /// One `pmpcfg` octet. Four of them are packed into each `pmpcfgX` CSR.
    pub pmpcfg_octet [
        r OFFSET(0) NUMBITS(1) [],
        w OFFSET(1) NUMBITS(1) [],
        x OFFSET(2) NUMBITS(1) [],
        a OFFSET(3) NUMBITS(2) [
            OFF = 0,
            TOR = 1,
            NA4 = 2,
            NAPOT = 3
        ],
        l OFFSET(7) NUMBITS(1) []
    ]
];

bitflags! {
    /// Access rights granted to the sandbox inside a window.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXECUTE.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.contains(Permissions::READ), 'r'),
            flag(self.contains(Permissions::WRITE), 'w'),
            flag(self.contains(Permissions::EXECUTE), 'x'),
        )
    }
}

/// Why a window could not be turned into a protection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// A zero-length window protects nothing and has no NAPOT encoding.
    ZeroLength,
    /// The covering power-of-two window does not fit the 32-bit address space.
    ExceedsAddressSpace { base: u32, length: u32 },
    /// `W=1, R=0` is a reserved combination in `pmpcfg`.
    WriteWithoutRead,
    /// TOR boundaries must be 4-byte aligned.
    Misaligned { addr: u32 },
    /// TOR range with `end <= start`.
    EmptyRange { start: u32, end: u32 },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::ZeroLength => write!(f, "zero-length window"),
            EncodeError::ExceedsAddressSpace { base, length } => write!(
                f,
                "window {:#010x}+{:#x} exceeds the 32-bit address space",
                base, length
            ),
            EncodeError::WriteWithoutRead => write!(f, "write permission without read"),
            EncodeError::Misaligned { addr } => write!(f, "address {:#010x} not 4-byte aligned", addr),
            EncodeError::EmptyRange { start, end } => {
                write!(f, "empty range [{:#010x}, {:#010x})", start, end)
            }
        }
    }
}

/// PMP addressing mode of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Off,
    Tor,
    Na4,
    Napot,
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressMode::Off => "OFF  ",
            AddressMode::Tor => "TOR  ",
            AddressMode::Na4 => "NA4  ",
            AddressMode::Napot => "NAPOT",
        };
        f.write_str(s)
    }
}

/// Hardware-facing form of a window: one `pmpcfg` octet and one `pmpaddr`
/// value.
#[derive(Clone, Copy)]
pub struct ProtectionEntry {
    cfg: LocalRegisterCopy<u8, pmpcfg_octet::Register>,
    addr: u32,
}

impl ProtectionEntry {
    /// A disabled entry. Its address is still meaningful as the bottom of a
    /// following TOR entry.
    pub fn off(addr: u32) -> Self {
        ProtectionEntry {
            cfg: LocalRegisterCopy::new(0),
            addr,
        }
    }

    /// Rebuild an entry from raw CSR contents (read-back, diagnostics).
    pub fn from_raw(cfg: u8, addr: u32) -> Self {
        ProtectionEntry {
            cfg: LocalRegisterCopy::new(cfg),
            addr,
        }
    }

    fn with_mode(mode: AddressMode, permissions: Permissions, locked: bool, addr: u32) -> Self {
        let a = match mode {
            AddressMode::Off => pmpcfg_octet::a::OFF,
            AddressMode::Tor => pmpcfg_octet::a::TOR,
            AddressMode::Na4 => pmpcfg_octet::a::NA4,
            AddressMode::Napot => pmpcfg_octet::a::NAPOT,
        };
        let bit = |set: bool, field_set, field_clear| if set { field_set } else { field_clear };
        let fv = bit(
            permissions.contains(Permissions::READ),
            pmpcfg_octet::r::SET,
            pmpcfg_octet::r::CLEAR,
        ) + bit(
            permissions.contains(Permissions::WRITE),
            pmpcfg_octet::w::SET,
            pmpcfg_octet::w::CLEAR,
        ) + bit(
            permissions.contains(Permissions::EXECUTE),
            pmpcfg_octet::x::SET,
            pmpcfg_octet::x::CLEAR,
        ) + bit(locked, pmpcfg_octet::l::SET, pmpcfg_octet::l::CLEAR)
            + a;

        ProtectionEntry {
            cfg: LocalRegisterCopy::new(fv.value),
            addr,
        }
    }

    /// The `pmpcfg` octet.
    pub fn cfg(&self) -> u8 {
        self.cfg.get()
    }

    /// The `pmpaddr` value.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn mode(&self) -> AddressMode {
        match self.cfg.read_as_enum(pmpcfg_octet::a) {
            Some(pmpcfg_octet::a::Value::TOR) => AddressMode::Tor,
            Some(pmpcfg_octet::a::Value::NA4) => AddressMode::Na4,
            Some(pmpcfg_octet::a::Value::NAPOT) => AddressMode::Napot,
            Some(pmpcfg_octet::a::Value::OFF) | None => AddressMode::Off,
        }
    }

    pub fn permissions(&self) -> Permissions {
        let mut p = Permissions::empty();
        p.set(Permissions::READ, self.cfg.is_set(pmpcfg_octet::r));
        p.set(Permissions::WRITE, self.cfg.is_set(pmpcfg_octet::w));
        p.set(Permissions::EXECUTE, self.cfg.is_set(pmpcfg_octet::x));
        p
    }

    pub fn is_locked(&self) -> bool {
        self.cfg.is_set(pmpcfg_octet::l)
    }

    /// Decode a NAPOT entry back to `(base, size)`.
    pub fn napot_window(&self) -> Option<(u32, u64)> {
        if self.mode() != AddressMode::Napot {
            return None;
        }
        let ones = self.addr.trailing_ones();
        let size = 1u64 << (ones + 3);
        let base = (u64::from(self.addr) & !((1u64 << ones) - 1)) << 2;
        Some((base as u32, size))
    }

    /// Effective byte range `[start, end)` enforced by this entry. `prev_addr`
    /// is the `pmpaddr` of the entry below, which bounds TOR entries.
    pub fn span(&self, prev_addr: u32) -> Option<(u64, u64)> {
        match self.mode() {
            AddressMode::Off => None,
            AddressMode::Tor => Some((u64::from(prev_addr) << 2, u64::from(self.addr) << 2)),
            AddressMode::Na4 => {
                let start = u64::from(self.addr) << 2;
                Some((start, start + 4))
            }
            AddressMode::Napot => self
                .napot_window()
                .map(|(base, size)| (u64::from(base), u64::from(base) + size)),
        }
    }
}

impl PartialEq for ProtectionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cfg.get() == other.cfg.get() && self.addr == other.addr
    }
}

impl Eq for ProtectionEntry {}

impl fmt::Debug for ProtectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionEntry")
            .field("cfg", &format_args!("{:#04x}", self.cfg.get()))
            .field("addr", &format_args!("{:#010x}", self.addr))
            .finish()
    }
}

/// A naturally aligned power-of-two window with its access rights.
///
/// Only constructible through [`MemoryRegion::covering`], so `length` is always
/// a power of two of at least [`MIN_NAPOT_SIZE`] and `base` is aligned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: u32,
    length: u32,
    permissions: Permissions,
    locked: bool,
}

impl MemoryRegion {
    /// Smallest naturally aligned power-of-two window containing
    /// `[base, base + length)`.
    pub fn covering(
        base: u32,
        length: u32,
        permissions: Permissions,
        locked: bool,
    ) -> Result<Self, EncodeError> {
        if length == 0 {
            return Err(EncodeError::ZeroLength);
        }
        if permissions.contains(Permissions::WRITE) && !permissions.contains(Permissions::READ) {
            return Err(EncodeError::WriteWithoutRead);
        }

        let end = u64::from(base) + u64::from(length);
        let mut size = u64::from(length)
            .next_power_of_two()
            .max(u64::from(MIN_NAPOT_SIZE));
        let mut aligned = u64::from(base) & !(size - 1);
        // A window straddling an alignment boundary needs the next size up.
        while aligned + size < end {
            size <<= 1;
            aligned = u64::from(base) & !(size - 1);
        }
        if size >= ADDRESS_SPACE {
            return Err(EncodeError::ExceedsAddressSpace { base, length });
        }

        Ok(MemoryRegion {
            base: aligned as u32,
            length: size as u32,
            permissions,
            locked,
        })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// One past the last byte, widened so a window ending at 4 GiB is exact.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.length)
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Whether `[addr, addr + len)` lies entirely inside this window.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let end = u64::from(addr) + u64::from(len);
        addr >= self.base && end <= self.end()
    }

    /// `pmpaddr` value for this window in NAPOT mode.
    pub fn napot_addr(&self) -> u32 {
        (self.base >> 2) | ((self.length >> 3) - 1)
    }

    pub fn entry(&self) -> ProtectionEntry {
        ProtectionEntry::with_mode(
            AddressMode::Napot,
            self.permissions,
            self.locked,
            self.napot_addr(),
        )
    }
}

/// Encode `[base, base + length)` as a single NAPOT entry, rounding the
/// window up to the smallest aligned power of two that contains it.
pub fn encode_napot(
    base: u32,
    length: u32,
    permissions: Permissions,
    locked: bool,
) -> Result<ProtectionEntry, EncodeError> {
    MemoryRegion::covering(base, length, permissions, locked).map(|r| r.entry())
}

/// Encode `[start, end)` as a TOR pair: a disabled entry carrying the bottom
/// address, followed by the TOR entry carrying the top.
///
/// Locking the TOR entry also locks the `pmpaddr` of the entry below it, so
/// the bottom entry is left unlocked.
pub fn encode_tor(
    start: u32,
    end: u32,
    permissions: Permissions,
    locked: bool,
) -> Result<[ProtectionEntry; 2], EncodeError> {
    if permissions.contains(Permissions::WRITE) && !permissions.contains(Permissions::READ) {
        return Err(EncodeError::WriteWithoutRead);
    }
    for addr in [start, end] {
        if addr % 4 != 0 {
            return Err(EncodeError::Misaligned { addr });
        }
    }
    if end <= start {
        return Err(EncodeError::EmptyRange { start, end });
    }
    Ok([
        ProtectionEntry::off(start >> 2),
        ProtectionEntry::with_mode(AddressMode::Tor, permissions, locked, end >> 2),
    ])
}
