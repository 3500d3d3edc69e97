//! TEE gate firmware (QEMU `virt`, RV32IMAC).
//!
//! Boots in M-mode, installs the PMP windows around the sandbox's code and
//! data, and drops to U-mode. The sandbox reads a line from the console
//! through `ecall`, hands it to the inference service and prints the
//! counters, forever. It has no direct access to the UART or to any
//! supervisor memory.
//!
//! Memory map (see `memory.x`):
//!   0x8000_0000 .. 0x8000_FFFF  ROM     (64K)  M-mode code + rodata
//!   0x8001_0000 .. 0x8001_7FFF  M_RAM   (32K)  M-mode data, stack, trap stack
//!   0x8002_0000 .. 0x8002_7FFF  U_CODE  (32K)  sandbox code    (locked R-X)
//!   0x8002_8000 .. 0x8002_FFFF  U_RAM   (32K)  sandbox data + stack (locked RW-)
//!   0x1000_0000 .. 0x1000_0FFF  UART    (4K)   16550, M-mode only

#![no_std]
#![no_main]

use core::arch::{asm, naked_asm};
use core::fmt::{self, Write};
use core::mem::MaybeUninit;
use core::panic::PanicInfo;

use log::{error, info, LevelFilter, Metadata, Record};

use riscv_tee_gate::hal::riscv32::Hart;
use riscv_tee_gate::privilege;
use riscv_tee_gate::service::{InferenceEngine, InferenceError, TextProtocol, Uart};
use riscv_tee_gate::{
    LaunchRequest, SandboxLayout, Supervisor, SupervisorConfig, TrapFrame, TrapOutcome, Window,
};

// ============================================================================
// UART (QEMU virt machine: 16550 at 0x1000_0000)
// ============================================================================

const UART_BASE: usize = 0x1000_0000;

/// Line status register offset and bits.
const LSR: usize = 5;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

#[derive(Clone, Copy)]
struct Uart16550 {
    base: usize,
}

impl Uart16550 {
    const fn new(base: usize) -> Self {
        Uart16550 { base }
    }

    fn lsr(&self) -> u8 {
        unsafe { ((self.base + LSR) as *const u8).read_volatile() }
    }
}

impl Uart for Uart16550 {
    fn putchar(&mut self, byte: u8) {
        while self.lsr() & LSR_THR_EMPTY == 0 {}
        unsafe { (self.base as *mut u8).write_volatile(byte) }
    }

    fn getchar(&mut self) -> u8 {
        while self.lsr() & LSR_DATA_READY == 0 {}
        unsafe { (self.base as *const u8).read_volatile() }
    }
}

impl fmt::Write for Uart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.putchar(b'\r');
            }
            self.putchar(b);
        }
        Ok(())
    }
}

// ============================================================================
// Logging
// ============================================================================

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut console = Uart16550::new(UART_BASE);
            let _ = writeln!(console, "{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging() {
    let level = if cfg!(feature = "trace-syscalls") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// ============================================================================
// Service back ends
// ============================================================================

/// Text front end that writes responses straight to the console.
struct ScpiConsole {
    uart: Uart16550,
}

impl TextProtocol for ScpiConsole {
    fn respond(&mut self, line: &[u8]) {
        for &b in line {
            self.uart.putchar(b);
        }
    }

    fn flush(&mut self) {
        while self.uart.lsr() & LSR_THR_EMPTY == 0 {}
    }
}

/// Stand-in model (stub).
///
/// A real board links the model runner here. This one folds the input into
/// an XOR digest and spreads it over four int8 "scores".
struct StubEngine {
    scores: [i8; 4],
}

impl InferenceEngine for StubEngine {
    fn infer(&mut self, input: &[u8]) -> Result<&[i8], InferenceError> {
        if input.is_empty() {
            return Err(InferenceError::InvalidInput);
        }
        let digest = input.iter().fold(0u8, |acc, b| acc.rotate_left(1) ^ b);
        for (i, score) in self.scores.iter_mut().enumerate() {
            *score = digest.rotate_left(2 * i as u32) as i8;
        }
        Ok(&self.scores)
    }
}

// ============================================================================
// Supervisor instance
// ============================================================================

type Firmware = Supervisor<Hart, Uart16550, StubEngine, ScpiConsole>;

static mut SUPERVISOR: MaybeUninit<Firmware> = MaybeUninit::uninit();

#[inline(always)]
fn supervisor() -> &'static mut Firmware {
    #[allow(static_mut_refs)]
    unsafe {
        SUPERVISOR.assume_init_mut()
    }
}

extern "C" {
    static __user_text_start: u8;
    static __user_text_end: u8;
    static __user_data_start: u8;
    static __user_data_end: u8;
    static __user_stack_top: u8;
}

fn symbol(sym: &'static u8) -> u32 {
    sym as *const u8 as u32
}

fn sandbox_layout() -> SandboxLayout {
    let (text_start, text_end, data_start, data_end) = unsafe {
        (
            symbol(&__user_text_start),
            symbol(&__user_text_end),
            symbol(&__user_data_start),
            symbol(&__user_data_end),
        )
    };
    if cfg!(feature = "combined-window") {
        SandboxLayout::Combined {
            span: Window::new(text_start, data_end - text_start),
            peripheral: None,
        }
    } else {
        SandboxLayout::Split {
            code: Window::new(text_start, text_end - text_start),
            data: Window::new(data_start, data_end - data_start),
            peripheral: None,
        }
    }
}

/// Called by the trap vector with the spilled registers. Returning resumes
/// the interrupted context.
#[no_mangle]
pub extern "C" fn handle_trap(frame: &mut TrapFrame) {
    if let TrapOutcome::Halt(_) = supervisor().handle_trap(frame) {
        supervisor().halt();
    }
}

// ============================================================================
// Sandbox (U-mode)
// ============================================================================

const USER_BUFFER_LEN: usize = 2048;

#[link_section = ".user_data"]
static mut USER_BUFFER: [u8; USER_BUFFER_LEN] = [0; USER_BUFFER_LEN];

/// Sandbox entry point: `a0` = line buffer, `a1` = its capacity.
///
/// Written in assembly so nothing in it can call into M-mode text, which the
/// sandbox cannot execute.
///
/// Loop:
///   1. read a line with UartGetchar (id 2), echoing with UartPutchar (id 1)
///   2. Infer (id 0) on the line
///   3. ReadCounters (id 99) with no buffer
#[unsafe(naked)]
#[no_mangle]
#[link_section = ".user_text"]
pub unsafe extern "C" fn _user_entry() -> ! {
    naked_asm!(
        "mv     s0, a0",
        "mv     s1, a1",

        // ── new line ──
        "1:",
        "li     s2, 0",

        // ── read one byte ──
        "2:",
        "li     a7, 2",
        "ecall",
        "li     t0, 13",          // '\r'
        "beq    a0, t0, 3f",
        "li     t0, 10",          // '\n'
        "beq    a0, t0, 3f",
        "beq    s2, s1, 2b",      // full: drop until end of line
        "add    t1, s0, s2",
        "sb     a0, 0(t1)",
        "addi   s2, s2, 1",
        "li     a7, 1",           // echo
        "ecall",
        "j      2b",

        // ── end of line ──
        "3:",
        "li     a0, 13",
        "li     a7, 1",
        "ecall",
        "li     a0, 10",
        "li     a7, 1",
        "ecall",
        "beqz   s2, 1b",

        "mv     a0, s0",
        "mv     a1, s2",
        "li     a7, 0",           // infer(line, len)
        "ecall",

        "li     a0, 0",
        "li     a1, 0",
        "li     a7, 99",          // read counters, log only
        "ecall",
        "j      1b",
    )
}

// ============================================================================
// Boot Sequence (_start)
// ============================================================================

#[unsafe(naked)]
#[no_mangle]
#[link_section = ".text.init"]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        // ── 1. Set up M-mode stack ──
        "la     sp, _m_stack_top",

        // ── 2. Sandbox gets no direct counter access ──
        "csrw   mcounteren, zero",

        // ── 3. Zero M-mode BSS ──
        "la     t0, _m_bss_start",
        "la     t1, _m_bss_end",
        "1: beq  t0, t1, 2f",
        "sw     zero, 0(t0)",
        "addi   t0, t0, 4",
        "j      1b",
        "2:",

        // ── 4. Jump to Rust main ──
        "call   tee_main",

        // ── 5. Should not return ──
        "3: wfi",
        "j      3b",
    )
}

// ============================================================================
// M-Mode Main
// ============================================================================

#[no_mangle]
pub extern "C" fn tee_main() -> ! {
    let mut hart = unsafe { Hart::claim() };
    hart.install_trap_vector();
    init_logging();

    info!("================================================================");
    info!("  RISC-V TEE gate: PMP sandbox + ecall services");
    info!("================================================================");

    let console = Uart16550::new(UART_BASE);
    let config = SupervisorConfig::new(sandbox_layout());
    #[allow(static_mut_refs)]
    unsafe {
        SUPERVISOR.write(Supervisor::new(
            hart,
            console,
            StubEngine { scores: [0; 4] },
            ScpiConsole { uart: console },
            config,
        ));
    }

    let request = LaunchRequest {
        entry: _user_entry as usize as u32,
        stack_top: unsafe { symbol(&__user_stack_top) },
        buffer: core::ptr::addr_of!(USER_BUFFER) as usize as u32,
        buffer_len: USER_BUFFER_LEN as u32,
    };

    match supervisor().prepare_launch(&request) {
        // The switch runs on its own handle: the supervisor stays reachable
        // only through `handle_trap` once the sandbox is running.
        Ok(context) => privilege::switch_to_sandbox(&mut unsafe { Hart::claim() }, context),
        Err(e) => {
            error!("[LAUNCH] refused: {}", e);
            supervisor().halt()
        }
    }
}

// ============================================================================
// Panic Handler
// ============================================================================

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut console = Uart16550::new(UART_BASE);
    let _ = console.write_str("\n!!! SUPERVISOR PANIC !!!\n");
    if let Some(loc) = info.location() {
        let _ = writeln!(console, "  at {}:{}", loc.file(), loc.line());
    }
    let _ = console.write_str("  SYSTEM HALTED\n");
    loop {
        unsafe { asm!("wfi") };
    }
}
