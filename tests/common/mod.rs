#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use riscv_tee_gate::machine::{CounterCsr, Machine, Privilege, UserEntry};
use riscv_tee_gate::pmp::{SandboxLayout, Window};
use riscv_tee_gate::service::{InferenceEngine, InferenceError, TextProtocol, Uart};
use riscv_tee_gate::{Supervisor, SupervisorConfig, TrapFrame, TrapOutcome};

pub const CODE_BASE: u32 = 0x8002_0000;
pub const CODE_LEN: u32 = 0x8000;
pub const DATA_BASE: u32 = 0x8002_8000;
pub const DATA_LEN: u32 = 0x8000;
pub const STACK_TOP: u32 = DATA_BASE + DATA_LEN;

pub const ECALL: u32 = 0x0000_0073;
/// `c.nop`, standing in for any 16-bit instruction.
pub const C_NOP: u16 = 0x0001;

pub const MCAUSE_ILLEGAL: u32 = 2;
pub const MCAUSE_BREAKPOINT: u32 = 3;
pub const MCAUSE_LOAD_FAULT: u32 = 5;
pub const MCAUSE_STORE_FAULT: u32 = 7;
pub const MCAUSE_ECALL_U: u32 = 8;
pub const MCAUSE_ECALL_M: u32 = 11;
pub const MCAUSE_TIMER_IRQ: u32 = 0x8000_0007;

/// Panic payload of [`MockMachine::enter_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entered {
    pub entry: UserEntry,
    pub mepc: u32,
    pub mpp: Privilege,
}

/// Panic payload of [`MockMachine::halt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

/// In-memory hart: PMP CSRs with lock semantics, trap CSRs, scripted
/// counters and one flat block of sandbox memory.
pub struct MockMachine {
    pub entry_count: usize,
    pub pmpcfg: [u8; 16],
    pub pmpaddr: [u32; 16],
    /// Every `write_pmp` call, in order.
    pub pmp_writes: Vec<(usize, u8, u32)>,
    /// Entries whose writes the "hardware" drops (WARL).
    pub sticky: Vec<usize>,
    pub mcause: u32,
    pub mtval: u32,
    pub mepc: u32,
    pub mpp: Privilege,
    pub mie: bool,
    counters: RefCell<[VecDeque<u32>; 4]>,
    pub mem_base: u32,
    pub mem: Vec<u8>,
}

impl MockMachine {
    pub fn new() -> Self {
        MockMachine {
            entry_count: 16,
            pmpcfg: [0; 16],
            pmpaddr: [0; 16],
            pmp_writes: Vec::new(),
            sticky: Vec::new(),
            mcause: 0,
            mtval: 0,
            mepc: 0,
            mpp: Privilege::Machine,
            mie: true,
            counters: RefCell::new(Default::default()),
            mem_base: CODE_BASE,
            mem: vec![0; (CODE_LEN + DATA_LEN) as usize],
        }
    }

    fn offset(&self, addr: u32) -> usize {
        assert!(
            addr >= self.mem_base && ((addr - self.mem_base) as usize) < self.mem.len(),
            "access outside mock memory: {addr:#x}"
        );
        (addr - self.mem_base) as usize
    }

    pub fn poke(&mut self, addr: u32, bytes: &[u8]) {
        let at = self.offset(addr);
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, addr: u32, len: usize) -> &[u8] {
        let at = self.offset(addr);
        &self.mem[at..at + len]
    }

    /// Script successive reads of `csr`. The last value repeats.
    pub fn script_counter(&mut self, csr: CounterCsr, values: &[u32]) {
        self.counters.borrow_mut()[counter_slot(csr)] = values.iter().copied().collect();
    }

    /// Put the hart in the state the trap entry sees for `mcause`.
    pub fn raise(&mut self, mcause: u32, mepc: u32, mtval: u32) {
        self.mcause = mcause;
        self.mepc = mepc;
        self.mtval = mtval;
        self.mie = false;
        self.mpp = if mcause == MCAUSE_ECALL_M {
            Privilege::Machine
        } else {
            Privilege::User
        };
    }

    fn tor_locks_addr(&self, index: usize) -> bool {
        let above = index + 1;
        above < self.entry_count && self.pmpcfg[above] & 0x80 != 0 && (self.pmpcfg[above] >> 3) & 0b11 == 1
    }
}

fn counter_slot(csr: CounterCsr) -> usize {
    match csr {
        CounterCsr::Cycle => 0,
        CounterCsr::CycleH => 1,
        CounterCsr::Instret => 2,
        CounterCsr::InstretH => 3,
    }
}

impl Machine for MockMachine {
    fn pmp_entry_count(&self) -> usize {
        self.entry_count
    }

    fn pmpcfg(&self, index: usize) -> u8 {
        self.pmpcfg[index]
    }

    fn pmpaddr(&self, index: usize) -> u32 {
        self.pmpaddr[index]
    }

    fn write_pmp(&mut self, index: usize, cfg: u8, addr: u32) {
        self.pmp_writes.push((index, cfg, addr));
        if self.sticky.contains(&index) || self.pmpcfg[index] & 0x80 != 0 {
            return;
        }
        if !self.tor_locks_addr(index) {
            self.pmpaddr[index] = addr;
        }
        self.pmpcfg[index] = cfg;
    }

    fn trap_cause(&self) -> u32 {
        self.mcause
    }

    fn trap_value(&self) -> u32 {
        self.mtval
    }

    fn resume_address(&self) -> u32 {
        self.mepc
    }

    fn set_resume_address(&mut self, addr: u32) {
        self.mepc = addr;
    }

    fn previous_privilege(&self) -> Privilege {
        self.mpp
    }

    fn set_previous_privilege(&mut self, privilege: Privilege) {
        self.mpp = privilege;
    }

    fn mask_interrupts(&mut self) {
        self.mie = false;
    }

    fn read_counter(&self, csr: CounterCsr) -> u32 {
        let mut counters = self.counters.borrow_mut();
        let queue = &mut counters[counter_slot(csr)];
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(0)
        } else {
            queue.front().copied().unwrap_or(0)
        }
    }

    fn fetch_halfword(&self, addr: u32) -> u16 {
        let b = self.peek(addr, 2);
        u16::from_le_bytes([b[0], b[1]])
    }

    fn user_bytes(&self, addr: u32, len: u32) -> &[u8] {
        self.peek(addr, len as usize)
    }

    fn user_bytes_mut(&mut self, addr: u32, len: u32) -> &mut [u8] {
        let at = self.offset(addr);
        &mut self.mem[at..at + len as usize]
    }

    fn enter_user(&mut self, entry: &UserEntry) -> ! {
        panic::panic_any(Entered {
            entry: *entry,
            mepc: self.mepc,
            mpp: self.mpp,
        })
    }

    fn halt(&mut self) -> ! {
        panic::panic_any(Halted)
    }
}

/// UART whose receive side replays what was transmitted.
#[derive(Default)]
pub struct LoopbackUart {
    pub sent: Vec<u8>,
    pub rx: VecDeque<u8>,
}

impl Uart for LoopbackUart {
    fn putchar(&mut self, byte: u8) {
        self.sent.push(byte);
        self.rx.push_back(byte);
    }

    fn getchar(&mut self) -> u8 {
        self.rx.pop_front().expect("getchar on an empty loopback")
    }
}

/// Engine that records its inputs and returns fixed scores.
pub struct CountingEngine {
    pub calls: usize,
    pub inputs: Vec<Vec<u8>>,
    pub scores: Vec<i8>,
    pub fail: bool,
}

impl CountingEngine {
    pub fn new(scores: &[i8]) -> Self {
        CountingEngine {
            calls: 0,
            inputs: Vec::new(),
            scores: scores.to_vec(),
            fail: false,
        }
    }
}

impl InferenceEngine for CountingEngine {
    fn infer(&mut self, input: &[u8]) -> Result<&[i8], InferenceError> {
        self.calls += 1;
        self.inputs.push(input.to_vec());
        if self.fail {
            Err(InferenceError::Engine(-1))
        } else {
            Ok(&self.scores)
        }
    }
}

#[derive(Default)]
pub struct RecordingProtocol {
    pub received: Vec<u8>,
    pub flushes: usize,
}

impl RecordingProtocol {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }
}

impl TextProtocol for RecordingProtocol {
    fn respond(&mut self, line: &[u8]) {
        self.received.extend_from_slice(line);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

pub type TestSupervisor = Supervisor<MockMachine, LoopbackUart, CountingEngine, RecordingProtocol>;

pub fn split_layout() -> SandboxLayout {
    SandboxLayout::Split {
        code: Window::new(CODE_BASE, CODE_LEN),
        data: Window::new(DATA_BASE, DATA_LEN),
        peripheral: None,
    }
}

pub fn supervisor(config: SupervisorConfig) -> TestSupervisor {
    Supervisor::new(
        MockMachine::new(),
        LoopbackUart::default(),
        CountingEngine::new(&[12, -3, 0, 127]),
        RecordingProtocol::default(),
        config,
    )
}

/// An armed supervisor in the sandboxed state, as after a launch.
pub fn running(config: SupervisorConfig) -> TestSupervisor {
    let mut sup = supervisor(config);
    sup.prepare_launch(&riscv_tee_gate::LaunchRequest {
        entry: CODE_BASE,
        stack_top: STACK_TOP,
        buffer: DATA_BASE,
        buffer_len: 0x800,
    })
    .expect("launch should validate");
    sup
}

/// Issue `ecall` with `a7 = id` from the instruction at `pc`.
pub fn ecall(sup: &mut TestSupervisor, pc: u32, id: u32, a0: u32, a1: u32) -> (TrapOutcome, TrapFrame) {
    let m = sup.machine_mut();
    m.poke(pc, &ECALL.to_le_bytes());
    m.raise(MCAUSE_ECALL_U, pc, 0);

    let mut frame = TrapFrame::zeroed();
    frame.regs[10] = a0;
    frame.regs[11] = a1;
    frame.regs[17] = id;
    let outcome = sup.handle_trap(&mut frame);
    (outcome, frame)
}

/// Run `f`, which must diverge through `enter_user` or `halt`, and return
/// the panic payload.
pub fn diverges<F: FnOnce()>(f: F) -> Box<dyn std::any::Any + Send> {
    panic::catch_unwind(AssertUnwindSafe(f)).expect_err("expected the call to diverge")
}
