//! The services the sandbox can ask for.
//!
//! Each service validates its own arguments against the data window before
//! touching sandbox memory. A failed check is a [`Rejection`]: the call is
//! dropped, `a0` is left as it was and the sandbox resumes.

use core::fmt::{self, Write};

use heapless::String;
use log::{debug, info, log_enabled, warn, Level};

use crate::machine::{CounterCsr, Machine};
use crate::region::MemoryRegion;
use crate::syscall::{SyscallId, SyscallRequest};

/// Bytes copied into the sandbox result buffer.
pub const RESULT_LEN: usize = 16;

/// Fill byte for the result buffer when inference fails.
pub const DEFAULT_SENTINEL: u8 = 0x80;

/// Capacity of one formatted response line.
pub const RESPONSE_CAPACITY: usize = 256;

const INFERENCE_ERROR: &[u8] = b"Inference error\r\n";
const RESPONSE_TOO_LONG: &[u8] = b"Inference error: response too long\r\n";

/// Byte-oriented serial port.
pub trait Uart {
    fn putchar(&mut self, byte: u8);

    /// Blocks until a byte is available.
    fn getchar(&mut self) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceError {
    /// The input could not be interpreted as a model input.
    InvalidInput,
    /// Engine-specific status code.
    Engine(i32),
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::InvalidInput => write!(f, "invalid model input"),
            InferenceError::Engine(code) => write!(f, "engine status {}", code),
        }
    }
}

/// Opaque model runner. The returned scores stay borrowed from the engine.
pub trait InferenceEngine {
    fn infer(&mut self, input: &[u8]) -> Result<&[i8], InferenceError>;
}

/// Line-oriented text front end (SCPI). Infer hands it finished response
/// lines; `flush` pushes them out.
pub trait TextProtocol {
    fn respond(&mut self, line: &[u8]);
    fn flush(&mut self);
}

/// Where Infer results go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferDelivery {
    /// Format as an ASCII response line and hand it to the text protocol.
    Forward,
    /// Copy up to [`RESULT_LEN`] bytes into the sandbox at `addr`.
    ResultBuffer { addr: u32 },
}

/// Recoverable refusal of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OutOfWindow { ptr: u32, len: u32 },
    EmptyBuffer,
    ShortCounterBuffer { len: u32 },
    ResultBufferOutOfWindow { addr: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::OutOfWindow { ptr, len } => {
                write!(f, "bad user buffer ({:#010x}, len={})", ptr, len)
            }
            Rejection::EmptyBuffer => write!(f, "empty user buffer"),
            Rejection::ShortCounterBuffer { len } => {
                write!(f, "counter buffer too short (len={}, need 16)", len)
            }
            Rejection::ResultBufferOutOfWindow { addr } => {
                write!(f, "result buffer {:#010x} outside the data window", addr)
            }
        }
    }
}

/// Value written back into `a0`, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceResult {
    None,
    Value(u32),
}

/// `[low, high)` range the sandbox may pass buffers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWindow {
    low: u32,
    high: u64,
}

impl DataWindow {
    pub const fn new(low: u32, high: u32) -> Self {
        DataWindow {
            low,
            high: high as u64,
        }
    }

    pub fn from_region(region: &MemoryRegion) -> Self {
        DataWindow {
            low: region.base(),
            high: region.end(),
        }
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// `ptr >= low && ptr + len <= high`, with the addition overflow-checked.
    pub fn check(&self, ptr: u32, len: u32) -> Result<(), Rejection> {
        let end = ptr
            .checked_add(len)
            .ok_or(Rejection::OutOfWindow { ptr, len })?;
        if ptr < self.low || u64::from(end) > self.high {
            return Err(Rejection::OutOfWindow { ptr, len });
        }
        Ok(())
    }

    /// Whether this window lies entirely inside `region`.
    pub fn within(&self, region: &MemoryRegion) -> bool {
        self.low >= region.base() && self.high <= region.end()
    }
}

/// 64-bit counter values taken from their 32-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cycles: u64,
    pub instret: u64,
}

impl CounterSnapshot {
    pub fn read<M: Machine>(machine: &M) -> Self {
        CounterSnapshot {
            cycles: read_counter64(machine, CounterCsr::Cycle, CounterCsr::CycleH),
            instret: read_counter64(machine, CounterCsr::Instret, CounterCsr::InstretH),
        }
    }

    /// Counts elapsed since `earlier`, modulo 2^64.
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            cycles: self.cycles.wrapping_sub(earlier.cycles),
            instret: self.instret.wrapping_sub(earlier.instret),
        }
    }

    /// `cycles` then `instret`, little-endian.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.cycles.to_le_bytes());
        out[8..].copy_from_slice(&self.instret.to_le_bytes());
        out
    }
}

/// Read hi, lo, hi until the high half is stable across the low read.
fn read_counter64<M: Machine>(machine: &M, lo: CounterCsr, hi: CounterCsr) -> u64 {
    loop {
        let high = machine.read_counter(hi);
        let low = machine.read_counter(lo);
        if machine.read_counter(hi) == high {
            return (u64::from(high) << 32) | u64::from(low);
        }
    }
}

/// Render scores as a SCPI response line: `"12,-3,0\r\n"`.
pub fn format_response<const N: usize>(values: &[i8], out: &mut String<N>) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.write_char(',')?;
        }
        write!(out, "{}", v)?;
    }
    out.write_str("\r\n")
}

pub struct ServiceTable<U, E, P> {
    uart: U,
    engine: E,
    protocol: P,
    window: DataWindow,
    delivery: InferDelivery,
    sentinel: u8,
}

impl<U: Uart, E: InferenceEngine, P: TextProtocol> ServiceTable<U, E, P> {
    pub fn new(uart: U, engine: E, protocol: P, window: DataWindow, delivery: InferDelivery) -> Self {
        ServiceTable {
            uart,
            engine,
            protocol,
            window,
            delivery,
            sentinel: DEFAULT_SENTINEL,
        }
    }

    pub fn with_sentinel(mut self, sentinel: u8) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn window(&self) -> &DataWindow {
        &self.window
    }

    pub(crate) fn set_window(&mut self, window: DataWindow) {
        self.window = window;
    }

    pub fn delivery(&self) -> InferDelivery {
        self.delivery
    }

    pub fn uart(&mut self) -> &mut U {
        &mut self.uart
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn dispatch<M: Machine>(
        &mut self,
        machine: &mut M,
        id: SyscallId,
        request: &SyscallRequest,
    ) -> Result<ServiceResult, Rejection> {
        match id {
            SyscallId::Infer => self.infer(machine, request.arg0, request.arg1),
            SyscallId::UartPutchar => {
                self.uart.putchar(request.arg0 as u8);
                Ok(ServiceResult::None)
            }
            SyscallId::UartGetchar => Ok(ServiceResult::Value(u32::from(self.uart.getchar()))),
            SyscallId::ReadCounters => self.read_counters(machine, request.arg0, request.arg1),
        }
    }

    fn infer<M: Machine>(
        &mut self,
        machine: &mut M,
        ptr: u32,
        len: u32,
    ) -> Result<ServiceResult, Rejection> {
        if len == 0 {
            return Err(Rejection::EmptyBuffer);
        }
        self.window.check(ptr, len)?;
        if let InferDelivery::ResultBuffer { addr } = self.delivery {
            self.window
                .check(addr, RESULT_LEN as u32)
                .map_err(|_| Rejection::ResultBufferOutOfWindow { addr })?;
        }
        debug!("[SYSCALL] infer input={:#010x} len={}", ptr, len);

        let profile = log_enabled!(Level::Debug);
        let start = if profile { Some(CounterSnapshot::read(machine)) } else { None };
        let result = self.engine.infer(machine.user_bytes(ptr, len));
        if let Some(start) = start {
            let spent = CounterSnapshot::read(machine).since(&start);
            debug!(
                "[SYSCALL] infer took cycles={} instret={}",
                spent.cycles, spent.instret
            );
        }

        match self.delivery {
            InferDelivery::Forward => {
                match result {
                    Ok(values) => {
                        let mut line: String<RESPONSE_CAPACITY> = String::new();
                        if format_response(values, &mut line).is_ok() {
                            self.protocol.respond(line.as_bytes());
                        } else {
                            warn!("[SYSCALL] {} scores do not fit one response line", values.len());
                            self.protocol.respond(RESPONSE_TOO_LONG);
                        }
                    }
                    Err(e) => {
                        warn!("[SYSCALL] inference failed: {}", e);
                        self.protocol.respond(INFERENCE_ERROR);
                    }
                }
                self.protocol.flush();
            }
            InferDelivery::ResultBuffer { addr } => {
                let mut out = [self.sentinel; RESULT_LEN];
                match result {
                    Ok(values) => {
                        out = [0; RESULT_LEN];
                        for (dst, v) in out.iter_mut().zip(values) {
                            *dst = *v as u8;
                        }
                    }
                    Err(e) => warn!("[SYSCALL] inference failed: {}", e),
                }
                machine
                    .user_bytes_mut(addr, RESULT_LEN as u32)
                    .copy_from_slice(&out);
            }
        }
        Ok(ServiceResult::None)
    }

    fn read_counters<M: Machine>(
        &mut self,
        machine: &mut M,
        ptr: u32,
        len: u32,
    ) -> Result<ServiceResult, Rejection> {
        let snapshot = CounterSnapshot::read(machine);
        info!(
            "[SYSCALL] cycles={} instret={}",
            snapshot.cycles, snapshot.instret
        );
        if ptr == 0 {
            return Ok(ServiceResult::None);
        }
        if len < 16 {
            return Err(Rejection::ShortCounterBuffer { len });
        }
        self.window.check(ptr, 16)?;
        machine
            .user_bytes_mut(ptr, 16)
            .copy_from_slice(&snapshot.to_le_bytes());
        Ok(ServiceResult::None)
    }
}
