mod common;

use common::*;
use riscv_tee_gate::machine::{CounterCsr, Privilege};
use riscv_tee_gate::service::{DataWindow, InferDelivery};
use riscv_tee_gate::trap::TrapFrame;
use riscv_tee_gate::{SupervisorConfig, SupervisorState, SyscallId, TrapOutcome};

const PC: u32 = CODE_BASE + 0x100;
const INPUT_WINDOW: u32 = 200;

fn forward_config() -> SupervisorConfig {
    SupervisorConfig::new(split_layout())
        .data_window(DataWindow::new(DATA_BASE, DATA_BASE + INPUT_WINDOW))
}

#[test]
fn infer_inside_window_runs_once_and_forwards() {
    let mut sup = running(forward_config());
    let input: Vec<u8> = (0..50u8).map(|i| b'a' + i % 26).collect();
    sup.machine_mut().poke(DATA_BASE, &input);

    let (outcome, frame) = ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE, 50);

    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.services().engine().calls, 1);
    assert_eq!(sup.services().engine().inputs[0], input);
    assert_eq!(sup.services().protocol().text(), "12,-3,0,127\r\n");
    assert_eq!(sup.services().protocol().flushes, 1);
    assert_eq!(frame.a0(), DATA_BASE);
    assert_eq!(sup.machine().mepc, PC + 4);
    assert_eq!(sup.machine().mpp, Privilege::User);
    assert_eq!(sup.state(), SupervisorState::Sandboxed);
}

#[test]
fn infer_one_past_the_window_is_rejected_and_resumes() {
    let mut sup = running(forward_config());
    let before = sup.machine().mem.clone();

    let (outcome, frame) = ecall(
        &mut sup,
        PC,
        SyscallId::Infer as u32,
        DATA_BASE,
        INPUT_WINDOW + 1,
    );

    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.services().engine().calls, 0);
    assert!(sup.services().protocol().received.is_empty());
    assert_eq!(frame.a0(), DATA_BASE);
    assert_eq!(frame.a1(), INPUT_WINDOW + 1);
    assert_eq!(sup.machine().mepc, PC + 4);
    // Only the ecall instruction the helper planted differs.
    assert_eq!(sup.machine().mem[(DATA_BASE - CODE_BASE) as usize..], before[(DATA_BASE - CODE_BASE) as usize..]);
}

#[test]
fn infer_below_the_window_and_wrapping_lengths_are_rejected() {
    let mut sup = running(forward_config());

    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE - 4, 8);
    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE + 8, u32::MAX);
    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE, 0);

    assert_eq!(sup.services().engine().calls, 0);
    assert_eq!(sup.state(), SupervisorState::Sandboxed);
}

#[test]
fn failed_inference_forwards_error_text() {
    let mut sup = running(forward_config());
    sup.services_mut().engine_mut().fail = true;

    let (outcome, _) = ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE, 4);

    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.services().engine().calls, 1);
    assert_eq!(sup.services().protocol().text(), "Inference error\r\n");
    assert_eq!(sup.services().protocol().flushes, 1);
}

#[test]
fn result_buffer_receives_scores_zero_padded() {
    let result_at = DATA_BASE + 0x400;
    let mut sup = running(
        SupervisorConfig::new(split_layout()).delivery(InferDelivery::ResultBuffer { addr: result_at }),
    );
    assert_eq!(sup.services().delivery(), InferDelivery::ResultBuffer { addr: result_at });
    sup.machine_mut().poke(result_at, &[0xEE; 16]);

    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE, 16);

    let mut expected = [0u8; 16];
    expected[..4].copy_from_slice(&[12, (-3i8) as u8, 0, 127]);
    assert_eq!(sup.machine().peek(result_at, 16), &expected);
    assert!(sup.services().protocol().received.is_empty());
}

#[test]
fn result_buffer_gets_sentinel_on_failure() {
    let result_at = DATA_BASE + 0x400;
    let mut sup = running(
        SupervisorConfig::new(split_layout())
            .delivery(InferDelivery::ResultBuffer { addr: result_at })
            .sentinel(0x80),
    );
    sup.services_mut().engine_mut().fail = true;

    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE, 16);

    assert_eq!(sup.machine().peek(result_at, 16), &[0x80; 16]);
}

#[test]
fn putchar_then_getchar_loops_back() {
    let mut sup = running(forward_config());

    let (_, frame) = ecall(&mut sup, PC, SyscallId::UartPutchar as u32, b'Z' as u32, 0);
    assert_eq!(frame.a0(), b'Z' as u32);
    let (outcome, frame) = ecall(&mut sup, PC + 4, SyscallId::UartGetchar as u32, 0, 0);

    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(frame.a0(), b'Z' as u32);
    assert_eq!(sup.services_mut().uart().sent, b"Z");
    assert_eq!(sup.machine().mepc, PC + 8);
}

#[test]
fn putchar_sends_only_the_low_byte() {
    let mut sup = running(forward_config());
    ecall(&mut sup, PC, SyscallId::UartPutchar as u32, 0x1234_5641, 0);
    assert_eq!(sup.services_mut().uart().sent, b"A");
}

#[test]
fn compressed_trap_site_advances_by_two() {
    let mut sup = running(forward_config());
    sup.machine_mut().poke(PC, &C_NOP.to_le_bytes());
    sup.machine_mut().raise(MCAUSE_ECALL_U, PC, 0);

    let mut frame = riscv_tee_gate::TrapFrame::zeroed();
    frame.regs[17] = SyscallId::UartPutchar as u32;
    frame.regs[10] = b'x' as u32;
    assert_eq!(sup.handle_trap(&mut frame), TrapOutcome::Resume);
    assert_eq!(sup.machine().mepc, PC + 2);
}

#[test]
fn read_counters_handles_high_half_rollover() {
    let mut sup = running(forward_config());
    {
        let m = sup.machine_mut();
        m.script_counter(CounterCsr::CycleH, &[1, 2, 2]);
        m.script_counter(CounterCsr::Cycle, &[0xFFFF_FFFF, 5]);
        m.script_counter(CounterCsr::InstretH, &[0]);
        m.script_counter(CounterCsr::Instret, &[42]);
    }
    let out = DATA_BASE + 0x20;

    let (outcome, _) = ecall(&mut sup, PC, SyscallId::ReadCounters as u32, out, 16);

    assert_eq!(outcome, TrapOutcome::Resume);
    let bytes = sup.machine().peek(out, 16);
    assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 0x2_0000_0005);
    assert_eq!(u64::from_le_bytes(bytes[8..].try_into().unwrap()), 42);
}

#[test]
fn read_counters_rejects_short_or_foreign_buffers() {
    let mut sup = running(forward_config());
    sup.machine_mut().script_counter(CounterCsr::Cycle, &[7]);

    ecall(&mut sup, PC, SyscallId::ReadCounters as u32, DATA_BASE, 8);
    assert_eq!(sup.machine().peek(DATA_BASE, 16), &[0; 16]);

    // Inside the PMP data window but outside the service window.
    ecall(&mut sup, PC, SyscallId::ReadCounters as u32, DATA_BASE + INPUT_WINDOW, 16);
    assert_eq!(sup.machine().peek(DATA_BASE + INPUT_WINDOW, 16), &[0; 16]);

    let (outcome, _) = ecall(&mut sup, PC, SyscallId::ReadCounters as u32, 0, 0);
    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.state(), SupervisorState::Sandboxed);
}

#[test]
fn service_window_defaults_to_the_pmp_data_window() {
    let mut sup = running(SupervisorConfig::new(split_layout()));

    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE + DATA_LEN - 8, 8);
    ecall(&mut sup, PC, SyscallId::Infer as u32, DATA_BASE + DATA_LEN - 8, 9);

    assert_eq!(sup.services().engine().calls, 1);
    assert_eq!(sup.services().window().low(), DATA_BASE);
    assert_eq!(sup.services().window().high(), u64::from(DATA_BASE + DATA_LEN));
}

fn ecall_from_stale_mpp(sup: &mut TestSupervisor, id: u32, a0: u32, a1: u32) -> TrapOutcome {
    let m = sup.machine_mut();
    m.poke(PC, &ECALL.to_le_bytes());
    m.raise(MCAUSE_ECALL_U, PC, 0);
    m.mpp = Privilege::Machine;

    let mut frame = TrapFrame::zeroed();
    frame.regs[10] = a0;
    frame.regs[11] = a1;
    frame.regs[17] = id;
    sup.handle_trap(&mut frame)
}

#[test]
fn every_resume_returns_to_user_mode() {
    let mut sup = running(forward_config());

    // Serviced.
    let outcome = ecall_from_stale_mpp(&mut sup, SyscallId::UartPutchar as u32, u32::from(b'x'), 0);
    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.machine().mpp, Privilege::User);

    // Rejected.
    let outcome = ecall_from_stale_mpp(&mut sup, SyscallId::Infer as u32, DATA_BASE, INPUT_WINDOW + 1);
    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!(sup.services().engine().calls, 0);
    assert_eq!(sup.machine().mpp, Privilege::User);
    assert_eq!(sup.machine().mepc, PC + 4);
}
