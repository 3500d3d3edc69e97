//! Hardware back ends for [`Machine`](crate::machine::Machine).

#[cfg(target_arch = "riscv32")]
pub mod riscv32;
