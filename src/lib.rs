//! minnow kernel.
//!
//! The kernel side of the virtual memory subsystem: the machine bindings
//! and the statics wiring `shared`'s VM core to them. Process management,
//! the executable loader, and the trap entry glue call in through [`mm`].

#![no_std]

pub mod mips;
pub mod mm;
