//! Machine-independent core of the minnow virtual memory system.
//!
//! Everything here builds for the kernel target (`no_std` + `alloc`) and for
//! the host, where the unit tests run against a mock machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod machine;
pub mod memory;
pub mod tlb;
pub mod vm;
