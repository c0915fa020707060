//! Four-ring protected-mode kernel bootstrap for i686.
//!
//! Ring 0 owns the GDT, IDT and page tables; rings 1..3 (devs, libs, users)
//! set up their own LDT/TSS pairs and reach ring 0 only through call gates.
//! Everything that touches the CPU is gated on `target_arch = "x86"`, so the
//! table encoders, dispatchers and the boot sequencer run as host tests.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod console;
pub mod cpu_mode;
pub mod kernel;
pub mod keyboard;
pub mod layout;
pub mod paging;
pub mod pic;
pub mod serial;
