//! Boot loader USB host stack.
//!
//! Drives UHCI, OHCI, EHCI and xHCI host controllers found on the PCI bus,
//! enumerates the hubs and devices behind them and exposes USB mass-storage
//! drives and boot-protocol keyboards to the rest of the loader.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod drivers;
pub mod hal;
pub mod keyboard;
pub mod logger;
#[cfg(target_arch = "x86_64")]
pub mod platform;
#[cfg(target_arch = "x86_64")]
pub mod serial;
pub mod storage;
