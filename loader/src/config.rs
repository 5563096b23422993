//! Tunables for the USB stack.

use log::LevelFilter;

/// How much of a Command Status Wrapper the mass-storage driver checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswPolicy {
    /// Read the CSW and ignore its contents.
    Trusting,
    /// Require a valid signature, the tag that was sent and a zero status.
    Strict,
}

/// Bounded busy-poll: `iterations` checks with `interval_ms` sleeps between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub iterations: u32,
    pub interval_ms: u32,
}

impl PollBudget {
    pub const fn new(iterations: u32, interval_ms: u32) -> Self {
        PollBudget {
            iterations,
            interval_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub csw_policy: CswPolicy,
    /// Completion budget shared by every engine's transfer loop.
    pub transfer_budget: PollBudget,
    /// Delay after SET_ADDRESS before the device answers at its new address.
    pub set_address_settle_ms: u32,
    /// Downstream hub port reset: status checks and the sleep between them.
    pub hub_reset_checks: u32,
    pub hub_reset_poll_ms: u32,
    /// Fetch and log string descriptors while registering devices.
    pub dump_strings: bool,
    pub log_level: LevelFilter,
}

impl Default for UsbConfig {
    fn default() -> Self {
        UsbConfig {
            csw_policy: CswPolicy::Trusting,
            transfer_budget: PollBudget::new(100, 1),
            set_address_settle_ms: 2,
            hub_reset_checks: 10,
            hub_reset_poll_ms: 10,
            dump_strings: true,
            log_level: LevelFilter::Info,
        }
    }
}
