//! Find USB host controllers on the PCI bus and start an engine for each.

use alloc::boxed::Box;
use alloc::sync::Arc;

use super::controller::{ControllerKind, HostController, HostControllerDriver};
use super::ehci::Ehci;
use super::ohci::Ohci;
use super::uhci::Uhci;
use super::xhci::Xhci;
use super::{UsbError, UsbSubsystem};
use crate::config::PollBudget;
use crate::drivers::pci::{self, ConfigAccess, DeviceClass};
use crate::hal::{Platform, RegisterBlock};

const SUBCLASS_USB: u8 = 0x03;

mod prog_if {
    pub const UHCI: u8 = 0x00;
    pub const OHCI: u8 = 0x10;
    pub const EHCI: u8 = 0x20;
    pub const XHCI: u8 = 0x30;
}

/// Serial Bus Release Number register.
const SBRN: u8 = 0x60;
const UHCI_IO_BAR: usize = 4;
const MMIO_BAR: usize = 0;

/// Where a controller's registers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWindow {
    Io(u16),
    Mmio(u64),
}

/// Engine and register window for a PCI function, if it is a usable
/// USB host controller.
pub fn select(access: &dyn ConfigAccess, dev: &pci::Device) -> Option<(ControllerKind, RegisterWindow)> {
    if dev.class() != DeviceClass::SerialBus || dev.subclass != SUBCLASS_USB {
        return None;
    }

    let mmio = || {
        dev.bar(MMIO_BAR)
            .filter(|bar| !bar.is_io)
            .map(|bar| RegisterWindow::Mmio(bar.address))
    };

    match dev.prog_if {
        prog_if::UHCI => {
            let bar = dev.bar(UHCI_IO_BAR).filter(|bar| bar.is_io)?;
            let port = u16::try_from(bar.address).ok()?;
            Some((ControllerKind::Uhci, RegisterWindow::Io(port)))
        }
        prog_if::OHCI => Some((ControllerKind::Ohci, mmio()?)),
        prog_if::EHCI => {
            let sbrn = dev.read8(access, SBRN);
            if sbrn != 0x20 {
                log::warn!("[usb] {}: EHCI with SBRN {:#x}, skipped", dev, sbrn);
                return None;
            }
            Some((ControllerKind::Ehci, mmio()?))
        }
        prog_if::XHCI => {
            let sbrn = dev.read8(access, SBRN);
            if !matches!(sbrn, 0x20 | 0x30 | 0x31) {
                log::warn!("[usb] {}: xHCI with SBRN {:#x}, skipped", dev, sbrn);
                return None;
            }
            Some((ControllerKind::Xhci, mmio()?))
        }
        other => {
            log::debug!("[usb] {}: unknown programming interface {:#x}", dev, other);
            None
        }
    }
}

/// Construct the engine for `kind` over `regs`.
pub fn start(
    kind: ControllerKind,
    regs: Box<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    budget: PollBudget,
) -> Result<Box<dyn HostControllerDriver>, UsbError> {
    Ok(match kind {
        ControllerKind::Uhci => Box::new(Uhci::new(regs, platform, budget)?),
        ControllerKind::Ohci => Box::new(Ohci::new(regs, platform, budget)?),
        ControllerKind::Ehci => Box::new(Ehci::new(regs, platform, budget)?),
        ControllerKind::Xhci => Box::new(Xhci::new(regs, platform, budget)?),
    })
}

/// Identity-mapped register access for a window.
fn map_window(window: RegisterWindow) -> Option<Box<dyn RegisterBlock>> {
    match window {
        RegisterWindow::Mmio(address) => {
            let base = usize::try_from(address).ok()?;
            Some(Box::new(unsafe { crate::hal::MmioRegisters::new(base) }))
        }
        #[cfg(target_arch = "x86_64")]
        RegisterWindow::Io(port) => Some(Box::new(unsafe { crate::hal::PortRegisters::new(port) })),
        #[cfg(not(target_arch = "x86_64"))]
        RegisterWindow::Io(_) => None,
    }
}

/// Scan `devices` and register every controller that initialises.
/// Returns the number registered.
pub fn probe(
    usb: &mut UsbSubsystem,
    access: &dyn ConfigAccess,
    devices: &[pci::Device],
    platform: Arc<dyn Platform>,
) -> usize {
    probe_with(usb, access, devices, platform, map_window)
}

/// [`probe`] with a caller-supplied register mapping.
pub fn probe_with<F>(
    usb: &mut UsbSubsystem,
    access: &dyn ConfigAccess,
    devices: &[pci::Device],
    platform: Arc<dyn Platform>,
    mut map: F,
) -> usize
where
    F: FnMut(RegisterWindow) -> Option<Box<dyn RegisterBlock>>,
{
    let budget = usb.config().transfer_budget;
    let mut registered = 0;

    for dev in devices {
        let Some((kind, window)) = select(access, dev) else {
            continue;
        };
        log::info!("[usb] {} controller at {} ({:?})", kind.name(), dev, window);

        let Some(regs) = map(window) else {
            log::warn!("[usb] {}: register window {:?} not reachable", dev, window);
            continue;
        };

        match window {
            RegisterWindow::Io(_) => dev.enable_io_space(access),
            RegisterWindow::Mmio(_) => dev.enable_memory_space(access),
        }
        dev.enable_bus_master(access);

        match start(kind, regs, platform.clone(), budget) {
            Ok(driver) => {
                usb.register(HostController::new(driver, platform.clone()));
                registered += 1;
            }
            Err(e) => log::warn!("[usb] {} init failed at {}: {}", kind.name(), dev, e),
        }
    }

    registered
}
