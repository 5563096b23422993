//! USB bring-up during boot.
//!
//! [`init`] finds and starts every host controller, enumerates what is
//! attached and publishes the resulting [`UsbSubsystem`] for the storage
//! and keyboard consumers.

use alloc::boxed::Box;
use alloc::sync::Arc;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::config::UsbConfig;
use crate::drivers::pci::{self, ConfigAccess};
use crate::drivers::usb::probe::{self, RegisterWindow};
use crate::drivers::usb::UsbSubsystem;
use crate::hal::{Platform, RegisterBlock};

static USB: OnceCell<Mutex<UsbSubsystem>> = OnceCell::uninit();

/// Probe, start and enumerate all USB controllers, then publish the
/// subsystem. Returns the number of controllers brought up.
pub fn init(platform: Arc<dyn Platform>, pci_access: &dyn ConfigAccess, config: UsbConfig) -> usize {
    if USB.is_initialized() {
        log::warn!("[usb] already initialised");
        return 0;
    }

    let usb = bring_up(platform, pci_access, config, None);
    let controllers = usb.controllers().count();
    if USB.try_init_once(|| Mutex::new(usb)).is_err() {
        log::warn!("[usb] already initialised");
        return 0;
    }
    controllers
}

type MapFn<'a> = &'a mut dyn FnMut(RegisterWindow) -> Option<Box<dyn RegisterBlock>>;

fn bring_up(
    platform: Arc<dyn Platform>,
    pci_access: &dyn ConfigAccess,
    config: UsbConfig,
    map: Option<MapFn<'_>>,
) -> UsbSubsystem {
    log::set_max_level(config.log_level);
    let mut usb = UsbSubsystem::new(config);

    let devices = pci::enumerate(pci_access);
    let registered = match map {
        Some(map) => probe::probe_with(&mut usb, pci_access, &devices, platform, map),
        None => probe::probe(&mut usb, pci_access, &devices, platform),
    };
    log::info!("[usb] {} host controller(s) started", registered);

    usb.setup();
    usb.dump();
    log::info!(
        "[usb] {} storage device(s), {} keyboard(s)",
        usb.storage().len(),
        usb.keyboards().len()
    );
    usb
}

/// Run `f` with the published subsystem. `None` before [`init`].
pub fn with_usb<R>(f: impl FnOnce(&mut UsbSubsystem) -> R) -> Option<R> {
    USB.get().map(|usb| f(&mut usb.lock()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::pci::testing::FakeConfig;
    use crate::drivers::usb::controller::ControllerKind;
    use crate::drivers::usb::testing::{FakeRegisters, TestPlatform};

    #[test]
    fn test_bring_up_starts_probed_controllers() {
        let mut space = FakeConfig::new();
        space.add_function((0, 1, 0), (0x0C, 0x03, 0x00), 0x00);
        space.add_bar((0, 1, 0), 4, 0x0000_c001, 0xFFFF_FFE1);

        let mut map = |_window: RegisterWindow| {
            Some(Box::new(FakeRegisters::new(0x100)) as Box<dyn RegisterBlock>)
        };
        let usb = bring_up(
            Arc::new(TestPlatform::new()),
            &space,
            UsbConfig::default(),
            Some(&mut map),
        );
        let kinds: alloc::vec::Vec<_> = usb.controllers().map(|hc| (hc.kind(), hc.bus)).collect();
        assert_eq!(kinds, vec![(ControllerKind::Uhci, 1)]);
        assert!(usb.storage().is_empty());
    }

    #[test]
    fn test_init_publishes_once() {
        let space = FakeConfig::new();
        assert_eq!(init(Arc::new(TestPlatform::new()), &space, UsbConfig::default()), 0);
        assert_eq!(with_usb(|usb| usb.controllers().count()), Some(0));

        // A second call leaves the published subsystem alone.
        assert_eq!(init(Arc::new(TestPlatform::new()), &space, UsbConfig::default()), 0);
        assert!(with_usb(|usb| usb.storage().is_empty()).unwrap());
    }
}
