//! USB host stack
//!
//! Provides host controller drivers, enumeration and class drivers:
//! - UHCI, OHCI, EHCI and xHCI host controller engines
//! - Root hub and external hub enumeration
//! - Mass storage (Bulk-Only Transport, SCSI) class driver
//! - HID class driver (boot protocol keyboard)
//!
//! [`UsbSubsystem`] owns every registered controller together with the
//! storage and keyboard registries fed by the class drivers.

pub mod controller;
pub mod descriptors;
pub mod device;
pub mod ehci;
mod error;
pub mod hid;
pub mod hub;
pub mod mass_storage;
pub mod ohci;
pub mod probe;
#[cfg(test)]
pub mod testing;
pub mod uhci;
pub mod xhci;

use alloc::vec::Vec;

use crate::config::UsbConfig;
use crate::keyboard::{Keyboard, KeyboardKind, KeyboardRegistry};
use crate::storage::{StorageDevice, StorageKind, StorageRegistry};
use controller::{ControllerId, HostController};
use device::{DeviceClass, DeviceId};
use mass_storage::BulkOnly;

pub use error::{TransferStatus, UsbError};

/// A device on a particular controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSource {
    pub controller: ControllerId,
    pub device: DeviceId,
}

pub struct UsbSubsystem {
    config: UsbConfig,
    /// Most recently registered first.
    controllers: Vec<HostController>,
    next_controller_id: u32,
    buses: u8,
    /// Last Bulk-Only wrapper tag sent to any drive.
    scsi_tag: u32,
    storage: StorageRegistry,
    keyboards: KeyboardRegistry,
}

impl UsbSubsystem {
    pub fn new(config: UsbConfig) -> Self {
        UsbSubsystem {
            config,
            controllers: Vec::new(),
            next_controller_id: 1,
            buses: 0,
            scsi_tag: 0,
            storage: StorageRegistry::new(),
            keyboards: KeyboardRegistry::new(),
        }
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    pub fn keyboards(&self) -> &KeyboardRegistry {
        &self.keyboards
    }

    pub fn controllers(&self) -> impl Iterator<Item = &HostController> {
        self.controllers.iter()
    }

    pub fn controller(&self, id: ControllerId) -> Option<&HostController> {
        self.controllers.iter().find(|hc| hc.id == id)
    }

    fn controller_mut(&mut self, id: ControllerId) -> Result<&mut HostController, UsbError> {
        self.controllers
            .iter_mut()
            .find(|hc| hc.id == id)
            .ok_or(UsbError::InvalidDevice)
    }

    /// Add a discovered controller to the front of the list.
    pub fn register(&mut self, mut hc: HostController) -> ControllerId {
        let id = ControllerId(self.next_controller_id);
        self.next_controller_id += 1;
        hc.id = id;
        log::info!("[usb] registered {} controller", hc.kind().name());
        self.controllers.insert(0, hc);
        id
    }

    /// Number every bus and enumerate its root hub, then hand the storage
    /// and keyboard devices found to their class drivers.
    ///
    /// Runs once, after all controllers are registered.
    pub fn setup(&mut self) {
        for hc in self.controllers.iter_mut() {
            self.buses += 1;
            hc.bus = self.buses;
            hc.devices_count = 0;
            hc.root_register(&self.config);
        }
        self.claim_devices();
    }

    /// Rescan every hub attached to a root port for new devices.
    pub fn poll(&mut self) {
        for hc in self.controllers.iter_mut() {
            hc.poll(&self.config);
        }
        self.claim_devices();
    }

    /// Initialise class drivers for devices not yet seen by them.
    fn claim_devices(&mut self) {
        for hc in self.controllers.iter_mut() {
            let ids: Vec<DeviceId> = hc
                .device_ids()
                .filter(|&dev| !hc.device(dev).claimed)
                .collect();

            for dev in ids {
                let source = UsbSource {
                    controller: hc.id,
                    device: dev,
                };
                match hc.device(dev).class {
                    DeviceClass::Storage(_) => {
                        hc.device_mut(dev).claimed = true;
                        let mut drive =
                            BulkOnly::new(hc, dev, &mut self.scsi_tag, self.config.csw_policy);
                        match drive.get_info() {
                            Ok(capacity) => {
                                self.storage.register(StorageDevice {
                                    kind: StorageKind::UsbScsi,
                                    sector_size: capacity.sector_size,
                                    sector_count: capacity.sector_count,
                                    source,
                                });
                            }
                            Err(e) => log::warn!("[scsi] drive setup failed: {}", e),
                        }
                    }
                    DeviceClass::Keyboard(_) => {
                        hc.device_mut(dev).claimed = true;
                        match hid::initialize(hc, dev) {
                            Ok(()) => self.keyboards.register(Keyboard {
                                kind: KeyboardKind::Usb,
                                source,
                            }),
                            Err(e) => log::warn!("[hid] keyboard setup failed: {}", e),
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Read `sectors` sectors from registered storage device `index`.
    pub fn storage_read(
        &mut self,
        index: usize,
        lba: u64,
        sectors: u64,
        buf: &mut [u8],
    ) -> Result<(), UsbError> {
        let disk = *self.storage.get(index).ok_or(UsbError::InvalidDevice)?;
        let length = sectors
            .checked_mul(disk.sector_size as u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(UsbError::InvalidParameter)?;
        if buf.len() < length {
            return Err(UsbError::InvalidParameter);
        }

        let policy = self.config.csw_policy;
        let hc = self
            .controllers
            .iter_mut()
            .find(|hc| hc.id == disk.source.controller)
            .ok_or(UsbError::InvalidDevice)?;
        BulkOnly::new(hc, disk.source.device, &mut self.scsi_tag, policy).read10(
            lba,
            sectors,
            &mut buf[..length],
        )
    }

    /// Next character from the active keyboard. Blocks until a report
    /// arrives; `None` for reports without a mapped key.
    pub fn keyboard_getchar(&mut self) -> Result<Option<u8>, UsbError> {
        let keyboard = *self.keyboards.active().ok_or(UsbError::InvalidDevice)?;
        let hc = self.controller_mut(keyboard.source.controller)?;
        hid::getchar(hc, keyboard.source.device)
    }

    /// Log every bus with the devices behind it.
    pub fn dump(&self) {
        for hc in &self.controllers {
            log::info!(
                "[usb] Bus : {:#x} - {} ({}) :",
                hc.bus,
                hc.kind().name(),
                hc.kind().rate()
            );
            for dev in hc.device_listing() {
                log::info!("[usb]   {}", hc.device_id_line(dev));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::controller::ControllerKind;
    use crate::drivers::usb::testing::{MockBus, SimDevice};
    use alloc::vec;

    #[test]
    fn test_register_prepends_and_setup_numbers_buses() {
        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (first, _) = MockBus::controller(ControllerKind::Uhci, vec![None]);
        let (second, _) = MockBus::controller(ControllerKind::Ehci, vec![None]);
        let a = usb.register(first);
        let b = usb.register(second);
        assert_ne!(a, b);

        usb.setup();
        let kinds: Vec<_> = usb.controllers().map(|hc| (hc.kind(), hc.bus)).collect();
        assert_eq!(kinds, vec![(ControllerKind::Ehci, 1), (ControllerKind::Uhci, 2)]);
        assert_eq!(usb.controller(a).unwrap().kind(), ControllerKind::Uhci);
    }

    #[test]
    fn test_single_connected_port() {
        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (hc, _bus) = MockBus::controller(
            ControllerKind::Uhci,
            vec![Some(SimDevice::storage().with_speed(controller::Speed::Full)), None],
        );
        let id = usb.register(hc);
        usb.setup();

        let hc = usb.controller(id).unwrap();
        let root = hc.hub(hc.root_hub().unwrap());
        let dev = root.ports[0].unwrap();
        assert_eq!(hc.device(dev).address, 1);
        assert_eq!(hc.device(dev).speed, controller::Speed::Full);
        assert!(root.ports[1].is_none());
        assert_eq!(hc.device_listing().len(), 1);
    }

    #[test]
    fn test_storage_device_is_registered_once() {
        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (hc, _bus) = MockBus::controller(ControllerKind::Ohci, vec![Some(SimDevice::storage())]);
        let id = usb.register(hc);
        usb.setup();
        usb.poll();
        usb.poll();

        assert_eq!(usb.storage().len(), 1);
        let disk = usb.storage().get(0).unwrap();
        assert_eq!(disk.kind, StorageKind::UsbScsi);
        assert_eq!(disk.source.controller, id);
        assert_eq!(disk.sector_size, 512);
    }

    #[test]
    fn test_capacity16_device_reports_large_count() {
        let mut disk = SimDevice::storage();
        disk.reported_last_lba = Some(0xffff_ffff);
        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (hc, _bus) = MockBus::controller(ControllerKind::Ehci, vec![Some(disk)]);
        usb.register(hc);
        usb.setup();
        assert_eq!(usb.storage().get(0).unwrap().sector_count, 0x1_0000_0000);
    }

    #[test]
    fn test_storage_read_through_registry() {
        let mut image = vec![0u8; 512 * 4];
        image[512..1024].fill(0xab);
        let mut disk = SimDevice::storage();
        disk.set_image(image, 512);

        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (hc, _bus) = MockBus::controller(ControllerKind::Xhci, vec![Some(disk)]);
        usb.register(hc);
        usb.setup();

        let mut buf = vec![0u8; 512];
        usb.storage_read(0, 1, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xab));

        let mut short = vec![0u8; 100];
        assert_eq!(
            usb.storage_read(0, 1, 1, &mut short),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(usb.storage_read(5, 0, 1, &mut buf), Err(UsbError::InvalidDevice));
    }

    #[test]
    fn test_keyboard_getchar_through_registry() {
        let mut kbd = SimDevice::keyboard();
        kbd.push_report([0, 0, 0x0b, 0, 0, 0, 0, 0]);
        kbd.push_report([0, 0, 0x0c, 0, 0, 0, 0, 0]);

        let mut usb = UsbSubsystem::new(UsbConfig::default());
        let (hc, _bus) = MockBus::controller(ControllerKind::Uhci, vec![Some(kbd)]);
        usb.register(hc);
        usb.setup();

        assert_eq!(usb.keyboards().len(), 1);
        assert_eq!(usb.keyboard_getchar(), Ok(Some(b'h')));
        assert_eq!(usb.keyboard_getchar(), Ok(Some(b'i')));
    }

    #[test]
    fn test_no_keyboard() {
        let mut usb = UsbSubsystem::new(UsbConfig::default());
        usb.setup();
        assert_eq!(usb.keyboard_getchar(), Err(UsbError::InvalidDevice));
        usb.dump();
    }

    #[test]
    fn test_independent_subsystems() {
        let mut one = UsbSubsystem::new(UsbConfig::default());
        let mut two = UsbSubsystem::new(UsbConfig::default());
        let (a, _) = MockBus::controller(ControllerKind::Ehci, vec![Some(SimDevice::storage())]);
        let (b, _) = MockBus::controller(ControllerKind::Ehci, vec![Some(SimDevice::storage())]);
        one.register(a);
        two.register(b);
        one.setup();
        two.setup();
        assert_eq!(one.storage().len(), 1);
        assert_eq!(two.storage().len(), 1);
        assert_eq!(one.controllers().next().unwrap().bus, 1);
        assert_eq!(two.controllers().next().unwrap().bus, 1);
    }
}
