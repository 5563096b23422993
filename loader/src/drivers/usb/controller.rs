//! Host controller abstraction.
//!
//! Every engine (UHCI, OHCI, EHCI, xHCI) implements [`HostControllerDriver`].
//! [`HostController`] wraps one driver together with the devices and hubs
//! enumerated behind it and provides the generic transfer path used by the
//! hub, enumeration and class-driver code.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::descriptors::{request, request_type, EndpointDescriptor, SetupPacket};
use super::device::{Device, DeviceClass, DeviceId};
use super::hub::{Hub, HubId};
use super::{TransferStatus, UsbError};
use crate::hal::{DmaBuffer, Platform};

/// Default control pipe packet size before the device descriptor is known.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Uhci,
    Ohci,
    Ehci,
    Xhci,
}

impl ControllerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerKind::Uhci => "UHCI",
            ControllerKind::Ohci => "OHCI",
            ControllerKind::Ehci => "EHCI",
            ControllerKind::Xhci => "XHCI",
        }
    }

    pub fn rate(&self) -> &'static str {
        match self {
            ControllerKind::Uhci | ControllerKind::Ohci => "1.5 Mb/s|12 Mb/s",
            ControllerKind::Ehci => "480 Mb/s",
            ControllerKind::Xhci => "5000 Mb/s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Speed::Low => "low",
            Speed::Full => "full",
            Speed::High => "high",
            Speed::Super => "super",
            Speed::SuperPlus => "super+",
        })
    }
}

/// Address and speed of the device a transfer is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTarget {
    pub address: u8,
    pub speed: Speed,
    /// Hub address and 1-based port of the transaction translator serving a
    /// low/full-speed device behind a high-speed hub.
    pub translator: Option<(u8, u8)>,
}

impl DeviceTarget {
    pub const fn new(address: u8, speed: Speed) -> Self {
        DeviceTarget {
            address,
            speed,
            translator: None,
        }
    }
}

/// An endpoint descriptor plus the host's data toggle for it.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub toggle: bool,
}

impl Endpoint {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        Endpoint {
            descriptor,
            toggle: false,
        }
    }

    pub fn number(&self) -> u8 {
        self.descriptor.endpoint_number()
    }

    pub fn is_in(&self) -> bool {
        self.descriptor.is_in()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size()
    }

    pub fn interval(&self) -> u8 {
        self.descriptor.b_interval
    }
}

/// An interrupt transfer submitted to an engine.
///
/// `slot` is engine private (queue head, endpoint descriptor or ring index).
/// Once a terminal status is observed it is cached so later polls return it
/// unchanged.
pub struct TransferHandle {
    pub(crate) slot: usize,
    pub(crate) buffer: Option<DmaBuffer>,
    pub(crate) length: usize,
    /// Data toggle the endpoint moves to once this transfer succeeds.
    /// `None` when the controller tracks toggles itself.
    pub(crate) toggle: Option<bool>,
    device: Option<DeviceId>,
    status: Option<TransferStatus>,
}

impl TransferHandle {
    pub(crate) fn new(slot: usize, buffer: Option<DmaBuffer>, length: usize) -> Self {
        TransferHandle {
            slot,
            buffer,
            length,
            toggle: None,
            device: None,
            status: None,
        }
    }

    pub(crate) fn with_toggle(mut self, toggle: bool) -> Self {
        self.toggle = Some(toggle);
        self
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn finished(&self) -> Option<TransferStatus> {
        self.status
    }
}

/// First-free allocator over a fixed descriptor pool.
pub struct SlotPool {
    used: Vec<bool>,
}

impl SlotPool {
    pub fn new(count: usize) -> Self {
        SlotPool {
            used: alloc::vec![false; count],
        }
    }

    pub fn alloc(&mut self) -> Result<usize, UsbError> {
        let slot = self
            .used
            .iter()
            .position(|used| !used)
            .ok_or(UsbError::NoDescriptors)?;
        self.used[slot] = true;
        Ok(slot)
    }

    pub fn free(&mut self, slot: usize) {
        debug_assert!(self.used[slot], "slot {} freed twice", slot);
        self.used[slot] = false;
    }

    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|used| **used).count()
    }
}

/// Operations every host controller engine provides.
///
/// Root ports are numbered from 0 here; hub requests use 1-based ports.
pub trait HostControllerDriver: Send {
    fn kind(&self) -> ControllerKind;

    fn root_ports(&self) -> u8;

    /// Whether a device sits on `port`; clears write-1-to-clear change bits.
    fn port_connected(&mut self, port: u8) -> bool;

    /// Speed of the device on `port`, `None` if this controller cannot drive it.
    fn port_speed(&mut self, _port: u8) -> Option<Speed> {
        None
    }

    fn port_reset(&mut self, _port: u8) -> Result<(), UsbError> {
        Err(UsbError::Unsupported)
    }

    /// Bring up the device on `port` and give it `address` (xHCI only).
    fn port_init(&mut self, _port: u8, _address: u8) -> Result<Speed, UsbError> {
        Err(UsbError::Unsupported)
    }

    fn control_transfer(
        &mut self,
        target: DeviceTarget,
        max_packet_size: u16,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError>;

    /// Move `data` through `endpoint`; direction comes from the endpoint
    /// address and `endpoint.toggle` is left ready for the next call.
    fn bulk_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        data: &mut [u8],
    ) -> Result<(), UsbError>;

    /// Queue an IN transfer. `endpoint.toggle` is not touched; the toggle
    /// to continue with goes on the handle.
    fn interrupt_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        length: usize,
    ) -> Result<TransferHandle, UsbError>;

    /// Poll an interrupt transfer; on success its data is copied to `data`.
    fn check_transfer_status(
        &mut self,
        handle: &mut TransferHandle,
        data: &mut [u8],
    ) -> TransferStatus;
}

/// Process-lifetime identity of a registered controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerId(pub u32);

/// One host controller with everything enumerated behind it.
pub struct HostController {
    pub(crate) id: ControllerId,
    pub bus: u8,
    pub(crate) driver: Box<dyn HostControllerDriver>,
    pub(crate) platform: Arc<dyn Platform>,
    /// Last address handed out on this bus.
    pub(crate) devices_count: u8,
    pub(crate) devices: Vec<Device>,
    pub(crate) hubs: Vec<Hub>,
    pub(crate) root_hub: Option<HubId>,
}

impl HostController {
    pub fn new(driver: Box<dyn HostControllerDriver>, platform: Arc<dyn Platform>) -> Self {
        HostController {
            id: ControllerId(0),
            bus: 0,
            driver,
            platform,
            devices_count: 0,
            devices: Vec::new(),
            hubs: Vec::new(),
            root_hub: None,
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn kind(&self) -> ControllerKind {
        self.driver.kind()
    }

    pub fn devices_count(&self) -> u8 {
        self.devices_count
    }

    pub fn root_hub(&self) -> Option<HubId> {
        self.root_hub
    }

    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    pub fn hub(&self, id: HubId) -> &Hub {
        &self.hubs[id.0]
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.devices.len()).map(DeviceId)
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    fn target(&self, dev: DeviceId) -> DeviceTarget {
        let device = &self.devices[dev.0];
        DeviceTarget {
            address: device.address,
            speed: device.speed,
            translator: self.translator(dev),
        }
    }

    /// Nearest high-speed hub upstream of a low/full-speed device.
    fn translator(&self, dev: DeviceId) -> Option<(u8, u8)> {
        if !matches!(self.devices[dev.0].speed, Speed::Low | Speed::Full) {
            return None;
        }
        let mut child = dev;
        loop {
            let hub = self.devices[child.0].parent?;
            let hub_dev = self.hubs[hub.0].device?;
            let upstream = &self.devices[hub_dev.0];
            if upstream.speed == Speed::High {
                return Some((upstream.address, self.devices[child.0].port));
            }
            child = hub_dev;
        }
    }

    // =========================================================================
    // Generic transfer path
    // =========================================================================

    pub fn control_transfer(
        &mut self,
        dev: DeviceId,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        if data.len() < setup.w_length as usize {
            return Err(UsbError::InvalidParameter);
        }
        let target = self.target(dev);
        let max_packet_size = match self.devices[dev.0].descriptor.b_max_packet_size0 {
            0 => DEFAULT_MAX_PACKET_SIZE,
            n => n as u16,
        };
        let length = setup.w_length as usize;
        self.driver
            .control_transfer(target, max_packet_size, &setup, &mut data[..length])
    }

    /// Control request with no data stage.
    pub fn control_request(
        &mut self,
        dev: DeviceId,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    ) -> Result<(), UsbError> {
        let setup = SetupPacket::new(request_type, request, value, index, 0);
        self.control_transfer(dev, setup, &mut [])
    }

    pub fn set_address(&mut self, dev: DeviceId, address: u8) -> Result<(), UsbError> {
        self.control_request(
            dev,
            request_type::HOST_TO_DEVICE,
            request::SET_ADDRESS,
            address as u16,
            0,
        )
    }

    pub fn set_configuration(&mut self, dev: DeviceId, value: u8) -> Result<(), UsbError> {
        self.control_request(
            dev,
            request_type::HOST_TO_DEVICE | request_type::STANDARD | request_type::RECIPIENT_DEVICE,
            request::SET_CONFIGURATION,
            value as u16,
            0,
        )
    }

    pub fn get_descriptor(
        &mut self,
        dev: DeviceId,
        flags: u8,
        descriptor_type: u8,
        index: u8,
        language: u16,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        let length = u16::try_from(data.len()).map_err(|_| UsbError::InvalidParameter)?;
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST | flags,
            request::GET_DESCRIPTOR,
            (descriptor_type as u16) << 8 | index as u16,
            language,
            length,
        );
        self.control_transfer(dev, setup, data)
    }

    /// Bulk transfer on a mass-storage device's IN or OUT endpoint.
    pub fn bulk_transfer(
        &mut self,
        dev: DeviceId,
        out: bool,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        if data.is_empty() {
            return Ok(());
        }
        let target = self.target(dev);
        let endpoint = match &mut self.devices[dev.0].class {
            DeviceClass::Storage(storage) if out => &mut storage.out_endpoint,
            DeviceClass::Storage(storage) => &mut storage.in_endpoint,
            _ => return Err(UsbError::InvalidDevice),
        };
        self.driver.bulk_transfer(target, endpoint, data)
    }

    /// Start an interrupt IN transfer on a keyboard's report endpoint.
    pub fn interrupt_transfer(
        &mut self,
        dev: DeviceId,
        length: usize,
    ) -> Result<TransferHandle, UsbError> {
        let target = self.target(dev);
        let endpoint = match &mut self.devices[dev.0].class {
            DeviceClass::Keyboard(keyboard) => &mut keyboard.endpoint,
            _ => return Err(UsbError::InvalidDevice),
        };
        let mut handle = self.driver.interrupt_transfer(target, endpoint, length)?;
        handle.device = Some(dev);
        Ok(handle)
    }

    pub fn check_transfer_status(
        &mut self,
        handle: &mut TransferHandle,
        data: &mut [u8],
    ) -> TransferStatus {
        if let Some(status) = handle.status {
            return status;
        }
        let status = self.driver.check_transfer_status(handle, data);
        if status == TransferStatus::Success {
            if let (Some(dev), Some(toggle)) = (handle.device, handle.toggle) {
                if let DeviceClass::Keyboard(keyboard) = &mut self.devices[dev.0].class {
                    keyboard.endpoint.toggle = toggle;
                }
            }
        }
        if status.is_finished() {
            handle.status = Some(status);
            if let Some(buffer) = handle.buffer.take() {
                self.platform.free_dma(buffer);
            }
        }
        status
    }
}
