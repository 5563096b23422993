//! Device registration and classification.
//!
//! A device is addressed, its descriptors are read into a [`Device`] record
//! and it is then classified by class code as a hub, a mass-storage drive or
//! a boot keyboard. Failures along the way leave the device partially
//! initialised; enumeration of other ports carries on.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::controller::{ControllerKind, Endpoint, HostController, Speed};
use super::descriptors::{
    class_code, descriptor_type, hid_protocol, hid_subclass,
    storage_protocol, storage_subclass, ConfigDescriptor, Descriptor, DescriptorCursor,
    DeviceDescriptor, EndpointDescriptor, HidDescriptor, InterfaceDescriptor, LANGUAGE_EN_US,
};
use super::hub::{HubId, PortChain};
use super::UsbError;
use crate::config::UsbConfig;

/// Highest address a USB device can be given.
pub const MAX_ADDRESS: u8 = 127;

/// Index of a device in its controller's device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub usize);

#[derive(Debug, Clone)]
pub struct Interface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl Interface {
    pub fn number(&self) -> u8 {
        self.descriptor.b_interface_number
    }

    fn is_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.descriptor.b_interface_class == class
            && self.descriptor.b_interface_sub_class == subclass
            && self.descriptor.b_interface_protocol == protocol
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StorageInfo {
    pub interface: u8,
    /// Highest logical unit number reported by GET MAX LUN.
    pub luns: u8,
    pub in_endpoint: Endpoint,
    pub out_endpoint: Endpoint,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyboardInfo {
    pub interface: u8,
    pub hid: HidDescriptor,
    pub endpoint: Endpoint,
}

/// What a device turned out to be.
#[derive(Debug, Clone, Copy)]
pub enum DeviceClass {
    Unclassified,
    Hub(HubId),
    Storage(StorageInfo),
    Keyboard(KeyboardInfo),
}

impl DeviceClass {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceClass::Unclassified => "Device",
            DeviceClass::Hub(_) => "Hub",
            DeviceClass::Storage(_) => "Storage",
            DeviceClass::Keyboard(_) => "Keyboard",
        }
    }
}

/// Classification result computed from descriptors alone.
#[derive(Debug, Clone, Copy)]
pub enum ClassMatch {
    Hub,
    Storage(StorageInfo),
    Keyboard(KeyboardInfo),
    Unrecognized,
}

pub struct Device {
    pub address: u8,
    pub speed: Speed,
    /// 1-based port on the parent hub.
    pub port: u8,
    pub parent: Option<HubId>,
    pub descriptor: DeviceDescriptor,
    pub config: ConfigDescriptor,
    pub interfaces: Vec<Interface>,
    /// Full configuration descriptor set as returned by the device.
    pub config_blob: Vec<u8>,
    pub class: DeviceClass,
    /// Registered with the storage or keyboard registry.
    pub(crate) claimed: bool,
}

impl Device {
    fn new(address: u8, speed: Speed) -> Self {
        Device {
            address,
            speed,
            port: 0,
            parent: None,
            descriptor: DeviceDescriptor::default(),
            config: ConfigDescriptor::default(),
            interfaces: Vec::new(),
            config_blob: Vec::new(),
            class: DeviceClass::Unclassified,
            claimed: false,
        }
    }
}

// =============================================================================
// Configuration Blob Parsing
// =============================================================================

/// Collect `config.b_num_interfaces` interfaces and their endpoints from the
/// configuration blob. Interfaces completed before a malformed descriptor
/// stay in `interfaces`.
pub fn parse_interfaces(
    blob: &[u8],
    config: &ConfigDescriptor,
    interfaces: &mut Vec<Interface>,
) -> Result<(), UsbError> {
    let mut cursor = DescriptorCursor::new(blob, config.b_length as usize);

    for _ in 0..config.b_num_interfaces {
        let raw = cursor.find(descriptor_type::INTERFACE)?;
        let descriptor =
            InterfaceDescriptor::parse(raw.bytes).ok_or(UsbError::MalformedDescriptor)?;

        let wanted = descriptor.b_num_endpoints as usize;
        let mut endpoints = Vec::with_capacity(wanted);
        while endpoints.len() < wanted {
            let raw = cursor.find(descriptor_type::ENDPOINT)?;
            endpoints
                .push(EndpointDescriptor::parse(raw.bytes).ok_or(UsbError::MalformedDescriptor)?);
        }

        interfaces.push(Interface {
            descriptor,
            endpoints,
        });
    }

    Ok(())
}

/// Find the HID class descriptor that follows interface `number`.
pub fn find_hid_descriptor(
    blob: &[u8],
    config: &ConfigDescriptor,
    number: u8,
) -> Result<HidDescriptor, UsbError> {
    let mut cursor = DescriptorCursor::new(blob, config.b_length as usize);

    loop {
        let raw = cursor.find(descriptor_type::INTERFACE)?;
        let iface = InterfaceDescriptor::parse(raw.bytes).ok_or(UsbError::MalformedDescriptor)?;
        if iface.b_interface_number == number {
            break;
        }
    }

    for raw in cursor {
        let raw = raw?;
        match raw.descriptor_type {
            descriptor_type::HID => {
                return HidDescriptor::parse(raw.bytes).ok_or(UsbError::MalformedDescriptor)
            }
            // The next interface starts: this one has no HID descriptor.
            descriptor_type::INTERFACE => break,
            _ => {}
        }
    }
    Err(UsbError::InvalidDevice)
}

// =============================================================================
// Classification
// =============================================================================

fn match_keyboard(device: &Device) -> Option<ClassMatch> {
    let iface = device.interfaces.iter().find(|i| {
        i.is_class(class_code::HID, hid_subclass::BOOT, hid_protocol::KEYBOARD)
    })?;

    let hid = match find_hid_descriptor(&device.config_blob, &device.config, iface.number()) {
        Ok(hid) => hid,
        Err(e) => {
            log::warn!("[usb] keyboard interface {}: no HID descriptor ({})", iface.number(), e);
            return None;
        }
    };
    // Localized keyboards are not supported.
    if hid.b_country_code != 0 {
        return None;
    }

    let endpoint = iface
        .endpoints
        .iter()
        .find(|ep| ep.is_in() && ep.is_interrupt())?;

    Some(ClassMatch::Keyboard(KeyboardInfo {
        interface: iface.number(),
        hid,
        endpoint: Endpoint::new(*endpoint),
    }))
}

fn match_storage(device: &Device) -> Option<ClassMatch> {
    let iface = device.interfaces.iter().find(|i| {
        i.is_class(
            class_code::MASS_STORAGE,
            storage_subclass::SCSI,
            storage_protocol::BULK_ONLY,
        )
    })?;

    let bulk_in = iface.endpoints.iter().find(|ep| ep.is_in() && ep.is_bulk())?;
    let bulk_out = iface.endpoints.iter().find(|ep| !ep.is_in() && ep.is_bulk())?;

    Some(ClassMatch::Storage(StorageInfo {
        interface: iface.number(),
        luns: 0,
        in_endpoint: Endpoint::new(*bulk_in),
        out_endpoint: Endpoint::new(*bulk_out),
    }))
}

/// Decide the class of `device` from its cached descriptors.
pub fn classify(device: &Device) -> ClassMatch {
    match device.descriptor.b_device_class {
        class_code::PER_INTERFACE => match_keyboard(device)
            .or_else(|| match_storage(device))
            .unwrap_or(ClassMatch::Unrecognized),
        class_code::HUB => ClassMatch::Hub,
        _ => ClassMatch::Unrecognized,
    }
}

// =============================================================================
// Registration
// =============================================================================

impl HostController {
    /// Read the device, configuration, interface and endpoint descriptors.
    fn identify_device(&mut self, dev: DeviceId) -> Result<(), UsbError> {
        // The first 8 bytes carry the default pipe's max packet size.
        let mut raw = [0u8; 18];
        self.get_descriptor(dev, 0, descriptor_type::DEVICE, 0, 0, &mut raw[..8])?;
        self.devices[dev.0].descriptor =
            DeviceDescriptor::parse(&raw).ok_or(UsbError::MalformedDescriptor)?;

        self.get_descriptor(dev, 0, descriptor_type::DEVICE, 0, 0, &mut raw)?;
        let descriptor = DeviceDescriptor::parse(&raw).ok_or(UsbError::MalformedDescriptor)?;
        self.devices[dev.0].descriptor = descriptor;

        if descriptor.b_num_configurations != 1 {
            log::warn!(
                "[usb] device {}: {} configurations, only single-configuration devices are supported",
                self.devices[dev.0].address,
                descriptor.b_num_configurations
            );
            return Err(UsbError::Unsupported);
        }

        let mut header = [0u8; 9];
        self.get_descriptor(dev, 0, descriptor_type::CONFIGURATION, 0, 0, &mut header)?;
        let config = ConfigDescriptor::parse(&header).ok_or(UsbError::MalformedDescriptor)?;
        self.devices[dev.0].config = config;

        let total = config.w_total_length as usize;
        if total < header.len() {
            return Err(UsbError::MalformedDescriptor);
        }
        let mut blob = vec![0u8; total];
        self.get_descriptor(dev, 0, descriptor_type::CONFIGURATION, 0, 0, &mut blob)?;

        let device = &mut self.devices[dev.0];
        let result = parse_interfaces(&blob, &config, &mut device.interfaces);
        device.config_blob = blob;
        result
    }

    /// Register the device that was just reset on some port.
    ///
    /// Legacy controllers talk to it at address 0 and move it to the next
    /// free address; on xHCI the address was already assigned by `port_init`.
    pub(crate) fn device_register(
        &mut self,
        config: &UsbConfig,
        speed: Speed,
        hub: HubId,
        port: u8,
    ) -> Option<DeviceId> {
        let xhci = self.kind() == ControllerKind::Xhci;
        if !xhci && self.devices_count >= MAX_ADDRESS {
            log::warn!("[usb] bus {}: out of device addresses", self.bus);
            return None;
        }

        let address = if xhci { self.devices_count } else { 0 };
        let dev = DeviceId(self.devices.len());
        let mut device = Device::new(address, speed);
        // Known before linking so split transactions can be routed.
        device.parent = Some(hub);
        device.port = port;
        self.devices.push(device);

        if let Err(e) = self.identify_device(dev) {
            log::warn!("[usb] bus {}: device identification failed: {}", self.bus, e);
        }

        if !xhci {
            self.devices[dev.0].address = 0;
            self.devices_count += 1;
            let new_address = self.devices_count;
            if let Err(e) = self.set_address(dev, new_address) {
                log::warn!("[usb] SET_ADDRESS {} failed: {}", new_address, e);
            }
            self.platform.sleep_ms(config.set_address_settle_ms);
            self.devices[dev.0].address = new_address;
        }

        if let Err(e) = self.set_configuration(dev, 1) {
            log::warn!(
                "[usb] device {}: SET_CONFIGURATION failed: {}",
                self.devices[dev.0].address,
                e
            );
        }

        self.dump_device_info(config, dev);
        Some(dev)
    }

    /// Classify a freshly linked device and attach its class payload.
    pub(crate) fn register_specific_info(&mut self, config: &UsbConfig, dev: DeviceId) {
        if !matches!(self.devices[dev.0].class, DeviceClass::Unclassified) {
            return;
        }

        match classify(&self.devices[dev.0]) {
            ClassMatch::Hub => {
                if let Err(e) = self.check_hub(config, dev) {
                    log::warn!(
                        "[hub] device {}: hub setup failed: {}",
                        self.devices[dev.0].address,
                        e
                    );
                }
            }
            ClassMatch::Storage(info) => self.devices[dev.0].class = DeviceClass::Storage(info),
            ClassMatch::Keyboard(info) => self.devices[dev.0].class = DeviceClass::Keyboard(info),
            ClassMatch::Unrecognized => {}
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Read string descriptor `index` in US English, keeping the low byte of
    /// each UTF-16 unit.
    pub fn string_descriptor(&mut self, dev: DeviceId, index: u8) -> Result<String, UsbError> {
        if index == 0 {
            return Ok(String::new());
        }

        let mut head = [0u8; 2];
        self.get_descriptor(dev, 0, descriptor_type::STRING, index, LANGUAGE_EN_US, &mut head)?;
        let length = head[0] as usize;
        if length < 2 {
            return Err(UsbError::MalformedDescriptor);
        }

        let mut raw = vec![0u8; length];
        self.get_descriptor(dev, 0, descriptor_type::STRING, index, LANGUAGE_EN_US, &mut raw)?;

        Ok(raw[2..].chunks_exact(2).map(|unit| unit[0] as char).collect())
    }

    fn dump_device_info(&mut self, config: &UsbConfig, dev: DeviceId) {
        if config.dump_strings {
            let descriptor = self.devices[dev.0].descriptor;
            for index in [
                descriptor.i_manufacturer,
                descriptor.i_product,
                descriptor.i_serial_number,
            ] {
                match self.string_descriptor(dev, index) {
                    Ok(s) if !s.is_empty() => log::debug!("[usb]   {}", s),
                    Ok(_) => {}
                    Err(e) => log::debug!("[usb]   string {} unavailable: {}", index, e),
                }
            }
        }

        for iface in &self.devices[dev.0].interfaces {
            for ep in &iface.endpoints {
                let max_packet_size = ep.w_max_packet_size;
                log::debug!(
                    "[usb]   endpoint {:#04x} attributes {:#04x} max packet {:#x}",
                    ep.b_endpoint_address,
                    ep.bm_attributes,
                    max_packet_size
                );
            }
        }
    }

    /// Port path of a device: its hub's chain plus its own port, or the
    /// chain of the hub it became.
    pub fn device_port_chain(&self, dev: DeviceId) -> PortChain {
        let device = &self.devices[dev.0];
        match device.class {
            DeviceClass::Hub(hub) => self.hubs[hub.0].port_chain,
            _ => {
                let parent = device
                    .parent
                    .map(|hub| self.hubs[hub.0].port_chain)
                    .unwrap_or_default();
                parent.extended(device.port)
            }
        }
    }

    /// One-line identification used by the bus listing.
    pub fn device_id_line(&self, dev: DeviceId) -> String {
        use core::fmt::Write;

        let device = &self.devices[dev.0];
        let vendor = device.descriptor.id_vendor;
        let product = device.descriptor.id_product;

        let mut line = String::new();
        let _ = write!(
            line,
            "{} - Address:{:#x}. Port:{} Vendor:{:#06x}. Product:{:#06x}.",
            device.class.name(),
            device.address,
            self.device_port_chain(dev),
            vendor,
            product
        );
        line
    }
}
