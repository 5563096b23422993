//! USB Standard Descriptor Types
//!
//! Standard, hub and HID descriptor layouts used during enumeration, the
//! 8-byte setup packet, and a bounds-checked cursor for walking the
//! configuration descriptor blob.

use core::mem::size_of;
use core::ptr;

use super::UsbError;

/// Plain descriptor layouts that can be read straight out of a byte buffer.
///
/// # Safety
///
/// Implementors must be `repr(C, packed)` structs made only of integers, so
/// every byte pattern of `size_of::<Self>()` bytes is a valid value.
pub unsafe trait Descriptor: Copy + Sized {
    /// Read the descriptor from the start of `bytes`.
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// USB Device Descriptor (18 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

/// USB Configuration Descriptor (9 bytes, followed by interface/endpoint descriptors)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

/// USB Interface Descriptor (9 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

/// USB Endpoint Descriptor (7 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    /// Get endpoint number (bits 3:0)
    pub fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    /// Check if this is an IN endpoint (bit 7 = 1)
    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & 0x80 != 0
    }

    /// Get transfer type (bits 1:0 of bmAttributes)
    pub fn transfer_type(&self) -> u8 {
        self.bm_attributes & 0x03
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type() == endpoint_type::BULK
    }

    pub fn is_interrupt(&self) -> bool {
        self.transfer_type() == endpoint_type::INTERRUPT
    }

    /// Packet size field without the high-bandwidth multiplier bits.
    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x07FF
    }
}

/// Hub class descriptor (7 fixed bytes, removable/power masks follow)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_nbr_ports: u8,
    pub w_hub_characteristics: u16,
    pub b_pwr_on_2_pwr_good: u8,
    pub b_hub_contr_current: u8,
}

/// HID class descriptor with its first (report) class descriptor entry
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HidDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_hid: u16,
    pub b_country_code: u8,
    pub b_num_descriptors: u8,
    pub b_report_descriptor_type: u8,
    pub w_report_descriptor_length: u16,
}

/// Hub GET_STATUS(port) answer
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PortStatus {
    pub w_port_status: u16,
    pub w_port_change: u16,
}

unsafe impl Descriptor for DeviceDescriptor {}
unsafe impl Descriptor for ConfigDescriptor {}
unsafe impl Descriptor for InterfaceDescriptor {}
unsafe impl Descriptor for EndpointDescriptor {}
unsafe impl Descriptor for HubDescriptor {}
unsafe impl Descriptor for HidDescriptor {}
unsafe impl Descriptor for PortStatus {}

// =============================================================================
// Setup Packet
// =============================================================================

/// USB Setup Packet (8 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

unsafe impl Descriptor for SetupPacket {}

impl SetupPacket {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        SetupPacket {
            bm_request_type: request_type,
            b_request: request,
            w_value: value,
            w_index: index,
            w_length: length,
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & request_type::DEVICE_TO_HOST != 0
    }

    /// Wire format, little endian.
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.w_value;
        let index = self.w_index;
        let length = self.w_length;
        let mut out = [0u8; 8];
        out[0] = self.bm_request_type;
        out[1] = self.b_request;
        out[2..4].copy_from_slice(&value.to_le_bytes());
        out[4..6].copy_from_slice(&index.to_le_bytes());
        out[6..8].copy_from_slice(&length.to_le_bytes());
        out
    }
}

// =============================================================================
// Descriptor Cursor
// =============================================================================

/// One descriptor inside a configuration blob.
#[derive(Clone, Copy, Debug)]
pub struct RawDescriptor<'a> {
    pub descriptor_type: u8,
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// Walks a descriptor blob by each entry's own `bLength`.
///
/// A zero/one length or an entry running past the end of the blob yields
/// `MalformedDescriptor` once and ends the walk.
pub struct DescriptorCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorCursor<'a> {
    pub fn new(data: &'a [u8], start: usize) -> Self {
        DescriptorCursor {
            data,
            offset: start,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Advance to the next descriptor of type `wanted`, skipping others.
    pub fn find(&mut self, wanted: u8) -> Result<RawDescriptor<'a>, UsbError> {
        for desc in self.by_ref() {
            let desc = desc?;
            if desc.descriptor_type == wanted {
                return Ok(desc);
            }
        }
        Err(UsbError::MalformedDescriptor)
    }
}

impl<'a> Iterator for DescriptorCursor<'a> {
    type Item = Result<RawDescriptor<'a>, UsbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.offset..];
        let length = rest[0] as usize;
        if rest.len() < 2 || length < 2 || length > rest.len() {
            self.offset = self.data.len();
            return Some(Err(UsbError::MalformedDescriptor));
        }

        let desc = RawDescriptor {
            descriptor_type: rest[1],
            offset: self.offset,
            bytes: &rest[..length],
        };
        self.offset += length;
        Some(Ok(desc))
    }
}

// =============================================================================
// Constants
// =============================================================================

/// bmRequestType bits
pub mod request_type {
    pub const RECIPIENT_DEVICE: u8 = 0;
    pub const RECIPIENT_INTERFACE: u8 = 1;
    pub const RECIPIENT_ENDPOINT: u8 = 2;
    pub const RECIPIENT_OTHER: u8 = 3;

    pub const STANDARD: u8 = 0 << 5;
    pub const CLASS: u8 = 1 << 5;
    pub const VENDOR: u8 = 2 << 5;

    pub const HOST_TO_DEVICE: u8 = 0 << 7;
    pub const DEVICE_TO_HOST: u8 = 1 << 7;
}

/// USB Descriptor Types
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const HID: u8 = 0x21;
    pub const HUB: u8 = 0x29;
}

/// Endpoint transfer types (bmAttributes bits 1:0)
pub mod endpoint_type {
    pub const CONTROL: u8 = 0;
    pub const ISOCHRONOUS: u8 = 1;
    pub const BULK: u8 = 2;
    pub const INTERRUPT: u8 = 3;
}

/// USB Class Codes
pub mod class_code {
    /// Class is defined per interface.
    pub const PER_INTERFACE: u8 = 0x00;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
}

/// USB HID Subclass Codes
pub mod hid_subclass {
    pub const BOOT: u8 = 0x01;
}

/// USB HID Protocol Codes
pub mod hid_protocol {
    pub const KEYBOARD: u8 = 0x01;
}

/// Mass storage subclass and protocol codes
pub mod storage_subclass {
    pub const SCSI: u8 = 0x06;
}

pub mod storage_protocol {
    pub const BULK_ONLY: u8 = 0x50;
}

/// USB Standard Requests
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// USB HID Class Requests
pub mod hid_request {
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

/// Hub port feature selectors
pub mod hub_feature {
    pub const PORT_RESET: u16 = 0x04;
    pub const C_PORT_CONNECTION: u16 = 0x10;
    pub const C_PORT_RESET: u16 = 0x14;
}

/// Hub wPortStatus bits
pub mod port_status {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const RESET: u16 = 1 << 4;
    pub const POWER: u16 = 1 << 8;
    pub const LOW_SPEED: u16 = 1 << 9;
    pub const HIGH_SPEED: u16 = 1 << 10;
}

/// Hub wPortChange bits
pub mod port_change {
    pub const CONNECTION: u16 = 1 << 0;
    pub const RESET: u16 = 1 << 4;
}

/// Language id used for string descriptor requests (US English).
pub const LANGUAGE_EN_US: u16 = 0x0409;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_sizes() {
        assert_eq!(size_of::<DeviceDescriptor>(), 18);
        assert_eq!(size_of::<ConfigDescriptor>(), 9);
        assert_eq!(size_of::<InterfaceDescriptor>(), 9);
        assert_eq!(size_of::<EndpointDescriptor>(), 7);
        assert_eq!(size_of::<HubDescriptor>(), 7);
        assert_eq!(size_of::<HidDescriptor>(), 9);
        assert_eq!(size_of::<SetupPacket>(), 8);
    }

    #[test]
    fn test_setup_packet_wire_format() {
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST,
            request::GET_DESCRIPTOR,
            (descriptor_type::CONFIGURATION as u16) << 8,
            0,
            0x0109,
        );
        assert!(setup.is_device_to_host());
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x01]);
    }

    #[test]
    fn test_endpoint_accessors() {
        let ep = EndpointDescriptor::parse(&[7, 5, 0x81, 0x03, 0x08, 0x00, 10]).unwrap();
        assert!(ep.is_in());
        assert!(ep.is_interrupt());
        assert_eq!(ep.endpoint_number(), 1);
        assert_eq!(ep.max_packet_size(), 8);
        assert!(EndpointDescriptor::parse(&[7, 5, 0x81]).is_none());
    }

    #[test]
    fn test_cursor_walks_by_length() {
        let blob = [9, 2, 0, 0, 0, 0, 0, 0, 0, 9, 4, 0, 0, 1, 8, 6, 0x50, 0, 7, 5, 0x81, 2, 64, 0, 0];
        let types: Vec<u8> = DescriptorCursor::new(&blob, 0)
            .map(|d| d.unwrap().descriptor_type)
            .collect();
        assert_eq!(types, vec![2, 4, 5]);
    }

    #[test]
    fn test_cursor_stops_on_overrun() {
        // Second descriptor claims 9 bytes but only 4 remain.
        let blob = [9, 2, 0, 0, 0, 0, 0, 0, 0, 9, 4, 0, 0];
        let mut cursor = DescriptorCursor::new(&blob, 0);
        assert!(cursor.next().unwrap().is_ok());
        assert_eq!(cursor.next().unwrap().unwrap_err(), UsbError::MalformedDescriptor);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_cursor_rejects_zero_length() {
        let blob = [0, 4, 0, 0];
        let mut cursor = DescriptorCursor::new(&blob, 0);
        assert!(cursor.next().unwrap().is_err());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_cursor_find_skips_other_types() {
        let blob = [9, 4, 0, 0, 1, 3, 1, 1, 0, 9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x3f, 0, 7, 5, 0x81, 3, 8, 0, 10];
        let mut cursor = DescriptorCursor::new(&blob, 0);
        let hid = cursor.find(descriptor_type::HID).unwrap();
        assert_eq!(hid.offset, 9);
        let hid = HidDescriptor::parse(hid.bytes).unwrap();
        assert_eq!(hid.b_country_code, 0);
        assert!(cursor.find(descriptor_type::HUB).is_err());
    }
}
