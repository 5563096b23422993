//! USB HID Class Driver (Boot Protocol Keyboard)
//!
//! The keyboard is switched to the boot protocol, so every report has the
//! fixed 8-byte layout:
//! - Byte 0: Modifier flags (LCtrl, LShift, LAlt, LGui, RCtrl, RShift, RAlt, RGui)
//! - Byte 1: Reserved
//! - Bytes 2-7: Up to 6 simultaneous key usage IDs (0 = no key)
//!
//! Only the first usage ID is translated, through the US layout in
//! [`crate::keyboard`].

use super::controller::HostController;
use super::descriptors::{class_code, hid_protocol, hid_request, hid_subclass, request_type};
use super::device::{DeviceClass, DeviceId, KeyboardInfo};
use super::{TransferStatus, UsbError};
use crate::keyboard;

pub const BOOT_REPORT_LEN: usize = 8;

/// Modifier byte bits
pub mod modifier {
    pub const LEFT_SHIFT: u8 = 1 << 1;
    pub const RIGHT_SHIFT: u8 = 1 << 5;
}

fn keyboard_info(hc: &HostController, dev: DeviceId) -> Result<KeyboardInfo, UsbError> {
    match hc.device(dev).class {
        DeviceClass::Keyboard(info) => Ok(info),
        _ => Err(UsbError::InvalidDevice),
    }
}

fn class_request(hc: &mut HostController, dev: DeviceId, request: u8, interface: u8) -> Result<(), UsbError> {
    hc.control_request(
        dev,
        request_type::RECIPIENT_INTERFACE | request_type::CLASS | request_type::HOST_TO_DEVICE,
        request,
        0,
        interface as u16,
    )
}

/// Check the keyboard interface and put it into boot protocol mode.
pub fn initialize(hc: &mut HostController, dev: DeviceId) -> Result<(), UsbError> {
    let info = keyboard_info(hc, dev)?;

    let device = hc.device(dev);
    let iface = device
        .interfaces
        .iter()
        .find(|i| i.number() == info.interface)
        .ok_or(UsbError::InvalidDevice)?;
    if iface.descriptor.b_interface_class != class_code::HID
        || iface.descriptor.b_interface_sub_class != hid_subclass::BOOT
        || iface.descriptor.b_interface_protocol != hid_protocol::KEYBOARD
    {
        return Err(UsbError::InvalidDevice);
    }
    if info.hid.b_country_code != 0 {
        return Err(UsbError::InvalidDevice);
    }
    if !info.endpoint.is_in() || !info.endpoint.descriptor.is_interrupt() {
        return Err(UsbError::InvalidDevice);
    }

    class_request(hc, dev, hid_request::SET_PROTOCOL, info.interface)?;
    class_request(hc, dev, hid_request::SET_IDLE, info.interface)?;

    log::info!("[hid] keyboard at address {:#x} ready", hc.device(dev).address);
    Ok(())
}

/// Translate a boot report into a character.
pub fn report_to_char(report: &[u8; BOOT_REPORT_LEN]) -> Option<u8> {
    let key = report[2];
    if key == 0 {
        return None;
    }

    if report[0] & (modifier::LEFT_SHIFT | modifier::RIGHT_SHIFT) != 0 {
        keyboard::lookup_shift(key)
    } else {
        keyboard::lookup(key)
    }
}

/// Wait for the next report on the keyboard's interrupt endpoint.
///
/// Blocks until the transfer completes, sleeping for the endpoint's polling
/// interval between checks. `None` means no key or an unmapped key.
pub fn getchar(hc: &mut HostController, dev: DeviceId) -> Result<Option<u8>, UsbError> {
    let info = keyboard_info(hc, dev)?;
    let interval = info.endpoint.interval() as u32;

    let mut handle = hc.interrupt_transfer(dev, BOOT_REPORT_LEN)?;
    let mut report = [0u8; BOOT_REPORT_LEN];

    loop {
        match hc.check_transfer_status(&mut handle, &mut report) {
            TransferStatus::NotFinished => {
                hc.platform().sleep_ms(interval);
            }
            TransferStatus::Success => break,
            TransferStatus::Failed(e) => return Err(e),
        }
    }

    log::trace!("[hid] report {:02x?}", report);
    Ok(report_to_char(&report))
}
