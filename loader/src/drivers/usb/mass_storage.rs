//! USB Mass Storage, Bulk-Only Transport with SCSI commands.
//!
//! Every command is a three-phase exchange on the bulk pipes: a 31-byte
//! Command Block Wrapper goes out, data moves in the command's direction,
//! and a 13-byte Command Status Wrapper comes back. REQUEST SENSE follows
//! each command.

use super::controller::HostController;
use super::descriptors::{
    class_code, request_type, storage_protocol, storage_subclass, SetupPacket,
};
use super::device::{DeviceClass, DeviceId, StorageInfo};
use super::UsbError;
use crate::config::CswPolicy;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// CBW flags bit 7: data flows from the device.
pub const CBW_FLAG_DATA_IN: u8 = 1 << 7;

/// Bulk-Only class request: GET MAX LUN
pub const GET_MAX_LUN: u8 = 0xFE;

/// SCSI operation codes
pub mod opcode {
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY10: u8 = 0x25;
    pub const READ10: u8 = 0x28;
    pub const SERVICE_ACTION_IN16: u8 = 0x9E;
}

/// SERVICE ACTION IN(16) action selecting READ CAPACITY(16).
pub const READ_CAPACITY16_ACTION: u8 = 0x10;

pub const INQUIRY_LEN: usize = 36;
pub const SENSE_LEN: usize = 18;
pub const CAPACITY10_LEN: usize = 8;
pub const CAPACITY16_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cmd: [u8; 16],
}

impl CommandBlockWrapper {
    pub fn new(tag: u32, lun: u8, direction: Direction, cmd: &[u8], length: u32) -> Self {
        let mut block = [0u8; 16];
        let cb_length = cmd.len().min(block.len());
        block[..cb_length].copy_from_slice(&cmd[..cb_length]);

        CommandBlockWrapper {
            tag,
            data_transfer_length: length,
            flags: match direction {
                Direction::In => CBW_FLAG_DATA_IN,
                Direction::Out => 0,
            },
            lun,
            cb_length: cb_length as u8,
            cmd: block,
        }
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut out = [0u8; CBW_LEN];
        out[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = self.flags;
        out[13] = self.lun;
        out[14] = self.cb_length;
        out[15..31].copy_from_slice(&self.cmd);
        out
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < CBW_LEN || u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) != CBW_SIGNATURE {
            return None;
        }
        let mut cmd = [0u8; 16];
        cmd.copy_from_slice(&raw[15..31]);
        Some(CommandBlockWrapper {
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data_transfer_length: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: raw[12],
            lun: raw[13],
            cb_length: raw[14],
            cmd,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl CommandStatusWrapper {
    pub fn parse(raw: &[u8; CSW_LEN]) -> Self {
        CommandStatusWrapper {
            signature: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data_residue: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            status: raw[12],
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut out = [0u8; CSW_LEN];
        out[0..4].copy_from_slice(&self.signature.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        out[12] = self.status;
        out
    }

    /// Check this CSW against the command it answers.
    pub fn verify(&self, tag: u32, policy: CswPolicy) -> Result<(), UsbError> {
        match policy {
            CswPolicy::Trusting => {
                if self.signature != CSW_SIGNATURE || self.tag != tag || self.status != 0 {
                    log::debug!(
                        "[scsi] ignoring CSW sig {:#x} tag {} (sent {}) status {}",
                        self.signature,
                        self.tag,
                        tag,
                        self.status
                    );
                }
                Ok(())
            }
            CswPolicy::Strict => {
                if self.signature != CSW_SIGNATURE || self.tag != tag {
                    return Err(UsbError::CswMismatch);
                }
                if self.status != 0 {
                    return Err(UsbError::CommandFailed);
                }
                Ok(())
            }
        }
    }
}

/// Size reported by READ CAPACITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub sector_count: u64,
    pub sector_size: u32,
}

/// A Bulk-Only mass-storage device bound to its controller for one or more
/// commands.
pub struct BulkOnly<'a> {
    hc: &'a mut HostController,
    dev: DeviceId,
    tag: &'a mut u32,
    policy: CswPolicy,
}

impl<'a> BulkOnly<'a> {
    /// `tag` is the wrapper tag counter shared by all drives.
    pub fn new(hc: &'a mut HostController, dev: DeviceId, tag: &'a mut u32, policy: CswPolicy) -> Self {
        BulkOnly {
            hc,
            dev,
            tag,
            policy,
        }
    }

    fn info(&self) -> Result<StorageInfo, UsbError> {
        match self.hc.device(self.dev).class {
            DeviceClass::Storage(info) => Ok(info),
            _ => Err(UsbError::InvalidDevice),
        }
    }

    /// Make sure the device still looks like a SCSI Bulk-Only drive.
    pub fn validate(&self) -> Result<(), UsbError> {
        let info = self.info()?;
        let iface = self
            .hc
            .device(self.dev)
            .interfaces
            .iter()
            .find(|i| i.number() == info.interface)
            .ok_or(UsbError::InvalidDevice)?;

        if iface.descriptor.b_interface_class != class_code::MASS_STORAGE
            || iface.descriptor.b_interface_sub_class != storage_subclass::SCSI
            || iface.descriptor.b_interface_protocol != storage_protocol::BULK_ONLY
        {
            return Err(UsbError::InvalidDevice);
        }
        if !info.in_endpoint.is_in() || info.out_endpoint.is_in() {
            return Err(UsbError::InvalidDevice);
        }
        Ok(())
    }

    /// Run one command through the CBW / data / CSW phases.
    pub fn execute(&mut self, direction: Direction, cmd: &[u8], data: &mut [u8]) -> Result<(), UsbError> {
        let length = u32::try_from(data.len()).map_err(|_| UsbError::InvalidParameter)?;
        *self.tag = self.tag.wrapping_add(1);
        let tag = *self.tag;

        let mut cbw = CommandBlockWrapper::new(tag, 0, direction, cmd, length).to_bytes();
        self.hc.bulk_transfer(self.dev, true, &mut cbw)?;

        self.hc
            .bulk_transfer(self.dev, direction == Direction::Out, data)?;

        let mut raw = [0u8; CSW_LEN];
        self.hc.bulk_transfer(self.dev, false, &mut raw)?;
        CommandStatusWrapper::parse(&raw).verify(tag, self.policy)
    }

    pub fn request_sense(&mut self) -> Result<[u8; SENSE_LEN], UsbError> {
        let cmd = [opcode::REQUEST_SENSE, 0, 0, 0, SENSE_LEN as u8, 0];
        let mut sense = [0u8; SENSE_LEN];
        self.execute(Direction::In, &cmd, &mut sense)?;
        Ok(sense)
    }

    /// Command followed by REQUEST SENSE.
    fn command(&mut self, cmd: &[u8], data: &mut [u8]) -> Result<(), UsbError> {
        self.execute(Direction::In, cmd, data)?;
        self.request_sense()?;
        Ok(())
    }

    pub fn get_max_lun(&mut self) -> Result<u8, UsbError> {
        let info = self.info()?;
        let mut max_lun = [0u8; 1];
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST | request_type::CLASS | request_type::RECIPIENT_INTERFACE,
            GET_MAX_LUN,
            0,
            info.interface as u16,
            1,
        );
        self.hc.control_transfer(self.dev, setup, &mut max_lun)?;

        if let DeviceClass::Storage(storage) = &mut self.hc.device_mut(self.dev).class {
            storage.luns = max_lun[0];
        }
        Ok(max_lun[0])
    }

    pub fn inquiry(&mut self) -> Result<[u8; INQUIRY_LEN], UsbError> {
        let cmd = [opcode::INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0];
        let mut data = [0u8; INQUIRY_LEN];
        self.command(&cmd, &mut data)?;
        Ok(data)
    }

    /// READ CAPACITY(10), falling back to READ CAPACITY(16) when the last
    /// LBA does not fit in 32 bits.
    pub fn read_capacity(&mut self) -> Result<Capacity, UsbError> {
        let cmd = [opcode::READ_CAPACITY10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut data = [0u8; CAPACITY10_LEN];
        self.command(&cmd, &mut data)?;

        let last_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sector_size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if last_lba != u32::MAX {
            return Ok(Capacity {
                sector_count: last_lba as u64 + 1,
                sector_size,
            });
        }

        let mut cmd = [0u8; 16];
        cmd[0] = opcode::SERVICE_ACTION_IN16;
        cmd[1] = READ_CAPACITY16_ACTION;
        cmd[10..14].copy_from_slice(&(CAPACITY16_LEN as u32).to_be_bytes());
        let mut data = [0u8; CAPACITY16_LEN];
        self.command(&cmd, &mut data)?;

        let mut lba = [0u8; 8];
        lba.copy_from_slice(&data[0..8]);
        Ok(Capacity {
            sector_count: u64::from_be_bytes(lba) + 1,
            sector_size: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// READ(10) of `sectors` sectors starting at `lba` into `buf`.
    pub fn read10(&mut self, lba: u64, sectors: u64, buf: &mut [u8]) -> Result<(), UsbError> {
        let lba = u32::try_from(lba).map_err(|_| UsbError::InvalidParameter)?;
        let sectors = u16::try_from(sectors).map_err(|_| UsbError::InvalidParameter)?;

        let mut cmd = [0u8; 10];
        cmd[0] = opcode::READ10;
        cmd[2..6].copy_from_slice(&lba.to_be_bytes());
        cmd[7..9].copy_from_slice(&sectors.to_be_bytes());
        self.command(&cmd, buf)
    }

    /// Validate the drive and read its geometry.
    pub fn get_info(&mut self) -> Result<Capacity, UsbError> {
        self.validate()?;
        match self.get_max_lun() {
            Ok(luns) => log::debug!("[scsi] max LUN {}", luns),
            // Single-LUN devices may stall this request.
            Err(e) => log::debug!("[scsi] GET MAX LUN failed: {}", e),
        }
        self.inquiry()?;
        let capacity = self.read_capacity()?;
        log::info!(
            "[scsi] address {:#x}: {} sectors of {} bytes",
            self.hc.device(self.dev).address,
            capacity.sector_count,
            capacity.sector_size
        );
        Ok(capacity)
    }
}
