//! Storage layer: registry of block devices the loader can read from.

use alloc::vec::Vec;

use crate::drivers::usb::UsbSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    UsbScsi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageDevice {
    pub kind: StorageKind,
    pub sector_size: u32,
    pub sector_count: u64,
    pub source: UsbSource,
}

impl StorageDevice {
    pub fn size_bytes(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }
}

#[derive(Default)]
pub struct StorageRegistry {
    devices: Vec<StorageDevice>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        StorageRegistry {
            devices: Vec::new(),
        }
    }

    /// Add a device and return its index.
    pub fn register(&mut self, device: StorageDevice) -> usize {
        log::info!(
            "[scsi] storage device {}: {:?}, {} MiB",
            self.devices.len(),
            device.kind,
            device.size_bytes() >> 20
        );
        self.devices.push(device);
        self.devices.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&StorageDevice> {
        self.devices.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageDevice> {
        self.devices.iter()
    }
}
