//! PCI Bus Enumeration and Device Discovery
//!
//! Configuration space is reached through a [`ConfigAccess`] implementation.
//! On x86 that is [`PortConfigAccess`], the two legacy I/O ports:
//! - CONFIG_ADDRESS (0xCF8): Write the address of the config register to read/write
//! - CONFIG_DATA (0xCFC): Read/write the configuration data
//!
//! The address format is:
//! ```text
//! Bit 31    : Enable bit (must be 1)
//! Bits 23-16: Bus number (0-255)
//! Bits 15-11: Device number (0-31)
//! Bits 10-8 : Function number (0-7)
//! Bits 7-2  : Register offset (32-bit aligned)
//! Bits 1-0  : Must be 0
//! ```

use alloc::vec::Vec;
use core::fmt;

/// PCI configuration address port
#[cfg(target_arch = "x86_64")]
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
#[cfg(target_arch = "x86_64")]
const CONFIG_DATA: u16 = 0xCFC;

/// Maximum number of PCI buses to scan
const MAX_BUS: u8 = 255;
/// Maximum number of devices per bus
const MAX_DEVICE: u8 = 32;
/// Maximum number of functions per device
const MAX_FUNCTION: u8 = 8;

/// Configuration register offsets
pub mod config {
    pub const VENDOR_DEVICE: u8 = 0x00;
    pub const COMMAND: u8 = 0x04;
    pub const CLASS: u8 = 0x08;
    pub const HEADER: u8 = 0x0C;
    pub const BAR0: u8 = 0x10;
    pub const INTERRUPT: u8 = 0x3C;
}

/// Command register bits
pub mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// PCI device class codes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceClass {
    Legacy = 0x00,
    MassStorage = 0x01,
    Network = 0x02,
    Display = 0x03,
    Multimedia = 0x04,
    Memory = 0x05,
    Bridge = 0x06,
    SimpleCommunication = 0x07,
    BaseSystemPeripheral = 0x08,
    InputDevice = 0x09,
    DockingStation = 0x0A,
    Processor = 0x0B,
    SerialBus = 0x0C,
    Wireless = 0x0D,
    Unknown = 0xFF,
}

impl DeviceClass {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DeviceClass::Legacy,
            0x01 => DeviceClass::MassStorage,
            0x02 => DeviceClass::Network,
            0x03 => DeviceClass::Display,
            0x04 => DeviceClass::Multimedia,
            0x05 => DeviceClass::Memory,
            0x06 => DeviceClass::Bridge,
            0x07 => DeviceClass::SimpleCommunication,
            0x08 => DeviceClass::BaseSystemPeripheral,
            0x09 => DeviceClass::InputDevice,
            0x0A => DeviceClass::DockingStation,
            0x0B => DeviceClass::Processor,
            0x0C => DeviceClass::SerialBus,
            0x0D => DeviceClass::Wireless,
            _ => DeviceClass::Unknown,
        }
    }
}

// =============================================================================
// Configuration Space Access
// =============================================================================

/// Dword access to configuration space. Narrower accesses are derived.
pub trait ConfigAccess: Send + Sync {
    fn read32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn write32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32);

    fn read16(&self, bus: u8, device: u8, function: u8, offset: u8) -> u16 {
        let dword = self.read32(bus, device, function, offset & 0xFC);
        let shift = ((offset & 2) * 8) as u32;
        ((dword >> shift) & 0xFFFF) as u16
    }

    fn read8(&self, bus: u8, device: u8, function: u8, offset: u8) -> u8 {
        let dword = self.read32(bus, device, function, offset & 0xFC);
        let shift = ((offset & 3) * 8) as u32;
        ((dword >> shift) & 0xFF) as u8
    }

    fn write16(&self, bus: u8, device: u8, function: u8, offset: u8, value: u16) {
        let dword_offset = offset & 0xFC;
        let dword = self.read32(bus, device, function, dword_offset);
        let shift = ((offset & 2) * 8) as u32;
        let mask = !(0xFFFF << shift);
        self.write32(
            bus,
            device,
            function,
            dword_offset,
            (dword & mask) | ((value as u32) << shift),
        );
    }
}

/// Configuration mechanism #1 through I/O ports 0xCF8/0xCFC.
#[cfg(target_arch = "x86_64")]
pub struct PortConfigAccess {
    lock: spin::Mutex<()>,
}

#[cfg(target_arch = "x86_64")]
impl PortConfigAccess {
    /// # Safety
    ///
    /// Nothing else may use the configuration ports while this exists.
    pub const unsafe fn new() -> Self {
        PortConfigAccess {
            lock: spin::Mutex::new(()),
        }
    }

    fn address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        0x8000_0000
            | ((bus as u32) << 16)
            | ((device as u32) << 11)
            | ((function as u32) << 8)
            | ((offset & 0xFC) as u32)
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigAccess for PortConfigAccess {
    fn read32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        use x86_64::instructions::port::Port;
        let _guard = self.lock.lock();
        unsafe {
            let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
            let mut data_port = Port::<u32>::new(CONFIG_DATA);
            addr_port.write(Self::address(bus, device, function, offset));
            data_port.read()
        }
    }

    fn write32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
        use x86_64::instructions::port::Port;
        let _guard = self.lock.lock();
        unsafe {
            let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
            let mut data_port = Port::<u32>::new(CONFIG_DATA);
            addr_port.write(Self::address(bus, device, function, offset));
            data_port.write(value);
        }
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Base Address Register (BAR) information
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bar {
    /// Physical address of the BAR
    pub address: u64,
    /// Size of the BAR region in bytes
    pub size: u64,
    /// Whether this is an I/O port BAR (vs memory-mapped)
    pub is_io: bool,
    /// Whether this is a 64-bit BAR (occupies two BAR slots)
    pub is_64bit: bool,
}

impl Bar {
    const fn empty() -> Self {
        Bar {
            address: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
        }
    }

    /// Check if this BAR is valid (has non-zero size)
    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Represents a PCI function
#[derive(Clone)]
pub struct Device {
    /// Bus number (0-255)
    pub bus: u8,
    /// Device/slot number (0-31)
    pub device: u8,
    /// Function number (0-7)
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    /// Raw base class code
    pub class_code: u8,
    pub subclass: u8,
    /// Programming interface
    pub prog_if: u8,
    pub interrupt_line: u8,
    /// Whether this is a multifunction device
    pub multifunction: bool,
    /// Base Address Registers (up to 6 for standard devices)
    pub bars: [Bar; 6],
}

impl Device {
    pub fn class(&self) -> DeviceClass {
        DeviceClass::from_u8(self.class_code)
    }

    /// Whether this function has the given class triple.
    pub fn matches(&self, class: u8, subclass: u8, prog_if: u8) -> bool {
        self.class_code == class && self.subclass == subclass && self.prog_if == prog_if
    }

    pub fn bar(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index).filter(|bar| bar.is_valid())
    }

    pub fn read8(&self, access: &dyn ConfigAccess, offset: u8) -> u8 {
        access.read8(self.bus, self.device, self.function, offset)
    }

    fn set_command_bits(&self, access: &dyn ConfigAccess, bits: u16) {
        let command = access.read16(self.bus, self.device, self.function, config::COMMAND);
        access.write16(self.bus, self.device, self.function, config::COMMAND, command | bits);
    }

    /// Enable bus mastering for DMA
    pub fn enable_bus_master(&self, access: &dyn ConfigAccess) {
        self.set_command_bits(access, command::BUS_MASTER);
    }

    /// Enable memory space access
    pub fn enable_memory_space(&self, access: &dyn ConfigAccess) {
        self.set_command_bits(access, command::MEMORY_SPACE);
    }

    /// Enable I/O space access
    pub fn enable_io_space(&self, access: &dyn ConfigAccess) {
        self.set_command_bits(access, command::IO_SPACE);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{} {:04x}:{:04x} {:?}/{:02x}/{:02x}",
            self.bus,
            self.device,
            self.function,
            self.vendor_id,
            self.device_id,
            self.class(),
            self.subclass,
            self.prog_if
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("location", &format_args!("{:02x}:{:02x}.{}", self.bus, self.device, self.function))
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("class", &self.class())
            .field("subclass", &format_args!("{:#04x}", self.subclass))
            .field("prog_if", &format_args!("{:#04x}", self.prog_if))
            .field("irq", &self.interrupt_line)
            .finish()
    }
}

/// Size a BAR by writing all ones and restoring it. Returns the BAR and
/// whether it used the next slot as its upper half.
fn decode_bar(access: &dyn ConfigAccess, bus: u8, device: u8, function: u8, bar_index: u8) -> (Bar, bool) {
    let offset = config::BAR0 + (bar_index * 4);
    let bar_low = access.read32(bus, device, function, offset);

    let probe = |offset: u8, original: u32| {
        access.write32(bus, device, function, offset, 0xFFFF_FFFF);
        let mask = access.read32(bus, device, function, offset);
        access.write32(bus, device, function, offset, original);
        mask
    };

    if bar_low & 0x01 != 0 {
        let size_mask = probe(offset, bar_low);
        let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
            0
        } else {
            // I/O BARs only decode 16 bits.
            ((!(size_mask & 0xFFFF_FFFC)).wrapping_add(1) & 0xFFFF) as u64
        };
        let bar = Bar {
            address: (bar_low & 0xFFFF_FFFC) as u64,
            size,
            is_io: true,
            is_64bit: false,
        };
        return (bar, false);
    }

    let is_64bit = (bar_low >> 1) & 0x03 == 0x02 && bar_index < 5;
    if is_64bit {
        let bar_high = access.read32(bus, device, function, offset + 4);
        let size_low = probe(offset, bar_low);
        let size_high = probe(offset + 4, bar_high);

        let address = ((bar_high as u64) << 32) | ((bar_low & 0xFFFF_FFF0) as u64);
        let size_mask = ((size_high as u64) << 32) | ((size_low & 0xFFFF_FFF0) as u64);
        let size = if size_mask == 0 {
            0
        } else {
            (!size_mask).wrapping_add(1)
        };
        let bar = Bar {
            address,
            size,
            is_io: false,
            is_64bit: true,
        };
        return (bar, true);
    }

    let size_mask = probe(offset, bar_low);
    let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
        0
    } else {
        (!(size_mask & 0xFFFF_FFF0)).wrapping_add(1) as u64
    };
    let bar = Bar {
        address: (bar_low & 0xFFFF_FFF0) as u64,
        size,
        is_io: false,
        is_64bit: false,
    };
    (bar, false)
}

/// Probe for a function at the given bus/device/function
fn probe_device(access: &dyn ConfigAccess, bus: u8, device: u8, function: u8) -> Option<Device> {
    let vendor_device = access.read32(bus, device, function, config::VENDOR_DEVICE);

    // 0xFFFF vendor indicates no device present
    if vendor_device as u16 == 0xFFFF {
        return None;
    }

    let class_reg = access.read32(bus, device, function, config::CLASS);
    let header_reg = access.read32(bus, device, function, config::HEADER);
    let header_type = (header_reg >> 16) as u8;
    let int_reg = access.read32(bus, device, function, config::INTERRUPT);

    // Bridges (header type 1) only have two BARs.
    let bar_count = if header_type & 0x7F == 0 { 6 } else { 2 };
    let mut bars = [Bar::empty(); 6];
    let mut bar_index = 0;
    while bar_index < bar_count {
        let (bar, skip_next) = decode_bar(access, bus, device, function, bar_index);
        bars[bar_index as usize] = bar;
        bar_index += if skip_next { 2 } else { 1 };
    }

    Some(Device {
        bus,
        device,
        function,
        vendor_id: vendor_device as u16,
        device_id: (vendor_device >> 16) as u16,
        revision_id: class_reg as u8,
        class_code: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
        interrupt_line: int_reg as u8,
        multifunction: (header_type & 0x80) != 0,
        bars,
    })
}

fn log_device(dev: &Device) {
    log::info!("PCI: {} IRQ={}", dev, dev.interrupt_line);
    for (i, bar) in dev.bars.iter().enumerate() {
        if bar.is_valid() {
            log::debug!(
                "PCI:   BAR{}: addr={:#x} size={:#x} {}",
                i,
                bar.address,
                bar.size,
                if bar.is_io { "I/O" } else { "MMIO" }
            );
        }
    }
}

/// Enumerate every PCI function on every bus.
pub fn enumerate(access: &dyn ConfigAccess) -> Vec<Device> {
    log::info!("PCI: Starting bus enumeration...");

    let mut devices = Vec::new();
    for bus in 0..=MAX_BUS {
        for device in 0..MAX_DEVICE {
            // Function 0 must exist for the others to.
            let Some(dev) = probe_device(access, bus, device, 0) else {
                continue;
            };
            let is_multifunction = dev.multifunction;
            log_device(&dev);
            devices.push(dev);

            if is_multifunction {
                for function in 1..MAX_FUNCTION {
                    if let Some(func_dev) = probe_device(access, bus, device, function) {
                        log_device(&func_dev);
                        devices.push(func_dev);
                    }
                }
            }
        }
    }

    log::info!("PCI: Enumeration complete. Found {} functions", devices.len());
    devices
}


#[cfg(test)]
mod tests {
    use super::testing::FakeConfig;
    use super::*;

    #[test]
    fn test_enumerate_follows_multifunction_bit() {
        let config = FakeConfig::new();
        config.add_function((0, 1, 0), (0x0C, 0x03, 0x00), 0x80);
        config.add_function((0, 1, 2), (0x0C, 0x03, 0x20), 0x00);
        config.add_function((0, 2, 0), (0x02, 0x00, 0x00), 0x00);
        // Not reachable: device 2 is single-function.
        config.add_function((0, 2, 1), (0x0C, 0x03, 0x30), 0x00);

        let devices = enumerate(&config);
        let found: Vec<(u8, u8)> = devices.iter().map(|d| (d.device, d.function)).collect();
        assert_eq!(found, vec![(1, 0), (1, 2), (2, 0)]);
        assert!(devices[1].matches(0x0C, 0x03, 0x20));
        assert!(!devices[1].matches(0x0C, 0x03, 0x30));
        assert_eq!(devices[0].class(), DeviceClass::SerialBus);
        assert_eq!(devices[2].class(), DeviceClass::Network);
        assert_eq!(devices[0].interrupt_line, 0x11);
    }

    #[test]
    fn test_bars_are_sized_and_restored() {
        let mut config = FakeConfig::new();
        let location = (0, 3, 0);
        config.add_function(location, (0x0C, 0x03, 0x30), 0x00);
        config.add_bar(location, 0, 0xFEBF_0004, 0xFFFF_C004);
        config.add_bar(location, 1, 0x0000_0001, 0xFFFF_FFFF);
        config.add_bar(location, 4, 0x0000_C041, 0xFFFF_FFE1);

        let devices = enumerate(&config);
        let dev = &devices[0];
        let bar0 = dev.bar(0).unwrap();
        assert!(bar0.is_64bit);
        assert_eq!(bar0.address, 0x1_FEBF_0000);
        assert_eq!(bar0.size, 0x4000);
        // Upper half of BAR0, never decoded on its own.
        assert!(dev.bar(1).is_none());

        let bar4 = dev.bar(4).unwrap();
        assert!(bar4.is_io);
        assert_eq!(bar4.address, 0xC040);
        assert_eq!(bar4.size, 0x20);

        assert_eq!(config.get(location, config::BAR0), 0xFEBF_0004);
        assert_eq!(config.get(location, config::BAR0 + 16), 0x0000_C041);
    }

    #[test]
    fn test_command_bits_are_set_without_clobbering() {
        let config = FakeConfig::new();
        let location = (0, 4, 0);
        config.add_function(location, (0x0C, 0x03, 0x10), 0x00);
        config.set(location, config::COMMAND, 0x0010_0400);
        let dev = enumerate(&config).remove(0);
        dev.enable_memory_space(&config);
        dev.enable_bus_master(&config);
        assert_eq!(config.get(location, config::COMMAND), 0x0010_0406);
        dev.enable_io_space(&config);
        assert_eq!(config.read16(0, 4, 0, config::COMMAND), 0x0407);
    }

    #[test]
    fn test_byte_reads_pick_the_right_lane() {
        let config = FakeConfig::new();
        config.add_function((0, 5, 0), (0x0C, 0x03, 0x20), 0x00);
        config.set((0, 5, 0), 0x60, 0x0000_0020);
        let dev = enumerate(&config).remove(0);
        assert_eq!(dev.read8(&config, 0x60), 0x20);
        assert_eq!(config.read8(0, 5, 0, config::CLASS + 3), 0x0C);
        assert_eq!(config.read8(0, 5, 0, config::CLASS + 1), 0x20);
    }
}
