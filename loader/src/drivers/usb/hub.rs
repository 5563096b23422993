//! Hub handling: root-hub registration, downstream port polling and the
//! breadth-first traversal queue.
//!
//! Hub chains are limited to 5 hubs, so a [`PortChain`] never holds more
//! than 5 port numbers.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use super::controller::{ControllerKind, HostController, Speed};
use super::descriptors::{
    descriptor_type, hub_feature, port_change, port_status, request, request_type, Descriptor,
    HubDescriptor, PortStatus, SetupPacket,
};
use super::device::{DeviceClass, DeviceId};
use super::UsbError;
use crate::config::UsbConfig;

pub const MAX_HUB_CHAIN: usize = 5;

/// Capacity of the traversal queue; one slot is never used.
pub const HUB_QUEUE_CAPACITY: usize = 127;

/// Index of a hub in its controller's hub table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubId(pub usize);

/// Ports leading from the root hub to a hub, outermost first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortChain {
    ports: [u8; MAX_HUB_CHAIN],
    len: usize,
}

impl PortChain {
    pub fn as_slice(&self) -> &[u8] {
        &self.ports[..self.len]
    }

    /// This chain plus `port`; a full chain is returned unchanged.
    pub fn extended(mut self, port: u8) -> PortChain {
        if self.len < MAX_HUB_CHAIN {
            self.ports[self.len] = port;
            self.len += 1;
        }
        self
    }
}

impl fmt::Display for PortChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for port in self.as_slice() {
            write!(f, "{:#x}.", port)?;
        }
        Ok(())
    }
}

pub struct Hub {
    /// Device on each port, indexed by port - 1.
    pub ports: Vec<Option<DeviceId>>,
    /// The hub device itself; `None` for the root hub.
    pub device: Option<DeviceId>,
    pub port_chain: PortChain,
}

impl Hub {
    fn new(ports: u8, device: Option<DeviceId>, port_chain: PortChain) -> Self {
        Hub {
            ports: vec![None; ports as usize],
            device,
            port_chain,
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }
}

/// Fixed-capacity FIFO of hubs awaiting a visit.
///
/// Pushes past capacity are dropped and slots are not reused, so a single
/// traversal visits at most 126 hubs.
pub struct HubQueue {
    hubs: [Option<HubId>; HUB_QUEUE_CAPACITY],
    head: usize,
    tail: usize,
}

impl HubQueue {
    pub fn new() -> Self {
        HubQueue {
            hubs: [None; HUB_QUEUE_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn push(&mut self, hub: HubId) {
        if self.tail < HUB_QUEUE_CAPACITY - 1 {
            self.hubs[self.tail] = Some(hub);
            self.tail += 1;
        }
    }

    pub fn pop(&mut self) -> Option<HubId> {
        if self.head < self.tail {
            self.head += 1;
            return self.hubs[self.head - 1];
        }
        None
    }
}

impl Default for HubQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HostController {
    // =========================================================================
    // Hub Class Requests
    // =========================================================================

    pub fn hub_descriptor(&mut self, dev: DeviceId) -> Result<HubDescriptor, UsbError> {
        let mut raw = [0u8; 7];
        let setup = SetupPacket::new(
            request_type::RECIPIENT_DEVICE | request_type::CLASS | request_type::DEVICE_TO_HOST,
            request::GET_DESCRIPTOR,
            (descriptor_type::HUB as u16) << 8,
            0,
            raw.len() as u16,
        );
        self.control_transfer(dev, setup, &mut raw)?;
        HubDescriptor::parse(&raw).ok_or(UsbError::MalformedDescriptor)
    }

    pub fn hub_port_status(&mut self, dev: DeviceId, port: u8) -> Result<PortStatus, UsbError> {
        let mut raw = [0u8; 4];
        let setup = SetupPacket::new(
            request_type::RECIPIENT_OTHER | request_type::CLASS | request_type::DEVICE_TO_HOST,
            request::GET_STATUS,
            0,
            port as u16,
            raw.len() as u16,
        );
        self.control_transfer(dev, setup, &mut raw)?;
        PortStatus::parse(&raw).ok_or(UsbError::MalformedDescriptor)
    }

    pub fn hub_set_port_feature(
        &mut self,
        dev: DeviceId,
        port: u8,
        feature: u16,
    ) -> Result<(), UsbError> {
        self.control_request(
            dev,
            request_type::RECIPIENT_OTHER | request_type::CLASS | request_type::HOST_TO_DEVICE,
            request::SET_FEATURE,
            feature,
            port as u16,
        )
    }

    pub fn hub_clear_port_feature(
        &mut self,
        dev: DeviceId,
        port: u8,
        feature: u16,
    ) -> Result<(), UsbError> {
        self.control_request(
            dev,
            request_type::RECIPIENT_OTHER | request_type::CLASS | request_type::HOST_TO_DEVICE,
            request::CLEAR_FEATURE,
            feature,
            port as u16,
        )
    }

    /// Drive PORT_RESET and wait for the reset-change bit.
    fn hub_reset_port(&mut self, config: &UsbConfig, dev: DeviceId, port: u8) -> Result<(), UsbError> {
        self.hub_set_port_feature(dev, port, hub_feature::PORT_RESET)?;

        for _ in 0..config.hub_reset_checks {
            let status = self.hub_port_status(dev, port)?;
            let change = status.w_port_change;
            if change & port_change::RESET != 0 {
                return self.hub_clear_port_feature(dev, port, hub_feature::C_PORT_RESET);
            }
            self.platform.sleep_ms(config.hub_reset_poll_ms);
        }
        Err(UsbError::Timeout)
    }

    fn hub_port_speed(&mut self, dev: DeviceId, port: u8) -> Result<Speed, UsbError> {
        let status = self.hub_port_status(dev, port)?;
        let bits = status.w_port_status;
        Ok(if bits & port_status::LOW_SPEED != 0 {
            Speed::Low
        } else if bits & port_status::HIGH_SPEED != 0 {
            Speed::High
        } else {
            Speed::Full
        })
    }

    // =========================================================================
    // Topology
    // =========================================================================

    fn link_device(&mut self, hub: HubId, dev: DeviceId, port: u8) {
        let device = &mut self.devices[dev.0];
        device.port = port;
        device.parent = Some(hub);
        self.hubs[hub.0].ports[port as usize - 1] = Some(dev);
    }

    /// Turn a hub-class device into a [`Hub`] node.
    pub(crate) fn check_hub(&mut self, _config: &UsbConfig, dev: DeviceId) -> Result<(), UsbError> {
        let descriptor = self.hub_descriptor(dev)?;

        let device = &self.devices[dev.0];
        let parent_chain = device
            .parent
            .map(|hub| self.hubs[hub.0].port_chain)
            .unwrap_or_default();
        let port_chain = parent_chain.extended(device.port);

        let id = HubId(self.hubs.len());
        self.hubs
            .push(Hub::new(descriptor.b_nbr_ports, Some(dev), port_chain));
        self.devices[dev.0].class = DeviceClass::Hub(id);

        log::info!(
            "[hub] address {:#x}: {} ports at {}",
            self.devices[dev.0].address,
            descriptor.b_nbr_ports,
            port_chain
        );
        Ok(())
    }

    /// Enumerate every device attached to the controller's root ports.
    pub(crate) fn root_register(&mut self, config: &UsbConfig) {
        let ports = self.driver.root_ports();
        let root = HubId(self.hubs.len());
        self.hubs.push(Hub::new(ports, None, PortChain::default()));
        self.root_hub = Some(root);

        let xhci = self.kind() == ControllerKind::Xhci;
        for port in 0..ports {
            if !self.driver.port_connected(port) {
                continue;
            }

            let speed = if xhci {
                self.devices_count += 1;
                match self.driver.port_init(port, self.devices_count) {
                    Ok(speed) => Some(speed),
                    Err(e) => {
                        log::warn!("[usb] bus {}: port {} init failed: {}", self.bus, port, e);
                        None
                    }
                }
            } else {
                // Ports this controller cannot drive are left alone.
                let Some(speed) = self.driver.port_speed(port) else {
                    continue;
                };
                // Reset leaves the device answering at address 0.
                match self.driver.port_reset(port) {
                    Ok(()) => Some(speed),
                    Err(e) => {
                        log::warn!("[usb] bus {}: port {} reset failed: {}", self.bus, port, e);
                        None
                    }
                }
            };

            let Some(speed) = speed else {
                continue;
            };

            log::debug!("[usb] bus {}: {}-speed device on root port {}", self.bus, speed, port);
            if let Some(dev) = self.device_register(config, speed, root, port + 1) {
                self.link_device(root, dev, port + 1);
                self.register_specific_info(config, dev);
            }
        }
    }

    /// Breadth-first scan of `start` and every hub found below it for newly
    /// connected devices.
    pub(crate) fn hub_poll(&mut self, config: &UsbConfig, start: HubId) {
        let mut queue = HubQueue::new();
        queue.push(start);

        while let Some(hub) = queue.pop() {
            let Some(hub_dev) = self.hubs[hub.0].device else {
                continue;
            };

            for port in 1..=self.hubs[hub.0].port_count() {
                let status = match self.hub_port_status(hub_dev, port) {
                    Ok(status) => status,
                    Err(e) => {
                        log::warn!("[hub] port {} status failed: {}", port, e);
                        continue;
                    }
                };
                let change = status.w_port_change;
                let bits = status.w_port_status;

                if change & port_change::CONNECTION == 0 {
                    continue;
                }
                if let Err(e) =
                    self.hub_clear_port_feature(hub_dev, port, hub_feature::C_PORT_CONNECTION)
                {
                    log::warn!("[hub] port {} clear connection change failed: {}", port, e);
                }
                if bits & port_status::CONNECTION == 0 {
                    continue;
                }

                if self.kind() == ControllerKind::Xhci {
                    log::warn!(
                        "[hub] port {}: devices behind xHCI hubs need a route string, skipped",
                        port
                    );
                    continue;
                }

                if let Err(e) = self.hub_reset_port(config, hub_dev, port) {
                    log::warn!("[hub] port {} reset failed: {}", port, e);
                }

                let speed = match self.hub_port_speed(hub_dev, port) {
                    Ok(speed) => speed,
                    Err(e) => {
                        log::warn!("[hub] port {} speed unknown: {}", port, e);
                        continue;
                    }
                };

                if let Some(dev) = self.device_register(config, speed, hub, port) {
                    self.link_device(hub, dev, port);
                    self.register_specific_info(config, dev);
                    if let DeviceClass::Hub(child) = self.devices[dev.0].class {
                        queue.push(child);
                    }
                }
            }
        }
    }

    /// Poll every hub attached directly to a root port.
    pub(crate) fn poll(&mut self, config: &UsbConfig) {
        let Some(root) = self.root_hub else {
            return;
        };

        for port in 0..self.hubs[root.0].ports.len() {
            let Some(dev) = self.hubs[root.0].ports[port] else {
                continue;
            };
            if let DeviceClass::Hub(hub) = self.devices[dev.0].class {
                self.hub_poll(config, hub);
            }
        }
    }

    /// All linked devices in breadth-first order from the root hub.
    pub fn device_listing(&self) -> Vec<DeviceId> {
        let mut listing = Vec::new();
        let Some(root) = self.root_hub else {
            return listing;
        };

        let mut queue = HubQueue::new();
        queue.push(root);
        while let Some(hub) = queue.pop() {
            for dev in self.hubs[hub.0].ports.iter().flatten() {
                listing.push(*dev);
                if let DeviceClass::Hub(child) = self.devices[dev.0].class {
                    queue.push(child);
                }
            }
        }
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::testing::{MockBus, SimDevice};

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = HubQueue::new();
        assert!(queue.is_empty());
        queue.push(HubId(3));
        queue.push(HubId(1));
        assert_eq!(queue.pop(), Some(HubId(3)));
        assert_eq!(queue.pop(), Some(HubId(1)));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_drops_past_capacity() {
        let mut queue = HubQueue::new();
        for i in 0..200 {
            queue.push(HubId(i));
        }
        let mut popped = 0;
        while queue.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, HUB_QUEUE_CAPACITY - 1);
        // Slots are not recycled once drained.
        queue.push(HubId(0));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_port_chain_is_bounded() {
        let mut chain = PortChain::default();
        for port in 1..=7 {
            chain = chain.extended(port);
        }
        assert_eq!(chain.as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(alloc::format!("{}", PortChain::default().extended(2).extended(3)), "0x2.0x3.");
    }

    #[test]
    fn test_root_register_skips_empty_ports() {
        let (mut hc, _bus) = MockBus::controller(
            ControllerKind::Ehci,
            vec![None, Some(SimDevice::storage()), None],
        );
        hc.root_register(&UsbConfig::default());

        let root = hc.root_hub().unwrap();
        assert_eq!(hc.hub(root).ports.len(), 3);
        assert!(hc.hub(root).ports[0].is_none());
        let dev = hc.hub(root).ports[1].unwrap();
        assert_eq!(hc.device(dev).port, 2);
        assert_eq!(hc.device(dev).address, 1);
        assert_eq!(hc.devices_count(), 1);
        assert!(matches!(hc.device(dev).class, DeviceClass::Storage(_)));
    }

    #[test]
    fn test_root_register_assigns_sequential_addresses() {
        let (mut hc, bus) = MockBus::controller(
            ControllerKind::Uhci,
            vec![Some(SimDevice::keyboard()), Some(SimDevice::storage())],
        );
        hc.root_register(&UsbConfig::default());

        let addresses: Vec<u8> = hc.device_ids().map(|d| hc.device(d).address).collect();
        assert_eq!(addresses, vec![1, 2]);
        assert_eq!(bus.assigned_addresses(), vec![1, 2]);
        // Every device is configured with configuration 1.
        assert_eq!(bus.configured_addresses(), vec![1, 2]);
    }

    #[test]
    fn test_root_register_xhci_uses_port_init() {
        let (mut hc, bus) = MockBus::controller(
            ControllerKind::Xhci,
            vec![Some(SimDevice::storage()), Some(SimDevice::keyboard())],
        );
        hc.root_register(&UsbConfig::default());

        let addresses: Vec<u8> = hc.device_ids().map(|d| hc.device(d).address).collect();
        assert_eq!(addresses, vec![1, 2]);
        // No SET_ADDRESS requests on xHCI.
        assert!(bus.assigned_addresses().is_empty());
    }

    #[test]
    fn test_hub_poll_enumerates_downstream_devices() {
        let mut hub = SimDevice::hub(4);
        hub.attach(2, SimDevice::keyboard());
        hub.attach(4, SimDevice::storage());
        let (mut hc, bus) = MockBus::controller(ControllerKind::Ehci, vec![Some(hub)]);
        let config = UsbConfig::default();
        hc.root_register(&config);

        let root = hc.root_hub().unwrap();
        let hub_dev = hc.hub(root).ports[0].unwrap();
        let hub_id = match hc.device(hub_dev).class {
            DeviceClass::Hub(id) => id,
            other => panic!("expected hub, got {:?}", other),
        };
        assert_eq!(hc.hub(hub_id).port_chain.as_slice(), &[1]);
        assert!(hc.hub(hub_id).ports.iter().all(Option::is_none));

        hc.poll(&config);

        let kbd = hc.hub(hub_id).ports[1].unwrap();
        let disk = hc.hub(hub_id).ports[3].unwrap();
        assert_eq!(hc.device(kbd).port, 2);
        assert_eq!(hc.device(kbd).parent, Some(hub_id));
        assert!(matches!(hc.device(kbd).class, DeviceClass::Keyboard(_)));
        assert!(matches!(hc.device(disk).class, DeviceClass::Storage(_)));
        assert_eq!(alloc::format!("{}", hc.device_port_chain(disk)), "0x1.0x4.");
        assert!(bus.port_change_bits_clear());
    }

    #[test]
    fn test_nested_hubs_are_traversed() {
        let mut inner = SimDevice::hub(2);
        inner.attach(1, SimDevice::storage());
        let mut outer = SimDevice::hub(2);
        outer.attach(2, inner);
        let (mut hc, _bus) = MockBus::controller(ControllerKind::Uhci, vec![Some(outer)]);
        let config = UsbConfig::default();
        hc.root_register(&config);
        hc.poll(&config);

        let listing = hc.device_listing();
        assert_eq!(listing.len(), 3);
        let disk = listing[2];
        assert!(matches!(hc.device(disk).class, DeviceClass::Storage(_)));
        assert_eq!(hc.device_port_chain(disk).as_slice(), &[1, 2, 1]);
    }

    #[test]
    fn test_hub_reset_timeout_still_registers() {
        let mut hub = SimDevice::hub(1);
        let mut disk = SimDevice::storage();
        disk.ignore_reset = true;
        hub.attach(1, disk);
        let (mut hc, bus) = MockBus::controller(ControllerKind::Ohci, vec![Some(hub)]);
        let config = UsbConfig::default();
        hc.root_register(&config);
        hc.poll(&config);

        assert_eq!(hc.device_listing().len(), 2);
        assert_eq!(bus.slept_ms(), config.hub_reset_checks * config.hub_reset_poll_ms
            + 2 * config.set_address_settle_ms);
    }

    #[test]
    fn test_xhci_downstream_devices_are_skipped() {
        let mut hub = SimDevice::hub(2);
        hub.attach(1, SimDevice::storage());
        let (mut hc, _bus) = MockBus::controller(ControllerKind::Xhci, vec![Some(hub)]);
        let config = UsbConfig::default();
        hc.root_register(&config);
        hc.poll(&config);
        assert_eq!(hc.device_listing().len(), 1);
    }
}
