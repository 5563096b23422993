//! Test doubles for the USB stack: a host-memory [`Platform`], a byte-array
//! [`RegisterBlock`] and [`MockBus`], a scripted controller driver serving
//! simulated devices.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::controller::{
    ControllerKind, DeviceTarget, Endpoint, HostController, HostControllerDriver, Speed,
    TransferHandle,
};
use super::descriptors::{
    descriptor_type, hid_request, hub_feature, port_change, port_status, request, request_type,
    EndpointDescriptor, SetupPacket,
};
use super::mass_storage::{
    opcode, CommandBlockWrapper, CommandStatusWrapper, CBW_FLAG_DATA_IN, CSW_SIGNATURE,
    GET_MAX_LUN,
};
use super::{TransferStatus, UsbError};
use crate::hal::{DmaBuffer, Platform, RegisterBlock};

// =============================================================================
// TestPlatform
// =============================================================================

struct Allocation {
    phys: u64,
    virt: usize,
    layout: Layout,
}

struct Arena {
    allocations: Vec<Allocation>,
    next_phys: u64,
}

type SleepHook = Box<dyn FnMut(&TestPlatform) + Send>;

/// Host-memory DMA allocator with 32-bit fake bus addresses.
///
/// `sleep_ms` only counts; an optional hook runs on every sleep and can
/// play the controller by editing descriptors through [`TestPlatform::read32`]
/// and friends.
pub struct TestPlatform {
    arena: Mutex<Arena>,
    slept: AtomicU32,
    hook: Mutex<Option<SleepHook>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        TestPlatform {
            arena: Mutex::new(Arena {
                allocations: Vec::new(),
                next_phys: 0x0010_0000,
            }),
            slept: AtomicU32::new(0),
            hook: Mutex::new(None),
        }
    }

    pub fn slept_ms(&self) -> u32 {
        self.slept.load(Ordering::SeqCst)
    }

    pub fn live_allocations(&self) -> usize {
        self.arena.lock().allocations.len()
    }

    pub fn set_hook<F: FnMut(&TestPlatform) + Send + 'static>(&self, hook: F) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    fn translate(&self, phys: u64, len: usize) -> *mut u8 {
        let arena = self.arena.lock();
        for a in &arena.allocations {
            if phys >= a.phys && phys + len as u64 <= a.phys + a.layout.size() as u64 {
                return (a.virt + (phys - a.phys) as usize) as *mut u8;
            }
        }
        panic!("bus address {:#x} is not DMA memory", phys);
    }

    pub fn read32(&self, phys: u64) -> u32 {
        let mut raw = [0u8; 4];
        self.read_bytes(phys, &mut raw);
        u32::from_le_bytes(raw)
    }

    pub fn write32(&self, phys: u64, value: u32) {
        self.write_bytes(phys, &value.to_le_bytes());
    }

    pub fn read64(&self, phys: u64) -> u64 {
        self.read32(phys) as u64 | (self.read32(phys + 4) as u64) << 32
    }

    pub fn read_bytes(&self, phys: u64, dst: &mut [u8]) {
        let src = self.translate(phys, dst.len());
        unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
    }

    pub fn write_bytes(&self, phys: u64, src: &[u8]) {
        let dst = self.translate(phys, src.len());
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for TestPlatform {
    fn alloc_dma(&self, size: usize, align: usize) -> Option<DmaBuffer> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        let mut arena = self.arena.lock();
        let align = align as u64;
        let phys = (arena.next_phys + align - 1) & !(align - 1);
        arena.next_phys = phys + layout.size() as u64;
        assert!(arena.next_phys < u32::MAX as u64, "fake bus addresses exhausted");
        arena.allocations.push(Allocation {
            phys,
            virt: virt.as_ptr() as usize,
            layout,
        });

        Some(unsafe { DmaBuffer::new(virt, phys, size) }.with_align(layout.align()))
    }

    fn free_dma(&self, buffer: DmaBuffer) {
        let mut arena = self.arena.lock();
        let index = arena
            .allocations
            .iter()
            .position(|a| a.phys == buffer.phys())
            .expect("free of unknown DMA buffer");
        let a = arena.allocations.swap_remove(index);
        assert_eq!(buffer.align(), a.layout.align(), "DMA buffer freed with the wrong alignment");
        unsafe { dealloc(a.virt as *mut u8, a.layout) }
    }

    fn sleep_ms(&self, ms: u32) -> u32 {
        self.slept.fetch_add(ms, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(self);
        }
        ms
    }
}

// =============================================================================
// FakeRegisters
// =============================================================================

type WriteHook = Box<dyn FnMut(&mut RegisterFile, usize, u32) + Send>;

pub struct RegisterFile {
    bytes: Vec<u8>,
    /// Every driver write, in order: (offset, value).
    pub writes: Vec<(usize, u32)>,
}

impl RegisterFile {
    pub fn get(&self, offset: usize, width: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw[..width].copy_from_slice(&self.bytes[offset..offset + width]);
        u32::from_le_bytes(raw)
    }

    pub fn set(&mut self, offset: usize, width: usize, value: u32) {
        self.bytes[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
    }

    pub fn get32(&self, offset: usize) -> u32 {
        self.get(offset, 4)
    }

    pub fn set32(&mut self, offset: usize, value: u32) {
        self.set(offset, 4, value)
    }
}

struct RegisterState {
    file: RegisterFile,
    hook: Option<WriteHook>,
}

/// A register window backed by plain bytes.
///
/// Clones share the same registers. A write hook sees every driver write
/// after it lands and can emulate self-clearing or write-1-to-clear bits.
#[derive(Clone)]
pub struct FakeRegisters {
    state: Arc<Mutex<RegisterState>>,
}

impl FakeRegisters {
    pub fn new(size: usize) -> Self {
        FakeRegisters {
            state: Arc::new(Mutex::new(RegisterState {
                file: RegisterFile {
                    bytes: vec![0; size],
                    writes: Vec::new(),
                },
                hook: None,
            })),
        }
    }

    pub fn on_write<F: FnMut(&mut RegisterFile, usize, u32) + Send + 'static>(&self, hook: F) {
        self.state.lock().hook = Some(Box::new(hook));
    }

    pub fn get32(&self, offset: usize) -> u32 {
        self.state.lock().file.get(offset, 4)
    }

    pub fn get16(&self, offset: usize) -> u16 {
        self.state.lock().file.get(offset, 2) as u16
    }

    pub fn set32(&self, offset: usize, value: u32) {
        self.state.lock().file.set(offset, 4, value)
    }

    pub fn set16(&self, offset: usize, value: u16) {
        self.state.lock().file.set(offset, 2, value as u32)
    }

    pub fn set8(&self, offset: usize, value: u8) {
        self.state.lock().file.set(offset, 1, value as u32)
    }

    /// Run `f` with the register file locked (hardware side).
    pub fn with<R>(&self, f: impl FnOnce(&mut RegisterFile) -> R) -> R {
        f(&mut self.state.lock().file)
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().file.writes.clone()
    }

    fn write(&self, offset: usize, width: usize, value: u32) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.file.set(offset, width, value);
        state.file.writes.push((offset, value));
        if let Some(hook) = state.hook.as_mut() {
            hook(&mut state.file, offset, value);
        }
    }
}

impl RegisterBlock for FakeRegisters {
    fn read8(&self, offset: usize) -> u8 {
        self.state.lock().file.get(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.state.lock().file.get(offset, 2) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.state.lock().file.get(offset, 4)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, 1, value as u32)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, 2, value as u32)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, 4, value)
    }
}

// =============================================================================
// Simulated Devices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    Storage,
    Keyboard,
    Hub,
}

/// A scripted USB device.
#[derive(Clone)]
pub struct SimDevice {
    pub kind: SimKind,
    pub speed: Speed,
    pub vendor: u16,
    pub product: u16,
    pub max_packet_size0: u8,
    pub hid_country_code: u8,
    /// Never report reset completion on a hub port.
    pub ignore_reset: bool,
    pub max_lun: u8,
    /// Last LBA reported by READ CAPACITY instead of the image size.
    pub reported_last_lba: Option<u64>,
    pub corrupt_csw_tag: bool,
    /// Polls answered with "not finished" before each report is delivered.
    pub report_delay_polls: u32,
    /// Reports lost to CRC errors before one gets through.
    pub failed_reports: u32,
    image: Vec<u8>,
    sector_size: u32,
    reports: VecDeque<[u8; 8]>,
    hub_ports: u8,
    children: Vec<Option<SimDevice>>,
}

impl SimDevice {
    fn new(kind: SimKind, speed: Speed) -> Self {
        SimDevice {
            kind,
            speed,
            vendor: 0x1234,
            product: 0x5678,
            max_packet_size0: 8,
            hid_country_code: 0,
            ignore_reset: false,
            max_lun: 0,
            reported_last_lba: None,
            corrupt_csw_tag: false,
            report_delay_polls: 0,
            failed_reports: 0,
            image: Vec::new(),
            sector_size: 512,
            reports: VecDeque::new(),
            hub_ports: 0,
            children: Vec::new(),
        }
    }

    pub fn storage() -> Self {
        let mut dev = SimDevice::new(SimKind::Storage, Speed::Full);
        dev.product = 0x0001;
        dev.image = vec![0; 512 * 16];
        dev
    }

    pub fn keyboard() -> Self {
        let mut dev = SimDevice::new(SimKind::Keyboard, Speed::Low);
        dev.product = 0x0002;
        dev
    }

    pub fn hub(ports: u8) -> Self {
        let mut dev = SimDevice::new(SimKind::Hub, Speed::Full);
        dev.product = 0x0003;
        dev.hub_ports = ports;
        dev.children = vec![None; ports as usize];
        dev
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    /// Plug `device` into 1-based hub port `port`.
    pub fn attach(&mut self, port: u8, device: SimDevice) {
        self.children[port as usize - 1] = Some(device);
    }

    pub fn set_image(&mut self, image: Vec<u8>, sector_size: u32) {
        self.image = image;
        self.sector_size = sector_size;
    }

    pub fn push_report(&mut self, report: [u8; 8]) {
        self.reports.push_back(report);
    }

    pub fn device_descriptor(&self) -> [u8; 18] {
        let class = match self.kind {
            SimKind::Hub => 0x09,
            _ => 0x00,
        };
        let vendor = self.vendor.to_le_bytes();
        let product = self.product.to_le_bytes();
        [
            18, 1, 0x00, 0x02, class, 0, 0, self.max_packet_size0, vendor[0], vendor[1],
            product[0], product[1], 0x00, 0x01, 1, 2, 3, 1,
        ]
    }

    pub fn config_blob(&self) -> Vec<u8> {
        let mut body: Vec<u8> = match self.kind {
            SimKind::Storage => vec![
                9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0, //
                7, 5, 0x81, 2, 64, 0, 0, //
                7, 5, 0x02, 2, 64, 0, 0,
            ],
            SimKind::Keyboard => vec![
                9, 4, 0, 0, 1, 0x03, 0x01, 0x01, 0, //
                9, 0x21, 0x11, 0x01, self.hid_country_code, 1, 0x22, 0x3f, 0, //
                7, 5, 0x81, 3, 8, 0, 10,
            ],
            SimKind::Hub => vec![
                9, 4, 0, 0, 1, 0x09, 0, 0, 0, //
                7, 5, 0x81, 3, 1, 0, 12,
            ],
        };
        let total = (9 + body.len()) as u16;
        let mut blob = vec![9, 2, total as u8, (total >> 8) as u8, 1, 1, 0, 0x80, 50];
        blob.append(&mut body);
        blob
    }

    fn string(&self, index: u8) -> Option<Vec<u8>> {
        let text: &str = match index {
            1 => "SimCorp",
            2 => match self.kind {
                SimKind::Storage => "Sim Disk",
                SimKind::Keyboard => "Sim Keyboard",
                SimKind::Hub => "Sim Hub",
            },
            3 => "0001",
            _ => return None,
        };
        let mut raw = vec![(2 + 2 * text.len()) as u8, descriptor_type::STRING];
        for b in text.bytes() {
            raw.push(b);
            raw.push(0);
        }
        Some(raw)
    }
}

/// Endpoint descriptor with the given address, attributes, packet size and interval.
pub fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        b_length: 7,
        b_descriptor_type: descriptor_type::ENDPOINT,
        b_endpoint_address: address,
        bm_attributes: attributes,
        w_max_packet_size: max_packet_size,
        b_interval: interval,
    }
}

/// Configuration blob of a Bulk-Only storage device; ends with an endpoint.
pub fn storage_config_blob() -> Vec<u8> {
    SimDevice::storage().config_blob()
}

// =============================================================================
// MockBus
// =============================================================================

struct SimNode {
    device: SimDevice,
    address: Option<u8>,
    children: Vec<Option<usize>>,
    connect_change: Vec<bool>,
    reset_change: Vec<bool>,
    enabled: Vec<bool>,
    /// Bulk IN answers queued by the last CBW.
    bulk_in: VecDeque<Vec<u8>>,
}

struct Interrupt {
    node: usize,
    polls_left: u32,
}

struct BusState {
    kind: ControllerKind,
    nodes: Vec<SimNode>,
    root: Vec<Option<usize>>,
    /// Node answering at address 0 after the last port reset.
    default_node: Option<usize>,
    requests: Vec<(u8, SetupPacket)>,
    assigned: Vec<u8>,
    configured: Vec<u8>,
    cbws: Vec<CommandBlockWrapper>,
    interrupts: Vec<Interrupt>,
}

impl BusState {
    fn add_node(&mut self, mut device: SimDevice) -> usize {
        let children = core::mem::take(&mut device.children);
        let index = self.nodes.len();
        let ports = children.len();
        self.nodes.push(SimNode {
            device,
            address: None,
            children: vec![None; ports],
            connect_change: vec![false; ports],
            reset_change: vec![false; ports],
            enabled: vec![false; ports],
            bulk_in: VecDeque::new(),
        });
        for (port, child) in children.into_iter().enumerate() {
            if let Some(child) = child {
                let child = self.add_node(child);
                self.nodes[index].children[port] = Some(child);
                self.nodes[index].connect_change[port] = true;
            }
        }
        index
    }

    fn node_at(&self, address: u8) -> Option<usize> {
        if address == 0 {
            return self.default_node;
        }
        self.nodes.iter().position(|n| n.address == Some(address))
    }
}

/// A [`HostControllerDriver`] that routes requests to simulated devices.
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

/// Test-side view of a [`MockBus`] after it moved into a controller.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<BusState>>,
    pub platform: Arc<TestPlatform>,
}

impl MockBus {
    pub fn new(kind: ControllerKind, root: Vec<Option<SimDevice>>) -> (Self, MockHandle, Arc<TestPlatform>) {
        let mut state = BusState {
            kind,
            nodes: Vec::new(),
            root: Vec::new(),
            default_node: None,
            requests: Vec::new(),
            assigned: Vec::new(),
            configured: Vec::new(),
            cbws: Vec::new(),
            interrupts: Vec::new(),
        };
        for device in root {
            let node = device.map(|d| state.add_node(d));
            state.root.push(node);
        }
        let state = Arc::new(Mutex::new(state));
        let platform = Arc::new(TestPlatform::new());
        let handle = MockHandle {
            state: state.clone(),
            platform: platform.clone(),
        };
        (MockBus { state }, handle, platform)
    }

    /// A controller of `kind` with `root` on its root ports.
    pub fn controller(kind: ControllerKind, root: Vec<Option<SimDevice>>) -> (HostController, MockHandle) {
        let (bus, handle, platform) = MockBus::new(kind, root);
        (HostController::new(Box::new(bus), platform), handle)
    }
}

fn packets(length: usize, max_packet_size: u16) -> usize {
    length.div_ceil(max_packet_size.max(1) as usize)
}

fn copy_answer(answer: &[u8], data: &mut [u8]) {
    let n = answer.len().min(data.len());
    data[..n].copy_from_slice(&answer[..n]);
}

fn scsi_answer(device: &SimDevice, cbw: &CommandBlockWrapper) -> (Vec<u8>, u8) {
    let length = cbw.data_transfer_length as usize;
    let cmd = &cbw.cmd;
    let image_last = (device.image.len() as u64 / device.sector_size as u64).saturating_sub(1);
    let last_lba = device.reported_last_lba.unwrap_or(image_last);

    let mut data = match cmd[0] {
        opcode::INQUIRY => {
            let mut inquiry = vec![0x00, 0x80, 0x02, 0x02, 31, 0, 0, 0];
            inquiry.extend_from_slice(b"SimCorp Sim Disk        1.00");
            inquiry
        }
        opcode::REQUEST_SENSE => {
            let mut sense = vec![0u8; 18];
            sense[0] = 0x70;
            sense[7] = 10;
            sense
        }
        opcode::READ_CAPACITY10 => {
            let lba = last_lba.min(u32::MAX as u64) as u32;
            let mut capacity = lba.to_be_bytes().to_vec();
            capacity.extend_from_slice(&device.sector_size.to_be_bytes());
            capacity
        }
        opcode::SERVICE_ACTION_IN16 => {
            let mut capacity = last_lba.to_be_bytes().to_vec();
            capacity.extend_from_slice(&device.sector_size.to_be_bytes());
            capacity.resize(32, 0);
            capacity
        }
        opcode::READ10 => {
            let lba = u32::from_be_bytes([cmd[2], cmd[3], cmd[4], cmd[5]]) as usize;
            let count = u16::from_be_bytes([cmd[7], cmd[8]]) as usize;
            let size = device.sector_size as usize;
            let start = (lba * size).min(device.image.len());
            let end = ((lba + count) * size).min(device.image.len());
            device.image[start..end].to_vec()
        }
        _ => return (vec![0; length], 1),
    };
    data.resize(length, 0);
    (data, 0)
}

impl HostControllerDriver for MockBus {
    fn kind(&self) -> ControllerKind {
        self.state.lock().kind
    }

    fn root_ports(&self) -> u8 {
        self.state.lock().root.len() as u8
    }

    fn port_connected(&mut self, port: u8) -> bool {
        self.state.lock().root[port as usize].is_some()
    }

    fn port_speed(&mut self, port: u8) -> Option<Speed> {
        let state = self.state.lock();
        state.root[port as usize].map(|n| state.nodes[n].device.speed)
    }

    fn port_reset(&mut self, port: u8) -> Result<(), UsbError> {
        let mut state = self.state.lock();
        state.default_node = state.root[port as usize];
        Ok(())
    }

    fn port_init(&mut self, port: u8, address: u8) -> Result<Speed, UsbError> {
        let mut state = self.state.lock();
        if state.kind != ControllerKind::Xhci {
            return Err(UsbError::Unsupported);
        }
        let node = state.root[port as usize].ok_or(UsbError::InvalidDevice)?;
        state.nodes[node].address = Some(address);
        Ok(state.nodes[node].device.speed)
    }

    fn control_transfer(
        &mut self,
        target: DeviceTarget,
        _max_packet_size: u16,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let node = state.node_at(target.address).ok_or(UsbError::Timeout)?;
        state.requests.push((target.address, *setup));

        let value = setup.w_value;
        let index = setup.w_index;
        let port = index as usize;
        let sim = &mut state.nodes[node];

        const HUB_PORT_OUT: u8 =
            request_type::RECIPIENT_OTHER | request_type::CLASS | request_type::HOST_TO_DEVICE;
        const HUB_PORT_IN: u8 =
            request_type::RECIPIENT_OTHER | request_type::CLASS | request_type::DEVICE_TO_HOST;
        const HUB_IN: u8 =
            request_type::RECIPIENT_DEVICE | request_type::CLASS | request_type::DEVICE_TO_HOST;
        const IFACE_OUT: u8 =
            request_type::RECIPIENT_INTERFACE | request_type::CLASS | request_type::HOST_TO_DEVICE;
        const IFACE_IN: u8 =
            request_type::RECIPIENT_INTERFACE | request_type::CLASS | request_type::DEVICE_TO_HOST;

        match (setup.bm_request_type, setup.b_request) {
            (request_type::DEVICE_TO_HOST, request::GET_DESCRIPTOR) => {
                let answer = match (value >> 8) as u8 {
                    descriptor_type::DEVICE => sim.device.device_descriptor().to_vec(),
                    descriptor_type::CONFIGURATION => sim.device.config_blob(),
                    descriptor_type::STRING => {
                        sim.device.string(value as u8).ok_or(UsbError::Stall)?
                    }
                    _ => return Err(UsbError::Stall),
                };
                copy_answer(&answer, data);
            }
            (request_type::HOST_TO_DEVICE, request::SET_ADDRESS) => {
                sim.address = Some(value as u8);
                state.assigned.push(value as u8);
                state.default_node = None;
            }
            (request_type::HOST_TO_DEVICE, request::SET_CONFIGURATION) => {
                state.configured.push(target.address);
            }
            (HUB_IN, request::GET_DESCRIPTOR) if sim.device.kind == SimKind::Hub => {
                let ports = sim.device.hub_ports;
                copy_answer(&[9, descriptor_type::HUB, ports, 0, 0, 50, 0], data);
            }
            (HUB_PORT_IN, request::GET_STATUS) if sim.device.kind == SimKind::Hub => {
                let p = port.checked_sub(1).ok_or(UsbError::Stall)?;
                let mut status = port_status::POWER;
                let mut change = 0;
                if let Some(child) = sim.children[p] {
                    status |= port_status::CONNECTION;
                    match state.nodes[child].device.speed {
                        Speed::Low => status |= port_status::LOW_SPEED,
                        Speed::High => status |= port_status::HIGH_SPEED,
                        _ => {}
                    }
                }
                let sim = &state.nodes[node];
                if sim.enabled[p] {
                    status |= port_status::ENABLE;
                }
                if sim.connect_change[p] {
                    change |= port_change::CONNECTION;
                }
                if sim.reset_change[p] {
                    change |= port_change::RESET;
                }
                let mut raw = [0u8; 4];
                raw[0..2].copy_from_slice(&status.to_le_bytes());
                raw[2..4].copy_from_slice(&change.to_le_bytes());
                copy_answer(&raw, data);
            }
            (HUB_PORT_OUT, request::SET_FEATURE) if sim.device.kind == SimKind::Hub => {
                let p = port.checked_sub(1).ok_or(UsbError::Stall)?;
                if value != hub_feature::PORT_RESET {
                    return Err(UsbError::Stall);
                }
                if let Some(child) = sim.children[p] {
                    let ignore = state.nodes[child].device.ignore_reset;
                    let sim = &mut state.nodes[node];
                    sim.enabled[p] = true;
                    sim.reset_change[p] = !ignore;
                    state.default_node = Some(child);
                }
            }
            (HUB_PORT_OUT, request::CLEAR_FEATURE) if sim.device.kind == SimKind::Hub => {
                let p = port.checked_sub(1).ok_or(UsbError::Stall)?;
                match value {
                    hub_feature::C_PORT_CONNECTION => sim.connect_change[p] = false,
                    hub_feature::C_PORT_RESET => sim.reset_change[p] = false,
                    _ => return Err(UsbError::Stall),
                }
            }
            (IFACE_OUT, hid_request::SET_PROTOCOL | hid_request::SET_IDLE)
                if sim.device.kind == SimKind::Keyboard => {}
            (IFACE_IN, GET_MAX_LUN) if sim.device.kind == SimKind::Storage => {
                copy_answer(&[sim.device.max_lun], data);
            }
            _ => return Err(UsbError::Stall),
        }
        Ok(())
    }

    fn bulk_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let node = state.node_at(target.address).ok_or(UsbError::Timeout)?;
        if state.nodes[node].device.kind != SimKind::Storage {
            return Err(UsbError::Stall);
        }

        if packets(data.len(), endpoint.max_packet_size()) % 2 == 1 {
            endpoint.toggle = !endpoint.toggle;
        }

        if endpoint.is_in() {
            let answer = state.nodes[node]
                .bulk_in
                .pop_front()
                .ok_or(UsbError::Stall)?;
            copy_answer(&answer, data);
            return Ok(());
        }

        let cbw = CommandBlockWrapper::parse(data).ok_or(UsbError::Stall)?;
        state.cbws.push(cbw);
        let sim = &mut state.nodes[node];
        let (answer, status) = scsi_answer(&sim.device, &cbw);
        if cbw.flags & CBW_FLAG_DATA_IN != 0 && !answer.is_empty() {
            sim.bulk_in.push_back(answer);
        }
        let csw = CommandStatusWrapper {
            signature: CSW_SIGNATURE,
            tag: if sim.device.corrupt_csw_tag {
                cbw.tag.wrapping_add(1)
            } else {
                cbw.tag
            },
            data_residue: 0,
            status,
        };
        sim.bulk_in.push_back(csw.to_bytes().to_vec());
        Ok(())
    }

    fn interrupt_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        length: usize,
    ) -> Result<TransferHandle, UsbError> {
        let mut state = self.state.lock();
        let node = state.node_at(target.address).ok_or(UsbError::Timeout)?;
        if state.nodes[node].device.kind != SimKind::Keyboard {
            return Err(UsbError::Stall);
        }
        let toggle = endpoint.toggle ^ (packets(length, endpoint.max_packet_size()) % 2 == 1);
        let polls_left = state.nodes[node].device.report_delay_polls;
        state.interrupts.push(Interrupt { node, polls_left });
        Ok(TransferHandle::new(state.interrupts.len() - 1, None, length).with_toggle(toggle))
    }

    fn check_transfer_status(&mut self, handle: &mut TransferHandle, data: &mut [u8]) -> TransferStatus {
        let mut state = self.state.lock();
        let state = &mut *state;
        let transfer = &mut state.interrupts[handle.slot];
        if transfer.polls_left > 0 {
            transfer.polls_left -= 1;
            return TransferStatus::NotFinished;
        }
        let device = &mut state.nodes[transfer.node].device;
        if device.failed_reports > 0 {
            device.failed_reports -= 1;
            return TransferStatus::Failed(UsbError::CrcError);
        }
        let report = state.nodes[transfer.node]
            .device
            .reports
            .pop_front()
            .unwrap_or([0; 8]);
        copy_answer(&report, data);
        TransferStatus::Success
    }
}

impl MockHandle {
    pub fn slept_ms(&self) -> u32 {
        self.platform.slept_ms()
    }

    /// Addresses handed out with SET_ADDRESS, in order.
    pub fn assigned_addresses(&self) -> Vec<u8> {
        self.state.lock().assigned.clone()
    }

    /// Addresses that received SET_CONFIGURATION.
    pub fn configured_addresses(&self) -> Vec<u8> {
        self.state.lock().configured.clone()
    }

    pub fn requests(&self) -> Vec<(u8, SetupPacket)> {
        self.state.lock().requests.clone()
    }

    /// Class requests as (bmRequestType, bRequest, wValue, wIndex).
    pub fn class_requests(&self) -> Vec<(u8, u8, u16, u16)> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(_, s)| s.bm_request_type & (3 << 5) == request_type::CLASS)
            .map(|(_, s)| (s.bm_request_type, s.b_request, s.w_value, s.w_index))
            .collect()
    }

    pub fn port_change_bits_clear(&self) -> bool {
        self.state.lock().nodes.iter().all(|n| {
            n.connect_change.iter().all(|c| !c) && n.reset_change.iter().all(|c| !c)
        })
    }

    pub fn cbw_tags(&self) -> Vec<u32> {
        self.state.lock().cbws.iter().map(|c| c.tag).collect()
    }

    pub fn scsi_commands(&self) -> Vec<[u8; 16]> {
        self.state.lock().cbws.iter().map(|c| c.cmd).collect()
    }

    pub fn scsi_opcodes(&self) -> Vec<u8> {
        self.state.lock().cbws.iter().map(|c| c.cmd[0]).collect()
    }
}
