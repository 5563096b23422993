//! xHCI (USB 3.x) host controller driver.
//!
//! Software and controller talk through rings of 16-byte TRBs. Commands go on
//! the command ring, transfers on one transfer ring per endpoint, and the
//! controller reports completions on the event ring. Ownership of every TRB
//! is carried by its cycle bit, which flips each time a ring wraps through
//! its Link TRB.
//!
//! A device gets a slot from Enable Slot and its bus address from Address
//! Device. The stack's own device address is only a key mapped onto the
//! slot. Bulk and interrupt endpoints are added with Configure Endpoint the
//! first time they are used.
//!
//! Hubs are not supported here: devices are only reached through root ports.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::controller::{
    ControllerKind, DeviceTarget, Endpoint, HostControllerDriver, Speed, TransferHandle,
    DEFAULT_MAX_PACKET_SIZE,
};
use super::descriptors::{endpoint_type, SetupPacket};
use super::{TransferStatus, UsbError};
use crate::config::PollBudget;
use crate::hal::{alloc_dma, alloc_dma32, wait_for, DmaArray, DmaBuffer, Platform, RegisterBlock};

// =============================================================================
// Registers
// =============================================================================

/// Capability registers, at the start of the window.
mod cap {
    pub const CAPLENGTH: usize = 0x00;
    pub const HCSPARAMS1: usize = 0x04;
    pub const HCSPARAMS2: usize = 0x08;
    pub const HCCPARAMS1: usize = 0x10;
    pub const DBOFF: usize = 0x14;
    pub const RTSOFF: usize = 0x18;

    pub const ADDRESSING_64: u32 = 1 << 0;
    pub const CONTEXT_64: u32 = 1 << 2;
}

/// Operational registers, relative to CAPLENGTH.
mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const CRCR: usize = 0x18;
    pub const DCBAAP: usize = 0x30;
    pub const CONFIG: usize = 0x38;
    pub const PORTSC: usize = 0x400;
    pub const PORT_STRIDE: usize = 0x10;
}

mod cmd {
    pub const RUN: u32 = 1 << 0;
    pub const HCRESET: u32 = 1 << 1;
}

mod sts {
    pub const HALTED: u32 = 1 << 0;
    pub const NOT_READY: u32 = 1 << 11;
}

/// Interrupter 0, relative to the runtime registers.
mod intr {
    pub const IMAN: usize = 0x20;
    pub const ERSTSZ: usize = 0x28;
    pub const ERSTBA: usize = 0x30;
    pub const ERDP: usize = 0x38;

    pub const PENDING: u32 = 1 << 0;
    pub const EVENT_BUSY: u64 = 1 << 3;
}

mod portsc {
    pub const CONNECTED: u32 = 1 << 0;
    pub const ENABLED: u32 = 1 << 1;
    pub const RESET: u32 = 1 << 4;
    pub const LINK_STATE: u32 = 0xF << 5;
    pub const POWER: u32 = 1 << 9;
    pub const SPEED_SHIFT: u32 = 10;
    pub const SPEED_MASK: u32 = 0xF;
    pub const CONNECT_CHANGE: u32 = 1 << 17;
    pub const RESET_CHANGE: u32 = 1 << 21;
    /// Every write-1-to-clear change bit.
    pub const CHANGES: u32 = 0x7F << 17;
    /// Bits written back as read. The rest are status, or act on a 1.
    pub const PRESERVE: u32 = POWER | 3 << 14 | 7 << 25;
}

/// Extended capability IDs.
mod ext_cap {
    pub const LEGACY: u8 = 1;
    pub const SUPPORTED_PROTOCOL: u8 = 2;

    pub const BIOS_OWNED: u32 = 1 << 16;
    pub const OS_OWNED: u32 = 1 << 24;
}

// =============================================================================
// TRBs
// =============================================================================

mod trb_type {
    pub const NORMAL: u32 = 1;
    pub const SETUP_STAGE: u32 = 2;
    pub const DATA_STAGE: u32 = 3;
    pub const STATUS_STAGE: u32 = 4;
    pub const LINK: u32 = 6;
    pub const NO_OP: u32 = 8;
    pub const ENABLE_SLOT: u32 = 9;
    pub const DISABLE_SLOT: u32 = 10;
    pub const ADDRESS_DEVICE: u32 = 11;
    pub const CONFIGURE_ENDPOINT: u32 = 12;
    pub const EVALUATE_CONTEXT: u32 = 13;
    pub const RESET_ENDPOINT: u32 = 14;
    pub const STOP_ENDPOINT: u32 = 15;
    pub const SET_TR_DEQUEUE_POINTER: u32 = 16;
    pub const TRANSFER_EVENT: u32 = 32;
    pub const COMMAND_COMPLETION: u32 = 33;
    pub const PORT_STATUS_CHANGE: u32 = 34;
}

mod completion_code {
    pub const SUCCESS: u32 = 1;
    pub const DATA_BUFFER: u32 = 2;
    pub const BABBLE: u32 = 3;
    pub const TRANSACTION: u32 = 4;
    pub const STALL: u32 = 6;
    pub const NO_SLOTS: u32 = 9;
    pub const SHORT_PACKET: u32 = 13;
}

/// Control dword flags.
mod ctrl {
    pub const CYCLE: u32 = 1 << 0;
    /// Link TRBs only.
    pub const TOGGLE_CYCLE: u32 = 1 << 1;
    /// Interrupt on short packet.
    pub const SHORT_OK: u32 = 1 << 2;
    pub const CHAIN: u32 = 1 << 4;
    pub const IOC: u32 = 1 << 5;
    /// Setup stage: the 8 request bytes sit in the parameter field.
    pub const IMMEDIATE: u32 = 1 << 6;
    pub const TYPE_SHIFT: u32 = 10;
    pub const DIR_IN: u32 = 1 << 16;
    pub const TRANSFER_TYPE_SHIFT: u32 = 16;
    pub const ENDPOINT_SHIFT: u32 = 16;
    pub const SLOT_SHIFT: u32 = 24;
}

/// Setup stage transfer types.
mod transfer_type {
    pub const NO_DATA: u32 = 0;
    pub const OUT: u32 = 2;
    pub const IN: u32 = 3;
}

const TRB_SIZE: usize = 16;
const COMMAND_RING_TRBS: usize = 128;
const EVENT_RING_TRBS: usize = 32;
const TRANSFER_RING_TRBS: usize = 128;
/// A TRB buffer may not cross a 64 KiB boundary.
const TRB_MAX_BYTES: usize = 0x10000;
const PAGE: usize = 4096;

/// Device context index of the default control endpoint.
const EP0: usize = 1;
const MAX_ENDPOINTS: usize = 32;
/// Device addresses the stack can map onto slots.
const MAX_ADDRESSES: usize = 128;
const MAX_CAPABILITIES: usize = 64;
/// Completion events nobody waited for are dropped past this.
const MAX_UNCLAIMED: usize = 64;

/// Input context indices.
const INPUT_CONTROL: usize = 0;
const SLOT_CONTEXT: usize = 1;

mod endpoint_context {
    pub const CONTROL: u32 = 4;
    /// Bulk or interrupt OUT; add 4 for IN.
    pub const BULK_OUT: u32 = 2;
    pub const INTERRUPT_OUT: u32 = 3;
    pub const IN_OFFSET: u32 = 4;
    pub const ERROR_COUNT: u32 = 3 << 1;
}

const READY_BUDGET: PollBudget = PollBudget::new(1000, 1);
const HALT_BUDGET: PollBudget = PollBudget::new(20, 1);
const RESET_BUDGET: PollBudget = PollBudget::new(50, 1);
const HANDOFF_BUDGET: PollBudget = PollBudget::new(100, 1);
const RESET_CHANGE_BUDGET: PollBudget = PollBudget::new(10, 1);
const PORT_RESET_MS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Trb {
    param: u64,
    status: u32,
    control: u32,
}

impl Trb {
    fn command(kind: u32, slot: u8, param: u64) -> Self {
        Trb {
            param,
            status: 0,
            control: kind << ctrl::TYPE_SHIFT | (slot as u32) << ctrl::SLOT_SHIFT,
        }
    }

    fn endpoint_command(kind: u32, slot: u8, dci: usize, param: u64) -> Self {
        let mut trb = Self::command(kind, slot, param);
        trb.control |= (dci as u32) << ctrl::ENDPOINT_SHIFT;
        trb
    }

    fn trb_type(&self) -> u32 {
        (self.control >> ctrl::TYPE_SHIFT) & 0x3F
    }

    fn completion_code(&self) -> u32 {
        self.status >> 24
    }

    fn slot_id(&self) -> u8 {
        (self.control >> ctrl::SLOT_SHIFT) as u8
    }

    fn endpoint_id(&self) -> usize {
        ((self.control >> ctrl::ENDPOINT_SHIFT) & 0x1F) as usize
    }
}

fn alloc_for(platform: &dyn Platform, below_4g: bool, size: usize, align: usize) -> Result<DmaBuffer, UsbError> {
    if below_4g {
        alloc_dma32(platform, size, align)
    } else {
        alloc_dma(platform, size, align)
    }
}

// =============================================================================
// Rings
// =============================================================================

/// Producer side of a command or transfer ring. The last TRB is a Link TRB
/// back to the start.
struct Ring {
    trbs: DmaArray,
    enqueue: usize,
    cycle: bool,
}

impl Ring {
    fn new(platform: &dyn Platform, count: usize, below_4g: bool) -> Result<Self, UsbError> {
        let trbs = DmaArray::new(platform, count, TRB_SIZE, 64, below_4g)?;
        let base = trbs.phys(0);
        trbs.write32(count - 1, 0, base as u32);
        trbs.write32(count - 1, 4, (base >> 32) as u32);
        Ok(Ring {
            trbs,
            enqueue: 0,
            cycle: true,
        })
    }

    /// TRBs usable before the ring wraps.
    fn capacity(&self) -> usize {
        self.trbs.len() - 1
    }

    /// Next TRB to fill, tagged with the producer cycle state.
    fn dequeue_pointer(&self) -> u64 {
        self.trbs.phys(self.enqueue) | self.cycle as u64
    }

    /// Append `trb` and return its bus address. Wrapping hands the Link TRB
    /// to the controller, chained if `trb` is.
    fn push(&mut self, trb: Trb) -> u64 {
        let index = self.enqueue;
        self.trbs.write32(index, 0, trb.param as u32);
        self.trbs.write32(index, 4, (trb.param >> 32) as u32);
        self.trbs.write32(index, 8, trb.status);
        // The cycle bit goes in last; it hands the TRB over.
        self.trbs
            .write32(index, 12, (trb.control & !ctrl::CYCLE) | self.cycle as u32);

        self.enqueue += 1;
        if self.enqueue == self.capacity() {
            let link = trb_type::LINK << ctrl::TYPE_SHIFT
                | ctrl::TOGGLE_CYCLE
                | (trb.control & ctrl::CHAIN)
                | self.cycle as u32;
            self.trbs.write32(self.enqueue, 12, link);
            self.enqueue = 0;
            self.cycle = !self.cycle;
        }
        self.trbs.phys(index)
    }

    /// Turn a TRB already handed over into a no-op. Its cycle and chain
    /// bits are kept so the rest of the TD still lines up.
    fn cancel(&self, pointer: u64) {
        if let Some(index) = self.trbs.index_of(pointer) {
            let control = self.trbs.read32(index, 12);
            self.trbs.write32(
                index,
                12,
                trb_type::NO_OP << ctrl::TYPE_SHIFT | control & (ctrl::CYCLE | ctrl::CHAIN),
            );
        }
    }

    fn free(self, platform: &dyn Platform) {
        platform.free_dma(self.trbs.into_buffer());
    }
}

/// Consumer side of the single-segment event ring.
struct EventRing {
    trbs: DmaArray,
    /// Segment table, read only by the controller.
    segment_table: DmaBuffer,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    fn new(platform: &dyn Platform, below_4g: bool) -> Result<Self, UsbError> {
        let trbs = DmaArray::new(platform, EVENT_RING_TRBS, TRB_SIZE, 64, below_4g)?;
        let table = alloc_for(platform, below_4g, 16, 64)?;
        table.write::<u64>(0, trbs.phys(0));
        table.write::<u32>(8, EVENT_RING_TRBS as u32);
        Ok(EventRing {
            trbs,
            segment_table: table,
            dequeue: 0,
            cycle: true,
        })
    }

    fn table(&self) -> u64 {
        self.segment_table.phys()
    }

    fn dequeue_pointer(&self) -> u64 {
        self.trbs.phys(self.dequeue)
    }

    fn pop(&mut self) -> Option<Trb> {
        let control = self.trbs.read32(self.dequeue, 12);
        if (control & ctrl::CYCLE != 0) != self.cycle {
            return None;
        }
        let trb = Trb {
            param: self.trbs.read32(self.dequeue, 0) as u64
                | (self.trbs.read32(self.dequeue, 4) as u64) << 32,
            status: self.trbs.read32(self.dequeue, 8),
            control,
        };
        self.dequeue += 1;
        if self.dequeue == self.trbs.len() {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }
}

// =============================================================================
// Device Slots
// =============================================================================

struct Slot {
    id: u8,
    speed: Speed,
    context_size: usize,
    input: DmaBuffer,
    /// Device context, written by the controller.
    output: DmaBuffer,
    /// Transfer rings by device context index.
    rings: Vec<Option<Ring>>,
    max_packet0: u16,
    /// Bus address of the TRB each in-flight interrupt transfer waits on.
    interrupts: [Option<u64>; MAX_ENDPOINTS],
}

impl Slot {
    /// Byte offset of dword `dword` of input context `index` (0 is the input
    /// control context, 1 the slot context, 1 + dci an endpoint).
    fn input_offset(&self, index: usize, dword: usize) -> usize {
        index * self.context_size + dword * 4
    }

    fn input_read(&self, index: usize, dword: usize) -> u32 {
        self.input.read::<u32>(self.input_offset(index, dword))
    }

    fn input_write(&self, index: usize, dword: usize, value: u32) {
        self.input.write::<u32>(self.input_offset(index, dword), value)
    }

    fn input_clear(&self, index: usize) {
        for dword in 0..self.context_size / 4 {
            self.input_write(index, dword, 0);
        }
    }

    /// Only the contexts flagged in the add mask are evaluated.
    fn set_add_flags(&self, mask: u32) {
        self.input_write(INPUT_CONTROL, 0, 0);
        self.input_write(INPUT_CONTROL, 1, mask);
    }

    fn free(self, platform: &dyn Platform) {
        platform.free_dma(self.input);
        platform.free_dma(self.output);
        for ring in self.rings.into_iter().flatten() {
            ring.free(platform);
        }
    }
}

fn speed_id(speed: Speed) -> u32 {
    match speed {
        Speed::Full => 1,
        Speed::Low => 2,
        Speed::High => 3,
        Speed::Super => 4,
        Speed::SuperPlus => 5,
    }
}

fn port_speed(status: u32) -> Option<Speed> {
    match (status >> portsc::SPEED_SHIFT) & portsc::SPEED_MASK {
        1 => Some(Speed::Full),
        2 => Some(Speed::Low),
        3 => Some(Speed::High),
        4 => Some(Speed::Super),
        5 => Some(Speed::SuperPlus),
        _ => None,
    }
}

/// EP0 packet size before the device descriptor has been read.
fn initial_max_packet0(speed: Speed) -> u16 {
    match speed {
        Speed::Low | Speed::Full => 8,
        Speed::High => 64,
        Speed::Super | Speed::SuperPlus => 512,
    }
}

/// Endpoint context interval: the period is 2^n x 125 us.
fn interval_exponent(speed: Speed, b_interval: u8) -> u32 {
    match speed {
        // bInterval counts 1 ms frames.
        Speed::Low | Speed::Full => {
            let microframes = b_interval.max(1) as u32 * 8;
            (31 - microframes.leading_zeros()).clamp(3, 10)
        }
        _ => b_interval.clamp(1, 16) as u32 - 1,
    }
}

fn decode(code: u32) -> UsbError {
    match code {
        completion_code::DATA_BUFFER => UsbError::DataBuffer,
        completion_code::BABBLE => UsbError::Babble,
        completion_code::TRANSACTION => UsbError::CrcError,
        completion_code::STALL => UsbError::Stall,
        completion_code::NO_SLOTS => UsbError::NoDescriptors,
        _ => UsbError::NotFinished,
    }
}

fn succeeded(code: u32) -> bool {
    code == completion_code::SUCCESS || code == completion_code::SHORT_PACKET
}

/// Walk the extended capability list: (id, register offset) pairs.
fn extended_capabilities(regs: &dyn RegisterBlock, hccparams1: u32) -> Vec<(u8, usize)> {
    let mut found = Vec::new();
    let mut offset = ((hccparams1 >> 16) as usize) << 2;
    while offset != 0 && found.len() < MAX_CAPABILITIES {
        let header = regs.read32(offset);
        found.push((header as u8, offset));
        let next = ((header >> 8) & 0xFF) as usize;
        if next == 0 {
            break;
        }
        offset += next << 2;
    }
    found
}

/// Major USB revision of every root port, 0 where no capability covers it.
fn supported_protocols(regs: &dyn RegisterBlock, capabilities: &[(u8, usize)], ports: u8) -> Vec<u8> {
    let mut protocols = alloc::vec![0u8; ports as usize];
    for &(_, offset) in capabilities
        .iter()
        .filter(|(id, _)| *id == ext_cap::SUPPORTED_PROTOCOL)
    {
        let major = (regs.read32(offset) >> 24) as u8;
        let range = regs.read32(offset + 8);
        let first = (range & 0xFF) as usize;
        let count = ((range >> 8) & 0xFF) as usize;
        for port in first..first + count {
            if let Some(protocol) = port.checked_sub(1).and_then(|i| protocols.get_mut(i)) {
                *protocol = major;
            }
        }
    }
    protocols
}

/// Ask the BIOS to let go of the controller.
fn take_ownership(regs: &dyn RegisterBlock, platform: &dyn Platform, offset: usize) {
    let value = regs.read32(offset);
    if value & ext_cap::BIOS_OWNED == 0 {
        return;
    }
    regs.write32(offset, value | ext_cap::OS_OWNED);
    if wait_for(platform, HANDOFF_BUDGET, || regs.read32(offset) & ext_cap::BIOS_OWNED == 0).is_err() {
        log::warn!("[xhci] BIOS did not release the controller");
    }
}

// =============================================================================
// Controller
// =============================================================================

struct Scratchpad {
    _table: DmaArray,
    _pages: Vec<DmaBuffer>,
}

pub struct Xhci {
    regs: Box<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    budget: PollBudget,
    op_base: usize,
    runtime_base: usize,
    doorbell_base: usize,
    ports: u8,
    max_slots: u8,
    /// Major USB revision per root port.
    protocols: Vec<u8>,
    context_size: usize,
    below_4g: bool,
    dcbaa: DmaArray,
    _scratchpad: Option<Scratchpad>,
    commands: Ring,
    events: EventRing,
    /// Command completions and transfer events nobody has claimed yet.
    completions: VecDeque<Trb>,
    /// Slots by the stack's device address.
    slots: Vec<Option<Slot>>,
}

impl Xhci {
    /// Take the controller from the BIOS, reset it, build the command and
    /// event rings and start it.
    pub fn new(
        regs: Box<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        budget: PollBudget,
    ) -> Result<Self, UsbError> {
        let base = regs.read8(cap::CAPLENGTH) as usize;
        let hcsparams1 = regs.read32(cap::HCSPARAMS1);
        let hcsparams2 = regs.read32(cap::HCSPARAMS2);
        let hccparams1 = regs.read32(cap::HCCPARAMS1);
        let runtime_base = (regs.read32(cap::RTSOFF) & !0x1F) as usize;
        let doorbell_base = (regs.read32(cap::DBOFF) & !0x3) as usize;
        let max_slots = hcsparams1 as u8;
        let ports = (hcsparams1 >> 24) as u8;
        let below_4g = hccparams1 & cap::ADDRESSING_64 == 0;
        let context_size = if hccparams1 & cap::CONTEXT_64 != 0 { 64 } else { 32 };

        let capabilities = extended_capabilities(&*regs, hccparams1);
        if let Some(&(_, legacy)) = capabilities.iter().find(|(id, _)| *id == ext_cap::LEGACY) {
            take_ownership(&*regs, &*platform, legacy);
        }

        let ready = |regs: &dyn RegisterBlock| regs.read32(base + op::USBSTS) & sts::NOT_READY == 0;
        wait_for(&*platform, READY_BUDGET, || ready(&*regs)).map_err(|_| {
            log::warn!("[xhci] controller never became ready");
            UsbError::ControllerInit
        })?;

        let command = regs.read32(base + op::USBCMD);
        regs.write32(base + op::USBCMD, command & !cmd::RUN);
        wait_for(&*platform, HALT_BUDGET, || {
            regs.read32(base + op::USBSTS) & sts::HALTED != 0
        })
        .map_err(|_| {
            log::warn!("[xhci] controller did not halt");
            UsbError::ControllerInit
        })?;

        regs.write32(base + op::USBCMD, cmd::HCRESET);
        wait_for(&*platform, RESET_BUDGET, || {
            regs.read32(base + op::USBCMD) & cmd::HCRESET == 0 && ready(&*regs)
        })
        .map_err(|_| {
            log::warn!("[xhci] reset did not complete");
            UsbError::ControllerInit
        })?;

        if !capabilities
            .iter()
            .any(|(id, _)| *id == ext_cap::SUPPORTED_PROTOCOL)
        {
            log::warn!("[xhci] no supported-protocol capability");
            return Err(UsbError::ControllerInit);
        }
        let protocols = supported_protocols(&*regs, &capabilities, ports);

        regs.write32(base + op::CONFIG, max_slots as u32);
        let dcbaa = DmaArray::new(&*platform, max_slots as usize + 1, 8, 64, below_4g)?;

        let scratchpads = ((hcsparams2 >> 21) & 0x1F) << 5 | (hcsparams2 >> 27) & 0x1F;
        let scratchpad = if scratchpads > 0 {
            let table = DmaArray::new(&*platform, scratchpads as usize, 8, 64, below_4g)?;
            let mut pages = Vec::with_capacity(scratchpads as usize);
            for index in 0..scratchpads as usize {
                let page = alloc_for(&*platform, below_4g, PAGE, PAGE)?;
                table.write32(index, 0, page.phys() as u32);
                table.write32(index, 4, (page.phys() >> 32) as u32);
                pages.push(page);
            }
            dcbaa.write32(0, 0, table.phys(0) as u32);
            dcbaa.write32(0, 4, (table.phys(0) >> 32) as u32);
            Some(Scratchpad {
                _table: table,
                _pages: pages,
            })
        } else {
            None
        };
        regs.write64(base + op::DCBAAP, dcbaa.phys(0));

        let commands = Ring::new(&*platform, COMMAND_RING_TRBS, below_4g)?;
        regs.write64(base + op::CRCR, commands.dequeue_pointer());

        let events = EventRing::new(&*platform, below_4g)?;
        regs.write32(runtime_base + intr::ERSTSZ, 1);
        regs.write64(runtime_base + intr::ERDP, events.dequeue_pointer());
        regs.write64(runtime_base + intr::ERSTBA, events.table());
        // Polled: acknowledge anything pending and leave interrupts off.
        regs.write32(runtime_base + intr::IMAN, intr::PENDING);

        regs.write32(base + op::USBCMD, cmd::RUN);
        wait_for(&*platform, HALT_BUDGET, || {
            regs.read32(base + op::USBSTS) & sts::HALTED == 0
        })
        .map_err(|_| {
            log::warn!("[xhci] controller did not start");
            UsbError::ControllerInit
        })?;

        log::info!(
            "[xhci] running, {} ports, {} slots, {}-byte contexts",
            ports,
            max_slots,
            context_size
        );

        Ok(Xhci {
            regs,
            platform,
            budget,
            op_base: base,
            runtime_base,
            doorbell_base,
            ports,
            max_slots,
            protocols,
            context_size,
            below_4g,
            dcbaa,
            _scratchpad: scratchpad,
            commands,
            events,
            completions: VecDeque::new(),
            slots: (0..MAX_ADDRESSES).map(|_| None).collect(),
        })
    }

    fn portsc(&self, port: u8) -> usize {
        self.op_base + op::PORTSC + op::PORT_STRIDE * port as usize
    }

    fn alloc(&self, size: usize, align: usize) -> Result<DmaBuffer, UsbError> {
        alloc_for(&*self.platform, self.below_4g, size, align)
    }

    fn ring_doorbell(&self, slot: u8, target: u32) {
        self.regs
            .write32(self.doorbell_base + 4 * slot as usize, target);
    }

    fn slot(&self, address: u8) -> Result<&Slot, UsbError> {
        self.slots
            .get(address as usize)
            .and_then(Option::as_ref)
            .ok_or(UsbError::InvalidDevice)
    }

    fn slot_mut(&mut self, address: u8) -> Result<&mut Slot, UsbError> {
        self.slots
            .get_mut(address as usize)
            .and_then(Option::as_mut)
            .ok_or(UsbError::InvalidDevice)
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Move every new event off the ring and tell the controller how far we got.
    fn drain_events(&mut self) {
        let mut drained = false;
        while let Some(event) = self.events.pop() {
            drained = true;
            match event.trb_type() {
                trb_type::TRANSFER_EVENT | trb_type::COMMAND_COMPLETION => {
                    if self.completions.len() == MAX_UNCLAIMED {
                        self.completions.pop_front();
                    }
                    self.completions.push_back(event);
                }
                trb_type::PORT_STATUS_CHANGE => {
                    log::trace!("[xhci] port {} status change", (event.param >> 24) as u8)
                }
                other => log::debug!("[xhci] ignoring event type {}", other),
            }
        }
        if drained {
            self.regs.write64(
                self.runtime_base + intr::ERDP,
                self.events.dequeue_pointer() | intr::EVENT_BUSY,
            );
        }
    }

    fn take_event<F: Fn(&Trb) -> bool>(&mut self, matches: F) -> Option<Trb> {
        self.drain_events();
        let index = self.completions.iter().position(matches)?;
        self.completions.remove(index)
    }

    fn wait_event<F: Fn(&Trb) -> bool>(&mut self, matches: F) -> Result<Trb, UsbError> {
        let platform = self.platform.clone();
        let mut found = None;
        wait_for(&*platform, self.budget, || {
            found = self.take_event(&matches);
            found.is_some()
        })?;
        found.ok_or(UsbError::Timeout)
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn command(&mut self, trb: Trb) -> Result<Trb, UsbError> {
        let pointer = self.commands.push(trb);
        self.ring_doorbell(0, 0);
        let event = self
            .wait_event(|e| e.trb_type() == trb_type::COMMAND_COMPLETION && e.param == pointer)
            .map_err(|e| {
                log::warn!("[xhci] command {} timed out", trb.trb_type());
                e
            })?;
        match event.completion_code() {
            completion_code::SUCCESS => Ok(event),
            code => {
                log::warn!(
                    "[xhci] command {} failed with completion code {}",
                    trb.trb_type(),
                    code
                );
                Err(decode(code))
            }
        }
    }

    fn enable_slot(&mut self) -> Result<u8, UsbError> {
        let event = self.command(Trb::command(trb_type::ENABLE_SLOT, 0, 0))?;
        let id = event.slot_id();
        if id == 0 || id > self.max_slots {
            log::warn!("[xhci] controller returned bad slot id {}", id);
            return Err(UsbError::ControllerInit);
        }
        Ok(id)
    }

    /// Build the slot and EP0 contexts and address the device on `port`.
    fn address_device(&mut self, id: u8, port: u8, speed: Speed) -> Result<Slot, UsbError> {
        let input = self.alloc(33 * self.context_size, 64)?;
        let output = match self.alloc(32 * self.context_size, 64) {
            Ok(output) => output,
            Err(e) => {
                self.platform.free_dma(input);
                return Err(e);
            }
        };
        let mut slot = Slot {
            id,
            speed,
            context_size: self.context_size,
            input,
            output,
            rings: (0..MAX_ENDPOINTS).map(|_| None).collect(),
            max_packet0: initial_max_packet0(speed),
            interrupts: [None; MAX_ENDPOINTS],
        };
        let ep0 = match Ring::new(&*self.platform, TRANSFER_RING_TRBS, self.below_4g) {
            Ok(ring) => ring,
            Err(e) => {
                slot.free(&*self.platform);
                return Err(e);
            }
        };

        slot.set_add_flags(1 << 0 | 1 << EP0);
        slot.input_write(SLOT_CONTEXT, 0, 1 << 27 | speed_id(speed) << 20);
        slot.input_write(SLOT_CONTEXT, 1, (port as u32 + 1) << 16);
        let context = 1 + EP0;
        slot.input_write(
            context,
            1,
            endpoint_context::ERROR_COUNT
                | endpoint_context::CONTROL << 3
                | (slot.max_packet0 as u32) << 16,
        );
        let dequeue = ep0.dequeue_pointer();
        slot.input_write(context, 2, dequeue as u32);
        slot.input_write(context, 3, (dequeue >> 32) as u32);
        slot.input_write(context, 4, 8);
        slot.rings[EP0] = Some(ep0);

        self.dcbaa.write32(id as usize, 0, slot.output.phys() as u32);
        self.dcbaa
            .write32(id as usize, 4, (slot.output.phys() >> 32) as u32);

        let input = slot.input.phys();
        if let Err(e) = self.command(Trb::command(trb_type::ADDRESS_DEVICE, id, input)) {
            self.dcbaa.write32(id as usize, 0, 0);
            self.dcbaa.write32(id as usize, 4, 0);
            slot.free(&*self.platform);
            return Err(e);
        }
        log::debug!(
            "[xhci] slot {} has bus address {}",
            id,
            slot.output.read::<u32>(12) & 0xFF
        );
        Ok(slot)
    }

    /// EP0 packet size learnt from the device descriptor.
    fn update_max_packet0(&mut self, address: u8, max_packet_size: u16) -> Result<(), UsbError> {
        let (id, input) = {
            let slot = self.slot(address)?;
            if max_packet_size <= DEFAULT_MAX_PACKET_SIZE
                || max_packet_size == slot.max_packet0
                || matches!(slot.speed, Speed::Super | Speed::SuperPlus)
            {
                return Ok(());
            }
            slot.set_add_flags(1 << EP0);
            let context = 1 + EP0;
            let characteristics = slot.input_read(context, 1) & 0xFFFF;
            slot.input_write(context, 1, characteristics | (max_packet_size as u32) << 16);
            (slot.id, slot.input.phys())
        };
        self.command(Trb::command(trb_type::EVALUATE_CONTEXT, id, input))?;
        self.slot_mut(address)?.max_packet0 = max_packet_size;
        Ok(())
    }

    /// Device context index of `endpoint`, adding it to the slot first if
    /// this is its first use.
    fn endpoint_ring(&mut self, address: u8, endpoint: &Endpoint) -> Result<usize, UsbError> {
        let dci = 2 * endpoint.number() as usize + endpoint.is_in() as usize;
        if !(2..MAX_ENDPOINTS).contains(&dci) {
            return Err(UsbError::InvalidParameter);
        }
        if self.slot(address)?.rings[dci].is_some() {
            return Ok(dci);
        }

        let base_type = match endpoint.descriptor.transfer_type() {
            endpoint_type::BULK => endpoint_context::BULK_OUT,
            endpoint_type::INTERRUPT => endpoint_context::INTERRUPT_OUT,
            _ => return Err(UsbError::Unsupported),
        };
        let kind = if endpoint.is_in() {
            base_type + endpoint_context::IN_OFFSET
        } else {
            base_type
        };
        let ring = Ring::new(&*self.platform, TRANSFER_RING_TRBS, self.below_4g)?;

        let (id, input) = {
            let slot = self.slot(address)?;
            let mps = endpoint.max_packet_size() as u32;
            let context = 1 + dci;
            slot.set_add_flags(1 << 0 | 1 << dci);

            let slot_info = slot.input_read(SLOT_CONTEXT, 0);
            let entries = ((slot_info >> 27) as usize).max(dci) as u32;
            slot.input_write(SLOT_CONTEXT, 0, (slot_info & !(0x1F << 27)) | entries << 27);

            slot.input_clear(context);
            if base_type == endpoint_context::INTERRUPT_OUT {
                slot.input_write(context, 0, interval_exponent(slot.speed, endpoint.interval()) << 16);
            }
            slot.input_write(context, 1, endpoint_context::ERROR_COUNT | kind << 3 | mps << 16);
            let dequeue = ring.dequeue_pointer();
            slot.input_write(context, 2, dequeue as u32);
            slot.input_write(context, 3, (dequeue >> 32) as u32);
            let esit = if base_type == endpoint_context::INTERRUPT_OUT { mps } else { 0 };
            slot.input_write(context, 4, esit << 16 | mps);
            (slot.id, slot.input.phys())
        };

        if let Err(e) = self.command(Trb::command(trb_type::CONFIGURE_ENDPOINT, id, input)) {
            ring.free(&*self.platform);
            return Err(e);
        }
        log::debug!("[xhci] slot {}: endpoint context {} configured", id, dci);
        self.slot_mut(address)?.rings[dci] = Some(ring);
        Ok(dci)
    }

    /// Clear a halted endpoint and move its dequeue pointer past whatever
    /// was left of the failed TD.
    fn recover(&mut self, address: u8, dci: usize) {
        let Ok(slot) = self.slot(address) else {
            return;
        };
        let id = slot.id;
        let Some(dequeue) = slot.rings[dci].as_ref().map(Ring::dequeue_pointer) else {
            return;
        };
        let result = self
            .command(Trb::endpoint_command(trb_type::RESET_ENDPOINT, id, dci, 0))
            .and_then(|_| {
                self.command(Trb::endpoint_command(
                    trb_type::SET_TR_DEQUEUE_POINTER,
                    id,
                    dci,
                    dequeue,
                ))
            });
        if let Err(e) = result {
            log::warn!("[xhci] slot {}: endpoint {} recovery failed: {}", id, dci, e);
        }
    }

    /// Take a timed-out TD back from the controller: stop the endpoint,
    /// turn the TD into no-ops and move the dequeue pointer past it.
    fn abandon(&mut self, address: u8, dci: usize, pointers: &[u64]) {
        let Ok(id) = self.slot(address).map(|slot| slot.id) else {
            return;
        };
        if let Err(e) = self.command(Trb::endpoint_command(trb_type::STOP_ENDPOINT, id, dci, 0)) {
            log::warn!("[xhci] slot {}: endpoint {} did not stop: {}", id, dci, e);
        }

        let dequeue = {
            let Ok(slot) = self.slot_mut(address) else {
                return;
            };
            let Some(ring) = slot.rings[dci].as_mut() else {
                return;
            };
            for &pointer in pointers {
                ring.cancel(pointer);
            }
            ring.dequeue_pointer()
        };
        if let Err(e) = self.command(Trb::endpoint_command(
            trb_type::SET_TR_DEQUEUE_POINTER,
            id,
            dci,
            dequeue,
        )) {
            log::warn!("[xhci] slot {}: endpoint {} dequeue not moved: {}", id, dci, e);
        }

        // Late events for the abandoned TD must not match a later one.
        self.completions.retain(|e| {
            !(e.trb_type() == trb_type::TRANSFER_EVENT && e.slot_id() == id && e.endpoint_id() == dci)
        });
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Queue one TD on endpoint `dci` and wait for the controller to finish it.
    fn transfer(&mut self, address: u8, dci: usize, trbs: &[Trb]) -> Result<Trb, UsbError> {
        let (id, pointers) = {
            let slot = self.slot_mut(address)?;
            let id = slot.id;
            let ring = slot.rings[dci].as_mut().ok_or(UsbError::InvalidParameter)?;
            if trbs.len() >= ring.capacity() {
                return Err(UsbError::NoDescriptors);
            }
            let pointers: Vec<u64> = trbs.iter().map(|&trb| ring.push(trb)).collect();
            (id, pointers)
        };
        self.ring_doorbell(id, dci as u32);

        let event = match self
            .wait_event(|e| e.trb_type() == trb_type::TRANSFER_EVENT && pointers.contains(&e.param))
        {
            Ok(event) => event,
            Err(_) => {
                log::warn!("[xhci] slot {}: transfer on endpoint {} timed out", id, dci);
                self.abandon(address, dci, &pointers);
                return Err(UsbError::Timeout);
            }
        };

        let code = event.completion_code();
        if succeeded(code) {
            return Ok(event);
        }
        let error = decode(code);
        log::warn!("[xhci] slot {}: transfer on endpoint {} failed: {}", id, dci, error);
        if error == UsbError::Stall {
            self.recover(address, dci);
        }
        Err(error)
    }

    /// Normal TRBs for one TD, split at 64 KiB boundaries and chained.
    fn normal_trbs(buffer: u64, length: usize, is_in: bool) -> Vec<Trb> {
        let mut trbs = Vec::new();
        let mut offset = 0;
        while offset < length {
            let address = buffer + offset as u64;
            let room = TRB_MAX_BYTES - (address as usize & (TRB_MAX_BYTES - 1));
            let chunk = room.min(length - offset);
            let mut control = trb_type::NORMAL << ctrl::TYPE_SHIFT | ctrl::CHAIN;
            if is_in {
                control |= ctrl::SHORT_OK;
            }
            trbs.push(Trb {
                param: address,
                status: chunk as u32,
                control,
            });
            offset += chunk;
        }
        if let Some(last) = trbs.last_mut() {
            last.control = (last.control & !ctrl::CHAIN) | ctrl::IOC;
        }
        trbs
    }

    /// Bring a USB2 port out of reset; returns its status afterwards.
    fn reset_usb2_port(&mut self, port: u8) -> Result<u32, UsbError> {
        let offset = self.portsc(port);
        let status = self.regs.read32(offset);
        self.regs
            .write32(offset, (status & portsc::PRESERVE) | portsc::RESET);
        self.platform.sleep_ms(PORT_RESET_MS);
        wait_for(&*self.platform, RESET_CHANGE_BUDGET, || {
            self.regs.read32(offset) & portsc::RESET_CHANGE != 0
        })
        .map_err(|_| {
            log::warn!("[xhci] port {}: reset did not complete", port);
            UsbError::NotResponding
        })?;
        let status = self.regs.read32(offset);
        self.regs
            .write32(offset, (status & portsc::PRESERVE) | portsc::RESET_CHANGE);
        Ok(status)
    }

    #[cfg(test)]
    fn protocols(&self) -> &[u8] {
        &self.protocols
    }
}

impl HostControllerDriver for Xhci {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Xhci
    }

    fn root_ports(&self) -> u8 {
        self.ports
    }

    fn port_connected(&mut self, port: u8) -> bool {
        if port >= self.ports {
            return false;
        }
        let offset = self.portsc(port);
        let status = self.regs.read32(offset);
        if status & portsc::CONNECT_CHANGE != 0 {
            self.regs
                .write32(offset, (status & portsc::PRESERVE) | portsc::CONNECT_CHANGE);
        }
        status & portsc::CONNECTED != 0
    }

    /// USB3 ports train on their own and must already be enabled in U0; USB2
    /// ports are reset first. Then a slot is enabled and the device addressed.
    fn port_init(&mut self, port: u8, address: u8) -> Result<Speed, UsbError> {
        if port >= self.ports || address == 0 || address as usize >= MAX_ADDRESSES {
            return Err(UsbError::InvalidParameter);
        }
        let status = if self.protocols[port as usize] >= 3 {
            self.regs.read32(self.portsc(port))
        } else {
            self.reset_usb2_port(port)?
        };
        if status & portsc::ENABLED == 0
            || status & portsc::RESET != 0
            || status & portsc::LINK_STATE != 0
        {
            log::warn!("[xhci] port {} not enabled (status {:#x})", port, status);
            return Err(UsbError::NotResponding);
        }
        let speed = port_speed(status).ok_or(UsbError::NotResponding)?;

        let id = self.enable_slot()?;
        let slot = match self.address_device(id, port, speed) {
            Ok(slot) => slot,
            Err(e) => {
                if let Err(e) = self.command(Trb::command(trb_type::DISABLE_SLOT, id, 0)) {
                    log::warn!("[xhci] slot {} could not be disabled: {}", id, e);
                }
                return Err(e);
            }
        };
        if let Some(old) = self.slots[address as usize].replace(slot) {
            old.free(&*self.platform);
        }
        log::info!(
            "[xhci] port {}: {}-speed device in slot {} as address {}",
            port,
            speed,
            id,
            address
        );
        Ok(speed)
    }

    fn control_transfer(
        &mut self,
        target: DeviceTarget,
        max_packet_size: u16,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        if data.len() >= TRB_MAX_BYTES {
            return Err(UsbError::InvalidParameter);
        }
        let address = target.address;
        self.slot(address)?;
        if let Err(e) = self.update_max_packet0(address, max_packet_size) {
            log::warn!("[xhci] address {}: EP0 packet size not updated: {}", address, e);
        }
        let packet = self.slot(address)?.max_packet0.max(1) as usize;

        let device_to_host = setup.is_device_to_host();
        let bounce = if data.is_empty() {
            None
        } else {
            Some(self.alloc(data.len(), 64)?)
        };

        let stage = match (&bounce, device_to_host) {
            (None, _) => transfer_type::NO_DATA,
            (Some(_), false) => transfer_type::OUT,
            (Some(_), true) => transfer_type::IN,
        };
        let mut trbs = Vec::with_capacity(data.len().div_ceil(packet) + 2);
        trbs.push(Trb {
            param: u64::from_le_bytes(setup.to_bytes()),
            status: 8,
            control: trb_type::SETUP_STAGE << ctrl::TYPE_SHIFT
                | ctrl::IMMEDIATE
                | stage << ctrl::TRANSFER_TYPE_SHIFT,
        });
        if let Some(buffer) = &bounce {
            if !device_to_host {
                buffer.write_bytes(0, data);
            }
            // One TRB per packet: a Data Stage TRB, then chained Normal TRBs.
            let direction = if device_to_host { ctrl::DIR_IN } else { 0 };
            let packets = data.len().div_ceil(packet);
            for (index, offset) in (0..data.len()).step_by(packet).enumerate() {
                let mut control = if index == 0 {
                    trb_type::DATA_STAGE << ctrl::TYPE_SHIFT | direction
                } else {
                    trb_type::NORMAL << ctrl::TYPE_SHIFT
                };
                if index + 1 < packets {
                    control |= ctrl::CHAIN;
                }
                trbs.push(Trb {
                    param: buffer.phys_at(offset),
                    status: packet.min(data.len() - offset) as u32,
                    control,
                });
            }
        }
        // Status runs opposite to the data stage, IN when there is none.
        let status_direction = if bounce.is_some() && device_to_host {
            0
        } else {
            ctrl::DIR_IN
        };
        trbs.push(Trb {
            param: 0,
            status: 0,
            control: trb_type::STATUS_STAGE << ctrl::TYPE_SHIFT | ctrl::IOC | status_direction,
        });

        let result = self.transfer(address, EP0, &trbs);
        if let Some(buffer) = bounce {
            if result.is_ok() && device_to_host {
                buffer.read_bytes(0, data);
            }
            self.platform.free_dma(buffer);
        }
        result.map(|_| ())
    }

    fn bulk_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        if data.is_empty() {
            return Ok(());
        }
        let dci = self.endpoint_ring(target.address, endpoint)?;
        let bounce = self.alloc(data.len(), 64)?;
        if !endpoint.is_in() {
            bounce.write_bytes(0, data);
        }
        let trbs = Self::normal_trbs(bounce.phys(), data.len(), endpoint.is_in());
        let result = self.transfer(target.address, dci, &trbs);
        if result.is_ok() && endpoint.is_in() {
            bounce.read_bytes(0, data);
        }
        self.platform.free_dma(bounce);
        result.map(|_| ())
    }

    fn interrupt_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        length: usize,
    ) -> Result<TransferHandle, UsbError> {
        if length >= TRB_MAX_BYTES {
            return Err(UsbError::InvalidParameter);
        }
        let address = target.address;
        let dci = self.endpoint_ring(address, endpoint)?;
        if self.slot(address)?.interrupts[dci].is_some() {
            return Err(UsbError::NotFinished);
        }
        let bounce = self.alloc(length.max(1), 64)?;
        let mut control = trb_type::NORMAL << ctrl::TYPE_SHIFT | ctrl::IOC;
        if endpoint.is_in() {
            control |= ctrl::SHORT_OK;
        }
        let trb = Trb {
            param: bounce.phys(),
            status: length as u32,
            control,
        };

        let (id, pointer) = {
            let slot = self.slot_mut(address)?;
            let pointer = slot.rings[dci].as_mut().map(|ring| ring.push(trb));
            slot.interrupts[dci] = pointer;
            (slot.id, pointer)
        };
        if pointer.is_none() {
            self.platform.free_dma(bounce);
            return Err(UsbError::InvalidParameter);
        }
        self.ring_doorbell(id, dci as u32);
        Ok(TransferHandle::new(
            (address as usize) << 8 | dci,
            Some(bounce),
            length,
        ))
    }

    fn check_transfer_status(&mut self, handle: &mut TransferHandle, data: &mut [u8]) -> TransferStatus {
        let address = (handle.slot >> 8) as u8;
        let dci = handle.slot & 0xFF;
        let pending = self
            .slot(address)
            .ok()
            .and_then(|slot| slot.interrupts.get(dci).copied().flatten());
        let Some(pointer) = pending else {
            return TransferStatus::Failed(UsbError::InvalidParameter);
        };
        let Some(event) =
            self.take_event(|e| e.trb_type() == trb_type::TRANSFER_EVENT && e.param == pointer)
        else {
            return TransferStatus::NotFinished;
        };
        if let Ok(slot) = self.slot_mut(address) {
            slot.interrupts[dci] = None;
        }

        let code = event.completion_code();
        if !succeeded(code) {
            let error = decode(code);
            if error == UsbError::Stall {
                self.recover(address, dci);
            }
            return TransferStatus::Failed(error);
        }
        if let Some(buffer) = &handle.buffer {
            let n = handle.length.min(data.len());
            buffer.read_bytes(0, &mut data[..n]);
        }
        TransferStatus::Success
    }
}
