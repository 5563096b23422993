//! OHCI (USB 1.1) host controller driver.
//!
//! Three endpoint descriptor (ED) lists are kept: control and bulk, whose
//! heads live in controller registers, and a periodic list that every slot
//! of the HCCA interrupt table points at. EDs are bound to an
//! (address, endpoint) pair the first time it is used and stay bound. A
//! transfer hangs a chain of general TDs on its ED, terminated by an empty
//! dummy TD that the ED tail points at; the controller is done when the ED
//! head catches up with the tail, and sets the head's halted bit on error.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::controller::{
    ControllerKind, DeviceTarget, Endpoint, HostControllerDriver, SlotPool, Speed, TransferHandle,
    DEFAULT_MAX_PACKET_SIZE,
};
use super::descriptors::SetupPacket;
use super::{TransferStatus, UsbError};
use crate::config::PollBudget;
use crate::hal::{alloc_dma32, wait_for, DmaArray, DmaBuffer, Platform, RegisterBlock};

// =============================================================================
// Registers
// =============================================================================

mod reg {
    pub const REVISION: usize = 0x00;
    pub const CONTROL: usize = 0x04;
    pub const COMMAND_STATUS: usize = 0x08;
    pub const INTERRUPT_STATUS: usize = 0x0C;
    pub const INTERRUPT_DISABLE: usize = 0x14;
    pub const HCCA: usize = 0x18;
    pub const CONTROL_HEAD_ED: usize = 0x20;
    pub const CONTROL_CURRENT_ED: usize = 0x24;
    pub const BULK_HEAD_ED: usize = 0x28;
    pub const BULK_CURRENT_ED: usize = 0x2C;
    pub const FM_INTERVAL: usize = 0x34;
    pub const PERIODIC_START: usize = 0x40;
    pub const RH_DESCRIPTOR_A: usize = 0x48;
    pub const RH_PORT_STATUS: usize = 0x54;
}

mod control {
    pub const PERIODIC_LIST_ENABLE: u32 = 1 << 2;
    pub const CONTROL_LIST_ENABLE: u32 = 1 << 4;
    pub const BULK_LIST_ENABLE: u32 = 1 << 5;
    pub const FUNCTIONAL_STATE: u32 = 3 << 6;
    pub const STATE_RESET: u32 = 0 << 6;
    pub const STATE_RESUME: u32 = 1 << 6;
    pub const STATE_OPERATIONAL: u32 = 2 << 6;
    /// Interrupts routed to SMM: firmware still owns the controller.
    pub const INTERRUPT_ROUTING: u32 = 1 << 8;
}

mod command {
    pub const RESET: u32 = 1 << 0;
    pub const CONTROL_LIST_FILLED: u32 = 1 << 1;
    pub const BULK_LIST_FILLED: u32 = 1 << 2;
    pub const OWNERSHIP_CHANGE_REQUEST: u32 = 1 << 3;
}

const INTERRUPTS_ALL: u32 = 0xC000_007F;
const REVISION_1_0: u32 = 0x10;
const FRAME_INTERVAL_MASK: u32 = 0x3FFF;
const PORT_COUNT_MASK: u32 = 0xFF;
const MAX_PORTS: u8 = 15;

/// HcRhPortStatus: reads report state, writes are one-shot commands.
mod port {
    pub const CONNECTED: u32 = 1 << 0;
    pub const ENABLED: u32 = 1 << 1;
    pub const SET_ENABLE: u32 = 1 << 1;
    pub const SET_RESET: u32 = 1 << 4;
    pub const LOW_SPEED: u32 = 1 << 9;
    pub const CONNECT_CHANGE: u32 = 1 << 16;
    pub const ENABLE_CHANGE: u32 = 1 << 17;
    pub const RESET_CHANGE: u32 = 1 << 20;
}

// =============================================================================
// Descriptors
// =============================================================================

mod ed_flags {
    pub const ENDPOINT_SHIFT: u32 = 7;
    pub const LOW_SPEED: u32 = 1 << 13;
    pub const SKIP: u32 = 1 << 14;
    pub const MAX_PACKET_SHIFT: u32 = 16;
}

const ED_FLAGS: usize = 0;
const ED_TAIL: usize = 4;
const ED_HEAD: usize = 8;
const ED_NEXT: usize = 12;
const ED_SIZE: usize = 16;
const ED_HEAD_HALTED: u32 = 1 << 0;
const POINTER_MASK: u32 = !0xF;

mod td_flags {
    pub const ROUNDING: u32 = 1 << 18;
    pub const PID_SETUP: u32 = 0 << 19;
    pub const PID_OUT: u32 = 1 << 19;
    pub const PID_IN: u32 = 2 << 19;
    pub const NO_INTERRUPT: u32 = 7 << 21;
    /// Toggle taken from the TD rather than the ED carry.
    pub const TOGGLE_FROM_TD: u32 = 2 << 24;
    pub const TOGGLE_SHIFT: u32 = 24;
    pub const CONDITION_SHIFT: u32 = 28;
}

const TD_FLAGS: usize = 0;
const TD_BUFFER: usize = 4;
const TD_NEXT: usize = 8;
const TD_BUFFER_END: usize = 12;
const TD_SIZE: usize = 16;

mod condition {
    pub const NO_ERROR: u32 = 0x0;
    pub const CRC: u32 = 0x1;
    pub const BIT_STUFFING: u32 = 0x2;
    pub const TOGGLE_MISMATCH: u32 = 0x3;
    pub const STALL: u32 = 0x4;
    pub const NOT_RESPONDING: u32 = 0x5;
    pub const PID_CHECK: u32 = 0x6;
    pub const UNEXPECTED_PID: u32 = 0x7;
    pub const DATA_OVERRUN: u32 = 0x8;
    pub const DATA_UNDERRUN: u32 = 0x9;
    pub const BUFFER_OVERRUN: u32 = 0xC;
    pub const BUFFER_UNDERRUN: u32 = 0xD;
    pub const NOT_ACCESSED: u32 = 0xF;
}

const HCCA_SIZE: usize = 256;
const HCCA_INTERRUPT_SLOTS: usize = 32;
const CONTROL_EDS: usize = 128;
const BULK_EDS: usize = 128;
const PERIODIC_EDS: usize = 32;
const TD_COUNT: usize = 512;
const HANDOFF_BUDGET: PollBudget = PollBudget::new(10, 1);
const RESET_MS: u32 = 50;
const SETTLE_MS: u32 = 10;

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Control,
    Bulk,
    Periodic,
}

/// EDs of one list plus who owns each of them.
struct EdList {
    eds: DmaArray,
    owners: Vec<Option<(u8, u8)>>,
    /// TDs hanging on each ED (dummy tail last) while a transfer runs.
    chains: Vec<Option<Vec<usize>>>,
}

impl EdList {
    fn new(platform: &dyn Platform, count: usize) -> Result<Self, UsbError> {
        let eds = DmaArray::new(platform, count, ED_SIZE, 16, true)?;
        for i in 0..count {
            eds.write32(i, ED_FLAGS, ed_flags::SKIP);
        }
        Ok(EdList {
            eds,
            owners: alloc::vec![None; count],
            chains: (0..count).map(|_| None).collect(),
        })
    }

    /// ED bound to `key`, binding the first free one if needed.
    fn bind(&mut self, key: (u8, u8)) -> Result<usize, UsbError> {
        if let Some(i) = self.owners.iter().position(|o| *o == Some(key)) {
            return Ok(i);
        }
        let i = self
            .owners
            .iter()
            .position(Option::is_none)
            .ok_or(UsbError::NoDescriptors)?;
        self.owners[i] = Some(key);
        if i > 0 {
            self.eds.write32(i - 1, ED_NEXT, self.eds.phys(i) as u32);
        }
        Ok(i)
    }
}

#[derive(Debug, Clone, Copy)]
struct Packet {
    pid: u32,
    toggle: bool,
    buffer: u64,
    length: usize,
}

pub struct Ohci {
    regs: Box<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    budget: PollBudget,
    ports: u8,
    /// Read only by the controller.
    _hcca: DmaBuffer,
    lists: [EdList; 3],
    tds: DmaArray,
    td_pool: SlotPool,
}

impl Ohci {
    /// Take the controller from firmware, reset it and make it operational.
    pub fn new(
        regs: Box<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        budget: PollBudget,
    ) -> Result<Self, UsbError> {
        let revision = regs.read32(reg::REVISION) & 0xFF;
        if revision != REVISION_1_0 {
            log::warn!("[ohci] unsupported revision {:#x}", revision);
            return Err(UsbError::ControllerInit);
        }
        let ports = (regs.read32(reg::RH_DESCRIPTOR_A) & PORT_COUNT_MASK) as u8;
        if ports > MAX_PORTS {
            log::warn!("[ohci] implausible port count {}", ports);
            return Err(UsbError::ControllerInit);
        }

        let state = regs.read32(reg::CONTROL);
        if state & control::INTERRUPT_ROUTING != 0 {
            regs.write32(reg::COMMAND_STATUS, command::OWNERSHIP_CHANGE_REQUEST);
            wait_for(&*platform, HANDOFF_BUDGET, || {
                regs.read32(reg::CONTROL) & control::INTERRUPT_ROUTING == 0
            })
            .map_err(|_| {
                log::warn!("[ohci] SMM did not release the controller");
                UsbError::ControllerInit
            })?;
        } else {
            match state & control::FUNCTIONAL_STATE {
                control::STATE_RESET => {
                    platform.sleep_ms(SETTLE_MS);
                }
                control::STATE_OPERATIONAL => {}
                _ => {
                    regs.write32(
                        reg::CONTROL,
                        (state & !control::FUNCTIONAL_STATE) | control::STATE_RESUME,
                    );
                    platform.sleep_ms(SETTLE_MS);
                }
            }
        }

        let hcca = alloc_dma32(&*platform, HCCA_SIZE, HCCA_SIZE)?;
        let lists = [
            EdList::new(&*platform, CONTROL_EDS)?,
            EdList::new(&*platform, BULK_EDS)?,
            EdList::new(&*platform, PERIODIC_EDS)?,
        ];
        let tds = DmaArray::new(&*platform, TD_COUNT, TD_SIZE, 16, true)?;
        let periodic_head = lists[List::Periodic as usize].eds.phys(0) as u32;
        for slot in 0..HCCA_INTERRUPT_SLOTS {
            hcca.write::<u32>(slot * 4, periodic_head);
        }

        // The reset clears FmInterval; restore what firmware programmed.
        let interval = regs.read32(reg::FM_INTERVAL);
        regs.write32(reg::COMMAND_STATUS, command::RESET);
        platform.sleep_ms(1);
        regs.write32(reg::FM_INTERVAL, interval);

        regs.write32(reg::CONTROL_HEAD_ED, lists[List::Control as usize].eds.phys(0) as u32);
        regs.write32(reg::CONTROL_CURRENT_ED, 0);
        regs.write32(reg::BULK_HEAD_ED, lists[List::Bulk as usize].eds.phys(0) as u32);
        regs.write32(reg::BULK_CURRENT_ED, 0);
        regs.write32(reg::HCCA, hcca.phys() as u32);

        regs.write32(reg::INTERRUPT_DISABLE, INTERRUPTS_ALL);
        regs.write32(reg::INTERRUPT_STATUS, INTERRUPTS_ALL);

        regs.write32(reg::PERIODIC_START, 9 * (interval & FRAME_INTERVAL_MASK) / 10);
        let state = regs.read32(reg::CONTROL) & !control::FUNCTIONAL_STATE;
        regs.write32(
            reg::CONTROL,
            state
                | control::CONTROL_LIST_ENABLE
                | control::BULK_LIST_ENABLE
                | control::PERIODIC_LIST_ENABLE
                | control::STATE_OPERATIONAL,
        );

        log::info!("[ohci] operational, {} root ports", ports);

        let mut ohci = Ohci {
            regs,
            platform,
            budget,
            ports,
            _hcca: hcca,
            lists,
            tds,
            td_pool: SlotPool::new(TD_COUNT),
        };
        // ED 0 of the control list belongs to the default address.
        ohci.lists[List::Control as usize].bind((0, 0))?;
        Ok(ohci)
    }

    fn port_register(port: u8) -> usize {
        reg::RH_PORT_STATUS + 4 * port as usize
    }

    fn list(&self, list: List) -> &EdList {
        &self.lists[list as usize]
    }

    /// Hang `packets` on the ED bound to the target endpoint and start it.
    fn queue(
        &mut self,
        list: List,
        target: DeviceTarget,
        endpoint: u8,
        max_packet_size: u16,
        packets: &[Packet],
    ) -> Result<usize, UsbError> {
        let ed = self.lists[list as usize].bind((target.address, endpoint))?;
        if self.list(list).chains[ed].is_some() {
            return Err(UsbError::InvalidParameter);
        }

        let mut chain = Vec::with_capacity(packets.len() + 1);
        for _ in 0..=packets.len() {
            match self.td_pool.alloc() {
                Ok(td) => chain.push(td),
                Err(e) => {
                    chain.iter().for_each(|td| self.td_pool.free(*td));
                    log::warn!("[ohci] out of transfer descriptors");
                    return Err(e);
                }
            }
        }

        let mut flags = target.address as u32
            | (endpoint as u32 & 0xF) << ed_flags::ENDPOINT_SHIFT
            | (max_packet_size as u32 & 0x7FF) << ed_flags::MAX_PACKET_SHIFT;
        if target.speed == Speed::Low {
            flags |= ed_flags::LOW_SPEED;
        }
        let eds = &self.lists[list as usize].eds;
        eds.write32(ed, ED_FLAGS, flags | ed_flags::SKIP);

        for (i, packet) in packets.iter().enumerate() {
            let td = chain[i];
            let mut td_flag = packet.pid
                | td_flags::NO_INTERRUPT
                | td_flags::TOGGLE_FROM_TD
                | (packet.toggle as u32) << td_flags::TOGGLE_SHIFT
                | condition::NOT_ACCESSED << td_flags::CONDITION_SHIFT;
            if packet.pid == td_flags::PID_IN {
                td_flag |= td_flags::ROUNDING;
            }
            let (start, end) = if packet.length > 0 {
                (packet.buffer as u32, (packet.buffer + packet.length as u64 - 1) as u32)
            } else {
                (0, 0)
            };
            self.tds.write32(td, TD_FLAGS, td_flag);
            self.tds.write32(td, TD_BUFFER, start);
            self.tds.write32(td, TD_NEXT, self.tds.phys(chain[i + 1]) as u32);
            self.tds.write32(td, TD_BUFFER_END, end);
        }
        let dummy = chain[packets.len()];
        self.tds.clear(dummy);

        eds.write32(ed, ED_TAIL, self.tds.phys(dummy) as u32);
        eds.write32(ed, ED_HEAD, self.tds.phys(chain[0]) as u32);
        eds.write32(ed, ED_FLAGS, flags);
        self.lists[list as usize].chains[ed] = Some(chain);

        match list {
            List::Control => self.regs.write32(reg::COMMAND_STATUS, command::CONTROL_LIST_FILLED),
            List::Bulk => self.regs.write32(reg::COMMAND_STATUS, command::BULK_LIST_FILLED),
            List::Periodic => {}
        }
        Ok(ed)
    }

    fn decode(code: u32) -> UsbError {
        match code {
            condition::CRC
            | condition::BIT_STUFFING
            | condition::TOGGLE_MISMATCH
            | condition::PID_CHECK => UsbError::CrcError,
            condition::STALL => UsbError::Stall,
            condition::NOT_RESPONDING => UsbError::NotResponding,
            condition::UNEXPECTED_PID => UsbError::Babble,
            condition::DATA_OVERRUN
            | condition::DATA_UNDERRUN
            | condition::BUFFER_OVERRUN
            | condition::BUFFER_UNDERRUN => UsbError::DataBuffer,
            _ => UsbError::NotFinished,
        }
    }

    /// First retired TD of the chain with a failing condition code.
    fn first_error(&self, list: List, ed: usize) -> Option<UsbError> {
        let chain = self.list(list).chains[ed].as_ref()?;
        chain[..chain.len() - 1].iter().find_map(|&td| {
            let code = self.tds.read32(td, TD_FLAGS) >> td_flags::CONDITION_SHIFT;
            match code {
                condition::NO_ERROR => None,
                // 0xE and 0xF both mean not accessed yet.
                c if c & 0xE == 0xE => None,
                c => Some(Self::decode(c)),
            }
        })
    }

    fn outcome(&self, list: List, ed: usize) -> Option<Result<(), UsbError>> {
        let eds = &self.list(list).eds;
        let head = eds.read32(ed, ED_HEAD);
        if head & ED_HEAD_HALTED != 0 {
            return Some(Err(self.first_error(list, ed).unwrap_or(UsbError::NotFinished)));
        }
        if head & POINTER_MASK == eds.read32(ed, ED_TAIL) & POINTER_MASK {
            return Some(self.first_error(list, ed).map_or(Ok(()), Err));
        }
        None
    }

    fn wait(&self, list: List, ed: usize) -> Result<(), UsbError> {
        let mut outcome = None;
        let waited = wait_for(&*self.platform, self.budget, || {
            outcome = self.outcome(list, ed);
            outcome.is_some()
        });
        match (waited, outcome) {
            (Ok(()), Some(result)) => result,
            _ => {
                let error = self.first_error(list, ed).unwrap_or(UsbError::Timeout);
                log::warn!("[ohci] {:?} transfer on ED {} failed: {}", list, ed, error);
                Err(error)
            }
        }
    }

    /// Park the ED and return its TDs to the pool.
    fn release(&mut self, list: List, ed: usize) {
        let eds = &self.lists[list as usize].eds;
        let flags = eds.read32(ed, ED_FLAGS);
        eds.write32(ed, ED_FLAGS, flags | ed_flags::SKIP);
        eds.write32(ed, ED_HEAD, 0);
        eds.write32(ed, ED_TAIL, 0);
        if let Some(chain) = self.lists[list as usize].chains[ed].take() {
            for td in chain {
                self.tds.clear(td);
                self.td_pool.free(td);
            }
        }
    }

    fn run(
        &mut self,
        list: List,
        target: DeviceTarget,
        endpoint: u8,
        max_packet_size: u16,
        packets: &[Packet],
    ) -> Result<(), UsbError> {
        let ed = self.queue(list, target, endpoint, max_packet_size, packets)?;
        let result = self.wait(list, ed);
        self.release(list, ed);
        result
    }

    fn data_packets(
        packets: &mut Vec<Packet>,
        pid: u32,
        mut toggle: bool,
        buffer: u64,
        length: usize,
        max_packet_size: usize,
    ) -> bool {
        let mut offset = 0;
        while offset < length {
            let chunk = max_packet_size.min(length - offset);
            packets.push(Packet {
                pid,
                toggle,
                buffer: buffer + offset as u64,
                length: chunk,
            });
            toggle = !toggle;
            offset += chunk;
        }
        toggle
    }

    #[cfg(test)]
    fn pools_idle(&self) -> bool {
        self.td_pool.in_use() == 0 && self.lists.iter().all(|l| l.chains.iter().all(Option::is_none))
    }
}

impl HostControllerDriver for Ohci {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Ohci
    }

    fn root_ports(&self) -> u8 {
        self.ports
    }

    fn port_connected(&mut self, port: u8) -> bool {
        let offset = Self::port_register(port);
        let status = self.regs.read32(offset);
        if status & port::CONNECT_CHANGE != 0 {
            self.regs.write32(offset, port::CONNECT_CHANGE);
        }
        status & port::CONNECTED != 0
    }

    fn port_speed(&mut self, port: u8) -> Option<Speed> {
        let status = self.regs.read32(Self::port_register(port));
        if status & port::CONNECTED == 0 {
            return None;
        }
        Some(if status & port::LOW_SPEED != 0 {
            Speed::Low
        } else {
            Speed::Full
        })
    }

    fn port_reset(&mut self, port: u8) -> Result<(), UsbError> {
        let offset = Self::port_register(port);
        self.regs.write32(offset, port::SET_RESET);
        self.platform.sleep_ms(RESET_MS);
        if self.regs.read32(offset) & port::RESET_CHANGE == 0 {
            return Err(UsbError::Timeout);
        }
        self.regs.write32(offset, port::RESET_CHANGE);

        self.regs.write32(offset, port::SET_ENABLE);
        self.platform.sleep_ms(SETTLE_MS);
        if self.regs.read32(offset) & port::ENABLED == 0 {
            return Err(UsbError::NotResponding);
        }
        self.regs.write32(offset, port::ENABLE_CHANGE);
        Ok(())
    }

    fn control_transfer(
        &mut self,
        target: DeviceTarget,
        max_packet_size: u16,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        let max_packet_size = match max_packet_size {
            0 => DEFAULT_MAX_PACKET_SIZE,
            n => n,
        };
        let device_to_host = setup.is_device_to_host();
        let (data_pid, status_pid) = if device_to_host {
            (td_flags::PID_IN, td_flags::PID_OUT)
        } else {
            (td_flags::PID_OUT, td_flags::PID_IN)
        };

        let bounce = alloc_dma32(&*self.platform, 8 + data.len(), 16)?;
        bounce.write_bytes(0, &setup.to_bytes());
        if !device_to_host {
            bounce.write_bytes(8, data);
        }

        let mut packets = Vec::with_capacity(2 + data.len().div_ceil(max_packet_size as usize));
        packets.push(Packet {
            pid: td_flags::PID_SETUP,
            toggle: false,
            buffer: bounce.phys(),
            length: 8,
        });
        Self::data_packets(
            &mut packets,
            data_pid,
            true,
            bounce.phys_at(8),
            data.len(),
            max_packet_size as usize,
        );
        packets.push(Packet {
            pid: status_pid,
            toggle: true,
            buffer: 0,
            length: 0,
        });

        let result = self.run(List::Control, target, 0, max_packet_size, &packets);
        if result.is_ok() && device_to_host {
            bounce.read_bytes(8, data);
        }
        self.platform.free_dma(bounce);
        result
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
        let pid = if endpoint.is_in() {
            td_flags::PID_IN
        } else {
            td_flags::PID_OUT
        };
        let max_packet_size = endpoint.max_packet_size().max(1);
        let bounce = alloc_dma32(&*self.platform, data.len(), 16)?;
        if !endpoint.is_in() {
            bounce.write_bytes(0, data);
        }

        let mut packets = Vec::new();
        let toggle = Self::data_packets(
            &mut packets,
            pid,
            endpoint.toggle,
            bounce.phys(),
            data.len(),
            max_packet_size as usize,
        );

        let result = self.run(List::Bulk, target, endpoint.number(), max_packet_size, &packets);
        if result.is_ok() {
            endpoint.toggle = toggle;
            if endpoint.is_in() {
                bounce.read_bytes(0, data);
            }
        }
        self.platform.free_dma(bounce);
        result
    }

    fn interrupt_transfer(
        &mut self,
        target: DeviceTarget,
        endpoint: &mut Endpoint,
        length: usize,
    ) -> Result<TransferHandle, UsbError> {
        let max_packet_size = endpoint.max_packet_size().max(1);
        let bounce = alloc_dma32(&*self.platform, length.max(1), 16)?;
        let mut packets = Vec::new();
        let toggle = Self::data_packets(
            &mut packets,
            td_flags::PID_IN,
            endpoint.toggle,
            bounce.phys(),
            length,
            max_packet_size as usize,
        );
        match self.queue(List::Periodic, target, endpoint.number(), max_packet_size, &packets) {
            Ok(ed) => Ok(TransferHandle::new(ed, Some(bounce), length).with_toggle(toggle)),
            Err(e) => {
                self.platform.free_dma(bounce);
                Err(e)
            }
        }
    }

    fn check_transfer_status(&mut self, handle: &mut TransferHandle, data: &mut [u8]) -> TransferStatus {
        let ed = handle.slot;
        let chains = &self.list(List::Periodic).chains;
        if chains.get(ed).map_or(true, Option::is_none) {
            return TransferStatus::Failed(UsbError::InvalidParameter);
        }
        let Some(result) = self.outcome(List::Periodic, ed) else {
            return TransferStatus::NotFinished;
        };
        if result.is_ok() {
            if let Some(buffer) = &handle.buffer {
                let n = handle.length.min(data.len());
                buffer.read_bytes(0, &mut data[..n]);
            }
        }
        self.release(List::Periodic, ed);
        result.into()
    }
}
