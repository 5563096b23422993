//! UHCI (USB 1.1) host controller driver.
//!
//! The controller is programmed through a small I/O register window. Every
//! entry of the 1024-slot frame list points at the first of a chain of queue
//! heads, so all queue heads are visited each frame. A transfer claims one
//! queue head and a run of transfer descriptors linked depth-first; the
//! controller advances the queue head's element pointer as descriptors
//! complete and leaves it parked on a descriptor that fails.

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
use crate::hal::{alloc_dma32, wait_for, DmaArray, Platform, RegisterBlock};

// =============================================================================
// Registers
// =============================================================================

mod reg {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x02;
    pub const USBINTR: usize = 0x04;
    pub const FRNUM: usize = 0x06;
    pub const FRBASEADD: usize = 0x08;
    pub const SOFMOD: usize = 0x0C;
    pub const PORTSC1: usize = 0x10;
}

mod cmd {
    pub const RUN: u16 = 1 << 0;
    pub const HCRESET: u16 = 1 << 1;
}

mod portsc {
    pub const CONNECTED: u16 = 1 << 0;
    pub const CONNECT_CHANGE: u16 = 1 << 1;
    pub const ENABLE: u16 = 1 << 2;
    pub const ENABLE_CHANGE: u16 = 1 << 3;
    pub const LOW_SPEED: u16 = 1 << 8;
    pub const RESET: u16 = 1 << 9;
}

/// Link pointer flags shared by frame list entries, queue heads and TDs.
mod link {
    pub const TERMINATE: u32 = 1 << 0;
    pub const QUEUE_HEAD: u32 = 1 << 1;
    pub const DEPTH_FIRST: u32 = 1 << 2;
    pub const ADDRESS_MASK: u32 = !0xF;
}

mod td_status {
    pub const BITSTUFF: u32 = 1 << 17;
    pub const CRC_TIMEOUT: u32 = 1 << 18;
    pub const NAK: u32 = 1 << 19;
    pub const BABBLE: u32 = 1 << 20;
    pub const DATA_BUFFER: u32 = 1 << 21;
    pub const STALLED: u32 = 1 << 22;
    pub const ACTIVE: u32 = 1 << 23;
    pub const LOW_SPEED: u32 = 1 << 26;
    /// Retry up to three times before giving up.
    pub const ERROR_LIMIT: u32 = 3 << 27;
    pub const ACTUAL_LENGTH: u32 = 0x7FF;
}

/// 8-bit packet identifier: 4-bit code plus its complement in the high nibble.
const fn pid(code: u8) -> u8 {
    (code & 0x0F) | (!code << 4)
}

mod token {
    use super::pid;

    pub const PID_OUT: u8 = pid(0x1);
    pub const PID_IN: u8 = pid(0x9);
    pub const PID_SETUP: u8 = pid(0xD);
    pub const ADDRESS_SHIFT: u32 = 8;
    pub const ENDPOINT_SHIFT: u32 = 15;
    pub const TOGGLE_SHIFT: u32 = 19;
    pub const MAX_LENGTH_SHIFT: u32 = 21;
}

// TD layout (16 bytes, 16-byte aligned).
const TD_LINK: usize = 0;
const TD_STATUS: usize = 4;
const TD_TOKEN: usize = 8;
const TD_BUFFER: usize = 12;
const TD_SIZE: usize = 16;

// Queue head layout (8 bytes used, 16-byte stride).
const QH_HEAD: usize = 0;
const QH_ELEMENT: usize = 4;
const QH_SIZE: usize = 16;

const FRAME_COUNT: usize = 1024;
const TD_COUNT: usize = 256;
const QH_COUNT: usize = 32;
const PORT_COUNT: u8 = 2;
const RESET_MS: u32 = 50;
const PORT_SETTLE_MS: u32 = 10;
/// 1 ms frames.
const SOF_MODIFY: u8 = 64;

// =============================================================================
// Driver
// =============================================================================

/// One packet of a transfer before it is written into a TD.
#[derive(Debug, Clone, Copy)]
struct Packet {
    pid: u8,
    toggle: bool,
    buffer: u64,
    length: usize,
}

pub struct Uhci {
    regs: Box<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    budget: PollBudget,
    /// Read only by the controller.
    _frame_list: DmaArray,
    qhs: DmaArray,
    tds: DmaArray,
    qh_pool: SlotPool,
    td_pool: SlotPool,
    /// TDs owned by each queue head while a transfer is in flight.
    queued: Vec<Option<Vec<usize>>>,
}

impl Uhci {
    /// Reset the controller, build the schedule and start it.
    pub fn new(
        regs: Box<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        budget: PollBudget,
    ) -> Result<Self, UsbError> {
        regs.write16(reg::USBCMD, cmd::HCRESET);
        platform.sleep_ms(RESET_MS);
        regs.write16(reg::USBCMD, 0);

        let frame_list = DmaArray::new(&*platform, FRAME_COUNT, 4, 4096, true)?;
        let qhs = DmaArray::new(&*platform, QH_COUNT, QH_SIZE, 16, true)?;
        let tds = DmaArray::new(&*platform, TD_COUNT, TD_SIZE, 16, true)?;

        for i in 0..QH_COUNT {
            let head = if i + 1 < QH_COUNT {
                qhs.phys(i + 1) as u32 | link::QUEUE_HEAD
            } else {
                link::TERMINATE
            };
            qhs.write32(i, QH_HEAD, head);
            qhs.write32(i, QH_ELEMENT, link::TERMINATE);
        }
        let first = qhs.phys(0) as u32 | link::QUEUE_HEAD;
        for frame in 0..FRAME_COUNT {
            frame_list.write32(frame, 0, first);
        }

        regs.write16(reg::USBINTR, 0);
        regs.write8(reg::SOFMOD, SOF_MODIFY);
        regs.write32(reg::FRBASEADD, frame_list.phys(0) as u32);
        regs.write16(reg::FRNUM, 0);
        regs.write16(reg::USBSTS, 0xFFFF);
        regs.write16(reg::USBCMD, cmd::RUN);

        log::info!("[uhci] running, frame list at {:#x}", frame_list.phys(0));

        Ok(Uhci {
            regs,
            platform,
            budget,
            _frame_list: frame_list,
            qhs,
            tds,
            qh_pool: SlotPool::new(QH_COUNT),
            td_pool: SlotPool::new(TD_COUNT),
            queued: (0..QH_COUNT).map(|_| None).collect(),
        })
    }

    fn portsc(port: u8) -> usize {
        reg::PORTSC1 + 2 * port as usize
    }

    /// Write a TD chain for `packets` and hang it on a free queue head.
    fn queue(&mut self, target: DeviceTarget, endpoint: u8, packets: &[Packet]) -> Result<usize, UsbError> {
        let mut chain = Vec::with_capacity(packets.len());
        for _ in packets {
            match self.td_pool.alloc() {
                Ok(td) => chain.push(td),
                Err(e) => {
                    chain.iter().for_each(|td| self.td_pool.free(*td));
                    log::warn!("[uhci] out of transfer descriptors");
                    return Err(e);
                }
            }
        }
        let qh = match self.qh_pool.alloc() {
            Ok(qh) => qh,
            Err(e) => {
                chain.iter().for_each(|td| self.td_pool.free(*td));
                log::warn!("[uhci] out of queue heads");
                return Err(e);
            }
        };

        let mut status = td_status::ACTIVE | td_status::ERROR_LIMIT;
        if target.speed == Speed::Low {
            status |= td_status::LOW_SPEED;
        }
        for (i, packet) in packets.iter().enumerate() {
            let td = chain[i];
            let next = match chain.get(i + 1) {
                Some(next) => self.tds.phys(*next) as u32 | link::DEPTH_FIRST,
                None => link::TERMINATE,
            };
            let max_length = (packet.length as u32).wrapping_sub(1) & td_status::ACTUAL_LENGTH;
            let token = packet.pid as u32
                | (target.address as u32) << token::ADDRESS_SHIFT
                | (endpoint as u32 & 0xF) << token::ENDPOINT_SHIFT
                | (packet.toggle as u32) << token::TOGGLE_SHIFT
                | max_length << token::MAX_LENGTH_SHIFT;
            self.tds.write32(td, TD_LINK, next);
            self.tds.write32(td, TD_STATUS, status);
            self.tds.write32(td, TD_TOKEN, token);
            self.tds.write32(td, TD_BUFFER, packet.buffer as u32);
        }

        self.qhs.write32(qh, QH_ELEMENT, self.tds.phys(chain[0]) as u32);
        self.queued[qh] = Some(chain);
        Ok(qh)
    }

    fn decode(status: u32) -> Option<UsbError> {
        if status & td_status::BABBLE != 0 {
            Some(UsbError::Babble)
        } else if status & td_status::DATA_BUFFER != 0 {
            Some(UsbError::DataBuffer)
        } else if status & td_status::BITSTUFF != 0 {
            Some(UsbError::CrcError)
        } else if status & td_status::CRC_TIMEOUT != 0 {
            Some(UsbError::NotResponding)
        } else if status & td_status::STALLED != 0 {
            Some(UsbError::Stall)
        } else if status & td_status::NAK != 0 {
            Some(UsbError::NotFinished)
        } else {
            None
        }
    }

    /// First retired TD of the queue head's chain that reports an error.
    fn first_error(&self, qh: usize) -> Option<UsbError> {
        self.queued[qh].as_ref()?.iter().find_map(|&td| {
            let status = self.tds.read32(td, TD_STATUS);
            if status & td_status::ACTIVE != 0 {
                None
            } else {
                Self::decode(status)
            }
        })
    }

    /// `None` while the controller is still working on the queue head.
    fn outcome(&self, qh: usize) -> Option<Result<(), UsbError>> {
        let element = self.qhs.read32(qh, QH_ELEMENT);
        if element & link::TERMINATE != 0 {
            return Some(self.first_error(qh).map_or(Ok(()), Err));
        }
        let td = self.tds.index_of((element & link::ADDRESS_MASK) as u64)?;
        let status = self.tds.read32(td, TD_STATUS);
        if status & td_status::ACTIVE != 0 {
            return None;
        }
        Self::decode(status).map(Err)
    }

    fn wait(&self, qh: usize) -> Result<(), UsbError> {
        let mut outcome = None;
        let waited = wait_for(&*self.platform, self.budget, || {
            outcome = self.outcome(qh);
            outcome.is_some()
        });
        match (waited, outcome) {
            (Ok(()), Some(result)) => result,
            _ => {
                let error = self.first_error(qh).unwrap_or(UsbError::Timeout);
                log::warn!("[uhci] transfer on queue head {} failed: {}", qh, error);
                Err(error)
            }
        }
    }

    /// Unhook the queue head and return it and its TDs to the pools.
    fn release(&mut self, qh: usize) {
        self.qhs.write32(qh, QH_ELEMENT, link::TERMINATE);
        if let Some(chain) = self.queued[qh].take() {
            for td in chain {
                self.tds.clear(td);
                self.td_pool.free(td);
            }
        }
        self.qh_pool.free(qh);
    }

    fn run(&mut self, target: DeviceTarget, endpoint: u8, packets: &[Packet]) -> Result<(), UsbError> {
        let qh = self.queue(target, endpoint, packets)?;
        let result = self.wait(qh);
        self.release(qh);
        result
    }

    /// Split `length` bytes at `buffer` into packets, flipping the toggle
    /// per packet. Returns the toggle for the packet after the last one.
    fn data_packets(
        packets: &mut Vec<Packet>,
        pid: u8,
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
        self.qh_pool.in_use() == 0 && self.td_pool.in_use() == 0
    }
}

impl HostControllerDriver for Uhci {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Uhci
    }

    fn root_ports(&self) -> u8 {
        PORT_COUNT
    }

    fn port_connected(&mut self, port: u8) -> bool {
        self.regs.read16(Self::portsc(port)) & portsc::CONNECTED != 0
    }

    fn port_speed(&mut self, port: u8) -> Option<Speed> {
        let status = self.regs.read16(Self::portsc(port));
        if status & portsc::CONNECTED == 0 {
            return None;
        }
        Some(if status & portsc::LOW_SPEED != 0 {
            Speed::Low
        } else {
            Speed::Full
        })
    }

    fn port_reset(&mut self, port: u8) -> Result<(), UsbError> {
        let offset = Self::portsc(port);
        // Change bits are write-1-to-clear; never write them back by accident.
        let keep = !(portsc::CONNECT_CHANGE | portsc::ENABLE_CHANGE);

        let status = self.regs.read16(offset) & keep;
        self.regs.write16(offset, status | portsc::RESET);
        self.platform.sleep_ms(RESET_MS);
        let status = self.regs.read16(offset) & keep;
        self.regs.write16(offset, status & !portsc::RESET);
        self.platform.sleep_ms(PORT_SETTLE_MS);
        let status = self.regs.read16(offset) & keep;
        self.regs.write16(offset, status | portsc::ENABLE);
        self.platform.sleep_ms(PORT_SETTLE_MS);
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
        } as usize;
        let device_to_host = setup.is_device_to_host();
        let (data_pid, status_pid) = if device_to_host {
            (token::PID_IN, token::PID_OUT)
        } else {
            (token::PID_OUT, token::PID_IN)
        };

        let bounce = alloc_dma32(&*self.platform, 8 + data.len(), 16)?;
        bounce.write_bytes(0, &setup.to_bytes());
        if !device_to_host {
            bounce.write_bytes(8, data);
        }

        let mut packets = Vec::with_capacity(2 + data.len().div_ceil(max_packet_size));
        packets.push(Packet {
            pid: token::PID_SETUP,
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
            max_packet_size,
        );
        packets.push(Packet {
            pid: status_pid,
            toggle: true,
            buffer: 0,
            length: 0,
        });

        let result = self.run(target, 0, &packets);
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
            token::PID_IN
        } else {
            token::PID_OUT
        };
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
            endpoint.max_packet_size().max(1) as usize,
        );

        let result = self.run(target, endpoint.number(), &packets);
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
        let bounce = alloc_dma32(&*self.platform, length.max(1), 16)?;
        let mut packets = Vec::new();
        let toggle = Self::data_packets(
            &mut packets,
            token::PID_IN,
            endpoint.toggle,
            bounce.phys(),
            length,
            endpoint.max_packet_size().max(1) as usize,
        );
        match self.queue(target, endpoint.number(), &packets) {
            Ok(qh) => Ok(TransferHandle::new(qh, Some(bounce), length).with_toggle(toggle)),
            Err(e) => {
                self.platform.free_dma(bounce);
                Err(e)
            }
        }
    }

    fn check_transfer_status(&mut self, handle: &mut TransferHandle, data: &mut [u8]) -> TransferStatus {
        let qh = handle.slot;
        if self.queued.get(qh).map_or(true, Option::is_none) {
            return TransferStatus::Failed(UsbError::InvalidParameter);
        }
        let Some(result) = self.outcome(qh) else {
            return TransferStatus::NotFinished;
        };
        if result.is_ok() {
            if let Some(buffer) = &handle.buffer {
                let n = handle.length.min(data.len());
                buffer.read_bytes(0, &mut data[..n]);
            }
        }
        self.release(qh);
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::controller::HostController;
    use crate::drivers::usb::descriptors::{request, request_type};
    use crate::drivers::usb::testing::{endpoint, FakeRegisters, TestPlatform};
    use spin::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Seen {
        qh: u64,
        pid: u8,
        toggle: bool,
        length: usize,
        low_speed: bool,
    }

    #[derive(Default)]
    struct Hardware {
        seen: Vec<Seen>,
        stall_pid: Option<u8>,
        in_data: Vec<u8>,
        in_offset: usize,
    }

    /// Walk the schedule the way the controller would and retire every TD.
    fn process(p: &TestPlatform, regs: &FakeRegisters, hw: &mut Hardware) {
        let base = regs.get32(reg::FRBASEADD) as u64;
        if base == 0 || regs.get16(reg::USBCMD) & cmd::RUN == 0 {
            return;
        }
        let mut qh_link = p.read32(base);
        while qh_link & link::TERMINATE == 0 {
            let qh = (qh_link & link::ADDRESS_MASK) as u64;
            loop {
                let element = p.read32(qh + QH_ELEMENT as u64);
                if element & link::TERMINATE != 0 {
                    break;
                }
                let td = (element & link::ADDRESS_MASK) as u64;
                let status = p.read32(td + TD_STATUS as u64);
                if status & td_status::ACTIVE == 0 {
                    break;
                }
                let tok = p.read32(td + TD_TOKEN as u64);
                let pid = tok as u8;
                let length = (((tok >> token::MAX_LENGTH_SHIFT) + 1) & 0x7FF) as usize;
                hw.seen.push(Seen {
                    qh,
                    pid,
                    toggle: tok & (1 << token::TOGGLE_SHIFT) != 0,
                    length,
                    low_speed: status & td_status::LOW_SPEED != 0,
                });
                if hw.stall_pid == Some(pid) {
                    p.write32(td + TD_STATUS as u64, (status & !td_status::ACTIVE) | td_status::STALLED);
                    break;
                }
                if pid == token::PID_IN && length > 0 {
                    let chunk: Vec<u8> = (0..length)
                        .map(|i| hw.in_data.get(hw.in_offset + i).copied().unwrap_or(0))
                        .collect();
                    p.write_bytes(p.read32(td + TD_BUFFER as u64) as u64, &chunk);
                    hw.in_offset += length;
                }
                let done = (status & !td_status::ACTIVE & !td_status::ACTUAL_LENGTH)
                    | (length as u32).wrapping_sub(1) & td_status::ACTUAL_LENGTH;
                p.write32(td + TD_STATUS as u64, done);
                p.write32(qh + QH_ELEMENT as u64, p.read32(td + TD_LINK as u64));
            }
            qh_link = p.read32(qh + QH_HEAD as u64);
        }
    }

    fn setup() -> (Uhci, FakeRegisters, Arc<TestPlatform>) {
        let regs = FakeRegisters::new(0x20);
        let platform = Arc::new(TestPlatform::new());
        let uhci = Uhci::new(Box::new(regs.clone()), platform.clone(), PollBudget::new(100, 1)).unwrap();
        (uhci, regs, platform)
    }

    fn attach(platform: &TestPlatform, regs: &FakeRegisters, hw: Hardware) -> Arc<Mutex<Hardware>> {
        let hw = Arc::new(Mutex::new(hw));
        let (regs, shared) = (regs.clone(), hw.clone());
        platform.set_hook(move |p| process(p, &regs, &mut shared.lock()));
        hw
    }

    const FULL: DeviceTarget = DeviceTarget::new(3, Speed::Full);

    fn get_descriptor(length: u16) -> SetupPacket {
        SetupPacket::new(request_type::DEVICE_TO_HOST, request::GET_DESCRIPTOR, 0x0100, 0, length)
    }

    #[test]
    fn test_init_builds_schedule_and_runs() {
        let (uhci, regs, platform) = setup();
        let frame_list = regs.get32(reg::FRBASEADD) as u64;
        assert_eq!(frame_list % 4096, 0);
        let first = uhci.qhs.phys(0) as u32 | link::QUEUE_HEAD;
        assert_eq!(platform.read32(frame_list), first);
        assert_eq!(platform.read32(frame_list + 4 * 1023), first);
        assert_eq!(uhci.qhs.read32(QH_COUNT - 1, QH_HEAD), link::TERMINATE);
        assert_eq!(regs.writes().first(), Some(&(reg::USBCMD, cmd::HCRESET as u32)));
        assert_eq!(regs.writes().last(), Some(&(reg::USBCMD, cmd::RUN as u32)));
    }

    #[test]
    fn test_control_without_data_has_setup_and_status() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(&platform, &regs, Hardware::default());
        let setup = SetupPacket::new(request_type::HOST_TO_DEVICE, request::SET_CONFIGURATION, 1, 0, 0);
        uhci.control_transfer(FULL, 8, &setup, &mut []).unwrap();

        let seen: Vec<_> = hw.lock().seen.iter().map(|s| (s.pid, s.toggle, s.length)).collect();
        assert_eq!(seen, [(token::PID_SETUP, false, 8), (token::PID_IN, true, 0)]);
        assert!(uhci.pools_idle());
    }

    #[test]
    fn test_control_in_splits_data_and_alternates_toggle() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(
            &platform,
            &regs,
            Hardware {
                in_data: (1..=20).collect(),
                ..Hardware::default()
            },
        );
        let mut data = [0u8; 20];
        uhci.control_transfer(FULL, 8, &get_descriptor(20), &mut data).unwrap();

        let seen: Vec<_> = hw.lock().seen.iter().map(|s| (s.pid, s.toggle, s.length)).collect();
        assert_eq!(
            seen,
            [
                (token::PID_SETUP, false, 8),
                (token::PID_IN, true, 8),
                (token::PID_IN, false, 8),
                (token::PID_IN, true, 4),
                (token::PID_OUT, true, 0),
            ]
        );
        assert_eq!(data[0], 1);
        assert_eq!(data[19], 20);
        // Only the schedule itself is still allocated.
        assert_eq!(platform.live_allocations(), 3);
    }

    #[test]
    fn test_zero_max_packet_size_uses_default() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(&platform, &regs, Hardware::default());
        let mut data = [0u8; 18];
        uhci.control_transfer(FULL, 0, &get_descriptor(18), &mut data).unwrap();
        assert_eq!(hw.lock().seen.len(), 2 + 3);
    }

    #[test]
    fn test_low_speed_target_marks_tds() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(&platform, &regs, Hardware::default());
        let target = DeviceTarget::new(1, Speed::Low);
        uhci.control_transfer(target, 8, &get_descriptor(8), &mut [0; 8]).unwrap();
        assert!(hw.lock().seen.iter().all(|s| s.low_speed));
    }

    #[test]
    fn test_stall_is_reported_and_descriptors_released() {
        let (mut uhci, regs, platform) = setup();
        attach(
            &platform,
            &regs,
            Hardware {
                stall_pid: Some(token::PID_IN),
                ..Hardware::default()
            },
        );
        let result = uhci.control_transfer(FULL, 8, &get_descriptor(8), &mut [0; 8]);
        assert_eq!(result, Err(UsbError::Stall));
        assert!(uhci.pools_idle());
    }

    #[test]
    fn test_timeout_recycles_queue_head() {
        let (mut uhci, regs, platform) = setup();
        let result = uhci.control_transfer(FULL, 8, &get_descriptor(8), &mut [0; 8]);
        assert_eq!(result, Err(UsbError::Timeout));
        assert!(uhci.pools_idle());

        let hw = attach(&platform, &regs, Hardware::default());
        uhci.control_transfer(FULL, 8, &get_descriptor(8), &mut [0; 8]).unwrap();
        assert!(hw.lock().seen.iter().all(|s| s.qh == uhci.qhs.phys(0)));
    }

    #[test]
    fn test_bulk_carries_toggle_across_calls() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(&platform, &regs, Hardware::default());
        let mut ep = Endpoint::new(endpoint(0x02, 2, 8, 0));
        uhci.bulk_transfer(FULL, &mut ep, &mut [0xAA; 20]).unwrap();
        assert!(ep.toggle);
        uhci.bulk_transfer(FULL, &mut ep, &mut [0xAA; 8]).unwrap();
        assert!(!ep.toggle);

        let seen: Vec<_> = hw.lock().seen.iter().map(|s| (s.pid, s.toggle)).collect();
        assert_eq!(
            seen,
            [
                (token::PID_OUT, false),
                (token::PID_OUT, true),
                (token::PID_OUT, false),
                (token::PID_OUT, true),
            ]
        );
    }

    #[test]
    fn test_interrupt_status_is_cached_once_finished() {
        let regs = FakeRegisters::new(0x20);
        let platform = Arc::new(TestPlatform::new());
        let uhci = Uhci::new(Box::new(regs.clone()), platform.clone(), PollBudget::new(100, 1)).unwrap();
        let mut hc = HostController::new(Box::new(uhci), platform.clone());

        let mut ep = Endpoint::new(endpoint(0x81, 3, 8, 10));
        let mut handle = hc.driver.interrupt_transfer(FULL, &mut ep, 8).unwrap();
        assert!(!ep.toggle);
        assert_eq!(handle.toggle, Some(true));
        let mut report = [0u8; 8];
        assert_eq!(hc.check_transfer_status(&mut handle, &mut report), TransferStatus::NotFinished);

        attach(
            &platform,
            &regs,
            Hardware {
                in_data: vec![0, 0, 0x04, 0, 0, 0, 0, 0],
                ..Hardware::default()
            },
        );
        platform.sleep_ms(1);
        assert_eq!(hc.check_transfer_status(&mut handle, &mut report), TransferStatus::Success);
        assert_eq!(report[2], 0x04);
        assert_eq!(hc.check_transfer_status(&mut handle, &mut report), TransferStatus::Success);
        assert!(handle.buffer.is_none());
    }

    #[test]
    fn test_failed_interrupt_poll_leaves_toggle() {
        let (mut uhci, regs, platform) = setup();
        let hw = attach(
            &platform,
            &regs,
            Hardware {
                stall_pid: Some(token::PID_IN),
                ..Hardware::default()
            },
        );
        let mut ep = Endpoint::new(endpoint(0x81, 3, 8, 10));
        let mut report = [0u8; 8];
        let mut handle = uhci.interrupt_transfer(FULL, &mut ep, 8).unwrap();
        platform.sleep_ms(1);
        assert_eq!(
            uhci.check_transfer_status(&mut handle, &mut report),
            TransferStatus::Failed(UsbError::Stall)
        );
        assert!(!ep.toggle);

        {
            let mut hw = hw.lock();
            hw.stall_pid = None;
            hw.in_data = vec![0, 0, 0x06, 0, 0, 0, 0, 0];
        }
        let mut handle = uhci.interrupt_transfer(FULL, &mut ep, 8).unwrap();
        platform.sleep_ms(1);
        assert_eq!(uhci.check_transfer_status(&mut handle, &mut report), TransferStatus::Success);
        assert_eq!(report[2], 0x06);
        assert_eq!(handle.toggle, Some(true));
        let toggles: Vec<bool> = hw.lock().seen.iter().map(|s| s.toggle).collect();
        assert_eq!(toggles, [false, false]);
    }

    #[test]
    fn test_port_reset_sequence_and_speed() {
        let (mut uhci, regs, _platform) = setup();
        let port = Uhci::portsc(1);
        regs.set16(port, portsc::CONNECTED | portsc::CONNECT_CHANGE | portsc::LOW_SPEED);
        assert!(uhci.port_connected(1));
        assert!(!uhci.port_connected(0));
        assert_eq!(uhci.port_speed(1), Some(Speed::Low));
        assert_eq!(uhci.port_speed(0), None);

        uhci.port_reset(1).unwrap();
        let writes: Vec<u32> = regs
            .writes()
            .into_iter()
            .filter(|(offset, _)| *offset == port)
            .map(|(_, value)| value)
            .collect();
        assert_eq!(writes.len(), 3);
        assert_ne!(writes[0] & portsc::RESET as u32, 0);
        assert_eq!(writes[1] & portsc::RESET as u32, 0);
        assert_ne!(writes[2] & portsc::ENABLE as u32, 0);
        assert!(writes.iter().all(|w| w & portsc::CONNECT_CHANGE as u32 == 0));
    }
}
