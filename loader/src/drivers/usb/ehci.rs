//! EHCI (USB 2.0) host controller driver.
//!
//! Control and bulk transfers run on the asynchronous schedule, a circular
//! list of queue heads hanging off a reserved head. Interrupt transfers run
//! on the periodic schedule: every frame list entry points at an anchor
//! queue head and interrupt queue heads are linked behind it, so each is
//! visited once per frame.
//!
//! Queue heads are bound to an (address, endpoint) pair on first use and
//! stay linked afterwards. A transfer is a chain of qTDs handed to the queue
//! head's overlay; the controller copies each qTD into the overlay while it
//! works on it and halts the queue head on an error.
//!
//! Low and full-speed devices behind a high-speed hub are reached through
//! split transactions addressed to the hub's transaction translator. Low and
//! full-speed devices on root ports belong to the companion controller.

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

/// Capability registers, at the start of the window.
mod cap {
    pub const CAPLENGTH: usize = 0x00;
    pub const HCIVERSION: usize = 0x02;
    pub const HCSPARAMS: usize = 0x04;
    pub const HCCPARAMS: usize = 0x08;

    pub const N_PORTS: u32 = 0xF;
    pub const ADDRESSING_64: u32 = 1 << 0;
}

/// Operational registers, relative to CAPLENGTH.
mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const USBINTR: usize = 0x08;
    pub const FRINDEX: usize = 0x0C;
    pub const CTRLDSSEGMENT: usize = 0x10;
    pub const PERIODICLISTBASE: usize = 0x14;
    pub const ASYNCLISTADDR: usize = 0x18;
    pub const CONFIGFLAG: usize = 0x40;
    pub const PORTSC: usize = 0x44;
}

mod cmd {
    pub const RUN: u32 = 1 << 0;
    pub const HCRESET: u32 = 1 << 1;
    pub const PERIODIC_ENABLE: u32 = 1 << 4;
    pub const ASYNC_ENABLE: u32 = 1 << 5;
}

mod sts {
    pub const HALTED: u32 = 1 << 12;
    /// Every write-1-to-clear interrupt bit.
    pub const ALL: u32 = 0x3F;
}

mod portsc {
    pub const CONNECTED: u32 = 1 << 0;
    pub const CONNECT_CHANGE: u32 = 1 << 1;
    pub const ENABLED: u32 = 1 << 2;
    pub const ENABLE_CHANGE: u32 = 1 << 3;
    pub const OVERCURRENT_CHANGE: u32 = 1 << 5;
    pub const RESET: u32 = 1 << 8;
    pub const LINE_STATUS: u32 = 3 << 10;
    /// D- high: a low-speed device.
    pub const LINE_K: u32 = 1 << 10;
    pub const OWNER: u32 = 1 << 13;

    pub const WRITE_CLEAR: u32 = CONNECT_CHANGE | ENABLE_CHANGE | OVERCURRENT_CHANGE;
}

/// Link pointer bits shared by frame list entries, queue heads and qTDs.
mod link {
    pub const TERMINATE: u32 = 1 << 0;
    pub const TYPE_QH: u32 = 1 << 1;
    pub const ADDRESS_MASK: u32 = !0x1F;
}

mod chars {
    pub const ENDPOINT_SHIFT: u32 = 8;
    pub const FULL_SPEED: u32 = 0 << 12;
    pub const LOW_SPEED: u32 = 1 << 12;
    pub const HIGH_SPEED: u32 = 2 << 12;
    /// Data toggle comes from each qTD.
    pub const TOGGLE_CONTROL: u32 = 1 << 14;
    /// Head of the asynchronous schedule.
    pub const HEAD: u32 = 1 << 15;
    pub const MAX_PACKET_SHIFT: u32 = 16;
    /// Control endpoint of a low/full-speed device.
    pub const CONTROL_ENDPOINT: u32 = 1 << 27;
}

mod caps {
    pub const START_MASK: u32 = 0x01;
    pub const COMPLETE_MASK: u32 = 0x1C << 8;
    pub const HUB_SHIFT: u32 = 16;
    pub const PORT_SHIFT: u32 = 23;
    pub const MULT_ONE: u32 = 1 << 30;
}

mod qtd_token {
    pub const MISSED_MICROFRAME: u32 = 1 << 2;
    pub const XACT_ERR: u32 = 1 << 3;
    pub const BABBLE: u32 = 1 << 4;
    pub const DATA_BUFFER: u32 = 1 << 5;
    pub const HALTED: u32 = 1 << 6;
    pub const ACTIVE: u32 = 1 << 7;
    pub const PID_OUT: u32 = 0 << 8;
    pub const PID_IN: u32 = 1 << 8;
    pub const PID_SETUP: u32 = 2 << 8;
    pub const ERROR_LIMIT: u32 = 3 << 10;
    pub const LENGTH_SHIFT: u32 = 16;
    pub const LENGTH_MASK: u32 = 0x7FFF;
    pub const TOGGLE: u32 = 1 << 31;
}

// qTD layout (32 bytes plus high buffer dwords, 32-byte aligned).
const QTD_NEXT: usize = 0;
const QTD_ALT: usize = 4;
const QTD_TOKEN: usize = 8;
const QTD_BUFFER: usize = 12;
const QTD_SIZE: usize = 64;

// Queue head layout: four dwords followed by a qTD-shaped overlay.
const QH_LINK: usize = 0;
const QH_CHARS: usize = 4;
const QH_CAPS: usize = 8;
const QH_CURRENT: usize = 12;
const QH_OVERLAY: usize = 16;
const QH_NEXT: usize = QH_OVERLAY + QTD_NEXT;
const QH_ALT: usize = QH_OVERLAY + QTD_ALT;
const QH_TOKEN: usize = QH_OVERLAY + QTD_TOKEN;
const QH_SIZE: usize = 96;

const FRAME_COUNT: usize = 1024;
const QH_COUNT: usize = 64;
const QTD_COUNT: usize = 256;
const PAGE: usize = 4096;
const BUFFER_PAGES: usize = 5;
/// Largest bulk chunk per qTD; keeps every chunk within five pages.
const QTD_MAX_BYTES: usize = 4 * PAGE;

const ASYNC_HEAD: usize = 0;
const PERIODIC_ANCHOR: usize = 1;
const FIRST_FREE_QH: usize = 2;

/// 16 micro-frames per check.
const HALT_BUDGET: PollBudget = PollBudget::new(16, 1);
const RESET_BUDGET: PollBudget = PollBudget::new(50, 1);
const PORT_RESET_MS: u32 = 50;
const PORT_RECOVERY_MS: u32 = 10;

const SUPPORTED_VERSION: u16 = 0x0100;

// =============================================================================
// Driver
// =============================================================================

/// What a queue head is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    address: u8,
    endpoint: u8,
    periodic: bool,
}

#[derive(Debug, Clone, Copy)]
struct Packet {
    pid: u32,
    toggle: bool,
    buffer: u64,
    length: usize,
}

pub struct Ehci {
    regs: Box<dyn RegisterBlock>,
    /// Offset of the operational registers.
    op_base: usize,
    platform: Arc<dyn Platform>,
    budget: PollBudget,
    ports: u8,
    /// Read only by the controller.
    _frame_list: DmaArray,
    qhs: DmaArray,
    qtds: DmaArray,
    bindings: Vec<Option<Binding>>,
    qtd_pool: SlotPool,
    /// qTDs owned by each queue head while a transfer is in flight.
    chains: Vec<Option<Vec<usize>>>,
}

impl Ehci {
    /// Halt and reset the controller, build both schedules, start it and
    /// route every port to it.
    pub fn new(
        regs: Box<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        budget: PollBudget,
    ) -> Result<Self, UsbError> {
        let version = regs.read16(cap::HCIVERSION);
        if version != SUPPORTED_VERSION {
            log::warn!("[ehci] unsupported interface version {:#x}", version);
            return Err(UsbError::ControllerInit);
        }
        let base = regs.read8(cap::CAPLENGTH) as usize;
        let ports = (regs.read32(cap::HCSPARAMS) & cap::N_PORTS) as u8;

        let command = regs.read32(base + op::USBCMD);
        regs.write32(base + op::USBCMD, command & !cmd::RUN);
        wait_for(&*platform, HALT_BUDGET, || {
            regs.read32(base + op::USBSTS) & sts::HALTED != 0
        })
        .map_err(|_| {
            log::warn!("[ehci] controller did not halt");
            UsbError::ControllerInit
        })?;

        regs.write32(base + op::USBCMD, cmd::HCRESET);
        wait_for(&*platform, RESET_BUDGET, || {
            regs.read32(base + op::USBCMD) & cmd::HCRESET == 0
        })
        .map_err(|_| {
            log::warn!("[ehci] reset did not complete");
            UsbError::ControllerInit
        })?;

        if regs.read32(cap::HCCPARAMS) & cap::ADDRESSING_64 != 0 {
            regs.write32(base + op::CTRLDSSEGMENT, 0);
        }
        regs.write32(base + op::USBINTR, 0);

        let frame_list = DmaArray::new(&*platform, FRAME_COUNT, 4, PAGE, true)?;
        let qhs = DmaArray::new(&*platform, QH_COUNT, QH_SIZE, 32, true)?;
        let qtds = DmaArray::new(&*platform, QTD_COUNT, QTD_SIZE, 32, true)?;

        for qh in 0..QH_COUNT {
            qhs.write32(qh, QH_LINK, link::TERMINATE);
            qhs.write32(qh, QH_NEXT, link::TERMINATE);
            qhs.write32(qh, QH_ALT, link::TERMINATE);
            qhs.write32(qh, QH_TOKEN, qtd_token::HALTED);
        }
        // The asynchronous schedule starts as the head pointing at itself.
        qhs.write32(ASYNC_HEAD, QH_LINK, qhs.phys(ASYNC_HEAD) as u32 | link::TYPE_QH);
        qhs.write32(ASYNC_HEAD, QH_CHARS, chars::HEAD);
        let anchor = qhs.phys(PERIODIC_ANCHOR) as u32 | link::TYPE_QH;
        for frame in 0..FRAME_COUNT {
            frame_list.write32(frame, 0, anchor);
        }

        regs.write32(base + op::PERIODICLISTBASE, frame_list.phys(0) as u32);
        regs.write32(base + op::ASYNCLISTADDR, qhs.phys(ASYNC_HEAD) as u32);
        regs.write32(base + op::FRINDEX, 0);
        regs.write32(base + op::USBSTS, sts::ALL);
        regs.write32(
            base + op::USBCMD,
            cmd::RUN | cmd::PERIODIC_ENABLE | cmd::ASYNC_ENABLE,
        );
        regs.write32(base + op::CONFIGFLAG, 1);

        log::info!("[ehci] running, {} ports", ports);

        let mut bindings = alloc::vec![None; QH_COUNT];
        // Reserved heads never carry transfers.
        let reserved = Binding {
            address: 0,
            endpoint: 0,
            periodic: true,
        };
        bindings[ASYNC_HEAD] = Some(reserved);
        bindings[PERIODIC_ANCHOR] = Some(reserved);

        Ok(Ehci {
            regs,
            op_base: base,
            platform,
            budget,
            ports,
            _frame_list: frame_list,
            qhs,
            qtds,
            bindings,
            qtd_pool: SlotPool::new(QTD_COUNT),
            chains: (0..QH_COUNT).map(|_| None).collect(),
        })
    }

    fn portsc(&self, port: u8) -> usize {
        self.op_base + op::PORTSC + 4 * port as usize
    }

    /// Port status with the write-1-to-clear bits masked, ready to write back.
    fn port_status(&self, port: u8) -> u32 {
        self.regs.read32(self.portsc(port)) & !portsc::WRITE_CLEAR
    }

    fn hand_to_companion(&self, port: u8) {
        log::debug!("[ehci] port {} handed to companion controller", port);
        let status = self.port_status(port);
        self.regs.write32(self.portsc(port), status | portsc::OWNER);
    }

    /// Queue head bound to `binding`, binding and linking a free one if needed.
    fn bind(&mut self, binding: Binding) -> Result<usize, UsbError> {
        if let Some(qh) = (FIRST_FREE_QH..QH_COUNT).find(|&qh| self.bindings[qh] == Some(binding)) {
            return Ok(qh);
        }
        let qh = (FIRST_FREE_QH..QH_COUNT)
            .find(|&qh| self.bindings[qh].is_none())
            .ok_or_else(|| {
                log::warn!("[ehci] out of queue heads");
                UsbError::NoDescriptors
            })?;

        let head = if binding.periodic {
            PERIODIC_ANCHOR
        } else {
            ASYNC_HEAD
        };
        self.qhs.write32(qh, QH_LINK, self.qhs.read32(head, QH_LINK));
        self.qhs.write32(head, QH_LINK, self.qhs.phys(qh) as u32 | link::TYPE_QH);
        self.bindings[qh] = Some(binding);
        Ok(qh)
    }

    /// Endpoint characteristics and capabilities for a queue head.
    fn characteristics(target: DeviceTarget, binding: Binding, max_packet_size: u16) -> (u32, u32) {
        let speed = match target.speed {
            Speed::Low => chars::LOW_SPEED,
            Speed::Full => chars::FULL_SPEED,
            _ => chars::HIGH_SPEED,
        };
        let mut characteristics = target.address as u32
            | (binding.endpoint as u32 & 0xF) << chars::ENDPOINT_SHIFT
            | speed
            | chars::TOGGLE_CONTROL
            | (max_packet_size as u32 & 0x7FF) << chars::MAX_PACKET_SHIFT;

        let mut capabilities = caps::MULT_ONE;
        if binding.periodic {
            capabilities |= caps::START_MASK;
        }
        if matches!(target.speed, Speed::Low | Speed::Full) {
            if binding.endpoint == 0 {
                characteristics |= chars::CONTROL_ENDPOINT;
            }
            if let Some((hub, port)) = target.translator {
                capabilities |=
                    (hub as u32) << caps::HUB_SHIFT | (port as u32) << caps::PORT_SHIFT;
                if binding.periodic {
                    capabilities |= caps::COMPLETE_MASK;
                }
            }
        }
        (characteristics, capabilities)
    }

    /// Write a qTD chain for `packets` and hand it to queue head `qh`.
    ///
    /// With `short_to_last` a short packet skips straight to the last qTD,
    /// which lets a control read finish with its status stage.
    fn submit(
        &mut self,
        qh: usize,
        target: DeviceTarget,
        max_packet_size: u16,
        packets: &[Packet],
        short_to_last: bool,
    ) -> Result<(), UsbError> {
        let Some(binding) = self.bindings[qh] else {
            return Err(UsbError::InvalidParameter);
        };
        if packets.is_empty() {
            return Err(UsbError::InvalidParameter);
        }
        let mut chain = Vec::with_capacity(packets.len());
        for _ in packets {
            match self.qtd_pool.alloc() {
                Ok(qtd) => chain.push(qtd),
                Err(e) => {
                    chain.iter().for_each(|qtd| self.qtd_pool.free(*qtd));
                    log::warn!("[ehci] out of transfer descriptors");
                    return Err(e);
                }
            }
        }

        let last = chain[chain.len() - 1];
        for (i, packet) in packets.iter().enumerate() {
            let qtd = chain[i];
            let next = match chain.get(i + 1) {
                Some(next) => self.qtds.phys(*next) as u32,
                None => link::TERMINATE,
            };
            let alt = if short_to_last && qtd != last {
                self.qtds.phys(last) as u32
            } else {
                link::TERMINATE
            };
            let mut token = qtd_token::ACTIVE
                | qtd_token::ERROR_LIMIT
                | packet.pid
                | (packet.length as u32 & qtd_token::LENGTH_MASK) << qtd_token::LENGTH_SHIFT;
            if packet.toggle {
                token |= qtd_token::TOGGLE;
            }
            self.qtds.write32(qtd, QTD_NEXT, next);
            self.qtds.write32(qtd, QTD_ALT, alt);
            self.qtds.write32(qtd, QTD_TOKEN, token);
            if packet.length > 0 {
                let page = packet.buffer & !(PAGE as u64 - 1);
                self.qtds.write32(qtd, QTD_BUFFER, packet.buffer as u32);
                for n in 1..BUFFER_PAGES {
                    self.qtds.write32(qtd, QTD_BUFFER + 4 * n, (page + (n * PAGE) as u64) as u32);
                }
            }
        }

        // The queue head is idle between transfers, so its endpoint fields
        // can follow the device (address 0 is shared by every new device).
        let (characteristics, capabilities) = Self::characteristics(target, binding, max_packet_size);
        self.qhs.write32(qh, QH_CHARS, characteristics);
        self.qhs.write32(qh, QH_CAPS, capabilities);
        self.qhs.write32(qh, QH_CURRENT, 0);
        for offset in (QH_OVERLAY..QH_SIZE).step_by(4).filter(|&offset| offset != QH_TOKEN) {
            self.qhs.write32(qh, offset, 0);
        }
        self.qhs.write32(qh, QH_ALT, link::TERMINATE);
        self.qhs.write32(qh, QH_NEXT, self.qtds.phys(chain[0]) as u32);
        self.chains[qh] = Some(chain);
        // Clearing halted starts the transfer.
        self.qhs.write32(qh, QH_TOKEN, 0);
        Ok(())
    }

    fn decode(token: u32) -> UsbError {
        if token & qtd_token::BABBLE != 0 {
            UsbError::Babble
        } else if token & qtd_token::DATA_BUFFER != 0 {
            UsbError::DataBuffer
        } else if token & (qtd_token::XACT_ERR | qtd_token::MISSED_MICROFRAME) != 0 {
            UsbError::CrcError
        } else if token & qtd_token::HALTED != 0 {
            UsbError::Stall
        } else {
            UsbError::NotFinished
        }
    }

    /// `None` while the controller is still working on the queue head.
    fn outcome(&self, qh: usize) -> Option<Result<(), UsbError>> {
        let chain = self.chains[qh].as_ref()?;
        if let Some(token) = chain
            .iter()
            .map(|&qtd| self.qtds.read32(qtd, QTD_TOKEN))
            .find(|token| token & qtd_token::HALTED != 0)
        {
            return Some(Err(Self::decode(token)));
        }
        let overlay = self.qhs.read32(qh, QH_TOKEN);
        if overlay & qtd_token::HALTED != 0 {
            return Some(Err(Self::decode(overlay)));
        }

        let last = *chain.last()?;
        if self.qtds.read32(last, QTD_TOKEN) & qtd_token::ACTIVE == 0 {
            return Some(Ok(()));
        }
        let drained = overlay & qtd_token::ACTIVE == 0
            && self.qhs.read32(qh, QH_NEXT) & link::TERMINATE != 0
            && (self.qhs.read32(qh, QH_CURRENT) & link::ADDRESS_MASK) as u64 == self.qtds.phys(last);
        drained.then_some(Ok(()))
    }

    fn wait(&self, qh: usize) -> Result<(), UsbError> {
        let mut outcome = None;
        let waited = wait_for(&*self.platform, self.budget, || {
            outcome = self.outcome(qh);
            outcome.is_some()
        });
        match (waited, outcome) {
            (Ok(()), Some(Ok(()))) => Ok(()),
            (Ok(()), Some(Err(error))) => {
                log::warn!("[ehci] transfer on queue head {} failed: {}", qh, error);
                Err(error)
            }
            _ => {
                log::warn!("[ehci] transfer on queue head {} timed out", qh);
                Err(UsbError::Timeout)
            }
        }
    }

    /// Halt the overlay so the controller skips the queue head, then return
    /// its qTDs to the pool. The queue head stays bound and linked.
    fn release(&mut self, qh: usize) {
        self.qhs.write32(qh, QH_TOKEN, qtd_token::HALTED);
        self.qhs.write32(qh, QH_NEXT, link::TERMINATE);
        self.qhs.write32(qh, QH_ALT, link::TERMINATE);
        if let Some(chain) = self.chains[qh].take() {
            for qtd in chain {
                self.qtds.clear(qtd);
                self.qtd_pool.free(qtd);
            }
        }
    }

    fn run(
        &mut self,
        qh: usize,
        target: DeviceTarget,
        max_packet_size: u16,
        packets: &[Packet],
        short_to_last: bool,
    ) -> Result<(), UsbError> {
        self.submit(qh, target, max_packet_size, packets, short_to_last)?;
        let result = self.wait(qh);
        self.release(qh);
        result
    }

    /// Split `length` bytes at `buffer` into qTD-sized chunks of whole
    /// packets. Returns the toggle for the packet after the last one.
    fn data_packets(
        packets: &mut Vec<Packet>,
        pid: u32,
        mut toggle: bool,
        buffer: u64,
        length: usize,
        chunk_size: usize,
        max_packet_size: usize,
    ) -> bool {
        let mut offset = 0;
        while offset < length {
            let chunk = chunk_size.min(length - offset);
            packets.push(Packet {
                pid,
                toggle,
                buffer: buffer + offset as u64,
                length: chunk,
            });
            if chunk.div_ceil(max_packet_size) % 2 == 1 {
                toggle = !toggle;
            }
            offset += chunk;
        }
        toggle
    }

    #[cfg(test)]
    fn pools_idle(&self) -> bool {
        self.qtd_pool.in_use() == 0 && self.chains.iter().all(Option::is_none)
    }
}

impl HostControllerDriver for Ehci {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Ehci
    }

    fn root_ports(&self) -> u8 {
        self.ports
    }

    fn port_connected(&mut self, port: u8) -> bool {
        if port >= self.ports {
            return false;
        }
        let raw = self.regs.read32(self.portsc(port));
        if raw & portsc::CONNECT_CHANGE != 0 {
            self.regs
                .write32(self.portsc(port), (raw & !portsc::WRITE_CLEAR) | portsc::CONNECT_CHANGE);
        }
        raw & portsc::CONNECTED != 0
    }

    fn port_speed(&mut self, port: u8) -> Option<Speed> {
        if port >= self.ports {
            return None;
        }
        let status = self.port_status(port);
        if status & portsc::OWNER != 0 || status & portsc::CONNECTED == 0 {
            return None;
        }
        if status & portsc::ENABLED == 0 && status & portsc::LINE_STATUS == portsc::LINE_K {
            self.hand_to_companion(port);
            return None;
        }
        Some(Speed::High)
    }

    fn port_reset(&mut self, port: u8) -> Result<(), UsbError> {
        if port >= self.ports {
            return Err(UsbError::InvalidParameter);
        }
        let offset = self.portsc(port);
        let status = self.port_status(port);
        self.regs.write32(offset, status & !portsc::ENABLED);
        let status = self.port_status(port);
        self.regs.write32(offset, (status & !portsc::ENABLED) | portsc::RESET);
        self.platform.sleep_ms(PORT_RESET_MS);
        let status = self.port_status(port);
        self.regs.write32(offset, status & !portsc::RESET);
        wait_for(&*self.platform, HALT_BUDGET, || {
            self.regs.read32(offset) & portsc::RESET == 0
        })?;
        self.platform.sleep_ms(PORT_RECOVERY_MS);

        // A full-speed device never enables a high-speed port.
        if self.regs.read32(offset) & portsc::ENABLED == 0 {
            self.hand_to_companion(port);
            return Err(UsbError::NotResponding);
        }
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
        let qh = self.bind(Binding {
            address: target.address,
            endpoint: 0,
            periodic: false,
        })?;
        let device_to_host = setup.is_device_to_host();
        let (data_pid, status_pid) = if device_to_host {
            (qtd_token::PID_IN, qtd_token::PID_OUT)
        } else {
            (qtd_token::PID_OUT, qtd_token::PID_IN)
        };

        let bounce = alloc_dma32(&*self.platform, 8 + data.len(), 32)?;
        bounce.write_bytes(0, &setup.to_bytes());
        if !device_to_host {
            bounce.write_bytes(8, data);
        }

        let mps = max_packet_size as usize;
        let mut packets = Vec::with_capacity(2 + data.len().div_ceil(mps));
        packets.push(Packet {
            pid: qtd_token::PID_SETUP,
            toggle: false,
            buffer: bounce.phys(),
            length: 8,
        });
        Self::data_packets(&mut packets, data_pid, true, bounce.phys_at(8), data.len(), mps, mps);
        packets.push(Packet {
            pid: status_pid,
            toggle: true,
            buffer: 0,
            length: 0,
        });

        let result = self.run(qh, target, max_packet_size, &packets, device_to_host);
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
        let qh = self.bind(Binding {
            address: target.address,
            endpoint: endpoint.number(),
            periodic: false,
        })?;
        let pid = if endpoint.is_in() {
            qtd_token::PID_IN
        } else {
            qtd_token::PID_OUT
        };
        let bounce = alloc_dma32(&*self.platform, data.len(), PAGE)?;
        if !endpoint.is_in() {
            bounce.write_bytes(0, data);
        }

        let mps = endpoint.max_packet_size().max(1) as usize;
        // A qTD holds five page pointers, so 16 KiB fits at any start
        // offset. Chunks stay whole packets so only the last can be short.
        let chunk = (QTD_MAX_BYTES / mps).max(1) * mps;
        let mut packets = Vec::new();
        let toggle = Self::data_packets(
            &mut packets,
            pid,
            endpoint.toggle,
            bounce.phys(),
            data.len(),
            chunk,
            mps,
        );

        let result = self.run(qh, target, mps as u16, &packets, false);
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
        let qh = self.bind(Binding {
            address: target.address,
            endpoint: endpoint.number(),
            periodic: true,
        })?;
        if self.chains[qh].is_some() {
            return Err(UsbError::NotFinished);
        }
        let bounce = alloc_dma32(&*self.platform, length.max(1), 32)?;
        let mps = endpoint.max_packet_size().max(1) as usize;
        let mut packets = Vec::new();
        let toggle = Self::data_packets(
            &mut packets,
            qtd_token::PID_IN,
            endpoint.toggle,
            bounce.phys(),
            length,
            length.max(1),
            mps,
        );
        match self.submit(qh, target, mps as u16, &packets, false) {
            Ok(()) => Ok(TransferHandle::new(qh, Some(bounce), length).with_toggle(toggle)),
            Err(e) => {
                self.platform.free_dma(bounce);
                Err(e)
            }
        }
    }

    fn check_transfer_status(&mut self, handle: &mut TransferHandle, data: &mut [u8]) -> TransferStatus {
        let qh = handle.slot;
        if self.chains.get(qh).map_or(true, Option::is_none) {
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
