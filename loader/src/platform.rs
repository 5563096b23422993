//! Boot environment services for the USB stack on x86_64.
//!
//! DMA memory comes from a `linked_list_allocator` heap over an
//! identity-mapped region, so virtual and bus addresses are the same.
//! Delays spin on the TSC, calibrated once against PIT channel 2.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::hal::{DmaBuffer, Platform};

// PIT (Programmable Interval Timer) ports for calibration
const PIT_CHANNEL2_PORT: u16 = 0x42;
const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_GATE_PORT: u16 = 0x61;

const PIT_FREQUENCY_HZ: u64 = 1_193_182;
const CALIBRATION_TICKS: u16 = 0x9f41;

/// Smallest block alignment the heap hands out.
const MIN_ALIGN: usize = 8;

pub struct BootPlatform {
    heap: Mutex<Heap>,
    tsc_per_ms: u64,
}

impl BootPlatform {
    /// Build the platform over `size` bytes at `base` and calibrate the TSC.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be identity mapped, unused by anything
    /// else and reachable by bus-master DMA.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        let mut heap = Heap::empty();
        heap.init(base as *mut u8, size);
        log::info!("DMA heap at {:#x} with size {} KiB", base, size / 1024);

        let tsc_per_ms = calibrate();
        BootPlatform {
            heap: Mutex::new(heap),
            tsc_per_ms,
        }
    }

    pub fn tsc_per_ms(&self) -> u64 {
        self.tsc_per_ms
    }
}

impl Platform for BootPlatform {
    fn alloc_dma(&self, size: usize, align: usize) -> Option<DmaBuffer> {
        let layout = Layout::from_size_align(size.max(1), align.max(MIN_ALIGN)).ok()?;
        let block = self.heap.lock().allocate_first_fit(layout).ok()?;
        unsafe {
            ptr::write_bytes(block.as_ptr(), 0, size);
            Some(DmaBuffer::new(block, block.as_ptr() as u64, size).with_align(layout.align()))
        }
    }

    fn free_dma(&self, buffer: DmaBuffer) {
        let Some(block) = NonNull::new(buffer.as_ptr()) else {
            return;
        };
        let Ok(layout) = Layout::from_size_align(buffer.len().max(1), buffer.align()) else {
            return;
        };
        unsafe { self.heap.lock().deallocate(block, layout) };
    }

    fn sleep_ms(&self, ms: u32) -> u32 {
        let start = rdtsc();
        let ticks = self.tsc_per_ms.saturating_mul(ms as u64);
        while rdtsc().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
        ms
    }
}

#[inline(always)]
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// TSC cycles per millisecond, measured over one PIT channel 2 countdown.
fn calibrate() -> u64 {
    let mut gate = Port::<u8>::new(PIT_GATE_PORT);
    let mut command = Port::<u8>::new(PIT_COMMAND_PORT);
    let mut channel2 = Port::<u8>::new(PIT_CHANNEL2_PORT);

    let elapsed = unsafe {
        let orig_gate = gate.read();
        // Speaker off, channel 2 gate on.
        gate.write((orig_gate & 0xFC) | 0x01);

        // Channel 2, lobyte/hibyte, mode 0, binary
        command.write(0xB0);
        channel2.write((CALIBRATION_TICKS & 0xFF) as u8);
        channel2.write((CALIBRATION_TICKS >> 8) as u8);

        let start = rdtsc();
        let g = gate.read();
        gate.write(g & 0xFE);
        gate.write(g | 0x01);

        // OUT2 (bit 5) goes high at terminal count.
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let end = rdtsc();
        gate.write(orig_gate);
        end.saturating_sub(start)
    };

    let per_ms = (elapsed * PIT_FREQUENCY_HZ / (CALIBRATION_TICKS as u64 * 1000)).max(1);
    log::info!("TSC calibration complete: {} MHz", per_ms / 1000);
    per_ms
}
