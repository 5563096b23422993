//! Hardware access used by the USB host controller drivers.
//!
//! The loader's memory allocator, millisecond delay and register I/O are
//! provided by the boot environment. Drivers only see them through the
//! [`Platform`] and [`RegisterBlock`] traits so that every engine can run
//! against simulated memory and registers in unit tests.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use crate::config::PollBudget;
use crate::drivers::usb::UsbError;

// =============================================================================
// DMA Memory
// =============================================================================

/// A block of memory visible to both the CPU and a bus-master controller.
///
/// `phys` is the address programmed into controller registers and
/// descriptors; the CPU accesses the same bytes through `virt`.
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
    align: usize,
}

// The buffer is plain memory owned by whoever holds the handle.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// # Safety
    ///
    /// `virt` must point to `size` writable bytes that a controller reaches
    /// at bus address `phys`, valid until handed back via [`Platform::free_dma`].
    pub unsafe fn new(virt: NonNull<u8>, phys: u64, size: usize) -> Self {
        DmaBuffer {
            virt,
            phys,
            size,
            align: 1,
        }
    }

    /// Record the alignment the block was allocated with, for freeing.
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Bus address of the byte at `offset`.
    pub fn phys_at(&self, offset: usize) -> u64 {
        self.phys + offset as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    fn check<T>(&self, offset: usize) {
        assert!(
            offset + size_of::<T>() <= self.size,
            "DMA access out of bounds: {} + {} > {}",
            offset,
            size_of::<T>(),
            self.size
        );
        debug_assert_eq!((self.virt.as_ptr() as usize + offset) % align_of::<T>(), 0);
    }

    /// Volatile read of a `T` at byte `offset`.
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        self.check::<T>(offset);
        unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset) as *const T) }
    }

    /// Volatile write of a `T` at byte `offset`.
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        self.check::<T>(offset);
        unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset) as *mut T, value) }
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size, "DMA copy out of bounds");
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.virt.as_ptr().add(offset), src.len());
        }
        fence(Ordering::SeqCst);
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.size, "DMA copy out of bounds");
        fence(Ordering::SeqCst);
        unsafe {
            ptr::copy_nonoverlapping(self.virt.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.virt.as_ptr(), 0, self.size) }
        fence(Ordering::SeqCst);
    }
}

// =============================================================================
// Platform Services
// =============================================================================

/// Allocator and delay services supplied by the boot environment.
pub trait Platform: Send + Sync {
    /// Allocate `size` zeroed bytes aligned to `align` (a power of two).
    fn alloc_dma(&self, size: usize, align: usize) -> Option<DmaBuffer>;

    /// Return a buffer obtained from [`Platform::alloc_dma`].
    fn free_dma(&self, buffer: DmaBuffer);

    /// Busy-wait for `ms` milliseconds; returns the time actually waited.
    fn sleep_ms(&self, ms: u32) -> u32;
}

/// Allocate DMA memory or fail with `OutOfMemory`.
pub fn alloc_dma(platform: &dyn Platform, size: usize, align: usize) -> Result<DmaBuffer, UsbError> {
    platform.alloc_dma(size, align).ok_or(UsbError::OutOfMemory)
}

/// Allocate DMA memory a 32-bit controller can address.
pub fn alloc_dma32(platform: &dyn Platform, size: usize, align: usize) -> Result<DmaBuffer, UsbError> {
    let buffer = alloc_dma(platform, size, align)?;
    if buffer.phys() + size as u64 > u32::MAX as u64 + 1 {
        platform.free_dma(buffer);
        return Err(UsbError::OutOfMemory);
    }
    Ok(buffer)
}

/// Fixed-stride array of hardware descriptors inside one DMA buffer.
pub struct DmaArray {
    buffer: DmaBuffer,
    stride: usize,
    count: usize,
}

impl DmaArray {
    pub fn new(
        platform: &dyn Platform,
        count: usize,
        stride: usize,
        align: usize,
        below_4g: bool,
    ) -> Result<Self, UsbError> {
        let buffer = if below_4g {
            alloc_dma32(platform, count * stride, align)?
        } else {
            alloc_dma(platform, count * stride, align)?
        };
        Ok(DmaArray {
            buffer,
            stride,
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn phys(&self, index: usize) -> u64 {
        self.buffer.phys_at(index * self.stride)
    }

    /// Element index for a bus address pointing into this array.
    pub fn index_of(&self, phys: u64) -> Option<usize> {
        let base = self.buffer.phys();
        if phys < base {
            return None;
        }
        let index = ((phys - base) as usize) / self.stride;
        (index < self.count).then_some(index)
    }

    pub fn read32(&self, index: usize, offset: usize) -> u32 {
        self.buffer.read::<u32>(index * self.stride + offset)
    }

    pub fn write32(&self, index: usize, offset: usize, value: u32) {
        self.buffer.write::<u32>(index * self.stride + offset, value)
    }

    /// Zero one element.
    pub fn clear(&self, index: usize) {
        for offset in (0..self.stride).step_by(4) {
            self.write32(index, offset, 0);
        }
    }

    pub fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }
}

/// Spin until `condition()` holds, checking at most `budget.iterations`
/// times with a `budget.interval_ms` sleep after each failed check.
pub fn wait_for<F: FnMut() -> bool>(
    platform: &dyn Platform,
    budget: PollBudget,
    mut condition: F,
) -> Result<(), UsbError> {
    for _ in 0..budget.iterations {
        if condition() {
            return Ok(());
        }
        platform.sleep_ms(budget.interval_ms);
    }
    Err(UsbError::Timeout)
}

// =============================================================================
// Register Access
// =============================================================================

/// A controller's register window, addressed by byte offset.
pub trait RegisterBlock: Send {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);

    fn read64(&self, offset: usize) -> u64 {
        self.read32(offset) as u64 | (self.read32(offset + 4) as u64) << 32
    }

    /// Low dword first, as 64-bit controller registers expect.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Memory-mapped registers (OHCI, EHCI, xHCI).
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the mapped virtual address of a device register window
    /// that stays mapped for the lifetime of the returned value.
    pub unsafe fn new(base: usize) -> Self {
        MmioRegisters { base }
    }
}

impl RegisterBlock for MmioRegisters {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u8) }
    }

    fn read16(&self, offset: usize) -> u16 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u16) }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write8(&self, offset: usize, value: u8) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u16, value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// I/O port registers (UHCI).
#[cfg(target_arch = "x86_64")]
pub struct PortRegisters {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortRegisters {
    /// # Safety
    ///
    /// `base` must be the start of an I/O range decoded by the controller.
    pub unsafe fn new(base: u16) -> Self {
        PortRegisters { base }
    }

    fn port(&self, offset: usize) -> u16 {
        self.base + offset as u16
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterBlock for PortRegisters {
    fn read8(&self, offset: usize) -> u8 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u8>::new(self.port(offset)).read() }
    }

    fn read16(&self, offset: usize) -> u16 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u16>::new(self.port(offset)).read() }
    }

    fn read32(&self, offset: usize) -> u32 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u32>::new(self.port(offset)).read() }
    }

    fn write8(&self, offset: usize, value: u8) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u8>::new(self.port(offset)).write(value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u16>::new(self.port(offset)).write(value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u32>::new(self.port(offset)).write(value) }
    }
}
