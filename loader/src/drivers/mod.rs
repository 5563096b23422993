//! Device drivers: PCI enumeration and the USB host stack.

pub mod pci;
pub mod usb;
