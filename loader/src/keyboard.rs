//! Keyboard layer: US layout tables and the registry of attached keyboards.

use alloc::vec::Vec;

use crate::drivers::usb::UsbSource;

// =============================================================================
// US Layout
// =============================================================================

/// Characters for HID usage IDs 0x04 (a) through 0x38 (/).
const UNSHIFTED_KEYS: &[u8] = b"abcdefghijklmnopqrstuvwxyz1234567890\n\x1b\x08\t -=[]\\#;'`,./";
const SHIFTED_KEYS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ!@#$%^&*()\n\x1b\x08\t _+{}|~:\"~<>?";

const FIRST_USAGE: usize = 0x04;

const fn build_table(keys: &[u8]) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < keys.len() {
        table[FIRST_USAGE + i] = keys[i];
        i += 1;
    }
    table
}

static LAYOUT: [u8; 256] = build_table(UNSHIFTED_KEYS);
static LAYOUT_SHIFT: [u8; 256] = build_table(SHIFTED_KEYS);

/// Character for a HID usage ID without shift, `None` if unmapped.
pub fn lookup(key: u8) -> Option<u8> {
    match LAYOUT[key as usize] {
        0 => None,
        c => Some(c),
    }
}

/// Character for a HID usage ID with shift held.
pub fn lookup_shift(key: u8) -> Option<u8> {
    match LAYOUT_SHIFT[key as usize] {
        0 => None,
        c => Some(c),
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardKind {
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyboard {
    pub kind: KeyboardKind,
    pub source: UsbSource,
}

/// Keyboards that initialised successfully. The first one is active.
#[derive(Default)]
pub struct KeyboardRegistry {
    keyboards: Vec<Keyboard>,
}

impl KeyboardRegistry {
    pub fn new() -> Self {
        KeyboardRegistry {
            keyboards: Vec::new(),
        }
    }

    pub fn register(&mut self, keyboard: Keyboard) {
        if self.keyboards.is_empty() {
            log::info!("[hid] {:?} keyboard is now the active keyboard", keyboard.kind);
        }
        self.keyboards.push(keyboard);
    }

    pub fn active(&self) -> Option<&Keyboard> {
        self.keyboards.first()
    }

    pub fn len(&self) -> usize {
        self.keyboards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyboards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyboard> {
        self.keyboards.iter()
    }
}
