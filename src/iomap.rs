//! I/O port map (§4.5): a sparse table from port number to a registered
//! device hook, backing `IN`/`OUT` emulation. Keyed the same way `Mmap`
//! keys guest-physical regions — a `BTreeMap`, here over the 16-bit port
//! space directly since ports don't need range-splitting the way memory
//! regions do.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoMapError {
    #[error("port {0:#x} is already hooked")]
    AlreadyHooked(u16),
    #[error("no hook registered for port {0:#x}")]
    NotFound(u16),
}

/// Width of an I/O access; x86 `IN`/`OUT` only ever move 1, 2, or 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWidth {
    Byte,
    Word,
    Dword,
}

impl IoWidth {
    pub fn bytes(self) -> usize {
        match self {
            IoWidth::Byte => 1,
            IoWidth::Word => 2,
            IoWidth::Dword => 4,
        }
    }

    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(IoWidth::Byte),
            2 => Some(IoWidth::Word),
            4 => Some(IoWidth::Dword),
            _ => None,
        }
    }
}

pub type IoReadHook = Box<dyn FnMut(u16, IoWidth) -> u32 + Send>;
pub type IoWriteHook = Box<dyn FnMut(u16, IoWidth, u32) + Send>;

struct PortHook {
    read: Option<IoReadHook>,
    write: Option<IoWriteHook>,
}

/// The VM-wide I/O port table.
#[derive(Default)]
pub struct IoMap {
    ports: BTreeMap<u16, PortHook>,
}

impl IoMap {
    pub fn new() -> Self {
        Self {
            ports: BTreeMap::new(),
        }
    }

    /// Register hooks for a single port. Fails if the port is already
    /// hooked (§4.5: device models must not silently clobber each other).
    pub fn hook(
        &mut self,
        port: u16,
        read: Option<IoReadHook>,
        write: Option<IoWriteHook>,
    ) -> Result<(), IoMapError> {
        if self.ports.contains_key(&port) {
            return Err(IoMapError::AlreadyHooked(port));
        }
        self.ports.insert(port, PortHook { read, write });
        Ok(())
    }

    pub fn unhook(&mut self, port: u16) {
        self.ports.remove(&port);
    }

    pub fn is_hooked(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    /// Service an `IN` instruction. Unhandled ports read as all-ones, the
    /// conventional x86 "nothing there" value.
    pub fn read(&mut self, port: u16, width: IoWidth) -> u32 {
        match self.ports.get_mut(&port).and_then(|h| h.read.as_mut()) {
            Some(hook) => hook(port, width),
            None => match width {
                IoWidth::Byte => 0xFF,
                IoWidth::Word => 0xFFFF,
                IoWidth::Dword => 0xFFFF_FFFF,
            },
        }
    }

    /// Service an `OUT` instruction. A write to an unhooked port is a
    /// silent no-op, matching real hardware's behavior for unpopulated
    /// address decode.
    pub fn write(&mut self, port: u16, width: IoWidth, value: u32) {
        if let Some(hook) = self.ports.get_mut(&port).and_then(|h| h.write.as_mut()) {
            hook(port, width, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn unhooked_read_returns_all_ones() {
        let mut map = IoMap::new();
        assert_eq!(map.read(0x3f8, IoWidth::Byte), 0xFF);
    }

    #[test]
    fn hooked_port_round_trips_through_the_closure() {
        let mut map = IoMap::new();
        let state = Arc::new(Mutex::new(0u32));
        let state_read = state.clone();
        let state_write = state.clone();
        map.hook(
            0x60,
            Some(Box::new(move |_port, _width| *state_read.lock().unwrap())),
            Some(Box::new(move |_port, _width, value| {
                *state_write.lock().unwrap() = value;
            })),
        )
        .unwrap();

        map.write(0x60, IoWidth::Byte, 0x42);
        assert_eq!(map.read(0x60, IoWidth::Byte), 0x42);
    }

    #[test]
    fn double_hook_is_rejected() {
        let mut map = IoMap::new();
        map.hook(0x70, None, None).unwrap();
        assert!(matches!(
            map.hook(0x70, None, None),
            Err(IoMapError::AlreadyHooked(0x70))
        ));
    }

    #[test]
    fn width_conversions_round_trip() {
        assert_eq!(IoWidth::from_len(1), Some(IoWidth::Byte));
        assert_eq!(IoWidth::from_len(2), Some(IoWidth::Word));
        assert_eq!(IoWidth::from_len(4), Some(IoWidth::Dword));
        assert_eq!(IoWidth::from_len(3), None);
        assert_eq!(IoWidth::Dword.bytes(), 4);
    }
}


