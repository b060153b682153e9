//! Typed views over raw packet buffers.
//!
//! A view parses out of a byte slice and encodes back into one; packets stay
//! opaque blobs everywhere else. `parse` returns `None` for a buffer whose
//! opcode or size disagrees with the view, which the caller treats as a
//! malformed packet (logged and dropped, connection intact).

use super::opcode;
use super::wire::{PacketReader, PacketWriter};

/// Source name stamped on synthesized console messages.
pub const CONSOLE_NAME: &str = "moongate";

const CONSOLE_HUE: u16 = 0x035b;
const CONSOLE_FONT: u16 = 0x0003;

// ---------------------------------------------------------------------------
// Items

/// Revision-7 world item (0xF3, fixed 26 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldItem7 {
    pub kind: u8,
    pub serial: u32,
    pub item_id: u16,
    pub direction: u8,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub layer: u8,
    pub hue: u16,
    pub flags: u8,
}

impl WorldItem7 {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::WORLD_ITEM_7 {
            return None;
        }
        r.read_u16()?; // 0x0001
        let kind = r.read_u8()?;
        let serial = r.read_u32()?;
        let item_id = r.read_u16()?;
        let direction = r.read_u8()?;
        let amount = r.read_u16()?;
        r.read_u16()?; // second amount copy
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let z = r.read_i8()?;
        let layer = r.read_u8()?;
        let hue = r.read_u16()?;
        let flags = r.read_u8()?;
        Some(Self {
            kind,
            serial,
            item_id,
            direction,
            amount,
            x,
            y,
            z,
            layer,
            hue,
            flags,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::WORLD_ITEM_7, 26);
        w.write_u16(0x0001);
        w.write_u8(self.kind);
        w.write_u32(self.serial);
        w.write_u16(self.item_id);
        w.write_u8(self.direction);
        w.write_u16(self.amount);
        w.write_u16(self.amount);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_i8(self.z);
        w.write_u8(self.layer);
        w.write_u16(self.hue);
        w.write_u8(self.flags);
        w.write_u16(0);
        w.finish()
    }
}

/// Legacy world item (0x1A, variable). Optional fields are flagged in the
/// serial's and coordinates' high bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldItem {
    pub serial: u32,
    pub item_id: u16,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
    pub hue: u16,
    pub flags: u8,
}

impl WorldItem {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::WORLD_ITEM {
            return None;
        }
        r.read_u16()?; // length
        let raw_serial = r.read_u32()?;
        let item_id = r.read_u16()?;
        let amount = if raw_serial & 0x8000_0000 != 0 {
            r.read_u16()?
        } else {
            0
        };
        let raw_x = r.read_u16()?;
        let raw_y = r.read_u16()?;
        let direction = if raw_x & 0x8000 != 0 { r.read_u8()? } else { 0 };
        let z = r.read_i8()?;
        let hue = if raw_y & 0x8000 != 0 { r.read_u16()? } else { 0 };
        let flags = if raw_y & 0x4000 != 0 { r.read_u8()? } else { 0 };
        Some(Self {
            serial: raw_serial & 0x7fff_ffff,
            item_id,
            amount,
            x: raw_x & 0x7fff,
            y: raw_y & 0x3fff,
            direction,
            z,
            hue,
            flags,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::WORLD_ITEM, 20);
        w.write_u16(0); // length placeholder
        let mut serial = self.serial & 0x7fff_ffff;
        if self.amount != 0 {
            serial |= 0x8000_0000;
        }
        w.write_u32(serial);
        w.write_u16(self.item_id);
        if self.amount != 0 {
            w.write_u16(self.amount);
        }
        let mut x = self.x & 0x7fff;
        if self.direction != 0 {
            x |= 0x8000;
        }
        w.write_u16(x);
        let mut y = self.y & 0x3fff;
        if self.hue != 0 {
            y |= 0x8000;
        }
        if self.flags != 0 {
            y |= 0x4000;
        }
        w.write_u16(y);
        if self.direction != 0 {
            w.write_u8(self.direction);
        }
        w.write_i8(self.z);
        if self.hue != 0 {
            w.write_u16(self.hue);
        }
        if self.flags != 0 {
            w.write_u8(self.flags);
        }
        w.finish_variable()
    }
}

/// Worn item (0x2E, fixed 15 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equip {
    pub serial: u32,
    pub item_id: u16,
    pub layer: u8,
    pub parent_serial: u32,
    pub hue: u16,
}

impl Equip {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::EQUIP {
            return None;
        }
        let serial = r.read_u32()?;
        let item_id = r.read_u16()?;
        r.read_u8()?;
        let layer = r.read_u8()?;
        let parent_serial = r.read_u32()?;
        let hue = r.read_u16()?;
        Some(Self {
            serial,
            item_id,
            layer,
            parent_serial,
            hue,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::EQUIP, 15);
        w.write_u32(self.serial);
        w.write_u16(self.item_id);
        w.write_u8(0);
        w.write_u8(self.layer);
        w.write_u32(self.parent_serial);
        w.write_u16(self.hue);
        w.finish()
    }
}

/// Container gump (0x24). The revision-6 form is 7 bytes; revision 7 appends
/// a two-byte extension which carries nothing the proxy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOpen {
    pub serial: u32,
    pub gump_id: u16,
}

impl ContainerOpen {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::CONTAINER_OPEN {
            return None;
        }
        let serial = r.read_u32()?;
        let gump_id = r.read_u16()?;
        Some(Self { serial, gump_id })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::CONTAINER_OPEN, 7);
        w.write_u32(self.serial);
        w.write_u16(self.gump_id);
        w.finish()
    }
}

/// Single item placed into a container (0x25, fixed 21 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub serial: u32,
    pub item_id: u16,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub grid: u8,
    pub parent_serial: u32,
    pub hue: u16,
}

impl ContainerUpdate {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::CONTAINER_UPDATE {
            return None;
        }
        Self::read_fields(&mut r)
    }

    fn read_fields(r: &mut PacketReader) -> Option<Self> {
        let serial = r.read_u32()?;
        let item_id = r.read_u16()?;
        r.read_u8()?;
        let amount = r.read_u16()?;
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let grid = r.read_u8()?;
        let parent_serial = r.read_u32()?;
        let hue = r.read_u16()?;
        Some(Self {
            serial,
            item_id,
            amount,
            x,
            y,
            grid,
            parent_serial,
            hue,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::CONTAINER_UPDATE, 21);
        self.write_fields(&mut w);
        w.finish()
    }

    fn write_fields(&self, w: &mut PacketWriter) {
        w.write_u32(self.serial);
        w.write_u16(self.item_id);
        w.write_u8(0);
        w.write_u16(self.amount);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_u8(self.grid);
        w.write_u32(self.parent_serial);
        w.write_u16(self.hue);
    }
}

/// Full container inventory (0x3C, variable). Entries share the 0x25 field
/// layout minus the opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerContent {
    pub items: Vec<ContainerUpdate>,
}

impl ContainerContent {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::CONTAINER_CONTENT {
            return None;
        }
        r.read_u16()?; // length
        let num = r.read_u16()? as usize;
        let mut items = Vec::with_capacity(num);
        for _ in 0..num {
            items.push(ContainerUpdate::read_fields(&mut r)?);
        }
        Some(Self { items })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::CONTAINER_CONTENT, 5 + 20 * self.items.len());
        w.write_u16(0); // length placeholder
        w.write_u16(self.items.len() as u16);
        for item in &self.items {
            item.write_fields(&mut w);
        }
        w.finish_variable()
    }
}

// ---------------------------------------------------------------------------
// Mobiles

const MOBILE_INCOMING_HEADER: usize = 19;

/// One equipment entry embedded in a 0x78 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentEntry {
    pub serial: u32,
    pub item_id: u16,
    pub layer: u8,
    pub hue: u16,
}

/// Borrowed view over a raw MobileIncoming (0x78) buffer. The packet is
/// variable length with an embedded equipment list terminated by a zero
/// serial; it stays a blob at rest and is patched in place.
#[derive(Debug, Clone, Copy)]
pub struct MobileIncomingView<'a>(&'a [u8]);

impl<'a> MobileIncomingView<'a> {
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < MOBILE_INCOMING_HEADER || data[0] != opcode::MOBILE_INCOMING {
            return None;
        }
        Some(Self(data))
    }

    pub fn serial(&self) -> u32 {
        u32::from_be_bytes([self.0[3], self.0[4], self.0[5], self.0[6]])
    }

    pub fn body(&self) -> u16 {
        u16::from_be_bytes([self.0[7], self.0[8]])
    }

    pub fn x(&self) -> u16 {
        u16::from_be_bytes([self.0[9], self.0[10]])
    }

    pub fn y(&self) -> u16 {
        u16::from_be_bytes([self.0[11], self.0[12]])
    }

    pub fn z(&self) -> i8 {
        self.0[13] as i8
    }

    pub fn direction(&self) -> u8 {
        self.0[14]
    }

    pub fn hue(&self) -> u16 {
        u16::from_be_bytes([self.0[15], self.0[16]])
    }

    pub fn flags(&self) -> u8 {
        self.0[17]
    }

    pub fn notoriety(&self) -> u8 {
        self.0[18]
    }

    /// Decode the embedded equipment list. Entries carry an optional hue,
    /// flagged in bit 0x8000 of the item id; a zero serial terminates.
    pub fn equipment(&self) -> Vec<EquipmentEntry> {
        let mut entries = Vec::new();
        let mut pos = MOBILE_INCOMING_HEADER;
        loop {
            if pos + 4 > self.0.len() {
                break;
            }
            let serial = u32::from_be_bytes([
                self.0[pos],
                self.0[pos + 1],
                self.0[pos + 2],
                self.0[pos + 3],
            ]);
            if serial == 0 {
                break;
            }
            if pos + 7 > self.0.len() {
                break;
            }
            let raw_item_id = u16::from_be_bytes([self.0[pos + 4], self.0[pos + 5]]);
            let layer = self.0[pos + 6];
            let hue = if raw_item_id & 0x8000 != 0 {
                if pos + 9 > self.0.len() {
                    break;
                }
                let hue = u16::from_be_bytes([self.0[pos + 7], self.0[pos + 8]]);
                pos += 9;
                hue
            } else {
                pos += 7;
                0
            };
            entries.push(EquipmentEntry {
                serial,
                item_id: raw_item_id & 0x3fff,
                layer,
                hue,
            });
        }
        entries
    }
}

/// In-place patching of a stored MobileIncoming buffer.
#[derive(Debug)]
pub struct MobileIncomingMut<'a>(&'a mut [u8]);

impl<'a> MobileIncomingMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Option<Self> {
        if data.len() < MOBILE_INCOMING_HEADER || data[0] != opcode::MOBILE_INCOMING {
            return None;
        }
        Some(Self(data))
    }

    pub fn set_body(&mut self, body: u16) {
        self.0[7..9].copy_from_slice(&body.to_be_bytes());
    }

    pub fn set_position(&mut self, x: u16, y: u16) {
        self.0[9..11].copy_from_slice(&x.to_be_bytes());
        self.0[11..13].copy_from_slice(&y.to_be_bytes());
    }

    pub fn set_z(&mut self, z: i8) {
        self.0[13] = z as u8;
    }

    pub fn set_direction(&mut self, direction: u8) {
        self.0[14] = direction;
    }

    pub fn set_hue(&mut self, hue: u16) {
        self.0[15..17].copy_from_slice(&hue.to_be_bytes());
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.0[17] = flags;
    }

    pub fn set_notoriety(&mut self, notoriety: u8) {
        self.0[18] = notoriety;
    }
}

const MOBILE_STATUS_FLAGS_OFFSET: usize = 42;

/// Borrowed view over a raw MobileStatus (0x11) buffer.
#[derive(Debug, Clone, Copy)]
pub struct MobileStatusView<'a>(&'a [u8]);

impl<'a> MobileStatusView<'a> {
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() <= MOBILE_STATUS_FLAGS_OFFSET || data[0] != opcode::MOBILE_STATUS {
            return None;
        }
        Some(Self(data))
    }

    pub fn serial(&self) -> u32 {
        u32::from_be_bytes([self.0[3], self.0[4], self.0[5], self.0[6]])
    }

    /// Capability probe: higher values mean a more detailed status form.
    pub fn flags(&self) -> u8 {
        self.0[MOBILE_STATUS_FLAGS_OFFSET]
    }
}

/// Teleport/update of a single mobile (0x20, fixed 19 bytes). Note the z
/// coordinate is a single host-order byte here, unlike [`Start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileUpdate {
    pub serial: u32,
    pub body: u16,
    pub hue: u16,
    pub flags: u8,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
}

impl MobileUpdate {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::MOBILE_UPDATE {
            return None;
        }
        let serial = r.read_u32()?;
        let body = r.read_u16()?;
        r.read_u8()?;
        let hue = r.read_u16()?;
        let flags = r.read_u8()?;
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        r.read_u16()?;
        let direction = r.read_u8()?;
        let z = r.read_i8()?;
        Some(Self {
            serial,
            body,
            hue,
            flags,
            x,
            y,
            direction,
            z,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::MOBILE_UPDATE, 19);
        w.write_u32(self.serial);
        w.write_u16(self.body);
        w.write_u8(0);
        w.write_u16(self.hue);
        w.write_u8(self.flags);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_u16(0);
        w.write_u8(self.direction);
        w.write_i8(self.z);
        w.finish()
    }
}

/// A mobile seen walking (0x77, fixed 17 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileMoving {
    pub serial: u32,
    pub body: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub direction: u8,
    pub hue: u16,
    pub flags: u8,
    pub notoriety: u8,
}

impl MobileMoving {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::MOBILE_MOVING {
            return None;
        }
        let serial = r.read_u32()?;
        let body = r.read_u16()?;
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let z = r.read_i8()?;
        let direction = r.read_u8()?;
        let hue = r.read_u16()?;
        let flags = r.read_u8()?;
        let notoriety = r.read_u8()?;
        Some(Self {
            serial,
            body,
            x,
            y,
            z,
            direction,
            hue,
            flags,
            notoriety,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::MOBILE_MOVING, 17);
        w.write_u32(self.serial);
        w.write_u16(self.body);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_i8(self.z);
        w.write_u8(self.direction);
        w.write_u16(self.hue);
        w.write_u8(self.flags);
        w.write_u8(self.notoriety);
        w.finish()
    }
}

// ---------------------------------------------------------------------------
// Ambient / movement

/// Login confirmation (0x1B, fixed 37 bytes). The z coordinate is a
/// big-endian i16 on the wire, unlike [`MobileUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    pub serial: u32,
    pub body: u16,
    pub x: u16,
    pub y: u16,
    pub z: i16,
    pub direction: u8,
    pub flags: u8,
    pub map_width: u16,
    pub map_height: u16,
}

impl Start {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::START {
            return None;
        }
        let serial = r.read_u32()?;
        r.read_u32()?;
        let body = r.read_u16()?;
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let z = r.read_i16()?;
        let direction = r.read_u8()?;
        r.read_u8()?;
        r.read_u32()?;
        r.read_u32()?;
        let flags = r.read_u8()?;
        let map_width = r.read_u16()?;
        let map_height = r.read_u16()?;
        Some(Self {
            serial,
            body,
            x,
            y,
            z,
            direction,
            flags,
            map_width,
            map_height,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::START, 37);
        w.write_u32(self.serial);
        w.write_u32(0);
        w.write_u16(self.body);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_i16(self.z);
        w.write_u8(self.direction);
        w.write_u8(0);
        w.write_u32(0);
        w.write_u32(0);
        w.write_u8(self.flags);
        w.write_u16(self.map_width);
        w.write_u16(self.map_height);
        w.write_zeros(5);
        w.finish()
    }
}

/// Subserver change (0x76, fixed 16 bytes). Carries a 16-bit z.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneChange {
    pub x: u16,
    pub y: u16,
    pub z: i16,
}

impl ZoneChange {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::ZONE_CHANGE {
            return None;
        }
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let z = r.read_i16()?;
        Some(Self { x, y, z })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::ZONE_CHANGE, 16);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_i16(self.z);
        w.write_zeros(9);
        w.finish()
    }
}

/// Client walk request (0x02, fixed 7 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub direction: u8,
    pub seq: u8,
    pub key: u32,
}

impl Walk {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::WALK {
            return None;
        }
        let direction = r.read_u8()?;
        let seq = r.read_u8()?;
        let key = r.read_u32()?;
        Some(Self {
            direction,
            seq,
            key,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::WALK, 7);
        w.write_u8(self.direction);
        w.write_u8(self.seq);
        w.write_u32(self.key);
        w.finish()
    }
}

/// Server walk acknowledgement (0x22, fixed 3 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkAck {
    pub seq: u8,
    pub notoriety: u8,
}

impl WalkAck {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::WALK_ACK {
            return None;
        }
        let seq = r.read_u8()?;
        let notoriety = r.read_u8()?;
        Some(Self { seq, notoriety })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::WALK_ACK, 3);
        w.write_u8(self.seq);
        w.write_u8(self.notoriety);
        w.finish()
    }
}

/// Server walk rejection (0x21, fixed 8 bytes); resets the client to the
/// given position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkCancel {
    pub seq: u8,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
}

impl WalkCancel {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::WALK_CANCEL {
            return None;
        }
        let seq = r.read_u8()?;
        let x = r.read_u16()?;
        let y = r.read_u16()?;
        let direction = r.read_u8()?;
        let z = r.read_i8()?;
        Some(Self {
            seq,
            x,
            y,
            direction,
            z,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::WALK_CANCEL, 8);
        w.write_u8(self.seq);
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_u8(self.direction);
        w.write_i8(self.z);
        w.finish()
    }
}

// ---------------------------------------------------------------------------
// Speech

/// Serial of a system/console message source.
pub const SYSTEM_SERIAL: u32 = 0xffff_ffff;

/// Build a server-origin console line (0x1C, system hue).
pub fn build_speak_console(text: &str) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(opcode::SPEAK_ASCII, 45 + text.len());
    w.write_u16(0); // length placeholder
    w.write_u32(SYSTEM_SERIAL);
    w.write_u16(0xffff); // graphic
    w.write_u8(0x01); // system speech
    w.write_u16(CONSOLE_HUE);
    w.write_u16(CONSOLE_FONT);
    w.write_str_fixed(CONSOLE_NAME, 30);
    w.write_bytes(text.as_bytes());
    w.write_u8(0);
    w.finish_variable()
}

/// Extract the message text of a downstream talk packet, ASCII (0x03) or
/// unicode (0xAD). Returns `None` for other opcodes or truncated buffers.
pub fn talk_text(data: &[u8]) -> Option<String> {
    match data.first()? {
        &opcode::TALK_ASCII => {
            if data.len() < 9 {
                return None;
            }
            let body = &data[8..];
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            Some(String::from_utf8_lossy(&body[..end]).into_owned())
        }
        &opcode::TALK_UNICODE => {
            if data.len() < 14 {
                return None;
            }
            let mut text = String::new();
            let mut pos = 12;
            while pos + 2 <= data.len() {
                let unit = u16::from_be_bytes([data[pos], data[pos + 1]]);
                if unit == 0 {
                    break;
                }
                text.push(char::from_u32(unit as u32).unwrap_or('\u{fffd}'));
                pos += 2;
            }
            Some(text)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Login dialogue

/// Modern seed packet (0xEF, fixed 21 bytes); announces the client version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    pub seed: u32,
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub prototype: u32,
}

impl Seed {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::SEED {
            return None;
        }
        let seed = r.read_u32()?;
        let major = r.read_u32()?;
        let minor = r.read_u32()?;
        let revision = r.read_u32()?;
        let prototype = r.read_u32()?;
        Some(Self {
            seed,
            major,
            minor,
            revision,
            prototype,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::SEED, 21);
        w.write_u32(self.seed);
        w.write_u32(self.major);
        w.write_u32(self.minor);
        w.write_u32(self.revision);
        w.write_u32(self.prototype);
        w.finish()
    }
}

/// Account login against the login server (0x80, fixed 62 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLogin {
    pub username: String,
    pub password: String,
}

impl AccountLogin {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::ACCOUNT_LOGIN {
            return None;
        }
        let username = r.read_str_fixed(30)?;
        let password = r.read_str_fixed(30)?;
        Some(Self { username, password })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::ACCOUNT_LOGIN, 62);
        w.write_str_fixed(&self.username, 30);
        w.write_str_fixed(&self.password, 30);
        w.write_u8(0x5d);
        w.finish()
    }
}

/// Game-server login after a relay (0x91, fixed 65 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameLogin {
    pub auth_id: u32,
    pub username: String,
    pub password: String,
}

impl GameLogin {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::GAME_LOGIN {
            return None;
        }
        let auth_id = r.read_u32()?;
        let username = r.read_str_fixed(30)?;
        let password = r.read_str_fixed(30)?;
        Some(Self {
            auth_id,
            username,
            password,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::GAME_LOGIN, 65);
        w.write_u32(self.auth_id);
        w.write_str_fixed(&self.username, 30);
        w.write_str_fixed(&self.password, 30);
        w.finish()
    }
}

/// Shard selection (0xA0, fixed 3 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayServer {
    pub index: u16,
}

impl PlayServer {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::PLAY_SERVER {
            return None;
        }
        let index = r.read_u16()?;
        Some(Self { index })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::PLAY_SERVER, 3);
        w.write_u16(self.index);
        w.finish()
    }
}

/// Redirect to a game server (0x8C, fixed 11 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    pub ip: [u8; 4],
    pub port: u16,
    pub auth_id: u32,
}

impl Relay {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::RELAY {
            return None;
        }
        let ip_raw = r.read_bytes(4)?;
        let ip = [ip_raw[0], ip_raw[1], ip_raw[2], ip_raw[3]];
        let port = r.read_u16()?;
        let auth_id = r.read_u32()?;
        Some(Self { ip, port, auth_id })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::RELAY, 11);
        w.write_bytes(&self.ip);
        w.write_u16(self.port);
        w.write_u32(self.auth_id);
        w.finish()
    }
}

/// One entry of a shard list (0xA8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub index: u16,
    pub name: String,
}

/// Shard list (0xA8, variable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    pub entries: Vec<ServerEntry>,
}

impl ServerList {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::SERVER_LIST {
            return None;
        }
        r.read_u16()?; // length
        r.read_u8()?; // flags
        let count = r.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let index = r.read_u16()?;
            let name = r.read_str_fixed(32)?;
            r.read_u8()?; // percent full
            r.read_u8()?; // timezone
            r.read_u32()?; // ping address
            entries.push(ServerEntry { index, name });
        }
        Some(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w =
            PacketWriter::with_capacity(opcode::SERVER_LIST, 6 + 40 * self.entries.len());
        w.write_u16(0); // length placeholder
        w.write_u8(0x5d);
        w.write_u16(self.entries.len() as u16);
        for entry in &self.entries {
            w.write_u16(entry.index);
            w.write_str_fixed(&entry.name, 32);
            w.write_u8(0);
            w.write_u8(0);
            w.write_u32(0);
        }
        w.finish_variable()
    }
}

/// Character list after game login (0xA9, variable). Only the slot names
/// matter to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharList {
    pub names: Vec<String>,
}

impl CharList {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::CHAR_LIST {
            return None;
        }
        r.read_u16()?; // length
        let count = r.read_u8()? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.read_str_fixed(30)?);
            r.skip(30)?; // password field, always blank
        }
        Some(Self { names })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::CHAR_LIST, 9 + 60 * self.names.len());
        w.write_u16(0); // length placeholder
        w.write_u8(self.names.len() as u8);
        for name in &self.names {
            w.write_str_fixed(name, 30);
            w.write_zeros(30);
        }
        w.write_u8(0); // starting cities
        w.write_u32(0); // feature flags
        w.finish_variable()
    }
}

/// Character selection (0x5D, fixed 73 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayCharacter {
    pub name: String,
    pub slot: u32,
}

impl PlayCharacter {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        if r.read_u8()? != opcode::PLAY_CHARACTER {
            return None;
        }
        r.read_u32()?; // 0xedededed pattern
        let name = r.read_str_fixed(30)?;
        r.skip(30)?;
        let slot = r.read_u32()?;
        r.read_u32()?; // client ip
        Some(Self { name, slot })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(opcode::PLAY_CHARACTER, 73);
        w.write_u32(0xedededed);
        w.write_str_fixed(&self.name, 30);
        w.write_zeros(30);
        w.write_u32(self.slot);
        w.write_u32(0);
        w.finish()
    }
}

/// Serial of a Delete (0x1D) packet.
pub fn delete_serial(data: &[u8]) -> Option<u32> {
    let mut r = PacketReader::new(data);
    if r.read_u8()? != opcode::DELETE {
        return None;
    }
    r.read_u32()
}

/// Major version out of a ClientVersion (0xBD) reply, e.g. "7.0.15.1".
pub fn client_version_major(data: &[u8]) -> Option<u32> {
    if data.len() < 4 || data[0] != opcode::CLIENT_VERSION {
        return None;
    }
    let body = &data[3..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let text = std::str::from_utf8(&body[..end]).ok()?;
    text.split('.').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_world_item_7() -> WorldItem7 {
        WorldItem7 {
            kind: 0,
            serial: 0x4000_0001,
            item_id: 0x0eed,
            direction: 2,
            amount: 5,
            x: 1203,
            y: 1674,
            z: -3,
            layer: 0,
            hue: 0x0455,
            flags: 0x20,
        }
    }

    #[test]
    fn world_item_7_roundtrip() {
        let item = sample_world_item_7();
        let encoded = item.encode();
        assert_eq!(encoded.len(), 26);
        assert_eq!(WorldItem7::parse(&encoded), Some(item));
    }

    #[test]
    fn world_item_optional_fields() {
        let full = WorldItem {
            serial: 0x4000_0002,
            item_id: 0x0f3f,
            amount: 20,
            x: 100,
            y: 200,
            direction: 3,
            z: 1,
            hue: 0x0021,
            flags: 0x80,
        };
        let encoded = full.encode();
        assert_eq!(WorldItem::parse(&encoded), Some(full));

        let bare = WorldItem {
            serial: 0x4000_0003,
            item_id: 0x1bdd,
            amount: 0,
            x: 55,
            y: 66,
            direction: 0,
            z: 0,
            hue: 0,
            flags: 0,
        };
        let encoded = bare.encode();
        // opcode + length + serial + item id + x + y + z
        assert_eq!(encoded.len(), 14);
        assert_eq!(WorldItem::parse(&encoded), Some(bare));
    }

    #[test]
    fn container_content_roundtrip() {
        let content = ContainerContent {
            items: vec![
                ContainerUpdate {
                    serial: 0x4000_0011,
                    item_id: 0x0e75,
                    amount: 1,
                    x: 40,
                    y: 60,
                    grid: 0,
                    parent_serial: 0x4000_0010,
                    hue: 0,
                },
                ContainerUpdate {
                    serial: 0x4000_0012,
                    item_id: 0x0f0e,
                    amount: 3,
                    x: 80,
                    y: 90,
                    grid: 1,
                    parent_serial: 0x4000_0010,
                    hue: 0x0481,
                },
            ],
        };
        let encoded = content.encode();
        assert_eq!(encoded.len(), 5 + 2 * 20);
        assert_eq!(ContainerContent::parse(&encoded), Some(content));
    }

    #[test]
    fn mobile_incoming_equipment_list() {
        let mut data = Vec::new();
        data.push(opcode::MOBILE_INCOMING);
        data.extend_from_slice(&[0, 0]); // length, patched below
        data.extend_from_slice(&0x0000_0042u32.to_be_bytes());
        data.extend_from_slice(&0x0190u16.to_be_bytes()); // body
        data.extend_from_slice(&1000u16.to_be_bytes()); // x
        data.extend_from_slice(&2000u16.to_be_bytes()); // y
        data.push(5); // z
        data.push(1); // direction
        data.extend_from_slice(&0x83eau16.to_be_bytes()); // hue
        data.push(0); // flags
        data.push(1); // notoriety
        // entry with hue
        data.extend_from_slice(&0x4000_0020u32.to_be_bytes());
        data.extend_from_slice(&(0x1515u16 | 0x8000).to_be_bytes());
        data.push(0x05);
        data.extend_from_slice(&0x0035u16.to_be_bytes());
        // entry without hue
        data.extend_from_slice(&0x4000_0021u32.to_be_bytes());
        data.extend_from_slice(&0x203cu16.to_be_bytes());
        data.push(0x0b);
        // terminator
        data.extend_from_slice(&0u32.to_be_bytes());
        let len = data.len() as u16;
        data[1..3].copy_from_slice(&len.to_be_bytes());

        let view = MobileIncomingView::new(&data).unwrap();
        assert_eq!(view.serial(), 0x42);
        assert_eq!(view.x(), 1000);
        assert_eq!(view.y(), 2000);
        assert_eq!(view.notoriety(), 1);

        let equipment = view.equipment();
        assert_eq!(
            equipment,
            vec![
                EquipmentEntry {
                    serial: 0x4000_0020,
                    item_id: 0x1515,
                    layer: 0x05,
                    hue: 0x0035,
                },
                EquipmentEntry {
                    serial: 0x4000_0021,
                    item_id: 0x203c,
                    layer: 0x0b,
                    hue: 0,
                },
            ]
        );
    }

    #[test]
    fn mobile_incoming_patching() {
        let mut data = vec![0u8; 23];
        data[0] = opcode::MOBILE_INCOMING;
        data[1..3].copy_from_slice(&23u16.to_be_bytes());
        {
            let mut patch = MobileIncomingMut::new(&mut data).unwrap();
            patch.set_position(321, 654);
            patch.set_direction(6);
            patch.set_notoriety(3);
        }
        let view = MobileIncomingView::new(&data).unwrap();
        assert_eq!(view.x(), 321);
        assert_eq!(view.y(), 654);
        assert_eq!(view.direction(), 6);
        assert_eq!(view.notoriety(), 3);
    }

    #[test]
    fn start_z_is_big_endian_16() {
        let start = Start {
            serial: 0x1234,
            body: 0x0190,
            x: 100,
            y: 200,
            z: -300,
            direction: 4,
            flags: 0,
            map_width: 6144,
            map_height: 4096,
        };
        let encoded = start.encode();
        assert_eq!(encoded.len(), 37);
        // z occupies two bytes on the wire, big-endian.
        assert_eq!(
            i16::from_be_bytes([encoded[15], encoded[16]]),
            -300
        );
        assert_eq!(Start::parse(&encoded), Some(start));
    }

    #[test]
    fn mobile_update_z_is_single_byte() {
        let update = MobileUpdate {
            serial: 0x1234,
            body: 0x0190,
            hue: 0,
            flags: 0,
            x: 100,
            y: 200,
            direction: 4,
            z: -30,
        };
        let encoded = update.encode();
        assert_eq!(encoded.len(), 19);
        assert_eq!(encoded[18] as i8, -30);
        assert_eq!(MobileUpdate::parse(&encoded), Some(update));
    }

    #[test]
    fn walk_packets_roundtrip() {
        let walk = Walk {
            direction: 0x81,
            seq: 7,
            key: 0xdeadbeef,
        };
        assert_eq!(Walk::parse(&walk.encode()), Some(walk));

        let ack = WalkAck {
            seq: 7,
            notoriety: 1,
        };
        assert_eq!(WalkAck::parse(&ack.encode()), Some(ack));

        let cancel = WalkCancel {
            seq: 7,
            x: 5,
            y: 6,
            direction: 0,
            z: 0,
        };
        assert_eq!(WalkCancel::parse(&cancel.encode()), Some(cancel));
    }

    #[test]
    fn speak_console_is_well_formed() {
        let data = build_speak_console("attached");
        assert_eq!(data[0], opcode::SPEAK_ASCII);
        let len = u16::from_be_bytes([data[1], data[2]]) as usize;
        assert_eq!(len, data.len());
        assert_eq!(*data.last().unwrap(), 0);
        let name_field = &data[14..44];
        assert!(name_field.starts_with(CONSOLE_NAME.as_bytes()));
        assert!(data[44..].starts_with(b"attached"));
    }

    #[test]
    fn talk_text_ascii_and_unicode() {
        let mut ascii = vec![opcode::TALK_ASCII, 0, 0, 0x00, 0x00, 0x21, 0x00, 0x03];
        ascii.extend_from_slice(b"%reconnect\0");
        let len = ascii.len() as u16;
        ascii[1..3].copy_from_slice(&len.to_be_bytes());
        assert_eq!(talk_text(&ascii).as_deref(), Some("%reconnect"));

        let mut unicode = vec![opcode::TALK_UNICODE, 0, 0, 0x00, 0x00, 0x21, 0x00, 0x03];
        unicode.extend_from_slice(b"ENU\0");
        for c in "%help".encode_utf16() {
            unicode.extend_from_slice(&c.to_be_bytes());
        }
        unicode.extend_from_slice(&[0, 0]);
        let len = unicode.len() as u16;
        unicode[1..3].copy_from_slice(&len.to_be_bytes());
        assert_eq!(talk_text(&unicode).as_deref(), Some("%help"));

        assert_eq!(talk_text(&[opcode::PING, 0]), None);
    }

    #[test]
    fn login_views_roundtrip() {
        let account = AccountLogin {
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert_eq!(AccountLogin::parse(&account.encode()), Some(account));

        let game = GameLogin {
            auth_id: 0xcafe_f00d,
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert_eq!(GameLogin::parse(&game.encode()), Some(game));

        let relay = Relay {
            ip: [127, 0, 0, 1],
            port: 2593,
            auth_id: 0xcafe_f00d,
        };
        assert_eq!(Relay::parse(&relay.encode()), Some(relay));

        let list = ServerList {
            entries: vec![ServerEntry {
                index: 0,
                name: "moongate".into(),
            }],
        };
        assert_eq!(ServerList::parse(&list.encode()), Some(list));

        let chars = CharList {
            names: vec!["Alice".into(), "Bob".into()],
        };
        assert_eq!(CharList::parse(&chars.encode()), Some(chars));

        let play = PlayCharacter {
            name: "Alice".into(),
            slot: 1,
        };
        let encoded = play.encode();
        assert_eq!(encoded.len(), 73);
        assert_eq!(PlayCharacter::parse(&encoded), Some(play));
    }

    #[test]
    fn client_version_major_parsed() {
        let mut data = vec![opcode::CLIENT_VERSION, 0, 0];
        data.extend_from_slice(b"7.0.15.1\0");
        let len = data.len() as u16;
        data[1..3].copy_from_slice(&len.to_be_bytes());
        assert_eq!(client_version_major(&data), Some(7));
    }
}
