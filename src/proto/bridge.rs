//! Conversions between the revision-6 and revision-7 forms of the same
//! logical packet. The session consults the target client's announced
//! revision and sends whichever form it understands.

use super::opcode;
use super::views::{WorldItem, WorldItem7};

/// Upshift a legacy world item to the 0xF3 form. The legacy serial's high
/// bit only flagged the presence of the amount field and is already masked
/// off by the parser.
pub fn world_item_to_7(p: &WorldItem) -> WorldItem7 {
    WorldItem7 {
        kind: 0,
        serial: p.serial,
        item_id: p.item_id,
        direction: p.direction,
        amount: p.amount,
        x: p.x,
        y: p.y,
        z: p.z,
        layer: 0,
        hue: p.hue,
        flags: p.flags,
    }
}

/// Downshift a 0xF3 world item to the legacy 0x1A form for revision-6
/// clients.
pub fn world_item_from_7(p: &WorldItem7) -> WorldItem {
    WorldItem {
        serial: p.serial & 0x7fff_ffff,
        item_id: p.item_id,
        amount: p.amount,
        x: p.x,
        y: p.y,
        direction: p.direction,
        z: p.z,
        hue: p.hue,
        flags: p.flags,
    }
}

/// Revision 7 wraps the 7-byte container-open in a 9-byte form; the
/// extension carries nothing and is zeroed on the way up.
pub fn container_open_to_7(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 7 || data[0] != opcode::CONTAINER_OPEN {
        return None;
    }
    let mut out = data[..7].to_vec();
    out.extend_from_slice(&[0, 0]);
    Some(out)
}

/// Discard the revision-7 extension, keeping the 7-byte base.
pub fn container_open_from_7(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 9 || data[0] != opcode::CONTAINER_OPEN {
        return None;
    }
    Some(data[..7].to_vec())
}
