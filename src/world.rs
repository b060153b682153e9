//! The mirrored game world a session keeps.
//!
//! The mirror caches every item and mobile the upstream server has shown,
//! plus the handful of ambient packets needed to bootstrap a freshly
//! attached client. Items and mobiles live in arenas keyed by serial; the
//! parent relation (outer container or wearing mobile) is derived from an
//! item's socket and drives recursive removal.

use bytes::Bytes;
use log::warn;
use rustc_hash::FxHashMap;

use crate::proto::bridge;
use crate::proto::views::{
    ContainerContent, ContainerOpen, ContainerUpdate, Equip, MobileIncomingMut,
    MobileIncomingView, MobileMoving, MobileStatusView, MobileUpdate, Start, WorldItem,
    WorldItem7, ZoneChange,
};
use crate::proto::ProtocolVersion;

pub type Serial = u32;

/// Serial namespace split: host-order values below 0x40000000 are mobiles,
/// 0x40000000..0x7fffffff are items, the rest is unmanaged.
pub fn serial_is_mobile(serial: Serial) -> bool {
    serial < 0x4000_0000
}

pub fn serial_is_item(serial: Serial) -> bool {
    (0x4000_0000..0x8000_0000).contains(&serial)
}

/// Where an item last appeared. Transitions overwrite the previous socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSocket {
    /// On the ground, kept in the revision-7 form.
    Ground(WorldItem7),
    /// Inside another container item.
    Container(ContainerUpdate),
    /// Worn by a mobile.
    Equipped(Equip),
}

impl ItemSocket {
    pub fn parent_serial(&self) -> Option<Serial> {
        match self {
            ItemSocket::Ground(_) => None,
            ItemSocket::Container(p) => Some(p.parent_serial),
            ItemSocket::Equipped(p) => Some(p.parent_serial),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub serial: Serial,
    /// `None` only for an item first referenced by a container-open record,
    /// before any socket packet has arrived.
    pub socket: Option<ItemSocket>,
    /// Most recent container-open record naming this item, 7-byte base form.
    pub container_open: Option<Vec<u8>>,
    pub attach_sequence: u32,
}

impl Item {
    fn new(serial: Serial) -> Self {
        Self {
            serial,
            socket: None,
            container_open: None,
            attach_sequence: 0,
        }
    }

    pub fn parent_serial(&self) -> Option<Serial> {
        self.socket.as_ref().and_then(ItemSocket::parent_serial)
    }
}

/// Mobile records stay raw wire images, patched in place when positional
/// updates arrive, and replayed verbatim on attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mobile {
    pub serial: Serial,
    pub incoming: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
}

impl Mobile {
    fn new(serial: Serial) -> Self {
        Self {
            serial,
            incoming: None,
            status: None,
        }
    }
}

pub const DEFAULT_CAPACITY: usize = 0x10000;

#[derive(Debug)]
pub struct World {
    /* ambient packets needed to attach a client */
    pub packet_start: Option<Start>,
    pub packet_map_change: Option<Bytes>,
    pub packet_map_patches: Option<Bytes>,
    pub packet_season: Option<Bytes>,
    pub packet_mobile_update: Option<MobileUpdate>,
    pub packet_global_light: Option<Bytes>,
    pub packet_personal_light: Option<Bytes>,
    pub packet_war_mode: Option<Bytes>,
    pub packet_target: Option<Bytes>,

    items: FxHashMap<Serial, Item>,
    mobiles: FxHashMap<Serial, Mobile>,
    item_attach_sequence: u32,
    capacity: usize,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            packet_start: None,
            packet_map_change: None,
            packet_map_patches: None,
            packet_season: None,
            packet_mobile_update: None,
            packet_global_light: None,
            packet_personal_light: None,
            packet_war_mode: None,
            packet_target: None,
            items: FxHashMap::default(),
            mobiles: FxHashMap::default(),
            item_attach_sequence: 0,
            capacity,
        }
    }

    pub fn player_serial(&self) -> Option<Serial> {
        self.packet_start.as_ref().map(|p| p.serial)
    }

    pub fn find_item(&self, serial: Serial) -> Option<&Item> {
        self.items.get(&serial)
    }

    pub fn find_mobile(&self, serial: Serial) -> Option<&Mobile> {
        self.mobiles.get(&serial)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn mobiles(&self) -> impl Iterator<Item = &Mobile> {
        self.mobiles.values()
    }

    /// Drop all items and mobiles, keeping the ambient packets. Used when a
    /// rebuilt upstream session is about to repopulate the mirror.
    pub fn clear_entities(&mut self) {
        self.items.clear();
        self.mobiles.clear();
    }

    fn at_capacity(&self) -> bool {
        self.items.len() + self.mobiles.len() >= self.capacity
    }

    /// Insert-or-find. `None` when the mirror is at capacity; the caller
    /// skips the update and the mirror stays lossy but consistent.
    fn make_item(&mut self, serial: Serial) -> Option<&mut Item> {
        if !self.items.contains_key(&serial) {
            if self.at_capacity() {
                warn!("world mirror full, dropping item 0x{serial:08x}");
                return None;
            }
            self.items.insert(serial, Item::new(serial));
        }
        self.items.get_mut(&serial)
    }

    fn make_mobile(&mut self, serial: Serial) -> Option<&mut Mobile> {
        if !self.mobiles.contains_key(&serial) {
            if self.at_capacity() {
                warn!("world mirror full, dropping mobile 0x{serial:08x}");
                return None;
            }
            self.mobiles.insert(serial, Mobile::new(serial));
        }
        self.mobiles.get_mut(&serial)
    }

    /* items */

    pub fn upsert_world_item(&mut self, p: &WorldItem) {
        self.upsert_world_item_7(&bridge::world_item_to_7(p));
    }

    pub fn upsert_world_item_7(&mut self, p: &WorldItem7) {
        if let Some(item) = self.make_item(p.serial) {
            item.socket = Some(ItemSocket::Ground(p.clone()));
        }
    }

    pub fn upsert_equip(&mut self, p: &Equip) {
        if let Some(item) = self.make_item(p.serial) {
            item.socket = Some(ItemSocket::Equipped(p.clone()));
        }
    }

    pub fn upsert_container_update(&mut self, p: &ContainerUpdate) {
        if let Some(item) = self.make_item(p.serial) {
            item.socket = Some(ItemSocket::Container(p.clone()));
        }
    }

    /// Store the container-open record for an item; the socket is untouched.
    /// `data` must be the 7-byte base form (revision-7 extensions are
    /// stripped by the caller).
    pub fn open_container(&mut self, data: &[u8]) {
        let Some(p) = ContainerOpen::parse(data) else {
            warn!("dropping malformed container-open");
            return;
        };
        if let Some(item) = self.make_item(p.serial) {
            item.container_open = Some(data[..7].to_vec());
        }
    }

    /// Replace the full content of a container. Children get the new attach
    /// generation; anything previously inside that missed it is deleted.
    /// This is the only way silent removals from a container are noticed.
    pub fn replace_container_content(&mut self, p: &ContainerContent) {
        self.item_attach_sequence = self.item_attach_sequence.wrapping_add(1);
        let attach_sequence = self.item_attach_sequence;

        for child in &p.items {
            let Some(item) = self.make_item(child.serial) else {
                continue;
            };
            item.socket = Some(ItemSocket::Container(child.clone()));
            item.attach_sequence = attach_sequence;
        }

        // All entries of one packet share the parent; use the first.
        if let Some(first) = p.items.first() {
            let parent_serial = first.parent_serial;
            let stale: Vec<Serial> = self
                .items
                .values()
                .filter(|i| {
                    i.parent_serial() == Some(parent_serial)
                        && i.attach_sequence != attach_sequence
                })
                .map(|i| i.serial)
                .collect();
            for serial in stale {
                self.items.remove(&serial);
            }
        }
    }

    /// Deep-delete all items whose ancestry chain passes through `parent`.
    fn remove_item_tree(&mut self, parent_serial: Serial) {
        let children: Vec<Serial> = self
            .items
            .values()
            .filter(|i| i.parent_serial() == Some(parent_serial))
            .map(|i| i.serial)
            .collect();
        for serial in children {
            self.items.remove(&serial);
            self.remove_item_tree(serial);
        }
    }

    /// Remove whatever entity `serial` names, and everything it contains or
    /// wears.
    pub fn remove_serial(&mut self, serial: Serial) {
        if serial_is_mobile(serial) {
            self.mobiles.remove(&serial);
            self.remove_item_tree(serial);
        } else if serial_is_item(serial) {
            self.items.remove(&serial);
            self.remove_item_tree(serial);
        }
    }

    /* mobiles */

    pub fn upsert_mobile_incoming(&mut self, data: &[u8]) {
        let Some(view) = MobileIncomingView::new(data) else {
            warn!("dropping malformed mobile-incoming");
            return;
        };
        let serial = view.serial();

        if self.player_serial() == Some(serial) {
            if let Some(start) = self.packet_start.as_mut() {
                start.body = view.body();
                start.x = view.x();
                start.y = view.y();
                start.z = view.z() as i16;
                start.direction = view.direction();
            }

            let update = self.packet_mobile_update.get_or_insert(MobileUpdate {
                serial,
                body: 0,
                hue: 0,
                flags: 0,
                x: 0,
                y: 0,
                direction: 0,
                z: 0,
            });
            update.body = view.body();
            update.hue = view.hue();
            update.flags = view.flags();
            update.x = view.x();
            update.y = view.y();
            update.direction = view.direction();
            update.z = view.z();
        }

        let equipment = view.equipment();

        if let Some(mobile) = self.make_mobile(serial) {
            mobile.incoming = Some(data.to_vec());
        }

        // The embedded equipment list doubles as a batch of equip packets.
        for entry in equipment {
            self.upsert_equip(&Equip {
                serial: entry.serial,
                item_id: entry.item_id,
                layer: entry.layer,
                parent_serial: serial,
                hue: entry.hue,
            });
        }
    }

    /// Monotone by the status form's capability flags: a less detailed
    /// record never replaces a more detailed one. XXX the flags byte is a
    /// crude probe for how much detail the form carries.
    pub fn upsert_mobile_status(&mut self, data: &[u8]) {
        let Some(view) = MobileStatusView::new(data) else {
            warn!("dropping malformed mobile-status");
            return;
        };
        let serial = view.serial();
        let flags = view.flags();
        let Some(mobile) = self.make_mobile(serial) else {
            return;
        };
        let keep = mobile
            .status
            .as_deref()
            .and_then(MobileStatusView::new)
            .map(|stored| stored.flags() > flags)
            .unwrap_or(false);
        if !keep {
            mobile.status = Some(data.to_vec());
        }
    }

    fn patch_player_from_update(&mut self, p: &MobileUpdate) {
        if let Some(start) = self.packet_start.as_mut() {
            start.body = p.body;
            start.x = p.x;
            start.y = p.y;
            start.z = p.z as i16;
            start.direction = p.direction;
        }
        self.packet_mobile_update = Some(p.clone());
    }

    pub fn update_mobile_update(&mut self, p: &MobileUpdate) {
        if self.player_serial() == Some(p.serial) {
            self.patch_player_from_update(p);
        }

        let Some(mobile) = self.mobiles.get_mut(&p.serial) else {
            warn!("mobile-update for unknown mobile 0x{:08x}", p.serial);
            return;
        };
        if let Some(incoming) = mobile.incoming.as_mut() {
            if let Some(mut patch) = MobileIncomingMut::new(incoming) {
                patch.set_body(p.body);
                patch.set_position(p.x, p.y);
                patch.set_z(p.z);
                patch.set_direction(p.direction);
                patch.set_hue(p.hue);
                patch.set_flags(p.flags);
            }
        }
    }

    pub fn update_mobile_moving(&mut self, p: &MobileMoving) {
        if self.player_serial() == Some(p.serial) {
            self.patch_player_from_update(&MobileUpdate {
                serial: p.serial,
                body: p.body,
                hue: p.hue,
                flags: p.flags,
                x: p.x,
                y: p.y,
                direction: p.direction,
                z: p.z,
            });
        }

        let Some(mobile) = self.mobiles.get_mut(&p.serial) else {
            warn!("mobile-moving for unknown mobile 0x{:08x}", p.serial);
            return;
        };
        if let Some(incoming) = mobile.incoming.as_mut() {
            if let Some(mut patch) = MobileIncomingMut::new(incoming) {
                patch.set_body(p.body);
                patch.set_position(p.x, p.y);
                patch.set_z(p.z);
                patch.set_direction(p.direction);
                patch.set_hue(p.hue);
                patch.set_flags(p.flags);
                patch.set_notoriety(p.notoriety);
            }
        }
    }

    /// Subserver change: only the ambient player position moves. The update
    /// snapshot's z is a single byte, so the 16-bit zone z narrows.
    pub fn zone_change(&mut self, p: &ZoneChange) {
        if let Some(start) = self.packet_start.as_mut() {
            start.x = p.x;
            start.y = p.y;
            start.z = p.z;
        }
        if let Some(update) = self.packet_mobile_update.as_mut() {
            update.x = p.x;
            update.y = p.y;
            update.z = p.z as i8;
        }
    }

    fn patch_player_position(&mut self, x: u16, y: u16, direction: u8, notoriety: Option<u8>) {
        let Some(start) = self.packet_start.as_mut() else {
            return;
        };
        start.x = x;
        start.y = y;
        start.direction = direction;

        if let Some(update) = self.packet_mobile_update.as_mut() {
            update.x = x;
            update.y = y;
            update.direction = direction;
        }

        let player = start.serial;
        if let Some(mobile) = self.mobiles.get_mut(&player) {
            if let Some(incoming) = mobile.incoming.as_mut() {
                if let Some(mut patch) = MobileIncomingMut::new(incoming) {
                    patch.set_position(x, y);
                    patch.set_direction(direction);
                    if let Some(notoriety) = notoriety {
                        patch.set_notoriety(notoriety);
                    }
                }
            }
        }
    }

    /// The server acknowledged a walk: the player stands here now.
    pub fn walked(&mut self, x: u16, y: u16, direction: u8, notoriety: u8) {
        self.patch_player_position(x, y, direction, Some(notoriety));
    }

    /// The server rejected a walk and reset the player here.
    pub fn walk_cancel(&mut self, x: u16, y: u16, direction: u8) {
        self.patch_player_position(x, y, direction, None);
    }

    /* attach replay */

    /// The packet stream that brings a fresh client up to the mirror's
    /// state: ambient packets first, then mobiles, then items grouped
    /// ground / container / equipped, each container's open record just
    /// before its children.
    pub fn bootstrap_packets(&self, protocol: ProtocolVersion) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        if let Some(p) = &self.packet_start {
            out.push(p.encode());
        }
        for blob in [
            &self.packet_map_change,
            &self.packet_map_patches,
            &self.packet_season,
        ] {
            if let Some(blob) = blob {
                out.push(blob.to_vec());
            }
        }
        if let Some(p) = &self.packet_mobile_update {
            out.push(p.encode());
        }
        for blob in [
            &self.packet_global_light,
            &self.packet_personal_light,
            &self.packet_war_mode,
            &self.packet_target,
        ] {
            if let Some(blob) = blob {
                out.push(blob.to_vec());
            }
        }

        let mut mobile_serials: Vec<Serial> = self.mobiles.keys().copied().collect();
        mobile_serials.sort_unstable();
        for serial in mobile_serials {
            let mobile = &self.mobiles[&serial];
            if let Some(incoming) = &mobile.incoming {
                out.push(incoming.clone());
            }
            if let Some(status) = &mobile.status {
                out.push(status.clone());
            }
        }

        let mut item_serials: Vec<Serial> = self.items.keys().copied().collect();
        item_serials.sort_unstable();

        for &serial in &item_serials {
            if let Some(ItemSocket::Ground(p)) = &self.items[&serial].socket {
                out.push(match protocol {
                    ProtocolVersion::V7 => p.encode(),
                    ProtocolVersion::V6 => bridge::world_item_from_7(p).encode(),
                });
            }
        }

        let mut parents: Vec<Serial> = Vec::new();
        for &serial in &item_serials {
            if let Some(ItemSocket::Container(p)) = &self.items[&serial].socket {
                if !parents.contains(&p.parent_serial) {
                    parents.push(p.parent_serial);
                }
            }
        }
        parents.sort_unstable();
        for parent in parents {
            if let Some(open) = self
                .items
                .get(&parent)
                .and_then(|i| i.container_open.as_deref())
            {
                out.push(match protocol {
                    ProtocolVersion::V7 => {
                        bridge::container_open_to_7(open).unwrap_or_else(|| open.to_vec())
                    }
                    ProtocolVersion::V6 => open.to_vec(),
                });
            }
            for &serial in &item_serials {
                if let Some(ItemSocket::Container(p)) = &self.items[&serial].socket {
                    if p.parent_serial == parent {
                        out.push(p.encode());
                    }
                }
            }
        }

        for &serial in &item_serials {
            if let Some(ItemSocket::Equipped(p)) = &self.items[&serial].socket {
                out.push(p.encode());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::opcode;

    fn ground_item_7(serial: Serial, x: u16, y: u16) -> WorldItem7 {
        WorldItem7 {
            kind: 0,
            serial,
            item_id: 0x0eed,
            direction: 0,
            amount: 0,
            x,
            y,
            z: 0,
            layer: 0,
            hue: 0,
            flags: 0,
        }
    }

    fn container_child(serial: Serial, parent_serial: Serial) -> ContainerUpdate {
        ContainerUpdate {
            serial,
            item_id: 0x0f0e,
            amount: 1,
            x: 10,
            y: 10,
            grid: 0,
            parent_serial,
            hue: 0,
        }
    }

    fn equip_on(serial: Serial, parent_serial: Serial) -> Equip {
        Equip {
            serial,
            item_id: 0x1515,
            layer: 0x05,
            parent_serial,
            hue: 0,
        }
    }

    fn start_for(serial: Serial) -> Start {
        Start {
            serial,
            body: 0x0190,
            x: 100,
            y: 200,
            z: 3,
            direction: 2,
            flags: 0,
            map_width: 6144,
            map_height: 4096,
        }
    }

    fn mobile_incoming_blob(serial: Serial, x: u16, y: u16, equipment: &[(Serial, u16, u8)]) -> Vec<u8> {
        let mut data = vec![0u8; 19];
        data[0] = opcode::MOBILE_INCOMING;
        data[3..7].copy_from_slice(&serial.to_be_bytes());
        data[7..9].copy_from_slice(&0x0190u16.to_be_bytes());
        data[9..11].copy_from_slice(&x.to_be_bytes());
        data[11..13].copy_from_slice(&y.to_be_bytes());
        data[13] = 3; // z
        data[14] = 2; // direction
        data[18] = 1; // notoriety
        for &(item_serial, item_id, layer) in equipment {
            data.extend_from_slice(&item_serial.to_be_bytes());
            data.extend_from_slice(&item_id.to_be_bytes());
            data.push(layer);
        }
        data.extend_from_slice(&0u32.to_be_bytes());
        let len = data.len() as u16;
        data[1..3].copy_from_slice(&len.to_be_bytes());
        data
    }

    fn mobile_status_blob(serial: Serial, flags: u8) -> Vec<u8> {
        let mut data = vec![0u8; 43];
        data[0] = opcode::MOBILE_STATUS;
        data[3..7].copy_from_slice(&serial.to_be_bytes());
        data[7..14].copy_from_slice(b"someone");
        data[42] = flags;
        let len = data.len() as u16;
        data[1..3].copy_from_slice(&len.to_be_bytes());
        data
    }

    #[test]
    fn serial_namespace_partition() {
        assert!(serial_is_mobile(0x0000_0001));
        assert!(serial_is_mobile(0x3fff_ffff));
        assert!(!serial_is_mobile(0x4000_0000));
        assert!(serial_is_item(0x4000_0000));
        assert!(serial_is_item(0x7fff_ffff));
        assert!(!serial_is_item(0x8000_0000));
    }

    #[test]
    fn ground_then_container_moves_socket() {
        let mut world = World::new();
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 10, 20));
        world.upsert_container_update(&container_child(0x4000_0001, 0x4000_0002));

        assert_eq!(world.items().count(), 1);
        let item = world.find_item(0x4000_0001).unwrap();
        assert!(matches!(item.socket, Some(ItemSocket::Container(_))));
        assert_eq!(item.parent_serial(), Some(0x4000_0002));
    }

    #[test]
    fn container_content_sweeps_stale_children() {
        let mut world = World::new();
        world.replace_container_content(&ContainerContent {
            items: vec![
                container_child(0x4000_0011, 0x4000_0010),
                container_child(0x4000_0012, 0x4000_0010),
            ],
        });
        assert!(world.find_item(0x4000_0011).is_some());
        assert!(world.find_item(0x4000_0012).is_some());
        let first_generation = world.find_item(0x4000_0012).unwrap().attach_sequence;

        world.replace_container_content(&ContainerContent {
            items: vec![container_child(0x4000_0012, 0x4000_0010)],
        });
        assert!(world.find_item(0x4000_0011).is_none());
        let kept = world.find_item(0x4000_0012).unwrap();
        assert_ne!(kept.attach_sequence, first_generation);

        // Children of other containers are untouched by the sweep.
        world.upsert_container_update(&container_child(0x4000_0021, 0x4000_0020));
        world.replace_container_content(&ContainerContent {
            items: vec![container_child(0x4000_0012, 0x4000_0010)],
        });
        assert!(world.find_item(0x4000_0021).is_some());
    }

    #[test]
    fn remove_serial_is_recursive() {
        let mut world = World::new();
        world.upsert_equip(&equip_on(0x4000_0020, 0x0000_0001));
        world.upsert_container_update(&container_child(0x4000_0021, 0x4000_0020));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0001, 50, 60, &[]));

        world.remove_serial(0x0000_0001);
        assert!(world.find_mobile(0x0000_0001).is_none());
        assert!(world.find_item(0x4000_0020).is_none());
        assert!(world.find_item(0x4000_0021).is_none());
    }

    #[test]
    fn remove_serial_classifies_by_namespace() {
        let mut world = World::new();
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 1, 1));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0001, 1, 1, &[]));

        world.remove_serial(0x4000_0001);
        assert!(world.find_item(0x4000_0001).is_none());
        assert!(world.find_mobile(0x0000_0001).is_some());

        // Serials outside both namespaces are not managed.
        world.remove_serial(0x8000_0001);
        assert!(world.find_mobile(0x0000_0001).is_some());
    }

    #[test]
    fn one_record_per_serial() {
        let mut world = World::new();
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 1, 1));
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 2, 2));
        world.upsert_equip(&equip_on(0x4000_0001, 0x0000_0001));
        assert_eq!(world.items().count(), 1);
        assert!(matches!(
            world.find_item(0x4000_0001).unwrap().socket,
            Some(ItemSocket::Equipped(_))
        ));
    }

    #[test]
    fn legacy_world_item_masks_high_bit() {
        let mut world = World::new();
        let p = WorldItem {
            serial: 0x4000_0001,
            item_id: 1,
            amount: 3,
            x: 7,
            y: 8,
            direction: 0,
            z: 0,
            hue: 0,
            flags: 0,
        };
        // Parse path delivers the masked serial; storage is the rev-7 form.
        world.upsert_world_item(&p);
        let item = world.find_item(0x4000_0001).unwrap();
        match &item.socket {
            Some(ItemSocket::Ground(g)) => {
                assert_eq!(g.x, 7);
                assert_eq!(g.amount, 3);
            }
            other => panic!("unexpected socket {other:?}"),
        }
    }

    #[test]
    fn mobile_status_is_monotone_by_flags() {
        let mut world = World::new();
        world.upsert_mobile_status(&mobile_status_blob(0x0000_0001, 4));
        world.upsert_mobile_status(&mobile_status_blob(0x0000_0001, 2));
        let mobile = world.find_mobile(0x0000_0001).unwrap();
        let stored = MobileStatusView::new(mobile.status.as_deref().unwrap()).unwrap();
        // The less detailed form lost; known-conservative replacement rule.
        assert_eq!(stored.flags(), 4);

        world.upsert_mobile_status(&mobile_status_blob(0x0000_0001, 4));
        world.upsert_mobile_status(&mobile_status_blob(0x0000_0001, 6));
        let mobile = world.find_mobile(0x0000_0001).unwrap();
        let stored = MobileStatusView::new(mobile.status.as_deref().unwrap()).unwrap();
        assert_eq!(stored.flags(), 6);
    }

    #[test]
    fn mobile_incoming_synthesizes_equipment() {
        let mut world = World::new();
        world.upsert_mobile_incoming(&mobile_incoming_blob(
            0x0000_0002,
            100,
            100,
            &[(0x4000_0030, 0x1515, 0x05), (0x4000_0031, 0x203c, 0x0b)],
        ));
        let worn = world.find_item(0x4000_0030).unwrap();
        assert_eq!(worn.parent_serial(), Some(0x0000_0002));
        assert!(matches!(worn.socket, Some(ItemSocket::Equipped(_))));
        assert!(world.find_item(0x4000_0031).is_some());
    }

    #[test]
    fn player_snapshots_stay_in_agreement() {
        let mut world = World::new();
        world.packet_start = Some(start_for(0x0000_0042));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0042, 321, 654, &[]));

        let start = world.packet_start.as_ref().unwrap();
        let update = world.packet_mobile_update.as_ref().unwrap();
        assert_eq!((start.x, start.y, start.direction), (321, 654, 2));
        assert_eq!((update.x, update.y, update.direction), (321, 654, 2));
        assert_eq!(start.body, update.body);
        // Same value, different width: start keeps a 16-bit z, the update a
        // single byte.
        assert_eq!(start.z, 3);
        assert_eq!(update.z, 3);

        world.update_mobile_update(&MobileUpdate {
            serial: 0x0000_0042,
            body: 0x0190,
            hue: 5,
            flags: 0,
            x: 400,
            y: 500,
            direction: 6,
            z: -10,
        });
        let start = world.packet_start.as_ref().unwrap();
        let update = world.packet_mobile_update.as_ref().unwrap();
        assert_eq!((start.x, start.y, start.direction), (400, 500, 6));
        assert_eq!((update.x, update.y, update.direction), (400, 500, 6));
        assert_eq!(start.z, -10);
        assert_eq!(update.z, -10);
    }

    #[test]
    fn zone_change_narrows_update_z() {
        let mut world = World::new();
        world.packet_start = Some(start_for(0x0000_0042));
        world.packet_mobile_update = Some(MobileUpdate {
            serial: 0x0000_0042,
            body: 0x0190,
            hue: 0,
            flags: 0,
            x: 0,
            y: 0,
            direction: 0,
            z: 0,
        });
        world.zone_change(&ZoneChange { x: 11, y: 22, z: 33 });

        let start = world.packet_start.as_ref().unwrap();
        assert_eq!((start.x, start.y, start.z), (11, 22, 33));
        let update = world.packet_mobile_update.as_ref().unwrap();
        assert_eq!((update.x, update.y, update.z), (11, 22, 33));
        assert!(world.mobiles().count() == 0);
    }

    #[test]
    fn walked_patches_player_record() {
        let mut world = World::new();
        world.packet_start = Some(start_for(0x0000_0042));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0042, 100, 200, &[]));

        world.walked(101, 200, 2, 6);
        let start = world.packet_start.as_ref().unwrap();
        assert_eq!((start.x, start.y, start.direction), (101, 200, 2));
        let mobile = world.find_mobile(0x0000_0042).unwrap();
        let view = MobileIncomingView::new(mobile.incoming.as_deref().unwrap()).unwrap();
        assert_eq!((view.x(), view.y(), view.direction()), (101, 200, 2));
        assert_eq!(view.notoriety(), 6);

        world.walk_cancel(99, 199, 4);
        let view_data = world
            .find_mobile(0x0000_0042)
            .unwrap()
            .incoming
            .clone()
            .unwrap();
        let view = MobileIncomingView::new(&view_data).unwrap();
        assert_eq!((view.x(), view.y(), view.direction()), (99, 199, 4));
        // Cancel carries no notoriety.
        assert_eq!(view.notoriety(), 6);
    }

    #[test]
    fn unknown_mobile_update_creates_nothing() {
        let mut world = World::new();
        world.update_mobile_update(&MobileUpdate {
            serial: 0x0000_0099,
            body: 1,
            hue: 0,
            flags: 0,
            x: 0,
            y: 0,
            direction: 0,
            z: 0,
        });
        assert!(world.find_mobile(0x0000_0099).is_none());
    }

    #[test]
    fn capacity_guard_skips_inserts() {
        let mut world = World::with_capacity(2);
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 1, 1));
        world.upsert_world_item_7(&ground_item_7(0x4000_0002, 2, 2));
        world.upsert_world_item_7(&ground_item_7(0x4000_0003, 3, 3));
        assert_eq!(world.items().count(), 2);
        assert!(world.find_item(0x4000_0003).is_none());
        // Updates to existing entries still land.
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 9, 9));
        match &world.find_item(0x4000_0001).unwrap().socket {
            Some(ItemSocket::Ground(g)) => assert_eq!(g.x, 9),
            other => panic!("unexpected socket {other:?}"),
        }
    }

    fn apply(world: &mut World, packet: &[u8]) {
        match packet[0] {
            opcode::START => world.packet_start = Start::parse(packet),
            opcode::MOBILE_UPDATE => {
                world.packet_mobile_update = MobileUpdate::parse(packet);
            }
            opcode::SEASON => world.packet_season = Some(Bytes::copy_from_slice(packet)),
            opcode::WAR_MODE => world.packet_war_mode = Some(Bytes::copy_from_slice(packet)),
            opcode::GLOBAL_LIGHT_LEVEL => {
                world.packet_global_light = Some(Bytes::copy_from_slice(packet));
            }
            opcode::MOBILE_INCOMING => world.upsert_mobile_incoming(packet),
            opcode::MOBILE_STATUS => world.upsert_mobile_status(packet),
            opcode::WORLD_ITEM_7 => {
                world.upsert_world_item_7(&WorldItem7::parse(packet).unwrap());
            }
            opcode::CONTAINER_OPEN => world.open_container(&packet[..7]),
            opcode::CONTAINER_UPDATE => {
                world.upsert_container_update(&ContainerUpdate::parse(packet).unwrap());
            }
            opcode::EQUIP => world.upsert_equip(&Equip::parse(packet).unwrap()),
            other => panic!("replay produced unexpected opcode 0x{other:02x}"),
        }
    }

    #[test]
    fn bootstrap_replay_order() {
        let mut world = World::new();
        world.packet_start = Some(start_for(0x0000_0042));
        world.packet_season = Some(Bytes::from_static(&[opcode::SEASON, 1, 1]));
        world.packet_war_mode = Some(Bytes::from_static(&[opcode::WAR_MODE, 0, 0, 32, 0]));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0042, 100, 200, &[]));
        world.upsert_mobile_incoming(&mobile_incoming_blob(0x0000_0002, 50, 50, &[]));
        world.upsert_mobile_status(&mobile_status_blob(0x0000_0002, 4));
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 10, 20));
        world.open_container(
            &ContainerOpen {
                serial: 0x4000_0010,
                gump_id: 0x3c,
            }
            .encode(),
        );
        world.replace_container_content(&ContainerContent {
            items: vec![container_child(0x4000_0011, 0x4000_0010)],
        });
        world.upsert_equip(&equip_on(0x4000_0020, 0x0000_0042));

        let packets = world.bootstrap_packets(ProtocolVersion::V7);
        let opcodes: Vec<u8> = packets.iter().map(|p| p[0]).collect();
        assert_eq!(
            opcodes,
            vec![
                opcode::START,
                opcode::SEASON,
                opcode::MOBILE_UPDATE,
                opcode::WAR_MODE,
                opcode::MOBILE_INCOMING, // 0x...02
                opcode::MOBILE_STATUS,
                opcode::MOBILE_INCOMING, // player
                opcode::WORLD_ITEM_7,
                opcode::CONTAINER_OPEN,
                opcode::CONTAINER_UPDATE,
                opcode::EQUIP,
            ]
        );

        // The container-open form for a revision-7 client carries the
        // extension bytes.
        let open = packets.iter().find(|p| p[0] == opcode::CONTAINER_OPEN).unwrap();
        assert_eq!(open.len(), 9);

        let v6_packets = world.bootstrap_packets(ProtocolVersion::V6);
        let ground = v6_packets.iter().find(|p| p[0] == opcode::WORLD_ITEM).unwrap();
        assert!(WorldItem::parse(ground).is_some());
        let open = v6_packets.iter().find(|p| p[0] == opcode::CONTAINER_OPEN).unwrap();
        assert_eq!(open.len(), 7);
    }

    #[test]
    fn replaying_bootstrap_rebuilds_equal_mirror() {
        let mut world = World::new();
        world.packet_start = Some(start_for(0x0000_0042));
        world.packet_global_light = Some(Bytes::from_static(&[opcode::GLOBAL_LIGHT_LEVEL, 20]));
        world.upsert_mobile_incoming(&mobile_incoming_blob(
            0x0000_0042,
            100,
            200,
            &[(0x4000_0030, 0x1515, 0x05)],
        ));
        world.upsert_mobile_status(&mobile_status_blob(0x0000_0042, 4));
        world.upsert_world_item_7(&ground_item_7(0x4000_0001, 10, 20));
        world.open_container(
            &ContainerOpen {
                serial: 0x4000_0010,
                gump_id: 0x3c,
            }
            .encode(),
        );
        world.replace_container_content(&ContainerContent {
            items: vec![
                container_child(0x4000_0011, 0x4000_0010),
                container_child(0x4000_0012, 0x4000_0010),
            ],
        });

        let mut rebuilt = World::new();
        for packet in world.bootstrap_packets(ProtocolVersion::V7) {
            apply(&mut rebuilt, &packet);
        }

        assert_eq!(rebuilt.packet_start, world.packet_start);
        assert_eq!(rebuilt.packet_mobile_update, world.packet_mobile_update);
        assert_eq!(rebuilt.packet_global_light, world.packet_global_light);
        assert_eq!(rebuilt.mobiles().count(), world.mobiles().count());
        assert_eq!(rebuilt.items().count(), world.items().count());
        for item in world.items() {
            let twin = rebuilt.find_item(item.serial).unwrap();
            assert_eq!(twin.socket, item.socket);
            assert_eq!(twin.container_open, item.container_open);
        }
        for mobile in world.mobiles() {
            let twin = rebuilt.find_mobile(mobile.serial).unwrap();
            assert_eq!(twin.incoming, mobile.incoming);
            assert_eq!(twin.status, mobile.status);
        }
    }
}
