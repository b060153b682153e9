//! Walk coordination.
//!
//! Clients walk optimistically: each request carries a rolling one-byte
//! sequence number the server later acknowledges or cancels. With several
//! clients sharing one upstream session the proxy re-sequences requests
//! toward the server, remembers who asked, and routes the verdict back to
//! that client with its own sequence number restored.

use log::warn;

use crate::downstream::ClientId;
use crate::proto::views::{Walk, WalkAck, WalkCancel};
use crate::world::World;

pub const MAX_WALK_QUEUE: usize = 4;

/// Sequence numbers run 1..=255; zero is reserved as "unsent".
fn next_seq(seq: u8) -> u8 {
    if seq == 255 {
        1
    } else {
        seq + 1
    }
}

/// `a <= b` under the half-window rule: the 128 values before `b` count as
/// the past, the rest as the future.
fn seq_before_eq(a: u8, b: u8) -> bool {
    b.wrapping_sub(a) < 128
}

#[derive(Debug, Clone)]
struct WalkEntry {
    /// The request exactly as the client sent it, kept so the verdict can
    /// go back under the client's own sequence number.
    packet: Walk,
    /// The sequence number forwarded to the server.
    seq: u8,
    /// `None` once the requesting endpoint is gone; the verdict is then
    /// applied to the world but forwarded nowhere.
    owner: Option<ClientId>,
}

#[derive(Debug)]
pub struct WalkState {
    queue: Vec<WalkEntry>,
    seq_next: u8,
}

impl Default for WalkState {
    fn default() -> Self {
        Self::new()
    }
}

impl WalkState {
    pub fn new() -> Self {
        Self {
            queue: Vec::with_capacity(MAX_WALK_QUEUE),
            seq_next: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a client walk request. Returns the re-sequenced packet to
    /// forward upstream, or `None` when the queue is full and the request
    /// is dropped (the client's local prediction diverges; acceptable).
    pub fn request(&mut self, owner: ClientId, p: &Walk) -> Option<Walk> {
        if self.queue.len() >= MAX_WALK_QUEUE {
            return None;
        }

        let seq = match self.queue.last() {
            None => self.seq_next,
            Some(last) => next_seq(last.seq),
        };
        self.queue.push(WalkEntry {
            packet: *p,
            seq,
            owner: Some(owner),
        });
        self.seq_next = next_seq(seq);

        Some(Walk { seq, ..*p })
    }

    /// Server acknowledgement: pop everything up to the acknowledged
    /// sequence, move the player, and hand back the verdict for the owning
    /// client (with its own sequence number).
    pub fn ack(&mut self, p: &WalkAck, world: &mut World) -> Option<(ClientId, WalkAck)> {
        let mut last = None;
        while let Some(entry) = self.queue.first() {
            if !seq_before_eq(entry.seq, p.seq) {
                break;
            }
            last = Some(self.queue.remove(0));
        }

        let Some(entry) = last else {
            warn!("walk ack for unqueued seq {}", p.seq);
            return None;
        };

        if let Some(start) = world.packet_start.as_ref() {
            let mut x = start.x;
            let mut y = start.y;
            let direction = entry.packet.direction;
            // Requesting the current facing is a step; anything else only
            // turns the player in place.
            if start.direction & 0x07 == direction & 0x07 {
                match direction & 0x07 {
                    0 => y = y.wrapping_sub(1),
                    1 => {
                        x = x.wrapping_add(1);
                        y = y.wrapping_sub(1);
                    }
                    2 => x = x.wrapping_add(1),
                    3 => {
                        x = x.wrapping_add(1);
                        y = y.wrapping_add(1);
                    }
                    4 => y = y.wrapping_add(1),
                    5 => {
                        x = x.wrapping_sub(1);
                        y = y.wrapping_add(1);
                    }
                    6 => x = x.wrapping_sub(1),
                    _ => {
                        x = x.wrapping_sub(1);
                        y = y.wrapping_sub(1);
                    }
                }
            }
            world.walked(x, y, direction, p.notoriety);
        }

        entry.owner.map(|owner| {
            (
                owner,
                WalkAck {
                    seq: entry.packet.seq,
                    notoriety: p.notoriety,
                },
            )
        })
    }

    /// Server rejection: every pending walk is invalid. Flush the queue,
    /// reset the player, and hand back the cancel for the owning client.
    pub fn cancel(&mut self, p: &WalkCancel, world: &mut World) -> Option<(ClientId, WalkCancel)> {
        let head = self
            .queue
            .first()
            .map(|entry| (entry.owner, entry.packet.seq));
        self.queue.clear();

        world.walk_cancel(p.x, p.y, p.direction);

        match head {
            Some((Some(owner), client_seq)) => Some((
                owner,
                WalkCancel {
                    seq: client_seq,
                    ..*p
                },
            )),
            _ => None,
        }
    }

    /// An endpoint went zombie or was disposed: its pending walks stay in
    /// the queue, but their verdicts will only be applied, not forwarded.
    pub fn server_removed(&mut self, client: ClientId) {
        for entry in &mut self.queue {
            if entry.owner == Some(client) {
                entry.owner = None;
            }
        }
    }
}
