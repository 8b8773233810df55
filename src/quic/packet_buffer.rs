//! Reliability bookkeeping: sent packets awaiting acknowledgement and
//! received packet numbers awaiting an outgoing ACK.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use super::frame::{AckBlock, AckFrame, Frame};
use super::packet::{Packet, PacketNumber};
use crate::crypto::EncryptionLevel;

/// Per encryption level state. Each level is its own packet number space.
#[derive(Debug, Default)]
struct PacketSpace {
    /// Sent full packets not yet acknowledged by the peer
    sent: BTreeMap<PacketNumber, Packet>,
    largest_acked: Option<PacketNumber>,
    /// Received packet numbers not yet covered by an ACK we sent
    pending_acks: BTreeSet<PacketNumber>,
    /// Set when an ack-eliciting packet arrived since the last ACK went out
    ack_needed: bool,
}

impl PacketSpace {
    fn ack_blocks(&self) -> Vec<AckBlock> {
        let mut blocks: Vec<AckBlock> = Vec::new();
        for &pn in &self.pending_acks {
            match blocks.last_mut() {
                Some(block) if block.largest.next() == pn => block.largest = pn,
                _ => blocks.push(AckBlock::single(pn)),
            }
        }
        blocks
    }
}

#[derive(Debug, Default)]
pub struct PacketBuffer {
    spaces: [PacketSpace; 3],
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, level: EncryptionLevel) -> &PacketSpace {
        &self.spaces[level.index()]
    }

    fn space_mut(&mut self, level: EncryptionLevel) -> &mut PacketSpace {
        &mut self.spaces[level.index()]
    }

    /// Record an outgoing packet. Full packets are kept until acknowledged,
    /// except ack-only packets which are never themselves acked.
    pub fn on_sent(&mut self, packet: &Packet) {
        let Some(pn) = packet.packet_number() else {
            return;
        };
        let ack_only = packet.payload().is_some_and(|p| p.is_ack_only());
        let space = self.space_mut(packet.encryption_level());

        // Any ACK in the packet covers everything pending at this level
        if let Some(payload) = packet.payload() {
            for frame in payload.frames() {
                if let Frame::Ack(ack) = frame {
                    space.pending_acks.retain(|pn| !ack.acknowledges(*pn));
                    space.ack_needed = false;
                }
            }
        }

        if !ack_only {
            space.sent.insert(pn, packet.clone());
            trace!("Buffered sent packet {} at {:?}", pn, packet.encryption_level());
        }
    }

    /// Account for a received, successfully decrypted packet.
    pub fn on_received(&mut self, packet: &Packet) {
        let Some(pn) = packet.packet_number() else {
            return;
        };
        let Some(payload) = packet.payload() else {
            return;
        };
        let level = packet.encryption_level();
        let space = self.space_mut(level);

        let mut ack_eliciting = false;
        for frame in payload.frames() {
            match frame {
                Frame::Ack(ack) => {
                    let before = space.sent.len();
                    space.sent.retain(|pn, _| !ack.acknowledges(*pn));
                    let largest = ack.largest();
                    if space.largest_acked.is_none_or(|current| largest > current) {
                        space.largest_acked = Some(largest);
                    }
                    debug!(
                        "ACK at {:?} retired {} packets, largest acked {}",
                        level,
                        before - space.sent.len(),
                        largest
                    );
                }
                other => ack_eliciting |= other.is_ack_eliciting(),
            }
        }

        space.pending_acks.insert(pn);
        if ack_eliciting {
            space.ack_needed = true;
        }
    }

    /// Whether an ACK should be sent at `level`.
    pub fn needs_ack(&self, level: EncryptionLevel) -> bool {
        let space = self.space(level);
        space.ack_needed && !space.pending_acks.is_empty()
    }

    /// Pending received packet numbers coalesced into ascending,
    /// non-adjacent blocks.
    pub fn pending_ack_blocks(&self, level: EncryptionLevel) -> Vec<AckBlock> {
        self.space(level).ack_blocks()
    }

    /// Build an ACK frame for everything pending at `level` and clear the
    /// pending set. `None` when nothing is pending.
    pub fn take_ack_frame(&mut self, level: EncryptionLevel) -> Option<Frame> {
        let space = self.space_mut(level);
        let blocks = space.ack_blocks();
        let frame = AckFrame::new(0, blocks).ok()?;
        space.pending_acks.clear();
        space.ack_needed = false;
        Some(Frame::Ack(frame))
    }

    pub fn largest_acked(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        self.space(level).largest_acked
    }

    pub fn unacked(&self, level: EncryptionLevel) -> impl Iterator<Item = &Packet> {
        self.space(level).sent.values()
    }

    pub fn unacked_count(&self) -> usize {
        self.spaces.iter().map(|s| s.sent.len()).sum()
    }

    /// Drop all state for `level`, e.g. after a Retry restarts the Initial
    /// packet number space.
    pub fn reset(&mut self, level: EncryptionLevel) {
        *self.space_mut(level) = PacketSpace::default();
    }
}
