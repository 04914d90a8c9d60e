//! Packets a decoder has not accepted yet.
//!
//! A send/receive decoder refuses input while it holds undelivered output.
//! Refused packets wait here and are resent, in order, once output has been
//! drained, so no packet is lost when one packet decodes to several frames.

use std::collections::VecDeque;

/// Outcome of offering one packet to a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Output must be received before more input is taken
    Full,
}

/// FIFO of packets waiting for the decoder
#[derive(Debug)]
pub struct PacketBacklog<P> {
    packets: VecDeque<P>,
}

impl<P> Default for PacketBacklog<P> {
    fn default() -> Self {
        Self {
            packets: VecDeque::new(),
        }
    }
}

impl<P> PacketBacklog<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: P) {
        self.packets.push_back(packet);
    }

    /// Offers waiting packets in order until the decoder is full. A refused
    /// packet stays at the front; a packet that errors is removed.
    pub fn feed<E>(&mut self, mut offer: impl FnMut(&P) -> Result<Offer, E>) -> Result<(), E> {
        while let Some(front) = self.packets.front() {
            match offer(front) {
                Ok(Offer::Accepted) => {
                    self.packets.pop_front();
                }
                Ok(Offer::Full) => break,
                Err(e) => {
                    self.packets.pop_front();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits two frames per packet and takes no input while output is pending
    #[derive(Default)]
    struct TwoFramesPerPacket {
        output: VecDeque<u32>,
    }

    impl TwoFramesPerPacket {
        fn offer(&mut self, packet: u32) -> Result<Offer, String> {
            if packet == 99 {
                return Err("corrupt".into());
            }
            if !self.output.is_empty() {
                return Ok(Offer::Full);
            }
            self.output.extend([packet * 10, packet * 10 + 1]);
            Ok(Offer::Accepted)
        }
    }

    #[test]
    fn test_refused_packets_are_resent_in_order() {
        let mut decoder = TwoFramesPerPacket::default();
        let mut backlog = PacketBacklog::new();
        let mut frames = Vec::new();

        // One packet in, at most one frame out per step
        for packet in 0..5 {
            backlog.push(packet);
            backlog.feed(|p| decoder.offer(*p)).unwrap();
            frames.extend(decoder.output.pop_front());
        }
        while !backlog.is_empty() || !decoder.output.is_empty() {
            backlog.feed(|p| decoder.offer(*p)).unwrap();
            frames.extend(decoder.output.pop_front());
        }

        let expected: Vec<u32> = (0..5).flat_map(|p| [p * 10, p * 10 + 1]).collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_failed_packet_is_dropped() {
        let mut decoder = TwoFramesPerPacket::default();
        let mut backlog = PacketBacklog::new();
        backlog.push(99);
        backlog.push(1);

        assert!(backlog.feed(|p| decoder.offer(*p)).is_err());
        assert_eq!(backlog.len(), 1);
        backlog.feed(|p| decoder.offer(*p)).unwrap();
        assert!(backlog.is_empty());
        assert_eq!(decoder.output, [10, 11]);
    }

    #[test]
    fn test_clear() {
        let mut backlog = PacketBacklog::new();
        backlog.push(1);
        backlog.push(2);
        backlog.clear();
        assert!(backlog.is_empty());
    }
}
