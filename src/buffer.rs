//! FIFO of undecoded packets for the current run.
//!
//! Ownership alternates by protocol: the collection thread appends while
//! `Streaming`, the consumer drains after taking data-ready. The inner mutex
//! exists to make the type `Sync`; it is never contended under that protocol.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::Configuration;
use crate::device::RawPacket;

/// Packets drained from one run, with the configuration they were taken under.
#[derive(Debug, Clone)]
pub struct Drained {
    pub config: Configuration,
    pub packets: Vec<RawPacket>,
}

#[derive(Debug, Default)]
struct Inner {
    config: Option<Configuration>,
    packets: VecDeque<RawPacket>,
}

#[derive(Debug, Default)]
pub struct PacketBuffer {
    inner: Mutex<Inner>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discards anything left over and tags the buffer with a new run's snapshot.
    pub fn reset(&self, config: Configuration) {
        let mut inner = self.lock();
        inner.packets.clear();
        inner.config = Some(config);
    }

    pub fn push(&self, packet: RawPacket) {
        self.lock().packets.push_back(packet);
    }

    /// Takes every buffered packet in arrival order. `None` if no run has
    /// tagged the buffer yet.
    pub fn drain(&self) -> Option<Drained> {
        let mut inner = self.lock();
        let config = inner.config.clone()?;
        let packets = inner.packets.drain(..).collect();
        Some(Drained { config, packets })
    }

    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples held, summed over all channels.
    pub fn total_samples(&self) -> usize {
        self.lock().packets.iter().map(|p| p.num_samples).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(n: usize) -> RawPacket {
        RawPacket {
            num_samples: n,
            missed: 0,
            payload: vec![n as u8],
        }
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let buf = PacketBuffer::new();
        buf.reset(Configuration::default());
        for n in 1..=3 {
            buf.push(packet(n));
        }
        assert_eq!(buf.total_samples(), 6);

        let drained = buf.drain().unwrap();
        let order: Vec<usize> = drained.packets.iter().map(|p| p.num_samples).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn reset_discards_previous_run() {
        let buf = PacketBuffer::new();
        buf.reset(Configuration::default());
        buf.push(packet(5));
        let next = Configuration::new([1u8, 2], 1000, 1.0).unwrap();
        buf.reset(next.clone());
        let drained = buf.drain().unwrap();
        assert!(drained.packets.is_empty());
        assert_eq!(drained.config, next);
    }

    #[test]
    fn untagged_buffer_drains_nothing() {
        let buf = PacketBuffer::new();
        buf.push(packet(1));
        assert!(buf.drain().is_none());
    }
}
