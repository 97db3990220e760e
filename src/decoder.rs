//! Turns a drained packet buffer into a [`Window`].

use log::{debug, warn};

use crate::device::{ChannelSamples, DevicePort, RawPacket};
use crate::window::Window;

/// Decodes `packets` in arrival order and concatenates per channel.
///
/// Returns `None` when there is nothing to hand over: no packets, or packets
/// that decoded to no samples at all. `dropped` is the exact sum of the
/// packets' `missed` counts.
pub fn decode<D: DevicePort + ?Sized>(packets: &[RawPacket], rate: u32, device: &D) -> Option<Window> {
    if packets.is_empty() {
        return None;
    }

    let mut channels = ChannelSamples::new();
    let mut dropped = 0u64;
    for packet in packets {
        dropped += packet.missed;
        for (id, mut samples) in device.decode_packet(packet) {
            channels.entry(id).or_default().append(&mut samples);
        }
    }
    channels.retain(|_, samples| !samples.is_empty());

    if channels.is_empty() {
        warn!(
            "{} packets decoded to no samples ({} reported dropped)",
            packets.len(),
            dropped
        );
        return None;
    }

    let window = Window {
        rate,
        channels,
        dropped,
    };
    debug!(
        "decoded window: packets={}, channels={}, points={}, common={}, dropped={}",
        packets.len(),
        window.n_channels(),
        window.points(),
        window.common_len(),
        dropped
    );
    Some(window)
}
