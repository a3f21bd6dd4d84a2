// Wire-format decoding for the wearable's tagged radio packets.
//
// Every notification starts with a one-byte sensor tag and a 16-bit
// big-endian packet counter, followed by a fixed-size payload per tag:
//
//   0x01 EEG      4 ch × 12 samples, 12-bit packed, 0.48828125 µV/LSB
//   0x04 PPG      3 ch × 6 samples, 24-bit unsigned ADC counts
//   0x07 ACC      3 samples × 3 axes, i16 BE, 0.0000610352 g/LSB
//   0x08 BATTERY  u16 BE fuel-gauge reading, percent = raw / 512

use crate::types::SensorKind;

pub const TAG_EEG: u8 = 0x01;
pub const TAG_PPG: u8 = 0x04;
pub const TAG_ACC: u8 = 0x07;
pub const TAG_BATTERY: u8 = 0x08;

const HEADER_LEN: usize = 3;

/// Sensor kind for a wire tag, if the tag is known.
pub fn kind_for_tag(tag: u8) -> Option<SensorKind> {
    match tag {
        TAG_EEG => Some(SensorKind::Eeg),
        TAG_PPG => Some(SensorKind::Ppg),
        TAG_ACC => Some(SensorKind::Acc),
        TAG_BATTERY => Some(SensorKind::Battery),
        _ => None,
    }
}

const EEG_SCALE: f64 = 0.48828125;
const ACC_SCALE: f64 = 0.0000610352;

/// A decoded packet: the wire counter plus one frame per sample, each frame
/// holding one value per channel.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub kind: SensorKind,
    /// Raw 16-bit packet counter; wraps at 0xFFFF.
    pub wire_seq: u16,
    pub frames: Vec<Vec<f64>>,
}

/// Per-packet decode failure. Non-fatal: the caller counts it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown sensor tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("truncated {kind} payload: expected {expected} bytes, got {got}")]
    Truncated {
        kind: SensorKind,
        expected: usize,
        got: usize,
    },
}

/// Decode one radio notification into per-channel sample frames.
pub fn decode_packet(data: &[u8]) -> Result<DecodedPacket, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let tag = data[0];
    let wire_seq = u16::from_be_bytes([data[1], data[2]]);
    let payload = &data[HEADER_LEN..];

    match tag {
        TAG_EEG => decode_eeg(wire_seq, payload),
        TAG_PPG => decode_ppg(wire_seq, payload),
        TAG_ACC => decode_acc(wire_seq, payload),
        TAG_BATTERY => decode_battery(wire_seq, payload),
        other => Err(PacketError::UnknownTag(other)),
    }
}

/// Unpack big-endian 12-bit values: every 3 bytes hold two samples.
fn unpack_12bit(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(data.len() / 3 * 2);
    for chunk in data.chunks_exact(3) {
        out.push(((chunk[0] as u16) << 4) | ((chunk[1] as u16) >> 4));
        out.push((((chunk[1] as u16) & 0x0F) << 8) | chunk[2] as u16);
    }
    out
}

fn decode_eeg(wire_seq: u16, payload: &[u8]) -> Result<DecodedPacket, PacketError> {
    let kind = SensorKind::Eeg;
    let channels = kind.channel_count();
    let samples = kind.samples_per_packet();
    // 12 bits per value, channel-major layout.
    let expected = channels * samples * 3 / 2;
    if payload.len() < expected {
        return Err(PacketError::Truncated {
            kind,
            expected,
            got: payload.len(),
        });
    }

    let per_channel = samples * 3 / 2;
    let mut decoded: Vec<Vec<f64>> = Vec::with_capacity(channels);
    for ch in 0..channels {
        let raw = unpack_12bit(&payload[ch * per_channel..(ch + 1) * per_channel]);
        decoded.push(
            raw.into_iter()
                // Center around the 12-bit midpoint before scaling to µV.
                .map(|v| (v as f64 - 2048.0) * EEG_SCALE)
                .collect(),
        );
    }

    Ok(DecodedPacket {
        kind,
        wire_seq,
        frames: transpose(decoded, samples),
    })
}

fn decode_ppg(wire_seq: u16, payload: &[u8]) -> Result<DecodedPacket, PacketError> {
    let kind = SensorKind::Ppg;
    let channels = kind.channel_count();
    let samples = kind.samples_per_packet();
    let expected = channels * samples * 3;
    if payload.len() < expected {
        return Err(PacketError::Truncated {
            kind,
            expected,
            got: payload.len(),
        });
    }

    let mut decoded: Vec<Vec<f64>> = Vec::with_capacity(channels);
    for ch in 0..channels {
        let base = ch * samples * 3;
        let mut values = Vec::with_capacity(samples);
        for s in 0..samples {
            let off = base + s * 3;
            let raw = ((payload[off] as u32) << 16)
                | ((payload[off + 1] as u32) << 8)
                | payload[off + 2] as u32;
            values.push(raw as f64);
        }
        decoded.push(values);
    }

    Ok(DecodedPacket {
        kind,
        wire_seq,
        frames: transpose(decoded, samples),
    })
}

fn decode_acc(wire_seq: u16, payload: &[u8]) -> Result<DecodedPacket, PacketError> {
    let kind = SensorKind::Acc;
    let samples = kind.samples_per_packet();
    let expected = samples * 3 * 2;
    if payload.len() < expected {
        return Err(PacketError::Truncated {
            kind,
            expected,
            got: payload.len(),
        });
    }

    let mut frames = Vec::with_capacity(samples);
    for s in 0..samples {
        let base = s * 6;
        let frame: Vec<f64> = (0..3)
            .map(|axis| {
                let off = base + axis * 2;
                i16::from_be_bytes([payload[off], payload[off + 1]]) as f64 * ACC_SCALE
            })
            .collect();
        frames.push(frame);
    }

    Ok(DecodedPacket {
        kind,
        wire_seq,
        frames,
    })
}

fn decode_battery(wire_seq: u16, payload: &[u8]) -> Result<DecodedPacket, PacketError> {
    let kind = SensorKind::Battery;
    if payload.len() < 2 {
        return Err(PacketError::Truncated {
            kind,
            expected: 2,
            got: payload.len(),
        });
    }

    let level = u16::from_be_bytes([payload[0], payload[1]]) as f64 / 512.0;
    Ok(DecodedPacket {
        kind,
        wire_seq,
        frames: vec![vec![level.clamp(0.0, 100.0)]],
    })
}

/// Channel-major → sample-major.
fn transpose(channels: Vec<Vec<f64>>, samples: usize) -> Vec<Vec<f64>> {
    (0..samples)
        .map(|s| channels.iter().map(|ch| ch[s]).collect())
        .collect()
}

/// Reconstructs wall-clock timestamps from the wire packet counter.
///
/// The wearable embeds no absolute timestamps; each notification carries a
/// 16-bit counter incrementing once per packet. The tracker anchors the
/// first packet to `now` and extrapolates subsequent timestamps from the
/// counter delta and the known sample cadence, which preserves inter-packet
/// spacing under radio jitter and back-dates late deliveries.
#[derive(Debug)]
pub struct TimestampTracker {
    kind: SensorKind,
    last_index: Option<u16>,
    last_timestamp: Option<f64>,
}

impl TimestampTracker {
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            last_index: None,
            last_timestamp: None,
        }
    }

    /// Timestamp in ms since epoch for the first sample of packet
    /// `wire_seq`, given the current wall clock `now_ms`.
    pub fn stamp(&mut self, wire_seq: u16, now_ms: f64) -> f64 {
        let packet_ms = self.kind.packet_interval().as_secs_f64() * 1000.0;

        if self.last_index.is_none() || self.last_timestamp.is_none() {
            self.last_index = Some(wire_seq);
            self.last_timestamp = Some(now_ms - packet_ms);
        }

        let mut idx = wire_seq as i64;
        let last = self.last_index.unwrap() as i64;

        // 16-bit wrap: an apparent backward jump over half the counter
        // space means the counter rolled over.
        while last - idx > 0x1000 {
            idx += 0x10000;
        }

        let ts = self.last_timestamp.unwrap();

        if idx == last {
            ts
        } else if idx > last {
            let new_ts = ts + packet_ms * (idx - last) as f64;
            self.last_index = Some(wire_seq);
            self.last_timestamp = Some(new_ts);
            new_ts
        } else {
            // Late delivery: back-date without moving the anchor.
            ts - packet_ms * (last - idx) as f64
        }
    }

    /// Re-anchor on the next packet, as after a reconnect.
    pub fn reset(&mut self) {
        self.last_index = None;
        self.last_timestamp = None;
    }
}
