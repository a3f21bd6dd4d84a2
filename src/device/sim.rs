// Simulated wearable.
//
// Emits wire-identical packets at the real sensor cadences: a 10 Hz EEG
// tone, a 72 bpm pulse on the PPG infrared channel, a resting accelerometer,
// and a slowly draining battery. Used by the demo binary and end-to-end
// tests when no hardware is in reach.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CoreResult;
use crate::types::{DiscoveredDevice, SensorKind};

use super::packet::{TAG_ACC, TAG_BATTERY, TAG_EEG, TAG_PPG};
use super::transport::{DeviceLink, DeviceTransport, LinkEvent, LinkHandle};

pub const SIM_ADDRESS: &str = "SIM:00:00:00:00:01";
pub const SIM_NAME: &str = "SimBand";

pub struct SimTransport;

impl SimTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for SimTransport {
    async fn scan(&self, _duration: Duration) -> CoreResult<Vec<DiscoveredDevice>> {
        Ok(vec![DiscoveredDevice {
            address: SIM_ADDRESS.to_string(),
            name: SIM_NAME.to_string(),
            rssi: Some(-42),
        }])
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> CoreResult<DeviceLink> {
        if !address.eq_ignore_ascii_case(SIM_ADDRESS) {
            return Err(crate::error::CoreError::DeviceNotFound(address.to_string()));
        }

        let (tx, rx) = mpsc::channel(256);
        let streaming = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        spawn_generator(tx, Arc::clone(&streaming), cancel.clone());
        info!("simulated device connected");

        Ok(DeviceLink {
            address: SIM_ADDRESS.to_string(),
            name: SIM_NAME.to_string(),
            rssi: Some(-42),
            events: rx,
            handle: Box::new(SimLinkHandle { streaming, cancel }),
        })
    }
}

struct SimLinkHandle {
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[async_trait]
impl LinkHandle for SimLinkHandle {
    async fn start_streaming(&self) -> CoreResult<()> {
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_streaming(&self) -> CoreResult<()> {
        self.streaming.store(false, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}

fn spawn_generator(
    tx: mpsc::Sender<LinkEvent>,
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut eeg_tick = tokio::time::interval(SensorKind::Eeg.packet_interval());
        let mut ppg_tick = tokio::time::interval(SensorKind::Ppg.packet_interval());
        let mut acc_tick = tokio::time::interval(SensorKind::Acc.packet_interval());
        let mut battery_tick = tokio::time::interval(SensorKind::Battery.packet_interval());

        let mut seq = [0u16; 4];
        let mut sample_index = [0u64; 4];
        let mut battery = 97.0f64;

        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = eeg_tick.tick() => eeg_packet(&mut seq[0], &mut sample_index[0]),
                _ = ppg_tick.tick() => ppg_packet(&mut seq[1], &mut sample_index[1]),
                _ = acc_tick.tick() => acc_packet(&mut seq[2]),
                _ = battery_tick.tick() => {
                    battery = (battery - 0.002).max(0.0);
                    battery_packet(&mut seq[3], battery)
                }
            };
            if !streaming.load(Ordering::Acquire) {
                continue;
            }
            if tx.send(LinkEvent::Packet(packet)).await.is_err() {
                break;
            }
        }
        let _ = tx.send(LinkEvent::Dropped).await;
    });
}

fn header(tag: u8, seq: &mut u16) -> Vec<u8> {
    let mut data = vec![tag];
    data.extend_from_slice(&seq.to_be_bytes());
    *seq = seq.wrapping_add(1);
    data
}

/// Pack pairs of 12-bit values into 3-byte groups, big-endian.
fn pack_12bit(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() / 2 * 3);
    for pair in values.chunks_exact(2) {
        out.push((pair[0] >> 4) as u8);
        out.push((((pair[0] & 0x0F) << 4) | (pair[1] >> 8)) as u8);
        out.push((pair[1] & 0xFF) as u8);
    }
    out
}

fn eeg_packet(seq: &mut u16, sample_index: &mut u64) -> Vec<u8> {
    let kind = SensorKind::Eeg;
    let mut data = header(TAG_EEG, seq);
    let base = *sample_index;
    for _channel in 0..kind.channel_count() {
        let raw: Vec<u16> = (0..kind.samples_per_packet())
            .map(|i| {
                let t = (base + i as u64) as f64 / kind.sample_rate();
                // 10 Hz alpha tone at 30 µV.
                let uv = 30.0 * (2.0 * PI * 10.0 * t).sin();
                (uv / 0.48828125 + 2048.0).clamp(0.0, 4095.0) as u16
            })
            .collect();
        data.extend(pack_12bit(&raw));
    }
    *sample_index += kind.samples_per_packet() as u64;
    data
}

fn ppg_packet(seq: &mut u16, sample_index: &mut u64) -> Vec<u8> {
    let kind = SensorKind::Ppg;
    let mut data = header(TAG_PPG, seq);
    let base = *sample_index;
    for channel in 0..kind.channel_count() {
        for i in 0..kind.samples_per_packet() {
            let t = (base + i as u64) as f64 / kind.sample_rate();
            // 72 bpm pulse riding on a DC perfusion level.
            let pulse = 2_000.0 * (2.0 * PI * 1.2 * t).sin();
            let value = match channel {
                1 => 50_000.0 + pulse,
                _ => 20_000.0 + 0.2 * pulse,
            } as u32;
            data.extend_from_slice(&value.to_be_bytes()[1..4]);
        }
    }
    *sample_index += kind.samples_per_packet() as u64;
    data
}

fn acc_packet(seq: &mut u16) -> Vec<u8> {
    let kind = SensorKind::Acc;
    let mut data = header(TAG_ACC, seq);
    for _ in 0..kind.samples_per_packet() {
        // Flat on the table: 1 g on z.
        for value in [0.0f64, 0.0, 1.0] {
            let raw = (value / 0.0000610352) as i16;
            data.extend_from_slice(&raw.to_be_bytes());
        }
    }
    data
}

fn battery_packet(seq: &mut u16, level: f64) -> Vec<u8> {
    let mut data = header(TAG_BATTERY, seq);
    let raw = (level * 512.0).clamp(0.0, u16::MAX as f64) as u16;
    data.extend_from_slice(&raw.to_be_bytes());
    data
}
