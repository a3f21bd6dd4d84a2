//! Biosignal acquisition core for a wireless multi-sensor wearable.
//!
//! The crate connects to a single headband-class device over BLE, decodes
//! its EEG/PPG/accelerometer/battery packet streams, derives metrics (band
//! powers, heart-rate variability, activity), and fans everything out over
//! an in-process hub to recording, monitoring, and telemetry subsystems.
//!
//! [`context::AppContext`] wires the subsystems together and is the
//! intended entry point:
//!
//! ```no_run
//! use neurostream::config::CoreConfig;
//! use neurostream::context::AppContext;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let ctx = AppContext::build_simulated(CoreConfig::default())?;
//! ctx.connect_device("SimBand").await?;
//! ctx.start_streaming().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod pipeline;
pub mod processing;
pub mod recording;
pub mod telemetry;
pub mod types;

pub use config::CoreConfig;
pub use context::{AppContext, CoreStatus};
pub use error::{CoreError, CoreResult};
pub use hub::{BroadcastHub, Channel, Envelope, LifecycleEvent, SubscriberId};
pub use monitor::{MonitorStatus, StreamPhase};
pub use recording::RecordingFormat;
pub use types::{
    ConnectionState, DeviceHandle, DiscoveredDevice, ProcessedSample, RawSample, SampleBatch,
    SensorKind,
};
