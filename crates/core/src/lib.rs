//! Core library for the viz-bridge visualizer state bridge.
//!
//! The crate moves audio-analysis snapshots (spectrum bins, RMS loudness,
//! capture timestamp) from a real-time producer thread to a UI or script
//! consumer without blocking either side and without tearing. Each module
//! owns a distinct concern: the lock-free snapshot buffer, the install and
//! reset lifecycle, the bridge facade the two sides hold, and the packed
//! wire format script consumers poll.

pub mod bridge;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod snapshot;
pub mod wire;

pub use bridge::{
    visualizer_bridge, visualizer_bridge_with, BridgeStats, ConsumerBinding, SnapshotPublisher,
    VisualizerBridge,
};
pub use config::{BridgeConfig, DEFAULT_BIN_CAPACITY};
pub use error::{BridgeError, Result};
pub use lifecycle::{BindingHost, BridgeState, InstallHandle, InstallRequest, LifecycleController};
pub use snapshot::{snapshot_buffer, Snapshot, SnapshotReader, SnapshotWriter, WriteOutcome};
pub use wire::{EncodedFrame, FRAME_FORMAT, FRAME_STRIDE, FRAME_VERSION};
