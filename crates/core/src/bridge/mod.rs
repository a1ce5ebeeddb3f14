//! Bridge facade: one producer handle, one installable consumer binding.
//!
//! A bridge is created as a pair. The [`SnapshotPublisher`] moves to the
//! audio thread and feeds analysis snapshots in; the [`VisualizerBridge`]
//! stays with the owner, drives the install handshake and reset, and tears
//! the binding down when dropped. The [`ConsumerBinding`] starts parked
//! inside the bridge and is handed out exactly once per successful install.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lifecycle::{self, BindingHost, BridgeState, InstallHandle, LifecycleController};
use crate::snapshot::{
    snapshot_buffer, Snapshot, SnapshotBuffer, SnapshotReader, SnapshotWriter, WriteOutcome,
};
use crate::wire::EncodedFrame;

/// Counters and state for diagnostics surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStats {
    pub state: BridgeState,
    pub frames_published: u64,
    pub frames_dropped: u64,
    pub shape_mismatches: u64,
    pub resets: u64,
}

/// Owner-side handle: installation, reset, teardown, and diagnostics.
///
/// Not `Clone`; there is one bridge per player instance and dropping it is
/// the teardown.
#[derive(Debug)]
pub struct VisualizerBridge {
    lifecycle: Arc<LifecycleController>,
    buffer: Arc<SnapshotBuffer>,
    parked: Arc<Mutex<Option<ConsumerBinding>>>,
}

/// Creates a bridge with the default configuration and splits it into the
/// owner-side handle and the producer handle.
pub fn visualizer_bridge() -> (VisualizerBridge, SnapshotPublisher) {
    visualizer_bridge_with(BridgeConfig::default())
}

/// Creates a bridge whose slots are preallocated per `config`.
pub fn visualizer_bridge_with(config: BridgeConfig) -> (VisualizerBridge, SnapshotPublisher) {
    let lifecycle = Arc::new(LifecycleController::new());
    let (writer, reader) = snapshot_buffer(config.bin_capacity);
    let buffer = writer.shared();
    let binding = ConsumerBinding {
        reader,
        lifecycle: Arc::clone(&lifecycle),
    };
    let bridge = VisualizerBridge {
        lifecycle: Arc::clone(&lifecycle),
        buffer,
        parked: Arc::new(Mutex::new(Some(binding))),
    };
    let publisher = SnapshotPublisher { writer, lifecycle };
    (bridge, publisher)
}

impl VisualizerBridge {
    /// Starts the install handshake and returns immediately.
    ///
    /// The host receives the request on the consumer context and decides it
    /// there; every outcome, including misuse such as a second install while
    /// one is pending, is reported through the returned handle.
    pub fn schedule_install(&self, host: &dyn BindingHost) -> InstallHandle {
        if let Err(err) = self.lifecycle.begin_install() {
            tracing::warn!(%err, "install rejected");
            return lifecycle::rejected_handle(err);
        }

        let binding = match self.parked.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(binding) = binding else {
            self.lifecycle.fail_install();
            return lifecycle::rejected_handle(BridgeError::registration(
                "consumer binding is no longer available",
            ));
        };

        let (request, handle) = lifecycle::handshake(
            binding,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.parked),
        );
        tracing::debug!("install scheduled");
        host.schedule(request);
        handle
    }

    /// Clears the latest snapshot and enters the reset sub-state.
    ///
    /// A no-op unless a binding is installed. The binding stays registered
    /// and reports the empty frame until the next update lands.
    pub fn reset(&self) {
        if self.lifecycle.mark_reset() {
            self.buffer.clear();
            tracing::debug!("bridge reset");
        } else {
            tracing::warn!(state = ?self.lifecycle.state(), "reset ignored; nothing installed");
        }
    }

    pub fn state(&self) -> BridgeState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            state: self.lifecycle.state(),
            frames_published: self.buffer.frames_published(),
            frames_dropped: self.buffer.frames_dropped(),
            shape_mismatches: self.buffer.shape_mismatches(),
            resets: self.lifecycle.resets(),
        }
    }
}

impl Drop for VisualizerBridge {
    fn drop(&mut self) {
        let prior = self.lifecycle.tear_down();
        self.buffer.clear();
        tracing::debug!(?prior, "bridge torn down");
    }
}

/// Producer handle, owned by the audio thread.
///
/// Both methods are bounded and infallible: atomic operations and a copy
/// into preallocated storage, nothing that can block on the consumer.
pub struct SnapshotPublisher {
    writer: SnapshotWriter,
    lifecycle: Arc<LifecycleController>,
}

impl SnapshotPublisher {
    /// Publishes one snapshot, superseding any unread predecessor.
    ///
    /// A bin count differing from the established shape is adopted as the new
    /// shape and implicitly resets prior snapshots; that path also emits the
    /// only tracing event update can produce.
    pub fn update(&mut self, bins: &[f32], rms: f32, timestamp: f64) {
        let outcome = self.writer.write(bins, rms, timestamp);
        self.lifecycle.note_write();
        if let WriteOutcome::Reshaped { previous, current } = outcome {
            tracing::warn!(previous, current, "bin count changed; prior snapshots invalidated");
        }
    }

    /// Producer-side reset, with the same semantics as
    /// [`VisualizerBridge::reset`].
    pub fn reset(&mut self) {
        if self.lifecycle.mark_reset() {
            self.writer.clear();
            tracing::debug!("bridge reset by producer");
        } else {
            tracing::warn!(state = ?self.lifecycle.state(), "reset ignored; nothing installed");
        }
    }
}

impl fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPublisher")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

/// Consumer-side accessor, handed out by a resolved install request.
///
/// Lives on the consumer's execution context and is polled at whatever rate
/// the consumer renders.
pub struct ConsumerBinding {
    reader: SnapshotReader,
    lifecycle: Arc<LifecycleController>,
}

impl ConsumerBinding {
    /// Latest snapshot, or `None` when nothing has been published since
    /// construction or the last reset.
    pub fn latest(&mut self) -> Option<Snapshot> {
        self.reader.read_latest()
    }

    /// Latest snapshot, or the empty frame when there is none. This is the
    /// shape script consumers poll.
    pub fn frame(&mut self) -> Snapshot {
        self.reader.read_latest().unwrap_or_default()
    }

    /// Latest snapshot packed for script-side transport.
    pub fn encoded_frame(&mut self) -> EncodedFrame {
        EncodedFrame::encode(&self.frame())
    }

    /// Install state as observed from the consumer side; reports
    /// `Uninstalled` after the bridge is torn down.
    pub fn state(&self) -> BridgeState {
        self.lifecycle.state()
    }
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::InstallRequest;

    /// Resolves on the calling thread and keeps the binding for the test.
    #[derive(Default)]
    struct InlineHost {
        binding: Mutex<Option<ConsumerBinding>>,
    }

    impl InlineHost {
        fn take(&self) -> ConsumerBinding {
            self.binding
                .lock()
                .unwrap()
                .take()
                .expect("binding should have been installed")
        }
    }

    impl BindingHost for InlineHost {
        fn schedule(&self, request: InstallRequest) {
            if let Ok(binding) = request.resolve() {
                *self.binding.lock().unwrap() = Some(binding);
            }
        }
    }

    /// Queues requests without deciding them, like a busy runtime.
    #[derive(Default)]
    struct ParkingHost {
        requests: Mutex<Vec<InstallRequest>>,
    }

    impl ParkingHost {
        fn pop(&self) -> InstallRequest {
            self.requests
                .lock()
                .unwrap()
                .pop()
                .expect("a request should be queued")
        }
    }

    impl BindingHost for ParkingHost {
        fn schedule(&self, request: InstallRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    struct RejectingHost;

    impl BindingHost for RejectingHost {
        fn schedule(&self, request: InstallRequest) {
            request.reject("runtime unavailable");
        }
    }

    struct DroppingHost;

    impl BindingHost for DroppingHost {
        fn schedule(&self, request: InstallRequest) {
            drop(request);
        }
    }

    #[test]
    fn install_resolves_and_hands_out_the_binding() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();

        bridge.schedule_install(&host).wait().unwrap();
        assert_eq!(bridge.state(), BridgeState::Installed);

        publisher.update(&[0.1, 0.2, 0.3], 0.15, 1000.0);
        let mut binding = host.take();
        let snapshot = binding.latest().unwrap();
        assert_eq!(snapshot.bins, vec![0.1, 0.2, 0.3]);
        assert_eq!(snapshot.rms, 0.15);
        assert_eq!(snapshot.timestamp, 1000.0);
    }

    #[test]
    fn binding_reports_the_empty_frame_before_any_update() {
        let (bridge, _publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();

        let mut binding = host.take();
        assert_eq!(binding.latest(), None);
        assert_eq!(binding.frame(), Snapshot::default());
        assert_eq!(binding.encoded_frame().bin_count, 0);
    }

    #[test]
    fn updates_before_install_are_buffered() {
        let (bridge, mut publisher) = visualizer_bridge();
        publisher.update(&[0.3, 0.6, 0.9], 0.45, 5.0);
        assert_eq!(bridge.state(), BridgeState::Uninstalled);

        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();

        // The first read after install sees the pre-install snapshot.
        let mut binding = host.take();
        let snapshot = binding.latest().unwrap();
        assert_eq!(snapshot.bins, vec![0.3, 0.6, 0.9]);
        assert_eq!(snapshot.rms, 0.45);
        assert_eq!(snapshot.timestamp, 5.0);
    }

    #[test]
    fn updates_during_install_are_buffered() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = ParkingHost::default();
        let handle = bridge.schedule_install(&host);
        assert_eq!(bridge.state(), BridgeState::Installing);

        publisher.update(&[0.8; 4], 0.8, 9.0);
        assert_eq!(bridge.state(), BridgeState::Installing);

        let mut binding = host.pop().resolve().unwrap();
        handle.wait().unwrap();

        let snapshot = binding.latest().unwrap();
        assert_eq!(snapshot.bins, vec![0.8; 4]);
        assert_eq!(snapshot.rms, 0.8);
        assert_eq!(snapshot.timestamp, 9.0);
    }

    #[test]
    fn second_install_while_pending_is_rejected() {
        let (bridge, _publisher) = visualizer_bridge();
        let host = ParkingHost::default();

        let first = bridge.schedule_install(&host);
        let second = bridge.schedule_install(&host);
        assert!(matches!(
            second.wait(),
            Err(BridgeError::AlreadyInstalling)
        ));

        // The pending attempt is unaffected and still completes.
        let binding = host.pop().resolve().unwrap();
        first.wait().unwrap();
        assert_eq!(binding.state(), BridgeState::Installed);
    }

    #[test]
    fn install_after_success_is_rejected() {
        let (bridge, _publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();

        let retry = bridge.schedule_install(&host);
        assert!(matches!(retry.wait(), Err(BridgeError::AlreadyInstalled)));
    }

    #[test]
    fn rejected_install_can_be_retried() {
        let (bridge, _publisher) = visualizer_bridge();

        let outcome = bridge.schedule_install(&RejectingHost).wait();
        match outcome {
            Err(BridgeError::RegistrationFailed { cause }) => {
                assert_eq!(cause, "runtime unavailable");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(bridge.state(), BridgeState::Uninstalled);

        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();
        assert_eq!(bridge.state(), BridgeState::Installed);
    }

    #[test]
    fn dropped_request_counts_as_registration_failure() {
        let (bridge, _publisher) = visualizer_bridge();

        let outcome = bridge.schedule_install(&DroppingHost).wait();
        assert!(matches!(
            outcome,
            Err(BridgeError::RegistrationFailed { .. })
        ));
        assert_eq!(bridge.state(), BridgeState::Uninstalled);
    }

    #[test]
    fn reset_clears_the_latest_snapshot() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();
        let mut binding = host.take();

        publisher.update(&[0.5; 16], 0.5, 1.0);
        assert!(binding.latest().is_some());

        bridge.reset();
        assert_eq!(bridge.state(), BridgeState::Reset);
        assert_eq!(binding.latest(), None);
        assert_eq!(binding.frame(), Snapshot::default());

        // The next update ends the reset sub-state.
        publisher.update(&[0.6; 16], 0.6, 2.0);
        assert_eq!(bridge.state(), BridgeState::Installed);
        assert_eq!(binding.latest().unwrap().rms, 0.6);
    }

    #[test]
    fn reset_before_install_is_ignored() {
        let (bridge, _publisher) = visualizer_bridge();
        bridge.reset();
        assert_eq!(bridge.state(), BridgeState::Uninstalled);
        assert_eq!(bridge.stats().resets, 0);
    }

    #[test]
    fn producer_reset_behaves_like_the_bridge_one() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();
        let mut binding = host.take();

        publisher.update(&[0.2, 0.4], 0.3, 1.0);
        publisher.reset();
        assert_eq!(bridge.state(), BridgeState::Reset);
        assert_eq!(binding.latest(), None);
    }

    #[test]
    fn dropping_the_bridge_tears_the_binding_down() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();
        let mut binding = host.take();

        publisher.update(&[0.9, 0.9], 0.9, 3.0);
        drop(bridge);

        assert_eq!(binding.state(), BridgeState::Uninstalled);
        assert_eq!(binding.latest(), None);
    }

    #[test]
    fn teardown_mid_install_rejects_the_resolution() {
        let (bridge, _publisher) = visualizer_bridge();
        let host = ParkingHost::default();
        let handle = bridge.schedule_install(&host);

        drop(bridge);
        assert!(host.pop().resolve().is_err());
        assert!(matches!(
            handle.wait(),
            Err(BridgeError::RegistrationFailed { .. })
        ));
    }

    #[test]
    fn stats_track_bridge_traffic() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();

        publisher.update(&[0.1; 8], 0.1, 1.0);
        publisher.update(&[0.2; 8], 0.2, 2.0);
        publisher.update(&[0.3; 4], 0.3, 3.0);
        bridge.reset();

        let stats = bridge.stats();
        assert_eq!(stats.frames_published, 3);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.shape_mismatches, 1);
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.state, BridgeState::Reset);
    }

    #[test]
    fn encoded_frames_round_out_the_consumer_surface() {
        let (bridge, mut publisher) = visualizer_bridge();
        let host = InlineHost::default();
        bridge.schedule_install(&host).wait().unwrap();
        let mut binding = host.take();

        publisher.update(&[0.25, 0.5], 0.4, 7.0);
        let frame = binding.encoded_frame();
        assert_eq!(frame.bin_count, 2);
        assert_eq!(frame.rms, 0.4);
        assert_eq!(frame.decode_bins().unwrap(), vec![0.25, 0.5]);
    }
}
