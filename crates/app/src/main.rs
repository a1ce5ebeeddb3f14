use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use viz_bridge_core::{
    visualizer_bridge_with, BindingHost, BridgeConfig, BridgeError, InstallRequest,
    SnapshotPublisher,
};

fn main() -> viz_bridge_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            bins,
            rate,
            seconds,
        } => run_demo(bins, rate, seconds),
        Commands::Stress {
            writes,
            reads,
            bins,
        } => run_stress(writes, reads, bins),
    }
}

fn run_demo(bins: usize, rate: f64, seconds: f64) -> viz_bridge_core::Result<()> {
    tracing::info!(bins, rate, seconds, "starting demo");

    let (bridge, publisher) = visualizer_bridge_with(BridgeConfig { bin_capacity: bins });
    let (host, requests) = ChannelHost::new();
    let handle = bridge.schedule_install(&host);

    let frames = (rate * seconds).max(1.0) as u32;
    let producer = thread::spawn(move || synthesize(publisher, bins, rate, frames));

    // The main loop doubles as the consumer execution context: the install
    // request arrives here and must be resolved here.
    let request = requests
        .recv_timeout(Duration::from_secs(1))
        .map_err(|_| BridgeError::msg("no install request arrived on the consumer loop"))?;
    let mut binding = request.resolve()?;
    handle.wait()?;
    tracing::info!(state = ?binding.state(), "binding installed");

    let polls = (seconds / 0.05).max(1.0) as u32;
    for poll in 0..polls {
        thread::sleep(Duration::from_millis(50));
        let frame = binding.frame();
        tracing::info!(
            bins = frame.bins.len(),
            rms = frame.rms,
            timestamp = frame.timestamp,
            "frame"
        );
        if poll == polls / 2 {
            bridge.reset();
        }
    }

    producer
        .join()
        .map_err(|_| BridgeError::msg("producer thread panicked"))?;

    let encoded = binding.encoded_frame();
    tracing::info!(decoded_bins = encoded.decode_bins()?.len(), "encoded frame verified");
    println!("{}", encoded.to_json()?);
    tracing::info!(stats = ?bridge.stats(), "demo finished");
    Ok(())
}

fn run_stress(writes: u64, reads: u64, bins: usize) -> viz_bridge_core::Result<()> {
    tracing::info!(writes, reads, bins, "starting stress run");

    let (bridge, mut publisher) = visualizer_bridge_with(BridgeConfig { bin_capacity: bins });
    let (host, requests) = ChannelHost::new();
    let handle = bridge.schedule_install(&host);
    let request = requests
        .recv_timeout(Duration::from_secs(1))
        .map_err(|_| BridgeError::msg("no install request arrived on the consumer loop"))?;
    let mut binding = request.resolve()?;
    handle.wait()?;

    let producer = thread::spawn(move || {
        let mut spectrum = vec![0.0f32; bins];
        for step in 0..writes {
            let tag = step as f32;
            spectrum.fill(tag);
            publisher.update(&spectrum, tag, f64::from(tag));
        }
    });

    // Every observed snapshot must be internally consistent: all fields from
    // the same update, bins at the full length. Reads keep going until the
    // producer is done, otherwise a fast reader drains its budget before the
    // first update lands and the two sides never overlap.
    let mut attempts = 0u64;
    let mut observed = 0u64;
    let mut torn = 0u64;
    while attempts < reads || !producer.is_finished() {
        attempts += 1;
        if let Some(snapshot) = binding.latest() {
            observed += 1;
            let tag = snapshot.rms;
            let coherent = snapshot.bins.len() == bins
                && snapshot.timestamp == f64::from(tag)
                && snapshot.bins.iter().all(|bin| *bin == tag);
            if !coherent {
                torn += 1;
            }
        }
    }

    producer
        .join()
        .map_err(|_| BridgeError::msg("producer thread panicked"))?;

    if writes > 0 {
        let last = binding
            .latest()
            .ok_or_else(|| BridgeError::msg("no snapshot visible after the run"))?;
        observed += 1;
        if last.rms != (writes - 1) as f32 {
            return Err(BridgeError::msg("final read is not the last update"));
        }
    }

    tracing::info!(attempts, observed, torn, stats = ?bridge.stats(), "stress run finished");
    if torn > 0 {
        return Err(BridgeError::msg(format!("{torn} torn reads observed")));
    }
    Ok(())
}

/// Feeds synthetic spectra at roughly `rate` frames per second.
fn synthesize(mut publisher: SnapshotPublisher, bins: usize, rate: f64, frames: u32) {
    let period = Duration::from_secs_f64(1.0 / rate.max(1.0));
    let mut spectrum = vec![0.0f32; bins];
    for frame in 0..frames {
        let time = f64::from(frame) * period.as_secs_f64();
        for (index, bin) in spectrum.iter_mut().enumerate() {
            let phase = time * (index + 1) as f64;
            *bin = (phase.sin() * 0.5 + 0.5) as f32;
        }
        let rms = (spectrum.iter().map(|bin| bin * bin).sum::<f32>() / bins.max(1) as f32).sqrt();
        publisher.update(&spectrum, rms, time);
        thread::sleep(period);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Forwards install requests onto the main loop, which acts as the consumer
/// execution context for this CLI.
struct ChannelHost {
    sender: mpsc::Sender<InstallRequest>,
}

impl ChannelHost {
    fn new() -> (Self, mpsc::Receiver<InstallRequest>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl BindingHost for ChannelHost {
    fn schedule(&self, request: InstallRequest) {
        // A closed channel drops the request, which reports the failure
        // through the install handle.
        let _ = self.sender.send(request);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo and stress driver for the visualizer state bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed synthetic spectra through the bridge and poll them like a UI.
    Demo {
        /// Number of spectrum bins to synthesize.
        #[arg(long, default_value_t = 64)]
        bins: usize,
        /// Update rate in frames per second.
        #[arg(long, default_value_t = 60.0)]
        rate: f64,
        /// How long to run, in seconds.
        #[arg(long, default_value_t = 2.0)]
        seconds: f64,
    },
    /// Hammer the bridge with concurrent updates and reads.
    Stress {
        /// Number of updates to publish.
        #[arg(long, default_value_t = 10_000)]
        writes: u64,
        /// Minimum number of read attempts; reading continues until the
        /// producer finishes.
        #[arg(long, default_value_t = 10_000)]
        reads: u64,
        /// Bin count for every update.
        #[arg(long, default_value_t = 64)]
        bins: usize,
    },
}
