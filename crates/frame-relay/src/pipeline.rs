//! Relay supervisor wiring channels, worker threads and the HTTP server.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tracing::{error, info, warn};
use video_ingest::StreamAcquirer;

use crate::{
    annotate::Annotator,
    capture::CaptureLoop,
    channel::{Channel, ChannelRegistry},
    config::RelayConfig,
    emitter::EmitterLoop,
    encoding::JpegFrameEncoder,
    server::spawn_server,
    telemetry,
    transport::RoomHub,
};

/// Shared state owned by the top-level relay and handed to workers and
/// request handlers.
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: ChannelRegistry,
    pub hub: Arc<RoomHub>,
    pub acquirer: Arc<StreamAcquirer>,
    /// Set once the process is shutting down; ends fallback streams.
    pub shutdown: Arc<AtomicBool>,
}

impl RelayContext {
    /// Build a context using the FFmpeg decoder ladder from `config`.
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let acquirer = video_ingest::ffmpeg_acquirer(
            &config.decoders,
            (config.width, config.height),
            config.capture.read_timeout,
            config.capture.open_timeout,
        );
        Self::with_acquirer(config, acquirer)
    }

    /// Build a context around an existing acquirer and register the
    /// configured channel.
    pub fn with_acquirer(config: RelayConfig, acquirer: StreamAcquirer) -> Arc<Self> {
        let registry = ChannelRegistry::new();
        registry.insert(Channel::new(
            config.channel_id.clone(),
            &config.channel_settings(),
        ));
        Arc::new(Self {
            config,
            registry,
            hub: Arc::new(RoomHub::new()),
            acquirer: Arc::new(acquirer),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The configured channel.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.registry.get(&self.config.channel_id)
    }
}

/// Capture and emitter threads of one channel.
pub struct ChannelWorkers {
    channel: Arc<Channel>,
    capture: thread::JoinHandle<()>,
    emitter: thread::JoinHandle<()>,
}

impl ChannelWorkers {
    /// Deactivate the channel and wait for both loops to exit.
    pub fn stop(self) {
        self.channel.deactivate();
        self.join();
    }

    /// Wait for both loops to exit. They only do so once the channel is
    /// deactivated.
    pub fn join(self) {
        if self.capture.join().is_err() {
            error!("Capture thread for {} panicked", self.channel.id());
        }
        if self.emitter.join().is_err() {
            error!("Emitter thread for {} panicked", self.channel.id());
        }
    }
}

/// Start the capture and emitter loops for `channel`.
pub fn spawn_channel(
    context: &RelayContext,
    channel: Arc<Channel>,
    annotator: Option<Box<dyn Annotator>>,
) -> Result<ChannelWorkers> {
    let mut capture = CaptureLoop::new(
        channel.clone(),
        context.acquirer.clone(),
        context.config.source_uri.clone(),
        context.config.capture.clone(),
    );
    if let Some(annotator) = annotator {
        capture = capture.with_annotator(annotator);
    }
    let emitter = EmitterLoop::new(
        channel.clone(),
        context.hub.clone(),
        Box::new(JpegFrameEncoder),
        context.config.emit.clone(),
    );

    let capture = telemetry::spawn_thread(format!("capture-{}", channel.id()), move || capture.run())
        .context("Failed to spawn capture thread")?;
    let emitter = match telemetry::spawn_thread(format!("emit-{}", channel.id()), move || emitter.run()) {
        Ok(handle) => handle,
        Err(err) => {
            channel.deactivate();
            let _ = capture.join();
            return Err(err).context("Failed to spawn emitter thread");
        }
    };

    Ok(ChannelWorkers {
        channel,
        capture,
        emitter,
    })
}

/// Run the relay until Ctrl+C.
pub fn run(config: RelayConfig) -> Result<()> {
    run_with_annotator(config, None)
}

/// Run the relay with an annotation hook until Ctrl+C.
pub fn run_with_annotator(config: RelayConfig, annotator: Option<Box<dyn Annotator>>) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("Prometheus metrics unavailable: {err:#}");
    }

    let relay_span = tracing::info_span!(
        "relay",
        channel = %config.channel_id,
        source = %config.source_uri,
        width = config.width,
        height = config.height,
        target_fps = config.emit.target_fps
    );
    let _relay_guard = relay_span.enter();

    let context = RelayContext::new(config);
    info!(
        "Decoder ladder: {}",
        context.acquirer.strategy_names().join(", ")
    );

    let handler_shutdown = context.shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let server = spawn_server(context.clone())?;
    let channel = context
        .channel()
        .ok_or_else(|| anyhow!("channel {} is not registered", context.config.channel_id))?;
    let workers = match spawn_channel(&context, channel, annotator) {
        Ok(workers) => workers,
        Err(err) => {
            server.stop();
            return Err(err);
        }
    };

    if let Some(addr) = server.addrs().first() {
        println!(
            "Relaying {} on ws://{addr}/socket/{} (fallback http://{addr}/video_feed)",
            context.config.channel_id, context.config.channel_id
        );
    }
    println!("Running relay, press Ctrl+C to stop");

    while !context.shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    println!("Stopping relay");
    context.registry.deactivate_all();
    workers.join();
    server.stop();
    info!("Relay stopped");
    Ok(())
}
