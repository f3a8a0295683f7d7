//! sensorflow - demo runner
//!
//! Runs a small camera → detector → exporter graph on the live clock and
//! prints the final topology snapshot as JSON.
//!
//! Usage: `sensorflow [config.toml]`

use sensorflow_rs::{
    config::{LoggingConfig, PipelineConfig},
    pipeline::{
        Component, ComponentContext, DeliveryPolicy, Emitter, Envelope, Passive, Pipeline,
    },
    store::{Exporter, InMemoryStore, JsonSerializer},
    Result, SharedBuffer,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FRAME_BYTES: usize = 64 * 1024;
const FRAME_COUNT: u32 = 30;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const INFERENCE_TIME: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Detection {
    frame: u64,
    brightness: f64,
}

struct Camera {
    frames: Emitter<SharedBuffer>,
}

impl Component for Camera {
    fn on_start(&mut self, ctx: &ComponentContext) -> anyhow::Result<()> {
        capture(ctx, self.frames.clone(), 0)
    }
}

fn capture(ctx: &ComponentContext, frames: Emitter<SharedBuffer>, index: u32) -> anyhow::Result<()> {
    if index == FRAME_COUNT {
        ctx.complete();
        return Ok(());
    }
    ctx.schedule_after(FRAME_INTERVAL, move |ctx| {
        let mut frame = ctx.pool().acquire(FRAME_BYTES);
        if let Some(pixels) = frame.get_mut() {
            pixels.fill((index * 8 % 256) as u8);
        }
        frames.post(frame, ctx.now())?;
        capture(ctx, frames, index + 1)
    })?;
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_or_default()));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sensorflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let _log_guard = init_logging(&config.logging);

    tracing::info!("Starting sensorflow demo '{}'", config.name);
    let pipeline = Pipeline::new(config);

    let (_, frames) = pipeline.add_source_with("camera", |id| {
        let frames = pipeline.create_emitter::<SharedBuffer>(id, "frames")?;
        Ok((
            Camera {
                frames: frames.clone(),
            },
            frames,
        ))
    })?;

    // Slow consumer: frames arriving during inference are dropped.
    let detector = pipeline.add_component("detector", Passive);
    let detections = pipeline.create_emitter::<Detection>(detector, "detections")?;
    let relay = detections.clone();
    let detector_input = pipeline.create_receiver(
        detector,
        "frames",
        DeliveryPolicy::throttle_dropping(1),
        move |frame: SharedBuffer, envelope: &Envelope| {
            std::thread::sleep(INFERENCE_TIME);
            let sum: u64 = frame.iter().map(|&b| u64::from(b)).sum();
            let brightness = sum as f64 / frame.len().max(1) as f64;
            relay.post(
                Detection {
                    frame: envelope.sequence_id,
                    brightness,
                },
                envelope.originating_time,
            )?;
            Ok(())
        },
    )?;
    pipeline.connect(&frames, &detector_input)?;

    let store = InMemoryStore::new();
    let exporter = Exporter::new(
        &pipeline,
        "exporter",
        store.clone(),
        JsonSerializer::<Detection>::new(),
        pipeline.default_policy(),
    )?;
    pipeline.connect(&detections, exporter.input())?;

    pipeline.run()?;

    let topology = pipeline.topology();
    tracing::info!(
        "Captured {} frames, detector handled {}, dropped {}, exported {}",
        frames.posted(),
        detector_input.dispatched(),
        topology.total_dropped(),
        store.len()
    );
    println!("{}", topology.to_json()?);

    pipeline.dispose();
    Ok(())
}
