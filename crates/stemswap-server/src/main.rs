//! Stemswap Server - live stem remixing controlled over OSC
//!
//! Startup order:
//! 1. Load the YAML config and the song catalog
//! 2. Open the audio device (its rate decides the engine rate)
//! 3. Start the render thread and the device stream
//! 4. Serve OSC on `network.listen` until interrupted or the device goes away
//!
//! Ctrl-C stops the server loop; the session then stops every voice and
//! releases its assets before the stream and render thread are torn down.
//!
//! ## Command line flags
//!
//! - `--config <path>`: config file (default `~/.config/stemswap/config.yaml`)
//! - `--catalog <path>`: song manifest, YAML or JSON (default `~/.config/stemswap/catalog.yaml`)
//! - `--plan <path>`: remix plan; its first section is loaded at startup

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use stemswap_core::asset::AssetLoader;
use stemswap_core::audio::AudioOutput;
use stemswap_core::catalog::SongCatalog;
use stemswap_core::config::{self, MixerConfig};
use stemswap_core::engine::{output_pump, EngineAtomics, RenderEngine, RenderThread};
use stemswap_core::plan::RemixPlan;
use stemswap_core::protocol::{ControlServer, ServerExit};
use stemswap_core::session::{Session, SessionConfig};

/// Parsed command line
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    catalog: Option<PathBuf>,
    plan: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args::default();
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            let slot = match arg.as_str() {
                "--config" => &mut args.config,
                "--catalog" => &mut args.catalog,
                "--plan" => &mut args.plan,
                other => anyhow::bail!("Unknown argument '{}' (expected --config, --catalog or --plan)", other),
            };
            let value = iter.next().with_context(|| format!("{} needs a path", arg))?;
            *slot = Some(PathBuf::from(value));
        }
        Ok(args)
    }
}

fn main() -> ExitCode {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match run() {
        Ok(ServerExit::Stopped) => ExitCode::SUCCESS,
        Ok(ServerExit::DeviceLost) => {
            log::error!("Exiting after audio device loss");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ServerExit> {
    let args = Args::parse()?;
    log::info!("stemswap-server starting up");

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_handler(stop.clone())?;

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let config: MixerConfig = config::load_config(&config_path);

    let plan = args
        .plan
        .as_deref()
        .map(RemixPlan::load)
        .transpose()
        .context("Failed to load remix plan")?;

    let catalog_path = args.catalog.unwrap_or_else(config::default_catalog_path);
    let catalog = if catalog_path.exists() {
        SongCatalog::load(&catalog_path)?
    } else {
        log::warn!("No catalog at {:?}, starting with an empty one", catalog_path);
        SongCatalog::new()
    };

    // Audio device first: the engine runs at whatever rate it negotiates
    let output = AudioOutput::open(&config.audio).context("Failed to open audio output")?;
    let sample_rate = output.sample_rate();

    let atomics = Arc::new(EngineAtomics::new());
    let engine_config = config.engine_config(sample_rate);
    let (engine, commands, events) = RenderEngine::with_channels(engine_config, atomics.clone());
    let (pump, reader) = output_pump(engine, config.audio.ring_blocks);
    let render = RenderThread::spawn(pump).context("Failed to start render thread")?;
    let audio = output
        .start(reader, atomics.clone())
        .context("Failed to start audio stream")?;
    log::info!(
        "Audio running on '{}' at {} Hz, {} channels, {:.1} ms ring",
        audio.device_name(),
        audio.sample_rate(),
        audio.channels(),
        config.audio.ring_latency_ms(sample_rate)
    );

    let session_config = SessionConfig {
        sample_rate,
        global_bpm: config.mixing.initial_bpm,
        tempo_tolerance: config.mixing.tempo_tolerance,
    };
    let loader = AssetLoader::spawn().context("Failed to start asset loader")?;
    let mut session = Session::new(catalog, commands, events, atomics, session_config).with_loader(loader);

    if let Some(plan) = &plan {
        match plan.section_names().first() {
            Some(first) => {
                let first = first.to_string();
                let loaded = session.apply_plan_section(plan, &first)?;
                log::info!("Plan '{}': section {} loaded ({} stems)", plan.theme, first, loaded);
            }
            None => log::warn!("Plan '{}' has no sections", plan.theme),
        }
    }

    let mut server = ControlServer::bind(config.network.listen.as_str())
        .with_context(|| format!("Failed to bind {}", config.network.listen))?;
    let exit = server.run(&mut session, &stop);

    session.shutdown();
    drop(audio);
    render.stop();
    log::info!("stemswap-server stopped");

    Ok(exit?)
}

/// Raise `stop` on Ctrl-C (and SIGTERM)
fn install_stop_handler(stop: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if !stop.swap(true, Ordering::AcqRel) {
            log::info!("Interrupt received, shutting down");
        }
    })
    .context("Failed to install interrupt handler")
}
