//! Synthpod CLI driver.
//!
//! Headless front end over the engine: load a session bundle, render
//! offline periods, save a bundle.  Realtime audio drivers live in their
//! own binaries and only consume the `process()` contract.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use synthpod::engine::{Engine, UiEvent};
use synthpod::graph::AudioSettings;
use synthpod::plugin::LilvDb;
use synthpod::protocol::Msg;
use synthpod::{Error, config};

#[derive(Parser, Debug)]
#[command(name = "synthpod", about = "Modular LV2 plugin host", version)]
struct Args {
    /// Session bundle to load at startup
    #[arg(long, value_name = "BUNDLE")]
    load: Option<String>,

    /// Save the session to this bundle before exiting
    #[arg(long, value_name = "BUNDLE")]
    save: Option<String>,

    /// Render this many frames offline (silence input)
    #[arg(long, value_name = "FRAMES")]
    offline: Option<u64>,

    /// Sample rate in Hz
    #[arg(long, value_name = "HZ")]
    sample_rate: Option<u32>,

    /// Period size in frames
    #[arg(long, value_name = "N")]
    period: Option<u32>,

    /// Number of periods
    #[arg(long, value_name = "N")]
    num_periods: Option<u32>,

    /// Worker slots for parallel DSP
    #[arg(long, value_name = "N")]
    cpus: Option<u32>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(rate) = args.sample_rate {
        settings.sample_rate = rate;
    }
    if let Some(period) = args.period {
        settings.period_size = period;
    }
    if let Some(n) = args.num_periods {
        settings.num_periods = n;
    }
    if let Some(cpus) = args.cpus {
        settings.cpus_used = cpus.clamp(1, settings.cpus_available);
    }
    if let Err(err) = config::save_settings(&settings) {
        log::warn!("could not persist settings: {err}");
    }

    match run(args, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            let code = match err {
                Error::Plugin(_) => 2u8,
                _ => 1u8,
            };
            ExitCode::from(code)
        }
    }
}

fn run(args: Args, settings: AudioSettings) -> synthpod::Result<()> {
    log::info!(
        "starting engine: {} Hz, {} frames/period, {} dsp slot(s)",
        settings.sample_rate,
        settings.period_size,
        settings.cpus_used
    );

    let db = Arc::new(LilvDb::new());
    let mut engine = Engine::new(settings, db)?;
    let mut dsp = engine.take_dsp().expect("dsp state already taken");
    let mut ui = engine.take_ui().expect("ui handle already taken");

    let mut driver = OfflineDriver::new(settings.period_size);

    if let Some(bundle) = &args.load {
        log::info!("loading {bundle}");
        driver.request(&mut dsp, &mut ui, Msg::BundleLoad {
            path: bundle.clone(),
        })?;
    }

    if let Some(frames) = args.offline {
        let periods = frames.div_ceil(settings.period_size as u64);
        log::info!("rendering {frames} frames ({periods} periods) offline");
        for _ in 0..periods {
            let _ = driver.pump(&mut dsp, &mut ui);
        }
    }

    if let Some(bundle) = &args.save {
        log::info!("saving {bundle}");
        driver.request(&mut dsp, &mut ui, Msg::BundleSave {
            path: bundle.clone(),
        })?;
    }

    drop(dsp);
    engine.shutdown();
    Ok(())
}

/// Runs the callback with silent inputs, standing in for an audio driver.
struct OfflineDriver {
    nframes: u32,
    silence: Vec<f32>,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
    midi_io: Vec<u8>,
}

impl OfflineDriver {
    fn new(nframes: u32) -> Self {
        OfflineDriver {
            nframes,
            silence: vec![0.0; nframes as usize],
            out_l: vec![0.0; nframes as usize],
            out_r: vec![0.0; nframes as usize],
            midi_io: vec![0u8; 4096],
        }
    }

    /// One period with silent inputs; returns what the engine told the UI.
    fn pump(&mut self, dsp: &mut synthpod::DspState, ui: &mut synthpod::UiHandle) -> Vec<UiEvent> {
        let inputs: [&[f32]; 2] = [&self.silence, &self.silence];
        let mut outs: [&mut [f32]; 2] = [&mut self.out_l, &mut self.out_r];
        dsp.process(self.nframes, &inputs, &mut outs, &[], &mut self.midi_io);
        ui.poll()
    }

    /// Send a request and pump until its Ack or Error arrives.
    fn request(
        &mut self,
        dsp: &mut synthpod::DspState,
        ui: &mut synthpod::UiHandle,
        msg: Msg,
    ) -> synthpod::Result<()> {
        ui.send(&msg);
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            for event in self.pump(dsp, ui) {
                match event {
                    UiEvent::Msg(Msg::Ack { .. }) => return Ok(()),
                    UiEvent::Msg(Msg::ErrorReply { message, .. }) => {
                        return Err(Error::resource(message));
                    }
                    _ => {}
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(Error::resource("request timed out"))
    }
}
