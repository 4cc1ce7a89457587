//! Gord CLI - The `gord` command.
//!
//! Drives the gord playback core from the command line:
//!
//! - **preview**: print the sequence a selection produces
//! - **play**: stream a selection to the playback engine
//! - **chain**: play captured slots as a chain until it completes
//!
//! The playback engine is reached over the control socket from the config
//! file (`gord init` writes one). `--dry-run` logs every message instead.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use gord_core::theory::parse_note_name;
use gord_core::{
    AppState, ChainObserver, ChainSession, ChainTick, Config, ControlChannel, DatagramChannel,
    Direction, LoopCount, RecordingChannel, ScaleLibrary, ScaleLookup, SelectionState,
    SequenceGenerator, SlotSnapshot, StateManager, Step, TransportSync,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Gord - arpeggio and chord chain player
#[derive(Parser, Debug)]
#[command(name = "gord")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Arpeggio sequencing and chain playback for a real-time MIDI engine", long_about = None)]
struct Cli {
    /// Config file (defaults to the per-user location)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the sequence a selection produces
    Preview {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Stream a selection to the engine
    Play {
        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Play a chain of slots until it completes
    Chain {
        /// Slot as comma-separated MIDI notes with an optional loop count,
        /// e.g. `60,64,67:2`. `-1` is a rest, `:inf` loops forever.
        #[arg(long = "slot", value_name = "NOTES[:LOOPS]", required = true, allow_hyphen_values = true)]
        slots: Vec<String>,

        /// Passes over all slots (`inf` for endless)
        #[arg(long)]
        global: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List the built-in scales
    Scales,

    /// Create default config file
    Init,

    /// Show config file path
    ConfigPath,
}

#[derive(Args, Debug)]
struct SelectionArgs {
    /// Root note name
    #[arg(long, default_value = "C")]
    root: String,

    /// Comma-separated intervals above the root (0-12)
    #[arg(long, default_value = "0,4,7")]
    intervals: String,

    /// Comma-separated octaves applied to every interval (0-8)
    #[arg(long, default_value = "4")]
    octaves: String,

    /// forward, reverse, ping-pong or ping-pong-reverse
    #[arg(long, default_value = "forward")]
    direction: Direction,

    /// Keep the repeated turning note in ping-pong modes
    #[arg(long)]
    turnaround: bool,

    /// Weave the interval lists instead of playing them in turn
    #[arg(long)]
    alt: bool,

    /// Scale key for the diatonic filter
    #[arg(long)]
    scale: Option<String>,

    /// Snap notes to the scale
    #[arg(long, requires = "scale")]
    diatonic: bool,
}

#[derive(Args, Debug)]
struct OutputArgs {
    #[arg(long)]
    tempo: Option<f64>,

    /// Gate in percent of a step
    #[arg(long)]
    gate: Option<f64>,

    /// Steps per whole note
    #[arg(long)]
    subdivision: Option<u32>,

    /// Output transposition in semitones
    #[arg(long)]
    transpose: Option<i32>,

    /// Override the engine socket (path, `udp://host:port` or `noop`)
    #[arg(long)]
    socket: Option<String>,

    /// Stop after this long (e.g. `8s`, `1m 30s`)
    #[arg(long = "for", value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log the messages instead of sending them
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let scales = ScaleLibrary::builtin();

    match cli.command {
        Commands::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            Ok(())
        }
        Commands::ConfigPath => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Scales => {
            for key in scales.keys_by_length() {
                if let Some(def) = scales.get(key) {
                    println!("{:<20} {:<24} {:?}", key, def.display_name, def.intervals);
                }
            }
            Ok(())
        }
        Commands::Preview { selection } => {
            let sel = build_selection(&selection, &SelectionState::default(), &scales)?;
            let sequence = SequenceGenerator::new(&scales).generate(&sel);
            if sequence.is_empty() {
                println!("(empty)");
            } else {
                let notes: Vec<String> = sequence
                    .iter()
                    .map(|s| match s.note() {
                        Some(n) => n.to_string(),
                        None => "-".to_string(),
                    })
                    .collect();
                println!("{}", notes.join(" "));
            }
            Ok(())
        }
        Commands::Play { selection, output } => {
            let config = load_config(cli.config.as_ref())?;
            let mut state = config.initial_state();
            apply_output(&mut state, &output);
            state.selection = build_selection(&selection, &state.selection, &scales)?;
            play(&config, state, &output, &scales)
        }
        Commands::Chain {
            slots,
            global,
            output,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let mut state = config.initial_state();
            apply_output(&mut state, &output);
            for (index, text) in slots.iter().enumerate() {
                let snapshot = parse_slot(index, text)?;
                if !state.slots.set(index, snapshot) {
                    bail!("At most {} slots are supported", gord_core::slots::MAX_SLOTS);
                }
            }
            if let Some(global) = global {
                state.chain.global_loops = LoopCount::parse_global(&global);
            }
            play_chain(&config, state, &output)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::load_or_default()),
    }
}

fn parse_list<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|_| anyhow::anyhow!("Invalid {}: '{}'", what, s))
        })
        .collect()
}

fn build_selection(
    args: &SelectionArgs,
    base: &SelectionState,
    scales: &dyn ScaleLookup,
) -> Result<SelectionState> {
    let mut sel = base.clone();
    let root = parse_note_name(&args.root)?;
    let octaves: Vec<u8> = parse_list(&args.octaves, "octave")?;
    for interval in parse_list::<u8>(&args.intervals, "interval")? {
        for &octave in &octaves {
            sel.select(interval, octave);
        }
    }

    if let Some(key) = &args.scale {
        if scales.intervals(key).is_none() {
            return Err(gord_core::Error::UnknownScale(key.clone()).into());
        }
    }
    sel.set_scale(args.scale.as_deref(), scales);
    sel.set_root(Some(root), scales);
    sel.diatonic = args.diatonic;
    sel.alt_sequence = args.alt;
    sel.direction = args.direction;
    sel.include_turnaround = args.turnaround || !args.direction.is_ping_pong();
    Ok(sel)
}

fn apply_output(state: &mut AppState, output: &OutputArgs) {
    let sel = &mut state.selection;
    if let Some(tempo) = output.tempo {
        sel.set_tempo(tempo);
    }
    if let Some(gate) = output.gate {
        sel.set_gate(gate);
    }
    if let Some(subdivision) = output.subdivision {
        sel.set_subdivision(subdivision);
    }
    if let Some(transpose) = output.transpose {
        sel.transpose = transpose;
    }
}

/// `60,64,67:2` into a slot.
fn parse_slot(index: usize, text: &str) -> Result<SlotSnapshot> {
    let (notes, loops) = match text.split_once(':') {
        Some((notes, loops)) => (notes, LoopCount::parse_slot(loops)),
        None => (text, LoopCount::default()),
    };
    let sequence: Vec<Step> = parse_list::<i32>(notes, "note")
        .with_context(|| format!("Bad slot '{}'", text))?
        .into_iter()
        .map(Step::from_raw)
        .collect();
    let snapshot = SlotSnapshot::new(format!("slot {}", index + 1), sequence, loops);
    if !snapshot.has_notes() {
        bail!("Slot '{}' has no playable notes", text);
    }
    Ok(snapshot)
}

fn open_channel(config: &Config, output: &OutputArgs) -> Arc<dyn ControlChannel> {
    if output.dry_run {
        return Arc::new(RecordingChannel::with_echo());
    }
    let target = output.socket.as_deref().unwrap_or(&config.engine.socket);
    match DatagramChannel::open(target) {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            log::warn!("Engine socket {} unavailable ({}), messages are dropped", target, e);
            Arc::new(DatagramChannel::noop())
        }
    }
}

/// Set on SIGINT/SIGTERM.
fn stop_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("Failed to install Ctrl-C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .context("Failed to install SIGTERM handler")?;
    Ok(flag)
}

/// Block until interrupted, `limit` elapses or `done` fires.
fn wait(stop: &AtomicBool, limit: Option<Duration>, done: Option<&Receiver<()>>) {
    let started = Instant::now();
    loop {
        if stop.load(Ordering::Relaxed) {
            log::info!("Interrupted");
            return;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            return;
        }
        match done {
            Some(rx) => match rx.recv_timeout(POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            },
            None => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

fn report(transport: &TransportSync) {
    let (sent, failed) = transport.stats();
    log::info!("{} messages sent, {} failed", sent, failed);
    if failed > 0 && sent == 0 {
        log::warn!("Nothing reached the engine; is it running?");
    }
}

fn play(config: &Config, state: AppState, output: &OutputArgs, scales: &ScaleLibrary) -> Result<()> {
    let stop = stop_flag()?;
    let state = StateManager::with_state(state);
    let sequence = state.regenerate_sequence(scales);
    if sequence.is_empty() {
        log::warn!("Selection is empty, playback stays silent until it changes");
    }

    let transport = TransportSync::new(
        state,
        open_channel(config, output),
        config.to_transport_options(),
    );
    transport.start();
    log::info!("Playing {} steps (Ctrl+C to stop)", sequence.len());
    wait(&stop, output.duration, None);
    transport.stop();
    report(&transport);
    Ok(())
}

/// Forwards chain progress to the log and signals completion.
struct Progress {
    done: Sender<()>,
}

impl ChainObserver for Progress {
    fn on_tick(&self, tick: ChainTick) {
        if tick.active {
            log::info!(
                "slot {} loop {}/{}",
                tick.slot_index + 1,
                tick.current_loop,
                tick.total
            );
        }
    }

    fn on_complete(&self) {
        let _ = self.done.try_send(());
    }
}

fn play_chain(config: &Config, state: AppState, output: &OutputArgs) -> Result<()> {
    let stop = stop_flag()?;
    let global = state.chain.global_loops;
    let transport = Arc::new(TransportSync::new(
        StateManager::with_state(state),
        open_channel(config, output),
        config.to_transport_options(),
    ));

    let session = ChainSession::new(Arc::clone(&transport), config.to_chain_options());
    let (done_tx, done_rx) = bounded(1);
    session.set_observer(Arc::new(Progress { done: done_tx }));
    session.link();
    session.start();
    log::info!("Chain playing, {} passes (Ctrl+C to stop)", global);

    wait(&stop, output.duration, Some(&done_rx));
    session.stop();
    session.unlink();
    report(&transport);
    Ok(())
}
