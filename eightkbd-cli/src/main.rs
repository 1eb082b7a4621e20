mod pcapng;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use eightkbd_proto::engine::{KeyboardEngine, INTERFACE, PRODUCT_ID, VENDOR_ID};
use eightkbd_proto::keys;
use eightkbd_proto::profile::{KeyMapping, Macro, MacroEvent, Profile, ProfileDiff};
use eightkbd_proto::transport::HidTransport;

/// Every raw wire key code this device exposes a mapping slot for.
fn assignable_keys() -> Vec<u8> {
    keys::EIGHTKBD_KEY_VALUES
        .iter()
        .map(|(wire, _)| *wire)
        .filter(|&k| keys::is_assignable(k))
        .collect()
}

#[derive(Parser)]
#[command(name = "eightkbd-cli")]
#[command(about = "Read and edit an 8KBD programmable pad's key map and macros")]
struct Cli {
    /// Emit packets without sending them to the device
    #[arg(long, global = true)]
    test: bool,
    /// Skip reading the device's current profile; send every edit unconditionally
    #[arg(long, global = true)]
    force: bool,
    /// Log every packet exchanged with the device
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Response timeout, in milliseconds
    #[arg(long, global = true, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every HUT keyboard-page code this device can map a key to
    ListInCodes,
    /// List every physical key code this device has a mapping slot for
    ListOutCodes,
    /// Print the device's current name, key map, and macros
    GetProfile,
    /// Rename the profile
    SetName { name: String },
    /// Map one physical key to a target key, with an optional modifier
    SetKey {
        from: String,
        to: String,
        #[arg(long)]
        modifier: Option<String>,
    },
    /// Attach a macro to a physical key; pass `--repeats 0` to delete it
    SetMacro {
        from: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value_t = 1)]
        repeats: u16,
        /// Comma-separated events: `press:a`, `release:a`, `mpress:left-control`, `mrelease:...`, `delay:100`
        #[arg(long, value_delimiter = ',')]
        events: Vec<String>,
    },
    /// Replace the entire profile with the factory identity mapping
    SetAllDefault,
    /// Decode a pcapng capture of this device's USB traffic
    DecodeCapture {
        file: PathBuf,
        #[arg(long)]
        load: Option<PathBuf>,
        #[arg(long)]
        save: Option<PathBuf>,
        #[arg(long, default_value_t = -1)]
        count: i64,
    },
}

fn parse_macro_event(token: &str) -> Result<MacroEvent> {
    let (kind, arg) = token
        .split_once(':')
        .with_context(|| format!("macro event {token:?} isn't of the form kind:arg"))?;
    Ok(match kind {
        "delay" => MacroEvent::Delay(arg.parse().with_context(|| format!("bad delay {arg:?}"))?),
        "press" => MacroEvent::Pressed(keys::hut_code_from_name(arg)?),
        "release" => MacroEvent::Released(keys::hut_code_from_name(arg)?),
        "mpress" => MacroEvent::ModPressed(keys::mod_code_from_name(arg)?),
        "mrelease" => MacroEvent::ModReleased(keys::mod_code_from_name(arg)?),
        other => anyhow::bail!("unknown macro event kind {other:?}"),
    })
}

fn open_transport() -> Result<HidTransport> {
    HidTransport::open(VENDOR_ID, PRODUCT_ID, INTERFACE, true).context("opening raw-HID device")
}

fn load_diff(transport: &mut HidTransport, cli: &Cli) -> Result<ProfileDiff> {
    let default = Profile::identity(&assignable_keys());
    let current = if cli.force {
        Profile::default()
    } else {
        let mut engine = KeyboardEngine::new(transport, Duration::from_millis(cli.timeout_ms), false);
        engine.get_profile(&assignable_keys()).context("reading current profile")?
    };
    Ok(ProfileDiff::new(default, current))
}

fn submit(transport: &mut HidTransport, cli: &Cli, diff: &ProfileDiff) -> Result<()> {
    let edits = diff.edits();
    if cli.verbose {
        log::info!("submitting {} edit(s)", edits.len());
    }
    let mut engine = KeyboardEngine::new(transport, Duration::from_millis(cli.timeout_ms), cli.test);
    engine.submit(&edits).context("submitting edits to device")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
    } else {
        env_logger::init();
    }

    match &cli.command {
        Command::ListInCodes => {
            for (code, name) in keys::HUT_KEYS.iter().enumerate() {
                println!("{code:#04x} {name}");
            }
        }
        Command::ListOutCodes => {
            for wire_key in assignable_keys() {
                let name = keys::name_from_key_code(wire_key).unwrap_or("?");
                println!("{wire_key:#04x} {name}");
            }
        }
        Command::GetProfile => {
            let mut transport = open_transport()?;
            let mut engine = KeyboardEngine::new(&mut transport, Duration::from_millis(cli.timeout_ms), false);
            let profile = engine.get_profile(&assignable_keys()).context("reading profile")?;
            println!("name: {}", profile.name);
            for (&from_key, mapping) in &profile.keys {
                let from_name = keys::name_from_key_code(from_key).unwrap_or("?");
                println!("  {from_name} -> to={:#04x} mod={:#04x}", mapping.to_key, mapping.mod_key);
            }
            for (&from_key, macro_) in &profile.macros {
                let from_name = keys::name_from_key_code(from_key).unwrap_or("?");
                println!("  {from_name} macro {:?} repeats={} events={}", macro_.name, macro_.repeats, macro_.events.len());
            }
        }
        Command::SetName { name } => {
            let mut transport = open_transport()?;
            let mut diff = load_diff(&mut transport, &cli)?;
            diff.set_name(name.clone());
            submit(&mut transport, &cli, &diff)?;
        }
        Command::SetKey { from, to, modifier } => {
            let mut transport = open_transport()?;
            let mut diff = load_diff(&mut transport, &cli)?;
            let from_key = keys::key_code_from_name(from)?;
            let to_key = keys::hut_code_from_name(to)?;
            let mod_key = match modifier {
                Some(m) => keys::mod_code_from_name(m)?,
                None => keys::KEY_DISABLE,
            };
            let mapping = KeyMapping::new(to_key, mod_key)?;
            diff.set_key(from_key, mapping);
            submit(&mut transport, &cli, &diff)?;
        }
        Command::SetMacro { from, name, repeats, events } => {
            let mut transport = open_transport()?;
            let mut diff = load_diff(&mut transport, &cli)?;
            let from_key = keys::key_code_from_name(from)?;
            let macro_ = if *repeats == 0 {
                Macro::delete()
            } else {
                let events = events.iter().map(|e| parse_macro_event(e)).collect::<Result<Vec<_>>>()?;
                Macro { name: name.clone(), repeats: *repeats, events }
            };
            diff.set_macro(from_key, macro_);
            submit(&mut transport, &cli, &diff)?;
        }
        Command::SetAllDefault => {
            let mut transport = open_transport()?;
            let mut diff = load_diff(&mut transport, &cli)?;
            diff.set_all_default();
            submit(&mut transport, &cli, &diff)?;
        }
        Command::DecodeCapture { file, load, save, count } => {
            let options = pcapng::ScanOptions {
                verbose: cli.verbose,
                count: *count,
                load_state: load.as_deref(),
                save_state: save.as_deref(),
            };
            pcapng::scan(file, &options)?;
        }
    }

    Ok(())
}
