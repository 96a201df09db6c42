//! modstats - opt-in anonymous device stats reporter
//!
//! This binary maps host-OS signals (boot-completed, shutdown, connectivity
//! changes, explicit service starts) and the consent toggle onto the core
//! reporting state machine, plus `status`/`preview` inspection commands.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Preferences: $XDG_DATA_HOME/modstats/prefs.db (~/.local/share/modstats/prefs.db)
//! - Logs: $XDG_STATE_HOME/modstats/modstats.log (~/.local/state/modstats/modstats.log)
//! - Config: $XDG_CONFIG_HOME/modstats/config.toml (~/.config/modstats/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use modstats_core::machine::ConsentPrompt;
use modstats_core::{
    Config, ConsentStore, DeviceEvent, DeviceRecord, EventDispatcher, HttpReporter,
    ReportingStateMachine, SqliteBackend, SystemIdentity,
};
use process_lock::try_acquire_reporter;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "modstats")]
#[command(about = "Opt-in anonymous device stats reporter")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handle a boot-completed signal (reset check-in, then attempt a report)
    Boot,

    /// Handle a shutdown signal (reset check-in only, no report)
    Shutdown,

    /// Handle a connectivity change
    Connectivity {
        /// New connectivity state
        #[arg(value_enum)]
        state: ConnState,
    },

    /// Explicit service start (attempt a report if eligible)
    Trigger,

    /// Record the user's consent choice
    OptIn {
        /// true to opt in, false to opt out
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Show reporting state and configuration
    Status,

    /// Show the record that would be submitted
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConnState {
    Up,
    Down,
}

/// Production consent prompt. Notification plumbing belongs to the host OS;
/// here the prompt is a one-line notice pointing at the opt-in command.
struct ConsolePrompt;

impl ConsentPrompt for ConsolePrompt {
    fn prompt_consent(&self) {
        println!("modstats: anonymous device stats need your consent.");
        println!(
            "Run `modstats preview` to see what would be sent, \
             then `modstats opt-in true` (or `false`)."
        );
        tracing::info!("Prompted user for opt-in");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging (to file; reporting never writes errors to the user)
    let _log_guard =
        modstats_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Boot => dispatch_event(&config, DeviceEvent::BootCompleted),
        Command::Shutdown => dispatch_event(&config, DeviceEvent::Shutdown),
        Command::Connectivity { state } => dispatch_event(
            &config,
            DeviceEvent::ConnectivityChanged {
                connected: state == ConnState::Up,
            },
        ),
        Command::Trigger => dispatch_event(&config, DeviceEvent::ServiceStart),
        Command::OptIn { enabled } => cmd_opt_in(&config, enabled),
        Command::Status => cmd_status(&config),
        Command::Preview => cmd_preview(&config),
    }
}

/// Open the durable preference store.
fn open_store(prefs_path: &Path) -> Result<ConsentStore> {
    let backend = SqliteBackend::open(prefs_path).context("failed to open preference store")?;
    Ok(ConsentStore::new(Box::new(backend)))
}

/// Wire the state machine with production collaborators.
fn build_dispatcher(config: &Config, prefs_path: &Path) -> Result<EventDispatcher> {
    let mut store = open_store(prefs_path)?;
    let install_id = store.install_id().context("failed to read install id")?;

    let machine = ReportingStateMachine::new(
        store,
        Arc::new(SystemIdentity::new(config.identity.clone(), &install_id)),
        Arc::new(HttpReporter::new(&config.report).context("failed to create reporter")?),
        Arc::new(ConsolePrompt),
    );

    Ok(EventDispatcher::new(machine))
}

/// Route one external event through the state machine, draining any started
/// submission before exit.
fn dispatch_event(config: &Config, event: DeviceEvent) -> Result<()> {
    handle_event(config, event, &Config::prefs_path())
}

fn handle_event(config: &Config, event: DeviceEvent, prefs_path: &Path) -> Result<()> {
    let Some(_guard) = try_acquire_reporter(prefs_path)? else {
        // The flock guards the submission, not the flag writes: boot and
        // shutdown must clear the check-in flag even while another instance
        // is mid-report. Only the trigger is skipped.
        if matches!(event, DeviceEvent::BootCompleted | DeviceEvent::Shutdown) {
            let mut store = open_store(prefs_path)?;
            store
                .set_checked_in(false)
                .context("failed to reset check-in state")?;
            tracing::info!(?event, "Another reporter instance is active; applied reset only");
        } else {
            tracing::info!(?event, "Another reporter instance is active; exiting");
        }
        println!("modstats: another reporter instance is running; skipping report.");
        return Ok(());
    };

    let dispatcher = build_dispatcher(config, prefs_path)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    runtime.block_on(async {
        let outcome = dispatcher.dispatch(event)?;
        tracing::info!(?event, ?outcome, "Event dispatched");
        dispatcher.wait_idle().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_opt_in(config: &Config, enabled: bool) -> Result<()> {
    let prefs_path = Config::prefs_path();
    let Some(_guard) = try_acquire_reporter(&prefs_path)? else {
        println!("modstats: another reporter instance is running; try again shortly.");
        return Ok(());
    };

    let dispatcher = build_dispatcher(config, &prefs_path)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    runtime.block_on(async {
        let outcome = dispatcher.machine().on_consent_changed(enabled)?;
        tracing::info!(enabled, ?outcome, "Consent updated from CLI");
        dispatcher.wait_idle().await;
        Ok::<_, anyhow::Error>(())
    })?;

    if enabled {
        println!("Opted in to anonymous device stats.");
    } else {
        println!("Opted out of anonymous device stats.");
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let store = open_store(&Config::prefs_path())?;

    println!("modstats Reporting Status");
    println!("=========================");
    println!();
    println!("Opted in:       {}", store.opted_in()?);
    println!("First boot:     {}", store.first_boot()?);
    println!("Checked in:     {}", store.checked_in()?);
    match store.last_checkin_at()? {
        Some(at) => println!("Last check-in:  {}", at.to_rfc3339()),
        None => println!("Last check-in:  <never>"),
    }
    println!("Endpoint:       {}", config.report.endpoint());

    Ok(())
}

fn cmd_preview(config: &Config) -> Result<()> {
    let mut store = open_store(&Config::prefs_path())?;
    let install_id = store.install_id().context("failed to read install id")?;
    let identity = SystemIdentity::new(config.identity.clone(), &install_id);
    let record = DeviceRecord::collect(&identity);

    println!("Report Preview");
    println!("==============");
    println!();
    println!("device_hash:        {}", record.device_hash);
    println!("device_name:        {}", record.device_name);
    println!("device_version:     {}", record.device_version);
    println!("device_country:     {}", record.device_country);
    println!("device_carrier:     {}", record.device_carrier);
    println!("device_carrier_id:  {}", record.device_carrier_id);

    Ok(())
}
