//! dbdeck: a desktop shell around a local database server.
//!
//! This is the entry point. It parses the command line, sets up logging,
//! resolves the config store and runs one of three frontends (terminal
//! console, headless, or the JSON bridge) on top of the same supervisor.

mod app;
mod bridge;
mod clipboard;
mod config;
mod error;
mod events;
mod logging;
mod output;
mod runner;
mod serve;
mod tui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::app::{App, AppAction};
use crate::bridge::{Bridge, Command, Flow, Request};
use crate::config::{Config, ConfigStore, ServingOverrides};
use crate::events::{DatabaseEvent, Event, ProcessSignal};
use crate::logging::Verbosity;
use crate::runner::{ShutdownConfig, Supervisor};
use crate::serve::{plan_from_settings, LaunchPlan};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "dbdeck",
    version,
    about = "Desktop shell that serves a local database",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the JSON config file (default: ~/.dbdeck/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Start serving as soon as the shell opens.
    #[arg(long)]
    autostart: bool,
    /// Serve without the console and print database output to stdout.
    #[arg(long, conflicts_with = "bridge")]
    no_ui: bool,
    /// Speak the JSON-lines protocol on stdin/stdout.
    #[arg(long)]
    bridge: bool,
    /// Storage driver (memory, file, surrealkv, tikv).
    #[arg(long)]
    driver: Option<String>,
    /// Storage path or cluster address for persistent drivers.
    #[arg(long)]
    storage: Option<String>,
    /// Path to the database executable.
    #[arg(long)]
    executable: Option<String>,
    /// Root username.
    #[arg(long, alias = "user")]
    username: Option<String>,
    /// Root password.
    #[arg(long, alias = "pass")]
    password: Option<String>,
    /// Port to bind.
    #[arg(long)]
    port: Option<u32>,
    /// Interface to bind.
    #[arg(long)]
    host: Option<String>,
    /// Database log level (none, full, error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
    /// Start the database with legacy authentication.
    #[arg(long)]
    legacy_compat: bool,
    /// Time to wait after sending SIGINT before escalating (ms).
    #[arg(long)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long)]
    shutdown_sigterm_ms: Option<u64>,
    /// More shell logging (repeat for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect or manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum ConfigAction {
    /// Print the config file location.
    Path,
    /// Print the effective config.
    Show,
    /// Back up the current config and write the defaults.
    Reset,
    /// Copy the config to its backup file.
    Backup,
    /// Replace the config with its backup.
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Console,
    Headless,
    Bridge,
}

/// Runtime settings derived from the command line.
#[derive(Debug, Clone)]
struct RunSettings {
    mode: Mode,
    autostart: bool,
    overrides: ServingOverrides,
    shutdown: ShutdownConfig,
    verbosity: Verbosity,
}

impl RunSettings {
    fn from_cli(cli: &Cli) -> Self {
        const DEFAULT_SHUTDOWN_SIGINT_MS: u64 = 0;
        const DEFAULT_SHUTDOWN_SIGTERM_MS: u64 = 0;
        let mode = if cli.bridge {
            Mode::Bridge
        } else if cli.no_ui {
            Mode::Headless
        } else {
            Mode::Console
        };
        let overrides = ServingOverrides {
            driver: cli.driver.clone(),
            log_level: cli.log_level.clone(),
            storage: cli.storage.clone(),
            executable: cli.executable.clone(),
            username: cli.username.clone(),
            password: cli.password.clone(),
            port: cli.port,
            host: cli.host.clone(),
            legacy_compat: cli.legacy_compat.then_some(true),
        };
        let shutdown = ShutdownConfig::new(
            cli.shutdown_sigint_ms.unwrap_or(DEFAULT_SHUTDOWN_SIGINT_MS),
            cli.shutdown_sigterm_ms
                .unwrap_or(DEFAULT_SHUTDOWN_SIGTERM_MS),
        );
        Self {
            mode,
            autostart: cli.autostart,
            overrides,
            shutdown,
            verbosity: Verbosity::from_flags(cli.verbose, cli.quiet),
        }
    }

    /// Console mode owns the terminal; the others can log to stderr.
    fn mirror_logs_to_stderr(&self) -> bool {
        match self.mode {
            Mode::Console => false,
            Mode::Bridge => true,
            Mode::Headless => self.verbosity != Verbosity::Normal,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = RunSettings::from_cli(&cli);
    let log_dir = config::logs_dir().ok();
    let _log_guard = logging::init_logging(
        settings.verbosity,
        log_dir.as_deref(),
        settings.mirror_logs_to_stderr(),
    );

    let store = match &cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::at_default_location()?,
    };
    tracing::info!(config = %store.path().display(), mode = ?settings.mode, "dbdeck starting");

    if let Some(Commands::Config { action }) = cli.command {
        run_config_command(action, &store)?;
        return Ok(ExitCode::SUCCESS);
    }

    let (event_tx, event_rx) = mpsc::channel(512);
    let supervisor = Supervisor::new(event_tx.clone(), settings.shutdown);
    spawn_signal_listener(event_tx.clone());

    let failed = match settings.mode {
        Mode::Console => {
            run_console(&store, &settings, &supervisor, event_tx, event_rx).await?;
            false
        }
        Mode::Headless => run_headless(&store, &settings, &supervisor, event_rx).await?,
        Mode::Bridge => {
            run_bridge(store, &settings, &supervisor, event_tx, event_rx).await?;
            false
        }
    };

    tracing::info!("dbdeck exiting");
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run_config_command(action: ConfigAction, store: &ConfigStore) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", store.path().display()),
        ConfigAction::Show => {
            let text = serde_json::to_string_pretty(&store.load())
                .context("failed to serialize config")?;
            println!("{text}");
        }
        ConfigAction::Reset => {
            if store.path().is_file() {
                store.backup()?;
                println!("previous config saved to {}", store.backup_path().display());
            }
            store.save(&Config::default())?;
            println!("config reset at {}", store.path().display());
        }
        ConfigAction::Backup => {
            store.backup()?;
            println!("config backed up to {}", store.backup_path().display());
        }
        ConfigAction::Restore => {
            store.restore_backup()?;
            println!("config restored from {}", store.backup_path().display());
        }
    }
    Ok(())
}

/// Stored serving settings with command-line overrides applied.
fn plan_for(store: &ConfigStore, overrides: &ServingOverrides) -> Result<LaunchPlan, error::ServeError> {
    let mut serving = store.load().serving;
    overrides.apply(&mut serving);
    plan_from_settings(&serving)
}

fn endpoint_for(config: &Config, overrides: &ServingOverrides) -> String {
    let mut serving = config.serving.clone();
    overrides.apply(&mut serving);
    serve::endpoint_url(&serving.host, serving.port)
}

/// Stops the database while still draining `event_rx`, so a full channel
/// cannot block the monitor's final events. Returns the database events seen.
async fn shutdown_draining(
    supervisor: &Supervisor,
    event_rx: &mut mpsc::Receiver<Event>,
) -> Vec<DatabaseEvent> {
    let mut drained = Vec::new();
    let shutdown = supervisor.shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = event_rx.recv() => {
                if let Event::Database(event) = event {
                    drained.push(event);
                }
            }
        }
    }
    while let Ok(event) = event_rx.try_recv() {
        if let Event::Database(event) = event {
            drained.push(event);
        }
    }
    drained
}

async fn run_console(
    store: &ConfigStore,
    settings: &RunSettings,
    supervisor: &Supervisor,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    let config = store.load();
    let mut app = App::new(
        config.serving.history_size,
        endpoint_for(&config, &settings.overrides),
        config.window.pinned,
    );
    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(event_tx);

    if settings.autostart {
        handle_app_action(AppAction::Start, &mut app, store, settings, supervisor);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::Database(event) => app.on_database_event(&event),
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, store, settings, supervisor);
                    }
                    Event::Mouse(mouse) => {
                        app.handle_mouse(mouse);
                    }
                    Event::Resize => {
                        let _ = terminal.autoresize();
                    }
                    Event::Shutdown { signal } => {
                        tracing::info!(?signal, "shutdown requested");
                        app.should_quit = true;
                    }
                    Event::Request(_) => {}
                }
            }
            _ = ticker.tick() => {}
        }

        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    if let Some(pid) = supervisor.pid().await {
        tracing::info!(pid, "stopping database before exit");
        app.mark_stopping();
        app.set_status_warning_persistent("Stopping database...");
        let _ = tui::draw(&mut app, &mut terminal);
    }
    for event in shutdown_draining(supervisor, &mut event_rx).await {
        app.on_database_event(&event);
    }
    tui::restore_terminal(terminal)?;
    result
}

// Supervisor calls run on their own tasks so the loop keeps draining events.
fn handle_app_action(
    action: AppAction,
    app: &mut App,
    store: &ConfigStore,
    settings: &RunSettings,
    supervisor: &Supervisor,
) {
    match action {
        AppAction::None | AppAction::Quit => {}
        AppAction::Start => match plan_for(store, &settings.overrides) {
            Ok(plan) => {
                app.mark_starting();
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if let Err(err) = supervisor.start(plan).await {
                        tracing::error!("start failed: {err}");
                    }
                });
            }
            Err(err) => app.on_database_event(&DatabaseEvent::Error {
                message: err.to_string(),
            }),
        },
        AppAction::Stop => {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor.stop().await;
            });
        }
        AppAction::Restart => match plan_for(store, &settings.overrides) {
            Ok(plan) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    supervisor.stop().await;
                    if let Err(err) = supervisor.start(plan).await {
                        tracing::warn!("restart failed: {err}");
                    }
                });
            }
            Err(err) => app.on_database_event(&DatabaseEvent::Error {
                message: err.to_string(),
            }),
        },
        AppAction::Copy => match app.console_text() {
            Some(text) => match clipboard::copy_console(&text) {
                Ok(lines) => app.set_status_message(format!("Copied {lines} lines to clipboard")),
                Err(err) => app.set_status_warning_for(
                    format!("Clipboard failed: {err:#}"),
                    Duration::from_secs(3),
                ),
            },
            None => app.set_status_warning_for("Nothing to copy", Duration::from_secs(2)),
        },
        AppAction::Export => {
            let exported = config::exports_dir().and_then(|dir| app.export_console(&dir));
            if let Err(err) = exported {
                app.set_status_warning_for(format!("Export failed: {err:#}"), Duration::from_secs(3));
            }
        }
        AppAction::TogglePinned => match store.set_pinned(app.pinned) {
            Ok(()) => {
                tracing::info!(pinned = app.pinned, "window pin toggled");
                app.set_status_message(if app.pinned {
                    "Pinned on top"
                } else {
                    "Unpinned"
                });
            }
            Err(err) => {
                app.pinned = !app.pinned;
                app.set_status_warning_for(
                    format!("Could not save pin state: {err:#}"),
                    Duration::from_secs(3),
                );
            }
        },
    }
}

/// Serves until the database stops or the shell is signalled.
///
/// Returns `true` when the database failed.
async fn run_headless(
    store: &ConfigStore,
    settings: &RunSettings,
    supervisor: &Supervisor,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<bool> {
    let endpoint = endpoint_for(&store.load(), &settings.overrides);
    let plan = plan_for(store, &settings.overrides)?;
    supervisor.start(plan).await?;

    let mut failed = false;
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Database(DatabaseEvent::Started { pid }) => {
                println!("[dbdeck] database started (pid {pid})");
            }
            Event::Database(DatabaseEvent::Ready) => {
                println!("[dbdeck] database ready at {endpoint}");
            }
            Event::Database(DatabaseEvent::Output { line, .. }) => println!("[db] {line}"),
            Event::Database(DatabaseEvent::Error { message }) => {
                eprintln!("[dbdeck] {message}");
                failed = true;
                break;
            }
            Event::Database(DatabaseEvent::Stopped { code }) => {
                println!("[dbdeck] database stopped");
                failed = code.is_some_and(|code| code != 0);
                break;
            }
            Event::Shutdown { signal } => {
                tracing::info!(?signal, "shutdown requested");
                break;
            }
            Event::Key(_) | Event::Mouse(_) | Event::Resize | Event::Request(_) => {}
        }
    }

    for event in shutdown_draining(supervisor, &mut event_rx).await {
        if let DatabaseEvent::Output { line, .. } = event {
            println!("[db] {line}");
        }
    }
    Ok(failed)
}

async fn run_bridge(
    store: ConfigStore,
    settings: &RunSettings,
    supervisor: &Supervisor,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    let (out_tx, writer) = bridge::spawn_writer(tokio::io::stdout());
    {
        let out_tx = out_tx.downgrade();
        std::thread::spawn(move || {
            bridge::pump_requests(std::io::stdin().lock(), event_tx, out_tx);
        });
    }

    let mut bridge = Bridge::new(
        store,
        supervisor.clone(),
        out_tx,
        settings.overrides.clone(),
    );
    if settings.autostart {
        let request = Request {
            id: None,
            command: Command::StartDatabase(ServingOverrides::default()),
        };
        bridge.handle(request).await;
    }

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Database(event) => bridge.on_database_event(event).await,
            Event::Request(request) => {
                if bridge.handle(request).await == Flow::Exit {
                    break;
                }
            }
            Event::Shutdown { signal } => {
                tracing::info!(?signal, "shutdown requested");
                break;
            }
            Event::Key(_) | Event::Mouse(_) | Event::Resize => {}
        }
    }

    // Deliver the final stop notification before the writer closes.
    for event in shutdown_draining(supervisor, &mut event_rx).await {
        bridge.on_database_event(event).await;
    }
    drop(bridge);
    if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        tracing::warn!("bridge output did not drain");
    }
    Ok(())
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if tx.is_closed() {
            break;
        }
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => Event::Key(key),
                Ok(crossterm::event::Event::Mouse(mouse)) => Event::Mouse(mouse),
                Ok(crossterm::event::Event::Resize(..)) => Event::Resize,
                _ => continue,
            };
            let _ = tx.blocking_send(event);
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            let signal = tokio::select! {
                _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
                _ = sigterm.recv() => ProcessSignal::SigTerm,
            };
            let _ = tx.send(Event::Shutdown { signal: Some(signal) }).await;
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx
                .send(Event::Shutdown {
                    signal: Some(ProcessSignal::SigInt),
                })
                .await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dbdeck").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_console_with_immediate_kill() {
        let settings = RunSettings::from_cli(&parse(&[]));
        assert_eq!(settings.mode, Mode::Console);
        assert!(!settings.autostart);
        assert_eq!(settings.overrides, ServingOverrides::default());
        assert_eq!(settings.shutdown, ShutdownConfig::default());
        assert!(!settings.mirror_logs_to_stderr());
    }

    #[test]
    fn serving_flags_become_overrides() {
        let cli = parse(&[
            "--no-ui",
            "--port",
            "9000",
            "--driver",
            "surrealkv",
            "--storage",
            "/data",
            "--user",
            "admin",
            "--legacy-compat",
        ]);
        let settings = RunSettings::from_cli(&cli);
        assert_eq!(settings.mode, Mode::Headless);
        assert_eq!(settings.overrides.port, Some(9000));
        assert_eq!(settings.overrides.driver.as_deref(), Some("surrealkv"));
        assert_eq!(settings.overrides.username.as_deref(), Some("admin"));
        assert_eq!(settings.overrides.legacy_compat, Some(true));
        assert_eq!(settings.overrides.password, None);
    }

    #[test]
    fn bridge_and_no_ui_conflict() {
        assert!(Cli::try_parse_from(["dbdeck", "--bridge", "--no-ui"]).is_err());
        let settings = RunSettings::from_cli(&parse(&["--bridge", "-q"]));
        assert_eq!(settings.mode, Mode::Bridge);
        assert_eq!(settings.verbosity, Verbosity::Quiet);
        assert!(settings.mirror_logs_to_stderr());
    }

    #[test]
    fn shutdown_ladder_from_flags() {
        let cli = parse(&["--shutdown-sigint-ms", "500", "--shutdown-sigterm-ms", "1000"]);
        assert_eq!(
            RunSettings::from_cli(&cli).shutdown,
            ShutdownConfig::new(500, 1000)
        );
    }

    #[test]
    fn config_subcommand_parses() {
        let cli = parse(&["config", "show", "--config", "/tmp/x.json"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigAction::Show
            })
        ));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.json")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_keeps_draining_a_chatty_database() {
        let (tx, mut rx) = mpsc::channel(4);
        let supervisor = Supervisor::new(tx, ShutdownConfig::default());
        let plan = LaunchPlan::direct(
            "/bin/sh",
            vec!["-c".to_string(), "while true; do echo spam; done".to_string()],
        );
        supervisor.start(plan).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let drained = tokio::time::timeout(
            Duration::from_secs(3),
            shutdown_draining(&supervisor, &mut rx),
        )
        .await
        .expect("shutdown stalled on a full event channel");
        assert!(!supervisor.is_running().await);
        assert!(drained
            .iter()
            .any(|event| matches!(event, DatabaseEvent::Stopped { .. })));
    }

    #[test]
    fn config_reset_keeps_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut config = Config::default();
        config.serving.port = 9999;
        store.save(&config).unwrap();
        run_config_command(ConfigAction::Reset, &store).unwrap();
        assert_eq!(store.load(), Config::default());
        run_config_command(ConfigAction::Restore, &store).unwrap();
        assert_eq!(store.load().serving.port, 9999);
    }

    #[test]
    fn overrides_feed_the_launch_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let overrides = ServingOverrides {
            driver: Some("tikv".into()),
            ..ServingOverrides::default()
        };
        assert!(plan_for(&store, &overrides).is_err());
        let overrides = ServingOverrides {
            port: Some(8123),
            ..ServingOverrides::default()
        };
        assert_eq!(
            endpoint_for(&store.load(), &overrides),
            "http://127.0.0.1:8123"
        );
        let overrides = ServingOverrides {
            host: Some("10.0.0.5".into()),
            ..ServingOverrides::default()
        };
        assert_eq!(
            endpoint_for(&store.load(), &overrides),
            "http://10.0.0.5:8000"
        );
        assert!(plan_for(&store, &overrides).is_ok());
    }
}
