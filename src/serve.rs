//! Building the database command line.
//!
//! Serving settings are validated into `ServeOptions`, turned into the
//! database's argument vector, and wrapped in the platform shell to form the
//! `LaunchPlan` the supervisor executes.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::ServingSettings;
use crate::error::ServeError;

/// Name of the database executable when none is configured.
pub const DEFAULT_EXECUTABLE: &str = "surreal";

/// Storage engine the database is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Memory,
    File,
    SurrealKv,
    Tikv,
}

impl Driver {
    /// Positional storage argument for `start`.
    pub fn storage_uri(self, storage: &str) -> String {
        match self {
            Driver::Memory => "memory".to_string(),
            Driver::File => format!("rocksdb://{storage}"),
            Driver::SurrealKv => format!("surrealkv://{storage}"),
            Driver::Tikv => format!("tikv://{storage}"),
        }
    }

    pub fn needs_storage(self) -> bool {
        !matches!(self, Driver::Memory)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Driver::Memory => "memory",
            Driver::File => "file",
            Driver::SurrealKv => "surrealkv",
            Driver::Tikv => "tikv",
        }
    }
}

impl FromStr for Driver {
    type Err = ServeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Driver::Memory),
            "file" | "rocksdb" => Ok(Driver::File),
            "surrealkv" => Ok(Driver::SurrealKv),
            "tikv" => Ok(Driver::Tikv),
            _ => Err(ServeError::InvalidDriver(value.to_string())),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log verbosity understood by the database's `--log` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    None,
    Full,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::None => "none",
            LogLevel::Full => "full",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ServeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LogLevel::None),
            "full" => Ok(LogLevel::Full),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ServeError::InvalidLogLevel(value.to_string())),
        }
    }
}

/// A fully resolved command for the supervisor to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Args are already quoted for the Windows command line.
    pub verbatim_args: bool,
    pub env: BTreeMap<String, String>,
    /// Health URL polled until the database answers.
    pub health_url: Option<String>,
}

#[cfg(test)]
impl LaunchPlan {
    pub fn direct(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            verbatim_args: false,
            env: BTreeMap::new(),
            health_url: None,
        }
    }
}

/// Validated serving options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub driver: Driver,
    pub storage: String,
    pub executable: String,
    pub log_level: LogLevel,
    pub legacy_compat: bool,
}

impl ServeOptions {
    pub fn from_settings(settings: &ServingSettings) -> Result<Self, ServeError> {
        let driver: Driver = settings.driver.parse()?;
        let log_level: LogLevel = settings.log_level.parse()?;
        let port = u16::try_from(settings.port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or(ServeError::InvalidPort(settings.port))?;
        let storage = settings.storage.trim().to_string();
        if driver.needs_storage() && storage.is_empty() {
            return Err(ServeError::MissingStorage {
                driver: driver.to_string(),
            });
        }
        let host = match settings.host.trim() {
            "" => "0.0.0.0".to_string(),
            host => host.to_string(),
        };
        Ok(Self {
            username: settings.username.clone(),
            password: settings.password.clone(),
            host,
            port,
            driver,
            storage,
            executable: resolve_executable(&settings.executable),
            log_level,
            legacy_compat: settings.legacy_compat,
        })
    }

    /// Address the database binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", bracket_ipv6(&self.host), self.port)
    }

    /// URL clients can connect to.
    pub fn endpoint(&self) -> String {
        endpoint_url(&self.host, self.port)
    }
}

/// URL for reaching a database bound to `host:port` from this machine.
///
/// Wildcard binds are reached over loopback; a specific interface is used
/// as given.
pub fn endpoint_url(host: &str, port: impl fmt::Display) -> String {
    let host = match host.trim() {
        "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        host => host,
    };
    format!("http://{}:{port}", bracket_ipv6(host))
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Argument vector for serving, starting with the executable.
pub fn serve_args(options: &ServeOptions) -> Vec<String> {
    let mut args = vec![
        options.executable.clone(),
        "start".to_string(),
        "--bind".to_string(),
        options.bind_addr(),
        "--user".to_string(),
        options.username.clone(),
        "--pass".to_string(),
        options.password.clone(),
        "--log".to_string(),
        options.log_level.as_str().to_string(),
    ];
    if options.legacy_compat {
        args.push("--auth".to_string());
    }
    args.push(options.driver.storage_uri(&options.storage));
    args.push("--allow-all".to_string());
    args
}

/// Wraps an argument vector in the platform shell.
pub fn build_start_command(argv: &[String]) -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string(), windows_join(argv)]
    } else {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("exec {}", shell_words::join(argv)),
        ]
    }
}

/// Launch plan for serving with the given options.
pub fn launch_plan(options: &ServeOptions) -> LaunchPlan {
    let mut shell = build_start_command(&serve_args(options));
    let program = shell.remove(0);
    let mut env = BTreeMap::new();
    env.insert("SURREAL_EXPERIMENTAL_GRAPHQL".to_string(), "true".to_string());
    LaunchPlan {
        program,
        args: shell,
        verbatim_args: cfg!(windows),
        env,
        health_url: Some(format!("{}/health", options.endpoint())),
    }
}

/// Validates settings and builds their launch plan.
pub fn plan_from_settings(settings: &ServingSettings) -> Result<LaunchPlan, ServeError> {
    Ok(launch_plan(&ServeOptions::from_settings(settings)?))
}

/// Resolves the executable: configured path, bundled binary, then `PATH`.
pub fn resolve_executable(configured: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return expand_home(configured);
    }
    bundled_executable()
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string())
}

fn bundled_executable() -> Option<PathBuf> {
    let current = env::current_exe().ok()?;
    let candidate = current
        .parent()?
        .join(format!("{DEFAULT_EXECUTABLE}{}", env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

// Quotes for the child's argv parser, then carets every character cmd.exe
// would interpret so `cmd /C` passes the line through untouched. Carets also
// keep `%VAR%` from expanding on the command line.
fn windows_join(argv: &[String]) -> String {
    let line = argv
        .iter()
        .map(|arg| windows_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let mut escaped = String::with_capacity(line.len() * 2);
    for ch in line.chars() {
        if matches!(ch, '(' | ')' | '%' | '!' | '^' | '"' | '<' | '>' | '&' | '|') {
            escaped.push('^');
        }
        escaped.push(ch);
    }
    escaped
}

fn windows_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::from("\"");
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
            }
        }
        if ch != '\\' {
            quoted.push(ch);
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}
