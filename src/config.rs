use std::{fs, io, str::FromStr, time::SystemTime};

use clap::Parser;

pub const DEFAULT_CONFIG: &str = "/etc/house/portal.config";

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

/// The HTTP listening mode: the well-known port by default, or an ephemeral
/// one for side-by-side test runs.
#[derive(Debug, Clone, Copy)]
pub enum HttpService {
    Dynamic,
    Port(u16),
}

impl FromStr for HttpService {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "dynamic" {
            return Ok(Self::Dynamic);
        }

        value
            .parse::<u16>()
            .map(Self::Port)
            .map_err(|_| format!("unknown http service: {value}"))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Config {
    /// Path of the static configuration file.
    ///
    /// One directive per line: REDIRECT, PEER, LOCAL or SIGN; `#` introduces
    /// a comment.
    #[arg(long, default_value = DEFAULT_CONFIG)]
    pub config: String,

    /// UDP port the registration receiver binds to.
    #[arg(long, default_value_t = 70)]
    pub portal_port: u16,

    /// HTTP listening port, or "dynamic" for an ephemeral one.
    #[arg(long, default_value = "80")]
    pub http_service: HttpService,

    /// Log verbosity.
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Config {
    /// Load command line parameters.
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn http_port(&self) -> u16 {
        match self.http_service {
            HttpService::Dynamic => 0,
            HttpService::Port(port) => port,
        }
    }
}

/// Watches the static configuration file for mtime changes; the content is
/// only re-read when the file actually changed.
pub struct ConfigWatcher {
    path: String,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// The caller has already loaded the file once; start from its current
    /// mtime so the first poll is quiet.
    pub fn new(path: String) -> Self {
        let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
        Self { path, modified }
    }

    /// Returns the file content when its mtime moved since the last poll.
    pub fn poll(&mut self) -> io::Result<Option<String>> {
        let modified = fs::metadata(&self.path)?.modified()?;

        if Some(modified) == self.modified {
            return Ok(None);
        }

        self.modified = Some(modified);
        fs::read_to_string(&self.path).map(Some)
    }
}
