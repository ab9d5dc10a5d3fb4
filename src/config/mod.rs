//! Kernel configuration.
//!
//! Loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/barth/barth.toml)
//! 3. Built-in defaults (lowest priority)

pub mod logging;

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

pub use logging::{FileLogging, LogRotation, LoggingConfig};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `HH:MM` span, possibly crossing midnight (`start > end`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuietHours {
    pub start: String,
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { start: "22:00".to_string(), end: "07:00".to_string() }
    }
}

/// When the weekly alignment audit fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyWindow {
    /// `Mon`..`Sun`.
    pub weekday: String,
    pub time: String,
}

impl Default for WeeklyWindow {
    fn default() -> Self {
        Self { weekday: "Sun".to_string(), time: "20:00".to_string() }
    }
}

/// Reflection-window loop timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dreaming {
    /// `"HH:MM-HH:MM"`, the nightly window the daily journal may run in.
    pub nightly_window: String,
    pub weekly: WeeklyWindow,
}

impl Default for Dreaming {
    fn default() -> Self {
        Self { nightly_window: "23:00-02:00".to_string(), weekly: WeeklyWindow::default() }
    }
}

/// FTS index tokenizer selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieval {
    pub fts_tokenizer: String,
    pub fts_tokenizer_args: Option<String>,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self { fts_tokenizer: "porter".to_string(), fts_tokenizer_args: None }
    }
}

impl Retrieval {
    /// The full `tokenize = '...'` value: tokenizer plus its optional args.
    pub fn tokenizer_spec(&self) -> String {
        match &self.fts_tokenizer_args {
            Some(args) => format!("{} {args}", self.fts_tokenizer),
            None => self.fts_tokenizer.clone(),
        }
    }
}

/// Fully-resolved kernel configuration (env > file > default per field).
#[derive(Debug, Clone)]
pub struct Config {
    /// IANA timezone name, used for quiet-hours/reflection-window checks.
    pub timezone: String,

    /// Scheduler idle-sleep interval, seconds.
    pub loop_interval_seconds: u64,

    pub quiet_hours: QuietHours,
    pub dreaming: Dreaming,

    /// Per-drive cadence override: `{<drive id>: <cadence string>}`.
    pub drives: HashMap<String, String>,

    pub retrieval: Retrieval,

    /// Embedded store file path.
    pub db_path: PathBuf,

    /// Address the HTTP admin surface binds to.
    pub bind_addr: SocketAddr,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            loop_interval_seconds: 15,
            quiet_hours: QuietHours::default(),
            dreaming: Dreaming::default(),
            drives: HashMap::new(),
            retrieval: Retrieval::default(),
            db_path: default_db_path(),
            bind_addr: "127.0.0.1:8787".parse().unwrap(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/barth.db")
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileQuietHours {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileWeeklyWindow {
    pub weekday: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileDreaming {
    pub nightly_window: Option<String>,
    pub weekly: Option<FileWeeklyWindow>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRetrieval {
    pub fts_tokenizer: Option<String>,
    pub fts_tokenizer_args: Option<String>,
}

/// Config file structure: every field optional so a partial file only overrides
/// what it names, everything else falls through to `env > default`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub timezone: Option<String>,
    pub loop_interval_seconds: Option<u64>,
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,

    pub quiet_hours: Option<FileQuietHours>,
    pub dreaming: Option<FileDreaming>,

    #[serde(default)]
    pub drives: HashMap<String, String>,

    pub retrieval: Option<FileRetrieval>,
    pub logging: Option<FileLogging>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// `~/.config/barth/barth.toml`. Unix-style `~/.config` on every platform
    /// for consistency, matching the layout the teacher's proxy used for its own
    /// config.
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("barth").join("barth.toml"))
    }

    /// Write a commented default template on first run. Never overwrites an
    /// existing file; config errors should surface, not get papered over.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }

        let template = Self::default().to_toml();
        let _ = std::fs::write(&path, template);
    }

    /// Load the file layer if it exists. A present-but-malformed file is a fatal
    /// startup error with a clear diagnostic; a missing file silently falls back
    /// to `FileConfig::default()`.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                    eprintln!("║  CONFIG ERROR - Failed to parse configuration file          ║");
                    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, delete the file and restart barth.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > default, field by field.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        let timezone = std::env::var("BARTH_TIMEZONE").ok().or(file.timezone).unwrap_or(defaults.timezone);

        let loop_interval_seconds = std::env::var("BARTH_LOOP_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.loop_interval_seconds)
            .unwrap_or(defaults.loop_interval_seconds);

        let bind_addr = std::env::var("BARTH_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|s| s.parse().expect("invalid bind address"))
            .unwrap_or(defaults.bind_addr);

        let db_path = std::env::var("BARTH_DB_PATH")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let quiet_hours = file
            .quiet_hours
            .map(|q| QuietHours {
                start: q.start.unwrap_or(defaults.quiet_hours.start.clone()),
                end: q.end.unwrap_or(defaults.quiet_hours.end.clone()),
            })
            .unwrap_or(defaults.quiet_hours);

        let dreaming = file
            .dreaming
            .map(|d| Dreaming {
                nightly_window: d.nightly_window.unwrap_or(defaults.dreaming.nightly_window.clone()),
                weekly: d
                    .weekly
                    .map(|w| WeeklyWindow {
                        weekday: w.weekday.unwrap_or(defaults.dreaming.weekly.weekday.clone()),
                        time: w.time.unwrap_or(defaults.dreaming.weekly.time.clone()),
                    })
                    .unwrap_or(defaults.dreaming.weekly.clone()),
            })
            .unwrap_or(defaults.dreaming);

        let retrieval = file
            .retrieval
            .map(|r| Retrieval {
                fts_tokenizer: r.fts_tokenizer.unwrap_or(defaults.retrieval.fts_tokenizer.clone()),
                fts_tokenizer_args: r.fts_tokenizer_args.or(defaults.retrieval.fts_tokenizer_args.clone()),
            })
            .unwrap_or(defaults.retrieval);

        let drives = if file.drives.is_empty() { defaults.drives } else { file.drives };

        let logging = LoggingConfig::from_file(file.logging);

        Self { timezone, loop_interval_seconds, quiet_hours, dreaming, drives, retrieval, db_path, bind_addr, logging }
    }

    /// Serialize to TOML. Single source of truth for the on-disk format; used by
    /// both `ensure_config_exists` and the CLI's config inspection output.
    pub fn to_toml(&self) -> String {
        let drives_section = if self.drives.is_empty() {
            "# self_check = \"every:900\"\n# curiosity_probe = \"window:3600:2\"\n".to_string()
        } else {
            let mut keys: Vec<_> = self.drives.keys().collect();
            keys.sort();
            keys.iter().map(|k| format!("{k} = \"{}\"\n", self.drives[*k])).collect::<String>()
        };

        format!(
            r#"# barth configuration

# IANA timezone name used for quiet-hours and reflection-window checks
timezone = "{timezone}"

# Scheduler idle-sleep interval, seconds
loop_interval_seconds = {loop_interval}

# HTTP admin surface bind address
bind_addr = "{bind}"

# Embedded store file path
db_path = "{db_path}"

[quiet_hours]
start = "{qh_start}"
end = "{qh_end}"

[dreaming]
nightly_window = "{nightly_window}"
[dreaming.weekly]
weekday = "{weekly_weekday}"
time = "{weekly_time}"

# Per-drive cadence overrides (env DRIVE_<ID> takes precedence over these)
[drives]
{drives_section}
[retrieval]
fts_tokenizer = "{fts_tokenizer}"
# fts_tokenizer_args = "remove_diacritics 2"

# Logging configuration (RUST_LOG env var overrides `level`)
[logging]
level = "{log_level}"
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = "{log_file_prefix}"
"#,
            timezone = self.timezone,
            loop_interval = self.loop_interval_seconds,
            bind = self.bind_addr,
            db_path = self.db_path.display(),
            qh_start = self.quiet_hours.start,
            qh_end = self.quiet_hours.end,
            nightly_window = self.dreaming.nightly_window,
            weekly_weekday = self.dreaming.weekly.weekday,
            weekly_time = self.dreaming.weekly.time,
            drives_section = drives_section,
            fts_tokenizer = self.retrieval.fts_tokenizer,
            log_level = self.logging.level,
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = self.logging.file_dir.display(),
            log_file_rotation = self.logging.file_rotation.as_str(),
            log_file_prefix = self.logging.file_prefix,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.loop_interval_seconds, 15);
        assert_eq!(cfg.retrieval.fts_tokenizer, "porter");
        assert!(cfg.drives.is_empty());
    }

    #[test]
    fn retrieval_tokenizer_spec_combines_args() {
        let r = Retrieval { fts_tokenizer: "unicode61".to_string(), fts_tokenizer_args: Some("remove_diacritics 2".to_string()) };
        assert_eq!(r.tokenizer_spec(), "unicode61 remove_diacritics 2");
    }

    #[test]
    fn to_toml_round_trips_through_parser() {
        let cfg = Config::default();
        let toml_str = cfg.to_toml();
        let parsed: FileConfig = toml::from_str(&toml_str).expect("generated config must parse");
        assert_eq!(parsed.timezone.as_deref(), Some("UTC"));
        assert_eq!(parsed.loop_interval_seconds, Some(15));
    }
}
