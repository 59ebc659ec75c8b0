use std::time::Duration;

/// Prefix for environment variable overrides, e.g. `UNIPACK_MAX_RETRIES`.
pub static ENV_PREFIX: &str = "UNIPACK";

/// Store holding ignored-update rules.
pub static IGNORED_UPDATES_STORE: &str = "ignored_updates";

/// Store holding desktop shortcut decisions.
pub static DESKTOP_SHORTCUTS_STORE: &str = "desktop_shortcuts";

/// Separator between manager name and package id in ignored-update keys.
pub const IGNORE_KEY_SEPARATOR: char = '\\';

pub const DEFAULT_MAX_PARALLEL_OPERATIONS: usize = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LISTING_CACHE_SECS: u64 = 15;

/// How long package details stay cached.
pub const DETAILS_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DETAILS_CACHE_CAPACITY: u64 = 1000;

/// How long output readers may keep draining after a process was killed.
pub const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Buffered events per operation subscriber.
pub const OPERATION_EVENT_CAPACITY: usize = 256;

pub static DEFAULT_SHORTCUT_EXTENSIONS: &[&str] = &["lnk", "desktop", "url"];

#[cfg(windows)]
pub static DEFAULT_ELEVATOR: &[&str] = &["gsudo"];
#[cfg(not(windows))]
pub static DEFAULT_ELEVATOR: &[&str] = &["sudo", "-n"];
