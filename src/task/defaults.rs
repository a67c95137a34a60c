use std::path::PathBuf;

// Output layout
pub const DEFAULT_LOCAL_OUTPUT_PATH: &str = "results";
pub const RESOURCE_SUBDIR: &str = "resources";
pub const RESOURCE_METADATA_FILE: &str = "resource_metadata.json";
pub const TASK_LOG_FILE: &str = "task.log";
pub const DEFAULT_SFTP_PRIVATE_KEY: &str = "~/.ssh/id_rsa";
pub const DEFAULT_SFTP_PORT: u16 = 22;

// Visit completion
pub const DEFAULT_TIMEOUT_SECS: i64 = 10;
pub const DEFAULT_TIME_AFTER_LOAD_SECS: i64 = 5;
pub const DEFAULT_NAV_TIMEOUT_SECS: u64 = 30;

// Data gathering
pub const DEFAULT_ALL_RESOURCES: bool = true;
pub const DEFAULT_RESOURCE_METADATA: bool = true;

pub const DEFAULT_SHUFFLE: bool = true;
pub const DEFAULT_PROTOCOL_PREFIX: &str = "https://";

/// Capacity of each per-kind DevTools event channel. A flood beyond this
/// back-pressures the demultiplexer rather than dropping events.
pub const DEFAULT_EVENT_CHANNEL_BUFFER: usize = 10_000;

// Canonical browser install locations, Chromium preferred over Chrome.
#[cfg(target_os = "macos")]
pub const DEFAULT_CHROMIUM_PATH: &str = "/Applications/Chromium.app/Contents/MacOS/Chromium";
#[cfg(target_os = "macos")]
pub const DEFAULT_CHROME_PATH: &str =
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

#[cfg(not(target_os = "macos"))]
pub const DEFAULT_CHROMIUM_PATH: &str = "/usr/bin/chromium-browser";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_CHROME_PATH: &str = "/usr/bin/google-chrome-stable";

/// Flags applied to Chromium-based browsers unless the task overrides them.
pub const DEFAULT_BROWSER_FLAGS: &[&str] = &[
    "--enable-features=NetworkService",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-client-side-phishing-detection",
    "--disable-extensions",
    "--disable-features=IsolateOrigins,site-per-process",
    "--disable-hang-monitor",
    "--disable-ipc-flooding-protection",
    "--disable-infobars",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--disk-cache-size=0",
    "--incognito",
    "--new-window",
    "--no-default-browser-check",
    "--no-first-run",
    "--no-sandbox",
    "--safebrowsing-disable-auto-update",
];

/// Default root for per-task temporary state.
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("MIDA")
}
