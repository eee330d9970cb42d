//! Shim configuration.
//!
//! Read from an INI file named `loopcast.ini` next to the shim binary,
//! section `[Settings]`. A missing or unreadable file yields the defaults
//! (virtual backend, system default endpoint, latency mode 1) so the shim
//! always comes up.

use std::path::{Path, PathBuf};

use log::{debug, warn};

/// Value of `TargetDriverCLSID` that selects the virtual backend.
pub const VIRTUAL_BACKEND_ID: &str = "Virtual";

const CONFIG_FILE_NAME: &str = "loopcast.ini";
const SETTINGS_SECTION: &str = "Settings";

/// Ring pre-roll presets, largest (safest) to smallest (tightest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Relaxed = 0,
    Normal = 1,
    Low = 2,
    Minimal = 3,
}

impl LatencyMode {
    pub fn from_index(index: i64) -> Self {
        match index {
            0 => LatencyMode::Relaxed,
            2 => LatencyMode::Low,
            3 => LatencyMode::Minimal,
            _ => LatencyMode::Normal,
        }
    }

    /// Minimum ring fill, in frames, before the renderer starts emitting
    /// non-silent output.
    pub fn preroll_frames(self) -> usize {
        match self {
            LatencyMode::Relaxed => 16384,
            LatencyMode::Normal => 8192,
            LatencyMode::Low => 4096,
            LatencyMode::Minimal => 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Identifier of the driver to wrap, or `"Virtual"` for the built-in
    /// virtual backend.
    pub target_driver: String,
    /// Render endpoint identifier; empty selects the system default.
    pub endpoint_id: String,
    pub latency_mode: LatencyMode,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            target_driver: VIRTUAL_BACKEND_ID.to_string(),
            endpoint_id: String::new(),
            latency_mode: LatencyMode::Normal,
        }
    }
}

impl ShimConfig {
    /// True when the configuration selects the virtual backend.
    pub fn wants_virtual(&self) -> bool {
        self.target_driver.is_empty() || self.target_driver.eq_ignore_ascii_case(VIRTUAL_BACKEND_ID)
    }

    /// Load from the INI next to the running binary, falling back to
    /// defaults when the file is absent or unreadable.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("could not resolve module path, using default config");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("loaded config from {}", path.display());
                Self::parse(&text)
            }
            Err(err) => {
                warn!("config {} not readable ({err}), using defaults", path.display());
                Self::default()
            }
        }
    }

    fn default_path() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        Some(exe.parent()?.join(CONFIG_FILE_NAME))
    }

    /// Minimal INI scanner: `[Section]` headers, `key=value` pairs, `;` or
    /// `#` comment lines. Unknown keys and sections are ignored.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        let mut in_settings = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                in_settings = section.trim().eq_ignore_ascii_case(SETTINGS_SECTION);
                continue;
            }
            if !in_settings {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if key.eq_ignore_ascii_case("TargetDriverCLSID") {
                if !value.is_empty() {
                    config.target_driver = value.to_string();
                }
            } else if key.eq_ignore_ascii_case("TargetWasapiID") {
                config.endpoint_id = value.to_string();
            } else if key.eq_ignore_ascii_case("LatencyMode") {
                match value.parse::<i64>() {
                    Ok(mode) => config.latency_mode = LatencyMode::from_index(mode),
                    Err(_) => warn!("ignoring non-numeric LatencyMode {value:?}"),
                }
            }
        }

        config
    }
}
