//! # Settings
//!
//! Startup configuration: a toml file, every knob overridable from the
//! environment (`ATRIUM_*`). Loaded once; the world never re-reads config
//! at runtime.

use serde::{Deserialize, Serialize};

use atrium_shared::constants;

/// World runtime configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// World identifier.
    pub world: String,
    /// Bind address for the server socket.
    pub bind: String,
    /// Fixed physics step rate (Hz).
    pub tick_rate: u32,
    /// Player pose broadcast rate (Hz).
    pub network_rate: f32,
    /// Persistence flush period (seconds).
    pub save_interval: f32,
    /// Keepalive ping period (seconds).
    pub ping_rate: f32,
    /// `/admin` grant secret; unset disables the command.
    pub admin_code: Option<String>,
    /// Upload cap in megabytes.
    pub max_upload_size_mb: u64,
    /// Show the local player's own nametag.
    ///
    /// The reference behavior here was ambiguous, so it is configuration
    /// rather than a hard-coded choice.
    pub show_local_nametag: bool,
    /// Show nametags above remote players.
    pub show_remote_nametags: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            world: constants::WORLD_ID.to_owned(),
            bind: constants::SERVER_BIND.to_owned(),
            tick_rate: constants::TICK_RATE,
            network_rate: constants::NETWORK_RATE,
            save_interval: constants::SAVE_INTERVAL_SECS,
            ping_rate: constants::PING_RATE,
            admin_code: None,
            max_upload_size_mb: constants::PUBLIC_MAX_UPLOAD_SIZE_MB,
            show_local_nametag: false,
            show_remote_nametags: true,
        }
    }
}

impl Settings {
    /// Parses a toml document, then applies environment overrides.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        let mut settings: Self = toml::from_str(doc)?;
        settings.apply_env();
        Ok(settings)
    }

    /// Loads defaults, then applies environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ATRIUM_WORLD") {
            self.world = v;
        }
        if let Ok(v) = std::env::var("ATRIUM_BIND") {
            self.bind = v;
        }
        if let Ok(v) = std::env::var("ATRIUM_TICK_RATE") {
            if let Ok(n) = v.parse() {
                self.tick_rate = n;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_NETWORK_RATE") {
            if let Ok(n) = v.parse() {
                self.network_rate = n;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_SAVE_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.save_interval = n;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_PING_RATE") {
            if let Ok(n) = v.parse() {
                self.ping_rate = n;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_ADMIN_CODE") {
            self.admin_code = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("ATRIUM_PUBLIC_MAX_UPLOAD_SIZE") {
            if let Ok(n) = v.parse() {
                self.max_upload_size_mb = n;
            }
        }
    }

    /// Upload cap in bytes.
    #[must_use]
    pub const fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let s = Settings::default();
        assert_eq!(s.tick_rate, 50);
        assert!((s.network_rate - 8.0).abs() < f32::EPSILON);
        assert!((s.save_interval - 60.0).abs() < f32::EPSILON);
        assert_eq!(s.max_upload_size_mb, 100);
        assert!(s.admin_code.is_none());
        assert!(!s.show_local_nametag);
        assert!(s.show_remote_nametags);
    }

    #[test]
    fn test_toml_overrides() {
        let s = Settings::from_toml(
            r#"
world = "plaza"
tick_rate = 30
admin_code = "sesame"
"#,
        )
        .unwrap();
        assert_eq!(s.world, "plaza");
        assert_eq!(s.tick_rate, 30);
        assert_eq!(s.admin_code.as_deref(), Some("sesame"));
        // Untouched knobs keep their defaults.
        assert_eq!(s.max_upload_size_mb, 100);
    }

    #[test]
    fn test_upload_cap_in_bytes() {
        let mut s = Settings::default();
        s.max_upload_size_mb = 2;
        assert_eq!(s.max_upload_bytes(), 2 * 1024 * 1024);
    }
}
