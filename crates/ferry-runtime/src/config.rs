//! Bridge configuration (ferry.toml)
//!
//! Chooses the guest bitness, the address translation scheme and the guest
//! arena. The translator is selected once, here, and never changes for the
//! lifetime of the bridge.

use crate::bridge::{Bridge, BridgeBuilder, BridgeError};
use ferry_abi::{
    AddressTranslator, ArenaError, Bitness, DispatchTable, FlatTranslator, GuestArena,
    TranslateError, WindowTranslator,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while loading or applying a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to set up guest arena: {0}")]
    Arena(#[from] ArenaError),

    #[error("Failed to set up translator: {0}")]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// How guest addresses map onto host addresses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TranslationMode {
    /// Same bitness, shared address space.
    Flat,
    /// 32-bit guest living in the low 4 GiB of the host.
    Wow64,
    /// Guest window backed by one host arena.
    Window,
}

impl fmt::Display for TranslationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flat => "flat",
            Self::Wow64 => "wow64",
            Self::Window => "window",
        })
    }
}

/// `[guest]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct GuestConfig {
    /// Guest pointer width: 32 or 64
    pub bits: u32,

    pub translation: TranslationMode,

    /// Bytes of guest-reachable memory
    pub arena_size: usize,

    /// Guest address of the arena (window mode only)
    pub arena_base: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            bits: 32,
            translation: TranslationMode::Window,
            arena_size: 1024 * 1024,
            arena_base: 0x1000_0000,
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// error | warn | info | debug | trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Bridge configuration (ferry.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub guest: GuestConfig,
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Parse a configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn bitness(&self) -> Result<Bitness, ConfigError> {
        Bitness::from_bits(self.guest.bits).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "guest bits must be 32 or 64, got {}",
                self.guest.bits
            ))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bits = self.bitness()?;
        let guest = &self.guest;

        if guest.arena_size == 0 {
            return Err(ConfigError::Invalid(
                "arena-size must be greater than zero".to_string(),
            ));
        }

        if log_level(&self.log.level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.log.level
            )));
        }

        match guest.translation {
            TranslationMode::Flat => {
                if bits != Bitness::B64 {
                    return Err(ConfigError::Invalid(
                        "flat translation requires a 64-bit guest".to_string(),
                    ));
                }
            }
            TranslationMode::Wow64 => {
                if bits != Bitness::B32 {
                    return Err(ConfigError::Invalid(
                        "wow64 translation requires a 32-bit guest".to_string(),
                    ));
                }
                if !cfg!(all(target_os = "linux", target_arch = "x86_64")) {
                    return Err(ConfigError::Invalid(
                        "wow64 translation needs a low-memory arena (Linux x86-64 only)"
                            .to_string(),
                    ));
                }
            }
            TranslationMode::Window => {
                let end = guest.arena_base as u128 + guest.arena_size as u128;
                if guest.arena_base == 0 || end > bits.address_limit() {
                    return Err(ConfigError::Invalid(format!(
                        "arena {:#x}+{:#x} does not fit a {} guest",
                        guest.arena_base, guest.arena_size, bits
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create the arena and select the translator for this configuration.
    pub fn select_translator(
        &self,
    ) -> Result<(Arc<dyn AddressTranslator>, Arc<GuestArena>), ConfigError> {
        self.validate()?;
        let bits = self.bitness()?;
        let size = self.guest.arena_size;

        let (translator, arena): (Arc<dyn AddressTranslator>, Arc<GuestArena>) =
            match self.guest.translation {
                TranslationMode::Flat => {
                    let arena = Arc::new(GuestArena::heap(size)?);
                    // SAFETY: guest and host share this process's address space.
                    let translator = unsafe { FlatTranslator::new() };
                    (Arc::new(translator), arena)
                }
                TranslationMode::Wow64 => wow64(size)?,
                TranslationMode::Window => {
                    let arena = Arc::new(GuestArena::windowed(size, self.guest.arena_base)?);
                    let translator = WindowTranslator::new(Arc::clone(&arena), bits)?;
                    (Arc::new(translator), arena)
                }
            };
        log::debug!(
            "selected {} translator for a {} guest ({} byte arena)",
            translator.name(),
            bits,
            arena.size()
        );
        Ok((translator, arena))
    }

    /// A bridge builder with the translator and arena already in place.
    pub fn bridge_builder(&self) -> Result<BridgeBuilder, ConfigError> {
        let (translator, arena) = self.select_translator()?;
        Ok(BridgeBuilder::default().translator(translator).arena(arena))
    }

    /// Build a bridge serving `modules` (plus the object module).
    pub fn build_bridge(
        &self,
        modules: impl IntoIterator<Item = DispatchTable>,
    ) -> Result<Bridge, ConfigError> {
        let mut builder = self.bridge_builder()?;
        for table in modules {
            builder = builder.module(table);
        }
        Ok(builder.build()?)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn wow64(size: usize) -> Result<(Arc<dyn AddressTranslator>, Arc<GuestArena>), ConfigError> {
    let arena = Arc::new(GuestArena::low_memory(size)?);
    // SAFETY: the arena is mapped with MAP_32BIT, so its host addresses are
    // valid guest addresses; the guest shares this process's address space.
    let translator = unsafe { ferry_abi::Wow64Translator::new() };
    Ok((Arc::new(translator), arena))
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn wow64(_size: usize) -> Result<(Arc<dyn AddressTranslator>, Arc<GuestArena>), ConfigError> {
    Err(ConfigError::Invalid(
        "wow64 translation needs a low-memory arena (Linux x86-64 only)".to_string(),
    ))
}

/// Parse a `[log] level` value.
pub fn log_level(level: &str) -> Option<log::LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "warn" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_abi::GuestAddr;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_str("").unwrap();
        assert_eq!(config.guest.bits, 32);
        assert_eq!(config.guest.translation, TranslationMode::Window);
        assert_eq!(config.guest.arena_size, 1 << 20);
        assert_eq!(config.guest.arena_base, 0x1000_0000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_kebab_case() {
        let config = BridgeConfig::from_str(
            r#"
            [guest]
            bits = 64
            translation = "flat"
            arena-size = 65536

            [log]
            level = "trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.guest.translation, TranslationMode::Flat);
        assert_eq!(config.guest.arena_size, 65536);
        assert_eq!(log_level(&config.log.level), Some(log::LevelFilter::Trace));
    }

    #[test]
    fn test_validation() {
        let err = BridgeConfig::from_str("[guest]\nbits = 16").unwrap_err();
        assert!(err.to_string().contains("32 or 64"));

        let err = BridgeConfig::from_str("[guest]\nbits = 32\ntranslation = \"flat\"").unwrap_err();
        assert!(err.to_string().contains("64-bit guest"));

        let err = BridgeConfig::from_str("[guest]\nbits = 64\ntranslation = \"wow64\"").unwrap_err();
        assert!(err.to_string().contains("32-bit guest"));

        let err = BridgeConfig::from_str("[guest]\narena-base = 0xffff0000\narena-size = 1048576")
            .unwrap_err();
        assert!(err.to_string().contains("does not fit"));

        let err = BridgeConfig::from_str("[log]\nlevel = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("unknown log level"));

        assert!(matches!(
            BridgeConfig::from_str("[guest]\ntranslation = \"paged\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[guest]\narena-size = 8192").unwrap();
        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.guest.arena_size, 8192);

        assert!(matches!(
            BridgeConfig::from_file(Path::new("/nonexistent/ferry.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = BridgeConfig::default();
        config.guest.arena_size = 4096;
        let text = config.to_toml().unwrap();
        assert!(text.contains("arena-size = 4096"));
        assert_eq!(BridgeConfig::from_str(&text).unwrap(), config);
    }

    #[test]
    fn test_select_window_translator() {
        let config = BridgeConfig::default();
        let (translator, arena) = config.select_translator().unwrap();
        assert_eq!(translator.name(), "window");
        assert_eq!(translator.bitness(), Bitness::B32);
        assert_eq!(
            translator.to_host(GuestAddr(0x1000_0010)).unwrap(),
            arena.host_base().offset(0x10)
        );
    }

    #[test]
    fn test_select_flat_translator() {
        let config =
            BridgeConfig::from_str("[guest]\nbits = 64\ntranslation = \"flat\"\narena-size = 4096")
                .unwrap();
        let bridge = config.build_bridge(std::iter::empty()).unwrap();
        assert_eq!(bridge.translator().name(), "flat");
        assert_eq!(bridge.memory().guest_base(), bridge.memory().host_base().raw());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_select_wow64_translator() {
        let config = BridgeConfig::from_str(
            "[guest]\nbits = 32\ntranslation = \"wow64\"\narena-size = 65536",
        )
        .unwrap();
        let bridge = config.bridge_builder().unwrap().build().unwrap();
        assert_eq!(bridge.translator().name(), "wow64");
        assert!(bridge.memory().guest_base() < 1 << 32);
    }
}
