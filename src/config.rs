use std::{fs::read_to_string, path::Path, str::FromStr};

use anyhow::Result;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Media {
    ///
    /// REMB floor
    ///
    /// The upstream bitrate signal is never allowed below this value,
    /// whatever the subscribers report; it keeps a briefly congested
    /// conference from talking a publisher down to nothing.
    ///
    #[serde(default = "Media::min_bitrate")]
    pub min_bitrate: u64,
    ///
    /// Bitrate assumed for an audio subscription that has not reported
    /// an estimate recently.
    ///
    #[serde(default = "Media::audio_default_bitrate")]
    pub audio_default_bitrate: u64,
    ///
    /// Bitrate assumed for a video subscription that has not reported
    /// an estimate recently.
    ///
    #[serde(default = "Media::video_default_bitrate")]
    pub video_default_bitrate: u64,
}

impl Media {
    fn min_bitrate() -> u64 {
        9600
    }

    fn audio_default_bitrate() -> u64 {
        128_000
    }

    fn video_default_bitrate() -> u64 {
        512_000
    }
}

impl Default for Media {
    fn default() -> Self {
        Self {
            min_bitrate: Self::min_bitrate(),
            audio_default_bitrate: Self::audio_default_bitrate(),
            video_default_bitrate: Self::video_default_bitrate(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
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

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
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

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub media: Media,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    ///
    /// Load the configuration from a TOML file; missing fields fall
    /// back to their defaults.
    ///
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(path)?)?)
    }
}
