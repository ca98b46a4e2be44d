use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

use crate::error::AppError;
use crate::streaming::{FfmpegSettings, PreviewProfile};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    /// In-process buffer for bus messages awaiting dispatch
    pub event_bus_buffer: usize,
    /// Destination base for channels without their own `rtmpUrl`
    pub restreamer_url: String,
    pub renderer_url: String,
    pub ffmpeg_path: String,
    pub preview: PreviewProfile,
    /// Chunks buffered per preview session before lagging consumers drop
    pub preview_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            get("DATABASE_URL").ok_or_else(|| AppError::Config("DATABASE_URL missing".into()))?;
        let string_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: string_or("HOST", "0.0.0.0"),
            port: parse_or(&get, "PORT", 3000)?,
            database_url,
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: string_or("REDIS_URL", "redis://127.0.0.1:6379"),
            event_bus_buffer: parse_or(&get, "EVENT_BUS_BUFFER", 1024)?,
            restreamer_url: string_or("RESTREAMER_URL", "rtmp://localhost/live"),
            renderer_url: string_or("RENDERER_URL", "http://localhost:5000"),
            ffmpeg_path: string_or("FFMPEG_PATH", "ffmpeg"),
            preview: PreviewProfile {
                width: parse_or(&get, "PREVIEW_WIDTH", 640)?,
                fps: parse_or(&get, "PREVIEW_FPS", 15)?,
                quality: parse_or(&get, "PREVIEW_QUALITY", 5)?,
            },
            preview_buffer: parse_or(&get, "PREVIEW_BUFFER", 64)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            renderer_url: self.renderer_url.clone(),
            preview: self.preview.clone(),
        }
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}
