//! ffmpeg command lines and progress parsing

use crate::models::{ProgressMetrics, ScenarioId};

use super::process::CommandSpec;

/// Downscaled preview encoding parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewProfile {
    pub width: u32,
    pub fps: u32,
    /// mjpeg `-q:v`, lower is better
    pub quality: u32,
}

impl Default for PreviewProfile {
    fn default() -> Self {
        Self {
            width: 640,
            fps: 15,
            quality: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: String,
    pub renderer_url: String,
    pub preview: PreviewProfile,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            renderer_url: "http://localhost:5000".to_string(),
            preview: PreviewProfile::default(),
        }
    }
}

impl FfmpegSettings {
    /// Renderer endpoint for a scenario: `<renderer>/render/<scenarioId>`
    pub fn source_url(&self, scenario_id: &ScenarioId) -> String {
        format!(
            "{}/render/{}",
            self.renderer_url.trim_end_matches('/'),
            scenario_id
        )
    }

    /// Long-running encode of the rendered scenario to the push destination
    pub fn encoder_command(&self, source_url: &str, destination_url: &str) -> CommandSpec {
        let args = [
            "-hide_banner",
            "-nostdin",
            "-f",
            "mjpeg",
            "-i",
            source_url,
            "-c:v",
            "libx264",
            "-c:a",
            "aac",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-f",
            "flv",
            destination_url,
        ];
        CommandSpec::new(&self.ffmpeg_path, args.iter().map(|s| s.to_string()))
    }

    /// Bandwidth-reduced mjpeg re-encode written to stdout
    pub fn preview_command(&self, source_url: &str) -> CommandSpec {
        let profile = &self.preview;
        let args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-f".to_string(),
            "mjpeg".to_string(),
            "-i".to_string(),
            source_url.to_string(),
            "-vf".to_string(),
            format!("scale={}:-1", profile.width),
            "-r".to_string(),
            profile.fps.to_string(),
            "-q:v".to_string(),
            profile.quality.to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "pipe:1".to_string(),
        ];
        CommandSpec::new(&self.ffmpeg_path, args).capture_stdout()
    }
}

/// Parse one ffmpeg stats line
///
/// Accepts the periodic `frame= ... time= ... bitrate= ...` lines as well as
/// the final `Lsize=` summary. Returns `None` for anything else.
pub fn parse_progress_line(line: &str) -> Option<ProgressMetrics> {
    let line = line.trim();
    if !line.starts_with("frame=") && !line.starts_with("size=") {
        return None;
    }

    let mut metrics = ProgressMetrics::default();
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        // ffmpeg pads values: `frame=  120`
        let value = if value.is_empty() {
            tokens.next().unwrap_or_default()
        } else {
            value
        };

        match key {
            "frame" => metrics.frames = value.parse().ok(),
            "fps" => metrics.fps = value.parse().ok(),
            "size" | "Lsize" => {
                metrics.target_size = value
                    .trim_end_matches("kB")
                    .trim_end_matches("KiB")
                    .parse()
                    .ok()
            }
            "time" => {
                metrics.timemark = (value != "N/A").then(|| value.to_string());
            }
            "bitrate" => metrics.kbps = value.trim_end_matches("kbits/s").parse().ok(),
            _ => {}
        }
    }

    if metrics.frames.is_none() && metrics.timemark.is_none() {
        return None;
    }
    Some(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_periodic_stats_line() {
        let line =
            "frame=  120 fps= 30 q=28.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1x";
        let metrics = parse_progress_line(line).unwrap();
        assert_eq!(metrics.frames, Some(120));
        assert_eq!(metrics.fps, Some(30.0));
        assert_eq!(metrics.target_size, Some(1024));
        assert_eq!(metrics.timemark.as_deref(), Some("00:00:04.00"));
        assert_eq!(metrics.kbps, Some(2097.2));
    }

    #[test]
    fn test_parses_final_summary_with_kib() {
        let line = "frame=  300 fps=29.9 q=-1.0 Lsize=    2048KiB time=00:00:10.00 bitrate=1677.7kbits/s speed=0.99x";
        let metrics = parse_progress_line(line).unwrap();
        assert_eq!(metrics.frames, Some(300));
        assert_eq!(metrics.target_size, Some(2048));
    }

    #[test]
    fn test_unavailable_values_are_absent() {
        let line = "frame=    0 fps=0.0 q=0.0 size=       0kB time=N/A bitrate=N/A speed=N/A";
        let metrics = parse_progress_line(line).unwrap();
        assert_eq!(metrics.frames, Some(0));
        assert_eq!(metrics.timemark, None);
        assert_eq!(metrics.kbps, None);
    }

    #[test]
    fn test_ignores_log_lines() {
        assert!(parse_progress_line("Input #0, mjpeg, from 'http://r/render/s1':").is_none());
        assert!(parse_progress_line("[flv @ 0x55] Failed to connect").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn test_encoder_command_layout() {
        let settings = FfmpegSettings::default();
        let source = settings.source_url(&ScenarioId::new("s1"));
        assert_eq!(source, "http://localhost:5000/render/s1");

        let spec = settings.encoder_command(&source, "rtmp://localhost/live/key");
        assert_eq!(spec.program, "ffmpeg");
        assert!(!spec.capture_stdout);
        let line = spec.command_line();
        assert!(line.contains("-f mjpeg -i http://localhost:5000/render/s1"));
        assert!(line.contains("-preset veryfast -tune zerolatency"));
        assert!(line.ends_with("-f flv rtmp://localhost/live/key"));
    }

    #[test]
    fn test_preview_command_uses_profile() {
        let settings = FfmpegSettings {
            preview: PreviewProfile {
                width: 320,
                fps: 10,
                quality: 7,
            },
            ..FfmpegSettings::default()
        };
        let spec = settings.preview_command("http://r/render/s1");
        assert!(spec.capture_stdout);
        let line = spec.command_line();
        assert!(line.contains("-vf scale=320:-1 -r 10 -q:v 7"));
        assert!(line.ends_with("-f image2pipe -vcodec mjpeg pipe:1"));
    }
}
