//! Source duration probing.
//!
//! The streaming engine only needs one fact about a source file before it can
//! build a playlist: the total duration in seconds. ffprobe reports it as a
//! decimal string in its JSON `format` block; when ffprobe is not installed we
//! fall back to scraping the `Duration: HH:MM:SS.ss` line that `ffmpeg -i`
//! prints on stderr.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

/// Deadline for a single probe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probe a media file's duration in seconds using ffprobe.
pub async fn probe_duration(ffprobe: &Path, media: &Path) -> Result<f64> {
    if !media.exists() {
        return Err(Error::file_not_found(media));
    }

    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(media)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| Error::timeout("ffprobe", PROBE_TIMEOUT.as_secs()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::tool_not_found("ffprobe")
            } else {
                Error::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::tool_failed("ffprobe", stderr.trim().to_string()));
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
    parsed
        .format
        .duration
        .as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| Error::parse_error("ffprobe", "no usable duration in format block"))
}

/// Probe duration by parsing the `Duration:` line from `ffmpeg -i` stderr.
///
/// `ffmpeg -i` without an output always exits non-zero, so only the stderr
/// content matters here.
pub async fn ffmpeg_duration_fallback(ffmpeg: &Path, media: &Path) -> Result<f64> {
    if !media.exists() {
        return Err(Error::file_not_found(media));
    }

    let output = Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-i")
        .arg(media)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| Error::timeout("ffmpeg", PROBE_TIMEOUT.as_secs()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::tool_not_found("ffmpeg")
            } else {
                Error::Io(e)
            }
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let duration = parse_duration_line(&stderr)
        .ok_or_else(|| Error::parse_error("ffmpeg", "no Duration line in stderr"))?;
    tracing::debug!(media = %media.display(), duration, "probed duration via ffmpeg stderr");
    Ok(duration)
}

/// Extract a duration in seconds from ffmpeg's `Duration: HH:MM:SS.ss` banner.
pub fn parse_duration_line(stderr: &str) -> Option<f64> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"Duration: (\d{2,}):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap()
    });

    let caps = re.captures(stderr)?;
    let h: f64 = caps[1].parse().ok()?;
    let m: f64 = caps[2].parse().ok()?;
    let s: f64 = caps[3].parse().ok()?;
    let total = h * 3600.0 + m * 60.0 + s;
    (total > 0.0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_line() {
        let stderr = "Input #0, matroska,webm, from 'x.mkv':\n  Duration: 01:02:03.50, start: 0.000000, bitrate: 1000 kb/s";
        assert_eq!(parse_duration_line(stderr), Some(3723.5));
    }

    #[test]
    fn test_parse_duration_line_whole_seconds() {
        assert_eq!(parse_duration_line("Duration: 00:00:42, start"), Some(42.0));
    }

    #[test]
    fn test_parse_duration_line_garbage() {
        assert_eq!(parse_duration_line("no duration here"), None);
        assert_eq!(parse_duration_line("Duration: N/A"), None);
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_duration_via_fake_ffprobe() {
        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(
            dir.path(),
            "ffprobe",
            r#"echo '{"format":{"duration":"120.500000"}}'"#,
        );
        let media = dir.path().join("clip.mkv");
        std::fs::write(&media, b"not really video").unwrap();

        let duration = probe_duration(&ffprobe, &media).await.unwrap();
        assert!((duration - 120.5).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_duration_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(dir.path(), "ffprobe", "echo '{}'");

        let err = probe_duration(&ffprobe, dir.path().join("missing.mkv").as_path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_duration_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(dir.path(), "ffprobe", "echo 'boom' >&2; exit 1");
        let media = dir.path().join("clip.mkv");
        std::fs::write(&media, b"x").unwrap();

        let err = probe_duration(&ffprobe, &media).await.unwrap_err();
        match err {
            Error::ToolFailed { tool, message } => {
                assert_eq!(tool, "ffprobe");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_duration_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(
            dir.path(),
            "ffmpeg",
            "echo '  Duration: 00:10:00.00, start: 0.0' >&2; exit 1",
        );
        let media = dir.path().join("clip.avi");
        std::fs::write(&media, b"x").unwrap();

        let duration = ffmpeg_duration_fallback(&ffmpeg, &media).await.unwrap();
        assert!((duration - 600.0).abs() < f64::EPSILON);
    }
}
