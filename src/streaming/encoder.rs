//! Hardware encoder capability probing.
//!
//! Rather than trusting compile-time flags or driver listings, the selector
//! does what OBS does: attempt a short trial encode with each candidate
//! encoder and use the first one that actually produces output. The trial
//! input is a synthetic color clip generated by the engine itself, so no real
//! media is touched, and the trial output lands in a scratch directory that
//! is removed whatever the outcome.
//!
//! The result is resolved once per process and never re-evaluated, even if
//! hardware changes at runtime.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Deadline for one trial encode.
const TRIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Synthetic trial input: one second of black frames from the lavfi source.
const TRIAL_SOURCE: &str = "color=c=black:s=320x180:r=30:d=1";

/// An encoder argument set selected by the capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    /// Engine encoder name, e.g. `h264_nvenc`.
    pub name: &'static str,
    /// Whether this is a hardware encoder.
    pub hardware: bool,
    /// Codec selection and preset arguments.
    pub codec_args: &'static [&'static str],
    /// Quality-driven rate control, used when the tier imposes no bitrate cap.
    pub quality_args: &'static [&'static str],
}

/// Guaranteed software fallback.
pub const SOFTWARE_PROFILE: EncoderProfile = EncoderProfile {
    name: "libx264",
    hardware: false,
    codec_args: &["-c:v", "libx264", "-preset", "veryfast"],
    quality_args: &["-crf", "21"],
};

/// Hardware candidates in priority order.
pub const HARDWARE_PROFILES: &[EncoderProfile] = &[
    EncoderProfile {
        name: "h264_nvenc",
        hardware: true,
        codec_args: &["-c:v", "h264_nvenc", "-preset", "p4"],
        quality_args: &["-rc", "vbr", "-cq", "23"],
    },
    EncoderProfile {
        name: "h264_qsv",
        hardware: true,
        codec_args: &["-c:v", "h264_qsv", "-preset", "veryfast"],
        quality_args: &["-global_quality", "23"],
    },
    EncoderProfile {
        name: "h264_amf",
        hardware: true,
        codec_args: &["-c:v", "h264_amf", "-quality", "speed"],
        quality_args: &["-rc", "cqp", "-qp_i", "22", "-qp_p", "24"],
    },
    EncoderProfile {
        name: "h264_videotoolbox",
        hardware: true,
        codec_args: &["-c:v", "h264_videotoolbox"],
        quality_args: &["-q:v", "55"],
    },
];

/// Process-scoped encoder selection handle.
///
/// Held by the session manager and passed to sessions; the underlying
/// `OnceCell` makes initialization single-flight, so concurrent first callers
/// share one probe run and everyone afterwards reads without locking.
pub struct EncoderSelector {
    ffmpeg: Option<PathBuf>,
    candidates: &'static [EncoderProfile],
    selected: OnceCell<EncoderProfile>,
}

impl EncoderSelector {
    /// Selector that probes through the standard hardware candidates using
    /// the given engine binary.
    pub fn new(ffmpeg: Option<PathBuf>) -> Self {
        Self {
            ffmpeg,
            candidates: HARDWARE_PROFILES,
            selected: OnceCell::new(),
        }
    }

    /// Selector pre-resolved to a fixed profile; no trial encodes will run.
    pub fn fixed(profile: EncoderProfile) -> Self {
        Self {
            ffmpeg: None,
            candidates: &[],
            selected: OnceCell::new_with(Some(profile)),
        }
    }

    /// Resolve the encoder profile, probing on first call.
    pub async fn select(&self) -> &EncoderProfile {
        self.selected.get_or_init(|| self.probe()).await
    }

    async fn probe(&self) -> EncoderProfile {
        let Some(ffmpeg) = self.ffmpeg.as_deref() else {
            tracing::warn!("no engine binary available, using software encoder profile");
            return SOFTWARE_PROFILE;
        };

        for candidate in self.candidates {
            match trial_encode(ffmpeg, candidate).await {
                Ok(()) => {
                    tracing::info!(encoder = candidate.name, "hardware encoder selected");
                    return candidate.clone();
                }
                Err(diagnostic) => {
                    tracing::debug!(encoder = candidate.name, %diagnostic, "trial encode failed");
                }
            }
        }

        tracing::info!("no hardware encoder usable, falling back to libx264");
        SOFTWARE_PROFILE
    }
}

/// Run one trial encode; `Ok` means the process exited zero and wrote a
/// non-empty output file.
async fn trial_encode(ffmpeg: &Path, profile: &EncoderProfile) -> Result<(), String> {
    let scratch = tempfile::tempdir().map_err(|e| e.to_string())?;
    let out_path = scratch.path().join("trial.ts");

    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-nostdin", "-hide_banner", "-loglevel", "error"])
        .args(["-f", "lavfi", "-i", TRIAL_SOURCE])
        .args(profile.codec_args)
        .args(["-f", "mpegts"])
        .arg(&out_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(TRIAL_TIMEOUT, cmd.output())
        .await
        .map_err(|_| format!("timed out after {}s", TRIAL_TIMEOUT.as_secs()))?
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let line = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output");
        return Err(line.to_string());
    }

    match std::fs::metadata(&out_path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err("trial produced no output".to_string()),
    }
    // scratch dropped here, removing the trial output regardless of outcome
}
