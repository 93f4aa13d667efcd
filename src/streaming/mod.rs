//! Adaptive transcoding and streaming engine.
//!
//! Turns a single non-browser-friendly video file into a seekable segment
//! stream by driving an external encoder process on demand:
//!
//! - [`quality`] — tier presets (resolution/bitrate/segment-duration)
//! - [`manifest`] — playlist synthesis from the probed duration
//! - [`encoder`] — hardware encoder capability probing
//! - [`session`] — the per-file transcode state machine
//! - [`manager`] — the process-wide registry (single active transcode)

pub mod encoder;
pub mod manager;
pub mod manifest;
pub mod quality;
pub mod session;

pub use encoder::{EncoderProfile, EncoderSelector};
pub use manager::{start_reaper, SessionManager};
pub use manifest::Manifest;
pub use quality::QualityTier;
pub use session::{EngineTools, SegmentFetch, SessionKey, TranscodeSession, WaitPolicy};

/// Container extensions the playback client cannot play natively and which
/// therefore go through the transcoding engine. Browser-native containers
/// (mp4/m4v/webm) are served as plain files with byte ranges instead.
pub fn needs_adaptive_streaming(extension: &str) -> bool {
    matches!(
        extension.trim_start_matches('.').to_ascii_lowercase().as_str(),
        "mkv" | "avi" | "wmv" | "flv" | "ogv" | "mpg" | "mpeg" | "vob" | "mts" | "m2ts" | "3gp"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_native_containers_need_transcoding() {
        for ext in ["mkv", "avi", "wmv", "flv", "ogv"] {
            assert!(needs_adaptive_streaming(ext), "{ext} should transcode");
        }
    }

    #[test]
    fn test_native_containers_do_not() {
        for ext in ["mp4", "m4v", "webm"] {
            assert!(!needs_adaptive_streaming(ext), "{ext} is browser-native");
        }
    }

    #[test]
    fn test_predicate_ignores_case_and_dots() {
        assert!(needs_adaptive_streaming(".MKV"));
        assert!(needs_adaptive_streaming("Avi"));
        assert!(!needs_adaptive_streaming(".MP4"));
    }
}
