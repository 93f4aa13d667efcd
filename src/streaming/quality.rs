//! Quality tiers and their encoding presets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named preset of resolution/bitrate/segment-duration trade-offs.
///
/// `Auto` is the unconstrained, original-resolution profile; it encodes with
/// the same parameters as `High` but is tracked as its own tier so a client
/// that never picked a quality is keyed separately from one that asked for
/// High explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Auto,
    Low,
    Medium,
    High,
}

impl QualityTier {
    /// Parse a client-supplied tier name. Unknown or missing values map to
    /// `Auto` rather than failing the request.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" | "med" => Self::Medium,
            "high" => Self::High,
            _ => Self::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Encoding parameters for this tier.
    pub fn params(&self) -> TierParams {
        match self {
            // Tight vbv buffer keeps instantaneous bandwidth smooth on weak
            // wifi at the cost of local quality variance; short segments cut
            // time-to-first-byte.
            Self::Low => TierParams {
                max_height: Some(480),
                video_bitrate: Some("1200k"),
                buffer_size: Some("1800k"),
                audio_bitrate: "96k",
                segment_secs: 4,
            },
            Self::Medium => TierParams {
                max_height: Some(720),
                video_bitrate: Some("2500k"),
                buffer_size: Some("3750k"),
                audio_bitrate: "128k",
                segment_secs: 6,
            },
            // Unconstrained: quality-driven encode, longer segments for fewer
            // restarts and better compression efficiency.
            Self::Auto | Self::High => TierParams {
                max_height: None,
                video_bitrate: None,
                buffer_size: None,
                audio_bitrate: "192k",
                segment_secs: 10,
            },
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete encoding parameters derived from a [`QualityTier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierParams {
    /// Output resolution ceiling (height); `None` keeps the source size.
    pub max_height: Option<u32>,
    /// Video bitrate target and cap; `None` means quality-driven.
    pub video_bitrate: Option<&'static str>,
    /// Rate-control buffer size, set together with the bitrate cap.
    pub buffer_size: Option<&'static str>,
    /// AAC audio bitrate.
    pub audio_bitrate: &'static str,
    /// Segment duration in whole seconds.
    pub segment_secs: u32,
}

impl TierParams {
    /// The `-vf` scale expression: cap height when constrained, otherwise
    /// just normalize both dimensions to even values (encoders reject odd
    /// frame sizes).
    pub fn scale_filter(&self) -> String {
        match self.max_height {
            Some(h) => format!("scale=-2:'min({h},ih)'"),
            None => "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
        }
    }
}
