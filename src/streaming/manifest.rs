//! Playlist synthesis.
//!
//! The playlist is built once, from the probed duration, before the first
//! segment exists. Listing every segment up front with an end marker is what
//! gives the player a full, stable seek bar from the very first request;
//! nothing about the playlist changes as segments are produced or the encoder
//! is restarted at a new seek point.

/// Segment file naming scheme shared by the playlist, the encoder invocation
/// and the harvest routine.
pub fn segment_name(index: u32) -> String {
    format!("seg{index:04}.ts")
}

/// Parse a segment name back to its index. Accepts only the exact
/// `seg%04d.ts` shape the playlist advertises.
pub fn parse_segment_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("seg")?.strip_suffix(".ts")?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// An immutable VOD playlist covering the full probed duration.
#[derive(Debug, Clone)]
pub struct Manifest {
    text: String,
    segment_count: u32,
    segment_secs: u32,
}

impl Manifest {
    /// Build the playlist for a source of `duration_secs` cut into
    /// `segment_secs` chunks.
    pub fn build(duration_secs: f64, segment_secs: u32) -> Self {
        let durations = segment_durations(duration_secs, segment_secs);
        let mut text = String::new();
        text.push_str("#EXTM3U\n");
        text.push_str("#EXT-X-VERSION:3\n");
        text.push_str(&format!("#EXT-X-TARGETDURATION:{segment_secs}\n"));
        text.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        text.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
        for (i, dur) in durations.iter().enumerate() {
            text.push_str(&format!("#EXTINF:{dur:.3},\n"));
            text.push_str(&segment_name(i as u32));
            text.push('\n');
        }
        text.push_str("#EXT-X-ENDLIST\n");

        Self {
            text,
            segment_count: durations.len() as u32,
            segment_secs,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    pub fn segment_secs(&self) -> u32 {
        self.segment_secs
    }
}

/// Per-segment durations: every chunk is `segment_secs` long except the last,
/// which carries the remainder (or a full chunk when evenly divisible).
pub fn segment_durations(duration_secs: f64, segment_secs: u32) -> Vec<f64> {
    let seg = f64::from(segment_secs);
    if duration_secs <= 0.0 || seg <= 0.0 {
        return Vec::new();
    }

    let count = (duration_secs / seg).ceil() as usize;
    let mut durations = vec![seg; count];
    let remainder = duration_secs - seg * (count as f64 - 1.0);
    if let Some(last) = durations.last_mut() {
        *last = remainder;
    }
    durations
}
