//! Embedded preview extraction for RAW camera containers.
//!
//! RAW files from most cameras carry one or more full JPEG renditions of the
//! shot alongside the undecoded sensor payload. This module recovers the
//! largest displayable one by scanning the container bytes for JPEG stream
//! markers; it never shells out to a transcoder and never parses the
//! container's structural metadata (TIFF/IFD tables).
//!
//! The catch is that the sensor payload itself is usually stored as a
//! lossless JPEG stream, which generic viewers cannot decode. Candidates are
//! therefore classified by their SOF frame-type marker before one is chosen.

use bytes::Bytes;
use std::path::Path;

/// JPEG stream start marker (SOI followed by the first marker byte).
const START_MARKER: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// JPEG end-of-image marker.
const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// A new start marker closer than this to the current one is assumed to be a
/// false positive in dense binary data rather than a new stream.
const MIN_GAP: usize = 4 * 1024;

/// Candidates shorter than this are decoder thumbnails or icons, not previews.
const MIN_LEN: usize = 16 * 1024;

/// How far into a candidate to look for its SOF frame-type marker.
/// Displayable images advertise their frame type within the first few
/// hundred bytes; anything without one in this window is not displayable.
const HEADER_SCAN: usize = 2 * 1024;

/// How a candidate stream's frame-type marker classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameClass {
    /// Baseline, extended sequential, or progressive DCT. Any image viewer
    /// can show these.
    Displayable,
    /// Lossless or differential encoding. This is the raw sensor payload.
    Sensor,
    /// No frame-type marker found in the header region.
    Unknown,
}

/// Extract the largest displayable embedded image from a RAW container.
///
/// Returns `None` when the buffer holds no displayable JPEG stream, including
/// for truncated or garbage input. Never panics.
pub fn extract_preview(data: &[u8]) -> Option<Bytes> {
    let starts = find_start_markers(data);
    if starts.is_empty() {
        return None;
    }

    let mut candidates: Vec<&[u8]> = starts
        .iter()
        .enumerate()
        .filter_map(|(i, &start)| delimit_stream(data, &starts, i, start))
        .filter(|s| s.len() >= MIN_LEN)
        .collect();

    // Largest first; the preview is essentially always the biggest stream
    // that survives classification.
    candidates.sort_by_key(|s| std::cmp::Reverse(s.len()));

    candidates
        .into_iter()
        .find(|s| classify(s) == FrameClass::Displayable)
        .map(Bytes::copy_from_slice)
}

/// Read a file fully and extract its embedded preview.
///
/// I/O failures are folded into `None`; the caller treats every failure mode
/// as "no preview available" and falls back to a general-purpose decode.
pub fn extract_preview_from_file(path: &Path) -> Option<Bytes> {
    let data = std::fs::read(path).ok()?;
    extract_preview(&data)
}

fn find_start_markers(data: &[u8]) -> Vec<usize> {
    if data.len() < START_MARKER.len() {
        return Vec::new();
    }
    (0..=data.len() - START_MARKER.len())
        .filter(|&i| data[i..i + START_MARKER.len()] == START_MARKER)
        .collect()
}

/// Determine the extent of the stream beginning at `starts[index]`.
///
/// A stream is terminated by its own end marker, or heuristically by the next
/// start marker more than [`MIN_GAP`] past its start. A stream with neither
/// terminator runs off the end of the buffer and is discarded as truncated.
fn delimit_stream<'a>(
    data: &'a [u8],
    starts: &[usize],
    index: usize,
    start: usize,
) -> Option<&'a [u8]> {
    let next_start = starts[index + 1..]
        .iter()
        .copied()
        .find(|&p| p > start + MIN_GAP);
    let limit = next_start.unwrap_or(data.len());

    let search = &data[start + START_MARKER.len()..limit];
    let end = search
        .windows(END_MARKER.len())
        .position(|w| w == END_MARKER)
        .map(|p| start + START_MARKER.len() + p + END_MARKER.len());

    match (end, next_start) {
        (Some(end), _) => Some(&data[start..end]),
        (None, Some(next)) => Some(&data[start..next]),
        (None, None) => None,
    }
}

fn classify(stream: &[u8]) -> FrameClass {
    let window = &stream[..stream.len().min(HEADER_SCAN)];
    let mut i = 0;
    while i + 1 < window.len() {
        if window[i] == 0xFF {
            match window[i + 1] {
                // SOF0 / SOF1 / SOF2
                0xC0 | 0xC1 | 0xC2 => return FrameClass::Displayable,
                // SOF3, SOF5-7 (differential), SOF9-11 (arithmetic),
                // SOF13-15 (differential arithmetic): sensor payloads or
                // otherwise undecodable by a generic viewer.
                0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => return FrameClass::Sensor,
                _ => {}
            }
        }
        i += 1;
    }
    FrameClass::Unknown
}
