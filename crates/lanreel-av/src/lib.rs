//! # lanreel-av
//!
//! External media-tool plumbing for lanreel.
//!
//! This crate provides:
//! - Source duration probing via ffprobe (with an `ffmpeg -i` stderr fallback)
//! - External tool detection (ffmpeg/ffprobe presence, versions, paths)
//! - The error taxonomy shared by everything that shells out to the engine
//!
//! All engine access is subprocess-based; there are no native bindings here.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! # async fn demo() -> lanreel_av::Result<()> {
//! let ffprobe = lanreel_av::require_tool("ffprobe")?;
//! let secs = lanreel_av::probe_duration(&ffprobe, Path::new("/media/clip.mkv")).await?;
//! println!("{secs:.1}s");
//! # Ok(())
//! # }
//! ```

mod error;
pub mod probe;
pub mod tools;

// Re-exports
pub use error::{Error, Result};
pub use probe::{ffmpeg_duration_fallback, parse_duration_line, probe_duration, PROBE_TIMEOUT};
pub use tools::{check_tool, check_tools, get_tool_path, require_tool, ToolInfo};
