//! Fake engine binaries for exercising sessions without a real transcoder.
//!
//! Each fake is a small shell script: ffprobe prints a canned JSON duration,
//! ffmpeg parses the `-start_number` / `-hls_segment_filename` arguments it
//! was given, writes segment files accordingly, and then completes, hangs or
//! fails depending on the behavior under test. Every ffmpeg invocation is
//! appended to a log so tests can assert how often and with which seek the
//! engine was (re)launched.
#![cfg(unix)]
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

pub struct FakeEngine {
    pub dir: tempfile::TempDir,
}

/// What the fake transcoder does after writing its segments.
#[derive(Debug, Clone, Copy)]
pub enum EngineBehavior {
    /// Write `segments` files and exit cleanly.
    Complete { segments: u32 },
    /// Write `segments` files, then keep running until killed.
    Hang { segments: u32 },
    /// Write one segment, print a diagnostic, exit non-zero.
    Fail { diagnostic: &'static str },
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    fn write_script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    /// A probe tool that reports the given duration for any input.
    pub fn ffprobe(&self, duration_secs: f64) -> PathBuf {
        self.write_script(
            "ffprobe",
            &format!(r#"echo '{{"format":{{"duration":"{duration_secs}"}}}}'"#),
        )
    }

    /// A probe tool that always fails.
    pub fn ffprobe_failing(&self) -> PathBuf {
        self.write_script("ffprobe", "echo 'probe exploded' >&2; exit 1")
    }

    /// The fake transcoder. See [`EngineBehavior`].
    pub fn ffmpeg(&self, behavior: EngineBehavior) -> PathBuf {
        let log = self.spawn_log();
        let pids = self.pid_file();

        let (segments, tail) = match behavior {
            EngineBehavior::Complete { segments } => (segments, "exit 0".to_string()),
            EngineBehavior::Hang { segments } => (segments, "exec sleep 300".to_string()),
            EngineBehavior::Fail { diagnostic } => {
                (1, format!("echo '{diagnostic}' >&2\nexit 1"))
            }
        };

        let body = format!(
            r#"echo "$@" >> "{log}"
echo $$ >> "{pids}"
start=0
segpattern=""
prev=""
for a in "$@"; do
  [ "$prev" = "-start_number" ] && start=$a
  [ "$prev" = "-hls_segment_filename" ] && segpattern=$a
  prev=$a
done
if [ -z "$segpattern" ]; then
  echo 'Duration: N/A' >&2
  exit 1
fi
dir=$(dirname "$segpattern")
i=$start
end=$((start + {segments} - 1))
while [ "$i" -le "$end" ]; do
  printf 'segment-%04d-data' "$i" > "$(printf '%s/seg%04d.ts' "$dir" "$i")"
  i=$((i + 1))
done
{tail}"#,
            log = log.display(),
            pids = pids.display(),
        );

        self.write_script("ffmpeg", &body)
    }

    /// A media file for sessions to point at.
    pub fn media_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"not really a video").expect("write media");
        path
    }

    pub fn spawn_log(&self) -> PathBuf {
        self.dir.path().join("spawns.log")
    }

    /// One line per transcoder invocation, full argument list.
    pub fn spawn_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.spawn_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("pids.log")
    }

    /// PIDs of every transcoder the sessions launched, in launch order.
    pub fn spawned_pids(&self) -> Vec<u32> {
        std::fs::read_to_string(self.pid_file())
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }
}

/// Whether a process is still running (`kill -0`).
pub fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Expected content of a fake segment with the given index.
pub fn segment_content(index: u32) -> Vec<u8> {
    format!("segment-{index:04}-data").into_bytes()
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    check()
}

/// Guard against fakes accidentally writing segments into the crate dir.
pub fn assert_no_stray_segments(dir: &Path) {
    assert!(!dir.join("seg0000.ts").exists());
}
