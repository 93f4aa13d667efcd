//! The transcode session state machine.
//!
//! One session owns one source file's conversion into a seekable segment
//! stream: it probes the duration, publishes the full playlist immediately,
//! drives the external encoder process, and hands produced segments to
//! readers with bounded waiting. Seeks far beyond the production frontier
//! restart the encoder at the requested position instead of transcoding
//! everything in between, which is what makes seeking feel instant.
//!
//! Process ownership: exactly one observer task owns the child handle and
//! performs the `wait()`; restarts and disposal only signal it through a
//! cancellation token and then join it, so the process handle is never
//! touched from two places at once.

use crate::streaming::encoder::EncoderSelector;
use crate::streaming::manifest::{parse_segment_name, Manifest};
use crate::streaming::quality::{QualityTier, TierParams};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Name of the throwaway playlist the encoder maintains in the work dir.
/// Readers never see it; the served playlist is synthesized up front.
const LIVE_PLAYLIST: &str = "live.m3u8";

/// Identifies a session: normalized relative path plus quality tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    path: String,
    tier: QualityTier,
}

impl SessionKey {
    /// Normalize the client-relative path (separators, case) and pair it
    /// with the tier.
    pub fn new(relative_path: &str, tier: QualityTier) -> Self {
        Self {
            path: relative_path.replace('\\', "/").to_lowercase(),
            tier,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    /// The externally visible session identifier: a readable slug from the
    /// file stem, the tier, and a hash of the full normalized key so deep
    /// paths stay unique without leaking into URLs.
    pub fn id(&self) -> String {
        let file = self.path.rsplit('/').next().unwrap_or(&self.path);
        let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
        let slug: String = stem
            .chars()
            .take(40)
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{slug}-{}-{:08x}", self.tier, self.hash())
    }

    fn hash(&self) -> u32 {
        // FNV-1a over path and tier.
        let mut h: u32 = 0x811c_9dc5;
        for b in self.path.bytes().chain(self.tier.as_str().bytes()) {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
        h
    }
}

/// Resolved engine binaries. Either may be absent; sessions degrade to the
/// error states the caller can observe instead of failing construction.
#[derive(Debug, Clone, Default)]
pub struct EngineTools {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

/// Reader-side wait tuning.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// How far past the production frontier a request may point before it
    /// forces a restart at the requested index.
    pub lookahead_segments: u32,
    /// Aggregate ceiling on one segment wait.
    pub segment_wait: Duration,
    /// Sleep between cache/disk re-checks while waiting.
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            lookahead_segments: 5,
            segment_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of a segment fetch.
#[derive(Debug, Clone)]
pub enum SegmentFetch {
    /// The segment bytes, from cache.
    Data(Bytes),
    /// The caller's cancellation signal fired while waiting.
    Cancelled,
    /// Timed out, past end of stream, or the session cannot produce it.
    Missing,
}

#[derive(Default)]
struct ProcState {
    kill: Option<CancellationToken>,
    observer: Option<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

/// One source file's adaptive-streaming session.
pub struct TranscodeSession {
    key: SessionKey,
    source: PathBuf,
    params: TierParams,
    tools: EngineTools,
    encoder: Arc<EncoderSelector>,
    policy: WaitPolicy,
    work_dir: tempfile::TempDir,
    manifest: Option<Manifest>,
    duration_secs: Option<f64>,
    segments: DashMap<u32, Bytes>,
    highest_produced: AtomicU32,
    producing: AtomicBool,
    complete: AtomicBool,
    error: parking_lot::Mutex<Option<String>>,
    last_access: parking_lot::Mutex<Instant>,
    started_at: DateTime<Utc>,
    proc: Mutex<ProcState>,
}

impl TranscodeSession {
    /// Create a session: probe the source, synthesize the playlist, and (when
    /// the duration is known) launch the encoder at segment 0.
    ///
    /// A failed probe still yields a session; its playlist stays unavailable
    /// and the error field carries the probe diagnostic.
    pub async fn create(
        key: SessionKey,
        source: PathBuf,
        tools: EngineTools,
        encoder: Arc<EncoderSelector>,
        policy: WaitPolicy,
    ) -> anyhow::Result<Arc<Self>> {
        let work_dir = tempfile::Builder::new().prefix("lanreel-seg-").tempdir()?;
        let params = key.tier().params();

        let (duration_secs, probe_error) = match probe_source_duration(&tools, &source).await {
            Ok(d) => (Some(d), None),
            Err(e) => {
                tracing::warn!(source = %source.display(), error = %e, "duration probe failed");
                (None, Some(format!("duration probe failed: {e}")))
            }
        };

        let manifest = duration_secs.map(|d| Manifest::build(d, params.segment_secs));

        let session = Arc::new(Self {
            key,
            source,
            params,
            tools,
            encoder,
            policy,
            work_dir,
            manifest,
            duration_secs,
            segments: DashMap::new(),
            highest_produced: AtomicU32::new(0),
            producing: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            error: parking_lot::Mutex::new(probe_error),
            last_access: parking_lot::Mutex::new(Instant::now()),
            started_at: Utc::now(),
            proc: Mutex::new(ProcState::default()),
        });

        if session.manifest.is_some() {
            let mut proc = session.proc.lock().await;
            session.spawn_run(0, &mut proc).await;
        }

        tracing::info!(
            session = %session.key.id(),
            tier = %session.key.tier(),
            duration = ?session.duration_secs,
            "session created"
        );

        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> String {
        self.key.id()
    }

    /// The served playlist, or `None` while/because the probe failed.
    pub fn manifest(&self) -> Option<String> {
        self.touch();
        self.manifest.as_ref().map(|m| m.text().to_string())
    }

    pub fn is_ready(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_secs
    }

    pub fn segments_cached(&self) -> usize {
        self.segments.len()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since a reader last asked this session for anything.
    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn cached(&self, index: u32) -> Option<Bytes> {
        self.segments.get(&index).map(|s| s.value().clone())
    }

    /// Fetch one segment, waiting (bounded) for it to be produced.
    pub async fn segment(self: &Arc<Self>, index: u32, cancel: &CancellationToken) -> SegmentFetch {
        self.touch();

        let Some(manifest) = &self.manifest else {
            return SegmentFetch::Missing;
        };
        if index >= manifest.segment_count() {
            return SegmentFetch::Missing;
        }

        if let Some(data) = self.cached(index) {
            return SegmentFetch::Data(data);
        }

        // A request far beyond the frontier jumps the encoder there instead
        // of waiting for it to grind forward.
        if !self.is_complete() {
            let highest = self.highest_produced.load(Ordering::Acquire);
            if index > highest.saturating_add(self.policy.lookahead_segments) {
                self.restart(index).await;
            }
        }

        // Disk check covers the race between encoder output and the watcher
        // noticing it.
        self.harvest().await;
        if let Some(data) = self.cached(index) {
            return SegmentFetch::Data(data);
        }

        let deadline = Instant::now() + self.policy.segment_wait;
        loop {
            self.harvest().await;
            if let Some(data) = self.cached(index) {
                return SegmentFetch::Data(data);
            }
            // Completed (or failed) without this segment appearing: the
            // client sought past what the stream can produce.
            if self.is_complete() || self.error.lock().is_some() {
                return SegmentFetch::Missing;
            }
            if Instant::now() >= deadline {
                tracing::debug!(session = %self.key.id(), index, "segment wait timed out");
                return SegmentFetch::Missing;
            }
            tokio::select! {
                _ = cancel.cancelled() => return SegmentFetch::Cancelled,
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }
        }
    }

    /// Kill the current encoder run and relaunch it seeked to `start_index`.
    ///
    /// Cached segments survive; the production floor moves up to
    /// `start_index` and stale on-disk output from the old run is removed.
    pub async fn restart(self: &Arc<Self>, start_index: u32) {
        let mut proc = self.proc.lock().await;

        // Re-check under the lock: a concurrent reader may have already
        // restarted for the same seek.
        let highest = self.highest_produced.load(Ordering::Acquire);
        if self.producing.load(Ordering::Acquire)
            && self.error.lock().is_none()
            && start_index <= highest.saturating_add(self.policy.lookahead_segments)
        {
            return;
        }

        tracing::info!(session = %self.key.id(), start_index, "restarting transcoder");

        self.shutdown_run(&mut proc).await;
        self.complete.store(false, Ordering::Release);
        *self.error.lock() = None;
        self.remove_stale_outputs().await;
        self.highest_produced.store(start_index, Ordering::Release);
        self.spawn_run(start_index, &mut proc).await;
    }

    /// Kill the encoder and release the run's resources. The temp dir itself
    /// is removed when the last reference to the session drops.
    pub async fn dispose(&self) {
        let mut proc = self.proc.lock().await;
        self.shutdown_run(&mut proc).await;
        tracing::info!(session = %self.key.id(), "session disposed");
    }

    /// Stop the current run: rescue finished segments, signal the observer,
    /// and wait the child fully out.
    async fn shutdown_run(&self, proc: &mut ProcState) {
        self.harvest().await;
        if let Some(kill) = proc.kill.take() {
            kill.cancel();
        }
        if let Some(observer) = proc.observer.take() {
            let _ = observer.await;
        }
        proc.watcher = None;
        self.producing.store(false, Ordering::Release);
    }

    /// Delete leftover segment files and the encoder's own playlist from a
    /// previous run.
    async fn remove_stale_outputs(&self) {
        let dir = self.work_dir.path();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if parse_segment_name(name).is_some() || name == LIVE_PLAYLIST {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Launch the encoder seeked to `start_index` and arm the watcher and
    /// observer for the new run. Spawn failures land in the error field.
    async fn spawn_run(self: &Arc<Self>, start_index: u32, proc: &mut ProcState) {
        let Some(ffmpeg) = self.tools.ffmpeg.clone() else {
            *self.error.lock() = Some("transcoder not found: ffmpeg".to_string());
            return;
        };

        let profile = self.encoder.select().await;
        let args = build_transcode_args(
            &self.source,
            self.work_dir.path(),
            &self.params,
            profile,
            start_index,
        );
        tracing::debug!(session = %self.key.id(), ?args, "spawning transcoder");

        // Arm the watch before the process exists so early segments are not
        // missed; harvesting stays authoritative even when events are lost.
        let (fs_tx, fs_rx) = mpsc::channel::<()>(64);
        proc.watcher = match RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.kind.is_create() {
                        let _ = fs_tx.try_send(());
                    }
                }
            },
            notify::Config::default(),
        ) {
            Ok(mut watcher) => match watcher.watch(self.work_dir.path(), RecursiveMode::NonRecursive)
            {
                Ok(()) => Some(watcher),
                Err(e) => {
                    tracing::debug!(error = %e, "segment watch failed, relying on polling");
                    None
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "segment watcher unavailable, relying on polling");
                None
            }
        };

        let mut child = match Command::new(&ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(session = %self.key.id(), error = %e, "transcoder spawn failed");
                *self.error.lock() = Some(format!("failed to start transcoder: {e}"));
                proc.watcher = None;
                return;
            }
        };

        let stderr = child.stderr.take();
        let kill = CancellationToken::new();
        self.producing.store(true, Ordering::Release);
        proc.kill = Some(kill.clone());
        proc.observer = Some(tokio::spawn(observe_run(
            Arc::clone(self),
            child,
            stderr,
            fs_rx,
            kill,
        )));
    }

    /// Absorb finished segment files into the in-memory cache and delete the
    /// on-disk copies.
    ///
    /// While the encoder is running, the highest-numbered file on disk is
    /// still being written and is left alone; once it has exited everything
    /// is absorbed. This one routine backs the watcher callback, the reader
    /// disk check, and the completion sweep, so a missed watcher event can
    /// never lose a segment.
    async fn harvest(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(self.work_dir.path()).await else {
            return;
        };

        let mut found: Vec<(u32, PathBuf)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_segment_name(name) {
                found.push((index, entry.path()));
            }
        }
        found.sort_by_key(|(index, _)| *index);

        let in_flight = if self.producing.load(Ordering::Acquire) {
            found.last().map(|(index, _)| *index)
        } else {
            None
        };

        for (index, path) in found {
            if Some(index) == in_flight {
                continue;
            }
            if !self.segments.contains_key(&index) {
                match tokio::fs::read(&path).await {
                    Ok(data) if !data.is_empty() => {
                        tracing::debug!(session = %self.key.id(), index, bytes = data.len(), "segment cached");
                        self.segments.insert(index, Bytes::from(data));
                        self.highest_produced.fetch_max(index, Ordering::AcqRel);
                    }
                    // Unreadable or empty right now; leave it for the next
                    // sweep rather than caching garbage.
                    _ => continue,
                }
            }
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

/// Owns the child process for one encoder run: relays filesystem hints into
/// harvests, waits for exit, and records the outcome.
async fn observe_run(
    session: Arc<TranscodeSession>,
    mut child: Child,
    stderr: Option<ChildStderr>,
    mut fs_events: mpsc::Receiver<()>,
    kill: CancellationToken,
) {
    let last_line = Arc::new(parking_lot::Mutex::new(None::<String>));
    let stderr_task = stderr.map(|stderr| {
        let last_line = Arc::clone(&last_line);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    *last_line.lock() = Some(line.trim().to_string());
                }
            }
        })
    });

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return;
            }
            Some(()) = fs_events.recv() => {
                session.harvest().await;
            }
            status = child.wait() => {
                session.producing.store(false, Ordering::Release);
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }
                // One more sweep to absorb trailing segments the watcher
                // never reported.
                session.harvest().await;

                match status {
                    Ok(status) if status.success() => {
                        session.complete.store(true, Ordering::Release);
                        tracing::info!(
                            session = %session.key.id(),
                            segments = session.segments_cached(),
                            "transcode complete"
                        );
                    }
                    Ok(status) => {
                        let diagnostic = last_line
                            .lock()
                            .take()
                            .unwrap_or_else(|| format!("transcoder exited with {status}"));
                        tracing::warn!(session = %session.key.id(), %diagnostic, "transcoder failed");
                        *session.error.lock() = Some(diagnostic);
                    }
                    Err(e) => {
                        *session.error.lock() = Some(format!("transcoder wait failed: {e}"));
                    }
                }
                return;
            }
        }
    }
}

/// Probe the source duration: ffprobe first, `ffmpeg -i` stderr as fallback.
async fn probe_source_duration(tools: &EngineTools, source: &Path) -> lanreel_av::Result<f64> {
    let mut first_error = None;
    if let Some(ffprobe) = &tools.ffprobe {
        match lanreel_av::probe_duration(ffprobe, source).await {
            Ok(duration) => return Ok(duration),
            Err(e) => {
                tracing::debug!(error = %e, "ffprobe failed, trying ffmpeg fallback");
                first_error = Some(e);
            }
        }
    }
    if let Some(ffmpeg) = &tools.ffmpeg {
        return lanreel_av::ffmpeg_duration_fallback(ffmpeg, source).await;
    }
    Err(first_error.unwrap_or_else(|| lanreel_av::Error::tool_not_found("ffprobe")))
}

/// Assemble the full encoder invocation for a run starting at `start_index`.
fn build_transcode_args(
    source: &Path,
    work_dir: &Path,
    params: &TierParams,
    profile: &crate::streaming::encoder::EncoderProfile,
    start_index: u32,
) -> Vec<String> {
    let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let offset = u64::from(start_index) * u64::from(params.segment_secs);
    if offset > 0 {
        args.push("-ss".into());
        args.push(offset.to_string());
    }

    args.push("-i".into());
    args.push(source.to_string_lossy().into_owned());

    // Best video stream plus best audio stream when the source has one.
    args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(String::from));

    args.push("-vf".into());
    args.push(params.scale_filter());

    args.extend(profile.codec_args.iter().map(|s| s.to_string()));
    match (params.video_bitrate, params.buffer_size) {
        (Some(bitrate), Some(bufsize)) => {
            args.extend(
                ["-b:v", bitrate, "-maxrate", bitrate, "-bufsize", bufsize].map(String::from),
            );
        }
        _ => args.extend(profile.quality_args.iter().map(|s| s.to_string())),
    }

    args.extend(["-c:a", "aac", "-b:a", params.audio_bitrate, "-ac", "2"].map(String::from));

    args.extend(["-f", "hls"].map(String::from));
    args.push("-hls_time".into());
    args.push(params.segment_secs.to_string());
    args.extend(["-hls_list_size", "0"].map(String::from));
    args.extend(["-hls_flags", "independent_segments"].map(String::from));
    args.extend(["-hls_segment_type", "mpegts"].map(String::from));
    args.push("-start_number".into());
    args.push(start_index.to_string());
    args.push("-hls_segment_filename".into());
    args.push(work_dir.join("seg%04d.ts").to_string_lossy().into_owned());
    args.push(work_dir.join(LIVE_PLAYLIST).to_string_lossy().into_owned());

    args
}
