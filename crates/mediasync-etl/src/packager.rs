//! Media packaging for adaptive streaming
//!
//! Packaging happens in two stages:
//!
//! 1. **Container**: the separately uploaded audio and video tracks are
//!    muxed into one MP4. The video stream is copied, the audio stream is
//!    encoded to AAC, and exactly one stream of each kind is mapped.
//! 2. **Manifest**: the container is re-encoded into a ladder of H.264
//!    renditions plus a DASH manifest. The container is removed only after
//!    this succeeds, so a failed or interrupted run leaves it on disk.
//!
//! HLS has no manifest stage yet, so HLS jobs skip both stages.
//!
//! [`MediaPackager`] runs both stages on background tasks so that the sync
//! loop never waits for an encoder. Concurrency is bounded by a semaphore
//! and every child process is killed when the shutdown token fires. At most
//! one job per content id runs at a time; a job scheduled while another for
//! the same id is running waits for it, and only the newest waiting job is
//! kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PackagingConfig;
use crate::error::{EtlError, EtlResult};
use crate::models::PackagingJob;

/// Streaming protocol produced by the manifest stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// MPEG-DASH
    #[default]
    Dash,
    /// HTTP Live Streaming (not implemented yet, see [`MediaConverter::to_hls`])
    Hls,
}

impl StreamFormat {
    pub fn manifest_file_name(self) -> &'static str {
        match self {
            StreamFormat::Dash => "dash.mpd",
            StreamFormat::Hls => "master.m3u8",
        }
    }
}

impl std::str::FromStr for StreamFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dash" | "mpeg-dash" => Ok(StreamFormat::Dash),
            "hls" => Ok(StreamFormat::Hls),
            _ => Err(anyhow::anyhow!("Invalid PACKAGING_FORMAT: {}. Must be 'dash' or 'hls'", s)),
        }
    }
}

/// One rendition in the bitrate ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub height: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

/// Standard ladder, tallest first.
pub const LADDER: &[Representation] = &[
    Representation { height: 2160, video_kbps: 17408, audio_kbps: 320 },
    Representation { height: 1440, video_kbps: 6144, audio_kbps: 320 },
    Representation { height: 1080, video_kbps: 4096, audio_kbps: 320 },
    Representation { height: 720, video_kbps: 2048, audio_kbps: 320 },
    Representation { height: 480, video_kbps: 750, audio_kbps: 192 },
    Representation { height: 360, video_kbps: 276, audio_kbps: 128 },
    Representation { height: 240, video_kbps: 150, audio_kbps: 64 },
    Representation { height: 144, video_kbps: 95, audio_kbps: 64 },
];

impl Representation {
    /// Rungs of [`LADDER`] no taller than the source.
    ///
    /// Sources shorter than the smallest rung still get that rung.
    pub fn auto_generate(source_height: u32) -> Vec<Representation> {
        let reps: Vec<_> = LADDER
            .iter()
            .copied()
            .filter(|r| r.height <= source_height)
            .collect();

        if reps.is_empty() {
            LADDER.last().copied().into_iter().collect()
        } else {
            reps
        }
    }

    /// Parse `height:video_kbps[:audio_kbps]` entries separated by commas,
    /// e.g. `720:2048:128,360:276`.
    pub fn parse_list(s: &str) -> anyhow::Result<Vec<Representation>> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let parts: Vec<&str> = entry.split(':').collect();
                let num = |i: usize| -> anyhow::Result<u32> {
                    parts[i]
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid representation '{}'", entry))
                };
                match parts.len() {
                    2 => Ok(Representation { height: num(0)?, video_kbps: num(1)?, audio_kbps: 128 }),
                    3 => Ok(Representation { height: num(0)?, video_kbps: num(1)?, audio_kbps: num(2)? }),
                    _ => anyhow::bail!("Invalid representation '{}', expected height:video_kbps[:audio_kbps]", entry),
                }
            })
            .collect()
    }
}

/// Resolves asset references and output locations for a video.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    pub media_root: PathBuf,
    pub container_dir: PathBuf,
    pub streams_dir: PathBuf,
    pub format: StreamFormat,
}

impl MediaLayout {
    pub fn from_config(config: &PackagingConfig) -> Self {
        Self {
            media_root: config.media_root.clone(),
            container_dir: config.container_dir.clone(),
            streams_dir: config.streams_dir.clone(),
            format: config.format,
        }
    }

    pub fn job_for(&self, content_id: Uuid, video_file: &str, audio_file: &str) -> PackagingJob {
        PackagingJob {
            content_id,
            video_path: self.media_root.join(video_file),
            audio_path: self.media_root.join(audio_file),
            container_path: self.container_dir.join(format!("{}.mp4", content_id)),
            manifest_path: self
                .streams_dir
                .join(content_id.to_string())
                .join(self.format.manifest_file_name()),
        }
    }
}

/// Wraps the external encoder and prober binaries.
#[derive(Debug, Clone)]
pub struct MediaConverter {
    ffmpeg_path: String,
    ffprobe_path: String,
}

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 5;

impl MediaConverter {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    pub fn from_config(config: &PackagingConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.ffprobe_path)
    }

    /// Where the encoder will be found on `PATH`, if anywhere.
    pub fn locate_encoder(&self) -> Option<PathBuf> {
        which::which(&self.ffmpeg_path).ok()
    }

    /// Stage 1: mux `video` and `audio` into `container`.
    pub async fn make_container(
        &self,
        video: &Path,
        audio: &Path,
        container: &Path,
        cancel: &CancellationToken,
    ) -> EtlResult<PathBuf> {
        ensure_parent(container).await?;

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(container_args(video, audio, container));
        run_encoder(cmd, cancel).await?;

        debug!(container = %container.display(), "Container written");
        Ok(container.to_path_buf())
    }

    /// Stage 2: package `container` as MPEG-DASH at `manifest`, then delete
    /// the container.
    ///
    /// A container that cannot be deleted is reported as
    /// [`EtlError::Cleanup`]; the manifest is already complete by then.
    pub async fn to_mpeg_dash(
        &self,
        container: &Path,
        manifest: &Path,
        representations: &[Representation],
        cancel: &CancellationToken,
    ) -> EtlResult<()> {
        if representations.is_empty() {
            return Err(EtlError::Config("No representations to package".to_string()));
        }
        ensure_parent(manifest).await?;

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(dash_args(container, manifest, representations));
        run_encoder(cmd, cancel).await?;

        match tokio::fs::remove_file(container).await {
            Ok(()) => {
                debug!(container = %container.display(), "Removed container");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EtlError::Cleanup {
                path: container.to_path_buf(),
                source,
            }),
        }
    }

    /// HLS packaging. Not produced yet; nothing is written, not even the
    /// container.
    pub async fn to_hls(&self, job: &PackagingJob) -> EtlResult<()> {
        warn!(
            content_id = %job.content_id,
            manifest = %job.manifest_path.display(),
            "HLS packaging is not implemented, job skipped"
        );
        Ok(())
    }

    /// Height of the first video stream in `media`.
    pub async fn probe_height(&self, media: &Path, cancel: &CancellationToken) -> EtlResult<u32> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(["-v", "error", "-select_streams", "v:0", "-show_entries", "stream=width,height", "-of", "json"])
            .arg(media);
        let stdout = run_encoder(cmd, cancel).await?;
        parse_probe_height(&stdout)
    }

    /// Renditions for `container`: the configured list, or the ladder cut
    /// at the probed source height.
    pub async fn representations_for(
        &self,
        container: &Path,
        configured: &[Representation],
        cancel: &CancellationToken,
    ) -> EtlResult<Vec<Representation>> {
        if !configured.is_empty() {
            return Ok(configured.to_vec());
        }
        let height = self.probe_height(container, cancel).await?;
        Ok(Representation::auto_generate(height))
    }
}

fn container_args(video: &Path, audio: &Path, container: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-nostdin".into(), "-i".into()];
    args.push(video.to_string_lossy().into_owned());
    args.push("-i".into());
    args.push(audio.to_string_lossy().into_owned());
    args.extend(
        ["-c:v", "copy", "-c:a", "aac", "-map", "0:v:0", "-map", "1:a:0"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(container.to_string_lossy().into_owned());
    args
}

fn dash_args(container: &Path, manifest: &Path, reps: &[Representation]) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-nostdin".into(), "-i".into()];
    args.push(container.to_string_lossy().into_owned());

    for _ in reps {
        args.extend(["-map".to_string(), "0:v:0".to_string()]);
    }
    args.extend(["-map".to_string(), "0:a:0".to_string()]);
    args.extend(["-c:v".to_string(), "libx264".to_string(), "-c:a".to_string(), "aac".to_string()]);

    for (i, rep) in reps.iter().enumerate() {
        args.push(format!("-b:v:{}", i));
        args.push(format!("{}k", rep.video_kbps));
        args.push(format!("-filter:v:{}", i));
        args.push(format!("scale=-2:{}", rep.height));
    }

    let audio_kbps = reps.iter().map(|r| r.audio_kbps).max().unwrap_or(128);
    args.extend(["-b:a".to_string(), format!("{}k", audio_kbps)]);
    args.extend(
        [
            "-use_timeline",
            "1",
            "-use_template",
            "1",
            "-adaptation_sets",
            "id=0,streams=v id=1,streams=a",
            "-f",
            "dash",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(manifest.to_string_lossy().into_owned());
    args
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    height: Option<u32>,
}

fn parse_probe_height(stdout: &[u8]) -> EtlResult<u32> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)?;
    probe
        .streams
        .iter()
        .find_map(|s| s.height)
        .ok_or_else(|| EtlError::Encoder {
            code: Some(0),
            message: "ffprobe reported no video stream".to_string(),
        })
}

async fn ensure_parent(path: &Path) -> EtlResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Run an external tool to completion and return its stdout.
///
/// Non-zero exit becomes [`EtlError::Encoder`] carrying the tail of stderr.
/// Cancellation drops the child, which kills it.
async fn run_encoder(mut cmd: Command, cancel: &CancellationToken) -> EtlResult<Vec<u8>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("LC_ALL", "C")
        .kill_on_drop(true);

    debug!(command = ?cmd.as_std(), "Spawning encoder");
    let child = cmd.spawn()?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EtlError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

    Err(EtlError::Encoder {
        code: output.status.code(),
        message: if tail.is_empty() { "no output".to_string() } else { tail },
    })
}

/// How a packaging job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingOutcome {
    /// Manifest written and container removed
    Packaged { content_id: Uuid, manifest: PathBuf },
    /// Manifest written but the container could not be removed
    ContainerKept {
        content_id: Uuid,
        manifest: PathBuf,
        container: PathBuf,
        error: String,
    },
    /// Muxing failed; nothing was produced
    ContainerFailed { content_id: Uuid, error: String },
    /// Manifest generation failed; the container is kept for inspection
    ManifestFailed { content_id: Uuid, container: PathBuf, error: String },
    /// Format has no implementation yet; nothing was produced
    Skipped { content_id: Uuid },
    /// Stopped by shutdown
    Cancelled { content_id: Uuid },
}

/// Accepts packaging work without waiting for it.
pub trait PackagingScheduler: Send + Sync {
    fn schedule(&self, job: PackagingJob);
}

/// Runs packaging jobs on a bounded set of background tasks.
#[derive(Clone)]
pub struct MediaPackager {
    converter: Arc<MediaConverter>,
    format: StreamFormat,
    representations: Arc<Vec<Representation>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    outcomes: Option<mpsc::UnboundedSender<PackagingOutcome>>,
    /// Content ids with a running job, each with the job waiting behind it.
    active: Arc<Mutex<HashMap<Uuid, Option<PackagingJob>>>>,
}

impl MediaPackager {
    pub fn new(config: &PackagingConfig, cancel: CancellationToken) -> Self {
        Self {
            converter: Arc::new(MediaConverter::from_config(config)),
            format: config.format,
            representations: Arc::new(config.representations.clone()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            cancel,
            outcomes: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Report every finished job on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<PackagingOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn converter(&self) -> &MediaConverter {
        &self.converter
    }

    /// Content ids with a job queued or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Run both stages of `job` on the current task.
    pub async fn package(&self, job: &PackagingJob) -> PackagingOutcome {
        let content_id = job.content_id;
        let cancel = &self.cancel;

        if self.format == StreamFormat::Hls {
            return match self.converter.to_hls(job).await {
                Ok(()) => PackagingOutcome::Skipped { content_id },
                Err(e) => PackagingOutcome::ContainerFailed {
                    content_id,
                    error: e.to_string(),
                },
            };
        }

        let container = match self
            .converter
            .make_container(&job.video_path, &job.audio_path, &job.container_path, cancel)
            .await
        {
            Ok(container) => container,
            Err(EtlError::Cancelled) => return PackagingOutcome::Cancelled { content_id },
            Err(e) => {
                return PackagingOutcome::ContainerFailed {
                    content_id,
                    error: e.to_string(),
                }
            },
        };

        let result = match self
            .converter
            .representations_for(&container, &self.representations, cancel)
            .await
        {
            Ok(reps) => {
                self.converter
                    .to_mpeg_dash(&container, &job.manifest_path, &reps, cancel)
                    .await
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => PackagingOutcome::Packaged {
                content_id,
                manifest: job.manifest_path.clone(),
            },
            Err(e @ EtlError::Cleanup { .. }) => PackagingOutcome::ContainerKept {
                content_id,
                manifest: job.manifest_path.clone(),
                container,
                error: e.to_string(),
            },
            Err(EtlError::Cancelled) => PackagingOutcome::Cancelled { content_id },
            Err(e) => PackagingOutcome::ManifestFailed {
                content_id,
                container,
                error: e.to_string(),
            },
        }
    }

    /// Stop accepting jobs and wait for running ones.
    ///
    /// Jobs still running after `grace` are cancelled. Returns whether every
    /// job finished inside the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(in_flight = self.tracker.len(), "Packaging jobs still running, cancelling");
        self.cancel.cancel();
        self.tracker.wait().await;
        false
    }

    /// Run `job`, then whatever job was queued for the same content while it
    /// ran, until none is left.
    async fn run_serialized(&self, mut job: PackagingJob) {
        loop {
            let outcome = self.run_with_permit(&job).await;
            log_outcome(&outcome);
            if let Some(tx) = &self.outcomes {
                let _ = tx.send(outcome);
            }

            let next = {
                let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
                let next = active.get_mut(&job.content_id).and_then(Option::take);
                if next.is_none() {
                    active.remove(&job.content_id);
                }
                next
            };

            match next {
                Some(next) => job = next,
                None => return,
            }
        }
    }

    async fn run_with_permit(&self, job: &PackagingJob) -> PackagingOutcome {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        };

        match permit {
            Some(_permit) => self.package(job).await,
            None => PackagingOutcome::Cancelled { content_id: job.content_id },
        }
    }
}

fn log_outcome(outcome: &PackagingOutcome) {
    match outcome {
        PackagingOutcome::Packaged { content_id, manifest } => {
            info!(%content_id, manifest = %manifest.display(), "Packaging complete")
        },
        PackagingOutcome::ContainerKept { content_id, manifest, container, error } => {
            error!(
                %content_id,
                manifest = %manifest.display(),
                container = %container.display(),
                %error,
                "Packaging complete but container was not removed"
            )
        },
        PackagingOutcome::ContainerFailed { content_id, error } => {
            error!(%content_id, %error, "Container build failed")
        },
        PackagingOutcome::ManifestFailed { content_id, container, error } => {
            error!(%content_id, container = %container.display(), %error, "Manifest generation failed, container kept")
        },
        PackagingOutcome::Skipped { content_id } => {
            info!(%content_id, "Packaging skipped")
        },
        PackagingOutcome::Cancelled { content_id } => {
            warn!(%content_id, "Packaging cancelled")
        },
    }
}

impl PackagingScheduler for MediaPackager {
    fn schedule(&self, job: PackagingJob) {
        if self.tracker.is_closed() || self.cancel.is_cancelled() {
            warn!(content_id = %job.content_id, "Packager is shutting down, job dropped");
            return;
        }

        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(waiting) = active.get_mut(&job.content_id) {
                debug!(content_id = %job.content_id, "Job for this content already running, queued behind it");
                *waiting = Some(job);
                return;
            }
            active.insert(job.content_id, None);
        }

        let packager = self.clone();
        self.tracker.spawn(async move { packager.run_serialized(job).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> MediaLayout {
        MediaLayout {
            media_root: root.join("media"),
            container_dir: root.join("containers"),
            streams_dir: root.join("streams"),
            format: StreamFormat::Dash,
        }
    }

    #[cfg(unix)]
    fn packaging_config(root: &Path, ffmpeg: &str) -> PackagingConfig {
        PackagingConfig {
            enabled: true,
            ffmpeg_path: ffmpeg.to_string(),
            ffprobe_path: "false".to_string(),
            media_root: root.join("media"),
            container_dir: root.join("containers"),
            streams_dir: root.join("streams"),
            max_concurrent: 2,
            format: StreamFormat::Dash,
            representations: vec![Representation { height: 360, video_kbps: 276, audio_kbps: 128 }],
        }
    }

    #[test]
    fn test_layout_paths() {
        let id = Uuid::from_u128(9);
        let job = layout(Path::new("/srv")).job_for(id, "video/1.mp4", "audio/1.aac");

        assert_eq!(job.video_path, PathBuf::from("/srv/media/video/1.mp4"));
        assert_eq!(job.audio_path, PathBuf::from("/srv/media/audio/1.aac"));
        assert_eq!(job.container_path, PathBuf::from(format!("/srv/containers/{}.mp4", id)));
        assert_eq!(job.manifest_path, PathBuf::from(format!("/srv/streams/{}/dash.mpd", id)));
    }

    #[test]
    fn test_container_args_map_one_stream_of_each() {
        let args = container_args(Path::new("v.mp4"), Path::new("a.aac"), Path::new("out.mp4"));
        let joined = args.join(" ");

        assert!(joined.contains("-i v.mp4 -i a.aac"));
        assert!(joined.contains("-c:v copy -c:a aac"));
        assert!(joined.contains("-map 0:v:0 -map 1:a:0"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_dash_args_one_video_map_per_rendition() {
        let reps = Representation::auto_generate(480);
        let args = dash_args(Path::new("c.mp4"), Path::new("out/dash.mpd"), &reps);

        let video_maps = args.windows(2).filter(|w| w[0] == "-map" && w[1] == "0:v:0").count();
        assert_eq!(video_maps, reps.len());
        assert!(args.contains(&"scale=-2:480".to_string()));
        assert!(args.contains(&"-b:v:3".to_string()));
        assert!(args.contains(&"192k".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out/dash.mpd"));
    }

    #[test]
    fn test_auto_generate_cuts_ladder_at_source_height() {
        let heights: Vec<u32> = Representation::auto_generate(720).iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![720, 480, 360, 240, 144]);

        let tiny = Representation::auto_generate(100);
        assert_eq!(tiny.len(), 1);
        assert_eq!(tiny[0].height, 144);
    }

    #[test]
    fn test_parse_representation_list() {
        let reps = Representation::parse_list("720:2048:192, 360:276").unwrap();
        assert_eq!(reps[0], Representation { height: 720, video_kbps: 2048, audio_kbps: 192 });
        assert_eq!(reps[1], Representation { height: 360, video_kbps: 276, audio_kbps: 128 });

        assert!(Representation::parse_list("720").is_err());
        assert!(Representation::parse_list("tall:fast").is_err());
        assert!(Representation::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_probe_height() {
        let json = br#"{"programs":[],"streams":[{"width":1280,"height":720}]}"#;
        assert_eq!(parse_probe_height(json).unwrap(), 720);

        assert!(parse_probe_height(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe_height(b"garbage").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_make_container_failure_is_reported_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let converter = MediaConverter::new("false", "false");
        let cancel = CancellationToken::new();
        let container = dir.path().join("out.mp4");

        for _ in 0..2 {
            let err = converter
                .make_container(Path::new("v.mp4"), Path::new("a.aac"), &container, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, EtlError::Encoder { code: Some(1), .. }));
        }
        assert!(!container.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_make_container_success_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let converter = MediaConverter::new("true", "false");
        let container = dir.path().join("nested").join("out.mp4");

        let made = converter
            .make_container(Path::new("v.mp4"), Path::new("a.aac"), &container, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(made, container);
        assert!(container.parent().unwrap().is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_manifest_success_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.mp4");
        std::fs::write(&container, b"mp4").unwrap();

        MediaConverter::new("true", "false")
            .to_mpeg_dash(
                &container,
                &dir.path().join("streams/dash.mpd"),
                &Representation::auto_generate(360),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!container.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_manifest_failure_keeps_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.mp4");
        std::fs::write(&container, b"mp4").unwrap();

        let result = MediaConverter::new("false", "false")
            .to_mpeg_dash(
                &container,
                &dir.path().join("streams/dash.mpd"),
                &Representation::auto_generate(360),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(container.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_failure_keeps_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = packaging_config(dir.path(), "true");
        config.representations.clear();
        let packager = MediaPackager::new(&config, CancellationToken::new());

        let job = MediaLayout::from_config(&config).job_for(Uuid::from_u128(3), "v.mp4", "a.aac");
        std::fs::create_dir_all(job.container_path.parent().unwrap()).unwrap();
        std::fs::write(&job.container_path, b"mp4").unwrap();

        let outcome = packager.package(&job).await;
        assert!(matches!(outcome, PackagingOutcome::ManifestFailed { .. }));
        assert!(job.container_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scheduled_job_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let config = packaging_config(dir.path(), "true");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let packager = MediaPackager::new(&config, CancellationToken::new()).with_outcomes(tx);

        let id = Uuid::from_u128(1);
        let job = MediaLayout::from_config(&config).job_for(id, "v.mp4", "a.aac");
        packager.schedule(job.clone());

        assert!(packager.shutdown(Duration::from_secs(10)).await);
        assert_eq!(
            rx.recv().await,
            Some(PackagingOutcome::Packaged { content_id: id, manifest: job.manifest_path })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_failure_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let config = packaging_config(dir.path(), "false");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let packager = MediaPackager::new(&config, CancellationToken::new()).with_outcomes(tx);

        packager.schedule(MediaLayout::from_config(&config).job_for(Uuid::from_u128(2), "v.mp4", "a.aac"));
        packager.shutdown(Duration::from_secs(10)).await;

        assert!(matches!(rx.recv().await, Some(PackagingOutcome::ContainerFailed { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_packager_does_not_run_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PackagingConfig::default();
        config.container_dir = dir.path().join("containers");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let packager = MediaPackager::new(&config, cancel.clone()).with_outcomes(tx);

        cancel.cancel();
        packager.schedule(MediaLayout::from_config(&config).job_for(Uuid::from_u128(4), "v.mp4", "a.aac"));
        packager.shutdown(Duration::from_secs(1)).await;

        assert_eq!(packager.in_flight(), 0);
        drop(packager);
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undeletable_container_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the container should be cannot be
        // removed as a file.
        let container = dir.path().join("c.mp4");
        std::fs::create_dir_all(container.join("stuck")).unwrap();

        let err = MediaConverter::new("true", "false")
            .to_mpeg_dash(
                &container,
                &dir.path().join("streams/dash.mpd"),
                &Representation::auto_generate(360),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EtlError::Cleanup { ref path, .. } if *path == container));
        assert!(container.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_kept_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let config = packaging_config(dir.path(), "true");
        let packager = MediaPackager::new(&config, CancellationToken::new());

        let job = MediaLayout::from_config(&config).job_for(Uuid::from_u128(6), "v.mp4", "a.aac");
        std::fs::create_dir_all(job.container_path.join("stuck")).unwrap();

        match packager.package(&job).await {
            PackagingOutcome::ContainerKept { manifest, container, .. } => {
                assert_eq!(manifest, job.manifest_path);
                assert_eq!(container, job.container_path);
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hls_job_builds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = packaging_config(dir.path(), "true");
        config.format = StreamFormat::Hls;
        let packager = MediaPackager::new(&config, CancellationToken::new());

        let id = Uuid::from_u128(7);
        let job = MediaLayout::from_config(&config).job_for(id, "v.mp4", "a.aac");

        assert_eq!(packager.package(&job).await, PackagingOutcome::Skipped { content_id: id });
        assert!(!config.container_dir.exists());
    }

    /// Encoder stand-in that appends `start`/`end` to a log around a short
    /// sleep, so overlapping runs show up as adjacent `start` lines.
    #[cfg(unix)]
    fn recording_encoder(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("encoder.log");
        let script = dir.join("fake-ffmpeg");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho start >> '{log}'\nsleep 0.2\necho end >> '{log}'\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_jobs_for_same_content_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let (encoder, log) = recording_encoder(dir.path());
        let config = packaging_config(dir.path(), &encoder.to_string_lossy());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let packager = MediaPackager::new(&config, CancellationToken::new()).with_outcomes(tx);

        let id = Uuid::from_u128(8);
        let job = MediaLayout::from_config(&config).job_for(id, "v.mp4", "a.aac");
        packager.schedule(job.clone());
        packager.schedule(job.clone());
        // Replaces the waiting job instead of queueing a third run.
        packager.schedule(job.clone());
        assert_eq!(packager.in_flight(), 1);

        assert!(packager.shutdown(Duration::from_secs(20)).await);

        let mut outcomes = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            outcomes.push(outcome);
        }
        let packaged = PackagingOutcome::Packaged { content_id: id, manifest: job.manifest_path.clone() };
        assert_eq!(outcomes, vec![packaged.clone(), packaged]);

        // Two stages per run, two runs, strictly one after another.
        let lines: Vec<String> = std::fs::read_to_string(&log).unwrap().lines().map(str::to_string).collect();
        assert_eq!(lines, ["start", "end"].repeat(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_encoder() {
        assert!(MediaConverter::new("sh", "false").locate_encoder().is_some());
        assert!(MediaConverter::new("no-such-encoder-binary", "false").locate_encoder().is_none());
    }

    #[test]
    fn test_stream_format_from_str() {
        assert_eq!("DASH".parse::<StreamFormat>().unwrap(), StreamFormat::Dash);
        assert_eq!("hls".parse::<StreamFormat>().unwrap(), StreamFormat::Hls);
        assert!("smooth".parse::<StreamFormat>().is_err());
        assert_eq!(StreamFormat::Hls.manifest_file_name(), "master.m3u8");
    }
}
