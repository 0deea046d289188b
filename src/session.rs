//! Recording session state machine and registry.
//!
//! A `RecordingSession` composes one continuous-capture encoder process with
//! on-demand page-clip captures against the same camera. Sessions live in
//! the `SessionRegistry`, the single shared mutable resource of the service;
//! every operation goes through the session identifier key. The registry is
//! injected into call sites rather than accessed as ambient state, and its
//! lock is never held while an encoder runs.

use crate::camera::{CameraProfile, CameraSelector};
use crate::capture::{self, ManagedProcess};
use crate::config::RecordingConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Extra time a clip capture gets beyond its configured length before it is
/// considered stuck and killed.
const CLIP_BUDGET_SLACK: Duration = Duration::from_secs(5);

/// A short, downsampled capture representing time spent on one page.
/// Appended to its session and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct PageClip {
    pub page: u32,
    pub file_name: String,
    pub path: PathBuf,
    /// Full time spent on the page, not the capped capture length.
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SessionState {
    Recording,
    Stopping,
}

/// Per-session recording state. Owned exclusively by the registry until
/// stopped, then discarded.
pub struct RecordingSession {
    session_id: String,
    serial_number: String,
    station_id: String,
    dir: PathBuf,
    video_path: Option<PathBuf>,
    process: Option<ManagedProcess>,
    camera: Option<CameraProfile>,
    state: SessionState,
    current_page: Option<u32>,
    page_entered_at: Instant,
    clips: Vec<PageClip>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

/// Result of a session start. `success == false` means no camera was
/// reachable; the owning session tracking proceeds without video, this is
/// never a hard error.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub success: bool,
    /// False when the session runs video-less (encoder failed to start).
    pub recording: bool,
    pub camera: Option<String>,
    pub video_file: Option<String>,
    pub error: Option<String>,
}

impl StartOutcome {
    fn unavailable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            recording: false,
            camera: None,
            video_file: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a page-clip capture attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ClipOutcome {
    pub success: bool,
    pub skipped: bool,
    pub clip: Option<PageClip>,
    pub error: Option<String>,
}

impl ClipOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            clip: None,
            error: Some(error.into()),
        }
    }

    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            clip: None,
            error: None,
        }
    }
}

/// Result bundle produced when a session stops, for inclusion in the
/// external session summary.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub session_id: String,
    pub video_path: Option<PathBuf>,
    pub page_clips: Vec<PageClip>,
    pub camera: Option<String>,
    pub duration_secs: f64,
}

/// Read-only view of an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub serial_number: String,
    pub station_id: String,
    pub camera: Option<String>,
    pub recording: bool,
    pub current_page: Option<u32>,
    pub clip_count: usize,
    pub started_at: DateTime<Utc>,
}

/// Process-wide mapping from session identifier to recording session.
pub struct SessionRegistry {
    config: RecordingConfig,
    selector: Arc<CameraSelector>,
    sessions: Mutex<HashMap<String, RecordingSession>>,
}

impl SessionRegistry {
    pub fn new(config: RecordingConfig, selector: Arc<CameraSelector>) -> Self {
        Self {
            config,
            selector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a recording session: force-refresh the camera selection, create
    /// the session directory and launch the continuous encoder.
    ///
    /// No reachable camera yields a degraded `{success: false}` result with
    /// no side effects. An encoder spawn failure is logged and the session
    /// still registers video-less.
    pub async fn start(&self, session_id: &str, serial_number: &str, station_id: &str) -> StartOutcome {
        // A restart on a live session id replaces it; stop the old encoder
        // first so it is not leaked.
        if let Some(mut old) = self.sessions.lock().await.remove(session_id) {
            warn!(session_id, "Session already active, replacing");
            if let Some(mut process) = old.process.take() {
                process.stop_gracefully(self.config.stop_timeout()).await;
            }
            metrics::gauge!("recorder_active_sessions").decrement(1.0);
        }

        let camera = match self.selector.select_active(true).await {
            Some(camera) => camera,
            None => {
                warn!(
                    session_id,
                    serial = serial_number,
                    "No camera available, session proceeds without video"
                );
                return StartOutcome::unavailable("no camera source available");
            }
        };

        let dir = self
            .config
            .root_path()
            .join(format!("{serial_number}_{station_id}"));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(session_id, error = %e, "Failed to create session directory");
            return StartOutcome::unavailable(e.to_string());
        }

        let video_file = format!("{serial_number}_full.{}", self.config.video_ext);
        let video_path = dir.join(&video_file);

        let mut args = camera.input_args(&self.config);
        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-y".to_string(),
            video_path.to_string_lossy().into_owned(),
        ]);

        let label = format!("record-{session_id}");
        let (process, recording, error) =
            match ManagedProcess::start(&self.config.encoder_bin, &args, &label) {
                Ok(process) => (Some(process), true, None),
                Err(e) => {
                    // Continuous-capture spawn failure is non-fatal; the
                    // session carries on without video.
                    error!(session_id, error = %e, "Continuous capture failed to start");
                    (None, false, Some(e.to_string()))
                }
            };

        let session = RecordingSession {
            session_id: session_id.to_string(),
            serial_number: serial_number.to_string(),
            station_id: station_id.to_string(),
            dir,
            video_path: recording.then(|| video_path.clone()),
            process,
            camera: Some(camera.clone()),
            state: SessionState::Recording,
            current_page: None,
            page_entered_at: Instant::now(),
            clips: Vec::new(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        };
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), session);

        metrics::counter!("recorder_sessions_started_total").increment(1);
        metrics::gauge!("recorder_active_sessions").increment(1.0);
        info!(
            session_id,
            serial = serial_number,
            station = station_id,
            camera = %camera.name,
            recording,
            "Recording session started"
        );

        StartOutcome {
            success: true,
            recording,
            camera: Some(camera.name),
            video_file: recording.then_some(video_file),
            error,
        }
    }

    /// Record that the operator entered a page. Unknown sessions and
    /// sessions that are no longer recording are silently ignored.
    pub async fn mark_page_entry(&self, session_id: &str, page: u32) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            debug!(session_id, page, "Page entry for unknown session ignored");
            return;
        };
        if session.state != SessionState::Recording {
            return;
        }
        session.current_page = Some(page);
        session.page_entered_at = Instant::now();
    }

    /// Capture a short clip for the page the operator is leaving.
    ///
    /// Pages viewed for less than the configured minimum are skipped without
    /// producing a file. The capture runs concurrently with the continuous
    /// recording against the same camera, capped at the configured length;
    /// the stored clip keeps the full elapsed page time.
    pub async fn save_page_clip(&self, session_id: &str, page: u32) -> ClipOutcome {
        // Collect everything the capture needs, then release the registry
        // lock for the (multi-second) encoder run.
        let (args, file_name, path, elapsed) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return ClipOutcome::failure("unknown session");
            };
            if session.state != SessionState::Recording {
                return ClipOutcome::failure("session is not recording");
            }

            let elapsed = session.page_entered_at.elapsed().as_secs_f64();
            if elapsed < self.config.min_page_secs {
                debug!(session_id, page, elapsed, "Page too short, clip skipped");
                metrics::counter!("recorder_clips_skipped_total").increment(1);
                return ClipOutcome::skipped();
            }

            let Some(camera) = session.camera.clone() else {
                return ClipOutcome::failure("session has no camera");
            };

            let capture_secs = elapsed.min(self.config.clip_cap_secs as f64);
            let file_name = format!(
                "{}_page{}.{}",
                session.serial_number, page, self.config.clip_ext
            );
            let path = session.dir.join(&file_name);

            let mut args = camera.input_args(&self.config);
            args.extend([
                "-t".to_string(),
                format!("{capture_secs:.1}"),
                "-vf".to_string(),
                format!(
                    "fps={},scale={}:-1",
                    self.config.clip_framerate, self.config.clip_width
                ),
                "-y".to_string(),
                path.to_string_lossy().into_owned(),
            ]);

            (args, file_name, path, elapsed)
        };

        let budget = self.config.clip_cap() + CLIP_BUDGET_SLACK;
        let label = format!("clip-{session_id}-p{page}");
        match capture::run_bounded(&self.config.encoder_bin, &args, budget, &label).await {
            Ok(()) => {
                let clip = PageClip {
                    page,
                    file_name,
                    path,
                    duration_secs: elapsed,
                };
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get_mut(session_id) {
                    session.clips.push(clip.clone());
                } else {
                    // Session stopped while the clip was being captured; the
                    // file stays on disk for the upload pipeline.
                    debug!(session_id, page, "Clip finished after session stop");
                }
                metrics::counter!("recorder_clips_saved_total").increment(1);
                info!(session_id, page, duration_secs = elapsed, "Page clip saved");
                ClipOutcome {
                    success: true,
                    skipped: false,
                    clip: Some(clip),
                    error: None,
                }
            }
            Err(e) => {
                warn!(session_id, page, error = %e, "Page clip capture failed");
                ClipOutcome::failure(e.to_string())
            }
        }
    }

    /// Stop a session: graceful two-phase encoder shutdown, then the session
    /// record is removed. Returns `None` for unknown session ids.
    pub async fn stop(&self, session_id: &str) -> Option<StopOutcome> {
        let mut session = self.sessions.lock().await.remove(session_id)?;
        session.state = SessionState::Stopping;

        if let Some(mut process) = session.process.take() {
            process.stop_gracefully(self.config.stop_timeout()).await;
        }

        let duration_secs = session.started_at.elapsed().as_secs_f64();
        metrics::counter!("recorder_sessions_stopped_total").increment(1);
        metrics::gauge!("recorder_active_sessions").decrement(1.0);
        info!(
            session_id,
            duration_secs,
            clips = session.clips.len(),
            "Recording session stopped"
        );

        Some(StopOutcome {
            session_id: session.session_id,
            video_path: session.video_path,
            page_clips: session.clips,
            camera: session.camera.map(|c| c.name),
            duration_secs,
        })
    }

    /// Pure lookup of an active session; no side effects.
    pub async fn get_active(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|session| SessionSnapshot {
            session_id: session.session_id.clone(),
            serial_number: session.serial_number.clone(),
            station_id: session.station_id.clone(),
            camera: session.camera.as_ref().map(|c| c.name.clone()),
            recording: session.process.is_some(),
            current_page: session.current_page,
            clip_count: session.clips.len(),
            started_at: session.started_wall,
        })
    }

    /// Number of currently active sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraKind, CameraProbe, CameraProfile};
    use crate::config::CamerasConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StaticProbe {
        stream_up: bool,
        device_up: bool,
    }

    #[async_trait]
    impl CameraProbe for StaticProbe {
        async fn probe(&self, profile: &CameraProfile) -> bool {
            match profile.kind {
                CameraKind::Stream => self.stream_up,
                CameraKind::LocalDevice => self.device_up,
            }
        }
    }

    fn registry(root: &TempDir, encoder_bin: &str, min_page_secs: f64, stream_up: bool) -> SessionRegistry {
        let config = RecordingConfig {
            root: root.path().to_string_lossy().into_owned(),
            encoder_bin: encoder_bin.to_string(),
            min_page_secs,
            ..RecordingConfig::default()
        };
        let selector = Arc::new(CameraSelector::new(
            &CamerasConfig::default(),
            Arc::new(StaticProbe {
                stream_up,
                device_up: false,
            }),
        ));
        SessionRegistry::new(config, selector)
    }

    #[tokio::test]
    async fn test_start_fails_without_camera_and_creates_nothing() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 1.0, false);

        let outcome = registry.start("s1", "SN100", "ST7").await;
        assert!(!outcome.success);
        assert!(outcome.camera.is_none());
        assert_eq!(registry.active_count().await, 0);
        // No directory or file is created in degraded mode.
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_start_creates_session_directory() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 1.0, true);

        let outcome = registry.start("s1", "SN100", "ST7").await;
        assert!(outcome.success);
        assert!(outcome.recording);
        assert_eq!(outcome.video_file.as_deref(), Some("SN100_full.mp4"));
        assert!(root.path().join("SN100_ST7").is_dir());
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_encoder_spawn_failure_degrades_to_video_less() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "definitely-not-an-encoder", 1.0, true);

        let outcome = registry.start("s1", "SN100", "ST7").await;
        assert!(outcome.success);
        assert!(!outcome.recording);
        assert!(outcome.video_file.is_none());
        assert!(outcome.error.is_some());

        // The session is registered and stoppable.
        let stopped = registry.stop("s1").await.unwrap();
        assert!(stopped.video_path.is_none());
        assert_eq!(stopped.camera.as_deref(), Some("ip-camera"));
    }

    #[tokio::test]
    async fn test_fast_navigation_skips_clip() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 1.0, true);

        registry.start("s1", "SN100", "ST7").await;
        registry.mark_page_entry("s1", 3).await;
        let outcome = registry.save_page_clip("s1", 3).await;

        assert!(outcome.success);
        assert!(outcome.skipped);
        assert!(outcome.clip.is_none());
        // Only the continuous-video target may exist in the directory; no
        // clip file was produced.
        let snapshot = registry.get_active("s1").await.unwrap();
        assert_eq!(snapshot.clip_count, 0);
    }

    #[tokio::test]
    async fn test_clip_records_full_elapsed_duration() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 0.0, true);

        registry.start("s1", "SN100", "ST7").await;
        registry.mark_page_entry("s1", 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcome = registry.save_page_clip("s1", 2).await;

        assert!(outcome.success);
        assert!(!outcome.skipped);
        let clip = outcome.clip.unwrap();
        assert_eq!(clip.page, 2);
        assert_eq!(clip.file_name, "SN100_page2.gif");
        assert!(clip.duration_secs >= 0.03);

        let snapshot = registry.get_active("s1").await.unwrap();
        assert_eq!(snapshot.clip_count, 1);
        assert_eq!(snapshot.current_page, Some(2));
    }

    /// Stub encoder that creates its output file (the final argument), so
    /// tests can observe the artifact the way the real encoder produces it.
    fn stub_encoder(dir: &TempDir) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("stub-encoder.sh");
        std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\ntouch \"$last\"\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_clip_capture_writes_exactly_one_file_per_call() {
        let root = TempDir::new().unwrap();
        let encoder = stub_encoder(&root);
        let registry = registry(&root, &encoder, 0.0, true);

        registry.start("s1", "SN100", "ST7").await;
        let session_dir = root.path().join("SN100_ST7");
        let clip_count = |dir: &std::path::Path| {
            std::fs::read_dir(dir)
                .unwrap()
                .filter(|e| {
                    e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("gif")
                })
                .count()
        };

        registry.mark_page_entry("s1", 1).await;
        let first = registry.save_page_clip("s1", 1).await;
        assert!(first.clip.unwrap().path.exists());
        assert_eq!(clip_count(&session_dir), 1);

        registry.mark_page_entry("s1", 2).await;
        let second = registry.save_page_clip("s1", 2).await;
        assert!(second.clip.unwrap().path.exists());
        assert_eq!(clip_count(&session_dir), 2);
    }

    #[tokio::test]
    async fn test_clip_failure_leaves_session_healthy() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "false", 0.0, true);

        registry.start("s1", "SN100", "ST7").await;
        registry.mark_page_entry("s1", 1).await;
        let outcome = registry.save_page_clip("s1", 1).await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(registry.get_active("s1").await.is_some());
        assert!(registry.stop("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_stop_returns_result_bundle() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 0.0, true);

        registry.start("s1", "SN100", "ST7").await;
        registry.mark_page_entry("s1", 1).await;
        registry.save_page_clip("s1", 1).await;
        registry.mark_page_entry("s1", 2).await;
        registry.save_page_clip("s1", 2).await;

        let stopped = registry.stop("s1").await.unwrap();
        assert_eq!(stopped.page_clips.len(), 2);
        assert_eq!(stopped.page_clips[0].page, 1);
        assert_eq!(stopped.page_clips[1].page, 2);
        assert!(stopped.video_path.is_some());
        assert_eq!(stopped.camera.as_deref(), Some("ip-camera"));
        assert!(stopped.duration_secs > 0.0);

        // Stopped is terminal; the session is gone.
        assert!(registry.get_active("s1").await.is_none());
        assert!(registry.stop("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_start_outcome_wire_shape() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 1.0, true);

        let outcome = registry.start("s1", "SN100", "ST7").await;
        let value = serde_json::to_value(&outcome).unwrap();

        // The front-end keys on these fields.
        assert_eq!(value["success"], true);
        assert_eq!(value["recording"], true);
        assert_eq!(value["camera"], "ip-camera");
        assert_eq!(value["video_file"], "SN100_full.mp4");
        assert!(value["error"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root, "true", 1.0, true);

        registry.mark_page_entry("ghost", 1).await;
        let outcome = registry.save_page_clip("ghost", 1).await;
        assert!(!outcome.success);
        assert!(registry.stop("ghost").await.is_none());
        assert!(registry.get_active("ghost").await.is_none());
    }
}
