//! Camera discovery and failover.
//!
//! Two camera profiles are probed: a network-stream camera and a local
//! capture device. The stream camera always wins when both are reachable.
//! Selections are cached for a bounded interval so concurrent sessions do
//! not hammer the network or the device node.

use crate::config::{CamerasConfig, DeviceCameraConfig, RecordingConfig, StreamCameraConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Kind of camera source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraKind {
    Stream,
    LocalDevice,
}

/// Connection target for a camera profile.
#[derive(Debug, Clone)]
pub enum CameraSource {
    Stream { host: String, port: u16, path: String },
    Device { path: PathBuf },
}

/// An immutable camera profile, defined at process start.
#[derive(Debug, Clone)]
pub struct CameraProfile {
    pub name: String,
    pub kind: CameraKind,
    pub source: CameraSource,
    pub probe_timeout: Duration,
}

impl CameraProfile {
    pub fn stream(cfg: &StreamCameraConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            kind: CameraKind::Stream,
            source: CameraSource::Stream {
                host: cfg.host.clone(),
                port: cfg.port,
                path: cfg.path.clone(),
            },
            probe_timeout: cfg.probe_timeout(),
        }
    }

    pub fn device(cfg: &DeviceCameraConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            kind: CameraKind::LocalDevice,
            source: CameraSource::Device {
                path: PathBuf::from(&cfg.path),
            },
            probe_timeout: cfg.probe_timeout(),
        }
    }

    /// Encoder input arguments for this source.
    ///
    /// Both the continuous recorder and an in-flight page-clip capture read
    /// the same source concurrently; the camera must allow at least two
    /// simultaneous consumers.
    pub fn input_args(&self, recording: &RecordingConfig) -> Vec<String> {
        match &self.source {
            CameraSource::Stream { host, port, path } => vec![
                "-rtsp_transport".to_string(),
                "tcp".to_string(),
                "-i".to_string(),
                format!("rtsp://{host}:{port}{path}"),
            ],
            CameraSource::Device { path } => vec![
                "-f".to_string(),
                "v4l2".to_string(),
                "-framerate".to_string(),
                recording.framerate.to_string(),
                "-video_size".to_string(),
                recording.resolution.clone(),
                "-i".to_string(),
                path.to_string_lossy().into_owned(),
            ],
        }
    }
}

/// Bounded-timeout availability check against a camera source.
///
/// Probing is idempotent and safe to call concurrently from multiple
/// sessions.
#[async_trait]
pub trait CameraProbe: Send + Sync {
    async fn probe(&self, profile: &CameraProfile) -> bool;
}

/// Production probe: TCP connect for stream sources, path existence plus a
/// bounded metadata query for device sources.
pub struct SystemProbe {
    probe_bin: String,
}

impl SystemProbe {
    pub fn new(probe_bin: impl Into<String>) -> Self {
        Self {
            probe_bin: probe_bin.into(),
        }
    }

    /// Query the device with the media probe binary. The device counts as
    /// available on a clean exit, or when the query produced any output
    /// before the timeout.
    async fn query_device(&self, path: &Path, timeout: Duration) -> bool {
        let mut child = match Command::new(&self.probe_bin)
            .args(["-v", "error", "-show_entries", "stream=width,height", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(probe_bin = %self.probe_bin, error = %e, "Device metadata query failed to spawn");
                return false;
            }
        };

        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf).await;
            }
            buf
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let output = reader.await.unwrap_or_default();
                status.success() || !output.is_empty()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed waiting for device metadata query");
                false
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                // Output that arrived before the deadline still counts.
                let output = reader.await.unwrap_or_default();
                !output.is_empty()
            }
        }
    }
}

#[async_trait]
impl CameraProbe for SystemProbe {
    async fn probe(&self, profile: &CameraProfile) -> bool {
        match &profile.source {
            CameraSource::Stream { host, port, .. } => {
                match tokio::time::timeout(
                    profile.probe_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        debug!(camera = %profile.name, error = %e, "Stream probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(camera = %profile.name, "Stream probe timed out");
                        false
                    }
                }
            }
            CameraSource::Device { path } => {
                if !path.exists() {
                    debug!(camera = %profile.name, path = %path.display(), "Device node missing");
                    return false;
                }
                self.query_device(path, profile.probe_timeout).await
            }
        }
    }
}

/// Diagnostic snapshot of both profiles, from fresh probes.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub available: bool,
    pub active_kind: Option<CameraKind>,
    pub stream_available: bool,
    pub device_available: bool,
}

#[derive(Default)]
struct SelectionCache {
    profile: Option<CameraProfile>,
    selected_at: Option<Instant>,
}

/// Probes the camera profiles in priority order and caches the winner.
pub struct CameraSelector {
    stream: CameraProfile,
    device: CameraProfile,
    ttl: Duration,
    probe: Arc<dyn CameraProbe>,
    cache: RwLock<SelectionCache>,
}

impl CameraSelector {
    pub fn new(cfg: &CamerasConfig, probe: Arc<dyn CameraProbe>) -> Self {
        Self {
            stream: CameraProfile::stream(&cfg.stream),
            device: CameraProfile::device(&cfg.device),
            ttl: cfg.selection_ttl(),
            probe,
            cache: RwLock::new(SelectionCache::default()),
        }
    }

    /// Pick the active camera. Within the TTL window the cached selection is
    /// returned unchanged (including a cached "none"); otherwise the stream
    /// camera is probed first and wins whenever it is reachable.
    pub async fn select_active(&self, force_refresh: bool) -> Option<CameraProfile> {
        if !force_refresh {
            let cache = self.cache.read();
            if let Some(at) = cache.selected_at {
                if at.elapsed() < self.ttl {
                    return cache.profile.clone();
                }
            }
        }

        let selected = if self.probe.probe(&self.stream).await {
            Some(self.stream.clone())
        } else if self.probe.probe(&self.device).await {
            Some(self.device.clone())
        } else {
            None
        };

        match &selected {
            Some(profile) => {
                info!(camera = %profile.name, kind = ?profile.kind, "Active camera selected")
            }
            None => warn!("No camera source reachable"),
        }

        let mut cache = self.cache.write();
        cache.profile = selected.clone();
        cache.selected_at = Some(Instant::now());
        selected
    }

    /// Fresh, cache-bypassing probe of both profiles for diagnostics. Does
    /// not mutate the cached selection.
    pub async fn status(&self) -> CameraStatus {
        let stream_available = self.probe.probe(&self.stream).await;
        let device_available = self.probe.probe(&self.device).await;
        let active_kind = if stream_available {
            Some(CameraKind::Stream)
        } else if device_available {
            Some(CameraKind::LocalDevice)
        } else {
            None
        };
        CameraStatus {
            available: active_kind.is_some(),
            active_kind,
            stream_available,
            device_available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProbe {
        stream_up: AtomicBool,
        device_up: AtomicBool,
        probes: AtomicUsize,
    }

    impl FakeProbe {
        fn new(stream_up: bool, device_up: bool) -> Arc<Self> {
            Arc::new(Self {
                stream_up: AtomicBool::new(stream_up),
                device_up: AtomicBool::new(device_up),
                probes: AtomicUsize::new(0),
            })
        }

        fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CameraProbe for FakeProbe {
        async fn probe(&self, profile: &CameraProfile) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match profile.kind {
                CameraKind::Stream => self.stream_up.load(Ordering::SeqCst),
                CameraKind::LocalDevice => self.device_up.load(Ordering::SeqCst),
            }
        }
    }

    fn selector(probe: Arc<FakeProbe>) -> CameraSelector {
        CameraSelector::new(&CamerasConfig::default(), probe)
    }

    #[tokio::test]
    async fn test_stream_wins_when_both_available() {
        let probe = FakeProbe::new(true, true);
        let selected = selector(probe).select_active(true).await.unwrap();
        assert_eq!(selected.kind, CameraKind::Stream);
    }

    #[tokio::test]
    async fn test_device_selected_when_stream_down() {
        let probe = FakeProbe::new(false, true);
        let selected = selector(probe).select_active(true).await.unwrap();
        assert_eq!(selected.kind, CameraKind::LocalDevice);
    }

    #[tokio::test]
    async fn test_stream_selected_when_device_down() {
        let probe = FakeProbe::new(true, false);
        let selected = selector(probe).select_active(true).await.unwrap();
        assert_eq!(selected.kind, CameraKind::Stream);
    }

    #[tokio::test]
    async fn test_none_when_both_down() {
        let probe = FakeProbe::new(false, false);
        assert!(selector(probe).select_active(true).await.is_none());
    }

    #[tokio::test]
    async fn test_selection_cached_within_ttl() {
        let probe = FakeProbe::new(true, true);
        let selector = selector(probe.clone());

        let first = selector.select_active(false).await.unwrap();
        let probes_after_first = probe.probe_count();
        let second = selector.select_active(false).await.unwrap();

        assert_eq!(first.name, second.name);
        // No re-probe observable within the TTL window.
        assert_eq!(probe.probe_count(), probes_after_first);
    }

    #[tokio::test]
    async fn test_unavailable_verdict_is_cached() {
        let probe = FakeProbe::new(false, false);
        let selector = selector(probe.clone());

        assert!(selector.select_active(false).await.is_none());
        let probes_after_first = probe.probe_count();
        assert!(selector.select_active(false).await.is_none());
        assert_eq!(probe.probe_count(), probes_after_first);
    }

    #[tokio::test]
    async fn test_force_refresh_reprobes() {
        let probe = FakeProbe::new(true, false);
        let selector = selector(probe.clone());

        selector.select_active(false).await;
        let probes_after_first = probe.probe_count();

        // Stream drops; the forced refresh must observe it.
        probe.stream_up.store(false, Ordering::SeqCst);
        probe.device_up.store(true, Ordering::SeqCst);
        let selected = selector.select_active(true).await.unwrap();

        assert_eq!(selected.kind, CameraKind::LocalDevice);
        assert!(probe.probe_count() > probes_after_first);
    }

    #[tokio::test]
    async fn test_status_does_not_mutate_cache() {
        let probe = FakeProbe::new(true, false);
        let selector = selector(probe.clone());

        selector.select_active(true).await.unwrap();

        probe.stream_up.store(false, Ordering::SeqCst);
        let status = selector.status().await;
        assert!(!status.stream_available);
        assert!(!status.available);

        // Cached selection still answers within the TTL.
        let cached = selector.select_active(false).await.unwrap();
        assert_eq!(cached.kind, CameraKind::Stream);
    }

    #[test]
    fn test_stream_input_args_force_tcp() {
        let profile = CameraProfile::stream(&StreamCameraConfig::default());
        let args = profile.input_args(&RecordingConfig::default());
        assert_eq!(args[0], "-rtsp_transport");
        assert_eq!(args[1], "tcp");
        assert!(args.last().unwrap().starts_with("rtsp://"));
    }

    #[test]
    fn test_device_input_args_fix_rate_and_size() {
        let profile = CameraProfile::device(&DeviceCameraConfig::default());
        let args = profile.input_args(&RecordingConfig::default());
        assert!(args.contains(&"v4l2".to_string()));
        assert!(args.contains(&"30".to_string()));
        assert!(args.contains(&"1280x720".to_string()));
        assert_eq!(args.last().unwrap(), "/dev/video0");
    }
}
