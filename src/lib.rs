//! Station recorder service.
//!
//! Records operator work sessions at assembly stations: a continuous video
//! per session plus short per-page clips, captured from whichever camera is
//! reachable (network stream preferred, local device as fallback). Finished
//! evidence is batch-uploaded to an object store and cleaned up locally.
//!
//! Module layout:
//! - [`config`]: layered configuration (files + environment)
//! - [`camera`]: camera probing, priority selection and caching
//! - [`capture`]: external encoder process lifecycle
//! - [`session`]: recording session state machine and registry
//! - [`uploader`]: evidence enumeration, upload and cleanup
//! - [`api`]: HTTP surface for the station front-end

pub mod api;
pub mod camera;
pub mod capture;
pub mod config;
pub mod session;
pub mod uploader;

pub use camera::{CameraKind, CameraProbe, CameraSelector, CameraStatus, SystemProbe};
pub use capture::{CaptureError, ManagedProcess};
pub use config::Config;
pub use session::{PageClip, SessionRegistry, StartOutcome, StopOutcome};
pub use uploader::{
    FlatFileSessionLog, ObjectStore, S3Store, SessionLog, UploadBatch, UploadPipeline,
};
