//! Postframe composites templated social-media post layouts over still or
//! video media and exports the result as a PNG or an encoded video clip.
//!
//! The pipeline: resolve a [`Template`], snapshot the user's
//! [`PostFields`], then let [`ExportSession`] drive the planner/renderer at
//! a fixed frame rate and stream frames into an encoder.
#![forbid(unsafe_code)]

pub mod driver;
pub mod encode;
pub mod error;
pub mod fields;
pub mod geom;
pub mod media;
pub mod plan;
pub mod render;
pub mod session;
pub mod template;
pub mod text;

pub use driver::{
    CancelToken, DriverState, EXPORT_FPS, FrameDriver, OfflineClock, RealtimeClock, StopReason,
};
pub use encode::{FrameSink, InMemorySink, SinkConfig, VideoCodec, select_video_codec};
pub use error::{PostframeError, PostframeResult};
pub use fields::{ExportFormat, ExportQuality, LogoPosition, PostFields, surface_size_for};
pub use geom::{AspectRatio, Rgba8, SurfaceSize};
pub use media::{LogoLoader, LogoState, MediaRecord, MediaSource, MediaStatus};
pub use plan::{FramePlan, PaintOp, plan_frame};
pub use render::{CpuRenderer, FrameImages, FrameRGBA};
pub use session::{
    ExportArtifact, ExportObserver, ExportOutcome, ExportPacing, ExportSession,
    ExportSessionOpts, ExportSnapshot, JobPhase, NullObserver,
};
pub use template::{LayoutKind, Template, resolve, templates};
