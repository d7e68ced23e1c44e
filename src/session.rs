use std::sync::Arc;

use crate::driver::{
    CancelToken, EXPORT_FPS, FrameClock, FrameDriver, OfflineClock, RealtimeClock, StopReason,
};
use crate::encode::{
    FrameSink, SinkConfig, VideoEncodeOpts, VideoEncoder, encode_png_still, select_video_codec,
};
use crate::error::{PostframeError, PostframeResult};
use crate::fields::{ExportFormat, PostFields, surface_size_for};
use crate::media::{LogoLoader, MediaSource};
use crate::plan::plan_frame;
use crate::render::{CpuRenderer, FrameImages, FrameRGBA};
use crate::template::Template;

/// Lifecycle of the one export a session may run at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Capturing,
    Encoding,
    Done,
    Failed,
}

/// Transient export state machine: idle → capturing → encoding → done,
/// any arm → failed. Terminal phases reset to idle once observed.
#[derive(Clone, Copy, Debug)]
pub struct ExportJob {
    phase: JobPhase,
    progress: f32,
}

impl ExportJob {
    fn new() -> Self {
        Self {
            phase: JobPhase::Idle,
            progress: 0.0,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, JobPhase::Capturing | JobPhase::Encoding)
    }

    /// Read the terminal phase; done/failed flip back to idle on
    /// observation so the next export can start.
    pub fn observe_outcome(&mut self) -> JobPhase {
        let seen = self.phase;
        if matches!(seen, JobPhase::Done | JobPhase::Failed) {
            self.phase = JobPhase::Idle;
            self.progress = 0.0;
        }
        seen
    }
}

/// Progress/phase events emitted while an export runs.
pub trait ExportObserver {
    fn on_progress(&mut self, _pct: f32) {}
    fn on_phase(&mut self, _phase: JobPhase) {}
}

/// Observer that discards everything.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ExportObserver for NullObserver {}

/// A finished export: self-contained bytes plus a suggested filename.
#[derive(Clone, Debug)]
pub struct ExportArtifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime: &'static str,
}

#[derive(Debug)]
pub enum ExportOutcome {
    Completed(ExportArtifact),
    /// The caller aborted; partial output was discarded.
    Cancelled,
}

/// Immutable template + fields captured at export start. The renderer sees
/// only this snapshot, never live editor state.
#[derive(Clone, Debug)]
pub struct ExportSnapshot {
    pub template: Template,
    pub fields: PostFields,
}

impl ExportSnapshot {
    pub fn new(template: &Template, fields: PostFields) -> Self {
        Self {
            template: template.clone(),
            fields,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportPacing {
    /// Frames render as fast as possible (the export default).
    #[default]
    Offline,
    /// Frames are paced against the wall clock at the capture rate.
    Realtime,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExportSessionOpts {
    pub pacing: ExportPacing,
}

/// One editor session's compositing/export engine.
///
/// Owns the renderer, the async logo slot and the single [`ExportJob`].
/// The drawing surface belongs to the active export for its whole run;
/// starting a second export while one is active is rejected.
pub struct ExportSession {
    renderer: CpuRenderer,
    logo: LogoLoader,
    job: ExportJob,
    cancel: CancelToken,
    opts: ExportSessionOpts,
}

impl ExportSession {
    pub fn new(
        font_bytes: Option<Arc<Vec<u8>>>,
        logo: LogoLoader,
        opts: ExportSessionOpts,
    ) -> Self {
        Self {
            renderer: CpuRenderer::new(font_bytes),
            logo,
            job: ExportJob::new(),
            cancel: CancelToken::new(),
            opts,
        }
    }

    pub fn job(&self) -> &ExportJob {
        &self.job
    }

    pub fn observe_outcome(&mut self) -> JobPhase {
        self.job.observe_outcome()
    }

    /// Handle for cancelling from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Best-effort cooperative cancellation of the in-flight export.
    pub fn cancel_export(&self) {
        self.cancel.cancel();
    }

    /// Render a single frame at media time `t` (seconds).
    pub fn render_frame(
        &mut self,
        snapshot: &ExportSnapshot,
        media: &mut MediaSource,
        t: f64,
    ) -> PostframeResult<FrameRGBA> {
        snapshot.fields.validate()?;
        let size = surface_size_for(&snapshot.template, snapshot.fields.quality)?;

        media.begin_playback()?;
        let logo_img = self.logo.ready();
        let media_img = media.frame_at(t)?;

        let renderer = &mut self.renderer;
        let plan = plan_frame(
            size,
            &snapshot.template,
            &snapshot.fields,
            logo_img.is_some(),
            &mut |text, font| renderer.measure(text, font),
        )?;
        renderer.render_plan(
            &plan,
            &FrameImages {
                media: &media_img,
                logo: logo_img.as_ref(),
            },
        )
    }

    /// Run a full export of `media` with the given snapshot.
    ///
    /// Emits progress events in [0, 100] and a terminal phase through
    /// `observer`. All failures land the job in `Failed` and surface as a
    /// single error; a cancelled run yields `ExportOutcome::Cancelled` with
    /// no artifact.
    #[tracing::instrument(skip_all, fields(template = %snapshot.template.id))]
    pub fn start_export(
        &mut self,
        snapshot: &ExportSnapshot,
        media: &mut MediaSource,
        observer: &mut dyn ExportObserver,
    ) -> PostframeResult<ExportOutcome> {
        if self.job.is_active() {
            return Err(PostframeError::validation(
                "an export is already running in this session",
            ));
        }

        snapshot.fields.validate()?;
        self.cancel.reset();
        self.job = ExportJob {
            phase: JobPhase::Capturing,
            progress: 0.0,
        };
        observer.on_phase(JobPhase::Capturing);

        let result = self.export_inner(snapshot, media, observer);
        match &result {
            Ok(ExportOutcome::Completed(_)) => {
                self.job.phase = JobPhase::Done;
                self.job.progress = 100.0;
                observer.on_phase(JobPhase::Done);
            }
            Ok(ExportOutcome::Cancelled) => {
                // Cancellation is not a failure: the job returns to idle
                // and never reports done.
                self.job = ExportJob::new();
                observer.on_phase(JobPhase::Idle);
            }
            Err(_) => {
                self.job.phase = JobPhase::Failed;
                self.job.progress = 0.0;
                observer.on_phase(JobPhase::Failed);
            }
        }
        result
    }

    fn export_inner(
        &mut self,
        snapshot: &ExportSnapshot,
        media: &mut MediaSource,
        observer: &mut dyn ExportObserver,
    ) -> PostframeResult<ExportOutcome> {
        let still_export =
            media.is_still() && snapshot.fields.format == ExportFormat::Image;
        if still_export {
            self.export_still(snapshot, media, observer)
        } else {
            self.export_video(snapshot, media, observer)
        }
    }

    fn export_still(
        &mut self,
        snapshot: &ExportSnapshot,
        media: &mut MediaSource,
        observer: &mut dyn ExportObserver,
    ) -> PostframeResult<ExportOutcome> {
        observer.on_progress(25.0);
        self.job.progress = 25.0;

        let frame = self.render_frame(snapshot, media, 0.0)?;

        observer.on_progress(75.0);
        self.job.progress = 75.0;

        let bytes = encode_png_still(&frame, [0, 0, 0, 255])?;
        observer.on_progress(100.0);

        let filename = still_filename(&snapshot.fields);
        Ok(ExportOutcome::Completed(ExportArtifact {
            bytes,
            filename,
            mime: "image/png",
        }))
    }

    fn export_video(
        &mut self,
        snapshot: &ExportSnapshot,
        media: &mut MediaSource,
        observer: &mut dyn ExportObserver,
    ) -> PostframeResult<ExportOutcome> {
        let size = surface_size_for(&snapshot.template, snapshot.fields.quality)?;
        let codec = select_video_codec()?;

        let tmp_path = std::env::temp_dir().join(format!(
            "postframe_export_{}_{}.{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
            codec.container_ext()
        ));
        let mut encoder = VideoEncoder::new(VideoEncodeOpts::new(codec, tmp_path));
        encoder.begin(SinkConfig {
            width: size.width,
            height: size.height,
            fps: EXPORT_FPS,
        })?;

        // The capture clock must not start before the source proves it can
        // deliver frames.
        media.begin_playback()?;
        let duration = media.duration_secs();

        let mut driver = FrameDriver::new(EXPORT_FPS, self.cancel.clone())?;
        let mut offline = OfflineClock;
        let mut realtime = RealtimeClock::new();
        let clock: &mut dyn FrameClock = match self.opts.pacing {
            ExportPacing::Offline => &mut offline,
            ExportPacing::Realtime => &mut realtime,
        };

        let renderer = &mut self.renderer;
        let logo = &mut self.logo;
        let mut captured_pct = 0.0f32;

        let stats = {
            let encoder = &mut encoder;
            let mut tick = |frame_idx: u64, t: f64| -> PostframeResult<()> {
                // Logo readiness is sampled once per tick; a late-arriving
                // logo appears on the next frame.
                let logo_img = logo.ready();
                let media_img = media.frame_at(t)?;
                let plan = plan_frame(
                    size,
                    &snapshot.template,
                    &snapshot.fields,
                    logo_img.is_some(),
                    &mut |text, font| renderer.measure(text, font),
                )?;
                let frame = renderer.render_plan(
                    &plan,
                    &FrameImages {
                        media: &media_img,
                        logo: logo_img.as_ref(),
                    },
                )?;
                encoder.push_frame(frame_idx, &frame)
            };
            let mut progress = |pct: f32| {
                captured_pct = pct;
                observer.on_progress(pct);
            };

            let run = driver.run(duration, clock, &mut tick, &mut progress);
            match run {
                Ok(stats) => stats,
                Err(e) => {
                    encoder.abort();
                    return Err(e);
                }
            }
        };
        self.job.progress = captured_pct;

        if stats.reason == StopReason::Cancelled {
            encoder.abort();
            return Ok(ExportOutcome::Cancelled);
        }

        self.job.phase = JobPhase::Encoding;
        observer.on_phase(JobPhase::Encoding);
        encoder.end()?;
        let bytes = encoder.take_bytes()?;
        observer.on_progress(100.0);

        let filename = video_filename(&snapshot.fields, media.is_still(), codec);
        Ok(ExportOutcome::Completed(ExportArtifact {
            bytes,
            filename,
            mime: codec.mime_type(),
        }))
    }
}

fn still_filename(fields: &PostFields) -> String {
    format!(
        "{}_social_post_{}.png",
        fields.username_slug(),
        fields.quality.label()
    )
}

fn video_filename(fields: &PostFields, media_is_still: bool, codec: crate::encode::VideoCodec) -> String {
    format!(
        "{}_social_{}_{}.{}",
        fields.username_slug(),
        if media_is_still { "image" } else { "video" },
        fields.quality.label(),
        codec.container_ext()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::ExportQuality;
    use crate::template::resolve;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn temp_png(name: &str) -> PathBuf {
        let img = image::RgbaImage::from_pixel(6, 4, image::Rgba([10, 120, 200, 255]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let path = std::env::temp_dir().join(format!("postframe_session_{}_{name}", std::process::id()));
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[derive(Default)]
    struct RecordingObserver {
        progress: Vec<f32>,
        phases: Vec<JobPhase>,
    }

    impl ExportObserver for RecordingObserver {
        fn on_progress(&mut self, pct: f32) {
            self.progress.push(pct);
        }
        fn on_phase(&mut self, phase: JobPhase) {
            self.phases.push(phase);
        }
    }

    #[test]
    fn job_outcome_resets_to_idle_once_observed() {
        let mut job = ExportJob::new();
        job.phase = JobPhase::Done;
        job.progress = 100.0;
        assert_eq!(job.observe_outcome(), JobPhase::Done);
        assert_eq!(job.phase(), JobPhase::Idle);
        assert_eq!(job.progress(), 0.0);
        assert_eq!(job.observe_outcome(), JobPhase::Idle);
    }

    #[test]
    fn second_export_is_rejected_while_active() {
        let mut session = ExportSession::new(None, LogoLoader::none(), ExportSessionOpts::default());
        session.job.phase = JobPhase::Capturing;

        let snapshot = ExportSnapshot::new(resolve("social"), PostFields::default());
        let path = temp_png("busy.png");
        let mut media = MediaSource::open_still(&path, 2.0).unwrap();
        let err = session
            .start_export(&snapshot, &mut media, &mut NullObserver)
            .unwrap_err();
        assert!(err.to_string().contains("already running"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn still_export_produces_png_artifact_and_done_phase() {
        let mut session = ExportSession::new(None, LogoLoader::none(), ExportSessionOpts::default());
        // All text fields empty: a fontless session can still export.
        let fields = PostFields {
            quality: ExportQuality::Hd720,
            ..PostFields::default()
        };
        let snapshot = ExportSnapshot::new(resolve("social"), fields);
        let path = temp_png("still.png");
        let mut media = MediaSource::open_still(&path, 2.0).unwrap();

        let mut observer = RecordingObserver::default();
        let outcome = session
            .start_export(&snapshot, &mut media, &mut observer)
            .unwrap();

        let ExportOutcome::Completed(artifact) = outcome else {
            panic!("expected completed export");
        };
        assert!(artifact.filename.ends_with("_social_post_720p.png"));
        assert_eq!(artifact.mime, "image/png");
        let decoded = image::load_from_memory(&artifact.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (720, 864));

        assert_eq!(observer.progress, vec![25.0, 75.0, 100.0]);
        assert_eq!(
            observer.phases,
            vec![JobPhase::Capturing, JobPhase::Done]
        );
        assert_eq!(session.job().phase(), JobPhase::Done);
        assert_eq!(session.observe_outcome(), JobPhase::Done);
        assert_eq!(session.job().phase(), JobPhase::Idle);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn still_export_failure_lands_in_failed_phase() {
        let mut session = ExportSession::new(None, LogoLoader::none(), ExportSessionOpts::default());
        // Text in the fields with no font bytes loaded: the render fails and
        // the job must land in Failed, not panic.
        let fields = PostFields {
            caption: "needs a font".to_string(),
            ..PostFields::default()
        };
        let snapshot = ExportSnapshot::new(resolve("social"), fields);
        let path = temp_png("fail.png");
        let mut media = MediaSource::open_still(&path, 2.0).unwrap();

        let mut observer = RecordingObserver::default();
        let res = session.start_export(&snapshot, &mut media, &mut observer);
        assert!(res.is_err());
        assert_eq!(session.job().phase(), JobPhase::Failed);
        assert_eq!(session.observe_outcome(), JobPhase::Failed);
        assert_eq!(session.job().phase(), JobPhase::Idle);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn filenames_compose_from_username_and_quality() {
        let fields = PostFields {
            username: "@johndoe".to_string(),
            quality: ExportQuality::Hd1080,
            ..PostFields::default()
        };
        assert_eq!(still_filename(&fields), "johndoe_social_post_1080p.png");
        assert_eq!(
            video_filename(&fields, false, crate::encode::VideoCodec::Vp9),
            "johndoe_social_video_1080p.webm"
        );
        assert_eq!(
            video_filename(&fields, true, crate::encode::VideoCodec::H264),
            "johndoe_social_image_1080p.mp4"
        );
    }

    #[test]
    fn render_frame_is_deterministic_for_still_media() {
        let mut session = ExportSession::new(None, LogoLoader::none(), ExportSessionOpts::default());
        let snapshot = ExportSnapshot::new(resolve("podcast"), PostFields::default());
        let path = temp_png("det.png");
        let mut media = MediaSource::open_still(&path, 2.0).unwrap();

        let a = session.render_frame(&snapshot, &mut media, 0.0).unwrap();
        let b = session.render_frame(&snapshot, &mut media, 0.0).unwrap();
        assert_eq!(a.data, b.data);

        let _ = std::fs::remove_file(&path);
    }
}
