use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, mpsc};

use crate::error::{PostframeError, PostframeResult};

/// Decoded raster image in premultiplied RGBA8 form.
#[derive(Clone, Debug)]
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    pub rgba8_premul: Arc<Vec<u8>>,
}

pub fn decode_image(bytes: &[u8]) -> PostframeResult<PreparedImage> {
    let dyn_img = image::load_from_memory(bytes)
        .map_err(|e| PostframeError::media_load(format!("decode image: {e}")))?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut rgba8_premul = rgba.into_raw();
    premultiply_rgba8_in_place(&mut rgba8_premul);

    Ok(PreparedImage {
        width,
        height,
        rgba8_premul: Arc::new(rgba8_premul),
    })
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

/// What the surrounding application knows about an uploaded media item.
///
/// This is the narrow lookup contract with the media store; the engine only
/// consumes completed records.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub status: MediaStatus,
    pub path: PathBuf,
    pub is_image: bool,
    /// Display duration configured for still images, seconds.
    pub duration_secs: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct VideoSourceInfo {
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub duration_sec: f64,
}

impl VideoSourceInfo {
    pub fn source_fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }
}

pub fn probe_video(source_path: &Path) -> PostframeResult<VideoSourceInfo> {
    #[derive(serde::Deserialize)]
    struct Stream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        r_frame_rate: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct Fmt {
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct Probe {
        streams: Vec<Stream>,
        format: Option<Fmt>,
    }

    let out = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json"])
        .args(["-show_streams", "-show_format"])
        .arg(source_path)
        .output()
        .map_err(|e| PostframeError::media_load(format!("could not run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(PostframeError::media_load(format!(
            "ffprobe on '{}': {}",
            source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let probe: Probe = serde_json::from_slice(&out.stdout)
        .map_err(|e| PostframeError::media_load(format!("unparseable ffprobe output: {e}")))?;
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| PostframeError::media_load("source has no video stream"))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            return Err(PostframeError::media_load(
                "ffprobe reported no frame dimensions",
            ));
        }
    };
    let (fps_num, fps_den) = parse_ff_ratio(stream.r_frame_rate.as_deref().unwrap_or("0/1"))
        .ok_or_else(|| PostframeError::media_load("invalid video r_frame_rate"))?;
    let duration_sec = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoSourceInfo {
        source_path: source_path.to_path_buf(),
        width,
        height,
        fps_num,
        fps_den,
        duration_sec,
    })
}

pub fn decode_video_frame_rgba8(
    source: &VideoSourceInfo,
    source_time_sec: f64,
) -> PostframeResult<Vec<u8>> {
    let mut frames = decode_video_frames_rgba8(source, source_time_sec, 1)?;
    frames.pop().ok_or_else(|| {
        PostframeError::media_load(format!(
            "ffmpeg returned no video frames for '{}'",
            source.source_path.display()
        ))
    })
}

pub(crate) fn decode_video_frames_rgba8(
    source: &VideoSourceInfo,
    start_time_sec: f64,
    frame_count: u32,
) -> PostframeResult<Vec<Vec<u8>>> {
    if frame_count == 0 {
        return Ok(Vec::new());
    }

    let out = Command::new("ffmpeg")
        .args(["-v", "error", "-ss", &format!("{start_time_sec:.9}")])
        .arg("-i")
        .arg(&source.source_path)
        .args(["-frames:v", &frame_count.to_string()])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
        .output()
        .map_err(|e| PostframeError::media_load(format!("could not run ffmpeg: {e}")))?;
    if !out.status.success() {
        return Err(PostframeError::media_load(format!(
            "ffmpeg decode from '{}': {}",
            source.source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let frame_len = source.width as usize * source.height as usize * 4;
    if frame_len == 0 {
        return Err(PostframeError::media_load(
            "source reports zero-sized frames",
        ));
    }
    if out.stdout.len() < frame_len || !out.stdout.len().is_multiple_of(frame_len) {
        return Err(PostframeError::media_load(format!(
            "ffmpeg produced {} bytes, not a whole number of {frame_len}-byte frames",
            out.stdout.len()
        )));
    }

    let available = (out.stdout.len() / frame_len).min(frame_count as usize);
    Ok(out
        .stdout
        .chunks_exact(frame_len)
        .take(available)
        .map(<[u8]>::to_vec)
        .collect())
}

fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('/');
    let a = parts.next()?.parse::<u32>().ok()?;
    let b = parts.next()?.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}

fn env_tunable<T: std::str::FromStr + PartialOrd + Copy>(name: &str, floor: T, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .filter(|&n| n >= floor)
        .unwrap_or(default)
}

/// Caching frame decoder over the ffmpeg batch decode path.
///
/// Frames are keyed by source frame index; a miss decodes a whole batch
/// starting at the batch-aligned index, so a forward-playing export pays
/// one ffmpeg spawn per batch rather than per frame.
struct VideoFrameDecoder {
    info: Arc<VideoSourceInfo>,
    cache: HashMap<u64, CachedFrame>,
    clock: u64,
    capacity: usize,
    batch: u32,
}

struct CachedFrame {
    image: Arc<PreparedImage>,
    last_used: u64,
}

impl VideoFrameDecoder {
    fn new(info: Arc<VideoSourceInfo>) -> Self {
        Self {
            info,
            cache: HashMap::new(),
            clock: 0,
            capacity: env_tunable("POSTFRAME_VIDEO_CACHE_CAPACITY", 1, 64),
            batch: env_tunable("POSTFRAME_VIDEO_PREFETCH_FRAMES", 1, 12),
        }
    }

    fn effective_fps(&self) -> f64 {
        let fps = self.info.source_fps();
        if fps.is_finite() && fps > 0.0 { fps } else { 30.0 }
    }

    fn decode_at(&mut self, source_time_s: f64) -> PostframeResult<Arc<PreparedImage>> {
        let idx = (source_time_s.max(0.0) * self.effective_fps()).floor() as u64;
        if let Some(img) = self.lookup(idx) {
            return Ok(img);
        }

        let batch_start = idx - idx % u64::from(self.batch);
        if self.fill_batch(batch_start).is_ok()
            && let Some(img) = self.lookup(idx)
        {
            return Ok(img);
        }

        // Sparse request the batch missed (seek near EOF, odd timestamps):
        // decode the single frame at the exact time instead.
        let rgba = decode_video_frame_rgba8(&self.info, source_time_s)?;
        let image = self.wrap_rgba(rgba);
        self.store(idx, image.clone());
        Ok(image)
    }

    fn lookup(&mut self, idx: u64) -> Option<Arc<PreparedImage>> {
        self.clock += 1;
        let slot = self.cache.get_mut(&idx)?;
        slot.last_used = self.clock;
        Some(slot.image.clone())
    }

    fn fill_batch(&mut self, batch_start: u64) -> PostframeResult<()> {
        let start_time_s = batch_start as f64 / self.effective_fps();
        let frames = decode_video_frames_rgba8(&self.info, start_time_s, self.batch)?;
        for (offset, rgba) in frames.into_iter().enumerate() {
            let idx = batch_start + offset as u64;
            if !self.cache.contains_key(&idx) {
                let image = self.wrap_rgba(rgba);
                self.store(idx, image);
            }
        }
        Ok(())
    }

    fn wrap_rgba(&self, rgba: Vec<u8>) -> Arc<PreparedImage> {
        Arc::new(PreparedImage {
            width: self.info.width,
            height: self.info.height,
            rgba8_premul: Arc::new(rgba),
        })
    }

    fn store(&mut self, idx: u64, image: Arc<PreparedImage>) {
        self.clock += 1;
        self.cache.insert(
            idx,
            CachedFrame {
                image,
                last_used: self.clock,
            },
        );
        while self.cache.len() > self.capacity {
            let Some(oldest) = self
                .cache
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| *k)
            else {
                break;
            };
            self.cache.remove(&oldest);
        }
    }
}

/// The editor session's media: a still image or a seekable video.
pub enum MediaSource {
    Still(StillSource),
    Video(VideoSource),
}

pub struct StillSource {
    image: Arc<PreparedImage>,
    duration_secs: f64,
}

pub struct VideoSource {
    info: Arc<VideoSourceInfo>,
    decoder: VideoFrameDecoder,
    playback_started: bool,
}

impl MediaSource {
    /// Open a completed media record, choosing the still or video path from
    /// its is-image flag. `still_duration_secs` is the fallback display
    /// duration when the record carries none; stills only.
    pub fn from_record(record: &MediaRecord, still_duration_secs: f64) -> PostframeResult<Self> {
        match record.status {
            MediaStatus::Completed => {}
            MediaStatus::Processing => {
                return Err(PostframeError::media_load(format!(
                    "media '{}' is still processing",
                    record.id
                )));
            }
            MediaStatus::Failed => {
                return Err(PostframeError::media_load(format!(
                    "media '{}' failed to process",
                    record.id
                )));
            }
        }

        if record.is_image {
            let duration = record.duration_secs.unwrap_or(still_duration_secs);
            Self::open_still(&record.path, duration)
        } else {
            Self::open_video(&record.path)
        }
    }

    pub fn open_still(path: &Path, duration_secs: f64) -> PostframeResult<Self> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(PostframeError::validation(
                "still image duration must be finite and > 0",
            ));
        }
        let bytes = std::fs::read(path).map_err(|e| {
            PostframeError::media_load(format!("read image '{}': {e}", path.display()))
        })?;
        let image = Arc::new(decode_image(&bytes)?);
        Ok(Self::Still(StillSource {
            image,
            duration_secs,
        }))
    }

    pub fn open_video(path: &Path) -> PostframeResult<Self> {
        let info = Arc::new(probe_video(path)?);
        if info.duration_sec <= 0.0 {
            return Err(PostframeError::media_load(format!(
                "video '{}' reports no duration",
                path.display()
            )));
        }
        let decoder = VideoFrameDecoder::new(info.clone());
        Ok(Self::Video(VideoSource {
            info,
            decoder,
            playback_started: false,
        }))
    }

    pub fn is_still(&self) -> bool {
        matches!(self, Self::Still(_))
    }

    pub fn natural_size(&self) -> (u32, u32) {
        match self {
            Self::Still(s) => (s.image.width, s.image.height),
            Self::Video(v) => (v.info.width, v.info.height),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        match self {
            Self::Still(s) => s.duration_secs,
            Self::Video(v) => v.info.duration_sec,
        }
    }

    /// Confirm the source can actually deliver frames before the export
    /// clock starts.
    ///
    /// Videos prime the decoder at t=0; a seek that produces nothing is
    /// retried once before the failure is surfaced.
    pub fn begin_playback(&mut self) -> PostframeResult<()> {
        match self {
            Self::Still(_) => Ok(()),
            Self::Video(v) => {
                if v.playback_started {
                    return Ok(());
                }
                if v.decoder.decode_at(0.0).is_err() {
                    tracing::debug!("initial seek produced no frame, retrying once");
                    v.decoder.decode_at(0.0)?;
                }
                v.playback_started = true;
                Ok(())
            }
        }
    }

    /// The frame visible at `t` seconds into playback.
    pub fn frame_at(&mut self, t: f64) -> PostframeResult<Arc<PreparedImage>> {
        match self {
            Self::Still(s) => Ok(s.image.clone()),
            Self::Video(v) => {
                if !v.playback_started {
                    return Err(PostframeError::media_load(
                        "video playback was not started before frame_at",
                    ));
                }
                // Clamp into the source range so the final tick never seeks
                // past the last frame.
                let t = t.clamp(0.0, (v.info.duration_sec - 1e-3).max(0.0));
                v.decoder.decode_at(t)
            }
        }
    }
}

/// Asynchronous logo slot.
///
/// The logo decodes on a background thread; the render loop polls at the
/// top of each tick and paints the fallback avatar until the image lands.
/// A failed load degrades to the fallback permanently instead of failing
/// the render.
pub struct LogoLoader {
    rx: Option<mpsc::Receiver<PostframeResult<PreparedImage>>>,
    state: LogoState,
}

#[derive(Clone, Debug, Default)]
pub enum LogoState {
    #[default]
    Absent,
    Pending,
    Ready(Arc<PreparedImage>),
    Failed,
}

impl LogoLoader {
    /// A loader with no logo at all; always reports `Absent`.
    pub fn none() -> Self {
        Self {
            rx: None,
            state: LogoState::Absent,
        }
    }

    /// Start decoding the image at `path` on a background thread.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = std::fs::read(&path)
                .map_err(|e| {
                    PostframeError::media_load(format!("read logo '{}': {e}", path.display()))
                })
                .and_then(|bytes| decode_image(&bytes));
            let _ = tx.send(result);
        });
        Self {
            rx: Some(rx),
            state: LogoState::Pending,
        }
    }

    /// Non-blocking check; once a terminal state is reached it sticks.
    pub fn poll(&mut self) -> &LogoState {
        if matches!(self.state, LogoState::Pending)
            && let Some(rx) = &self.rx
        {
            match rx.try_recv() {
                Ok(Ok(img)) => self.state = LogoState::Ready(Arc::new(img)),
                Ok(Err(e)) => {
                    tracing::debug!("logo load failed, using fallback avatar: {e}");
                    self.state = LogoState::Failed;
                }
                Err(mpsc::TryRecvError::Empty) => {}
                Err(mpsc::TryRecvError::Disconnected) => self.state = LogoState::Failed,
            }
        }
        &self.state
    }

    /// The decoded logo, if it has arrived.
    pub fn ready(&mut self) -> Option<Arc<PreparedImage>> {
        match self.poll() {
            LogoState::Ready(img) => Some(img.clone()),
            _ => None,
        }
    }
}
