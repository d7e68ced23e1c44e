use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::error::{PostframeError, PostframeResult};
use crate::render::FrameRGBA;

/// Configuration handed to a sink before the first frame.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Consumer of rendered frames in strict timeline order.
///
/// `push_frame` is called with strictly increasing frame indices; sinks
/// must neither reorder nor drop accepted frames.
pub trait FrameSink {
    fn begin(&mut self, cfg: SinkConfig) -> PostframeResult<()>;
    fn push_frame(&mut self, idx: u64, frame: &FrameRGBA) -> PostframeResult<()>;
    fn end(&mut self) -> PostframeResult<()>;
}

/// In-memory sink for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemorySink {
    cfg: Option<SinkConfig>,
    pub frames: Vec<(u64, FrameRGBA)>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<SinkConfig> {
        self.cfg.clone()
    }
}

impl FrameSink for InMemorySink {
    fn begin(&mut self, cfg: SinkConfig) -> PostframeResult<()> {
        self.cfg = Some(cfg);
        self.frames.clear();
        Ok(())
    }

    fn push_frame(&mut self, idx: u64, frame: &FrameRGBA) -> PostframeResult<()> {
        self.frames.push((idx, frame.clone()));
        Ok(())
    }

    fn end(&mut self) -> PostframeResult<()> {
        Ok(())
    }
}

/// Streamed video codecs, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    Vp9,
    Vp8,
    H264,
}

impl VideoCodec {
    /// Preference ladder: VP9 first, falling back through VP8 to H.264.
    pub const PREFERENCE: [VideoCodec; 3] = [VideoCodec::Vp9, VideoCodec::Vp8, VideoCodec::H264];

    pub fn encoder_name(self) -> &'static str {
        match self {
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Vp8 => "libvpx",
            VideoCodec::H264 => "libx264",
        }
    }

    /// Container extension; the container follows the codec.
    pub fn container_ext(self) -> &'static str {
        match self {
            VideoCodec::Vp9 | VideoCodec::Vp8 => "webm",
            VideoCodec::H264 => "mp4",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::Vp9 | VideoCodec::Vp8 => "video/webm",
            VideoCodec::H264 => "video/mp4",
        }
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Pick the best supported codec from the preference ladder by probing the
/// runtime's encoder list.
pub fn select_video_codec() -> PostframeResult<VideoCodec> {
    if !is_ffmpeg_on_path() {
        return Err(PostframeError::codec(
            "ffmpeg is required for video export, but was not found on PATH",
        ));
    }

    let out = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .stderr(Stdio::null())
        .output()
        .map_err(|e| PostframeError::codec(format!("failed to probe ffmpeg encoders: {e}")))?;
    let listing = String::from_utf8_lossy(&out.stdout);

    let chosen = VideoCodec::PREFERENCE
        .iter()
        .copied()
        .find(|c| listing.contains(c.encoder_name()))
        .ok_or_else(|| {
            PostframeError::codec("no supported video encoder (tried libvpx-vp9, libvpx, libx264)")
        })?;
    tracing::debug!(codec = chosen.encoder_name(), "selected export codec");
    Ok(chosen)
}

pub fn ensure_parent_dir(path: &Path) -> PostframeResult<()> {
    use anyhow::Context as _;
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create output directory '{}'", parent.display()))?;
    Ok(())
}

#[derive(Clone, Debug)]
pub struct VideoEncodeOpts {
    pub codec: VideoCodec,
    pub out_path: PathBuf,
    pub overwrite: bool,
    /// Background used to flatten alpha (straight RGBA8).
    pub bg_rgba: [u8; 4],
}

impl VideoEncodeOpts {
    pub fn new(codec: VideoCodec, out_path: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            out_path: out_path.into(),
            overwrite: true,
            bg_rgba: [0, 0, 0, 255],
        }
    }
}

/// Streams raw RGBA frames into a spawned `ffmpeg` and collects the
/// finished container.
///
/// The system binary is used deliberately; linking FFmpeg would drag native
/// dev headers into the build.
pub struct VideoEncoder {
    opts: VideoEncodeOpts,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    scratch: Vec<u8>,
    cfg: Option<SinkConfig>,
    next_idx: u64,
    finished: Option<Vec<u8>>,
}

impl VideoEncoder {
    pub fn new(opts: VideoEncodeOpts) -> Self {
        Self {
            opts,
            child: None,
            stdin: None,
            scratch: Vec::new(),
            cfg: None,
            next_idx: 0,
            finished: None,
        }
    }

    /// The finished container bytes, once `end` has succeeded.
    pub fn take_bytes(&mut self) -> PostframeResult<Vec<u8>> {
        self.finished
            .take()
            .ok_or_else(|| PostframeError::encode("encoder has not finished successfully"))
    }

    /// Kill the encoder and discard partial output. Export is
    /// all-or-nothing; a cancelled run leaves nothing behind.
    pub fn abort(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.opts.out_path);
        self.finished = None;
    }

    fn codec_args(codec: VideoCodec) -> &'static [&'static str] {
        match codec {
            VideoCodec::Vp9 => &["-c:v", "libvpx-vp9", "-pix_fmt", "yuv420p", "-b:v", "0", "-crf", "32"],
            VideoCodec::Vp8 => &["-c:v", "libvpx", "-pix_fmt", "yuv420p", "-b:v", "2M"],
            VideoCodec::H264 => &["-c:v", "libx264", "-pix_fmt", "yuv420p", "-movflags", "+faststart"],
        }
    }
}

impl FrameSink for VideoEncoder {
    fn begin(&mut self, cfg: SinkConfig) -> PostframeResult<()> {
        if cfg.width == 0 || cfg.height == 0 {
            return Err(PostframeError::validation(
                "encode width/height must be non-zero",
            ));
        }
        if cfg.fps == 0 {
            return Err(PostframeError::validation("encode fps must be non-zero"));
        }
        if !cfg.width.is_multiple_of(2) || !cfg.height.is_multiple_of(2) {
            // yuv420p output needs even dimensions.
            return Err(PostframeError::validation(
                "encode width/height must be even (required for yuv420p output)",
            ));
        }

        ensure_parent_dir(&self.opts.out_path)?;
        if !self.opts.overwrite && self.opts.out_path.exists() {
            return Err(PostframeError::validation(format!(
                "output file '{}' already exists",
                self.opts.out_path.display()
            )));
        }

        if !is_ffmpeg_on_path() {
            return Err(PostframeError::codec(
                "ffmpeg is required for video export, but was not found on PATH",
            ));
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.arg(if self.opts.overwrite { "-y" } else { "-n" });
        cmd.args(["-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .args(["-s", &format!("{}x{}", cfg.width, cfg.height)])
            .args(["-r", &cfg.fps.to_string()])
            .args(["-i", "pipe:0", "-an"])
            .args(Self::codec_args(self.opts.codec))
            .arg(&self.opts.out_path);

        let mut child = cmd
            .spawn()
            .map_err(|e| PostframeError::encode(format!("could not spawn ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PostframeError::encode("ffmpeg child has no stdin pipe"))?;

        self.scratch = vec![0u8; (cfg.width * cfg.height * 4) as usize];
        self.cfg = Some(cfg);
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.next_idx = 0;
        self.finished = None;
        Ok(())
    }

    fn push_frame(&mut self, idx: u64, frame: &FrameRGBA) -> PostframeResult<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| PostframeError::encode("push_frame before begin"))?;

        if idx != self.next_idx {
            return Err(PostframeError::encode(format!(
                "frames must arrive in order: expected {}, got {idx}",
                self.next_idx
            )));
        }
        if frame.width != cfg.width || frame.height != cfg.height {
            return Err(PostframeError::validation(format!(
                "sink expected {}x{} frames, got {}x{}",
                cfg.width, cfg.height, frame.width, frame.height
            )));
        }
        if frame.data.len() != self.scratch.len() {
            return Err(PostframeError::validation(
                "frame byte length does not match its dimensions",
            ));
        }

        flatten_to_opaque_rgba8(
            &mut self.scratch,
            &frame.data,
            frame.premultiplied,
            self.opts.bg_rgba,
        )?;

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(PostframeError::encode("encoder is already finalized"));
        };

        use std::io::Write as _;
        stdin
            .write_all(&self.scratch)
            .map_err(|e| PostframeError::encode(format!("write frame to ffmpeg stdin: {e}")))?;

        self.next_idx += 1;
        Ok(())
    }

    fn end(&mut self) -> PostframeResult<()> {
        drop(self.stdin.take());

        let child = self
            .child
            .take()
            .ok_or_else(|| PostframeError::encode("encoder was never started"))?;

        let output = child
            .wait_with_output()
            .map_err(|e| PostframeError::encode(format!("wait for ffmpeg: {e}")))?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&self.opts.out_path);
            return Err(PostframeError::encode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let bytes = std::fs::read(&self.opts.out_path).map_err(|e| {
            PostframeError::encode(format!(
                "read encoded output '{}': {e}",
                self.opts.out_path.display()
            ))
        })?;
        let _ = std::fs::remove_file(&self.opts.out_path);
        self.finished = Some(bytes);
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.abort();
        }
    }
}

/// Encode one frame as a lossless PNG, flattening alpha over `bg_rgba`.
pub fn encode_png_still(frame: &FrameRGBA, bg_rgba: [u8; 4]) -> PostframeResult<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.data.len() != expected {
        return Err(PostframeError::validation(
            "frame byte length does not match its dimensions",
        ));
    }

    let mut flat = vec![0u8; expected];
    flatten_to_opaque_rgba8(&mut flat, &frame.data, frame.premultiplied, bg_rgba)?;

    let mut out = std::io::Cursor::new(Vec::new());
    image::write_buffer_with_format(
        &mut out,
        &flat,
        frame.width,
        frame.height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .map_err(|e| PostframeError::encode(format!("png encode failed: {e}")))?;

    Ok(out.into_inner())
}

fn flatten_to_opaque_rgba8(
    dst: &mut [u8],
    src: &[u8],
    src_is_premul: bool,
    bg_rgba: [u8; 4],
) -> PostframeResult<()> {
    if dst.len() != src.len() || !dst.len().is_multiple_of(4) {
        return Err(PostframeError::validation(
            "flatten expects two rgba8 buffers of the same length",
        ));
    }

    let bg = [
        u16::from(bg_rgba[0]),
        u16::from(bg_rgba[1]),
        u16::from(bg_rgba[2]),
    ];
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let a = u16::from(s[3]);
        if a == 255 {
            d.copy_from_slice(s);
            continue;
        }

        let inv = 255 - a;
        for c in 0..3 {
            let fg = u16::from(s[c]);
            let fg = if src_is_premul { fg } else { mul_div255(fg, a) };
            d[c] = (fg + mul_div255(bg[c], inv)).min(255) as u8;
        }
        d[3] = 255;
    }

    Ok(())
}

fn mul_div255(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_ladder_is_ordered() {
        assert_eq!(
            VideoCodec::PREFERENCE,
            [VideoCodec::Vp9, VideoCodec::Vp8, VideoCodec::H264]
        );
        assert_eq!(VideoCodec::Vp9.container_ext(), "webm");
        assert_eq!(VideoCodec::H264.container_ext(), "mp4");
    }

    #[test]
    fn in_memory_sink_keeps_order() {
        let mut sink = InMemorySink::new();
        sink.begin(SinkConfig {
            width: 2,
            height: 2,
            fps: 30,
        })
        .unwrap();
        for i in 0..3u64 {
            let frame = FrameRGBA {
                width: 2,
                height: 2,
                data: vec![i as u8; 16],
                premultiplied: true,
            };
            sink.push_frame(i, &frame).unwrap();
        }
        sink.end().unwrap();
        assert_eq!(sink.frames.len(), 3);
        for (i, (idx, _)) in sink.frames.iter().enumerate() {
            assert_eq!(*idx, i as u64);
        }
    }

    #[test]
    fn encoder_rejects_out_of_order_and_odd_sizes() {
        let mut enc = VideoEncoder::new(VideoEncodeOpts::new(
            VideoCodec::H264,
            std::env::temp_dir().join("postframe_enc_test.mp4"),
        ));
        assert!(
            enc.begin(SinkConfig {
                width: 11,
                height: 10,
                fps: 30,
            })
            .is_err()
        );

        // Out-of-order detection does not need a live child.
        enc.cfg = Some(SinkConfig {
            width: 2,
            height: 2,
            fps: 30,
        });
        enc.scratch = vec![0u8; 16];
        enc.next_idx = 0;
        let frame = FrameRGBA {
            width: 2,
            height: 2,
            data: vec![0u8; 16],
            premultiplied: true,
        };
        assert!(enc.push_frame(5, &frame).is_err());
    }

    #[test]
    fn flatten_premul_over_black_produces_expected_rgb() {
        let src = vec![128u8, 0u8, 0u8, 128u8];
        let mut dst = vec![0u8; 4];
        flatten_to_opaque_rgba8(&mut dst, &src, true, [0, 0, 0, 255]).unwrap();
        assert_eq!(dst, vec![128u8, 0u8, 0u8, 255u8]);
    }

    #[test]
    fn flatten_straight_over_black_produces_expected_rgb() {
        let src = vec![255u8, 0u8, 0u8, 128u8];
        let mut dst = vec![0u8; 4];
        flatten_to_opaque_rgba8(&mut dst, &src, false, [0, 0, 0, 255]).unwrap();
        assert_eq!(dst, vec![128u8, 0u8, 0u8, 255u8]);
    }

    #[test]
    fn png_still_roundtrips_through_image_decoder() {
        let frame = FrameRGBA {
            width: 3,
            height: 2,
            data: vec![255u8; 3 * 2 * 4],
            premultiplied: true,
        };
        let png = encode_png_still(&frame, [0, 0, 0, 255]).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 3);
        assert_eq!(decoded.height(), 2);
    }

    #[test]
    fn take_bytes_requires_successful_end() {
        let mut enc = VideoEncoder::new(VideoEncodeOpts::new(
            VideoCodec::H264,
            std::env::temp_dir().join("postframe_enc_test2.mp4"),
        ));
        assert!(enc.take_bytes().is_err());
    }
}
