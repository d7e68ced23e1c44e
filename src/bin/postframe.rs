use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use postframe::{
    ExportFormat, ExportObserver, ExportOutcome, ExportSession, ExportSessionOpts, ExportSnapshot,
    JobPhase, LogoLoader, MediaSource, PostFields,
};

#[derive(Parser, Debug)]
#[command(name = "postframe", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a single styled frame as a PNG.
    Frame(FrameArgs),
    /// Export a full post (PNG still or encoded video; video requires
    /// `ffmpeg` on PATH).
    Export(ExportArgs),
}

#[derive(Parser, Debug)]
struct FrameArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Media time to sample, in seconds.
    #[arg(long, default_value_t = 0.0)]
    at: f64,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Force the export format; defaults to the fields file, which
    /// defaults to `image`.
    #[arg(long, value_enum)]
    format: Option<FormatChoice>,

    /// Output directory; the artifact keeps its suggested filename.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Source media file (image or video).
    #[arg(long)]
    media: PathBuf,

    /// Treat the media as a still image instead of probing it as video.
    #[arg(long)]
    image: bool,

    /// Template id (social, viral, podcast, travel).
    #[arg(long, default_value = "social")]
    template: String,

    /// Overlay fields JSON; missing keys take their defaults.
    #[arg(long)]
    fields: Option<PathBuf>,

    /// Font file used for all text runs.
    #[arg(long)]
    font: Option<PathBuf>,

    /// Logo image painted into the avatar circle once loaded.
    #[arg(long)]
    logo: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatChoice {
    Image,
    Video,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Frame(args) => cmd_frame(args),
        Command::Export(args) => cmd_export(args),
    }
}

fn read_fields(path: Option<&Path>) -> anyhow::Result<PostFields> {
    let Some(path) = path else {
        return Ok(PostFields::default());
    };
    let f = File::open(path).with_context(|| format!("open fields '{}'", path.display()))?;
    let r = BufReader::new(f);
    let fields: PostFields = serde_json::from_reader(r).with_context(|| "parse fields JSON")?;
    Ok(fields)
}

fn build_session(common: &CommonArgs) -> anyhow::Result<ExportSession> {
    let font_bytes = match &common.font {
        Some(path) => Some(Arc::new(
            std::fs::read(path).with_context(|| format!("read font '{}'", path.display()))?,
        )),
        None => None,
    };
    let logo = match &common.logo {
        Some(path) => LogoLoader::spawn(path.clone()),
        None => LogoLoader::none(),
    };
    Ok(ExportSession::new(
        font_bytes,
        logo,
        ExportSessionOpts::default(),
    ))
}

fn open_media(common: &CommonArgs, fields: &PostFields) -> anyhow::Result<MediaSource> {
    let media = if common.image {
        MediaSource::open_still(&common.media, fields.still_duration_secs)?
    } else {
        MediaSource::open_video(&common.media)?
    };
    Ok(media)
}

fn cmd_frame(args: FrameArgs) -> anyhow::Result<()> {
    let fields = read_fields(args.common.fields.as_deref())?;
    let template = postframe::resolve(&args.common.template);
    let mut session = build_session(&args.common)?;
    let mut media = open_media(&args.common, &fields)?;

    let snapshot = ExportSnapshot::new(template, fields);
    let frame = session.render_frame(&snapshot, &mut media, args.at)?;

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    let png = postframe::encode::encode_png_still(&frame, [0, 0, 0, 255])?;
    std::fs::write(&args.out, png)
        .with_context(|| format!("write png '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

struct StderrProgress {
    last_whole: i32,
}

impl ExportObserver for StderrProgress {
    fn on_progress(&mut self, pct: f32) {
        let whole = pct as i32;
        if whole / 10 > self.last_whole / 10 {
            eprintln!("export {whole}%");
        }
        self.last_whole = whole;
    }

    fn on_phase(&mut self, phase: JobPhase) {
        if phase == JobPhase::Encoding {
            eprintln!("encoding...");
        }
    }
}

fn cmd_export(args: ExportArgs) -> anyhow::Result<()> {
    let mut fields = read_fields(args.common.fields.as_deref())?;
    if let Some(choice) = args.format {
        fields.format = match choice {
            FormatChoice::Image => ExportFormat::Image,
            FormatChoice::Video => ExportFormat::Video,
        };
    }

    let template = postframe::resolve(&args.common.template);
    let mut session = build_session(&args.common)?;
    let mut media = open_media(&args.common, &fields)?;

    let snapshot = ExportSnapshot::new(template, fields);
    let mut observer = StderrProgress { last_whole: -1 };
    let outcome = session.start_export(&snapshot, &mut media, &mut observer)?;

    match outcome {
        ExportOutcome::Completed(artifact) => {
            std::fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("create output dir '{}'", args.out_dir.display()))?;
            let out_path = args.out_dir.join(&artifact.filename);
            std::fs::write(&out_path, &artifact.bytes)
                .with_context(|| format!("write '{}'", out_path.display()))?;
            eprintln!("wrote {}", out_path.display());
        }
        ExportOutcome::Cancelled => {
            eprintln!("export cancelled; no output written");
        }
    }
    Ok(())
}
