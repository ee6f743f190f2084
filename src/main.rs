use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use halftone::error::{find_halftone_error, ErrorEnvelope, ErrorEnvelopeBody};
use halftone::gpu::{verify_shader_interface, GpuRenderer, HALFTONE_WGSL};
use halftone::params::{load_parameters, ParamOverride};
use halftone::session::{Debouncer, RenderBackend, RenderSession};
use halftone::software::SoftwareRenderer;
use halftone::texture::DEFAULT_MAX_EDGE;
use halftone::video::{run_video_job, Pacing, VideoJob};
use halftone::{HalftoneParameters, RenderedFrame};

#[derive(Debug, Parser)]
#[command(name = "halftone")]
#[command(version, about = "CMYK halftone print simulation for images and video")]
struct Cli {
    /// Default log level; `RUST_LOG` overrides it.
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Print results and errors as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum Backend {
    Gpu,
    Cpu,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum ParamFormat {
    Yaml,
    Json,
}

#[derive(Debug, Args)]
struct ParamArgs {
    /// YAML or JSON parameter file.
    #[arg(short = 'p', long = "params")]
    params: Option<PathBuf>,

    /// Override one parameter, e.g. `--set dotSize=0.6 --set cyanVisible=false`.
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_override)]
    overrides: Vec<ParamOverride>,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[command(flatten)]
    params: ParamArgs,

    #[arg(long, value_enum, default_value_t = Backend::Gpu)]
    backend: Backend,

    /// Longest source edge after downscaling.
    #[arg(long, default_value_t = DEFAULT_MAX_EDGE)]
    max_edge: u32,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Halftone one image into a PNG.
    Render {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        /// Letterbox into a WIDTHxHEIGHT container instead of the source size.
        #[arg(long, value_parser = parse_size)]
        fit: Option<(u32, u32)>,
        /// Display density applied on top of `--fit`.
        #[arg(long, default_value_t = 1.0)]
        pixel_ratio: f32,
        /// Print the SHA-256 of the rendered pixels.
        #[arg(long)]
        digest: bool,
    },
    /// Halftone every frame of a video and encode the result.
    Video {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        /// Decode at native speed and drop frames the renderer cannot keep up with.
        #[arg(long)]
        live: bool,
        #[arg(long)]
        max_frames: Option<u64>,
    },
    /// Re-render an image whenever the parameter file or the image changes.
    Watch {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        #[arg(long, default_value_t = 150)]
        debounce_ms: u64,
        /// Exit after this many renders.
        #[arg(long)]
        max_renders: Option<u64>,
    },
    /// Print the default parameters.
    Params {
        #[arg(long, value_enum, default_value_t = ParamFormat::Yaml)]
        format: ParamFormat,
    },
    /// Validate parameters and the shader interface, and probe the GPU.
    Check {
        #[command(flatten)]
        params: ParamArgs,
        #[arg(long, value_enum, default_value_t = Backend::Gpu)]
        backend: Backend,
    },
}

fn parse_override(raw: &str) -> Result<ParamOverride, String> {
    ParamOverride::parse(raw).map_err(|e| e.to_string())
}

fn parse_size(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("'{raw}' must look like WIDTHxHEIGHT"))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("invalid width in '{raw}'"))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("invalid height in '{raw}'"))?;
    if w == 0 || h == 0 {
        return Err(format!("'{raw}' has a zero dimension"));
    }
    Ok((w, h))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(cli.log_level.filter().into())
        .from_env_lossy();
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let json = cli.json;
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if json {
                print_json(&error_envelope(&error));
            } else {
                eprintln!("error: {error:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn error_envelope(error: &anyhow::Error) -> ErrorEnvelope {
    match find_halftone_error(error) {
        Some(coded) => {
            let mut envelope = coded.envelope();
            envelope.error.message = format!("{error:#}");
            envelope
        }
        None => ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: "E_USAGE".to_owned(),
                message: format!("{error:#}"),
                recoverable: true,
            },
        },
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{text}"),
        Err(error) => eprintln!("error: failed to serialize output: {error}"),
    }
}

fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Render {
            input,
            output,
            render,
            fit,
            pixel_ratio,
            digest,
        } => run_render(&input, &output, &render, fit, pixel_ratio, digest, json),
        Commands::Video {
            input,
            output,
            render,
            live,
            max_frames,
        } => run_video(&input, &output, &render, live, max_frames, json),
        Commands::Watch {
            input,
            output,
            render,
            debounce_ms,
            max_renders,
        } => run_watch(&input, &output, &render, debounce_ms, max_renders),
        Commands::Params { format } => run_params(format),
        Commands::Check { params, backend } => run_check(&params, backend, json),
    }
}

fn resolve_params(args: &ParamArgs) -> Result<HalftoneParameters> {
    let mut params = match &args.params {
        Some(path) => load_parameters(path)?,
        None => HalftoneParameters::default(),
    };
    params
        .apply_overrides(&args.overrides)
        .context("invalid --set override")?;
    Ok(params)
}

fn open_backend(backend: Backend) -> Result<Box<dyn RenderBackend>> {
    Ok(match backend {
        Backend::Gpu => Box::new(GpuRenderer::new()?),
        Backend::Cpu => Box::new(SoftwareRenderer::new()),
    })
}

fn open_session(args: &RenderArgs) -> Result<RenderSession<Box<dyn RenderBackend>>> {
    let params = resolve_params(&args.params)?;
    let backend = open_backend(args.backend)?;
    info!(backend = backend.name(), "opened render backend");
    Ok(RenderSession::new(backend)
        .with_params(params)
        .with_max_edge(args.max_edge))
}

#[derive(Serialize)]
struct RenderReport<'a> {
    ok: bool,
    output: &'a Path,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

fn run_render(
    input: &Path,
    output: &Path,
    args: &RenderArgs,
    fit: Option<(u32, u32)>,
    pixel_ratio: f32,
    digest: bool,
    json: bool,
) -> Result<()> {
    let mut session = open_session(args)?;
    session.load_path(input)?;
    if let Some(container) = fit {
        session.set_viewport(container, pixel_ratio);
    }
    let frame = session.render()?;
    frame.save_png(output)?;
    report_frame(output, &frame, digest, json);
    Ok(())
}

fn report_frame(output: &Path, frame: &RenderedFrame, digest: bool, json: bool) {
    let digest = digest.then(|| frame.digest());
    if json {
        print_json(&RenderReport {
            ok: true,
            output,
            width: frame.width,
            height: frame.height,
            digest,
        });
        return;
    }
    if let Some(digest) = digest {
        println!("{digest}");
    }
    info!(
        output = %output.display(),
        width = frame.width,
        height = frame.height,
        "wrote halftone frame"
    );
}

fn run_video(
    input: &Path,
    output: &Path,
    args: &RenderArgs,
    live: bool,
    max_frames: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut session = open_session(args)?;
    let job = VideoJob {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        max_edge: args.max_edge,
        pacing: if live { Pacing::Realtime } else { Pacing::EveryFrame },
        max_frames,
    };
    let summary = run_video_job(&mut session, &job)?;
    if json {
        print_json(&serde_json::json!({
            "ok": true,
            "output": output,
            "frames": summary.frames,
            "dropped": summary.dropped,
            "width": summary.width,
            "height": summary.height,
            "fps": summary.fps,
        }));
    } else {
        println!("Wrote {} ({} frames)", output.display(), summary.frames);
    }
    Ok(())
}

fn same_file(event_path: &Path, target: &Path) -> bool {
    event_path == target
        || (event_path.file_name().is_some() && event_path.file_name() == target.file_name())
}

fn run_watch(
    input: &Path,
    output: &Path,
    args: &RenderArgs,
    debounce_ms: u64,
    max_renders: Option<u64>,
) -> Result<()> {
    let params_path = args
        .params
        .params
        .clone()
        .ok_or_else(|| anyhow!("watch needs a --params file to watch"))?;
    let mut session = open_session(args)?;
    session.load_path(input)?;

    let (watch_tx, watch_rx) = mpsc::channel::<PathBuf>();
    let watched = [params_path.clone(), input.to_path_buf()];
    let filter_targets = watched.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            for path in &event.paths {
                if let Some(target) = filter_targets.iter().find(|t| same_file(path, t)) {
                    let _ = watch_tx.send(target.clone());
                }
            }
        }
        Err(error) => warn!(%error, "file watcher error"),
    })
    .context("failed to create file watcher")?;
    for path in &watched {
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
    }

    let mut renders = 0u64;
    let mut debounce = Debouncer::new(Duration::from_millis(debounce_ms));
    let mut reload_params = false;
    let mut reload_media = false;
    info!(params = %params_path.display(), input = %input.display(), "watching for changes");

    loop {
        match session.render_if_dirty() {
            Ok(Some(frame)) => {
                frame.save_png(output)?;
                renders += 1;
                info!(output = %output.display(), renders, "re-rendered");
                if max_renders.is_some_and(|max| renders >= max) {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(error) if error.is_recoverable() => warn!(%error, "render skipped"),
            Err(error) => return Err(error.into()),
        }

        let wait = debounce
            .remaining(Instant::now())
            .unwrap_or(Duration::from_secs(3600));
        match watch_rx.recv_timeout(wait) {
            Ok(path) => {
                reload_params |= path == params_path;
                reload_media |= path.as_path() == input;
                debounce.poke(Instant::now());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => bail!("file watcher stopped"),
        }
        if !debounce.fire(Instant::now()) {
            continue;
        }

        if std::mem::take(&mut reload_params) {
            match resolve_params(&args.params) {
                Ok(params) => session.set_params(params),
                Err(error) => warn!(error = %format!("{error:#}"), "keeping previous parameters"),
            }
        }
        if std::mem::take(&mut reload_media) {
            if let Err(error) = session.load_path(input) {
                warn!(%error, "keeping previous image");
            }
        }
    }
}

fn run_params(format: ParamFormat) -> Result<()> {
    let params = HalftoneParameters::default();
    let text = match format {
        ParamFormat::Yaml => serde_yaml::to_string(&params)?,
        ParamFormat::Json => serde_json::to_string_pretty(&params)?,
    };
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn run_check(args: &ParamArgs, backend: Backend, json: bool) -> Result<()> {
    resolve_params(args)?;
    verify_shader_interface(HALFTONE_WGSL)?;
    let adapter = match backend {
        Backend::Gpu => GpuRenderer::new()?.adapter_name().to_owned(),
        Backend::Cpu => "cpu".to_owned(),
    };
    let build = option_env!("HALFTONE_GIT_HASH").unwrap_or("unknown");
    if json {
        print_json(&serde_json::json!({
            "ok": true,
            "backend": adapter,
            "version": env!("CARGO_PKG_VERSION"),
            "build": build,
        }));
    } else {
        println!(
            "OK: halftone {} ({build}) backend={adapter}",
            env!("CARGO_PKG_VERSION")
        );
    }
    Ok(())
}
