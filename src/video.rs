//! Video sources and exports through ffmpeg subprocesses.
//!
//! Decoding reads raw RGBA frames from `ffmpeg` stdout on a reader thread;
//! encoding feeds rendered frames to `ffmpeg` stdin from a writer thread.
//! Both sides talk to the render loop over bounded channels.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::session::{LatestFrame, RenderBackend, RenderSession};
use crate::texture::{capped_dimensions, Texture};

const FRAME_QUEUE_DEPTH: usize = 4;
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Dimensions and frame rate of the first video stream.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,avg_frame_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!("ffprobe executable not found; install ffmpeg to process video")
            } else {
                anyhow!("failed to run ffprobe on {}: {error}", path.display())
            }
        })?;
    if !output.status.success() {
        bail!(
            "ffprobe could not read {}: {}",
            path.display(),
            last_n_chars(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_CHARS)
        );
    }
    parse_probe_json(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("unexpected ffprobe output for {}", path.display()))
}

pub fn parse_probe_json(text: &str) -> Result<VideoInfo> {
    let parsed: ProbeOutput = serde_json::from_str(text).context("ffprobe JSON did not parse")?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        bail!("video stream has no dimensions");
    };
    if width == 0 || height == 0 {
        bail!("video stream has empty dimensions {width}x{height}");
    }
    let fps = [stream.avg_frame_rate, stream.r_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| parse_rate(&rate))
        .unwrap_or(30.0);
    Ok(VideoInfo { width, height, fps })
}

/// `30000/1001`, `25/1` or `24` → frames per second.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// How decoded frames are delivered to the render loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Decode as fast as rendering consumes; every frame is rendered.
    EveryFrame,
    /// Decode at the native frame rate; the render loop takes the newest
    /// decoded frame and drops older ones it could not keep up with.
    Realtime,
}

pub struct FfmpegInput {
    frames: LatestFrame<Vec<u8>>,
    pacing: Pacing,
    worker: Option<JoinHandle<Result<()>>>,
    child: Child,
}

pub fn decoder_args(input_path: &Path, width: u32, height: u32, pacing: Pacing) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
    ];
    if pacing == Pacing::Realtime {
        args.push("-re".to_owned());
    }
    args.extend([
        "-i".to_owned(),
        input_path.to_string_lossy().into_owned(),
        "-an".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s".to_owned(),
        format!("{width}x{height}"),
        "-sws_flags".to_owned(),
        "area".to_owned(),
        "-".to_owned(),
    ]);
    args
}

impl FfmpegInput {
    pub fn spawn(input_path: &Path, width: u32, height: u32, pacing: Pacing) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);

        let mut child = Command::new("ffmpeg")
            .args(decoder_args(input_path, width, height, pacing))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    anyhow!("ffmpeg executable not found; install ffmpeg to process video")
                } else {
                    anyhow!("failed to spawn ffmpeg decoder: {error}")
                }
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let frame_size = width as usize * height as usize * 4;

        let worker = thread::Builder::new()
            .name("halftone-ffmpeg-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(()) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read from ffmpeg: {e}")),
                    }
                }
                Ok(())
            })
            .context("failed to spawn ffmpeg reader thread")?;

        Ok(Self {
            frames: LatestFrame::new(receiver),
            pacing,
            worker: Some(worker),
            child,
        })
    }

    /// Next frame to render, or `None` once the stream ends.
    pub fn read_frame(&mut self) -> Option<Vec<u8>> {
        match self.pacing {
            Pacing::EveryFrame => self.frames.recv(),
            Pacing::Realtime => self.frames.wait(),
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    /// Stop decoding. Safe to call before the stream is exhausted.
    pub fn finish(mut self) -> Result<()> {
        let _ = self.child.kill();
        let _ = self.child.wait();
        drop(self.frames);

        match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("ffmpeg reader thread panicked"))?,
            None => Ok(()),
        }
    }
}

/// Output codec, chosen from the output file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    ProRes,
    Vp9,
}

impl VideoCodec {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" => Ok(Self::H264),
            "mov" => Ok(Self::ProRes),
            "webm" => Ok(Self::Vp9),
            other => bail!(
                "unsupported video container '.{other}' for {} (use .mp4, .mov or .webm)",
                path.display()
            ),
        }
    }

    fn output_args(self) -> Vec<&'static str> {
        match self {
            // yuv420p needs even dimensions.
            Self::H264 => vec![
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "18",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ],
            Self::ProRes => vec![
                "-c:v",
                "prores_ks",
                "-profile:v",
                "3",
                "-pix_fmt",
                "yuv422p10le",
            ],
            Self::Vp9 => vec![
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-c:v",
                "libvpx-vp9",
                "-b:v",
                "0",
                "-crf",
                "30",
                "-pix_fmt",
                "yuv420p",
            ],
        }
    }
}

pub fn encoder_args(width: u32, height: u32, fps: f64, output_path: &Path) -> Result<Vec<String>> {
    let codec = VideoCodec::from_path(output_path)?;
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    args.extend([
        "-s:v".to_owned(),
        format!("{width}x{height}"),
        "-r".to_owned(),
        format!("{fps:.3}"),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
    ]);
    args.extend(codec.output_args().into_iter().map(str::to_owned));
    args.push(output_path.to_string_lossy().into_owned());
    Ok(args)
}

pub struct FfmpegOutput {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl FfmpegOutput {
    pub fn spawn(output_path: &Path, width: u32, height: u32, fps: f64) -> Result<Self> {
        let args = encoder_args(width, height, fps, output_path)?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);

        let worker = thread::Builder::new()
            .name("halftone-ffmpeg-encoder".to_owned())
            .spawn(move || run_encoder(args, receiver))
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn write_frame(&self, rgba_frame: Vec<u8>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        sender
            .send(rgba_frame)
            .map_err(|_| anyhow!("ffmpeg encoder exited early"))
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.sender.take());
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }
}

fn run_encoder(args: Vec<String>, receiver: mpsc::Receiver<Vec<u8>>) -> Result<()> {
    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!("ffmpeg executable not found; install ffmpeg to export video")
            } else {
                anyhow!("failed to spawn ffmpeg (args='{}'): {error}", args.join(" "))
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
    }
    if write_error.is_none() {
        if let Err(error) = stdin.flush() {
            write_error = Some(error);
        }
    }
    drop(stdin);
    drop(receiver);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        bail!(
            "ffmpeg failed with status {status} (args='{}', stderr_tail='{stderr_tail}')",
            args.join(" ")
        );
    }
    if let Some(error) = write_error {
        return Err(error).context("failed to write frame to ffmpeg stdin");
    }
    Ok(())
}

fn read_stderr_tail(stderr: &mut Option<ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    Ok(last_n_chars(&String::from_utf8_lossy(&buf), STDERR_TAIL_CHARS))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    s.chars()
        .skip(count.saturating_sub(max_chars))
        .collect::<String>()
        .trim()
        .to_owned()
}

#[derive(Debug, Clone)]
pub struct VideoJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub max_edge: u32,
    pub pacing: Pacing,
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSummary {
    pub frames: u64,
    pub dropped: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Decode, halftone and re-encode a whole video through `session`.
///
/// Parameters are read from the session's [`crate::session::ParamCell`]
/// on every frame, so edits published while the job runs take effect on
/// the next frame.
pub fn run_video_job<B: RenderBackend>(
    session: &mut RenderSession<B>,
    job: &VideoJob,
) -> Result<VideoSummary> {
    let info = probe(&job.input)?;
    let (width, height) = capped_dimensions(info.width, info.height, job.max_edge);
    info!(
        input = %job.input.display(),
        source_width = info.width,
        source_height = info.height,
        width,
        height,
        fps = info.fps,
        "halftoning video"
    );

    let mut input = FfmpegInput::spawn(&job.input, width, height, job.pacing)?;
    let output = FfmpegOutput::spawn(&job.output, width, height, info.fps)?;
    let started = Instant::now();
    let mut frames = 0u64;

    let result = (|| -> Result<()> {
        while let Some(rgba) = input.read_frame() {
            let texture = Texture::from_rgba8(width, height, rgba)?;
            session.bind_texture(texture)?;
            let frame = session.render()?;
            output.write_frame(frame.rgba)?;
            frames += 1;
            if frames % 30 == 0 {
                debug!(frames, elapsed_ms = started.elapsed().as_millis() as u64, "video progress");
            }
            if job.max_frames.is_some_and(|max| frames >= max) {
                break;
            }
        }
        Ok(())
    })();

    let dropped = input.dropped_frames();
    input.finish()?;
    output.finish()?;
    result?;

    if dropped > 0 {
        warn!(dropped, "dropped frames to keep up with realtime decode");
    }
    info!(
        frames,
        output = %job.output.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "video export finished"
    );
    Ok(VideoSummary {
        frames,
        dropped,
        width,
        height,
        fps: info.fps,
    })
}
