use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::MuxingSection;
use crate::timecode::format_seconds;

use super::{CollaboratorError, CollaboratorResult, MuxRequest, Muxer, PreparedSource};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// ffmpeg/ffprobe backed implementation of [`Muxer`].
pub struct FfmpegMuxer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    log_level: String,
    timeout: Duration,
    sample_rate: u32,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for FfmpegMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegMuxer")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FfmpegMuxer {
    pub fn new(section: &MuxingSection) -> Self {
        Self {
            ffmpeg: section.ffmpeg.clone(),
            ffprobe: section.ffprobe.clone(),
            log_level: section.log_level.clone(),
            timeout: section.timeout(),
            sample_rate: section.sample_rate,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn run_checked(&self, program: &Path, args: &[String]) -> CollaboratorResult<Output> {
        let rendered = format!("{} {}", program.display(), args.join(" "));
        debug!(command = %rendered, "running external command");
        let output = match timeout(self.timeout, self.executor.run(program, args)).await {
            Ok(result) => result.map_err(|source| CollaboratorError::io(program, source))?,
            Err(_) => {
                return Err(CollaboratorError::Transient(format!(
                    "{} timed out after {:?}",
                    program.display(),
                    self.timeout
                )))
            }
        };
        if !output.status.success() {
            return Err(CollaboratorError::CommandFailure {
                command: rendered,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn probe_duration(&self, video: &Path) -> CollaboratorResult<Duration> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            video.to_string_lossy().into_owned(),
        ];
        let output = self
            .run_checked(&self.ffprobe, &args)
            .await
            .map_err(|err| fatal(video, format!("ffprobe failed: {err}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let seconds = stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| fatal(video, format!("unreadable duration '{}'", stdout.trim())))?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(fatal(video, format!("duration {seconds} is not positive")));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    async fn has_audio_stream(&self, video: &Path) -> CollaboratorResult<bool> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "a".to_string(),
            "-show_entries".to_string(),
            "stream=index".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            video.to_string_lossy().into_owned(),
        ];
        let output = self
            .run_checked(&self.ffprobe, &args)
            .await
            .map_err(|err| fatal(video, format!("ffprobe failed: {err}")))?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-y".to_string(),
        ]
    }

    /// Arguments that add a silent stereo track to a video lacking audio.
    pub fn silent_track_args(&self, video: &Path, output: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!(
                "anullsrc=channel_layout=stereo:sample_rate={}",
                self.sample_rate
            ),
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "1:a".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-shortest".to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Full argument list for one segment encode.
    pub fn mux_args(&self, request: &MuxRequest) -> Vec<String> {
        let duration = request.end.saturating_sub(request.start);
        let mut args = self.base_args();
        args.extend([
            "-ss".to_string(),
            format_seconds(request.start),
            "-t".to_string(),
            format_seconds(duration),
            "-i".to_string(),
            request.source.to_string_lossy().into_owned(),
        ]);
        let volume = format!("{:.2}", request.mix.original_volume);
        let filter = match &request.narration {
            Some(narration) => {
                args.push("-i".to_string());
                args.push(narration.to_string_lossy().into_owned());
                let delay_ms = request.mix.narration_delay.as_millis();
                format!(
                    "[0:a]volume={volume}[orig];[1:a]adelay={delay_ms}|{delay_ms}[comm];\
                     [orig][comm]amix=inputs=2:duration=first:normalize=0[aout]"
                )
            }
            None => format!("[0:a]volume={volume}[aout]"),
        };
        let encoding = &request.encoding;
        args.extend([
            "-filter_complex".to_string(),
            filter,
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "[aout]".to_string(),
            "-c:v".to_string(),
            encoding.video_codec.clone(),
            "-preset".to_string(),
            encoding.preset.clone(),
            "-c:a".to_string(),
            encoding.audio_codec.clone(),
            "-ar".to_string(),
            encoding.sample_rate.to_string(),
            "-ac".to_string(),
            encoding.audio_channels.to_string(),
            "-b:a".to_string(),
            encoding.audio_bitrate.clone(),
        ]);
        let muxer = encoding.muxer().unwrap_or(encoding.container.as_str());
        if matches!(muxer, "mp4" | "mov") {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }
        args.push("-f".to_string());
        args.push(muxer.to_string());
        args.push(request.output.to_string_lossy().into_owned());
        args
    }

    pub fn concat_args(&self, list_path: &Path, output: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }
}

fn fatal(path: &Path, reason: String) -> CollaboratorError {
    CollaboratorError::FatalInput {
        path: path.to_path_buf(),
        reason,
    }
}

/// Concat demuxer list, one `file '<path>'` line per segment.
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

async fn ensure_parent(path: &Path) -> CollaboratorResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| CollaboratorError::io(parent, source))?;
    }
    Ok(())
}

async fn require_output(command: &str, output: &Path) -> CollaboratorResult<()> {
    match fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(CollaboratorError::CommandFailure {
            command: command.to_string(),
            status: Some(0),
            stderr: format!("{} missing or empty after encode", output.display()),
        }),
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn prepare_source(
        &self,
        video: &Path,
        scratch_dir: &Path,
    ) -> CollaboratorResult<PreparedSource> {
        if fs::metadata(video).await.is_err() {
            return Err(fatal(video, "file not found".to_string()));
        }
        let duration = self.probe_duration(video).await?;
        if self.has_audio_stream(video).await? {
            return Ok(PreparedSource {
                path: video.to_path_buf(),
                duration,
                added_silent_track: false,
            });
        }

        let output = scratch_dir.join("source_with_audio.mp4");
        ensure_parent(&output).await?;
        let args = self.silent_track_args(video, &output);
        self.run_checked(&self.ffmpeg, &args)
            .await
            .map_err(|err| fatal(video, format!("could not add silent audio track: {err}")))?;
        info!(source = %video.display(), output = %output.display(), "added silent audio track");
        Ok(PreparedSource {
            path: output,
            duration,
            added_silent_track: true,
        })
    }

    async fn mux(&self, request: &MuxRequest) -> CollaboratorResult<()> {
        ensure_parent(&request.output).await?;
        let args = self.mux_args(request);
        self.run_checked(&self.ffmpeg, &args).await?;
        require_output(&self.ffmpeg.to_string_lossy(), &request.output).await
    }

    async fn concat(
        &self,
        segments: &[PathBuf],
        list_path: &Path,
        output: &Path,
    ) -> CollaboratorResult<()> {
        ensure_parent(list_path).await?;
        ensure_parent(output).await?;
        fs::write(list_path, concat_list(segments))
            .await
            .map_err(|source| CollaboratorError::io(list_path, source))?;
        let args = self.concat_args(list_path, output);
        self.run_checked(&self.ffmpeg, &args).await?;
        require_output(&self.ffmpeg.to_string_lossy(), output).await
    }
}
