//! ffmpeg-backed transcoder and RTMP publisher

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use super::flv::{self, FlvTag, STREAM_HEADER};
use super::{DecodeError, PublishError, PublishSink, PublishWorker, SegmentTranscoder, WorkerFactory};
use crate::config::PublishConfig;
use crate::media::{MediaChunk, MediaType};

/// Keep at most this much of ffmpeg's stderr in error messages
const STDERR_TAIL: usize = 512;

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

/// Transcodes each MPEG-TS chunk with a one-shot ffmpeg invocation
///
/// Video is re-encoded to H.264, audio to AAC, and the result is muxed to
/// FLV on stdout.
pub struct FfmpegSegmentTranscoder {
    ffmpeg_path: String,
    video_preset: String,
    video_bitrate: String,
    audio_bitrate: String,
}

impl FfmpegSegmentTranscoder {
    pub fn new(config: &PublishConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            video_preset: config.video_preset.clone(),
            video_bitrate: config.video_bitrate.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
        }
    }

    fn args(&self, media_type: MediaType) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", "mpegts", "-i", "pipe:0"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let profile: Vec<&str> = match media_type {
            MediaType::Video => vec![
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                self.video_preset.as_str(),
                "-tune",
                "zerolatency",
                "-b:v",
                self.video_bitrate.as_str(),
                "-pix_fmt",
                "yuv420p",
            ],
            MediaType::Audio => vec!["-vn", "-c:a", "aac", "-b:a", self.audio_bitrate.as_str(), "-ar", "44100"],
        };
        args.extend(profile.into_iter().map(str::to_string));
        args.extend(["-f", "flv", "pipe:1"].iter().map(|s| s.to_string()));
        args
    }
}

impl SegmentTranscoder for FfmpegSegmentTranscoder {
    fn transcode(&mut self, chunk: &MediaChunk) -> Result<Vec<FlvTag>, DecodeError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.args(chunk.media_type))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DecodeError::Transcoder(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DecodeError::Transcoder("stdin not captured".to_string()))?;

        // Feed stdin from a separate thread so a full stdout pipe cannot deadlock us
        let payload = chunk.payload.clone();
        let feeder = thread::spawn(move || stdin.write_all(&payload));

        let output = child
            .wait_with_output()
            .map_err(|e| DecodeError::Transcoder(e.to_string()))?;
        // A broken pipe here means ffmpeg gave up early; the exit status says why
        let _ = feeder.join();

        if !output.status.success() {
            return Err(DecodeError::Exit {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let tags = flv::parse_segment(&output.stdout)?;
        if !tags.iter().any(|t| t.kind != flv::TagKind::Script) {
            return Err(DecodeError::Empty);
        }
        Ok(tags)
    }
}

/// Long-lived ffmpeg process relaying an FLV stream to the ingress endpoint
///
/// The publish URL carries the stream key; it is passed to ffmpeg and never
/// logged. ffmpeg's own diagnostics are logged with the URL masked.
pub struct FfmpegRtmpPublisher {
    child: Child,
    stdin: Option<ChildStdin>,
    header_written: bool,
}

impl FfmpegRtmpPublisher {
    pub fn spawn(ffmpeg_path: &str, rtmp_url: &str) -> Result<Self, PublishError> {
        let mut child = Command::new(ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-f", "flv", "-i", "pipe:0"])
            .args(["-c", "copy", "-f", "flv", rtmp_url])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PublishError::Spawn(e.to_string()))?;

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            let url = rtmp_url.to_string();
            thread::Builder::new()
                .name("floorcast-publish-log".to_string())
                .spawn(move || log_stderr(stderr, &url))
                .map_err(|e| PublishError::Spawn(e.to_string()))?;
        }

        tracing::info!("RTMP publisher started");
        Ok(Self {
            child,
            stdin,
            header_written: false,
        })
    }

    fn exit_reason(&mut self, fallback: String) -> PublishError {
        match self.child.try_wait() {
            Ok(Some(status)) => PublishError::Exited(status.to_string()),
            _ => PublishError::Write(fallback),
        }
    }
}

fn log_stderr(stderr: impl Read, url: &str) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        let line = line.replace(url, "<publish url>");
        tracing::warn!(target: "floorcast::publish::ffmpeg", "{}", line);
    }
}

impl PublishSink for FfmpegRtmpPublisher {
    fn write_tags(&mut self, tags: &[FlvTag]) -> Result<(), PublishError> {
        let mut buf = Vec::with_capacity(
            STREAM_HEADER.len() + tags.iter().map(FlvTag::encoded_len).sum::<usize>(),
        );
        if !self.header_written {
            buf.extend_from_slice(&STREAM_HEADER);
        }
        for tag in tags {
            tag.write_to(&mut buf);
        }

        let result = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&buf).and_then(|_| stdin.flush()),
            None => return Err(PublishError::Write("publisher already finished".to_string())),
        };

        match result {
            Ok(()) => {
                self.header_written = true;
                Ok(())
            }
            Err(e) => Err(self.exit_reason(e.to_string())),
        }
    }

    fn finish(&mut self) -> Result<(), PublishError> {
        // Closing stdin lets ffmpeg flush and disconnect
        self.stdin.take();
        let status = self
            .child
            .wait()
            .map_err(|e| PublishError::Exited(e.to_string()))?;
        if status.success() {
            tracing::info!("RTMP publisher finished");
            Ok(())
        } else {
            Err(PublishError::Exited(status.to_string()))
        }
    }
}

impl Drop for FfmpegRtmpPublisher {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Worker factory running ffmpeg for both transcoding and publishing
pub struct FfmpegWorkerFactory {
    config: PublishConfig,
}

impl FfmpegWorkerFactory {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }
}

impl WorkerFactory for FfmpegWorkerFactory {
    fn spawn(&self, rtmp_url: &str) -> Result<PublishWorker, PublishError> {
        let transcoder = FfmpegSegmentTranscoder::new(&self.config);
        let publisher = FfmpegRtmpPublisher::spawn(&self.config.ffmpeg_path, rtmp_url)?;
        PublishWorker::spawn(
            Box::new(transcoder),
            Box::new(publisher),
            self.config.queue_capacity,
        )
    }
}
