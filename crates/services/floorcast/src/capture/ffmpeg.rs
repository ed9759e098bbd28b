//! ffmpeg capture source
//!
//! Runs one ffmpeg process per device and reads MPEG-TS from its stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use super::{CaptureError, MediaSource};
use crate::config::CaptureConfig;
use crate::media::MediaType;

/// MPEG-TS packet size
pub const TS_PACKET_SIZE: usize = 188;

/// Capture device read through ffmpeg
pub struct FfmpegSource {
    ffmpeg_path: String,
    media_type: MediaType,
    format: String,
    device: String,
    probe: Duration,
    child: Option<Child>,
}

impl FfmpegSource {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        media_type: MediaType,
        format: impl Into<String>,
        device: impl Into<String>,
        probe: Duration,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            media_type,
            format: format.into(),
            device: device.into(),
            probe,
            child: None,
        }
    }

    /// Camera source, if a video device is configured
    pub fn video(config: &CaptureConfig) -> Option<Self> {
        config.video_device.as_ref().map(|device| {
            Self::new(
                &config.ffmpeg_path,
                MediaType::Video,
                &config.video_format,
                device,
                Duration::from_millis(config.acquire_probe_ms),
            )
        })
    }

    /// Microphone source, if an audio device is configured
    pub fn audio(config: &CaptureConfig) -> Option<Self> {
        config.audio_device.as_ref().map(|device| {
            Self::new(
                &config.ffmpeg_path,
                MediaType::Audio,
                &config.audio_format,
                device,
                Duration::from_millis(config.acquire_probe_ms),
            )
        })
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            self.format.clone(),
            "-i".to_string(),
            self.device.clone(),
        ];
        let encode: &[&str] = match self.media_type {
            // Frequent keyframes keep short chunks decodable on their own
            MediaType::Video => &[
                "-an", "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency", "-g", "30",
            ],
            MediaType::Audio => &["-vn", "-c:a", "mp2", "-b:a", "128k"],
        };
        args.extend(encode.iter().map(|s| s.to_string()));
        args.extend(["-f", "mpegts", "pipe:1"].iter().map(|s| s.to_string()));
        args
    }

    fn unavailable(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::DeviceUnavailable {
            device: self.describe(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.format, self.device)
    }

    async fn acquire(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError> {
        if self.child.is_some() {
            return Err(self.unavailable("already acquired"));
        }

        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.unavailable("ffmpeg stdout not captured"))?;
        let mut stderr = child.stderr.take();

        // A device that cannot be opened makes ffmpeg exit almost immediately
        match tokio::time::timeout(self.probe, child.wait()).await {
            Ok(Ok(status)) => {
                let mut output = Vec::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_end(&mut output).await;
                }
                let detail = String::from_utf8_lossy(&output).trim().to_string();
                return Err(self.unavailable(if detail.is_empty() {
                    format!("ffmpeg exited with {}", status)
                } else {
                    detail
                }));
            }
            Ok(Err(e)) => return Err(self.unavailable(e.to_string())),
            Err(_) => {}
        }

        if let Some(stderr) = stderr {
            let media_type = self.media_type;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(media_type = %media_type, "ffmpeg: {}", line);
                }
            });
        }

        self.child = Some(child);
        Ok(Box::new(stdout))
    }

    async fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(device = %self.describe(), error = %e, "ffmpeg already exited");
            }
        }
    }
}
