//! Voice messages: download, convert to mono 16 kHz WAV, transcribe.

use crate::error::RelayError;
use anyhow::Result;
use relay_ipc::MediaSource;
use relay_providers::Transcriber;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait AudioConverter: Send + Sync {
    async fn to_wav(&self, audio: Vec<u8>, extension: &str) -> Result<Vec<u8>>;
}

static NEXT_WORK_DIR: AtomicU64 = AtomicU64::new(1);

pub struct FfmpegConverter;

impl FfmpegConverter {
    async fn convert_in(
        work_dir: &std::path::Path,
        audio: Vec<u8>,
        extension: &str,
    ) -> Result<Vec<u8>> {
        let input_path = work_dir.join(format!("input.{}", extension));
        let output_path = work_dir.join("converted.wav");
        fs::write(&input_path, audio).await?;

        let output = TokioCommand::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(&input_path)
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg(&output_path)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("could not run ffmpeg: {}", e))?;
        if !output.status.success() {
            anyhow::bail!(
                "ffmpeg conversion failed: {}",
                String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .chars()
                    .take(240)
                    .collect::<String>()
            );
        }
        Ok(fs::read(&output_path).await?)
    }
}

#[async_trait::async_trait]
impl AudioConverter for FfmpegConverter {
    async fn to_wav(&self, audio: Vec<u8>, extension: &str) -> Result<Vec<u8>> {
        let work_dir = std::env::temp_dir().join(format!(
            "relay-voice-{}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
            NEXT_WORK_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&work_dir).await?;

        let result = Self::convert_in(&work_dir, audio, extension).await;

        if let Err(e) = fs::remove_dir_all(&work_dir).await {
            debug!("Failed to remove voice work dir {}: {}", work_dir.display(), e);
        }
        result
    }
}

pub struct VoicePipeline {
    media: Arc<dyn MediaSource>,
    converter: Arc<dyn AudioConverter>,
    transcriber: Arc<dyn Transcriber>,
}

impl VoicePipeline {
    pub fn new(
        media: Arc<dyn MediaSource>,
        converter: Arc<dyn AudioConverter>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            media,
            converter,
            transcriber,
        }
    }

    fn extension_for(mime_type: Option<&str>) -> &'static str {
        match mime_type.map(str::to_ascii_lowercase).as_deref() {
            Some("audio/mpeg") => "mp3",
            Some("audio/mp4") | Some("audio/m4a") => "m4a",
            Some("audio/wav") | Some("audio/x-wav") => "wav",
            _ => "ogg",
        }
    }

    /// Trimmed transcript; empty when no speech was recognised.
    pub async fn transcribe(&self, file_id: &str, mime_type: Option<&str>) -> Result<String> {
        let audio = self
            .media
            .fetch_file(file_id)
            .await
            .map_err(|e| RelayError::upstream("telegram", e))?;
        debug!("Downloaded voice file {} ({} bytes)", file_id, audio.len());

        let wav = self
            .converter
            .to_wav(audio, Self::extension_for(mime_type))
            .await
            .map_err(|e| {
                warn!("Voice conversion failed for {}: {}", file_id, e);
                RelayError::Transcode(format!("{:#}", e))
            })?;

        let transcript = self
            .transcriber
            .transcribe(wav, "voice.wav")
            .await
            .map_err(|e| RelayError::upstream("transcription", e))?;
        Ok(transcript.trim().to_string())
    }
}
