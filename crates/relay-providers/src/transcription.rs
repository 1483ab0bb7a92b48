//! Speech-to-text through the OpenAI-compatible `/audio/transcriptions` endpoint.

use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;

#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns the trimmed transcript of `audio`.
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String>;
}

pub struct WhisperTranscriber {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: String, base_url: &str, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            api_url: format!("{}/audio/transcriptions", base_url.trim_end_matches('/')),
            model,
        })
    }

    fn mime_for(file_name: &str) -> &'static str {
        match file_name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
            Some("wav") => "audio/wav",
            Some("mp3") => "audio/mpeg",
            Some("ogg") | Some("oga") => "audio/ogg",
            Some("m4a") => "audio/mp4",
            _ => "application/octet-stream",
        }
    }

    fn parse_transcript(body: &serde_json::Value) -> Result<String> {
        body.get("text")
            .and_then(|v| v.as_str())
            .map(|text| text.trim().to_string())
            .ok_or_else(|| anyhow!("transcription response has no 'text' field"))
    }
}

#[async_trait::async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        let file_part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(Self::mime_for(file_name))?;

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!("transcription request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "transcription HTTP {}: {}",
                status.as_u16(),
                body.chars().take(400).collect::<String>()
            );
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| anyhow!("transcription decode failed: {}", e))?;
        Self::parse_transcript(&body)
    }
}
