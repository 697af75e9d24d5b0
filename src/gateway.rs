//! HTTP gateway to the dialogue backend.
//!
//! Owns the shared `reqwest` client and knows the endpoint paths, the
//! multipart shapes, and how to decode the three buffered response
//! flavors: raw audio bytes, JSON with `audio_base64`, and an
//! SSE-formatted body the server flushed in one piece. Header-borne
//! action fields (`x-npc-*`) override body-derived ones field by field.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};

use crate::action::{parse_action_line, strip_novoice};
use crate::chunks::{ChunkUpload, UploadOutcome};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{ChunkAck, KnowledgeBase, TurnResult};
use crate::sse::{take_block, StreamState};

/// Stage names for the buffered endpoints.
pub const STAGE_START: &str = "start_convo";
pub const STAGE_TALK: &str = "talk";
pub const STAGE_CHUNK_UPLOAD: &str = "upload_audio_chunk";
pub const STAGE_KNOWLEDGEBASE: &str = "enter_knowledgebase";
pub const STAGE_HEALTH: &str = "health";

const ACCEPT_DIALOGUE: &str = "text/event-stream, application/json, audio/wav";

pub struct BackendGateway {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl BackendGateway {
    pub fn new(config: &ClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .expect("Failed to build HTTP client");
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Build (but do not send) a conversation-start request.
    pub fn start_convo_request(
        &self,
        stream: bool,
        npc_id: &str,
        instruction: &str,
    ) -> reqwest::RequestBuilder {
        let path = if stream { "start_convo_stream" } else { "start_convo" };
        self.client
            .post(self.url(path))
            .header(ACCEPT, ACCEPT_DIALOGUE)
            .json(&serde_json::json!({
                "npc_id": npc_id,
                "instruction": instruction,
            }))
    }

    /// Build a turn request. Exactly one of `audio` (direct upload) or
    /// `session_id` (previously streamed chunks) is normally supplied.
    pub fn talk_request(
        &self,
        stream: bool,
        npc_id: &str,
        session_id: Option<&str>,
        audio: Option<(Vec<u8>, String)>,
    ) -> Result<reqwest::RequestBuilder, ClientError> {
        let mut form = Form::new().text("npc_id", npc_id.to_string());
        if let Some(session_id) = session_id {
            form = form.text("session_id", session_id.to_string());
        }
        if let Some((bytes, filename)) = audio {
            let part = Part::bytes(bytes)
                .file_name(filename)
                .mime_str("audio/wav")
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            form = form.part("audio", part);
        }
        let path = if stream { "talk_stream" } else { "talk" };
        Ok(self
            .client
            .post(self.url(path))
            .header(ACCEPT, ACCEPT_DIALOGUE)
            .multipart(form))
    }

    /// Upload one recorded chunk. Never returns a hard error: every
    /// failure mode folds into [`UploadOutcome::Rejected`] so the queue
    /// can decide between retry and veto.
    pub async fn upload_chunk(&self, item: &ChunkUpload) -> UploadOutcome {
        let part = match Part::bytes(item.audio.clone())
            .file_name(item.filename.clone())
            .mime_str("audio/wav")
        {
            Ok(part) => part,
            Err(e) => return UploadOutcome::Rejected(e.to_string()),
        };
        let form = Form::new()
            .text("session_id", item.session_id.clone())
            .text("chunk_index", item.chunk_index.to_string())
            .part("audio", part);

        let request = self.client.post(self.url("upload_audio_chunk")).multipart(form);
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => return UploadOutcome::Rejected("request timed out".to_string()),
            Ok(Err(e)) => return UploadOutcome::Rejected(e.to_string()),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return UploadOutcome::Rejected(format!("HTTP {}", status.as_u16()));
        }
        match response.json::<ChunkAck>().await {
            Ok(ack) if ack.is_acked() => UploadOutcome::Acked,
            Ok(ack) => UploadOutcome::Rejected(format!("server answered '{}'", ack.status)),
            Err(e) => UploadOutcome::Rejected(format!("unreadable ack: {}", e)),
        }
    }

    /// Push the world knowledge base to the backend.
    pub async fn enter_knowledgebase(&self, kb: &KnowledgeBase) -> Result<(), ClientError> {
        let request = self.client.post(self.url("enter_knowledgebase")).json(kb);
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::HttpStatus(status.as_u16()))
        }
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        let response = self.send(self.client.get(self.url("health"))).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::HttpStatus(status.as_u16()))
        }
    }

    /// Send a non-streaming dialogue request and decode the full response.
    pub async fn exchange_buffered(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<TurnResult, ClientError> {
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus(status.as_u16()));
        }
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(decode_buffered(&headers, &body))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ClientError> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => Err(ClientError::Timeout("headers")),
            Ok(Err(e)) => Err(send_error(&e)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

pub(crate) fn send_error(e: &reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(if e.is_connect() { "connect" } else { "headers" })
    } else {
        ClientError::Transport(e.to_string())
    }
}

/// Decode a fully buffered dialogue response into a turn result.
///
/// Body flavors, in sniffing order: an SSE-formatted body replayed
/// through the stream parser, raw WAV bytes (by content type or `RIFF`
/// magic), and JSON carrying `audio_base64`/`npc_text`. Afterwards the
/// `x-npc-*` headers are merged on top, each present header winning over
/// the body-derived value for that field only.
pub fn decode_buffered(headers: &HeaderMap, body: &[u8]) -> TurnResult {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut result = TurnResult::default();
    let mut raw_text = String::new();

    if content_type.starts_with("text/event-stream") {
        let mut state = StreamState::default();
        let mut buffer = String::from_utf8_lossy(body).into_owned();
        while let Some(block) = take_block(&mut buffer) {
            state.apply_block(&block);
        }
        if !buffer.trim().is_empty() {
            state.apply_block(&buffer);
        }
        result = state.into_turn_result();
    } else if content_type.starts_with("audio/") || body.starts_with(b"RIFF") {
        result.audio = body.to_vec();
    } else if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(b64) = value.get("audio_base64").and_then(|v| v.as_str()) {
            match STANDARD.decode(b64) {
                Ok(bytes) => result.audio = bytes,
                Err(e) => log::debug!("Ignoring undecodable audio_base64: {}", e),
            }
        }
        if let Some(text) = value.get("npc_text").and_then(|v| v.as_str()) {
            raw_text = text.to_string();
        }
    } else {
        log::debug!("Unrecognized response body ({} bytes), ignoring", body.len());
    }

    // Reply text: the percent-encoded header wins over the body text.
    if let Some(text) = header_string(headers, "x-npc-response-text", true) {
        raw_text = text;
    }
    if !raw_text.is_empty() {
        result.npc_text = strip_novoice(&raw_text);
    }

    // Action fields: header, then the action line embedded in the text.
    let from_text = parse_action_line(&raw_text);
    if let Some(action) = header_string(headers, "x-npc-action", false) {
        result.directive.action = Some(action);
    } else if result.directive.action.is_none() {
        result.directive.action = from_text.action;
    }
    if let Some(price) = header_string(headers, "x-npc-price", false)
        .and_then(|p| p.parse::<f64>().ok())
        .filter(|p| *p != 0.0)
    {
        result.directive.price = Some(price);
    } else if result.directive.price.is_none() {
        result.directive.price = from_text.price;
    }
    if let Some(mood) = header_string(headers, "x-npc-mood", false) {
        result.directive.mood = Some(mood);
    } else if result.directive.mood.is_none() {
        result.directive.mood = from_text.mood;
    }
    if let Some(note) = header_string(headers, "x-npc-note", true) {
        result.directive.note = Some(note);
    } else if result.directive.note.is_none() {
        result.directive.note = from_text.note;
    }

    if let Some(list) = header_string(headers, "x-npc-actions", false) {
        for name in list.split(',') {
            result.push_action(name.trim());
        }
    }
    if let Some(action) = result.directive.action.clone() {
        result.push_action(&action);
    }
    result
}

fn header_string(headers: &HeaderMap, name: &str, percent_decoded: bool) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if percent_decoded {
        match urlencoding::decode(raw) {
            Ok(decoded) => Some(decoded.into_owned()),
            Err(_) => Some(raw.to_string()),
        }
    } else {
        Some(raw.to_string())
    }
}
