//! Wire types for the dialogue protocol.
//!
//! # Protocol Overview
//!
//! 1. `POST /enter_knowledgebase` - bootstrap the story/NPC knowledge base
//! 2. `POST /start_convo[_stream]` - NPC opens the conversation
//! 3. `POST /upload_audio_chunk` - incremental recording chunks
//! 4. `POST /talk[_stream]` - the turn request once chunks are acknowledged
//!
//! The `_stream` variants answer with Server-Sent-Events: blank-line
//! separated blocks of `data:` lines, each block one JSON payload
//! dispatched on its `type` field.

use serde::{Deserialize, Serialize};

use crate::action::ActionDirective;

/// Audio format the backend streams unless a `metadata` event overrides it.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

/// One SSE payload, dispatched on its `type` field.
///
/// Unknown types deserialize to `Unknown` instead of failing, so future
/// backend additions never abort a stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Early declaration of reply metadata and audio format.
    #[serde(rename = "metadata")]
    Metadata(StreamMeta),

    /// Stream end marker; may carry the authoritative action fields.
    #[serde(rename = "done")]
    Done(StreamMeta),

    /// One base64-encoded PCM slice.
    #[serde(rename = "audio")]
    Audio {
        #[serde(default)]
        audio: String,
    },

    /// Backend-reported failure; the body closing is still the
    /// authoritative end signal.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: String,
    },

    #[serde(other)]
    Unknown,
}

/// Reply metadata carried by `metadata` and `done` events.
///
/// The backend default-fills absent fields (`""`, `0`), so empty strings
/// and a zero price are treated as "not provided" when merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamMeta {
    #[serde(default)]
    pub npc_text: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
    #[serde(default)]
    pub bits_per_sample: Option<u16>,
}

/// JSON body of a chunk upload acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkAck {
    #[serde(default)]
    pub status: String,
}

impl ChunkAck {
    /// `ok`, `ignored` (hallucination filter) and `empty` all count as the
    /// backend having consumed the chunk.
    pub fn is_acked(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "ignored" | "empty")
    }
}

/// Bootstrap payload for `/enter_knowledgebase`.
///
/// The NPC entries come from the story database, whose format belongs to
/// the game layer; they pass through as opaque JSON objects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeBase {
    pub main_story: String,
    pub npcs: Vec<serde_json::Value>,
}

/// Canonical decoded outcome of a start/turn request, identical whether it
/// came from a buffered response or an SSE stream.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    /// Spoken/displayed reply text, `<novoice>` span already stripped.
    pub npc_text: String,
    /// Action names in discovery order, duplicates suppressed.
    pub actions: Vec<String>,
    /// Structured directive; if `directive.action` is set, that name is
    /// also present in `actions`.
    pub directive: ActionDirective,
    /// A complete WAV container; empty means "no playable audio".
    pub audio: Vec<u8>,
}

impl TurnResult {
    /// Append an action name, preserving insertion order and suppressing
    /// duplicates.
    pub fn push_action(&mut self, name: &str) {
        if !name.is_empty() && !self.actions.iter().any(|a| a == name) {
            self.actions.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_type_field() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"audio","audio":"AAAA"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Audio { audio } if audio == "AAAA"));

        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"error","error":"tts failed"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Error { error } if error == "tts failed"));
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"metadata","sample_rate":24000}"#).unwrap();
        match event {
            StreamEvent::Metadata(meta) => {
                assert_eq!(meta.sample_rate, Some(24000));
                assert!(meta.npc_text.is_none());
            }
            other => panic!("expected Metadata, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_does_not_fail() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"keepalive","whatever":1}"#).unwrap();
        assert!(matches!(event, StreamEvent::Unknown));
    }

    #[test]
    fn chunk_ack_accepted_statuses() {
        for status in ["ok", "ignored", "empty"] {
            let ack: ChunkAck =
                serde_json::from_str(&format!(r#"{{"status":"{}"}}"#, status)).unwrap();
            assert!(ack.is_acked());
        }
        let ack: ChunkAck = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert!(!ack.is_acked());
        let ack: ChunkAck = serde_json::from_str("{}").unwrap();
        assert!(!ack.is_acked());
    }

    #[test]
    fn push_action_deduplicates_in_order() {
        let mut result = TurnResult::default();
        result.push_action("greet");
        result.push_action("sell");
        result.push_action("greet");
        result.push_action("");
        assert_eq!(result.actions, vec!["greet", "sell"]);
    }
}
