//! Server-Sent-Events stream reader for the `_stream` endpoints.
//!
//! Drives one streaming POST exchange: connect and header phases are
//! bounded by the configured timeout, then the body is drained chunk by
//! chunk. Complete event blocks (terminated by a blank line) are peeled off
//! a rolling text buffer as they arrive; when the body closes, a trailing
//! partial block is flushed through the same handler so streams that end
//! without a final separator never drop their last event.
//!
//! The parsing core ([`StreamState`]) is separated from the transport
//! driver ([`SseStreamReader`]) so the buffered path can replay an
//! SSE-flavored response body through the identical merge logic.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::StreamExt;

use crate::action::{parse_action_line, ActionDirective};
use crate::error::ClientError;
use crate::gateway::send_error;
use crate::metrics::Reporter;
use crate::protocol::{
    StreamEvent, StreamMeta, TurnResult, DEFAULT_BITS_PER_SAMPLE, DEFAULT_CHANNELS,
    DEFAULT_SAMPLE_RATE,
};
use crate::wav;
use crate::PlaybackSink;

/// Stage names for first-audio latency samples and error tagging.
pub const STAGE_START_STREAM: &str = "start_convo_stream";
pub const STAGE_TALK_STREAM: &str = "talk_stream";

/// Extract one complete event block from the rolling buffer, if present.
///
/// Blocks are delimited by a blank line: two consecutive line breaks, each
/// independently bare-LF or CRLF. A lone `\r` at the buffer's end may be
/// the start of a CRLF still in flight and is left in place.
pub fn take_block(buffer: &mut String) -> Option<String> {
    let bytes = buffer.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'\n' {
            continue;
        }
        let rest = &bytes[i + 1..];
        let tail = if rest.starts_with(b"\n") {
            1
        } else if rest.starts_with(b"\r\n") {
            2
        } else {
            continue;
        };
        let block = buffer[..i].trim_end_matches('\r').to_string();
        buffer.drain(..i + 1 + tail);
        return Some(block);
    }
    None
}

/// What applying one block did, beyond merging metadata.
#[derive(Debug)]
pub enum BlockEffect {
    /// Nothing observable (metadata merged, block ignored, or unknown type).
    None,
    /// A PCM slice was appended. `first` marks the stream's first audio.
    Audio { pcm: Vec<u8>, first: bool },
    /// The backend reported an error; the stream itself continues.
    BackendError(String),
}

/// Accumulated state of one in-flight stream. Destroyed on termination.
#[derive(Debug)]
pub struct StreamState {
    npc_text: String,
    actions: Vec<String>,
    directive: ActionDirective,
    pcm: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    first_audio_reported: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            npc_text: String::new(),
            actions: Vec::new(),
            directive: ActionDirective::default(),
            pcm: Vec::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            first_audio_reported: false,
        }
    }
}

impl StreamState {
    /// Apply one SSE block: concatenate its `data:` payloads, parse the
    /// JSON, and dispatch on the `type` field. Blocks without `data:`
    /// lines, unparseable payloads and unknown types are soft no-ops:
    /// transport garbage must never abort the stream.
    pub fn apply_block(&mut self, block: &str) -> BlockEffect {
        let payload: Vec<&str> = block
            .lines()
            .filter_map(|line| line.trim().strip_prefix("data:"))
            .map(str::trim)
            .collect();
        if payload.is_empty() {
            return BlockEffect::None;
        }

        let event = match serde_json::from_str::<StreamEvent>(&payload.join("\n")) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Ignoring unparseable stream payload: {}", e);
                return BlockEffect::None;
            }
        };

        match event {
            StreamEvent::Metadata(meta) => {
                self.merge_meta(meta, true);
                BlockEffect::None
            }
            // The backend may deliver the authoritative action fields only
            // at stream end; accept either timing.
            StreamEvent::Done(meta) => {
                self.merge_meta(meta, false);
                BlockEffect::None
            }
            StreamEvent::Audio { audio } => self.apply_audio(&audio),
            StreamEvent::Error { error } => BlockEffect::BackendError(error),
            StreamEvent::Unknown => BlockEffect::None,
        }
    }

    /// Merge a `metadata`/`done` payload. The backend default-fills absent
    /// fields with `""` and `0`, so those are treated as "not provided".
    /// Only `metadata` may override the audio format.
    fn merge_meta(&mut self, meta: StreamMeta, allow_format: bool) {
        if let Some(text) = meta.npc_text.filter(|t| !t.is_empty()) {
            self.npc_text = text;
        }
        if let Some(actions) = meta.actions {
            self.actions.clear();
            for name in &actions {
                push_unique(&mut self.actions, name);
            }
        }
        if let Some(action) = meta.action.filter(|a| !a.is_empty()) {
            push_unique(&mut self.actions, &action);
            self.directive.action = Some(action);
        }
        if let Some(price) = meta.price.filter(|p| *p != 0.0) {
            self.directive.price = Some(price);
        }
        if let Some(mood) = meta.mood.filter(|m| !m.is_empty()) {
            self.directive.mood = Some(mood);
        }
        if let Some(note) = meta.note.filter(|n| !n.is_empty()) {
            self.directive.note = Some(note);
        }
        if allow_format {
            if let Some(rate) = meta.sample_rate {
                self.sample_rate = rate;
            }
            if let Some(channels) = meta.channels {
                self.channels = channels;
            }
            if let Some(bits) = meta.bits_per_sample {
                self.bits_per_sample = bits;
            }
        }
    }

    fn apply_audio(&mut self, b64: &str) -> BlockEffect {
        if b64.is_empty() {
            return BlockEffect::None;
        }
        let pcm = match STANDARD.decode(b64) {
            Ok(pcm) if !pcm.is_empty() => pcm,
            Ok(_) => return BlockEffect::None,
            Err(e) => {
                log::debug!("Ignoring undecodable audio payload: {}", e);
                return BlockEffect::None;
            }
        };
        let first = !self.first_audio_reported;
        self.first_audio_reported = true;
        self.pcm.extend_from_slice(&pcm);
        BlockEffect::Audio { pcm, first }
    }

    /// Wrap one PCM slice as a standalone WAV container in the stream's
    /// declared format, for incremental playback.
    pub fn wrap_slice(&self, pcm: &[u8]) -> Vec<u8> {
        wav::encode(pcm, self.sample_rate, self.channels, self.bits_per_sample)
    }

    /// Convert the terminated stream into the canonical turn result.
    ///
    /// Stream-sourced directive fields win; an action line embedded in the
    /// reply text fills any gaps. The `<novoice>` span is stripped from the
    /// spoken text.
    pub fn into_turn_result(self) -> TurnResult {
        let mut result = TurnResult {
            npc_text: crate::action::strip_novoice(&self.npc_text),
            actions: self.actions,
            directive: self.directive,
            audio: Vec::new(),
        };

        let from_text = parse_action_line(&self.npc_text);
        if result.directive.action.is_none() {
            result.directive.action = from_text.action;
        }
        if result.directive.price.is_none() {
            result.directive.price = from_text.price;
        }
        if result.directive.mood.is_none() {
            result.directive.mood = from_text.mood;
        }
        if result.directive.note.is_none() {
            result.directive.note = from_text.note;
        }
        if let Some(action) = result.directive.action.clone() {
            result.push_action(&action);
        }

        if !self.pcm.is_empty() {
            result.audio = wav::encode(
                &self.pcm,
                self.sample_rate,
                self.channels,
                self.bits_per_sample,
            );
        }
        result
    }
}

fn push_unique(actions: &mut Vec<String>, name: &str) {
    if !name.is_empty() && !actions.iter().any(|a| a == name) {
        actions.push(name.to_string());
    }
}

/// Drives one streaming exchange and feeds incoming body text through
/// [`StreamState`], reporting first-audio latency and handing each audio
/// slice to the playback sink as it arrives.
pub struct SseStreamReader {
    stage: &'static str,
    reporter: Reporter,
    sink: Option<Arc<dyn PlaybackSink>>,
    state: StreamState,
    buffer: String,
    pending: Vec<u8>,
    submitted_at: Instant,
}

impl SseStreamReader {
    pub fn new(
        stage: &'static str,
        reporter: Reporter,
        sink: Option<Arc<dyn PlaybackSink>>,
    ) -> Self {
        Self {
            stage,
            reporter,
            sink,
            state: StreamState::default(),
            buffer: String::new(),
            pending: Vec::new(),
            submitted_at: Instant::now(),
        }
    }

    /// Execute the exchange. Connect/header failures and non-2xx statuses
    /// are terminal; a transport error mid-body is treated as the body
    /// closing, since closure is the authoritative end-of-stream signal.
    pub async fn run(
        mut self,
        request: reqwest::RequestBuilder,
        timeout: std::time::Duration,
    ) -> Result<StreamState, ClientError> {
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => return Err(ClientError::Timeout("headers")),
            Ok(Err(e)) => return Err(send_error(&e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus(status.as_u16()));
        }

        let mut body = response.bytes_stream();
        while let Some(next) = body.next().await {
            match next {
                Ok(bytes) => self.ingest(&bytes),
                Err(e) => {
                    log::warn!("Stream body ended with transport error: {}", e);
                    break;
                }
            }
        }
        Ok(self.finish())
    }

    /// Feed raw body bytes into the block parser. UTF-8 sequences split
    /// across network chunks are held back until complete.
    pub fn ingest(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let text = drain_utf8(&mut self.pending);
        self.buffer.push_str(&text);
        while let Some(block) = take_block(&mut self.buffer) {
            self.dispatch(&block);
        }
    }

    /// Flush a trailing partial block and return the accumulated state.
    pub fn finish(mut self) -> StreamState {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
        let trailing = std::mem::take(&mut self.buffer);
        if !trailing.trim().is_empty() {
            self.dispatch(&trailing);
        }
        self.state
    }

    fn dispatch(&mut self, block: &str) {
        match self.state.apply_block(block) {
            BlockEffect::None => {}
            BlockEffect::Audio { pcm, first } => {
                if first {
                    let elapsed = self.submitted_at.elapsed().as_millis() as u64;
                    self.reporter.latency(self.stage, elapsed);
                }
                if let Some(sink) = &self.sink {
                    sink.enqueue(self.state.wrap_slice(&pcm));
                }
            }
            BlockEffect::BackendError(message) => {
                self.reporter.backend_message(self.stage, &message);
            }
        }
    }
}

/// Take the longest valid UTF-8 prefix out of `pending`, leaving an
/// incomplete trailing sequence in place. Invalid bytes (not merely
/// incomplete) are replaced so the stream keeps making progress.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    // Broken sequence in the middle: replace and continue.
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + len);
                    }
                    // Incomplete tail: keep it for the next network chunk.
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LatencyRecorder;
    use crate::DialogueEvent;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn audio_block(pcm: &[u8]) -> String {
        format!(
            "data: {{\"type\":\"audio\",\"audio\":\"{}\"}}\n\n",
            STANDARD.encode(pcm)
        )
    }

    #[test]
    fn extracts_blocks_in_order() {
        let mut buffer = String::from(
            "data: {\"type\":\"metadata\",\"sample_rate\":24000}\n\ndata: {\"type\":\"audio\",\"audio\":\"AAEC\"}\n\npartial",
        );
        let first = take_block(&mut buffer).unwrap();
        assert!(first.contains("metadata"));
        let second = take_block(&mut buffer).unwrap();
        assert!(second.contains("audio"));
        assert!(take_block(&mut buffer).is_none());
        assert_eq!(buffer, "partial");
    }

    #[test]
    fn handles_crlf_delimiters() {
        let mut buffer = String::from("data: {\"type\":\"done\"}\r\n\r\nrest");
        let block = take_block(&mut buffer).unwrap();
        assert!(block.contains("done"));
        assert_eq!(buffer, "rest");
    }

    #[test]
    fn handles_mixed_line_break_delimiters() {
        // LF data line, CRLF blank line.
        let mut buffer = String::from("data: {\"type\":\"done\"}\n\r\nrest");
        assert!(take_block(&mut buffer).unwrap().contains("done"));
        assert_eq!(buffer, "rest");

        // CRLF data line, LF blank line.
        let mut buffer = String::from("data: {\"type\":\"done\"}\r\n\nrest");
        assert_eq!(take_block(&mut buffer).unwrap(), "data: {\"type\":\"done\"}");
        assert_eq!(buffer, "rest");

        // A trailing lone CR may be half of a CRLF, so nothing splits yet.
        let mut buffer = String::from("data: {\"type\":\"done\"}\n\r");
        assert!(take_block(&mut buffer).is_none());
        buffer.push('\n');
        assert!(take_block(&mut buffer).unwrap().contains("done"));
    }

    #[test]
    fn multi_data_lines_join_into_one_payload() {
        let mut state = StreamState::default();
        let block = "data: {\"type\":\"done\",\n data: \"action\":\"agree\"}";
        // Joined with a newline inside the JSON string, this still parses.
        let joined = block
            .lines()
            .filter_map(|l| l.trim().strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        assert!(serde_json::from_str::<serde_json::Value>(&joined).is_ok());
        state.apply_block(block);
        let result = state.into_turn_result();
        assert_eq!(result.directive.action.as_deref(), Some("agree"));
    }

    #[test]
    fn non_object_payload_is_ignored() {
        let mut state = StreamState::default();
        assert!(matches!(state.apply_block("data: 42"), BlockEffect::None));
        assert!(matches!(
            state.apply_block("data: not json at all"),
            BlockEffect::None
        ));
        assert!(matches!(state.apply_block(": comment only"), BlockEffect::None));
    }

    #[test]
    fn metadata_overrides_audio_format() {
        let mut state = StreamState::default();
        state.apply_block("data: {\"type\":\"metadata\",\"sample_rate\":24000,\"channels\":2}");
        state.apply_block(&audio_block(&[1, 2, 3, 4]));
        let result = state.into_turn_result();
        let decoded = crate::wav::decode(&result.audio).unwrap();
        assert_eq!(decoded.sample_rate, 24000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.pcm, vec![1, 2, 3, 4]);
    }

    #[test]
    fn done_event_merges_action_fields_at_stream_end() {
        let mut state = StreamState::default();
        state.apply_block(&audio_block(&[9, 9, 9, 9]));
        state.apply_block(
            "data: {\"type\":\"done\",\"npc_text\":\"Deal.\",\"action\":\"agree\",\"price\":500}",
        );
        let result = state.into_turn_result();
        assert_eq!(result.npc_text, "Deal.");
        assert_eq!(result.directive.action.as_deref(), Some("agree"));
        assert_eq!(result.directive.price, Some(500.0));
        assert_eq!(result.actions, vec!["agree"]);
        assert!(!result.audio.is_empty());
    }

    #[test]
    fn default_filled_fields_do_not_clobber() {
        let mut state = StreamState::default();
        state.apply_block("data: {\"type\":\"metadata\",\"action\":\"sell\",\"price\":120}");
        // The done event default-fills fields the LLM left empty.
        state.apply_block("data: {\"type\":\"done\",\"npc_text\":\"Sold.\",\"action\":\"\",\"price\":0}");
        let result = state.into_turn_result();
        assert_eq!(result.directive.action.as_deref(), Some("sell"));
        assert_eq!(result.directive.price, Some(120.0));
    }

    #[test]
    fn first_audio_flagged_exactly_once() {
        let mut state = StreamState::default();
        match state.apply_block(&audio_block(&[1, 2])) {
            BlockEffect::Audio { first, .. } => assert!(first),
            other => panic!("expected Audio, got {:?}", other),
        }
        match state.apply_block(&audio_block(&[3, 4])) {
            BlockEffect::Audio { first, .. } => assert!(!first),
            other => panic!("expected Audio, got {:?}", other),
        }
        // Empty payloads are ignored and never count as audio.
        assert!(matches!(
            state.apply_block("data: {\"type\":\"audio\",\"audio\":\"\"}"),
            BlockEffect::None
        ));
    }

    struct CollectingSink(Mutex<Vec<Vec<u8>>>);

    impl crate::PlaybackSink for CollectingSink {
        fn play_now(&self, wav: Vec<u8>) {
            self.0.lock().unwrap().push(wav);
        }
        fn enqueue(&self, wav: Vec<u8>) {
            self.0.lock().unwrap().push(wav);
        }
    }

    fn reader_with_channel() -> (
        SseStreamReader,
        mpsc::UnboundedReceiver<DialogueEvent>,
        Arc<CollectingSink>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Mutex::new(LatencyRecorder::new()));
        let reporter = Reporter::new(tx, recorder);
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let reader = SseStreamReader::new(
            STAGE_TALK_STREAM,
            reporter,
            Some(sink.clone() as Arc<dyn crate::PlaybackSink>),
        );
        (reader, rx, sink)
    }

    #[test]
    fn latency_reported_once_and_each_slice_reaches_the_sink() {
        let (mut reader, mut rx, sink) = reader_with_channel();
        reader.ingest(audio_block(&[1, 2, 3, 4]).as_bytes());
        reader.ingest(audio_block(&[5, 6]).as_bytes());
        let state = reader.finish();

        let mut latency_samples = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DialogueEvent::LatencySample { .. }) {
                latency_samples += 1;
            }
        }
        assert_eq!(latency_samples, 1);

        // Two small standalone WAV containers, one per slice.
        let wavs = sink.0.lock().unwrap();
        assert_eq!(wavs.len(), 2);
        assert_eq!(crate::wav::decode(&wavs[0]).unwrap().pcm, vec![1, 2, 3, 4]);
        assert_eq!(crate::wav::decode(&wavs[1]).unwrap().pcm, vec![5, 6]);

        // The final result still carries the full concatenated buffer.
        let result = state.into_turn_result();
        assert_eq!(
            crate::wav::decode(&result.audio).unwrap().pcm,
            vec![1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn trailing_block_without_separator_is_flushed_on_close() {
        let (mut reader, _rx, _sink) = reader_with_channel();
        reader.ingest(b"data: {\"type\":\"metadata\",\"npc_text\":\"Hello.\"}\n\n");
        // Stream ends mid-block, no final blank line.
        reader.ingest(b"data: {\"type\":\"done\",\"action\":\"greet\"}");
        let result = reader.finish().into_turn_result();
        assert_eq!(result.npc_text, "Hello.");
        assert_eq!(result.directive.action.as_deref(), Some("greet"));
    }

    #[test]
    fn backend_error_event_does_not_terminate_the_stream() {
        let (mut reader, mut rx, _sink) = reader_with_channel();
        reader.ingest(b"data: {\"type\":\"error\",\"error\":\"tts hiccup\"}\n\n");
        reader.ingest(audio_block(&[7, 7]).as_bytes());
        let state = reader.finish();

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let DialogueEvent::BackendError { message, stage } = event {
                assert_eq!(stage, STAGE_TALK_STREAM);
                assert!(message.contains("tts hiccup"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(!state.into_turn_result().audio.is_empty());
    }

    #[test]
    fn utf8_split_across_chunks_survives() {
        let (mut reader, _rx, _sink) = reader_with_channel();
        let block = "data: {\"type\":\"metadata\",\"npc_text\":\"Eşyalarımı çaldılar!\"}\n\n";
        let bytes = block.as_bytes();
        // Split inside the multi-byte 'ş'.
        let split = block.find('ş').unwrap() + 1;
        reader.ingest(&bytes[..split]);
        reader.ingest(&bytes[split..]);
        let result = reader.finish().into_turn_result();
        assert_eq!(result.npc_text, "Eşyalarımı çaldılar!");
    }
}
