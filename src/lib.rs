//! Streaming voice-dialogue client for the Atom Voice NPC backend.
//!
//! Turns intermittent microphone audio into backend exchanges (knowledge
//! base bootstrap, conversation start, turn exchange) and plays synthesized
//! speech back incrementally as it streams in, while reconstructing the
//! structured action directive (negotiation intent, price, mood, note)
//! embedded in the reply.
//!
//! # Architecture
//!
//! ```text
//! recorder ──▶ ChunkSession ──▶ upload_audio_chunk (serialized, retried)
//!                   │ all acked
//!                   ▼
//!           DialogueSession ──▶ /talk or /talk_stream
//!                   │                    │
//!                   │            SseStreamReader ──▶ PlaybackSink (per slice)
//!                   ▼                    ▼
//!              DialogueEvent ◀── TurnResult (text + actions + WAV)
//! ```
//!
//! The capture and playback device layer, the game/UI layer, and the story
//! database live outside this crate; they connect through the [`Partner`]
//! and [`PlaybackSink`] traits and the [`DialogueEvent`] channel.

pub mod action;
pub mod chunks;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod sse;
pub mod wav;

use serde::Serialize;
use tokio::sync::mpsc;

pub use action::{parse_action_line, strip_novoice, ActionDirective};
pub use config::ClientConfig;
pub use error::ClientError;
pub use protocol::{KnowledgeBase, TurnResult};
pub use session::{ConversationPhase, DialogueSession};

/// Sender half of the dialogue event bus.
pub type EventSender = mpsc::UnboundedSender<DialogueEvent>;

/// Receiver half, handed to the embedding application at construction.
pub type EventReceiver = mpsc::UnboundedReceiver<DialogueEvent>;

/// Events emitted by the session for the game/UI layer.
///
/// A fixed, enumerated set: listeners match on variants instead of probing
/// for dynamically-named signals.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DialogueEvent {
    /// The session's conversation phase changed.
    StateChanged { phase: ConversationPhase },
    /// A failure occurred, tagged with the request stage it belongs to.
    BackendError { stage: String, message: String },
    /// The NPC opened the conversation.
    ConversationStarted {
        partner_id: String,
        npc_text: String,
        actions: Vec<String>,
    },
    /// A turn exchange completed.
    TurnCompleted {
        partner_id: String,
        npc_text: String,
        actions: Vec<String>,
        directive: ActionDirective,
    },
    /// A decoded action was applied to the partner. Fires after
    /// `Partner::apply_action`, exactly once per decoded action.
    ActionReceived {
        partner_id: String,
        directive: ActionDirective,
    },
    /// First audio of a stream arrived; the latency the streaming path
    /// exists to minimize.
    LatencySample { stage: String, elapsed_ms: u64 },
    /// The diagnostic health probe changed its verdict.
    HealthChanged { healthy: bool },
}

/// The dialogue counterpart entity the session is negotiating with.
///
/// Implemented by the game layer; the session only needs an identity, an
/// optional configured conversation opener, and a way to hand decoded
/// actions back.
pub trait Partner: Send + Sync {
    fn id(&self) -> &str;

    /// Partner-specific instruction for opening the conversation, if any.
    fn start_instruction(&self) -> Option<String> {
        None
    }

    /// Apply a decoded action (negotiation intent plus optional price,
    /// mood and note) to the game-world entity.
    fn apply_action(&self, action: &str, directive: &ActionDirective);
}

/// Playback target for synthesized speech.
///
/// The streaming path hands over many small WAV containers per turn as the
/// audio arrives; the buffered path hands over one complete container.
/// Configured at construction; absence is a typed "no sink" state, never a
/// runtime capability probe.
pub trait PlaybackSink: Send + Sync {
    /// Play one complete WAV immediately.
    fn play_now(&self, wav: Vec<u8>);

    /// Queue one WAV for sequential playback after whatever is playing.
    fn enqueue(&self, wav: Vec<u8>);
}
