//! Dialogue session orchestrator.
//!
//! Tracks the two in-flight phases (conversation start, turn exchange),
//! owns the active partner and the current chunk session, and routes every
//! exchange through the streaming or buffered path per configuration. All
//! observable outcomes leave through the [`DialogueEvent`] channel.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::chunks::ChunkSession;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gateway::{self, BackendGateway};
use crate::metrics::{LatencyRecorder, Reporter};
use crate::protocol::{KnowledgeBase, TurnResult};
use crate::sse::{self, SseStreamReader};
use crate::{DialogueEvent, EventReceiver, Partner, PlaybackSink};

/// Fallback conversation opener when neither the caller nor the partner
/// supplies one.
const DEFAULT_START_INSTRUCTION: &str =
    "Greet the player and open the conversation in character.";

/// Externally observable session phase. Starting and turning are tracked
/// independently and are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    Idle,
    StartingConvo,
    WaitingTurn,
}

pub struct DialogueSession {
    config: ClientConfig,
    gateway: BackendGateway,
    reporter: Reporter,
    recorder: Arc<Mutex<LatencyRecorder>>,
    sink: Option<Arc<dyn PlaybackSink>>,
    partner: Option<Arc<dyn Partner>>,
    chunk_session: Option<ChunkSession>,
    starting: bool,
    turning: bool,
    backend_healthy: Option<bool>,
}

impl DialogueSession {
    /// Create a session and the receiving end of its event channel.
    pub fn new(
        config: ClientConfig,
        sink: Option<Arc<dyn PlaybackSink>>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let recorder = Arc::new(Mutex::new(LatencyRecorder::new()));
        let reporter = Reporter::new(events, recorder.clone());
        let gateway = BackendGateway::new(&config);
        let session = Self {
            config,
            gateway,
            reporter,
            recorder,
            sink,
            partner: None,
            chunk_session: None,
            starting: false,
            turning: false,
            backend_healthy: None,
        };
        (session, receiver)
    }

    pub fn phase(&self) -> ConversationPhase {
        if self.starting {
            ConversationPhase::StartingConvo
        } else if self.turning {
            ConversationPhase::WaitingTurn
        } else {
            ConversationPhase::Idle
        }
    }

    /// Swap the active partner. In-flight completions compare against the
    /// partner they captured at submission and discard themselves when it
    /// no longer matches.
    pub fn set_active_partner(&mut self, partner: Option<Arc<dyn Partner>>) {
        self.partner = partner;
    }

    pub fn active_partner_id(&self) -> Option<&str> {
        self.partner.as_deref().map(Partner::id)
    }

    /// Shared handle to the latency/error history, for diagnostic UIs.
    pub fn latency_recorder(&self) -> Arc<Mutex<LatencyRecorder>> {
        self.recorder.clone()
    }

    /// Last health-probe verdict, if a probe has run.
    pub fn backend_healthy(&self) -> Option<bool> {
        self.backend_healthy
    }

    /// Push the world knowledge base to the backend. Fire-and-forget
    /// bootstrap; a failure is reported but leaves the session usable.
    pub async fn bootstrap_knowledgebase(&self, kb: &KnowledgeBase) -> Result<(), ClientError> {
        match self.gateway.enter_knowledgebase(kb).await {
            Ok(()) => {
                log::info!("Knowledge base accepted by backend");
                Ok(())
            }
            Err(e) => {
                self.reporter.backend_error(gateway::STAGE_KNOWLEDGEBASE, &e);
                Err(e)
            }
        }
    }

    /// One-shot diagnostic probe. Success or failure only toggles the
    /// observable health state; there is no retry.
    pub async fn health_check(&mut self) -> bool {
        let healthy = self.gateway.health().await.is_ok();
        if self.backend_healthy != Some(healthy) {
            self.backend_healthy = Some(healthy);
            self.reporter.emit(DialogueEvent::HealthChanged { healthy });
        }
        healthy
    }

    /// Open a new chunked recording session.
    pub fn begin_recording(&mut self) {
        self.chunk_session = Some(ChunkSession::new(self.config.chunk_retry_limit));
    }

    /// Feed one mid-recording audio chunk into the upload queue and pump
    /// it toward the backend.
    pub async fn push_audio_chunk(&mut self, audio: Vec<u8>, filename: &str) {
        if audio.is_empty() {
            return;
        }
        self.discard_closed_recording();
        let retry_limit = self.config.chunk_retry_limit;
        let session = self
            .chunk_session
            .get_or_insert_with(|| ChunkSession::new(retry_limit));
        session.enqueue(audio, filename);
        self.pump_chunks().await;
    }

    /// End-of-recording entry point, for one-shot recordings and chunked
    /// ones alike.
    ///
    /// With an active chunk session, the trailing audio becomes the last
    /// chunk and the finalize barrier gates the chunk-less turn request.
    /// Without one, non-empty audio goes out as a direct turn request; a
    /// recording that produced nothing at all is dropped without a request.
    pub async fn submit_player_audio(
        &mut self,
        audio: Vec<u8>,
        filename: &str,
    ) -> Result<(), ClientError> {
        self.discard_closed_recording();
        let has_chunks = self
            .chunk_session
            .as_ref()
            .map(ChunkSession::produced_any)
            .unwrap_or(false);

        if !has_chunks {
            self.chunk_session = None;
            if audio.is_empty() {
                log::info!("Recording produced no audio, dropping turn");
                return Ok(());
            }
            return self
                .request_turn(Some((audio, filename.to_string())), None)
                .await;
        }

        if let Some(session) = self.chunk_session.as_mut() {
            if !audio.is_empty() {
                session.enqueue(audio, filename);
            }
            session.request_finalize(filename);
        }
        self.pump_chunks().await;
        self.try_finalize().await
    }

    /// Start a conversation with the active partner.
    pub async fn start_conversation(
        &mut self,
        instruction: Option<&str>,
    ) -> Result<(), ClientError> {
        let stream = self.config.streaming_enabled;
        let stage = if stream {
            sse::STAGE_START_STREAM
        } else {
            gateway::STAGE_START
        };

        let partner = match &self.partner {
            Some(partner) => partner.clone(),
            None => {
                let e = ClientError::NoActivePartner;
                self.reporter.backend_error(stage, &e);
                return Err(e);
            }
        };
        if self.starting || self.turning {
            log::debug!("Conversation start refused, request already in flight");
            return Err(ClientError::Busy);
        }

        let effective = instruction
            .map(str::to_string)
            .or_else(|| partner.start_instruction())
            .unwrap_or_else(|| DEFAULT_START_INSTRUCTION.to_string());
        let target = partner.id().to_string();

        self.starting = true;
        self.reporter.emit(DialogueEvent::StateChanged {
            phase: ConversationPhase::StartingConvo,
        });

        let request = self.gateway.start_convo_request(stream, &target, &effective);
        let outcome = self.dispatch(stage, stream, request).await;

        // The flag clears on every path, success or not.
        self.starting = false;
        self.reporter.emit(DialogueEvent::StateChanged { phase: self.phase() });

        let result = outcome?;
        if self.active_partner_id() != Some(target.as_str()) {
            log::info!("Discarding stale conversation start for '{}'", target);
            return Ok(());
        }
        self.apply_result(stage, &partner, &result, stream);
        self.reporter.emit(DialogueEvent::ConversationStarted {
            partner_id: target,
            npc_text: result.npc_text,
            actions: result.actions,
        });
        Ok(())
    }

    /// Issue one turn exchange with either direct audio or a finalized
    /// chunk session.
    async fn request_turn(
        &mut self,
        audio: Option<(Vec<u8>, String)>,
        session_id: Option<String>,
    ) -> Result<(), ClientError> {
        let stream = self.config.streaming_enabled;
        let stage = if stream {
            sse::STAGE_TALK_STREAM
        } else {
            gateway::STAGE_TALK
        };

        let partner = match &self.partner {
            Some(partner) => partner.clone(),
            None => {
                let e = ClientError::NoActivePartner;
                self.reporter.backend_error(stage, &e);
                return Err(e);
            }
        };
        if self.starting || self.turning {
            log::debug!("Turn refused, request already in flight");
            return Err(ClientError::Busy);
        }
        let target = partner.id().to_string();

        self.turning = true;
        self.reporter.emit(DialogueEvent::StateChanged {
            phase: ConversationPhase::WaitingTurn,
        });

        let outcome = match self
            .gateway
            .talk_request(stream, &target, session_id.as_deref(), audio)
        {
            Ok(request) => self.dispatch(stage, stream, request).await,
            Err(e) => {
                self.reporter.backend_error(stage, &e);
                Err(e)
            }
        };

        self.turning = false;
        self.reporter.emit(DialogueEvent::StateChanged { phase: self.phase() });

        let result = outcome?;
        if self.active_partner_id() != Some(target.as_str()) {
            log::info!("Discarding stale turn result for '{}'", target);
            return Ok(());
        }
        self.apply_result(stage, &partner, &result, stream);
        self.reporter.emit(DialogueEvent::TurnCompleted {
            partner_id: target,
            npc_text: result.npc_text,
            actions: result.actions,
            directive: result.directive,
        });
        Ok(())
    }

    /// Serialized upload pump: at most one chunk in flight, head of the
    /// queue only. Retries re-enter at the front, so order is preserved.
    async fn pump_chunks(&mut self) {
        loop {
            let item = match self.chunk_session.as_mut().and_then(ChunkSession::take_next) {
                Some(item) => item,
                None => break,
            };
            let outcome = self.gateway.upload_chunk(&item).await;
            let session = match self.chunk_session.as_mut() {
                Some(session) => session,
                None => break,
            };
            if let Some(err) = session.on_upload_result(item, outcome) {
                self.reporter.backend_error(gateway::STAGE_CHUNK_UPLOAD, &err);
            }
        }
    }

    /// Drop a chunk session left behind by an already-ended recording
    /// (finalize was requested, so the veto or the gate has had its say).
    /// Keeps a veto scoped to its own recording: the next one must get a
    /// fresh session id and clean counters.
    fn discard_closed_recording(&mut self) {
        if self
            .chunk_session
            .as_ref()
            .map(ChunkSession::finalize_requested)
            .unwrap_or(false)
        {
            self.chunk_session = None;
        }
    }

    /// Attempt the finalize gate; fire the chunk-less turn request if it
    /// opens. A vetoed session stays in place so late acknowledgments can
    /// never resurrect the turn within its own recording.
    async fn try_finalize(&mut self) -> Result<(), ClientError> {
        let busy = self.starting || self.turning;
        let ready = self
            .chunk_session
            .as_ref()
            .map(|session| session.ready_to_finalize(busy))
            .unwrap_or(false);
        if !ready {
            if self
                .chunk_session
                .as_ref()
                .map(ChunkSession::vetoed)
                .unwrap_or(false)
            {
                log::warn!("Turn vetoed, at least one chunk permanently failed");
            }
            return Ok(());
        }

        // Taking the session resets all counters for the next recording.
        let session = match self.chunk_session.take() {
            Some(session) => session,
            None => return Ok(()),
        };
        log::debug!(
            "Finalizing recording {} ({})",
            session.session_id(),
            session.finalize_filename()
        );
        self.request_turn(None, Some(session.session_id().to_string()))
            .await
    }

    /// Run one exchange through the configured transport path.
    async fn dispatch(
        &self,
        stage: &'static str,
        stream: bool,
        request: reqwest::RequestBuilder,
    ) -> Result<TurnResult, ClientError> {
        if stream {
            // Defer to the next scheduling tick so stream completions never
            // run re-entrantly inside the caller's own event dispatch.
            tokio::task::yield_now().await;
            let reader = SseStreamReader::new(stage, self.reporter.clone(), self.sink.clone());
            match reader.run(request, self.config.request_timeout()).await {
                Ok(state) => Ok(state.into_turn_result()),
                Err(e) => {
                    self.reporter.backend_error(stage, &e);
                    Err(e)
                }
            }
        } else {
            match self.gateway.exchange_buffered(request).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    self.reporter.backend_error(stage, &e);
                    Err(e)
                }
            }
        }
    }

    /// Side effects common to both exchange kinds: apply the decoded
    /// action to the partner, then emit the action event, in that order.
    /// The buffered path also hands its one complete WAV to the sink; the
    /// streaming path already played its slices incrementally.
    fn apply_result(
        &self,
        stage: &'static str,
        partner: &Arc<dyn Partner>,
        result: &TurnResult,
        streamed: bool,
    ) {
        if let Some(action) = result
            .directive
            .action
            .as_deref()
            .filter(|action| !action.is_empty())
        {
            partner.apply_action(action, &result.directive);
            self.reporter.emit(DialogueEvent::ActionReceived {
                partner_id: partner.id().to_string(),
                directive: result.directive.clone(),
            });
        }

        if !streamed && !result.audio.is_empty() {
            if let Some(sink) = &self.sink {
                sink.play_now(result.audio.clone());
            }
        }
        if result.audio.is_empty() && result.npc_text.is_empty() {
            self.reporter
                .backend_message(stage, "turn produced neither text nor audio");
        }
    }
}
