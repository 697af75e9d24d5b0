//! Error taxonomy for the dialogue client.
//!
//! Every failure is surfaced through the session's event channel tagged with
//! the stage it occurred in; nothing here aborts the process. Malformed or
//! unexpected backend payloads (bad JSON, missing fields, non-object SSE
//! data) are soft no-ops and never become a `ClientError`.

/// Errors that can occur during a dialogue exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Connect/send/read failure at the transport level.
    Transport(String),
    /// Backend answered with a non-2xx status code.
    HttpStatus(u16),
    /// A wait phase (connect, header-wait) exceeded the configured timeout.
    Timeout(&'static str),
    /// WAV container magic/chunk layout is broken or truncated.
    MalformedContainer,
    /// WAV container is valid but not 16-bit PCM.
    UnsupportedFormat,
    /// An operation that needs a dialogue partner was called without one.
    NoActivePartner,
    /// Request refused because a start or turn request is already in flight.
    Busy,
    /// A chunk exhausted its retry budget and was permanently dropped.
    ChunkUploadExhausted { chunk_index: u32 },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "Transport failure: {}", e),
            ClientError::HttpStatus(code) => write!(f, "Backend returned HTTP {}", code),
            ClientError::Timeout(phase) => write!(f, "Timed out waiting for {}", phase),
            ClientError::MalformedContainer => write!(f, "Malformed WAV container"),
            ClientError::UnsupportedFormat => {
                write!(f, "Unsupported WAV format (only 16-bit PCM is playable)")
            }
            ClientError::NoActivePartner => write!(f, "No active dialogue partner"),
            ClientError::Busy => write!(f, "A request is already in flight"),
            ClientError::ChunkUploadExhausted { chunk_index } => {
                write!(f, "Chunk {} dropped after exhausting retries", chunk_index)
            }
        }
    }
}

impl std::error::Error for ClientError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = ClientError::HttpStatus(502);
        assert!(err.to_string().contains("502"));

        let err = ClientError::Timeout("headers");
        assert!(err.to_string().contains("headers"));

        let err = ClientError::ChunkUploadExhausted { chunk_index: 3 };
        assert!(err.to_string().contains('3'));
    }
}
