//! Per-connection SASL session state and chunked `AUTHENTICATE` reassembly.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{
    auth::{ConnectionInfo, Mechanism},
    scram::ServerExchange,
};

/// Payload lines are base64 of at most this many characters; a line of exactly this
/// length means more follows.
pub(crate) const CHUNK_LEN: usize = 400;

#[derive(Clone, Debug)]
pub(crate) enum SessionState {
    /// Mechanism chosen, exchanging payload.
    Negotiating,
    /// An IdP request is in flight for this attempt.
    AwaitingIdp,
    /// Terminal success; kept so that re-authentication policy can be enforced.
    Completed { account: String },
    /// The connection went away mid-attempt; late completions must only clean up.
    Cancelled,
}

/// Mechanism-specific scratch carried between payload lines.
#[derive(Clone, Debug, Default)]
pub(crate) enum MechScratch {
    #[default]
    None,
    /// SCRAM state between the two round trips.
    ScramExchange(Box<ServerExchange>),
}

pub(crate) struct SaslSession {
    pub(crate) mechanism: Mechanism,
    pub(crate) state: SessionState,
    pub(crate) scratch: MechScratch,
    pub(crate) info: ConnectionInfo,
    /// Validates late async completions: a callback whose sequence number no longer
    /// matches the live session must not produce user-visible effects. The deadline
    /// watchdog carries the same pair.
    pub(crate) seq: u64,
    buffer: String,
}

/// Result of folding one `AUTHENTICATE` line into the reassembly buffer.
#[derive(Debug, PartialEq)]
pub(crate) enum ChunkOutcome {
    /// Exactly [`CHUNK_LEN`] characters: more follows.
    More,
    /// Payload complete and decoded.
    Done(Vec<u8>),
    /// The accumulated payload exceeded the configured bound.
    TooLong,
    /// The accumulated payload was not valid base64.
    Malformed,
}

impl SaslSession {
    pub(crate) fn new(mechanism: Mechanism, info: ConnectionInfo, seq: u64) -> Self {
        Self {
            mechanism,
            state: SessionState::Negotiating,
            scratch: MechScratch::None,
            info,
            seq,
            buffer: String::new(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Completed { .. } | SessionState::Cancelled
        )
    }

    /// Folds one payload line into the buffer. `+` alone stands for zero bytes.
    pub(crate) fn push_chunk(&mut self, line: &str, decoded_limit: usize) -> ChunkOutcome {
        if line != "+" {
            self.buffer.push_str(line);
        }
        // Worst-case decoded size of the accumulated base64.
        if self.buffer.len() / 4 * 3 > decoded_limit {
            self.buffer.clear();
            return ChunkOutcome::TooLong;
        }
        if line.len() == CHUNK_LEN {
            return ChunkOutcome::More;
        }
        let complete = std::mem::take(&mut self.buffer);
        match STANDARD.decode(&complete) {
            Ok(bytes) => ChunkOutcome::Done(bytes),
            Err(_) => ChunkOutcome::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SaslSession {
        SaslSession::new(Mechanism::Plain, ConnectionInfo::default(), 1)
    }

    #[test]
    fn single_line_payload() {
        let mut session = session();
        let payload = STANDARD.encode(b"\0alice\0p@ssw0rd");
        match session.push_chunk(&payload, 8192) {
            ChunkOutcome::Done(bytes) => assert_eq!(bytes, b"\0alice\0p@ssw0rd"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn plus_is_zero_bytes() {
        let mut session = session();
        assert_eq!(session.push_chunk("+", 8192), ChunkOutcome::Done(Vec::new()));
    }

    #[test]
    fn exact_chunk_means_more() {
        let mut session = session();
        let blob = vec![b'Q'; 600];
        let encoded = STANDARD.encode(&blob); // 800 chars
        let (first, second) = encoded.split_at(CHUNK_LEN);
        assert_eq!(session.push_chunk(first, 8192), ChunkOutcome::More);
        match session.push_chunk(second, 8192) {
            ChunkOutcome::Done(bytes) => assert_eq!(bytes, blob),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn trailing_plus_flushes_exact_multiple() {
        let mut session = session();
        let blob = vec![b'Q'; 300];
        let encoded = STANDARD.encode(&blob); // exactly 400 chars
        assert_eq!(encoded.len(), CHUNK_LEN);
        assert_eq!(session.push_chunk(&encoded, 8192), ChunkOutcome::More);
        match session.push_chunk("+", 8192) {
            ChunkOutcome::Done(bytes) => assert_eq!(bytes, blob),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut session = session();
        let chunk = "A".repeat(CHUNK_LEN);
        let mut outcome = ChunkOutcome::More;
        for _ in 0..30 {
            outcome = session.push_chunk(&chunk, 8192);
            if outcome != ChunkOutcome::More {
                break;
            }
        }
        assert_eq!(outcome, ChunkOutcome::TooLong);
    }

    #[test]
    fn bad_base64_is_malformed() {
        let mut session = session();
        assert_eq!(
            session.push_chunk("!!!not-base64!!!", 8192),
            ChunkOutcome::Malformed
        );
    }
}
