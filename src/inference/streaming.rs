//! Streaming inference support
//!
//! A generation is consumed as a lazy, finite sequence of [`StreamToken`]s:
//! zero or more text increments followed by exactly one terminal item.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::inference::engine::{EngineError, GenerationFlags};
use crate::inference::session::GenerationOutcome;

/// Represents an item emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A non-empty, valid UTF-8 text increment
    Token(String),
    /// Generation finished; carries the final text and stop reason
    Done(GenerationOutcome),
    /// Generation failed before producing output
    Error(EngineError),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Returns true for the last item of a stream
    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is an Error variant
    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            StreamToken::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Receiving end of one generation.
///
/// Not restartable. Dropping it before the terminal item cancels the
/// generation it belongs to.
#[derive(Debug)]
pub struct TokenStream {
    rx: Receiver<StreamToken>,
    flags: Arc<GenerationFlags>,
    epoch: u64,
    finished: bool,
}

impl TokenStream {
    pub(crate) fn new(rx: Receiver<StreamToken>, flags: Arc<GenerationFlags>, epoch: u64) -> Self {
        Self {
            rx,
            flags,
            epoch,
            finished: false,
        }
    }

    /// Requests cancellation; the stream still ends with a terminal item.
    pub fn cancel(&self) {
        if !self.finished {
            self.flags.cancel(self.epoch);
        }
    }

    /// Consumes the stream, passing every increment to `sink`.
    pub fn drain_into<F>(mut self, mut sink: F) -> Result<GenerationOutcome, EngineError>
    where
        F: FnMut(&str),
    {
        while let Some(token) = self.next() {
            match token {
                StreamToken::Token(text) => sink(&text),
                StreamToken::Done(outcome) => return Ok(outcome),
                StreamToken::Error(e) => return Err(e),
            }
        }
        Err(EngineError::WorkerError(
            "generation ended without a result".to_string(),
        ))
    }
}

impl Iterator for TokenStream {
    type Item = StreamToken;

    fn next(&mut self) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(token) => {
                self.finished = token.is_terminal();
                Some(token)
            }
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("Token stream dropped early, cancelling generation");
            self.flags.cancel(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::session::StopReason;
    use std::sync::mpsc;
    use uuid::Uuid;

    fn outcome(text: &str) -> GenerationOutcome {
        GenerationOutcome {
            id: Uuid::new_v4(),
            text: text.to_string(),
            stop_reason: StopReason::EndOfGeneration,
            prompt_tokens: 1,
            generated_tokens: 1,
        }
    }

    #[test]
    fn test_stream_token_variants() {
        let token = StreamToken::Token("hello".to_string());
        assert!(token.is_token());
        assert!(!token.is_done());
        assert!(!token.is_error());
        assert!(!token.is_terminal());
        assert_eq!(token.as_token(), Some("hello"));

        let done = StreamToken::Done(outcome("hello"));
        assert!(!done.is_token());
        assert!(done.is_done());
        assert!(done.is_terminal());

        let error = StreamToken::Error(EngineError::NoModelLoaded);
        assert!(error.is_error());
        assert!(error.is_terminal());
        assert_eq!(error.as_error(), Some(&EngineError::NoModelLoaded));
    }

    #[test]
    fn test_stream_ends_after_terminal_item() {
        let (tx, rx) = mpsc::channel();
        let flags = Arc::new(GenerationFlags::new());
        tx.send(StreamToken::Token("a".to_string())).unwrap();
        tx.send(StreamToken::Done(outcome("a"))).unwrap();
        tx.send(StreamToken::Token("late".to_string())).unwrap();

        let items: Vec<StreamToken> = TokenStream::new(rx, flags, 1).collect();
        assert_eq!(items.len(), 2);
        assert!(items[1].is_done());
    }

    #[test]
    fn test_drain_into_collects_increments() {
        let (tx, rx) = mpsc::channel();
        let flags = Arc::new(GenerationFlags::new());
        for piece in ["Hel", "lo"] {
            tx.send(StreamToken::Token(piece.to_string())).unwrap();
        }
        tx.send(StreamToken::Done(outcome("Hello"))).unwrap();

        let mut text = String::new();
        let result = TokenStream::new(rx, flags, 1).drain_into(|t| text.push_str(t));
        assert_eq!(result.unwrap().text, "Hello");
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel::<StreamToken>();
        drop(tx);
        let flags = Arc::new(GenerationFlags::new());
        let result = TokenStream::new(rx, flags, 1).drain_into(|_| {});
        assert!(matches!(result, Err(EngineError::WorkerError(_))));
    }

    #[test]
    fn test_early_drop_cancels_matching_generation() {
        let flags = Arc::new(GenerationFlags::new());
        let epoch = flags.begin().unwrap();
        let (_tx, rx) = mpsc::channel::<StreamToken>();

        drop(TokenStream::new(rx, Arc::clone(&flags), epoch));
        assert!(flags.should_stop());
    }

    #[test]
    fn test_stale_stream_does_not_cancel_newer_generation() {
        let flags = Arc::new(GenerationFlags::new());
        let old_epoch = flags.begin().unwrap();
        flags.finish();
        let _new_epoch = flags.begin().unwrap();

        let (_tx, rx) = mpsc::channel::<StreamToken>();
        drop(TokenStream::new(rx, Arc::clone(&flags), old_epoch));
        assert!(!flags.should_stop());
    }
}
