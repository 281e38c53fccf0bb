//! # llama-tokenizer
//!
//! Deterministic tokenization for llama.rs.
//!
//! This crate provides:
//! - [`Vocabulary`]: id ↔ bytes mapping with merge scores
//! - A [`Tokenizer`] trait for pluggable tokenization backends
//! - [`SpmTokenizer`]: score-driven pair merging with per-byte fallback
//! - Streaming decoding with UTF-8 handling ([`DecodingState`])

pub mod vocab;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use llama_engine::{LlamaError, TokenId, TOKEN_BOS};

pub use vocab::{TokenScore, Vocabulary};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Output buffer too small: {required} tokens required, capacity {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

impl From<TokenizerError> for LlamaError {
    fn from(e: TokenizerError) -> Self {
        match e {
            TokenizerError::BufferTooSmall { required, capacity } => {
                LlamaError::BufferTooSmall { required, capacity }
            }
            other => LlamaError::InvalidArgument(other.to_string()),
        }
    }
}

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs, optionally led by BOS.
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>>;

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String>;

    /// Decode a single token and accumulate with partial UTF-8 state.
    /// For streaming decoding, this allows emitting printable characters immediately.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Encode into a caller-provided buffer, failing with the exact required
    /// size instead of truncating. The buffer is untouched on failure.
    fn encode_into(
        &self,
        text: &str,
        add_bos: bool,
        out: &mut [TokenId],
    ) -> TokenizerResult<usize> {
        let tokens = self.encode(text, add_bos)?;
        if tokens.len() > out.len() {
            return Err(TokenizerError::BufferTooSmall {
                required: tokens.len(),
                capacity: out.len(),
            });
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len())
    }
}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes of an incomplete UTF-8 sequence waiting for continuation bytes.
    pub fn pending(&self) -> &[u8] {
        &self.pending_utf8
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
    }

    /// Push raw bytes and return the newly completed text.
    fn push_bytes(&mut self, bytes: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(bytes);
        let mut emitted = String::new();

        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(text) => {
                    emitted.push_str(text);
                    self.pending_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to() bytes were just checked as UTF-8.
                    emitted.push_str(&String::from_utf8_lossy(&self.pending_utf8[..valid]));
                    match e.error_len() {
                        // Incomplete trailing sequence: wait for more bytes.
                        None => {
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            emitted.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + bad);
                        }
                    }
                }
            }
        }

        self.buffer.push_str(&emitted);
        emitted
    }
}

/// A symbol in the merge list: a byte span of the input plus its neighbours.
#[derive(Debug, Clone, Copy)]
struct Symbol {
    prev: Option<usize>,
    next: Option<usize>,
    start: usize,
    len: usize,
}

/// Candidate merge of two adjacent symbols.
#[derive(Debug)]
struct Bigram {
    left: usize,
    right: usize,
    score: f32,
    len: usize,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bigram {}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bigram {
    /// Higher score first; on equal score the leftmost pair wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

/// Score-merge tokenizer over a shared [`Vocabulary`].
///
/// Starts from one symbol per UTF-8 character and greedily merges the
/// adjacent pair whose concatenation is the highest-scored vocabulary entry.
/// Leftover symbols that are not vocabulary entries are emitted byte by byte
/// through the vocabulary's byte-fallback table.
#[derive(Debug, Clone)]
pub struct SpmTokenizer {
    vocab: Arc<Vocabulary>,
}

impl SpmTokenizer {
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Self { vocab }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn try_add_bigram(
        &self,
        symbols: &[Symbol],
        text: &[u8],
        left: usize,
        right: usize,
        queue: &mut BinaryHeap<Bigram>,
    ) {
        let len = symbols[left].len + symbols[right].len;
        if len > self.vocab.max_token_len() {
            return;
        }
        let start = symbols[left].start;
        let Some(id) = self.vocab.id_of(&text[start..start + len]) else {
            return;
        };
        let score = self.vocab.score(id).unwrap_or(0.0);
        queue.push(Bigram {
            left,
            right,
            score,
            len,
        });
    }

    fn segment(&self, text: &str, out: &mut Vec<TokenId>) -> TokenizerResult<()> {
        let bytes = text.as_bytes();
        let mut symbols: Vec<Symbol> = text
            .char_indices()
            .enumerate()
            .map(|(i, (start, ch))| Symbol {
                prev: i.checked_sub(1),
                next: Some(i + 1),
                start,
                len: ch.len_utf8(),
            })
            .collect();
        let Some(last) = symbols.last_mut() else {
            return Ok(());
        };
        last.next = None;

        let mut queue = BinaryHeap::new();
        for i in 1..symbols.len() {
            self.try_add_bigram(&symbols, bytes, i - 1, i, &mut queue);
        }

        while let Some(bigram) = queue.pop() {
            let (l, r) = (bigram.left, bigram.right);
            let (left, right) = (symbols[l], symbols[r]);
            // Stale entry: one side was merged away or grew since it was queued.
            if left.len == 0 || right.len == 0 || left.len + right.len != bigram.len {
                continue;
            }

            symbols[l].len += right.len;
            symbols[l].next = right.next;
            symbols[r].len = 0;
            if let Some(n) = right.next {
                symbols[n].prev = Some(l);
            }

            if let Some(p) = symbols[l].prev {
                self.try_add_bigram(&symbols, bytes, p, l, &mut queue);
            }
            if let Some(n) = symbols[l].next {
                self.try_add_bigram(&symbols, bytes, l, n, &mut queue);
            }
        }

        // Symbol 0 is never merged away: merges always absorb the right side.
        let mut cursor = Some(0);
        while let Some(i) = cursor {
            let sym = symbols[i];
            let piece = &bytes[sym.start..sym.start + sym.len];
            match self.vocab.id_of(piece) {
                Some(id) => out.push(id),
                None => {
                    for &b in piece {
                        let id = self.vocab.byte_token(b).ok_or_else(|| {
                            TokenizerError::EncodingError(format!(
                                "no vocabulary entry or byte fallback for byte 0x{b:02x}"
                            ))
                        })?;
                        out.push(id);
                    }
                }
            }
            cursor = sym.next;
        }
        Ok(())
    }
}

impl Tokenizer for SpmTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + usize::from(add_bos));
        if add_bos {
            tokens.push(TOKEN_BOS);
        }
        self.segment(text, &mut tokens)?;
        tracing::trace!(bytes = text.len(), tokens = tokens.len(), "tokenized");
        Ok(tokens)
    }

    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut bytes = Vec::new();
        for &id in tokens {
            let piece = self
                .vocab
                .token_bytes(id)
                .ok_or(TokenizerError::InvalidToken(id))?;
            bytes.extend_from_slice(piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        let piece = self
            .vocab
            .token_bytes(token)
            .ok_or(TokenizerError::InvalidToken(token))?;
        Ok(state.push_bytes(piece))
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer(entries: &[(&str, f32)]) -> SpmTokenizer {
        let mut vocab = Vocabulary::new();
        vocab.push("<unk>", 0.0);
        vocab.push("", 0.0);
        vocab.push("", 0.0);
        for b in 0u8..=255 {
            vocab.push(vec![b], 0.0);
        }
        for (text, score) in entries {
            vocab.push(*text, *score);
        }
        SpmTokenizer::new(Arc::new(vocab))
    }

    fn byte_id(b: u8) -> TokenId {
        b as TokenId + 3
    }

    #[test]
    fn encode_empty_string() {
        let tok = tokenizer(&[]);
        assert!(tok.encode("", false).unwrap().is_empty());
        assert_eq!(tok.encode("", true).unwrap(), vec![TOKEN_BOS]);
    }

    #[test]
    fn single_chars_map_to_byte_tokens() {
        let tok = tokenizer(&[]);
        assert_eq!(tok.encode("ab", false).unwrap(), vec![byte_id(b'a'), byte_id(b'b')]);
    }

    #[test]
    fn merges_follow_scores() {
        let tok = tokenizer(&[("he", 1.0), ("ll", 2.0), ("hell", 3.0), ("hello", 4.0)]);
        let hello = tok.vocab().id_of(b"hello").unwrap();
        assert_eq!(tok.encode("hello", false).unwrap(), vec![hello]);
    }

    #[test]
    fn higher_score_pair_wins_overlap() {
        // "abc": "ab" (score 1) vs "bc" (score 5) overlap on 'b'.
        let tok = tokenizer(&[("ab", 1.0), ("bc", 5.0)]);
        let bc = tok.vocab().id_of(b"bc").unwrap();
        assert_eq!(tok.encode("abc", false).unwrap(), vec![byte_id(b'a'), bc]);
    }

    #[test]
    fn equal_scores_merge_leftmost_first() {
        let tok = tokenizer(&[("aa", 1.0)]);
        let aa = tok.vocab().id_of(b"aa").unwrap();
        assert_eq!(tok.encode("aaa", false).unwrap(), vec![aa, byte_id(b'a')]);
    }

    #[test]
    fn multibyte_char_falls_back_to_bytes() {
        let tok = tokenizer(&[]);
        let ids = tok.encode("é", false).unwrap();
        let expected: Vec<TokenId> = "é".bytes().map(byte_id).collect();
        assert_eq!(ids, expected);
        assert_eq!(tok.decode(&ids).unwrap(), "é");
    }

    #[test]
    fn missing_byte_fallback_errors() {
        let vocab = Vocabulary::from_entries([("a", 0.0)]);
        let tok = SpmTokenizer::new(Arc::new(vocab));
        assert!(matches!(
            tok.encode("b", false),
            Err(TokenizerError::EncodingError(_))
        ));
    }

    #[test]
    fn encode_into_reports_required_size() {
        let tok = tokenizer(&[]);
        let mut buf = [0; 2];
        let err = tok.encode_into("abc", true, &mut buf).unwrap_err();
        assert_eq!(
            err,
            TokenizerError::BufferTooSmall {
                required: 4,
                capacity: 2
            }
        );
        assert_eq!(buf, [0, 0]);

        let mut buf = [0; 4];
        assert_eq!(tok.encode_into("abc", true, &mut buf).unwrap(), 4);
        assert_eq!(buf[0], TOKEN_BOS);
    }

    #[test]
    fn streaming_decode_holds_partial_utf8() {
        let tok = tokenizer(&[]);
        let ids = tok.encode("é!", false).unwrap();
        let mut state = DecodingState::new();

        assert_eq!(tok.decode_token(ids[0], &mut state).unwrap(), "");
        assert_eq!(state.pending().len(), 1);
        assert_eq!(tok.decode_token(ids[1], &mut state).unwrap(), "é");
        assert_eq!(tok.decode_token(ids[2], &mut state).unwrap(), "!");
        assert_eq!(state.buffer(), "é!");

        state.clear();
        assert_eq!(state.buffer(), "");
    }

    #[test]
    fn streaming_decode_replaces_invalid_bytes() {
        let tok = tokenizer(&[]);
        let mut state = DecodingState::new();
        let out = tok.decode_token(byte_id(0xff), &mut state).unwrap();
        assert_eq!(out, "\u{fffd}");
        assert!(state.pending().is_empty());
    }

    #[test]
    fn decode_invalid_token_errors() {
        let tok = tokenizer(&[]);
        assert_eq!(
            tok.decode(&[9999]).unwrap_err(),
            TokenizerError::InvalidToken(9999)
        );
    }

    #[test]
    fn buffer_error_converts_to_engine_error() {
        let err: LlamaError = TokenizerError::BufferTooSmall {
            required: 9,
            capacity: 1,
        }
        .into();
        assert!(matches!(
            err,
            LlamaError::BufferTooSmall {
                required: 9,
                capacity: 1
            }
        ));
    }
}
