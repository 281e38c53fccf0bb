//! Token vocabulary: id ↔ bytes mapping plus per-token merge scores.

use std::borrow::Cow;
use std::collections::HashMap;

use llama_engine::TokenId;

/// One vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScore {
    /// Raw token bytes. Byte-fallback tokens may not be valid UTF-8.
    pub bytes: Box<[u8]>,
    pub score: f32,
}

/// Ordered vocabulary indexed by token id `0..len()`.
///
/// # Invariants
/// - `ids[entries[i].bytes] == i` for the first entry carrying those bytes
/// - `byte_fallback[b]` points at an entry whose bytes are exactly `[b]`,
///   or at a `<0xNN>` entry when no raw single-byte entry exists
#[derive(Debug, Clone)]
pub struct Vocabulary {
    entries: Vec<TokenScore>,
    ids: HashMap<Box<[u8]>, TokenId>,
    byte_fallback: [Option<TokenId>; 256],
    max_token_len: usize,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            ids: HashMap::new(),
            byte_fallback: [None; 256],
            max_token_len: 0,
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
            ids: HashMap::with_capacity(n),
            ..Self::new()
        }
    }

    /// Build a vocabulary from `(bytes, score)` pairs in id order.
    pub fn from_entries<I, B>(entries: I) -> Self
    where
        I: IntoIterator<Item = (B, f32)>,
        B: Into<Vec<u8>>,
    {
        let iter = entries.into_iter();
        let mut vocab = Self::with_capacity(iter.size_hint().0);
        for (bytes, score) in iter {
            vocab.push(bytes, score);
        }
        vocab
    }

    /// Append an entry and return its id.
    pub fn push(&mut self, bytes: impl Into<Vec<u8>>, score: f32) -> TokenId {
        let bytes: Box<[u8]> = bytes.into().into_boxed_slice();
        let id = self.entries.len() as TokenId;

        if let [b] = bytes[..] {
            // Raw single-byte entries take precedence over `<0xNN>` spellings.
            let replace = match self.byte_fallback[b as usize] {
                None => true,
                Some(prev) => self.entries[prev as usize].bytes.len() != 1,
            };
            if replace {
                self.byte_fallback[b as usize] = Some(id);
            }
        } else if let Some(b) = parse_hex_byte(&bytes) {
            let slot = &mut self.byte_fallback[b as usize];
            if slot.is_none() {
                *slot = Some(id);
            }
        }

        self.max_token_len = self.max_token_len.max(bytes.len());
        self.ids.entry(bytes.clone()).or_insert(id);
        self.entries.push(TokenScore { bytes, score });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: TokenId) -> bool {
        id >= 0 && (id as usize) < self.entries.len()
    }

    pub fn get(&self, id: TokenId) -> Option<&TokenScore> {
        if id < 0 {
            return None;
        }
        self.entries.get(id as usize)
    }

    /// Bytes the token decodes to. A `<0xNN>` entry stands for the single
    /// byte `NN`; [`Vocabulary::get`] still exposes its stored spelling.
    pub fn token_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.get(id).map(|t| match parse_hex_byte(&t.bytes) {
            Some(b) => std::slice::from_ref(&BYTE_VALUES[b as usize]),
            None => &*t.bytes,
        })
    }

    /// Token text; invalid UTF-8 is replaced lossily.
    pub fn token_to_str(&self, id: TokenId) -> Option<Cow<'_, str>> {
        self.token_bytes(id).map(String::from_utf8_lossy)
    }

    pub fn score(&self, id: TokenId) -> Option<f32> {
        self.get(id).map(|t| t.score)
    }

    pub fn id_of(&self, bytes: &[u8]) -> Option<TokenId> {
        self.ids.get(bytes).copied()
    }

    /// Fallback token for a single byte that has no better segmentation.
    pub fn byte_token(&self, byte: u8) -> Option<TokenId> {
        self.byte_fallback[byte as usize]
    }

    /// Length in bytes of the longest entry.
    pub fn max_token_len(&self) -> usize {
        self.max_token_len
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenScore> {
        self.entries.iter()
    }
}

static BYTE_VALUES: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    table
};

/// Parse the `<0xNN>` byte-token spelling.
fn parse_hex_byte(bytes: &[u8]) -> Option<u8> {
    let inner = bytes.strip_prefix(b"<0x")?.strip_suffix(b">")?;
    if inner.len() != 2 {
        return None;
    }
    let text = std::str::from_utf8(inner).ok()?;
    u8::from_str_radix(text, 16).ok()
}
