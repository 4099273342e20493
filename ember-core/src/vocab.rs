use crate::error::{EmberError, Result};
use crate::gguf::{GgufFile, GgufValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SPM_SPACE: char = '\u{2581}'; // ▁

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VocabKind {
    /// SentencePiece: score-ranked merges, `▁` for spaces, `<0xHH>` byte tokens.
    Spm,
    /// GPT-2 style byte-level BPE with ranked merges.
    Bpe,
}

/// `tokenizer.ggml.token_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    fn from_gguf(v: i64) -> Self {
        match v {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }

    fn is_special(self) -> bool {
        matches!(self, TokenType::Control | TokenType::UserDefined)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub unk: Option<u32>,
    pub eot: Option<u32>,
}

/// Token pieces indexed by id, with the reverse map and merge tables.
#[derive(Debug, Clone)]
pub struct TokenVocabulary {
    kind: VocabKind,
    pieces: Vec<String>,
    types: Vec<TokenType>,
    scores: Vec<f32>,
    piece_to_id: HashMap<String, u32>,
    merge_rank: HashMap<(u32, u32), usize>,
    byte_tokens: Vec<Option<u32>>,
    /// Control and user-defined pieces, longest first.
    special_pieces: Vec<(String, u32)>,
    special: SpecialTokens,
    add_bos: bool,
    add_space_prefix: bool,
}

impl TokenVocabulary {
    pub fn from_gguf(gguf: &GgufFile) -> Result<Self> {
        let pieces = gguf
            .get_array("tokenizer.ggml.tokens")
            .ok_or_else(|| EmberError::ModelLoadFailed("missing tokenizer.ggml.tokens".into()))?
            .iter()
            .map(|v| {
                v.as_str().map(String::from).ok_or_else(|| {
                    EmberError::ModelLoadFailed("tokenizer.ggml.tokens holds a non-string".into())
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let kind = match gguf.get_str("tokenizer.ggml.model") {
            Some("gpt2") => VocabKind::Bpe,
            Some("llama") => VocabKind::Spm,
            _ if gguf.get_array("tokenizer.ggml.merges").is_some() => VocabKind::Bpe,
            _ => VocabKind::Spm,
        };

        let types = gguf
            .get_array("tokenizer.ggml.token_type")
            .map(|arr| {
                arr.iter()
                    .map(|v| TokenType::from_gguf(v.as_i64().unwrap_or(1)))
                    .collect()
            })
            .unwrap_or_default();
        let scores = gguf
            .get_array("tokenizer.ggml.scores")
            .map(|arr| arr.iter().map(|v| v.as_f32().unwrap_or(0.0)).collect())
            .unwrap_or_default();
        let merges: Vec<String> = gguf
            .get_array("tokenizer.ggml.merges")
            .map(|arr| {
                arr.iter()
                    .filter_map(GgufValue::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let id = |key: &str| gguf.get_u32(key);
        let special = match kind {
            VocabKind::Spm => SpecialTokens {
                bos: id("tokenizer.ggml.bos_token_id").or(Some(1)),
                eos: id("tokenizer.ggml.eos_token_id").or(Some(2)),
                unk: id("tokenizer.ggml.unknown_token_id").or(Some(0)),
                pad: id("tokenizer.ggml.padding_token_id"),
                eot: id("tokenizer.ggml.eot_token_id"),
            },
            VocabKind::Bpe => SpecialTokens {
                bos: id("tokenizer.ggml.bos_token_id"),
                eos: id("tokenizer.ggml.eos_token_id"),
                unk: id("tokenizer.ggml.unknown_token_id"),
                pad: id("tokenizer.ggml.padding_token_id"),
                eot: id("tokenizer.ggml.eot_token_id"),
            },
        };
        let add_bos = gguf
            .get_bool("tokenizer.ggml.add_bos_token")
            .unwrap_or(kind == VocabKind::Spm);
        let add_space_prefix = gguf
            .get_bool("tokenizer.ggml.add_space_prefix")
            .unwrap_or(kind == VocabKind::Spm);

        Self::build(kind, pieces, types, scores, &merges, special, add_bos, add_space_prefix)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        kind: VocabKind,
        pieces: Vec<String>,
        mut types: Vec<TokenType>,
        mut scores: Vec<f32>,
        merges: &[String],
        special: SpecialTokens,
        add_bos: bool,
        add_space_prefix: bool,
    ) -> Result<Self> {
        let n = pieces.len();
        if n == 0 {
            return Err(EmberError::ModelLoadFailed("empty vocabulary".into()));
        }
        for tok in [special.bos, special.eos, special.pad, special.unk, special.eot]
            .into_iter()
            .flatten()
        {
            if tok as usize >= n {
                return Err(EmberError::ModelLoadFailed(format!(
                    "special token id {tok} outside vocabulary of {n}"
                )));
            }
        }
        types.resize(n, TokenType::Normal);
        scores.resize(n, 0.0);

        let mut piece_to_id = HashMap::with_capacity(n);
        for (id, piece) in pieces.iter().enumerate() {
            piece_to_id.entry(piece.clone()).or_insert(id as u32);
        }

        let mut byte_tokens = vec![None; 256];
        match kind {
            VocabKind::Spm => {
                for (id, piece) in pieces.iter().enumerate() {
                    if let Some(b) = parse_byte_piece(piece) {
                        byte_tokens[b as usize] = Some(id as u32);
                        types[id] = TokenType::Byte;
                    }
                }
            }
            VocabKind::Bpe => {
                for (b, ch) in byte_to_unicode().iter().enumerate() {
                    byte_tokens[b] = piece_to_id.get(&ch.to_string()).copied();
                }
            }
        }

        let mut merge_rank = HashMap::with_capacity(merges.len());
        for (rank, merge) in merges.iter().enumerate() {
            if let Some((a, b)) = merge.split_once(' ') {
                if let (Some(&a), Some(&b)) = (piece_to_id.get(a), piece_to_id.get(b)) {
                    merge_rank.entry((a, b)).or_insert(rank);
                }
            }
        }

        let mut special_pieces: Vec<(String, u32)> = pieces
            .iter()
            .enumerate()
            .filter(|(id, p)| types[*id].is_special() && !p.is_empty())
            .map(|(id, p)| (p.clone(), id as u32))
            .collect();
        special_pieces.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));

        Ok(Self {
            kind,
            pieces,
            types,
            scores,
            piece_to_id,
            merge_rank,
            byte_tokens,
            special_pieces,
            special,
            add_bos,
            add_space_prefix,
        })
    }

    pub fn kind(&self) -> VocabKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    pub fn bos(&self) -> Option<u32> {
        self.special.bos
    }

    pub fn eos(&self) -> Option<u32> {
        self.special.eos
    }

    /// End of generation: EOS or the chat end-of-turn token.
    pub fn is_eog(&self, id: u32) -> bool {
        Some(id) == self.special.eos || Some(id) == self.special.eot
    }

    pub fn add_bos_default(&self) -> bool {
        self.add_bos
    }

    pub fn token_type(&self, id: u32) -> Option<TokenType> {
        self.types.get(id as usize).copied()
    }

    /// Raw stored piece (with `▁` or byte-level encoding intact).
    pub fn piece(&self, id: u32) -> Option<&str> {
        self.pieces.get(id as usize).map(String::as_str)
    }

    /// Id of a piece that is exactly one token, e.g. a special marker.
    pub fn token_id(&self, piece: &str) -> Option<u32> {
        self.piece_to_id.get(piece).copied()
    }

    pub fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if add_bos {
            if let Some(bos) = self.special.bos {
                out.push(bos);
            }
        }
        let mut first_text = true;
        for segment in self.split_special(text, parse_special) {
            match segment {
                Segment::Special(id) => out.push(id),
                Segment::Text(s) => {
                    match self.kind {
                        VocabKind::Spm => self.encode_spm(s, first_text, &mut out)?,
                        VocabKind::Bpe => self.encode_bpe(s, &mut out)?,
                    }
                    first_text = false;
                }
            }
        }
        Ok(out)
    }

    /// Bytes a token contributes to generated text. Control, unknown and
    /// unused tokens render as nothing.
    pub fn token_bytes(&self, id: u32) -> Result<Vec<u8>> {
        let idx = id as usize;
        let piece = self.pieces.get(idx).ok_or_else(|| {
            EmberError::DetokenizationFailed(format!(
                "token id {id} outside vocabulary of {}",
                self.pieces.len()
            ))
        })?;
        Ok(match self.types[idx] {
            TokenType::Control | TokenType::Unknown | TokenType::Unused => Vec::new(),
            TokenType::Byte => match self.kind {
                VocabKind::Spm => parse_byte_piece(piece).map(|b| vec![b]).unwrap_or_default(),
                VocabKind::Bpe => decode_byte_level(piece),
            },
            TokenType::UserDefined => piece.as_bytes().to_vec(),
            TokenType::Normal => match self.kind {
                VocabKind::Spm => piece.replace(SPM_SPACE, " ").into_bytes(),
                VocabKind::Bpe => decode_byte_level(piece),
            },
        })
    }

    pub fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        let mut leading = true;
        for &id in tokens {
            let mut piece = self.token_bytes(id)?;
            if leading && !piece.is_empty() {
                if self.kind == VocabKind::Spm && self.add_space_prefix && piece.first() == Some(&b' ')
                {
                    piece.remove(0);
                }
                leading = false;
            }
            bytes.extend_from_slice(&piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn split_special<'a>(&self, text: &'a str, parse_special: bool) -> Vec<Segment<'a>> {
        if !parse_special || self.special_pieces.is_empty() {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Segment::Text(text)]
            };
        }
        let mut segments = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < text.len() {
            if !text.is_char_boundary(i) {
                i += 1;
                continue;
            }
            let rest = &text[i..];
            if let Some((piece, id)) = self.special_pieces.iter().find(|(p, _)| rest.starts_with(p.as_str())) {
                if start < i {
                    segments.push(Segment::Text(&text[start..i]));
                }
                segments.push(Segment::Special(*id));
                i += piece.len();
                start = i;
            } else {
                i += 1;
            }
        }
        if start < text.len() {
            segments.push(Segment::Text(&text[start..]));
        }
        segments
    }

    fn unknown(&self, what: &str) -> Result<u32> {
        self.special.unk.ok_or_else(|| {
            EmberError::TokenizationFailed(format!("no token for {what:?} and no unknown token"))
        })
    }

    fn encode_spm(&self, text: &str, first: bool, out: &mut Vec<u32>) -> Result<()> {
        let mut normalized = String::with_capacity(text.len() + 3);
        if first && self.add_space_prefix {
            normalized.push(SPM_SPACE);
        }
        normalized.extend(text.chars().map(|c| if c == ' ' { SPM_SPACE } else { c }));

        let mut symbols: Vec<u32> = Vec::with_capacity(normalized.len());
        let mut buf = [0u8; 4];
        for ch in normalized.chars() {
            let s = ch.encode_utf8(&mut buf);
            if let Some(&id) = self.piece_to_id.get(&*s) {
                symbols.push(id);
                continue;
            }
            for &b in s.as_bytes() {
                match self.byte_tokens[b as usize] {
                    Some(id) => symbols.push(id),
                    None => symbols.push(self.unknown(s)?),
                }
            }
        }

        // greedily merge the adjacent pair whose union scores highest
        loop {
            let mut best: Option<(f32, usize, u32)> = None;
            for i in 0..symbols.len().saturating_sub(1) {
                let a = &self.pieces[symbols[i] as usize];
                let b = &self.pieces[symbols[i + 1] as usize];
                if self.types[symbols[i] as usize] == TokenType::Byte
                    || self.types[symbols[i + 1] as usize] == TokenType::Byte
                {
                    continue;
                }
                let merged = format!("{a}{b}");
                if let Some(&id) = self.piece_to_id.get(&merged) {
                    let score = self.scores[id as usize];
                    if best.map_or(true, |(s, _, _)| score > s) {
                        best = Some((score, i, id));
                    }
                }
            }
            let Some((_, i, id)) = best else { break };
            symbols[i] = id;
            symbols.remove(i + 1);
        }
        out.extend(symbols);
        Ok(())
    }

    fn encode_bpe(&self, text: &str, out: &mut Vec<u32>) -> Result<()> {
        for word in pretokenize(text) {
            let mut symbols = Vec::with_capacity(word.len());
            for &b in word.as_bytes() {
                match self.byte_tokens[b as usize] {
                    Some(id) => symbols.push(id),
                    None => symbols.push(self.unknown(word)?),
                }
            }
            loop {
                let mut best: Option<(usize, usize)> = None;
                for i in 0..symbols.len().saturating_sub(1) {
                    if let Some(&rank) = self.merge_rank.get(&(symbols[i], symbols[i + 1])) {
                        if best.map_or(true, |(r, _)| rank < r) {
                            best = Some((rank, i));
                        }
                    }
                }
                let Some((_, i)) = best else { break };
                let merged = format!(
                    "{}{}",
                    self.pieces[symbols[i] as usize],
                    self.pieces[symbols[i + 1] as usize]
                );
                match self.piece_to_id.get(&merged) {
                    Some(&id) => {
                        symbols[i] = id;
                        symbols.remove(i + 1);
                    }
                    None => break,
                }
            }
            out.extend(symbols);
        }
        Ok(())
    }
}

enum Segment<'a> {
    Text(&'a str),
    Special(u32),
}

fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// GPT-2 byte-to-unicode table: printable bytes map to themselves, the rest
/// are shifted into U+0100 and up.
pub fn byte_to_unicode() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for b in 0..=255u32 {
        let printable = (0x21..=0x7E).contains(&b) || (0xA1..=0xAC).contains(&b) || (0xAE..=0xFF).contains(&b);
        let cp = if printable {
            b
        } else {
            shifted += 1;
            255 + shifted
        };
        table[b as usize] = char::from_u32(cp).unwrap_or('\u{FFFD}');
    }
    table
}

fn decode_byte_level(piece: &str) -> Vec<u8> {
    let table = byte_to_unicode();
    piece
        .chars()
        .map(|c| {
            table
                .iter()
                .position(|&t| t == c)
                .map(|b| b as u8)
                .unwrap_or(b'?')
        })
        .collect()
}

/// Word split used before byte-level merges: an optional leading space glued
/// to a run of letters, digits or punctuation; whitespace runs stand alone.
fn pretokenize(text: &str) -> Vec<&str> {
    #[derive(PartialEq, Clone, Copy)]
    enum Class {
        Letter,
        Digit,
        Space,
        Other,
    }
    fn class(c: char) -> Class {
        if c.is_alphabetic() {
            Class::Letter
        } else if c.is_numeric() {
            Class::Digit
        } else if c.is_whitespace() {
            Class::Space
        } else {
            Class::Other
        }
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let mut words = Vec::new();
    let mut k = 0;
    while k < n {
        let start = chars[k].0;
        let mut j = k;
        if chars[j].1 == ' ' && j + 1 < n && class(chars[j + 1].1) != Class::Space {
            j += 1;
        }
        let cls = class(chars[j].1);
        let mut end = j + 1;
        while end < n && class(chars[end].1) == cls {
            end += 1;
        }
        // leave a trailing ' ' for the word that follows
        if cls == Class::Space && end < n && end - 1 > j && chars[end - 1].1 == ' ' {
            end -= 1;
        }
        k = end;
        let stop = chars.get(k).map_or(text.len(), |&(i, _)| i);
        words.push(&text[start..stop]);
    }
    words
}
