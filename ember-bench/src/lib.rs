//! Shared inputs for the criterion benches.

use ember_core::error::Result;
use ember_core::vocab::{SpecialTokens, TokenType, TokenVocabulary, VocabKind};
use std::sync::Arc;

pub const N_VOCAB: usize = 32_000;

/// Specials, then short letter/digit/punctuation pieces cycling through the
/// rest of the vocabulary.
pub fn vocab() -> Result<(TokenVocabulary, Arc<Vec<Vec<u8>>>)> {
    let alphabet: Vec<char> = ('a'..='z').chain('0'..='9').chain("{}[]\",: ".chars()).collect();
    let mut pieces = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    let mut i = 0usize;
    while pieces.len() < N_VOCAB {
        let len = 1 + i % 4;
        let piece: String = (0..len)
            .map(|k| alphabet[(i / (k + 1) + k * 7) % alphabet.len()])
            .collect();
        pieces.push(format!("{piece}{i}"));
        i += 1;
    }
    let mut types = vec![TokenType::Normal; N_VOCAB];
    types[0] = TokenType::Unknown;
    types[1] = TokenType::Control;
    types[2] = TokenType::Control;
    let vocab = TokenVocabulary::build(
        VocabKind::Spm,
        pieces,
        types,
        vec![0.0; N_VOCAB],
        &[],
        SpecialTokens {
            bos: Some(1),
            eos: Some(2),
            unk: Some(0),
            ..Default::default()
        },
        true,
        true,
    )?;
    let rendered = (0..N_VOCAB as u32)
        .map(|t| vocab.token_bytes(t))
        .collect::<Result<Vec<_>>>()?;
    Ok((vocab, Arc::new(rendered)))
}

pub fn logits() -> Vec<f32> {
    (0..N_VOCAB)
        .map(|i| ((i as f32 * 0.618_034).fract() - 0.5) * 12.0)
        .collect()
}

/// Activation vector with a smooth ramp through zero.
pub fn activations(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (i as f32) * 0.01 - (n as f32 * 0.005))
        .collect()
}
