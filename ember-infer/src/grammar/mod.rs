//! Grammar-constrained decoding: GBNF / JSON Schema compiled into a
//! character-level pushdown matcher, checked against token pieces.

pub mod automaton;
pub mod json_schema;
pub mod parser;

pub use automaton::Matcher;
pub use parser::Grammar;

use crate::params::GrammarSpec;
use crate::sampler::TokenConstraint;
use ember_core::chat_template::GrammarTrigger;
use ember_core::error::{EmberError, Result};
use ember_core::vocab::TokenVocabulary;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// GBNF text for a spec: explicit grammar first, then the JSON schema.
pub fn grammar_source(spec: &GrammarSpec) -> Result<Option<String>> {
    match (&spec.grammar, &spec.json_schema) {
        (Some(g), _) => Ok(Some(g.clone())),
        (None, Some(schema)) => json_schema::schema_to_gbnf(schema).map(Some),
        (None, None) => Ok(None),
    }
}

/// Waiting for a trigger before the grammar applies.
#[derive(Debug)]
struct Armed {
    tokens: HashSet<u32>,
    /// `(regex, whole output must match)`
    patterns: Vec<(Regex, bool)>,
    output: Vec<u8>,
}

impl Armed {
    /// Offset in the output where constrained text begins, if a trigger fired.
    fn fired(&self) -> Option<usize> {
        let text = String::from_utf8_lossy(&self.output);
        for (re, _) in &self.patterns {
            if let Some(caps) = re.captures(&text) {
                let m = caps.get(1).or_else(|| caps.get(0))?;
                return Some(m.start());
            }
        }
        None
    }
}

/// Per-completion grammar state, consulted by the sampler every step.
pub struct GrammarState {
    matcher: Matcher,
    pieces: Arc<Vec<Vec<u8>>>,
    eog: Vec<u32>,
    armed: Option<Armed>,
}

impl std::fmt::Debug for GrammarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarState")
            .field("lazy", &self.armed.is_some())
            .field("accepting", &self.matcher.is_accepting())
            .finish()
    }
}

impl GrammarState {
    /// Compile `spec` against `vocab`. `pieces[id]` must be `vocab.token_bytes(id)`.
    pub fn compile(
        spec: &GrammarSpec,
        vocab: &TokenVocabulary,
        pieces: Arc<Vec<Vec<u8>>>,
    ) -> Result<Option<Self>> {
        let Some(src) = grammar_source(spec)? else {
            return Ok(None);
        };
        let grammar = Arc::new(Grammar::parse(&src)?);

        let mut preserved = HashSet::new();
        for text in &spec.preserved_tokens {
            let toks = vocab.tokenize(text, false, true).map_err(|e| {
                EmberError::GrammarCompileFailed(format!("preserved token {text:?}: {e}"))
            })?;
            match toks.as_slice() {
                [t] => {
                    preserved.insert(text.as_str());
                    tracing::trace!("preserved token {text:?} -> {t}");
                }
                _ => {
                    return Err(EmberError::GrammarCompileFailed(format!(
                        "preserved token {text:?} is not a single token"
                    )))
                }
            }
        }

        let armed = if spec.lazy {
            if spec.triggers.is_empty() {
                return Err(EmberError::GrammarCompileFailed(
                    "lazy grammar needs at least one trigger".into(),
                ));
            }
            let compile = |p: &str| {
                Regex::new(p).map_err(|e| EmberError::GrammarCompileFailed(format!("trigger pattern: {e}")))
            };
            let mut armed = Armed {
                tokens: HashSet::new(),
                patterns: Vec::new(),
                output: Vec::new(),
            };
            for trigger in &spec.triggers {
                match trigger {
                    GrammarTrigger::Word(w) if preserved.contains(w.as_str()) => {
                        let toks = vocab.tokenize(w, false, true)?;
                        armed.tokens.extend(toks);
                    }
                    GrammarTrigger::Word(w) => armed.patterns.push((compile(&regex::escape(w))?, false)),
                    GrammarTrigger::Token(t) => {
                        if *t as usize >= vocab.len() {
                            return Err(EmberError::GrammarCompileFailed(format!(
                                "trigger token {t} outside vocabulary"
                            )));
                        }
                        armed.tokens.insert(*t);
                    }
                    GrammarTrigger::Pattern(p) => armed.patterns.push((compile(p)?, false)),
                    GrammarTrigger::PatternFull(p) => {
                        armed.patterns.push((compile(&format!("^(?:{p})$"))?, true))
                    }
                }
            }
            Some(armed)
        } else {
            None
        };

        let eog = (0..vocab.len() as u32).filter(|&t| vocab.is_eog(t)).collect();
        tracing::debug!(
            "grammar compiled: {} rules{}",
            grammar.rules().len(),
            if armed.is_some() { ", lazy" } else { "" }
        );
        Ok(Some(Self {
            matcher: Matcher::new(grammar),
            pieces,
            eog,
            armed,
        }))
    }

    pub fn is_accepting(&self) -> bool {
        self.matcher.is_accepting()
    }

    fn piece(&self, token: u32) -> &[u8] {
        self.pieces.get(token as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    fn start(&mut self, text: &[u8]) -> Result<()> {
        self.armed = None;
        tracing::debug!("lazy grammar triggered");
        if self.matcher.accept(text) {
            Ok(())
        } else {
            Err(EmberError::PredictionFailed(format!(
                "grammar rejects triggered text {:?}",
                String::from_utf8_lossy(text)
            )))
        }
    }
}

impl TokenConstraint for GrammarState {
    fn is_active(&self) -> bool {
        self.armed.is_none()
    }

    fn allows(&self, token: u32) -> bool {
        if self.eog.contains(&token) {
            return self.matcher.is_accepting();
        }
        let piece = self.piece(token);
        !piece.is_empty() && self.matcher.allows(piece)
    }

    fn accept(&mut self, token: u32) -> Result<()> {
        let piece = self.piece(token).to_vec();
        if let Some(armed) = self.armed.as_mut() {
            if armed.tokens.contains(&token) {
                return self.start(&piece);
            }
            armed.output.extend_from_slice(&piece);
            if let Some(at) = armed.fired() {
                let lossy = String::from_utf8_lossy(&armed.output).into_owned();
                return self.start(lossy[at..].as_bytes());
            }
            return Ok(());
        }
        if self.eog.contains(&token) {
            return Ok(());
        }
        if self.matcher.accept(&piece) {
            Ok(())
        } else {
            Err(EmberError::PredictionFailed(format!("grammar rejects token {token}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::vocab::{SpecialTokens, TokenType, VocabKind};

    fn vocab() -> TokenVocabulary {
        let pieces: Vec<String> = ["<unk>", "<s>", "</s>", "yes", "no", "y", "es", "<tool>", "{", "}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut types = vec![TokenType::Normal; pieces.len()];
        types[0] = TokenType::Unknown;
        types[1] = TokenType::Control;
        types[2] = TokenType::Control;
        types[7] = TokenType::UserDefined;
        TokenVocabulary::build(
            VocabKind::Spm,
            pieces,
            types,
            vec![0.0; 10],
            &[],
            SpecialTokens {
                bos: Some(1),
                eos: Some(2),
                unk: Some(0),
                ..Default::default()
            },
            false,
            false,
        )
        .unwrap()
    }

    fn pieces(v: &TokenVocabulary) -> Arc<Vec<Vec<u8>>> {
        Arc::new((0..v.len() as u32).map(|t| v.token_bytes(t).unwrap()).collect())
    }

    fn spec(grammar: &str) -> GrammarSpec {
        GrammarSpec {
            grammar: Some(grammar.into()),
            ..Default::default()
        }
    }

    #[test]
    fn masks_tokens_and_gates_eos() {
        let v = vocab();
        let mut g = GrammarState::compile(&spec(r#"root ::= "yes" | "no""#), &v, pieces(&v))
            .unwrap()
            .unwrap();
        assert!(g.allows(3) && g.allows(4) && g.allows(5));
        assert!(!g.allows(6) && !g.allows(2) && !g.allows(1));
        g.accept(5).unwrap();
        assert!(g.allows(6) && !g.allows(2));
        g.accept(6).unwrap();
        assert!(g.allows(2) && !g.allows(3));
        assert!(g.accept(4).is_err());
    }

    #[test]
    fn lazy_grammar_waits_for_trigger() {
        let v = vocab();
        let lazy = GrammarSpec {
            grammar: Some(r#"root ::= "<tool>{" "}""#.into()),
            lazy: true,
            triggers: vec![GrammarTrigger::Word("<tool>".into())],
            preserved_tokens: vec!["<tool>".into()],
            ..Default::default()
        };
        let mut g = GrammarState::compile(&lazy, &v, pieces(&v)).unwrap().unwrap();
        assert!(!g.is_active());
        g.accept(3).unwrap();
        assert!(!g.is_active());
        g.accept(7).unwrap();
        assert!(g.is_active());
        assert!(g.allows(8) && !g.allows(9));
    }

    #[test]
    fn pattern_trigger_starts_at_group() {
        let v = vocab();
        let lazy = GrammarSpec {
            grammar: Some(r#"root ::= "es" "}""#.into()),
            lazy: true,
            triggers: vec![GrammarTrigger::Pattern("y(es)".into())],
            ..Default::default()
        };
        let mut g = GrammarState::compile(&lazy, &v, pieces(&v)).unwrap().unwrap();
        g.accept(5).unwrap();
        assert!(!g.is_active());
        g.accept(6).unwrap();
        assert!(g.is_active());
        assert!(g.allows(9));
    }

    #[test]
    fn compile_errors() {
        let v = vocab();
        let bad = GrammarSpec {
            preserved_tokens: vec!["yesno".into()],
            ..spec(r#"root ::= "x""#)
        };
        assert!(matches!(
            GrammarState::compile(&bad, &v, pieces(&v)),
            Err(EmberError::GrammarCompileFailed(_))
        ));
        let lazy = GrammarSpec {
            lazy: true,
            ..spec(r#"root ::= "x""#)
        };
        assert!(GrammarState::compile(&lazy, &v, pieces(&v)).is_err());
        assert!(GrammarState::compile(&spec("root ::= ["), &v, pieces(&v)).is_err());
        assert!(GrammarState::compile(&GrammarSpec::default(), &v, pieces(&v))
            .unwrap()
            .is_none());
    }
}
