use super::parser::{Element, Grammar};
use std::collections::HashSet;
use std::sync::Arc;

/// Next element to match: `grammar.alt(rule, alt)[idx]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Pos {
    rule: u32,
    alt: u32,
    idx: u32,
}

/// Return positions, innermost last. An empty stack means the root rule is
/// complete.
type Stack = Vec<Pos>;

/// Pushdown recognizer over characters. After every step each stack's top
/// is a terminal, so advancing is a single comparison per stack.
#[derive(Debug, Clone)]
pub struct Matcher {
    grammar: Arc<Grammar>,
    stacks: Vec<Stack>,
    /// Bytes of an incomplete UTF-8 character accepted so far.
    partial: Vec<u8>,
}

impl Matcher {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let root = grammar.root();
        let mut stacks = Vec::new();
        let mut seen = HashSet::new();
        for (a, alt) in grammar.rules()[root].alts.iter().enumerate() {
            let stack = if alt.is_empty() {
                Vec::new()
            } else {
                vec![Pos {
                    rule: root as u32,
                    alt: a as u32,
                    idx: 0,
                }]
            };
            expand(&grammar, stack, &mut stacks, &mut seen);
        }
        Self {
            grammar,
            stacks,
            partial: Vec::new(),
        }
    }

    /// True when the text so far is a complete sentence.
    pub fn is_accepting(&self) -> bool {
        self.partial.is_empty() && self.stacks.iter().any(Vec::is_empty)
    }

    /// Whether appending `bytes` keeps the text a valid prefix.
    pub fn allows(&self, bytes: &[u8]) -> bool {
        self.step(bytes).is_some()
    }

    pub fn accept(&mut self, bytes: &[u8]) -> bool {
        match self.step(bytes) {
            Some((stacks, partial)) => {
                self.stacks = stacks;
                self.partial = partial;
                true
            }
            None => false,
        }
    }

    pub fn accept_str(&mut self, text: &str) -> bool {
        self.accept(text.as_bytes())
    }

    fn step(&self, bytes: &[u8]) -> Option<(Vec<Stack>, Vec<u8>)> {
        let mut buf = Vec::with_capacity(self.partial.len() + bytes.len());
        buf.extend_from_slice(&self.partial);
        buf.extend_from_slice(bytes);

        let (text, rest) = match std::str::from_utf8(&buf) {
            Ok(s) => (s, &[][..]),
            Err(e) if e.error_len().is_none() => {
                let (valid, rest) = buf.split_at(e.valid_up_to());
                (std::str::from_utf8(valid).ok()?, rest)
            }
            Err(_) => return None,
        };

        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = advance(&self.grammar, &stacks, c);
            if stacks.is_empty() {
                return None;
            }
        }
        // an unfinished character needs somewhere to go
        if !rest.is_empty() && stacks.iter().all(Vec::is_empty) {
            return None;
        }
        Some((stacks, rest.to_vec()))
    }
}

fn element<'g>(grammar: &'g Grammar, pos: &Pos) -> &'g Element {
    &grammar.alt(pos.rule as usize, pos.alt as usize)[pos.idx as usize]
}

/// Drop `stack`'s top after it matched and move to the following element,
/// popping finished alternatives.
fn after(grammar: &Grammar, mut stack: Stack) -> Stack {
    if let Some(top) = stack.pop() {
        let next = Pos {
            idx: top.idx + 1,
            ..top
        };
        if (next.idx as usize) < grammar.alt(top.rule as usize, top.alt as usize).len() {
            stack.push(next);
        }
    }
    stack
}

/// Resolve rule references on top of `stack` until every resulting stack has
/// a terminal (or nothing) on top.
fn expand(grammar: &Grammar, stack: Stack, out: &mut Vec<Stack>, seen: &mut HashSet<Stack>) {
    let Some(top) = stack.last().copied() else {
        if seen.insert(stack.clone()) {
            out.push(stack);
        }
        return;
    };
    match element(grammar, &top) {
        Element::Char { .. } | Element::Any => {
            if seen.insert(stack.clone()) {
                out.push(stack);
            }
        }
        Element::Ref(r) => {
            let r = *r;
            let base = after(grammar, stack);
            for (a, alt) in grammar.rules()[r].alts.iter().enumerate() {
                let mut next = base.clone();
                if !alt.is_empty() {
                    next.push(Pos {
                        rule: r as u32,
                        alt: a as u32,
                        idx: 0,
                    });
                }
                expand(grammar, next, out, seen);
            }
        }
    }
}

fn advance(grammar: &Grammar, stacks: &[Stack], c: char) -> Vec<Stack> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for stack in stacks {
        let Some(top) = stack.last() else { continue };
        if element(grammar, top).matches(c) {
            expand(grammar, after(grammar, stack.clone()), &mut out, &mut seen);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(src: &str) -> Matcher {
        Matcher::new(Arc::new(Grammar::parse(src).unwrap()))
    }

    #[test]
    fn walks_alternatives_and_repetition() {
        let mut m = matcher(r#"root ::= "ab" [0-9]* | "c""#);
        assert!(!m.is_accepting());
        assert!(m.allows(b"c"));
        assert!(!m.allows(b"b"));
        assert!(m.accept(b"ab"));
        assert!(m.is_accepting());
        assert!(m.accept(b"42"));
        assert!(m.is_accepting());
        assert!(!m.allows(b"x"));
    }

    #[test]
    fn nested_rules_return_to_caller() {
        let mut m = matcher("root ::= \"(\" inner \")\"\ninner ::= \"x\" | \"y\" inner");
        assert!(m.accept_str("(yyx"));
        assert!(!m.is_accepting());
        assert!(!m.allows(b"x"));
        assert!(m.accept_str(")"));
        assert!(m.is_accepting());
    }

    #[test]
    fn split_utf8_characters() {
        let mut m = matcher("root ::= \"é!\"");
        let bytes = "é".as_bytes();
        assert!(m.accept(&bytes[..1]));
        assert!(!m.is_accepting());
        assert!(m.accept(&bytes[1..]));
        assert!(m.accept(b"!"));
        assert!(m.is_accepting());
        assert!(!matcher("root ::= \"a\"").allows(&[0xff]));
    }
}
