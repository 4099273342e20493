//! GBNF parser. Repetition operators and groups are desugared into generated
//! rules, so the compiled grammar only has terminals and rule references.

use ember_core::error::{EmberError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    /// One character from inclusive ranges (or outside them when negated).
    Char { ranges: Vec<(char, char)>, negated: bool },
    Any,
    Ref(usize),
}

impl Element {
    pub fn matches(&self, c: char) -> bool {
        match self {
            Element::Char { ranges, negated } => {
                ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
            }
            Element::Any => true,
            Element::Ref(_) => false,
        }
    }

    fn literal(c: char) -> Self {
        Element::Char {
            ranges: vec![(c, c)],
            negated: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub alts: Vec<Vec<Element>>,
}

#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Vec<Rule>,
    root: usize,
}

impl Grammar {
    pub fn parse(src: &str) -> Result<Self> {
        Parser::new(src).parse()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn alt(&self, rule: usize, alt: usize) -> &[Element] {
        &self.rules[rule].alts[alt]
    }

    fn nullable(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.rules.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for (i, rule) in self.rules.iter().enumerate() {
                if nullable[i] {
                    continue;
                }
                let empty = rule.alts.iter().any(|alt| {
                    alt.iter()
                        .all(|e| matches!(e, Element::Ref(r) if nullable[*r]))
                });
                if empty {
                    nullable[i] = true;
                    changed = true;
                }
            }
        }
        nullable
    }

    /// Reject rules that can reach themselves without consuming input; the
    /// stack expansion would never terminate on them.
    fn check_left_recursion(&self) -> Result<()> {
        let nullable = self.nullable();
        let left_refs: Vec<Vec<usize>> = self
            .rules
            .iter()
            .map(|rule| {
                let mut refs = Vec::new();
                for alt in &rule.alts {
                    for e in alt {
                        match e {
                            Element::Ref(r) => {
                                refs.push(*r);
                                if !nullable[*r] {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                }
                refs
            })
            .collect();

        // 0 unvisited, 1 on the DFS stack, 2 done
        let mut state = vec![0u8; self.rules.len()];
        fn visit(r: usize, refs: &[Vec<usize>], state: &mut [u8]) -> Option<usize> {
            match state[r] {
                1 => return Some(r),
                2 => return None,
                _ => {}
            }
            state[r] = 1;
            for &next in &refs[r] {
                if let Some(hit) = visit(next, refs, state) {
                    return Some(hit);
                }
            }
            state[r] = 2;
            None
        }
        for r in 0..self.rules.len() {
            if let Some(hit) = visit(r, &left_refs, &mut state) {
                return Err(EmberError::GrammarCompileFailed(format!(
                    "left recursion detected for rule '{}'",
                    self.rules[hit].name
                )));
            }
        }
        Ok(())
    }
}

/// Largest count accepted in `{m,n}`; bounded forms expand into one rule per
/// optional copy.
pub const MAX_REPETITION: usize = 2000;

fn err(msg: impl Into<String>) -> EmberError {
    EmberError::GrammarCompileFailed(msg.into())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    symbols: HashMap<String, usize>,
    names: Vec<String>,
    bodies: Vec<Option<Vec<Vec<Element>>>>,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            symbols: HashMap::new(),
            names: Vec::new(),
            bodies: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn line(&self) -> usize {
        self.chars[..self.pos.min(self.chars.len())]
            .iter()
            .filter(|&&c| c == '\n')
            .count()
            + 1
    }

    fn fail(&self, msg: &str) -> EmberError {
        err(format!("line {}: {msg}", self.line()))
    }

    fn skip_space(&mut self, newline_ok: bool) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' => self.pos += 1,
                '\r' | '\n' if newline_ok => self.pos += 1,
                '#' => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn symbol(&mut self, name: &str) -> usize {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.names.len();
        self.symbols.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.bodies.push(None);
        id
    }

    fn generated(&mut self, base: &str, body: Vec<Vec<Element>>) -> usize {
        let mut n = self.names.len();
        let mut name = format!("{base}_{n}");
        while self.symbols.contains_key(&name) {
            n += 1;
            name = format!("{base}_{n}");
        }
        let id = self.symbol(&name);
        self.bodies[id] = Some(body);
        id
    }

    fn parse(mut self) -> Result<Grammar> {
        loop {
            self.skip_space(true);
            if self.peek().is_none() {
                break;
            }
            self.parse_rule()?;
        }

        let root = *self
            .symbols
            .get("root")
            .ok_or_else(|| err("grammar does not define 'root'"))?;
        let mut rules = Vec::with_capacity(self.names.len());
        for (name, body) in self.names.into_iter().zip(self.bodies) {
            let alts = body.ok_or_else(|| err(format!("undefined rule identifier '{name}'")))?;
            rules.push(Rule { name, alts });
        }
        let grammar = Grammar { rules, root };
        grammar.check_left_recursion()?;
        Ok(grammar)
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.fail("expecting name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_rule(&mut self) -> Result<()> {
        let name = self.parse_name()?;
        self.skip_space(false);
        for expected in "::=".chars() {
            if self.peek() != Some(expected) {
                return Err(self.fail("expecting ::="));
            }
            self.pos += 1;
        }
        self.skip_space(true);
        let alts = self.parse_alternates(&name, false)?;
        let id = self.symbol(&name);
        if self.bodies[id].is_some() {
            return Err(self.fail(&format!("rule '{name}' defined twice")));
        }
        self.bodies[id] = Some(alts);

        self.skip_space(false);
        match self.peek() {
            None | Some('\n') | Some('\r') => Ok(()),
            Some(c) => Err(self.fail(&format!("unexpected '{c}' after rule"))),
        }
    }

    fn parse_alternates(&mut self, rule: &str, nested: bool) -> Result<Vec<Vec<Element>>> {
        let mut alts = vec![self.parse_sequence(rule, nested)?];
        loop {
            if self.peek() == Some('|') {
                self.pos += 1;
                self.skip_space(true);
                alts.push(self.parse_sequence(rule, nested)?);
                continue;
            }
            if !nested {
                // a '|' opening the next line continues the rule
                let save = self.pos;
                self.skip_space(true);
                if self.peek() == Some('|') {
                    continue;
                }
                self.pos = save;
            }
            break;
        }
        Ok(alts)
    }

    fn parse_sequence(&mut self, rule: &str, nested: bool) -> Result<Vec<Element>> {
        let mut seq: Vec<Element> = Vec::new();
        let mut last_start = 0;
        while let Some(c) = self.peek() {
            match c {
                '"' => {
                    last_start = seq.len();
                    self.pos += 1;
                    loop {
                        match self.peek() {
                            None => return Err(self.fail("unexpected end of input in literal")),
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {
                                let ch = self.parse_char()?;
                                seq.push(Element::literal(ch));
                            }
                        }
                    }
                }
                '[' => {
                    last_start = seq.len();
                    self.pos += 1;
                    seq.push(self.parse_class()?);
                }
                '.' => {
                    last_start = seq.len();
                    self.pos += 1;
                    seq.push(Element::Any);
                }
                '(' => {
                    last_start = seq.len();
                    self.pos += 1;
                    self.skip_space(true);
                    let alts = self.parse_alternates(rule, true)?;
                    if self.peek() != Some(')') {
                        return Err(self.fail("expecting ')'"));
                    }
                    self.pos += 1;
                    let id = self.generated(rule, alts);
                    seq.push(Element::Ref(id));
                }
                '*' | '+' | '?' => {
                    self.pos += 1;
                    let (min, max) = match c {
                        '*' => (0, None),
                        '+' => (1, None),
                        _ => (0, Some(1)),
                    };
                    last_start = self.repeat(rule, &mut seq, last_start, min, max)?;
                }
                '{' => {
                    self.pos += 1;
                    let (min, max) = self.parse_braces()?;
                    last_start = self.repeat(rule, &mut seq, last_start, min, max)?;
                }
                c if is_name_char(c) => {
                    last_start = seq.len();
                    let name = self.parse_name()?;
                    let id = self.symbol(&name);
                    seq.push(Element::Ref(id));
                }
                _ => break,
            }
            self.skip_space(nested);
        }
        Ok(seq)
    }

    fn parse_braces(&mut self) -> Result<(usize, Option<usize>)> {
        self.skip_space(false);
        let min = self.parse_int()?;
        self.skip_space(false);
        let max = match self.peek() {
            Some('}') => Some(min),
            Some(',') => {
                self.pos += 1;
                self.skip_space(false);
                if self.peek() == Some('}') {
                    None
                } else {
                    Some(self.parse_int()?)
                }
            }
            _ => return Err(self.fail("expecting ',' or '}'")),
        };
        self.skip_space(false);
        if self.peek() != Some('}') {
            return Err(self.fail("expecting '}'"));
        }
        self.pos += 1;
        if max.is_some_and(|m| m < min) {
            return Err(self.fail("repetition maximum below minimum"));
        }
        if min.max(max.unwrap_or(0)) > MAX_REPETITION {
            return Err(self.fail(&format!("repetition count above {MAX_REPETITION}")));
        }
        Ok((min, max))
    }

    fn parse_int(&mut self) -> Result<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits.parse().map_err(|_| self.fail("expecting integer"))
    }

    /// Replace `seq[start..]` with `min..=max` copies of itself. Returns the
    /// start of the replacement so a following operator applies to all of it.
    fn repeat(
        &mut self,
        rule: &str,
        seq: &mut Vec<Element>,
        start: usize,
        min: usize,
        max: Option<usize>,
    ) -> Result<usize> {
        if start >= seq.len() {
            return Err(self.fail("expecting preceding item to repeat"));
        }
        let unit = seq.split_off(start);
        for _ in 0..min {
            seq.extend(unit.iter().cloned());
        }
        match max {
            None => {
                let id = self.generated(rule, Vec::new());
                let mut looped = unit.clone();
                looped.push(Element::Ref(id));
                self.bodies[id] = Some(vec![looped, Vec::new()]);
                seq.push(Element::Ref(id));
            }
            Some(max) => {
                let mut tail: Option<usize> = None;
                for _ in min..max {
                    let mut first = unit.clone();
                    if let Some(t) = tail {
                        first.push(Element::Ref(t));
                    }
                    tail = Some(self.generated(rule, vec![first, Vec::new()]));
                }
                if let Some(t) = tail {
                    seq.push(Element::Ref(t));
                }
            }
        }
        Ok(start)
    }

    fn parse_class(&mut self) -> Result<Element> {
        let negated = self.peek() == Some('^');
        if negated {
            self.pos += 1;
        }
        let mut ranges = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("unexpected end of input in character class")),
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let lo = self.parse_char()?;
                    let hi = if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                        self.pos += 1;
                        self.parse_char()?
                    } else {
                        lo
                    };
                    ranges.push((lo, hi));
                }
            }
        }
        Ok(Element::Char { ranges, negated })
    }

    fn parse_char(&mut self) -> Result<char> {
        let c = self.peek().ok_or_else(|| self.fail("unexpected end of input"))?;
        self.pos += 1;
        if c != '\\' {
            return Ok(c);
        }
        let esc = self.peek().ok_or_else(|| self.fail("unexpected end of input after '\\'"))?;
        self.pos += 1;
        let hex = |p: &mut Self, n: usize| -> Result<char> {
            let digits: String = p.chars.get(p.pos..p.pos + n).unwrap_or(&[]).iter().collect();
            p.pos += n;
            u32::from_str_radix(&digits, 16)
                .ok()
                .filter(|_| digits.len() == n)
                .and_then(char::from_u32)
                .ok_or_else(|| p.fail(&format!("invalid hex escape '{digits}'")))
        };
        match esc {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            'x' => hex(self, 2),
            'u' => hex(self, 4),
            'U' => hex(self, 8),
            '\\' | '"' | '[' | ']' | '-' | '/' | '^' => Ok(esc),
            other => Err(self.fail(&format!("unknown escape '\\{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals_classes_and_refs() {
        let g = Grammar::parse(
            r#"
            # yes or no answers
            root ::= answer "."
            answer ::= "yes" | "no" | [0-9]+
            "#,
        )
        .unwrap();
        let root = &g.rules()[g.root()];
        assert_eq!(root.alts.len(), 1);
        let answer = g.rules().iter().find(|r| r.name == "answer").unwrap();
        assert_eq!(answer.alts.len(), 3);
        assert_eq!(answer.alts[0].len(), 3);
    }

    #[test]
    fn continuation_lines_and_escapes() {
        let g = Grammar::parse("root ::= \"a\"\n  | [^\\n\\x41]\n  | \"\\u00e9\"").unwrap();
        let root = &g.rules()[g.root()];
        assert_eq!(root.alts.len(), 3);
        assert!(root.alts[1][0].matches('b'));
        assert!(!root.alts[1][0].matches('A'));
        assert!(root.alts[2][0].matches('é'));
    }

    #[test]
    fn bounded_repetition_expands() {
        let g = Grammar::parse("root ::= [a]{2,4}").unwrap();
        let root = &g.rules()[g.root()];
        // two required copies then the optional tail rule
        assert_eq!(root.alts[0].len(), 3);
    }

    #[test]
    fn repetition_limit_is_inclusive() {
        let g = Grammar::parse("root ::= \"a\"{0,2000}").unwrap();
        assert_eq!(g.rules()[g.root()].alts[0].len(), 1);
        assert!(Grammar::parse("root ::= \"a\"{2000,}").is_ok());
    }

    #[test]
    fn rejects_bad_grammars() {
        for src in [
            "answer ::= \"x\"",
            "root ::= missing",
            "root ::= root \"a\"",
            "root ::= a\na ::= b? a \"x\"\nb ::= \"y\"",
            "root ::= \"unterminated",
            "root ::= [a]{3,1}",
            "root ::= \"a\"{0,200000}",
            "root ::= \"a\"{2001}",
        ] {
            let e = Grammar::parse(src).unwrap_err();
            assert!(matches!(e, EmberError::GrammarCompileFailed(_)), "{src}: {e}");
        }
    }
}
