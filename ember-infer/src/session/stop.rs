//! Incremental text assembly for streamed completions: UTF-8 reassembly,
//! stop-word search and hold-back of text that may still turn into a stop.

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Earliest full stop-word match in `text`, searching only the tail that the
/// last piece (`piece_len` bytes) could have completed.
pub fn find_stop(text: &str, words: &[String], piece_len: usize) -> Option<(usize, String)> {
    let mut best: Option<(usize, String)> = None;
    for word in words.iter().filter(|w| !w.is_empty()) {
        let from = floor_boundary(text, text.len().saturating_sub(word.len() + piece_len));
        if let Some(pos) = text[from..].find(word.as_str()) {
            let at = from + pos;
            if best.as_ref().map_or(true, |(b, _)| at < *b) {
                best = Some((at, word.clone()));
            }
        }
    }
    best
}

/// Start of the longest suffix of `text` that is a proper prefix of a stop
/// word, i.e. text that must be withheld for now.
pub fn partial_stop(text: &str, words: &[String]) -> Option<usize> {
    let mut start: Option<usize> = None;
    for word in words {
        for (len, _) in word.char_indices().skip(1) {
            if text.ends_with(&word[..len]) {
                let at = text.len() - len;
                start = Some(start.map_or(at, |s| s.min(at)));
            }
        }
    }
    start
}

/// Generated text with streaming bookkeeping.
#[derive(Debug, Default)]
pub struct TextAssembler {
    text: String,
    /// Trailing bytes of a character split across tokens.
    pending: Vec<u8>,
    /// Bytes of `text` already handed to the consumer.
    sent: usize,
}

impl TextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_pending_bytes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete character: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Cut the text at a stop word so it never reaches the consumer.
    pub fn truncate(&mut self, at: usize) {
        self.text.truncate(at);
        self.sent = self.sent.min(at);
        self.pending.clear();
    }

    /// Text that can be released now, holding back possible stop prefixes
    /// and unfinished characters.
    pub fn release(&mut self, stops: &[String]) -> String {
        if !self.pending.is_empty() {
            return String::new();
        }
        let unsent = &self.text[self.sent..];
        let end = match partial_stop(unsent, stops) {
            Some(hold) => self.sent + hold,
            None => self.text.len(),
        };
        let out = self.text[self.sent..end].to_string();
        self.sent = end;
        out
    }

    /// Everything not yet released, including undecodable trailing bytes.
    pub fn flush(&mut self) -> String {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.text.push_str(&tail);
            self.pending.clear();
        }
        let out = self.text[self.sent..].to_string();
        self.sent = self.text.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(w: &[&str]) -> Vec<String> {
        w.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_earliest_stop_in_tail() {
        let stops = words(&["END", "."]);
        assert_eq!(find_stop("hello END", &stops, 4), Some((6, "END".into())));
        assert_eq!(find_stop("hello. END", &stops, 5), Some((5, ".".into())));
        assert_eq!(find_stop("a.b", &stops, 2), Some((1, ".".into())));
        // the window only covers what the last piece could complete
        assert_eq!(find_stop("x.yyyyyy", &stops, 1), None);
    }

    #[test]
    fn holds_back_possible_stop_prefix() {
        let stops = words(&["</answer>"]);
        assert_eq!(partial_stop("the </ans", &stops), Some(4));
        assert_eq!(partial_stop("plain", &stops), None);

        let mut t = TextAssembler::new();
        t.push(b"42 </a");
        assert_eq!(t.release(&stops), "42 ");
        t.push(b"bc");
        assert_eq!(t.release(&stops), "</abc");
    }

    #[test]
    fn reassembles_split_characters() {
        let mut t = TextAssembler::new();
        let snow = "☃".as_bytes();
        t.push(&snow[..2]);
        assert!(t.has_pending_bytes());
        assert_eq!(t.release(&[]), "");
        t.push(&snow[2..]);
        assert_eq!(t.release(&[]), "☃");
        t.push(&[0xff, b'a']);
        assert_eq!(t.release(&[]), "\u{fffd}a");
    }

    #[test]
    fn truncate_drops_stop_word() {
        let mut t = TextAssembler::new();
        t.push(b"one. two");
        let (at, _) = find_stop(t.text(), &words(&["."]), 8).unwrap();
        t.truncate(at);
        assert_eq!(t.flush(), "one");
    }
}
