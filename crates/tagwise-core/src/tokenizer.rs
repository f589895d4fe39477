//! CoNLL-style tokenizer
//!
//! Splits text the way the CoNLL-2003 corpus was tokenized: whitespace
//! separates tokens, common punctuation stands alone, and abbreviations,
//! decimal numbers and contractions are kept in their corpus form.

use crate::Token;

const RIGHT_SINGLE_QUOTE: char = '\u{2019}';

fn is_split_punctuation(ch: char) -> bool {
    matches!(ch, '[' | ']' | '.' | '!' | ',' | '"' | ':' | '|' | '?')
}

/// A period stays attached to short tokens and dotted abbreviations ("A.", "U.S.")
fn joins_period(token: &str) -> bool {
    let mut rev = token.chars().rev();
    let last = rev.next();
    let second_last = rev.next();
    token.chars().count() == 1 || last == Some('.') || second_last == Some('.')
}

struct TokenBuilder {
    tokens: Vec<Token>,
    current: String,
    start: usize,
}

impl TokenBuilder {
    fn new() -> Self {
        Self {
            tokens: Vec::new(),
            current: String::new(),
            start: 0,
        }
    }

    fn push_char(&mut self, pos: usize, ch: char) {
        if self.current.is_empty() {
            self.start = pos;
        }
        self.current.push(ch);
    }

    fn push_single(&mut self, pos: usize, ch: char) {
        self.tokens
            .push(Token::new(pos, pos + ch.len_utf8(), ch.to_string()));
    }

    /// Emit the pending token, splitting at typographic apostrophes
    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.current);
        let mut offset = self.start;

        for (i, piece) in text.split(RIGHT_SINGLE_QUOTE).enumerate() {
            if i == 0 {
                if !piece.is_empty() {
                    self.tokens
                        .push(Token::new(offset, offset + piece.len(), piece));
                }
                offset += piece.len();
            } else {
                // The quote itself is rewritten as an ASCII apostrophe
                let len = RIGHT_SINGLE_QUOTE.len_utf8() + piece.len();
                self.tokens
                    .push(Token::new(offset, offset + len, format!("'{piece}")));
                offset += len;
            }
        }
    }
}

/// Tokenize `text` into CoNLL-style tokens with byte offsets
///
/// ```
/// use tagwise_core::tokenize;
///
/// let words: Vec<String> = tokenize("I don't work at the U.S. office.")
///     .into_iter()
///     .map(|t| t.text)
///     .collect();
/// assert_eq!(words, ["I", "don", "'t", "work", "at", "the", "U.S.", "office", "."]);
/// ```
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut builder = TokenBuilder::new();

    for (pos, ch) in text.char_indices() {
        if ch == '\'' {
            builder.flush();
            builder.push_char(pos, ch);
        } else if is_split_punctuation(ch) {
            if builder.current.is_empty() {
                builder.push_single(pos, ch);
            } else if ch == '.' && joins_period(&builder.current) {
                builder.push_char(pos, ch);
            } else if (ch == ',' || ch == '.')
                && builder.current.ends_with(|c: char| c.is_ascii_digit())
            {
                builder.push_char(pos, ch);
            } else {
                builder.flush();
                builder.push_single(pos, ch);
            }
        } else if ch.is_whitespace() {
            builder.flush();
        } else {
            builder.push_char(pos, ch);
        }
    }
    builder.flush();

    builder.tokens
}

/// Build tokens from pre-split words, with offsets as if joined by single spaces
pub fn tokens_from_words<S: AsRef<str>>(words: &[S]) -> Vec<Token> {
    let mut offset = 0;
    words
        .iter()
        .map(|w| {
            let w = w.as_ref();
            let token = Token::new(offset, offset + w.len(), w);
            offset += w.len() + 1;
            token
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn words(text: &str) -> Vec<String> {
        tokenize(text).into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn test_whitespace_and_punctuation() {
        assert_eq!(
            words("My name is Davis King and I work for MIT."),
            ["My", "name", "is", "Davis", "King", "and", "I", "work", "for", "MIT", "."]
        );
        assert_eq!(words("Wait! [yes]: \"no\"?"), [
            "Wait", "!", "[", "yes", "]", ":", "\"", "no", "\"", "?"
        ]);
    }

    #[test]
    fn test_abbreviations_keep_periods() {
        assert_eq!(words("the U.S. Army"), ["the", "U.S.", "Army"]);
        assert_eq!(words("John A. Smith"), ["John", "A.", "Smith"]);
        assert_eq!(words("Wait..."), ["Wait", ".", ".", "."]);
    }

    #[test]
    fn test_numbers_keep_separators() {
        assert_eq!(words("pi is 3.14"), ["pi", "is", "3.14"]);
        assert_eq!(words("1,000 people"), ["1,000", "people"]);
        assert_eq!(words("costs 5, maybe"), ["costs", "5,", "maybe"]);
    }

    #[test]
    fn test_contractions() {
        assert_eq!(words("I don't know"), ["I", "don", "'t", "know"]);
        assert_eq!(words("'tis"), ["'tis"]);
    }

    #[test]
    fn test_typographic_apostrophe() {
        let tokens = tokenize("don\u{2019}t stop");
        let texts: Vec<&str> = tokens.iter().map(|t| t.as_str()).collect();
        assert_eq!(texts, ["don", "'t", "stop"]);
        assert_eq!((tokens[0].start, tokens[0].end), (0, 3));
        assert_eq!((tokens[1].start, tokens[1].end), (3, 7));
        assert_eq!(tokens[2].start, 8);
    }

    #[test]
    fn test_offsets_point_into_source() {
        let text = "Brian  Smith\tfrom CMU.";
        for token in tokenize(text) {
            assert_eq!(&text[token.start..token.end], token.text);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize(" \n\t ").is_empty());
    }

    #[test]
    fn test_tokens_from_words() {
        let tokens = tokens_from_words(&["New", "York"]);
        assert_eq!(tokens[0], Token::new(0, 3, "New"));
        assert_eq!(tokens[1], Token::new(4, 8, "York"));
    }

    proptest! {
        #[test]
        fn prop_tokens_are_ordered_and_in_bounds(text in "\\PC{0,64}") {
            let tokens = tokenize(&text);
            let mut last_end = 0;
            for token in &tokens {
                prop_assert!(token.start < token.end);
                prop_assert!(token.end <= text.len());
                prop_assert!(token.start >= last_end);
                prop_assert!(!token.text.is_empty());
                prop_assert!(!token.text.chars().any(char::is_whitespace));
                last_end = token.end;
            }
        }

        #[test]
        fn prop_ascii_tokens_match_source(text in "[a-zA-Z0-9 .,!?'\\-]{0,64}") {
            for token in tokenize(&text) {
                prop_assert_eq!(&text[token.start..token.end], token.text.as_str());
            }
        }
    }
}
