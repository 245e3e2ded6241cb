//! Statement classification: each sentence is matched against a fixed list
//! of phrase patterns, first match wins. A pattern eats leading words,
//! optionally captures `?` holes, optionally requires a trailing `:`, and
//! parses whatever is left into an expression tree.

use hutch_ast::{Node, Phrase, PhraseKind, span};
use hutch_lex::sentenize;

use crate::{ParseError, parse_tree};

struct Pattern {
    kind: PhraseKind,
    words: &'static [&'static str],
    /// nothing may follow the words
    empty: bool,
    /// the sentence must end with `:`
    colon: bool,
    /// parse the rest in assignment-list mode (unit headers)
    assignment_list: bool,
}

const fn head(kind: PhraseKind, words: &'static [&'static str], colon: bool) -> Pattern {
    Pattern {
        kind,
        words,
        empty: false,
        colon,
        assignment_list: false,
    }
}

const fn bare(kind: PhraseKind, words: &'static [&'static str]) -> Pattern {
    Pattern {
        kind,
        words,
        empty: true,
        colon: false,
        assignment_list: false,
    }
}

const PATTERNS: &[Pattern] = &[
    head(PhraseKind::While, &["while"], true),
    head(PhraseKind::If, &["if"], true),
    head(PhraseKind::Elif, &["elif"], true),
    Pattern {
        kind: PhraseKind::Else,
        words: &["else"],
        empty: true,
        colon: true,
        assignment_list: false,
    },
    head(PhraseKind::For, &["for"], true),
    Pattern {
        kind: PhraseKind::Try,
        words: &["try"],
        empty: true,
        colon: true,
        assignment_list: false,
    },
    head(PhraseKind::Except, &["except"], true),
    head(PhraseKind::With, &["with"], true),
    head(PhraseKind::Return, &["return"], false),
    Pattern {
        kind: PhraseKind::Unit,
        words: &["unit"],
        empty: false,
        colon: true,
        assignment_list: true,
    },
    Pattern {
        kind: PhraseKind::InterfaceUnit,
        words: &["unit"],
        empty: false,
        colon: false,
        assignment_list: true,
    },
    head(PhraseKind::Class, &["class"], true),
    head(PhraseKind::Interface, &["interface"], true),
    head(PhraseKind::Raise, &["raise"], false),
    head(PhraseKind::YieldFrom, &["yield", "from"], false),
    head(PhraseKind::Yield, &["yield"], false),
    head(PhraseKind::Continue, &["continue"], false),
    bare(PhraseKind::Break, &["break"]),
    head(PhraseKind::Cast, &["cast"], false),
    bare(PhraseKind::Pass, &["pass"]),
    head(PhraseKind::Assert, &["assert"], false),
    head(PhraseKind::Import, &["import"], false),
    head(PhraseKind::ImportFrom, &["import", "?", "from", "?"], false),
];

/// Splits off the next whitespace-delimited word; the remainder loses its
/// leading whitespace.
fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(|c: char| c.is_whitespace()) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

impl Pattern {
    fn matches(&self, lstrip: &str, level: usize) -> Result<Option<Phrase>, ParseError> {
        let mut s: String = lstrip.to_string();
        let mut holes: Vec<String> = Vec::new();

        for want in self.words {
            let (mut word, rest) = next_word(&s);
            let mut rest = rest.to_string();
            // A `:` glued to the word belongs to the sentence, not the word.
            if let Some(stripped) = word.strip_suffix(':') {
                word = stripped;
                rest = format!(":{rest}");
            }
            if *want == "?" {
                if word.is_empty() {
                    return Ok(None);
                }
                holes.push(word.to_string());
            } else if word != *want {
                return Ok(None);
            }
            s = rest;
        }

        if self.colon {
            let trimmed = s.trim_end();
            match trimmed.strip_suffix(':') {
                Some(body) => s = body.to_string(),
                None => return Ok(None),
            }
        }
        let body = s.trim_end();
        if self.empty && !body.is_empty() {
            return Ok(None);
        }

        let tree = if body.is_empty() {
            None
        } else {
            let mut roots = parse_tree(body, self.assignment_list)?;
            if roots.len() != 1 {
                return Ok(None);
            }
            roots.pop()
        };

        Ok(Some(Phrase {
            kind: self.kind,
            tree,
            level,
            text: lstrip.to_string(),
            holes,
        }))
    }
}

/// Classifies one sentence. Returns `None` for blank sentences.
pub fn scan_sentence(text: &str) -> Result<Option<Phrase>, ParseError> {
    let lstrip = text.trim_start();
    if lstrip.is_empty() {
        return Ok(None);
    }
    let level = text.len() - lstrip.len();

    for pattern in PATTERNS {
        if let Some(phrase) = pattern.matches(lstrip, level)? {
            return Ok(Some(phrase));
        }
    }

    let body = lstrip.trim_end();
    let mut roots = parse_tree(body, false)?;
    if roots.len() != 1 {
        return Err(ParseError::Syntax {
            message: format!(
                "cannot parse statement `{}`: {} expression trees remain",
                body,
                roots.len()
            ),
            span: span(level, body.len().max(1)),
        });
    }
    Ok(Some(Phrase {
        kind: PhraseKind::Expr,
        tree: roots.pop(),
        level,
        text: lstrip.to_string(),
        holes: Vec::new(),
    }))
}

/// Scans a whole module: sentenizes, classifies every non-blank sentence.
/// Error spans are shifted to module-relative offsets.
pub fn scan_text(src: &str) -> Result<Vec<Phrase>, ParseError> {
    let sentences = sentenize(src)?;
    let mut out = Vec::new();
    for sentence in &sentences {
        match scan_sentence(&sentence.text) {
            Ok(Some(phrase)) => out.push(phrase),
            Ok(None) => {}
            Err(err) => return Err(err.shifted(sentence.offset)),
        }
    }
    Ok(out)
}

/// Parses a full statement body into its single expression tree.
pub fn parse_root(text: &str, assignment_list: bool) -> Result<Node, ParseError> {
    let body = text.trim();
    let mut roots = parse_tree(body, assignment_list)?;
    if roots.len() != 1 {
        return Err(ParseError::Syntax {
            message: format!("expected one expression, found {}", roots.len()),
            span: span(0, body.len().max(1)),
        });
    }
    match roots.pop() {
        Some(root) => Ok(root),
        None => unreachable!(),
    }
}
