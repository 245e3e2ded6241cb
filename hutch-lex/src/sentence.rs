#![allow(clippy::while_let_on_iterator)]

use hutch_ast::{Span, span};

use crate::LexError;

/// One physical statement, still untokenized. `offset` is the byte position
/// of `text` inside the module source.
#[derive(Clone, Debug, PartialEq)]
pub struct Sentence {
    pub text: String,
    pub offset: usize,
}

const OPENERS: &str = "([{";

fn closer_of(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_digit() || c.is_ascii_alphabetic() || c == '_' || "=,.+-/*%^~|&!<>".contains(c)
}

#[derive(Clone, Copy)]
enum Mode {
    Code,
    Str { opener: char, escape: bool },
    Comment,
}

/// Splits module source into statements. Statement boundaries are newlines
/// and block-opening `:` (which must end its line); `#` comments are
/// stripped; string and bracket state is tracked so signs inside literals
/// never terminate a statement.
pub fn sentenize(src: &str) -> Result<Vec<Sentence>, LexError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut mode = Mode::Code;
    let mut brackets: Vec<char> = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    let mut push = |out: &mut Vec<Sentence>, from: usize, to: usize| {
        let text: String = chars[from..to].iter().collect();
        out.push(Sentence { text, offset: from });
    };

    while i < chars.len() {
        let c = chars[i];
        match mode {
            Mode::Code => {
                if is_code_char(c) {
                    // plain statement text
                } else if c == '"' || c == '\'' {
                    mode = Mode::Str {
                        opener: c,
                        escape: false,
                    };
                } else if OPENERS.contains(c) {
                    brackets.push(closer_of(c));
                } else if c == ')' || c == ']' || c == '}' {
                    match brackets.pop() {
                        Some(expected) if expected == c => {}
                        _ => {
                            return Err(LexError {
                                message: format!("unmatched closing bracket `{c}`"),
                                span: span(i, 1),
                            });
                        }
                    }
                } else if c == '#' {
                    push(&mut out, start, i);
                    mode = Mode::Comment;
                } else if c == '\n' {
                    push(&mut out, start, i);
                    start = i + 1;
                } else if c == ':' && brackets.is_empty() {
                    // A block-opening colon must end its line.
                    let mut j = i + 1;
                    while j < chars.len() && chars[j] == ' ' {
                        j += 1;
                    }
                    if j < chars.len() && chars[j] != '\n' {
                        return Err(LexError {
                            message: "statement on the same line as a block-opening `:`".into(),
                            span: span(j, 1),
                        });
                    }
                    push(&mut out, start, i + 1);
                    if j < chars.len() {
                        start = j + 1;
                        i = j;
                    } else {
                        start = chars.len();
                    }
                } else if c != ' ' && c != '\t' && c != ':' && c != '\r' {
                    return Err(LexError {
                        message: format!("unexpected `{c}` in statement {}", out.len() + 1),
                        span: span(i, 1),
                    });
                }
            }
            Mode::Str { opener, escape } => {
                if escape {
                    mode = Mode::Str {
                        opener,
                        escape: false,
                    };
                } else if c == '\\' {
                    mode = Mode::Str {
                        opener,
                        escape: true,
                    };
                } else if c == opener {
                    mode = Mode::Code;
                }
            }
            Mode::Comment => {
                if c == '\n' {
                    mode = Mode::Code;
                    start = i + 1;
                }
            }
        }
        i += 1;
    }

    match mode {
        Mode::Str { .. } => {
            return Err(LexError {
                message: "unterminated string literal".into(),
                span: span(start, src.len().saturating_sub(start).max(1)),
            });
        }
        Mode::Code if !brackets.is_empty() => {
            return Err(LexError {
                message: "unclosed bracket at end of input".into(),
                span: span(start, src.len().saturating_sub(start).max(1)),
            });
        }
        Mode::Code => {
            if start < chars.len() {
                push(&mut out, start, chars.len());
            }
        }
        Mode::Comment => {}
    }

    Ok(out)
}

/// Nesting level of a sentence: the number of leading whitespace characters.
pub fn level_of(text: &str) -> usize {
    text.len() - text.trim_start().len()
}
