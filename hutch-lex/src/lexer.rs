use hutch_ast::{Token, TokenKind, span};
use logos::Logos;

use crate::LexError;

pub const KEYWORDS: &[&str] = &[
    "and", "if", "or", "not", "while", "for", "in", "import", "class", "unit", "else", "True",
    "False", "None", "is",
];

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
enum RawToken {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Name,

    #[regex(r"[0-9][0-9.]*")]
    Digit,

    #[regex(r#""([^"\\]|\\.)*""#)]
    #[regex(r"'([^'\\]|\\.)*'")]
    Str,

    // `,`/`.`/`:` stand alone; the operator signs may carry a trailing `=`.
    #[regex(r"[,.:]")]
    #[regex(r"[/*&^%~=+<>!\-]=?")]
    Sign,

    #[regex(r"[(\[{]")]
    Open,

    #[regex(r"[)\]}]")]
    Close,
}

/// Tokenizes one sentence. Names matching a keyword come out as
/// `TokenKind::Keyword`; string tokens keep their surrounding quotes.
pub fn tokenize(text: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = RawToken::lexer(text);
    let mut out = Vec::new();

    while let Some(raw) = lexer.next() {
        let sp = lexer.span();
        let slice = lexer.slice();
        let raw = raw.map_err(|()| LexError {
            message: format!("unexpected character `{}`", slice),
            span: span(sp.start, sp.len().max(1)),
        })?;

        let kind = match raw {
            RawToken::Name if KEYWORDS.contains(&slice) => TokenKind::Keyword,
            RawToken::Name => TokenKind::Name,
            RawToken::Digit => TokenKind::Digit,
            RawToken::Str => TokenKind::Str,
            RawToken::Sign => TokenKind::Sign,
            RawToken::Open => TokenKind::Open,
            RawToken::Close => TokenKind::Close,
        };
        out.push(Token::new(kind, slice, sp.start));
    }

    Ok(out)
}

/// Resolves `\n` and `\0` escapes the way the generated runtime sees them.
pub fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\0", "\0")
}

/// Strips the surrounding quotes of a string token.
pub fn string_body(text: &str) -> &str {
    if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    }
}
