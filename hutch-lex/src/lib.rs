#![forbid(unsafe_code)]

mod lexer;
mod sentence;

use hutch_ast::Span;
use miette::Diagnostic;
use thiserror::Error;

pub use lexer::{KEYWORDS, string_body, tokenize, unescape};
pub use sentence::{Sentence, level_of, sentenize};

#[derive(Debug, Error, Diagnostic)]
#[error("lex error: {message}")]
#[diagnostic(code(hutch::lex))]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hutch_ast::TokenKind;

    #[test]
    fn sentenize_splits_on_newlines_and_colons() {
        let src = "x = 1\nwhile x < 3:\n    x = x + 1\n";
        let got = sentenize(src).unwrap();
        let texts: Vec<&str> = got.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["x = 1", "while x < 3:", "    x = x + 1"]);
        assert_eq!(level_of(&got[2].text), 4);
    }

    #[test]
    fn sentenize_strips_comments() {
        let got = sentenize("a = 1 # trailing\nb = 2\n").unwrap();
        let texts: Vec<&str> = got.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a = 1 ", "b = 2"]);
    }

    #[test]
    fn sentenize_ignores_colon_inside_brackets() {
        let got = sentenize("d = {1: 2}\n").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "d = {1: 2}");
    }

    #[test]
    fn sentenize_rejects_inline_block() {
        let err = sentenize("if x: y = 1\n").unwrap_err();
        assert!(err.message.contains("block-opening"));
    }

    #[test]
    fn sentenize_rejects_unbalanced_brackets() {
        assert!(sentenize("f(1\n").is_err());
        assert!(sentenize("f 1)\n").is_err());
    }

    #[test]
    fn sentenize_rejects_unterminated_string() {
        let err = sentenize("s = \"abc\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn tokenize_basic_kinds() {
        let toks = tokenize("total += f(x1, 2.5) # done").unwrap();
        let kinds: Vec<TokenKind> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Name,
                TokenKind::Sign,
                TokenKind::Name,
                TokenKind::Open,
                TokenKind::Name,
                TokenKind::Sign,
                TokenKind::Digit,
                TokenKind::Close,
            ]
        );
        assert_eq!(toks[1].text, "+=");
    }

    #[test]
    fn tokenize_keywords_and_names() {
        let toks = tokenize("for item in items").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Keyword);
        assert_eq!(toks[1].kind, TokenKind::Name);
        assert_eq!(toks[2].kind, TokenKind::Keyword);
        assert_eq!(toks[2].text, "in");
    }

    #[test]
    fn tokenize_strings_keep_quotes() {
        let toks = tokenize("s = 'a\\nb'").unwrap();
        assert_eq!(toks[2].kind, TokenKind::Str);
        assert_eq!(toks[2].text, "'a\\nb'");
        assert_eq!(string_body(&toks[2].text), "a\\nb");
        assert_eq!(unescape(string_body(&toks[2].text)), "a\nb");
    }

    #[test]
    fn tokenize_compound_signs() {
        let toks = tokenize("a <= b != c").unwrap();
        assert_eq!(toks[1].text, "<=");
        assert_eq!(toks[3].text, "!=");
    }
}
