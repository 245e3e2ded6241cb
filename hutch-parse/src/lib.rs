#![forbid(unsafe_code)]

mod group;
mod pattern;

use hutch_ast::{Node, Span, span};
use hutch_lex::{LexError, tokenize};
use miette::Diagnostic;
use thiserror::Error;

pub use pattern::{parse_root, scan_sentence, scan_text};

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lex(#[from] LexError),

    #[error("parse error: {message}")]
    #[diagnostic(code(hutch::parse))]
    Syntax {
        message: String,
        #[label]
        span: Span,
    },
}

impl ParseError {
    /// Shifts the label by `offset`, turning a phrase-relative span into a
    /// module-relative one.
    pub fn shifted(self, offset: usize) -> Self {
        match self {
            ParseError::Lex(e) => ParseError::Lex(LexError {
                message: e.message,
                span: span(e.span.offset() + offset, e.span.len()),
            }),
            ParseError::Syntax { message, span: sp } => ParseError::Syntax {
                message,
                span: span(sp.offset() + offset, sp.len()),
            },
        }
    }
}

/// Tokenizes `text` and runs all precedence passes. Returns the top-level
/// forest; a well-formed statement body reduces to a single tree.
pub fn parse_tree(text: &str, assignment_list: bool) -> Result<Vec<Node>, ParseError> {
    let tokens = tokenize(text)?;
    group::group_all(tokens, assignment_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hutch_ast::{GroupKind, Node, PhraseKind, TokenKind};

    fn one(text: &str) -> Node {
        parse_root(text, false).unwrap()
    }

    fn kind_of(n: &Node) -> GroupKind {
        n.group_kind().expect("expected a group")
    }

    #[test]
    fn binary_precedence_mul_before_plus() {
        let root = one("a + b * c");
        assert_eq!(kind_of(&root), GroupKind::Binary);
        let inner = root.inner();
        assert!(inner[1].is_sign("+"));
        assert_eq!(inner[2].group_kind(), Some(GroupKind::Binary));
        assert!(inner[2].inner()[1].is_sign("*"));
    }

    #[test]
    fn unary_minus_in_sign_context() {
        let root = one("x = -1");
        assert_eq!(kind_of(&root), GroupKind::Assignment);
        let rhs = &root.inner()[2];
        assert_eq!(rhs.group_kind(), Some(GroupKind::Unary));
        assert!(rhs.inner()[0].is_sign("-"));
    }

    #[test]
    fn call_binds_to_name() {
        let root = one("f(x, 2)");
        assert_eq!(kind_of(&root), GroupKind::Call);
        assert_eq!(root.inner()[0].leaf_text(TokenKind::Name), Some("f"));
        let args = &root.inner()[1];
        assert_eq!(args.group_kind(), Some(GroupKind::Paren));
        assert_eq!(args.inner()[0].group_kind(), Some(GroupKind::List));
    }

    #[test]
    fn method_call_keeps_receiver() {
        // items.push(v) groups as Call(Attr(items, ., push), (v))
        let root = one("items.push(v)");
        assert_eq!(kind_of(&root), GroupKind::Call);
        let callee = &root.inner()[0];
        assert_eq!(callee.group_kind(), Some(GroupKind::Attr));
        assert_eq!(callee.inner()[0].leaf_text(TokenKind::Name), Some("items"));
        assert_eq!(callee.inner()[2].leaf_text(TokenKind::Name), Some("push"));
    }

    #[test]
    fn index_after_call() {
        let root = one("f(x)[0]");
        assert_eq!(kind_of(&root), GroupKind::Index);
        assert_eq!(root.inner()[0].group_kind(), Some(GroupKind::Call));
    }

    #[test]
    fn is_not_merges_into_one_operator() {
        let root = one("a is not b");
        assert_eq!(kind_of(&root), GroupKind::Binary);
        let op = root.inner()[1].as_leaf().unwrap();
        assert_eq!(op.text, "is not");

        let root = one("a is in b");
        let op = root.inner()[1].as_leaf().unwrap();
        assert_eq!(op.text, "is in");
    }

    #[test]
    fn not_groups_as_unary() {
        let root = one("x and not y");
        assert_eq!(kind_of(&root), GroupKind::Binary);
        let rhs = &root.inner()[2];
        assert_eq!(rhs.group_kind(), Some(GroupKind::Unary));
        assert!(rhs.inner()[0].is_keyword("not"));
    }

    #[test]
    fn range_only_inside_containers() {
        let root = one("xs[1:n]");
        assert_eq!(kind_of(&root), GroupKind::Index);
        let bracket = &root.inner()[1];
        assert_eq!(bracket.inner()[0].group_kind(), Some(GroupKind::Range));

        // dict literal: pairs of key : value become Range groups inside {}
        let root = one("{1: 2, 3: 4}");
        assert_eq!(kind_of(&root), GroupKind::Brace);
    }

    #[test]
    fn comma_folds_into_list() {
        let root = one("a = 1, 2, 3");
        assert_eq!(kind_of(&root), GroupKind::Assignment);
        let rhs = &root.inner()[2];
        assert_eq!(rhs.group_kind(), Some(GroupKind::List));
        assert_eq!(rhs.inner().len(), 3);
    }

    #[test]
    fn assignment_list_mode_binds_defaults_first() {
        // unit headers: `a, b = 1` is a parameter list whose last member has
        // a default, not an assignment to a list.
        let normal = parse_root("a, b = 1", false).unwrap();
        assert_eq!(kind_of(&normal), GroupKind::Assignment);

        let header = parse_root("a, b = 1", true).unwrap();
        assert_eq!(kind_of(&header), GroupKind::List);
        assert_eq!(
            header.inner()[1].group_kind(),
            Some(GroupKind::Assignment)
        );
    }

    #[test]
    fn scan_classifies_statements() {
        let phrases = scan_text(
            "x = 0\nwhile x < 3:\n    x += 1\nunit f(a, b=2):\n    return a + b\n",
        )
        .unwrap();
        let kinds: Vec<PhraseKind> = phrases.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PhraseKind::Expr,
                PhraseKind::While,
                PhraseKind::Expr,
                PhraseKind::Unit,
                PhraseKind::Return,
            ]
        );
        assert_eq!(phrases[2].level, 4);
        assert!(phrases[1].tree.is_some());
    }

    #[test]
    fn scan_import_from_captures_holes() {
        let phrases = scan_text("import point from geometry\n").unwrap();
        assert_eq!(phrases[0].kind, PhraseKind::ImportFrom);
        assert_eq!(phrases[0].holes, vec!["point", "geometry"]);
        assert!(phrases[0].tree.is_none());
    }

    #[test]
    fn scan_plain_import() {
        let phrases = scan_text("import geometry\n").unwrap();
        assert_eq!(phrases[0].kind, PhraseKind::Import);
    }

    #[test]
    fn interface_unit_has_no_colon() {
        let phrases = scan_text("interface shape:\n    unit area()\n").unwrap();
        assert_eq!(phrases[0].kind, PhraseKind::Interface);
        assert_eq!(phrases[1].kind, PhraseKind::InterfaceUnit);
    }

    #[test]
    fn yield_from_before_yield() {
        let phrases = scan_text("yield from g()\nyield 1\n").unwrap();
        assert_eq!(phrases[0].kind, PhraseKind::YieldFrom);
        assert_eq!(phrases[1].kind, PhraseKind::Yield);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let phrases = scan_text("a = 1\n\n   \nb = 2\n").unwrap();
        assert_eq!(phrases.len(), 2);
    }

    #[test]
    fn unparseable_statement_errors() {
        assert!(scan_text("1 2\n").is_err());
    }
}
