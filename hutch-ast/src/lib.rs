#![forbid(unsafe_code)]

use miette::SourceSpan;

pub type Span = SourceSpan;

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Keyword,
    Digit,
    Str,
    Sign,
    Open,
    Close,
}

/// One lexical token of a phrase. `offset` is the byte position inside the
/// phrase text, used for labels and for deriving comprehension scope ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            offset,
        }
    }

    pub fn is(&self, kind: TokenKind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }
}

/// Structural kind of a grouped sub-tree, produced by the precedence passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    /// `( ... )` contents
    Paren,
    /// `[ ... ]` contents
    Bracket,
    /// `{ ... }` contents
    Brace,
    /// callee + Paren group
    Call,
    /// owner + Bracket group
    Index,
    /// owner, `.` sign, member
    Attr,
    /// sign/`not` + operand
    Unary,
    /// lhs, operator, rhs (arithmetic / logical / membership)
    Binary,
    /// lhs, comparison sign, rhs
    Compare,
    /// two adjacent names, e.g. a typed parameter `ref p`
    Pair,
    /// comma-separated items
    List,
    /// `:`-separated slice bounds (only inside `[]` / `{}`)
    Range,
    /// target, assignment sign (or `in`), value
    Assignment,
}

/// A precedence-resolved expression tree: either a single token or a group
/// of sub-trees.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Leaf(Token),
    Group(Group),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub kind: GroupKind,
    pub inner: Vec<Node>,
}

impl Node {
    pub fn group(kind: GroupKind, inner: Vec<Node>) -> Self {
        Node::Group(Group { kind, inner })
    }

    pub fn as_leaf(&self) -> Option<&Token> {
        match self {
            Node::Leaf(t) => Some(t),
            Node::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Node::Leaf(_) => None,
            Node::Group(g) => Some(g),
        }
    }

    pub fn group_kind(&self) -> Option<GroupKind> {
        self.as_group().map(|g| g.kind)
    }

    pub fn is_group(&self, kind: GroupKind) -> bool {
        self.group_kind() == Some(kind)
    }

    pub fn inner(&self) -> &[Node] {
        match self {
            Node::Leaf(_) => &[],
            Node::Group(g) => &g.inner,
        }
    }

    /// Leaf text, if this is a leaf of the given kind.
    pub fn leaf_text(&self, kind: TokenKind) -> Option<&str> {
        match self {
            Node::Leaf(t) if t.kind == kind => Some(&t.text),
            _ => None,
        }
    }

    pub fn is_sign(&self, sign: &str) -> bool {
        matches!(self, Node::Leaf(t) if t.kind == TokenKind::Sign && t.text == sign)
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        matches!(self, Node::Leaf(t) if t.kind == TokenKind::Keyword && t.text == word)
    }

    /// Human-readable tag for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Node::Leaf(t) => format!("{:?} `{}`", t.kind, t.text),
            Node::Group(g) => format!("{:?}", g.kind),
        }
    }
}

/// Statement kind, decided by the phrase-pattern scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhraseKind {
    While,
    If,
    Elif,
    Else,
    For,
    Try,
    Except,
    With,
    Return,
    Unit,
    /// `unit name(args)` without a colon, inside an `interface` block.
    InterfaceUnit,
    Class,
    Interface,
    Raise,
    YieldFrom,
    Yield,
    Continue,
    Break,
    Cast,
    Pass,
    Assert,
    Import,
    /// `import NAME from NAME`; the captures land in `Phrase::holes`.
    ImportFrom,
    Expr,
}

/// One source statement: its kind, optional expression tree, nesting level
/// (count of leading whitespace characters) and original text. Immutable
/// after scanning; block boundaries are recovered from `level`.
#[derive(Clone, Debug, PartialEq)]
pub struct Phrase {
    pub kind: PhraseKind,
    pub tree: Option<Node>,
    pub level: usize,
    pub text: String,
    pub holes: Vec<String>,
}

impl Phrase {
    pub fn tree(&self) -> Option<&Node> {
        self.tree.as_ref()
    }
}

/// Hierarchical key naming a lexical binding context. Module roots are the
/// module name; nested units/classes use the defining phrase id; synthetic
/// slots use the constructors below.
pub type ScopeId = String;

/// `module:index` of a phrase; every node of the phrase shares it.
pub fn phrase_id(module: &str, index: usize) -> String {
    format!("{module}:{index}")
}

/// Scope id of a class's instance side.
pub fn instance_scope(class_id: &str) -> String {
    format!("{class_id}[instance]")
}

pub fn is_instance_scope(scope_id: &str) -> bool {
    scope_id.ends_with("[instance]")
}

pub fn instance_class(scope_id: &str) -> &str {
    scope_id.strip_suffix("[instance]").unwrap_or(scope_id)
}

/// Registry slot for a name narrowed by a specific `cast` phrase.
pub fn cast_slot(phrase_id: &str, name: &str) -> String {
    format!("(cast)({phrase_id}){name}")
}

/// Registry slot for the iterated value of a `for` phrase: `@line`.
pub fn anon_slot(phrase_id: &str) -> String {
    let line = phrase_id.rsplit(':').next().unwrap_or(phrase_id);
    format!("@{line}")
}

/// Scope id of a comprehension body, qualified by the `for` token offset.
pub fn comprehension_scope(phrase_id: &str, offset: usize) -> String {
    format!("{phrase_id}:{offset}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_scope_round_trip() {
        let class = phrase_id("main", 4);
        let inst = instance_scope(&class);
        assert!(is_instance_scope(&inst));
        assert_eq!(instance_class(&inst), class);
        assert!(!is_instance_scope(&class));
    }

    #[test]
    fn anon_slot_uses_phrase_line() {
        assert_eq!(anon_slot("main:17"), "@17");
        assert_eq!(anon_slot("a.b:3"), "@3");
    }

    #[test]
    fn node_helpers() {
        let tok = Token::new(TokenKind::Sign, "+", 2);
        let leaf = Node::Leaf(tok.clone());
        assert!(leaf.is_sign("+"));
        assert_eq!(leaf.leaf_text(TokenKind::Sign), Some("+"));
        let g = Node::group(GroupKind::Binary, vec![leaf.clone(), leaf.clone()]);
        assert_eq!(g.group_kind(), Some(GroupKind::Binary));
        assert_eq!(g.inner().len(), 2);
    }
}
