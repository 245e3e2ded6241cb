//! Precedence resolution: repeated left-to-right folding passes that wrap
//! token runs into groups, tightest binding first.

use hutch_ast::{Group, GroupKind, Node, Token, TokenKind, span};

use crate::ParseError;

pub(crate) fn group_all(
    tokens: Vec<Token>,
    assignment_list: bool,
) -> Result<Vec<Node>, ParseError> {
    let nodes: Vec<Node> = tokens.into_iter().map(Node::Leaf).collect();
    let mut nodes = group_brackets(nodes)?;
    nodes = recursive_post(&group_call_index, nodes);
    nodes = recursive_post(&group_attr, nodes);
    nodes = recursive_post(&switch_attr, nodes);
    nodes = recursive_post(&group_binary_unary, nodes);
    range_in_containers(&mut nodes);
    nodes = recursive_post(&group_pairs, nodes);
    if assignment_list {
        nodes = recursive_post(&group_assignment, nodes);
        nodes = recursive_post(&group_list, nodes);
    } else {
        nodes = recursive_post(&group_list, nodes);
        nodes = recursive_post(&group_assignment, nodes);
    }
    Ok(nodes)
}

/// Applies `pass` bottom-up: children first, then this level.
fn recursive_post(pass: &dyn Fn(Vec<Node>) -> Vec<Node>, nodes: Vec<Node>) -> Vec<Node> {
    let nodes: Vec<Node> = nodes
        .into_iter()
        .map(|n| match n {
            Node::Group(g) => Node::Group(Group {
                kind: g.kind,
                inner: recursive_post(pass, g.inner),
            }),
            leaf => leaf,
        })
        .collect();
    pass(nodes)
}

fn bracket_kind(open: &str) -> GroupKind {
    match open {
        "(" => GroupKind::Paren,
        "[" => GroupKind::Bracket,
        _ => GroupKind::Brace,
    }
}

fn closer_for(open: &str) -> &'static str {
    match open {
        "(" => ")",
        "[" => "]",
        _ => "}",
    }
}

fn group_brackets(nodes: Vec<Node>) -> Result<Vec<Node>, ParseError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < nodes.len() {
        if let Node::Leaf(t) = &nodes[i]
            && t.kind == TokenKind::Open
        {
            let open = t.text.clone();
            let close = closer_for(&open);
            let mut level = 0usize;
            let mut j = i;
            let end = loop {
                if j >= nodes.len() {
                    return Err(ParseError::Syntax {
                        message: format!("unclosed `{open}`"),
                        span: span(t.offset, 1),
                    });
                }
                if let Node::Leaf(u) = &nodes[j] {
                    if u.kind == TokenKind::Open && u.text == open {
                        level += 1;
                    } else if u.kind == TokenKind::Close && u.text == close {
                        level -= 1;
                        if level == 0 {
                            break j;
                        }
                    }
                }
                j += 1;
            };
            let inner: Vec<Node> = nodes[i + 1..end].to_vec();
            out.push(Node::group(bracket_kind(&open), group_brackets(inner)?));
            i = end;
        } else {
            out.push(nodes[i].clone());
        }
        i += 1;
    }
    Ok(out)
}

fn callable(prev: &Node) -> bool {
    matches!(prev, Node::Leaf(t) if t.kind == TokenKind::Name)
        || matches!(
            prev.group_kind(),
            Some(GroupKind::Call | GroupKind::Index | GroupKind::Paren)
        )
}

fn group_call_index(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for n in nodes {
        let target = match n.group_kind() {
            Some(GroupKind::Paren) => Some(GroupKind::Call),
            Some(GroupKind::Bracket) => Some(GroupKind::Index),
            _ => None,
        };
        match target {
            Some(kind) if out.last().is_some_and(callable) => {
                if let Some(prev) = out.pop() {
                    out.push(Node::group(kind, vec![prev, n]));
                }
            }
            _ => out.push(n),
        }
    }
    out
}

fn group_attr(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for n in nodes {
        if out.len() > 1 && out.last().is_some_and(|l| l.is_sign(".")) {
            let (dot, owner) = match (out.pop(), out.pop()) {
                (Some(d), Some(o)) => (d, o),
                _ => unreachable!(),
            };
            out.push(Node::group(GroupKind::Attr, vec![owner, dot, n]));
        } else {
            out.push(n);
        }
    }
    out
}

/// Rewrites `attr(owner, ., call(member, args))` into
/// `call(attr(owner, ., member), args)` so the call sees its receiver.
fn switch_attr(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::new();
    for n in nodes {
        match n {
            Node::Group(g)
                if g.kind == GroupKind::Attr
                    && matches!(
                        g.inner.last().and_then(Node::group_kind),
                        Some(GroupKind::Call | GroupKind::Index)
                    ) =>
            {
                let mut inner = g.inner;
                let Some(Node::Group(call)) = inner.pop() else {
                    unreachable!()
                };
                let mut parts = call.inner.into_iter();
                let (Some(member), Some(args)) = (parts.next(), parts.next()) else {
                    unreachable!()
                };
                inner.push(member);
                let attr = Node::group(GroupKind::Attr, inner);
                out.push(Node::group(call.kind, vec![attr, args]));
            }
            other => out.push(other),
        }
    }
    out
}

fn fold_binary(
    nodes: Vec<Node>,
    kind: GroupKind,
    is_op: impl Fn(&Node) -> bool,
) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for n in nodes {
        if out.len() > 1 && out.last().is_some_and(&is_op) {
            let (op, lhs) = match (out.pop(), out.pop()) {
                (Some(op), Some(lhs)) => (op, lhs),
                _ => unreachable!(),
            };
            out.push(Node::group(kind, vec![lhs, op, n]));
        } else {
            out.push(n);
        }
    }
    out
}

fn group_unary(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut iter = nodes.into_iter();
    if let Some(first) = iter.next() {
        out.push(first);
    }
    for n in iter {
        let in_sign_context = out.len() < 2
            || matches!(&out[out.len() - 2], Node::Leaf(t) if t.kind == TokenKind::Sign);
        let last_unary = out
            .last()
            .is_some_and(|l| l.is_sign("-") || l.is_sign("~") || l.is_sign("+"));
        if in_sign_context && last_unary {
            if let Some(sign) = out.pop() {
                out.push(Node::group(GroupKind::Unary, vec![sign, n]));
            }
        } else {
            out.push(n);
        }
    }
    out
}

fn group_not(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for (i, n) in nodes.into_iter().enumerate() {
        if i > 0 && out.last().is_some_and(|l| l.is_keyword("not")) {
            if let Some(word) = out.pop() {
                out.push(Node::group(GroupKind::Unary, vec![word, n]));
            }
        } else {
            out.push(n);
        }
    }
    out
}

/// Merges `is` / `is not` / `is in` / `is not in` into one operator token,
/// then folds the surrounding operands into a binary group.
fn group_is_in(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut last_is: Option<usize> = None;
    for (i, n) in nodes.into_iter().enumerate() {
        if n.is_keyword("is") {
            last_is = Some(i);
            out.push(n);
        } else if last_is == Some(i.wrapping_sub(1)) && n.is_keyword("not") {
            if let Some(Node::Leaf(t)) = out.last_mut() {
                t.text = "is not".into();
            }
            last_is = Some(i);
        } else if last_is == Some(i.wrapping_sub(1)) && n.is_keyword("in") {
            if let Some(Node::Leaf(t)) = out.last_mut() {
                t.text.push_str(" in");
            }
        } else if last_is.is_some() {
            let (op, lhs) = match (out.pop(), out.pop()) {
                (Some(op), Some(lhs)) => (op, lhs),
                _ => unreachable!(),
            };
            out.push(Node::group(GroupKind::Binary, vec![lhs, op, n]));
            last_is = None;
        } else {
            out.push(n);
        }
    }
    out
}

fn group_binary_unary(nodes: Vec<Node>) -> Vec<Node> {
    let nodes = group_unary(nodes);
    let nodes = fold_binary(nodes, GroupKind::Binary, |n| {
        ["/", "*", "%", "|", "&"].iter().any(|s| n.is_sign(s))
    });
    let nodes = fold_binary(nodes, GroupKind::Binary, |n| {
        ["+", "-", "^"].iter().any(|s| n.is_sign(s))
    });
    let nodes = group_is_in(nodes);
    let nodes = fold_binary(nodes, GroupKind::Compare, |n| {
        ["<=", ">=", "==", "!=", "<", ">"].iter().any(|s| n.is_sign(s))
    });
    let nodes = group_not(nodes);
    fold_binary(nodes, GroupKind::Binary, |n| {
        n.is_keyword("and") || n.is_keyword("or")
    })
}

/// Groups `:`-separated slice bounds. Only applied inside `[]` and `{}`
/// containers; the `:` signs stay in the group so absent bounds can be told
/// apart from present ones.
fn group_range(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut range_next = false;
    for n in nodes {
        if range_next {
            range_next = n.is_sign(":");
            if let Some(Node::Group(g)) = out.last_mut() {
                g.inner.push(n);
            }
        } else if n.is_sign(":") {
            range_next = true;
            match out.last_mut() {
                Some(last) if last.is_group(GroupKind::Range) => {
                    if let Node::Group(g) = last {
                        g.inner.push(n);
                    }
                }
                Some(last) => {
                    let prev = last.clone();
                    *last = Node::group(GroupKind::Range, vec![prev, n]);
                }
                None => out.push(Node::group(GroupKind::Range, vec![n])),
            }
        } else {
            out.push(n);
        }
    }
    out
}

fn range_in_containers(nodes: &mut Vec<Node>) {
    for n in nodes.iter_mut() {
        if let Node::Group(g) = n {
            range_in_containers(&mut g.inner);
        }
    }
    for n in nodes.iter_mut() {
        if let Node::Group(g) = n
            && matches!(g.kind, GroupKind::Bracket | GroupKind::Brace)
        {
            let inner = std::mem::take(&mut g.inner);
            g.inner = group_range(inner);
        }
    }
}

/// Two adjacent plain names form a typed-parameter pair, e.g. `ref p`.
fn group_pairs(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for n in nodes {
        let both_names = matches!(&n, Node::Leaf(t) if t.kind == TokenKind::Name)
            && matches!(out.last(), Some(Node::Leaf(t)) if t.kind == TokenKind::Name);
        if both_names {
            if let Some(prev) = out.pop() {
                out.push(Node::group(GroupKind::Pair, vec![prev, n]));
            }
        } else {
            out.push(n);
        }
    }
    out
}

fn group_list(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut open_list = false;
    for (i, n) in nodes.into_iter().enumerate() {
        if i > 0 && n.is_sign(",") {
            if !out.last().is_some_and(|l| l.is_group(GroupKind::List)) {
                if let Some(prev) = out.pop() {
                    out.push(Node::group(GroupKind::List, vec![prev]));
                }
            }
            open_list = true;
        } else if open_list {
            if let Some(Node::Group(g)) = out.last_mut() {
                g.inner.push(n);
            }
            open_list = false;
        } else {
            out.push(n);
        }
    }
    out
}

fn is_assign_op(n: &Node) -> bool {
    const SIGNS: &[&str] = &["=", "+=", "-=", "/=", "*=", "%=", "|=", "&=", "^=", "~="];
    SIGNS.iter().any(|s| n.is_sign(s)) || n.is_keyword("in")
}

fn group_assignment(nodes: Vec<Node>) -> Vec<Node> {
    fold_binary(nodes, GroupKind::Assignment, is_assign_op)
}
