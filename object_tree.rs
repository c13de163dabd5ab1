/*!
 This module contains the object tree: the raw syntax tree produced by the
 parser, which the preprocessing passes rewrite in place until only literal
 data remains.
*/

use crate::diagnostics::{SourceFile, SourceLocation, Span, Spanned};
use crate::parser::Token;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::rc::Rc;

/// A literal scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(SmolStr),
    Number(f64),
    Bool(bool),
    Null,
}

/// A property expression held as its raw token sequence, evaluated during
/// preprocessing.
#[derive(Debug, Clone)]
pub struct ExpressionValue {
    pub tokens: Vec<Token>,
    pub location: SourceLocation,
}

/// Equality ignores location metadata.
impl PartialEq for ExpressionValue {
    fn eq(&self, other: &Self) -> bool {
        self.tokens == other.tokens
    }
}

impl ExpressionValue {
    /// True if the expression contains a `$`-prefixed reference and must be
    /// deferred to the reference-resolution pass.
    pub fn has_dollar_reference(&self) -> bool {
        self.tokens.iter().any(|t| t.kind == crate::parser::SyntaxKind::Dollar)
    }
}

/// A property value. After preprocessing only `Literal` and `Array` remain.
#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum Value {
    Literal(Literal),
    Array(Vec<Value>),
    Expression(ExpressionValue),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagKind {
    /// `@name`
    Definition,
    /// `#name`
    Instance,
}

/// A tag marker applied to a block, written `@name(arg)` or `#name(arg)`.
#[derive(Debug, Clone)]
pub struct Tag {
    pub kind: TagKind,
    pub name: SmolStr,
    pub argument: Option<SmolStr>,
    pub location: SourceLocation,
}

impl Tag {
    pub fn is_definition(&self) -> bool {
        self.kind == TagKind::Definition
    }

    pub fn is_instance(&self) -> bool {
        self.kind == TagKind::Instance
    }

    /// The registry key: `name` or `name(argument)`. An argument
    /// distinguishes overloads.
    pub fn key(&self) -> SmolStr {
        create_key(&self.name, self.argument.as_deref())
    }
}

pub fn create_key(name: &str, argument: Option<&str>) -> SmolStr {
    match argument {
        Some(arg) => SmolStr::from(format!("{name}({arg})")),
        None => SmolStr::from(name),
    }
}

pub type PropertyMap = IndexMap<SmolStr, Value>;

/// The principal structural element `[Id (props) children...]`.
///
/// Blocks whose id begins with an uppercase letter are *named* and can be
/// addressed by `$Id` from their siblings; anonymous blocks carry no id.
pub struct Block {
    pub id: Option<SmolStr>,
    pub properties: PropertyMap,
    pub children: Vec<Node>,
    pub tags: Vec<Tag>,
    pub location: SourceLocation,
}

pub type BlockRc = Rc<RefCell<Block>>;

impl Block {
    pub fn new(id: Option<SmolStr>, location: SourceLocation) -> Self {
        Self { id, properties: Default::default(), children: vec![], tags: vec![], location }
    }

    pub fn is_named(&self) -> bool {
        self.id.as_ref().is_some_and(|id| id.chars().next().is_some_and(|c| c.is_uppercase()))
    }

    /// The block children that are themselves blocks (templates and free
    /// text filtered out).
    pub fn child_blocks(&self) -> Vec<BlockRc> {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Block(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Spanned for Block {
    fn span(&self) -> Span {
        self.location.span.clone()
    }

    fn source_file(&self) -> Option<&SourceFile> {
        self.location.source_file.as_ref()
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        pretty_print_block(f, self, 0)
    }
}

/// `<set name = value>`
#[derive(Debug, Clone)]
pub struct SetNode {
    pub name: SmolStr,
    pub value: Value,
    pub location: SourceLocation,
}

/// `<if cond> ... <elseif cond> ... <else> ... </if>`
#[derive(Debug, Clone)]
pub struct IfNode {
    pub condition: Vec<Token>,
    pub then_body: Vec<Node>,
    pub elseifs: Vec<(Vec<Token>, Vec<Node>)>,
    pub else_body: Vec<Node>,
    pub location: SourceLocation,
}

/// `<foreach item[, index] in collection> ... </foreach>`
#[derive(Debug, Clone)]
pub struct ForeachNode {
    pub item: SmolStr,
    pub index: Option<SmolStr>,
    pub collection: SmolStr,
    pub body: Vec<Node>,
    pub location: SourceLocation,
}

/// `<while cond> ... </while>`
#[derive(Debug, Clone)]
pub struct WhileNode {
    pub condition: Vec<Token>,
    pub body: Vec<Node>,
    pub location: SourceLocation,
}

/// `<on-data source> ... <on-error> ... </on-data>`
#[derive(Debug, Clone)]
pub struct OnDataNode {
    pub source: SmolStr,
    pub on_success: Vec<Node>,
    pub on_error: Vec<Node>,
    pub location: SourceLocation,
}

/// `<import "path" [as alias]>` — top level only
#[derive(Debug, Clone)]
pub struct ImportNode {
    pub path: String,
    pub alias: Option<SmolStr>,
    pub location: SourceLocation,
}

/// `<inject "path">` — top level or block child
#[derive(Debug, Clone)]
pub struct InjectNode {
    pub path: String,
    pub location: SourceLocation,
}

/// A ≥3-backtick free-text run, kept verbatim.
#[derive(Debug, Clone)]
pub struct FreeTextNode {
    pub content: String,
    pub tags: Vec<Tag>,
    pub location: SourceLocation,
}

/// Any node of the tree.
#[derive(Debug, Clone, derive_more::From)]
pub enum Node {
    Block(BlockRc),
    Set(SetNode),
    If(IfNode),
    Foreach(ForeachNode),
    While(WhileNode),
    OnData(OnDataNode),
    Import(ImportNode),
    Inject(InjectNode),
    FreeText(FreeTextNode),
}

impl Node {
    pub fn location(&self) -> SourceLocation {
        match self {
            Node::Block(b) => b.borrow().location.clone(),
            Node::Set(n) => n.location.clone(),
            Node::If(n) => n.location.clone(),
            Node::Foreach(n) => n.location.clone(),
            Node::While(n) => n.location.clone(),
            Node::OnData(n) => n.location.clone(),
            Node::Import(n) => n.location.clone(),
            Node::Inject(n) => n.location.clone(),
            Node::FreeText(n) => n.location.clone(),
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(
            self,
            Node::Set(_) | Node::If(_) | Node::Foreach(_) | Node::While(_) | Node::OnData(_)
        )
    }

    pub fn as_block(&self) -> Option<&BlockRc> {
        match self {
            Node::Block(b) => Some(b),
            _ => None,
        }
    }
}

/// The full document (a complete file).
///
/// `nodes` holds the top level in source order; the accessors below view it
/// as the separate template/block/import/inject collections.
#[derive(Default, Debug)]
pub struct Document {
    pub nodes: Vec<Node>,
}

impl Document {
    /// Top-level literal blocks
    pub fn blocks(&self) -> impl Iterator<Item = &BlockRc> {
        self.nodes.iter().filter_map(Node::as_block)
    }

    /// Top-level template nodes (including `<on-data>`)
    pub fn templates(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_template())
    }

    pub fn imports(&self) -> impl Iterator<Item = &ImportNode> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Import(i) => Some(i),
            _ => None,
        })
    }

    pub fn injects(&self) -> impl Iterator<Item = &InjectNode> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Inject(i) => Some(i),
            _ => None,
        })
    }
}

/// Apply `f` to this block and recursively to every block below it,
/// including blocks nested inside template bodies.
pub fn recurse_block(block: &BlockRc, f: &mut impl FnMut(&BlockRc)) {
    f(block);
    let children = block.borrow().children.clone();
    for child in &children {
        recurse_nodes(std::slice::from_ref(child), f);
    }
}

/// Apply `f` to every block reachable from `nodes`, in document order.
pub fn recurse_nodes(nodes: &[Node], f: &mut impl FnMut(&BlockRc)) {
    for node in nodes {
        match node {
            Node::Block(b) => recurse_block(b, f),
            Node::If(n) => {
                recurse_nodes(&n.then_body, f);
                for (_, body) in &n.elseifs {
                    recurse_nodes(body, f);
                }
                recurse_nodes(&n.else_body, f);
            }
            Node::Foreach(n) => recurse_nodes(&n.body, f),
            Node::While(n) => recurse_nodes(&n.body, f),
            Node::OnData(n) => {
                recurse_nodes(&n.on_success, f);
                recurse_nodes(&n.on_error, f);
            }
            Node::Set(_) | Node::Import(_) | Node::Inject(_) | Node::FreeText(_) => {}
        }
    }
}

/// Structurally independent copy of a value. The cloner recurses into nested
/// arrays and expression token lists; no recursion aliases any input object.
pub fn clone_value(value: &Value) -> Value {
    match value {
        Value::Literal(l) => Value::Literal(l.clone()),
        Value::Array(elements) => Value::Array(elements.iter().map(clone_value).collect()),
        Value::Expression(e) => Value::Expression(ExpressionValue {
            tokens: e.tokens.to_vec(),
            location: e.location.clone(),
        }),
    }
}

/// Deep-clone a block into a fresh `Rc`; nothing is shared with the source.
pub fn clone_block(block: &BlockRc) -> BlockRc {
    let b = block.borrow();
    Rc::new(RefCell::new(Block {
        id: b.id.clone(),
        properties: b.properties.iter().map(|(k, v)| (k.clone(), clone_value(v))).collect(),
        children: b.children.iter().map(clone_node).collect(),
        tags: b.tags.clone(),
        location: b.location.clone(),
    }))
}

pub fn clone_node(node: &Node) -> Node {
    match node {
        Node::Block(b) => Node::Block(clone_block(b)),
        Node::Set(n) => {
            Node::Set(SetNode { value: clone_value(&n.value), ..n.clone() })
        }
        Node::If(n) => Node::If(IfNode {
            condition: n.condition.clone(),
            then_body: clone_nodes(&n.then_body),
            elseifs: n
                .elseifs
                .iter()
                .map(|(cond, body)| (cond.clone(), clone_nodes(body)))
                .collect(),
            else_body: clone_nodes(&n.else_body),
            location: n.location.clone(),
        }),
        Node::Foreach(n) => Node::Foreach(ForeachNode { body: clone_nodes(&n.body), ..n.clone() }),
        Node::While(n) => Node::While(WhileNode { body: clone_nodes(&n.body), ..n.clone() }),
        Node::OnData(n) => Node::OnData(OnDataNode {
            on_success: clone_nodes(&n.on_success),
            on_error: clone_nodes(&n.on_error),
            ..n.clone()
        }),
        Node::Import(n) => Node::Import(n.clone()),
        Node::Inject(n) => Node::Inject(n.clone()),
        Node::FreeText(n) => Node::FreeText(n.clone()),
    }
}

pub fn clone_nodes(nodes: &[Node]) -> Vec<Node> {
    nodes.iter().map(clone_node).collect()
}

fn write_escaped(f: &mut impl std::fmt::Write, s: &str) -> std::fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

pub fn pretty_print_value(f: &mut impl std::fmt::Write, value: &Value) -> std::fmt::Result {
    match value {
        Value::Literal(Literal::String(s)) => write_escaped(f, s),
        Value::Literal(Literal::Number(n)) => {
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                write!(f, "{}", *n as i64)
            } else {
                write!(f, "{n}")
            }
        }
        Value::Literal(Literal::Bool(b)) => write!(f, "{b}"),
        Value::Literal(Literal::Null) => write!(f, "null"),
        Value::Array(elements) => {
            f.write_char('{')?;
            for (i, e) in elements.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                pretty_print_value(f, e)?;
            }
            f.write_char('}')
        }
        Value::Expression(e) => {
            f.write_char('(')?;
            for (i, t) in e.tokens.iter().enumerate() {
                if i > 0 {
                    f.write_char(' ')?;
                }
                f.write_str(t.as_str())?;
            }
            f.write_char(')')
        }
    }
}

pub fn pretty_print_block(
    f: &mut impl std::fmt::Write,
    block: &Block,
    indentation: usize,
) -> std::fmt::Result {
    let indent = |f: &mut dyn std::fmt::Write, n: usize| -> std::fmt::Result {
        for _ in 0..n {
            f.write_str("    ")?;
        }
        Ok(())
    };
    indent(f, indentation)?;
    for tag in &block.tags {
        match tag.kind {
            TagKind::Definition => f.write_char('@')?,
            TagKind::Instance => f.write_char('#')?,
        }
        f.write_str(&tag.name)?;
        if let Some(arg) = &tag.argument {
            write!(f, "({arg})")?;
        }
        f.write_char(' ')?;
    }
    f.write_char('[')?;
    if let Some(id) = &block.id {
        f.write_str(id)?;
    }
    if !block.properties.is_empty() {
        f.write_str(" (")?;
        for (i, (name, value)) in block.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: ")?;
            pretty_print_value(f, value)?;
        }
        f.write_char(')')?;
    }
    if !block.children.is_empty() {
        f.write_char('\n')?;
        for child in &block.children {
            match child {
                Node::Block(b) => pretty_print_block(f, &b.borrow(), indentation + 1)?,
                Node::FreeText(t) => {
                    indent(f, indentation + 1)?;
                    write!(f, "```{}```", t.content)?;
                }
                other => {
                    indent(f, indentation + 1)?;
                    write!(f, "<{other:?}>")?;
                }
            }
            f.write_char('\n')?;
        }
        indent(f, indentation)?;
    }
    f.write_char(']')
}

/// Serialize a fully preprocessed document back to OX source. For
/// pure-literal documents the output re-parses to the same tree modulo
/// location metadata.
pub fn pretty_print_document(doc: &Document) -> String {
    let mut out = String::new();
    for node in &doc.nodes {
        match node {
            Node::Block(b) => {
                pretty_print_block(&mut out, &b.borrow(), 0).unwrap();
                out.push('\n');
            }
            Node::FreeText(t) => {
                out.push_str("```");
                out.push_str(&t.content);
                out.push_str("```\n");
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(id: &str, props: &[(&str, Value)]) -> BlockRc {
        let mut b = Block::new(Some(id.into()), SourceLocation::default());
        for (k, v) in props {
            b.properties.insert(SmolStr::from(*k), v.clone());
        }
        Rc::new(RefCell::new(b))
    }

    #[test]
    fn clone_is_structurally_independent() {
        let inner = block_with("Inner", &[("v", Value::Literal(Literal::Number(1.0)))]);
        let outer = block_with(
            "Outer",
            &[(
                "xs",
                Value::Array(vec![
                    Value::Literal(Literal::Number(1.0)),
                    Value::Array(vec![Value::Literal(Literal::String("a".into()))]),
                ]),
            )],
        );
        outer.borrow_mut().children.push(Node::Block(inner.clone()));

        let copy = clone_block(&outer);
        let copied_inner = copy.borrow().child_blocks()[0].clone();
        assert!(!Rc::ptr_eq(&copied_inner, &inner));

        copied_inner
            .borrow_mut()
            .properties
            .insert("v".into(), Value::Literal(Literal::Number(99.0)));
        assert_eq!(
            inner.borrow().properties.get("v"),
            Some(&Value::Literal(Literal::Number(1.0)))
        );
    }

    #[test]
    fn named_blocks_start_uppercase() {
        assert!(block_with("Sidebar", &[]).borrow().is_named());
        assert!(!block_with("sidebar", &[]).borrow().is_named());
        assert!(!Block::new(None, SourceLocation::default()).is_named());
    }

    #[test]
    fn pretty_print_round_trips_literals() {
        let source = r#"[Layout (width: 200, title: "a\"b") [Item (v: {1, 2, true, null})]]"#;
        let doc = crate::parser::parse(source.into(), None).unwrap();
        let printed = pretty_print_document(&doc);
        let reparsed = crate::parser::parse(printed.clone(), None).unwrap();
        assert_eq!(pretty_print_document(&reparsed), printed);
    }
}
