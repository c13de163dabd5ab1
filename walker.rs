/*!
 Generic traversal over the object tree, usable from `on_parse` macros and by
 embedders: three orderings, an optional filter, per-node control flow, and a
 few convenience finders.
*/

use crate::object_tree::{BlockRc, Node};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TraversalOrder {
    #[default]
    Pre,
    Post,
    Breadth,
}

/// Return value of a visit callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkControl {
    Continue,
    /// Do not descend into this node's children
    Skip,
    /// Abort the whole traversal
    Stop,
}

pub struct WalkOptions<'a> {
    pub order: TraversalOrder,
    pub filter: Option<&'a dyn Fn(&Node, Option<&BlockRc>) -> bool>,
}

impl Default for WalkOptions<'_> {
    fn default() -> Self {
        Self { order: TraversalOrder::Pre, filter: None }
    }
}

fn children_of(node: &Node) -> Vec<(Node, Option<BlockRc>)> {
    match node {
        Node::Block(b) => {
            b.borrow().children.iter().map(|c| (c.clone(), Some(b.clone()))).collect()
        }
        Node::If(n) => {
            let mut out: Vec<(Node, Option<BlockRc>)> =
                n.then_body.iter().map(|c| (c.clone(), None)).collect();
            for (_, body) in &n.elseifs {
                out.extend(body.iter().map(|c| (c.clone(), None)));
            }
            out.extend(n.else_body.iter().map(|c| (c.clone(), None)));
            out
        }
        Node::Foreach(n) => n.body.iter().map(|c| (c.clone(), None)).collect(),
        Node::While(n) => n.body.iter().map(|c| (c.clone(), None)).collect(),
        Node::OnData(n) => n
            .on_success
            .iter()
            .chain(n.on_error.iter())
            .map(|c| (c.clone(), None))
            .collect(),
        _ => vec![],
    }
}

/// Walk `nodes` in the requested order, maintaining the parent chain of
/// enclosing blocks. The filter suppresses the visit but not the descent.
pub fn walk(
    nodes: &[Node],
    options: &WalkOptions<'_>,
    visit: &mut dyn FnMut(&Node, Option<&BlockRc>) -> WalkControl,
) {
    match options.order {
        TraversalOrder::Pre | TraversalOrder::Post => {
            for node in nodes {
                if walk_depth(node, None, options, visit) == WalkControl::Stop {
                    return;
                }
            }
        }
        TraversalOrder::Breadth => {
            let mut queue: VecDeque<(Node, Option<BlockRc>)> =
                nodes.iter().map(|n| (n.clone(), None)).collect();
            while let Some((node, parent)) = queue.pop_front() {
                let visible =
                    options.filter.map_or(true, |f| f(&node, parent.as_ref()));
                let control = if visible {
                    visit(&node, parent.as_ref())
                } else {
                    WalkControl::Continue
                };
                match control {
                    WalkControl::Stop => return,
                    WalkControl::Skip => continue,
                    WalkControl::Continue => {
                        for (child, child_parent) in children_of(&node) {
                            queue.push_back((child, child_parent.or_else(|| parent.clone())));
                        }
                    }
                }
            }
        }
    }
}

fn walk_depth(
    node: &Node,
    parent: Option<&BlockRc>,
    options: &WalkOptions<'_>,
    visit: &mut dyn FnMut(&Node, Option<&BlockRc>) -> WalkControl,
) -> WalkControl {
    let visible = options.filter.map_or(true, |f| f(node, parent));
    let mut descend = true;

    if options.order == TraversalOrder::Pre && visible {
        match visit(node, parent) {
            WalkControl::Stop => return WalkControl::Stop,
            WalkControl::Skip => descend = false,
            WalkControl::Continue => {}
        }
    }

    if descend {
        for (child, child_parent) in children_of(node) {
            let child_parent = child_parent.or_else(|| parent.cloned());
            if walk_depth(&child, child_parent.as_ref(), options, visit) == WalkControl::Stop {
                return WalkControl::Stop;
            }
        }
    }

    if options.order == TraversalOrder::Post && visible {
        match visit(node, parent) {
            WalkControl::Stop => return WalkControl::Stop,
            _ => {}
        }
    }

    WalkControl::Continue
}

/// First node satisfying the predicate, in pre-order.
pub fn find_node(
    nodes: &[Node],
    predicate: impl Fn(&Node, Option<&BlockRc>) -> bool,
) -> Option<Node> {
    let mut found = None;
    walk(nodes, &WalkOptions::default(), &mut |node, parent| {
        if predicate(node, parent) {
            found = Some(node.clone());
            WalkControl::Stop
        } else {
            WalkControl::Continue
        }
    });
    found
}

pub fn find_all(
    nodes: &[Node],
    predicate: impl Fn(&Node, Option<&BlockRc>) -> bool,
) -> Vec<Node> {
    let mut found = vec![];
    walk(nodes, &WalkOptions::default(), &mut |node, parent| {
        if predicate(node, parent) {
            found.push(node.clone());
        }
        WalkControl::Continue
    });
    found
}

/// All blocks and free-text nodes carrying a tag with this name.
pub fn find_by_tag(nodes: &[Node], tag_name: &str) -> Vec<Node> {
    find_all(nodes, |node, _| match node {
        Node::Block(b) => b.borrow().tags.iter().any(|t| t.name == tag_name),
        Node::FreeText(t) => t.tags.iter().any(|t| t.name == tag_name),
        _ => false,
    })
}

/// All blocks that declare a property with this name.
pub fn find_by_property(nodes: &[Node], property: &str) -> Vec<BlockRc> {
    find_all(nodes, |node, _| {
        matches!(node, Node::Block(b) if b.borrow().properties.contains_key(property))
    })
    .into_iter()
    .filter_map(|n| n.as_block().cloned())
    .collect()
}

/// The chain of enclosing blocks of `target`, outermost first.
pub fn ancestors(nodes: &[Node], target: &BlockRc) -> Vec<BlockRc> {
    fn search(
        node: &Node,
        target: &BlockRc,
        chain: &mut Vec<BlockRc>,
    ) -> bool {
        if let Node::Block(b) = node {
            if Rc::ptr_eq(b, target) {
                return true;
            }
            chain.push(b.clone());
        }
        for (child, _) in children_of(node) {
            if search(&child, target, chain) {
                return true;
            }
        }
        if matches!(node, Node::Block(_)) {
            chain.pop();
        }
        false
    }

    let mut chain = vec![];
    for node in nodes {
        if search(node, target, &mut chain) {
            return chain;
        }
        chain.clear();
    }
    vec![]
}
