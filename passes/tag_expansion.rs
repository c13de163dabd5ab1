//! Tag definition extraction, instance validation and expansion, and module
//! property injection.
//!
//! Runs on the raw tree after imports are merged. When the pass finishes, no
//! block carries tags any more and every `#tag` use has been replaced by the
//! definition's structure, deep-cloned so no two expansions share an object.

use crate::diagnostics::{CompilerError, ErrorKind, Result};
use crate::expression_tree::eval_to_value;
use crate::object_tree::{
    clone_block, recurse_block, Block, BlockRc, Document, Node, Tag, TagKind, Value,
};
use crate::tagregister::{ModuleContext, TagRegister};
use itertools::Itertools;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::rc::Rc;

pub fn process(document: &mut Document, register: &Rc<RefCell<TagRegister>>) -> Result<()> {
    extract_definitions(&mut document.nodes, register)?;
    validate_instances(&document.nodes, &register.borrow())?;
    let mut visited = Vec::new();
    expand_nodes(&document.nodes, register, &mut visited)?;
    Ok(())
}

/// Walk the tree and pull every `@tag` block into the registry. The block
/// stays in the output only when its rules say `can_output`.
pub fn extract_definitions(
    nodes: &mut Vec<Node>,
    register: &Rc<RefCell<TagRegister>>,
) -> Result<()> {
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        match node {
            Node::Block(block) => {
                let definition_tag = {
                    let b = block.borrow();
                    let defs: Vec<_> =
                        b.tags.iter().filter(|t| t.is_definition()).cloned().collect();
                    if defs.len() > 1 {
                        return Err(CompilerError::new(
                            ErrorKind::MultipleTagDefinitions,
                            b.location.clone(),
                        ));
                    }
                    if defs.len() == 1 && b.tags.len() > 1 {
                        return Err(CompilerError::new(
                            ErrorKind::MixedTagTypes,
                            b.location.clone(),
                        ));
                    }
                    defs.into_iter().next()
                };

                if let Some(tag) = definition_tag {
                    let rules = register.borrow().rules_for(&tag.name);
                    validate_definition(&block, &tag, rules.can_reuse)?;

                    let registered = clone_block(&block);
                    registered.borrow_mut().tags.clear();
                    register.borrow_mut().register_instance(tag.key(), registered)?;

                    if rules.can_output {
                        block.borrow_mut().tags.clear();
                        kept.push(Node::Block(block));
                    }
                    continue;
                }

                // Definitions may also sit deeper in the tree
                extract_definitions(&mut block.borrow_mut().children, register)?;
                kept.push(Node::Block(block));
            }
            mut other @ (Node::If(_) | Node::Foreach(_) | Node::While(_) | Node::OnData(_)) => {
                for body in template_bodies_mut(&mut other) {
                    extract_definitions(body, register)?;
                }
                kept.push(other);
            }
            other => kept.push(other),
        }
    }
    *nodes = kept;
    Ok(())
}

fn template_bodies_mut(node: &mut Node) -> Vec<&mut Vec<Node>> {
    match node {
        Node::If(n) => {
            let mut out = vec![&mut n.then_body];
            for (_, body) in n.elseifs.iter_mut() {
                out.push(body);
            }
            out.push(&mut n.else_body);
            out
        }
        Node::Foreach(n) => vec![&mut n.body],
        Node::While(n) => vec![&mut n.body],
        Node::OnData(n) => vec![&mut n.on_success, &mut n.on_error],
        _ => vec![],
    }
}

fn template_bodies(node: &Node) -> Vec<&Vec<Node>> {
    match node {
        Node::If(n) => {
            let mut out = vec![&n.then_body];
            for (_, body) in n.elseifs.iter() {
                out.push(body);
            }
            out.push(&n.else_body);
            out
        }
        Node::Foreach(n) => vec![&n.body],
        Node::While(n) => vec![&n.body],
        Node::OnData(n) => vec![&n.on_success, &n.on_error],
        _ => vec![],
    }
}

fn validate_definition(block: &BlockRc, tag: &Tag, can_reuse: bool) -> Result<()> {
    if !can_reuse {
        return Err(CompilerError::new(
            ErrorKind::InvalidTagDefinition {
                key: tag.key().to_string(),
                reason: "this tag does not allow reuse".into(),
            },
            tag.location.clone(),
        ));
    }
    let mut expression_error = None;
    recurse_block(block, &mut |b| {
        if expression_error.is_none()
            && b.borrow().properties.values().any(|v| matches!(v, Value::Expression(_)))
        {
            expression_error = Some(CompilerError::new(
                ErrorKind::TagDefinitionWithExpression(tag.key().to_string()),
                b.borrow().location.clone(),
            ));
        }
    });
    match expression_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Verify every `#tag` use against the registry and the composition rules.
pub fn validate_instances(nodes: &[Node], register: &TagRegister) -> Result<()> {
    for node in nodes {
        match node {
            Node::Block(block) => {
                {
                    let b = block.borrow();
                    let instances: Vec<_> =
                        b.tags.iter().filter(|t| t.is_instance()).cloned().collect();
                    if !instances.is_empty() && instances.len() != b.tags.len() {
                        return Err(CompilerError::new(
                            ErrorKind::MixedTagTypes,
                            b.location.clone(),
                        ));
                    }
                    for tag in &instances {
                        let key = tag.key();
                        if !register.has_key(&key) && register.get_tag(&tag.name).is_none() {
                            return Err(CompilerError::new(
                                ErrorKind::UndefinedTag(key.to_string()),
                                tag.location.clone(),
                            ));
                        }
                    }
                    match instances.len() {
                        0 | 1 => {
                            if let Some(tag) = instances.first() {
                                if !b.children.is_empty()
                                    && !register.rules_for(&tag.name).accept_children
                                {
                                    return Err(CompilerError::new(
                                        ErrorKind::TagInstanceWithChildren(tag.key().to_string()),
                                        b.location.clone(),
                                    ));
                                }
                            }
                        }
                        _ => {
                            if !b.properties.is_empty() {
                                return Err(CompilerError::new(
                                    ErrorKind::TagCompositionWithProperties,
                                    b.location.clone(),
                                ));
                            }
                            if !b.children.is_empty() {
                                return Err(CompilerError::new(
                                    ErrorKind::TagCompositionWithChildren,
                                    b.location.clone(),
                                ));
                            }
                        }
                    }
                }
                let children = block.borrow().children.clone();
                validate_instances(&children, register)?;
            }
            Node::FreeText(t) => {
                for tag in &t.tags {
                    let key = tag.key();
                    if !register.has_key(&key) && register.get_tag(&tag.name).is_none() {
                        return Err(CompilerError::new(
                            ErrorKind::UndefinedTag(key.to_string()),
                            tag.location.clone(),
                        ));
                    }
                }
            }
            other => {
                for body in template_bodies(other) {
                    validate_instances(body, register)?;
                }
            }
        }
    }
    Ok(())
}

fn expand_nodes(
    nodes: &[Node],
    register: &Rc<RefCell<TagRegister>>,
    visited: &mut Vec<SmolStr>,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Block(block) => expand_block(block, register, visited)?,
            other => {
                for body in template_bodies(other) {
                    expand_nodes(body, register, visited)?;
                }
            }
        }
    }
    Ok(())
}

/// Clone the registered definition for `key`, with its own nested instances
/// expanded. `visited` carries the expansion chain for cycle detection.
fn expanded_definition(
    tag: &Tag,
    register: &Rc<RefCell<TagRegister>>,
    visited: &mut Vec<SmolStr>,
) -> Result<BlockRc> {
    let key = tag.key();
    if visited.contains(&key) {
        let chain = visited
            .iter()
            .map(SmolStr::as_str)
            .chain(std::iter::once(key.as_str()))
            .join(" → ");
        return Err(CompilerError::new(
            ErrorKind::CircularTagDependency(chain),
            tag.location.clone(),
        ));
    }

    let definition = register.borrow().get_instance(&key);
    let clone = match definition {
        Some(def) => clone_block(&def),
        None if register.borrow().get_tag(&tag.name).is_some() => {
            // Host-configured tag without an @block: structure comes from
            // module injection alone
            Rc::new(RefCell::new(Block::new(None, tag.location.clone())))
        }
        None => {
            return Err(CompilerError::new(
                ErrorKind::TagDefinitionNotFound(key.to_string()),
                tag.location.clone(),
            ));
        }
    };

    visited.push(key);
    let children = clone.borrow().children.clone();
    expand_nodes(&children, register, visited)?;
    visited.pop();
    Ok(clone)
}

fn expand_block(
    block: &BlockRc,
    register: &Rc<RefCell<TagRegister>>,
    visited: &mut Vec<SmolStr>,
) -> Result<()> {
    let tags: Vec<Tag> = block.borrow().tags.clone();
    let instances: Vec<_> = tags.iter().filter(|t| t.kind == TagKind::Instance).cloned().collect();

    match instances.len() {
        0 => {}
        1 => {
            let tag = &instances[0];
            let definition = expanded_definition(tag, register, visited)?;
            merge_definition(block, &definition);
            inject_module_properties(block, tag, register)?;
            if let Some(output_fn) = register.borrow().rules_for(&tag.name).output_fn {
                output_fn(block);
            }
        }
        _ => {
            // Composition: one generated child per tag
            let parent_id = block.borrow().id.clone();
            for tag in &instances {
                let generated = expanded_definition(tag, register, visited)?;
                let suffix = tag.argument.as_deref().unwrap_or(tag.name.as_str());
                generated.borrow_mut().id = Some(
                    format!("{}_{suffix}", parent_id.as_deref().unwrap_or_default()).into(),
                );
                inject_module_properties(&generated, tag, register)?;
                if let Some(output_fn) = register.borrow().rules_for(&tag.name).output_fn {
                    output_fn(&generated);
                }
                block.borrow_mut().children.push(Node::Block(generated));
            }
        }
    }

    block.borrow_mut().tags.clear();

    let children = block.borrow().children.clone();
    expand_nodes(&children, register, visited)
}

/// Merge a definition clone into the instance block: the instance's
/// properties win, the definition's children are inherited only when the
/// instance has none of its own.
fn merge_definition(block: &BlockRc, definition: &BlockRc) {
    let def = definition.borrow();
    let mut b = block.borrow_mut();

    let mut merged = crate::object_tree::PropertyMap::default();
    for (name, value) in &def.properties {
        merged.insert(
            name.clone(),
            b.properties.get(name).cloned().unwrap_or_else(|| value.clone()),
        );
    }
    for (name, value) in &b.properties {
        if !merged.contains_key(name) {
            merged.insert(name.clone(), value.clone());
        }
    }
    b.properties = merged;

    if b.children.is_empty() {
        b.children = def.children.clone();
    }
}

/// Look up each module getter of the tag's host config, invoke it, and
/// assign the wrapped result into the block. An existing property with the
/// same name is a conflict.
fn inject_module_properties(
    block: &BlockRc,
    tag: &Tag,
    register: &Rc<RefCell<TagRegister>>,
) -> Result<()> {
    let Some(config) = register.borrow().get_tag(&tag.name) else {
        return Ok(());
    };
    for (name, getter) in &config.module {
        let value = {
            let b = block.borrow();
            if b.properties.contains_key(name) {
                return Err(CompilerError::new(
                    ErrorKind::ModulePropertyConflict {
                        tag: tag.key().to_string(),
                        property: name.to_string(),
                    },
                    b.location.clone(),
                ));
            }
            let context = ModuleContext {
                block_id: b.id.as_deref(),
                tag_name: &tag.name,
                tag_argument: tag.argument.as_deref(),
                existing_properties: &b.properties,
            };
            getter.call(&context)
        };
        block.borrow_mut().properties.insert(name.clone(), eval_to_value(value));
    }
    Ok(())
}
