//! Two-pass `$` reference resolution.
//!
//! Pass 1 walks the fully template-expanded tree and records, for every
//! block, its parent, its position, and its literal properties. Pass 2
//! re-walks the tree and evaluates the deferred expressions with a
//! registry-backed [`DollarResolver`]. Forward references work because
//! pass 1 completes before pass 2 begins.

use crate::diagnostics::{CompilerError, ErrorKind, Result};
use crate::expression_tree::{
    eval_to_value, to_number, value_to_eval, DollarResolver, EvalValue, ExpressionEvaluator,
    TokenCursor,
};
use crate::object_tree::{BlockRc, Document, Value};
use crate::parser::SyntaxKind;
use crate::transaction::Transaction;
use by_address::ByAddress;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::collections::HashMap;

struct RegistryEntry {
    parent: Option<BlockRc>,
    index_in_parent: usize,
    /// Only literal-valued properties; expression properties are the ones
    /// pass 2 is about to resolve and are not visible to references
    literal_properties: IndexMap<SmolStr, EvalValue>,
}

pub struct BlockRegistry {
    entries: HashMap<ByAddress<BlockRc>, RegistryEntry>,
    top_level: Vec<BlockRc>,
}

impl BlockRegistry {
    fn entry(&self, block: &BlockRc) -> Result<&RegistryEntry> {
        self.entries.get(&ByAddress(block.clone())).ok_or_else(|| {
            CompilerError::new(
                ErrorKind::BlockNotInRegistry,
                block.borrow().location.clone(),
            )
        })
    }

    /// The sibling blocks of `block` (itself included): the parent's block
    /// children, or the document's top-level blocks.
    fn siblings(&self, block: &BlockRc) -> Result<Vec<BlockRc>> {
        Ok(match &self.entry(block)?.parent {
            Some(parent) => parent.borrow().child_blocks(),
            None => self.top_level.clone(),
        })
    }
}

pub fn resolve(document: &mut Document, transaction: &Transaction) -> Result<()> {
    let registry = build_registry(document);
    for block in document.blocks() {
        resolve_block(block, &registry, transaction)?;
    }
    Ok(())
}

/// Pass 1: registry construction, in document order.
fn build_registry(document: &Document) -> BlockRegistry {
    let mut registry = BlockRegistry {
        entries: HashMap::new(),
        top_level: document.blocks().cloned().collect(),
    };
    for (index, block) in registry.top_level.clone().into_iter().enumerate() {
        record(&mut registry, &block, None, index);
    }
    registry
}

fn record(registry: &mut BlockRegistry, block: &BlockRc, parent: Option<&BlockRc>, index: usize) {
    // value_to_eval yields None for properties that still hold a deferred
    // expression anywhere inside, so those stay out of the registry
    let literal_properties = block
        .borrow()
        .properties
        .iter()
        .filter_map(|(name, value)| value_to_eval(value).map(|v| (name.clone(), v)))
        .collect();
    registry.entries.insert(
        ByAddress(block.clone()),
        RegistryEntry { parent: parent.cloned(), index_in_parent: index, literal_properties },
    );
    for (index, child) in block.borrow().child_blocks().into_iter().enumerate() {
        record(registry, &child, Some(block), index);
    }
}

/// Pass 2: resolve the deferred expressions of this block and its children.
fn resolve_block(
    block: &BlockRc,
    registry: &BlockRegistry,
    transaction: &Transaction,
) -> Result<()> {
    let names: Vec<_> = block.borrow().properties.keys().cloned().collect();
    for name in names {
        let value = block.borrow().properties.get(&name).cloned();
        let Some(value) = value else { continue };
        if let Some(resolved) = resolve_value(&value, block, registry, transaction)? {
            block.borrow_mut().properties.insert(name, resolved);
        }
    }
    for child in block.borrow().child_blocks() {
        resolve_block(&child, registry, transaction)?;
    }
    Ok(())
}

fn resolve_value(
    value: &Value,
    block: &BlockRc,
    registry: &BlockRegistry,
    transaction: &Transaction,
) -> Result<Option<Value>> {
    match value {
        Value::Literal(_) => Ok(None),
        Value::Array(elements) => {
            let mut changed = false;
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                match resolve_value(element, block, registry, transaction)? {
                    Some(v) => {
                        changed = true;
                        out.push(v);
                    }
                    None => out.push(element.clone()),
                }
            }
            Ok(changed.then(|| Value::Array(out)))
        }
        Value::Expression(e) => {
            let resolver = RegistryResolver { registry, current: block.clone() };
            let evaluator = ExpressionEvaluator::new(transaction, &resolver);
            let evaluated = evaluator.evaluate(&e.tokens, &e.location)?;
            Ok(Some(eval_to_value(evaluated)))
        }
    }
}

/// What a partially consumed reference currently denotes.
enum Target {
    Block(BlockRc),
    Blocks(Vec<BlockRc>),
    Value(EvalValue),
}

struct RegistryResolver<'a> {
    registry: &'a BlockRegistry,
    current: BlockRc,
}

impl DollarResolver for RegistryResolver<'_> {
    fn resolve(
        &self,
        cursor: &mut TokenCursor<'_>,
        evaluator: &ExpressionEvaluator<'_>,
    ) -> Result<EvalValue> {
        cursor.expect(SyntaxKind::Dollar)?;
        let location = cursor.location();
        if cursor.peek_kind() != SyntaxKind::Identifier {
            return Err(CompilerError::new(
                ErrorKind::InvalidReference("expected an identifier after '$'".into()),
                location,
            ));
        }
        let name = cursor.next().unwrap().text.clone();

        let mut target = match name.as_str() {
            "this" => Target::Block(self.current.clone()),
            "parent" => match &self.registry.entry(&self.current)?.parent {
                Some(parent) => Target::Block(parent.clone()),
                None => {
                    return Err(CompilerError::new(ErrorKind::NoParentBlock, location));
                }
            },
            n if n.chars().next().is_some_and(char::is_uppercase) => {
                let sibling = self
                    .registry
                    .siblings(&self.current)?
                    .into_iter()
                    .find(|b| b.borrow().id.as_deref() == Some(n));
                match sibling {
                    Some(b) => Target::Block(b),
                    None => {
                        return Err(CompilerError::new(
                            ErrorKind::BlockNotFound(n.to_string()),
                            location,
                        ));
                    }
                }
            }
            n => {
                return Err(CompilerError::new(
                    ErrorKind::InvalidReference(format!(
                        "'${n}' is not a valid reference; use $this, $parent or a \
                         capitalized sibling id"
                    )),
                    location,
                ));
            }
        };

        loop {
            match cursor.peek_kind() {
                SyntaxKind::Dot => {
                    let location = cursor.location();
                    cursor.next();
                    if cursor.peek_kind() != SyntaxKind::Identifier {
                        return Err(CompilerError::new(
                            ErrorKind::ExpectedPropertyName,
                            location,
                        ));
                    }
                    let field = cursor.next().unwrap().text.clone();
                    target = self.step(target, &field, location)?;
                }
                SyntaxKind::LBracket => {
                    let location = cursor.location();
                    cursor.next();
                    let index_value = evaluator.parse_expression(cursor)?;
                    cursor.expect(SyntaxKind::RBracket)?;
                    let index = to_number(&index_value, &location)? as usize;
                    target = match target {
                        Target::Blocks(blocks) => match blocks.get(index) {
                            Some(b) => Target::Block(b.clone()),
                            None => {
                                return Err(CompilerError::new(
                                    ErrorKind::InvalidIndexAccess,
                                    location,
                                ));
                            }
                        },
                        Target::Value(EvalValue::Array(elements)) => {
                            match elements.get(index) {
                                Some(v) => Target::Value(v.clone()),
                                None => {
                                    return Err(CompilerError::new(
                                        ErrorKind::InvalidIndexAccess,
                                        location,
                                    ));
                                }
                            }
                        }
                        _ => {
                            return Err(CompilerError::new(
                                ErrorKind::InvalidIndexAccess,
                                location,
                            ));
                        }
                    };
                }
                _ => break,
            }
        }

        match target {
            Target::Value(v) => Ok(v),
            Target::Block(_) | Target::Blocks(_) => Err(CompilerError::new(
                ErrorKind::IncompleteReference,
                cursor.location(),
            )),
        }
    }
}

impl RegistryResolver<'_> {
    fn step(
        &self,
        target: Target,
        field: &str,
        location: crate::diagnostics::SourceLocation,
    ) -> Result<Target> {
        match target {
            Target::Block(block) => match field {
                "parent" => match &self.registry.entry(&block)?.parent {
                    Some(parent) => Ok(Target::Block(parent.clone())),
                    None => Err(CompilerError::new(ErrorKind::NoParentBlock, location)),
                },
                "children" => Ok(Target::Blocks(block.borrow().child_blocks())),
                "index" => {
                    Ok(Target::Value(EvalValue::Number(
                        self.registry.entry(&block)?.index_in_parent as f64,
                    )))
                }
                name => {
                    let entry = self.registry.entry(&block)?;
                    match entry.literal_properties.get(name) {
                        Some(v) => Ok(Target::Value(v.clone())),
                        None => Err(CompilerError::new(
                            ErrorKind::PropertyNotFound(name.to_string()),
                            location,
                        )),
                    }
                }
            },
            Target::Value(EvalValue::Object(object)) => {
                Ok(Target::Value(object.get(field).cloned().unwrap_or(EvalValue::Null)))
            }
            Target::Blocks(blocks) if field == "length" => {
                Ok(Target::Value(EvalValue::Number(blocks.len() as f64)))
            }
            Target::Value(EvalValue::Array(elements)) if field == "length" => {
                Ok(Target::Value(EvalValue::Number(elements.len() as f64)))
            }
            Target::Value(_) | Target::Blocks(_) => Err(CompilerError::new(
                ErrorKind::InvalidReference(format!("cannot access '.{field}' here")),
                location,
            )),
        }
    }
}
