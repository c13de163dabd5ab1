//! Template expansion: `<set>`, `<if>`, `<foreach>`, `<while>` and
//! `<on-data>` are rewritten into literal blocks, per-block property
//! expressions are evaluated, and the `on_walk` macro hook fires for every
//! block.
//!
//! When `on_walk` is entered the block's own properties are literals
//! (except deferred `$`-reference expressions) and the parent's properties
//! are likewise already evaluated; the children's are not.

use crate::diagnostics::{CompilerError, ErrorKind, Result};
use crate::expression_tree::{
    literal_to_eval, eval_to_value, DollarResolver, EvalValue, ExpressionEvaluator, TokenCursor,
};
use crate::macros::{into_macro_error, MacroSystem, WalkCursor, WalkHost};
use crate::object_tree::{
    clone_nodes, BlockRc, Document, ForeachNode, IfNode, Node, OnDataNode, SetNode, Value,
    WhileNode,
};
use crate::parser::{SyntaxKind, Token};
use crate::transaction::Transaction;
use by_address::ByAddress;
use std::cell::RefCell;
use std::collections::HashSet;

/// Resolves `$error` against the transaction during expansion; every other
/// `$` reference belongs to the reference-resolution pass.
struct ExpanderDollar<'a> {
    transaction: &'a Transaction,
}

impl DollarResolver for ExpanderDollar<'_> {
    fn resolve(
        &self,
        cursor: &mut TokenCursor<'_>,
        _: &ExpressionEvaluator<'_>,
    ) -> Result<EvalValue> {
        let location = cursor.location();
        cursor.expect(SyntaxKind::Dollar)?;
        if cursor.peek().is_some_and(|t| t.kind == SyntaxKind::Identifier && t.as_str() == "error")
        {
            cursor.next();
            return self
                .transaction
                .variable("$error")
                .ok_or_else(|| CompilerError::new(ErrorKind::UnresolvedReference, location));
        }
        Err(CompilerError::new(ErrorKind::UnresolvedReference, location))
    }
}

/// True if the token run contains a `$` reference other than `$error`, which
/// means evaluation must wait for the block registry.
fn needs_deferral(tokens: &[Token]) -> bool {
    tokens.iter().enumerate().any(|(i, t)| {
        t.kind == SyntaxKind::Dollar
            && !tokens
                .get(i + 1)
                .is_some_and(|n| n.kind == SyntaxKind::Identifier && n.as_str() == "error")
    })
}

pub struct TemplateExpander<'a> {
    transaction: &'a Transaction,
    macros: &'a MacroSystem,
    max_while_iterations: usize,
    manually_processed: RefCell<HashSet<ByAddress<BlockRc>>>,
}

pub fn run(
    document: &mut Document,
    transaction: &Transaction,
    macros: &MacroSystem,
    max_while_iterations: usize,
) -> Result<()> {
    let expander = TemplateExpander {
        transaction,
        macros,
        max_while_iterations,
        manually_processed: RefCell::new(HashSet::new()),
    };
    let nodes = std::mem::take(&mut document.nodes);
    let mut expanded = Vec::with_capacity(nodes.len());
    for node in &nodes {
        expanded.extend(expander.expand_node(node, None)?);
        expander.manually_processed.borrow_mut().clear();
    }
    document.nodes = expanded;
    Ok(())
}

impl TemplateExpander<'_> {
    fn eval_tokens(&self, tokens: &[Token], location: &crate::diagnostics::SourceLocation) -> Result<EvalValue> {
        let resolver = ExpanderDollar { transaction: self.transaction };
        ExpressionEvaluator::new(self.transaction, &resolver).evaluate(tokens, location)
    }

    /// Evaluate a tree value to its runtime form, including expression
    /// elements nested inside arrays.
    fn eval_value(&self, value: &Value) -> Result<EvalValue> {
        match value {
            Value::Literal(l) => Ok(literal_to_eval(l)),
            Value::Array(elements) => Ok(EvalValue::Array(
                elements.iter().map(|e| self.eval_value(e)).collect::<Result<_>>()?,
            )),
            Value::Expression(e) => self.eval_tokens(&e.tokens, &e.location),
        }
    }

    fn expand_node(&self, node: &Node, parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        match node {
            Node::Block(block) => {
                self.process_block(block, parent)?;
                Ok(vec![node.clone()])
            }
            Node::Set(n) => {
                self.expand_set(n)?;
                Ok(vec![])
            }
            Node::If(n) => self.expand_if(n, parent),
            Node::Foreach(n) => self.expand_foreach(n, parent),
            Node::While(n) => self.expand_while(n, parent),
            Node::OnData(n) => self.expand_on_data(n, parent),
            // Imports and injects are resolved by the document loader; free
            // text passes through untouched
            other => Ok(vec![other.clone()]),
        }
    }

    fn expand_nodes(&self, nodes: &[Node], parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.extend(self.expand_node(node, parent)?);
        }
        Ok(out)
    }

    fn expand_set(&self, node: &SetNode) -> Result<()> {
        let value = self.eval_value(&node.value)?;
        self.transaction.set_variable(node.name.clone(), value);
        Ok(())
    }

    fn expand_if(&self, node: &IfNode, parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        if self.eval_tokens(&node.condition, &node.location)?.is_truthy() {
            return self.expand_nodes(&node.then_body, parent);
        }
        for (condition, body) in &node.elseifs {
            if self.eval_tokens(condition, &node.location)?.is_truthy() {
                return self.expand_nodes(body, parent);
            }
        }
        self.expand_nodes(&node.else_body, parent)
    }

    fn expand_foreach(&self, node: &ForeachNode, parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        let collection = self
            .transaction
            .variable(&node.collection)
            .ok_or_else(|| {
                CompilerError::new(
                    ErrorKind::InvalidForeachCollection(node.collection.to_string()),
                    node.location.clone(),
                )
            })?;
        let EvalValue::Array(elements) = collection else {
            return Err(CompilerError::new(
                ErrorKind::InvalidForeachCollection(node.collection.to_string()),
                node.location.clone(),
            ));
        };

        let mut introduced = vec![node.item.clone()];
        if let Some(index) = &node.index {
            introduced.push(index.clone());
        }
        let saved = self.transaction.save_bindings(&introduced);

        let result = (|| {
            let mut out = Vec::new();
            for (i, element) in elements.iter().enumerate() {
                self.transaction.set_variable(node.item.clone(), element.clone());
                if let Some(index) = &node.index {
                    self.transaction.set_variable(index.clone(), EvalValue::Number(i as f64));
                }
                let body = clone_nodes(&node.body);
                out.extend(self.expand_nodes(&body, parent)?);
            }
            Ok(out)
        })();

        self.transaction.restore_bindings(saved);
        result
    }

    fn expand_while(&self, node: &WhileNode, parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        let mut iterations = 0usize;
        while self.eval_tokens(&node.condition, &node.location)?.is_truthy() {
            iterations += 1;
            if iterations > self.max_while_iterations {
                return Err(CompilerError::new(
                    ErrorKind::MaxIterationsExceeded(self.max_while_iterations),
                    node.location.clone(),
                ));
            }
            let body = clone_nodes(&node.body);
            out.extend(self.expand_nodes(&body, parent)?);
        }
        Ok(out)
    }

    fn expand_on_data(&self, node: &OnDataNode, parent: Option<&BlockRc>) -> Result<Vec<Node>> {
        if let Some(data) = self.transaction.get_data(&node.source) {
            let saved = self.transaction.save_bindings(&[node.source.clone()]);
            self.transaction.set_variable(node.source.clone(), data);
            let result = self.expand_nodes(&node.on_success, parent);
            self.transaction.restore_bindings(saved);
            result
        } else if let Some(failure) = self.transaction.get_error(&node.source) {
            let error_name: smol_str::SmolStr = "$error".into();
            let saved = self.transaction.save_bindings(&[error_name.clone()]);
            self.transaction.set_variable(error_name, failure.to_eval_value());
            let result = self.expand_nodes(&node.on_error, parent);
            self.transaction.restore_bindings(saved);
            result
        } else {
            Err(CompilerError::new(
                ErrorKind::DataSourceNotExecuted(node.source.to_string()),
                node.location.clone(),
            ))
        }
    }

    /// Evaluate the block's property expressions (deferring `$` references),
    /// fire `on_walk`, then process the children that the hook did not take
    /// over.
    fn process_block(&self, block: &BlockRc, parent: Option<&BlockRc>) -> Result<()> {
        self.evaluate_properties(block)?;

        if let Some(hook) = self.macros.on_walk_hook() {
            let cursor =
                WalkCursor { host: self, block: block.clone(), parent: parent.cloned() };
            hook(&cursor)
                .map_err(|e| into_macro_error(e, block.borrow().location.clone()))?;
        }

        let children = std::mem::take(&mut block.borrow_mut().children);
        let mut new_children = Vec::with_capacity(children.len());
        for child in &children {
            match child {
                Node::Block(b) => {
                    if !self.is_manually_processed(b) {
                        self.process_block(b, Some(block))?;
                    }
                    new_children.push(child.clone());
                }
                other => new_children.extend(self.expand_node(other, Some(block))?),
            }
        }
        block.borrow_mut().children = new_children;
        Ok(())
    }

    fn evaluate_properties(&self, block: &BlockRc) -> Result<()> {
        let names: Vec<_> = block.borrow().properties.keys().cloned().collect();
        for name in names {
            let current = block.borrow().properties.get(&name).cloned();
            let Some(value) = current else { continue };
            if let Some(resolved) = self.resolve_property_value(&value)? {
                block.borrow_mut().properties.insert(name, resolved);
            }
        }
        Ok(())
    }

    /// `Some(new_value)` when anything was evaluated, `None` to keep as-is.
    fn resolve_property_value(&self, value: &Value) -> Result<Option<Value>> {
        match value {
            Value::Literal(_) => Ok(None),
            Value::Array(elements) => {
                let mut changed = false;
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    match self.resolve_property_value(element)? {
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
                if needs_deferral(&e.tokens) {
                    return Ok(None);
                }
                let evaluated = self.eval_tokens(&e.tokens, &e.location)?;
                Ok(Some(eval_to_value(evaluated)))
            }
        }
    }

    fn mark_processed(&self, block: &BlockRc) {
        self.manually_processed.borrow_mut().insert(ByAddress(block.clone()));
    }
}

impl WalkHost for TemplateExpander<'_> {
    fn invoke_walk(&self, block: &BlockRc, parent: Option<&BlockRc>) -> Result<()> {
        self.mark_processed(block);
        self.process_block(block, parent)
    }

    fn is_manually_processed(&self, block: &BlockRc) -> bool {
        self.manually_processed.borrow().contains(&ByAddress(block.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_tree::Literal;
    use smol_str::SmolStr;

    fn expand(source: &str) -> Result<Document> {
        expand_with(source, &Transaction::new(), &MacroSystem::new())
    }

    fn expand_with(
        source: &str,
        txn: &Transaction,
        macros: &MacroSystem,
    ) -> Result<Document> {
        let mut doc = crate::parser::parse(source.into(), None)?;
        run(&mut doc, txn, macros, 10_000)?;
        Ok(doc)
    }

    fn prop(block: &BlockRc, name: &str) -> Value {
        block.borrow().properties.get(name).cloned().unwrap()
    }

    #[test]
    fn set_and_property_expression() {
        let doc = expand("<set w = 200> [Box (width: (w + 40))]").unwrap();
        assert_eq!(doc.nodes.len(), 1);
        let Node::Block(block) = &doc.nodes[0] else { panic!() };
        assert_eq!(prop(block, "width"), Value::Literal(Literal::Number(240.0)));
    }

    #[test]
    fn foreach_over_array_variable() {
        let doc = expand(
            "<set items = {10, 20, 30}> \
             [List <foreach (x in items)> [Item (v: (x * 2))] </foreach> ]",
        )
        .unwrap();
        let Node::Block(list) = &doc.nodes[0] else { panic!() };
        let children = list.borrow().child_blocks();
        assert_eq!(children.len(), 3);
        let values: Vec<_> = children.iter().map(|c| prop(c, "v")).collect();
        assert_eq!(
            values,
            [
                Value::Literal(Literal::Number(20.0)),
                Value::Literal(Literal::Number(40.0)),
                Value::Literal(Literal::Number(60.0)),
            ]
        );
    }

    #[test]
    fn foreach_index_binding_and_restore() {
        let txn = Transaction::new();
        txn.set_variable("x", EvalValue::String("outer".into()));
        let doc = expand_with(
            "<set items = {5, 6}> <foreach x, i in items> [R (v: (x), n: (i))] </foreach>",
            &txn,
            &MacroSystem::new(),
        )
        .unwrap();
        let blocks: Vec<_> = doc.blocks().cloned().collect();
        assert_eq!(prop(&blocks[0], "n"), Value::Literal(Literal::Number(0.0)));
        assert_eq!(prop(&blocks[1], "v"), Value::Literal(Literal::Number(6.0)));
        // Prior binding restored, index removed
        assert_eq!(txn.variable("x"), Some(EvalValue::String("outer".into())));
        assert_eq!(txn.variable("i"), None);
    }

    #[test]
    fn foreach_restores_bindings_on_error() {
        let txn = Transaction::new();
        txn.set_variable("x", EvalValue::Number(1.0));
        let err = expand_with(
            "<set items = {1, 2}> <foreach x in items> [R (v: (undefined))] </foreach>",
            &txn,
            &MacroSystem::new(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedVariable(_)));
        assert_eq!(txn.variable("x"), Some(EvalValue::Number(1.0)));
    }

    #[test]
    fn foreach_requires_array() {
        let err = expand("<set n = 5> <foreach x in n> [R] </foreach>").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidForeachCollection(_)));
        let err = expand("<foreach x in missing> [R] </foreach>").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidForeachCollection(_)));
    }

    #[test]
    fn if_elseif_else() {
        let doc = expand(
            "<set mode = 2> \
             <if (mode == 1)> [One] <elseif (mode == 2)> [Two] <else> [Other] </if>",
        )
        .unwrap();
        let ids: Vec<_> = doc
            .blocks()
            .map(|b| b.borrow().id.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["Two"]);
    }

    #[test]
    fn while_loop_and_iteration_cap() {
        let doc = expand(
            "<set n = 0> <while (n < 3)> [Step (i: (n))] <set n = (n + 1)> </while>",
        )
        .unwrap();
        assert_eq!(doc.blocks().count(), 3);

        let mut doc = crate::parser::parse("<while (true)> [X] </while>".into(), None).unwrap();
        let err =
            run(&mut doc, &Transaction::new(), &MacroSystem::new(), 50).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MaxIterationsExceeded(50)));
    }

    #[test]
    fn while_iterations_are_independent_clones() {
        let doc = expand(
            "<set n = 0> <while (n < 2)> [Step [Inner (k: (n))]] <set n = (n + 1)> </while>",
        )
        .unwrap();
        let blocks: Vec<_> = doc.blocks().cloned().collect();
        let first_inner = blocks[0].borrow().child_blocks()[0].clone();
        let second_inner = blocks[1].borrow().child_blocks()[0].clone();
        assert!(!std::rc::Rc::ptr_eq(&first_inner, &second_inner));
        assert_eq!(prop(&first_inner, "k"), Value::Literal(Literal::Number(0.0)));
        assert_eq!(prop(&second_inner, "k"), Value::Literal(Literal::Number(1.0)));
    }

    #[test]
    fn dollar_expressions_are_deferred() {
        let doc = expand("[Layout [Content (margin: ($Sidebar.width))] [Sidebar (width: 250)]]")
            .unwrap();
        let Node::Block(layout) = &doc.nodes[0] else { panic!() };
        let content = layout.borrow().child_blocks()[0].clone();
        assert!(matches!(prop(&content, "margin"), Value::Expression(_)));
    }

    #[tokio::test]
    async fn on_data_success_and_error_paths() {
        let txn = Transaction::new();
        txn.register_data_source("users", || async {
            Ok(EvalValue::Array(vec![EvalValue::String("ada".into())]))
        });
        txn.register_data_source("broken", || async { Err("out of reach".to_string()) });
        txn.fetch_many(&["users".into(), "broken".into()]).await;

        let doc = expand_with(
            "<on-data users> [UserList (n: (users.length))] </on-data> \
             <on-data broken> [Data] <on-error> [ErrorBox (msg: ($error.message))] </on-data>",
            &txn,
            &MacroSystem::new(),
        )
        .unwrap();

        let ids: Vec<_> = doc
            .blocks()
            .map(|b| b.borrow().id.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["UserList", "ErrorBox"]);
        let blocks: Vec<_> = doc.blocks().cloned().collect();
        assert_eq!(prop(&blocks[0], "n"), Value::Literal(Literal::Number(1.0)));
        assert_eq!(
            prop(&blocks[1], "msg"),
            Value::Literal(Literal::String("out of reach".into()))
        );
        // Scoped bindings are gone afterwards
        assert_eq!(txn.variable("users"), None);
        assert_eq!(txn.variable("$error"), None);
    }

    #[test]
    fn on_data_without_execution_is_internal_error() {
        let err = expand("<on-data ghost> [X] </on-data>").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DataSourceNotExecuted(_)));
    }

    #[test]
    fn on_walk_sees_evaluated_properties_and_can_rewrite() {
        let mut macros = MacroSystem::new();
        macros.set_on_walk(|cursor| {
            let block = cursor.block();
            let doubled = match block.borrow().properties.get("w") {
                Some(Value::Literal(Literal::Number(n))) => Some(n * 2.0),
                _ => None,
            };
            if let Some(n) = doubled {
                block
                    .borrow_mut()
                    .properties
                    .insert("w".into(), Value::Literal(Literal::Number(n)));
            }
            Ok(())
        });
        let txn = Transaction::new();
        let doc = expand_with("<set base = 4> [Box (w: (base))]", &txn, &macros).unwrap();
        let Node::Block(block) = &doc.nodes[0] else { panic!() };
        assert_eq!(prop(block, "w"), Value::Literal(Literal::Number(8.0)));
    }

    #[test]
    fn on_walk_manual_child_processing_sums_widths() {
        let mut macros = MacroSystem::new();
        macros.set_on_walk(|cursor| {
            let block = cursor.block();
            let auto_size = matches!(
                block.borrow().properties.get("auto-size"),
                Some(Value::Literal(Literal::Bool(true)))
            );
            if !auto_size {
                return Ok(());
            }
            let mut total = 0.0;
            for child in cursor.get_remaining_children(block) {
                cursor.invoke_walk(&child, Some(block))?;
                if let Some(Value::Literal(Literal::Number(w))) =
                    child.borrow().properties.get("width")
                {
                    total += w;
                }
            }
            block
                .borrow_mut()
                .properties
                .insert("width".into(), Value::Literal(Literal::Number(total)));
            Ok(())
        });

        let doc = expand_with(
            "[C (auto-size: true) [A (width: 100)] [B (width: 150)] [D (width: 50)]]",
            &Transaction::new(),
            &macros,
        )
        .unwrap();
        let Node::Block(c) = &doc.nodes[0] else { panic!() };
        assert_eq!(prop(c, "width"), Value::Literal(Literal::Number(300.0)));
        for child in c.borrow().child_blocks() {
            assert!(child.borrow().properties.get("width").is_some());
        }
    }

    #[test]
    fn on_walk_counts_each_block_once() {
        let counts: std::rc::Rc<RefCell<Vec<SmolStr>>> = Default::default();
        let seen = counts.clone();
        let mut macros = MacroSystem::new();
        macros.set_on_walk(move |cursor| {
            let block = cursor.block();
            let id = block.borrow().id.clone().unwrap_or_default();
            seen.borrow_mut().push(id);
            // Manually walk the first child; the expander must still
            // auto-process the second
            if let Some((child, parent)) = cursor.peek_next() {
                cursor.invoke_walk(&child, Some(&parent))?;
            }
            Ok(())
        });

        expand_with("[Root [A] [B]]", &Transaction::new(), &macros).unwrap();
        let mut ids: Vec<_> = counts.borrow().iter().map(|s| s.to_string()).collect();
        ids.sort();
        assert_eq!(ids, ["A", "B", "Root"]);
    }

    #[test]
    fn macro_errors_are_wrapped() {
        let mut macros = MacroSystem::new();
        macros.set_on_walk(|cursor| Err(cursor.throw_error("refusing this block")));
        let err = expand_with("[Root]", &Transaction::new(), &macros).unwrap_err();
        match &err.kind {
            ErrorKind::MacroError(msg) => assert!(msg.contains("Root"), "{msg}"),
            other => panic!("expected macro error, got {other:?}"),
        }
    }

    #[test]
    fn nested_templates_inside_loop_bodies() {
        let doc = expand(
            "<set items = {1, 2, 3}> \
             <foreach x in items> <if (x != 2)> [Keep (v: (x))] </if> </foreach>",
        )
        .unwrap();
        let values: Vec<_> = doc.blocks().map(|b| prop(b, "v")).collect();
        assert_eq!(
            values,
            [
                Value::Literal(Literal::Number(1.0)),
                Value::Literal(Literal::Number(3.0)),
            ]
        );
    }
}
