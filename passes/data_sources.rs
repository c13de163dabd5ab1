//! Discovery and scheduled execution of `<on-data>` sources.
//!
//! Sources nested inside another source's body depend on it; dependency
//! levels form the execution schedule. Everything at one level is fetched in
//! parallel with a settle-all policy, and level N+1 never starts before all
//! of level N has settled.

use crate::diagnostics::{CompilerError, ErrorKind, Result, SourceLocation};
use crate::object_tree::{Document, Node};
use crate::transaction::Transaction;
use itertools::Itertools;
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
pub struct ExecutionPlan {
    /// source name → dependency level (0 = no parent)
    pub levels: HashMap<SmolStr, usize>,
}

#[derive(Debug)]
struct Usage {
    source: SmolStr,
    parent: Option<SmolStr>,
    location: SourceLocation,
}

pub async fn run(document: &Document, transaction: &Transaction) -> Result<()> {
    let mut usages = Vec::new();
    discover(&document.nodes, None, &mut usages);
    if usages.is_empty() {
        return Ok(());
    }

    for usage in &usages {
        if !transaction.has_data_source(&usage.source) {
            return Err(CompilerError::new(
                ErrorKind::UndefinedDataSource(usage.source.to_string()),
                usage.location.clone(),
            ));
        }
    }

    let plan = compute_plan(&usages)?;

    let mut schedule: BTreeMap<usize, Vec<SmolStr>> = BTreeMap::new();
    for (source, level) in &plan.levels {
        schedule.entry(*level).or_default().push(source.clone());
    }

    for (_, mut names) in schedule {
        names.sort();
        // Settle-all: per-source failures are cached on the transaction and
        // surface later through the <on-error> branches
        let _ = transaction.fetch_many(&names).await;
    }
    Ok(())
}

/// Find every `<on-data>` in the tree. `parent` is the innermost enclosing
/// source; descending into either branch of an `<on-data>` makes it the
/// parent of everything inside.
fn discover(nodes: &[Node], parent: Option<&SmolStr>, usages: &mut Vec<Usage>) {
    for node in nodes {
        match node {
            Node::OnData(n) => {
                usages.push(Usage {
                    source: n.source.clone(),
                    parent: parent.cloned(),
                    location: n.location.clone(),
                });
                discover(&n.on_success, Some(&n.source), usages);
                discover(&n.on_error, Some(&n.source), usages);
            }
            Node::Block(b) => {
                let children = b.borrow().children.clone();
                discover(&children, parent, usages);
            }
            Node::If(n) => {
                discover(&n.then_body, parent, usages);
                for (_, body) in &n.elseifs {
                    discover(body, parent, usages);
                }
                discover(&n.else_body, parent, usages);
            }
            Node::Foreach(n) => discover(&n.body, parent, usages),
            Node::While(n) => discover(&n.body, parent, usages),
            _ => {}
        }
    }
}

fn compute_plan(usages: &[Usage]) -> Result<ExecutionPlan> {
    // A source may be consumed at several places; it depends on the union
    // of the parents observed
    let mut parents: HashMap<SmolStr, HashSet<SmolStr>> = HashMap::new();
    let mut locations: HashMap<SmolStr, SourceLocation> = HashMap::new();
    for usage in usages {
        let entry = parents.entry(usage.source.clone()).or_default();
        if let Some(p) = &usage.parent {
            if *p != usage.source {
                entry.insert(p.clone());
            }
        }
        locations.entry(usage.source.clone()).or_insert_with(|| usage.location.clone());
    }

    let mut plan = ExecutionPlan::default();
    let mut stack = Vec::new();
    for source in parents.keys() {
        level_of(source, &parents, &locations, &mut plan.levels, &mut stack)?;
    }
    Ok(plan)
}

fn level_of(
    source: &SmolStr,
    parents: &HashMap<SmolStr, HashSet<SmolStr>>,
    locations: &HashMap<SmolStr, SourceLocation>,
    levels: &mut HashMap<SmolStr, usize>,
    stack: &mut Vec<SmolStr>,
) -> Result<usize> {
    if let Some(level) = levels.get(source) {
        return Ok(*level);
    }
    if stack.contains(source) {
        let chain = stack
            .iter()
            .map(SmolStr::as_str)
            .chain(std::iter::once(source.as_str()))
            .join(" → ");
        return Err(CompilerError::new(
            ErrorKind::CircularDataSourceDependency(chain),
            locations.get(source).cloned().unwrap_or_default(),
        ));
    }

    stack.push(source.clone());
    let level = match parents.get(source) {
        Some(deps) if !deps.is_empty() => {
            let mut max = 0;
            for dep in deps {
                max = max.max(level_of(dep, parents, locations, levels, stack)?);
            }
            max + 1
        }
        _ => 0,
    };
    stack.pop();
    levels.insert(source.clone(), level);
    Ok(level)
}
