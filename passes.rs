pub(crate) mod data_sources;
pub(crate) mod reference_resolution;
pub(crate) mod tag_expansion;
pub(crate) mod template_expansion;

use crate::diagnostics::Result;
use crate::macros::MacroSystem;
use crate::object_tree::Document;
use crate::tagregister::TagRegister;
use crate::transaction::Transaction;
use std::cell::RefCell;
use std::rc::Rc;

/// The preprocessing pipeline after imports and injects are resolved: tag
/// expansion, data-source execution, template expansion, reference
/// resolution. Only the data-source stage may suspend.
pub(crate) async fn run_passes(
    document: &mut Document,
    transaction: &Transaction,
    register: &Rc<RefCell<TagRegister>>,
    macros: &MacroSystem,
    max_while_iterations: usize,
) -> Result<()> {
    tag_expansion::process(document, register)?;
    data_sources::run(document, transaction).await?;
    template_expansion::run(document, transaction, macros, max_while_iterations)?;
    reference_resolution::resolve(document, transaction)?;
    Ok(())
}
