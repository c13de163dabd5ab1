/*!
 The macro hook system.

 User code attaches to two hooks: `on_parse` runs once on the raw tree
 before any preprocessing, `on_walk` runs during template expansion once per
 block, after the block's own properties are evaluated and before its
 children are processed. Inside `on_walk` the cursor gives precise control
 over child processing; the cursor type only ever exists as the callback's
 argument, so it cannot be used outside the hook.
*/

use crate::diagnostics::{CompilerError, ErrorKind, Result, SourceLocation};
use crate::object_tree::{BlockRc, Document, Node};
use std::rc::Rc;

/// Handed to `on_parse`; lets the callback end preprocessing early.
#[derive(Default)]
pub struct ParseControl {
    finished: bool,
}

impl ParseControl {
    /// Skip the rest of preprocessing: the raw tree becomes the output.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}

pub type OnParseHook = Rc<dyn Fn(&mut Document, &mut ParseControl) -> Result<()>>;
pub type OnWalkHook = Rc<dyn Fn(&WalkCursor<'_>) -> Result<()>>;

#[derive(Default, Clone)]
pub struct MacroSystem {
    on_parse: Option<OnParseHook>,
    on_walk: Option<OnWalkHook>,
}

impl MacroSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_parse(
        &mut self,
        hook: impl Fn(&mut Document, &mut ParseControl) -> Result<()> + 'static,
    ) {
        self.on_parse = Some(Rc::new(hook));
    }

    pub fn set_on_walk(&mut self, hook: impl Fn(&WalkCursor<'_>) -> Result<()> + 'static) {
        self.on_walk = Some(Rc::new(hook));
    }

    pub fn has_on_walk(&self) -> bool {
        self.on_walk.is_some()
    }

    pub(crate) fn on_walk_hook(&self) -> Option<OnWalkHook> {
        self.on_walk.clone()
    }

    /// Run the `on_parse` hook if present. Returns true if the callback
    /// called [`ParseControl::finish`].
    pub(crate) fn run_on_parse(&self, document: &mut Document) -> Result<bool> {
        let Some(hook) = &self.on_parse else {
            return Ok(false);
        };
        let mut control = ParseControl::default();
        hook(document, &mut control).map_err(|e| into_macro_error(e, SourceLocation::default()))?;
        Ok(control.is_finished())
    }
}

/// Wrap a user-callback failure as a macro error, preserving the original
/// as the cause. Errors that already are macro errors pass through.
pub(crate) fn into_macro_error(error: CompilerError, location: SourceLocation) -> CompilerError {
    if matches!(error.kind, ErrorKind::MacroError(_)) {
        return error;
    }
    let location = if error.location.source_file.is_some() { error.location.clone() } else { location };
    CompilerError::new(ErrorKind::MacroError(error.kind.to_string()), location).with_cause(error)
}

/// The expander side of the cursor API.
pub(crate) trait WalkHost {
    /// Evaluate the block's properties, fire its `on_walk`, process its
    /// children, and mark it as manually processed.
    fn invoke_walk(&self, block: &BlockRc, parent: Option<&BlockRc>) -> Result<()>;
    fn is_manually_processed(&self, block: &BlockRc) -> bool;
}

/// Cursor over the block currently visited by `on_walk`.
///
/// `back` and `stop` are reserved: they validate the calling context by
/// existing only on this type, and do nothing.
pub struct WalkCursor<'a> {
    pub(crate) host: &'a dyn WalkHost,
    pub(crate) block: BlockRc,
    pub(crate) parent: Option<BlockRc>,
}

impl WalkCursor<'_> {
    pub fn block(&self) -> &BlockRc {
        &self.block
    }

    pub fn parent(&self) -> Option<&BlockRc> {
        self.parent.as_ref()
    }

    /// The current block's first block child, or None.
    pub fn next_block(&self) -> Option<BlockRc> {
        self.block.borrow().children.iter().find_map(|n| n.as_block().cloned())
    }

    /// Like [`Self::next_block`], with the parent attached.
    pub fn peek_next(&self) -> Option<(BlockRc, BlockRc)> {
        self.next_block().map(|child| (child, self.block.clone()))
    }

    /// The `on_walk` target and its parent.
    pub fn current(&self) -> (BlockRc, Option<BlockRc>) {
        (self.block.clone(), self.parent.clone())
    }

    /// Manually process a child: evaluate its properties, fire its
    /// `on_walk`, recurse into its children. The child is excluded from the
    /// expander's auto-processing afterwards.
    pub fn invoke_walk(&self, block: &BlockRc, parent: Option<&BlockRc>) -> Result<()> {
        self.host.invoke_walk(block, parent)
    }

    /// The block children of `parent` not yet manually processed.
    pub fn get_remaining_children(&self, parent: &BlockRc) -> Vec<BlockRc> {
        parent
            .borrow()
            .children
            .iter()
            .filter_map(|n| n.as_block().cloned())
            .filter(|b| !self.host.is_manually_processed(b))
            .collect()
    }

    /// Reserved.
    pub fn back(&self, _steps: usize) {}

    /// Reserved.
    pub fn stop(&self) {}

    /// A macro error carrying the message and the current block's id.
    pub fn throw_error(&self, message: impl Into<String>) -> CompilerError {
        let block = self.block.borrow();
        let id = block.id.as_deref().unwrap_or("<anonymous>");
        CompilerError::new(
            ErrorKind::MacroError(format!("{} (in block '{id}')", message.into())),
            block.location.clone(),
        )
    }
}

/// Re-exported traversal utility, so `on_parse` callbacks can
/// `walk(&doc.nodes, ...)` the raw tree.
pub use crate::walker::{
    ancestors, find_all, find_by_property, find_by_tag, find_node, walk, TraversalOrder,
    WalkControl, WalkOptions,
};

/// Convenience wrapper over [`walk`] for documents.
pub fn walk_document(
    document: &Document,
    options: &WalkOptions<'_>,
    visit: &mut dyn FnMut(&Node, Option<&BlockRc>) -> WalkControl,
) {
    walk(&document.nodes, options, visit)
}
