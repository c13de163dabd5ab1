/*!
 Storage for tag definitions: blocks parsed from `@tag` markers in OX source
 and host-side tag configurations registered through [`TagRegister::define_tag`].

 Entries are keyed by `name` or `name(argument)`; an argument distinguishes
 overloads, so `card` and `card(Player)` are separate keys.
*/

use crate::diagnostics::{CompilerError, ErrorKind, Result};
use crate::expression_tree::EvalValue;
use crate::object_tree::{BlockRc, PropertyMap};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::rc::Rc;

/// Structural rules for blocks carrying a given tag.
#[derive(Clone)]
pub struct BlockRules {
    /// The definition may be instantiated with `#tag`
    pub can_reuse: bool,
    /// The definition block itself is retained in the output tree
    pub can_output: bool,
    /// Instances may declare their own children
    pub accept_children: bool,
    /// Invoked on each expanded instance block
    pub output_fn: Option<Rc<dyn Fn(&BlockRc)>>,
}

impl Default for BlockRules {
    fn default() -> Self {
        Self { can_reuse: true, can_output: false, accept_children: true, output_fn: None }
    }
}

impl std::fmt::Debug for BlockRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRules")
            .field("can_reuse", &self.can_reuse)
            .field("can_output", &self.can_output)
            .field("accept_children", &self.accept_children)
            .field("output_fn", &self.output_fn.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Context handed to module property getters during tag expansion.
pub struct ModuleContext<'a> {
    pub block_id: Option<&'a str>,
    pub tag_name: &'a str,
    pub tag_argument: Option<&'a str>,
    pub existing_properties: &'a PropertyMap,
}

/// A host-supplied getter for a module property. The zero-argument form is
/// kept for embedders that predate the context object.
#[derive(Clone)]
pub enum ModuleGetter {
    Plain(Rc<dyn Fn() -> EvalValue>),
    WithContext(Rc<dyn Fn(&ModuleContext<'_>) -> EvalValue>),
}

impl ModuleGetter {
    pub fn call(&self, context: &ModuleContext<'_>) -> EvalValue {
        match self {
            ModuleGetter::Plain(f) => f(),
            ModuleGetter::WithContext(f) => f(context),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TagDescriptor {
    pub attributes: Vec<SmolStr>,
    pub expose_as: Option<SmolStr>,
}

/// A host-side tag registration: rules, module getters, descriptor.
#[derive(Default)]
pub struct TagConfig {
    pub rules: BlockRules,
    pub module: Vec<(SmolStr, ModuleGetter)>,
    pub descriptor: TagDescriptor,
}

#[derive(Default)]
pub struct TagRegister {
    /// `@tag` definition blocks, by `createKey(name, argument)`
    instances: HashMap<SmolStr, BlockRc>,
    /// Host configurations, by tag name
    configs: HashMap<SmolStr, Rc<TagConfig>>,
}

pub fn create_key(name: &str, argument: Option<&str>) -> SmolStr {
    crate::object_tree::create_key(name, argument)
}

impl TagRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host-side tag with its block rules, module getters and
    /// descriptor.
    pub fn define_tag(&mut self, name: impl Into<SmolStr>, config: TagConfig) -> Result<()> {
        let name = name.into();
        if self.configs.contains_key(&name) {
            return Err(CompilerError::without_location(ErrorKind::DuplicateTagDefinition(
                name.to_string(),
            )));
        }
        self.configs.insert(name, Rc::new(config));
        Ok(())
    }

    /// Store an `@tag` block parsed from OX source. Duplicate keys fail.
    pub fn register_instance(&mut self, key: SmolStr, block: BlockRc) -> Result<()> {
        if self.instances.contains_key(&key) {
            let location =
                block.borrow().location.clone();
            return Err(CompilerError::new(
                ErrorKind::DuplicateTagDefinition(key.to_string()),
                location,
            ));
        }
        self.instances.insert(key, block);
        Ok(())
    }

    /// Store an imported `@tag` block. Without a namespace alias a later
    /// import with the same key overrides the earlier one.
    pub fn register_imported(&mut self, key: SmolStr, block: BlockRc) {
        self.instances.insert(key, block);
    }

    pub fn get_instance(&self, key: &str) -> Option<BlockRc> {
        self.instances.get(key).cloned()
    }

    pub fn get_tag(&self, name: &str) -> Option<Rc<TagConfig>> {
        self.configs.get(name).cloned()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    /// The effective rules for a tag: its host config's, or the defaults.
    pub fn rules_for(&self, name: &str) -> BlockRules {
        self.configs.get(name).map(|c| c.rules.clone()).unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SmolStr> {
        self.instances.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SourceLocation;
    use crate::object_tree::Block;
    use std::cell::RefCell;

    fn empty_block() -> BlockRc {
        Rc::new(RefCell::new(Block::new(None, SourceLocation::default())))
    }

    #[test]
    fn keys_distinguish_overloads() {
        assert_eq!(create_key("card", None), "card");
        assert_eq!(create_key("card", Some("Player")), "card(Player)");

        let mut register = TagRegister::new();
        register.register_instance(create_key("card", None), empty_block()).unwrap();
        register.register_instance(create_key("card", Some("Player")), empty_block()).unwrap();
        assert!(register.get_instance("card").is_some());
        assert!(register.get_instance("card(Player)").is_some());
        assert!(register.get_instance("card(Enemy)").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut register = TagRegister::new();
        register.register_instance("card".into(), empty_block()).unwrap();
        let err = register.register_instance("card".into(), empty_block()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DuplicateTagDefinition(_)));

        register.define_tag("widget", TagConfig::default()).unwrap();
        assert!(register.define_tag("widget", TagConfig::default()).is_err());
    }

    #[test]
    fn imported_registration_overrides() {
        let mut register = TagRegister::new();
        let first = empty_block();
        first.borrow_mut().id = Some("First".into());
        let second = empty_block();
        second.borrow_mut().id = Some("Second".into());
        register.register_imported("card".into(), first);
        register.register_imported("card".into(), second);
        assert_eq!(register.get_instance("card").unwrap().borrow().id.as_deref(), Some("Second"));
    }

    #[test]
    fn module_getter_forms() {
        let plain = ModuleGetter::Plain(Rc::new(|| EvalValue::Number(1.0)));
        let contextual = ModuleGetter::WithContext(Rc::new(|ctx: &ModuleContext<'_>| {
            EvalValue::String(format!("{}#{}", ctx.tag_name, ctx.block_id.unwrap_or("?")))
        }));
        let props = PropertyMap::default();
        let ctx = ModuleContext {
            block_id: Some("Root"),
            tag_name: "card",
            tag_argument: None,
            existing_properties: &props,
        };
        assert_eq!(plain.call(&ctx), EvalValue::Number(1.0));
        assert_eq!(contextual.call(&ctx), EvalValue::String("card#Root".into()));
    }
}
