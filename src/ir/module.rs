// This module implements the persistent IR container. Functions live in a slot arena indexed
// by FuncId so that identities stay stable while bodies move in and out: a slot is Attached
// (the module owns the function and code generation sees it), Detached (the identity is
// reserved but the body is owned by someone else, e.g. the helper lifecycle manager or the
// optimizer while it rewrites the function) or Free (reusable by the next add_function).
// Iteration follows slot order rather than insertion order, which keeps the generated object
// identical for identical module contents no matter how often helpers were detached.

//! Persistent function container with explicit attachment state.

use super::{FuncId, Function};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("function {id} is not attached to the module")]
    NotAttached { id: FuncId },

    #[error("function {id} is not detached from the module")]
    NotDetached { id: FuncId },

    #[error("function name already in use: {name}")]
    NameTaken { name: String },
}

#[derive(Debug)]
enum Slot {
    Attached(Function),
    Detached,
    Free,
}

#[derive(Debug)]
pub struct Module {
    name: String,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a new function, reusing a free slot when one exists.
    pub fn add_function(&mut self, function: Function) -> Result<FuncId, ModuleError> {
        if self.find_function(&function.name).is_some() {
            return Err(ModuleError::NameTaken {
                name: function.name,
            });
        }

        let id = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Slot::Attached(function);
                idx
            }
            None => {
                self.slots.push(Slot::Attached(function));
                (self.slots.len() - 1) as u32
            }
        };
        Ok(FuncId(id))
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        match self.slots.get(id.0 as usize) {
            Some(Slot::Attached(function)) => Some(function),
            _ => None,
        }
    }

    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        match self.slots.get_mut(id.0 as usize) {
            Some(Slot::Attached(function)) => Some(function),
            _ => None,
        }
    }

    /// Look up an attached function by name.
    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions()
            .find(|(_, function)| function.name == name)
            .map(|(id, _)| id)
    }

    pub fn is_attached(&self, id: FuncId) -> bool {
        self.function(id).is_some()
    }

    pub fn is_detached(&self, id: FuncId) -> bool {
        matches!(self.slots.get(id.0 as usize), Some(Slot::Detached))
    }

    /// Attached functions in slot order.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match slot {
            Slot::Attached(function) => Some((FuncId(idx as u32), function)),
            _ => None,
        })
    }

    pub fn attached_ids(&self) -> Vec<FuncId> {
        self.functions().map(|(id, _)| id).collect()
    }

    /// Number of calls to `id` from the bodies of attached functions.
    pub fn use_count(&self, id: FuncId) -> usize {
        self.functions()
            .filter_map(|(_, function)| function.body.as_ref())
            .map(|body| body.calls_to(id))
            .sum()
    }

    /// Move a function out of the module while keeping its identity reserved.
    pub fn detach(&mut self, id: FuncId) -> Result<Function, ModuleError> {
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .ok_or(ModuleError::NotAttached { id })?;
        match std::mem::replace(slot, Slot::Detached) {
            Slot::Attached(function) => Ok(function),
            other => {
                *slot = other;
                Err(ModuleError::NotAttached { id })
            }
        }
    }

    /// Put a previously detached function back under its old identity.
    pub fn reattach(&mut self, id: FuncId, function: Function) -> Result<(), ModuleError> {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot @ Slot::Detached) => {
                *slot = Slot::Attached(function);
                Ok(())
            }
            _ => Err(ModuleError::NotDetached { id }),
        }
    }

    /// Remove an attached function for good and release its slot.
    pub fn erase(&mut self, id: FuncId) -> Result<Function, ModuleError> {
        let function = self.detach(id)?;
        self.slots[id.0 as usize] = Slot::Free;
        self.free.push(id.0);
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Linkage};

    fn caller_of(name: &str, callee: FuncId) -> Function {
        let mut b = FunctionBuilder::new();
        b.call(callee);
        b.ret(false);
        Function {
            name: name.to_string(),
            linkage: Linkage::External,
            always_inline: false,
            body: Some(b.finish()),
        }
    }

    #[test]
    fn test_detach_and_reattach_keep_identity() {
        let mut module = Module::new("mod");
        let a = module.add_function(Function::declaration("a")).unwrap();
        let b = module.add_function(Function::declaration("b")).unwrap();

        let detached = module.detach(a).unwrap();
        assert!(module.is_detached(a));
        assert_eq!(module.attached_ids(), vec![b]);
        assert_eq!(module.detach(a), Err(ModuleError::NotAttached { id: a }));

        module.reattach(a, detached).unwrap();
        assert_eq!(module.attached_ids(), vec![a, b]);
        assert_eq!(
            module.reattach(a, Function::declaration("a")),
            Err(ModuleError::NotDetached { id: a })
        );
    }

    #[test]
    fn test_erase_frees_slot_for_reuse() {
        let mut module = Module::new("mod");
        let helper = module.add_function(Function::declaration("helper")).unwrap();
        let first = module.add_function(caller_of("func_1000", helper)).unwrap();
        assert_eq!(module.use_count(helper), 1);

        module.erase(first).unwrap();
        assert_eq!(module.use_count(helper), 0);
        assert!(module.find_function("func_1000").is_none());

        let second = module.add_function(caller_of("func_1000", helper)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut module = Module::new("mod");
        module.add_function(Function::declaration("syscall")).unwrap();
        assert!(matches!(
            module.add_function(Function::declaration("syscall")),
            Err(ModuleError::NameTaken { .. })
        ));
    }

    #[test]
    fn test_detached_callers_do_not_count_as_uses() {
        let mut module = Module::new("mod");
        let helper = module.add_function(Function::declaration("helper")).unwrap();
        let caller = module.add_function(caller_of("caller", helper)).unwrap();
        let body = module.detach(caller).unwrap();
        assert_eq!(module.use_count(helper), 0);
        module.reattach(caller, body).unwrap();
        assert_eq!(module.use_count(helper), 1);
    }
}
