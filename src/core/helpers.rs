// This module installs and tracks the fixed helper functions that translated code calls into.
// The helpers are created once per session, in a fixed order, before the first request: the
// syscall and cpuid entry points are external declarations resolved by the client when it
// links the object, noop_stub and rdtsc are tiny private always-inline bodies. Their FuncIds
// never change. What changes is who owns each helper: before optimization every helper without
// a use is moved out of the module into the manager (HelperState::Detached holds the body), and
// after code generation every detached helper is moved back, whatever its use count is by
// then. After cleanup the attached ids of the module are exactly the helper ids.

//! Helper function lifecycle.

use crate::ir::{FuncId, Function, FunctionBuilder, Linkage, Module, ModuleError, Width};
use crate::lifter::cpu_state;
use crate::lifter::InstrImpls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    Syscall,
    NoopStub,
    Cpuid,
    Rdtsc,
}

impl HelperKind {
    /// Installation order.
    pub const ALL: [HelperKind; 4] = [
        HelperKind::Syscall,
        HelperKind::NoopStub,
        HelperKind::Cpuid,
        HelperKind::Rdtsc,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            HelperKind::Syscall => "syscall",
            HelperKind::NoopStub => "noop_stub",
            HelperKind::Cpuid => "cpuid",
            HelperKind::Rdtsc => "rdtsc",
        }
    }

    fn build(self) -> Function {
        match self {
            HelperKind::Syscall | HelperKind::Cpuid => Function::declaration(self.name()),
            HelperKind::NoopStub => {
                let mut b = FunctionBuilder::new();
                b.ret(false);
                private_inline(self.name(), b)
            }
            HelperKind::Rdtsc => {
                // The time stamp counter always reads as zero.
                let mut b = FunctionBuilder::new();
                let zero = b.iconst(0);
                b.store_state(cpu_state::RAX, Width::W64, zero);
                b.store_state(cpu_state::RDX, Width::W64, zero);
                b.ret(false);
                private_inline(self.name(), b)
            }
        }
    }
}

fn private_inline(name: &str, b: FunctionBuilder) -> Function {
    Function {
        name: name.to_string(),
        linkage: Linkage::Private,
        always_inline: true,
        body: Some(b.finish()),
    }
}

/// Who owns a helper right now.
#[derive(Debug)]
pub enum HelperState {
    Attached,
    /// Moved out of the module; the manager holds the function.
    Detached(Function),
}

#[derive(Debug)]
struct Helper {
    kind: HelperKind,
    id: FuncId,
    state: HelperState,
}

/// Owns the helper set of one session.
#[derive(Debug)]
pub struct HelperManager {
    helpers: Vec<Helper>,
}

impl HelperManager {
    /// Add every helper to `module` in installation order.
    pub fn install(module: &mut Module) -> Result<Self, ModuleError> {
        let mut helpers = Vec::with_capacity(HelperKind::ALL.len());
        for kind in HelperKind::ALL {
            let id = module.add_function(kind.build())?;
            helpers.push(Helper {
                kind,
                id,
                state: HelperState::Attached,
            });
        }
        Ok(Self { helpers })
    }

    fn helper(&self, kind: HelperKind) -> &Helper {
        // install() adds every kind, in ALL order
        &self.helpers[kind as usize]
    }

    pub fn id(&self, kind: HelperKind) -> FuncId {
        self.helper(kind).id
    }

    pub fn ids(&self) -> Vec<FuncId> {
        self.helpers.iter().map(|h| h.id).collect()
    }

    pub fn state(&self, kind: HelperKind) -> &HelperState {
        &self.helper(kind).state
    }

    pub fn is_detached(&self, kind: HelperKind) -> bool {
        matches!(self.state(kind), HelperState::Detached(_))
    }

    /// Helper functions implementing instructions for the lifter.
    pub fn instr_impls(&self) -> InstrImpls {
        let noop = self.id(HelperKind::NoopStub);
        InstrImpls {
            syscall: self.id(HelperKind::Syscall),
            cpuid: self.id(HelperKind::Cpuid),
            rdtsc: self.id(HelperKind::Rdtsc),
            fldcw: noop,
            ldmxcsr: noop,
        }
    }

    /// Detach every attached helper that nothing in the module calls. Returns how many.
    pub fn detach_unused(&mut self, module: &mut Module) -> Result<usize, ModuleError> {
        let mut detached = 0;
        for helper in &mut self.helpers {
            if !matches!(helper.state, HelperState::Attached) || module.use_count(helper.id) > 0 {
                continue;
            }
            let function = module.detach(helper.id)?;
            log::trace!("detached unused helper {}", helper.kind.name());
            helper.state = HelperState::Detached(function);
            detached += 1;
        }
        Ok(detached)
    }

    /// Put every detached helper back under its identity. Returns how many.
    pub fn reattach_detached(&mut self, module: &mut Module) -> Result<usize, ModuleError> {
        let mut reattached = 0;
        for helper in &mut self.helpers {
            if let HelperState::Detached(function) =
                std::mem::replace(&mut helper.state, HelperState::Attached)
            {
                module.reattach(helper.id, function)?;
                reattached += 1;
            }
        }
        Ok(reattached)
    }

    /// Whether `module` holds exactly the helper set, all attached.
    pub fn is_session_shape(&self, module: &Module) -> bool {
        self.helpers
            .iter()
            .all(|h| matches!(h.state, HelperState::Attached))
            && module.attached_ids() == self.ids()
    }
}
