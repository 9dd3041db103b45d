//! x86-64 code generation.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - Entry conventions and frame layout
//! - Per-function lowering and ELF object emission

pub mod calling_convention;
pub mod encoder;
mod elf;
mod function_codegen;

pub use calling_convention::{CallConv, FunctionFrame};
pub use encoder::{EncodingError, X64Encoder};

use crate::core::error::CodegenError;
use crate::ir::{Linkage, Module};
use crate::protocol::ServerConfig;
use function_codegen::{Callee, FunctionCodegen};
use hashbrown::HashMap;

/// Generates one relocatable object for the whole module.
pub struct CodeGenerator {
    callconv: CallConv,
}

impl CodeGenerator {
    pub fn new(config: &ServerConfig) -> Self {
        let callconv = if config.hhvm {
            CallConv::Hhvm
        } else {
            CallConv::SysV
        };
        Self { callconv }
    }

    pub fn callconv(&self) -> CallConv {
        self.callconv
    }

    /// Compile every attached function with a body into `buffer` as an ELF object.
    ///
    /// The buffer is cleared first. Functions are laid out in module slot order.
    pub fn generate(&self, module: &Module, buffer: &mut Vec<u8>) -> Result<(), CodegenError> {
        let mut encoder = X64Encoder::new()?;

        let mut callees = HashMap::new();
        let mut entries = Vec::new();
        for (id, function) in module.functions() {
            if function.is_declaration() {
                callees.insert(id, Callee::External);
            } else {
                let label = encoder.create_label();
                callees.insert(id, Callee::Local(label));
                entries.push((id, label));
            }
        }

        let mut sites = Vec::new();
        for (id, entry) in entries.iter_mut() {
            let Some(function) = module.function(*id) else {
                continue;
            };
            let Some(body) = function.body.as_ref() else {
                continue;
            };
            // helpers are only ever called from generated code
            let sptr = match function.linkage {
                Linkage::External => self.callconv.sptr_register(),
                Linkage::Private => CallConv::SysV.sptr_register(),
            };
            FunctionCodegen::new(&mut encoder, &callees, body)?.emit(body, entry, sptr, &mut sites)?;
        }

        let assembled = encoder.finalize()?;
        log::debug!(
            "generated {} bytes of code for {} functions, {} external calls",
            assembled.code().len(),
            entries.len(),
            sites.len()
        );
        elf::write_object(module, &assembled, &entries, &sites, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, FunctionBuilder};
    use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget};

    fn module_with_call() -> Module {
        let mut module = Module::new("test");
        let syscall = module.add_function(Function::declaration("syscall")).unwrap();
        let mut hb = FunctionBuilder::new();
        hb.ret(false);
        let noop = module
            .add_function(Function {
                name: "noop_stub".into(),
                linkage: Linkage::Private,
                always_inline: true,
                body: Some(hb.finish()),
            })
            .unwrap();

        let mut b = FunctionBuilder::new();
        let rip = b.iconst(0x1002);
        b.store_state(0, crate::ir::Width::W64, rip);
        b.call(syscall);
        b.call(noop);
        b.ret(false);
        module
            .add_function(Function {
                name: "func_1000".into(),
                linkage: Linkage::External,
                always_inline: false,
                body: Some(b.finish()),
            })
            .unwrap();
        module
    }

    #[test]
    fn test_generate_elf_with_symbols_and_relocation() {
        let module = module_with_call();
        let mut buffer = vec![0xAA; 3];
        CodeGenerator::new(&ServerConfig::default())
            .generate(&module, &mut buffer)
            .unwrap();

        let file = object::File::parse(&*buffer).unwrap();
        assert_eq!(file.architecture(), object::Architecture::X86_64);
        let text = file.section_by_name(".text").unwrap();
        assert!(text.size() > 0);

        let func = file.symbol_by_name("func_1000").unwrap();
        assert!(func.is_global());
        assert!(func.size() > 0);
        let noop = file.symbol_by_name("noop_stub").unwrap();
        assert!(noop.is_local());
        let syscall = file.symbol_by_name("syscall").unwrap();
        assert!(syscall.is_undefined());

        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 1);
        let (_, reloc) = &relocs[0];
        assert_eq!(reloc.target(), RelocationTarget::Symbol(syscall.index()));
        assert_eq!(
            reloc.flags(),
            object::RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32
            }
        );
    }

    #[test]
    fn test_generate_is_deterministic() {
        let module = module_with_call();
        let generator = CodeGenerator::new(&ServerConfig::default());
        let mut first = Vec::new();
        let mut second = Vec::new();
        generator.generate(&module, &mut first).unwrap();
        generator.generate(&module, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hhvm_entry_reads_r12() {
        let config = ServerConfig {
            hhvm: true,
            ..ServerConfig::default()
        };
        let generator = CodeGenerator::new(&config);
        assert_eq!(generator.callconv(), CallConv::Hhvm);

        let module = module_with_call();
        let mut sysv = Vec::new();
        let mut hhvm = Vec::new();
        CodeGenerator::new(&ServerConfig::default())
            .generate(&module, &mut sysv)
            .unwrap();
        generator.generate(&module, &mut hhvm).unwrap();
        assert_ne!(sysv, hhvm);
    }

    #[test]
    fn test_call_to_detached_function_fails() {
        let mut module = module_with_call();
        let noop = module.find_function("noop_stub").unwrap();
        let _taken = module.detach(noop).unwrap();

        let err = CodeGenerator::new(&ServerConfig::default())
            .generate(&module, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, CodegenError::UnknownCallee { callee } if callee == noop));
    }
}
