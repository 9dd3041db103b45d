//! ELF relocatable object emission with the `object` writer.

use super::encoder::Assembled;
use super::function_codegen::CallSite;
use crate::core::error::CodegenError;
use crate::ir::{FuncId, Linkage, Module};
use hashbrown::HashMap;
use iced_x86::code_asm::CodeLabel;
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

/// Write `.text` plus symbols and call relocations for `module` into `buffer`.
///
/// `entries` lists the functions with bodies in emission order.
pub(super) fn write_object(
    module: &Module,
    assembled: &Assembled,
    entries: &[(FuncId, CodeLabel)],
    sites: &[CallSite],
    buffer: &mut Vec<u8>,
) -> Result<(), CodegenError> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    obj.add_file_symbol(module.name().as_bytes().to_vec());

    let text = obj.section_id(StandardSection::Text);
    let code = assembled.code();
    obj.append_section_data(text, code, 16);

    let mut offsets = Vec::with_capacity(entries.len());
    for (_, label) in entries {
        offsets.push(assembled.label_offset(label)?);
    }

    let mut symbols: HashMap<FuncId, SymbolId> = HashMap::new();
    for (idx, (id, _)) in entries.iter().enumerate() {
        let Some(function) = module.function(*id) else {
            return Err(CodegenError::UnknownCallee { callee: *id });
        };
        let start = offsets[idx];
        let end = offsets.get(idx + 1).copied().unwrap_or(code.len() as u64);
        let scope = match function.linkage {
            Linkage::Private => SymbolScope::Compilation,
            Linkage::External => SymbolScope::Linkage,
        };
        let symbol = obj.add_symbol(Symbol {
            name: function.name.as_bytes().to_vec(),
            value: start,
            size: end - start,
            kind: SymbolKind::Text,
            scope,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        symbols.insert(*id, symbol);
    }

    for (id, function) in module.functions() {
        if !function.is_declaration() {
            continue;
        }
        let symbol = obj.add_symbol(Symbol {
            name: function.name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        symbols.insert(id, symbol);
    }

    for site in sites {
        let symbol = *symbols
            .get(&site.callee)
            .ok_or(CodegenError::UnknownCallee { callee: site.callee })?;
        // rel32 follows the E8 opcode byte
        let offset = assembled.label_offset(&site.label)? + 1;
        obj.add_relocation(
            text,
            Relocation {
                offset,
                symbol,
                addend: -4,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::PltRelative,
                    encoding: RelocationEncoding::X86Branch,
                    size: 32,
                },
            },
        )?;
    }

    buffer.clear();
    obj.emit(buffer)?;
    Ok(())
}
