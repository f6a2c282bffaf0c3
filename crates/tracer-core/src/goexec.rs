//! Lookup of Go function instrumentation points inside an executable.
use std::collections::HashMap;

use bpf_common::{ConstValue, Constants};
use elf::{
    ElfBytes,
    abi::{EM_AARCH64, EM_X86_64, STT_FUNC},
    endian::AnyEndian,
};
use iced_x86::{Code, Decoder, DecoderOptions};

use crate::{error::InspectionError, exec::ExecutableInfo};

/// Sections only the Go toolchain emits.
const GO_SECTIONS: [&str; 2] = [".go.buildinfo", ".gopclntab"];
/// Little endian encoding of the arm64 `RET` instruction.
const ARM64_RET: u32 = 0xd65f03c0;

/// Instrumentation points of a Go function, as offsets in the executable file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncOffsets {
    pub start: u64,
    /// Offsets of the return instructions. Goroutine stacks move, so return
    /// probes are placed on every `RET` instead of using uretprobes.
    pub returns: Vec<u64>,
}

/// Go functions found in an executable, plus known struct field offsets.
/// Functions which were not found are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    pub funcs: HashMap<String, FuncOffsets>,
    pub fields: HashMap<String, u64>,
}

impl OffsetTable {
    pub fn contains(&self, function: &str) -> bool {
        self.funcs.contains_key(function)
    }
}

/// Struct field offset constants. Values found in `offsets` win over
/// `defaults`, which hold the layout of recent Go releases.
pub fn field_constants(offsets: Option<&OffsetTable>, defaults: &[(&str, u64)]) -> Constants {
    defaults
        .iter()
        .map(|(name, default)| {
            let value = offsets
                .and_then(|offsets| offsets.fields.get(*name))
                .copied()
                .unwrap_or(*default);
            (name.to_string(), ConstValue::U64(value))
        })
        .collect()
}

/// Result of inspecting an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Found(OffsetTable),
    /// Not a Go executable, or none of the requested functions is there.
    NotApplicable(String),
}

impl Inspection {
    pub fn into_offsets(self) -> Option<OffsetTable> {
        match self {
            Inspection::Found(offsets) => Some(offsets),
            Inspection::NotApplicable(_) => None,
        }
    }
}

pub trait OffsetInspector: Send + Sync {
    /// Looks for `functions` in the executable of `exe`. The executable is
    /// opened and released within the call.
    fn inspect(
        &self,
        exe: &ExecutableInfo,
        functions: &[String],
    ) -> Result<Inspection, InspectionError>;
}

/// Reads the ELF symbol table of Go executables.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoElfInspector;

impl OffsetInspector for GoElfInspector {
    fn inspect(
        &self,
        exe: &ExecutableInfo,
        functions: &[String],
    ) -> Result<Inspection, InspectionError> {
        let path = exe.exe_path.display().to_string();
        let bytes = std::fs::read(&exe.exe_path).map_err(|source| InspectionError::Read {
            path: path.clone(),
            source,
        })?;
        inspect_elf(&bytes, functions).map_err(|source| InspectionError::Parse { path, source })
    }
}

fn inspect_elf(bytes: &[u8], functions: &[String]) -> Result<Inspection, elf::ParseError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
    let mut is_go = false;
    for section in GO_SECTIONS {
        is_go |= file.section_header_by_name(section)?.is_some();
    }
    if !is_go {
        return Ok(Inspection::NotApplicable("not a Go executable".to_string()));
    }
    let (Some(shdrs), Some((symtab, strtab))) = (file.section_headers(), file.symbol_table()?)
    else {
        return Ok(Inspection::NotApplicable(
            "Go executable without symbol table".to_string(),
        ));
    };
    let machine = file.ehdr.e_machine;

    let mut funcs = HashMap::new();
    for sym in symtab.iter() {
        if sym.st_symtype() != STT_FUNC || sym.is_undefined() {
            continue;
        }
        let name = strtab.get(sym.st_name as usize)?;
        if !functions.iter().any(|f| f == name) || funcs.contains_key(name) {
            continue;
        }
        let section = shdrs.get(sym.st_shndx as usize)?;
        let Some(start) = sym
            .st_value
            .checked_add(section.sh_offset)
            .and_then(|offset| offset.checked_sub(section.sh_addr))
        else {
            continue;
        };
        let returns = function_code(bytes, start, sym.st_size)
            .map(|code| return_sites(machine, code, start))
            .unwrap_or_default();
        funcs.insert(name.to_string(), FuncOffsets { start, returns });
    }

    if funcs.is_empty() {
        return Ok(Inspection::NotApplicable(
            "no instrumentable Go function found".to_string(),
        ));
    }
    Ok(Inspection::Found(OffsetTable {
        funcs,
        fields: HashMap::new(),
    }))
}

fn function_code(bytes: &[u8], start: u64, size: u64) -> Option<&[u8]> {
    let begin = usize::try_from(start).ok()?;
    let end = begin.checked_add(usize::try_from(size).ok()?)?;
    bytes.get(begin..end)
}

/// File offsets of the return instructions in `code`, which starts at file
/// offset `start`. Unknown architectures have none.
fn return_sites(machine: u16, code: &[u8], start: u64) -> Vec<u64> {
    match machine {
        EM_X86_64 => x86_64_returns(code, start),
        EM_AARCH64 => arm64_returns(code, start),
        _ => Vec::new(),
    }
}

/// x86 instructions have variable length, so the code is decoded from the
/// function entry.
fn x86_64_returns(code: &[u8], start: u64) -> Vec<u64> {
    let mut decoder = Decoder::with_ip(64, code, start, DecoderOptions::NONE);
    decoder
        .iter()
        .filter(|insn| matches!(insn.code(), Code::Retnq | Code::Retnq_imm16))
        .map(|insn| insn.ip())
        .collect()
}

fn arm64_returns(code: &[u8], start: u64) -> Vec<u64> {
    code.chunks_exact(4)
        .enumerate()
        .filter(|(_, insn)| u32::from_le_bytes([insn[0], insn[1], insn[2], insn[3]]) == ARM64_RET)
        .map(|(i, _)| start + 4 * i as u64)
        .collect()
}
