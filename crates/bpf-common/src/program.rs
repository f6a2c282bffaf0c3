//! Kernel-facing contract used by the tracers:
//! - [`CollectionSpec`] is a compiled eBPF object which hasn't been loaded yet,
//!   together with the constants which will be rewritten at load time.
//! - [`Kernel`] loads a spec, returning a [`Collection`] to attach programs from.
//!
//! The production implementation lives in [`crate::kernel`], built on top of aya.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    io,
    os::fd::{IntoRawFd, OwnedFd},
    path::Path,
};

use elf::{ElfBytes, abi::STT_OBJECT, endian::AnyEndian};
use thiserror::Error;

use crate::{bpf_fs::BpfFsError, events::EventSource};

/// Sections holding the global variables which can be rewritten before load.
const DATA_SECTIONS: [&str; 3] = [".rodata", ".data", ".bss"];

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("reading eBPF object {path}")]
    ReadObject {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing eBPF object {name}")]
    Parse {
        name: String,
        #[source]
        source: elf::ParseError,
    },
    #[error("constant {constant} is not defined in eBPF object {name}")]
    UnknownConstant { name: String, constant: String },
    #[error("loading eBPF object {name}")]
    LoadingObject {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        /// Output of the kernel verifier, when the program was rejected by it.
        verifier_log: Option<String>,
        #[source]
        program_error: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed program attach {program} to {target}")]
    ProgramAttachError {
        program: String,
        target: String,
        #[source]
        program_error: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("opening socket for filter {program}")]
    Socket {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    MapError(#[from] aya::maps::MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("reading ring buffer")]
    RingBuffer(#[source] io::Error),
}

impl ProgramError {
    /// Returns the kernel verifier output if this error is a verifier rejection.
    pub fn verifier_log(&self) -> Option<&str> {
        match self {
            ProgramError::ProgramLoadError {
                verifier_log: Some(log),
                ..
            } => Some(log),
            _ => None,
        }
    }
}

/// Value of a global constant to be rewritten into an eBPF object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
}

impl ConstValue {
    /// Memory representation, as the eBPF program will read it.
    pub fn to_ne_bytes(self) -> Vec<u8> {
        match self {
            ConstValue::Bool(v) => vec![v as u8],
            ConstValue::U8(v) => vec![v],
            ConstValue::U16(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U32(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U64(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I32(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I64(v) => v.to_ne_bytes().to_vec(),
        }
    }
}

macro_rules! const_value_from {
    ($($ty:ty => $variant:ident),*) => {
        $(impl From<$ty> for ConstValue {
            fn from(value: $ty) -> Self {
                ConstValue::$variant(value)
            }
        })*
    };
}

const_value_from!(bool => Bool, u8 => U8, u16 => U16, u32 => U32, u64 => U64, i32 => I32, i64 => I64);

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(v) => write!(f, "{v}"),
            ConstValue::U8(v) => write!(f, "{v}"),
            ConstValue::U16(v) => write!(f, "{v}"),
            ConstValue::U32(v) => write!(f, "{v}"),
            ConstValue::U64(v) => write!(f, "{v}"),
            ConstValue::I32(v) => write!(f, "{v}"),
            ConstValue::I64(v) => write!(f, "{v}"),
        }
    }
}

/// Constant name to value.
pub type Constants = HashMap<String, ConstValue>;

/// An eBPF object which has been read and parsed, but not loaded into the kernel.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    name: String,
    bytes: Vec<u8>,
    globals: HashSet<String>,
    constants: Constants,
}

impl CollectionSpec {
    /// Builds a spec from already known parts. `globals` lists the names which
    /// [`CollectionSpec::rewrite_constants`] will accept.
    pub fn new<I, S>(name: &str, bytes: Vec<u8>, globals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            bytes,
            globals: globals.into_iter().map(Into::into).collect(),
            constants: Constants::new(),
        }
    }

    /// Parse an ELF eBPF object, collecting the global variables it declares.
    pub fn from_elf(name: &str, bytes: Vec<u8>) -> Result<Self, ProgramError> {
        let globals = global_symbols(&bytes).map_err(|source| ProgramError::Parse {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            bytes,
            globals,
            constants: Constants::new(),
        })
    }

    /// Read and parse an ELF eBPF object from disk.
    pub fn read(name: &str, path: &Path) -> Result<Self, ProgramError> {
        let bytes = std::fs::read(path).map_err(|source| ProgramError::ReadObject {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_elf(name, bytes)
    }

    /// Set the values of global constants. No kernel interaction happens here:
    /// the values are written by the loader.
    pub fn rewrite_constants(&mut self, constants: Constants) -> Result<(), ProgramError> {
        if let Some(unknown) = constants.keys().find(|c| !self.globals.contains(*c)) {
            return Err(ProgramError::UnknownConstant {
                name: self.name.clone(),
                constant: unknown.clone(),
            });
        }
        self.constants.extend(constants);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }
}

fn global_symbols(bytes: &[u8]) -> Result<HashSet<String>, elf::ParseError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
    let mut globals = HashSet::new();
    let (Some(shdrs), Some(shstrtab)) = file.section_headers_with_strtab()? else {
        return Ok(globals);
    };
    let Some((symtab, strtab)) = file.symbol_table()? else {
        return Ok(globals);
    };
    for sym in symtab.iter() {
        if sym.st_symtype() != STT_OBJECT || sym.is_undefined() {
            continue;
        }
        let section = shdrs.get(sym.st_shndx as usize)?;
        let section_name = shstrtab.get(section.sh_name as usize)?;
        if DATA_SECTIONS.iter().any(|s| section_name.starts_with(s)) {
            globals.insert(strtab.get(sym.st_name as usize)?.to_string());
        }
    }
    Ok(globals)
}

/// A resource which must be released when its owner stops.
pub trait Closer: Send {
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl Closer for OwnedFd {
    fn close(self: Box<Self>) -> io::Result<()> {
        nix::unistd::close(self.into_raw_fd()).map_err(io::Error::from)
    }
}

/// Operations the agent needs from the running kernel.
pub trait Kernel: Send + Sync {
    /// Allow locking enough memory for eBPF maps on old kernels.
    fn remove_memlock(&self) -> anyhow::Result<()>;

    /// Mount a BPF file system on `path`, which must exist.
    fn mount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError>;

    /// Forcefully unmount the BPF file system mounted on `path`.
    fn unmount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError>;

    /// Load maps and programs of `spec`, pinning maps under `pin_path`.
    fn load(&self, spec: &CollectionSpec, pin_path: &Path)
    -> Result<Box<dyn Collection>, ProgramError>;
}

/// Programs and maps loaded into the kernel. Dropping it detaches every
/// program attached through it.
pub trait Collection: Send {
    /// Attach `program` at file `offset` of the `target` executable.
    fn attach_uprobe(&mut self, program: &str, target: &Path, offset: u64)
    -> Result<(), ProgramError>;

    /// Attach `program` to the kernel function `symbol`.
    fn attach_kprobe(&mut self, program: &str, symbol: &str) -> Result<(), ProgramError>;

    /// Attach `program` as filter of a new raw socket. The socket is returned
    /// and must be kept open as long as the filter is needed.
    fn attach_socket_filter(&mut self, program: &str) -> Result<Box<dyn Closer>, ProgramError>;

    /// Take a BPF_MAP_TYPE_RINGBUF map to read events from.
    fn ring_buffer(&mut self, map: &str) -> Result<Box<dyn EventSource>, ProgramError>;
}
