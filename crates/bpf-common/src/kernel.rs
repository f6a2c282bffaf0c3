//! [`Kernel`] implementation backed by aya.
use std::{borrow::Cow, collections::HashSet, path::Path};

use aya::{
    Ebpf, EbpfLoader,
    maps::RingBuf,
    programs::{KProbe, Program, SocketFilter, UProbe},
};
use nix::sys::socket::{AddressFamily, SockFlag, SockProtocol, SockType, socket};

use crate::{
    bpf_fs::{self, BpfFsError},
    bump_memlock_rlimit,
    events::{EventSource, RingBufSource},
    platform,
    program::{Closer, Collection, CollectionSpec, Kernel, ProgramError},
};

/// The running Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct AyaKernel;

impl Kernel for AyaKernel {
    fn remove_memlock(&self) -> anyhow::Result<()> {
        bump_memlock_rlimit()
    }

    fn mount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError> {
        bpf_fs::mount_bpf_fs(path)
    }

    fn unmount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError> {
        bpf_fs::unmount_bpf_fs(path)
    }

    fn load(
        &self,
        spec: &CollectionSpec,
        pin_path: &Path,
    ) -> Result<Box<dyn Collection>, ProgramError> {
        let values: Vec<(&str, Vec<u8>)> = spec
            .constants()
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_ne_bytes()))
            .collect();
        let mut loader = EbpfLoader::new();
        loader.map_pin_path(pin_path);
        for (name, value) in &values {
            loader.set_global(*name, value.as_slice(), true);
        }
        let mut bpf = loader
            .load(spec.bytes())
            .map_err(|err| ProgramError::LoadingObject {
                name: spec.name().to_string(),
                source: Box::new(err),
            })?;

        for (name, program) in bpf.programs_mut() {
            let result = match program {
                Program::KProbe(program) => program.load(),
                Program::UProbe(program) => program.load(),
                Program::SocketFilter(program) => program.load(),
                _ => return Err(ProgramError::ProgramTypeError(name.to_string())),
            };
            result.map_err(|err| load_error(name, err))?;
        }

        Ok(Box::new(AyaCollection {
            bpf,
            used_maps: Default::default(),
        }))
    }
}

fn load_error(program: &str, err: aya::programs::ProgramError) -> ProgramError {
    let verifier_log = match &err {
        aya::programs::ProgramError::LoadError { verifier_log, .. } => {
            Some(verifier_log.to_string())
        }
        _ => None,
    };
    ProgramError::ProgramLoadError {
        program: program.to_string(),
        verifier_log,
        program_error: Box::new(err),
    }
}

fn attach_error(program: &str, target: &str) -> impl FnOnce(aya::programs::ProgramError) -> ProgramError {
    let program = program.to_string();
    let target = target.to_string();
    move |err| ProgramError::ProgramAttachError {
        program,
        target,
        program_error: Box::new(err),
    }
}

/// Loaded aya object. Links are owned by the programs, so they are detached
/// when this is dropped.
pub struct AyaCollection {
    bpf: Ebpf,
    used_maps: HashSet<String>,
}

impl Collection for AyaCollection {
    fn attach_uprobe(
        &mut self,
        program: &str,
        target: &Path,
        offset: u64,
    ) -> Result<(), ProgramError> {
        let uprobe: &mut UProbe = extract_program(&mut self.bpf, program)?;
        uprobe
            .attach(None, offset, target, None)
            .map_err(attach_error(program, &format!("{}+{offset:#x}", target.display())))?;
        Ok(())
    }

    fn attach_kprobe(&mut self, program: &str, symbol: &str) -> Result<(), ProgramError> {
        let symbol = kernel_symbol(symbol);
        let kprobe: &mut KProbe = extract_program(&mut self.bpf, program)?;
        kprobe
            .attach(&*symbol, 0)
            .map_err(attach_error(program, &symbol))?;
        Ok(())
    }

    fn attach_socket_filter(&mut self, program: &str) -> Result<Box<dyn Closer>, ProgramError> {
        let sock = socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )
        .map_err(|err| ProgramError::Socket {
            program: program.to_string(),
            source: err.into(),
        })?;
        let filter: &mut SocketFilter = extract_program(&mut self.bpf, program)?;
        filter
            .attach(&sock)
            .map_err(attach_error(program, "raw socket"))?;
        Ok(Box::new(sock))
    }

    fn ring_buffer(&mut self, map: &str) -> Result<Box<dyn EventSource>, ProgramError> {
        if self.used_maps.contains(map) {
            return Err(ProgramError::MapAlreadyUsed(map.to_string()));
        }
        let map_resource = self
            .bpf
            .take_map(map)
            .ok_or_else(|| ProgramError::MapNotFound(map.to_string()))?;
        self.used_maps.insert(map.to_string());
        let ring_buf = RingBuf::try_from(map_resource)?;
        Ok(Box::new(RingBufSource::new(ring_buf)?))
    }
}

/// Syscall entry points are exported with an architecture specific prefix.
fn kernel_symbol(symbol: &str) -> Cow<'_, str> {
    if symbol.starts_with("sys_") {
        Cow::Owned(format!("{}{symbol}", platform::SYSCALL_PREFIX))
    } else {
        Cow::Borrowed(symbol)
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_symbols_are_prefixed() {
        assert_eq!(
            kernel_symbol("sys_accept4"),
            format!("{}sys_accept4", platform::SYSCALL_PREFIX)
        );
        assert_eq!(kernel_symbol("tcp_sendmsg"), "tcp_sendmsg");
    }
}
