//! In-memory implementations of the kernel and process boundaries, used to
//! test tracers and the setup pipeline without privileges.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bpf_common::{
    Closer, Collection, CollectionSpec, ConstValue, Constants, EventSource, Kernel, Pid,
    ProgramError, bpf_fs::BpfFsError,
};
use bytes::Bytes;

use crate::{
    error::{InspectionError, ResolutionError},
    exec::{Criteria, ExecutableInfo, ProcessFinder},
    goexec::{FuncOffsets, Inspection, OffsetInspector, OffsetTable},
    output::{OutputQueue, Record},
    shutdown::ShutdownSignal,
    tracer::{FunctionPrograms, ObjectSink, ProbeMap, Tracer},
};

/// Creates an empty directory unique to this call.
pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "autoinstrument_{prefix}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).expect("creating test directory");
    path
}

/// Offset table holding `functions`, each with one return site.
pub fn offsets(functions: &[&str]) -> OffsetTable {
    let funcs = functions
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let start = 0x1000 + 0x100 * i as u64;
            (
                name.to_string(),
                FuncOffsets {
                    start,
                    returns: vec![start + 0x40],
                },
            )
        })
        .collect();
    OffsetTable {
        funcs,
        fields: HashMap::new(),
    }
}

/// Step at which [`FakeKernel`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Memlock,
    Mount,
    Unmount,
    /// Loading the object with this name is rejected by the verifier.
    KernelLoad(&'static str),
    /// Attaching the program with this name fails.
    Attach(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Uprobe {
        program: String,
        target: PathBuf,
        offset: u64,
    },
    Kprobe {
        program: String,
        symbol: String,
    },
    SocketFilter {
        program: String,
    },
}

#[derive(Debug, Default)]
pub struct FakeKernelState {
    pub mounted: HashSet<PathBuf>,
    pub unmounts: usize,
    /// Object name, constants and pin path of every successful load.
    pub loads: Vec<(String, Constants, PathBuf)>,
    pub attachments: Vec<Attachment>,
    /// Programs currently attached, including socket filters.
    pub live: usize,
    /// Records returned by ring buffers, by map name.
    pub ring_events: HashMap<String, Vec<Vec<Bytes>>>,
    pub fail: Option<FailAt>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeKernelState>>,
}

impl FakeKernel {
    pub fn failing(fail: FailAt) -> Self {
        let kernel = Self::default();
        kernel.state().fail = Some(fail);
        kernel
    }

    pub fn arc(&self) -> Arc<dyn Kernel> {
        Arc::new(self.clone())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeKernelState> {
        self.state.lock().expect("fake kernel lock poisoned")
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state().mounted.contains(path)
    }

    pub fn live_attachments(&self) -> usize {
        self.state().live
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.state().attachments.clone()
    }

    /// Records to be returned by the ring buffer `map`.
    pub fn push_ring_events(&self, map: &str, records: Vec<Bytes>) {
        self.state()
            .ring_events
            .entry(map.to_string())
            .or_default()
            .push(records);
    }

    /// A loaded collection which didn't go through [`Kernel::load`].
    pub fn collection(&self, name: &str) -> Box<dyn Collection> {
        Box::new(FakeCollection {
            state: self.state.clone(),
            name: name.to_string(),
            attached: 0,
        })
    }

    fn fails_at(&self, step: FailAt) -> bool {
        self.state().fail == Some(step)
    }
}

impl Kernel for FakeKernel {
    fn remove_memlock(&self) -> anyhow::Result<()> {
        if self.fails_at(FailAt::Memlock) {
            anyhow::bail!("operation not permitted");
        }
        Ok(())
    }

    fn mount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError> {
        if self.fails_at(FailAt::Mount) {
            return Err(BpfFsError::Mount {
                path: path.display().to_string(),
                source: std::io::Error::other("permission denied"),
            });
        }
        self.state().mounted.insert(path.to_path_buf());
        Ok(())
    }

    fn unmount_bpf_fs(&self, path: &Path) -> Result<(), BpfFsError> {
        let mut state = self.state();
        state.unmounts += 1;
        if state.fail == Some(FailAt::Unmount) || !state.mounted.remove(path) {
            return Err(BpfFsError::Unmount {
                path: path.display().to_string(),
                source: std::io::Error::other("not mounted"),
            });
        }
        Ok(())
    }

    fn load(
        &self,
        spec: &CollectionSpec,
        pin_path: &Path,
    ) -> Result<Box<dyn Collection>, ProgramError> {
        let rejected = matches!(self.state().fail, Some(FailAt::KernelLoad(name)) if name == spec.name());
        if rejected {
            return Err(ProgramError::ProgramLoadError {
                program: format!("{}_prog", spec.name()),
                verifier_log: Some("R2 min value is negative".to_string()),
                program_error: "permission denied".into(),
            });
        }
        self.state().loads.push((
            spec.name().to_string(),
            spec.constants().clone(),
            pin_path.to_path_buf(),
        ));
        Ok(self.collection(spec.name()))
    }
}

struct FakeCollection {
    state: Arc<Mutex<FakeKernelState>>,
    name: String,
    attached: usize,
}

impl FakeCollection {
    fn attach(&mut self, program: &str, attachment: Attachment) -> Result<(), ProgramError> {
        let mut state = self.state.lock().expect("fake kernel lock poisoned");
        if matches!(state.fail, Some(FailAt::Attach(name)) if name == program) {
            return Err(ProgramError::ProgramAttachError {
                program: program.to_string(),
                target: self.name.clone(),
                program_error: "no such symbol".into(),
            });
        }
        state.attachments.push(attachment);
        state.live += 1;
        self.attached += 1;
        Ok(())
    }
}

impl Collection for FakeCollection {
    fn attach_uprobe(
        &mut self,
        program: &str,
        target: &Path,
        offset: u64,
    ) -> Result<(), ProgramError> {
        let attachment = Attachment::Uprobe {
            program: program.to_string(),
            target: target.to_path_buf(),
            offset,
        };
        self.attach(program, attachment)
    }

    fn attach_kprobe(&mut self, program: &str, symbol: &str) -> Result<(), ProgramError> {
        let attachment = Attachment::Kprobe {
            program: program.to_string(),
            symbol: symbol.to_string(),
        };
        self.attach(program, attachment)
    }

    fn attach_socket_filter(&mut self, program: &str) -> Result<Box<dyn Closer>, ProgramError> {
        let attachment = Attachment::SocketFilter {
            program: program.to_string(),
        };
        self.attach(program, attachment)?;
        // The socket owns the filter attachment from now on.
        self.attached -= 1;
        Ok(Box::new(FakeSocket {
            state: self.state.clone(),
        }))
    }

    fn ring_buffer(&mut self, map: &str) -> Result<Box<dyn EventSource>, ProgramError> {
        let mut state = self.state.lock().expect("fake kernel lock poisoned");
        let batches = state
            .ring_events
            .remove(map)
            .ok_or_else(|| ProgramError::MapNotFound(map.to_string()))?;
        Ok(Box::new(FakeEventSource::new(batches.into_iter().map(Ok))))
    }
}

impl Drop for FakeCollection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.live -= self.attached;
        }
    }
}

struct FakeSocket {
    state: Arc<Mutex<FakeKernelState>>,
}

impl Closer for FakeSocket {
    fn close(self: Box<Self>) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.live -= 1;
        }
    }
}

/// Returns the queued results, then waits forever.
pub struct FakeEventSource {
    items: VecDeque<Result<Vec<Bytes>, ProgramError>>,
}

impl FakeEventSource {
    pub fn new(items: impl IntoIterator<Item = Result<Vec<Bytes>, ProgramError>>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn next_records(&mut self) -> Result<Vec<Bytes>, ProgramError> {
        match self.items.pop_front() {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

/// Returns the first candidate which isn't excluded, whatever the criteria.
#[derive(Default)]
pub struct FakeFinder {
    candidates: Vec<ExecutableInfo>,
    history: Mutex<Vec<Vec<i32>>>,
}

impl FakeFinder {
    pub fn new(candidates: impl IntoIterator<Item = ExecutableInfo>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
            history: Mutex::default(),
        }
    }

    /// Sorted excluded pids of every lookup.
    pub fn excluded_history(&self) -> Vec<Vec<i32>> {
        self.history.lock().expect("lock poisoned").clone()
    }
}

impl ProcessFinder for FakeFinder {
    fn find(
        &self,
        _criteria: &Criteria,
        excluded: &HashSet<Pid>,
    ) -> Result<Option<ExecutableInfo>, ResolutionError> {
        let mut pids: Vec<i32> = excluded.iter().map(|pid| pid.as_raw()).collect();
        pids.sort_unstable();
        self.history.lock().expect("lock poisoned").push(pids);
        Ok(self
            .candidates
            .iter()
            .find(|exe| !excluded.contains(&exe.pid))
            .cloned())
    }
}

/// Returns the offset table registered for a pid, or "not applicable".
#[derive(Default)]
pub struct FakeInspector {
    tables: HashMap<Pid, OffsetTable>,
    fail: bool,
    requests: Mutex<Vec<Vec<String>>>,
}

impl FakeInspector {
    pub fn with(mut self, pid: i32, offsets: OffsetTable) -> Self {
        self.tables.insert(Pid::from_raw(pid), offsets);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Requested function names of every inspection.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().expect("lock poisoned").clone()
    }
}

impl OffsetInspector for FakeInspector {
    fn inspect(
        &self,
        exe: &ExecutableInfo,
        functions: &[String],
    ) -> Result<Inspection, InspectionError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push(functions.to_vec());
        if self.fail {
            return Err(InspectionError::Read {
                path: exe.exe_path.display().to_string(),
                source: std::io::Error::other("input/output error"),
            });
        }
        Ok(match self.tables.get(&exe.pid) {
            Some(offsets) => Inspection::Found(offsets.clone()),
            None => Inspection::NotApplicable("not a Go executable".to_string()),
        })
    }
}

/// A tracer with configurable probes. Its `run` sends one batch of `events`,
/// then waits for shutdown.
pub struct FakeTracer {
    name: &'static str,
    go_probes: ProbeMap,
    kprobes: ProbeMap,
    socket_filters: Vec<&'static str>,
    globals: Vec<String>,
    constants: Constants,
    fail_load: bool,
    events: Vec<Bytes>,
    sink: ObjectSink,
}

impl FakeTracer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            go_probes: Vec::new(),
            kprobes: Vec::new(),
            socket_filters: Vec::new(),
            globals: Vec::new(),
            constants: Constants::new(),
            fail_load: false,
            events: Vec::new(),
            sink: ObjectSink::default(),
        }
    }

    pub fn go_probe(mut self, function: &'static str, programs: FunctionPrograms) -> Self {
        self.go_probes.push((function, programs));
        self
    }

    pub fn kprobe(mut self, symbol: &'static str, programs: FunctionPrograms) -> Self {
        self.kprobes.push((symbol, programs));
        self
    }

    pub fn socket_filter(mut self, program: &'static str) -> Self {
        self.socket_filters.push(program);
        self
    }

    /// A constant declared by the object.
    pub fn constant(mut self, name: &str, value: impl Into<ConstValue>) -> Self {
        self.globals.push(name.to_string());
        self.constants.insert(name.to_string(), value.into());
        self
    }

    /// A constant the object doesn't declare, which makes rewriting fail.
    pub fn unknown_constant(mut self, name: &str) -> Self {
        self.constants.insert(name.to_string(), ConstValue::U64(0));
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn event(mut self, payload: &'static [u8]) -> Self {
        self.events.push(Bytes::from_static(payload));
        self
    }
}

#[async_trait]
impl Tracer for FakeTracer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn load(&self) -> Result<CollectionSpec, ProgramError> {
        if self.fail_load {
            return Err(ProgramError::ReadObject {
                path: format!("{}.bpf.o", self.name),
                source: std::io::Error::other("no such file or directory"),
            });
        }
        Ok(CollectionSpec::new(self.name, Vec::new(), self.globals.clone()))
    }

    fn constants(&self, _exe: &ExecutableInfo, _offsets: Option<&OffsetTable>) -> Constants {
        self.constants.clone()
    }

    fn object_sink(&mut self) -> &mut ObjectSink {
        &mut self.sink
    }

    fn go_probes(&self) -> ProbeMap {
        self.go_probes.clone()
    }

    fn kprobes(&self) -> ProbeMap {
        self.kprobes.clone()
    }

    fn socket_filters(&self) -> Vec<&'static str> {
        self.socket_filters.clone()
    }

    async fn run(self: Box<Self>, mut shutdown: ShutdownSignal, output: OutputQueue) {
        let batch = self
            .events
            .iter()
            .map(|payload| Record {
                tracer: self.name,
                payload: payload.clone(),
            })
            .collect();
        let _ = output.send(batch).await;
        shutdown.recv().await;
        let name = self.name;
        self.sink.close(name);
    }
}
