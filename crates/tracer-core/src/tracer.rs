use async_trait::async_trait;
use bpf_common::{
    Closer, Collection, CollectionSpec, Constants, EventSource, ProgramError, log_error,
};

use crate::{
    exec::ExecutableInfo, goexec::OffsetTable, output::OutputQueue, shutdown::ShutdownSignal,
};

/// eBPF programs to attach to a function. `start` runs at the function entry
/// and `end` when it returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionPrograms {
    /// The owning tracer is useless if the function is missing.
    pub required: bool,
    pub start: Option<&'static str>,
    pub end: Option<&'static str>,
}

impl FunctionPrograms {
    pub fn required(start: &'static str, end: &'static str) -> Self {
        Self {
            required: true,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn optional(start: &'static str, end: &'static str) -> Self {
        Self {
            required: false,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn start(mut self, start: &'static str) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: &'static str) -> Self {
        self.end = Some(end);
        self
    }
}

/// Function or kernel symbol name to programs, in attach order.
pub type ProbeMap = Vec<(&'static str, FunctionPrograms)>;

/// Kernel objects owned by a tracer once it has been attached.
#[derive(Default)]
pub struct ObjectSink {
    collection: Option<Box<dyn Collection>>,
    closers: Vec<Box<dyn Closer>>,
}

impl ObjectSink {
    pub fn assign(&mut self, collection: Box<dyn Collection>) {
        self.collection = Some(collection);
    }

    pub fn is_loaded(&self) -> bool {
        self.collection.is_some()
    }

    pub fn add_closers(&mut self, closers: impl IntoIterator<Item = Box<dyn Closer>>) {
        self.closers.extend(closers);
    }

    /// Take the ring buffer `map` out of the loaded collection.
    pub fn ring_buffer(&mut self, map: &str) -> Result<Box<dyn EventSource>, ProgramError> {
        self.collection
            .as_mut()
            .ok_or_else(|| ProgramError::MapNotFound(map.to_string()))?
            .ring_buffer(map)
    }

    /// Release closers, then detach every program.
    pub fn close(self, tracer: &str) {
        for closer in self.closers {
            if let Err(err) = closer.close() {
                log_error(&format!("[{tracer}] closing resource"), err);
            }
        }
        drop(self.collection);
        log::debug!("[{tracer}] kernel objects released");
    }
}

/// An instrumentation module: an eBPF object with the probes it needs and
/// the loop reading its events.
#[async_trait]
pub trait Tracer: Send {
    fn name(&self) -> &'static str;

    /// Read the eBPF object of this tracer.
    fn load(&self) -> Result<CollectionSpec, ProgramError>;

    /// Values of the object global constants for the given target. Must not
    /// have side effects.
    fn constants(&self, exe: &ExecutableInfo, offsets: Option<&OffsetTable>) -> Constants;

    /// Receives the loaded kernel objects.
    fn object_sink(&mut self) -> &mut ObjectSink;

    /// Go functions to instrument with uprobes.
    fn go_probes(&self) -> ProbeMap {
        Vec::new()
    }

    /// Kernel functions to instrument. `start` is a kprobe and `end` a
    /// kretprobe.
    fn kprobes(&self) -> ProbeMap {
        Vec::new()
    }

    /// Programs to attach as socket filters.
    fn socket_filters(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Resources to release when `run` ends.
    fn add_closer(&mut self, closers: Vec<Box<dyn Closer>>) {
        self.object_sink().add_closers(closers);
    }

    /// Forward events to `output` until `shutdown` is received.
    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue);
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct CountingCloser(Arc<AtomicUsize>);

    impl Closer for CountingCloser {
        fn close(self: Box<Self>) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::other("already closed"))
        }
    }

    #[test]
    fn close_runs_every_closer() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut sink = ObjectSink::default();
        sink.add_closers([
            Box::new(CountingCloser(closed.clone())) as Box<dyn Closer>,
            Box::new(CountingCloser(closed.clone())),
        ]);
        assert!(!sink.is_loaded());
        assert!(matches!(
            sink.ring_buffer("events"),
            Err(ProgramError::MapNotFound(_))
        ));
        sink.close("test");
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn function_programs_builders() {
        let programs = FunctionPrograms::default().start("uprobe_start");
        assert!(!programs.required);
        assert_eq!(programs.start, Some("uprobe_start"));
        assert_eq!(programs.end, None);
        assert!(FunctionPrograms::required("a", "b").required);
    }
}
