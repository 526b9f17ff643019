//! Worker descriptors: the entry point contract and its validated binding.

use std::fmt;
use std::sync::Arc;

use crate::channel::{AnyHandle, ChannelError, PortRef};
use crate::exit::{ExitHandle, ExitSignal};
use crate::ipc::shmem::ShmError;
use crate::trace::warn;
use crate::wire::{Message, MessageType};

use super::ports::{PortError, PortSide, Ports};

/// Failure reported by a worker entry point.
///
/// Returning one makes the worker log it, raise the exit signal and exit
/// with [`EXIT_FAILED`](super::EXIT_FAILED).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WorkerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Result of a worker entry point.
pub type WorkerResult = Result<(), WorkerError>;

type Body<A> = dyn Fn(&A, &Ports, &ExitHandle) -> WorkerResult + Send + Sync;

/// A worker's code plus the message types of its ports.
///
/// The body receives, in order, the fixed arguments, the positional ports
/// (inputs then outputs) and the exit handle. It must poll
/// [`ExitHandle::is_raised`] and use only timeout-bounded channel calls.
///
/// ```no_run
/// use std::time::Duration;
/// use flightdeck::worker::{EntryPoint, WorkerResult};
///
/// let doubler = EntryPoint::new("doubler", |_: &(), ports, exit| -> WorkerResult {
///     let input = ports.input::<u64>(0)?;
///     let output = ports.output::<u64>(0)?;
///     while !exit.is_raised() {
///         if let Ok(n) = input.get(Duration::from_millis(100)) {
///             let _ = output.put(&(n * 2), Duration::from_millis(100));
///         }
///     }
///     Ok(())
/// })
/// .input::<u64>()
/// .output::<u64>();
/// ```
pub struct EntryPoint<A> {
    name: String,
    inputs: Vec<MessageType>,
    outputs: Vec<MessageType>,
    body: Arc<Body<A>>,
}

impl<A> Clone for EntryPoint<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl<A> EntryPoint<A> {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&A, &Ports, &ExitHandle) -> WorkerResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Declares the next input port as carrying `T`.
    #[must_use]
    pub fn input<T: Message>(mut self) -> Self {
        self.inputs.push(MessageType::of::<T>());
        self
    }

    /// Declares the next output port as carrying `T`.
    #[must_use]
    pub fn output<T: Message>(mut self) -> Self {
        self.outputs.push(MessageType::of::<T>());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, args: &A, ports: &Ports, exit: &ExitHandle) -> WorkerResult {
        (self.body)(args, ports, exit)
    }
}

impl<A> fmt::Debug for EntryPoint<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Why a [`WorkerSpec`] was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("worker `{worker}`: count must be at least 1")]
    ZeroCount { worker: String },
    #[error("worker `{worker}`: entry point declares {declared} {side} port(s), {bound} bound")]
    ArityMismatch {
        worker: String,
        side: PortSide,
        declared: usize,
        bound: usize,
    },
    #[error("worker `{worker}`: {side} port {index} expects {declared}, channel `{channel}` carries {carries}")]
    PortTypeMismatch {
        worker: String,
        side: PortSide,
        index: usize,
        declared: String,
        channel: String,
        carries: String,
    },
    #[error("worker `{worker}`: channel `{channel}` is both an input and an output")]
    Cycle { worker: String, channel: String },
    #[error("worker `{worker}`: cannot open channel `{channel}`: {source}")]
    Channel {
        worker: String,
        channel: String,
        #[source]
        source: ChannelError,
    },
    #[error("worker `{worker}`: cannot open exit signal: {source}")]
    Exit {
        worker: String,
        #[source]
        source: ShmError,
    },
}

/// A validated worker group: `count` processes running one entry point with
/// the same arguments and channels.
///
/// Construction is the only validation point; a `WorkerSpec` is immutable
/// and consumed by exactly one [`WorkerPool`](super::WorkerPool).
pub struct WorkerSpec<A> {
    count: usize,
    entry: EntryPoint<A>,
    args: A,
    inputs: Vec<PortRef>,
    outputs: Vec<PortRef>,
    ports: Ports,
    exit: ExitHandle,
}

impl<A> WorkerSpec<A> {
    /// Validates and binds a worker group.
    ///
    /// Checks that `count >= 1`, that the channel lists match the entry
    /// point's declared ports in length and message type, and that no channel
    /// is both an input and an output. Then maps every channel and the exit
    /// flag so forked workers inherit the mappings. Nothing is spawned.
    ///
    /// # Errors
    ///
    /// The first rule broken, as a [`SpecError`]. A warning is logged too.
    pub fn create(
        count: usize,
        entry: EntryPoint<A>,
        args: A,
        inputs: &[PortRef],
        outputs: &[PortRef],
        exit: &ExitSignal,
    ) -> Result<Self, SpecError> {
        let bound = validate(count, &entry, inputs, outputs).and_then(|()| {
            let open = |port: &PortRef| {
                AnyHandle::open(port).map_err(|source| SpecError::Channel {
                    worker: entry.name.clone(),
                    channel: port.name().to_string(),
                    source,
                })
            };
            let input_handles = inputs.iter().map(open).collect::<Result<Vec<_>, _>>()?;
            let output_handles = outputs.iter().map(open).collect::<Result<Vec<_>, _>>()?;
            let exit = exit.handle().map_err(|source| SpecError::Exit {
                worker: entry.name.clone(),
                source,
            })?;
            Ok((input_handles, output_handles, exit))
        });

        let (input_handles, output_handles, exit) = bound.inspect_err(|err| {
            warn!(worker = entry.name(), error = %err, "worker spec rejected");
        })?;

        Ok(Self {
            count,
            ports: Ports::new(entry.name.clone(), input_handles, output_handles),
            entry,
            args,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            exit,
        })
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    #[must_use]
    pub fn inputs(&self) -> &[PortRef] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[PortRef] {
        &self.outputs
    }

    pub(crate) fn run(&self) -> WorkerResult {
        self.entry.call(&self.args, &self.ports, &self.exit)
    }

    pub(crate) fn exit(&self) -> &ExitHandle {
        &self.exit
    }

    /// Re-runs the structural checks of [`WorkerSpec::create`].
    pub(crate) fn revalidate(&self) -> Result<(), SpecError> {
        validate(self.count, &self.entry, &self.inputs, &self.outputs)
    }
}

impl<A> fmt::Debug for WorkerSpec<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name())
            .field("count", &self.count)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Structural checks that need no shared memory.
fn validate<A>(
    count: usize,
    entry: &EntryPoint<A>,
    inputs: &[PortRef],
    outputs: &[PortRef],
) -> Result<(), SpecError> {
    let worker = || entry.name.clone();

    if count == 0 {
        return Err(SpecError::ZeroCount { worker: worker() });
    }

    for (side, declared, bound) in [
        (PortSide::Input, &entry.inputs, inputs),
        (PortSide::Output, &entry.outputs, outputs),
    ] {
        if declared.len() != bound.len() {
            return Err(SpecError::ArityMismatch {
                worker: worker(),
                side,
                declared: declared.len(),
                bound: bound.len(),
            });
        }
        for (index, (want, port)) in declared.iter().zip(bound).enumerate() {
            if want.hash() != port.message().hash() {
                return Err(SpecError::PortTypeMismatch {
                    worker: worker(),
                    side,
                    index,
                    declared: want.name().to_string(),
                    channel: port.name().to_string(),
                    carries: port.message().name().to_string(),
                });
            }
        }
    }

    if let Some(port) = inputs.iter().find(|i| outputs.iter().any(|o| o.path() == i.path())) {
        return Err(SpecError::Cycle {
            worker: worker(),
            channel: port.name().to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BoundedChannel, ChannelOptions};

    fn options() -> ChannelOptions {
        ChannelOptions {
            shm_prefix: "flightdeck-test".to_string(),
            ..ChannelOptions::default()
        }
    }

    fn exit() -> ExitSignal {
        ExitSignal::create("flightdeck-test").unwrap()
    }

    fn relay() -> EntryPoint<()> {
        EntryPoint::new("relay", |_: &(), _, _| Ok(()))
            .input::<String>()
            .output::<String>()
    }

    #[test]
    fn test_zero_count_rejected() {
        let a = BoundedChannel::<String>::create("a", 1, &options()).unwrap();
        let b = BoundedChannel::<String>::create("b", 1, &options()).unwrap();
        let result = WorkerSpec::create(0, relay(), (), &[a.port()], &[b.port()], &exit());
        assert!(matches!(result, Err(SpecError::ZeroCount { worker }) if worker == "relay"));
    }

    #[test]
    fn test_valid_spec_binds_ports() {
        let a = BoundedChannel::<String>::create("a", 1, &options()).unwrap();
        let b = BoundedChannel::<String>::create("b", 1, &options()).unwrap();
        let spec = WorkerSpec::create(2, relay(), (), &[a.port()], &[b.port()], &exit()).unwrap();
        assert_eq!(spec.count(), 2);
        assert_eq!(spec.name(), "relay");
        assert_eq!(spec.inputs()[0].name(), "a");
        assert_eq!(spec.outputs()[0].name(), "b");
        assert_eq!(spec.ports.input_count(), 1);
        assert!(spec.ports.output::<String>(0).is_ok());
        assert!(matches!(spec.ports.output::<String>(1), Err(PortError::Missing { .. })));
    }

    #[test]
    fn test_arity_mismatch() {
        let a = BoundedChannel::<String>::create("a", 1, &options()).unwrap();
        let result = WorkerSpec::create(1, relay(), (), &[a.port()], &[], &exit());
        assert!(matches!(
            result,
            Err(SpecError::ArityMismatch { side: PortSide::Output, declared: 1, bound: 0, .. })
        ));
    }

    #[test]
    fn test_port_type_mismatch() {
        let a = BoundedChannel::<u32>::create("numbers", 1, &options()).unwrap();
        let b = BoundedChannel::<String>::create("b", 1, &options()).unwrap();
        let result = WorkerSpec::create(1, relay(), (), &[a.port()], &[b.port()], &exit());
        assert!(matches!(
            result,
            Err(SpecError::PortTypeMismatch { side: PortSide::Input, index: 0, channel, .. })
                if channel == "numbers"
        ));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let a = BoundedChannel::<String>::create("loop", 1, &options()).unwrap();
        let result = WorkerSpec::create(1, relay(), (), &[a.port()], &[a.port()], &exit());
        assert!(matches!(result, Err(SpecError::Cycle { channel, .. }) if channel == "loop"));
    }

    #[test]
    fn test_sources_and_sinks_have_empty_lists() {
        let source = EntryPoint::new("source", |_: &u8, _, _| Ok(())).output::<u64>();
        let out = BoundedChannel::<u64>::create("out", 0, &options()).unwrap();
        assert!(WorkerSpec::create(1, source, 7u8, &[], &[out.port()], &exit()).is_ok());

        let idle = EntryPoint::new("idle", |_: &(), _, _| Ok(()));
        assert!(WorkerSpec::create(1, idle, (), &[], &[], &exit()).is_ok());
    }

    #[test]
    fn test_run_invokes_body_with_args() {
        let entry = EntryPoint::new("echo", |n: &u32, _, _| {
            if *n == 3 {
                Ok(())
            } else {
                Err(WorkerError::failed(format!("got {n}")))
            }
        });
        let spec = WorkerSpec::create(1, entry, 3u32, &[], &[], &exit()).unwrap();
        assert!(spec.run().is_ok());
    }
}
