use std::fmt;
use std::time::Duration;

use crate::channel::{BoundedChannel, ChannelControl, ChannelError, PortRef};
use crate::exit::ExitSignal;
use crate::ipc::backoff::Deadline;
use crate::ipc::shmem::ShmError;
use crate::trace::{debug, error, info, warn};
use crate::wire::Message;
use crate::worker::{
    EntryPoint, ManagedPool, PoolError, PoolReport, PoolState, SpecError, WorkerPool, WorkerSpec,
};

use super::config::OrchestratorConfig;
use super::graph::{ChannelGraph, GraphError};

/// Errors from building or starting a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("channel `{0}` is already registered")]
    DuplicateChannel(String),
    #[error("cannot {op} while the pipeline is {phase}")]
    InvalidPhase { op: &'static str, phase: Phase },
    #[error("pool `{pool}` uses channel `{channel}`, which this pipeline did not create")]
    UnknownChannel { pool: String, channel: String },
    #[error("pool `{pool}` watches exit signal `{path}`, not this pipeline's")]
    ForeignExitSignal { pool: String, path: String },
    #[error("pool `{pool}` would close a cycle through {}", .channels.join(" -> "))]
    Cycle { pool: String, channels: Vec<String> },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("cannot create exit signal: {0}")]
    Shm(#[from] ShmError),
}

impl From<GraphError> for PipelineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::UnknownChannel { pool, channel } => Self::UnknownChannel { pool, channel },
            GraphError::Cycle { pool, channels } => Self::Cycle { pool, channels },
        }
    }
}

/// Where the pipeline is in its run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Channels and pools may be added.
    Building,
    /// Workers are running.
    Running,
    /// Shut down; [`Orchestrator::reset`] prepares another run.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// What a watch handler wants the supervisory loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An orchestrator-facing channel polled by [`Orchestrator::supervise`].
pub struct Watch<'a> {
    channel: String,
    poll: Box<dyn FnMut(Duration) -> Flow + 'a>,
}

impl<'a> Watch<'a> {
    /// Polls `channel` and hands every message to `on_message`.
    ///
    /// A timeout is "no message this tick". Undecodable messages are logged
    /// and skipped.
    pub fn new<T: Message>(
        channel: &BoundedChannel<T>,
        mut on_message: impl FnMut(T) -> Flow + 'a,
    ) -> Self {
        let channel = channel.clone();
        let name = channel.name().to_string();
        let poll = move |timeout: Duration| match channel.get(timeout) {
            Ok(msg) => on_message(msg),
            Err(ChannelError::Empty) => Flow::Continue,
            Err(err) => {
                warn!(channel = channel.name(), error = %err, "skipping unreadable message");
                Flow::Continue
            }
        };
        Self {
            channel: name,
            poll: Box::new(poll),
        }
    }

    /// Name of the watched channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn poll(&mut self, timeout: Duration) -> Flow {
        (self.poll)(timeout)
    }
}

impl fmt::Debug for Watch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").field("channel", &self.channel).finish_non_exhaustive()
    }
}

/// Why [`Orchestrator::supervise`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperviseOutcome {
    /// The configured run duration elapsed.
    DeadlineElapsed,
    /// A watch handler returned [`Flow::Stop`] for a message on `channel`.
    Terminated { channel: String },
    /// A worker raised the exit signal.
    ExitRaised,
}

/// Items discarded from one channel at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRecord {
    pub channel: String,
    pub discarded: usize,
}

/// Result of [`Orchestrator::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Channels in the order they were drained.
    pub drained: Vec<DrainRecord>,
    /// One report per pool that was running.
    pub pools: Vec<PoolReport>,
}

impl ShutdownReport {
    /// Whether every joined worker returned `Ok`.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.pools.iter().all(PoolReport::all_succeeded)
    }

    /// Total number of items discarded by the drain.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.drained.iter().map(|d| d.discarded).sum()
    }
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: SuperviseOutcome,
    pub shutdown: ShutdownReport,
}

/// Owns the channels, pools and exit signal of one pipeline.
///
/// Channels must be created before the pools that use them. Shutdown raises
/// the exit signal, drains every channel downstream first, then joins every
/// pool.
pub struct Orchestrator {
    config: OrchestratorConfig,
    exit: ExitSignal,
    /// Indexed by graph node id.
    channels: Vec<Box<dyn ChannelControl>>,
    graph: ChannelGraph,
    pools: Vec<Box<dyn ManagedPool>>,
    phase: Phase,
}

impl Orchestrator {
    /// Creates an empty pipeline and its exit signal.
    ///
    /// # Errors
    ///
    /// Fails if the exit signal's shared memory cannot be created.
    pub fn new(config: OrchestratorConfig) -> Result<Self, PipelineError> {
        let exit = ExitSignal::create(&config.shm_prefix)?;
        debug!(exit = %exit.path(), "orchestrator created");
        Ok(Self {
            config,
            exit,
            channels: Vec::new(),
            graph: ChannelGraph::new(),
            pools: Vec::new(),
            phase: Phase::Building,
        })
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn exit(&self) -> &ExitSignal {
        &self.exit
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Creates and registers a channel. The returned value shares the queue
    /// with the orchestrator; keep it to watch the channel or to get its
    /// [`PortRef`].
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateChannel`] if `name` is taken, or the
    /// channel cannot be created.
    pub fn channel<T: Message>(
        &mut self,
        name: &str,
        capacity: i64,
    ) -> Result<BoundedChannel<T>, PipelineError> {
        self.expect_phase(Phase::Building, "add a channel")?;
        if self.channels.iter().any(|c| c.port().name() == name) {
            return Err(PipelineError::DuplicateChannel(name.to_string()));
        }

        let channel = BoundedChannel::<T>::create(name, capacity, &self.config.channel_options())?;
        let id = self.graph.add_channel(&channel.port());
        debug_assert_eq!(id, self.channels.len());
        self.channels.push(Box::new(channel.clone()));
        Ok(channel)
    }

    /// Validates a worker group against this pipeline's exit signal and
    /// adds it as a pool.
    ///
    /// # Errors
    ///
    /// See [`WorkerSpec::create`] and [`Orchestrator::add_pool`].
    pub fn worker<A: 'static>(
        &mut self,
        count: usize,
        entry: EntryPoint<A>,
        args: A,
        inputs: &[PortRef],
        outputs: &[PortRef],
    ) -> Result<(), PipelineError> {
        let spec = WorkerSpec::create(count, entry, args, inputs, outputs, &self.exit)?;
        self.add_pool(spec)
    }

    /// Adds a pool for `spec`, which must be created with
    /// [`Orchestrator::exit`].
    ///
    /// # Errors
    ///
    /// [`PipelineError::ForeignExitSignal`] if the spec watches another exit
    /// signal, [`PipelineError::UnknownChannel`] if the spec uses a channel
    /// this orchestrator did not create, [`PipelineError::Cycle`] if the pool
    /// closes a data-flow cycle.
    pub fn add_pool<A: 'static>(&mut self, spec: WorkerSpec<A>) -> Result<(), PipelineError> {
        self.expect_phase(Phase::Building, "add a pool")?;
        if spec.exit().path() != self.exit.path() {
            warn!(pool = spec.name(), "pool rejected; foreign exit signal");
            return Err(PipelineError::ForeignExitSignal {
                pool: spec.name().to_string(),
                path: spec.exit().path().to_string(),
            });
        }
        let pool = WorkerPool::create(spec)?;
        self.graph
            .add_pool(pool.name(), pool.spec().inputs(), pool.spec().outputs())
            .inspect_err(|err| {
                warn!(pool = pool.name(), error = %err, "pool rejected");
            })?;
        debug!(pool = pool.name(), "pool added");
        self.pools.push(Box::new(pool));
        Ok(())
    }

    /// Starts every pool in the order they were added.
    ///
    /// If a pool fails to start, the pools already running are shut down
    /// with the usual protocol before the error is returned.
    ///
    /// # Errors
    ///
    /// The first [`PoolError`], or [`PipelineError::InvalidPhase`].
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.expect_phase(Phase::Building, "start")?;
        info!(
            pools = self.pools.len(),
            channels = self.channels.len(),
            "pipeline starting"
        );
        self.phase = Phase::Running;

        for index in 0..self.pools.len() {
            if let Err(err) = self.pools[index].start_workers() {
                error!(pool = self.pools[index].name(), error = %err, "pool failed to start");
                let report = self.shutdown();
                debug!(pools = report.pools.len(), "partial start rolled back");
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Polls every watched channel until the run duration elapses, a handler
    /// returns [`Flow::Stop`], or a worker raises the exit signal.
    ///
    /// Each watch gets one `get` per tick, bounded by the configured poll
    /// timeout. Does not shut anything down.
    pub fn supervise(&self, watches: &mut [Watch<'_>]) -> SuperviseOutcome {
        let deadline = Deadline::after(self.config.run_duration.into());
        info!(
            watches = watches.len(),
            run_duration_ms = self.config.run_duration.as_millis() as u64,
            "supervising"
        );

        loop {
            if self.exit.is_raised() {
                warn!("exit signal raised by a worker");
                return SuperviseOutcome::ExitRaised;
            }
            if deadline.expired() {
                info!("run duration elapsed");
                return SuperviseOutcome::DeadlineElapsed;
            }
            if watches.is_empty() {
                let nap = deadline
                    .remaining()
                    .map_or(self.config.poll_timeout, |left| left.min(self.config.poll_timeout));
                std::thread::sleep(nap);
                continue;
            }
            for watch in watches.iter_mut() {
                if watch.poll(self.config.poll_timeout) == Flow::Stop {
                    info!(channel = watch.channel(), "termination message received");
                    return SuperviseOutcome::Terminated {
                        channel: watch.channel().to_string(),
                    };
                }
            }
        }
    }

    /// Raises the exit signal, drains every channel downstream first, then
    /// joins every running pool. Never fails; problems are logged.
    pub fn shutdown(&mut self) -> ShutdownReport {
        info!("pipeline shutting down");
        self.exit.raise();

        let mut drained = Vec::with_capacity(self.channels.len());
        for id in self.graph.drain_order() {
            let Some(channel) = self.channels.get(id) else {
                continue;
            };
            let discarded = channel.drain_and_unblock();
            let name = channel.port().name().to_string();
            debug!(channel = %name, discarded, "channel drained");
            drained.push(DrainRecord {
                channel: name,
                discarded,
            });
        }

        let mut pools = Vec::with_capacity(self.pools.len());
        for pool in &mut self.pools {
            if pool.state() != PoolState::Running {
                continue;
            }
            match pool.join_workers() {
                Ok(report) => pools.push(report),
                Err(err) => {
                    warn!(pool = pool.name(), error = %err, "failed to join pool");
                }
            }
        }

        self.phase = Phase::Stopped;
        let report = ShutdownReport { drained, pools };
        info!(
            discarded = report.discarded(),
            clean = report.all_succeeded(),
            "pipeline stopped"
        );
        report
    }

    /// Starts, supervises, then shuts down.
    ///
    /// # Errors
    ///
    /// Only if the pipeline fails to start.
    pub fn run(&mut self, watches: &mut [Watch<'_>]) -> Result<RunReport, PipelineError> {
        self.start()?;
        let outcome = self.supervise(watches);
        let shutdown = self.shutdown();
        Ok(RunReport { outcome, shutdown })
    }

    /// Prepares a stopped pipeline for another run: lowers the exit signal,
    /// reopens every channel and forgets the stopped pools.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidPhase`] while running.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        if self.phase == Phase::Running {
            return Err(PipelineError::InvalidPhase {
                op: "reset",
                phase: self.phase,
            });
        }

        self.exit.clear();
        for channel in &self.channels {
            channel.reopen();
        }
        self.pools.retain(|p| p.state() != PoolState::Stopped);
        self.graph.clear_pools();
        for pool in &self.pools {
            self.graph.add_pool(pool.name(), pool.inputs(), pool.outputs())?;
        }
        self.phase = Phase::Building;
        debug!(pools = self.pools.len(), "pipeline reset");
        Ok(())
    }

    /// Channel names in the order shutdown drains them.
    #[must_use]
    pub fn drain_order(&self) -> Vec<String> {
        self.graph
            .drain_order()
            .into_iter()
            .filter_map(|id| self.graph.channel_name(id).map(str::to_string))
            .collect()
    }

    /// Names and states of the registered pools.
    pub fn pools(&self) -> impl Iterator<Item = (&str, PoolState)> {
        self.pools.iter().map(|p| (p.name(), p.state()))
    }

    fn expect_phase(&self, want: Phase, op: &'static str) -> Result<(), PipelineError> {
        if self.phase == want {
            Ok(())
        } else {
            Err(PipelineError::InvalidPhase {
                op,
                phase: self.phase,
            })
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phase", &self.phase)
            .field("channels", &self.graph.channel_count())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.phase == Phase::Running {
            warn!("orchestrator dropped while running; shutting down");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::channel::ChannelOptions;
    use crate::worker::WorkerError;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_timeout: Duration::from_millis(5),
            run_duration: Duration::from_secs(5),
            shm_prefix: "flightdeck-test".to_string(),
            ..OrchestratorConfig::default()
        }
    }

    fn relay() -> EntryPoint<()> {
        EntryPoint::new("relay", |_: &(), ports, exit| {
            let input = ports.input::<u32>(0)?;
            let output = ports.output::<u32>(0)?;
            while !exit.is_raised() {
                if let Ok(n) = input.get(Duration::from_millis(5)) {
                    let _ = output.put(&n, Duration::from_millis(5));
                }
            }
            Ok(())
        })
        .input::<u32>()
        .output::<u32>()
    }

    #[test]
    #[serial(fork)]
    fn test_duplicate_channel_name() {
        let mut orch = Orchestrator::new(config()).unwrap();
        orch.channel::<u32>("a", 1).unwrap();
        assert!(matches!(
            orch.channel::<String>("a", 1),
            Err(PipelineError::DuplicateChannel(name)) if name == "a"
        ));
    }

    #[test]
    #[serial(fork)]
    fn test_foreign_channel_rejected() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let ours = orch.channel::<u32>("ours", 1).unwrap();
        let opts = ChannelOptions {
            shm_prefix: "flightdeck-test".to_string(),
            ..ChannelOptions::default()
        };
        let foreign = BoundedChannel::<u32>::create("foreign", 1, &opts).unwrap();

        let err = orch
            .worker(1, relay(), (), &[foreign.port()], &[ours.port()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownChannel { channel, .. } if channel == "foreign"));
        assert_eq!(orch.pools().count(), 0);
    }

    #[test]
    #[serial(fork)]
    fn test_spec_with_other_exit_signal_rejected() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let a = orch.channel::<u32>("a", 1).unwrap();
        let b = orch.channel::<u32>("b", 1).unwrap();
        let other = ExitSignal::create("flightdeck-test").unwrap();
        let spec = WorkerSpec::create(1, relay(), (), &[a.port()], &[b.port()], &other).unwrap();

        let err = orch.add_pool(spec).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ForeignExitSignal { pool, path }
                if pool == "relay" && path == other.path().to_string()
        ));
        assert_eq!(orch.pools().count(), 0);

        let spec = WorkerSpec::create(1, relay(), (), &[a.port()], &[b.port()], orch.exit()).unwrap();
        orch.add_pool(spec).unwrap();
        assert_eq!(orch.pools().count(), 1);
    }

    #[test]
    #[serial(fork)]
    fn test_cycle_across_pools_rejected() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let a = orch.channel::<u32>("a", 1).unwrap();
        let b = orch.channel::<u32>("b", 1).unwrap();
        orch.worker(1, relay(), (), &[a.port()], &[b.port()]).unwrap();

        let err = orch.worker(1, relay(), (), &[b.port()], &[a.port()]).unwrap_err();
        assert!(matches!(err, PipelineError::Cycle { .. }));
        assert_eq!(orch.pools().count(), 1);
    }

    #[test]
    #[serial(fork)]
    fn test_supervise_without_watches_hits_deadline() {
        let mut orch = Orchestrator::new(OrchestratorConfig {
            run_duration: Duration::from_millis(30),
            ..config()
        })
        .unwrap();
        orch.start().unwrap();
        assert_eq!(orch.supervise(&mut []), SuperviseOutcome::DeadlineElapsed);
        let report = orch.shutdown();
        assert!(report.pools.is_empty());
        assert_eq!(orch.phase(), Phase::Stopped);
    }

    #[test]
    #[serial(fork)]
    fn test_watch_stop_terminates_supervision() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let status = orch.channel::<String>("status", 4).unwrap();
        for s in ["Connected", "Connected", "Disconnected"] {
            status.try_put(&s.to_string()).unwrap();
        }

        let mut seen = Vec::new();
        let outcome = {
            let mut watches = [Watch::new(&status, |s: String| {
                let stop = s == "Disconnected";
                seen.push(s);
                if stop { Flow::Stop } else { Flow::Continue }
            })];
            orch.supervise(&mut watches)
        };
        assert_eq!(
            outcome,
            SuperviseOutcome::Terminated {
                channel: "status".to_string()
            }
        );
        assert_eq!(seen, ["Connected", "Connected", "Disconnected"]);
    }

    #[test]
    #[serial(fork)]
    fn test_failing_worker_ends_supervision() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let entry = EntryPoint::new("broken", |_: &(), _, _| Err(WorkerError::failed("no link")));
        orch.worker(1, entry, (), &[], &[]).unwrap();

        let run = orch.run(&mut []).unwrap();
        assert_eq!(run.outcome, SuperviseOutcome::ExitRaised);
        assert!(!run.shutdown.all_succeeded());
    }

    #[test]
    #[serial(fork)]
    fn test_shutdown_drains_downstream_first_and_reset_allows_rerun() {
        let mut orch = Orchestrator::new(config()).unwrap();
        let a = orch.channel::<u32>("a", 8).unwrap();
        let b = orch.channel::<u32>("b", 8).unwrap();
        orch.worker(1, relay(), (), &[a.port()], &[b.port()]).unwrap();
        assert_eq!(orch.drain_order(), ["b", "a"]);

        orch.start().unwrap();
        assert!(matches!(orch.start(), Err(PipelineError::InvalidPhase { .. })));
        assert!(matches!(orch.reset(), Err(PipelineError::InvalidPhase { .. })));

        a.put(&1, Duration::from_secs(1)).unwrap();
        assert_eq!(b.get(Duration::from_secs(5)).unwrap(), 1);

        let report = orch.shutdown();
        let order: Vec<_> = report.drained.iter().map(|d| d.channel.as_str()).collect();
        assert_eq!(order, ["b", "a"]);
        assert_eq!(report.pools.len(), 1);
        assert!(report.all_succeeded());
        assert!(a.is_drained() && b.is_drained());

        orch.reset().unwrap();
        assert!(!orch.exit().is_raised());
        assert!(!a.is_drained());
        assert_eq!(orch.pools().count(), 0);

        orch.worker(1, relay(), (), &[a.port()], &[b.port()]).unwrap();
        orch.start().unwrap();
        a.put(&2, Duration::from_secs(1)).unwrap();
        assert_eq!(b.get(Duration::from_secs(5)).unwrap(), 2);
        assert!(orch.shutdown().all_succeeded());
    }
}
