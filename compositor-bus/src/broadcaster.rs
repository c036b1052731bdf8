//! Lifecycle controller.
//!
//! `Unconfigured -> Initialized -> Running -> Terminated`. [`Broadcaster::destroy`]
//! returns to `Unconfigured` from anywhere.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use crate::config::BroadcastConfig;
use crate::error::BroadcastError;
use crate::library::{BusMessage, BusReceiver, RunState, TransformLibrary};
use crate::router::RouterReport;
use crate::topology::{self, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Initialized,
    Running,
    Terminated,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Terminated => "terminated",
        }
    }
}

pub struct Broadcaster {
    library: Arc<dyn TransformLibrary>,
    state: LifecycleState,
    topology: Option<Topology>,
    last_report: Option<RouterReport>,
    cancel: CancellationToken,
    dot_dir: Option<PathBuf>,
}

impl Broadcaster {
    pub fn new(library: Arc<dyn TransformLibrary>) -> Self {
        Self {
            library,
            state: LifecycleState::Unconfigured,
            topology: None,
            last_report: None,
            cancel: CancellationToken::new(),
            dot_dir: None,
        }
    }

    /// Writes a Graphviz dump of the graph into `dir` on every graph state
    /// change.
    pub fn with_dot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dot_dir = Some(dir.into());
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Cancelling the returned token ends a running broadcast successfully.
    /// The token outlives `destroy` and re-`init` until it is cancelled.
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validates `config` and builds the static topology. Nothing is
    /// allocated when validation fails, and a construction failure releases
    /// whatever was built.
    pub fn init(&mut self, config: &BroadcastConfig) -> anyhow::Result<()> {
        if self.state != LifecycleState::Unconfigured {
            return Err(BroadcastError::InvalidState {
                state: self.state.name(),
            }
            .into());
        }
        let config = config.validate()?;
        let topology = topology::build(Arc::clone(&self.library), &config)?;
        for source in topology.sources.iter() {
            log::info!("{}: {}", source.id, source.locator);
        }
        self.topology = Some(topology);
        self.last_report = None;
        self.state = LifecycleState::Initialized;
        Ok(())
    }

    /// Plays the graph until end-of-stream, a fatal error or interruption,
    /// then tears it down.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        match self.state {
            LifecycleState::Initialized => {}
            LifecycleState::Unconfigured => return Err(BroadcastError::NotInitialized.into()),
            state => {
                return Err(BroadcastError::InvalidState {
                    state: state.name(),
                }
                .into());
            }
        }

        let bus = self.library.subscribe();
        if let Err(e) = self.library.set_state(RunState::Playing) {
            log::error!("unable to set the graph to the playing state");
            self.release();
            self.state = LifecycleState::Terminated;
            return Err(BroadcastError::StateChange {
                target: RunState::Playing,
                source: e,
            }
            .into());
        }
        self.state = LifecycleState::Running;
        log::info!("broadcast running");

        let result = self.watch(bus).await;
        self.release();
        self.state = LifecycleState::Terminated;
        match &result {
            Ok(()) => log::info!("broadcast finished"),
            Err(e) => log::error!("broadcast failed: {:#}", e),
        }
        result.map_err(Into::into)
    }

    async fn watch(&self, bus: BusReceiver) -> Result<(), BroadcastError> {
        let mut messages = BroadcastStream::new(bus);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("interrupted, stopping broadcast");
                    return Ok(());
                },
                msg = messages.next() => match msg {
                    None => return Err(BroadcastError::BusClosed),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        log::error!("bus lagged, {} messages lost", skipped);
                        return Err(BroadcastError::BusLagged { skipped });
                    }
                    Some(Ok(BusMessage::EndOfStream)) => {
                        log::info!("end-of-stream reached");
                        return Ok(());
                    }
                    Some(Ok(BusMessage::Error { node, message, debug })) => {
                        log::error!("error received from {}: {}", node, message);
                        log::error!(
                            "debugging information: {}",
                            debug.as_deref().unwrap_or("none")
                        );
                        return Err(BroadcastError::RuntimeFault { node, message, debug });
                    }
                    Some(Ok(BusMessage::StateChanged { old, new })) => {
                        log::info!("graph state changed from {} to {}", old, new);
                        self.dump_dot(old, new);
                    }
                },
            }
        }
    }

    fn dump_dot(&self, old: RunState, new: RunState) {
        let Some(dir) = self.dot_dir.as_ref() else {
            return;
        };
        let Some(dot) = self.library.dump_dot() else {
            return;
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = dir.join(format!("{}-pipeline-{}-{}.dot", millis, old, new));
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, dot)) {
            log::warn!("failed to write {}: {}", path.display(), e);
        }
    }

    /// Counters, tiles and adaptation chains of the current or last run.
    pub fn report(&self) -> RouterReport {
        match &self.topology {
            Some(topology) => topology.router.report(),
            None => self.last_report.clone().unwrap_or_default(),
        }
    }

    /// Releases every graph resource. Safe to call in any state, any number
    /// of times.
    pub fn destroy(&mut self) {
        self.release();
        self.last_report = None;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.state = LifecycleState::Unconfigured;
    }

    fn release(&mut self) {
        if let Some(topology) = self.topology.take() {
            self.last_report = Some(topology.router.report());
            topology.router.teardown();
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
#[path = "broadcaster_test.rs"]
mod broadcaster_test;
