//! Session worker
//!
//! The [`Worker`] drives the lifecycle from a single thread: attach to the
//! process through a [`ProcessHost`], wait for a session, run camera
//! discovery in the background and tick the camera engine plus every
//! registered [`TickHandler`] at a bounded rate until the session or the
//! process goes away.
//!
//! Process discovery and session detection belong to the host; this module
//! only sequences them.

use crate::camera::CameraEngine;
use crate::config::Config;
use crate::memory::{Lifecycle, LifecycleState, Memory};
use crate::platform::{ModuleInfo, Transport};
use crate::task::{Backoff, CancellationToken, SupervisedTask};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// An open process as handed over by the host
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Transport into the process's address space
    pub transport: Arc<dyn Transport>,
    /// Module holding the camera tables
    pub module: ModuleInfo,
}

/// Process and session discovery, supplied by the embedding application
pub trait ProcessHost: Send + Sync {
    /// Find and open the target process
    fn attach(&self) -> Result<Attachment>;

    /// Whether a session is currently running
    fn in_session(&self, memory: &Memory) -> bool;

    /// Local player object, used for aim state
    fn local_player(&self, _memory: &Memory) -> Option<u64> {
        None
    }
}

/// Everything a handler can use during a session
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    /// Access to the process
    pub memory: &'a Memory,
    /// Camera engine with the current matrix
    pub camera: &'a CameraEngine,
    /// Module holding the camera tables
    pub module: &'a ModuleInfo,
    /// Cancelled when the session ends
    pub token: &'a CancellationToken,
}

/// Per-session work run on every tick
pub trait TickHandler: Send {
    /// Called once when a session begins
    fn on_session_start(&mut self, _ctx: &SessionContext<'_>) {}

    /// Called every tick after the camera refresh
    fn on_tick(&mut self, ctx: &SessionContext<'_>) -> Result<()>;

    /// Called once when the session ends; drop session-scoped state here
    fn on_session_end(&mut self) {}
}

/// Refreshes the camera engine on its own thread at a fixed interval
#[derive(Debug)]
pub struct CameraPoller {
    task: SupervisedTask,
}

impl CameraPoller {
    /// Start polling until `parent` is cancelled
    pub fn spawn(
        camera: Arc<CameraEngine>,
        memory: Memory,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let task = SupervisedTask::spawn("memsight-camera", parent, move |token| {
            while !token.is_cancelled() {
                if let Err(e) = camera.refresh(&memory) {
                    trace!(error = %e, "Camera poll failed");
                }
                if token.sleep(interval).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self { task })
    }

    /// Stop and join the polling thread
    pub fn stop(self) {
        self.task.stop();
    }
}

/// The primary worker
pub struct Worker {
    config: Config,
    host: Arc<dyn ProcessHost>,
    lifecycle: Arc<Lifecycle>,
    camera: Arc<CameraEngine>,
    handlers: Mutex<Vec<Box<dyn TickHandler>>>,
    pending: Mutex<Vec<Box<dyn TickHandler>>>,
}

impl Worker {
    /// Create a worker; nothing runs until [`Worker::spawn`] or [`Worker::run`]
    pub fn new(config: Config, host: Arc<dyn ProcessHost>) -> Self {
        let camera = Arc::new(CameraEngine::new(&config));
        Self {
            config,
            host,
            lifecycle: Arc::new(Lifecycle::new()),
            camera,
            handlers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Lifecycle driven by this worker
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Camera engine ticked by this worker
    pub fn camera(&self) -> &Arc<CameraEngine> {
        &self.camera
    }

    /// Register work to run on every tick
    ///
    /// During a session the handler is started and ticked from the next tick.
    pub fn add_handler(&self, handler: Box<dyn TickHandler>) {
        self.pending.lock().push(handler);
    }

    /// Drop the process and start over from attach
    pub fn restart(&self) {
        self.lifecycle.restart();
    }

    /// Run the worker on its own thread until `parent` is cancelled
    pub fn spawn(self: Arc<Self>, parent: &CancellationToken) -> Result<SupervisedTask> {
        SupervisedTask::spawn("memsight-worker", parent, move |token| self.run(&token))
    }

    /// Run on the calling thread until `shutdown` is cancelled
    pub fn run(&self, shutdown: &CancellationToken) {
        self.lifecycle.adopt(shutdown);
        info!("Worker started");

        while !shutdown.is_cancelled() {
            let token = self.lifecycle.token();
            let result = self.run_process(&token);

            self.camera.reset();
            if let Err(e) = self.lifecycle.transition(LifecycleState::Stopped) {
                warn!(error = %e, "Could not stop lifecycle");
            }

            match result {
                Err(Error::Cancelled) => debug!("Worker run cancelled"),
                Err(e) => warn!(error = %e, "Worker run ended"),
                Ok(()) => {}
            }

            // A cancelled run token means restart (or shutdown, checked above)
            if token.is_cancelled() {
                continue;
            }
            if shutdown.sleep(self.config.session.startup_retry()).is_err() {
                break;
            }
        }

        info!("Worker stopped");
    }

    fn attach(&self, token: &CancellationToken) -> Result<Attachment> {
        let mut backoff = Backoff::fixed(self.config.session.startup_retry());

        loop {
            token.check()?;
            match self.host.attach() {
                Ok(attachment) if attachment.transport.is_alive() => return Ok(attachment),
                Ok(_) => debug!("Attached process is not alive"),
                Err(e) => debug!(error = %e, attempts = backoff.attempts(), "Attach failed"),
            }
            token.sleep(backoff.next_delay())?;
        }
    }

    fn run_process(&self, token: &CancellationToken) -> Result<()> {
        self.lifecycle.transition(LifecycleState::Starting)?;

        let Attachment { transport, module } = self.attach(token)?;
        let memory = Memory::with_config(transport, self.config.memory.clone());
        self.lifecycle.transition(LifecycleState::Ready)?;
        info!(
            module = %module.name,
            base = format_args!("{:#x}", module.base_address),
            "Process attached"
        );

        loop {
            token.check()?;
            if !memory.is_alive() {
                return Err(Error::ProcessLost);
            }

            if self.host.in_session(&memory) {
                self.run_session(&memory, &module, token)?;
            } else {
                token.sleep(self.config.session.startup_retry())?;
            }
        }
    }

    fn spawn_discovery(
        &self,
        memory: &Memory,
        module: &ModuleInfo,
        parent: &CancellationToken,
        settle: bool,
    ) -> Result<SupervisedTask> {
        let camera = Arc::clone(&self.camera);
        let memory = memory.clone();
        let module = module.clone();
        let mut backoff = self.config.session.discovery_backoff(settle);

        SupervisedTask::spawn("memsight-discovery", parent, move |token| loop {
            if token.sleep(backoff.next_delay()).is_err() {
                return;
            }
            match camera.discover(&memory, &module) {
                Ok(true) => return,
                Ok(false) => trace!(attempts = backoff.attempts(), "No cameras yet"),
                Err(e) => debug!(error = %e, attempts = backoff.attempts(), "Camera discovery failed"),
            }
        })
    }

    fn run_session(&self, memory: &Memory, module: &ModuleInfo, token: &CancellationToken) -> Result<()> {
        self.lifecycle.transition(LifecycleState::InSession)?;
        let session = token.child();
        self.camera.reset();

        let ctx = SessionContext {
            memory,
            camera: &self.camera,
            module,
            token: &session,
        };

        // Handlers stay off the lock while the session runs
        let mut handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers.iter_mut() {
            handler.on_session_start(&ctx);
        }

        let result = self.session_loop(&ctx, &mut handlers);

        session.cancel();
        for handler in handlers.iter_mut() {
            handler.on_session_end();
        }
        self.handlers.lock().append(&mut handlers);
        self.camera.reset();

        result?;
        self.lifecycle.transition(LifecycleState::Ready)
    }

    fn start_pending(&self, ctx: &SessionContext<'_>, handlers: &mut Vec<Box<dyn TickHandler>>) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "Starting new tick handlers");
        for handler in pending.iter_mut() {
            handler.on_session_start(ctx);
        }
        handlers.append(&mut pending);
    }

    fn session_loop(&self, ctx: &SessionContext<'_>, handlers: &mut Vec<Box<dyn TickHandler>>) -> Result<()> {
        let session = &self.config.session;
        let interval = session.tick_interval();

        let mut discovery = Some(self.spawn_discovery(ctx.memory, ctx.module, ctx.token, true)?);
        let poller = match session.camera_poll_interval() {
            Some(every) => Some(CameraPoller::spawn(
                Arc::clone(&self.camera),
                ctx.memory.clone(),
                every,
                ctx.token,
            )?),
            None => None,
        };

        let mut ticks: u64 = 0;
        loop {
            ctx.token.check()?;
            let started = Instant::now();

            if !ctx.memory.is_alive() {
                return Err(Error::ProcessLost);
            }
            if !self.host.in_session(ctx.memory) {
                info!(ticks, "Session ended");
                return Ok(());
            }

            if discovery.as_ref().is_some_and(SupervisedTask::is_finished) {
                discovery = None;
            }
            if self.camera.take_rediscovery() {
                // Replacing the handle joins the previous discovery thread
                discovery = Some(self.spawn_discovery(ctx.memory, ctx.module, ctx.token, false)?);
            }

            if let Some(player) = self.host.local_player(ctx.memory) {
                self.camera.set_local_player(player);
            }
            self.start_pending(ctx, handlers);

            self.tick(ctx, handlers, poller.is_none())?;
            ticks += 1;

            ctx.token.sleep(interval.saturating_sub(started.elapsed()))?;
        }
    }

    fn tick(&self, ctx: &SessionContext<'_>, handlers: &mut [Box<dyn TickHandler>], refresh_camera: bool) -> Result<()> {
        if refresh_camera {
            if let Err(e) = self.camera.refresh(ctx.memory) {
                trace!(error = %e, "Camera refresh failed");
            }
        }

        for handler in handlers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler.on_tick(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => trace!(error = %e, "Tick handler failed"),
                Err(_) => error!("Tick handler panicked"),
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("lifecycle", &self.lifecycle)
            .field("camera", &self.camera)
            .finish_non_exhaustive()
    }
}
