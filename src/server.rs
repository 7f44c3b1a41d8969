//! The server engine.
//!
//! Three persistent stage threads run between [`TcpServer::start`] and
//! [`TcpServer::stop`]:
//!
//! ```text
//!   listening socket
//!        │ acceptor: private poller, accept() until WouldBlock
//!        ▼
//!   admission queue (unbounded)
//!        │ admission: non-blocking, registry insert, on_connect
//!        ▼
//!   client registry ── register() ──▶ shared Selector
//!                                          │ dispatch loop: disarm, then
//!                                          ▼ receive dispatch per policy
//!                          receive_once ─▶ on_receive / on_disconnect /
//!                                          on_abnormal_disconnect
//! ```
//!
//! Every blocking wait in a stage is bounded by `poll_timeout`, after which
//! the stage re-checks the stop flag. A stage that fails or panics while the
//! server is not stopping brings the whole server down with a diagnostic
//! reason passed to `on_stop`.

use std::{
    any::Any,
    cell::Cell,
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::Builder,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    handler::ServerHandler,
    io::{self as raw, Received},
    poll::{PollSelector, Selector, DEFAULT_EVENTS_CAPACITY},
    policy::{Callback, Execution, PolicyTarget, ThreadingPolicy},
    registry::{Client, ConnectionId, Registry},
    thread_pool::ThreadPool,
};

const LISTENER: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Acceptor,
    Admission,
    Dispatch,
}

impl Stage {
    const ALL: [Stage; 3] = [Stage::Acceptor, Stage::Admission, Stage::Dispatch];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Stage::Acceptor => "acceptor",
            Stage::Admission => "admission",
            Stage::Dispatch => "dispatch",
        }
    }
}

thread_local! {
    static CURRENT_STAGE: Cell<Option<Stage>> = const { Cell::new(None) };
}

/// One-shot completion signal.
struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.cond.wait_for(&mut done, timeout);
        }
        *done
    }
}

/// What [`TcpServer::disconnect`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Connection(ConnectionId),
}

impl From<ConnectionId> for Target {
    fn from(conn: ConnectionId) -> Self {
        Target::Connection(conn)
    }
}

/// Which hook a disconnect reports through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Reported with `on_disconnect`.
    Normal,
    /// Reported with `on_abnormal_disconnect` and this message.
    Abnormal(String),
}

impl DisconnectReason {
    pub fn abnormal(message: impl Into<String>) -> Self {
        DisconnectReason::Abnormal(message.into())
    }
}

/// A connection accepted but not yet admitted.
struct Pending {
    stream: TcpStream,
    addr: SocketAddr,
}

struct Inner {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    selector: Box<dyn Selector>,
    registry: Registry,
    policy: ThreadingPolicy,
    pool: Mutex<Option<ThreadPool>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: OnceLock<SocketAddr>,
    admission_tx: Sender<Pending>,
    admission_rx: Receiver<Pending>,
    next_id: AtomicU64,
    started: AtomicBool,
    stopping: AtomicBool,
    stages: [Latch; 3],
    stopped: Latch,
    #[cfg(test)]
    faults: [AtomicBool; 3],
}

/// Event-driven TCP server.
///
/// `TcpServer` is a cheap handle; clones address the same server. Hooks get
/// one too, so they can call back into the server from any thread.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_server::{ConnectionId, ServerConfig, ServerHandler, TcpServer, error::Result};
///
/// struct Echo;
///
/// impl ServerHandler for Echo {
///     fn on_connect(&self, server: &TcpServer, conn: ConnectionId) -> Result<()> {
///         server.register(conn, false)
///     }
///
///     fn on_receive(&self, server: &TcpServer, conn: ConnectionId, data: &[u8]) -> Result<()> {
///         server.send(conn, data, true)?;
///         server.register(conn, true)
///     }
/// }
///
/// # fn main() -> Result<()> {
/// let server = TcpServer::new(ServerConfig::builder().port(8080).build(), Echo)?;
/// server.start()?;
/// server.wait()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl TcpServer {
    /// Create a server using the default mio multiplexer.
    pub fn new<H: ServerHandler>(config: ServerConfig, handler: H) -> Result<Self> {
        let selector = PollSelector::with_capacity(DEFAULT_EVENTS_CAPACITY)?;
        Self::with_selector(config, handler, selector)
    }

    /// Create a server watching connections through `selector`.
    pub fn with_selector<H, S>(config: ServerConfig, handler: H, selector: S) -> Result<Self>
    where
        H: ServerHandler,
        S: Selector,
    {
        config.validate()?;
        let (admission_tx, admission_rx) = crossbeam_channel::unbounded();
        let policy = ThreadingPolicy::new(config.hook_execution, config.receive_dispatch);

        Ok(Self {
            inner: Arc::new(Inner {
                handler: Arc::new(handler),
                selector: Box::new(selector),
                registry: Registry::new(),
                policy,
                pool: Mutex::new(None),
                listener: Mutex::new(None),
                local_addr: OnceLock::new(),
                admission_tx,
                admission_rx,
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stages: [Latch::new(), Latch::new(), Latch::new()],
                stopped: Latch::new(),
                #[cfg(test)]
                faults: [
                    AtomicBool::new(false),
                    AtomicBool::new(false),
                    AtomicBool::new(false),
                ],
                config,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.is_stopping()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_set()
    }

    fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------- lifecycle

    /// Bind, listen, launch the three stages, then fire `on_start`.
    ///
    /// A server starts at most once.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let (listener, address) = match bind_listener(&self.inner.config) {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let _ = self.inner.local_addr.set(address);
        *self.inner.listener.lock() = Some(listener);

        for stage in Stage::ALL {
            if let Err(e) = self.spawn_stage(stage) {
                self.abort_start(stage);
                return Err(e);
            }
        }

        info!(%address, "server listening");
        self.fire(Callback::OnStart, |handler, server| handler.on_start(server));
        Ok(())
    }

    fn abort_start(&self, failed: Stage) {
        error!(stage = failed.name(), "failed to launch stage");
        self.inner.stopping.store(true, Ordering::SeqCst);
        for stage in &Stage::ALL[failed.index()..] {
            self.inner.stages[stage.index()].set();
        }
        for latch in &self.inner.stages {
            latch.wait();
        }
        self.inner.listener.lock().take();
        self.inner.stopped.set();
    }

    /// Stop the server and block until every stage has exited.
    ///
    /// All connections are dropped without firing their hooks, the listening
    /// socket is closed, and `on_stop` receives `reason`. Stopping is
    /// one-shot: any later call returns [`Error::AlreadyStopped`].
    ///
    /// Called from a hook running inline on one of the stage threads, the
    /// wait happens on a helper thread and this returns immediately.
    pub fn stop(&self, reason: &str) -> Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        if self
            .inner
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStopped);
        }

        info!(reason, "server stopping");
        self.disconnect(Target::All, DisconnectReason::Normal, true)?;

        let reason = reason.to_string();
        let inside_running_stage = CURRENT_STAGE
            .with(Cell::get)
            .is_some_and(|stage| !self.inner.stages[stage.index()].is_set());
        if inside_running_stage {
            let server = self.clone();
            Builder::new()
                .name("mill-stop".into())
                .spawn(move || server.finish_stop(reason))?;
            return Ok(());
        }

        self.finish_stop(reason);
        Ok(())
    }

    fn finish_stop(&self, reason: String) {
        for latch in &self.inner.stages {
            latch.wait();
        }

        // admission may have raced the first sweep
        let _ = self.disconnect(Target::All, DisconnectReason::Normal, true);
        while self.inner.admission_rx.try_recv().is_ok() {}
        self.inner.listener.lock().take();

        info!(reason = %reason, "server stopped");
        self.fire(Callback::OnStop, move |handler, server| {
            handler.on_stop(server, &reason)
        });
        self.inner.stopped.set();
    }

    /// Block until the server has fully stopped.
    pub fn wait(&self) -> Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        self.inner.stopped.wait();
        Ok(())
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns whether the
    /// server has stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.stopped.wait_for(timeout)
    }

    // ----------------------------------------------------------- stage threads

    fn spawn_stage(&self, stage: Stage) -> Result<()> {
        let server = self.clone();
        Builder::new()
            .name(format!("mill-{}", stage.name()))
            .spawn(move || server.run_stage(stage))?;
        Ok(())
    }

    fn run_stage(&self, stage: Stage) {
        CURRENT_STAGE.with(|current| current.set(Some(stage)));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match stage {
            Stage::Acceptor => self.accept_loop(),
            Stage::Admission => self.admission_loop(),
            Stage::Dispatch => self.dispatch_loop(),
        }));
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("error in {} stage: {e}", stage.name())),
            Err(payload) => Some(format!(
                "panic in {} stage: {}",
                stage.name(),
                panic_message(&*payload)
            )),
        };

        self.inner.stages[stage.index()].set();
        debug!(stage = stage.name(), "stage exited");

        if self.is_stopping() {
            if let Some(fault) = fault {
                warn!(stage = stage.name(), %fault, "stage failed while stopping");
            }
            return;
        }

        let reason =
            fault.unwrap_or_else(|| format!("{} stage exited unexpectedly", stage.name()));
        error!(stage = stage.name(), %reason, "stage fault, shutting down");
        if let Err(e) = self.stop(&reason) {
            debug!(error = %e, "shutdown already under way");
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&self, stage: Stage) {
        self.inner.faults[stage.index()].store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_fault(&self, stage: Stage) -> Result<()> {
        if self.inner.faults[stage.index()].swap(false, Ordering::SeqCst) {
            return Err(Error::StageFault("injected fault".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    fn check_fault(&self, _stage: Stage) -> Result<()> {
        Ok(())
    }

    fn accept_loop(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::StageFault("listening socket missing".into()))?;
        let result = self.accept_connections(&listener);
        *self.inner.listener.lock() = Some(listener);
        result
    }

    fn accept_connections(&self, listener: &TcpListener) -> Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(16);
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        let timeout = self.inner.config.poll_timeout;

        while !self.is_stopping() {
            self.check_fault(Stage::Acceptor)?;
            match poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if events.is_empty() {
                continue;
            }

            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "accepted connection");
                        self.inner
                            .admission_tx
                            .send(Pending { stream, addr })
                            .map_err(|_| Error::StageFault("admission queue closed".into()))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                        ) =>
                    {
                        continue
                    }
                    Err(e) => return Err(Error::Accept(e)),
                }
            }
        }
        Ok(())
    }

    fn admission_loop(&self) -> Result<()> {
        let timeout = self.inner.config.poll_timeout;
        while !self.is_stopping() {
            self.check_fault(Stage::Admission)?;
            match self.inner.admission_rx.recv_timeout(timeout) {
                Ok(pending) => self.admit(pending),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::StageFault("admission queue closed".into()))
                }
            }
        }
        Ok(())
    }

    fn admit(&self, Pending { stream, addr }: Pending) {
        if self.is_stopping() {
            return;
        }
        let config = &self.inner.config;

        if let Some(max) = config.max_connections {
            if self.inner.registry.len() >= max {
                self.warning(format!("max connections reached, rejecting {addr}"));
                return;
            }
        }
        if let Err(e) = stream.set_nonblocking(true) {
            self.warning(format!(
                "failed to make connection from {addr} non-blocking: {e}"
            ));
            return;
        }
        if config.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                self.warning(format!("failed to set TCP_NODELAY for {addr}: {e}"));
            }
        }

        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .registry
            .insert(Arc::new(Client::new(id, stream, addr)));
        debug!(conn = %id, peer = %addr, "connection admitted");

        self.fire(Callback::OnConnect, move |handler, server| {
            handler.on_connect(server, id)
        });

        if config.auto_register {
            match self.register(id, true) {
                Ok(()) | Err(Error::UnknownConnection(_)) => {}
                Err(e) => self.warning(format!("failed to arm connection {id}: {e}")),
            }
        }
    }

    fn dispatch_loop(&self) -> Result<()> {
        let timeout = self.inner.config.poll_timeout;
        let mut ready = Vec::with_capacity(DEFAULT_EVENTS_CAPACITY);

        while !self.is_stopping() {
            self.check_fault(Stage::Dispatch)?;
            self.inner.selector.select(&mut ready, timeout)?;

            for token in ready.drain(..) {
                let id = ConnectionId::from_token(token);
                let Some(client) = self.inner.registry.get(id) else {
                    debug!(conn = %id, "readiness for a connection that is gone");
                    continue;
                };
                match client.begin_dispatch(&*self.inner.selector) {
                    Ok(true) => self.dispatch_receive(client),
                    Ok(false) => {}
                    Err(e) => {
                        self.warning(format!("failed to disarm connection {id}: {e}"));
                        self.dispatch_receive(client);
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_receive(&self, client: Arc<Client>) {
        let guard = DispatchGuard {
            server: self.clone(),
            client,
        };
        self.execute(Callback::ReceiveDispatch, move |server| {
            server.read_client(&guard.client, false);
            drop(guard);
        });
    }

    // ------------------------------------------------------------ callbacks

    /// Run `task` where the policy slot for `callback` says.
    fn execute<F>(&self, callback: Callback, task: F)
    where
        F: FnOnce(&TcpServer) + Send + 'static,
    {
        match self.inner.policy.get(callback) {
            Execution::Inline => task(self),
            Execution::Thread => {
                let server = self.clone();
                if let Err(e) = Builder::new()
                    .name(format!("mill-{callback}"))
                    .spawn(move || task(&server))
                {
                    error!(%callback, error = %e, "failed to spawn callback thread");
                }
            }
            Execution::Pool => {
                let server = self.clone();
                if let Err(e) = self.run_on_pool(move || task(&server)) {
                    error!(%callback, error = %e, "failed to queue callback on pool");
                }
            }
        }
    }

    fn run_on_pool<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.pool.lock();
        let pool = match slot.take() {
            Some(pool) => pool,
            None => ThreadPool::new(self.inner.config.pool_workers)?,
        };
        let queued = pool.exec(task);
        *slot = Some(pool);
        queued
    }

    fn fire<F>(&self, callback: Callback, hook: F)
    where
        F: FnOnce(&dyn ServerHandler, &TcpServer) -> Result<()> + Send + 'static,
    {
        self.execute(callback, move |server| {
            if let Err(e) = hook(&*server.inner.handler, server) {
                server.hook_failed(callback, e);
            }
        });
    }

    fn hook_failed(&self, callback: Callback, err: Error) {
        warn!(hook = %callback, error = %err, "hook returned an error");
        if callback != Callback::OnWarning {
            self.warning(format!("{callback} failed: {err}"));
        }
    }

    fn warning(&self, message: String) {
        warn!("{message}");
        self.fire(Callback::OnWarning, move |handler, server| {
            handler.on_warning(server, &message)
        });
    }

    /// Set whether callbacks in `target` run on their own thread.
    pub fn set_threading_policy(&self, target: impl Into<PolicyTarget>, run_on_thread: bool) {
        self.set_execution(target, Execution::from(run_on_thread));
    }

    pub fn set_execution(&self, target: impl Into<PolicyTarget>, execution: Execution) {
        self.inner.policy.set(target.into(), execution);
    }

    pub fn execution(&self, callback: Callback) -> Execution {
        self.inner.policy.get(callback)
    }

    // ------------------------------------------------------------ connections

    fn client(&self, conn: ConnectionId) -> Result<Arc<Client>> {
        self.inner
            .registry
            .get(conn)
            .ok_or(Error::UnknownConnection(conn))
    }

    /// Arm `conn` for one receive dispatch.
    ///
    /// Arming while the connection's receive dispatch is still running takes
    /// effect when that dispatch returns. With `silent`, arming an already
    /// armed connection is not an error.
    pub fn register(&self, conn: ConnectionId, silent: bool) -> Result<()> {
        let client = self.client(conn)?;
        match client.arm(&*self.inner.selector) {
            Err(Error::AlreadyRegistered(_)) if silent => Ok(()),
            other => other,
        }
    }

    /// Disarm `conn`. With `silent`, unarmed or unknown connections are not
    /// an error.
    pub fn unregister(&self, conn: ConnectionId, silent: bool) -> Result<()> {
        let Some(client) = self.inner.registry.get(conn) else {
            return if silent {
                Ok(())
            } else {
                Err(Error::UnknownConnection(conn))
            };
        };
        match client.disarm(&*self.inner.selector) {
            Err(Error::NotRegistered(_)) if silent => Ok(()),
            other => other,
        }
    }

    /// Send all of `data` to `conn`.
    ///
    /// With `block`, concurrent senders on the same connection are serialized
    /// so their payloads never interleave. A failed send disconnects the
    /// connection abnormally before the error is returned.
    pub fn send(&self, conn: ConnectionId, data: &[u8], block: bool) -> Result<()> {
        let client = self.client(conn)?;
        let wait = self.inner.config.poll_timeout;
        let outcome = if block {
            let _serialized = client.send_lock().lock();
            raw::send_all(client.stream(), data, wait)
        } else {
            raw::send_all(client.stream(), data, wait)
        };

        outcome.map_err(|message| {
            self.close_client(conn, DisconnectReason::abnormal(message.clone()), true);
            Error::AbnormalDisconnect { conn, message }
        })
    }

    /// One non-blocking read of up to `size` bytes, without firing hooks.
    pub fn receive_once(&self, conn: ConnectionId, size: usize) -> Result<Received> {
        let client = self.client(conn)?;
        Ok(raw::receive_once(client.stream(), size))
    }

    /// The receive dispatch run for armed connections.
    ///
    /// Reads once and fires `on_receive` with the data, or disconnects and
    /// fires the matching hook. Returns the data read, if any.
    pub fn receive(&self, conn: ConnectionId) -> Result<Option<Vec<u8>>> {
        let client = self.client(conn)?;
        Ok(self.read_client(&client, true))
    }

    fn read_client(&self, client: &Client, keep: bool) -> Option<Vec<u8>> {
        let id = client.id();
        match raw::receive_once(client.stream(), self.inner.config.receive_buffer_size) {
            Received::Data(data) => {
                let returned = keep.then(|| data.clone());
                self.fire(Callback::OnReceive, move |handler, server| {
                    handler.on_receive(server, id, &data)
                });
                returned
            }
            Received::WouldBlock => None,
            Received::Disconnected => {
                self.close_client(id, DisconnectReason::Normal, true);
                None
            }
            Received::Aborted(message) => {
                self.close_client(id, DisconnectReason::Abnormal(message), true);
                None
            }
        }
    }

    /// Close connections and drop them from the registry.
    ///
    /// Unless `silent`, each one is reported through the hook matching
    /// `reason`. Disconnecting one unknown connection is an error.
    pub fn disconnect(
        &self,
        target: impl Into<Target>,
        reason: DisconnectReason,
        silent: bool,
    ) -> Result<()> {
        match target.into() {
            Target::All => {
                let ids: Vec<_> = self.inner.registry.ids().collect();
                for id in ids {
                    self.close_client(id, reason.clone(), !silent);
                }
                Ok(())
            }
            Target::Connection(conn) => {
                if self.close_client(conn, reason, !silent) {
                    Ok(())
                } else {
                    Err(Error::UnknownConnection(conn))
                }
            }
        }
    }

    /// Returns false if the connection was unknown or already closing.
    fn close_client(&self, id: ConnectionId, reason: DisconnectReason, notify: bool) -> bool {
        let Some(client) = self.inner.registry.get(id) else {
            return false;
        };
        if !client.close(&*self.inner.selector) {
            return false;
        }
        if let Err(e) = client.stream().shutdown(Shutdown::Both) {
            debug!(conn = %id, error = %e, "shutdown on a broken connection");
        }
        debug!(conn = %id, ?reason, "connection closed");

        if notify {
            match reason {
                DisconnectReason::Normal => {
                    self.fire(Callback::OnDisconnect, move |handler, server| {
                        handler.on_disconnect(server, id)
                    })
                }
                DisconnectReason::Abnormal(message) => {
                    self.fire(Callback::OnAbnormalDisconnect, move |handler, server| {
                        handler.on_abnormal_disconnect(server, id, &message)
                    })
                }
            }
        }

        self.inner.registry.remove(id);
        true
    }

    pub fn peer_address(&self, conn: ConnectionId) -> Result<SocketAddr> {
        Ok(self.client(conn)?.peer_addr())
    }

    /// Ids of the live connections. Each call walks the registry afresh.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.inner.registry.ids()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }
}

/// Releases a connection's dispatch slot, also when the dispatch panics or
/// never gets to run.
struct DispatchGuard {
    server: TcpServer,
    client: Arc<Client>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Err(e) = self.client.finish_dispatch(&*self.server.inner.selector) {
            self.server.warning(format!(
                "failed to re-arm connection {}: {e}",
                self.client.id()
            ));
        }
    }
}

fn bind_listener(config: &ServerConfig) -> io::Result<(TcpListener, SocketAddr)> {
    let address = config.bind_address();
    let socket = Socket::new(
        Domain::for_address(address),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(config.backlog.min(i32::MAX as u32) as i32)?;

    let listener: TcpListener = socket.into();
    let local = listener.local_addr()?;
    Ok((listener, local))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
