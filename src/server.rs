//! Server lifecycle: brings the local controller up over `mgmt`, publishes a GATT application
//! tree to BlueZ, and runs the single loop task that drains the notify queue and fires periodic
//! `onEvent` handlers.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};

use crate::{
    gatt::{
        self,
        builder::{CharacteristicHandle, DescriptorHandle, Tree},
        local::{ApplicationHandle, NotifyToken},
    },
    hci::{self, ControllerEvent, HciAdapter},
    session::Session,
    Error, ErrorKind, Result,
};

/// How often the loop task drains the notify queue and checks for due periodic events.
const LOOP_TICK: Duration = Duration::from_secs(1);

/// Timeout for each individual mgmt command issued during bring-up.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Run state of a [`Server`]. Transitions are strictly monotonic in this order; a server that
/// fails to initialize goes straight from `Initializing` to `Stopped`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Not yet started.
    Uninitialized,
    /// Bringing the controller up and registering the GATT application.
    Initializing,
    /// Serving requests.
    Running,
    /// Unregistering the application and releasing the controller.
    Stopping,
    /// Fully shut down; [`Server::wait`] returns once this state is reached.
    Stopped,
}

/// Degraded-operation indicator, independent of [`State`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Health {
    /// No failures observed.
    Ok,
    /// Initialization failed; the server never reached [`State::Running`].
    FailedInit,
    /// A failure occurred while running, e.g. a lost D-Bus connection or a handler error.
    FailedRun,
}

impl Health {
    fn to_u8(self) -> u8 {
        match self {
            Health::Ok => 0,
            Health::FailedInit => 1,
            Health::FailedRun => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Health::FailedInit,
            2 => Health::FailedRun,
            _ => Health::Ok,
        }
    }
}

/// Builds and starts a [`Server`].
pub struct ServerBuilder {
    advertising_short_name: String,
    advertising_long_name: String,
    controller_index: u16,
    bondable: bool,
    max_async_init: Duration,
}

impl ServerBuilder {
    /// Creates a builder that will advertise under the given short (max 10 byte) and long local
    /// names.
    pub fn new(advertising_short_name: impl Into<String>, advertising_long_name: impl Into<String>) -> Self {
        Self {
            advertising_short_name: advertising_short_name.into(),
            advertising_long_name: advertising_long_name.into(),
            controller_index: hci::DEFAULT_CONTROLLER_INDEX,
            bondable: true,
            max_async_init: Duration::from_secs(10),
        }
    }

    /// Addresses a controller other than the default (index 0).
    pub fn controller_index(mut self, index: u16) -> Self {
        self.controller_index = index;
        self
    }

    /// Whether the controller should accept bonding requests. Defaults to `true`.
    pub fn bondable(mut self, bondable: bool) -> Self {
        self.bondable = bondable;
        self
    }

    /// Caps how long controller bring-up and application registration may take before
    /// [`ServerBuilder::start`] gives up and returns [`ErrorKind::Timeout`].
    pub fn max_async_init(mut self, timeout: Duration) -> Self {
        self.max_async_init = timeout;
        self
    }

    /// Brings the controller up, connects to the system D-Bus, and registers `tree` as a GATT
    /// application with BlueZ. Returns once the application is live and the server's loop task
    /// is running.
    pub async fn start(self, tree: Tree) -> Result<Server> {
        log::info!("starting GATT server on controller {}", self.controller_index);
        let tree = Arc::new(tree);

        let init = tokio::time::timeout(self.max_async_init, initialize(&self, tree));
        let (session, app, adapter, notify_rx, events_rx) = match init.await {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                log::error!("GATT server initialization failed: {err}");
                return Err(err);
            }
            Err(_elapsed) => {
                log::error!("GATT server initialization timed out after {:?}", self.max_async_init);
                return Err(Error::new(ErrorKind::Timeout));
            }
        };

        let (state_tx, _) = watch::channel(State::Running);
        log::info!("GATT server running");

        let inner = Arc::new(ServerInner {
            state_tx,
            health: AtomicU8::new(Health::Ok.to_u8()),
            shutdown: Notify::new(),
            app,
            session,
            adapter: AsyncMutex::new(Some(adapter)),
            controller_index: self.controller_index,
        });

        tokio::spawn(run_loop(inner.clone(), notify_rx, events_rx));

        Ok(Server { inner })
    }
}

type InitParts = (Session, ApplicationHandle, HciAdapter, mpsc::Receiver<NotifyToken>, mpsc::Receiver<ControllerEvent>);

/// Brings the controller up in the order the kernel's mgmt protocol expects, then connects to
/// D-Bus and publishes the application tree.
async fn initialize(cfg: &ServerBuilder, tree: Arc<Tree>) -> Result<InitParts> {
    let (events_tx, events_rx) = mpsc::channel(32);
    let adapter = HciAdapter::open(cfg.controller_index, events_tx).await?;

    let info = adapter.read_controller_info(COMMAND_TIMEOUT).await?;
    log::debug!(
        "controller {:04x}: address {}, supports {:?}",
        cfg.controller_index,
        info.address,
        info.supported_settings
    );

    adapter.set_powered(false, COMMAND_TIMEOUT).await?;
    adapter.set_bredr(false, COMMAND_TIMEOUT).await?;
    adapter.set_le(true, COMMAND_TIMEOUT).await?;
    adapter.set_bondable(cfg.bondable, COMMAND_TIMEOUT).await?;
    adapter.set_connectable(true, COMMAND_TIMEOUT).await?;
    adapter.set_discoverable(0x01, 0, COMMAND_TIMEOUT).await?;
    adapter.set_local_name(&cfg.advertising_short_name, &cfg.advertising_long_name, COMMAND_TIMEOUT).await?;
    adapter.set_advertising(0x01, COMMAND_TIMEOUT).await?;
    adapter.set_powered(true, COMMAND_TIMEOUT).await?;

    let session = Session::new().await?;
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let app = gatt::local::register(tree, &session.inner, cfg.controller_index, notify_tx).await?;

    Ok((session, app, adapter, notify_rx, events_rx))
}

struct ServerInner {
    state_tx: watch::Sender<State>,
    health: AtomicU8,
    shutdown: Notify,
    app: ApplicationHandle,
    session: Session,
    adapter: AsyncMutex<Option<HciAdapter>>,
    controller_index: u16,
}

impl ServerInner {
    fn set_health(&self, health: Health) {
        self.health.store(health.to_u8(), Ordering::Release);
    }

    fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }
}

/// A running BLE peripheral: a published GATT application plus the controller it was brought up
/// on. Cloning shares the same underlying server; the last clone dropped does not itself stop it
/// — call [`Server::trigger_shutdown`] and [`Server::wait`] explicitly.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// The server's current lifecycle state.
    pub fn get_run_state(&self) -> State {
        *self.inner.state_tx.borrow()
    }

    /// Whether the server has hit a failure since it started.
    pub fn get_health(&self) -> Health {
        self.inner.health()
    }

    /// Requests an orderly shutdown. Idempotent; returns immediately. Await [`Server::wait`] to
    /// observe completion.
    pub fn trigger_shutdown(&self) {
        self.inner.shutdown.notify_one();
    }

    /// Waits until the server reaches [`State::Stopped`].
    pub async fn wait(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        while *rx.borrow() != State::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Enqueues a re-evaluation of the characteristic at `handle`: on the next loop tick its
    /// `onUpdatedValue`/`onRead` handlers run, and a `PropertiesChanged` signal is emitted to any
    /// subscribed central if the value changed.
    pub async fn notify_updated_characteristic(&self, handle: CharacteristicHandle) {
        self.inner.app.notify_characteristic(handle).await;
    }

    /// Enqueues a re-evaluation of the descriptor at `handle`, analogous to
    /// [`Server::notify_updated_characteristic`].
    pub async fn notify_updated_descriptor(&self, handle: DescriptorHandle) {
        self.inner.app.notify_descriptor(handle).await;
    }
}

async fn run_loop(inner: Arc<ServerInner>, mut notify_rx: mpsc::Receiver<NotifyToken>, mut events_rx: mpsc::Receiver<ControllerEvent>) {
    let mut tick = tokio::time::interval(LOOP_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            _ = tick.tick() => {
                while let Ok(token) = notify_rx.try_recv() {
                    if let Err(err) = inner.app.handle_token(&token).await {
                        log::warn!("failed to refresh {token:?}: {err}");
                        inner.set_health(Health::FailedRun);
                    }
                }
                while let Ok(event) = events_rx.try_recv() {
                    log::debug!("controller event: {event:?}");
                }
                if let Err(err) = inner.app.dispatch_due_events().await {
                    log::warn!("periodic event dispatch failed: {err}");
                    inner.set_health(Health::FailedRun);
                }
            }
        }
    }

    inner.state_tx.send_replace(State::Stopping);
    log::info!("shutting down GATT server");

    gatt::local::unregister(&inner.app, &inner.session.inner, inner.controller_index).await;
    if let Some(adapter) = inner.adapter.lock().await.take() {
        adapter.close().await;
    }

    inner.state_tx.send_replace(State::Stopped);
    log::info!("GATT server stopped");
}
