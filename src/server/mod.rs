//! The server: accept loop, connection ownership and graceful stop.

pub(crate) mod conn;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::common::drain::{self, Watch};
use crate::config::ServerConfig;
use crate::event::{Event, Events};
use crate::proto::h1::io as h1io;
use crate::routing::Router;
use crate::service::{AfterAction, App, BeforeAction, ErrorHandler};
use crate::{Error, Result};

/// An HTTP/1.1 server under construction.
///
/// Configure the router, actions, error handlers and options, then
/// [`bind`](Server::bind) it to accept connections, or hand it individual
/// duplex channels with [`serve_connection`](Server::serve_connection)
/// (when TCP and TLS are terminated elsewhere).
///
/// ```no_run
/// use quay::{handler_fn, Body, Response, Router, Server};
///
/// # async fn run() -> quay::Result<()> {
/// let mut router = Router::new();
/// router
///     .get("/hello/:name", handler_fn(|req, _channel| async move {
///         use quay::RequestExt;
///         let name = req.path_param("name").unwrap_or("world");
///         Ok(Some(Response::new(Body::from(format!("Hello {}!", name)))))
///     }))
///     .unwrap();
///
/// let listening = Server::new(router).bind("127.0.0.1:8080").await?;
/// # drop(listening);
/// # Ok(())
/// # }
/// ```
pub struct Server {
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
}

impl Server {
    /// Creates a server around a routing table.
    pub fn new(router: Router) -> Server {
        Server {
            app: Arc::new(App::new(router)),
            config: Arc::new(ServerConfig::default()),
            events: Events::new(),
        }
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: ServerConfig) -> Server {
        self.config = Arc::new(config);
        self
    }

    /// Registers a before-action; they run in registration order.
    pub fn before<A: BeforeAction>(mut self, action: A) -> Server {
        self.app_mut().before.push(Arc::new(action));
        self
    }

    /// Registers an after-action; they run in registration order after the
    /// handler.
    pub fn after<A: AfterAction>(mut self, action: A) -> Server {
        self.app_mut().after.push(Arc::new(action));
        self
    }

    /// Registers an error handler in front of the default one.
    pub fn error_handler<H: ErrorHandler>(mut self, handler: H) -> Server {
        self.app_mut().error_handlers.push(Arc::new(handler));
        self
    }

    fn app_mut(&mut self) -> &mut App {
        Arc::get_mut(&mut self.app).expect("server is not shared before bind")
    }

    /// A handle to the event bus.
    pub fn events(&self) -> Events {
        self.events.clone()
    }

    /// Serves a single, already-accepted duplex byte channel.
    ///
    /// Resolves when the connection has closed. Socket acquisition and TLS
    /// termination stay with the caller.
    pub async fn serve_connection<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (_signal, watch) = drain::channel();
        conn::serve(
            h1io::shared(Box::new(io)),
            Arc::clone(&self.app),
            Arc::clone(&self.config),
            self.events.clone(),
            watch,
            Arc::new(AtomicBool::new(true)),
        )
        .await;
    }

    /// Binds a TCP listener and starts accepting connections.
    pub async fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<Listening> {
        let listener = TcpListener::bind(addr).await.map_err(Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;
        tracing::debug!("listening on {}", local_addr);

        let (signal, watch) = drain::channel();
        let tracker = Arc::new(Tracker::default());

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.app),
            Arc::clone(&self.config),
            self.events.clone(),
            watch,
            Arc::clone(&tracker),
        ));

        Ok(Listening {
            local_addr,
            inner: Arc::new(ListeningInner {
                app: self.app,
                config: self.config,
                events: self.events,
                signal: Mutex::new(Some(signal)),
                accept: Mutex::new(Some(accept)),
                tracker,
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish()
    }
}

/// A running server.
///
/// Dropping the handle does not stop the server; call
/// [`stop`](Listening::stop) for a graceful shutdown.
#[derive(Clone)]
pub struct Listening {
    local_addr: SocketAddr,
    inner: Arc<ListeningInner>,
}

struct ListeningInner {
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
    signal: Mutex<Option<drain::Signal>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    tracker: Arc<Tracker>,
    stopped: AtomicBool,
}

impl Listening {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replaces the routing table.
    ///
    /// Takes effect for subsequent exchanges; in-flight exchanges keep the
    /// handler they already resolved.
    pub fn set_router(&self, router: Router) {
        self.inner.app.set_router(router);
    }

    /// Stops the server: refuses new connections, waits up to the
    /// configured grace period for active exchanges, then interrupts what
    /// is left. Emits [`Event::HttpServerStopped`] once.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let (idling, total) = self.inner.tracker.counts();

        if let Some(signal) = take(&self.inner.signal) {
            signal.drain();
        }
        if let Some(accept) = take(&self.inner.accept) {
            let _ = accept.await;
        }
        if total > 0 {
            tracing::debug!("Closed {} idling children of a total {}.", idling, total);
        }

        let deadline = Instant::now() + self.inner.config.stop_grace_period;
        loop {
            if self.inner.tracker.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                self.inner.tracker.abort_all();
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.events.emit(Event::HttpServerStopped);
    }
}

impl std::fmt::Debug for Listening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listening")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

async fn accept_loop(
    listener: TcpListener,
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
    mut drain: Watch,
    tracker: Arc<Tracker>,
) {
    loop {
        tokio::select! {
            _ = drain.signaled() => {
                tracing::debug!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("accept failed: {}", e);
                        continue;
                    }
                };
                tracing::trace!("accepted connection from {}", peer);
                let _ = stream.set_nodelay(true);

                let id = tracker.next_id();
                let idle = Arc::new(AtomicBool::new(true));
                tracker.insert(id, Arc::clone(&idle));

                let io = h1io::shared(Box::new(stream));
                let task_app = Arc::clone(&app);
                let task_config = Arc::clone(&config);
                let task_events = events.clone();
                let task_drain = drain.clone();
                let task_tracker = Arc::clone(&tracker);
                let handle = tokio::spawn(async move {
                    conn::serve(io, task_app, task_config, task_events, task_drain, idle).await;
                    task_tracker.remove(id);
                });
                tracker.set_handle(id, handle);
            }
        }
    }
    // the listener drops here; connecting to the port fails from now on
}

/// Registry of live connection tasks, for counting and interruption.
#[derive(Default)]
struct Tracker {
    next: AtomicU64,
    conns: Mutex<HashMap<u64, ConnSlot>>,
}

struct ConnSlot {
    idle: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Tracker {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&self, id: u64, idle: Arc<AtomicBool>) {
        self.lock().insert(id, ConnSlot { idle, handle: None });
    }

    fn set_handle(&self, id: u64, handle: JoinHandle<()>) {
        // the task may already have finished and removed itself
        if let Some(slot) = self.lock().get_mut(&id) {
            slot.handle = Some(handle);
        }
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn counts(&self) -> (usize, usize) {
        let conns = self.lock();
        let idling = conns
            .values()
            .filter(|slot| slot.idle.load(Ordering::SeqCst))
            .count();
        (idling, conns.len())
    }

    fn abort_all(&self) {
        let mut conns = self.lock();
        for (_, slot) in conns.drain() {
            if let Some(handle) = slot.handle {
                tracing::debug!("Closing the child because thread interrupted.");
                handle.abort();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnSlot>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }
}
