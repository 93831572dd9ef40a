//! The Client runtime.
//!
//! A `Client` exposes a synchronous API on top of the async runtime:
//! its connection runs as a task on the global runtime, while the
//! caller thread sleep-polls its own pending futures. A call is
//! allowed to suspend only inside the runtime, never on the caller
//! thread.
//!
//! Three call modes exist on a `Link` proxy: synchronous calls,
//! asynchronous future-typed calls accumulated and flushed by
//! `send_pending_requests`, and the admin request flow which may
//! re-run the login exchange inline.

use std::fmt;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::hub::async_runtime as rt;
use crate::hub::collections::{self, HashMap, OrderedMap};
use crate::hub::communication::channel;
use crate::hub::communication::framing::FramedRead;
use crate::hub::communication::message::{
    ClientIdentity, Envelope, MANAGER_SERVICE, NOTIFICATION_UUID,
};
use crate::hub::communication::socket::{self, Transport};
use crate::hub::communication::{self, with_deadline, PeerTx, WriteCmd, DEFAULT_PORT};
use crate::hub::crypto;
use crate::hub::error::*;

// caller threads poll their futures at this cadence
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// how many frames may queue on the writer before callers see
// backpressure
const CHAN_BOUND: usize = 128;

/// Represents a configuration used to connect a `Client`.
pub struct ClientConfig {
    /// The name this Client appears under on the Manager.
    pub name: String,
    /// Hostname of the Manager.
    pub host: String,
    /// Port of the Manager.
    pub port: u16,
    /// Upper bound on waiting for any reply; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Deadline for establishing the connection and finishing the
    /// handshake.
    pub connect_timeout: Duration,
    /// Username presented when the Manager asks to log in.
    pub username: Option<String>,
    /// Password paired with `username`.
    pub password: Option<String>,
    /// The Manager's shared password, when it runs in that mode.
    pub password_manager: Option<String>,
    /// Pinned certificate path; mandatory for non-interactive use
    /// against an unknown TLS Manager.
    pub cert_file: Option<PathBuf>,
    /// Connect without TLS; must match the Manager.
    pub disable_tls: bool,
    /// Trust an unknown certificate without the interactive
    /// confirmation.
    pub assume_trust: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Client".into(),
            host: "localhost".into(),
            port: DEFAULT_PORT,
            timeout: None,
            connect_timeout: Duration::from_secs(10),
            username: None,
            password: None,
            password_manager: None,
            cert_file: None,
            disable_tls: false,
            assume_trust: false,
        }
    }
}

enum FutureSlot {
    Pending,
    Ready(Value),
    /// An envelope delivered without a correlating `uuid`; the
    /// admin request flow inspects it raw.
    Raw(Envelope),
    Cancelled,
}

impl FutureSlot {
    fn is_done(&self) -> bool {
        !matches!(self, FutureSlot::Pending)
    }
}

type FutureRef = Arc<Mutex<FutureSlot>>;

type NotificationHandler = Arc<dyn Fn(Vec<Value>, Map<String, Value>) + Send + Sync>;

struct PendingRequest {
    envelope: Envelope,
    sent: bool,
}

struct Shared {
    tx: Mutex<Option<PeerTx>>,
    futures: Mutex<HashMap<String, FutureRef>>,
    requests: Mutex<OrderedMap<String, PendingRequest>>,
    latest_error: Mutex<Option<String>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            tx: Mutex::new(None),
            futures: Mutex::new(collections::hash_map()),
            requests: Mutex::new(collections::ordered_map()),
            latest_error: Mutex::new(None),
            notification_handlers: Mutex::new(collections::hash_map()),
        }
    }

    fn cancel_all_futures(&self) {
        for slot in self.futures.lock().values() {
            let mut slot = slot.lock();
            if !slot.is_done() {
                *slot = FutureSlot::Cancelled;
            }
        }
    }

    fn queue_frame(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.encode()?;
        let mut guard = self.tx.lock();
        let tx = guard
            .as_mut()
            .ok_or_else(|| Error::wrapped(ErrorKind::TransportLost, "Not connected"))?;
        tx.try_send(WriteCmd::Frame(payload))
    }
}

/// A connection to a Network Manager.
pub struct Client {
    shared: Arc<Shared>,
    name: String,
    address_manager: String,
    timeout: Mutex<Option<Duration>>,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("name", &self.name).finish()
    }
}

/// Connects a new Client to a Network Manager.
///
/// Blocks the calling thread until the handshake completes; requires
/// `hermod::init` to have run.
pub fn connect(cfg: ClientConfig) -> Result<Client> {
    let name = cfg.name.clone();
    let address_manager = format!("{}:{}", cfg.host, cfg.port);
    let timeout = cfg.timeout;
    let username = cfg.username.clone();
    let password = cfg.password.clone();
    // connecting, TLS, and the prompt exchange each eat into this
    let ready_deadline = cfg.connect_timeout * 2;

    let shared = Arc::new(Shared::new());
    let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();

    rt::spawn(connection_loop(cfg, shared.clone(), ready_tx));

    match ready_rx.recv_timeout(ready_deadline) {
        Ok(Ok(())) => (),
        Ok(Err(reason)) => {
            return Err(Error::wrapped(ErrorKind::Client, reason));
        }
        Err(_) => {
            return Err(Error::wrapped(
                ErrorKind::Timeout,
                format!("The connection to {} was not established", address_manager),
            ));
        }
    }
    info!(name = %name, manager = %address_manager, "connected");

    Ok(Client {
        shared,
        name,
        address_manager,
        timeout: Mutex::new(timeout),
        username,
        password,
    })
}

async fn connection_loop(
    cfg: ClientConfig,
    shared: Arc<Shared>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let outcome = bootstrap(&cfg, &shared).await;
    let mut reader = match outcome {
        Ok(reader) => reader,
        Err(e) => {
            ready.send(Err(e.to_string())).unwrap_or(());
            return;
        }
    };

    let identity = ClientIdentity {
        name: cfg.name.clone(),
        language: communication::language(),
        os: communication::os_string(),
    };

    let mut ready = Some(ready);
    let mut handshake_finished = false;

    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "failed to decode a frame");
                continue;
            }
        };

        if envelope.error {
            let mut rendered = envelope.traceback.join("\n");
            if let Some(message) = &envelope.message {
                if !rendered.is_empty() {
                    rendered.push('\n');
                }
                rendered.push_str(message);
            }
            *shared.latest_error.lock() = Some(rendered.clone());
            shared.cancel_all_futures();
            if let Some(ready) = ready.take() {
                ready.send(Err(rendered)).unwrap_or(());
            }
            continue;
        }

        if !handshake_finished {
            let attribute = envelope.attribute.as_deref().unwrap_or_default();
            let requester = envelope.requester.as_deref().unwrap_or_default();
            let reply = match attribute {
                "username" => Envelope::reply(
                    Value::String(cfg.username.clone().unwrap_or_default()),
                    "",
                    "",
                ),
                "password" => {
                    // a login prompt names the user; anything else is
                    // the Manager asking for its own password
                    let password = if requester == cfg.username.as_deref().unwrap_or("") {
                        cfg.password.clone().or_else(|| cfg.password_manager.clone())
                    } else {
                        cfg.password_manager.clone().or_else(|| cfg.password.clone())
                    };
                    Envelope::reply(Value::String(password.unwrap_or_default()), "", "")
                }
                "identity" => {
                    handshake_finished = true;
                    Envelope::reply(identity.to_value(), "", "")
                }
                other => {
                    debug!(attribute = other, "unexpected handshake prompt");
                    continue;
                }
            };
            if shared.queue_frame(&reply).is_err() {
                break;
            }
            if handshake_finished {
                if let Some(ready) = ready.take() {
                    ready.send(Ok(())).unwrap_or(());
                }
            }
            continue;
        }

        if envelope.uuid == NOTIFICATION_UUID {
            let service = envelope.service.clone().unwrap_or_default();
            let handler = shared.notification_handlers.lock().get(&service).cloned();
            if let Some(handler) = handler {
                let (args, kwargs) = envelope.notification_payload();
                handler(args, kwargs);
            }
            continue;
        }

        if !envelope.uuid.is_empty() {
            let slot = shared.futures.lock().get(&envelope.uuid).cloned();
            match slot {
                Some(slot) => {
                    *slot.lock() = FutureSlot::Ready(envelope.result.unwrap_or(Value::Null));
                }
                None => debug!(uuid = %envelope.uuid, "reply for an unknown request"),
            }
            continue;
        }

        // an admin-flow envelope: no uuid, resolved against the one
        // pending future
        let pending: Vec<FutureRef> = shared
            .futures
            .lock()
            .values()
            .filter(|slot| !slot.lock().is_done())
            .cloned()
            .collect();
        if pending.len() == 1 {
            *pending[0].lock() = FutureSlot::Raw(envelope);
        } else {
            *shared.latest_error.lock() = Some(format!(
                "uuid not defined and {} futures are pending",
                pending.len()
            ));
            shared.cancel_all_futures();
        }
    }

    // connection lost
    debug!("connection lost");
    shared.cancel_all_futures();
    *shared.tx.lock() = None;
    if let Some(ready) = ready.take() {
        ready.send(Err("The connection was closed during the handshake".into()))
            .unwrap_or(());
    }
}

async fn bootstrap(
    cfg: &ClientConfig,
    shared: &Arc<Shared>,
) -> Result<FramedRead<impl futures::io::AsyncRead + Unpin>> {
    let addr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .wrapped(ErrorKind::Client)?
        .next()
        .ok_or_else(|| Error::wrapped(ErrorKind::Client, "Hostname resolved to no address"))?;

    let sock = with_deadline(cfg.connect_timeout, socket::connect(addr))
        .await
        .map_err(|_| {
            Error::wrapped(
                ErrorKind::Timeout,
                format!("Cannot connect to {}:{}", cfg.host, cfg.port),
            )
        })??;

    let transport = if cfg.disable_tls {
        Transport::Plain(sock)
    } else {
        let tls =
            crypto::client_config(addr, &cfg.host, cfg.cert_file.as_deref(), cfg.assume_trust)
                .await?;
        let connector = async_tls::TlsConnector::from(Arc::new(tls));
        let stream = connector
            .connect(&cfg.host, sock)
            .await
            .wrapped_msg(ErrorKind::Client, "TLS handshake failed")?;
        Transport::TlsClient(stream)
    };

    use futures::io::AsyncReadExt;
    let (read_half, write_half) = transport.split();
    let (tx, rx) = channel::new_bounded::<WriteCmd>(CHAN_BOUND);
    rt::spawn(communication::writer_task(write_half, rx));
    *shared.tx.lock() = Some(tx);
    Ok(FramedRead::new(read_half))
}

/// A future-typed handle to one outstanding request.
pub struct ReplyFuture {
    uuid: String,
    slot: FutureRef,
    shared: Arc<Shared>,
    timeout: Option<Duration>,
}

impl ReplyFuture {
    /// Whether the reply has arrived (or the request was cancelled).
    pub fn done(&self) -> bool {
        self.slot.lock().is_done()
    }

    /// Blocks until the reply arrives, yielding its value.
    pub fn result(self) -> Result<Value> {
        wait_for(&self.shared, Some(&self.uuid), self.timeout)?;
        let state = std::mem::replace(&mut *self.slot.lock(), FutureSlot::Cancelled);
        self.shared.futures.lock().remove(&self.uuid);
        self.shared.requests.lock().remove(&self.uuid);
        match state {
            FutureSlot::Ready(value) => Ok(value),
            FutureSlot::Raw(envelope) => Ok(envelope.result.unwrap_or(Value::Null)),
            _ => Err(latest_error_of(&self.shared)),
        }
    }
}

fn latest_error_of(shared: &Shared) -> Error {
    match shared.latest_error.lock().clone() {
        Some(message) => Error::wrapped(ErrorKind::Client, message),
        None => Error::wrapped(ErrorKind::Client, "The request was cancelled"),
    }
}

// sleep-polls futures on the caller thread; `uuid` of `None` waits
// for every registered future
fn wait_for(shared: &Shared, uuid: Option<&str>, timeout: Option<Duration>) -> Result<()> {
    let watched: Vec<FutureRef> = match uuid {
        Some(uuid) => shared
            .futures
            .lock()
            .get(uuid)
            .cloned()
            .into_iter()
            .collect(),
        None => shared.futures.lock().values().cloned().collect(),
    };

    let t0 = Instant::now();
    loop {
        if watched.iter().all(|slot| slot.lock().is_done()) {
            break;
        }
        if let Some(timeout) = timeout {
            if t0.elapsed() > timeout {
                let requests = shared.requests.lock();
                let mut pending = Vec::new();
                for (uuid, request) in requests.iter() {
                    let done = shared
                        .futures
                        .lock()
                        .get(uuid)
                        .map(|slot| slot.lock().is_done())
                        .unwrap_or(true);
                    if !done {
                        pending.push(format!(
                            "{}.{}",
                            request.envelope.service.as_deref().unwrap_or_default(),
                            request.envelope.attribute.as_deref().unwrap_or_default(),
                        ));
                    }
                }
                return Err(Error::wrapped(
                    ErrorKind::Timeout,
                    format!(
                        "The following requests are still pending: {}",
                        pending.join(", ")
                    ),
                ));
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    // a cancelled future means the Manager returned an error
    let cancelled = watched
        .iter()
        .any(|slot| matches!(&*slot.lock(), FutureSlot::Cancelled));
    if cancelled {
        return Err(latest_error_of(shared));
    }
    Ok(())
}

impl Client {
    /// The name of this connection on the Manager.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `host:port` of the Manager this Client talks to.
    pub fn address_manager(&self) -> &str {
        &self.address_manager
    }

    /// Changes the reply timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    /// The latest error envelope received, if any.
    pub fn latest_error(&self) -> Option<String> {
        self.shared.latest_error.lock().clone()
    }

    fn register(&self, envelope: Envelope, sent: bool) -> (String, FutureRef) {
        let uuid = envelope.uuid.clone();
        let slot: FutureRef = Arc::new(Mutex::new(FutureSlot::Pending));
        self.shared.futures.lock().insert(uuid.clone(), slot.clone());
        self.shared
            .requests
            .lock()
            .insert(uuid.clone(), PendingRequest { envelope, sent });
        (uuid, slot)
    }

    fn remove(&self, uuid: &str) {
        self.shared.futures.lock().remove(uuid);
        self.shared.requests.lock().remove(uuid);
    }

    // synchronous round trip of one envelope
    fn round_trip(&self, envelope: Envelope) -> Result<Value> {
        let (uuid, slot) = self.register(envelope, true);
        let request = self.shared.requests.lock().get(&uuid).map(|r| r.envelope.clone());
        if let Some(request) = request {
            if let Err(e) = self.shared.queue_frame(&request) {
                self.remove(&uuid);
                return Err(e);
            }
        }
        let outcome = wait_for(&self.shared, Some(&uuid), *self.timeout.lock());
        let state = std::mem::replace(&mut *slot.lock(), FutureSlot::Cancelled);
        self.remove(&uuid);
        outcome?;
        match state {
            FutureSlot::Ready(value) => Ok(value),
            FutureSlot::Raw(envelope) => Ok(envelope.result.unwrap_or(Value::Null)),
            _ => Err(latest_error_of(&self.shared)),
        }
    }

    fn fresh_uuid() -> String {
        Uuid::new_v4().to_string()
    }

    /// Requests the Manager identity snapshot.
    pub fn manager_identity(&self) -> Result<Value> {
        let envelope = Envelope::request(
            MANAGER_SERVICE,
            "identity",
            vec![],
            Map::new(),
            &Self::fresh_uuid(),
        );
        self.round_trip(envelope)
    }

    /// Links this Client with a named Service.
    pub fn link(&self, service: &str) -> Result<Link> {
        debug!(service, "preparing to link");
        let envelope = Envelope::request(
            MANAGER_SERVICE,
            "link",
            vec![Value::String(service.into())],
            Map::new(),
            &Self::fresh_uuid(),
        );
        let identity = self.round_trip(envelope)?;
        Ok(Link {
            shared: self.shared.clone(),
            client_timeout: *self.timeout.lock(),
            service: service.to_string(),
            identity,
        })
    }

    /// Sends every request registered by asynchronous calls, then
    /// blocks until all of their futures resolve.
    pub fn send_pending_requests(&self) -> Result<()> {
        let unsent: Vec<Envelope> = {
            let mut requests = self.shared.requests.lock();
            let mut unsent = Vec::new();
            for (_, request) in requests.iter_mut() {
                if !request.sent {
                    request.sent = true;
                    unsent.push(request.envelope.clone());
                }
            }
            unsent
        };
        for envelope in unsent {
            debug!(
                service = envelope.service.as_deref().unwrap_or_default(),
                attribute = envelope.attribute.as_deref().unwrap_or_default(),
                "sending request"
            );
            self.shared.queue_frame(&envelope)?;
        }
        wait_for(&self.shared, None, *self.timeout.lock())
    }

    /// Sends an administrative request to the Manager.
    ///
    /// If the Manager replies with `username`/`password` prompts (the
    /// connection lacked administrator privilege), the configured
    /// credentials answer each prompt before the final result.
    pub fn admin_request(
        &self,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.admin_request_with(attribute, args, kwargs, None, None)
    }

    /// Same as `admin_request`, with explicit credentials.
    pub fn admin_request_with(
        &self,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Value> {
        let envelope = Envelope::request(
            MANAGER_SERVICE,
            attribute,
            args,
            kwargs,
            &Self::fresh_uuid(),
        );
        let (uuid, slot) = self.register(envelope.clone(), true);
        if let Err(e) = self.shared.queue_frame(&envelope) {
            self.remove(&uuid);
            return Err(e);
        }

        loop {
            let outcome = wait_for(&self.shared, Some(&uuid), *self.timeout.lock());
            let state = std::mem::replace(&mut *slot.lock(), FutureSlot::Pending);
            if let Err(e) = outcome {
                self.remove(&uuid);
                return Err(e);
            }
            match state {
                FutureSlot::Ready(value) => {
                    self.remove(&uuid);
                    return Ok(value);
                }
                FutureSlot::Raw(reply) => {
                    if reply.result.is_some() && reply.attribute.is_none() {
                        self.remove(&uuid);
                        return Ok(reply.result.unwrap_or(Value::Null));
                    }
                    // a username or password prompt: answer it and
                    // keep waiting on the same slot
                    let answer = match reply.attribute.as_deref() {
                        Some("username") => username
                            .map(String::from)
                            .or_else(|| self.credential("username"))
                            .unwrap_or_default(),
                        Some("password") => password
                            .map(String::from)
                            .or_else(|| self.credential("password"))
                            .unwrap_or_default(),
                        _ => {
                            self.remove(&uuid);
                            return Err(Error::wrapped(
                                ErrorKind::Client,
                                "Unexpected admin prompt from the Manager",
                            ));
                        }
                    };
                    let reply = Envelope::reply(Value::String(answer), "", "");
                    self.shared.queue_frame(&reply)?;
                }
                _ => {
                    self.remove(&uuid);
                    return Err(latest_error_of(&self.shared));
                }
            }
        }
    }

    // connection-time credentials, re-used by the admin flow
    fn credential(&self, which: &str) -> Option<String> {
        match which {
            "username" => self.username.clone(),
            _ => self.password.clone(),
        }
    }

    /// Gracefully disconnects from the Manager.
    pub fn disconnect(&self) {
        let envelope = Envelope::disconnect();
        if self.shared.queue_frame(&envelope).is_ok() {
            // the Manager answers by closing the socket; wait
            // briefly for the loop to observe it
            let _ = wait_for_disconnect(&self.shared, Duration::from_secs(2));
        }
        let mut guard = self.shared.tx.lock();
        if let Some(tx) = guard.as_mut() {
            tx.try_send(WriteCmd::Close).unwrap_or(());
        }
        *guard = None;
    }
}

fn wait_for_disconnect(shared: &Shared, timeout: Duration) -> Result<()> {
    let t0 = Instant::now();
    while shared.tx.lock().is_some() {
        if t0.elapsed() > timeout {
            return Err(Error::simple(ErrorKind::Timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut guard = self.shared.tx.lock();
        if let Some(tx) = guard.as_mut() {
            if let Ok(payload) = Envelope::disconnect().encode() {
                tx.try_send(WriteCmd::Frame(payload)).unwrap_or(());
            }
            tx.try_send(WriteCmd::Close).unwrap_or(());
        }
        *guard = None;
    }
}

/// A proxy for calling one linked Service.
pub struct Link {
    shared: Arc<Shared>,
    client_timeout: Option<Duration>,
    service: String,
    identity: Value,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("service", &self.service).finish()
    }
}

impl Link {
    /// The name of the linked Service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The identity the Service registered with, as returned by the
    /// Manager when the link was acknowledged.
    pub fn identity(&self) -> &Value {
        &self.identity
    }

    /// Synchronously calls an attribute of the linked Service.
    ///
    /// Fails if asynchronous futures are pending; flush them with
    /// `Client::send_pending_requests` first.
    pub fn call(
        &self,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        if !self.shared.futures.lock().is_empty() {
            return Err(Error::wrapped(
                ErrorKind::Client,
                "Asynchronous requests are pending. You must call \
                 send_pending_requests() to wait for them to finish \
                 before sending a synchronous request",
            ));
        }
        let uuid = Uuid::new_v4().to_string();
        let envelope = Envelope::request(&self.service, attribute, args, kwargs, &uuid);

        let slot: FutureRef = Arc::new(Mutex::new(FutureSlot::Pending));
        self.shared.futures.lock().insert(uuid.clone(), slot.clone());
        self.shared.requests.lock().insert(
            uuid.clone(),
            PendingRequest {
                envelope: envelope.clone(),
                sent: true,
            },
        );

        let send = self.shared.queue_frame(&envelope);
        if let Err(e) = send {
            self.shared.futures.lock().remove(&uuid);
            self.shared.requests.lock().remove(&uuid);
            return Err(e);
        }
        let outcome = wait_for(&self.shared, Some(&uuid), self.client_timeout);
        let state = std::mem::replace(&mut *slot.lock(), FutureSlot::Cancelled);
        self.shared.futures.lock().remove(&uuid);
        self.shared.requests.lock().remove(&uuid);
        outcome?;
        match state {
            FutureSlot::Ready(value) => Ok(value),
            _ => Err(latest_error_of(&self.shared)),
        }
    }

    /// Registers a request without writing it, returning its future.
    ///
    /// Accumulate several, then flush them together with
    /// `Client::send_pending_requests`.
    pub fn call_async(
        &self,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ReplyFuture {
        let uuid = Uuid::new_v4().to_string();
        let envelope = Envelope::request(&self.service, attribute, args, kwargs, &uuid);
        let slot: FutureRef = Arc::new(Mutex::new(FutureSlot::Pending));
        self.shared.futures.lock().insert(uuid.clone(), slot.clone());
        self.shared.requests.lock().insert(
            uuid.clone(),
            PendingRequest {
                envelope,
                sent: false,
            },
        );
        debug!(
            service = %self.service,
            attribute,
            "created request"
        );
        ReplyFuture {
            uuid,
            slot,
            shared: self.shared.clone(),
            timeout: self.client_timeout,
        }
    }

    /// Installs the handler invoked for every notification this
    /// Service emits.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) + Send + Sync + 'static,
    {
        self.shared
            .notification_handlers
            .lock()
            .insert(self.service.clone(), Arc::new(handler));
    }

    /// Removes this Client from the Service's link set.
    pub fn unlink(self) -> Result<()> {
        self.shared
            .notification_handlers
            .lock()
            .remove(&self.service);
        let uuid = Uuid::new_v4().to_string();
        let envelope = Envelope::request(
            MANAGER_SERVICE,
            "unlink",
            vec![Value::String(self.service.clone())],
            Map::new(),
            &uuid,
        );
        let slot: FutureRef = Arc::new(Mutex::new(FutureSlot::Pending));
        self.shared.futures.lock().insert(uuid.clone(), slot.clone());
        self.shared.queue_frame(&envelope)?;
        let outcome = wait_for(&self.shared, Some(&uuid), self.client_timeout);
        self.shared.futures.lock().remove(&uuid);
        outcome.map(|_| ())
    }
}
