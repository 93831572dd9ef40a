//! The Service runtime.
//!
//! A Service declares its operations in an explicit registration
//! table (each attribute is either a plain value or a handler with a
//! signature string), connects to a Manager, answers the handshake
//! prompts, and then serves requests. Handlers execute on a worker
//! pool so a slow call never stalls the connection task; value
//! attributes reply immediately.
//!
//! A Service connection moves through
//! `connecting → authenticating → identifying → serving → closing`,
//! with every transition triggered by an incoming envelope. A
//! malformed envelope while serving is answered with an error
//! envelope and the state is preserved.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::hub::async_runtime as rt;
use crate::hub::collections::{self, OrderedMap};
use crate::hub::communication::channel;
use crate::hub::communication::framing::FramedRead;
use crate::hub::communication::message::Envelope;
use crate::hub::communication::socket::{self, Transport};
use crate::hub::communication::{self, with_deadline, PeerTx, WriteCmd, DEFAULT_PORT};
use crate::hub::crypto;
use crate::hub::error::*;
use crate::hub::threadpool::{self, ThreadPool};

const CHAN_BOUND: usize = 128;

// a Client must never learn a user password through reflection
const PASSWORD_MESSAGE: &str = "You do not have permission to receive the password";

/// What a request handler failed with; rendered into the error
/// envelope sent back to the requesting Client.
#[derive(Debug, Clone)]
pub struct ServiceError {
    kind: String,
    message: String,
}

impl ServiceError {
    /// A failure of kind `kind` (e.g. `"ValueError"`) with a human
    /// readable message.
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The result type request handlers return.
pub type HandlerResult = std::result::Result<Value, ServiceError>;

type Handler = Arc<dyn Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync>;

enum Attribute {
    /// Replied immediately from the connection task.
    Value(Value),
    /// Scheduled on the worker pool.
    Handler { signature: String, handler: Handler },
}

/// Assembles a `Service` from explicit attribute registrations.
pub struct ServiceBuilder {
    name: String,
    attributes: OrderedMap<String, Attribute>,
    max_clients: i64,
    workers: usize,
    shutdown_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ServiceBuilder {
    /// Starts building a Service named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            attributes: collections::ordered_map(),
            max_clients: -1,
            workers: 4,
            shutdown_hook: None,
        }
    }

    /// Registers a value attribute; requests for it reply with the
    /// value itself.
    pub fn value(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.into(), Attribute::Value(value));
        self
    }

    /// Registers a callable attribute with its signature string.
    ///
    /// The signature is documentation only; nothing validates the
    /// arguments against it.
    pub fn method<F>(mut self, name: &str, signature: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.attributes.insert(
            name.into(),
            Attribute::Handler {
                signature: signature.into(),
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Caps how many Clients may link with this Service;
    /// a value less than or equal to zero means unlimited.
    pub fn max_clients(mut self, max_clients: i64) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Sets the size of the worker pool executing handlers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Installs a hook invoked when the connection to the Manager
    /// is lost.
    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shutdown_hook = Some(Arc::new(hook));
        self
    }

    /// Finishes the registration table.
    pub fn build(self) -> Service {
        let pool = threadpool::Builder::new().num_threads(self.workers).build();
        Service {
            inner: Arc::new(ServiceInner {
                name: self.name,
                attributes: self.attributes,
                max_clients: self.max_clients,
                shutdown_hook: self.shutdown_hook,
                pool,
                tx: Mutex::new(None),
            }),
        }
    }
}

struct ServiceInner {
    name: String,
    attributes: OrderedMap<String, Attribute>,
    max_clients: i64,
    shutdown_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    pool: ThreadPool,
    tx: Mutex<Option<PeerTx>>,
}

impl ServiceInner {
    /// The identity declared during the handshake: public attribute
    /// names mapped to signature strings (or, for value attributes,
    /// the value itself). Private names stay out of the catalog.
    fn identity(&self) -> Value {
        let mut attributes = Map::new();
        for (name, attribute) in self.attributes.iter() {
            if name.starts_with('_') {
                continue;
            }
            let value = match attribute {
                Attribute::Value(value) => value.clone(),
                Attribute::Handler { signature, .. } => Value::String(signature.clone()),
            };
            attributes.insert(name.clone(), value);
        }
        json!({
            "type": "service",
            "name": self.name,
            "attributes": attributes,
            "language": communication::language(),
            "os": communication::os_string(),
            "max_clients": self.max_clients,
        })
    }
}

/// Represents a configuration used to start a `Service`.
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_manager: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub disable_tls: bool,
    pub assume_trust: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
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

/// A Service assembled by a `ServiceBuilder`.
pub struct Service {
    inner: Arc<ServiceInner>,
}

/// A handle to a running Service connection.
pub struct ServiceHandle {
    done: oneshot::Receiver<()>,
}

impl ServiceHandle {
    /// Blocks until the Service disconnects from the Manager.
    pub fn wait(self) {
        self.done.recv().unwrap_or(());
    }
}

/// A clonable handle that emits notifications to every linked
/// Client, usable from any thread.
#[derive(Clone)]
pub struct Notifier {
    name: String,
    inner: Arc<ServiceInner>,
}

impl Notifier {
    /// Emits one notification; linked Clients receive `args` and
    /// `kwargs` in their notification handlers. A Notifier of a not
    /// yet connected Service drops the notification.
    pub fn emit_notification(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<()> {
        let envelope = Envelope::notification(&self.name, args, kwargs);
        let payload = envelope.encode()?;
        let mut guard = self.inner.tx.lock();
        match guard.as_mut() {
            Some(tx) => tx.try_send(WriteCmd::Frame(payload)),
            None => Ok(()),
        }
    }
}

impl Service {
    /// The name this Service registers under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the notification emitter for this Service.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            name: self.inner.name.clone(),
            inner: self.inner.clone(),
        }
    }

    /// Gracefully closes the connection to the Manager.
    ///
    /// Linked Clients observe the loss through the Manager's abort
    /// fan-out; the shutdown hook runs once the connection task
    /// notices the close.
    pub fn disconnect(&self) {
        let mut guard = self.inner.tx.lock();
        if let Some(tx) = guard.as_mut() {
            tx.try_send(WriteCmd::Close).unwrap_or(());
        }
        *guard = None;
    }

    /// Connects to the Manager and starts serving requests.
    ///
    /// Blocks the calling thread until the handshake completes;
    /// requires `hermod::init` to have run.
    pub fn start(&self, cfg: ServiceConfig) -> Result<ServiceHandle> {
        if self.inner.tx.lock().is_some() {
            return Err("The service has already been started").wrapped(ErrorKind::Service);
        }
        let ready_deadline = cfg.connect_timeout * 2;
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        rt::spawn(connection_loop(cfg, self.inner.clone(), ready_tx, done_tx));

        match ready_rx.recv_timeout(ready_deadline) {
            Ok(Ok(())) => (),
            Ok(Err(reason)) => return Err(Error::wrapped(ErrorKind::Service, reason)),
            Err(_) => {
                return Err(Error::wrapped(
                    ErrorKind::Timeout,
                    "The connection to the Manager was not established",
                ))
            }
        }
        info!(service = %self.inner.name, "serving");
        Ok(ServiceHandle { done: done_rx })
    }
}

// the connection state machine; every transition is triggered by an
// incoming envelope
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnPhase {
    Authenticating,
    Identifying,
    Serving,
}

async fn connection_loop(
    cfg: ServiceConfig,
    inner: Arc<ServiceInner>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
    done: oneshot::Sender<()>,
) {
    let mut reader = match bootstrap(&cfg, &inner).await {
        Ok(reader) => reader,
        Err(e) => {
            ready.send(Err(e.to_string())).unwrap_or(());
            done.send(()).unwrap_or(());
            return;
        }
    };

    let mut ready = Some(ready);
    let mut phase = ConnPhase::Authenticating;

    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                // answered, and the phase is preserved
                error!(service = %inner.name, error = %e, "failed to decode a frame");
                let reply = Envelope::error_message(
                    format!("ProtocolError: {}", e),
                    "",
                    "",
                );
                queue(&inner, &reply);
                continue;
            }
        };

        if envelope.error {
            // only the Manager sends errors to a Service, e.g. a
            // rejected handshake; log it, never reply
            let mut rendered = envelope.traceback.join("\n");
            if let Some(message) = &envelope.message {
                if !rendered.is_empty() {
                    rendered.push('\n');
                }
                rendered.push_str(message);
            }
            error!(service = %inner.name, "{}", rendered);
            if let Some(ready) = ready.take() {
                ready.send(Err(rendered)).unwrap_or(());
            }
            continue;
        }

        match phase {
            ConnPhase::Authenticating | ConnPhase::Identifying => {
                let attribute = envelope.attribute.as_deref().unwrap_or_default();
                let requester = envelope.requester.as_deref().unwrap_or_default();
                let reply = match attribute {
                    "username" => Envelope::reply(
                        Value::String(cfg.username.clone().unwrap_or_default()),
                        "",
                        "",
                    ),
                    "password" => {
                        let password = if requester == cfg.username.as_deref().unwrap_or("") {
                            cfg.password.clone().or_else(|| cfg.password_manager.clone())
                        } else {
                            cfg.password_manager.clone().or_else(|| cfg.password.clone())
                        };
                        Envelope::reply(Value::String(password.unwrap_or_default()), "", "")
                    }
                    "identity" => {
                        phase = ConnPhase::Serving;
                        Envelope::reply(inner.identity(), "", "")
                    }
                    other => {
                        debug!(attribute = other, "unexpected handshake prompt");
                        continue;
                    }
                };
                queue(&inner, &reply);
                if phase == ConnPhase::Serving {
                    if let Some(ready) = ready.take() {
                        ready.send(Ok(())).unwrap_or(());
                    }
                }
            }
            ConnPhase::Serving => serve_request(&inner, envelope),
        }
    }

    // closing
    info!(service = %inner.name, "connection lost");
    *inner.tx.lock() = None;
    if let Some(hook) = &inner.shutdown_hook {
        hook();
    }
    if let Some(ready) = ready.take() {
        ready.send(Err("The connection was closed during the handshake".into()))
            .unwrap_or(());
    }
    done.send(()).unwrap_or(());
}

fn serve_request(inner: &Arc<ServiceInner>, envelope: Envelope) {
    let requester = envelope.requester.clone().unwrap_or_default();
    let uuid = envelope.uuid.clone();
    let attribute = match envelope.attribute.clone() {
        Some(attribute) => attribute,
        None => {
            let reply = Envelope::error_message(
                "ProtocolError: The request names no attribute".into(),
                &requester,
                &uuid,
            );
            queue(inner, &reply);
            return;
        }
    };

    let found = inner.attributes.get(&attribute);
    match found {
        None => {
            let reply = Envelope::error_message(
                format!(
                    "AttributeError: {:?} service has no attribute {:?}",
                    inner.name, attribute
                ),
                &requester,
                &uuid,
            );
            queue(inner, &reply);
        }
        Some(Attribute::Value(value)) => {
            let value = if attribute.starts_with("_password") {
                Value::String(PASSWORD_MESSAGE.into())
            } else {
                value.clone()
            };
            queue(inner, &Envelope::reply(value, &requester, &uuid));
        }
        Some(Attribute::Handler { handler, .. }) => {
            info!(service = %inner.name, requester = %requester, attribute = %attribute, "executing");
            let handler = handler.clone();
            let worker_inner = inner.clone();
            let args = envelope.args;
            let kwargs = envelope.kwargs;
            inner.pool.execute(move || {
                let reply = match handler(args, kwargs) {
                    Ok(value) => Envelope::reply(value, &requester, &uuid),
                    Err(e) => {
                        error!(service = %worker_inner.name, error = %e, "request failed");
                        let traceback = vec![
                            format!(
                                "{:?} raised an exception while executing {:?}",
                                worker_inner.name, attribute
                            ),
                            e.to_string(),
                        ];
                        Envelope::error_message(e.to_string(), &requester, &uuid)
                            .with_traceback(traceback)
                    }
                };
                // the worker thread may block until the writer
                // drains; only its own reply is delayed
                match reply.encode() {
                    Ok(payload) => {
                        let tx = worker_inner.tx.lock().clone();
                        if let Some(mut tx) = tx {
                            futures::executor::block_on(tx.send(WriteCmd::Frame(payload)))
                                .unwrap_or(());
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode a reply"),
                }
            });
        }
    }
}

fn queue(inner: &Arc<ServiceInner>, envelope: &Envelope) {
    let payload = match envelope.encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode an envelope");
            return;
        }
    };
    let mut guard = inner.tx.lock();
    if let Some(tx) = guard.as_mut() {
        tx.try_send(WriteCmd::Frame(payload)).unwrap_or(());
    }
}

async fn bootstrap(
    cfg: &ServiceConfig,
    inner: &Arc<ServiceInner>,
) -> Result<FramedRead<impl futures::io::AsyncRead + Unpin>> {
    let addr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .wrapped(ErrorKind::Service)?
        .next()
        .ok_or_else(|| Error::wrapped(ErrorKind::Service, "Hostname resolved to no address"))?;

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
            .wrapped_msg(ErrorKind::Service, "TLS handshake failed")?;
        Transport::TlsClient(stream)
    };

    use futures::io::AsyncReadExt;
    let (read_half, write_half) = transport.split();
    let (tx, rx) = channel::new_bounded::<WriteCmd>(CHAN_BOUND);
    rt::spawn(communication::writer_task(write_half, rx));
    *inner.tx.lock() = Some(tx);
    Ok(FramedRead::new(read_half))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_service() -> Service {
        ServiceBuilder::new("Echo")
            .method("echo", "(*args, **kwargs) -> [args, kwargs]", |args, kwargs| {
                Ok(json!([args, kwargs]))
            })
            .value("label", json!("my label"))
            .value("_password_hint", json!("swordfish"))
            .build()
    }

    #[test]
    fn test_identity_catalog() {
        let service = echo_service();
        let identity = service.inner.identity();
        assert_eq!(identity["type"], "service");
        assert_eq!(identity["name"], "Echo");
        assert_eq!(identity["max_clients"], -1);
        let attributes = identity["attributes"].as_object().unwrap();
        assert_eq!(
            attributes["echo"],
            json!("(*args, **kwargs) -> [args, kwargs]")
        );
        assert_eq!(attributes["label"], json!("my label"));
        // private names stay out of the catalog
        assert!(!attributes.contains_key("_password_hint"));
    }

    #[test]
    fn test_max_clients_in_identity() {
        let service = ServiceBuilder::new("Solo").max_clients(1).build();
        assert_eq!(service.inner.identity()["max_clients"], 1);
    }
}
