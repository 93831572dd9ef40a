//! The network Manager: a hub accepting TCP connections from
//! Clients and Services, brokering JSON envelopes between them.
//!
//! Each accepted socket is driven by three tasks: a connection task
//! that runs the handshake and then reads frames, a writer task that
//! drains the peer's message channel into the socket, and the one
//! dispatcher task shared by every peer, which owns the registry and
//! performs all routing. Ordering within one peer socket is
//! preserved by reading one envelope at a time; no ordering is
//! promised across distinct sockets.

pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use either::Either;
use futures::future::{self, Either as FutEither};
use futures::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::hub::auth::{self, AuthPolicy, HandshakeIo, HandshakeVerdict};
use crate::hub::async_runtime as rt;
use crate::hub::communication::channel::{self, ChannelRx, ChannelTx};
use crate::hub::communication::framing::{self, FramedRead};
use crate::hub::communication::message::{
    classify, Envelope, MessageClass, PeerIdentity, WireErrorKind,
};
use crate::hub::communication::socket::{self, Listener, Socket, Transport};
use crate::hub::communication::{self, writer_task, PeerAddr, DEFAULT_PORT};
use crate::hub::crypto;
use crate::hub::database::{ConnectionsTable, HostnamesTable, UsersTable};
use crate::hub::error::*;
use crate::hub::terminal::parse_terminal_input;

use self::registry::{LinkOutcome, ReauthPhase, Registry, RemovedPeer};

pub(crate) use crate::hub::communication::{PeerTx, WriteCmd};

// max no. of messages allowed in a peer or dispatcher channel
const CHAN_BOUND: usize = 128;

/// Represents a configuration used to start a `Manager`.
pub struct ManagerConfig {
    /// The port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Shared password all peers must present. Exclusive with
    /// `login` and `hostnames`.
    pub password: Option<String>,
    /// Check username/password pairs against the users table.
    /// Exclusive with `password` and `hostnames`.
    pub login: bool,
    /// Trusted hostnames allowed to connect. An empty list loads
    /// the hostnames table. Exclusive with `password` and `login`.
    pub hostnames: Option<Vec<String>>,
    /// Path of the SQLite database; `None` loads the default.
    pub database: Option<PathBuf>,
    /// Disables TLS on the listening socket.
    pub disable_tls: bool,
    /// PEM certificate chain presented to connecting peers.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// How long a peer may take to answer each handshake prompt.
    pub handshake_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: None,
            login: false,
            hostnames: None,
            database: None,
            disable_tls: false,
            cert_file: None,
            key_file: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// A handle to a running `Manager`.
pub struct ManagerHandle {
    port: u16,
    tx: ChannelTx<Event>,
    done: oneshot::Receiver<()>,
}

impl ManagerHandle {
    /// The port the Manager is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Asks the Manager to close every peer socket and stop.
    pub async fn shutdown(&mut self) {
        self.tx.send(Event::Shutdown).await.unwrap_or(());
    }

    /// Waits until the Manager has stopped.
    pub async fn wait(self) {
        self.done.await.unwrap_or(());
    }

    /// Asks the Manager to stop, then waits until it has.
    pub async fn shutdown_and_wait(mut self) {
        self.shutdown().await;
        self.done.await.unwrap_or(());
    }
}

enum Event {
    Register {
        addr: PeerAddr,
        identity: PeerIdentity,
        is_admin: bool,
        tx: PeerTx,
        ack: oneshot::Sender<std::result::Result<(), String>>,
    },
    Envelope {
        addr: PeerAddr,
        envelope: Envelope,
        raw: Vec<u8>,
    },
    Disconnected {
        addr: PeerAddr,
    },
    Shutdown,
}

struct Shared {
    policy: AuthPolicy,
    acceptor: Option<async_tls::TlsAcceptor>,
    tx: ChannelTx<Event>,
    connections: Mutex<ConnectionsTable>,
    users: Mutex<UsersTable>,
    hostnames: Mutex<HostnamesTable>,
    network_name: String,
    hostname: String,
    port: u16,
    handshake_timeout: Duration,
}

/// Starts a Manager with the given configuration, returning once the
/// listening socket is bound.
pub async fn run(cfg: ManagerConfig) -> Result<ManagerHandle> {
    let connections = ConnectionsTable::open(cfg.database.as_deref())?;
    let users = UsersTable::open(cfg.database.as_deref())?;
    let hostnames_table = HostnamesTable::open(cfg.database.as_deref())?;
    info!(path = connections.path(), "loaded the database tables");

    let hostnames = match cfg.hostnames {
        Some(list) if list.is_empty() => Some(hostnames_table.hostnames()?),
        other => other,
    };
    let policy = AuthPolicy::from_options(cfg.password, cfg.login, hostnames)?;
    if matches!(policy, AuthPolicy::Login) && users.users()?.is_empty() {
        return Err("The users table is empty; cannot use login credentials")
            .wrapped(ErrorKind::Manager);
    }
    match &policy {
        AuthPolicy::None => info!("not using authentication"),
        AuthPolicy::SharedPassword(_) => info!("using a password for authentication"),
        AuthPolicy::TrustedHostnames(_) => info!("using trusted hosts for authentication"),
        AuthPolicy::Login => info!("using a login for authentication"),
    }

    let acceptor = if cfg.disable_tls {
        None
    } else {
        let cert_file = cfg
            .cert_file
            .as_deref()
            .ok_or_else(|| Error::wrapped(ErrorKind::Manager, "TLS requires a certificate file"))?;
        let key_file = cfg
            .key_file
            .as_deref()
            .ok_or_else(|| Error::wrapped(ErrorKind::Manager, "TLS requires a key file"))?;
        let config = crypto::server_config(cert_file, key_file)?;
        info!(path = %cert_file.display(), "loaded certificate");
        Some(async_tls::TlsAcceptor::from(config))
    };

    let listener = socket::bind(([0, 0, 0, 0], cfg.port)).await?;
    let port = listener.local_addr()?.port();
    let hostname = communication::hostname();
    let network_name = format!("{}:{}", hostname, port);

    let (tx, rx) = channel::new_bounded::<Event>(CHAN_BOUND);
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();

    let shared = Arc::new(Shared {
        policy,
        acceptor,
        tx: tx.clone(),
        connections: Mutex::new(connections),
        users: Mutex::new(users),
        hostnames: Mutex::new(hostnames_table),
        network_name: network_name.clone(),
        hostname,
        port,
        handshake_timeout: cfg.handshake_timeout,
    });

    rt::spawn(accept_loop(listener, shared.clone(), stop_rx));

    let dispatcher = Dispatcher {
        registry: Registry::new(),
        shared,
        accept_stop: Some(stop_tx),
        done: Some(done_tx),
    };
    rt::spawn(dispatcher.run(rx));

    let tls = if cfg.disable_tls { "DISABLED" } else { "ENABLED" };
    info!(%network_name, tls, "Network Manager running");

    Ok(ManagerHandle {
        port,
        tx,
        done: done_rx,
    })
}

async fn accept_loop(
    listener: Listener,
    shared: Arc<Shared>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let accept = listener.accept();
        futures::pin_mut!(accept);
        match future::select(accept, &mut stop).await {
            FutEither::Left((Ok((sock, addr)), _)) => {
                rt::spawn(connection_task(sock, addr, shared.clone()));
            }
            FutEither::Left((Err(e), _)) => {
                error!(error = %e, "accept failed");
            }
            FutEither::Right(_) => return,
        }
    }
}

async fn connection_task(sock: Socket, sockaddr: std::net::SocketAddr, shared: Arc<Shared>) {
    let addr = PeerAddr::canonical(sockaddr);
    let peer_host = communication::peer_hostname(sockaddr);
    info!(peer = %addr, "new connection request");
    log_connection(&shared, &addr, "new connection request");

    let transport = match &shared.acceptor {
        Some(acceptor) => match acceptor.accept(sock).await {
            Ok(stream) => Transport::TlsServer(stream),
            Err(e) => {
                // most likely a certificate fetch, or a peer with
                // TLS disabled talking to a TLS Manager
                info!(peer = %addr, error = %e, "TLS handshake failed");
                log_connection(&shared, &addr, "rejected: TLS handshake failed");
                return;
            }
        },
        None => Transport::Plain(sock),
    };

    let (read_half, mut write_half) = transport.split();
    let mut reader = FramedRead::new(read_half);

    // authentication
    let verdict = {
        let mut io = HandshakeIo {
            reader: &mut reader,
            writer: &mut write_half,
            timeout: shared.handshake_timeout,
        };
        auth::await_handshake(
            &shared.policy,
            &mut io,
            &peer_host,
            &shared.network_name,
            &shared.users,
        )
        .await
    };
    let is_admin = match verdict {
        Ok(HandshakeVerdict::Accepted { is_admin }) => is_admin,
        Ok(HandshakeVerdict::Closed { log }) => {
            info!(peer = %addr, "{}", log);
            log_connection(&shared, &addr, &log);
            return;
        }
        Ok(HandshakeVerdict::Rejected { log, kind, detail }) => {
            info!(peer = %addr, "{}", log);
            log_connection(&shared, &addr, &log);
            let envelope = Envelope::error_reply(kind, &detail, shared.network_name.as_str(), "");
            send_and_close(&mut write_half, envelope).await;
            log_connection(&shared, &addr, "disconnected");
            return;
        }
        Err(e) => {
            error!(peer = %addr, error = %e, "handshake failed");
            log_connection(&shared, &addr, "connection closed prematurely");
            return;
        }
    };

    // identify
    let reply = {
        let mut io = HandshakeIo {
            reader: &mut reader,
            writer: &mut write_half,
            timeout: shared.handshake_timeout,
        };
        io.prompt("identity", &shared.network_name).await
    };
    let identity = match reply {
        Ok(Some(value)) => identity_from_reply(value),
        Ok(None) => {
            info!(peer = %addr, "connection closed prematurely");
            log_connection(&shared, &addr, "connection closed prematurely");
            return;
        }
        Err(e) => identity_err(e),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            info!(peer = %addr, error = %e, "sent an invalid identity, closing connection");
            log_connection(&shared, &addr, "rejected: invalid identity");
            let envelope =
                Envelope::error_message(e.to_string(), shared.network_name.as_str(), "");
            send_and_close(&mut write_half, envelope).await;
            log_connection(&shared, &addr, "disconnected");
            return;
        }
    };

    // register with the dispatcher, which owns the name index
    let (peer_tx, peer_rx) = channel::new_bounded::<WriteCmd>(CHAN_BOUND);
    let (ack_tx, ack_rx) = oneshot::channel();
    let kind = match &identity {
        PeerIdentity::Client(_) => "client",
        PeerIdentity::Service(_) => "service",
    };
    let mut tx = shared.tx.clone();
    let register = Event::Register {
        addr: addr.clone(),
        identity,
        is_admin,
        tx: peer_tx.clone(),
        ack: ack_tx,
    };
    if tx.send(register).await.is_err() {
        return;
    }
    match ack_rx.await {
        Ok(Ok(())) => (),
        Ok(Err(reason)) => {
            info!(peer = %addr, "{}", reason);
            log_connection(&shared, &addr, "rejected: invalid identity");
            let envelope = Envelope::error_reply(
                WireErrorKind::IdentityInvalid,
                &reason,
                shared.network_name.as_str(),
                "",
            );
            send_and_close(&mut write_half, envelope).await;
            log_connection(&shared, &addr, "disconnected");
            return;
        }
        Err(_) => return,
    }
    info!(peer = %addr, kind, "connected");
    log_connection(&shared, &addr, &format!("connected as a {}", kind));

    rt::spawn(writer_task(write_half, peer_rx));

    // receive loop; one envelope at a time keeps per-socket ordering
    let mut own_tx = peer_tx;
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %addr, error = %e, "receive failed");
                break;
            }
        };
        debug!(peer = %addr, bytes = frame.len(), "received frame");

        let parsed = match crate::hub::communication::serialize::deserialize(&frame) {
            Ok(value) => match Envelope::from_value(value) {
                Ok(envelope) => Some((envelope, frame)),
                Err(_) => None,
            },
            Err(_) => {
                // raw terminal line; parse the dialect
                let line = String::from_utf8_lossy(&frame);
                match parse_terminal_input(&line) {
                    Some(Either::Right(envelope)) => match envelope.encode() {
                        Ok(raw) => Some((envelope, raw)),
                        Err(_) => None,
                    },
                    _ => None,
                }
            }
        };

        match parsed {
            Some((envelope, raw)) => {
                let event = Event::Envelope {
                    addr: addr.clone(),
                    envelope,
                    raw,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            None => {
                // a malformed envelope is answered, and the
                // connection stays open
                let envelope = Envelope::error_reply(
                    WireErrorKind::ProtocolError,
                    "Failed to deserialize the message",
                    addr.as_str(),
                    "",
                );
                if let Ok(payload) = envelope.encode() {
                    own_tx.send(WriteCmd::Frame(payload)).await.unwrap_or(());
                }
            }
        }
    }

    tx.send(Event::Disconnected { addr }).await.unwrap_or(());
}

fn identity_from_reply(value: Value) -> Result<PeerIdentity> {
    match value {
        Value::String(line) => match parse_terminal_input(&line) {
            Some(Either::Left(identity)) => PeerIdentity::from_value(&identity),
            _ => Err("The identity must be a JSON object").wrapped(ErrorKind::IdentityInvalid),
        },
        value => PeerIdentity::from_value(&value),
    }
}

fn identity_err(e: Error) -> Result<PeerIdentity> {
    if e.kind() == ErrorKind::HandshakeTimeout {
        Err("No identity reply arrived before the deadline").wrapped(ErrorKind::HandshakeTimeout)
    } else {
        Err(e)
    }
}

async fn send_and_close(writer: &mut WriteHalf<Transport>, envelope: Envelope) {
    if let Ok(payload) = envelope.encode() {
        framing::write_frame(writer, &payload).await.unwrap_or(());
    }
    writer.close().await.unwrap_or(());
}

fn log_connection(shared: &Shared, addr: &PeerAddr, message: &str) {
    if let Err(e) = shared.connections.lock().insert(addr.as_str(), message) {
        error!(error = %e, "failed to write the connections log");
    }
}

struct Dispatcher {
    registry: Registry,
    shared: Arc<Shared>,
    accept_stop: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: ChannelRx<Event>) {
        while let Ok(event) = rx.recv().await {
            let keep_going = self.handle(event).await;
            if !keep_going {
                break;
            }
        }
        if let Some(stop) = self.accept_stop.take() {
            stop.send(()).unwrap_or(());
        }
        if let Some(done) = self.done.take() {
            done.send(()).unwrap_or(());
        }
    }

    async fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Register {
                addr,
                identity,
                is_admin,
                tx,
                ack,
            } => {
                let outcome = match identity {
                    PeerIdentity::Client(identity) => {
                        info!(peer = %addr, name = %identity.name, "is a new Client connection");
                        self.registry.register_client(addr, identity, tx, is_admin);
                        Ok(())
                    }
                    PeerIdentity::Service(identity) => {
                        let name = identity.name.clone();
                        match self.registry.register_service(addr.clone(), identity, tx, is_admin)
                        {
                            Ok(()) => {
                                info!(peer = %addr, name = %name, "is a new Service connection");
                                Ok(())
                            }
                            Err(reason) => Err(reason),
                        }
                    }
                };
                ack.send(outcome).unwrap_or(());
                true
            }
            Event::Envelope {
                addr,
                envelope,
                raw,
            } => self.route(addr, envelope, raw).await,
            Event::Disconnected { addr } => {
                self.remove_peer(&addr).await;
                true
            }
            Event::Shutdown => {
                self.shutdown().await;
                false
            }
        }
    }

    async fn route(&mut self, addr: PeerAddr, envelope: Envelope, raw: Vec<u8>) -> bool {
        if classify(&envelope) == MessageClass::Disconnect {
            info!(peer = %self.registry.network_name(&addr), "requested to disconnect");
            self.close_peer(&addr).await;
            return true;
        }

        // a peer mid re-authentication has every envelope consumed
        // by the login exchange
        let reauthing = self
            .registry
            .peer(&addr)
            .map(|peer| !matches!(peer.reauth, ReauthPhase::Idle))
            .unwrap_or(false);
        if reauthing {
            self.reauth_step(&addr, envelope).await;
            return true;
        }

        match classify(&envelope) {
            MessageClass::ServiceReply => self.forward_reply(&addr, &envelope, raw).await,
            MessageClass::Notification => self.fan_out_notification(&addr, raw).await,
            MessageClass::ManagerRequest => return self.manager_request(&addr, envelope).await,
            MessageClass::Disconnect => unreachable!("handled above"),
            MessageClass::ServiceRequest => self.forward_request(&addr, envelope).await,
        }
        true
    }

    async fn forward_reply(&mut self, addr: &PeerAddr, envelope: &Envelope, raw: Vec<u8>) {
        let requester = match &envelope.requester {
            Some(requester) => PeerAddr::from(requester.as_str()),
            None => {
                info!(peer = %self.registry.network_name(addr), "reply carried no requester");
                return;
            }
        };
        match self.registry.client_tx(&requester) {
            Some(tx) => self.send_frame(tx, raw).await,
            None => {
                // the requester disconnected between routing the
                // request and the reply arriving
                info!(requester = %requester, "is no longer available to send the reply to");
            }
        }
    }

    async fn fan_out_notification(&mut self, addr: &PeerAddr, raw: Vec<u8>) {
        let service = match self.registry.service_of(addr) {
            Some(service) => service.to_string(),
            None => {
                info!(peer = %self.registry.network_name(addr), "notification from a non-Service peer");
                return;
            }
        };
        for tx in self.registry.linked_txs(&service) {
            self.send_frame(tx, raw.clone()).await;
        }
    }

    async fn forward_request(&mut self, addr: &PeerAddr, mut envelope: Envelope) {
        let service = match envelope.service.clone() {
            Some(service) => service,
            None => {
                let reply = Envelope::error_reply(
                    WireErrorKind::ProtocolError,
                    "The request names no service",
                    addr.as_str(),
                    &envelope.uuid,
                );
                self.reply_to(addr, reply).await;
                return;
            }
        };
        match self.registry.service_tx(&service) {
            Some(tx) => {
                envelope.requester = Some(addr.as_str().to_string());
                match envelope.encode() {
                    Ok(payload) => {
                        info!(peer = %addr, service = %service, "sent a request");
                        self.send_frame(tx, payload).await;
                    }
                    Err(e) => {
                        let reply = Envelope::error_reply(
                            WireErrorKind::ProtocolError,
                            &e.to_string(),
                            addr.as_str(),
                            &envelope.uuid,
                        );
                        self.reply_to(addr, reply).await;
                    }
                }
            }
            None => {
                let detail = format!(
                    "the {:?} Service is not connected to the Network Manager at {:?}",
                    service, self.shared.network_name
                );
                info!("{}", detail);
                let reply = Envelope::error_reply(
                    WireErrorKind::ServiceNotFound,
                    &detail,
                    addr.as_str(),
                    &envelope.uuid,
                );
                self.reply_to(addr, reply).await;
            }
        }
    }

    async fn manager_request(&mut self, addr: &PeerAddr, envelope: Envelope) -> bool {
        let attribute = envelope.attribute.clone().unwrap_or_default();
        match attribute.as_str() {
            "identity" => {
                let snapshot = self
                    .registry
                    .identity_snapshot(&self.shared.hostname, self.shared.port);
                let reply = Envelope::reply(snapshot, addr.as_str(), &envelope.uuid);
                self.reply_to(addr, reply).await;
                true
            }
            "link" => {
                self.link_request(addr, &envelope).await;
                true
            }
            "unlink" => {
                if let Some(service) = envelope.args.first().and_then(Value::as_str) {
                    self.registry.unlink(service, addr);
                    info!(peer = %self.registry.network_name(addr), service, "unlinked");
                }
                let reply = Envelope::reply(json!(true), addr.as_str(), &envelope.uuid);
                self.reply_to(addr, reply).await;
                true
            }
            _ => {
                // any other attribute needs administrative rights
                info!(peer = %self.registry.network_name(addr), attribute = %attribute, "received an admin request");
                let is_admin = self
                    .registry
                    .peer(addr)
                    .map(|peer| peer.is_admin)
                    .unwrap_or(false);
                if !is_admin {
                    self.start_reauth(addr, envelope).await;
                    return true;
                }
                self.execute_admin(addr, envelope).await
            }
        }
    }

    async fn link_request(&mut self, addr: &PeerAddr, envelope: &Envelope) {
        let service = match envelope.args.first().and_then(Value::as_str) {
            Some(service) => service.to_string(),
            None => {
                let reply = Envelope::error_reply(
                    WireErrorKind::ProtocolError,
                    "A link request carries the Service name as its first argument",
                    addr.as_str(),
                    &envelope.uuid,
                );
                self.reply_to(addr, reply).await;
                return;
            }
        };
        let network_name = self.registry.network_name(addr);
        let reply = match self.registry.link(&service, addr) {
            LinkOutcome::Linked(identity) => {
                info!(peer = %network_name, service = %service, "linked");
                Envelope::reply(identity, addr.as_str(), &envelope.uuid)
            }
            LinkOutcome::Relinked(identity) => {
                info!(peer = %network_name, service = %service, "re-linked");
                Envelope::reply(identity, addr.as_str(), &envelope.uuid)
            }
            LinkOutcome::Saturated(linked) => {
                let detail = format!(
                    "The maximum number of Clients are already linked with {:?}. \
                     The linked Clients are {:?}",
                    service, linked
                );
                info!("{}", detail);
                Envelope::error_reply(
                    WireErrorKind::LinkSaturated,
                    &detail,
                    addr.as_str(),
                    &envelope.uuid,
                )
            }
            LinkOutcome::Unknown => {
                let detail = format!(
                    "{:?} service does not exist, could not link with {:?}",
                    service, network_name
                );
                info!("{}", detail);
                Envelope::error_reply(
                    WireErrorKind::ServiceNotFound,
                    &detail,
                    addr.as_str(),
                    &envelope.uuid,
                )
            }
        };
        self.reply_to(addr, reply).await;
    }

    // ------------------------------------------------------------------
    // admin plane
    // ------------------------------------------------------------------

    async fn start_reauth(&mut self, addr: &PeerAddr, pending: Envelope) {
        let prompt = Envelope::prompt("username", &self.shared.network_name);
        if let Some(peer) = self.registry.peer_mut(addr) {
            peer.reauth = ReauthPhase::AwaitingUsername { pending };
        }
        self.reply_to(addr, prompt).await;
    }

    async fn reauth_step(&mut self, addr: &PeerAddr, envelope: Envelope) {
        let phase = match self.registry.peer_mut(addr) {
            Some(peer) => std::mem::replace(&mut peer.reauth, ReauthPhase::Idle),
            None => return,
        };
        match phase {
            ReauthPhase::Idle => (),
            ReauthPhase::AwaitingUsername { pending } => {
                let username = envelope
                    .result
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let registered = match self.shared.users.lock().is_user_registered(&username) {
                    Ok(registered) => registered && !username.is_empty(),
                    Err(_) => false,
                };
                if !registered {
                    self.fail_reauth(addr).await;
                    return;
                }
                let prompt = Envelope::prompt("password", &username);
                if let Some(peer) = self.registry.peer_mut(addr) {
                    peer.reauth = ReauthPhase::AwaitingPassword { username, pending };
                }
                self.reply_to(addr, prompt).await;
            }
            ReauthPhase::AwaitingPassword { username, pending } => {
                let password = envelope
                    .result
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let granted = {
                    let users = self.shared.users.lock();
                    users.is_password_valid(&username, &password).unwrap_or(false)
                        && users.is_admin(&username).unwrap_or(false)
                };
                if !granted {
                    self.fail_reauth(addr).await;
                    return;
                }
                // the privilege flip applies to this connection
                // only; nothing is persisted
                if let Some(peer) = self.registry.peer_mut(addr) {
                    peer.is_admin = true;
                }
                info!(peer = %self.registry.network_name(addr), "granted administrator privilege");
                self.execute_admin(addr, pending).await;
            }
        }
    }

    async fn fail_reauth(&mut self, addr: &PeerAddr) {
        let reply = Envelope::error_reply(
            WireErrorKind::PermissionDenied,
            "You must be an administrator to send this request to the Manager",
            addr.as_str(),
            "",
        );
        self.reply_to(addr, reply).await;
    }

    /// Executes an admin verb; the attribute may be a dotted path
    /// onto one of the tables. Admin replies carry no `uuid`.
    async fn execute_admin(&mut self, addr: &PeerAddr, envelope: Envelope) -> bool {
        let attribute = envelope.attribute.clone().unwrap_or_default();
        if attribute == "shutdown_manager" {
            info!(peer = %self.registry.network_name(addr), "received shutdown request");
            let reply = Envelope::reply(Value::Null, addr.as_str(), "");
            self.reply_to(addr, reply).await;
            self.shutdown().await;
            return false;
        }
        let reply = match self.admin_verb(&attribute, &envelope) {
            Ok(result) => Envelope::reply(result, addr.as_str(), ""),
            Err(detail) => {
                error!(peer = %addr, attribute = %attribute, "{}", detail);
                Envelope::error_reply(WireErrorKind::RequestFailed, &detail, addr.as_str(), "")
            }
        };
        self.reply_to(addr, reply).await;
        true
    }

    fn admin_verb(
        &self,
        attribute: &str,
        envelope: &Envelope,
    ) -> std::result::Result<Value, String> {
        let arg = |i: usize| -> std::result::Result<&str, String> {
            envelope
                .args
                .get(i)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{:?} requires a string argument {}", attribute, i))
        };
        let table = |e: Error| e.to_string();

        match attribute {
            "port" => Ok(json!(self.shared.port)),
            "hostname" => Ok(json!(self.shared.hostname)),
            "users_table.is_user_registered" => {
                let registered = self
                    .shared
                    .users
                    .lock()
                    .is_user_registered(arg(0)?)
                    .map_err(table)?;
                Ok(json!(registered))
            }
            "users_table.is_admin" => {
                let is_admin = self.shared.users.lock().is_admin(arg(0)?).map_err(table)?;
                Ok(json!(is_admin))
            }
            "users_table.insert_user" => {
                let is_admin = envelope
                    .args
                    .get(2)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.shared
                    .users
                    .lock()
                    .insert_user(arg(0)?, arg(1)?, is_admin)
                    .map_err(table)?;
                Ok(json!(true))
            }
            "users_table.delete_user" => {
                self.shared.users.lock().delete_user(arg(0)?).map_err(table)?;
                Ok(json!(true))
            }
            "users_table.users" => {
                let users = self.shared.users.lock().users().map_err(table)?;
                Ok(json!(users))
            }
            "connections_table.connections" => {
                let rows = self.shared.connections.lock().connections().map_err(table)?;
                let rows: Vec<Value> = rows
                    .into_iter()
                    .map(|r| json!([r.pid, r.timestamp, r.address, r.message]))
                    .collect();
                Ok(json!(rows))
            }
            "hostnames_table.hostnames" => {
                let hostnames = self.shared.hostnames.lock().hostnames().map_err(table)?;
                Ok(json!(hostnames))
            }
            "hostnames_table.insert_hostname" => {
                self.shared
                    .hostnames
                    .lock()
                    .insert_hostname(arg(0)?)
                    .map_err(table)?;
                Ok(json!(true))
            }
            "hostnames_table.delete_hostname" => {
                self.shared
                    .hostnames
                    .lock()
                    .delete_hostname(arg(0)?)
                    .map_err(table)?;
                Ok(json!(true))
            }
            _ => Err(format!("{:?} is not an attribute of the Manager", attribute)),
        }
    }

    // ------------------------------------------------------------------
    // peer lifecycle
    // ------------------------------------------------------------------

    async fn close_peer(&mut self, addr: &PeerAddr) {
        let tx = self.registry.client_tx(addr).or_else(|| {
            self.registry
                .service_of(addr)
                .map(String::from)
                .and_then(|name| self.registry.service_tx(&name))
        });
        self.remove_peer(addr).await;
        if let Some(mut tx) = tx {
            tx.send(WriteCmd::Close).await.unwrap_or(());
        }
    }

    async fn remove_peer(&mut self, addr: &PeerAddr) {
        let network_name = self.registry.network_name(addr);
        match self.registry.remove_peer(addr) {
            RemovedPeer::None => (),
            RemovedPeer::Client => {
                info!(peer = %network_name, "has been removed from the registry");
                self.log(addr, "disconnected");
            }
            RemovedPeer::Service { name, linked } => {
                info!(peer = %network_name, service = %name, "service has been removed from the registry");
                self.log(addr, "disconnected");
                // every linked Client learns about the loss
                let detail = format!("The {:?} service has been disconnected", name);
                let envelope = Envelope::error_reply(
                    WireErrorKind::TransportLost,
                    &detail,
                    self.shared.network_name.as_str(),
                    "",
                );
                if let Ok(payload) = envelope.encode() {
                    for (_, tx) in linked {
                        self.send_frame(tx, payload.clone()).await;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down the network manager");
        let txs = self.registry.all_txs_clients_first();
        for tx in txs {
            let mut tx = tx;
            tx.send(WriteCmd::Close).await.unwrap_or(());
        }
        for addr in self.registry.addrs() {
            self.registry.remove_peer(&addr);
            self.log(&addr, "disconnected");
        }
        if let Some(stop) = self.accept_stop.take() {
            stop.send(()).unwrap_or(());
        }
    }

    async fn reply_to(&mut self, addr: &PeerAddr, envelope: Envelope) {
        let tx = self
            .registry
            .client_tx(addr)
            .or_else(|| {
                self.registry
                    .service_of(addr)
                    .map(String::from)
                    .and_then(|name| self.registry.service_tx(&name))
            });
        let tx = match tx {
            Some(tx) => tx,
            None => return,
        };
        match envelope.encode() {
            Ok(payload) => self.send_frame(tx, payload).await,
            Err(e) => error!(error = %e, "failed to encode a reply"),
        }
    }

    async fn send_frame(&self, tx: PeerTx, payload: Vec<u8>) {
        let mut tx = tx;
        tx.send(WriteCmd::Frame(payload)).await.unwrap_or(());
    }

    fn log(&self, addr: &PeerAddr, message: &str) {
        if let Err(e) = self.shared.connections.lock().insert(addr.as_str(), message) {
            error!(error = %e, "failed to write the connections log");
        }
    }
}
