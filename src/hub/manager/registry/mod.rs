//! The Manager's registry of connected peers.
//!
//! Two indexes, Clients by address and Services by name, plus the
//! socket writer handles and the per-Service link sets. The registry
//! is owned solely by the dispatcher task, so none of this needs a
//! lock.

use serde_json::{json, Map, Value};

use crate::hub::collections::{self, HashMap, HashSet};
use crate::hub::communication::message::{ClientIdentity, ServiceIdentity};
use crate::hub::communication::PeerAddr;
use crate::hub::manager::PeerTx;

/// The role a peer identified as, with the Service name for
/// Service peers.
#[derive(Debug, Clone)]
pub enum PeerRole {
    Client,
    Service(String),
}

/// The inline re-authentication state of a peer that sent an admin
/// request without holding administrator privilege.
#[derive(Debug)]
pub enum ReauthPhase {
    Idle,
    AwaitingUsername {
        pending: crate::hub::communication::message::Envelope,
    },
    AwaitingPassword {
        username: String,
        pending: crate::hub::communication::message::Envelope,
    },
}

/// Per-connection state tracked by the dispatcher.
pub struct PeerState {
    pub network_name: String,
    pub role: PeerRole,
    pub is_admin: bool,
    pub reauth: ReauthPhase,
}

struct ClientRecord {
    identity: ClientIdentity,
    tx: PeerTx,
}

struct ServiceRecord {
    identity: ServiceIdentity,
    owner: PeerAddr,
    tx: PeerTx,
}

/// What a `link` request resolved to.
pub enum LinkOutcome {
    /// The Client was inserted into the link set; carries the
    /// Service identity for the reply.
    Linked(Value),
    /// The Client was already linked; idempotent, same reply.
    Relinked(Value),
    /// `max_clients` is saturated; carries the current members.
    Saturated(Vec<String>),
    /// No Service under that name.
    Unknown,
}

/// What removing a peer resolved to.
pub enum RemovedPeer {
    /// Unknown address; removal is idempotent.
    None,
    Client,
    /// A Service died; carries the writer of every linked Client
    /// still connected, for the abort fan-out.
    Service {
        name: String,
        linked: Vec<(PeerAddr, PeerTx)>,
    },
}

/// The registry proper.
pub struct Registry {
    peers: HashMap<PeerAddr, PeerState>,
    clients: HashMap<PeerAddr, ClientRecord>,
    services: HashMap<String, ServiceRecord>,
    links: HashMap<String, HashSet<PeerAddr>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: collections::hash_map(),
            clients: collections::hash_map(),
            services: collections::hash_map(),
            links: collections::hash_map(),
        }
    }

    /// Registers an identified Client.
    pub fn register_client(
        &mut self,
        addr: PeerAddr,
        identity: ClientIdentity,
        tx: PeerTx,
        is_admin: bool,
    ) {
        let network_name = format!("{}[{}]", identity.name, addr);
        self.peers.insert(
            addr.clone(),
            PeerState {
                network_name,
                role: PeerRole::Client,
                is_admin,
                reauth: ReauthPhase::Idle,
            },
        );
        self.clients.insert(addr, ClientRecord { identity, tx });
    }

    /// Registers an identified Service; the name must be free.
    pub fn register_service(
        &mut self,
        addr: PeerAddr,
        mut identity: ServiceIdentity,
        tx: PeerTx,
        is_admin: bool,
    ) -> std::result::Result<(), String> {
        if self.services.contains_key(&identity.name) {
            return Err(format!(
                "A {:?} service is already running on the Manager",
                identity.name
            ));
        }
        if identity.address.is_none() {
            identity.address = Some(addr.as_str().to_string());
        }
        let name = identity.name.clone();
        let network_name = format!("{}[{}]", name, addr);
        self.peers.insert(
            addr.clone(),
            PeerState {
                network_name,
                role: PeerRole::Service(name.clone()),
                is_admin,
                reauth: ReauthPhase::Idle,
            },
        );
        self.links.insert(name.clone(), collections::hash_set());
        self.services.insert(
            name,
            ServiceRecord {
                identity,
                owner: addr,
                tx,
            },
        );
        Ok(())
    }

    /// Removes a peer, unwinding its index entries.
    ///
    /// A removed Client leaves every link set it was a member of; a
    /// removed Service yields its link set so the dispatcher can
    /// fan out the abort, and its record and link set disappear
    /// together.
    pub fn remove_peer(&mut self, addr: &PeerAddr) -> RemovedPeer {
        let state = match self.peers.remove(addr) {
            Some(state) => state,
            None => return RemovedPeer::None,
        };
        match state.role {
            PeerRole::Client => {
                self.clients.remove(addr);
                for members in self.links.values_mut() {
                    members.remove(addr);
                }
                RemovedPeer::Client
            }
            PeerRole::Service(name) => {
                self.services.remove(&name);
                let members = self.links.remove(&name).unwrap_or_default();
                let linked = members
                    .into_iter()
                    .filter_map(|member| {
                        self.clients
                            .get(&member)
                            .map(|record| (member, record.tx.clone()))
                    })
                    .collect();
                RemovedPeer::Service { name, linked }
            }
        }
    }

    /// Resolves a `link` request from `client`.
    pub fn link(&mut self, service: &str, client: &PeerAddr) -> LinkOutcome {
        let record = match self.services.get(service) {
            Some(record) => record,
            None => return LinkOutcome::Unknown,
        };
        let identity = service_value(record);
        let members = self.links.get_mut(service).expect("link set out of sync");
        if members.contains(client) {
            return LinkOutcome::Relinked(identity);
        }
        let max_clients = record.identity.max_clients;
        if max_clients <= 0 || (members.len() as i64) < max_clients {
            members.insert(client.clone());
            LinkOutcome::Linked(identity)
        } else {
            let mut linked: Vec<String> =
                members.iter().map(|m| m.as_str().to_string()).collect();
            linked.sort();
            LinkOutcome::Saturated(linked)
        }
    }

    /// Removes `client` from the link set of `service`; a no-op for
    /// unknown services or unlinked clients.
    pub fn unlink(&mut self, service: &str, client: &PeerAddr) {
        if let Some(members) = self.links.get_mut(service) {
            members.remove(client);
        }
    }

    /// The writer handle of a Client, if still connected.
    pub fn client_tx(&self, addr: &PeerAddr) -> Option<PeerTx> {
        self.clients.get(addr).map(|record| record.tx.clone())
    }

    /// The writer handle of a Service, if registered.
    pub fn service_tx(&self, name: &str) -> Option<PeerTx> {
        self.services.get(name).map(|record| record.tx.clone())
    }

    /// The Service owned by the socket at `addr`, if any.
    pub fn service_of(&self, addr: &PeerAddr) -> Option<&str> {
        match self.peers.get(addr) {
            Some(PeerState {
                role: PeerRole::Service(name),
                ..
            }) => Some(name),
            _ => None,
        }
    }

    /// Writer handles of every Client linked with `service`.
    pub fn linked_txs(&self, service: &str) -> Vec<PeerTx> {
        let members = match self.links.get(service) {
            Some(members) => members,
            None => return Vec::new(),
        };
        members
            .iter()
            .filter_map(|member| self.clients.get(member))
            .map(|record| record.tx.clone())
            .collect()
    }

    /// Current size of a link set, for tests and introspection.
    pub fn link_count(&self, service: &str) -> usize {
        self.links.get(service).map(|m| m.len()).unwrap_or(0)
    }

    pub fn peer(&self, addr: &PeerAddr) -> Option<&PeerState> {
        self.peers.get(addr)
    }

    pub fn peer_mut(&mut self, addr: &PeerAddr) -> Option<&mut PeerState> {
        self.peers.get_mut(addr)
    }

    /// The display name of a peer, for log lines.
    pub fn network_name(&self, addr: &PeerAddr) -> String {
        self.peers
            .get(addr)
            .map(|state| state.network_name.clone())
            .unwrap_or_else(|| addr.as_str().to_string())
    }

    /// Writer handles of every peer, Clients first, then Services,
    /// which is the order `shutdown_manager` closes them in.
    pub fn all_txs_clients_first(&self) -> Vec<PeerTx> {
        let clients = self.clients.values().map(|record| record.tx.clone());
        let services = self.services.values().map(|record| record.tx.clone());
        clients.chain(services).collect()
    }

    /// Builds the Manager identity snapshot.
    pub fn identity_snapshot(&self, hostname: &str, port: u16) -> Value {
        let mut clients = Map::new();
        for (addr, record) in &self.clients {
            clients.insert(
                format!("{}[{}]", record.identity.name, addr),
                json!({
                    "language": record.identity.language,
                    "os": record.identity.os,
                }),
            );
        }
        let mut services = Map::new();
        for (name, record) in &self.services {
            services.insert(name.clone(), service_value(record));
        }
        json!({
            "hostname": hostname,
            "port": port,
            "language": crate::hub::communication::language(),
            "os": crate::hub::communication::os_string(),
            "attributes": {
                "identity": "() -> dict",
                "link": "(service: str) -> bool",
                "unlink": "(service: str) -> bool",
            },
            "clients": clients,
            "services": services,
        })
    }

    pub fn owner_of_service(&self, name: &str) -> Option<&PeerAddr> {
        self.services.get(name).map(|record| &record.owner)
    }

    /// Every registered peer address.
    pub fn addrs(&self) -> Vec<PeerAddr> {
        self.peers.keys().cloned().collect()
    }
}

fn service_value(record: &ServiceRecord) -> Value {
    json!({
        "attributes": record.identity.attributes,
        "address": record.identity.address,
        "language": record.identity.language,
        "os": record.identity.os,
        "max_clients": record.identity.max_clients,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::hub::communication::channel;
    use crate::hub::communication::WriteCmd;

    fn tx() -> PeerTx {
        let (tx, _rx) = channel::new_bounded::<WriteCmd>(8);
        tx
    }

    fn client_identity(name: &str) -> ClientIdentity {
        ClientIdentity {
            name: name.into(),
            language: "unknown".into(),
            os: "unknown".into(),
        }
    }

    fn service_identity(name: &str, max_clients: i64) -> ServiceIdentity {
        ServiceIdentity {
            name: name.into(),
            attributes: Map::new(),
            address: None,
            language: "unknown".into(),
            os: "unknown".into(),
            max_clients,
        }
    }

    #[test]
    fn test_duplicate_service_name_rejected() {
        let mut registry = Registry::new();
        registry
            .register_service("localhost:1".into(), service_identity("Echo", -1), tx(), false)
            .unwrap();
        let err = registry
            .register_service("localhost:2".into(), service_identity("Echo", -1), tx(), false)
            .unwrap_err();
        assert!(err.contains("already running"));
    }

    #[test]
    fn test_link_saturation_and_relink() {
        let mut registry = Registry::new();
        registry
            .register_service("localhost:1".into(), service_identity("Echo", 1), tx(), false)
            .unwrap();
        registry.register_client("localhost:2".into(), client_identity("c1"), tx(), false);
        registry.register_client("localhost:3".into(), client_identity("c2"), tx(), false);

        let c1: PeerAddr = "localhost:2".into();
        let c2: PeerAddr = "localhost:3".into();

        assert!(matches!(registry.link("Echo", &c1), LinkOutcome::Linked(_)));
        assert_eq!(registry.link_count("Echo"), 1);

        // re-linking is idempotent and bypasses the cap check
        assert!(matches!(registry.link("Echo", &c1), LinkOutcome::Relinked(_)));
        assert_eq!(registry.link_count("Echo"), 1);

        match registry.link("Echo", &c2) {
            LinkOutcome::Saturated(linked) => {
                assert_eq!(linked, vec!["localhost:2".to_string()])
            }
            _ => panic!("expected saturation"),
        }

        registry.unlink("Echo", &c1);
        assert!(matches!(registry.link("Echo", &c2), LinkOutcome::Linked(_)));
        assert_eq!(registry.link_count("Echo"), 1);
    }

    #[test]
    fn test_unknown_service_link() {
        let mut registry = Registry::new();
        registry.register_client("localhost:2".into(), client_identity("c1"), tx(), false);
        assert!(matches!(
            registry.link("Ghost", &"localhost:2".into()),
            LinkOutcome::Unknown
        ));
    }

    #[test]
    fn test_service_removal_yields_link_set() {
        let mut registry = Registry::new();
        registry
            .register_service("localhost:1".into(), service_identity("Hb", 10), tx(), false)
            .unwrap();
        for port in 2..7 {
            let addr: PeerAddr = format!("localhost:{}", port).into();
            registry.register_client(addr.clone(), client_identity("c"), tx(), false);
            registry.link("Hb", &addr);
        }

        match registry.remove_peer(&"localhost:1".into()) {
            RemovedPeer::Service { name, linked } => {
                assert_eq!(name, "Hb");
                assert_eq!(linked.len(), 5);
            }
            _ => panic!("expected a service removal"),
        }

        // record and link set disappeared together
        assert!(registry.service_tx("Hb").is_none());
        assert_eq!(registry.link_count("Hb"), 0);
        let snapshot = registry.identity_snapshot("localhost", 1875);
        assert!(snapshot["services"].as_object().unwrap().is_empty());

        // removal is idempotent
        assert!(matches!(
            registry.remove_peer(&"localhost:1".into()),
            RemovedPeer::None
        ));
    }

    #[test]
    fn test_client_removal_leaves_link_sets() {
        let mut registry = Registry::new();
        registry
            .register_service("localhost:1".into(), service_identity("Echo", -1), tx(), false)
            .unwrap();
        let addr: PeerAddr = "localhost:2".into();
        registry.register_client(addr.clone(), client_identity("c"), tx(), false);
        registry.link("Echo", &addr);
        assert_eq!(registry.link_count("Echo"), 1);

        assert!(matches!(registry.remove_peer(&addr), RemovedPeer::Client));
        assert_eq!(registry.link_count("Echo"), 0);
    }

    #[test]
    fn test_identity_snapshot_shape() {
        let mut registry = Registry::new();
        registry
            .register_service("localhost:1".into(), service_identity("Echo", 2), tx(), false)
            .unwrap();
        registry.register_client("localhost:2".into(), client_identity("cli"), tx(), false);

        let snapshot = registry.identity_snapshot("labhost", 1875);
        assert_eq!(snapshot["hostname"], "labhost");
        assert_eq!(snapshot["port"], 1875);
        assert!(snapshot["attributes"]["link"].is_string());
        assert!(snapshot["clients"]["cli[localhost:2]"]["os"].is_string());
        assert_eq!(snapshot["services"]["Echo"]["max_clients"], 2);
        assert_eq!(snapshot["services"]["Echo"]["address"], "localhost:1");
    }
}
