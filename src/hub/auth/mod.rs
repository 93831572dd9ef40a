//! Peer authentication.
//!
//! Exactly one of four mutually exclusive modes is active per
//! Manager, enforced by construction: the start-up routine folds its
//! options into an `AuthPolicy`, and invalid combinations never
//! produce a value.

use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;
use serde_json::Value;

use crate::hub::communication::framing::{self, FramedRead};
use crate::hub::communication::message::{Envelope, WireErrorKind};
use crate::hub::communication::serialize;
use crate::hub::communication::with_deadline;
use crate::hub::database::UsersTable;
use crate::hub::error::*;

/// How a Manager authenticates connecting peers.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    /// Accept any peer that completes identify.
    None,
    /// Every peer must present this password.
    SharedPassword(String),
    /// Only peers whose hostname is trusted may connect.
    TrustedHostnames(Vec<String>),
    /// Peers must log in with a username and password held in the
    /// users table.
    Login,
}

impl AuthPolicy {
    /// Folds start-up options into a policy, rejecting combinations.
    pub fn from_options(
        password: Option<String>,
        login: bool,
        hostnames: Option<Vec<String>>,
    ) -> Result<Self> {
        match (password, login, hostnames) {
            (Some(password), false, None) => Ok(AuthPolicy::SharedPassword(password)),
            (None, true, None) => Ok(AuthPolicy::Login),
            (None, false, Some(hostnames)) => Ok(AuthPolicy::TrustedHostnames(hostnames)),
            (None, false, None) => Ok(AuthPolicy::None),
            _ => Err("Can only specify one of: password, login, hostnames")
                .wrapped(ErrorKind::Auth),
        }
    }
}

/// The outcome of driving a handshake against a peer.
#[derive(Debug)]
pub enum HandshakeVerdict {
    /// The peer authenticated; the privilege bit is stamped onto
    /// its record.
    Accepted { is_admin: bool },
    /// The peer closed (or timed out) before completing the
    /// handshake; nothing left to send.
    Closed { log: String },
    /// The peer failed a check; it is owed an error envelope before
    /// the socket closes.
    Rejected {
        log: String,
        kind: WireErrorKind,
        detail: String,
    },
}

/// The socket halves a handshake is driven over, before the
/// connection graduates to its reader/writer tasks.
pub struct HandshakeIo<'a, R, W> {
    pub reader: &'a mut FramedRead<R>,
    pub writer: &'a mut W,
    pub timeout: Duration,
}

impl<'a, R, W> HandshakeIo<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Sends a `{attribute, requester}` prompt and awaits the reply.
    ///
    /// `Ok(None)` means the peer went away. A peer replying with a
    /// JSON envelope contributes its `result` field; a bare line
    /// (interactive terminal use) contributes itself verbatim.
    pub async fn prompt(&mut self, attribute: &str, requester: &str) -> Result<Option<Value>> {
        let payload = Envelope::prompt(attribute, requester).encode()?;
        framing::write_frame(self.writer, &payload).await?;
        self.read_reply().await
    }

    /// Awaits one handshake reply without prompting first.
    pub async fn read_reply(&mut self) -> Result<Option<Value>> {
        let frame = with_deadline(self.timeout, self.reader.next_frame())
            .await
            .map_err(|e| e.swap_kind(ErrorKind::HandshakeTimeout))??;
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };
        Ok(Some(decode_handshake_reply(&frame)))
    }
}

// a handshake reply is ideally a JSON envelope, in which case its
// `result` field is the datum; anything else is a raw terminal line
fn decode_handshake_reply(frame: &[u8]) -> Value {
    if let Ok(value) = serialize::deserialize(frame) {
        if let Some(result) = value.get("result") {
            return result.clone();
        }
    }
    let raw = String::from_utf8_lossy(frame);
    Value::String(raw.trim().to_string())
}

/// Drives the authentication half of a handshake against a freshly
/// accepted peer.
///
/// `peer_hostname` is the name the remote is known by (for the
/// trusted-hostnames mode) and `network_name` is the Manager's own
/// `host:port` string, stamped into prompts.
pub async fn await_handshake<R, W>(
    policy: &AuthPolicy,
    io: &mut HandshakeIo<'_, R, W>,
    peer_hostname: &str,
    network_name: &str,
    users: &Mutex<UsersTable>,
) -> Result<HandshakeVerdict>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match policy {
        AuthPolicy::None => Ok(HandshakeVerdict::Accepted { is_admin: false }),

        AuthPolicy::SharedPassword(expected) => {
            let reply = match io.prompt("password", network_name).await {
                Ok(reply) => reply,
                Err(e) => return Ok(timed_out(e, "password")?),
            };
            let password = match reply {
                None => {
                    return Ok(HandshakeVerdict::Closed {
                        log: "connection closed before receiving the password".into(),
                    })
                }
                Some(value) => value,
            };
            if password.as_str() == Some(expected.as_str()) {
                Ok(HandshakeVerdict::Accepted { is_admin: false })
            } else {
                Ok(HandshakeVerdict::Rejected {
                    log: "rejected: wrong Manager password".into(),
                    kind: WireErrorKind::AuthFailure,
                    detail: "Wrong Manager password".into(),
                })
            }
        }

        AuthPolicy::TrustedHostnames(trusted) => {
            if trusted.iter().any(|h| h == peer_hostname) {
                Ok(HandshakeVerdict::Accepted { is_admin: false })
            } else {
                Ok(HandshakeVerdict::Rejected {
                    log: "rejected: untrusted hostname".into(),
                    kind: WireErrorKind::AuthFailure,
                    detail: format!("{:?} is not a trusted hostname", peer_hostname),
                })
            }
        }

        AuthPolicy::Login => login_handshake(io, network_name, users).await,
    }
}

/// Drives the username/password exchange of the login mode.
///
/// Also reused by the dispatcher when a peer without administrator
/// privilege sends an admin request: the login runs inline on the
/// existing socket, and the resulting privilege applies to this
/// connection only.
pub async fn login_handshake<R, W>(
    io: &mut HandshakeIo<'_, R, W>,
    network_name: &str,
    users: &Mutex<UsersTable>,
) -> Result<HandshakeVerdict>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reply = match io.prompt("username", network_name).await {
        Ok(reply) => reply,
        Err(e) => return Ok(timed_out(e, "username")?),
    };
    let username = match reply {
        None => {
            return Ok(HandshakeVerdict::Closed {
                log: "connection closed before receiving the username".into(),
            })
        }
        Some(value) => match value.as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                return Ok(HandshakeVerdict::Rejected {
                    log: "rejected: invalid username".into(),
                    kind: WireErrorKind::AuthFailure,
                    detail: "The username must be a non-empty string".into(),
                })
            }
        },
    };

    if !users.lock().is_user_registered(&username)? {
        return Ok(HandshakeVerdict::Rejected {
            log: "rejected: unregistered username".into(),
            kind: WireErrorKind::AuthFailure,
            detail: "Unregistered username".into(),
        });
    }

    let reply = match io.prompt("password", &username).await {
        Ok(reply) => reply,
        Err(e) => return Ok(timed_out(e, "password")?),
    };
    let password = match reply {
        None => {
            return Ok(HandshakeVerdict::Closed {
                log: "connection closed before receiving the password".into(),
            })
        }
        Some(value) => match value.as_str() {
            Some(s) => s.to_string(),
            None => {
                return Ok(HandshakeVerdict::Rejected {
                    log: "rejected: invalid password".into(),
                    kind: WireErrorKind::AuthFailure,
                    detail: "The password must be a string".into(),
                })
            }
        },
    };

    let (valid, is_admin) = {
        let users = users.lock();
        let valid = users.is_password_valid(&username, &password)?;
        let is_admin = valid && users.is_admin(&username)?;
        (valid, is_admin)
    };

    if valid {
        Ok(HandshakeVerdict::Accepted { is_admin })
    } else {
        Ok(HandshakeVerdict::Rejected {
            log: "rejected: wrong login password".into(),
            kind: WireErrorKind::AuthFailure,
            detail: "Wrong login password".into(),
        })
    }
}

fn timed_out(e: Error, stage: &str) -> Result<HandshakeVerdict> {
    if e.kind() == ErrorKind::HandshakeTimeout {
        Ok(HandshakeVerdict::Rejected {
            log: format!("rejected: no {} before the deadline", stage),
            kind: WireErrorKind::HandshakeTimeout,
            detail: format!("No {} reply arrived before the deadline", stage),
        })
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_handshake_reply, AuthPolicy};
    use crate::hub::communication::message::Envelope;

    #[test]
    fn test_policy_mutual_exclusion() {
        assert!(AuthPolicy::from_options(None, false, None).is_ok());
        assert!(AuthPolicy::from_options(Some("pw".into()), false, None).is_ok());
        assert!(AuthPolicy::from_options(None, true, None).is_ok());
        assert!(AuthPolicy::from_options(None, false, Some(vec!["localhost".into()])).is_ok());

        assert!(AuthPolicy::from_options(Some("pw".into()), true, None).is_err());
        assert!(
            AuthPolicy::from_options(Some("pw".into()), false, Some(vec!["x".into()])).is_err()
        );
        assert!(AuthPolicy::from_options(None, true, Some(vec!["x".into()])).is_err());
    }

    #[test]
    fn test_handshake_reply_decoding() {
        // a JSON envelope contributes its result field
        let frame = Envelope::reply(json!("hunter2"), "", "").encode().unwrap();
        assert_eq!(decode_handshake_reply(&frame), json!("hunter2"));

        // a bare terminal line contributes itself, trimmed
        assert_eq!(decode_handshake_reply(b"hunter2\r"), json!("hunter2"));

        // JSON without a result field is still a bare line
        assert_eq!(
            decode_handshake_reply(b"{\"no\": \"result\"}"),
            json!("{\"no\": \"result\"}")
        );
    }
}
