//! The SQLite tables backing the Manager: an append-only log of
//! connection events, the registered users, and the trusted
//! hostnames.
//!
//! Access is row-at-a-time and every write commits per call, so a
//! crash never loses more than the statement in flight. Each table
//! owns its own connection to the database file.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use rusqlite::{params, Connection};

use crate::hub::communication;
use crate::hub::error::*;

// work factor of the password hash
const PBKDF2_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// The default database path, `~/.hermod/manager.db`.
pub fn default_database_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home).join(".hermod").join("manager.db")
}

fn open_connection(database: Option<&Path>) -> Result<(Connection, String)> {
    match database {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).wrapped(ErrorKind::Database)?;
            }
            let conn = Connection::open(path).wrapped(ErrorKind::Database)?;
            Ok((conn, path.display().to_string()))
        }
        None => {
            let path = default_database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).wrapped(ErrorKind::Database)?;
            }
            let conn = Connection::open(&path).wrapped(ErrorKind::Database)?;
            Ok((conn, path.display().to_string()))
        }
    }
}

/// One row of the connections log.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub pid: i64,
    pub timestamp: String,
    pub address: String,
    pub message: String,
}

/// Append-only audit log of connection events.
pub struct ConnectionsTable {
    conn: Connection,
    path: String,
}

impl ConnectionsTable {
    pub const NAME: &'static str = "connections";

    /// Opens (and creates, if missing) the connections table.
    pub fn open(database: Option<&Path>) -> Result<Self> {
        let (conn, path) = open_connection(database)?;
        let table = Self { conn, path };
        table.create()?;
        Ok(table)
    }

    /// Opens the table in a database residing in RAM.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrapped(ErrorKind::Database)?;
        let table = Self {
            conn,
            path: ":memory:".into(),
        };
        table.create()?;
        Ok(table)
    }

    fn create(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS connections (
                     pid INTEGER PRIMARY KEY AUTOINCREMENT,
                     timestamp TEXT DEFAULT (datetime('now')),
                     address TEXT,
                     message TEXT
                 )",
                [],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    /// The path of the backing database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Appends one audit entry for the peer at `address`.
    pub fn insert(&self, address: &str, message: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO connections (address, message) VALUES (?1, ?2)",
                params![address, message],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    /// Every logged connection event, oldest first.
    pub fn connections(&self) -> Result<Vec<ConnectionRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pid, timestamp, address, message FROM connections ORDER BY pid")
            .wrapped(ErrorKind::Database)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConnectionRecord {
                    pid: row.get(0)?,
                    timestamp: row.get(1)?,
                    address: row.get(2)?,
                    message: row.get(3)?,
                })
            })
            .wrapped(ErrorKind::Database)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .wrapped(ErrorKind::Database)
    }
}

/// Registered users, their salted password hashes, and whether each
/// holds administrator privilege.
pub struct UsersTable {
    conn: Connection,
    path: String,
    rng: SystemRandom,
}

impl UsersTable {
    pub const NAME: &'static str = "auth_users";

    /// Opens (and creates, if missing) the users table.
    pub fn open(database: Option<&Path>) -> Result<Self> {
        let (conn, path) = open_connection(database)?;
        let table = Self {
            conn,
            path,
            rng: SystemRandom::new(),
        };
        table.create()?;
        Ok(table)
    }

    /// Opens the table in a database residing in RAM.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrapped(ErrorKind::Database)?;
        let table = Self {
            conn,
            path: ":memory:".into(),
            rng: SystemRandom::new(),
        };
        table.create()?;
        Ok(table)
    }

    fn create(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS auth_users (
                     pid INTEGER PRIMARY KEY AUTOINCREMENT,
                     username TEXT NOT NULL UNIQUE,
                     key TEXT NOT NULL,
                     salt TEXT NOT NULL,
                     is_admin INTEGER NOT NULL
                 )",
                [],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    /// The path of the backing database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn derive(&self, password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            salt,
            password.as_bytes(),
            &mut key,
        );
        key
    }

    /// Registers a new user; the username must not exist yet.
    pub fn insert_user(&self, username: &str, password: &str, is_admin: bool) -> Result<()> {
        if username.is_empty() {
            return Err("The username cannot be empty").wrapped(ErrorKind::Database);
        }
        if password.is_empty() {
            return Err("The password cannot be empty").wrapped(ErrorKind::Database);
        }
        let mut salt = [0; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .simple_msg(ErrorKind::Database, "Failed to generate a salt")?;
        let key = self.derive(password, &salt);
        self.conn
            .execute(
                "INSERT INTO auth_users (username, key, salt, is_admin) VALUES (?1, ?2, ?3, ?4)",
                params![username, hex::encode(key), hex::encode(salt), is_admin as i64],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    /// Updates the password and privilege of a registered user.
    pub fn update_user(&self, username: &str, password: &str, is_admin: bool) -> Result<()> {
        let mut salt = [0; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .simple_msg(ErrorKind::Database, "Failed to generate a salt")?;
        let key = self.derive(password, &salt);
        let n = self
            .conn
            .execute(
                "UPDATE auth_users SET key = ?2, salt = ?3, is_admin = ?4 WHERE username = ?1",
                params![username, hex::encode(key), hex::encode(salt), is_admin as i64],
            )
            .wrapped(ErrorKind::Database)?;
        if n == 0 {
            return Err("No such user").wrapped(ErrorKind::Database);
        }
        Ok(())
    }

    /// Unregisters a user.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "DELETE FROM auth_users WHERE username = ?1",
                params![username],
            )
            .wrapped(ErrorKind::Database)?;
        if n == 0 {
            return Err("No such user").wrapped(ErrorKind::Database);
        }
        Ok(())
    }

    /// Checks if `username` is registered.
    pub fn is_user_registered(&self, username: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM auth_users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .wrapped(ErrorKind::Database)?;
        Ok(count > 0)
    }

    /// Verifies a username/password pair against the stored salted
    /// hash; an unregistered username verifies as invalid.
    pub fn is_password_valid(&self, username: &str, password: &str) -> Result<bool> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT key, salt FROM auth_users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })
            .wrapped(ErrorKind::Database)?;
        let (key, salt) = match row {
            Some(row) => row,
            None => return Ok(false),
        };
        let key = hex::decode(key).wrapped(ErrorKind::Database)?;
        let salt = hex::decode(salt).wrapped(ErrorKind::Database)?;
        let valid = pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            &salt,
            password.as_bytes(),
            &key,
        )
        .is_ok();
        Ok(valid)
    }

    /// Reports whether a registered user holds administrator
    /// privilege.
    pub fn is_admin(&self, username: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT is_admin FROM auth_users WHERE username = ?1",
                params![username],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .wrapped_msg(ErrorKind::Database, "No such user")
    }

    /// Every registered user and their privilege bit.
    pub fn users(&self) -> Result<Vec<(String, bool)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT username, is_admin FROM auth_users ORDER BY username")
            .wrapped(ErrorKind::Database)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)))
            .wrapped(ErrorKind::Database)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .wrapped(ErrorKind::Database)
    }
}

/// The hostnames allowed to bypass password and login checks.
pub struct HostnamesTable {
    conn: Connection,
    path: String,
}

impl HostnamesTable {
    pub const NAME: &'static str = "auth_hostnames";

    /// Opens (and creates, if missing) the hostnames table.
    ///
    /// A freshly created, empty table is pre-seeded with the local
    /// machine's aliases, so a new deployment is not locked out.
    pub fn open(database: Option<&Path>) -> Result<Self> {
        let (conn, path) = open_connection(database)?;
        let table = Self { conn, path };
        table.create()?;
        table.seed()?;
        Ok(table)
    }

    /// Opens the table in a database residing in RAM.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrapped(ErrorKind::Database)?;
        let table = Self {
            conn,
            path: ":memory:".into(),
        };
        table.create()?;
        table.seed()?;
        Ok(table)
    }

    fn create(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS auth_hostnames (
                     pid INTEGER PRIMARY KEY AUTOINCREMENT,
                     hostname TEXT NOT NULL UNIQUE
                 )",
                [],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    fn seed(&self) -> Result<()> {
        if self.hostnames()?.is_empty() {
            for alias in communication::localhost_aliases() {
                self.insert_hostname(&alias)?;
            }
        }
        Ok(())
    }

    /// The path of the backing database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Trusts a hostname; re-trusting is a no-op.
    pub fn insert_hostname(&self, hostname: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO auth_hostnames (hostname) VALUES (?1)",
                params![hostname],
            )
            .wrapped(ErrorKind::Database)?;
        Ok(())
    }

    /// Revokes trust in a hostname.
    pub fn delete_hostname(&self, hostname: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "DELETE FROM auth_hostnames WHERE hostname = ?1",
                params![hostname],
            )
            .wrapped(ErrorKind::Database)?;
        if n == 0 {
            return Err("No such hostname").wrapped(ErrorKind::Database);
        }
        Ok(())
    }

    /// Every trusted hostname.
    pub fn hostnames(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hostname FROM auth_hostnames ORDER BY hostname")
            .wrapped(ErrorKind::Database)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .wrapped(ErrorKind::Database)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .wrapped(ErrorKind::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections_log_round_trip() {
        let table = ConnectionsTable::in_memory().unwrap();
        table.insert("localhost:53717", "new connection request").unwrap();
        table.insert("localhost:53717", "connected as a client").unwrap();

        let rows = table.connections().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].address, "localhost:53717");
        assert_eq!(rows[0].message, "new connection request");
        assert_eq!(rows[1].message, "connected as a client");
        assert!(rows[0].pid < rows[1].pid);
    }

    #[test]
    fn test_users_table_verification() {
        let table = UsersTable::in_memory().unwrap();
        table.insert_user("admin", "whatever", true).unwrap();
        table.insert_user("basic", "the password", false).unwrap();

        assert!(table.is_user_registered("admin").unwrap());
        assert!(!table.is_user_registered("ghost").unwrap());

        assert!(table.is_password_valid("admin", "whatever").unwrap());
        assert!(!table.is_password_valid("admin", "wrong").unwrap());
        assert!(!table.is_password_valid("ghost", "whatever").unwrap());

        assert!(table.is_admin("admin").unwrap());
        assert!(!table.is_admin("basic").unwrap());
        assert!(table.is_admin("ghost").is_err());
    }

    #[test]
    fn test_users_table_mutation() {
        let table = UsersTable::in_memory().unwrap();
        table.insert_user("u", "one", false).unwrap();
        assert!(table.insert_user("u", "two", false).is_err());
        assert!(table.insert_user("", "pw", false).is_err());
        assert!(table.insert_user("x", "", false).is_err());

        table.update_user("u", "two", true).unwrap();
        assert!(!table.is_password_valid("u", "one").unwrap());
        assert!(table.is_password_valid("u", "two").unwrap());
        assert!(table.is_admin("u").unwrap());

        assert_eq!(table.users().unwrap(), vec![("u".to_string(), true)]);

        table.delete_user("u").unwrap();
        assert!(table.delete_user("u").is_err());
        assert!(!table.is_user_registered("u").unwrap());
    }

    #[test]
    fn test_salts_are_unique_per_user() {
        let table = UsersTable::in_memory().unwrap();
        table.insert_user("a", "same password", false).unwrap();
        table.insert_user("b", "same password", false).unwrap();

        let keys: Vec<String> = {
            let mut stmt = table.conn.prepare("SELECT key FROM auth_users").unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.collect::<std::result::Result<_, _>>().unwrap()
        };
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_hostnames_pre_seeded() {
        let table = HostnamesTable::in_memory().unwrap();
        let hostnames = table.hostnames().unwrap();
        assert!(hostnames.iter().any(|h| h == "localhost"));
        assert!(hostnames.iter().any(|h| h == "127.0.0.1"));

        table.insert_hostname("lab-pc").unwrap();
        table.insert_hostname("lab-pc").unwrap();
        let hostnames = table.hostnames().unwrap();
        assert_eq!(hostnames.iter().filter(|h| *h == "lab-pc").count(), 1);

        table.delete_hostname("lab-pc").unwrap();
        assert!(table.delete_hostname("lab-pc").is_err());
    }
}
