//! TLS plumbing: certificate loading, the server and client session
//! configurations, and first-use certificate pinning.
//!
//! Certificate and key *generation* is not this crate's business; a
//! Manager is pointed at PEM files produced elsewhere. Clients pin
//! the Manager's certificate on first use: the certificate is
//! fetched, its fingerprint shown, and an interactive yes/no
//! confirmation required before it is cached on disk. Non
//! interactive peers must supply a certificate path instead.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_tls::TlsConnector;
use parking_lot::Mutex;
use ring::digest;
use rustls::internal::pemfile;
use rustls::{
    Certificate, ClientConfig, NoClientAuth, PrivateKey, RootCertStore, ServerCertVerified,
    ServerCertVerifier, ServerConfig, TLSError,
};

use crate::hub::communication::socket;
use crate::hub::error::*;

/// The directory certificates get cached under, `~/.hermod/certs`.
pub fn cert_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home).join(".hermod").join("certs")
}

/// Loads every certificate in a PEM file.
pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).wrapped_msg(ErrorKind::Crypto, "Cannot open certificate")?;
    let mut reader = BufReader::new(file);
    let certs = pemfile::certs(&mut reader)
        .ok()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::wrapped(ErrorKind::Crypto, "No certificate found in PEM file"))?;
    Ok(certs)
}

/// Loads the first private key in a PEM file, PKCS#8 or RSA.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path).wrapped_msg(ErrorKind::Crypto, "Cannot open private key")?;
    let mut reader = BufReader::new(file);
    if let Ok(mut keys) = pemfile::pkcs8_private_keys(&mut reader) {
        if !keys.is_empty() {
            return Ok(keys.swap_remove(0));
        }
    }
    let file = File::open(path).wrapped_msg(ErrorKind::Crypto, "Cannot open private key")?;
    let mut reader = BufReader::new(file);
    if let Ok(mut keys) = pemfile::rsa_private_keys(&mut reader) {
        if !keys.is_empty() {
            return Ok(keys.swap_remove(0));
        }
    }
    Err(Error::wrapped(
        ErrorKind::Crypto,
        "No private key found in PEM file",
    ))
}

/// Builds the TLS configuration a Manager accepts connections with.
pub fn server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig> {
    let certs = load_certificates(cert_file)?;
    let key = load_private_key(key_file)?;
    let mut config = ServerConfig::new(NoClientAuth::new());
    config
        .set_single_cert(certs, key)
        .wrapped(ErrorKind::Crypto)?;
    Ok(config)
}

/// The SHA-256 fingerprint of a DER certificate, colon separated.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA256, der);
    let hex = hex::encode_upper(digest.as_ref());
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap())
        .collect::<Vec<_>>()
        .join(":")
}

// trusts whatever certificate the server presents, and records its
// DER bytes for the caller to fingerprint; only used for the
// explicit fetch step of the pinning flow
struct CapturingVerifier {
    captured: Arc<Mutex<Option<Vec<u8>>>>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        if let Some(cert) = presented_certs.first() {
            *self.captured.lock() = Some(cert.0.clone());
        }
        Ok(ServerCertVerified::assertion())
    }
}

// accepts only the exact certificate that was pinned
struct PinnedVerifier {
    der: Vec<u8>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        match presented_certs.first() {
            Some(cert) if cert.0 == self.der => Ok(ServerCertVerified::assertion()),
            _ => Err(TLSError::General(
                "Presented certificate does not match the pinned certificate".into(),
            )),
        }
    }
}

/// Fetches the certificate a remote endpoint presents, in DER form.
pub async fn fetch_certificate(addr: SocketAddr, host: &str) -> Result<Vec<u8>> {
    let captured = Arc::new(Mutex::new(None));
    let verifier = CapturingVerifier {
        captured: captured.clone(),
    };
    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(verifier));
    let connector: TlsConnector = Arc::new(config).into();

    let sock = socket::connect(addr).await?;
    // completing the handshake is enough; the session is dropped
    // right after the certificate is captured
    let _stream = connector
        .connect(host, sock)
        .await
        .wrapped_msg(ErrorKind::Crypto, "TLS handshake failed while fetching certificate")?;

    let der = captured.lock().take();
    der.ok_or_else(|| Error::wrapped(ErrorKind::Crypto, "Remote presented no certificate"))
}

/// Writes a DER certificate to `path` in PEM form.
pub fn save_certificate(path: &Path, der: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).wrapped(ErrorKind::Crypto)?;
    }
    let mut file = File::create(path).wrapped(ErrorKind::Crypto)?;
    writeln!(file, "-----BEGIN CERTIFICATE-----").wrapped(ErrorKind::Crypto)?;
    let encoded = base64::encode(der);
    for chunk in encoded.as_bytes().chunks(64) {
        file.write_all(chunk).wrapped(ErrorKind::Crypto)?;
        file.write_all(b"\n").wrapped(ErrorKind::Crypto)?;
    }
    writeln!(file, "-----END CERTIFICATE-----").wrapped(ErrorKind::Crypto)?;
    Ok(())
}

/// Resolves the TLS configuration a Client or Service connects with.
///
/// Resolution order:
///
/// 1. An explicit certificate path pins that certificate.
/// 2. A previously cached certificate for `host` pins it.
/// 3. Otherwise the certificate is fetched from the remote, its
///    fingerprint shown, and (unless `assume_trust` is set) an
///    interactive confirmation is required before caching it.
pub async fn client_config(
    addr: SocketAddr,
    host: &str,
    cert_file: Option<&Path>,
    assume_trust: bool,
) -> Result<ClientConfig> {
    let der = match cert_file {
        Some(path) => {
            let mut certs = load_certificates(path)?;
            certs.swap_remove(0).0
        }
        None => {
            let cached = cert_dir().join(format!("{}.crt", host));
            if cached.is_file() {
                let mut certs = load_certificates(&cached)?;
                certs.swap_remove(0).0
            } else {
                let der = fetch_certificate(addr, host).await?;
                if !assume_trust && !confirm_fingerprint(host, &fingerprint(&der))? {
                    return Err(Error::wrapped(
                        ErrorKind::Crypto,
                        format!("The certificate of {:?} was not trusted", host),
                    ));
                }
                save_certificate(&cached, &der)?;
                tracing::info!(host, path = %cached.display(), "cached new certificate");
                der
            }
        }
    };

    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(PinnedVerifier { der }));
    Ok(config)
}

fn confirm_fingerprint(host: &str, fingerprint: &str) -> Result<bool> {
    println!(
        "The certificate for {} is not cached in the registry.\n\
         You have no guarantee that the server is the computer that\n\
         you think it is.\n\n\
         The server's SHA-256 key fingerprint is\n{}\n\n\
         If you trust this host you can save the certificate and\n\
         continue to connect, otherwise this is your final chance\n\
         to abort.\n",
        host, fingerprint
    );
    loop {
        print!("Continue? y/n: ");
        std::io::stdout().flush().wrapped(ErrorKind::Crypto)?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .wrapped(ErrorKind::Crypto)?;
        let line = line.trim().to_ascii_lowercase();
        if line.starts_with('y') {
            return Ok(true);
        }
        if line.starts_with('n') {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fingerprint;

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"not really a certificate");
        // 32 bytes, colon separated pairs of uppercase hex
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp
            .split(':')
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit())));
    }
}
