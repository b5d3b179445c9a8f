//! Public-key material: authorized_keys parsing, canonical key encoding,
//! key-derived user ids, and host-key loading.

use anyhow::{bail, Context, Result};
use russh_keys::key::{KeyPair, PublicKey, SignatureHash};
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::warn;

/// The canonical single-line authorized-keys encoding of a public key.
///
/// This is the byte form used for equality checks, user-id hashing, and
/// hook argv.
pub fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

/// Stable user id for a key: lowercase hex of SHA-256 over the canonical
/// authorized-keys line.
pub fn user_id_from_key(key: &PublicKey) -> String {
    hex::encode(Sha256::digest(authorized_key_line(key).as_bytes()))
}

/// Parse an OpenSSH authorized_keys blob into the keys it lists.
///
/// Comment lines, per-entry options, and trailing text are tolerated and
/// discarded. Any entry without a parseable key fails the whole load.
pub fn load_authorized_keys(data: &str) -> Result<Vec<PublicKey>> {
    let mut keys = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        keys.push(parse_entry(line)?);
    }
    Ok(keys)
}

fn parse_entry(line: &str) -> Result<PublicKey> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    // Options may precede the key type, so scan for the algorithm token.
    for (i, token) in tokens.iter().enumerate() {
        if is_key_algorithm(token) {
            let blob = tokens
                .get(i + 1)
                .with_context(|| format!("authorized_keys entry {line:?} is missing key data"))?;
            return russh_keys::parse_public_key_base64(blob)
                .with_context(|| format!("invalid public key in authorized_keys entry {line:?}"));
        }
    }
    bail!("unrecognized authorized_keys entry: {line:?}");
}

fn is_key_algorithm(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

/// Load the host key from `path`, or generate an ephemeral RSA-2048 key
/// when no path is configured.
///
/// Ephemeral keys change the host identity on every restart; deployments
/// that care about known-hosts pinning must configure a persistent key.
pub fn load_or_generate_host_key(path: &str) -> Result<KeyPair> {
    if path.is_empty() {
        warn!("no host key configured, generating an ephemeral RSA-2048 one");
        return KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
            .context("failed to generate RSA-2048 host key");
    }
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read host key {path}"))?;
    russh_keys::decode_secret_key(&pem, None)
        .with_context(|| format!("failed to decode host key {path}"))
}
