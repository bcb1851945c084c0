//! Public key helpers: fingerprints, OpenSSH text encoding, comparisons.
//!
//! The authenticator caches policies by key fingerprint, and the static
//! resolver matches keys offered over the wire against the OpenSSH-format
//! strings in the gateway configuration.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use sha2::{Digest, Sha256};

/// Parse an OpenSSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_openssh(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    // Validate that key_data is valid base64
    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// Canonicalize an OpenSSH key string to "type data", dropping the comment.
pub fn normalize_openssh(key: &str) -> Result<String> {
    let (key_type, key_data) = parse_openssh(key)?;
    Ok(format!("{} {}", key_type, key_data))
}

/// Compute fingerprint from raw key bytes (SSH wire format).
/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    // Format as SHA256:base64 (without trailing =), as ssh-keygen -l does
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute the fingerprint of a russh public key.
pub fn fingerprint(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    // public_key_bytes() returns the raw key data in SSH wire format
    let raw_bytes = key.public_key_bytes();
    fingerprint_from_bytes(&raw_bytes)
}

/// Convert a russh public key to OpenSSH string format.
/// Returns format: "ssh-ed25519 AAAA..." or "ssh-rsa AAAA..."
pub fn to_openssh(key: &russh::keys::PublicKey) -> Result<String> {
    use russh::keys::PublicKeyBase64;

    let key_type = match key.algorithm() {
        russh::keys::Algorithm::Ed25519 => "ssh-ed25519",
        russh::keys::Algorithm::Rsa { .. } => "ssh-rsa",
        russh::keys::Algorithm::Ecdsa { curve } => match curve {
            russh::keys::EcdsaCurve::NistP256 => "ecdsa-sha2-nistp256",
            russh::keys::EcdsaCurve::NistP384 => "ecdsa-sha2-nistp384",
            russh::keys::EcdsaCurve::NistP521 => "ecdsa-sha2-nistp521",
        },
        other => return Err(anyhow!("unsupported key algorithm: {}", other)),
    };

    let key_base64 = key.public_key_base64();

    Ok(format!("{} {}", key_type, key_base64))
}

/// Check whether an offered key matches a configured OpenSSH key string.
///
/// Comparison ignores the key comment and any extra whitespace. A key of an
/// algorithm the gateway cannot encode matches nothing.
pub fn matches(configured: &str, offered: &russh::keys::PublicKey) -> bool {
    match (normalize_openssh(configured), to_openssh(offered)) {
        (Ok(configured), Ok(offered)) => configured == offered,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";

    #[test]
    fn test_parse_openssh() {
        let (key_type, _key_data) = parse_openssh(ED25519_KEY).unwrap();
        assert_eq!(key_type, "ssh-ed25519");

        assert!(parse_openssh("ssh-ed25519").is_err());
        assert!(parse_openssh("ssh-ed25519 not!base64!!").is_err());
    }

    #[test]
    fn test_normalize_drops_comment() {
        let normalized = normalize_openssh(ED25519_KEY).unwrap();
        assert!(!normalized.contains("test@example.com"));
        assert_eq!(normalized.split_whitespace().count(), 2);
    }

    #[test]
    fn test_to_openssh_round_trips_through_matches() {
        use russh::keys::ssh_key::rand_core::OsRng;
        use russh::keys::{Algorithm, PrivateKey};

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let public = key.public_key();

        let encoded = to_openssh(public).unwrap();
        assert!(encoded.starts_with("ssh-ed25519 "));
        assert!(matches(&encoded, public));
        assert!(matches(&format!("{encoded} ops@example"), public));
        assert!(!matches(ED25519_KEY, public));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_from_bytes(b"some key material");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            fingerprint_from_bytes(b"abc"),
            fingerprint_from_bytes(b"abc")
        );
        assert_ne!(
            fingerprint_from_bytes(b"abc"),
            fingerprint_from_bytes(b"abd")
        );
    }
}
