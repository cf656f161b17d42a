//! PBKDF2-HMAC-SHA256 password hashes
//!
//! Stored as `pbkdf2:sha256:<iterations>$<salt>$<digest hex>`. Hashing is
//! CPU bound, so async callers run it on the blocking pool.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

const METHOD: &str = "pbkdf2:sha256";
const ITERATIONS: u32 = if cfg!(test) { 1_000 } else { 260_000 };
const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

pub fn hash_password(password: &str) -> String {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();
    encode(password, &salt, ITERATIONS)
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(method), Some(salt), Some(digest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let Some(iterations) = method
        .strip_prefix(METHOD)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n > 0)
    else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };

    constant_time_eq(&derive(password, salt, iterations), &expected)
}

fn derive(password: &str, salt: &str, iterations: u32) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut out);
    out
}

fn encode(password: &str, salt: &str, iterations: u32) -> String {
    format!(
        "{}:{}${}${}",
        METHOD,
        iterations,
        salt,
        hex::encode(derive(password, salt, iterations))
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("hunter2");
        assert!(stored.starts_with("pbkdf2:sha256:1000$"));
        assert!(verify_password(&stored, "hunter2"));
        assert!(!verify_password(&stored, "hunter3"));
    }

    #[test]
    fn test_known_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 with one iteration
        let stored = "pbkdf2:sha256:1$salt$\
            55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc";
        assert!(verify_password(stored, "passwd"));
        assert!(!verify_password(stored, "password"));
    }

    #[test]
    fn test_salts_differ() {
        let first = hash_password("same");
        let second = hash_password("same");
        assert_ne!(first, second);

        let salt = first.split('$').nth(1).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
        assert!(salt.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("", "x"));
        assert!(!verify_password("md5:1$salt$00", "x"));
        assert!(!verify_password("pbkdf2:sha256:abc$salt$00", "x"));
        assert!(!verify_password("pbkdf2:sha256:0$salt$00", "x"));
        assert!(!verify_password("pbkdf2:sha256:1$salt$zz", "x"));
        assert!(!verify_password("pbkdf2:sha256:1$salt$00$extra", "x"));
        assert!(!verify_password("sha256$100000$00$00", "x"));
    }
}
