//! Generation, hashing and verification of account passwords.

use std::sync::LazyLock;

use rand::{Rng, seq::SliceRandom};
use snafu::{ResultExt, Snafu};

/// Number of characters in a generated password.
pub const PASSWORD_LENGTH: usize = 16;

/// bcrypt cost factor used for account password hashes.
pub const HASH_COST: u32 = 10;

const DIGITS: &[u8] = b"0123456789";
const SPECIALS: &[u8] = b"=.+-_/[]{}@?";
const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789=.+-_/[]{}@?";

/// Compared against when a stored hash turns out to be malformed, so that a
/// broken account costs as much time as a wrong password.
static DUMMY_HASH: LazyLock<Option<String>> = LazyLock::new(|| bcrypt::hash("", HASH_COST).ok());

#[derive(Debug, Snafu)]
#[snafu(display("failed to hash password"))]
pub struct HashError {
    source: bcrypt::BcryptError,
}

/// Generates a random password of [`PASSWORD_LENGTH`] characters.
///
/// Every password contains at least one digit and one special character.
/// The characters are drawn from the thread local generator, which is a
/// CSPRNG seeded by the operating system.
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    let mut pick = |set: &[u8]| set[rng.random_range(0..set.len())];

    let mut buf = Vec::with_capacity(PASSWORD_LENGTH);
    buf.push(pick(DIGITS));
    buf.push(pick(SPECIALS));
    while buf.len() < PASSWORD_LENGTH {
        buf.push(pick(ALPHABET));
    }
    buf.shuffle(&mut rand::rng());

    // The alphabet only contains ASCII characters
    buf.into_iter().map(char::from).collect()
}

pub fn hash_password(password: &str) -> Result<String, HashError> {
    bcrypt::hash(password, HASH_COST).context(HashSnafu)
}

/// Checks `candidate` against a bcrypt `hash`.
///
/// A malformed hash never matches. It is still run through a full bcrypt
/// comparison so it takes as long as a mismatching password.
pub fn verify_password(hash: &str, candidate: &str) -> bool {
    match bcrypt::verify(candidate, hash) {
        Ok(matches) => matches,
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "stored password hash is malformed"
            );
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = bcrypt::verify(candidate, dummy);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_password_shape() {
        for _ in 0..50 {
            let password = generate_password();
            assert_eq!(password.len(), PASSWORD_LENGTH);
            assert!(password.bytes().all(|b| ALPHABET.contains(&b)));
            assert!(password.bytes().any(|b| DIGITS.contains(&b)));
            assert!(password.bytes().any(|b| SPECIALS.contains(&b)));
        }
    }

    #[test]
    fn generated_passwords_differ() {
        let passwords: HashSet<_> = (0..100).map(|_| generate_password()).collect();
        assert_eq!(passwords.len(), 100);
    }

    #[test]
    fn hash_round_trip() {
        let password = generate_password();
        let other = generate_password();
        let hash = hash_password(&password).unwrap();

        assert!(hash.starts_with("$2"));
        assert!(verify_password(&hash, &password));
        assert!(!verify_password(&hash, &other));
        assert!(!verify_password(&hash, ""));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("secret").unwrap();
        let second = hash_password("secret").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!verify_password("not-a-bcrypt-hash", "secret"));
        assert!(!verify_password("", ""));
    }
}
