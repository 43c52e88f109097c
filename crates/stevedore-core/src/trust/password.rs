//! Shared-secret gate for the trust-establishment action.
//!
//! The daemon stores a salted scrypt hash of the admin password in a
//! fixed-width file (`<data_dir>/adminpwd`): 32 salt bytes followed by
//! 64 derived-key bytes. Verification recomputes the derivation with the
//! stored salt and compares.

use std::path::{Path, PathBuf};

use rand::RngCore;
use scrypt::Params;
use tracing::debug;
use zeroize::Zeroizing;

use super::TrustError;

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;
/// Derived-key length in bytes.
pub const HASH_LEN: usize = 64;

/// scrypt cost parameters: N = 2^14, r = 8, p = 1.
const LOG_N: u8 = 14;
const R: u32 = 8;
const P: u32 = 1;

fn params() -> Params {
    // The constants above are valid scrypt parameters.
    Params::new(LOG_N, R, P, HASH_LEN).expect("fixed scrypt parameters are valid")
}

/// The on-disk password gate.
pub struct PasswordGate {
    path: PathBuf,
}

impl PasswordGate {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("adminpwd"),
        }
    }

    /// Whether a password has been set.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Store the salted hash for a new password, replacing any previous
    /// one.
    pub fn set(&self, password: &str) -> Result<(), TrustError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut derived = Zeroizing::new([0u8; HASH_LEN]);
        scrypt::scrypt(password.as_bytes(), &salt, &params(), derived.as_mut_slice())
            .map_err(|e| TrustError::InvalidCertificate(format!("scrypt: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(SALT_LEN + HASH_LEN);
        buf.extend_from_slice(&salt);
        buf.extend_from_slice(derived.as_slice());
        std::fs::write(&self.path, &buf)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Verify a submitted password against the stored hash. Any failure
    /// to read or parse the file verifies as false.
    pub fn verify(&self, password: &str) -> bool {
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(_) => {
                debug!("no admin password is set");
                return false;
            }
        };
        if buf.len() != SALT_LEN + HASH_LEN {
            debug!("stored admin password has unexpected length");
            return false;
        }

        let salt = &buf[..SALT_LEN];
        let mut derived = Zeroizing::new([0u8; HASH_LEN]);
        if scrypt::scrypt(password.as_bytes(), salt, &params(), derived.as_mut_slice()).is_err() {
            return false;
        }

        derived.as_slice() == &buf[SALT_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unset_gate_verifies_false() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        assert!(!gate.is_set());
        assert!(!gate.verify("anything"));
    }

    #[test]
    fn test_set_and_verify() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        gate.set("hunter2 correct horse").unwrap();

        assert!(gate.is_set());
        assert!(gate.verify("hunter2 correct horse"));
        assert!(!gate.verify("hunter2 wrong horse"));
        assert!(!gate.verify(""));
    }

    #[test]
    fn test_verify_very_long_password() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        let long = "x".repeat(4096);
        gate.set(&long).unwrap();

        assert!(gate.verify(&long));
        assert!(!gate.verify(&"x".repeat(4095)));
    }

    #[test]
    fn test_stored_file_is_fixed_width() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        gate.set("secret").unwrap();

        let buf = std::fs::read(tmp.path().join("adminpwd")).unwrap();
        assert_eq!(buf.len(), SALT_LEN + HASH_LEN);
    }

    #[test]
    fn test_set_replaces_previous_password() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        gate.set("first").unwrap();
        gate.set("second").unwrap();

        assert!(!gate.verify("first"));
        assert!(gate.verify("second"));
    }

    #[test]
    fn test_truncated_file_verifies_false() {
        let tmp = TempDir::new().unwrap();
        let gate = PasswordGate::new(tmp.path());
        gate.set("secret").unwrap();

        std::fs::write(tmp.path().join("adminpwd"), b"short").unwrap();
        assert!(!gate.verify("secret"));
    }
}
