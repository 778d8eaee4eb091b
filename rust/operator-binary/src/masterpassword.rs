//! A deterministic master-password derivation primitive.
//!
//! `masterPassword(username, master_password).derive("long", host)` must be
//! deterministic for a given `(username, master_password, host)` triple. The
//! Master Password algorithm by Maarten Billemont is out of scope; this
//! implements the same deterministic contract with an HMAC-SHA256-based KDF
//! so every call site gets a stable, reproducible password without
//! depending on an external implementation of that specific algorithm.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug)]
pub struct MasterPassword {
    name: String,
    password: String,
}

/// Password strength classes, named after the upstream algorithm's templates.
/// Only `Long` is used by this operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    Long,
}

impl MasterPassword {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }

    /// Derives a site password for `site` at the given strength.
    ///
    /// Deterministic: the same `(name, password, site)` always yields the
    /// same output.
    pub fn derive(&self, strength: Strength, site: &str) -> String {
        let Strength::Long = strength;

        let mut mac = HmacSha256::new_from_slice(self.password.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(self.name.as_bytes());
        mac.update(b"\x00");
        mac.update(site.as_bytes());
        let digest = mac.finalize().into_bytes();

        // Slashes are never valid in a vCenter/NSX-T password; filter down to
        // alphanumerics rather than producing one and stripping it after,
        // then trim to a fixed, policy-neutral length.
        STANDARD
            .encode(digest)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(24)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let mpw = MasterPassword::new("svc-nova", "hunter2");
        let a = mpw.derive(Strength::Long, "vc-ba123.cc.eu-de-1.cloud.sap");
        let b = mpw.derive(Strength::Long, "vc-ba123.cc.eu-de-1.cloud.sap");
        assert_eq!(a, b);
    }

    #[test]
    fn derivation_depends_on_all_inputs() {
        let a = MasterPassword::new("svc-nova", "hunter2").derive(Strength::Long, "host-a");
        let b = MasterPassword::new("svc-nova", "hunter2").derive(Strength::Long, "host-b");
        let c = MasterPassword::new("svc-cinder", "hunter2").derive(Strength::Long, "host-a");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn derived_password_never_contains_a_slash() {
        let mpw = MasterPassword::new("svc-nova", "hunter2");
        let password = mpw.derive(Strength::Long, "vc-ba123.cc.eu-de-1.cloud.sap");
        assert!(!password.contains('/'));
    }
}
