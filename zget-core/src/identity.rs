use std::fmt;

use sha1::{Digest, Sha1};

/// DNS-SD service type every zget peer registers under and browses for.
pub const SERVICE_TYPE: &str = "_zget._http._tcp.local.";

/// Discovery rendezvous key for one shared file.
///
/// Lowercase hex SHA-1 of the file's base name.  Only the name after the last
/// `/` takes part, so `a/report.pdf` and `b/report.pdf` share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity(String);

impl ServiceIdentity {
    /// Derives the identity for `filename`.
    ///
    /// Never fails; the empty string hashes like any other name.
    #[must_use]
    pub fn derive(filename: &str) -> Self {
        let digest = Sha1::digest(basename(filename).as_bytes());
        Self(hex::encode(digest))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full DNS-SD instance name, e.g. `<hex>._zget._http._tcp.local.`.
    #[must_use]
    pub fn instance_fullname(&self) -> String {
        format!("{}.{SERVICE_TYPE}", self.0)
    }

    /// Returns `true` when `fullname` is exactly this identity's instance
    /// name.  Prefixes, suffixes and other service types never match.
    #[must_use]
    pub fn matches_fullname(&self, fullname: &str) -> bool {
        fullname
            .strip_suffix(SERVICE_TYPE)
            .and_then(|instance| instance.strip_suffix('.'))
            .is_some_and(|instance| instance == self.0)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final `/`-separated component of `filename`.
///
/// `/` is used regardless of platform so both peers agree on the rule.
#[must_use]
pub fn basename(filename: &str) -> &str {
    filename.rsplit('/').next().unwrap_or(filename)
}
