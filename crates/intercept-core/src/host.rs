use serde::Serialize;
use sha2::{Digest, Sha256};

/// Identity of the machine running the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    /// `<hostname>|<os>|<arch>`
    pub data: String,
    /// Hex SHA-256 of `data`.
    pub fingerprint: String,
}

impl HostIdentity {
    pub fn detect() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self::from_parts(&name, std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_parts(name: &str, os: &str, arch: &str) -> Self {
        let data = format!("{name}|{os}|{arch}");
        let fingerprint = sha256_hex(data.as_bytes());
        Self { data, fingerprint }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let a = HostIdentity::from_parts("box", "linux", "x86_64");
        let b = HostIdentity::from_parts("box", "linux", "x86_64");
        assert_eq!(a, b);
        assert_eq!(a.data, "box|linux|x86_64");
        assert_eq!(a.fingerprint.len(), 64);
    }
}
