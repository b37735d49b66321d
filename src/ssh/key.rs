use std::hash::{Hash, Hasher};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

/// Identifies one authentication target: who we connect as, where, and
/// with which credentials.
///
/// Keys are immutable once built and are used as map keys by the caching
/// session layer and the queue executor, so equality and hashing are
/// structural over every field, credential material included.
#[derive(Clone)]
pub struct SessionKey {
    host: Arc<str>,
    port: u16,
    user: Arc<str>,
    password: Option<SecretString>,
    private_key: Option<Vec<u8>>,
    host_fingerprint: Option<String>,
}

impl SessionKey {
    pub fn new(host: &str, port: u16, user: &str) -> Self {
        Self {
            host: Arc::from(host),
            port,
            user: Arc::from(user),
            password: None,
            private_key: None,
            host_fingerprint: None,
        }
    }

    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    /// Attach private key material (PEM bytes). The key stores its own copy.
    pub fn with_private_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Pin the expected SHA-256 host key fingerprint for this target.
    pub fn with_host_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_ref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        self.user.as_ref()
    }

    pub fn password(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    /// Returns a fresh copy of the private key material so callers cannot
    /// mutate the bytes backing this key.
    pub fn private_key(&self) -> Option<Vec<u8>> {
        self.private_key.clone()
    }

    pub fn host_fingerprint(&self) -> Option<&str> {
        self.host_fingerprint.as_deref()
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.host.as_ref() == other.host.as_ref()
            && self.user.as_ref() == other.user.as_ref()
            && secret_eq(&self.password, &other.password)
            && self.private_key == other.private_key
            && self.host_fingerprint == other.host_fingerprint
    }
}

impl Eq for SessionKey {}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.as_ref().hash(state);
        self.port.hash(state);
        self.user.as_ref().hash(state);
        self.password
            .as_ref()
            .map(|p| p.expose_secret())
            .hash(state);
        self.private_key.hash(state);
        self.host_fingerprint.hash(state);
    }
}

fn secret_eq(a: &Option<SecretString>, b: &Option<SecretString>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
        _ => false,
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[KEY]"))
            .field("host_fingerprint", &self.host_fingerprint)
            .finish()
    }
}
