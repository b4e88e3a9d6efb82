//! Credential bundle shared by every transport of a session.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::FabricError;

/// Default private key file name, looked up under `~/.ssh`.
pub const DEFAULT_KEY_FILE: &str = "id_rsa";

/// How a session authenticates. Exactly one secret is ever present.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    PrivateKey(PathBuf),
}

// Never print passwords.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(***)"),
            Secret::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key (StrictHostKeyChecking=no).
    #[default]
    Off,
    /// Refuse hosts whose key is not already known.
    Strict,
}

impl HostKeyPolicy {
    pub fn from_check(check: bool) -> Self {
        if check {
            HostKeyPolicy::Strict
        } else {
            HostKeyPolicy::Off
        }
    }

    pub fn ssh_option(self) -> &'static str {
        match self {
            HostKeyPolicy::Off => "StrictHostKeyChecking=no",
            HostKeyPolicy::Strict => "StrictHostKeyChecking=yes",
        }
    }
}

/// Immutable for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
}

impl Credentials {
    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    pub fn with_key(username: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::PrivateKey(key.into()),
        }
    }

    /// Key-based credentials using `~/.ssh/id_rsa`.
    pub fn with_default_key(username: impl Into<String>) -> Result<Self, FabricError> {
        Ok(Self::with_key(username, default_key_path()?))
    }

    /// Builds a bundle from optional config fields, rejecting ambiguous input.
    pub fn resolve(
        username: &str,
        password: Option<&str>,
        private_key: Option<&Path>,
    ) -> Result<Self, FabricError> {
        if username.is_empty() {
            return Err(FabricError::Config("username must not be empty".into()));
        }
        match (password, private_key) {
            (Some(_), Some(_)) => Err(FabricError::Config(
                "only one of password and private_key may be set".into(),
            )),
            (Some(password), None) => Ok(Self::with_password(username, password)),
            (None, Some(key)) => Ok(Self::with_key(username, key)),
            (None, None) => Self::with_default_key(username),
        }
    }

    pub fn password(&self) -> Option<&str> {
        match &self.secret {
            Secret::Password(password) => Some(password),
            Secret::PrivateKey(_) => None,
        }
    }

    pub fn key_path(&self) -> Option<&Path> {
        match &self.secret {
            Secret::Password(_) => None,
            Secret::PrivateKey(path) => Some(path),
        }
    }
}

fn default_key_path() -> Result<PathBuf, FabricError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join(DEFAULT_KEY_FILE))
        .ok_or_else(|| FabricError::Config("cannot determine home directory".into()))
}
