//! Configuration.
//!
//! Command line arguments are clap structs. Everything about the cluster itself (hosts,
//! credentials, policies) lives in the cluster file, which is YAML; JSON files parse as well.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::auth::{Credentials, HostKeyPolicy};
use crate::error::FabricError;
use crate::host::{expand_hosts, Host, HostSpec};
use crate::session::{Mode, SessionBuilder};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Cluster file to use
    #[arg(long, short, default_value = "cluster.yaml")]
    pub cluster_file: PathBuf,

    /// Keep going when hosts fail and prune unreachable ones,
    /// regardless of `stop_on_errors` in the cluster file
    #[arg(long, short)]
    pub tolerant: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one command on every host
    Exec {
        command: String,
        /// Read deadline in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
    },
    /// Render a Handlebars command template per host and run each on its host
    ExecEach {
        template: String,
        /// Read deadline in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
    },
    /// Upload a file or directory to every host
    Upload {
        local: PathBuf,
        remote: String,
        #[arg(long, short)]
        recursive: bool,
    },
    /// Download a file from every host to <LOCAL_PREFIX>_<host>
    Download { remote: String, local_prefix: PathBuf },
    /// Force-reboot every host
    Reboot,
    /// Copy a file from one host to another through the source host
    Relay {
        source: String,
        source_path: String,
        destination: String,
        destination_path: String,
        /// Fail when ssh-keyscan or scp exits non-zero
        #[arg(long)]
        check_status: bool,
    },
    /// Run a registered generator with key=value arguments
    Generate { name: String, args: Vec<String> },
    /// List registered generators
    Generators,
}

fn default_stop_on_errors() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Contents of the cluster file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub hosts: Vec<HostSpec>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Defaults to `~/.ssh/id_rsa` when no password is given either.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub host_key_check: bool,
    #[serde(default = "default_stop_on_errors")]
    pub stop_on_errors: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, FabricError> {
        let file = std::fs::File::open(path).map_err(|e| FabricError::ClusterFile {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_reader(file).map_err(|e| FabricError::ClusterFile {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    pub fn hosts(&self) -> Result<Vec<Host>, FabricError> {
        expand_hosts(&self.hosts)
    }

    pub fn credentials(&self) -> Result<Credentials, FabricError> {
        let key = self.private_key.as_deref().map(expand_home);
        Credentials::resolve(&self.username, self.password.as_deref(), key.as_deref())
    }

    pub fn mode(&self) -> Mode {
        Mode::from_stop_on_errors(self.stop_on_errors)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// A session builder for the expanded hosts, plus the hosts themselves.
    pub fn session_builder(&self) -> Result<(Vec<Host>, SessionBuilder), FabricError> {
        let hosts = self.hosts()?;
        let builder = SessionBuilder::new(
            hosts.iter().map(|h| h.hostname.clone()).collect(),
            self.credentials()?,
        )
        .host_key(HostKeyPolicy::from_check(self.host_key_check))
        .mode(self.mode())
        .connect_timeout(self.connect_timeout());
        Ok((hosts, builder))
    }
}

/// Replaces a leading `~/` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ClusterConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_are_strict_without_host_key_checks() {
        let config = parse("hosts: [node1]\nusername: root\npassword: pw\n");
        assert!(config.stop_on_errors);
        assert_eq!(config.mode(), Mode::Strict);
        assert!(!config.host_key_check);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn json_cluster_file_parses() {
        let config = parse(
            r#"{"hosts": ["10.0.0.1", "10.0.0.2"], "username": "svc",
                "private_key": "/keys/id_ed25519", "stop_on_errors": false}"#,
        );
        assert_eq!(config.mode(), Mode::Tolerant);
        let hosts = config.hosts().unwrap();
        assert_eq!(hosts.len(), 2);
        let creds = config.credentials().unwrap();
        assert_eq!(creds.key_path(), Some(Path::new("/keys/id_ed25519")));
    }

    #[test]
    fn both_secrets_are_rejected() {
        let config = parse("hosts: [a]\nusername: root\npassword: pw\nprivate_key: /k\n");
        assert!(config.credentials().is_err());
    }

    #[test]
    fn zero_connect_timeout_disables_it() {
        let config = parse("hosts: [a]\nusername: root\npassword: pw\nconnect_timeout_secs: 0\n");
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ClusterConfig::load(Path::new("/no/such/cluster.yaml")).unwrap_err();
        assert!(matches!(err, FabricError::ClusterFile { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "hosts:\n  - hostname: [\"gpu{{{{n}}}}\"]\n    n: [1, 2]\nusername: root\npassword: pw\n"
        )
        .unwrap();
        let config = ClusterConfig::load(file.path()).unwrap();
        let names: Vec<_> = config
            .hosts()
            .unwrap()
            .into_iter()
            .map(|h| h.hostname)
            .collect();
        assert_eq!(names, vec!["gpu1", "gpu2"]);
    }

    #[test]
    fn home_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home(Path::new("~/.ssh/id_rsa")),
                home.join(".ssh/id_rsa")
            );
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
