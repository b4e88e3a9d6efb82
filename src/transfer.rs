//! File transfer over the live set, plus the host-to-host relay.
//!
//! Transfer failures are reported, never treated as reachability signals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;

use crate::auth::Credentials;
use crate::error::{FabricError, Fault};
use crate::executor::run_on_host;
use crate::pool::SessionPool;
use crate::transport::{shell_quote, Connector, Transport};

/// Known-hosts file the relay primes on the source host.
pub const RELAY_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Dir(String),
    File(PathBuf, String),
}

/// Uploads `local` to `remote` on every host of `pool`.
pub async fn upload(
    pool: &SessionPool,
    local: &Path,
    remote: &str,
    recursive: bool,
) -> Result<(), FabricError> {
    let steps = plan_upload(local, remote, recursive)?;
    tracing::debug!(
        local = %local.display(),
        remote,
        steps = steps.len(),
        "Uploading to {} hosts.",
        pool.len()
    );
    let results = join_all(
        pool.transports()
            .iter()
            .map(|transport| run_steps(transport.as_ref(), &steps)),
    )
    .await;
    first_failure(pool, results)
}

/// Copies `remote` from every host of `pool` to `<local_prefix>_<host>`.
pub async fn download(
    pool: &SessionPool,
    remote: &str,
    local_prefix: &Path,
) -> Result<(), FabricError> {
    let results = join_all(pool.transports().iter().map(|transport| {
        let local = suffixed(local_prefix, transport.host());
        async move { transport.get_file(remote, &local).await }
    }))
    .await;
    first_failure(pool, results)
}

/// `<prefix>_<host>`, next to `prefix`.
pub fn suffixed(prefix: &Path, host: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push("_");
    name.push(host);
    PathBuf::from(name)
}

fn first_failure(pool: &SessionPool, results: Vec<Result<(), Fault>>) -> Result<(), FabricError> {
    for (host, result) in pool.hosts().zip(results) {
        if let Err(fault) = result {
            tracing::warn!(host, "Transfer failed: {}", fault);
            return Err(FabricError::Transfer {
                host: host.to_owned(),
                fault,
            });
        }
    }
    Ok(())
}

async fn run_steps(transport: &dyn Transport, steps: &[Step]) -> Result<(), Fault> {
    for step in steps {
        match step {
            Step::Dir(remote) => transport.make_dir(remote).await?,
            Step::File(local, remote) => transport.put_file(local, remote).await?,
        }
    }
    Ok(())
}

/// Flattens `local` into the directory and file operations needed on each host.
/// Directories come before their contents.
fn plan_upload(local: &Path, remote: &str, recursive: bool) -> Result<Vec<Step>, FabricError> {
    let metadata = std::fs::metadata(local)?;
    if !metadata.is_dir() {
        return Ok(vec![Step::File(local.to_owned(), remote.to_owned())]);
    }
    if !recursive {
        return Err(FabricError::Config(format!(
            "{} is a directory; upload it recursively",
            local.display()
        )));
    }
    let mut steps = vec![Step::Dir(remote.to_owned())];
    let mut entries: Vec<_> = std::fs::read_dir(local)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let child_remote = format!(
            "{}/{}",
            remote.trim_end_matches('/'),
            entry.file_name().to_string_lossy()
        );
        steps.extend(plan_upload(&entry.path(), &child_remote, true)?);
    }
    Ok(steps)
}

/// Copies a file from one remote host to another without staging it locally.
#[derive(Debug, Clone)]
pub struct Relay {
    pub source: String,
    pub source_path: String,
    pub destination: String,
    pub destination_path: String,
    /// Falls back to the source credentials when absent.
    pub destination_credentials: Option<Credentials>,
    /// Fail on a non-zero `ssh-keyscan` or `sshpass scp` exit instead of only logging it.
    /// Off by default, matching the historical behavior of ignoring both.
    pub check_status: bool,
}

impl Relay {
    /// The commands issued on the source host, in order.
    ///
    /// Stale destination entries are scrubbed from the known-hosts file and a fresh key scan is
    /// appended before the password-based copy runs.
    pub fn commands(&self, source_credentials: &Credentials) -> Result<Vec<String>, FabricError> {
        let credentials = self
            .destination_credentials
            .as_ref()
            .unwrap_or(source_credentials);
        let password = credentials.password().ok_or_else(|| self.error(
            "the destination must be reachable with a password".to_owned(),
        ))?;
        let destination = shell_quote(&self.destination);
        Ok(vec![
            format!(
                "ssh-keygen -f {} -R {}",
                RELAY_KNOWN_HOSTS, destination
            ),
            format!(
                "ssh-keyscan -H {} >> {}",
                destination, RELAY_KNOWN_HOSTS
            ),
            format!(
                "sshpass -p {} scp -r {} {}",
                shell_quote(password),
                shell_quote(&self.source_path),
                shell_quote(&format!(
                    "{}@{}:{}",
                    credentials.username, self.destination, self.destination_path
                )),
            ),
        ])
    }

    /// Runs the relay through a transport opened by `connector` to the source host.
    pub async fn run(
        &self,
        connector: &dyn Connector,
        source_credentials: &Credentials,
    ) -> Result<(), FabricError> {
        let commands = self.commands(source_credentials)?;
        let transport: Arc<dyn Transport> = connector
            .connect(&self.source)
            .await
            .map(Arc::from)
            .map_err(|fault| self.error(fault.to_string()))?;

        let result = self.run_steps(&transport, commands).await;
        transport.close().await;
        result
    }

    async fn run_steps(
        &self,
        transport: &Arc<dyn Transport>,
        commands: Vec<String>,
    ) -> Result<(), FabricError> {
        for (index, command) in commands.into_iter().enumerate() {
            let record = run_on_host(Arc::clone(transport), command, None).await;
            if let Some(fault) = record.fault {
                return Err(self.error(fault.to_string()));
            }
            // The known-hosts scrub legitimately fails when there is nothing to remove.
            let checked = index > 0;
            match record.exit_code {
                Some(0) => {}
                code if checked => {
                    let step = if index == 1 { "ssh-keyscan" } else { "sshpass scp" };
                    let reason = format!(
                        "{} exited with {:?}: {}",
                        step,
                        code,
                        record.lines.join("\n")
                    );
                    if self.check_status {
                        return Err(self.error(reason));
                    }
                    tracing::warn!(source = %self.source, "{}", reason);
                }
                _ => {}
            }
        }
        tracing::info!(
            source = %self.source,
            destination = %self.destination,
            "Relayed {} to {}.",
            self.source_path,
            self.destination_path
        );
        Ok(())
    }

    fn error(&self, reason: String) -> FabricError {
        FabricError::Relay {
            source_host: self.source.clone(),
            destination: self.destination.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn single_file_plan() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "a").unwrap();
        let steps = plan_upload(&file, "/tmp/a.txt", false).unwrap();
        assert_eq!(steps, vec![Step::File(file, "/tmp/a.txt".into())]);
    }

    #[test]
    fn directory_requires_recursive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            plan_upload(dir.path(), "/tmp/d", false),
            Err(FabricError::Config(_))
        ));
    }

    #[test]
    fn recursive_plan_creates_dirs_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), "b").unwrap();
        fs::write(dir.path().join("a"), "a").unwrap();

        let steps = plan_upload(dir.path(), "/opt/d/", true).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Dir("/opt/d/".into()),
                Step::File(dir.path().join("a"), "/opt/d/a".into()),
                Step::Dir("/opt/d/sub".into()),
                Step::File(dir.path().join("sub").join("b"), "/opt/d/sub/b".into()),
            ]
        );
    }

    #[test]
    fn missing_local_file_is_io_error() {
        assert!(matches!(
            plan_upload(Path::new("/definitely/not/here"), "/tmp/x", false),
            Err(FabricError::Io(_))
        ));
    }

    #[test]
    fn download_suffix_appends_host() {
        assert_eq!(
            suffixed(Path::new("/tmp/dmesg.log"), "node-3"),
            PathBuf::from("/tmp/dmesg.log_node-3")
        );
    }

    fn relay(destination_credentials: Option<Credentials>) -> Relay {
        Relay {
            source: "head".into(),
            source_path: "/data/model.bin".into(),
            destination: "node7".into(),
            destination_path: "/data/model.bin".into(),
            destination_credentials,
            check_status: false,
        }
    }

    #[test]
    fn relay_primes_known_hosts_before_copy() {
        let creds = Credentials::with_password("root", "pw");
        let commands = relay(None).commands(&creds).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], "ssh-keygen -f ~/.ssh/known_hosts -R 'node7'");
        assert_eq!(commands[1], "ssh-keyscan -H 'node7' >> ~/.ssh/known_hosts");
        assert_eq!(
            commands[2],
            "sshpass -p 'pw' scp -r '/data/model.bin' 'root@node7:/data/model.bin'"
        );
    }

    #[test]
    fn relay_prefers_destination_credentials() {
        let source = Credentials::with_password("root", "pw");
        let destination = Credentials::with_password("admin", "secret");
        let commands = relay(Some(destination)).commands(&source).unwrap();
        assert!(commands[2].contains("'secret'"));
        assert!(commands[2].contains("admin@node7"));
    }

    #[test]
    fn relay_needs_a_password() {
        let source = Credentials::with_key("root", "/keys/id_rsa");
        assert!(matches!(
            relay(None).commands(&source),
            Err(FabricError::Relay { .. })
        ));
    }
}
