//! Scriptable in-memory cluster shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use clusterval_ssh::{Arbiter, Connector, Credentials, Fault, OutputStream, Transport};

/// What a host does with every command it receives.
#[derive(Debug, Clone)]
pub enum Script {
    /// Prints `lines` and exits with `code`.
    Exit { lines: Vec<String>, code: i32 },
    /// The command is never started.
    RefuseDispatch(Fault),
    /// Prints `lines`, then the transport fails.
    FailMidway { lines: Vec<String>, fault: Fault },
    /// Prints `lines` and never finishes.
    Hang { lines: Vec<String> },
}

impl Script {
    pub fn lines(lines: &[&str]) -> Self {
        Script::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            code: 0,
        }
    }

    pub fn exit(code: i32) -> Self {
        Script::Exit {
            lines: vec![],
            code,
        }
    }
}

/// Shared state of every mock host.
#[derive(Default)]
pub struct MockCluster {
    scripts: Mutex<HashMap<String, Script>>,
    unreachable: Mutex<HashSet<String>>,
    commands: Mutex<Vec<(String, String)>>,
    files: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    dirs: Mutex<Vec<(String, String)>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hosts without a script print "output1".
    pub fn script(&self, host: &str, script: Script) {
        self.scripts.lock().unwrap().insert(host.to_owned(), script);
    }

    /// Makes every later connect to `host` fail with a connection error.
    pub fn take_down(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_owned());
    }

    pub fn put_remote_file(&self, host: &str, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert((host.to_owned(), path.to_owned()), content.to_vec());
    }

    pub fn remote_file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(host.to_owned(), path.to_owned()))
            .cloned()
    }

    pub fn remote_dirs(&self, host: &str) -> Vec<String> {
        self.dirs
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Every (host, command) dispatched so far, in dispatch order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    fn script_for(&self, host: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_else(|| Script::lines(&["output1"]))
    }
}

struct MockConnector(Arc<MockCluster>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn Transport>, Fault> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.unreachable.lock().unwrap().contains(host) {
            return Err(Fault::connection("Connection failed"));
        }
        Ok(Box::new(MockTransport {
            host: host.to_owned(),
            cluster: Arc::clone(&self.0),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockTransport {
    host: String,
    cluster: Arc<MockCluster>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn spawn(&self, command: &str) -> Result<OutputStream, Fault> {
        let script = match self.cluster.script_for(&self.host) {
            Script::RefuseDispatch(fault) => return Err(fault),
            script => script,
        };
        self.cluster
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_owned()));

        let (tx, stream) = OutputStream::channel();
        match script {
            Script::Exit { lines, code } => {
                for line in lines {
                    tx.line(line);
                }
                tx.exit(Some(code));
                Ok(stream)
            }
            Script::FailMidway { lines, fault } => {
                for line in lines {
                    tx.line(line);
                }
                tx.fault(fault);
                Ok(stream)
            }
            Script::Hang { lines } => {
                for line in lines {
                    tx.line(line);
                }
                let producer = tokio::spawn(async move {
                    let _tx = tx;
                    std::future::pending::<()>().await;
                });
                Ok(stream.attach(producer))
            }
            Script::RefuseDispatch(_) => unreachable!(),
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), Fault> {
        let content = std::fs::read(local).map_err(|e| Fault::io(e.to_string()))?;
        self.cluster.put_remote_file(&self.host, remote, &content);
        Ok(())
    }

    async fn make_dir(&self, remote: &str) -> Result<(), Fault> {
        self.cluster
            .dirs
            .lock()
            .unwrap()
            .push((self.host.clone(), remote.to_owned()));
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), Fault> {
        let content = self
            .cluster
            .remote_file(&self.host, remote)
            .ok_or_else(|| Fault::io(format!("{}: No such file", remote)))?;
        std::fs::write(local, content).map_err(|e| Fault::io(e.to_string()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cluster.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Arbiter with a fixed verdict that records every call.
#[derive(Clone, Default)]
pub struct ScriptedArbiter {
    dead: BTreeSet<String>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedArbiter {
    pub fn confirming(dead: &[&str]) -> Self {
        Self {
            dead: dead.iter().map(|h| h.to_string()).collect(),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Arbiter for ScriptedArbiter {
    async fn confirm_dead(&self, suspects: &[String]) -> BTreeSet<String> {
        self.calls.lock().unwrap().push(suspects.to_vec());
        self.dead.clone()
    }
}

pub fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|h| h.to_string()).collect()
}

pub fn credentials() -> Credentials {
    Credentials::with_password("root", "hunter2")
}
