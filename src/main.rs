use std::collections::HashMap;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colourado::{ColorPalette, PaletteType};
use itertools::zip;

use clusterval_ssh::config::{ClusterConfig, Command, Config};
use clusterval_ssh::host::template_registry;
use clusterval_ssh::report::{scan_round, ErrorLog};
use clusterval_ssh::transport::connector_for;
use clusterval_ssh::{FabricError, Host, HostKeyPolicy, Mode, Registry, Relay, RoundOutput};

/// Prints each host's output, every line prefixed with the host's colored name.
fn print_round(hosts: &[Host], output: &RoundOutput) {
    if hosts.is_empty() {
        return;
    }
    let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
    for (color, host) in zip(colors, hosts) {
        if let Some(text) = output.get(&host.hostname) {
            let prefix = host.prettify(color);
            for line in text.lines() {
                println!("{} {}", prefix, line);
            }
        }
    }
}

async fn run(cli: Config) -> Result<ExitCode, FabricError> {
    match &cli.command {
        Command::Generators => {
            for generator in Registry::with_builtins().iter() {
                println!("{:<12} {}", generator.name(), generator.description());
                for arg in generator.args() {
                    let default = arg
                        .default
                        .map(|d| format!(" (default: {})", d))
                        .unwrap_or_default();
                    let required = if arg.required { " [required]" } else { "" };
                    println!("    {}{}{}: {}", arg.name, required, default, arg.description);
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Generate { name, args } => {
            print!("{}", Registry::with_builtins().run(name, args)?);
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let cluster = ClusterConfig::load(&cli.cluster_file)?;

    if let Command::Relay {
        source,
        source_path,
        destination,
        destination_path,
        check_status,
    } = &cli.command
    {
        let credentials = cluster.credentials()?;
        let connector = connector_for(
            credentials.clone(),
            HostKeyPolicy::from_check(cluster.host_key_check),
            cluster.connect_timeout(),
        );
        let relay = Relay {
            source: source.clone(),
            source_path: source_path.clone(),
            destination: destination.clone(),
            destination_path: destination_path.clone(),
            destination_credentials: None,
            check_status: *check_status,
        };
        relay.run(connector.as_ref(), &credentials).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let (hosts, mut builder) = cluster.session_builder()?;
    if cli.tolerant {
        builder = builder.mode(Mode::Tolerant);
    }
    let mut session = builder.connect().await;
    tracing::info!(hosts = hosts.len(), mode = ?session.mode(), "Connected to cluster.");

    let result = dispatch(&cli.command, &hosts, &mut session).await;
    session.destroy().await;
    result
}

async fn dispatch(
    command: &Command,
    hosts: &[Host],
    session: &mut clusterval_ssh::Session,
) -> Result<ExitCode, FabricError> {
    let mut log = ErrorLog::new();
    match command {
        Command::Exec { command, timeout } => {
            let output = session
                .exec(command, timeout.map(Duration::from_secs))
                .await?;
            print_round(hosts, &output);
            scan_round(&output, &mut log);
        }
        Command::ExecEach { template, timeout } => {
            let by_name: HashMap<&str, &Host> =
                hosts.iter().map(|h| (h.hostname.as_str(), h)).collect();
            let mut registry = template_registry();
            let mut commands = Vec::with_capacity(session.live_hosts().len());
            for hostname in session.live_hosts() {
                let host = by_name
                    .get(hostname.as_str())
                    .copied()
                    .cloned()
                    .unwrap_or_else(|| Host::new(hostname.as_str()));
                commands.push(host.render(&mut registry, template)?);
            }
            let output = session
                .exec_cmd_list(commands, timeout.map(Duration::from_secs))
                .await?;
            print_round(hosts, &output);
            scan_round(&output, &mut log);
        }
        Command::Upload {
            local,
            remote,
            recursive,
        } => session.upload(local, remote, *recursive).await?,
        Command::Download {
            remote,
            local_prefix,
        } => session.download(remote, local_prefix).await?,
        Command::Reboot => session.reboot().await?,
        Command::Relay { .. } | Command::Generate { .. } | Command::Generators => {}
    }

    for host in session.dead_hosts() {
        tracing::warn!(host = %host, "Host was removed from the live set.");
    }
    match log.into_result() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(failure) => {
            eprintln!("{}", failure);
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Config::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
