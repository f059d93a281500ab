mod address;
mod alias;
mod app;
mod cli;
mod rpc;
mod ssh;
mod tunnel;

use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::{
    AddAliasCommands, AddCommands, Cli, Commands, DeleteCommands, ShowCommands, StartCommands,
};

use app::{Configuration, daemon};
use tunnel::{Tunnel, TunnelKind};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(wants_verbose(&cli.command));

    if let Err(e) = run(cli.command).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

/// Whether the invoked command asked for verbose logging.
fn wants_verbose(command: &Commands) -> bool {
    match command {
        Commands::Start {
            target: StartCommands::Local(flags) | StartCommands::Remote(flags),
        } => flags.verbose,
        Commands::Start {
            target: StartCommands::Alias(flags),
        } => flags.verbose,
        _ => false,
    }
}

/// Route log output to stderr; in a detached child stderr is already
/// redirected to the instance log file. `MOLE_LOG` overrides the level.
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_env("MOLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Start { target } => match target {
            StartCommands::Local(flags) => {
                let conf = flags.to_configuration("local")?;
                start_tunnel(conf).await
            }
            StartCommands::Remote(flags) => {
                let conf = flags.to_configuration("remote")?;
                start_tunnel(conf).await
            }
            StartCommands::Alias(flags) => {
                let record = alias::get(&flags.name)?;

                let mut conf = Configuration {
                    verbose: flags.verbose,
                    insecure: flags.insecure,
                    detach: flags.detach,
                    ..Configuration::default()
                };
                conf.merge(&record, &flags.given_flags())?;

                start_tunnel(conf).await
            }
        },

        Commands::Stop { id } => {
            app::stop(&id)?;
            println!("instance {id} stopped");
            Ok(())
        }

        Commands::Show { target } => match target {
            ShowCommands::Alias { name: Some(name) } => {
                print!("{}", alias::show_one(&name)?);
                Ok(())
            }
            ShowCommands::Alias { name: None } => {
                print!("{}", alias::show_all()?);
                Ok(())
            }
            ShowCommands::Instances => show_instances().await,
            ShowCommands::Logs { follow, id } => app::show_logs(&id, follow),
        },

        Commands::Add { target } => match target {
            AddCommands::Alias { target } => {
                let (record, name) = match target {
                    AddAliasCommands::Local(flags) => {
                        (flags.tunnel.to_configuration("local")?, flags.name)
                    }
                    AddAliasCommands::Remote(flags) => {
                        (flags.tunnel.to_configuration("remote")?, flags.name)
                    }
                };

                alias::add(&record.to_alias(&name))?;
                println!("alias {name} saved");
                Ok(())
            }
        },

        Commands::Delete { target } => match target {
            DeleteCommands::Alias { name } => {
                alias::delete(&name)?;
                println!("alias {name} deleted");
                Ok(())
            }
        },

        Commands::Version => {
            println!("mole {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Collect the runtime view of every reachable instance and render it as
/// an `[instances.<id>]` table.
async fn show_instances() -> Result<()> {
    let instances = rpc::client::show_all().await?;

    if instances.is_empty() {
        println!("no instances with rpc enabled are running");
        return Ok(());
    }

    let mut map = serde_json::Map::new();
    for instance in instances {
        let id = instance
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        map.insert(id, instance);
    }

    let doc = serde_json::json!({ "instances": map });
    print!(
        "{}",
        toml::to_string(&doc).context("could not render instances")?
    );

    Ok(())
}

/// The whole life of one supervisor invocation: claim an instance, detach
/// if asked, build the server and tunnel, expose rpc, run until stopped.
async fn start_tunnel(mut conf: Configuration) -> Result<()> {
    if let Some(id) = daemon::detached_id() {
        conf.id = id;
    }
    if conf.id.is_empty() {
        conf.id = app::random_id();
    }

    // Detach: claim the instance here, then hand everything to a background
    // re-exec of this same invocation and leave.
    if conf.detach && !daemon::running_detached() {
        let instance = app::create_instance(Some(&conf.id))?;
        daemon::spawn_detached(&instance)?;
        println!(
            "execute \"mole stop {}\" if you like to stop it at any time",
            instance.id
        );
        return Ok(());
    }

    let instance = if daemon::running_detached() {
        app::adopt_instance(&conf.id)?
    } else {
        app::create_instance(Some(&conf.id))?
    };

    let result = run_supervisor(&mut conf, &instance).await;

    if let Err(e) = instance.release(daemon::running_detached()) {
        debug!(error = %e, "could not release instance files");
    }

    result
}

async fn run_supervisor(conf: &mut Configuration, instance: &app::Instance) -> Result<()> {
    let mut server = ssh::Server::new(
        &conf.server.user,
        &conf.server.address(),
        &conf.key,
        &conf.ssh_agent,
        &conf.ssh_config,
    )
    .context("error processing server options")?;

    server.insecure = conf.insecure;
    server.timeout = conf.timeout;

    server.key.handle_passphrase(prompt_passphrase)?;

    debug!(server = %server, "server configuration done");

    let kind: TunnelKind = conf.tunnel_type.parse()?;
    let sources = conf.source.as_strings();
    let destinations = conf.destination.as_strings();

    let mut tunnel = Tunnel::new(kind, server, &sources, &destinations, &conf.ssh_config)?;
    tunnel.connection_retries = conf.connection_retries;
    tunnel.wait_and_retry = conf.wait_and_retry;
    tunnel.keep_alive_interval = conf.keep_alive_interval;

    if conf.rpc {
        let bound = rpc::start(&conf.rpc_address).await?;
        conf.rpc_address = bound.to_string();
        instance.write_rpc_address(&conf.rpc_address)?;

        let view = tunnel.channels_view();
        let snapshot = conf.clone();
        rpc::register("show-instance", move |_params| {
            let channels = view.read().map(|v| v.clone()).unwrap_or_default();
            let runtime = app::Runtime {
                configuration: snapshot.clone(),
                channels,
            };
            Ok(serde_json::to_value(&runtime)?)
        });
    }

    spawn_signal_handler(tunnel.stopper());

    tunnel.start().await.context("error while running tunnel")
}

/// First SIGINT/SIGTERM asks the tunnel to stop cleanly; a second one
/// aborts the process.
fn spawn_signal_handler(stopper: tunnel::Stopper) {
    tokio::spawn(async move {
        wait_for_signal().await;
        stopper.stop();

        wait_for_signal().await;
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return tokio::signal::ctrl_c().await.unwrap_or(()),
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Ask for the key passphrase without echoing it.
///
/// Keystrokes are read in raw mode and collected into a `Zeroizing` buffer
/// so no unscrubbed copy of the secret is left behind; the returned bytes
/// are moved straight into the key handler's own wipe-on-drop buffer.
fn prompt_passphrase() -> Result<Vec<u8>> {
    use anyhow::bail;
    use zeroize::Zeroizing;

    eprint!("The key provided is secured by a passphrase. Please provide it below:\nPassword: ");
    std::io::stderr().flush()?;

    crossterm::terminal::enable_raw_mode().context("failed to enable raw mode")?;

    let mut passphrase = Zeroizing::new(String::new());
    loop {
        match crossterm::event::read() {
            Ok(crossterm::event::Event::Key(key)) => match key.code {
                crossterm::event::KeyCode::Enter => break,
                crossterm::event::KeyCode::Char(c) => passphrase.push(c),
                crossterm::event::KeyCode::Backspace => {
                    passphrase.pop();
                }
                crossterm::event::KeyCode::Esc => {
                    let _ = crossterm::terminal::disable_raw_mode();
                    eprintln!();
                    bail!("passphrase entry cancelled");
                }
                _ => {}
            },
            Ok(_) => {}
            Err(e) => {
                let _ = crossterm::terminal::disable_raw_mode();
                eprintln!();
                return Err(e).context("error while reading passphrase");
            }
        }
    }

    crossterm::terminal::disable_raw_mode().context("failed to disable raw mode")?;
    eprintln!();

    Ok(passphrase.as_bytes().to_vec())
}
