use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::address::AddressInputList;
use crate::app::Configuration;
use crate::app::duration::parse_duration;

/// Resilient SSH port-forwarding supervisor with auto-reconnect.
#[derive(Parser, Debug)]
#[command(name = "mole", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a tunnel from flags or from a saved alias.
    Start {
        #[command(subcommand)]
        target: StartCommands,
    },

    /// Stop a detached instance by its id or alias.
    Stop {
        /// Instance id, alias name, or raw pid.
        id: String,
    },

    /// Show aliases, running instances, or instance logs.
    Show {
        #[command(subcommand)]
        target: ShowCommands,
    },

    /// Save a tunnel configuration under an alias name.
    Add {
        #[command(subcommand)]
        target: AddCommands,
    },

    /// Delete a saved alias.
    Delete {
        #[command(subcommand)]
        target: DeleteCommands,
    },

    /// Print the version.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum StartCommands {
    /// Forward a local listener to a destination reachable from the server.
    Local(TunnelFlags),
    /// Forward a listener on the server back to a local destination.
    Remote(TunnelFlags),
    /// Start a tunnel from a saved alias.
    Alias(StartAliasFlags),
}

#[derive(Subcommand, Debug)]
pub enum ShowCommands {
    /// Show one alias, or all of them.
    Alias {
        /// Alias name; omit to list every saved alias.
        name: Option<String>,
    },
    /// Show runtime information about running instances.
    Instances,
    /// Show the log of a detached instance.
    Logs {
        /// Keep following the log for new output.
        #[arg(short, long)]
        follow: bool,
        /// Instance id or alias name.
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AddCommands {
    Alias {
        #[command(subcommand)]
        target: AddAliasCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AddAliasCommands {
    /// Save a local tunnel configuration.
    Local(AddAliasFlags),
    /// Save a remote tunnel configuration.
    Remote(AddAliasFlags),
}

#[derive(Subcommand, Debug)]
pub enum DeleteCommands {
    Alias {
        /// Alias name.
        name: String,
    },
}

/// Everything needed to start a tunnel.
#[derive(Args, Debug)]
pub struct TunnelFlags {
    /// Source endpoint(s), `[<host>]:<port>`; repeatable. Missing entries
    /// default to ephemeral ports on loopback.
    #[arg(short = 'S', long = "source")]
    pub source: Vec<String>,

    /// Destination endpoint(s), `[<host>]:<port>`; repeatable.
    #[arg(short = 'd', long = "destination")]
    pub destination: Vec<String>,

    /// The SSH server, `[<user>@]<host>[:<port>]`.
    #[arg(short = 's', long = "server")]
    pub server: String,

    /// Private key file for server authentication.
    #[arg(short = 'k', long = "key", default_value = "")]
    pub key: String,

    /// Interval between transport keep-alive probes.
    #[arg(short = 'K', long = "keep-alive-interval", default_value = "10s")]
    pub keep_alive_interval: String,

    /// Connection attempts before giving up; 0 retries forever, negative
    /// fails on the first error.
    #[arg(short = 'R', long = "connection-retries", default_value_t = 3, allow_hyphen_values = true)]
    pub connection_retries: i32,

    /// Sleep between connection attempts.
    #[arg(short = 'w', long = "wait-and-retry", default_value = "3s")]
    pub wait_and_retry: String,

    /// SSH agent socket path; a `$VAR` value names an environment variable.
    #[arg(short = 'A', long = "ssh-agent", default_value = "")]
    pub ssh_agent: String,

    /// Bound on the initial SSH handshake.
    #[arg(short = 't', long = "timeout", default_value = "3s")]
    pub timeout: String,

    /// SSH client config file consulted for missing attributes.
    #[arg(short = 'c', long = "config", default_value = "$HOME/.ssh/config")]
    pub config: String,

    /// Increase log verbosity.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Skip host key validation.
    #[arg(short = 'i', long = "insecure")]
    pub insecure: bool,

    /// Run the tunnel in the background.
    #[arg(short = 'x', long = "detach")]
    pub detach: bool,

    /// Expose the instance over json-rpc.
    #[arg(long = "rpc")]
    pub rpc: bool,

    /// Address for the rpc server; empty binds a random loopback port.
    #[arg(long = "rpc-address", default_value = "")]
    pub rpc_address: String,
}

impl TunnelFlags {
    /// Reconcile the flags into the runtime configuration.
    pub fn to_configuration(&self, tunnel_type: &str) -> Result<Configuration> {
        Ok(Configuration {
            id: String::new(),
            tunnel_type: tunnel_type.to_string(),
            verbose: self.verbose,
            insecure: self.insecure,
            detach: self.detach,
            source: AddressInputList::parse(&self.source),
            destination: AddressInputList::parse(&self.destination),
            server: self.server.parse().expect("address parse is infallible"),
            key: self.key.clone(),
            keep_alive_interval: parse_duration(&self.keep_alive_interval)
                .context("malformed --keep-alive-interval")?,
            connection_retries: self.connection_retries,
            wait_and_retry: parse_duration(&self.wait_and_retry)
                .context("malformed --wait-and-retry")?,
            ssh_agent: self.ssh_agent.clone(),
            timeout: parse_duration(&self.timeout).context("malformed --timeout")?,
            ssh_config: self.config.clone(),
            rpc: self.rpc,
            rpc_address: self.rpc_address.clone(),
        })
    }

    /// The boolean flags the user actually passed, for the alias merge
    /// policy. Flags can only be switched on, so a true value means the
    /// flag was given.
    pub fn given_flags(&self) -> Vec<String> {
        let mut given = Vec::new();
        if self.verbose {
            given.push("verbose".to_string());
        }
        if self.insecure {
            given.push("insecure".to_string());
        }
        if self.detach {
            given.push("detach".to_string());
        }
        given
    }
}

#[derive(Args, Debug)]
pub struct StartAliasFlags {
    /// Alias name to start.
    pub name: String,

    /// Increase log verbosity.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Skip host key validation.
    #[arg(short = 'i', long = "insecure")]
    pub insecure: bool,

    /// Run the tunnel in the background.
    #[arg(short = 'x', long = "detach")]
    pub detach: bool,
}

impl StartAliasFlags {
    pub fn given_flags(&self) -> Vec<String> {
        let mut given = Vec::new();
        if self.verbose {
            given.push("verbose".to_string());
        }
        if self.insecure {
            given.push("insecure".to_string());
        }
        if self.detach {
            given.push("detach".to_string());
        }
        given
    }
}

#[derive(Args, Debug)]
pub struct AddAliasFlags {
    /// Name to save the configuration under.
    pub name: String,

    #[command(flatten)]
    pub tunnel: TunnelFlags,
}
