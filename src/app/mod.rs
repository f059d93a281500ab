pub mod daemon;
pub mod duration;

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::debug;

use crate::address::{AddressInput, AddressInputList};
use crate::alias::Alias;
use crate::tunnel::ChannelEndpoints;

use self::duration::{duration_string, format_duration, parse_duration};

pub const INSTANCE_PID_FILE: &str = "pid";
pub const INSTANCE_LOG_FILE: &str = "mole.log";
pub const INSTANCE_RPC_FILE: &str = "rpc";

/// Location where all application files are persisted: alias records and
/// per-instance directories.
pub fn home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".mole"))
}

/// Like `home_dir`, creating the directory when absent.
pub fn create_home_dir() -> Result<PathBuf> {
    let home = home_dir()?;
    if !home.exists() {
        fs::create_dir_all(&home)
            .with_context(|| format!("could not create {}", home.display()))?;
    }
    Ok(home)
}

/// Location of the files belonging to the instance `id`.
pub fn instance_dir(id: &str) -> Result<PathBuf> {
    Ok(home_dir()?.join(id))
}

/// On-disk footprint of one running supervisor.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub rpc_file: PathBuf,
}

impl Instance {
    fn paths(id: &str) -> Result<Self> {
        let dir = instance_dir(id)?;
        Ok(Instance {
            id: id.to_string(),
            pid_file: dir.join(INSTANCE_PID_FILE),
            log_file: dir.join(INSTANCE_LOG_FILE),
            rpc_file: dir.join(INSTANCE_RPC_FILE),
            dir,
        })
    }

    /// Record the rpc server address so other instances can reach this one.
    pub fn write_rpc_address(&self, address: &str) -> Result<()> {
        fs::write(&self.rpc_file, address)
            .with_context(|| format!("could not write rpc address file for {}", self.id))
    }

    /// Overwrite the recorded pid, used by the detach step to store the
    /// background child's pid.
    pub fn write_pid(&self, pid: u32) -> Result<()> {
        fs::write(&self.pid_file, pid.to_string())
            .with_context(|| format!("could not write pid file for {}", self.id))
    }

    /// Release the on-disk footprint: a detached instance keeps its
    /// directory (so logs survive) and only drops the pid file; a
    /// foreground instance removes the whole directory.
    pub fn release(&self, detached: bool) -> Result<()> {
        if detached {
            if self.pid_file.exists() {
                fs::remove_file(&self.pid_file)
                    .with_context(|| format!("could not remove pid file for {}", self.id))?;
            }
            return Ok(());
        }

        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("could not remove instance dir for {}", self.id))?;
        }

        Ok(())
    }
}

/// Claim the instance `id` (or a fresh random id): create its directory and
/// record this process's pid.
///
/// Fails when another live process already holds the id.
pub fn create_instance(id: Option<&str>) -> Result<Instance> {
    let id = match id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => random_id(),
    };

    let instance = Instance::paths(&id)?;

    if !instance.dir.exists() {
        fs::create_dir_all(&instance.dir)
            .with_context(|| format!("could not create instance dir for {id}"))?;
    }

    if instance.pid_file.exists() {
        let pid = fs::read_to_string(&instance.pid_file).unwrap_or_default();
        if let Ok(pid) = pid.trim().parse::<u32>() {
            if is_process_alive(pid) {
                bail!("an instance of mole with id {id} seems to be already running (pid {pid})");
            }
        }
        debug!(id = %id, "stale pid file found, taking over the instance");
    }

    instance.write_pid(std::process::id())?;

    Ok(instance)
}

/// Resolve the paths of an already-claimed instance without touching the
/// pid file; the detach step uses this in the background child whose pid
/// was recorded by the parent.
pub fn adopt_instance(id: &str) -> Result<Instance> {
    let instance = Instance::paths(id)?;
    if !instance.dir.exists() {
        bail!("no instance directory found for {id}");
    }
    Ok(instance)
}

/// The process id behind `id`: a numeric id is returned as-is, anything
/// else is looked up in the instance's pid file.
pub fn pid(id: &str) -> Result<u32> {
    if let Ok(pid) = id.parse::<u32>() {
        return Ok(pid);
    }

    let instance = Instance::paths(id)?;
    let content = fs::read_to_string(&instance.pid_file)
        .with_context(|| format!("no instance of mole with id {id} is running"))?;

    content
        .trim()
        .parse()
        .with_context(|| format!("malformed pid file for instance {id}"))
}

/// The rpc server address of the instance `id`; an absent address file
/// means rpc is disabled for it.
pub fn rpc_address(id: &str) -> Result<String> {
    let instance = Instance::paths(id)?;

    if !instance.rpc_file.exists() {
        bail!("rpc is disabled for instance {id}");
    }

    let address = fs::read_to_string(&instance.rpc_file)
        .with_context(|| format!("could not read rpc address of instance {id}"))?;

    Ok(address.trim().to_string())
}

/// Stop a running instance: signal its process and drop the pid file.
pub fn stop(id: &str) -> Result<()> {
    let instance = Instance::paths(id)?;

    if !instance.pid_file.exists() {
        bail!("no instance of mole with id {id} is running");
    }

    let pid = pid(id)?;
    if !terminate_process(pid) {
        bail!("could not signal process {pid} of instance {id}");
    }

    fs::remove_file(&instance.pid_file)
        .with_context(|| format!("could not remove pid file for {id}"))?;

    Ok(())
}

/// Print the log of a detached instance; with `follow`, keep polling for
/// new output until interrupted.
pub fn show_logs(id: &str, follow: bool) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let instance = Instance::paths(id)?;
    let mut file = fs::File::open(&instance.log_file)
        .with_context(|| format!("no log file found for instance {id}"))?;

    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    print!("{buf}");
    std::io::stdout().flush()?;

    if !follow {
        return Ok(());
    }

    let mut offset = file.seek(SeekFrom::End(0))?;
    loop {
        std::thread::sleep(Duration::from_millis(500));

        let len = file.metadata()?.len();
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = String::new();
            file.read_to_string(&mut chunk)?;
            print!("{chunk}");
            std::io::stdout().flush()?;
            offset = len;
        } else if len < offset {
            // Truncated, start over from the top.
            offset = 0;
            file.seek(SeekFrom::Start(0))?;
        }
    }
}

/// An 8-hex-character identifier for unnamed instances.
pub fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Check if a process with the given PID is alive (Windows variant).
#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .output()
        .is_ok_and(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
}

/// Terminate a process by PID. Returns `true` if the signal was sent
/// successfully.
#[cfg(unix)]
fn terminate_process(pid: u32) -> bool {
    Command::new("kill")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Terminate a process by PID (Windows variant).
#[cfg(windows)]
fn terminate_process(pid: u32) -> bool {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// The merged runtime view of one supervisor invocation: CLI flags, alias
/// values and defaults reconciled into a single record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Configuration {
    pub id: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    pub verbose: bool,
    pub insecure: bool,
    pub detach: bool,
    pub source: AddressInputList,
    pub destination: AddressInputList,
    pub server: AddressInput,
    pub key: String,
    #[serde(rename = "keep-alive-interval", with = "duration_string")]
    pub keep_alive_interval: Duration,
    #[serde(rename = "connection-retries")]
    pub connection_retries: i32,
    #[serde(rename = "wait-and-retry", with = "duration_string")]
    pub wait_and_retry: Duration,
    #[serde(rename = "ssh-agent")]
    pub ssh_agent: String,
    #[serde(with = "duration_string")]
    pub timeout: Duration,
    #[serde(rename = "config")]
    pub ssh_config: String,
    pub rpc: bool,
    #[serde(rename = "rpc-address")]
    pub rpc_address: String,
}

impl Configuration {
    /// Translate this configuration into a persistable alias record.
    pub fn to_alias(&self, name: &str) -> Alias {
        Alias {
            name: name.to_string(),
            tunnel_type: self.tunnel_type.clone(),
            verbose: self.verbose,
            insecure: self.insecure,
            detach: self.detach,
            source: self.source.as_strings(),
            destination: self.destination.as_strings(),
            server: self.server.to_string(),
            key: self.key.clone(),
            keep_alive_interval: format_duration(self.keep_alive_interval),
            connection_retries: self.connection_retries,
            wait_and_retry: format_duration(self.wait_and_retry),
            ssh_agent: self.ssh_agent.clone(),
            timeout: format_duration(self.timeout),
            ssh_config: self.ssh_config.clone(),
            rpc: self.rpc,
            rpc_address: self.rpc_address.clone(),
        }
    }

    /// Overwrite this configuration from an alias record.
    ///
    /// The boolean flags `verbose`, `insecure` and `detach` keep their CLI
    /// value when the user explicitly passed that flag (its name appears in
    /// `given_flags`); every other field is replaced wholesale.
    pub fn merge(&mut self, alias: &Alias, given_flags: &[String]) -> Result<()> {
        let given = |flag: &str| given_flags.iter().any(|f| f == flag);

        if !given("verbose") {
            self.verbose = alias.verbose;
        }
        if !given("insecure") {
            self.insecure = alias.insecure;
        }
        if !given("detach") {
            self.detach = alias.detach;
        }

        self.id = alias.name.clone();
        self.tunnel_type = alias.tunnel_type.clone();
        self.source = AddressInputList::parse(&alias.source);
        self.destination = AddressInputList::parse(&alias.destination);
        self.server = alias.server.parse().expect("address parse is infallible");
        self.key = alias.key.clone();
        self.keep_alive_interval = parse_duration(&alias.keep_alive_interval)
            .context("malformed keep-alive-interval in alias")?;
        self.connection_retries = alias.connection_retries;
        self.wait_and_retry =
            parse_duration(&alias.wait_and_retry).context("malformed wait-and-retry in alias")?;
        self.ssh_agent = alias.ssh_agent.clone();
        self.timeout = parse_duration(&alias.timeout).context("malformed timeout in alias")?;
        self.ssh_config = alias.ssh_config.clone();
        self.rpc = alias.rpc;
        self.rpc_address = alias.rpc_address.clone();

        Ok(())
    }
}

/// Snapshot returned by the `show-instance` rpc method: the configuration
/// plus the actually-bound endpoints of every channel.
#[derive(Debug, Clone, Serialize)]
pub struct Runtime {
    #[serde(flatten)]
    pub configuration: Configuration,
    pub channels: Vec<ChannelEndpoints>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn scratch_home() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: tests tagged #[serial] so no concurrent env access.
        unsafe { std::env::set_var("HOME", dir.path()) };
        dir
    }

    fn sample_configuration() -> Configuration {
        Configuration {
            id: "test".into(),
            tunnel_type: "local".into(),
            verbose: false,
            insecure: false,
            detach: false,
            source: AddressInputList::parse(&[":8080".into()]),
            destination: AddressInputList::parse(&["10.0.0.1:80".into()]),
            server: "user@example.com:22".parse().unwrap(),
            key: "/keys/id".into(),
            keep_alive_interval: Duration::from_secs(10),
            connection_retries: 3,
            wait_and_retry: Duration::from_secs(3),
            ssh_agent: String::new(),
            timeout: Duration::from_secs(3),
            ssh_config: String::new(),
            rpc: false,
            rpc_address: String::new(),
        }
    }

    #[test]
    #[serial]
    fn test_create_instance_writes_pid() {
        let _home = scratch_home();

        let instance = create_instance(Some("unit-a")).unwrap();
        let pid: u32 = fs::read_to_string(&instance.pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    #[serial]
    fn test_create_instance_rejects_live_duplicate() {
        let _home = scratch_home();

        let _first = create_instance(Some("unit-b")).unwrap();
        let err = create_instance(Some("unit-b")).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    #[serial]
    fn test_create_instance_takes_over_stale_pid() {
        let _home = scratch_home();

        let first = create_instance(Some("unit-c")).unwrap();
        first.write_pid(999_999_999).unwrap();

        assert!(create_instance(Some("unit-c")).is_ok());
    }

    #[test]
    #[serial]
    fn test_numeric_id_is_its_own_pid() {
        let _home = scratch_home();
        assert_eq!(pid("4242").unwrap(), 4242);
    }

    #[test]
    #[serial]
    fn test_pid_read_from_file() {
        let _home = scratch_home();
        let instance = create_instance(Some("unit-d")).unwrap();
        instance.write_pid(1234).unwrap();
        assert_eq!(pid("unit-d").unwrap(), 1234);
    }

    #[test]
    #[serial]
    fn test_rpc_address_absent_means_disabled() {
        let _home = scratch_home();
        let _instance = create_instance(Some("unit-e")).unwrap();

        let err = rpc_address("unit-e").unwrap_err();
        assert!(err.to_string().contains("rpc is disabled"));
    }

    #[test]
    #[serial]
    fn test_rpc_address_round_trip() {
        let _home = scratch_home();
        let instance = create_instance(Some("unit-f")).unwrap();
        instance.write_rpc_address("127.0.0.1:9999").unwrap();

        assert_eq!(rpc_address("unit-f").unwrap(), "127.0.0.1:9999");
    }

    #[test]
    #[serial]
    fn test_release_foreground_removes_dir() {
        let _home = scratch_home();
        let instance = create_instance(Some("unit-g")).unwrap();

        instance.release(false).unwrap();
        assert!(!instance.dir.exists());
    }

    #[test]
    #[serial]
    fn test_release_detached_keeps_logs() {
        let _home = scratch_home();
        let instance = create_instance(Some("unit-h")).unwrap();
        fs::write(&instance.log_file, "log line\n").unwrap();

        instance.release(true).unwrap();
        assert!(!instance.pid_file.exists());
        assert!(instance.log_file.exists());
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_id(), random_id());
    }

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_dead() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_merge_replaces_fields_wholesale() {
        let alias = sample_configuration().to_alias("prod-db");

        let mut conf = Configuration {
            verbose: true,
            insecure: true,
            detach: true,
            ..sample_configuration()
        };
        conf.merge(&alias, &[]).unwrap();

        assert_eq!(conf.id, "prod-db");
        assert!(!conf.verbose);
        assert!(!conf.insecure);
        assert!(!conf.detach);
        assert_eq!(conf.server.to_string(), "user@example.com:22");
        assert_eq!(conf.keep_alive_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_merge_keeps_explicitly_given_flags() {
        let alias = sample_configuration().to_alias("prod-db");

        let mut conf = Configuration {
            verbose: true,
            insecure: true,
            detach: true,
            ..sample_configuration()
        };
        conf.merge(
            &alias,
            &["verbose".into(), "insecure".into(), "detach".into()],
        )
        .unwrap();

        assert!(conf.verbose);
        assert!(conf.insecure);
        assert!(conf.detach);
    }

    #[test]
    fn test_alias_round_trip_preserves_addresses() {
        let conf = sample_configuration();
        let alias = conf.to_alias("rt");

        assert_eq!(alias.source, vec![":8080"]);
        assert_eq!(alias.destination, vec!["10.0.0.1:80"]);
        assert_eq!(alias.keep_alive_interval, "10s");

        let mut merged = sample_configuration();
        merged.merge(&alias, &[]).unwrap();
        assert_eq!(merged.source, conf.source);
        assert_eq!(merged.destination, conf.destination);
    }

    #[test]
    fn test_configuration_serializes_durations_as_strings() {
        let conf = sample_configuration();
        let json = serde_json::to_value(&conf).unwrap();

        assert_eq!(json["keep-alive-interval"], "10s");
        assert_eq!(json["wait-and-retry"], "3s");
        assert_eq!(json["type"], "local");
    }
}
