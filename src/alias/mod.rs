use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::app;

/// A persisted tunnel configuration that can be started by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub detach: bool,
    pub source: Vec<String>,
    pub destination: Vec<String>,
    pub server: String,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "keep-alive-interval")]
    pub keep_alive_interval: String,
    #[serde(rename = "connection-retries", default)]
    pub connection_retries: i32,
    #[serde(rename = "wait-and-retry")]
    pub wait_and_retry: String,
    #[serde(rename = "ssh-agent", default)]
    pub ssh_agent: String,
    pub timeout: String,
    #[serde(rename = "config", default)]
    pub ssh_config: String,
    #[serde(default)]
    pub rpc: bool,
    #[serde(rename = "rpc-address", default)]
    pub rpc_address: String,
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[verbose: {}, insecure: {}, detach: {}, source: {:?}, destination: {:?}, server: {}, key: {}, keep-alive-interval: {}, connection-retries: {}, wait-and-retry: {}, ssh-agent: {}, timeout: {}, config: {}]",
            self.verbose,
            self.insecure,
            self.detach,
            self.source,
            self.destination,
            self.server,
            self.key,
            self.keep_alive_interval,
            self.connection_retries,
            self.wait_and_retry,
            self.ssh_agent,
            self.timeout,
            self.ssh_config,
        )
    }
}

/// Persist an alias record to the application directory.
pub fn add(alias: &Alias) -> Result<()> {
    let dir = app::create_home_dir()?;
    let path = dir.join(format!("{}.toml", alias.name));

    let content = toml::to_string(alias).context("could not serialize alias")?;
    fs::write(&path, content)
        .with_context(|| format!("could not write alias file {}", path.display()))?;

    Ok(())
}

/// Remove an alias record; a missing alias is an error.
pub fn delete(name: &str) -> Result<()> {
    let path = app::home_dir()?.join(format!("{name}.toml"));

    if !path.exists() {
        bail!("alias {name} does not exist");
    }

    fs::remove_file(&path)
        .with_context(|| format!("could not remove alias file {}", path.display()))?;

    Ok(())
}

/// Load an alias previously created with `add`.
pub fn get(name: &str) -> Result<Alias> {
    let path = app::home_dir()?.join(format!("{name}.toml"));

    if !path.exists() {
        bail!("alias {name} does not exist");
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("could not read alias file {}", path.display()))?;

    let mut alias: Alias = toml::from_str(&content)
        .with_context(|| format!("could not parse alias file {}", path.display()))?;
    alias.name = name.to_string();

    Ok(alias)
}

/// Render the record of one alias.
pub fn show_one(name: &str) -> Result<String> {
    let alias =
        get(name).with_context(|| format!("could not show alias {name} configuration"))?;
    toml::to_string(&alias).context("could not serialize alias")
}

/// Render every persisted alias as an `[aliases.<name>]` table.
pub fn show_all() -> Result<String> {
    #[derive(Serialize)]
    struct Aliases {
        aliases: BTreeMap<String, Alias>,
    }

    let dir = app::home_dir()?;
    let mut aliases = BTreeMap::new();

    if dir.exists() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let alias = get(name)?;
            aliases.insert(name.to_string(), alias);
        }
    }

    toml::to_string(&Aliases { aliases }).context("could not serialize aliases")
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

    fn sample_alias(name: &str) -> Alias {
        Alias {
            name: name.to_string(),
            tunnel_type: "local".into(),
            verbose: true,
            insecure: false,
            detach: false,
            source: vec![":8080".into()],
            destination: vec!["172.17.0.100:80".into()],
            server: "user@example.com:22".into(),
            key: "path/to/key".into(),
            keep_alive_interval: "10s".into(),
            connection_retries: 3,
            wait_and_retry: "3s".into(),
            ssh_agent: String::new(),
            timeout: "3s".into(),
            ssh_config: String::new(),
            rpc: false,
            rpc_address: String::new(),
        }
    }

    #[test]
    #[serial]
    fn test_add_then_get_round_trip() {
        let _home = scratch_home();

        let alias = sample_alias("db");
        add(&alias).unwrap();

        let loaded = get("db").unwrap();
        assert_eq!(loaded, alias);
    }

    #[test]
    #[serial]
    fn test_get_missing_alias_fails() {
        let _home = scratch_home();
        let err = get("ghost").unwrap_err();
        assert!(err.to_string().contains("alias ghost does not exist"));
    }

    #[test]
    #[serial]
    fn test_delete_removes_record() {
        let _home = scratch_home();

        add(&sample_alias("gone")).unwrap();
        delete("gone").unwrap();
        assert!(get("gone").is_err());
    }

    #[test]
    #[serial]
    fn test_delete_missing_alias_fails() {
        let _home = scratch_home();
        assert!(delete("never-existed").is_err());
    }

    #[test]
    #[serial]
    fn test_show_all_lists_every_alias() {
        let _home = scratch_home();

        add(&sample_alias("one")).unwrap();
        add(&sample_alias("two")).unwrap();

        let rendered = show_all().unwrap();
        assert!(rendered.contains("[aliases.one]"));
        assert!(rendered.contains("[aliases.two]"));
    }

    #[test]
    #[serial]
    fn test_name_backfilled_from_file_stem() {
        let _home = scratch_home();

        let mut alias = sample_alias("proper");
        alias.name = "something-else".into();
        let dir = app::create_home_dir().unwrap();
        fs::write(
            dir.join("proper.toml"),
            toml::to_string(&alias).unwrap(),
        )
        .unwrap();

        assert_eq!(get("proper").unwrap().name, "proper");
    }

    #[test]
    #[serial]
    fn test_missing_optional_fields_default() {
        let _home = scratch_home();

        let dir = app::create_home_dir().unwrap();
        fs::write(
            dir.join("sparse.toml"),
            r#"
type = "local"
source = [":8080"]
destination = ["10.0.0.1:80"]
server = "user@host"
keep-alive-interval = "10s"
wait-and-retry = "3s"
timeout = "3s"
"#,
        )
        .unwrap();

        let alias = get("sparse").unwrap();
        assert!(!alias.rpc);
        assert_eq!(alias.connection_retries, 0);
        assert_eq!(alias.rpc_address, "");
    }
}
