use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, warn};

const HOME_VAR: &str = "$HOME";

/// One `Host` block from an SSH config file: the patterns on the `Host`
/// line plus every directive seen until the next block.
struct HostBlock {
    patterns: Vec<String>,
    directives: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, host))
    }

    /// First value for a directive inside this block, if set.
    fn get(&self, name: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(d, _)| d == name)
            .map(|(_, v)| v.as_str())
    }

    fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.directives
            .iter()
            .filter(move |(d, _)| d == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed user SSH config, consulted to fill in connection attributes the
/// caller left out.
pub struct SshConfigFile {
    blocks: Vec<HostBlock>,
}

impl SshConfigFile {
    /// Parse the config file at `path`, expanding a `$HOME` prefix first.
    ///
    /// A missing file is not an error: the resolver simply has nothing to
    /// offer and every lookup comes back empty.
    pub fn new(path: &str) -> Result<Self> {
        let mut path = path.to_string();
        if path.contains(HOME_VAR) {
            let home = dirs::home_dir().context("could not determine home directory")?;
            path = path.replace(HOME_VAR, &home.to_string_lossy());
        }

        let path = PathBuf::from(path);
        if !path.exists() {
            debug!(path = %path.display(), "ssh config file not found, using empty resolver");
            return Ok(SshConfigFile { blocks: Vec::new() });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read ssh config {}", path.display()))?;

        debug!(path = %path.display(), "using ssh config file");

        Ok(SshConfigFile {
            blocks: parse_blocks(&content),
        })
    }

    /// Resolver with no backing file; every lookup returns empty fields.
    pub fn empty() -> Self {
        SshConfigFile { blocks: Vec::new() }
    }

    /// Extract the attributes configured for `host`. Fields that are not
    /// present anywhere come back as empty strings / empty lists.
    pub fn get(&self, host: &str) -> SshHost {
        let matching: Vec<&HostBlock> =
            self.blocks.iter().filter(|b| b.matches(host)).collect();

        let first = |name: &str| -> String {
            matching
                .iter()
                .find_map(|b| b.get(name))
                .unwrap_or("")
                .to_string()
        };

        let local_forwards = self.forwards(&matching, "localforward");
        let remote_forwards = self.forwards(&matching, "remoteforward");

        SshHost {
            hostname: first("hostname"),
            port: first("port"),
            user: first("user"),
            key: expand_identity_file(&first("identityfile")),
            identity_agent: first("identityagent"),
            local_forwards,
            remote_forwards,
        }
    }

    fn forwards(&self, matching: &[&HostBlock], directive: &str) -> Vec<ForwardConfig> {
        let mut forwards = Vec::new();

        for block in matching {
            for value in block.get_all(directive) {
                match parse_forward(value) {
                    Ok(fwd) => forwards.push(fwd),
                    Err(e) => {
                        warn!(error = %e, "malformed forwarding configuration in ssh config file");
                    }
                }
            }
        }

        forwards
    }
}

/// A host configuration extracted from an SSH config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SshHost {
    pub hostname: String,
    pub port: String,
    pub user: String,
    pub key: String,
    pub identity_agent: String,
    pub local_forwards: Vec<ForwardConfig>,
    pub remote_forwards: Vec<ForwardConfig>,
}

impl fmt::Display for SshHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[hostname={}, port={}, user={}, key={}, identity_agent={}, local_forward={:?}, remote_forward={:?}]",
            self.hostname,
            self.port,
            self.user,
            self.key,
            self.identity_agent,
            self.local_forwards,
            self.remote_forwards,
        )
    }
}

/// A `LocalForward` or `RemoteForward` entry: where to listen and where the
/// traffic goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub source: String,
    pub destination: String,
}

impl fmt::Display for ForwardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[source={}, destination={}]", self.source, self.destination)
    }
}

fn parse_blocks(content: &str) -> Vec<HostBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<HostBlock> = None;

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (directive, value) = match split_directive(trimmed) {
            Some(pair) => pair,
            None => continue,
        };

        if directive.eq_ignore_ascii_case("host") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }

            current = Some(HostBlock {
                patterns: value.split_whitespace().map(str::to_string).collect(),
                directives: Vec::new(),
            });
        } else if let Some(ref mut block) = current {
            block
                .directives
                .push((directive.to_lowercase(), value.to_string()));
        }
    }

    if let Some(block) = current.take() {
        blocks.push(block);
    }

    blocks
}

/// Split an SSH config line into (directive, value); both the
/// "Directive value" and "Directive=value" forms are accepted.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let (directive, rest) = if let Some(eq_pos) = line.find('=') {
        let (d, v) = line.split_at(eq_pos);
        (d.trim(), v[1..].trim())
    } else {
        let mut parts = line.splitn(2, char::is_whitespace);
        let directive = parts.next()?.trim();
        let value = parts.next().map(|v| v.trim()).unwrap_or("");
        (directive, value)
    };

    if directive.is_empty() {
        return None;
    }

    Some((directive, rest))
}

/// Match a `Host` pattern against a host name; `*` and `?` wildcards are
/// supported.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == host;
    }

    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');

    Regex::new(&regex).map(|re| re.is_match(host)).unwrap_or(false)
}

/// Expand a leading `~` in an IdentityFile value against the home directory.
fn expand_identity_file(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    shellexpand::tilde(value).to_string()
}

/// Parse a forward value into `source destination`, normalizing the source
/// to an explicit loopback address when the host part is missing.
fn parse_forward(value: &str) -> Result<ForwardConfig> {
    let fields: Vec<&str> = value.split_whitespace().collect();

    if fields.len() < 2 {
        bail!("expected `source destination`, got {value:?}");
    }

    let mut source = fields[0].to_string();
    let destination = fields[1].to_string();

    if source.starts_with(':') {
        source = format!("127.0.0.1{source}");
    } else if !source.is_empty() && !source.contains(':') {
        source = format!("127.0.0.1:{source}");
    }

    Ok(ForwardConfig {
        source,
        destination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn parse(content: &str) -> SshConfigFile {
        let f = write_config(content);
        SshConfigFile::new(&f.path().to_string_lossy()).unwrap()
    }

    #[test]
    fn test_get_basic_host() {
        let cfg = parse(
            r#"
Host jump
    Hostname 10.0.1.5
    Port 2222
    User deploy
    IdentityFile /keys/id_ed25519
"#,
        );

        let h = cfg.get("jump");
        assert_eq!(h.hostname, "10.0.1.5");
        assert_eq!(h.port, "2222");
        assert_eq!(h.user, "deploy");
        assert_eq!(h.key, "/keys/id_ed25519");
    }

    #[test]
    fn test_get_absent_host_is_empty() {
        let cfg = parse("Host jump\n    Hostname 10.0.1.5\n");
        assert_eq!(cfg.get("other"), SshHost::default());
    }

    #[test]
    fn test_missing_file_is_null_resolver() {
        let cfg = SshConfigFile::new("/definitely/not/here/config").unwrap();
        assert_eq!(cfg.get("anything"), SshHost::default());
    }

    #[test]
    fn test_wildcard_pattern() {
        let cfg = parse(
            r#"
Host *.internal
    User ops
"#,
        );

        assert_eq!(cfg.get("db.internal").user, "ops");
        assert_eq!(cfg.get("db.external").user, "");
    }

    #[test]
    fn test_question_mark_pattern() {
        let cfg = parse("Host web-?\n    Port 2200\n");
        assert_eq!(cfg.get("web-1").port, "2200");
        assert_eq!(cfg.get("web-10").port, "");
    }

    #[test]
    fn test_first_value_wins_across_blocks() {
        let cfg = parse(
            r#"
Host jump
    User specific

Host *
    User fallback
    Port 22
"#,
        );

        let h = cfg.get("jump");
        assert_eq!(h.user, "specific");
        assert_eq!(h.port, "22");
    }

    #[test]
    fn test_equals_syntax() {
        let cfg = parse("Host jump\n    Hostname=10.0.0.1\n    User=admin\n");
        let h = cfg.get("jump");
        assert_eq!(h.hostname, "10.0.0.1");
        assert_eq!(h.user, "admin");
    }

    #[test]
    fn test_identity_agent() {
        let cfg = parse("Host jump\n    IdentityAgent /run/agent.sock\n");
        assert_eq!(cfg.get("jump").identity_agent, "/run/agent.sock");
    }

    #[test]
    fn test_identity_file_tilde_expansion() {
        let cfg = parse("Host jump\n    IdentityFile ~/.ssh/id_rsa\n");
        let key = cfg.get("jump").key;
        assert!(!key.starts_with('~'), "tilde not expanded: {key}");
        assert!(key.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn test_local_forwards_collected() {
        let cfg = parse(
            r#"
Host jump
    LocalForward 127.0.0.1:8080 172.17.0.1:80
    LocalForward :9090 172.17.0.2:90
"#,
        );

        let h = cfg.get("jump");
        assert_eq!(h.local_forwards.len(), 2);
        assert_eq!(h.local_forwards[0].source, "127.0.0.1:8080");
        assert_eq!(h.local_forwards[0].destination, "172.17.0.1:80");
        assert_eq!(h.local_forwards[1].source, "127.0.0.1:9090");
    }

    #[test]
    fn test_forward_bare_port_source() {
        let cfg = parse("Host jump\n    RemoteForward 8080 10.0.0.1:80\n");
        let h = cfg.get("jump");
        assert_eq!(h.remote_forwards[0].source, "127.0.0.1:8080");
    }

    #[test]
    fn test_malformed_forward_is_skipped() {
        let cfg = parse(
            r#"
Host jump
    LocalForward broken
    LocalForward :8080 10.0.0.1:80
"#,
        );

        let h = cfg.get("jump");
        assert_eq!(h.local_forwards.len(), 1);
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let cfg = parse(
            r#"
# global comment

Host jump
    # inner comment
    Hostname 10.0.0.9
"#,
        );

        assert_eq!(cfg.get("jump").hostname, "10.0.0.9");
    }

    #[test]
    fn test_multi_alias_host_line() {
        let cfg = parse("Host jump bastion gateway\n    User shared\n");
        assert_eq!(cfg.get("bastion").user, "shared");
        assert_eq!(cfg.get("gateway").user, "shared");
    }
}
