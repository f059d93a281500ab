use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tolerant matcher for `[user@]host[:port]`; every part is optional.
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<user>.+@)?(?P<host>[[:alnum:]_.-]+)?(?P<port>:[0-9]+)?")
        .expect("address pattern is valid")
});

/// An endpoint given by the user: `[user@]host[:port]`.
///
/// The stored form keeps whatever subset was supplied; a bare `:port` keeps
/// `host` empty and is only expanded to loopback where a connection is
/// actually made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInput {
    pub user: String,
    pub host: String,
    pub port: String,
}

impl AddressInput {
    /// The network form of the address: `host:port`, or `host` alone when no
    /// port was given.
    pub fn address(&self) -> String {
        if self.port.is_empty() {
            return self.host.clone();
        }

        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for AddressInput {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // The pattern has only optional groups, so it matches any input.
        let caps = ADDRESS_RE
            .captures(value)
            .expect("all-optional pattern always matches");

        let field = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or("");

        Ok(AddressInput {
            user: field("user").trim_end_matches('@').to_string(),
            host: field("host").to_string(),
            port: field("port").trim_start_matches(':').to_string(),
        })
    }
}

impl fmt::Display for AddressInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.address())
        } else {
            write!(f, "{}@{}", self.user, self.address())
        }
    }
}

/// An ordered collection of address inputs, as accepted by repeatable CLI
/// flags and alias records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInputList(pub Vec<AddressInput>);

impl AddressInputList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// String form of every entry, in order.
    pub fn as_strings(&self) -> Vec<String> {
        self.0.iter().map(|a| a.to_string()).collect()
    }

    /// Parse a list of surface strings into address inputs.
    pub fn parse(values: &[String]) -> Self {
        AddressInputList(
            values
                .iter()
                .map(|v| v.parse().expect("address parse is infallible"))
                .collect(),
        )
    }
}

impl fmt::Display for AddressInputList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        write!(f, "{}", rendered.join(","))
    }
}
