//! Hosts-file short-circuit for A/AAAA questions.
//!
//! No Go source for this piece was available alongside `local.go` and
//! `helper.go`, so the on-disk format follows the conventional
//! `/etc/hosts` grammar (`ip name [alias...]`, `#` comments) rather than a
//! ported implementation.

use std::collections::HashMap;
use std::io::BufRead;
use std::net::IpAddr;
use std::path::Path;

/// Looks up literal addresses for a name before any network exchange is
/// attempted. Implementations must be safe to call from many tasks at once.
pub trait HostsFile: Send + Sync {
    fn lookup(&self, name: &str) -> Vec<IpAddr>;
}

/// A hosts file that never matches; the default when no path is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHosts;

impl HostsFile for NullHosts {
    fn lookup(&self, _name: &str) -> Vec<IpAddr> {
        Vec::new()
    }
}

/// An in-memory hosts table, either built programmatically or parsed from
/// an `/etc/hosts`-shaped file.
#[derive(Debug, Default, Clone)]
pub struct StaticHosts {
    by_name: HashMap<String, Vec<IpAddr>>,
}

impl StaticHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: IpAddr) {
        self.by_name.entry(normalize(&name.into())).or_default().push(addr);
    }

    /// Parses a conventional hosts file: one record per line, `ip` followed
    /// by one or more whitespace-separated names; `#` starts a comment;
    /// blank lines are ignored.
    pub fn from_reader(reader: impl std::io::Read) -> std::io::Result<Self> {
        let mut hosts = Self::new();
        for line in std::io::BufReader::new(reader).lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in fields {
                hosts.insert(name, addr);
            }
        }
        Ok(hosts)
    }

    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }
}

impl HostsFile for StaticHosts {
    fn lookup(&self, name: &str) -> Vec<IpAddr> {
        self.by_name.get(&normalize(name)).cloned().unwrap_or_default()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
