//! `resolv.conf` parsing and reload policy, grounded on
//! `resolve/transport/local.go`'s `dnsReadConfig`/`resolverConfig` and
//! `resolve/transport/helper.go`'s `avoidDNS`/`dnsDefaultSearch`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use net_address::Endpoint;
use parking_lot::Mutex;

pub const DEFAULT_NDOTS: i32 = 1;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ATTEMPTS: u32 = 2;
const MAX_NDOTS: i32 = 15;
const RELOAD_PERIOD: Duration = Duration::from_secs(5);

/// Parsed `/etc/resolv.conf` contents plus derived defaults, per §4.8.
#[derive(Debug)]
pub struct ResolvConfig {
    pub servers: Vec<Endpoint>,
    pub search: Vec<String>,
    pub ndots: i32,
    pub timeout: Duration,
    pub attempts: u32,
    pub rotate: bool,
    pub single_request: bool,
    pub use_tcp: bool,
    pub trust_ad: bool,
    pub no_reload: bool,
    pub lookup: Vec<String>,
    mtime: Option<SystemTime>,
    server_offset: AtomicU32,
}

impl Default for ResolvConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            search: default_search(),
            ndots: DEFAULT_NDOTS,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            rotate: false,
            single_request: false,
            use_tcp: false,
            trust_ad: false,
            no_reload: false,
            lookup: Vec::new(),
            mtime: None,
            server_offset: AtomicU32::new(0),
        }
    }
}

impl Clone for ResolvConfig {
    fn clone(&self) -> Self {
        Self {
            servers: self.servers.clone(),
            search: self.search.clone(),
            ndots: self.ndots,
            timeout: self.timeout,
            attempts: self.attempts,
            rotate: self.rotate,
            single_request: self.single_request,
            use_tcp: self.use_tcp,
            trust_ad: self.trust_ad,
            no_reload: self.no_reload,
            lookup: self.lookup.clone(),
            mtime: self.mtime,
            server_offset: AtomicU32::new(self.server_offset.load(Ordering::Relaxed)),
        }
    }
}

impl ResolvConfig {
    /// Reads and parses `path`. On any I/O error the defaults apply, as
    /// the original does when `/etc/resolv.conf` is absent.
    pub fn read(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) => {
                tracing::debug!(%error, path = %path.display(), "resolv.conf unreadable, using defaults");
                return Self::default();
            }
        };
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        let mut config = Self::parse(&text);
        config.mtime = mtime;
        config
    }

    fn parse(text: &str) -> Self {
        let mut config = Self { servers: Vec::new(), search: Vec::new(), ..Self::default() };

        for line in text.lines() {
            let line = line.split(';').next().unwrap_or("").split('#').next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            let Some(keyword) = fields.next() else { continue };

            match keyword {
                "nameserver" => {
                    if config.servers.len() < 3 {
                        if let Some(addr) = fields.next() {
                            if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
                                config.servers.push(Endpoint::from_ip(ip, 53));
                            }
                        }
                    }
                }
                "domain" => {
                    if let Some(name) = fields.next() {
                        config.search = vec![fqdn(name)];
                    }
                }
                "search" => {
                    config.search = fields.map(fqdn).collect();
                }
                "options" => {
                    for opt in fields {
                        apply_option(&mut config, opt);
                    }
                }
                "lookup" => {
                    config.lookup = fields.map(str::to_string).collect();
                }
                _ => {}
            }
        }

        if config.servers.is_empty() {
            config.servers = default_servers();
        }
        if config.search.is_empty() {
            config.search = default_search();
        }
        config
    }

    /// Current atomic rotation offset; bumped once per serial/parallel
    /// attempt round when `rotate` is set.
    pub fn next_server_offset(&self) -> u32 {
        if self.rotate { self.server_offset.fetch_add(1, Ordering::Relaxed) } else { 0 }
    }
}

fn apply_option(config: &mut ResolvConfig, opt: &str) {
    if let Some(n) = opt.strip_prefix("ndots:") {
        if let Ok(n) = n.parse::<i32>() {
            config.ndots = n.clamp(0, MAX_NDOTS);
        }
    } else if let Some(n) = opt.strip_prefix("timeout:") {
        if let Ok(n) = n.parse::<u64>() {
            config.timeout = Duration::from_secs(n.max(1));
        }
    } else if let Some(n) = opt.strip_prefix("attempts:") {
        if let Ok(n) = n.parse::<u32>() {
            config.attempts = n.max(1);
        }
    } else {
        match opt {
            "rotate" => config.rotate = true,
            "single-request" | "single-request-reopen" => config.single_request = true,
            "use-vc" | "usevc" | "tcp" => config.use_tcp = true,
            "trust-ad" => config.trust_ad = true,
            "no-reload" => config.no_reload = true,
            "edns0" => {}
            _ => {}
        }
    }
}

fn fqdn(name: &str) -> String {
    if name.ends_with('.') { name.to_string() } else { format!("{name}.") }
}

fn default_servers() -> Vec<Endpoint> {
    vec![
        Endpoint::from_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 53),
        Endpoint::from_ip(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 53),
    ]
}

/// Derives a single search domain from the local hostname's suffix, as
/// `dnsDefaultSearch` does, when resolv.conf has no explicit domain/search.
pub fn default_search() -> Vec<String> {
    let Some(hostname) = local_hostname() else { return Vec::new() };
    match hostname.find('.') {
        Some(i) if i < hostname.len() - 1 => vec![fqdn(&hostname[i + 1..])],
        _ => Vec::new(),
    }
}

fn local_hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    // SAFETY: `buf` is a valid, uniquely-owned buffer of the given length.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok().filter(|s| !s.is_empty())
}

/// A name is unsuitable for DNS lookup if empty, or (ignoring one trailing
/// dot) a `.onion` name.
pub fn avoid_dns(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    trimmed.ends_with(".onion")
}

/// Builds the ordered list of fully-qualified candidates to query for
/// `name`, per §4.8 step 2. Mirrors `dnsConfig.nameList`.
pub fn name_list(config: &ResolvConfig, name: &str) -> Vec<String> {
    let rooted = name.ends_with('.');

    if name.len() > 254 || (name.len() == 254 && !rooted) {
        return Vec::new();
    }

    if rooted {
        return if avoid_dns(name) { Vec::new() } else { vec![name.to_string()] };
    }

    let has_ndots = name.matches('.').count() as i32 >= config.ndots;
    let as_is = fqdn(name);

    let mut names = Vec::with_capacity(1 + config.search.len());
    if has_ndots && !avoid_dns(&as_is) {
        names.push(as_is.clone());
    }
    for suffix in &config.search {
        let candidate = format!("{as_is}{suffix}");
        if candidate.len() <= 254 && !avoid_dns(&candidate) {
            names.push(candidate);
        }
    }
    if !has_ndots && !avoid_dns(&as_is) {
        names.push(as_is);
    }
    names
}

/// Throttles re-reads of the backing file to at most once per 5 s, skips
/// the mtime check on platforms where it's unreliable, and never blocks a
/// caller behind an in-progress reload.
pub struct ReloadingConfig {
    path: PathBuf,
    current: Mutex<std::sync::Arc<ResolvConfig>>,
    last_checked: Mutex<Option<Instant>>,
    reloading: AtomicBool,
}

impl ReloadingConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = std::sync::Arc::new(ResolvConfig::read(&path));
        Self { path, current: Mutex::new(initial), last_checked: Mutex::new(None), reloading: AtomicBool::new(false) }
    }

    pub fn current(&self) -> std::sync::Arc<ResolvConfig> {
        self.maybe_reload();
        self.current.lock().clone()
    }

    fn maybe_reload(&self) {
        if self.current.lock().no_reload {
            return;
        }
        if self.reloading.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = ReleaseOnDrop(&self.reloading);

        let now = Instant::now();
        {
            let mut last = self.last_checked.lock();
            if let Some(last) = *last {
                if now.duration_since(last) < RELOAD_PERIOD {
                    return;
                }
            }
            *last = Some(now);
        }

        if !cfg!(target_os = "windows") {
            let disk_mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
            if disk_mtime.is_some() && disk_mtime == self.current.lock().mtime {
                return;
            }
        }

        let fresh = ResolvConfig::read(&self.path);
        *self.current.lock() = std::sync::Arc::new(fresh);
    }
}

struct ReleaseOnDrop<'a>(&'a AtomicBool);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_servers_search_and_options() {
        let text = "nameserver 192.0.2.1\nnameserver 192.0.2.2\nsearch example.org example.com\noptions ndots:2 timeout:3 attempts:4 rotate trust-ad\n";
        let config = ResolvConfig::parse(text);

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.search, vec!["example.org.", "example.com."]);
        assert_eq!(config.ndots, 2);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.attempts, 4);
        assert!(config.rotate);
        assert!(config.trust_ad);
    }

    #[test]
    fn clamps_out_of_range_options() {
        let config = ResolvConfig::parse("options ndots:99 timeout:0 attempts:0\n");
        assert_eq!(config.ndots, MAX_NDOTS);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.attempts, 1);
    }

    #[test]
    fn empty_file_falls_back_to_defaults() {
        let config = ResolvConfig::parse("");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.ndots, DEFAULT_NDOTS);
        assert_eq!(config.attempts, DEFAULT_ATTEMPTS);
    }

    #[test]
    fn name_list_rooted_name_is_returned_alone() {
        let config = ResolvConfig::default();
        assert_eq!(name_list(&config, "foo.bar."), vec!["foo.bar."]);
    }

    #[test]
    fn name_list_onion_names_are_skipped() {
        let config = ResolvConfig::default();
        assert!(name_list(&config, "secret.onion.").is_empty());
    }

    #[test]
    fn name_list_honors_ndots_ordering() {
        let mut config = ResolvConfig::default();
        config.ndots = 2;
        config.search = vec!["example.org.".to_string()];

        assert_eq!(name_list(&config, "foo"), vec!["foo.example.org.", "foo."]);
        assert_eq!(name_list(&config, "a.b.c"), vec!["a.b.c.", "a.b.c.example.org."]);
    }

    #[test]
    fn reloading_config_reads_the_file_once_and_throttles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.0.2.1\n").unwrap();

        let reloading = ReloadingConfig::new(&path);
        assert_eq!(reloading.current().servers.len(), 1);

        std::fs::write(&path, "nameserver 192.0.2.1\nnameserver 192.0.2.2\n").unwrap();
        // Within the 5s throttle window, the stale config is still served.
        assert_eq!(reloading.current().servers.len(), 1);
    }
}
