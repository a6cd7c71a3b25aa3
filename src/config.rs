//! Cluster topology, loaded once at start-up and shared read-only afterwards.
//!
//! Participants are listed one IP address per line in the host list file. The
//! last entry is the client; every other entry is a replica. Ports are not
//! listed, they derive from two base ports by participant index.

use std::{
    collections::HashSet,
    env, fs, io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use crate::{client::RetryPolicy, monitor::Completion, replica::BarrierSettings};

/// Base of the ports replicas use among themselves.
pub const BASE_PORT: u16 = 40540;
/// Base of the ports serving client RPCs.
pub const RPC_BASE_PORT: u16 = 10000;

pub const DEFAULT_NUM_REQUESTS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set and no host list was given")]
    NoHome,
    #[error("host list {0} not found")]
    Missing(PathBuf),
    #[error("cannot read host list {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("host list {0} has no entries")]
    Empty(PathBuf),
    #[error("host list {path} line {line}: {content:?} is not an IP address")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("{0} participant(s), need at least one replica besides the client")]
    TooFew(usize),
    #[error("{count} participants overflow base port {base}")]
    PortOverflow { base: u16, count: usize },
    #[error("address {0} is assigned to more than one listener")]
    PortClash(SocketAddr),
}

/// Everything the run can be tuned with. The binary fills it from the command
/// line.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `$HOME/hosts` if absent.
    pub hosts_file: Option<PathBuf>,
    pub key_dir: PathBuf,
    pub num_requests: u32,
    pub base_port: u16,
    pub rpc_base_port: u16,
    pub generate_keys: bool,
    pub allow_unsigned: bool,
    pub barrier: BarrierSettings,
    pub retry: RetryPolicy,
    pub completion: Completion,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hosts_file: None,
            key_dir: PathBuf::from("keys"),
            num_requests: DEFAULT_NUM_REQUESTS,
            base_port: BASE_PORT,
            rpc_base_port: RPC_BASE_PORT,
            generate_keys: true,
            allow_unsigned: false,
            barrier: Default::default(),
            retry: Default::default(),
            completion: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    hosts: Vec<IpAddr>,
    ports: Vec<u16>,
    rpc_ports: Vec<u16>,
    pub num_requests: u32,
    pub key_dir: PathBuf,
}

impl ClusterConfig {
    pub fn new(
        hosts: Vec<IpAddr>,
        base_port: u16,
        rpc_base_port: u16,
        num_requests: u32,
        key_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if hosts.len() < 2 {
            return Err(ConfigError::TooFew(hosts.len()));
        }
        let ports = derive_ports(base_port, hosts.len())?;
        let rpc_ports = derive_ports(rpc_base_port, hosts.len())?;
        // participants sharing a host must not share a port either
        let mut bound = HashSet::new();
        for (&host, &port) in hosts.iter().cycle().zip(ports.iter().chain(&rpc_ports)) {
            if !bound.insert((host, port)) {
                return Err(ConfigError::PortClash((host, port).into()));
            }
        }
        Ok(Self {
            hosts,
            ports,
            rpc_ports,
            num_requests,
            key_dir: key_dir.into(),
        })
    }

    pub fn load(settings: &Settings) -> Result<Self, ConfigError> {
        let path = match &settings.hosts_file {
            Some(path) => path.clone(),
            None => default_hosts_file()?,
        };
        let text = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::Missing(path.clone())
            } else {
                ConfigError::Read {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let hosts = parse_hosts(&path, &text)?;
        Self::new(
            hosts,
            settings.base_port,
            settings.rpc_base_port,
            settings.num_requests,
            settings.key_dir.clone(),
        )
    }

    /// Participants including the client, i.e. the number of key pairs.
    pub fn num_keys(&self) -> usize {
        self.hosts.len()
    }

    pub fn num_replica(&self) -> usize {
        self.hosts.len() - 1
    }

    pub fn client_index(&self) -> usize {
        self.hosts.len() - 1
    }

    pub fn consensus_addr(&self, index: usize) -> SocketAddr {
        (self.hosts[index], self.ports[index]).into()
    }

    pub fn rpc_addr(&self, index: usize) -> SocketAddr {
        (self.hosts[index], self.rpc_ports[index]).into()
    }

    pub fn primary(&self, view: u32) -> usize {
        view as usize % self.num_replica()
    }
}

pub fn default_hosts_file() -> Result<PathBuf, ConfigError> {
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("hosts"))
        .ok_or(ConfigError::NoHome)
}

/// One address per line, blank lines and `#` comments skipped.
pub fn parse_hosts(path: &Path, text: &str) -> Result<Vec<IpAddr>, ConfigError> {
    let mut hosts = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }
        let host = content.parse().map_err(|_| ConfigError::Malformed {
            path: path.into(),
            line: i + 1,
            content: content.into(),
        })?;
        hosts.push(host)
    }
    if hosts.is_empty() {
        return Err(ConfigError::Empty(path.into()));
    }
    Ok(hosts)
}

fn derive_ports(base: u16, count: usize) -> Result<Vec<u16>, ConfigError> {
    (0..count)
        .map(|index| {
            u16::try_from(index)
                .ok()
                .and_then(|index| base.checked_add(index))
                .ok_or(ConfigError::PortOverflow { base, count })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn localhost(count: usize) -> Vec<IpAddr> {
        vec![IpAddr::from([127, 0, 0, 1]); count]
    }

    #[test]
    fn ports_follow_participant_index() {
        let config = ClusterConfig::new(localhost(5), BASE_PORT, RPC_BASE_PORT, 100, "keys").unwrap();
        assert_eq!(config.num_keys(), 5);
        assert_eq!(config.num_replica(), 4);
        assert_eq!(config.client_index(), 4);
        assert_eq!(config.consensus_addr(2).port(), 40542);
        assert_eq!(config.rpc_addr(2).port(), 10002);
        assert_eq!(config.rpc_addr(4).port(), 10004);
        assert_eq!(config.primary(0), 0);
        assert_eq!(config.primary(6), 2);
    }

    #[test]
    fn overlapping_port_ranges_are_refused() {
        let result = ClusterConfig::new(localhost(4), 10000, 10001, 1, "keys");
        match result {
            Err(ConfigError::PortClash(addr)) => {
                assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 10001)))
            }
            result => panic!("unexpected {result:?}"),
        }
        // the same ports on distinct hosts do not clash
        let hosts = (1..=4).map(|i| IpAddr::from([10, 0, 0, i])).collect();
        ClusterConfig::new(hosts, 10000, 10001, 1, "keys").unwrap();
    }

    #[test]
    fn port_overflow_is_refused() {
        let result = ClusterConfig::new(localhost(3), u16::MAX - 1, RPC_BASE_PORT, 1, "keys");
        assert!(matches!(result, Err(ConfigError::PortOverflow { .. })));
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "# cluster\n10.0.0.1\n\n10.0.0.2 # backup\n  10.0.0.3\n";
        let hosts = parse_hosts(Path::new("hosts"), text).unwrap();
        assert_eq!(
            hosts,
            vec![
                IpAddr::from([10, 0, 0, 1]),
                IpAddr::from([10, 0, 0, 2]),
                IpAddr::from([10, 0, 0, 3]),
            ]
        );
    }

    #[test]
    fn parse_reports_bad_line() {
        let text = "10.0.0.1\nnot-an-ip\n";
        match parse_hosts(Path::new("hosts"), text) {
            Err(ConfigError::Malformed { line, content, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(content, "not-an-ip")
            }
            result => panic!("unexpected {result:?}"),
        }
    }

    #[test]
    fn parse_needs_a_replica() {
        assert!(matches!(
            parse_hosts(Path::new("hosts"), "\n# nothing\n"),
            Err(ConfigError::Empty(_))
        ));
        let hosts = parse_hosts(Path::new("hosts"), "127.0.0.1\n").unwrap();
        assert!(matches!(
            ClusterConfig::new(hosts, BASE_PORT, RPC_BASE_PORT, 1, "keys"),
            Err(ConfigError::TooFew(1))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "127.0.0.1\n127.0.0.1\n127.0.0.1").unwrap();
        let settings = Settings {
            hosts_file: Some(file.path().into()),
            num_requests: 7,
            ..Default::default()
        };
        let config = ClusterConfig::load(&settings).unwrap();
        assert_eq!(config.num_replica(), 2);
        assert_eq!(config.num_requests, 7);
        assert_eq!(config.key_dir, PathBuf::from("keys"));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            hosts_file: Some(dir.path().join("hosts")),
            ..Default::default()
        };
        assert!(matches!(
            ClusterConfig::load(&settings),
            Err(ConfigError::Missing(_))
        ));
    }
}
