//! Relay configuration.
//!
//! Options keep their historical comma-separated string forms so existing
//! deployments carry over unchanged:
//!
//! ```text
//! udpport=<port>,<group>[,<mbps>]
//! udpmulticast=<iface-ip>,<mcastip:port>,<txip>[,<trusted>[,<label>]]
//! udpmulticasttx=<iface-ip>,<mcastip:port>,<bps>,<txn_per_sec>[,<ttl>[,<depth>[,<offset>[,<dscp>[,<interleave>]]]]]
//! addudpnode=<ip:port>,<local_pass>,<remote_pass>[,<group>]
//! udpmulticastloginterval=<seconds>
//! ```
//!
//! Parsing is strict: a bad option is a fatal startup error.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::wire::derive_magic;

/// Default backfill depth: roughly one day of blocks.
pub const DEFAULT_BACKFILL_DEPTH: u64 = 144;

/// Default stats print cadence in seconds.
pub const DEFAULT_LOG_INTERVAL: u64 = 10;

/// Default timeout for abandoned partial blocks.
pub const DEFAULT_PARTIAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

fn config_err(option: &'static str, reason: impl Into<String>) -> RelayError {
    RelayError::Config {
        option,
        reason: reason.into(),
    }
}

/// One `udpport` entry: a unicast rx/tx group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPortConfig {
    pub port: u16,
    pub group: usize,
    /// Bitrate budget in Mbit/s.
    pub mbps: u64,
}

impl UdpPortConfig {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(config_err("udpport", "expected <port>,<group>[,<mbps>]"));
        }
        let port: u16 = parts[0]
            .parse()
            .map_err(|_| config_err("udpport", format!("invalid port {}", parts[0])))?;
        if port == 0 {
            return Err(config_err("udpport", "port must be nonzero"));
        }
        let group = parts[1]
            .parse()
            .map_err(|_| config_err("udpport", format!("invalid group {}", parts[1])))?;
        let mbps = match parts.get(2) {
            Some(v) => v
                .parse()
                .map_err(|_| config_err("udpport", format!("invalid bitrate {v}")))?,
            None => 1024,
        };
        Ok(Self { port, group, mbps })
    }
}

/// One `udpmulticast` (rx) or `udpmulticasttx` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    pub tx: bool,
    /// IPv4 address of the local interface to bind the group on.
    pub iface: Ipv4Addr,
    pub mcast_addr: SocketAddr,
    /// Rx: the source address transmissions come from.
    pub source: Option<Ipv4Addr>,
    pub trusted: bool,
    pub label: String,
    /// Tx: bitrate budget in bit/s; 0 leaves pacing to the socket.
    pub bps: u64,
    /// Tx: mempool transactions per second; 0 disables the txn task.
    pub txn_per_sec: u64,
    pub ttl: u32,
    /// Tx: how deep into history the backfill reaches; 0 cycles the whole
    /// chain.
    pub depth: u64,
    pub offset: u64,
    pub dscp: u32,
    /// Tx: number of blocks interleaved in the send window.
    pub interleave: usize,
    /// Assigned socket group, filled in while building the node.
    pub group: usize,
}

impl MulticastConfig {
    fn parse_common(option: &'static str, parts: &[&str]) -> Result<(Ipv4Addr, SocketAddr)> {
        let iface: Ipv4Addr = parts[0]
            .parse()
            .map_err(|_| config_err(option, format!("invalid interface address {}", parts[0])))?;
        let mcast_addr: SocketAddr = parts[1]
            .parse()
            .map_err(|_| config_err(option, format!("invalid multicast address {}", parts[1])))?;
        if mcast_addr.port() == 0 {
            return Err(config_err(option, "multicast port must be nonzero"));
        }
        Ok((iface, mcast_addr))
    }

    /// Parses a receive-side `udpmulticast` entry.
    pub fn parse_rx(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 3 || parts.len() > 5 {
            return Err(config_err(
                "udpmulticast",
                "expected <iface-ip>,<mcastip:port>,<txip>[,<trusted>[,<label>]]",
            ));
        }
        let (iface, mcast_addr) = Self::parse_common("udpmulticast", &parts)?;
        let source: Ipv4Addr = parts[2]
            .parse()
            .map_err(|_| config_err("udpmulticast", format!("invalid source address {}", parts[2])))?;
        let trusted = match parts.get(3) {
            Some(v) => *v == "1" || v.eq_ignore_ascii_case("true"),
            None => false,
        };
        let label = parts.get(4).unwrap_or(&"").to_string();
        Ok(Self {
            tx: false,
            iface,
            mcast_addr,
            source: Some(source),
            trusted,
            label,
            bps: 0,
            txn_per_sec: 0,
            ttl: 3,
            depth: DEFAULT_BACKFILL_DEPTH,
            offset: 0,
            dscp: 0,
            interleave: 1,
            group: 0,
        })
    }

    /// Parses a transmit-side `udpmulticasttx` entry.
    pub fn parse_tx(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 4 || parts.len() > 9 {
            return Err(config_err(
                "udpmulticasttx",
                "expected <iface-ip>,<mcastip:port>,<bps>,<txn_per_sec>[,...]",
            ));
        }
        let (iface, mcast_addr) = Self::parse_common("udpmulticasttx", &parts)?;
        let num = |option: &'static str, value: &str| -> Result<u64> {
            value
                .parse()
                .map_err(|_| config_err(option, format!("invalid number {value}")))
        };
        let bps = num("udpmulticasttx", parts[2])?;
        let txn_per_sec = num("udpmulticasttx", parts[3])?;
        let ttl = parts.get(4).map(|v| num("udpmulticasttx", v)).transpose()?.unwrap_or(3) as u32;
        let depth = parts
            .get(5)
            .map(|v| num("udpmulticasttx", v))
            .transpose()?
            .unwrap_or(DEFAULT_BACKFILL_DEPTH);
        let offset = parts.get(6).map(|v| num("udpmulticasttx", v)).transpose()?.unwrap_or(0);
        let dscp = parts.get(7).map(|v| num("udpmulticasttx", v)).transpose()?.unwrap_or(0) as u32;
        let interleave = parts
            .get(8)
            .map(|v| num("udpmulticasttx", v))
            .transpose()?
            .unwrap_or(1) as usize;

        if depth > 0 && offset > depth {
            return Err(config_err("udpmulticasttx", "offset must be <= depth"));
        }

        Ok(Self {
            tx: true,
            iface,
            mcast_addr,
            source: None,
            trusted: false,
            label: String::new(),
            bps,
            txn_per_sec,
            ttl,
            depth,
            offset,
            dscp,
            interleave: interleave.max(1),
            group: 0,
        })
    }
}

/// One `addudpnode` / `addtrustedudpnode` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpNodeConfig {
    pub addr: SocketAddr,
    pub local_magic: u64,
    pub remote_magic: u64,
    pub trusted: bool,
    pub group: usize,
}

impl UdpNodeConfig {
    pub fn parse(s: &str, trusted: bool) -> Result<Self> {
        let option: &'static str = if trusted { "addtrustedudpnode" } else { "addudpnode" };
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(config_err(
                option,
                "expected <ip:port>,<local_pass>,<remote_pass>[,<group>]",
            ));
        }
        let addr: SocketAddr = parts[0]
            .parse()
            .map_err(|_| config_err(option, format!("invalid address {}", parts[0])))?;
        let group = match parts.get(3) {
            Some(v) => v
                .parse()
                .map_err(|_| config_err(option, format!("invalid group {v}")))?,
            None => 0,
        };
        Ok(Self {
            addr,
            local_magic: derive_magic(parts[1]),
            remote_magic: derive_magic(parts[2]),
            trusted,
            group,
        })
    }
}

/// Parses a `udpmulticastloginterval` value (seconds, nonzero).
pub fn parse_log_interval(s: &str) -> Result<Duration> {
    let seconds: u64 = s
        .parse()
        .map_err(|_| config_err("udpmulticastloginterval", format!("invalid seconds {s}")))?;
    if seconds == 0 {
        return Err(config_err("udpmulticastloginterval", "must be nonzero"));
    }
    Ok(Duration::from_secs(seconds))
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub ports: Vec<UdpPortConfig>,
    pub multicast: Vec<MulticastConfig>,
    pub nodes: Vec<UdpNodeConfig>,
    pub log_interval: Duration,
    pub partial_timeout: Duration,
}

impl RelayConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ports: Vec::new(),
            multicast: Vec::new(),
            nodes: Vec::new(),
            log_interval: Duration::from_secs(DEFAULT_LOG_INTERVAL),
            partial_timeout: DEFAULT_PARTIAL_TIMEOUT,
        }
    }

    /// The directory partial-block chunk files live in.
    pub fn partial_blocks_dir(&self) -> PathBuf {
        self.data_dir.join("partial_blocks")
    }

    /// Validates group numbering: unicast groups must be dense from zero.
    pub fn validate(&self) -> Result<()> {
        let mut groups: Vec<usize> = self.ports.iter().map(|p| p.group).collect();
        groups.sort_unstable();
        groups.dedup();
        if groups.len() != self.ports.len() {
            return Err(config_err("udpport", "duplicate group"));
        }
        for (i, group) in groups.iter().enumerate() {
            if *group != i {
                return Err(config_err("udpport", "groups must be dense from 0"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udpport_forms() {
        let cfg = UdpPortConfig::parse("8333,0,80").unwrap();
        assert_eq!((cfg.port, cfg.group, cfg.mbps), (8333, 0, 80));
        let cfg = UdpPortConfig::parse("8334,1").unwrap();
        assert_eq!(cfg.mbps, 1024);

        assert!(UdpPortConfig::parse("0,0").is_err());
        assert!(UdpPortConfig::parse("8333").is_err());
        assert!(UdpPortConfig::parse("x,0").is_err());
        assert!(UdpPortConfig::parse("8333,0,80,9").is_err());
    }

    #[test]
    fn test_multicast_rx() {
        let cfg = MulticastConfig::parse_rx("10.0.0.2,239.0.0.2:4434,172.16.235.1,1,blocksat").unwrap();
        assert!(!cfg.tx);
        assert_eq!(cfg.iface, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cfg.mcast_addr, "239.0.0.2:4434".parse().unwrap());
        assert_eq!(cfg.source, Some("172.16.235.1".parse().unwrap()));
        assert!(cfg.trusted);
        assert_eq!(cfg.label, "blocksat");

        let cfg = MulticastConfig::parse_rx("10.0.0.2,239.0.0.2:4434,172.16.235.1").unwrap();
        assert!(!cfg.trusted);
        assert!(MulticastConfig::parse_rx("10.0.0.2,239.0.0.2:4434").is_err());
        assert!(MulticastConfig::parse_rx("eth0,239.0.0.2:4434,172.16.235.1").is_err());
    }

    #[test]
    fn test_multicast_tx() {
        let cfg = MulticastConfig::parse_tx("10.0.0.2,239.0.0.2:4434,1000000,50,8,144,72,10,4").unwrap();
        assert!(cfg.tx);
        assert_eq!(cfg.bps, 1_000_000);
        assert_eq!(cfg.txn_per_sec, 50);
        assert_eq!(cfg.ttl, 8);
        assert_eq!(cfg.depth, 144);
        assert_eq!(cfg.offset, 72);
        assert_eq!(cfg.dscp, 10);
        assert_eq!(cfg.interleave, 4);

        let cfg = MulticastConfig::parse_tx("10.0.0.2,239.0.0.2:4434,0,0").unwrap();
        assert_eq!(cfg.ttl, 3);
        assert_eq!(cfg.depth, DEFAULT_BACKFILL_DEPTH);
        assert_eq!(cfg.interleave, 1);

        // offset beyond depth is rejected.
        assert!(MulticastConfig::parse_tx("10.0.0.2,239.0.0.2:4434,0,0,3,100,200").is_err());
    }

    #[test]
    fn test_udpnode() {
        let cfg = UdpNodeConfig::parse("192.168.1.5:8333,pass_a,pass_b,2", true).unwrap();
        assert_eq!(cfg.addr, "192.168.1.5:8333".parse().unwrap());
        assert_eq!(cfg.local_magic, derive_magic("pass_a"));
        assert_eq!(cfg.remote_magic, derive_magic("pass_b"));
        assert!(cfg.trusted);
        assert_eq!(cfg.group, 2);

        assert!(UdpNodeConfig::parse("192.168.1.5:8333,pass_a", false).is_err());
    }

    #[test]
    fn test_log_interval() {
        assert_eq!(parse_log_interval("30").unwrap(), Duration::from_secs(30));
        assert!(parse_log_interval("0").is_err());
        assert!(parse_log_interval("ten").is_err());
    }

    #[test]
    fn test_group_validation() {
        let mut cfg = RelayConfig::new(PathBuf::from("/tmp/x"));
        cfg.ports.push(UdpPortConfig::parse("8333,0").unwrap());
        cfg.ports.push(UdpPortConfig::parse("8334,1").unwrap());
        assert!(cfg.validate().is_ok());

        cfg.ports.push(UdpPortConfig::parse("8335,3").unwrap());
        assert!(cfg.validate().is_err());
    }
}
