//! Local interface enumeration and LAN sweep targets.
//!
//! The discovery side of the fabric needs to know which addresses mean
//! "this host" (so servers do not gossip with themselves and radios do not
//! connect to their own listener) and which addresses are worth probing on
//! the local network.

/// Every IPv4 address the local hostname resolves to.
///
/// Falls back to plain loopback when the hostname cannot be resolved —
/// a host with an exotic interface configuration still works on loopback.
pub async fn local_ipv4_addresses() -> Vec<String> {
    let mut ips = Vec::new();
    if let Ok(name) = hostname::get() {
        let name = name.to_string_lossy().into_owned();
        let lookup_target = format!("{name}:0");
        if let Ok(addrs) = tokio::net::lookup_host(lookup_target).await {
            for addr in addrs {
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    let ip = v4.to_string();
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
        }
    }
    if ips.is_empty() {
        ips.push("127.0.0.1".to_string());
    }
    ips
}

/// `ips` plus the loopback names that alias every local interface.
pub fn loopback_aliases(ips: &[String]) -> Vec<String> {
    let mut aliases = ips.to_vec();
    for alias in ["localhost", "127.0.0.1"] {
        if !aliases.iter().any(|known| known == alias) {
            aliases.push(alias.to_string());
        }
    }
    aliases
}

/// Synthesise probe targets: for every local /24, enumerate hosts 1..=254.
pub fn lan_sweep_targets(ips: &[String]) -> Vec<String> {
    let mut targets = Vec::new();
    for ip in ips {
        let parts: Vec<&str> = ip.split('.').collect();
        if parts.len() != 4 {
            continue;
        }
        let prefix = format!("{}.{}.{}", parts[0], parts[1], parts[2]);
        for host in 1..=254u8 {
            let target = format!("{prefix}.{host}");
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}
