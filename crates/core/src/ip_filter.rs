//! IP allow/block lists consulted before a connect reaches the store.
//!
//! Entries are exact addresses (`203.0.113.7`, `::1`) or CIDR ranges
//! (`10.0.0.0/8`, `2001:db8::/32`). Malformed entries never match.

use std::net::IpAddr;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Allowlist,
    #[default]
    Blocklist,
    /// Allowlist wins, then the blocklist applies.
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Allowlist,
    Blocklist,
    NotInAllowlist,
    /// Matched a built-in bot pattern (User-Agent filter only).
    DefaultBot,
    Default,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::Allowlist => "allowlist",
            FilterReason::Blocklist => "blocklist",
            FilterReason::NotInAllowlist => "not_in_allowlist",
            FilterReason::DefaultBot => "default_bot",
            FilterReason::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow(FilterReason),
    Deny(FilterReason),
}

impl FilterDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterDecision::Allow(_))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpFilter {
    pub enabled: bool,
    pub mode: FilterMode,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
}

impl IpFilter {
    pub fn check(&self, ip: &str) -> FilterDecision {
        if !self.enabled {
            return FilterDecision::Allow(FilterReason::Default);
        }

        let in_allow = || matches_any(ip, &self.allowlist);
        let in_block = || matches_any(ip, &self.blocklist);

        match self.mode {
            FilterMode::Allowlist if in_allow() => FilterDecision::Allow(FilterReason::Allowlist),
            FilterMode::Allowlist => FilterDecision::Deny(FilterReason::NotInAllowlist),
            FilterMode::Blocklist if in_block() => FilterDecision::Deny(FilterReason::Blocklist),
            FilterMode::Blocklist => FilterDecision::Allow(FilterReason::Default),
            FilterMode::Both if in_allow() => FilterDecision::Allow(FilterReason::Allowlist),
            FilterMode::Both if in_block() => FilterDecision::Deny(FilterReason::Blocklist),
            FilterMode::Both => FilterDecision::Allow(FilterReason::Default),
        }
    }
}

fn matches_any(ip: &str, entries: &[String]) -> bool {
    let Ok(addr) = ip.trim().parse::<IpAddr>() else {
        return false;
    };
    entries.iter().any(|entry| matches_entry(addr, entry))
}

fn matches_entry(addr: IpAddr, entry: &str) -> bool {
    let Some((network, prefix)) = entry.split_once('/') else {
        return entry.trim().parse::<IpAddr>().is_ok_and(|exact| exact == addr);
    };
    let (Ok(network), Ok(prefix)) = (network.trim().parse::<IpAddr>(), prefix.trim().parse::<u32>())
    else {
        return false;
    };

    match (addr, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(a) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(n)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(a) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(mode: FilterMode, allow: &[&str], block: &[&str]) -> IpFilter {
        IpFilter {
            enabled: true,
            mode,
            allowlist: allow.iter().map(|s| s.to_string()).collect(),
            blocklist: block.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_filter_allows_everything() {
        let f = IpFilter {
            enabled: false,
            ..filter(FilterMode::Allowlist, &[], &[])
        };
        assert!(f.check("198.51.100.1").is_allowed());
    }

    #[test]
    fn blocklist_matches_exact_and_cidr() {
        let f = filter(FilterMode::Blocklist, &[], &["203.0.113.7", "10.0.0.0/8"]);
        assert_eq!(f.check("203.0.113.7"), FilterDecision::Deny(FilterReason::Blocklist));
        assert_eq!(f.check("10.42.1.1"), FilterDecision::Deny(FilterReason::Blocklist));
        assert_eq!(f.check("11.0.0.1"), FilterDecision::Allow(FilterReason::Default));
    }

    #[test]
    fn allowlist_denies_everything_else() {
        let f = filter(FilterMode::Allowlist, &["192.168.1.0/24"], &[]);
        assert!(f.check("192.168.1.20").is_allowed());
        assert_eq!(
            f.check("192.168.2.20"),
            FilterDecision::Deny(FilterReason::NotInAllowlist)
        );
        assert!(!f.check("not-an-ip").is_allowed());
    }

    #[test]
    fn both_mode_prefers_allowlist() {
        let f = filter(FilterMode::Both, &["10.1.0.0/16"], &["10.0.0.0/8"]);
        assert_eq!(f.check("10.1.2.3"), FilterDecision::Allow(FilterReason::Allowlist));
        assert_eq!(f.check("10.2.2.3"), FilterDecision::Deny(FilterReason::Blocklist));
        assert!(f.check("8.8.8.8").is_allowed());
    }

    #[test]
    fn ipv6_ranges_and_zero_prefix() {
        let f = filter(FilterMode::Blocklist, &[], &["2001:db8::/32"]);
        assert!(!f.check("2001:db8::1").is_allowed());
        assert!(f.check("2001:db9::1").is_allowed());

        let everything = filter(FilterMode::Blocklist, &[], &["0.0.0.0/0"]);
        assert!(!everything.check("1.2.3.4").is_allowed());
    }
}
