//! The Exclusion Filter (EF): a compiled, bitmask-form CIDR deny-list plus
//! onion and private-address policy. Stateless after load — every check is a
//! pure function of the address and the currently published rule set.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::endpoint::Address;

/// A compiled `(network, netmask)` pair for one address family. Matching a
/// candidate is a single AND-and-compare: `addr & netmask == network`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rule<T> {
    network: T,
    netmask: T,
}

/// The compiled deny-list for both address families. `None` for a family
/// means "not yet loaded" and is distinct from `Some(vec![])` ("loaded, and
/// empty"): the former fails closed (§4.1 rule 3), the latter does not
/// exclude anything by network membership.
#[derive(Clone, Debug, Default)]
pub struct ExclusionRuleSet {
    ipv4: Option<Vec<Rule<u32>>>,
    ipv6: Option<Vec<Rule<u128>>>,
}

impl ExclusionRuleSet {
    /// An unloaded rule set: every non-onion, non-private address is
    /// excluded (fail-closed) until [`ExclusionRuleSet::compile`] runs.
    pub fn unloaded() -> Self {
        ExclusionRuleSet {
            ipv4: None,
            ipv6: None,
        }
    }

    /// Compiles the static config networks combined with any bogon-list text
    /// already fetched by the caller (PC-CTL does the fetching; this
    /// function only parses).
    pub fn compile(
        static_ipv4: &[String],
        static_ipv6: &[String],
        bogon_ipv4_texts: &[String],
        bogon_ipv6_texts: &[String],
    ) -> Self {
        let mut ipv4 = parse_ipv4_lines(static_ipv4);
        for text in bogon_ipv4_texts {
            ipv4.extend(parse_ipv4_lines(&split_lines(text)));
        }
        let mut ipv6 = parse_ipv6_lines(static_ipv6);
        for text in bogon_ipv6_texts {
            ipv6.extend(parse_ipv6_lines(&split_lines(text)));
        }
        ExclusionRuleSet {
            ipv4: Some(ipv4),
            ipv6: Some(ipv6),
        }
    }

    pub fn ipv4_rule_count(&self) -> Option<usize> {
        self.ipv4.as_ref().map(Vec::len)
    }

    pub fn ipv6_rule_count(&self) -> Option<usize> {
        self.ipv6.as_ref().map(Vec::len)
    }

    /// Encodes the compiled rule lists for publication at
    /// `exclude-ipv4-networks`/`exclude-ipv6-networks` (§6), so slaves can
    /// rebuild an identical [`ExclusionRuleSet`] without re-fetching bogon
    /// URLs themselves. A family that hasn't been loaded yet encodes as
    /// `None`, distinct from an empty, loaded list.
    pub fn to_store_values(&self) -> (Option<String>, Option<String>) {
        let v4 = self.ipv4.as_ref().map(|rules| {
            let pairs: Vec<(u32, u32)> = rules.iter().map(|r| (r.network, r.netmask)).collect();
            serde_json::to_string(&pairs).expect("u32 pairs always serialize")
        });
        let v6 = self.ipv6.as_ref().map(|rules| {
            let pairs: Vec<(u128, u128)> = rules.iter().map(|r| (r.network, r.netmask)).collect();
            serde_json::to_string(&pairs).expect("u128 pairs always serialize")
        });
        (v4, v6)
    }

    /// The inverse of [`ExclusionRuleSet::to_store_values`]. A missing or
    /// undecodable value leaves that family unloaded (fail-closed, per the
    /// coordination-error policy in §7: reads degrade to "missing").
    pub fn from_store_values(ipv4_raw: Option<&str>, ipv6_raw: Option<&str>) -> Self {
        let ipv4 = ipv4_raw.and_then(|raw| serde_json::from_str::<Vec<(u32, u32)>>(raw).ok()).map(
            |pairs| {
                pairs
                    .into_iter()
                    .map(|(network, netmask)| Rule { network, netmask })
                    .collect()
            },
        );
        let ipv6 = ipv6_raw.and_then(|raw| serde_json::from_str::<Vec<(u128, u128)>>(raw).ok()).map(
            |pairs| {
                pairs
                    .into_iter()
                    .map(|(network, netmask)| Rule { network, netmask })
                    .collect()
            },
        );
        ExclusionRuleSet { ipv4, ipv6 }
    }
}

/// The compiled `<network>/<prefix>` string for the CIDR rate-limiter's
/// pass-scoped counter key (§3 "CIDR Counter", §4.4 step 6). Shares the same
/// netmask math as rule compilation, just projected back to text.
pub fn ipv6_network_key(addr: &Ipv6Addr, prefix: u8) -> String {
    let netmask: u128 = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
    let network = u128::from(*addr) & netmask;
    format!("{}/{prefix}", Ipv6Addr::from(network))
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Strips `#`/`;` comments and surrounding whitespace; unparseable lines are
/// silently skipped, per §4.1.
fn strip_comment(line: &str) -> &str {
    let line = line.split('#').next().unwrap_or("");
    let line = line.split(';').next().unwrap_or("");
    line.trim()
}

fn parse_cidr_ipv4(line: &str) -> Option<(u32, u32)> {
    let (addr, prefix) = line.split_once('/').unwrap_or((line, "32"));
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let netmask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = u32::from(addr) & netmask;
    Some((network, netmask))
}

fn parse_cidr_ipv6(line: &str) -> Option<(u128, u128)> {
    let (addr, prefix) = line.split_once('/').unwrap_or((line, "128"));
    let addr: Ipv6Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 128 {
        return None;
    }
    let netmask: u128 = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    };
    let network = u128::from(addr) & netmask;
    Some((network, netmask))
}

fn parse_ipv4_lines(lines: &[String]) -> Vec<Rule<u32>> {
    lines
        .iter()
        .map(|l| strip_comment(l))
        .filter(|l| !l.is_empty())
        .filter_map(parse_cidr_ipv4)
        .map(|(network, netmask)| Rule { network, netmask })
        .collect()
}

fn parse_ipv6_lines(lines: &[String]) -> Vec<Rule<u128>> {
    lines
        .iter()
        .map(|l| strip_comment(l))
        .filter(|l| !l.is_empty())
        .filter_map(parse_cidr_ipv6)
        .map(|(network, netmask)| Rule { network, netmask })
        .collect()
}

/// RFC1918/loopback/link-local/multicast/documentation/unspecified check.
/// Implemented explicitly (rather than relying on the still-unstable
/// `Ipv6Addr::is_unique_local` etc.) so behavior doesn't depend on toolchain
/// version.
fn is_private_or_reserved(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => {
            let o = a.octets();
            a.is_loopback()
                || a.is_link_local()
                || a.is_multicast()
                || a.is_unspecified()
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 192 && o[1] == 0 && o[2] == 2) // TEST-NET-1
                || (o[0] == 198 && o[1] == 51 && o[2] == 100) // TEST-NET-2
                || (o[0] == 203 && o[1] == 0 && o[2] == 113) // TEST-NET-3
        }
        IpAddr::V6(a) => {
            let seg = a.segments();
            a.is_loopback()
                || a.is_multicast()
                || a.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (seg[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
                || (seg[0] == 0x2001 && seg[1] == 0x0db8) // 2001:db8::/32 documentation
        }
    }
}

/// `is_excluded(address) -> bool`, per the priority order in §4.1:
/// 1. onion => not excluded
/// 2. private/reserved => excluded
/// 3. family rules not loaded => excluded (fail-closed)
/// 4. unparsable in family => excluded
/// 5. matches a compiled rule => excluded
/// 6. otherwise => not excluded
pub fn is_excluded(address: &Address, rules: &ExclusionRuleSet, warn_once: &AtomicBool) -> bool {
    let Address::Onion(_) = address else {
        let ip: IpAddr = match address {
            Address::V4(a) => IpAddr::V4(*a),
            Address::V6(a) => IpAddr::V6(*a),
            Address::Onion(_) => unreachable!(),
        };

        if is_private_or_reserved(ip) {
            return true;
        }

        return match ip {
            IpAddr::V4(a) => match &rules.ipv4 {
                None => {
                    warn_unloaded(warn_once, "ipv4");
                    true
                }
                Some(list) => {
                    let bits = u32::from(a);
                    list.iter().any(|r| bits & r.netmask == r.network)
                }
            },
            IpAddr::V6(a) => match &rules.ipv6 {
                None => {
                    warn_unloaded(warn_once, "ipv6");
                    true
                }
                Some(list) => {
                    let bits = u128::from(a);
                    list.iter().any(|r| bits & r.netmask == r.network)
                }
            },
        };
    };
    false
}

fn warn_unloaded(warn_once: &AtomicBool, family: &str) {
    if warn_once
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(family, "exclusion rules not yet loaded for family, failing closed");
    }
}

/// A per-holder handle onto the process-level Exclusion Filter.
///
/// Modeled as a single atomically-swapped `Arc<ExclusionRuleSet>` (per the
/// "cyclic/global state" design note): [`ExclusionFilter::publish`] installs a
/// new compiled rule set that every existing handle picks up on its next
/// call, with no partial-update window. Each handle owns its own "already
/// warned about an unloaded family" flag, so the once-per-worker log
/// cadence in §4.1 rule 3 is truly per-worker rather than global.
#[derive(Clone)]
pub struct ExclusionFilter {
    shared: Arc<ArcSwap<ExclusionRuleSet>>,
    warned_ipv4: Arc<AtomicBool>,
}

impl ExclusionFilter {
    pub fn new_shared() -> Arc<ArcSwap<ExclusionRuleSet>> {
        Arc::new(ArcSwap::from_pointee(ExclusionRuleSet::unloaded()))
    }

    pub fn new_handle(shared: Arc<ArcSwap<ExclusionRuleSet>>) -> Self {
        ExclusionFilter {
            shared,
            warned_ipv4: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn publish(&self, rules: ExclusionRuleSet) {
        self.shared.store(Arc::new(rules));
        self.warned_ipv4.store(false, Ordering::Relaxed);
    }

    pub fn is_excluded(&self, address: &Address) -> bool {
        let rules = self.shared.load();
        is_excluded(address, &rules, &self.warned_ipv4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    #[test]
    fn onion_never_excluded_even_when_unloaded() {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        assert!(!filter.is_excluded(&addr("abcdefghijklmnop.onion")));
    }

    #[test]
    fn unloaded_rules_fail_closed() {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        assert!(filter.is_excluded(&addr("8.8.8.8")));
    }

    #[test]
    fn private_ipv4_always_excluded() {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        assert!(filter.is_excluded(&addr("192.168.1.1")));
        assert!(filter.is_excluded(&addr("10.0.0.1")));
        assert!(filter.is_excluded(&addr("127.0.0.1")));
    }

    #[test]
    fn loaded_empty_rules_admit_public_ipv4() {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        assert!(!filter.is_excluded(&addr("8.8.8.8")));
    }

    #[test]
    fn cidr_boundary_matches_inside_not_outside() {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(
            &["5.6.0.0/16".to_string()],
            &[],
            &[],
            &[],
        ));
        assert!(filter.is_excluded(&addr("5.6.7.8")));
        assert!(filter.is_excluded(&addr("5.6.255.255")));
        assert!(!filter.is_excluded(&addr("5.7.0.0")));
    }

    #[test]
    fn comments_and_garbage_lines_are_skipped() {
        let rules = ExclusionRuleSet::compile(
            &[
                "# a comment".to_string(),
                "5.6.0.0/16 ; trailing comment".to_string(),
                "not a cidr".to_string(),
                "".to_string(),
            ],
            &[],
            &[],
            &[],
        );
        assert_eq!(rules.ipv4_rule_count(), Some(1));
    }

    #[test]
    fn bogon_text_is_merged_with_static_list() {
        let rules = ExclusionRuleSet::compile(
            &["5.6.0.0/16".to_string()],
            &[],
            &["9.9.9.0/24\n# comment\n".to_string()],
            &[],
        );
        assert_eq!(rules.ipv4_rule_count(), Some(2));
    }

    proptest::proptest! {
        #[test]
        fn ipv4_cidr_matches_iff_inside_network(host_bits in 0u32..=255, prefix in 8u32..=30, outside_bump in 1u32..=255) {
            // 8.0.0.0/8 is public and unreserved, so this exercises the
            // compiled bitmask match itself rather than the private-address
            // shortcut in rule priority.
            let base: u32 = 8u32 << 24;
            let netmask: u32 = u32::MAX << (32 - prefix);
            let network = base & netmask;
            let inside = network | (host_bits & !netmask);
            let rules = ExclusionRuleSet::compile(
                &[format!("{}/{}", Ipv4Addr::from(network), prefix)],
                &[],
                &[],
                &[],
            );
            let warn = AtomicBool::new(false);
            prop_assert!(is_excluded(&Address::V4(Ipv4Addr::from(inside)), &rules, &warn));

            // The adjacent network of the same prefix size is outside the
            // rule; stays within 8.0.0.0/8 (public, unreserved) as long as
            // the bump doesn't overflow that /8.
            let _ = outside_bump;
            if prefix < 32 && prefix >= 9 {
                let outside_network = network + (1u32 << (32 - prefix));
                if outside_network & 0xff00_0000 == base {
                    let outside_addr = outside_network | (host_bits & !netmask);
                    let warn2 = AtomicBool::new(false);
                    prop_assert!(!is_excluded(&Address::V4(Ipv4Addr::from(outside_addr)), &rules, &warn2));
                }
            }
        }
    }

    #[test]
    fn store_value_round_trips_loaded_rules() {
        let rules = ExclusionRuleSet::compile(&["5.6.0.0/16".to_string()], &["2001:db8::/32".to_string()], &[], &[]);
        let (v4, v6) = rules.to_store_values();
        let restored = ExclusionRuleSet::from_store_values(v4.as_deref(), v6.as_deref());
        assert_eq!(restored.ipv4_rule_count(), Some(1));
        assert_eq!(restored.ipv6_rule_count(), Some(1));
    }

    #[test]
    fn store_value_missing_leaves_family_unloaded() {
        let restored = ExclusionRuleSet::from_store_values(None, None);
        assert_eq!(restored.ipv4_rule_count(), None);
        assert_eq!(restored.ipv6_rule_count(), None);
    }

    #[test]
    fn ipv6_network_key_masks_host_bits() {
        let addr: Ipv6Addr = "2001:db8:1::dead".parse().unwrap();
        assert_eq!(ipv6_network_key(&addr, 32), "2001:db8::/32");
    }
}
