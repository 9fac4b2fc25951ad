// SPDX-FileCopyrightText: (C) 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CourierError, Result};

/// Maximum relays carried in one inbox advertisement.
pub const MAX_INBOX_RELAYS: usize = 20;

/// Maximum length of a relay URL.
pub const MAX_RELAY_URL_LENGTH: usize = 256;

/// Version byte mixed into geohash relay scoring. Bumping it reshuffles
/// every geohash assignment.
pub const GEO_SCHEMA_VERSION: u8 = 1;

/// Default relays used when nothing better is known.
pub fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.primal.net/".into(),
        "wss://relay.nsec.app/".into(),
        "wss://relay.damus.io/".into(),
        "wss://nos.lol/".into(),
    ]
}

/// Validate a relay URL.
///
/// Returns Ok(()) if the URL is a valid wss:// URL pointing to a public host.
pub fn validate_relay_url(url: &str) -> std::result::Result<(), String> {
    if url.len() > MAX_RELAY_URL_LENGTH {
        return Err("URL too long".into());
    }

    let rest = url
        .strip_prefix("wss://")
        .ok_or("Must use wss:// protocol")?;

    if rest.is_empty() {
        return Err("Missing host".into());
    }

    let host_port = rest.split('/').next().unwrap_or(rest);
    let host = match host_port.rfind(':') {
        Some(colon_pos) if !host_port.ends_with(']') => {
            let port_str = &host_port[colon_pos + 1..];
            match port_str.parse::<u16>() {
                Ok(0) | Err(_) => return Err("Invalid port".into()),
                Ok(_) => &host_port[..colon_pos],
            }
        }
        _ => host_port,
    };

    if host.is_empty() {
        return Err("Missing host".into());
    }

    if !host.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '[' || c == ']' || c == ':'
    }) {
        return Err("Invalid host characters".into());
    }

    if is_internal_host(host) {
        return Err("Internal addresses not allowed".into());
    }

    Ok(())
}

/// Same as [`validate_relay_url`] but in the crate error type.
pub fn check_relay_url(url: &str) -> Result<()> {
    validate_relay_url(url).map_err(|reason| CourierError::InvalidRelayUrl {
        url: url.to_string(),
        reason,
    })
}

/// Canonical form used for deduplication: lowercase scheme and host, a
/// trailing slash on bare hosts.
pub fn normalize_relay_url(url: &str) -> String {
    let trimmed = url.trim();
    let Some(rest) = trimmed.strip_prefix("wss://") else {
        return trimmed.to_string();
    };
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    format!("wss://{}{}", host.to_ascii_lowercase(), path)
}

/// Order-preserving union of relay lists, dropping duplicates after
/// normalization.
pub fn merge_relays<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for list in lists {
        for url in list {
            let normalized = normalize_relay_url(url);
            if seen.insert(normalized.clone()) {
                merged.push(normalized);
            }
        }
    }
    merged
}

/// Validate, normalize and deduplicate `urls`, keeping at most `max`.
/// Invalid entries are dropped.
pub fn sanitize_relays(urls: &[String], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .map(|u| normalize_relay_url(u))
        .filter(|u| validate_relay_url(u).is_ok())
        .filter(|u| seen.insert(u.clone()))
        .take(max)
        .collect()
}

fn is_internal_host(host: &str) -> bool {
    let host = host.to_lowercase();

    const FORBIDDEN: &[&str] = &[
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "::1",
        "[::1]",
        "169.254.169.254",
    ];

    FORBIDDEN.contains(&host.as_str())
        || host.ends_with(".local")
        || host.ends_with(".localhost")
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("169.254.")
        || is_private_172(host.as_str())
}

fn is_private_172(host: &str) -> bool {
    host.strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|s| s.parse::<u8>().ok())
        .is_some_and(|octet| (16..=31).contains(&octet))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Unknown,
    Community,
    Verified,
}

/// A relay known to serve a region, with the operator's trust tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRelay {
    pub url: String,
    pub tier: TrustTier,
}

/// Deterministic relay set for a geohash cell.
///
/// Every candidate is scored with `sha256(version || geohash || url)` and the
/// `count` lowest scores win, so all clients agree on the set for a cell
/// without coordination. `min_tier` drops lower-tier relays before scoring.
pub fn select_geohash_relays(
    geohash: &str,
    candidates: &[GeoRelay],
    count: usize,
    min_tier: Option<TrustTier>,
) -> Vec<String> {
    let geohash = geohash.to_ascii_lowercase();
    let mut seen = HashSet::new();
    let mut scored: Vec<([u8; 32], String)> = candidates
        .iter()
        .filter(|r| min_tier.is_none_or(|tier| r.tier >= tier))
        .map(|r| normalize_relay_url(&r.url))
        .filter(|url| seen.insert(url.clone()))
        .map(|url| (geohash_score(&geohash, &url), url))
        .collect();

    scored.sort();
    scored.into_iter().take(count).map(|(_, url)| url).collect()
}

fn geohash_score(geohash: &str, url: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([GEO_SCHEMA_VERSION]);
    hasher.update(geohash.as_bytes());
    hasher.update(url.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo(url: &str, tier: TrustTier) -> GeoRelay {
        GeoRelay {
            url: url.into(),
            tier,
        }
    }

    #[test]
    fn test_valid_relays() {
        for url in default_relays() {
            assert!(validate_relay_url(&url).is_ok(), "{url}");
        }
        assert!(validate_relay_url("wss://relay.example.com:443/path").is_ok());
    }

    #[test]
    fn test_rejects_internal_and_plain() {
        assert!(validate_relay_url("ws://relay.damus.io").is_err());
        assert!(validate_relay_url("wss://localhost:7777").is_err());
        assert!(validate_relay_url("wss://10.0.0.4").is_err());
        assert!(validate_relay_url("wss://172.20.1.1").is_err());
        assert!(validate_relay_url("wss://172.32.1.1").is_ok());
        assert!(validate_relay_url("wss://relay.example.com:0").is_err());
        assert!(validate_relay_url("wss://").is_err());
    }

    #[test]
    fn test_merge_dedupes_after_normalization() {
        let a = vec!["wss://Relay.Damus.io".to_string(), "wss://nos.lol/".into()];
        let b = vec!["wss://relay.damus.io/".to_string()];
        let merged = merge_relays([a.as_slice(), b.as_slice()]);
        assert_eq!(merged, vec!["wss://relay.damus.io/", "wss://nos.lol/"]);
    }

    #[test]
    fn test_sanitize_caps_and_filters() {
        let mut urls: Vec<String> = (0..30).map(|i| format!("wss://r{i}.example.com")).collect();
        urls.insert(0, "http://bad.example.com".into());
        urls.insert(1, "wss://r0.example.com/".into());

        let clean = sanitize_relays(&urls, MAX_INBOX_RELAYS);
        assert_eq!(clean.len(), MAX_INBOX_RELAYS);
        assert_eq!(clean[0], "wss://r0.example.com/");
        assert_eq!(clean[1], "wss://r1.example.com/");
    }

    #[test]
    fn test_geohash_selection_is_deterministic() {
        let candidates: Vec<GeoRelay> = (0..12)
            .map(|i| geo(&format!("wss://geo{i}.example.com/"), TrustTier::Community))
            .collect();

        let first = select_geohash_relays("u4pruyd", &candidates, 4, None);
        let mut reversed = candidates.clone();
        reversed.reverse();
        let second = select_geohash_relays("u4pruyd", &reversed, 4, None);

        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn test_geohash_selection_respects_tier() {
        let candidates = vec![
            geo("wss://a.example.com/", TrustTier::Unknown),
            geo("wss://b.example.com/", TrustTier::Verified),
            geo("wss://c.example.com/", TrustTier::Community),
        ];

        let picked = select_geohash_relays("9q8yy", &candidates, 5, Some(TrustTier::Community));
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&"wss://a.example.com/".to_string()));
    }
}
