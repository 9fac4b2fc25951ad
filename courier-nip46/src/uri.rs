// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `bunker://` and `nostrconnect://` pairing URIs.
use nostr_sdk::prelude::*;
use rand::RngCore;

use courier_core::relay::check_relay_url;
use courier_core::{CourierError, Result};

const BUNKER_SCHEME: &str = "bunker://";
const NOSTRCONNECT_SCHEME: &str = "nostrconnect://";

/// Random 32-byte hex pairing secret.
pub fn generate_pairing_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Signer-initiated pairing: the remote signer publishes this and the
/// client connects to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    pub signer: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(BUNKER_SCHEME)
            .ok_or_else(|| CourierError::invalid_input("bunker URI must start with bunker://"))?;
        let (key_part, query) = rest.split_once('?').unwrap_or((rest, ""));

        let signer = PublicKey::from_hex(key_part)
            .or_else(|_| PublicKey::from_bech32(key_part))
            .map_err(|e| CourierError::invalid_input(format!("invalid signer key: {e}")))?;

        let params = parse_query(query)?;
        let relays = relay_params(&params)?;
        let secret = params
            .iter()
            .find(|(k, _)| k == "secret")
            .map(|(_, v)| v.clone());

        Ok(Self {
            signer,
            relays,
            secret,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut uri = format!("{BUNKER_SCHEME}{}", self.signer.to_hex());
        let mut sep = '?';
        for relay in &self.relays {
            uri.push_str(&format!("{sep}relay={}", urlencoding::encode(relay)));
            sep = '&';
        }
        if let Some(secret) = &self.secret {
            uri.push_str(&format!("{sep}secret={}", urlencoding::encode(secret)));
        }
        uri
    }
}

/// Client-initiated pairing: shown to the user (usually as a QR code) and
/// scanned by the companion app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrConnectUri {
    pub client: PublicKey,
    pub relays: Vec<String>,
    pub secret: String,
    pub name: Option<String>,
    pub perms: Vec<String>,
}

impl NostrConnectUri {
    pub fn new(client: PublicKey, relays: Vec<String>, secret: impl Into<String>) -> Self {
        Self {
            client,
            relays,
            secret: secret.into(),
            name: None,
            perms: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_perms<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.perms = perms.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_uri(&self) -> String {
        let mut uri = format!("{NOSTRCONNECT_SCHEME}{}", self.client.to_hex());
        let mut sep = '?';
        for relay in &self.relays {
            uri.push_str(&format!("{sep}relay={}", urlencoding::encode(relay)));
            sep = '&';
        }
        uri.push_str(&format!("{sep}secret={}", urlencoding::encode(&self.secret)));
        if !self.perms.is_empty() {
            uri.push_str(&format!("&perms={}", urlencoding::encode(&self.perms.join(","))));
        }
        if let Some(name) = &self.name {
            uri.push_str(&format!("&name={}", urlencoding::encode(name)));
        }
        uri
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix(NOSTRCONNECT_SCHEME).ok_or_else(|| {
            CourierError::invalid_input("nostrconnect URI must start with nostrconnect://")
        })?;
        let (key_part, query) = rest.split_once('?').unwrap_or((rest, ""));
        let client = PublicKey::from_hex(key_part)
            .map_err(|e| CourierError::invalid_input(format!("invalid client key: {e}")))?;

        let params = parse_query(query)?;
        let relays = relay_params(&params)?;
        let find = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        let secret = find("secret")
            .ok_or_else(|| CourierError::invalid_input("nostrconnect URI requires a secret"))?;
        let perms = find("perms")
            .map(|p| {
                p.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            client,
            relays,
            secret,
            name: find("name"),
            perms,
        })
    }
}

fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            let value = urlencoding::decode(v)
                .map_err(|e| CourierError::invalid_input(format!("bad {k} parameter: {e}")))?;
            Ok((k.to_string(), value.into_owned()))
        })
        .collect()
}

fn relay_params(params: &[(String, String)]) -> Result<Vec<String>> {
    let relays: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "relay")
        .map(|(_, v)| v.clone())
        .collect();
    if relays.is_empty() {
        return Err(CourierError::invalid_input("missing relay parameter"));
    }
    for relay in &relays {
        check_relay_url(relay)?;
    }
    Ok(relays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bunker_uri_roundtrip_with_special_secret() {
        let signer = Keys::generate().public_key();
        let uri = BunkerUri {
            signer,
            relays: vec!["wss://relay.damus.io".into(), "wss://nos.lol".into()],
            secret: Some("pass&word=special chars+more".into()),
        };
        let text = uri.to_uri();
        assert!(!text.contains("pass&word"));
        assert_eq!(BunkerUri::parse(&text).unwrap(), uri);
    }

    #[test]
    fn test_bunker_accepts_npub() {
        let signer = Keys::generate().public_key();
        let text = format!(
            "bunker://{}?relay=wss%3A%2F%2Frelay.damus.io",
            signer.to_bech32().unwrap()
        );
        let parsed = BunkerUri::parse(&text).unwrap();
        assert_eq!(parsed.signer, signer);
        assert_eq!(parsed.secret, None);
    }

    #[test]
    fn test_bunker_rejects_bad_relays() {
        let signer = Keys::generate().public_key().to_hex();
        assert!(BunkerUri::parse(&format!("bunker://{signer}")).is_err());
        assert!(BunkerUri::parse(&format!("bunker://{signer}?relay=ws%3A%2F%2Flocalhost")).is_err());
        assert!(BunkerUri::parse("nostrconnect://abc").is_err());
    }

    #[test]
    fn test_nostrconnect_uri() {
        let client = Keys::generate().public_key();
        let secret = generate_pairing_secret();
        let uri = NostrConnectUri::new(client, vec!["wss://relay.nsec.app".into()], &secret)
            .with_name("Courier")
            .with_perms(["sign_event:14", "nip44_encrypt"]);

        let text = uri.to_uri();
        assert!(text.starts_with("nostrconnect://"));
        let parsed = NostrConnectUri::parse(&text).unwrap();
        assert_eq!(parsed, uri);
        assert_eq!(parsed.secret.len(), 64);
    }
}
