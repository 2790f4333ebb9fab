//! Builder name parsing and canonicalization.
//!
//! Builders tag their blocks through `extra_data`: domains, slogans, emoji,
//! version strings. Everything funnels into a canonical name so one operator
//! doesn't show up as five rows in a dashboard.

use lazy_static::lazy_static;
use regex::Regex;

/// Maps observed builder tags to canonical names. Keep keys exactly as they
/// appear after cleaning.
pub static BUILDER_NAME_MAPPING: &[(&str, &str)] = &[
    // Titan
    ("titanbuilder.xyz", "Titan"),
    ("Titan (titanbuilder.xyz)", "Titan"),
    ("titanbuilder", "Titan"),
    // BuilderNet instances
    ("Flashbots", "BuilderNet (Flashbots)"),
    ("Beaver", "BuilderNet (Beaver)"),
    ("Nethermind", "BuilderNet (Nethermind)"),
    ("BuilderNet (Beaver)", "BuilderNet (Beaver)"),
    ("beaverbuild.org", "BuilderNet (Beaver)"),
    ("beaverbuild", "BuilderNet (Beaver)"),
    // Quasar
    ("quasar.win", "Quasar"),
    // Rsync
    ("rsyncbuilder", "Rsync"),
    ("rsync-builder.xyz", "Rsync"),
    ("rsync-builder", "Rsync"),
    // Bob The Builder
    ("bobTheBuilder.xyz", "Bob The Builder"),
    ("bobthebuilder.xyz", "Bob The Builder"),
    // builder0x69
    ("by @builder", "0x69"),
    ("by builder", "0x69"),
    ("builder0x69", "0x69"),
    ("By @builder0x69", "0x69"),
    // IO Builder
    ("iobuilder.xyz", "IO Builder"),
    // Eureka
    ("eurekabuilder.xyz", "Eureka"),
    // Bitget
    ("www.bitget.com", "Bitget"),
    ("bitget.com", "Bitget"),
    // Turbo
    ("rpc.turbobuilder.xyz", "Turbo"),
    ("turbobuilder.xyz", "Turbo"),
    // BTCS
    ("Builder+ btcs.com | ethgas.com", "BTCS"),
    // DexPeer
    ("DexPeer Builder", "DexPeer"),
    // BuildAI
    ("buildai.net", "BuildAI"),
    // Snail
    ("snailbuilder.sh", "Snail"),
    // Penguin
    ("penguinbuild.org", "Penguin"),
    ("penguinbuild", "Penguin"),
    // JetBuilder
    ("jetbldr.xyz", "JetBuilder"),
    ("jetbldr.eth", "JetBuilder"),
    // f1b
    ("f1b.io", "f1b"),
    // Payload
    ("payload.de", "Payload"),
    ("payload", "Payload"),
    // Loki
    ("lokibuilder.xyz", "Loki"),
    // Boba
    ("boba-builder.com", "Boba"),
    // Gambit
    ("gambitlabs.fi", "Gambit"),
    // Blocksmith
    ("blocksmith.org", "Blocksmith"),
    // Eden
    ("edennetwork.io", "Eden"),
    ("eden-builder", "Eden"),
    // Manifold
    ("manifoldfinance.com", "Manifold"),
    ("mfblocks", "Manifold"),
    // Lightspeed
    ("lightspeedbuilder.info", "Lightspeed"),
    // SmithBot
    ("smithbot.xyz", "SmithBot"),
    // TBuilder
    ("tbuilder.xyz", "TBuilder"),
    // bloXroute
    ("bloxroute", "bloXroute"),
    ("bloxroute.max.profit", "bloXroute"),
    ("bloxroute.regulated", "bloXroute"),
    // Besu development builds
    ("besu-develop-", "besu"),
    ("besu-develop-e", "besu"),
    // Generic or troll tags
    ("builder", "unknown"),
    ("MevRefund -", "unknown"),
    ("", "unknown"),
];

lazy_static! {
    static ref PAREN_RE: Regex = Regex::new(r"\(([^)]+)\)").unwrap();
    static ref DOMAIN_RE: Regex = Regex::new(
        r"^([a-zA-Z0-9]+(?:[._-][a-zA-Z0-9]+)*\.(?:com|net|org|io|win|xyz|eth|pool|info|co|uk|de|fr|cn|jp))"
    )
    .unwrap();
    static ref VERSION_RE: Regex = Regex::new(r"(?i)\s+v?\d+\.\d+(?:\.\d+)*\.?").unwrap();
    static ref EDGE_PUNCT_RE: Regex = Regex::new(r"^[^a-zA-Z0-9]+|[^a-zA-Z0-9.]+$").unwrap();
    static ref TRAILING_SUFFIX_RE: Regex = Regex::new(r"[0-9]+[a-z0-9]*$").unwrap();
}

fn mapped(name: &str) -> Option<&'static str> {
    BUILDER_NAME_MAPPING.iter().find(|(key, _)| *key == name).map(|(_, canonical)| *canonical)
}

/// Canonicalizes an already-clean builder name. Used for names read back
/// from storage and for the canonical-table round trip.
pub fn normalize_builder_name(name: &str) -> String {
    clean_builder_name(name, false)
}

pub fn clean_builder_name(name: &str, advanced: bool) -> String {
    if name.is_empty() {
        return "unknown".to_string();
    }

    let lowered = name.to_lowercase();
    // geth variants are the default client tag, not a builder identity
    if lowered.contains("geth") {
        return "unknown".to_string();
    }
    if lowered.contains("btcs") {
        return "BTCS".to_string();
    }

    let cleaned = if advanced { advanced_clean(name) } else { name.to_string() };

    mapped(&cleaned).map(str::to_string).unwrap_or(cleaned)
}

/// Emoji removal, domain extraction and version stripping for raw
/// extra-data tags.
fn advanced_clean(name: &str) -> String {
    let mut cleaned: String =
        name.chars().filter(|c| c.is_ascii() && !c.is_ascii_control()).collect();
    cleaned = cleaned.trim().to_string();

    // multi-phrase tags: keep the first phrase
    if let Some(first) = cleaned.split(',').next() {
        cleaned = first.trim().to_string();
    }

    // "Quasar (quasar.win)" -> "quasar.win"
    if let Some(captures) = PAREN_RE.captures(&cleaned) {
        cleaned = captures[1].to_string();
    }

    // "EU2/pool.binance.com/" -> "pool.binance.com"
    if cleaned.contains('/') {
        if let Some(last) = cleaned.split('/').filter(|p| !p.is_empty()).last() {
            cleaned = last.to_string();
        }
    }

    if cleaned.contains('.') {
        if let Some(domain) = DOMAIN_RE.captures(&cleaned) {
            cleaned = domain[1].to_string();
        }
    }

    cleaned = VERSION_RE.replace_all(&cleaned, "").to_string();
    cleaned = EDGE_PUNCT_RE.replace_all(&cleaned, "").to_string();
    cleaned = TRAILING_SUFFIX_RE.replace(&cleaned, "").to_string();
    cleaned = cleaned.trim().to_string();

    if cleaned.len() <= 1 {
        return "unknown".to_string();
    }
    cleaned
}

/// Parses a canonical builder name out of a block's raw extra data.
pub fn parse_builder_name_from_extra_data(extra_data: &[u8]) -> String {
    if extra_data.is_empty() {
        return "unknown".to_string();
    }

    let decoded = String::from_utf8_lossy(extra_data);
    let stripped: String = decoded.chars().filter(|c| *c != '\0' && *c != '\u{fffd}').collect();

    let cleaned = clean_builder_name(stripped.trim(), true);
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_round_trip() {
        for (_, canonical) in BUILDER_NAME_MAPPING {
            assert_eq!(
                normalize_builder_name(canonical),
                *canonical,
                "canonical name {canonical} must normalize to itself"
            );
        }
    }

    #[test]
    fn domains_map_to_canonical_names() {
        assert_eq!(parse_builder_name_from_extra_data(b"beaverbuild.org"), "BuilderNet (Beaver)");
        assert_eq!(parse_builder_name_from_extra_data(b"Titan (titanbuilder.xyz)"), "Titan");
        assert_eq!(parse_builder_name_from_extra_data(b"rsync-builder.xyz"), "Rsync");
    }

    #[test]
    fn geth_variants_are_unknown() {
        assert_eq!(parse_builder_name_from_extra_data(b"geth/v1.13.0"), "unknown");
        assert_eq!(parse_builder_name_from_extra_data(b"Geth/v1.11.6/linux-amd64"), "unknown");
        assert_eq!(parse_builder_name_from_extra_data(b"go-ethereum-geth"), "unknown");
    }

    #[test]
    fn version_suffixes_are_stripped() {
        assert_eq!(clean_builder_name("reth v1.0.3", true), "reth");
        assert_eq!(clean_builder_name("Nethermind v1.25.4", true), "BuilderNet (Nethermind)");
    }

    #[test]
    fn emoji_and_nulls_are_dropped() {
        let raw: &[u8] = "\u{1f984} titanbuilder.xyz\0\0".as_bytes();
        assert_eq!(parse_builder_name_from_extra_data(raw), "Titan");
    }

    #[test]
    fn empty_and_binary_extra_data_is_unknown() {
        assert_eq!(parse_builder_name_from_extra_data(b""), "unknown");
        assert_eq!(parse_builder_name_from_extra_data(&[0x00, 0x00, 0x00]), "unknown");
        assert_eq!(parse_builder_name_from_extra_data(&[0xff, 0xfe, 0x01]), "unknown");
    }

    #[test]
    fn slash_paths_keep_the_last_segment() {
        assert_eq!(clean_builder_name("EU2/pool.binance.com/", true), "pool.binance.com");
    }

    #[test]
    fn unmapped_clean_tokens_pass_through() {
        assert_eq!(parse_builder_name_from_extra_data(b"coolbuilder.org"), "coolbuilder.org");
    }

    #[test]
    fn btcs_matches_anywhere() {
        assert_eq!(clean_builder_name("Builder+ btcs.com | ethgas.com", true), "BTCS");
    }
}
