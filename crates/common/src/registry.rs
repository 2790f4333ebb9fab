//! Static registry of the mainnet relays we collect from, the relays that
//! publish bid adjustments, and the known auxiliary builder wallets tracked
//! alongside the fee recipient.

use alloy_primitives::{address, Address};

/// Data API path shared by every MEV-Boost relay.
pub const PAYLOADS_DELIVERED_PATH: &str = "/relay/v1/data/bidtraces/proposer_payload_delivered";

pub const DEFAULT_PAGE_LIMIT: u64 = 200;

/// One collectable relay. The host doubles as the storage identifier; any
/// display name is a presentation concern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayEntry {
    pub host: &'static str,
    /// Maximum `limit` accepted by the relay's data API.
    pub page_limit: u64,
    /// Token-bucket refill rate, requests per second.
    pub requests_per_sec: f64,
    /// Token-bucket burst capacity.
    pub burst: u32,
}

const fn relay(host: &'static str, page_limit: u64) -> RelayEntry {
    RelayEntry { host, page_limit, requests_per_sec: 2.0, burst: 4 }
}

/// Mainnet relays, in registry order. Aggregate `relays` arrays preserve the
/// order payloads were inserted, which follows this registry on the live path.
pub static MAINNET_RELAYS: &[RelayEntry] = &[
    relay("relay-analytics.ultrasound.money", DEFAULT_PAGE_LIMIT),
    relay("bloxroute.max-profit.blxrbdn.com", 100),
    relay("bloxroute.regulated.blxrbdn.com", 100),
    relay("titanrelay.xyz", 100),
    relay("agnostic-relay.net", 100),
    relay("aestus.live", 100),
    relay("boost-relay.flashbots.net", DEFAULT_PAGE_LIMIT),
    relay("relay.ethgas.com", DEFAULT_PAGE_LIMIT),
    relay("relay.btcs.com", DEFAULT_PAGE_LIMIT),
    relay("relay.wenmerge.com", DEFAULT_PAGE_LIMIT),
    relay("mainnet-relay.securerpc.com", DEFAULT_PAGE_LIMIT),
];

pub fn relay_entry(host: &str) -> Option<&'static RelayEntry> {
    MAINNET_RELAYS.iter().find(|r| r.host == host)
}

/// The relay subset publishing post-hoc bid adjustments. Currently one.
pub const ULTRASOUND_RELAY: &str = "relay-analytics.ultrasound.money";
pub const ULTRASOUND_ADJUSTMENTS_PATH: &str = "/ultrasound/v1/data/adjustments";

/// Auxiliary wallets of a builder operation, tracked per block in addition
/// to the fee recipient. BuilderNet routes refunds through separate wallets,
/// so an apparent fee-recipient loss can be offset by inflows here.
#[derive(Debug, Clone, Copy)]
pub struct AuxiliaryBuilderSet {
    /// Fee recipient the builder proposes with.
    pub fee_recipient: Address,
    pub auxiliary: &'static [Address],
}

pub static KNOWN_AUXILIARY_BUILDERS: &[AuxiliaryBuilderSet] = &[
    // BuilderNet (ex beaverbuild)
    AuxiliaryBuilderSet {
        fee_recipient: address!("95222290dd7278aa3ddd389cc1e1d165cc4bafe5"),
        auxiliary: &[
            address!("9f4cf329f4cf376b7aded854d6054859dd102a2a"),
            address!("8d5998a27b3cdf33479b65b18f075e20a7aa05b9"),
        ],
    },
    // BuilderNet (Flashbots instance)
    AuxiliaryBuilderSet {
        fee_recipient: address!("dafea492d9c6733ae3d56b7ed1adb60692c98bc5"),
        auxiliary: &[address!("9f4cf329f4cf376b7aded854d6054859dd102a2a")],
    },
    // Titan collateral wallet
    AuxiliaryBuilderSet {
        fee_recipient: address!("dadb0d80178819f2319190d340ce9a924f783711"),
        auxiliary: &[address!("44eb896dccb8b8743a60a4dfdff71a9fa1a57467")],
    },
];

/// Auxiliary wallets tracked for a fee recipient; empty for builders without
/// a known auxiliary set.
pub fn auxiliary_addresses_for(fee_recipient: &Address) -> &'static [Address] {
    KNOWN_AUXILIARY_BUILDERS
        .iter()
        .find(|set| set.fee_recipient == *fee_recipient)
        .map(|set| set.auxiliary)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_hosts_are_unique() {
        let mut hosts: Vec<_> = MAINNET_RELAYS.iter().map(|r| r.host).collect();
        hosts.sort_unstable();
        hosts.dedup();
        assert_eq!(hosts.len(), MAINNET_RELAYS.len());
    }

    #[test]
    fn adjustment_relay_is_registered() {
        assert!(relay_entry(ULTRASOUND_RELAY).is_some());
    }

    #[test]
    fn unknown_fee_recipient_has_no_auxiliaries() {
        assert!(auxiliary_addresses_for(&Address::ZERO).is_empty());
    }

    #[test]
    fn buildernet_auxiliaries_are_tracked() {
        let fee_recipient = address!("95222290dd7278aa3ddd389cc1e1d165cc4bafe5");
        assert_eq!(auxiliary_addresses_for(&fee_recipient).len(), 2);
    }
}
