//! Proposer -> entity name lookup. Flat tables keyed by fee recipient and
//! by validator pubkey: most entities route rewards through a stable fee
//! recipient, but some register per-validator recipients, so the pubkey
//! table catches what the address table misses. Collisions resolve to the
//! first entry in table order, which keeps the lookup deterministic
//! (collisions are not expected in practice).

use alloy_primitives::{address, fixed_bytes, Address};
use mevscope_common::BlsPublicKey;

pub static PROPOSER_NAMES: &[(Address, &str)] = &[
    (address!("388c818ca8b9251b393131c08a736a67ccb19297"), "Lido"),
    (address!("4675c7e5baafbffbca748158becba61ef3b0a263"), "Coinbase"),
    (address!("95222290dd7278aa3ddd389cc1e1d165cc4bafe5"), "BuilderNet (Beaver)"),
    (address!("ebec795c9c8bbd61ffc14a6662944748f299cacf"), "Coinbase"),
    (address!("b9d7934878b5fb9610b3fe8a5e441e8fad7e293f"), "Kraken"),
    (address!("d4e96ef8eee8678dbff4d535e033ed1a4f7605b7"), "Rocket Pool"),
    (address!("8b4d32c1aae064eb0ed97ca732b77de28931ffc1"), "Kiln"),
    (address!("f573d99385c05c23b24ed33de13c462f0aedcc5f"), "Figment"),
    (address!("ffee087852cb4898e6c3532e776e68bc68b1143b"), "Binance"),
    (address!("a9289a3dd14fefbcdf1bbf08941ec51c001ddea2"), "Stakefish"),
    (address!("34ea4138580435b5a521e460035edb19df1938c1"), "OKX"),
    (address!("4838b106fce9647bdf1e7877bf73ce8b0bad5f97"), "Titan"),
    (address!("e688b84b23f322a994a53dbf8e15fa82cdb71127"), "Frax"),
    (address!("c6e2459991bfe27cca6d86722f35da23a1e4cb97"), "ether.fi"),
    (address!("d11db2a6d3b4e48a6e97e1c8d8c7b4b34c98bdb2"), "Upbit"),
];

/// Validator pubkeys of entities that register custom per-validator fee
/// recipients, so the address table never sees a stable recipient for them.
pub static PROPOSER_NAMES_BY_PUBKEY: &[(BlsPublicKey, &str)] = &[
    (
        fixed_bytes!("933ad9491b62059dd065b560d256d8957a8c402cc6e8d8ee7290ae11e8f7329267a8811c397529dac52ae1342ba58c95"),
        "Lido",
    ),
    (
        fixed_bytes!("8e8663c5da817c47c98099203c402e48992c4094a7e4c9b13e5ce89213b3c46a3c71613b5b3740a855c4c45493abf7ba"),
        "Rocket Pool",
    ),
    (
        fixed_bytes!("ac3a37ae6c8047b4b467bd978590fe99825de55184f0688b4a275b92dfbe040c41b86eed25c21d43eb5a41be7e9e8e57"),
        "Figment",
    ),
    (
        fixed_bytes!("b82a5e04a517bab45fd53d8878eaf30b59ec201ded0b16109f186fdc0bd9b9f97110fda24d4d6f4dc9c82106f1b1471d"),
        "Kiln",
    ),
];

/// Entity name for a proposer fee recipient, if known.
pub fn proposer_name_for(fee_recipient: &Address) -> Option<&'static str> {
    PROPOSER_NAMES.iter().find(|(address, _)| address == fee_recipient).map(|(_, name)| *name)
}

/// Entity name for a proposer pubkey, if known. The fallback path when the
/// fee recipient is unmapped.
pub fn proposer_name_for_pubkey(pubkey: &BlsPublicKey) -> Option<&'static str> {
    PROPOSER_NAMES_BY_PUBKEY.iter().find(|(key, _)| key == pubkey).map(|(_, name)| *name)
}
