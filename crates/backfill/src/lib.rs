pub mod adjustments;
pub mod aggregates;
pub mod balances;
pub mod blocks;
pub mod driver;
pub mod extra_builders;
pub mod gap_repair;
pub mod relay_payloads;

pub use adjustments::AdjustmentBackfill;
pub use aggregates::AggregateBackfill;
pub use balances::BalanceBackfill;
pub use blocks::{BlockArchiveBackfill, BlockGapRepair};
pub use driver::{
    run_backfill, BackfillError, BackfillReport, BackfillSource, DEFAULT_UNIT_CONCURRENCY,
};
pub use extra_builders::AuxiliaryBalanceBackfill;
pub use gap_repair::RelayGapRepair;
pub use relay_payloads::{RelayPayloadBackfill, RelayRunOutcome};
