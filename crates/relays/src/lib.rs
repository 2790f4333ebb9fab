pub mod adjustments;
pub mod client;
pub mod error;
pub mod gaps;
pub mod rate_limit;

pub use adjustments::AdjustmentsClient;
pub use client::{DeliveredPayload, PayloadPage, RelayClient};
pub use error::RelayClientError;
pub use gaps::{detect_gaps, GapRange};
pub use rate_limit::TokenBucket;
