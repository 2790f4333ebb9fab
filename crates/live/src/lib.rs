pub mod coordinator;
pub mod stages;
pub mod ws;

pub use coordinator::{LiveCoordinator, LiveError};
pub use stages::{Stage, StageCompletion};
pub use ws::{HeadSubscriber, ReaderState};
