use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Network-level failure after the retry budget is spent.
    #[error("transport error after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    /// The endpoint answered, but not with what the protocol promises.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node reported an error object for a sub-request.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Block beyond the node's head, or pruned.
    #[error("block {0} not found")]
    NotFound(u64),
}
