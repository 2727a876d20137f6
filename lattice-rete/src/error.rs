use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReteError {
    /// A predicate handler failed while the network was propagating. The
    /// propagation aborts; state already derived stays in place.
    #[error("predicate '{name}' failed during propagation: {message}")]
    Predicate { name: String, message: String },
}
