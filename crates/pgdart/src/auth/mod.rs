//! Authentication support.

mod scram;

pub use scram::ScramClient;

/// The SASL mechanism this client implements.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
