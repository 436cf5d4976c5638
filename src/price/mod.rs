//! Price ingestion: oracle proofs, feed merging, publication.

pub mod feed;
pub mod ingestion;
pub mod oracle;

pub use feed::{FeedSpec, PriceEntry, PriceMap, ScaledPrice};
pub use ingestion::PriceIngestion;
pub use oracle::{HttpOracleClient, OracleClient, OracleProof, ProofEnvelope};
