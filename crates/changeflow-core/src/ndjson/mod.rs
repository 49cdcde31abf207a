//! NDJSON codec for the pool/worker protocol.
//!
//! Every message is one JSON object per line with a `kind` discriminator.
//! Reading is tolerant: unknown fields are ignored, unknown kinds are errors.

mod parser;
mod types;

pub use parser::{Encode, encode_line, parse_job, parse_pool_line, parse_worker_line};
pub use types::*;
