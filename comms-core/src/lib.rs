//! Core types shared by the dataflow communication layer: identifiers, the wire header and
//! key encodings.
mod header;
mod ids;
mod key;
pub mod prelude;

pub use header::*;
pub use ids::*;
pub use key::*;
