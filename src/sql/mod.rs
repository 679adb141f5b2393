//! Safe SQL builder: identifiers from declared entities only, values as parameters.

mod builder;
pub use builder::*;
