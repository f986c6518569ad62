pub mod http;
pub mod tags;

pub use http::{HttpNormalizer, NormalizeError};
pub use tags::FlagTagger;
