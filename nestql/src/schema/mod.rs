pub mod parser;
pub mod types;

pub use parser::{build_model, parse_model, parse_model_str};
pub use types::*;
