pub mod context;
pub mod document;
pub mod ids;
pub mod query;
pub mod time_range;

pub use context::*;
pub use document::*;
pub use ids::*;
pub use query::*;
pub use time_range::*;
