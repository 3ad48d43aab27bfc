pub mod domain;
pub mod duration_millis;
pub mod error;
pub mod traits;

pub use domain::*;
pub use error::*;
pub use traits::*;
