pub mod aggregators;
pub mod monitor;

pub use aggregators::*;
pub use monitor::*;
