mod assignment;
mod consistency;
mod rebalance;
mod worker;

pub use assignment::*;
pub use consistency::*;
pub use rebalance::*;
pub use worker::*;
