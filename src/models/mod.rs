//! Data models

mod vm;
mod pool;
mod task;

pub use vm::*;
pub use pool::*;
pub use task::*;
