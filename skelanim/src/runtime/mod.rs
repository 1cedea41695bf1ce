mod context;
mod group;
mod interpreter;
mod plugin;
mod pool;
mod rig;
mod scheduler;

pub use context::*;
pub use group::*;
pub use interpreter::*;
pub use plugin::*;
pub use pool::*;
pub use rig::*;
pub use scheduler::*;

#[cfg(test)]
mod interpreter_tests;

#[cfg(test)]
mod scheduler_tests;
