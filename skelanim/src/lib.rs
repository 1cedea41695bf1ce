//! Segmented skeletal pose evaluation for game characters.
//!
//! A character's animation for one frame is a recorded [`CommandList`]. The scheduler
//! ([`request_segments`]) interprets it one skeleton segment at a time, producing only the
//! output kinds that are asked for, and clips recorded against other skeletons are
//! retargeted on the fly.

#![forbid(unsafe_code)]

mod bits;
mod blind;
mod clip;
mod command;
mod error;
mod hierarchy;
mod math;
mod options;
mod pose;
mod retarget;
mod runtime;
mod services;
mod tasks;

#[cfg(feature = "json")]
pub mod json;

pub use bits::*;
pub use blind::*;
pub use clip::*;
pub use command::*;
pub use error::*;
pub use hierarchy::*;
pub use math::*;
pub use options::*;
pub use pose::*;
pub use retarget::*;
pub use runtime::*;
pub use services::*;
pub use tasks::*;

#[cfg(test)]
mod test_fixtures;
