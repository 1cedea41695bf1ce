mod cache;
mod entry;
mod joint;
mod pose;
mod segment;

pub use cache::*;
pub use entry::*;
pub use joint::*;
pub use pose::*;
pub use segment::*;
