use crate::{OutputMask, SegmentMask};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hierarchy: {message}")]
    InvalidHierarchy { message: String },

    #[error("persistent data size mismatch: hierarchy declares {expected} bytes, got {actual}")]
    PersistentDataSize { expected: usize, actual: usize },

    #[error("command buffer full: {used} of {capacity} words used, command needs {requested}")]
    CommandBufferFull {
        capacity: usize,
        used: usize,
        requested: usize,
    },

    #[error("unexpected command {command} at index {index}: {message}")]
    UnexpectedCommand {
        index: usize,
        command: &'static str,
        message: String,
    },

    #[error("instance {instance} out of range at command {index} (group declares {declared})")]
    InstanceOutOfRange {
        index: usize,
        instance: usize,
        declared: usize,
    },

    #[error(
        "blend at command {index} writes instance {output}, which is neither input ({left}, {right})"
    )]
    InvalidBlendOutput {
        index: usize,
        left: usize,
        right: usize,
        output: usize,
    },

    #[error("segment {segment} left unterminated: consumed {consumed} of {total} commands")]
    UnterminatedSegment {
        segment: usize,
        consumed: usize,
        total: usize,
    },

    #[error("no EndProcessingGroup after command {index}")]
    UnclosedProcessingGroup { index: usize },

    #[error("segment {segment} out of range (hierarchy has {count})")]
    SegmentOutOfRange { segment: usize, count: usize },

    #[error("segments {missing:?} not processed for outputs {outputs:?}")]
    SegmentNotProcessed {
        missing: SegmentMask,
        outputs: OutputMask,
    },

    #[error("an implied-pose request cannot also output joint params")]
    ImpliedPoseJointParams,

    #[error("pose layout does not match hierarchy: {message}")]
    PoseLayout { message: String },

    #[error("blind data exhausted: wanted {wanted} bytes at offset {offset} of {len}")]
    BlindDataEof {
        offset: usize,
        wanted: usize,
        len: usize,
    },

    #[error("context slot {slot} is invalid or already allocated this frame")]
    ContextSlot { slot: usize },

    #[error("failed to build task pool: {message}")]
    TaskPool { message: String },

    #[cfg(feature = "json")]
    #[error("failed to parse animation JSON: {message}")]
    JsonParse { message: String },

    #[cfg(feature = "json")]
    #[error("unknown parent joint '{parent}' for joint '{joint}'")]
    JsonUnknownParent { joint: String, parent: String },
}
