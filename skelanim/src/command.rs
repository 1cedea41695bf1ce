use crate::{
    AnimClip, AnimatedJointPose, BlindData, Error, HierarchyId, JointHierarchy, JointParams,
    RetargetPass, SnapshotTarget,
};
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Linear,
    Additive,
}

/// Plugin identifier, usually derived from the plugin's name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PluginId(pub u64);

impl PluginId {
    /// FNV-1a hash of `name`.
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            i += 1;
        }
        Self(hash)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JointSetId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChannelFactor {
    /// Channel index local to the processing group.
    pub channel: usize,
    pub factor: f32,
}

/// Per-channel blend factor multipliers, indexed by global processing group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatherBlendTable {
    pub joint_factors: Vec<Vec<ChannelFactor>>,
    pub float_factors: Vec<Vec<ChannelFactor>>,
}

impl FeatherBlendTable {
    pub fn joint_factor(&self, group: usize, channel: usize) -> f32 {
        Self::lookup(&self.joint_factors, group, channel)
    }

    pub fn float_factor(&self, group: usize, channel: usize) -> f32 {
        Self::lookup(&self.float_factors, group, channel)
    }

    fn lookup(table: &[Vec<ChannelFactor>], group: usize, channel: usize) -> f32 {
        table
            .get(group)
            .and_then(|factors| factors.iter().find(|f| f.channel == channel))
            .map_or(1.0, |f| f.factor)
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    BeginSegment,
    EndSegment,
    BeginAnimationPhase,
    EndAnimationPhase,
    BeginProcessingGroup {
        needed_instances: usize,
    },
    EndProcessingGroup,
    EvaluateClip {
        clip: Arc<AnimClip>,
        output: usize,
        frame: f32,
    },
    EvaluateBlend {
        left: usize,
        right: usize,
        output: usize,
        mode: BlendMode,
        factor: f32,
    },
    EvaluateFeatherBlend {
        left: usize,
        right: usize,
        output: usize,
        mode: BlendMode,
        factor: f32,
        table: Arc<FeatherBlendTable>,
    },
    EvaluateFlip {
        output: usize,
    },
    EvaluateEmptyPose {
        output: usize,
    },
    EvaluateBindPose {
        output: usize,
    },
    EvaluatePose {
        output: usize,
        hierarchy_id: HierarchyId,
        pose: Arc<AnimatedJointPose>,
    },
    EvaluatePoseDeferred {
        output: usize,
        hierarchy_id: HierarchyId,
        pose: Arc<AnimatedJointPose>,
    },
    EvaluateSnapshot {
        input: usize,
        hierarchy_id: HierarchyId,
        target: Arc<SnapshotTarget>,
    },
    EvaluateSnapshotDeferred {
        input: usize,
        node: Arc<SnapshotTarget>,
    },
    EvaluateSnapshotPoseDeferred {
        output: usize,
        node: Arc<SnapshotTarget>,
    },
    EvaluateCopy {
        src: usize,
        dst: usize,
    },
    EvaluateImpliedPose,
    EvaluateFullPose {
        joint_params: Arc<[JointParams]>,
        float_channels: Arc<[f32]>,
    },
    EvaluateJointHierarchyPrepare {
        input_controls: Option<Arc<[f32]>>,
    },
    EvaluateJointHierarchyEvaluate,
    EvaluateAnimPhasePlugin {
        plugin: PluginId,
        joint_set: Option<JointSetId>,
        blind_data: BlindData,
    },
    EvaluateRigPhasePlugin {
        plugin: PluginId,
        joint_set: Option<JointSetId>,
        blind_data: BlindData,
    },
    EvaluatePostRetarget {
        src: Arc<JointHierarchy>,
        pose: Arc<AnimatedJointPose>,
        additive: bool,
    },
    EvaluateRetarget(Arc<RetargetPass>),
    Layer {
        name: String,
    },
    State {
        name: String,
    },
    Track {
        index: usize,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::BeginSegment => "BeginSegment",
            Command::EndSegment => "EndSegment",
            Command::BeginAnimationPhase => "BeginAnimationPhase",
            Command::EndAnimationPhase => "EndAnimationPhase",
            Command::BeginProcessingGroup { .. } => "BeginProcessingGroup",
            Command::EndProcessingGroup => "EndProcessingGroup",
            Command::EvaluateClip { .. } => "EvaluateClip",
            Command::EvaluateBlend { .. } => "EvaluateBlend",
            Command::EvaluateFeatherBlend { .. } => "EvaluateFeatherBlend",
            Command::EvaluateFlip { .. } => "EvaluateFlip",
            Command::EvaluateEmptyPose { .. } => "EvaluateEmptyPose",
            Command::EvaluateBindPose { .. } => "EvaluateBindPose",
            Command::EvaluatePose { .. } => "EvaluatePose",
            Command::EvaluatePoseDeferred { .. } => "EvaluatePoseDeferred",
            Command::EvaluateSnapshot { .. } => "EvaluateSnapshot",
            Command::EvaluateSnapshotDeferred { .. } => "EvaluateSnapshotDeferred",
            Command::EvaluateSnapshotPoseDeferred { .. } => "EvaluateSnapshotPoseDeferred",
            Command::EvaluateCopy { .. } => "EvaluateCopy",
            Command::EvaluateImpliedPose => "EvaluateImpliedPose",
            Command::EvaluateFullPose { .. } => "EvaluateFullPose",
            Command::EvaluateJointHierarchyPrepare { .. } => "EvaluateJointHierarchyPrepare",
            Command::EvaluateJointHierarchyEvaluate => "EvaluateJointHierarchyEvaluate",
            Command::EvaluateAnimPhasePlugin { .. } => "EvaluateAnimPhasePlugin",
            Command::EvaluateRigPhasePlugin { .. } => "EvaluateRigPhasePlugin",
            Command::EvaluatePostRetarget { .. } => "EvaluatePostRetarget",
            Command::EvaluateRetarget(_) => "EvaluateRetarget",
            Command::Layer { .. } => "Layer",
            Command::State { .. } => "State",
            Command::Track { .. } => "Track",
        }
    }

    /// Encoded size in 4-byte words: one header word plus the payload.
    pub fn num_words(&self) -> usize {
        1 + match self {
            Command::BeginSegment
            | Command::EndSegment
            | Command::BeginAnimationPhase
            | Command::EndAnimationPhase
            | Command::EndProcessingGroup
            | Command::EvaluateImpliedPose
            | Command::EvaluateJointHierarchyEvaluate => 0,
            Command::BeginProcessingGroup { .. }
            | Command::EvaluateFlip { .. }
            | Command::EvaluateEmptyPose { .. }
            | Command::EvaluateBindPose { .. }
            | Command::Track { .. } => 1,
            Command::EvaluateCopy { .. }
            | Command::EvaluateSnapshotDeferred { .. }
            | Command::EvaluateSnapshotPoseDeferred { .. }
            | Command::EvaluateJointHierarchyPrepare { .. }
            | Command::EvaluateRetarget(_)
            | Command::Layer { .. }
            | Command::State { .. } => 2,
            Command::EvaluateClip { .. }
            | Command::EvaluatePose { .. }
            | Command::EvaluatePoseDeferred { .. }
            | Command::EvaluateSnapshot { .. }
            | Command::EvaluateFullPose { .. }
            | Command::EvaluatePostRetarget { .. } => 3,
            Command::EvaluateBlend { .. } => 4,
            Command::EvaluateFeatherBlend { .. } => 5,
            Command::EvaluateAnimPhasePlugin { blind_data, .. }
            | Command::EvaluateRigPhasePlugin { blind_data, .. } => 4 + blind_data.num_words(),
        }
    }

    /// Whether the command only touches data it owns and may run in
    /// [`EvalMode::Deferred`](crate::EvalMode::Deferred).
    pub fn is_deferred_safe(&self) -> bool {
        !matches!(
            self,
            Command::EvaluatePose { .. }
                | Command::EvaluateSnapshot { .. }
                | Command::EvaluateFullPose { .. }
                | Command::EvaluateAnimPhasePlugin { .. }
                | Command::EvaluateRigPhasePlugin { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct CommandList {
    commands: Vec<Command>,
    words_used: usize,
    capacity_words: usize,
}

impl Default for CommandList {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandList {
    pub const DEFAULT_CAPACITY_WORDS: usize = 3000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY_WORDS)
    }

    pub fn with_capacity(capacity_words: usize) -> Self {
        Self {
            commands: Vec::new(),
            words_used: 0,
            capacity_words,
        }
    }

    pub fn push(&mut self, command: Command) -> Result<(), Error> {
        let requested = command.num_words();
        if self.words_used + requested > self.capacity_words {
            return Err(Error::CommandBufferFull {
                capacity: self.capacity_words,
                used: self.words_used,
                requested,
            });
        }
        self.words_used += requested;
        self.commands.push(command);
        Ok(())
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) -> Result<(), Error> {
        for command in commands {
            self.push(command)?;
        }
        Ok(())
    }

    pub fn from_commands(commands: impl IntoIterator<Item = Command>) -> Result<Self, Error> {
        let mut list = Self::new();
        list.extend(commands)?;
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn words_used(&self) -> usize {
        self.words_used
    }

    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.commands.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn cursor(&self) -> CommandCursor<'_> {
        CommandCursor {
            list: self,
            position: 0,
        }
    }

    /// One line per command, for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, cmd) in self.commands.iter().enumerate() {
            let _ = writeln!(out, "[{i:4}] {cmd:?}");
        }
        out
    }

    /// Evaluates the default pose into instance 0, then prepares and evaluates the segment.
    pub fn bind_pose() -> Self {
        Self::synthetic([
            Command::BeginSegment,
            Command::BeginAnimationPhase,
            Command::BeginProcessingGroup {
                needed_instances: 1,
            },
            Command::EvaluateBindPose { output: 0 },
            Command::EndProcessingGroup,
            Command::EndAnimationPhase,
            Command::EvaluateJointHierarchyPrepare {
                input_controls: None,
            },
            Command::EvaluateJointHierarchyEvaluate,
            Command::EndSegment,
        ])
    }

    /// Rebuilds outputs from the joint params already stored in the context.
    pub fn implied_pose() -> Self {
        Self::synthetic([
            Command::BeginSegment,
            Command::BeginAnimationPhase,
            Command::BeginProcessingGroup {
                needed_instances: 1,
            },
            Command::EvaluateEmptyPose { output: 0 },
            Command::EndProcessingGroup,
            Command::EndAnimationPhase,
            Command::EvaluateImpliedPose,
            Command::EvaluateJointHierarchyPrepare {
                input_controls: None,
            },
            Command::EvaluateJointHierarchyEvaluate,
            Command::EndSegment,
        ])
    }

    /// Evaluates `source` into instance 0 on the source hierarchy, then runs `pass`.
    pub fn retarget_pass(source: Command, pass: Arc<RetargetPass>) -> Self {
        Self::synthetic([
            Command::BeginSegment,
            Command::BeginAnimationPhase,
            Command::BeginProcessingGroup {
                needed_instances: 1,
            },
            source,
            Command::EndProcessingGroup,
            Command::EndAnimationPhase,
            Command::EvaluateRetarget(pass),
            Command::EndSegment,
        ])
    }

    fn synthetic<const N: usize>(commands: [Command; N]) -> Self {
        let words_used = commands.iter().map(Command::num_words).sum();
        Self {
            commands: commands.into(),
            words_used,
            capacity_words: Self::DEFAULT_CAPACITY_WORDS.max(words_used),
        }
    }
}

/// Bounds-checked read position inside a [`CommandList`].
#[derive(Clone, Debug)]
pub struct CommandCursor<'a> {
    list: &'a CommandList,
    position: usize,
}

impl<'a> CommandCursor<'a> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_consumed(&self) -> bool {
        self.position >= self.list.len()
    }

    pub fn next_command(&mut self) -> Option<(usize, &'a Command)> {
        let list: &'a CommandList = self.list;
        let cmd = list.get(self.position)?;
        let index = self.position;
        self.position += 1;
        Some((index, cmd))
    }

    pub fn rewind_to(&mut self, position: usize) {
        self.position = position.min(self.list.len());
    }

    /// Moves to the `EndProcessingGroup` closing the group opened before the cursor,
    /// leaving it as the next command.
    pub fn skip_to_end_processing_group(&mut self) -> Result<(), Error> {
        let start = self.position;
        let list: &'a CommandList = self.list;
        match list.commands[start.min(list.len())..]
            .iter()
            .position(|c| matches!(c, Command::EndProcessingGroup))
        {
            Some(offset) => {
                self.position = start + offset;
                Ok(())
            }
            None => Err(Error::UnclosedProcessingGroup {
                index: start.saturating_sub(1),
            }),
        }
    }
}
