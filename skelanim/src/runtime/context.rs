use crate::{
    AnimatedJointPose, CommandList, Error, JointHierarchy, JointParams, OutputKind, SegmentMask,
};
use glam::Mat4;
use std::sync::Arc;

/// How an interpreter invocation may treat externally owned data.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EvalMode {
    /// Runs on the owning thread; every command may read the data it references.
    #[default]
    Immediate,
    /// Runs off the owning thread. Commands that read data which may have moved since
    /// recording fall back to an empty or default pose instead.
    Deferred,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessedMasks([SegmentMask; 5]);

impl ProcessedMasks {
    pub fn get(&self, kind: OutputKind) -> SegmentMask {
        self.0[kind.index()]
    }

    pub fn contains(&self, kind: OutputKind, segment: usize) -> bool {
        self.0[kind.index()].contains(segment)
    }

    fn insert(&mut self, kind: OutputKind, segment: usize) {
        self.0[kind.index()].insert(segment);
    }
}

#[derive(Clone, Debug, Default)]
struct SegmentBuffers {
    joint_params: Option<Vec<JointParams>>,
    transforms: Option<Vec<Mat4>>,
}

/// Segment 0 outputs kept by a character across frames.
#[derive(Clone, Debug, Default)]
pub struct JointCache {
    pub joint_params: Vec<JointParams>,
    pub transforms: Vec<Mat4>,
    pub output_controls: Vec<f32>,
}

/// Per-character, per-frame evaluation state.
#[derive(Debug)]
pub struct ExecutionContext {
    hierarchy: Arc<JointHierarchy>,
    commands: Arc<CommandList>,
    segments: Vec<SegmentBuffers>,
    output_controls: Option<Vec<f32>>,
    skinning: Option<Vec<Mat4>>,
    processed: ProcessedMasks,
    dependency_table: Vec<Mat4>,
    dependency_segments: SegmentMask,
    input_controls: Vec<f32>,
    persistent_data: Vec<u8>,
    pub allow_anim_phase_plugins: bool,
    pub allow_rig_phase_plugins: bool,
    /// Emit procedural joints alongside animated ones in the joint-param output.
    pub include_procedural_joint_params: bool,
    retarget_output: Option<AnimatedJointPose>,
}

impl ExecutionContext {
    pub fn new(hierarchy: Arc<JointHierarchy>, persistent_data: Vec<u8>) -> Result<Self, Error> {
        if persistent_data.len() != hierarchy.persistent_data_size() {
            return Err(Error::PersistentDataSize {
                expected: hierarchy.persistent_data_size(),
                actual: persistent_data.len(),
            });
        }
        Ok(Self {
            segments: vec![SegmentBuffers::default(); hierarchy.num_segments()],
            output_controls: None,
            skinning: None,
            processed: ProcessedMasks::default(),
            dependency_table: vec![Mat4::IDENTITY; hierarchy.num_joints()],
            dependency_segments: SegmentMask::EMPTY,
            input_controls: vec![0.0; hierarchy.num_input_controls()],
            persistent_data,
            commands: Arc::new(CommandList::new()),
            allow_anim_phase_plugins: true,
            allow_rig_phase_plugins: true,
            include_procedural_joint_params: false,
            retarget_output: None,
            hierarchy,
        })
    }

    /// Like [`ExecutionContext::new`], with segment 0 buffers taken over from `cache`.
    /// Cache buffers of the wrong size are dropped.
    pub fn with_joint_cache(
        hierarchy: Arc<JointHierarchy>,
        persistent_data: Vec<u8>,
        cache: JointCache,
    ) -> Result<Self, Error> {
        let mut ctx = Self::new(hierarchy, persistent_data)?;
        let seg0_joints = ctx.joint_param_count(0);
        let seg0_all = ctx.hierarchy.segments()[0].num_joints;
        if cache.joint_params.len() == seg0_joints {
            ctx.segments[0].joint_params = Some(cache.joint_params);
        }
        if cache.transforms.len() == seg0_all {
            ctx.segments[0].transforms = Some(cache.transforms);
        }
        let seg0_controls = ctx.hierarchy.segments()[0].num_output_controls;
        if !cache.output_controls.is_empty() && cache.output_controls.len() == seg0_controls {
            let mut controls = cache.output_controls;
            controls.resize(ctx.hierarchy.num_output_controls(), 0.0);
            ctx.output_controls = Some(controls);
        }
        Ok(ctx)
    }

    /// Hands segment 0 buffers back to the character's cache.
    pub fn take_joint_cache(&mut self) -> JointCache {
        JointCache {
            joint_params: self.segments[0].joint_params.take().unwrap_or_default(),
            transforms: self.segments[0].transforms.take().unwrap_or_default(),
            output_controls: self
                .output_controls
                .as_ref()
                .map(|oc| oc[..self.hierarchy.segments()[0].num_output_controls].to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn hierarchy(&self) -> &Arc<JointHierarchy> {
        &self.hierarchy
    }

    pub fn commands(&self) -> &Arc<CommandList> {
        &self.commands
    }

    pub fn set_commands(&mut self, commands: impl Into<Arc<CommandList>>) {
        self.commands = commands.into();
    }

    pub fn processed(&self, kind: OutputKind) -> SegmentMask {
        self.processed.get(kind)
    }

    pub fn processed_masks(&self) -> ProcessedMasks {
        self.processed
    }

    pub fn is_processed(&self, kind: OutputKind, segment: usize) -> bool {
        self.processed.contains(kind, segment)
    }

    pub(crate) fn mark_processed(&mut self, kind: OutputKind, segment: usize) {
        debug_assert!(
            !self.processed.contains(kind, segment),
            "{kind:?} of segment {segment} already processed"
        );
        self.processed.insert(kind, segment);
    }

    /// Number of joints the joint-param output holds for `segment`.
    pub fn joint_param_count(&self, segment: usize) -> usize {
        self.hierarchy.segment(segment).map_or(0, |s| {
            if self.include_procedural_joint_params {
                s.num_joints
            } else {
                s.num_animated_joints
            }
        })
    }

    pub fn joint_params(&self, segment: usize) -> Option<&[JointParams]> {
        self.segments.get(segment)?.joint_params.as_deref()
    }

    /// Gameplay-owned joint params of a segment, allocated from the default pose on first use.
    pub fn joint_params_mut(&mut self, segment: usize) -> Option<&mut [JointParams]> {
        self.allocate_joint_params(segment);
        self.segments.get_mut(segment)?.joint_params.as_deref_mut()
    }

    pub fn transforms(&self, segment: usize) -> Option<&[Mat4]> {
        self.segments.get(segment)?.transforms.as_deref()
    }

    pub fn skinning_matrices(&self, segment: usize) -> Option<&[Mat4]> {
        let seg = self.hierarchy.segment(segment)?;
        self.skinning.as_deref().map(|s| &s[seg.joint_range()])
    }

    pub fn all_skinning_matrices(&self) -> Option<&[Mat4]> {
        self.skinning.as_deref()
    }

    /// The segment's float channels followed by its driven controls.
    pub fn output_controls(&self, segment: usize) -> Option<&[f32]> {
        let seg = self.hierarchy.segment(segment)?;
        let start = seg.first_output_control;
        self.output_controls
            .as_deref()
            .map(|oc| &oc[start..start + seg.num_output_controls])
    }

    pub fn all_output_controls(&self) -> Option<&[f32]> {
        self.output_controls.as_deref()
    }

    pub fn input_controls(&self) -> &[f32] {
        &self.input_controls
    }

    pub fn set_input_controls(&mut self, values: &[f32]) {
        let n = values.len().min(self.input_controls.len());
        self.input_controls[..n].copy_from_slice(&values[..n]);
    }

    pub fn persistent_data(&self) -> &[u8] {
        &self.persistent_data
    }

    pub fn persistent_data_mut(&mut self) -> &mut [u8] {
        &mut self.persistent_data
    }

    /// Input controls and persistent data, borrowed together for plugin calls.
    pub(crate) fn plugin_io(&mut self) -> (&[f32], &mut [u8]) {
        (&self.input_controls, &mut self.persistent_data)
    }

    pub fn allocate_skinning_buffer(&mut self) {
        if self.skinning.is_none() {
            self.skinning = Some(vec![Mat4::IDENTITY; self.hierarchy.num_joints()]);
        }
    }

    pub(crate) fn allocate_joint_params(&mut self, segment: usize) {
        let count = self.joint_param_count(segment);
        let Some(seg) = self.hierarchy.segment(segment) else {
            return;
        };
        let first = seg.first_joint;
        if let Some(buffers) = self
            .segments
            .get_mut(segment)
            .filter(|b| b.joint_params.is_none())
        {
            let defaults = self.hierarchy.joints()[first..first + count]
                .iter()
                .map(|j| j.default)
                .collect();
            buffers.joint_params = Some(defaults);
        }
    }

    pub(crate) fn allocate_transforms(&mut self, segment: usize) {
        let Some(num_joints) = self.hierarchy.segment(segment).map(|s| s.num_joints) else {
            return;
        };
        if let Some(buffers) = self
            .segments
            .get_mut(segment)
            .filter(|b| b.transforms.is_none())
        {
            buffers.transforms = Some(vec![Mat4::IDENTITY; num_joints]);
        }
    }

    pub(crate) fn allocate_output_controls(&mut self) {
        if self.output_controls.is_none() {
            self.output_controls = Some(vec![0.0; self.hierarchy.num_output_controls()]);
        }
    }

    pub(crate) fn joint_params_buffer(&mut self, segment: usize) -> Option<&mut Vec<JointParams>> {
        self.segments.get_mut(segment)?.joint_params.as_mut()
    }

    pub(crate) fn transforms_buffer(&mut self, segment: usize) -> Option<&mut Vec<Mat4>> {
        self.segments.get_mut(segment)?.transforms.as_mut()
    }

    pub(crate) fn skinning_buffer(&mut self) -> Option<&mut Vec<Mat4>> {
        self.skinning.as_mut()
    }

    pub(crate) fn output_controls_buffer(&mut self) -> Option<&mut Vec<f32>> {
        self.output_controls.as_mut()
    }

    /// Object-space transforms of every joint whose segment has been evaluated this frame.
    pub fn dependency_table(&self) -> &[Mat4] {
        &self.dependency_table
    }

    pub fn dependency_segments(&self) -> SegmentMask {
        self.dependency_segments
    }

    /// Whether the transforms of every ancestor of `segment` are available.
    pub fn has_dependencies_for(&self, segment: usize) -> bool {
        self.dependency_segments
            .is_superset_of(self.hierarchy.dependencies(segment))
    }

    pub(crate) fn store_dependency_transforms(&mut self, segment: usize, transforms: &[Mat4]) {
        let Some(seg) = self.hierarchy.segment(segment) else {
            return;
        };
        let range = seg.joint_range();
        if transforms.len() == range.len() {
            self.dependency_table[range].copy_from_slice(transforms);
            self.dependency_segments.insert(segment);
        }
    }

    pub(crate) fn has_retarget_output(&self) -> bool {
        self.retarget_output.is_some()
    }

    pub(crate) fn retarget_output_mut(&mut self) -> &mut Option<AnimatedJointPose> {
        &mut self.retarget_output
    }

    pub(crate) fn take_retarget_output(&mut self) -> Option<AnimatedJointPose> {
        self.retarget_output.take()
    }
}
