use crate::{
    HierarchyId, JointHierarchy, JointParams, Locator, SegmentMask, SkeletonId, ValidBits,
};
use glam::Vec3;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RetargetMode {
    #[default]
    Default,
    RotationOnly,
    AddRotationComponentOnly,
    RotationAndDeltaTranslation,
    Verbatim,
    Regression,
}

/// Learned 3x3 row-major maps from source additive translation/rotation to the target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegressionMatrices {
    pub translation: Option<[f32; 9]>,
    pub rotation: Option<[f32; 9]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JointRetarget {
    pub src_index: usize,
    pub dst_index: usize,
    pub src_anim_index: usize,
    pub dst_anim_index: usize,
    pub mode: RetargetMode,
    pub parent_bind_pose_delta: Locator,
    pub joint_bind_pose_delta: Locator,
    pub bone_scale: f32,
    /// Source joint's reference local translation, for delta-translation retargets.
    pub src_joint_pos_ls: Vec3,
    pub regression: Option<Arc<RegressionMatrices>>,
}

impl JointRetarget {
    /// Identity mapping between two animated joints.
    pub fn new(src: &JointHierarchy, src_index: usize, dst: &JointHierarchy, dst_index: usize) -> Option<Self> {
        Some(Self {
            src_index,
            dst_index,
            src_anim_index: src.animated_index(src_index)?,
            dst_anim_index: dst.animated_index(dst_index)?,
            mode: RetargetMode::Default,
            parent_bind_pose_delta: Locator::IDENTITY,
            joint_bind_pose_delta: Locator::IDENTITY,
            bone_scale: 1.0,
            src_joint_pos_ls: src.default_joint(src_index).map_or(Vec3::ZERO, |j| j.trans),
            regression: None,
        })
    }

    pub fn with_mode(mut self, mode: RetargetMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FloatChannelRetarget {
    pub src_index: usize,
    pub dst_index: usize,
}

/// External two-bone IK cleanup re-seating limb end effectors after retargeting.
pub trait LimbIkCleanup: Send + Sync {
    /// `src` holds the source segment's animated joints, `dst` every animated joint of the
    /// target. Runs only for non-additive data.
    fn apply(
        &self,
        src: &[JointParams],
        src_valid: &[ValidBits],
        dst: &mut [JointParams],
        dst_valid: &[ValidBits],
        scale: f32,
    );
}

/// Joint-to-joint mapping between two hierarchies.
pub struct RetargetEntry {
    pub src_skeleton: SkeletonId,
    pub dst_skeleton: SkeletonId,
    pub src_hierarchy: HierarchyId,
    pub dst_hierarchy: HierarchyId,
    pub joints: Vec<JointRetarget>,
    pub floats: Vec<FloatChannelRetarget>,
    /// Source segments each target segment reads from. Empty when no mapping was computed.
    pub dst_to_src_segments: Vec<SegmentMask>,
    pub scale: f32,
    pub arm_ik: Option<Arc<dyn LimbIkCleanup>>,
    pub leg_ik: Option<Arc<dyn LimbIkCleanup>>,
    disabled: AtomicBool,
}

impl RetargetEntry {
    /// Entry with no mappings.
    pub fn new(src: &JointHierarchy, dst: &JointHierarchy) -> Self {
        Self {
            src_skeleton: src.skeleton_id(),
            dst_skeleton: dst.skeleton_id(),
            src_hierarchy: src.hierarchy_id(),
            dst_hierarchy: dst.hierarchy_id(),
            joints: Vec::new(),
            floats: Vec::new(),
            dst_to_src_segments: Vec::new(),
            scale: 1.0,
            arm_ik: None,
            leg_ik: None,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn with_joints(mut self, joints: Vec<JointRetarget>) -> Self {
        self.joints = joints;
        self
    }

    pub fn with_floats(mut self, floats: Vec<FloatChannelRetarget>) -> Self {
        self.floats = floats;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    /// Derives [`RetargetEntry::dst_to_src_segments`] from the joint and float mappings.
    pub fn compute_segment_mapping(&mut self, src: &JointHierarchy, dst: &JointHierarchy) {
        let mut mapping = vec![SegmentMask::EMPTY; dst.num_segments()];
        for jr in &self.joints {
            if let (Some(s), Some(d)) = (
                src.segment_of_joint(jr.src_index),
                dst.segment_of_joint(jr.dst_index),
            ) {
                mapping[d].insert(s);
            }
        }
        let float_segment = |h: &JointHierarchy, channel: usize| {
            h.segments()
                .iter()
                .position(|s| s.float_range().contains(&channel))
        };
        for fr in &self.floats {
            if let (Some(s), Some(d)) = (
                float_segment(src, fr.src_index),
                float_segment(dst, fr.dst_index),
            ) {
                mapping[d].insert(s);
            }
        }
        self.dst_to_src_segments = mapping;
    }

    /// Source segments needed to fill `dst_segment`. Without a computed mapping, the
    /// segment with the same index.
    pub fn source_segments_for(&self, dst_segment: usize) -> SegmentMask {
        if self.dst_to_src_segments.is_empty() {
            SegmentMask::single(dst_segment)
        } else {
            self.dst_to_src_segments
                .get(dst_segment)
                .copied()
                .unwrap_or(SegmentMask::EMPTY)
        }
    }
}

impl fmt::Debug for RetargetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetargetEntry")
            .field("src_skeleton", &self.src_skeleton)
            .field("dst_skeleton", &self.dst_skeleton)
            .field("src_hierarchy", &self.src_hierarchy)
            .field("dst_hierarchy", &self.dst_hierarchy)
            .field("joints", &self.joints.len())
            .field("floats", &self.floats.len())
            .field("scale", &self.scale)
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

/// Builds an entry mapping every animated source joint to the animated target joint of the
/// same name. `src_names` overrides the source hierarchy's joint names when given.
pub fn construct_retarget_entry(
    src: &JointHierarchy,
    src_names: Option<&[String]>,
    dst: &JointHierarchy,
) -> RetargetEntry {
    let mut joints = Vec::new();
    for src_index in 0..src.num_joints() {
        let name = match src_names {
            Some(names) => names.get(src_index).map(String::as_str),
            None => src.joint(src_index).map(|j| j.name.as_str()),
        };
        let Some(dst_index) = name.and_then(|n| dst.find_joint(n)) else {
            continue;
        };
        if let Some(jr) = JointRetarget::new(src, src_index, dst, dst_index) {
            joints.push(jr);
        }
    }
    let mut entry = RetargetEntry::new(src, dst).with_joints(joints);
    entry.compute_segment_mapping(src, dst);
    log::debug!(
        "constructed name-matched retarget {:?} -> {:?} with {} joints",
        src.hierarchy_id(),
        dst.hierarchy_id(),
        entry.joints.len()
    );
    entry
}
