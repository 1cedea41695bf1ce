use crate::{
    GroupDef, HierarchyBuilder, HierarchyId, JointDef, JointHierarchy, JointParams, SegmentDef,
    SkeletonId, ValidBits,
};

/// One sampled key of a clip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClipFrame {
    /// Indexed by animated joint of the clip's hierarchy.
    pub joint_params: Vec<JointParams>,
    pub float_channels: Vec<f32>,
}

/// Skeleton layout recorded with a clip at export time. Only present in development
/// content; used to rebuild the hierarchy the clip was recorded against when it is out of date.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugSkelInfo {
    pub joints: Vec<JointDef>,
    pub segments: Vec<SegmentDef>,
    pub default_float_channels: Vec<f32>,
}

impl DebugSkelInfo {
    pub fn joint_names(&self) -> impl Iterator<Item = &str> {
        self.joints.iter().map(|j| j.name.as_str())
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupDef> {
        self.segments.iter().flat_map(|s| s.groups.iter())
    }
}

#[derive(Clone, Debug, Default)]
pub struct AnimClip {
    pub name: String,
    pub hierarchy_id: HierarchyId,
    pub skeleton_id: SkeletonId,
    pub additive: bool,
    pub frames: Vec<ClipFrame>,
    /// One entry per channel group of the clip's hierarchy.
    pub valid_bits: Vec<ValidBits>,
    /// Processing-group layout the clip was exported against.
    pub groups: Vec<GroupDef>,
    pub debug_info: Option<std::sync::Arc<DebugSkelInfo>>,
}

impl AnimClip {
    /// Clip for `hierarchy` with every channel valid.
    pub fn new(hierarchy: &JointHierarchy, frames: Vec<ClipFrame>) -> Self {
        let groups = (0..hierarchy.num_processing_groups())
            .filter_map(|i| hierarchy.processing_group(i))
            .map(|g| GroupDef::new(g.num_animated_joints, g.num_float_channels))
            .collect();
        Self {
            name: String::new(),
            hierarchy_id: hierarchy.hierarchy_id(),
            skeleton_id: hierarchy.skeleton_id(),
            additive: false,
            frames,
            valid_bits: hierarchy.full_valid_bits(),
            groups,
            debug_info: None,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    fn frame_pair(&self, frame: f32) -> Option<(&ClipFrame, &ClipFrame, f32)> {
        let last = self.frames.len().checked_sub(1)?;
        let f = if frame.is_finite() {
            frame.clamp(0.0, last as f32)
        } else {
            0.0
        };
        let i0 = (f.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        Some((&self.frames[i0], &self.frames[i1], f - i0 as f32))
    }

    /// Samples one animated joint. Missing data samples as identity.
    pub fn sample_joint(&self, animated: usize, frame: f32) -> JointParams {
        let Some((a, b, t)) = self.frame_pair(frame) else {
            return JointParams::IDENTITY;
        };
        match (a.joint_params.get(animated), b.joint_params.get(animated)) {
            (Some(a), Some(b)) => a.lerp(b, t),
            (Some(a), None) => *a,
            _ => JointParams::IDENTITY,
        }
    }

    pub fn sample_float(&self, channel: usize, frame: f32) -> f32 {
        let Some((a, b, t)) = self.frame_pair(frame) else {
            return 0.0;
        };
        match (a.float_channels.get(channel), b.float_channels.get(channel)) {
            (Some(a), Some(b)) => a + (b - a) * t,
            (Some(a), None) => *a,
            _ => 0.0,
        }
    }

    pub fn channel_group_bits(&self, channel_group: usize) -> ValidBits {
        self.valid_bits
            .get(channel_group)
            .copied()
            .unwrap_or(ValidBits::EMPTY)
    }

    /// True if the clip's processing-group layout matches `hierarchy`.
    pub fn matches_layout(&self, hierarchy: &JointHierarchy) -> bool {
        self.groups.len() == hierarchy.num_processing_groups()
            && self.groups.iter().enumerate().all(|(i, g)| {
                hierarchy.processing_group(i).is_some_and(|pg| {
                    pg.num_animated_joints == g.num_animated_joints
                        && pg.num_float_channels == g.num_float_channels
                })
            })
    }
}

/// Rebuilds the hierarchy a clip was exported against from its debug metadata.
/// Returns `None` if the clip has no metadata or the metadata disagrees with the
/// clip's channel layout.
pub fn construct_intermediate_hierarchy(clip: &AnimClip) -> Option<JointHierarchy> {
    let info = clip.debug_info.as_ref()?;
    if info.groups().count() != clip.groups.len()
        || info.groups().zip(&clip.groups).any(|(a, b)| a != b)
    {
        log::debug!(
            "debug skeleton of clip '{}' no longer matches its channel layout",
            clip.name
        );
        return None;
    }
    let mut builder = HierarchyBuilder::new(clip.hierarchy_id, clip.skeleton_id)
        .name(format!("{} (intermediate)", clip.name))
        .joints(info.joints.iter().cloned())
        .default_float_channels(info.default_float_channels.clone());
    for seg in &info.segments {
        builder = builder.segment(SegmentDef::new(seg.num_joints, seg.groups.clone()));
    }
    match builder.build() {
        Ok(h) => Some(h),
        Err(err) => {
            log::debug!("intermediate skeleton for clip '{}' rejected: {err}", clip.name);
            None
        }
    }
}
