use crate::{Error, JointParams, SegmentMask, ValidBits};
use glam::Mat4;
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchyId(pub u32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkeletonId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub struct JointDef {
    pub name: String,
    pub parent: Option<usize>,
    pub default: JointParams,
}

impl JointDef {
    pub fn new(name: impl Into<String>, parent: Option<usize>, default: JointParams) -> Self {
        Self {
            name: name.into(),
            parent,
            default,
        }
    }
}

/// Channel counts of one processing group.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupDef {
    pub num_animated_joints: usize,
    pub num_float_channels: usize,
}

impl GroupDef {
    pub fn new(num_animated_joints: usize, num_float_channels: usize) -> Self {
        Self {
            num_animated_joints,
            num_float_channels,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentDef {
    pub num_joints: usize,
    pub groups: Vec<GroupDef>,
    pub output_drivers: Vec<OutputControlDriver>,
}

impl SegmentDef {
    pub fn new(num_joints: usize, groups: Vec<GroupDef>) -> Self {
        Self {
            num_joints,
            groups,
            output_drivers: Vec::new(),
        }
    }

    pub fn num_animated_joints(&self) -> usize {
        self.groups.iter().map(|g| g.num_animated_joints).sum()
    }

    pub fn num_float_channels(&self) -> usize {
        self.groups.iter().map(|g| g.num_float_channels).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlSource {
    /// Global float-channel index; must belong to the driver's segment.
    FloatChannel(usize),
    InputControl(usize),
}

/// Output control computed as `source * scale + offset`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OutputControlDriver {
    pub source: ControlSource,
    pub scale: f32,
    pub offset: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JointLimitKind {
    TranslateX,
    TranslateY,
    TranslateZ,
    RotateX,
    RotateY,
    RotateZ,
    ScaleX,
    ScaleY,
    ScaleZ,
}

impl JointLimitKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::TranslateX,
            1 => Self::TranslateY,
            2 => Self::TranslateZ,
            3 => Self::RotateX,
            4 => Self::RotateY,
            5 => Self::RotateZ,
            6 => Self::ScaleX,
            7 => Self::ScaleY,
            8 => Self::ScaleZ,
            _ => return None,
        })
    }

    pub fn axis(self) -> usize {
        match self {
            Self::TranslateX | Self::RotateX | Self::ScaleX => 0,
            Self::TranslateY | Self::RotateY | Self::ScaleY => 1,
            Self::TranslateZ | Self::RotateZ | Self::ScaleZ => 2,
        }
    }
}

/// Limit on one component of an animated joint. Rotation limits are in degrees,
/// relative to the joint's bind rotation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct JointLimitDef {
    pub joint: usize,
    pub kind: JointLimitKind,
    pub min: f32,
    pub max: f32,
}

/// Mirrored joint pair; both joints must be animated in the same processing group.
/// A pair with `left == right` mirrors a center joint in place.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlipPair {
    pub left: usize,
    pub right: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub first_joint: usize,
    pub num_joints: usize,
    pub first_animated_joint: usize,
    pub num_animated_joints: usize,
    pub first_processing_group: usize,
    pub num_processing_groups: usize,
    pub first_channel_group: usize,
    pub num_channel_groups: usize,
    pub first_float_channel: usize,
    pub num_float_channels: usize,
    pub first_output_control: usize,
    pub num_output_controls: usize,
    /// Ancestor segments this segment kinematically depends on (transitive, excluding itself).
    pub dependencies: SegmentMask,
    pub output_drivers: Vec<OutputControlDriver>,
}

impl Segment {
    pub fn joint_range(&self) -> std::ops::Range<usize> {
        self.first_joint..self.first_joint + self.num_joints
    }

    pub fn animated_range(&self) -> std::ops::Range<usize> {
        self.first_animated_joint..self.first_animated_joint + self.num_animated_joints
    }

    pub fn float_range(&self) -> std::ops::Range<usize> {
        self.first_float_channel..self.first_float_channel + self.num_float_channels
    }

    pub fn channel_group_range(&self) -> std::ops::Range<usize> {
        self.first_channel_group..self.first_channel_group + self.num_channel_groups
    }

    pub fn processing_group_range(&self) -> std::ops::Range<usize> {
        self.first_processing_group..self.first_processing_group + self.num_processing_groups
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessingGroup {
    pub segment: usize,
    pub first_animated_joint: usize,
    pub num_animated_joints: usize,
    pub first_float_channel: usize,
    pub num_float_channels: usize,
    pub joint_channel_group: usize,
    pub float_channel_group: Option<usize>,
}

impl ProcessingGroup {
    pub fn is_empty(&self) -> bool {
        self.num_animated_joints == 0 && self.num_float_channels == 0
    }

    pub fn num_channel_groups(&self) -> usize {
        1 + usize::from(self.float_channel_group.is_some())
    }

    pub fn animated_range(&self) -> std::ops::Range<usize> {
        self.first_animated_joint..self.first_animated_joint + self.num_animated_joints
    }

    pub fn float_range(&self) -> std::ops::Range<usize> {
        self.first_float_channel..self.first_float_channel + self.num_float_channels
    }
}

/// Channel group and bit holding one animated joint or float channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelBit {
    pub channel_group: usize,
    pub bit: usize,
}

impl ChannelBit {
    pub fn is_set(&self, bits: &[ValidBits]) -> bool {
        bits.get(self.channel_group)
            .is_some_and(|b| b.is_bit_set(self.bit))
    }

    pub fn set(&self, bits: &mut [ValidBits]) {
        if let Some(b) = bits.get_mut(self.channel_group) {
            b.set_bit(self.bit);
        }
    }

    pub fn clear(&self, bits: &mut [ValidBits]) {
        if let Some(b) = bits.get_mut(self.channel_group) {
            b.clear_bit(self.bit);
        }
    }
}

/// Immutable, segmented description of one skeleton.
#[derive(Debug)]
pub struct JointHierarchy {
    hierarchy_id: HierarchyId,
    skeleton_id: SkeletonId,
    name: String,
    joints: Vec<JointDef>,
    joint_lookup: HashMap<String, usize>,
    segments: Vec<Segment>,
    processing_groups: Vec<ProcessingGroup>,
    num_channel_groups: usize,
    num_output_controls: usize,
    segment_of_joint: Vec<usize>,
    animated_of_joint: Vec<Option<usize>>,
    joint_of_animated: Vec<usize>,
    joint_bits: Vec<ChannelBit>,
    float_bits: Vec<ChannelBit>,
    default_animated: Vec<JointParams>,
    default_float_channels: Vec<f32>,
    inverse_bind_pose: Vec<Mat4>,
    joint_limits: Vec<JointLimitDef>,
    flip_pairs: Vec<FlipPair>,
    num_input_controls: usize,
    initial_persistent_data: Vec<u8>,
}

impl JointHierarchy {
    pub fn hierarchy_id(&self) -> HierarchyId {
        self.hierarchy_id
    }

    pub fn skeleton_id(&self) -> SkeletonId {
        self.skeleton_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }

    pub fn num_animated_joints(&self) -> usize {
        self.joint_of_animated.len()
    }

    pub fn num_float_channels(&self) -> usize {
        self.default_float_channels.len()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn num_processing_groups(&self) -> usize {
        self.processing_groups.len()
    }

    pub fn num_channel_groups(&self) -> usize {
        self.num_channel_groups
    }

    pub fn num_output_controls(&self) -> usize {
        self.num_output_controls
    }

    pub fn num_input_controls(&self) -> usize {
        self.num_input_controls
    }

    pub fn all_segments(&self) -> SegmentMask {
        SegmentMask::first(self.segments.len())
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn processing_group(&self, index: usize) -> Option<&ProcessingGroup> {
        self.processing_groups.get(index)
    }

    pub fn processing_groups_in_segment(&self, segment: usize) -> &[ProcessingGroup] {
        match self.segments.get(segment) {
            Some(seg) => &self.processing_groups[seg.processing_group_range()],
            None => &[],
        }
    }

    pub fn dependencies(&self, segment: usize) -> SegmentMask {
        self.segments
            .get(segment)
            .map_or(SegmentMask::EMPTY, |s| s.dependencies)
    }

    pub fn joint(&self, index: usize) -> Option<&JointDef> {
        self.joints.get(index)
    }

    pub fn joints(&self) -> &[JointDef] {
        &self.joints
    }

    pub fn parent(&self, joint: usize) -> Option<usize> {
        self.joints.get(joint).and_then(|j| j.parent)
    }

    pub fn find_joint(&self, name: &str) -> Option<usize> {
        self.joint_lookup.get(name).copied()
    }

    pub fn segment_of_joint(&self, joint: usize) -> Option<usize> {
        self.segment_of_joint.get(joint).copied()
    }

    pub fn animated_index(&self, joint: usize) -> Option<usize> {
        self.animated_of_joint.get(joint).copied().flatten()
    }

    pub fn joint_index(&self, animated: usize) -> Option<usize> {
        self.joint_of_animated.get(animated).copied()
    }

    pub fn joint_valid_bit(&self, animated: usize) -> Option<ChannelBit> {
        self.joint_bits.get(animated).copied()
    }

    pub fn float_valid_bit(&self, channel: usize) -> Option<ChannelBit> {
        self.float_bits.get(channel).copied()
    }

    pub fn default_joint(&self, joint: usize) -> Option<&JointParams> {
        self.joints.get(joint).map(|j| &j.default)
    }

    /// Default local pose of every animated joint, indexed by animated index.
    pub fn default_animated_pose(&self) -> &[JointParams] {
        &self.default_animated
    }

    pub fn default_float_channels(&self) -> &[f32] {
        &self.default_float_channels
    }

    pub fn inverse_bind_pose(&self) -> &[Mat4] {
        &self.inverse_bind_pose
    }

    pub fn joint_limits(&self) -> &[JointLimitDef] {
        &self.joint_limits
    }

    pub fn flip_pairs(&self) -> &[FlipPair] {
        &self.flip_pairs
    }

    pub fn persistent_data_size(&self) -> usize {
        self.initial_persistent_data.len()
    }

    pub fn initial_persistent_data(&self) -> &[u8] {
        &self.initial_persistent_data
    }

    /// Valid bits with every channel of every group set.
    pub fn full_valid_bits(&self) -> Vec<ValidBits> {
        let mut bits = vec![ValidBits::EMPTY; self.num_channel_groups];
        for group in &self.processing_groups {
            bits[group.joint_channel_group] = ValidBits::first(group.num_animated_joints);
            if let Some(fg) = group.float_channel_group {
                bits[fg] = ValidBits::first(group.num_float_channels);
            }
        }
        bits
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidHierarchy {
        message: message.into(),
    }
}

#[derive(Clone, Debug)]
pub struct HierarchyBuilder {
    hierarchy_id: HierarchyId,
    skeleton_id: SkeletonId,
    name: String,
    joints: Vec<JointDef>,
    segments: Vec<SegmentDef>,
    default_float_channels: Vec<f32>,
    joint_limits: Vec<JointLimitDef>,
    flip_pairs: Vec<FlipPair>,
    num_input_controls: usize,
    persistent_data: Vec<u8>,
}

impl HierarchyBuilder {
    pub fn new(hierarchy_id: HierarchyId, skeleton_id: SkeletonId) -> Self {
        Self {
            hierarchy_id,
            skeleton_id,
            name: String::new(),
            joints: Vec::new(),
            segments: Vec::new(),
            default_float_channels: Vec::new(),
            joint_limits: Vec::new(),
            flip_pairs: Vec::new(),
            num_input_controls: 0,
            persistent_data: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn joint(mut self, joint: JointDef) -> Self {
        self.joints.push(joint);
        self
    }

    pub fn joints(mut self, joints: impl IntoIterator<Item = JointDef>) -> Self {
        self.joints.extend(joints);
        self
    }

    pub fn segment(mut self, segment: SegmentDef) -> Self {
        self.segments.push(segment);
        self
    }

    /// Default float-channel values. Left empty, every channel defaults to zero.
    pub fn default_float_channels(mut self, values: Vec<f32>) -> Self {
        self.default_float_channels = values;
        self
    }

    pub fn joint_limit(mut self, limit: JointLimitDef) -> Self {
        self.joint_limits.push(limit);
        self
    }

    pub fn flip_pair(mut self, pair: FlipPair) -> Self {
        self.flip_pairs.push(pair);
        self
    }

    pub fn input_controls(mut self, count: usize) -> Self {
        self.num_input_controls = count;
        self
    }

    pub fn persistent_data(mut self, data: Vec<u8>) -> Self {
        self.persistent_data = data;
        self
    }

    pub fn build(self) -> Result<JointHierarchy, Error> {
        if self.segments.is_empty() {
            return Err(invalid("hierarchy has no segments"));
        }
        if self.segments.len() > SegmentMask::CAPACITY {
            return Err(invalid(format!(
                "{} segments exceeds the limit of {}",
                self.segments.len(),
                SegmentMask::CAPACITY
            )));
        }
        let declared_joints: usize = self.segments.iter().map(|s| s.num_joints).sum();
        if declared_joints != self.joints.len() {
            return Err(invalid(format!(
                "segments declare {declared_joints} joints, hierarchy has {}",
                self.joints.len()
            )));
        }
        if self.joints.first().is_some_and(|j| j.parent.is_some()) {
            return Err(invalid("joint 0 must be a root"));
        }
        for (index, joint) in self.joints.iter().enumerate() {
            if let Some(parent) = joint.parent.filter(|&p| p >= index) {
                return Err(invalid(format!(
                    "joint '{}' ({index}) precedes its parent {parent}",
                    joint.name
                )));
            }
        }

        let mut joint_lookup = HashMap::with_capacity(self.joints.len());
        for (index, joint) in self.joints.iter().enumerate() {
            joint_lookup.entry(joint.name.clone()).or_insert(index);
        }

        let mut segments = Vec::with_capacity(self.segments.len());
        let mut processing_groups = Vec::new();
        let mut segment_of_joint = Vec::with_capacity(self.joints.len());
        let mut animated_of_joint = vec![None; self.joints.len()];
        let mut joint_of_animated = Vec::new();
        let mut joint_bits = Vec::new();
        let mut float_bits = Vec::new();
        let mut next_joint = 0;
        let mut next_animated = 0;
        let mut next_float = 0;
        let mut next_channel_group = 0;
        let mut next_output_control = 0;

        for (seg_index, def) in self.segments.iter().enumerate() {
            let num_animated = def.num_animated_joints();
            if num_animated > def.num_joints {
                return Err(invalid(format!(
                    "segment {seg_index} animates {num_animated} of {} joints",
                    def.num_joints
                )));
            }

            let first_processing_group = processing_groups.len();
            let first_channel_group = next_channel_group;
            let first_float_channel = next_float;
            let first_animated = next_animated;
            for group in &def.groups {
                if group.num_animated_joints > ValidBits::CAPACITY
                    || group.num_float_channels > ValidBits::CAPACITY
                {
                    return Err(invalid(format!(
                        "processing group in segment {seg_index} exceeds {} channels",
                        ValidBits::CAPACITY
                    )));
                }
                let joint_channel_group = next_channel_group;
                next_channel_group += 1;
                let float_channel_group = if group.num_float_channels > 0 {
                    next_channel_group += 1;
                    Some(joint_channel_group + 1)
                } else {
                    None
                };
                for bit in 0..group.num_animated_joints {
                    joint_bits.push(ChannelBit {
                        channel_group: joint_channel_group,
                        bit,
                    });
                }
                for bit in 0..group.num_float_channels {
                    float_bits.push(ChannelBit {
                        channel_group: float_channel_group.unwrap_or(joint_channel_group),
                        bit,
                    });
                }
                processing_groups.push(ProcessingGroup {
                    segment: seg_index,
                    first_animated_joint: next_animated,
                    num_animated_joints: group.num_animated_joints,
                    first_float_channel: next_float,
                    num_float_channels: group.num_float_channels,
                    joint_channel_group,
                    float_channel_group,
                });
                next_animated += group.num_animated_joints;
                next_float += group.num_float_channels;
            }

            for offset in 0..def.num_joints {
                let joint = next_joint + offset;
                segment_of_joint.push(seg_index);
                if offset < num_animated {
                    animated_of_joint[joint] = Some(joint_of_animated.len());
                    joint_of_animated.push(joint);
                }
            }

            let num_floats = next_float - first_float_channel;
            let num_output_controls = num_floats + def.output_drivers.len();
            segments.push(Segment {
                first_joint: next_joint,
                num_joints: def.num_joints,
                first_animated_joint: first_animated,
                num_animated_joints: num_animated,
                first_processing_group,
                num_processing_groups: def.groups.len(),
                first_channel_group,
                num_channel_groups: next_channel_group - first_channel_group,
                first_float_channel,
                num_float_channels: num_floats,
                first_output_control: next_output_control,
                num_output_controls,
                dependencies: SegmentMask::EMPTY,
                output_drivers: def.output_drivers.clone(),
            });
            next_joint += def.num_joints;
            next_output_control += num_output_controls;
        }

        // Parents precede children, so ancestor segments are always resolved first.
        for seg_index in 0..segments.len() {
            let mut deps = SegmentMask::EMPTY;
            for joint in segments[seg_index].joint_range() {
                if let Some(parent) = self.joints[joint].parent {
                    let parent_seg = segment_of_joint[parent];
                    if parent_seg != seg_index {
                        deps.insert(parent_seg);
                        deps |= segments[parent_seg].dependencies;
                    }
                }
            }
            segments[seg_index].dependencies = deps;
        }

        let default_float_channels = if self.default_float_channels.is_empty() {
            vec![0.0; next_float]
        } else if self.default_float_channels.len() == next_float {
            self.default_float_channels
        } else {
            return Err(invalid(format!(
                "{} default float channels for {next_float} channels",
                self.default_float_channels.len()
            )));
        };

        for seg in &segments {
            for driver in &seg.output_drivers {
                let in_range = match driver.source {
                    ControlSource::FloatChannel(c) => seg.float_range().contains(&c),
                    ControlSource::InputControl(c) => c < self.num_input_controls,
                };
                if !in_range {
                    return Err(invalid(format!(
                        "output control driver source {:?} out of range",
                        driver.source
                    )));
                }
            }
        }

        for limit in &self.joint_limits {
            let seg0 = &segments[0];
            if !(seg0.first_joint..seg0.first_joint + seg0.num_animated_joints)
                .contains(&limit.joint)
            {
                return Err(invalid(format!(
                    "joint limit on joint {} outside segment 0's animated joints",
                    limit.joint
                )));
            }
        }

        for pair in &self.flip_pairs {
            let group_of = |joint: usize| {
                animated_of_joint
                    .get(joint)
                    .copied()
                    .flatten()
                    .map(|a| joint_bits[a].channel_group)
            };
            match (group_of(pair.left), group_of(pair.right)) {
                (Some(a), Some(b)) if a == b => {}
                _ => {
                    return Err(invalid(format!(
                        "flip pair ({}, {}) must be animated joints of one processing group",
                        pair.left, pair.right
                    )));
                }
            }
        }

        let default_animated = joint_of_animated
            .iter()
            .map(|&j| self.joints[j].default)
            .collect();

        let mut bind = Vec::with_capacity(self.joints.len());
        for joint in &self.joints {
            let local = joint.default.to_mat4();
            let object = match joint.parent {
                Some(p) => bind[p] * local,
                None => local,
            };
            bind.push(object);
        }
        let inverse_bind_pose = bind.iter().map(|m| m.inverse()).collect();

        Ok(JointHierarchy {
            hierarchy_id: self.hierarchy_id,
            skeleton_id: self.skeleton_id,
            name: self.name,
            joints: self.joints,
            joint_lookup,
            segments,
            processing_groups,
            num_channel_groups: next_channel_group,
            num_output_controls: next_output_control,
            segment_of_joint,
            animated_of_joint,
            joint_of_animated,
            joint_bits,
            float_bits,
            default_animated,
            default_float_channels,
            inverse_bind_pose,
            joint_limits: self.joint_limits,
            flip_pairs: self.flip_pairs,
            num_input_controls: self.num_input_controls,
            initial_persistent_data: self.persistent_data,
        })
    }
}
