use crate::{
    AnimClip, AnimOptions, AnimatedJointPose, BlendMode, FeatherBlendTable, JointHierarchy,
    JointParams, ProcessingGroup, ValidBits, math,
};
use glam::{Quat, Vec3};

/// One candidate pose for the channels of a processing group.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub joints: Vec<JointParams>,
    pub floats: Vec<f32>,
    pub joint_valid: ValidBits,
    pub float_valid: ValidBits,
}

impl Instance {
    /// Identity joints and zero-filled floats, nothing valid.
    pub fn new(group: &ProcessingGroup) -> Self {
        Self {
            joints: vec![JointParams::IDENTITY; group.num_animated_joints],
            floats: vec![0.0; group.num_float_channels],
            joint_valid: ValidBits::EMPTY,
            float_valid: ValidBits::EMPTY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joint_valid.is_empty() && self.float_valid.is_empty()
    }

    pub fn clear(&mut self) {
        self.joints.fill(JointParams::IDENTITY);
        self.floats.fill(0.0);
        self.joint_valid.clear();
        self.float_valid.clear();
    }

    pub fn set_default(&mut self, hierarchy: &JointHierarchy, group: &ProcessingGroup) {
        self.joints
            .copy_from_slice(&hierarchy.default_animated_pose()[group.animated_range()]);
        self.floats
            .copy_from_slice(&hierarchy.default_float_channels()[group.float_range()]);
        self.joint_valid = ValidBits::first(group.num_animated_joints);
        self.float_valid = ValidBits::first(group.num_float_channels);
    }

    pub fn sample_clip(&mut self, clip: &AnimClip, group: &ProcessingGroup, frame: f32) {
        for (i, jp) in self.joints.iter_mut().enumerate() {
            *jp = clip.sample_joint(group.first_animated_joint + i, frame);
        }
        for (i, f) in self.floats.iter_mut().enumerate() {
            *f = clip.sample_float(group.first_float_channel + i, frame);
        }
        self.joint_valid = clip.channel_group_bits(group.joint_channel_group)
            & ValidBits::first(group.num_animated_joints);
        self.float_valid = group
            .float_channel_group
            .map_or(ValidBits::EMPTY, |cg| clip.channel_group_bits(cg))
            & ValidBits::first(group.num_float_channels);
    }

    /// Copies this group's slice of `pose`. The pose must match the hierarchy's layout.
    pub fn load_pose(&mut self, group: &ProcessingGroup, pose: &AnimatedJointPose) {
        self.joints
            .copy_from_slice(&pose.joint_params[group.animated_range()]);
        self.floats
            .copy_from_slice(&pose.float_channels[group.float_range()]);
        self.joint_valid = pose.valid_bits[group.joint_channel_group];
        self.float_valid = group
            .float_channel_group
            .map_or(ValidBits::EMPTY, |cg| pose.valid_bits[cg]);
    }

    pub fn store_pose(&self, group: &ProcessingGroup, pose: &mut AnimatedJointPose) {
        pose.joint_params[group.animated_range()].copy_from_slice(&self.joints);
        pose.float_channels[group.float_range()].copy_from_slice(&self.floats);
        pose.valid_bits[group.joint_channel_group] = self.joint_valid;
        if let Some(cg) = group.float_channel_group {
            pose.valid_bits[cg] = self.float_valid;
        }
    }

    /// Replaces every invalid channel with the default pose. Valid bits are unchanged.
    pub fn fill_undefined_from_default(&mut self, hierarchy: &JointHierarchy, group: &ProcessingGroup) {
        let defaults = &hierarchy.default_animated_pose()[group.animated_range()];
        for (i, (jp, def)) in self.joints.iter_mut().zip(defaults).enumerate() {
            if !self.joint_valid.is_bit_set(i) {
                *jp = *def;
            }
        }
        let defaults = &hierarchy.default_float_channels()[group.float_range()];
        for (i, (f, def)) in self.floats.iter_mut().zip(defaults).enumerate() {
            if !self.float_valid.is_bit_set(i) {
                *f = *def;
            }
        }
    }

    /// Resets valid joints holding non-finite or non-normalized data to identity and drops
    /// their valid bit. Returns the number of channels reset.
    pub fn sanitize(&mut self, options: &AnimOptions) -> usize {
        let mut reset = 0;
        for (i, jp) in self.joints.iter_mut().enumerate() {
            if !self.joint_valid.is_bit_set(i) {
                continue;
            }
            let bad = !jp.trans.is_finite()
                || !jp.scale.is_finite()
                || !math::is_normalized_within(jp.quat, options.normalized_quat_tolerance);
            if bad {
                *jp = JointParams::IDENTITY;
                self.joint_valid.clear_bit(i);
                reset += 1;
            }
        }
        for (i, f) in self.floats.iter_mut().enumerate() {
            if self.float_valid.is_bit_set(i) && !f.is_finite() {
                *f = 0.0;
                self.float_valid.clear_bit(i);
                reset += 1;
            }
        }
        reset
    }

    /// Describes the first invalid channel, if any.
    pub fn validate(&self, options: &AnimOptions) -> Option<String> {
        for (i, jp) in self.joints.iter().enumerate() {
            if !self.joint_valid.is_bit_set(i) {
                continue;
            }
            if !math::is_normalized_within(jp.quat, options.normalized_quat_tolerance) {
                return Some(format!("joint {i} has a non-normalized rotation {:?}", jp.quat));
            }
            if !math::is_reasonable(jp.trans, options.reasonable_translation_limit) {
                return Some(format!("joint {i} has an unreasonable translation {:?}", jp.trans));
            }
            if !jp.scale.is_finite() {
                return Some(format!("joint {i} has a non-finite scale {:?}", jp.scale));
            }
        }
        self.floats
            .iter()
            .enumerate()
            .find(|(i, f)| self.float_valid.is_bit_set(*i) && !f.is_finite())
            .map(|(i, f)| format!("float channel {i} is {f}"))
    }
}

/// Blends two instances. Returns a new instance so both inputs are read before any write.
pub fn blend_instances(
    left: &Instance,
    right: &Instance,
    mode: BlendMode,
    factor: f32,
    feather: Option<(&FeatherBlendTable, usize)>,
) -> Instance {
    if left.is_empty() && right.is_empty() {
        let mut out = left.clone();
        out.clear();
        return out;
    }
    let joint_factor = |i: usize| match feather {
        Some((table, group)) => (factor * table.joint_factor(group, i)).clamp(0.0, 1.0),
        None => factor,
    };
    let float_factor = |i: usize| match feather {
        Some((table, group)) => (factor * table.float_factor(group, i)).clamp(0.0, 1.0),
        None => factor,
    };

    let mut out = left.clone();
    match mode {
        BlendMode::Linear => {
            for i in 0..out.joints.len() {
                let (l, r) = (left.joint_valid.is_bit_set(i), right.joint_valid.is_bit_set(i));
                out.joints[i] = match (l, r) {
                    (true, true) => left.joints[i].lerp(&right.joints[i], joint_factor(i)),
                    (true, false) => left.joints[i],
                    (false, true) => right.joints[i],
                    (false, false) => JointParams::IDENTITY,
                };
            }
            for i in 0..out.floats.len() {
                let (l, r) = (left.float_valid.is_bit_set(i), right.float_valid.is_bit_set(i));
                out.floats[i] = match (l, r) {
                    (true, true) => {
                        let t = float_factor(i);
                        left.floats[i] + (right.floats[i] - left.floats[i]) * t
                    }
                    (true, false) => left.floats[i],
                    (false, true) => right.floats[i],
                    (false, false) => 0.0,
                };
            }
            out.joint_valid = left.joint_valid | right.joint_valid;
            out.float_valid = left.float_valid | right.float_valid;
        }
        BlendMode::Additive => {
            for i in 0..out.joints.len() {
                if left.joint_valid.is_bit_set(i) && right.joint_valid.is_bit_set(i) {
                    out.joints[i] = left.joints[i].add_weighted(&right.joints[i], joint_factor(i));
                }
            }
            for i in 0..out.floats.len() {
                if left.float_valid.is_bit_set(i) && right.float_valid.is_bit_set(i) {
                    out.floats[i] = left.floats[i] + right.floats[i] * float_factor(i);
                }
            }
        }
    }
    out
}

/// Mirrors an instance across the YZ plane, swapping the hierarchy's flip pairs.
pub fn flip_instance(instance: &mut Instance, hierarchy: &JointHierarchy, group: &ProcessingGroup) {
    let local = |joint: usize| {
        hierarchy
            .animated_index(joint)
            .filter(|a| group.animated_range().contains(a))
            .map(|a| a - group.first_animated_joint)
    };
    for pair in hierarchy.flip_pairs() {
        let (Some(a), Some(b)) = (local(pair.left), local(pair.right)) else {
            continue;
        };
        if a != b {
            instance.joints.swap(a, b);
            let (va, vb) = (
                instance.joint_valid.is_bit_set(a),
                instance.joint_valid.is_bit_set(b),
            );
            if vb {
                instance.joint_valid.set_bit(a);
            } else {
                instance.joint_valid.clear_bit(a);
            }
            if va {
                instance.joint_valid.set_bit(b);
            } else {
                instance.joint_valid.clear_bit(b);
            }
        }
    }
    for (i, jp) in instance.joints.iter_mut().enumerate() {
        if instance.joint_valid.is_bit_set(i) {
            jp.trans = Vec3::new(-jp.trans.x, jp.trans.y, jp.trans.z);
            jp.quat = Quat::from_xyzw(jp.quat.x, -jp.quat.y, -jp.quat.z, jp.quat.w);
        }
    }
}
