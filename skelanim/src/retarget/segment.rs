use crate::{
    AnimOptions, AnimatedJointPose, JointHierarchy, JointParams, RetargetEntry, ValidBits,
    retarget_joint,
};

/// One evaluated source segment.
#[derive(Copy, Clone, Debug)]
pub struct SegmentSource<'a> {
    pub segment: usize,
    /// The segment's animated joints, starting at its first joint.
    pub joint_params: &'a [JointParams],
    /// The segment's float channels, starting at its first float channel.
    pub float_channels: &'a [f32],
    /// Valid bits for every channel group of the source hierarchy.
    pub valid_bits: &'a [ValidBits],
}

/// Length ratio of the two default root translations. 1.0 when the source root sits at
/// the origin.
pub fn root_scale(src: &JointHierarchy, dst: &JointHierarchy) -> f32 {
    let len = |h: &JointHierarchy| h.default_joint(0).map_or(0.0, |j| j.trans.length());
    let src_len = len(src);
    if src_len <= 1.0e-6 {
        1.0
    } else {
        len(dst) / src_len
    }
}

/// Clears the valid bits of every channel group in `segment`.
pub fn clear_segment_channels(hierarchy: &JointHierarchy, segment: usize, pose: &mut AnimatedJointPose) {
    if let Some(seg) = hierarchy.segment(segment) {
        for bits in &mut pose.valid_bits[seg.channel_group_range()] {
            bits.clear();
        }
    }
}

/// Retargets the joints and float channels of one source segment into one target segment
/// of `out`, setting the target valid bit of every channel written.
#[allow(clippy::too_many_arguments)]
pub fn retarget_joints_in_segment(
    options: &AnimOptions,
    entry: &RetargetEntry,
    src: &JointHierarchy,
    source: SegmentSource<'_>,
    dst: &JointHierarchy,
    dst_segment: usize,
    additive: bool,
    out: &mut AnimatedJointPose,
) {
    let (Some(src_seg), Some(dst_seg)) = (src.segment(source.segment), dst.segment(dst_segment))
    else {
        return;
    };

    if dst_segment == 0 && source.segment == 0 {
        clear_segment_channels(dst, 0, out);
    }

    if !options.force_post_retargeting && entry.src_hierarchy == entry.dst_hierarchy {
        if source.segment != dst_segment {
            return;
        }
        for cg in dst_seg.channel_group_range() {
            if let (Some(from), Some(to)) = (source.valid_bits.get(cg), out.valid_bits.get_mut(cg)) {
                *to = *from;
            }
        }
        let joints = dst_seg.animated_range();
        let n = joints.len().min(source.joint_params.len());
        out.joint_params[joints.start..joints.start + n].copy_from_slice(&source.joint_params[..n]);
        let floats = dst_seg.float_range();
        let n = floats.len().min(source.float_channels.len());
        out.float_channels[floats.start..floats.start + n]
            .copy_from_slice(&source.float_channels[..n]);
        return;
    }

    let src_joints = src_seg.first_joint..src_seg.first_joint + src_seg.num_animated_joints;
    let dst_joints = dst_seg.first_joint..dst_seg.first_joint + dst_seg.num_animated_joints;
    let src_valid = |animated: usize| {
        src.joint_valid_bit(animated)
            .is_some_and(|b| b.is_set(source.valid_bits))
    };

    for jr in &entry.joints {
        if !src_joints.contains(&jr.src_index) || !dst_joints.contains(&jr.dst_index) {
            continue;
        }
        if !src_valid(jr.src_anim_index) {
            continue;
        }
        let (Some(src_joint), Some(dst_bit)) = (
            source.joint_params.get(jr.src_index - src_seg.first_joint),
            dst.joint_valid_bit(jr.dst_anim_index),
        ) else {
            continue;
        };
        let (Some(src_default), Some(dst_default)) = (
            src.default_animated_pose().get(jr.src_anim_index),
            dst.default_animated_pose().get(jr.dst_anim_index),
        ) else {
            continue;
        };
        dst_bit.set(&mut out.valid_bits);
        retarget_joint(
            jr,
            src_joint,
            src_default,
            dst_default,
            additive,
            &mut out.joint_params[jr.dst_anim_index],
        );
    }

    if src_seg.first_joint == 0 && dst_seg.first_joint == 0 && src_valid(0) {
        if let (Some(src_root), Some(dst_root)) =
            (source.joint_params.first(), out.joint_params.first_mut())
        {
            dst_root.trans = src_root.trans * root_scale(src, dst);
        }
        if !additive {
            for ik in [&entry.arm_ik, &entry.leg_ik].into_iter().flatten() {
                ik.apply(
                    source.joint_params,
                    source.valid_bits,
                    &mut out.joint_params,
                    &out.valid_bits,
                    entry.scale,
                );
            }
        }
    }

    let src_floats = src_seg.float_range();
    let dst_floats = dst_seg.float_range();
    for fr in &entry.floats {
        if !src_floats.contains(&fr.src_index) || !dst_floats.contains(&fr.dst_index) {
            continue;
        }
        let valid = src
            .float_valid_bit(fr.src_index)
            .is_some_and(|b| b.is_set(source.valid_bits));
        let (Some(value), Some(dst_bit)) = (
            source.float_channels.get(fr.src_index - src_floats.start),
            dst.float_valid_bit(fr.dst_index),
        ) else {
            continue;
        };
        if valid {
            out.float_channels[fr.dst_index] = *value;
            dst_bit.set(&mut out.valid_bits);
        }
    }
}

/// Replaces every channel of `segment` still invalid in `pose` with the hierarchy default.
/// Valid bits are left untouched.
pub fn fill_invalid_from_default(hierarchy: &JointHierarchy, segment: usize, pose: &mut AnimatedJointPose) {
    let Some(seg) = hierarchy.segment(segment) else {
        return;
    };
    for animated in seg.animated_range() {
        if !pose.is_joint_valid(hierarchy, animated) {
            pose.joint_params[animated] = hierarchy.default_animated_pose()[animated];
        }
    }
    for channel in seg.float_range() {
        if !pose.is_float_valid(hierarchy, channel) {
            pose.float_channels[channel] = hierarchy.default_float_channels()[channel];
        }
    }
}
