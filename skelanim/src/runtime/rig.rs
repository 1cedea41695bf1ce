use crate::{
    ControlSource, JointHierarchy, JointLimitKind, JointParams, Segment, math,
};
use glam::{Mat4, Quat, Vec3};

/// Specialized evaluator for a known rig topology.
pub trait CompiledRig: Send + Sync {
    /// Writes object-space transforms for every joint of `segment`. `locals` holds the
    /// segment's local joint params and `dependencies` the object-space transforms of all
    /// joints in already evaluated segments. Returns `false` to fall back to generic
    /// forward kinematics.
    fn evaluate(
        &self,
        hierarchy: &JointHierarchy,
        segment: usize,
        locals: &[JointParams],
        dependencies: &[Mat4],
        out: &mut [Mat4],
    ) -> bool;
}

/// Clamps segment 0 joints to the hierarchy's joint limits. `joint_params` holds the
/// segment's joints starting at joint 0.
pub fn apply_joint_limits(hierarchy: &JointHierarchy, joint_params: &mut [JointParams]) {
    for limit in hierarchy.joint_limits() {
        let (Some(jp), Some(bind)) = (
            joint_params.get_mut(limit.joint),
            hierarchy.default_joint(limit.joint),
        ) else {
            continue;
        };
        let axis = limit.kind.axis();
        match limit.kind {
            JointLimitKind::TranslateX | JointLimitKind::TranslateY | JointLimitKind::TranslateZ => {
                jp.trans[axis] = jp.trans[axis].clamp(limit.min, limit.max);
            }
            JointLimitKind::ScaleX | JointLimitKind::ScaleY | JointLimitKind::ScaleZ => {
                jp.scale[axis] = jp.scale[axis].clamp(limit.min, limit.max);
            }
            JointLimitKind::RotateX | JointLimitKind::RotateY | JointLimitKind::RotateZ => {
                let mut unit = Vec3::ZERO;
                unit[axis] = 1.0;
                let delta = bind.quat.conjugate() * jp.quat;
                let (delta_axis, angle) = delta.normalize().to_axis_angle();
                let mut angle = math::wrap_angle(angle);
                if delta_axis.dot(unit) < 0.0 {
                    angle = -angle;
                }
                let clamped = angle.to_degrees().clamp(limit.min, limit.max).to_radians();
                jp.quat = (bind.quat * Quat::from_axis_angle(unit, clamped)).normalize();
            }
        }
    }
}

/// Generic forward kinematics for one segment.
pub fn compute_transforms(
    hierarchy: &JointHierarchy,
    segment: &Segment,
    locals: &[JointParams],
    dependencies: &[Mat4],
    out: &mut [Mat4],
) {
    for (offset, local) in locals.iter().enumerate().take(out.len()) {
        let joint = segment.first_joint + offset;
        let local = local.to_mat4();
        out[offset] = match hierarchy.parent(joint) {
            Some(p) if p >= segment.first_joint => out[p - segment.first_joint] * local,
            Some(p) => dependencies.get(p).copied().unwrap_or(Mat4::IDENTITY) * local,
            None => local,
        };
    }
}

pub fn compute_skinning(
    hierarchy: &JointHierarchy,
    segment: &Segment,
    transforms: &[Mat4],
    out: &mut [Mat4],
) {
    let inverse_bind = &hierarchy.inverse_bind_pose()[segment.joint_range()];
    for ((out, xform), inv) in out.iter_mut().zip(transforms).zip(inverse_bind) {
        *out = *xform * *inv;
    }
}

/// Fills the segment's output controls: float channels first, then driven controls.
pub fn compute_output_controls(
    segment: &Segment,
    float_channels: &[f32],
    input_controls: &[f32],
    out: &mut [f32],
) {
    let nf = segment.num_float_channels.min(float_channels.len()).min(out.len());
    out[..nf].copy_from_slice(&float_channels[..nf]);
    let out_len = out.len();
    for (slot, driver) in out[segment.num_float_channels.min(out_len)..]
        .iter_mut()
        .zip(&segment.output_drivers)
    {
        let source = match driver.source {
            ControlSource::FloatChannel(c) => c
                .checked_sub(segment.first_float_channel)
                .and_then(|local| float_channels.get(local))
                .copied(),
            ControlSource::InputControl(c) => input_controls.get(c).copied(),
        };
        *slot = source.unwrap_or(0.0) * driver.scale + driver.offset;
    }
}
