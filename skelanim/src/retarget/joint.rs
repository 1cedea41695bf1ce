use crate::{JointParams, JointRetarget, Locator, RetargetMode, math};
use glam::{Quat, Vec3};

/// Re-expresses one source joint in the target joint's space.
///
/// `src_default` and `dst_default` are the two joints' default local poses. `out` holds the
/// target joint's current value on entry, which [`RetargetMode::AddRotationComponentOnly`]
/// layers on top of.
pub fn retarget_joint(
    jr: &JointRetarget,
    src: &JointParams,
    src_default: &JointParams,
    dst_default: &JointParams,
    additive: bool,
    out: &mut JointParams,
) {
    let src_loc = Locator::from_params(src);
    let parent_delta = &jr.parent_bind_pose_delta;
    let joint_delta = &jr.joint_bind_pose_delta;

    let delta_rotation = || {
        if additive {
            joint_delta.untransform(&src_loc.transform(joint_delta)).rot
        } else {
            parent_delta.untransform(&src_loc).transform(joint_delta).rot
        }
    };

    let (scale, trans, rot) = match jr.mode {
        RetargetMode::Default => {
            let trans = math::unrotate_point(parent_delta.rot, src.trans) * jr.bone_scale;
            (src.scale, trans, delta_rotation())
        }
        RetargetMode::RotationOnly if additive => (Vec3::ONE, Vec3::ZERO, delta_rotation()),
        RetargetMode::RotationOnly => (dst_default.scale, dst_default.trans, delta_rotation()),
        RetargetMode::AddRotationComponentOnly => {
            if out.is_finite() {
                (out.scale, out.trans, out.quat * src.quat)
            } else {
                (Vec3::ONE, Vec3::ZERO, Quat::IDENTITY)
            }
        }
        RetargetMode::RotationAndDeltaTranslation if additive => {
            (Vec3::ONE, Vec3::ZERO, delta_rotation())
        }
        RetargetMode::RotationAndDeltaTranslation => {
            let trans = dst_default.trans + (src.trans - jr.src_joint_pos_ls);
            (dst_default.scale, trans, delta_rotation())
        }
        RetargetMode::Verbatim => (src.scale, src.trans, src.quat),
        RetargetMode::Regression => {
            let loc = regress(jr, src, src_default, additive);
            let loc = if additive {
                loc
            } else {
                Locator::from_params(dst_default).transform(&loc)
            };
            (src.scale, loc.trans, loc.rot)
        }
    };

    *out = JointParams::new(trans, rot.normalize(), scale);
}

/// Maps the source's offset from its default pose through the learned matrices. Without a
/// matrix the offset passes through.
fn regress(
    jr: &JointRetarget,
    src: &JointParams,
    src_default: &JointParams,
    additive: bool,
) -> Locator {
    let offset = if additive {
        Locator::from_params(src)
    } else {
        Locator::from_params(src_default).untransform(&Locator::from_params(src))
    };
    let Some(matrices) = jr.regression.as_deref() else {
        return offset;
    };

    let trans = match &matrices.translation {
        Some(w) => math::row_vector_mul(offset.trans, w),
        None => offset.trans,
    };

    let rot = match &matrices.rotation {
        Some(w) => {
            // Regress in the hemisphere with positive w.
            let sign = if offset.rot.w < 0.0 { -1.0 } else { 1.0 };
            let axis = math::row_vector_mul(offset.rot.xyz() / sign, w);
            let length = axis.length();
            let (axis, w) = if length > 1.0 {
                (axis / length, 0.0)
            } else {
                (axis, (1.0 - length * length).sqrt())
            };
            Quat::from_xyzw(axis.x * sign, axis.y * sign, axis.z * sign, w * sign)
        }
        None => offset.rot,
    };

    Locator::new(trans, rot)
}
