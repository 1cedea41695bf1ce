use glam::{Mat3, Mat4, Quat, Vec3};

/// Local-space joint transform: scale, rotation, translation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct JointParams {
    pub scale: Vec3,
    pub quat: Quat,
    pub trans: Vec3,
}

impl JointParams {
    pub const IDENTITY: Self = Self {
        scale: Vec3::ONE,
        quat: Quat::IDENTITY,
        trans: Vec3::ZERO,
    };

    /// Neutral value for additive data: zero translation, identity rotation, unit scale.
    pub const ADDITIVE_IDENTITY: Self = Self::IDENTITY;

    pub fn new(trans: Vec3, quat: Quat, scale: Vec3) -> Self {
        Self { scale, quat, trans }
    }

    pub fn from_translation(trans: Vec3) -> Self {
        Self {
            trans,
            ..Self::IDENTITY
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.quat, self.trans)
    }

    pub fn is_finite(&self) -> bool {
        self.scale.is_finite() && self.quat.is_finite() && self.trans.is_finite()
    }

    /// Interpolates towards `other`; rotations take the shortest arc.
    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: self.scale.lerp(other.scale, t),
            quat: self.quat.slerp(other.quat, t).normalize(),
            trans: self.trans.lerp(other.trans, t),
        }
    }

    /// Layers an additive delta on top of `self`, weighted by `t`.
    pub fn add_weighted(&self, delta: &Self, t: f32) -> Self {
        let weighted_rot = Quat::IDENTITY.slerp(delta.quat, t);
        Self {
            scale: self.scale * Vec3::ONE.lerp(delta.scale, t),
            quat: (self.quat * weighted_rot).normalize(),
            trans: self.trans + delta.trans * t,
        }
    }
}

impl Default for JointParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Rigid transform without scale.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Locator {
    pub trans: Vec3,
    pub rot: Quat,
}

impl Locator {
    pub const IDENTITY: Self = Self {
        trans: Vec3::ZERO,
        rot: Quat::IDENTITY,
    };

    pub fn new(trans: Vec3, rot: Quat) -> Self {
        Self { trans, rot }
    }

    pub fn from_params(params: &JointParams) -> Self {
        Self {
            trans: params.trans,
            rot: params.quat,
        }
    }

    /// `self * other`: expresses `other` (given in `self`'s space) in the parent space.
    pub fn transform(&self, other: &Locator) -> Locator {
        Locator {
            trans: self.trans + self.rot * other.trans,
            rot: self.rot * other.rot,
        }
    }

    /// `self^-1 * other`: expresses `other` relative to `self`.
    pub fn untransform(&self, other: &Locator) -> Locator {
        let inv = self.rot.conjugate();
        Locator {
            trans: inv * (other.trans - self.trans),
            rot: inv * other.rot,
        }
    }

    pub fn inverse(&self) -> Locator {
        Locator::IDENTITY.untransform(self)
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::IDENTITY
    }
}

pub fn unrotate_point(rot: Quat, point: Vec3) -> Vec3 {
    rot.conjugate() * point
}

pub fn is_normalized_within(q: Quat, tolerance: f32) -> bool {
    q.is_finite() && (q.length_squared() - 1.0).abs() <= tolerance
}

pub fn is_reasonable(v: Vec3, limit: f32) -> bool {
    v.is_finite() && v.abs().max_element() <= limit
}

/// `x^T * W` for a row-major 3x3 matrix `W`.
pub fn row_vector_mul(x: Vec3, w: &[f32; 9]) -> Vec3 {
    // Columns of the glam matrix are the rows of `w`.
    Mat3::from_cols_array(w) * x
}

/// Wraps an angle in radians into `[-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    let two_pi = std::f32::consts::TAU;
    let mut a = angle % two_pi;
    if a > std::f32::consts::PI {
        a -= two_pi;
    } else if a < -std::f32::consts::PI {
        a += two_pi;
    }
    a
}
