use crate::{Error, HierarchyId, JointHierarchy, JointParams, ValidBits};
use std::sync::{Mutex, PoisonError};

/// Pose over every animated joint and float channel of one hierarchy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnimatedJointPose {
    pub joint_params: Vec<JointParams>,
    pub float_channels: Vec<f32>,
    /// One entry per channel group.
    pub valid_bits: Vec<ValidBits>,
}

impl AnimatedJointPose {
    /// Identity joints, zero floats, nothing valid.
    pub fn empty(hierarchy: &JointHierarchy) -> Self {
        Self {
            joint_params: vec![JointParams::IDENTITY; hierarchy.num_animated_joints()],
            float_channels: vec![0.0; hierarchy.num_float_channels()],
            valid_bits: vec![ValidBits::EMPTY; hierarchy.num_channel_groups()],
        }
    }

    /// The hierarchy's default pose with every channel valid.
    pub fn default_pose(hierarchy: &JointHierarchy) -> Self {
        Self {
            joint_params: hierarchy.default_animated_pose().to_vec(),
            float_channels: hierarchy.default_float_channels().to_vec(),
            valid_bits: hierarchy.full_valid_bits(),
        }
    }

    pub fn fully_valid(
        hierarchy: &JointHierarchy,
        joint_params: Vec<JointParams>,
        float_channels: Vec<f32>,
    ) -> Result<Self, Error> {
        let pose = Self {
            joint_params,
            float_channels,
            valid_bits: hierarchy.full_valid_bits(),
        };
        pose.check_layout(hierarchy)?;
        Ok(pose)
    }

    pub fn matches_layout(&self, hierarchy: &JointHierarchy) -> bool {
        self.joint_params.len() == hierarchy.num_animated_joints()
            && self.float_channels.len() == hierarchy.num_float_channels()
            && self.valid_bits.len() == hierarchy.num_channel_groups()
    }

    pub fn check_layout(&self, hierarchy: &JointHierarchy) -> Result<(), Error> {
        if self.matches_layout(hierarchy) {
            Ok(())
        } else {
            Err(Error::PoseLayout {
                message: format!(
                    "pose has {} joints, {} floats, {} channel groups; hierarchy '{}' has {}, {}, {}",
                    self.joint_params.len(),
                    self.float_channels.len(),
                    self.valid_bits.len(),
                    hierarchy.name(),
                    hierarchy.num_animated_joints(),
                    hierarchy.num_float_channels(),
                    hierarchy.num_channel_groups()
                ),
            })
        }
    }

    pub fn is_joint_valid(&self, hierarchy: &JointHierarchy, animated: usize) -> bool {
        hierarchy
            .joint_valid_bit(animated)
            .is_some_and(|b| b.is_set(&self.valid_bits))
    }

    pub fn is_float_valid(&self, hierarchy: &JointHierarchy, channel: usize) -> bool {
        hierarchy
            .float_valid_bit(channel)
            .is_some_and(|b| b.is_set(&self.valid_bits))
    }

    pub fn has_valid_channels(&self) -> bool {
        self.valid_bits.iter().any(|b| !b.is_empty())
    }
}

/// Externally owned pose that snapshot commands write into and read back from.
#[derive(Debug)]
pub struct SnapshotTarget {
    hierarchy_id: HierarchyId,
    pose: Mutex<AnimatedJointPose>,
}

impl SnapshotTarget {
    pub fn new(hierarchy: &JointHierarchy) -> Self {
        Self {
            hierarchy_id: hierarchy.hierarchy_id(),
            pose: Mutex::new(AnimatedJointPose::empty(hierarchy)),
        }
    }

    pub fn hierarchy_id(&self) -> HierarchyId {
        self.hierarchy_id
    }

    pub fn pose(&self) -> AnimatedJointPose {
        self.pose
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn with_pose<R>(&self, f: impl FnOnce(&AnimatedJointPose) -> R) -> R {
        f(&self.pose.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn with_pose_mut<R>(&self, f: impl FnOnce(&mut AnimatedJointPose) -> R) -> R {
        f(&mut self.pose.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
