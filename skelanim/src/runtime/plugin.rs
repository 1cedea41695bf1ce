use crate::{BlindData, Instance, JointHierarchy, JointParams, JointSetId, PluginId, ProcessingGroup};

/// Processing group being evaluated when an anim-phase plugin runs.
pub struct GroupView<'a> {
    pub index: usize,
    pub group: &'a ProcessingGroup,
    pub instances: &'a mut [Instance],
}

pub struct AnimPhaseCall<'a> {
    pub plugin: PluginId,
    pub joint_set: Option<JointSetId>,
    pub blind_data: &'a BlindData,
    pub hierarchy: &'a JointHierarchy,
    pub segment: usize,
    pub group: GroupView<'a>,
    pub input_controls: &'a [f32],
    pub persistent_data: &'a mut [u8],
}

pub struct RigPhaseCall<'a> {
    pub plugin: PluginId,
    pub joint_set: Option<JointSetId>,
    pub blind_data: &'a BlindData,
    pub hierarchy: &'a JointHierarchy,
    pub segment: usize,
    /// Local joint params of every joint in the segment.
    pub joint_params: &'a mut [JointParams],
    pub float_channels: &'a mut [f32],
    pub input_controls: &'a [f32],
    pub persistent_data: &'a mut [u8],
}

/// Procedural and IK callbacks invoked at plugin commands.
pub trait PluginHandler: Send + Sync {
    fn anim_phase(&self, call: AnimPhaseCall<'_>) {
        let _ = call;
    }

    fn rig_phase(&self, call: RigPhaseCall<'_>) {
        let _ = call;
    }
}
