/// Evaluation policy shared by every character.
#[derive(Clone, Debug, PartialEq)]
pub struct AnimOptions {
    /// Reset non-finite or non-normalized channels to identity and drop their valid bit.
    pub sanitize_poses: bool,
    /// Check instances and emitted outputs, logging a command-list dump on failure.
    pub enable_validation: bool,
    pub enable_retargeting: bool,
    pub enable_double_retargeting: bool,
    pub allow_out_of_date_retargeting: bool,
    /// Route same-hierarchy retargets through the full joint mapping.
    pub force_post_retargeting: bool,
    pub enable_joint_limits: bool,
    /// Whether per-clip debug skeleton metadata may be used.
    pub debug_metadata_available: bool,
    pub reasonable_translation_limit: f32,
    pub normalized_quat_tolerance: f32,
    pub max_batch_size: usize,
    pub batch_divisor: usize,
    pub retarget_cache_capacity: usize,
    pub skeleton_cache_capacity: usize,
}

impl Default for AnimOptions {
    fn default() -> Self {
        Self {
            sanitize_poses: true,
            enable_validation: cfg!(debug_assertions),
            enable_retargeting: true,
            enable_double_retargeting: true,
            allow_out_of_date_retargeting: true,
            force_post_retargeting: false,
            enable_joint_limits: true,
            debug_metadata_available: cfg!(debug_assertions),
            reasonable_translation_limit: 1.0e4,
            normalized_quat_tolerance: 1.0e-3,
            max_batch_size: 16,
            batch_divisor: 12,
            retarget_cache_capacity: 128,
            skeleton_cache_capacity: 64,
        }
    }
}

impl AnimOptions {
    /// Characters per worker task for a frame with `count` characters.
    pub fn batch_size(&self, count: usize) -> usize {
        (count / self.batch_divisor.max(1)).clamp(1, self.max_batch_size.max(1))
    }
}
