//! JSON loading for [`AnimOptions`] and [`JointHierarchy`] descriptions.

use crate::{
    AnimOptions, ControlSource, Error, FlipPair, GroupDef, HierarchyBuilder, HierarchyId,
    JointDef, JointHierarchy, JointLimitDef, JointLimitKind, JointParams, OutputControlDriver,
    SegmentDef, SkeletonId,
};
use glam::{Quat, Vec3};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct OptionsDef {
    sanitize_poses: Option<bool>,
    enable_validation: Option<bool>,
    enable_retargeting: Option<bool>,
    enable_double_retargeting: Option<bool>,
    allow_out_of_date_retargeting: Option<bool>,
    force_post_retargeting: Option<bool>,
    enable_joint_limits: Option<bool>,
    debug_metadata_available: Option<bool>,
    reasonable_translation_limit: Option<f32>,
    normalized_quat_tolerance: Option<f32>,
    max_batch_size: Option<usize>,
    batch_divisor: Option<usize>,
    retarget_cache_capacity: Option<usize>,
    skeleton_cache_capacity: Option<usize>,
}

/// Reads options from a JSON object. Missing fields keep their default.
pub fn options_from_str(input: &str) -> Result<AnimOptions, Error> {
    let def: OptionsDef = serde_json::from_str(input).map_err(|e| Error::JsonParse {
        message: e.to_string(),
    })?;
    let d = AnimOptions::default();
    Ok(AnimOptions {
        sanitize_poses: def.sanitize_poses.unwrap_or(d.sanitize_poses),
        enable_validation: def.enable_validation.unwrap_or(d.enable_validation),
        enable_retargeting: def.enable_retargeting.unwrap_or(d.enable_retargeting),
        enable_double_retargeting: def
            .enable_double_retargeting
            .unwrap_or(d.enable_double_retargeting),
        allow_out_of_date_retargeting: def
            .allow_out_of_date_retargeting
            .unwrap_or(d.allow_out_of_date_retargeting),
        force_post_retargeting: def.force_post_retargeting.unwrap_or(d.force_post_retargeting),
        enable_joint_limits: def.enable_joint_limits.unwrap_or(d.enable_joint_limits),
        debug_metadata_available: def
            .debug_metadata_available
            .unwrap_or(d.debug_metadata_available),
        reasonable_translation_limit: def
            .reasonable_translation_limit
            .unwrap_or(d.reasonable_translation_limit),
        normalized_quat_tolerance: def
            .normalized_quat_tolerance
            .unwrap_or(d.normalized_quat_tolerance),
        max_batch_size: def.max_batch_size.unwrap_or(d.max_batch_size),
        batch_divisor: def.batch_divisor.unwrap_or(d.batch_divisor),
        retarget_cache_capacity: def
            .retarget_cache_capacity
            .unwrap_or(d.retarget_cache_capacity),
        skeleton_cache_capacity: def
            .skeleton_cache_capacity
            .unwrap_or(d.skeleton_cache_capacity),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyDef {
    hierarchy_id: u32,
    skeleton_id: u32,
    #[serde(default)]
    name: String,
    joints: Vec<JointJson>,
    segments: Vec<SegmentJson>,
    #[serde(default)]
    float_defaults: Vec<f32>,
    #[serde(default)]
    limits: Vec<LimitJson>,
    #[serde(default)]
    flip_pairs: Vec<[String; 2]>,
    #[serde(default)]
    input_controls: usize,
    #[serde(default)]
    persistent_data_size: usize,
}

fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn default_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

#[derive(Debug, Deserialize)]
struct JointJson {
    name: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    translation: [f32; 3],
    /// Quaternion as `[x, y, z, w]`.
    #[serde(default = "default_rotation")]
    rotation: [f32; 4],
    #[serde(default = "default_scale")]
    scale: [f32; 3],
}

#[derive(Debug, Deserialize)]
struct SegmentJson {
    joints: usize,
    #[serde(default)]
    groups: Vec<GroupJson>,
    #[serde(default)]
    drivers: Vec<DriverJson>,
}

#[derive(Debug, Deserialize)]
struct GroupJson {
    #[serde(default)]
    joints: usize,
    #[serde(default)]
    floats: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum DriverSourceJson {
    Float(usize),
    Input(usize),
}

fn default_one() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct DriverJson {
    source: DriverSourceJson,
    #[serde(default = "default_one")]
    scale: f32,
    #[serde(default)]
    offset: f32,
}

#[derive(Debug, Deserialize)]
struct LimitJson {
    joint: String,
    /// Limit type code, 0-8.
    kind: u8,
    min: f32,
    max: f32,
}

/// Builds a hierarchy from its JSON description. Joints refer to their parent and limits
/// and flip pairs to their joints by name.
pub fn hierarchy_from_str(input: &str) -> Result<JointHierarchy, Error> {
    let def: HierarchyDef = serde_json::from_str(input).map_err(|e| Error::JsonParse {
        message: e.to_string(),
    })?;

    let mut index_of = HashMap::<String, usize>::new();
    let mut builder = HierarchyBuilder::new(HierarchyId(def.hierarchy_id), SkeletonId(def.skeleton_id))
        .name(def.name)
        .default_float_channels(def.float_defaults)
        .input_controls(def.input_controls)
        .persistent_data(vec![0; def.persistent_data_size]);

    for (index, joint) in def.joints.into_iter().enumerate() {
        let parent = match joint.parent.as_deref() {
            None => None,
            Some(parent) => Some(index_of.get(parent).copied().ok_or_else(|| {
                Error::JsonUnknownParent {
                    joint: joint.name.clone(),
                    parent: parent.to_owned(),
                }
            })?),
        };
        let default = JointParams::new(
            Vec3::from_array(joint.translation),
            Quat::from_array(joint.rotation).normalize(),
            Vec3::from_array(joint.scale),
        );
        index_of.entry(joint.name.clone()).or_insert(index);
        builder = builder.joint(JointDef::new(joint.name, parent, default));
    }

    let lookup = |name: &str| {
        index_of.get(name).copied().ok_or_else(|| Error::JsonParse {
            message: format!("unknown joint '{name}'"),
        })
    };

    for segment in def.segments {
        let mut seg = SegmentDef::new(
            segment.joints,
            segment
                .groups
                .iter()
                .map(|g| GroupDef::new(g.joints, g.floats))
                .collect(),
        );
        seg.output_drivers = segment
            .drivers
            .iter()
            .map(|d| OutputControlDriver {
                source: match d.source {
                    DriverSourceJson::Float(c) => ControlSource::FloatChannel(c),
                    DriverSourceJson::Input(c) => ControlSource::InputControl(c),
                },
                scale: d.scale,
                offset: d.offset,
            })
            .collect();
        builder = builder.segment(seg);
    }

    for limit in &def.limits {
        let kind = JointLimitKind::from_code(limit.kind).ok_or_else(|| Error::JsonParse {
            message: format!("unknown joint limit type {} on '{}'", limit.kind, limit.joint),
        })?;
        builder = builder.joint_limit(JointLimitDef {
            joint: lookup(&limit.joint)?,
            kind,
            min: limit.min,
            max: limit.max,
        });
    }
    for [left, right] in &def.flip_pairs {
        builder = builder.flip_pair(FlipPair {
            left: lookup(left)?,
            right: lookup(right)?,
        });
    }

    builder.build()
}
