use crate::{
    AnimClip, AnimOptions, AnimServices, ClipFrame, Command, CommandList, ControlSource,
    ExecutionContext, GroupDef, HierarchyBuilder, HierarchyId, JointDef, JointHierarchy,
    JointParams, OutputControlDriver, SegmentDef, SkeletonId, SkeletonTable,
};
use glam::{Mat4, Vec3};
use std::sync::Arc;

pub(crate) fn assert_approx(actual: f32, expected: f32) {
    let diff = (actual - expected).abs();
    assert!(
        diff <= 1.0e-6,
        "expected {expected}, got {actual} (diff {diff})"
    );
}

pub(crate) fn assert_vec3_approx(actual: Vec3, expected: Vec3) {
    assert_approx(actual.x, expected.x);
    assert_approx(actual.y, expected.y);
    assert_approx(actual.z, expected.z);
}

pub(crate) fn assert_mat4_identity(actual: &Mat4) {
    for (a, e) in actual
        .to_cols_array()
        .iter()
        .zip(Mat4::IDENTITY.to_cols_array())
    {
        assert!((a - e).abs() <= 1.0e-5, "expected identity, got {actual:?}");
    }
}

/// Two segments:
///
/// - segment 0: `root` and `spine` animated, `spine_tip` procedural; one float channel
/// - segment 1: `hand` (child of `spine`) animated, `finger` procedural; one float channel
///   and a control driven by input control 0 as `input * 2 + 1`
pub(crate) fn build_hierarchy(id: u32, skeleton: u32, root_height: f32) -> JointHierarchy {
    let t = |x: f32, y: f32| JointParams::from_translation(Vec3::new(x, y, 0.0));
    let mut hand_segment = SegmentDef::new(2, vec![GroupDef::new(1, 1)]);
    hand_segment.output_drivers.push(OutputControlDriver {
        source: ControlSource::InputControl(0),
        scale: 2.0,
        offset: 1.0,
    });
    HierarchyBuilder::new(HierarchyId(id), SkeletonId(skeleton))
        .name(format!("test-{id}"))
        .joint(JointDef::new("root", None, t(0.0, root_height)))
        .joint(JointDef::new("spine", Some(0), t(0.0, 1.0)))
        .joint(JointDef::new("spine_tip", Some(1), t(0.0, 0.5)))
        .joint(JointDef::new("hand", Some(1), t(1.0, 0.0)))
        .joint(JointDef::new("finger", Some(3), t(0.5, 0.0)))
        .segment(SegmentDef::new(3, vec![GroupDef::new(2, 1)]))
        .segment(hand_segment)
        .default_float_channels(vec![0.25, 0.5])
        .input_controls(1)
        .build()
        .expect("test hierarchy")
}

pub(crate) fn test_hierarchy() -> Arc<JointHierarchy> {
    Arc::new(build_hierarchy(1, 10, 1.0))
}

pub(crate) fn test_options() -> AnimOptions {
    AnimOptions {
        enable_validation: true,
        debug_metadata_available: true,
        ..AnimOptions::default()
    }
}

pub(crate) fn test_services() -> AnimServices {
    services_with(SkeletonTable::new(), test_options())
}

pub(crate) fn services_with(table: SkeletonTable, options: AnimOptions) -> AnimServices {
    AnimServices::new(options, Arc::new(table))
}

/// Single-frame clip over every channel of `hierarchy`.
pub(crate) fn pose_clip(
    hierarchy: &JointHierarchy,
    joint_params: Vec<JointParams>,
    float_channels: Vec<f32>,
) -> Arc<AnimClip> {
    let mut clip = AnimClip::new(
        hierarchy,
        vec![ClipFrame {
            joint_params,
            float_channels,
        }],
    );
    clip.name = "pose".to_owned();
    Arc::new(clip)
}

/// Joint params of every animated joint, each translated by `offset` from its default.
pub(crate) fn offset_pose(hierarchy: &JointHierarchy, offset: Vec3) -> Vec<JointParams> {
    hierarchy
        .default_animated_pose()
        .iter()
        .map(|jp| JointParams {
            trans: jp.trans + offset,
            ..*jp
        })
        .collect()
}

/// Wraps one processing group's commands into a full segment program that also
/// evaluates the rig.
pub(crate) fn segment_program(group: impl IntoIterator<Item = Command>) -> CommandList {
    let mut commands = vec![
        Command::BeginSegment,
        Command::BeginAnimationPhase,
    ];
    commands.extend(group);
    commands.extend([
        Command::EndAnimationPhase,
        Command::EvaluateJointHierarchyPrepare {
            input_controls: None,
        },
        Command::EvaluateJointHierarchyEvaluate,
        Command::EndSegment,
    ]);
    CommandList::from_commands(commands).expect("command list fits")
}

/// Program sampling `clip` into instance 0 of every group.
pub(crate) fn clip_program(clip: &Arc<AnimClip>) -> CommandList {
    segment_program([
        Command::BeginProcessingGroup {
            needed_instances: 1,
        },
        Command::EvaluateClip {
            clip: clip.clone(),
            output: 0,
            frame: 0.0,
        },
        Command::EndProcessingGroup,
    ])
}

pub(crate) fn context_with(
    hierarchy: &Arc<JointHierarchy>,
    commands: CommandList,
) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(hierarchy.clone(), hierarchy.initial_persistent_data().to_vec())
        .expect("context");
    ctx.set_commands(commands);
    ctx
}
