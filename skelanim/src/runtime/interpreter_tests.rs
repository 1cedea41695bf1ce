use crate::test_fixtures::{
    assert_approx, assert_mat4_identity, assert_vec3_approx, build_hierarchy, clip_program,
    context_with, offset_pose, pose_clip, segment_program, services_with, test_hierarchy,
    test_options, test_services,
};
use crate::{
    AnimClip, AnimPhaseCall, AnimatedJointPose, BlendMode, BlindData, ChannelFactor, Command,
    CommandList, Error, EvalMode, ExecutionContext, FeatherBlendTable, FlipPair, GroupDef,
    HierarchyBuilder, HierarchyId, JointDef, JointHierarchy, JointParams, OutputKind, OutputMask,
    PluginHandler, PluginId, RigPhaseCall, SegmentDef, SkeletonId, SkeletonTable, SnapshotTarget,
    construct_retarget_entry, interpret_segment,
};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn translation(m: &Mat4) -> Vec3 {
    m.w_axis.truncate()
}

fn group(commands: impl IntoIterator<Item = Command>, needed_instances: usize) -> Vec<Command> {
    let mut out = vec![Command::BeginProcessingGroup { needed_instances }];
    out.extend(commands);
    out.push(Command::EndProcessingGroup);
    out
}

fn run(
    ctx: &mut ExecutionContext,
    segment: usize,
    outputs: OutputMask,
) -> Result<(), Error> {
    interpret_segment(ctx, None, segment, outputs, &test_services(), EvalMode::Immediate)
}

fn default_clip(h: &JointHierarchy) -> Arc<AnimClip> {
    pose_clip(
        h,
        h.default_animated_pose().to_vec(),
        h.default_float_channels().to_vec(),
    )
}

#[test]
fn clip_fills_joint_params_and_floats() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::Z), vec![1.0, 2.0]);
    let mut ctx = context_with(&h, clip_program(&clip));

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS).unwrap();

    let jp = ctx.joint_params(0).unwrap();
    assert_eq!(jp.len(), 2);
    assert_vec3_approx(jp[0].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_vec3_approx(jp[1].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);
    assert!(ctx.is_processed(OutputKind::JointParams, 0));
    assert!(!ctx.is_processed(OutputKind::Transforms, 0));
    assert!(!ctx.is_processed(OutputKind::JointParams, 1));
}

#[test]
fn procedural_joints_are_included_on_request() {
    let h = test_hierarchy();
    let clip = default_clip(&h);
    let mut ctx = context_with(&h, clip_program(&clip));
    ctx.include_procedural_joint_params = true;

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap();

    let jp = ctx.joint_params(0).unwrap();
    assert_eq!(jp.len(), 3);
    assert_vec3_approx(jp[2].trans, Vec3::new(0.0, 0.5, 0.0));
}

#[test]
fn forward_kinematics_across_segments() {
    let h = test_hierarchy();
    let clip = default_clip(&h);
    let mut ctx = context_with(&h, clip_program(&clip));
    let outputs = OutputMask::TRANSFORMS | OutputMask::SKINNING_MATS;

    run(&mut ctx, 0, outputs).unwrap();
    run(&mut ctx, 1, outputs).unwrap();

    let seg0 = ctx.transforms(0).unwrap();
    assert_vec3_approx(translation(&seg0[0]), Vec3::new(0.0, 1.0, 0.0));
    assert_vec3_approx(translation(&seg0[1]), Vec3::new(0.0, 2.0, 0.0));
    assert_vec3_approx(translation(&seg0[2]), Vec3::new(0.0, 2.5, 0.0));
    let seg1 = ctx.transforms(1).unwrap();
    assert_vec3_approx(translation(&seg1[0]), Vec3::new(1.0, 2.0, 0.0));
    assert_vec3_approx(translation(&seg1[1]), Vec3::new(1.5, 2.0, 0.0));

    for m in ctx.all_skinning_matrices().unwrap() {
        assert_mat4_identity(m);
    }
    assert!(ctx.has_dependencies_for(1));
}

#[test]
fn driven_controls_follow_input_controls() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![1.0, 2.0]);
    let mut ctx = context_with(&h, clip_program(&clip));
    ctx.set_input_controls(&[3.0]);

    run(&mut ctx, 1, OutputMask::OUTPUT_CONTROLS).unwrap();

    let controls = ctx.output_controls(1).unwrap();
    assert_approx(controls[0], 2.0);
    assert_approx(controls[1], 7.0);
}

#[test]
fn prepare_overrides_input_controls() {
    let h = test_hierarchy();
    let mut commands = vec![Command::BeginSegment];
    commands.extend(group([Command::EvaluateBindPose { output: 0 }], 1));
    commands.extend([
        Command::EvaluateJointHierarchyPrepare {
            input_controls: Some(Arc::from([5.0])),
        },
        Command::EvaluateJointHierarchyEvaluate,
        Command::EndSegment,
    ]);
    let mut ctx = context_with(&h, CommandList::from_commands(commands).unwrap());
    ctx.set_input_controls(&[3.0]);

    run(&mut ctx, 1, OutputMask::OUTPUT_CONTROLS).unwrap();

    assert_approx(ctx.output_controls(1).unwrap()[1], 11.0);
}

#[test]
fn linear_blend_of_two_clips() {
    let h = test_hierarchy();
    let a = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![0.0, 0.0]);
    let b = pose_clip(&h, offset_pose(&h, Vec3::X * 2.0), vec![2.0, 4.0]);
    let program = segment_program(group(
        [
            Command::EvaluateClip {
                clip: a,
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateClip {
                clip: b,
                output: 1,
                frame: 0.0,
            },
            Command::EvaluateBlend {
                left: 0,
                right: 1,
                output: 0,
                mode: BlendMode::Linear,
                factor: 0.5,
            },
        ],
        2,
    ));
    let mut ctx = context_with(&h, program);

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS).unwrap();

    let jp = ctx.joint_params(0).unwrap();
    assert_vec3_approx(jp[0].trans, Vec3::new(1.0, 1.0, 0.0));
    assert_vec3_approx(jp[1].trans, Vec3::new(1.0, 1.0, 0.0));
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);
}

#[test]
fn feather_blend_scales_per_joint() {
    let h = test_hierarchy();
    let a = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![0.0, 0.0]);
    let b = pose_clip(&h, offset_pose(&h, Vec3::X * 2.0), vec![2.0, 4.0]);
    let table = FeatherBlendTable {
        joint_factors: vec![vec![ChannelFactor {
            channel: 1,
            factor: 0.0,
        }]],
        float_factors: Vec::new(),
    };
    let program = segment_program(group(
        [
            Command::EvaluateClip {
                clip: a,
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateClip {
                clip: b,
                output: 1,
                frame: 0.0,
            },
            Command::EvaluateFeatherBlend {
                left: 0,
                right: 1,
                output: 1,
                mode: BlendMode::Linear,
                factor: 1.0,
                table: Arc::new(table),
            },
            Command::EvaluateCopy { src: 1, dst: 0 },
        ],
        2,
    ));
    let mut ctx = context_with(&h, program);

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap();

    let jp = ctx.joint_params(0).unwrap();
    assert_vec3_approx(jp[0].trans, Vec3::new(2.0, 1.0, 0.0));
    assert_vec3_approx(jp[1].trans, Vec3::new(0.0, 1.0, 0.0));
}

#[test]
fn flip_mirrors_and_swaps_pairs() {
    let h = HierarchyBuilder::new(HierarchyId(40), SkeletonId(40))
        .joint(JointDef::new("root", None, JointParams::IDENTITY))
        .joint(JointDef::new("left", Some(0), JointParams::IDENTITY))
        .joint(JointDef::new("right", Some(0), JointParams::IDENTITY))
        .segment(SegmentDef::new(3, vec![GroupDef::new(3, 0)]))
        .flip_pair(FlipPair { left: 1, right: 2 })
        .build()
        .unwrap();
    let h = Arc::new(h);
    let joints = vec![
        JointParams::from_translation(Vec3::new(0.5, 1.0, 0.0)),
        JointParams::from_translation(Vec3::new(1.0, 0.0, 0.0)),
        JointParams::from_translation(Vec3::new(-2.0, 0.0, 0.0)),
    ];
    let clip = pose_clip(&h, joints, Vec::new());
    let program = segment_program(group(
        [
            Command::EvaluateClip {
                clip,
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateFlip { output: 0 },
        ],
        1,
    ));
    let mut ctx = context_with(&h, program);

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap();

    let jp = ctx.joint_params(0).unwrap();
    assert_vec3_approx(jp[0].trans, Vec3::new(-0.5, 1.0, 0.0));
    assert_vec3_approx(jp[1].trans, Vec3::new(2.0, 0.0, 0.0));
    assert_vec3_approx(jp[2].trans, Vec3::new(-1.0, 0.0, 0.0));
}

#[test]
fn blend_must_write_one_of_its_inputs() {
    let h = test_hierarchy();
    let program = segment_program(group(
        [Command::EvaluateBlend {
            left: 0,
            right: 1,
            output: 2,
            mode: BlendMode::Linear,
            factor: 0.5,
        }],
        3,
    ));
    let mut ctx = context_with(&h, program);

    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(
        matches!(err, Error::InvalidBlendOutput { output: 2, .. }),
        "{err}"
    );
    assert!(!ctx.is_processed(OutputKind::JointParams, 0));
}

#[test]
fn instance_index_is_bounds_checked() {
    let h = test_hierarchy();
    let program = segment_program(group([Command::EvaluateEmptyPose { output: 1 }], 1));
    let mut ctx = context_with(&h, program);

    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(
        matches!(
            err,
            Error::InstanceOutOfRange {
                instance: 1,
                declared: 1,
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn group_commands_need_an_open_group() {
    let h = test_hierarchy();
    let program = CommandList::from_commands([
        Command::BeginSegment,
        Command::EvaluateEmptyPose { output: 0 },
        Command::EndSegment,
    ])
    .unwrap();
    let mut ctx = context_with(&h, program);

    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(
        matches!(
            err,
            Error::UnexpectedCommand {
                index: 1,
                command: "EvaluateEmptyPose",
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn segment_must_end_exactly_once() {
    let h = test_hierarchy();

    let missing_end =
        CommandList::from_commands([Command::BeginSegment, Command::BeginAnimationPhase]).unwrap();
    let mut ctx = context_with(&h, missing_end);
    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(matches!(err, Error::UnterminatedSegment { .. }), "{err}");

    let trailing = CommandList::from_commands([
        Command::BeginSegment,
        Command::EndSegment,
        Command::BeginSegment,
    ])
    .unwrap();
    let mut ctx = context_with(&h, trailing);
    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(
        matches!(
            err,
            Error::UnterminatedSegment {
                consumed: 2,
                total: 3,
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn unclosed_group_is_rejected() {
    let h = test_hierarchy();
    let program = CommandList::from_commands([
        Command::BeginSegment,
        Command::BeginProcessingGroup {
            needed_instances: 1,
        },
        Command::EvaluateEmptyPose { output: 0 },
        Command::EndSegment,
    ])
    .unwrap();
    let mut ctx = context_with(&h, program);

    let err = run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(matches!(err, Error::UnclosedProcessingGroup { index: 1 }), "{err}");
}

#[test]
fn every_processing_group_runs_the_group_commands() {
    let h = HierarchyBuilder::new(HierarchyId(41), SkeletonId(41))
        .joint(JointDef::new("a", None, JointParams::IDENTITY))
        .joint(JointDef::new("b", Some(0), JointParams::IDENTITY))
        .joint(JointDef::new("c", Some(1), JointParams::IDENTITY))
        .segment(SegmentDef::new(
            3,
            vec![GroupDef::new(2, 0), GroupDef::new(0, 0), GroupDef::new(1, 1)],
        ))
        .build()
        .unwrap();
    let h = Arc::new(h);
    let clip = pose_clip(&h, offset_pose(&h, Vec3::Y), vec![4.0]);
    let plugins = Arc::new(CountingPlugins::default());
    let services = test_services().with_plugins(plugins.clone());
    let program = segment_program(group(
        [
            Command::EvaluateClip {
                clip,
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateAnimPhasePlugin {
                plugin: PluginId::from_name("lean"),
                joint_set: None,
                blind_data: BlindData::default(),
            },
        ],
        1,
    ));
    let mut ctx = context_with(&h, program);

    interpret_segment(
        &mut ctx,
        None,
        0,
        OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();

    for jp in ctx.joint_params(0).unwrap() {
        assert_vec3_approx(jp.trans, Vec3::Y);
    }
    assert_approx(ctx.output_controls(0).unwrap()[0], 4.0);
    // The group without channels is skipped.
    assert_eq!(plugins.anim_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn deferred_mode_replaces_unsafe_pose_reads() {
    let h = test_hierarchy();
    let pose = AnimatedJointPose::fully_valid(&h, offset_pose(&h, Vec3::X), vec![3.0, 3.0]).unwrap();
    let program = segment_program(group(
        [Command::EvaluatePose {
            output: 0,
            hierarchy_id: h.hierarchy_id(),
            pose: Arc::new(pose),
        }],
        1,
    ));
    let services = test_services();

    let mut immediate = context_with(&h, program.clone());
    interpret_segment(&mut immediate, None, 0, OutputMask::JOINT_PARAMS, &services, EvalMode::Immediate)
        .unwrap();
    assert_vec3_approx(immediate.joint_params(0).unwrap()[1].trans, Vec3::new(1.0, 1.0, 0.0));

    let mut deferred = context_with(&h, program);
    interpret_segment(&mut deferred, None, 0, OutputMask::JOINT_PARAMS, &services, EvalMode::Deferred)
        .unwrap();
    assert_eq!(deferred.joint_params(0).unwrap(), &h.default_animated_pose()[..2]);
}

#[test]
fn full_pose_is_skipped_when_deferred() {
    let h = test_hierarchy();
    let program = CommandList::from_commands([
        Command::BeginSegment,
        Command::EvaluateFullPose {
            joint_params: offset_pose(&h, Vec3::Z).into(),
            float_channels: Arc::from([9.0, 9.0]),
        },
        Command::EndSegment,
    ])
    .unwrap();
    let services = test_services();
    let outputs = OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS;

    let mut immediate = context_with(&h, program.clone());
    interpret_segment(&mut immediate, None, 0, outputs, &services, EvalMode::Immediate).unwrap();
    assert_vec3_approx(immediate.joint_params(0).unwrap()[0].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_approx(immediate.output_controls(0).unwrap()[0], 9.0);

    let mut deferred = context_with(&h, program);
    interpret_segment(&mut deferred, None, 0, outputs, &services, EvalMode::Deferred).unwrap();
    assert_eq!(deferred.joint_params(0).unwrap(), &h.default_animated_pose()[..2]);
    assert_approx(deferred.output_controls(0).unwrap()[0], 0.25);
}

#[test]
fn unresolvable_clip_evaluates_to_the_default_pose() {
    let h = test_hierarchy();
    let other = build_hierarchy(2, 20, 1.0);
    let clip = pose_clip(&other, offset_pose(&other, Vec3::X), vec![5.0, 5.0]);
    let mut ctx = context_with(&h, clip_program(&clip));

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS).unwrap();

    assert_eq!(ctx.joint_params(0).unwrap(), &h.default_animated_pose()[..2]);
    assert_approx(ctx.output_controls(0).unwrap()[0], 0.25);
}

#[test]
fn unresolvable_additive_clip_adds_nothing() {
    let h = test_hierarchy();
    let other = build_hierarchy(2, 20, 1.0);
    let mut additive = (*pose_clip(&other, offset_pose(&other, Vec3::X), vec![5.0, 5.0])).clone();
    additive.additive = true;
    let target = Arc::new(SnapshotTarget::new(&h));
    let program = segment_program(group(
        [
            Command::EvaluateClip {
                clip: pose_clip(&h, offset_pose(&h, Vec3::Z), vec![1.0, 2.0]),
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateSnapshot {
                input: 0,
                hierarchy_id: h.hierarchy_id(),
                target: target.clone(),
            },
            Command::EvaluateClip {
                clip: Arc::new(additive),
                output: 1,
                frame: 0.0,
            },
            Command::EvaluateSnapshot {
                input: 1,
                hierarchy_id: h.hierarchy_id(),
                target: target.clone(),
            },
            Command::EvaluateBlend {
                left: 0,
                right: 1,
                output: 0,
                mode: BlendMode::Additive,
                factor: 1.0,
            },
        ],
        2,
    ));
    let mut ctx = context_with(&h, program);

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS).unwrap();

    let stored = target.pose();
    assert!(stored.valid_bits[0].is_empty());
    assert!(stored.valid_bits[1].is_empty());
    let jp = ctx.joint_params(0).unwrap();
    assert_vec3_approx(jp[0].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_vec3_approx(jp[1].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);
}

#[test]
fn clip_through_a_disabled_entry_evaluates_to_the_default_pose() {
    let src = test_hierarchy();
    let dst = Arc::new(build_hierarchy(2, 20, 2.0));
    let entry = Arc::new(construct_retarget_entry(&src, None, &dst));
    entry.set_disabled(true);
    let mut table = SkeletonTable::new();
    table.insert_hierarchy(src.clone());
    table.insert_retarget(entry);
    let services = services_with(table, test_options());
    let clip = pose_clip(&src, offset_pose(&src, Vec3::Z), vec![1.0, 2.0]);
    let mut ctx = context_with(&dst, clip_program(&clip));

    interpret_segment(
        &mut ctx,
        None,
        0,
        OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();

    assert_eq!(ctx.joint_params(0).unwrap(), &dst.default_animated_pose()[..2]);
    assert_approx(ctx.output_controls(0).unwrap()[0], 0.25);
    assert!(services.retarget_cache().is_empty());
}

#[test]
fn float_channels_keep_processed_output_controls() {
    let h = test_hierarchy();
    let first = pose_clip(&h, offset_pose(&h, Vec3::Z), vec![1.0, 2.0]);
    let mut ctx = context_with(&h, clip_program(&first));
    run(&mut ctx, 0, OutputMask::OUTPUT_CONTROLS).unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);

    let second = pose_clip(&h, offset_pose(&h, Vec3::Z), vec![5.0, 6.0]);
    ctx.set_commands(clip_program(&second));
    run(&mut ctx, 0, OutputMask::FLOAT_CHANNELS).unwrap();

    assert!(ctx.is_processed(OutputKind::FloatChannels, 0));
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);

    // Same for a segment whose float channels come from the fallback.
    let mut ctx = context_with(&h, clip_program(&first));
    run(&mut ctx, 0, OutputMask::OUTPUT_CONTROLS).unwrap();
    ctx.set_commands(CommandList::from_commands([Command::BeginSegment, Command::EndSegment]).unwrap());
    run(&mut ctx, 0, OutputMask::FLOAT_CHANNELS).unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);
}

#[test]
fn snapshots_store_and_reload_instances() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::Z), vec![1.5, 2.5]);
    let target = Arc::new(SnapshotTarget::new(&h));
    let store = segment_program(group(
        [
            Command::EvaluateClip {
                clip,
                output: 0,
                frame: 0.0,
            },
            Command::EvaluateSnapshot {
                input: 0,
                hierarchy_id: h.hierarchy_id(),
                target: target.clone(),
            },
        ],
        1,
    ));
    let mut ctx = context_with(&h, store);
    run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap();

    let stored = target.pose();
    assert_vec3_approx(stored.joint_params[1].trans, Vec3::new(0.0, 1.0, 1.0));
    assert_approx(stored.float_channels[0], 1.5);
    assert!(stored.is_joint_valid(&h, 0));
    assert!(!stored.is_joint_valid(&h, 2));

    let reload = segment_program(group(
        [Command::EvaluateSnapshotPoseDeferred {
            output: 0,
            node: target,
        }],
        1,
    ));
    let mut ctx = context_with(&h, reload);
    interpret_segment(
        &mut ctx,
        None,
        0,
        OutputMask::JOINT_PARAMS,
        &test_services(),
        EvalMode::Deferred,
    )
    .unwrap();
    assert_vec3_approx(ctx.joint_params(0).unwrap()[1].trans, Vec3::new(0.0, 1.0, 1.0));
}

#[derive(Default)]
struct CountingPlugins {
    anim_calls: AtomicUsize,
    rig_calls: AtomicUsize,
}

impl PluginHandler for CountingPlugins {
    fn anim_phase(&self, call: AnimPhaseCall<'_>) {
        self.anim_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(call.group.instances.len(), 1);
    }

    fn rig_phase(&self, call: RigPhaseCall<'_>) {
        self.rig_calls.fetch_add(1, Ordering::SeqCst);
        let mut reader = call.blind_data.reader();
        if let Ok(value) = reader.read_f32() {
            call.float_channels[0] = value;
        }
    }
}

fn plugin_program() -> CommandList {
    let mut commands = vec![Command::BeginSegment, Command::BeginAnimationPhase];
    commands.extend(group(
        [
            Command::EvaluateBindPose { output: 0 },
            Command::EvaluateAnimPhasePlugin {
                plugin: PluginId::from_name("lean"),
                joint_set: None,
                blind_data: BlindData::default(),
            },
        ],
        1,
    ));
    commands.extend([
        Command::EndAnimationPhase,
        Command::EvaluateRigPhasePlugin {
            plugin: PluginId::from_name("ik"),
            joint_set: None,
            blind_data: BlindData::builder().f32(9.0).build(),
        },
        Command::EndSegment,
    ]);
    CommandList::from_commands(commands).unwrap()
}

#[test]
fn plugins_run_only_when_allowed() {
    let h = test_hierarchy();
    let plugins = Arc::new(CountingPlugins::default());
    let services = test_services().with_plugins(plugins.clone());
    let outputs = OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS;

    let mut ctx = context_with(&h, plugin_program());
    interpret_segment(&mut ctx, None, 0, outputs, &services, EvalMode::Immediate).unwrap();
    assert_eq!(plugins.anim_calls.load(Ordering::SeqCst), 1);
    assert_eq!(plugins.rig_calls.load(Ordering::SeqCst), 1);
    assert_approx(ctx.output_controls(0).unwrap()[0], 9.0);

    let mut ctx = context_with(&h, plugin_program());
    ctx.allow_anim_phase_plugins = false;
    ctx.allow_rig_phase_plugins = false;
    interpret_segment(&mut ctx, None, 0, outputs, &services, EvalMode::Immediate).unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 0.25);

    let mut ctx = context_with(&h, plugin_program());
    interpret_segment(&mut ctx, None, 0, outputs, &services, EvalMode::Deferred).unwrap();

    let mut ctx = context_with(&h, plugin_program());
    interpret_segment(&mut ctx, None, 1, outputs, &services, EvalMode::Immediate).unwrap();

    assert_eq!(plugins.anim_calls.load(Ordering::SeqCst), 1);
    assert_eq!(plugins.rig_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn repeated_requests_only_emit_missing_kinds() {
    let h = test_hierarchy();
    let clip = default_clip(&h);
    let mut ctx = context_with(&h, clip_program(&clip));

    run(&mut ctx, 0, OutputMask::JOINT_PARAMS).unwrap();
    run(&mut ctx, 0, OutputMask::JOINT_PARAMS | OutputMask::TRANSFORMS).unwrap();

    assert!(ctx.is_processed(OutputKind::JointParams, 0));
    assert!(ctx.is_processed(OutputKind::Transforms, 0));
}

#[test]
fn kinds_not_produced_fall_back_to_bind_pose() {
    let h = test_hierarchy();
    let program = CommandList::from_commands([Command::BeginSegment, Command::EndSegment]).unwrap();
    let mut ctx = context_with(&h, program);

    run(&mut ctx, 0, OutputMask::TRANSFORMS | OutputMask::OUTPUT_CONTROLS).unwrap();

    let transforms = ctx.transforms(0).unwrap();
    assert_vec3_approx(translation(&transforms[1]), Vec3::new(0.0, 2.0, 0.0));
    assert_approx(ctx.output_controls(0).unwrap()[0], 0.25);
    assert!(ctx.is_processed(OutputKind::OutputControls, 0));
}

#[test]
fn segment_index_is_checked() {
    let h = test_hierarchy();
    let mut ctx = context_with(&h, CommandList::bind_pose());
    let err = run(&mut ctx, 2, OutputMask::JOINT_PARAMS).unwrap_err();
    assert!(
        matches!(err, Error::SegmentOutOfRange { segment: 2, count: 2 }),
        "{err}"
    );
}
