use crate::test_fixtures::{
    assert_approx, assert_vec3_approx, clip_program, context_with, offset_pose, pose_clip,
    segment_program, services_with, test_hierarchy, test_options, test_services,
};
use crate::{
    AnimClip, AnimOptions, BlendMode, ClipEvalHook, Command, CommandList, ContextPool, Error,
    EvalMode, GroupDef, HierarchyBuilder, HierarchyId, Instance, JointDef, JointHierarchy,
    JointParams, OutputKind, OutputMask, ProcessingGroup, SegmentDef, SegmentMask, SkeletonId,
    SkeletonTable, TaskPool, process_batch, request_segments, request_segments_with_implied_pose,
};
use glam::Vec3;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingHook {
    clips: AtomicUsize,
}

impl ClipEvalHook for CountingHook {
    fn before_clip(
        &self,
        _clip: &AnimClip,
        _frame: f32,
        _group: &ProcessingGroup,
        _instance: &mut Instance,
    ) -> bool {
        self.clips.fetch_add(1, Ordering::SeqCst);
        false
    }
}

#[test]
fn kinematic_requests_pull_in_ancestor_segments() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![0.0, 0.0]);
    let mut ctx = context_with(&h, clip_program(&clip));

    request_segments(
        &mut ctx,
        None,
        SegmentMask::single(1),
        OutputMask::TRANSFORMS,
        &test_services(),
        EvalMode::Immediate,
    )
    .unwrap();

    assert_eq!(ctx.processed(OutputKind::Transforms), SegmentMask::first(2));
    let hand = ctx.transforms(1).unwrap()[0];
    assert_vec3_approx(hand.w_axis.truncate(), Vec3::new(1.0, 2.0, 0.0));
}

#[test]
fn joint_param_requests_stay_local() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![0.0, 0.0]);
    let mut ctx = context_with(&h, clip_program(&clip));

    request_segments(
        &mut ctx,
        None,
        SegmentMask::single(1),
        OutputMask::JOINT_PARAMS,
        &test_services(),
        EvalMode::Immediate,
    )
    .unwrap();

    assert_eq!(ctx.processed(OutputKind::JointParams), SegmentMask::single(1));
    assert!(ctx.joint_params(0).is_none());
}

#[test]
fn satisfied_requests_do_not_rerun_commands() {
    let h = test_hierarchy();
    let hook = Arc::new(CountingHook::default());
    let services = test_services().with_clip_hook(hook.clone());
    let clip = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![0.0, 0.0]);
    let mut ctx = context_with(&h, clip_program(&clip));
    let all = h.all_segments();

    request_segments(&mut ctx, None, all, OutputMask::TRANSFORMS, &services, EvalMode::Immediate)
        .unwrap();
    assert_eq!(hook.clips.load(Ordering::SeqCst), 2);

    request_segments(&mut ctx, None, all, OutputMask::TRANSFORMS, &services, EvalMode::Immediate)
        .unwrap();
    assert_eq!(hook.clips.load(Ordering::SeqCst), 2);

    // A new kind reruns the segment and only emits what is missing.
    request_segments(
        &mut ctx,
        None,
        SegmentMask::single(0),
        OutputMask::TRANSFORMS | OutputMask::JOINT_PARAMS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();
    assert_eq!(hook.clips.load(Ordering::SeqCst), 3);
    assert!(ctx.is_processed(OutputKind::JointParams, 0));
}

#[test]
fn unknown_segments_are_rejected() {
    let h = test_hierarchy();
    let mut ctx = context_with(&h, CommandList::bind_pose());
    let err = request_segments(
        &mut ctx,
        None,
        SegmentMask::single(5),
        OutputMask::JOINT_PARAMS,
        &test_services(),
        EvalMode::Immediate,
    )
    .unwrap_err();
    assert!(
        matches!(err, Error::SegmentOutOfRange { segment: 5, count: 2 }),
        "{err}"
    );
    assert!(ctx.processed(OutputKind::JointParams).is_empty());
}

#[test]
fn failing_segments_still_get_outputs() {
    let h = test_hierarchy();
    let program = segment_program([
        Command::BeginProcessingGroup {
            needed_instances: 3,
        },
        Command::EvaluateBlend {
            left: 0,
            right: 1,
            output: 2,
            mode: BlendMode::Linear,
            factor: 0.5,
        },
        Command::EndProcessingGroup,
    ]);
    let mut ctx = context_with(&h, program);

    let err = request_segments(
        &mut ctx,
        None,
        h.all_segments(),
        OutputMask::JOINT_PARAMS | OutputMask::TRANSFORMS,
        &test_services(),
        EvalMode::Immediate,
    )
    .unwrap_err();

    assert!(matches!(err, Error::InvalidBlendOutput { .. }), "{err}");
    assert_eq!(ctx.processed(OutputKind::JointParams), SegmentMask::first(2));
    assert_eq!(ctx.processed(OutputKind::Transforms), SegmentMask::first(2));
    assert_eq!(ctx.joint_params(1).unwrap(), &h.default_animated_pose()[2..]);
    let spine = ctx.transforms(0).unwrap()[1];
    assert_vec3_approx(spine.w_axis.truncate(), Vec3::new(0.0, 2.0, 0.0));
}

#[test]
fn implied_pose_uses_edited_joint_params() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::X), vec![0.0, 0.0]);
    let mut ctx = context_with(&h, clip_program(&clip));
    ctx.joint_params_mut(0).unwrap()[1].trans = Vec3::new(0.0, 5.0, 0.0);
    let services = test_services();

    request_segments_with_implied_pose(
        &mut ctx,
        None,
        SegmentMask::single(0),
        OutputMask::TRANSFORMS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();

    let spine = ctx.transforms(0).unwrap()[1];
    assert_vec3_approx(spine.w_axis.truncate(), Vec3::new(0.0, 6.0, 0.0));
    assert!(!ctx.commands().is_empty());

    let err = request_segments_with_implied_pose(
        &mut ctx,
        None,
        SegmentMask::single(0),
        OutputMask::JOINT_PARAMS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ImpliedPoseJointParams), "{err}");
}

#[test]
fn implied_pose_carries_float_channels_from_the_previous_frame() {
    let h = test_hierarchy();
    let services = test_services();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::X), vec![3.0, 4.0]);
    let mut prev = context_with(&h, clip_program(&clip));
    request_segments(
        &mut prev,
        None,
        SegmentMask::single(0),
        OutputMask::FLOAT_CHANNELS | OutputMask::OUTPUT_CONTROLS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();

    let mut ctx = context_with(&h, clip_program(&clip));
    ctx.joint_params_mut(0).unwrap()[1].trans = Vec3::new(0.0, 5.0, 0.0);
    request_segments_with_implied_pose(
        &mut ctx,
        Some(&prev),
        SegmentMask::single(0),
        OutputMask::OUTPUT_CONTROLS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 3.0);

    // Without a previous frame the channels stay at their defaults.
    let mut ctx = context_with(&h, clip_program(&clip));
    ctx.joint_params_mut(0).unwrap();
    request_segments_with_implied_pose(
        &mut ctx,
        None,
        SegmentMask::single(0),
        OutputMask::OUTPUT_CONTROLS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 0.25);
}

#[test]
fn empty_command_list_uses_bind_pose_past_segment_zero() {
    let h = test_hierarchy();
    let services = test_services();
    let outputs = OutputMask::TRANSFORMS | OutputMask::SKINNING_MATS | OutputMask::OUTPUT_CONTROLS;
    let prev = context_with(&h, CommandList::new());

    let mut ctx = context_with(&h, CommandList::new());
    ctx.set_input_controls(&[3.0]);
    request_segments(&mut ctx, Some(&prev), SegmentMask::single(1), outputs, &services, EvalMode::Immediate)
        .unwrap();
    let controls = ctx.output_controls(1).unwrap();
    assert_approx(controls[0], 0.5);
    assert_approx(controls[1], 7.0);
    assert!(ctx.commands().is_empty());

    // Without a previous frame, the outputs come straight from the fallback.
    let mut ctx = context_with(&h, CommandList::new());
    ctx.set_input_controls(&[3.0]);
    request_segments(&mut ctx, None, SegmentMask::single(1), outputs, &services, EvalMode::Immediate)
        .unwrap();
    let controls = ctx.output_controls(1).unwrap();
    assert_approx(controls[0], 0.5);
    assert_approx(controls[1], 0.0);
    let finger = ctx.transforms(1).unwrap()[1];
    assert_vec3_approx(finger.w_axis.truncate(), Vec3::new(1.5, 2.0, 0.0));
}

#[test]
fn fallback_prefers_previous_frame_controls() {
    let h = test_hierarchy();
    let services = test_services();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::ZERO), vec![1.0, 2.0]);
    let mut prev = context_with(&h, clip_program(&clip));
    request_segments(
        &mut prev,
        None,
        h.all_segments(),
        OutputMask::FLOAT_CHANNELS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();

    let mut ctx = context_with(&h, CommandList::new());
    request_segments(
        &mut ctx,
        Some(&prev),
        h.all_segments(),
        OutputMask::FLOAT_CHANNELS,
        &services,
        EvalMode::Immediate,
    )
    .unwrap();
    assert_approx(ctx.output_controls(0).unwrap()[0], 1.0);
    assert_approx(ctx.output_controls(1).unwrap()[0], 2.0);
}

#[test]
fn batch_results_come_back_in_job_order() {
    let h = test_hierarchy();
    let options = AnimOptions {
        batch_divisor: 2,
        ..test_options()
    };
    let services = services_with(SkeletonTable::new(), options)
        .with_task_pool(TaskPool::with_threads(2).unwrap());

    let mut pool = ContextPool::new(5);
    for slot in [0, 1, 2, 4] {
        let offset = Vec3::X * slot as f32;
        let clip = pose_clip(&h, offset_pose(&h, offset), vec![0.0, 0.0]);
        pool.allocate(slot, h.clone())
            .unwrap()
            .set_commands(clip_program(&clip));
    }

    let jobs = pool.batch_jobs(|slot, _| {
        let required = if slot == 4 {
            SegmentMask::single(7)
        } else {
            SegmentMask::first(2)
        };
        Some((required, OutputMask::TRANSFORMS))
    });
    assert_eq!(jobs.len(), 4);
    let results = process_batch(jobs, &services, EvalMode::Immediate);

    assert_eq!(results.len(), 4);
    assert!(results[..3].iter().all(Result::is_ok));
    assert!(matches!(results[3], Err(Error::SegmentOutOfRange { segment: 7, .. })));
    for slot in [0, 1, 2] {
        let root = pool.get(slot).unwrap().transforms(0).unwrap()[0];
        assert_vec3_approx(root.w_axis.truncate(), Vec3::new(slot as f32, 1.0, 0.0));
    }
    assert!(pool.get(3).is_none());
}

#[test]
fn empty_batch_is_a_no_op() {
    assert!(process_batch(Vec::new(), &test_services(), EvalMode::Deferred).is_empty());
}

fn stateful_hierarchy(id: u32) -> Arc<JointHierarchy> {
    let h = HierarchyBuilder::new(HierarchyId(id), SkeletonId(id))
        .joint(JointDef::new("root", None, JointParams::IDENTITY))
        .segment(SegmentDef::new(1, vec![GroupDef::new(1, 0)]))
        .persistent_data(vec![0; 2])
        .build()
        .unwrap();
    Arc::new(h)
}

#[test]
fn pool_carries_persistent_data_across_frames() {
    let h = stateful_hierarchy(50);
    let mut pool = ContextPool::new(2);

    pool.allocate(0, h.clone()).unwrap().persistent_data_mut()[0] = 7;
    assert!(matches!(
        pool.allocate(0, h.clone()),
        Err(Error::ContextSlot { slot: 0 })
    ));
    assert!(matches!(
        pool.allocate(5, h.clone()),
        Err(Error::ContextSlot { slot: 5 })
    ));

    pool.begin_frame();
    assert_eq!(pool.frame(), 1);
    assert!(pool.get(0).is_none());
    assert!(pool.previous(0).is_some());
    assert_eq!(pool.allocate(0, h.clone()).unwrap().persistent_data(), &[7, 0]);
    assert_eq!(pool.allocate(1, h.clone()).unwrap().persistent_data(), &[0, 0]);
    let (_, prev) = pool.pair_mut(0).unwrap();
    assert!(prev.is_some());

    pool.begin_frame();
    pool.allocate(0, stateful_hierarchy(51)).unwrap();
    assert_eq!(pool.get(0).unwrap().persistent_data(), &[0, 0]);
    let (_, prev) = pool.pair_mut(0).unwrap();
    assert!(prev.is_none());
}

#[test]
fn joint_cache_moves_segment_zero_buffers_between_frames() {
    let h = test_hierarchy();
    let clip = pose_clip(&h, offset_pose(&h, Vec3::Y), vec![0.0, 0.0]);
    let mut pool = ContextPool::new(1);
    let ctx = pool.allocate(0, h.clone()).unwrap();
    ctx.set_commands(clip_program(&clip));
    request_segments(
        ctx,
        None,
        SegmentMask::single(0),
        OutputMask::JOINT_PARAMS | OutputMask::TRANSFORMS,
        &test_services(),
        EvalMode::Immediate,
    )
    .unwrap();
    let cache = ctx.take_joint_cache();
    assert_eq!(cache.joint_params.len(), 2);
    assert_eq!(cache.transforms.len(), 3);

    pool.begin_frame();
    let ctx = pool.allocate_with_cache(0, h.clone(), cache).unwrap();
    assert_vec3_approx(ctx.joint_params(0).unwrap()[0].trans, Vec3::new(0.0, 2.0, 0.0));
    assert!(!ctx.is_processed(OutputKind::JointParams, 0));
}
