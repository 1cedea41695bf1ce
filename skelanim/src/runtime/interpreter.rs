use crate::{
    AnimClip, AnimPhaseCall, AnimServices, AnimatedJointPose, BlendMode, BlindData, ClipFallback,
    Command, CommandCursor, CommandList, Error, EvalMode, ExecutionContext, FeatherBlendTable,
    GroupView, Instance, JointHierarchy, JointParams, JointSetId, OutputKind, OutputMask,
    PluginId, ProcessingGroup, RetargetSource, RigPhaseCall, Segment, SegmentSource, ValidBits,
    apply_joint_limits, blend_instances, compute_output_controls, compute_skinning,
    compute_transforms, construct_retarget_entry, evaluate_mismatched_clip,
    fill_invalid_from_default, flip_instance, math, retarget_joints_in_segment,
    retarget_pose_for_segment,
};
use glam::Mat4;
use std::sync::Arc;

/// Scratch outputs of one segment. Written to the context only at `EndSegment`.
#[derive(Debug)]
struct SegmentState {
    /// Every joint of the segment, animated joints first.
    joint_params: Vec<JointParams>,
    float_channels: Vec<f32>,
    /// Indexed by global channel group.
    valid: Vec<ValidBits>,
    transforms: Option<Vec<Mat4>>,
    skinning: Option<Vec<Mat4>>,
    output_controls: Option<Vec<f32>>,
    input_controls: Option<Arc<[f32]>>,
    produced: OutputMask,
}

impl SegmentState {
    fn new(hierarchy: &JointHierarchy, seg: &Segment) -> Self {
        Self {
            joint_params: hierarchy.joints()[seg.joint_range()]
                .iter()
                .map(|j| j.default)
                .collect(),
            float_channels: hierarchy.default_float_channels()[seg.float_range()].to_vec(),
            valid: vec![ValidBits::EMPTY; hierarchy.num_channel_groups()],
            transforms: None,
            skinning: None,
            output_controls: None,
            input_controls: None,
            produced: OutputMask::NONE,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct OpenGroup {
    begin: usize,
    /// Global index and layout of the group; `None` when the segment has no group left.
    group: Option<(usize, ProcessingGroup)>,
}

struct Interpreter<'a> {
    ctx: &'a mut ExecutionContext,
    prev: Option<&'a ExecutionContext>,
    services: &'a AnimServices,
    mode: EvalMode,
    hierarchy: Arc<JointHierarchy>,
    segment: usize,
    seg: Segment,
    wanted: OutputMask,
    state: SegmentState,
    instances: Vec<Instance>,
    open_group: Option<OpenGroup>,
    next_group: usize,
    /// Resolved mismatched clips, by command index. Each group of the segment reuses them.
    fallbacks: Vec<(usize, ClipFallback)>,
    commands: Arc<CommandList>,
}

/// Runs the context's command list for one segment and writes every kind in `outputs` that
/// the context has not processed yet. Kinds the commands did not produce are filled from
/// `prev` or the bind pose.
pub fn interpret_segment(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    segment: usize,
    outputs: OutputMask,
    services: &AnimServices,
    mode: EvalMode,
) -> Result<(), Error> {
    let hierarchy = ctx.hierarchy().clone();
    let seg = hierarchy
        .segment(segment)
        .cloned()
        .ok_or(Error::SegmentOutOfRange {
            segment,
            count: hierarchy.num_segments(),
        })?;
    let commands = ctx.commands().clone();
    let mut interpreter = Interpreter {
        state: SegmentState::new(&hierarchy, &seg),
        ctx,
        prev,
        services,
        mode,
        hierarchy,
        segment,
        seg,
        wanted: outputs,
        instances: Vec::new(),
        open_group: None,
        next_group: 0,
        fallbacks: Vec::new(),
        commands,
    };
    interpreter.run()
}

impl Interpreter<'_> {
    fn run(&mut self) -> Result<(), Error> {
        let commands = self.commands.clone();
        let mut cursor = commands.cursor();
        while let Some((index, cmd)) = cursor.next_command() {
            if self.mode == EvalMode::Deferred && !cmd.is_deferred_safe() {
                self.skip_deferred(index, cmd)?;
                continue;
            }
            match cmd {
                Command::BeginSegment
                | Command::BeginAnimationPhase
                | Command::Layer { .. }
                | Command::State { .. }
                | Command::Track { .. } => {}
                Command::EndSegment => return self.end_segment(&cursor),
                Command::EndAnimationPhase => {
                    self.state.produced |= OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS;
                }
                Command::BeginProcessingGroup { needed_instances } => {
                    self.begin_group(index, *needed_instances, &mut cursor)?;
                }
                Command::EndProcessingGroup => self.end_group(index, &mut cursor)?,
                Command::EvaluateClip {
                    clip,
                    output,
                    frame,
                } => self.evaluate_clip(index, cmd, clip, *output, *frame)?,
                Command::EvaluateBlend {
                    left,
                    right,
                    output,
                    mode,
                    factor,
                } => {
                    self.current_group(index, cmd)?;
                    self.blend(index, cmd, [*left, *right, *output], *mode, *factor, None)?;
                }
                Command::EvaluateFeatherBlend {
                    left,
                    right,
                    output,
                    mode,
                    factor,
                    table,
                } => {
                    let (group_index, _) = self.current_group(index, cmd)?;
                    self.blend(
                        index,
                        cmd,
                        [*left, *right, *output],
                        *mode,
                        *factor,
                        Some((table.as_ref(), group_index)),
                    )?;
                }
                Command::EvaluateFlip { output } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let hierarchy = self.hierarchy.clone();
                    flip_instance(self.instance_mut(index, *output)?, &hierarchy, &group);
                }
                Command::EvaluateEmptyPose { output } => {
                    self.current_group(index, cmd)?;
                    self.instance_mut(index, *output)?.clear();
                }
                Command::EvaluateBindPose { output } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let hierarchy = self.hierarchy.clone();
                    self.instance_mut(index, *output)?
                        .set_default(&hierarchy, &group);
                }
                Command::EvaluatePose {
                    output,
                    hierarchy_id,
                    pose,
                }
                | Command::EvaluatePoseDeferred {
                    output,
                    hierarchy_id,
                    pose,
                } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let usable = *hierarchy_id == self.hierarchy.hierarchy_id()
                        && pose.matches_layout(&self.hierarchy);
                    let inst = self.instance_mut(index, *output)?;
                    if usable {
                        inst.load_pose(&group, pose);
                    } else {
                        inst.clear();
                    }
                    self.finish_instance(index, cmd, *output);
                }
                Command::EvaluateSnapshot {
                    input,
                    hierarchy_id,
                    target,
                } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let id = self.hierarchy.hierarchy_id();
                    let inst = self.instance_ref(index, *input)?;
                    if *hierarchy_id == id && target.hierarchy_id() == id {
                        target.with_pose_mut(|pose| store_if_matching(inst, &group, pose));
                    }
                }
                Command::EvaluateSnapshotDeferred { input, node } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let id = self.hierarchy.hierarchy_id();
                    let inst = self.instance_ref(index, *input)?;
                    if node.hierarchy_id() == id {
                        node.with_pose_mut(|pose| store_if_matching(inst, &group, pose));
                    }
                }
                Command::EvaluateSnapshotPoseDeferred { output, node } => {
                    let (_, group) = self.current_group(index, cmd)?;
                    let hierarchy = self.hierarchy.clone();
                    let inst = self.instance_mut(index, *output)?;
                    let loaded = node.hierarchy_id() == hierarchy.hierarchy_id()
                        && node.with_pose(|pose| {
                            let ok = pose.matches_layout(&hierarchy);
                            if ok {
                                inst.load_pose(&group, pose);
                            }
                            ok
                        });
                    if !loaded {
                        inst.clear();
                    }
                    self.finish_instance(index, cmd, *output);
                }
                Command::EvaluateCopy { src, dst } => {
                    self.current_group(index, cmd)?;
                    let copy = self.instance_ref(index, *src)?.clone();
                    *self.instance_mut(index, *dst)? = copy;
                }
                Command::EvaluateImpliedPose => self.implied_pose(),
                Command::EvaluateFullPose {
                    joint_params,
                    float_channels,
                } => self.full_pose(Some((joint_params, float_channels))),
                Command::EvaluateJointHierarchyPrepare { input_controls } => {
                    if self.wants_rig() {
                        self.prepare(input_controls.clone());
                    }
                }
                Command::EvaluateJointHierarchyEvaluate => {
                    if self.wants_rig() {
                        self.evaluate_rig();
                    }
                }
                Command::EvaluateAnimPhasePlugin {
                    plugin,
                    joint_set,
                    blind_data,
                } => self.anim_phase_plugin(index, cmd, *plugin, *joint_set, blind_data)?,
                Command::EvaluateRigPhasePlugin {
                    plugin,
                    joint_set,
                    blind_data,
                } => self.rig_phase_plugin(*plugin, *joint_set, blind_data),
                Command::EvaluatePostRetarget {
                    src,
                    pose,
                    additive,
                } => self.post_retarget(src, pose, *additive)?,
                Command::EvaluateRetarget(pass) => {
                    let seg = &self.seg;
                    let out = self
                        .ctx
                        .retarget_output_mut()
                        .get_or_insert_with(|| AnimatedJointPose::empty(&pass.dst));
                    retarget_joints_in_segment(
                        &self.services.options,
                        &pass.entry,
                        &self.hierarchy,
                        SegmentSource {
                            segment: self.segment,
                            joint_params: &self.state.joint_params[..seg.num_animated_joints],
                            float_channels: &self.state.float_channels,
                            valid_bits: &self.state.valid,
                        },
                        &pass.dst,
                        pass.dst_segment,
                        pass.additive,
                        out,
                    );
                }
            }
        }
        Err(Error::UnterminatedSegment {
            segment: self.segment,
            consumed: cursor.position(),
            total: commands.len(),
        })
    }

    /// Stand-in for commands that may not run in deferred mode.
    fn skip_deferred(&mut self, index: usize, cmd: &Command) -> Result<(), Error> {
        match cmd {
            Command::EvaluatePose { output, .. } => {
                self.current_group(index, cmd)?;
                self.instance_mut(index, *output)?.clear();
            }
            Command::EvaluateFullPose { .. } => self.full_pose(None),
            _ => {}
        }
        Ok(())
    }

    fn unexpected(&self, index: usize, cmd: &Command, message: &str) -> Error {
        Error::UnexpectedCommand {
            index,
            command: cmd.name(),
            message: message.to_owned(),
        }
    }

    fn current_group(&self, index: usize, cmd: &Command) -> Result<(usize, ProcessingGroup), Error> {
        match self.open_group {
            Some(OpenGroup {
                group: Some(group), ..
            }) => Ok(group),
            _ => Err(self.unexpected(index, cmd, "no processing group is open")),
        }
    }

    fn check_instance(&self, index: usize, instance: usize) -> Result<(), Error> {
        if instance < self.instances.len() {
            Ok(())
        } else {
            Err(Error::InstanceOutOfRange {
                index,
                instance,
                declared: self.instances.len(),
            })
        }
    }

    fn instance_ref(&self, index: usize, instance: usize) -> Result<&Instance, Error> {
        self.check_instance(index, instance)?;
        Ok(&self.instances[instance])
    }

    fn instance_mut(&mut self, index: usize, instance: usize) -> Result<&mut Instance, Error> {
        self.check_instance(index, instance)?;
        Ok(&mut self.instances[instance])
    }

    fn begin_group(
        &mut self,
        index: usize,
        needed_instances: usize,
        cursor: &mut CommandCursor<'_>,
    ) -> Result<(), Error> {
        if self.open_group.is_some() {
            return Err(Error::UnclosedProcessingGroup { index });
        }
        let group = self
            .hierarchy
            .processing_groups_in_segment(self.segment)
            .get(self.next_group)
            .map(|g| (self.seg.first_processing_group + self.next_group, *g));
        self.open_group = Some(OpenGroup {
            begin: index,
            group,
        });
        match group {
            Some((_, g)) if !g.is_empty() => {
                self.instances = (0..needed_instances.max(1))
                    .map(|_| Instance::new(&g))
                    .collect();
            }
            _ => {
                self.instances.clear();
                cursor.skip_to_end_processing_group()?;
            }
        }
        Ok(())
    }

    fn end_group(&mut self, index: usize, cursor: &mut CommandCursor<'_>) -> Result<(), Error> {
        let Some(open) = self.open_group.take() else {
            return Err(Error::UnexpectedCommand {
                index,
                command: "EndProcessingGroup",
                message: "no processing group is open".to_owned(),
            });
        };
        if let Some((_, group)) = open.group.filter(|(_, g)| !g.is_empty()) {
            if self.services.options.enable_validation {
                if let Some(problem) = self.instances.first().and_then(|i| i.validate(&self.services.options)) {
                    log::warn!(
                        "segment {} group output invalid: {problem}\n{}",
                        self.segment,
                        self.commands.dump()
                    );
                }
            }
            if let Some(inst) = self.instances.first_mut() {
                self.state.valid[group.joint_channel_group] = inst.joint_valid;
                if let Some(cg) = group.float_channel_group {
                    self.state.valid[cg] = inst.float_valid;
                }
                inst.fill_undefined_from_default(&self.hierarchy, &group);
                let joints = group.animated_range();
                let offset = self.seg.first_animated_joint;
                self.state.joint_params[joints.start - offset..joints.end - offset]
                    .copy_from_slice(&inst.joints);
                let floats = group.float_range();
                let offset = self.seg.first_float_channel;
                self.state.float_channels[floats.start - offset..floats.end - offset]
                    .copy_from_slice(&inst.floats);
            }
        }
        self.instances.clear();
        self.next_group += 1;
        if self.next_group < self.seg.num_processing_groups {
            cursor.rewind_to(open.begin);
        }
        Ok(())
    }

    fn end_segment(&mut self, cursor: &CommandCursor<'_>) -> Result<(), Error> {
        if let Some(open) = self.open_group {
            return Err(Error::UnclosedProcessingGroup { index: open.begin });
        }
        if !cursor.is_consumed() {
            return Err(Error::UnterminatedSegment {
                segment: self.segment,
                consumed: cursor.position(),
                total: self.commands.len(),
            });
        }
        self.emit_outputs();
        Ok(())
    }

    /// Sanitizes and validates an instance an operation just wrote.
    fn finish_instance(&mut self, index: usize, cmd: &Command, output: usize) {
        let options = &self.services.options;
        let Some(inst) = self.instances.get_mut(output) else {
            return;
        };
        if options.sanitize_poses {
            let reset = inst.sanitize(options);
            if reset > 0 {
                log::warn!(
                    "reset {reset} bad channels written by {} at command {index} (segment {})\n{}",
                    cmd.name(),
                    self.segment,
                    self.commands.dump()
                );
            }
        }
        if options.enable_validation {
            if let Some(problem) = inst.validate(options) {
                log::warn!(
                    "{} at command {index} produced invalid data: {problem}\n{}",
                    cmd.name(),
                    self.commands.dump()
                );
            }
        }
    }

    fn validate_instances(&self, index: usize, cmd: &Command, when: &str) {
        if !self.services.options.enable_validation {
            return;
        }
        for (i, inst) in self.instances.iter().enumerate() {
            if let Some(problem) = inst.validate(&self.services.options) {
                log::warn!(
                    "instance {i} invalid {when} {} at command {index}: {problem}\n{}",
                    cmd.name(),
                    self.commands.dump()
                );
            }
        }
    }

    fn evaluate_clip(
        &mut self,
        index: usize,
        cmd: &Command,
        clip: &Arc<AnimClip>,
        output: usize,
        frame: f32,
    ) -> Result<(), Error> {
        let (_, group) = self.current_group(index, cmd)?;
        self.check_instance(index, output)?;
        let services = self.services;

        if clip.hierarchy_id == self.hierarchy.hierarchy_id() {
            let hook = services.clip_hook();
            let inst = &mut self.instances[output];
            let filled = hook.is_some_and(|h| h.before_clip(clip, frame, &group, inst));
            if !filled {
                inst.sample_clip(clip, &group, frame);
            }
            if let Some(hook) = hook {
                hook.after_clip(clip, frame, &group, inst);
            }
        } else {
            let slot = match self.fallbacks.iter().position(|(i, _)| *i == index) {
                Some(slot) => slot,
                None => {
                    let fallback = evaluate_mismatched_clip(
                        services,
                        self.mode,
                        &self.hierarchy,
                        self.segment,
                        clip,
                        frame,
                    );
                    log::debug!(
                        "clip '{}' on '{}' segment {}: {}",
                        clip.name,
                        self.hierarchy.name(),
                        self.segment,
                        match &fallback {
                            ClipFallback::Pose(_) => "retargeted",
                            ClipFallback::Empty => "empty",
                            ClipFallback::Unresolved => "unresolved",
                        }
                    );
                    self.fallbacks.push((index, fallback));
                    self.fallbacks.len() - 1
                }
            };
            let inst = &mut self.instances[output];
            match &self.fallbacks[slot].1 {
                ClipFallback::Pose(pose) => inst.load_pose(&group, pose),
                ClipFallback::Empty => inst.clear(),
                ClipFallback::Unresolved if clip.additive => inst.clear(),
                ClipFallback::Unresolved => inst.set_default(&self.hierarchy, &group),
            }
        }
        self.finish_instance(index, cmd, output);
        Ok(())
    }

    fn blend(
        &mut self,
        index: usize,
        cmd: &Command,
        [left, right, output]: [usize; 3],
        mode: BlendMode,
        factor: f32,
        feather: Option<(&FeatherBlendTable, usize)>,
    ) -> Result<(), Error> {
        self.check_instance(index, left)?;
        self.check_instance(index, right)?;
        self.check_instance(index, output)?;
        if output != left && output != right {
            return Err(Error::InvalidBlendOutput {
                index,
                left,
                right,
                output,
            });
        }
        let blended = blend_instances(
            &self.instances[left],
            &self.instances[right],
            mode,
            factor,
            feather,
        );
        self.instances[output] = blended;
        self.finish_instance(index, cmd, output);
        Ok(())
    }

    fn mark_segment_valid(&mut self) {
        let full = self.hierarchy.full_valid_bits();
        for cg in self.seg.channel_group_range() {
            self.state.valid[cg] = full[cg];
        }
    }

    /// Float channels come from this frame's context when already emitted, else from the
    /// previous frame, else stay at their defaults.
    fn implied_pose(&mut self) {
        let segment = self.segment;
        if let Some(jp) = self.ctx.joint_params(segment) {
            let n = jp.len().min(self.state.joint_params.len());
            self.state.joint_params[..n].copy_from_slice(&jp[..n]);
        }

        let id = self.hierarchy.hierarchy_id();
        let floats = [Some(&*self.ctx), self.prev]
            .into_iter()
            .flatten()
            .filter(|c| c.hierarchy().hierarchy_id() == id)
            .find(|c| {
                c.is_processed(OutputKind::FloatChannels, segment)
                    || c.is_processed(OutputKind::OutputControls, segment)
            })
            .and_then(|c| c.output_controls(segment));
        if let Some(oc) = floats {
            let n = self.state.float_channels.len().min(oc.len());
            self.state.float_channels[..n].copy_from_slice(&oc[..n]);
        }
        self.mark_segment_valid();
    }

    /// Replaces segment 0's animated pose. `None` writes the default pose.
    fn full_pose(&mut self, pose: Option<(&Arc<[JointParams]>, &Arc<[f32]>)>) {
        if self.segment != 0 {
            return;
        }
        let (joints, floats) = match pose {
            Some((joints, floats)) => (&joints[..], &floats[..]),
            None => (
                self.hierarchy.default_animated_pose(),
                self.hierarchy.default_float_channels(),
            ),
        };
        let n = self.seg.num_animated_joints.min(joints.len());
        self.state.joint_params[..n].copy_from_slice(&joints[..n]);
        let n = self.seg.num_float_channels.min(floats.len());
        self.state.float_channels[..n].copy_from_slice(&floats[..n]);
        self.mark_segment_valid();
        self.state.produced |= OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS;
    }

    fn wants_rig(&self) -> bool {
        self.wanted.intersects(
            OutputMask::TRANSFORMS | OutputMask::SKINNING_MATS | OutputMask::OUTPUT_CONTROLS,
        ) || (self.wanted.contains(OutputKind::JointParams)
            && self.ctx.include_procedural_joint_params)
    }

    fn prepare(&mut self, input_controls: Option<Arc<[f32]>>) {
        if self.segment == 0 && self.services.options.enable_joint_limits {
            apply_joint_limits(&self.hierarchy, &mut self.state.joint_params);
        }
        self.state.input_controls = input_controls;
    }

    fn evaluate_rig(&mut self) {
        let services = self.services;
        let hierarchy = &self.hierarchy;
        let seg = &self.seg;
        let segment = self.segment;
        let locals = &self.state.joint_params;
        let dependencies = self.ctx.dependency_table();

        let mut transforms = vec![Mat4::IDENTITY; seg.num_joints];
        let compiled = services
            .compiled_rig(hierarchy.hierarchy_id())
            .is_some_and(|rig| {
                services
                    .tasks()
                    .blocking(|| rig.evaluate(hierarchy, segment, locals, dependencies, &mut transforms))
                    .wait()
            });
        if !compiled {
            compute_transforms(hierarchy, seg, locals, dependencies, &mut transforms);
        }
        self.ctx.store_dependency_transforms(segment, &transforms);

        let mut skinning = vec![Mat4::IDENTITY; seg.num_joints];
        compute_skinning(hierarchy, seg, &transforms, &mut skinning);

        let mut controls = vec![0.0; seg.num_output_controls];
        let inputs = self
            .state
            .input_controls
            .as_deref()
            .unwrap_or(self.ctx.input_controls());
        compute_output_controls(seg, &self.state.float_channels, inputs, &mut controls);

        self.state.transforms = Some(transforms);
        self.state.skinning = Some(skinning);
        self.state.output_controls = Some(controls);
        self.state.produced |=
            OutputMask::TRANSFORMS | OutputMask::SKINNING_MATS | OutputMask::OUTPUT_CONTROLS;
    }

    fn anim_phase_plugin(
        &mut self,
        index: usize,
        cmd: &Command,
        plugin: PluginId,
        joint_set: Option<JointSetId>,
        blind_data: &BlindData,
    ) -> Result<(), Error> {
        if !self.ctx.allow_anim_phase_plugins || self.segment != 0 {
            return Ok(());
        }
        let services = self.services;
        let Some(handler) = services.plugins() else {
            return Ok(());
        };
        let (group_index, group) = self.current_group(index, cmd)?;
        self.validate_instances(index, cmd, "before");
        let (ctx_inputs, persistent_data) = self.ctx.plugin_io();
        handler.anim_phase(AnimPhaseCall {
            plugin,
            joint_set,
            blind_data,
            hierarchy: &self.hierarchy,
            segment: self.segment,
            group: GroupView {
                index: group_index,
                group: &group,
                instances: &mut self.instances,
            },
            input_controls: self.state.input_controls.as_deref().unwrap_or(ctx_inputs),
            persistent_data,
        });
        self.validate_instances(index, cmd, "after");
        Ok(())
    }

    fn rig_phase_plugin(&mut self, plugin: PluginId, joint_set: Option<JointSetId>, blind_data: &BlindData) {
        if !self.ctx.allow_rig_phase_plugins || self.segment != 0 {
            return;
        }
        let services = self.services;
        let Some(handler) = services.plugins() else {
            return;
        };
        let (ctx_inputs, persistent_data) = self.ctx.plugin_io();
        handler.rig_phase(RigPhaseCall {
            plugin,
            joint_set,
            blind_data,
            hierarchy: &self.hierarchy,
            segment: self.segment,
            joint_params: &mut self.state.joint_params,
            float_channels: &mut self.state.float_channels,
            input_controls: self.state.input_controls.as_deref().unwrap_or(ctx_inputs),
            persistent_data,
        });
    }

    /// Retargets `pose` from `src` onto this segment, filling whatever stays invalid from
    /// the default pose.
    fn post_retarget(
        &mut self,
        src: &Arc<JointHierarchy>,
        pose: &Arc<AnimatedJointPose>,
        additive: bool,
    ) -> Result<(), Error> {
        let services = self.services;
        let dst = &self.hierarchy;
        // Name matching reads joint names, which only exist with debug metadata.
        let entry = services
            .assets()
            .lookup_retarget(src.skeleton_id(), dst.skeleton_id())
            .or_else(|| {
                services.options.debug_metadata_available.then(|| {
                    services.retarget_cache().get_or_construct(
                        src.hierarchy_id(),
                        dst.hierarchy_id(),
                        || construct_retarget_entry(src, None, dst),
                    )
                })
            });

        let mut out = AnimatedJointPose::empty(dst);
        if let Some(entry) = entry.filter(|e| !e.is_disabled()) {
            retarget_pose_for_segment(
                services,
                RetargetSource::Pose { pose, additive },
                src,
                dst,
                &entry,
                self.segment,
                &mut out,
                self.mode,
            )?;
        }
        fill_invalid_from_default(dst, self.segment, &mut out);

        let seg = &self.seg;
        let n = seg.num_animated_joints;
        self.state.joint_params[..n].copy_from_slice(&out.joint_params[seg.animated_range()]);
        self.state
            .float_channels
            .copy_from_slice(&out.float_channels[seg.float_range()]);
        self.mark_segment_valid();
        self.state.produced |= OutputMask::JOINT_PARAMS | OutputMask::FLOAT_CHANNELS;
        Ok(())
    }

    fn emit_outputs(&mut self) {
        let segment = self.segment;
        let seg = &self.seg;
        let state = &self.state;
        let ctx = &mut *self.ctx;

        if self.services.options.enable_validation
            && state.produced.contains(OutputKind::JointParams)
        {
            let tolerance = self.services.options.normalized_quat_tolerance;
            if let Some(bad) = state
                .joint_params
                .iter()
                .position(|jp| !jp.is_finite() || !math::is_normalized_within(jp.quat, tolerance))
            {
                log::warn!(
                    "segment {segment} emits a bad joint at offset {bad}\n{}",
                    self.commands.dump()
                );
            }
        }

        let mut missing = OutputMask::NONE;
        for kind in self.wanted.kinds() {
            if ctx.is_processed(kind, segment) {
                continue;
            }
            if !state.produced.contains(kind) {
                missing |= kind.mask();
                continue;
            }
            match kind {
                OutputKind::JointParams => {
                    ctx.allocate_joint_params(segment);
                    if let Some(buf) = ctx.joint_params_buffer(segment) {
                        let n = buf.len().min(state.joint_params.len());
                        buf[..n].copy_from_slice(&state.joint_params[..n]);
                    }
                }
                OutputKind::FloatChannels => {
                    // Processed output controls already hold this segment's float prefix.
                    let written = ctx.is_processed(OutputKind::OutputControls, segment);
                    ctx.allocate_output_controls();
                    if let Some(buf) = ctx.output_controls_buffer().filter(|_| !written) {
                        let start = seg.first_output_control;
                        buf[start..start + seg.num_float_channels]
                            .copy_from_slice(&state.float_channels);
                    }
                }
                OutputKind::Transforms => {
                    ctx.allocate_transforms(segment);
                    if let (Some(buf), Some(src)) =
                        (ctx.transforms_buffer(segment), state.transforms.as_deref())
                    {
                        buf.copy_from_slice(src);
                    }
                }
                OutputKind::SkinningMats => {
                    ctx.allocate_skinning_buffer();
                    if let (Some(buf), Some(src)) =
                        (ctx.skinning_buffer(), state.skinning.as_deref())
                    {
                        buf[seg.joint_range()].copy_from_slice(src);
                    }
                }
                OutputKind::OutputControls => {
                    let skip = if ctx.is_processed(OutputKind::FloatChannels, segment) {
                        seg.num_float_channels
                    } else {
                        0
                    };
                    ctx.allocate_output_controls();
                    if let (Some(buf), Some(src)) =
                        (ctx.output_controls_buffer(), state.output_controls.as_deref())
                    {
                        let start = seg.first_output_control;
                        buf[start + skip..start + seg.num_output_controls]
                            .copy_from_slice(&src[skip..]);
                    }
                }
            }
            ctx.mark_processed(kind, segment);
        }

        if !missing.is_empty() {
            log::debug!("segment {segment} did not produce {missing:?}, using fallback outputs");
            emit_fallback_outputs(ctx, self.prev, segment, missing);
        }
    }
}

fn store_if_matching(inst: &Instance, group: &ProcessingGroup, pose: &mut AnimatedJointPose) {
    if pose.joint_params.len() >= group.animated_range().end
        && pose.float_channels.len() >= group.float_range().end
        && pose.valid_bits.len() > group.joint_channel_group
        && group
            .float_channel_group
            .is_none_or(|cg| pose.valid_bits.len() > cg)
    {
        inst.store_pose(group, pose);
    }
}

/// Writes every kind in `outputs` the context has not processed for `segment` without
/// running any command: the previous frame's values where it has them, else the bind pose.
pub(crate) fn emit_fallback_outputs(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    segment: usize,
    outputs: OutputMask,
) {
    let hierarchy = ctx.hierarchy().clone();
    let Some(seg) = hierarchy.segment(segment) else {
        return;
    };
    let prev = prev.filter(|p| p.hierarchy().hierarchy_id() == hierarchy.hierarchy_id());
    let from_prev = |kind: OutputKind| prev.filter(|p| p.is_processed(kind, segment));

    for kind in outputs.kinds() {
        if ctx.is_processed(kind, segment) {
            continue;
        }
        match kind {
            OutputKind::JointParams => {
                ctx.allocate_joint_params(segment);
                if let Some(buf) = ctx.joint_params_buffer(segment) {
                    for (jp, joint) in buf.iter_mut().zip(&hierarchy.joints()[seg.joint_range()]) {
                        *jp = joint.default;
                    }
                }
            }
            OutputKind::FloatChannels => {
                let range = seg.first_output_control..seg.first_output_control + seg.num_float_channels;
                let values = match from_prev(kind).and_then(|p| p.all_output_controls()) {
                    Some(oc) => oc[range.clone()].to_vec(),
                    None => hierarchy.default_float_channels()[seg.float_range()].to_vec(),
                };
                let written = ctx.is_processed(OutputKind::OutputControls, segment);
                ctx.allocate_output_controls();
                if let Some(buf) = ctx.output_controls_buffer().filter(|_| !written) {
                    buf[range].copy_from_slice(&values);
                }
            }
            OutputKind::OutputControls => {
                let range =
                    seg.first_output_control..seg.first_output_control + seg.num_output_controls;
                let values = match from_prev(kind).and_then(|p| p.all_output_controls()) {
                    Some(oc) => oc[range.clone()].to_vec(),
                    None => {
                        let mut values = hierarchy.default_float_channels()[seg.float_range()].to_vec();
                        values.resize(seg.num_output_controls, 0.0);
                        values
                    }
                };
                let skip = if ctx.is_processed(OutputKind::FloatChannels, segment) {
                    seg.num_float_channels
                } else {
                    0
                };
                ctx.allocate_output_controls();
                if let Some(buf) = ctx.output_controls_buffer() {
                    buf[range.start + skip..range.end].copy_from_slice(&values[skip..]);
                }
            }
            OutputKind::Transforms => {
                let bind: Vec<Mat4> = hierarchy.inverse_bind_pose()[seg.joint_range()]
                    .iter()
                    .map(Mat4::inverse)
                    .collect();
                ctx.allocate_transforms(segment);
                if let Some(buf) = ctx.transforms_buffer(segment) {
                    buf.copy_from_slice(&bind);
                }
                ctx.store_dependency_transforms(segment, &bind);
            }
            OutputKind::SkinningMats => {
                let previous = from_prev(kind)
                    .and_then(|p| p.skinning_matrices(segment))
                    .map(<[Mat4]>::to_vec);
                ctx.allocate_skinning_buffer();
                if let Some(buf) = ctx.skinning_buffer() {
                    match previous {
                        Some(mats) => buf[seg.joint_range()].copy_from_slice(&mats),
                        None => {
                            for joint in seg.joint_range() {
                                let parent = hierarchy.parent(joint).map_or(Mat4::IDENTITY, |p| buf[p]);
                                buf[joint] = parent;
                            }
                        }
                    }
                }
            }
        }
        ctx.mark_processed(kind, segment);
    }
}
