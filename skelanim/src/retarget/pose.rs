use crate::{
    AnimClip, AnimServices, AnimatedJointPose, Command, CommandList, Error, EvalMode,
    ExecutionContext, JointHierarchy, OutputMask, RetargetEntry, SegmentMask, ValidBits,
    clear_segment_channels, construct_intermediate_hierarchy, construct_retarget_entry,
    request_segments,
};
use std::sync::Arc;

/// Parameters of an `EvaluateRetarget` command: where the evaluated source segment goes.
#[derive(Debug)]
pub struct RetargetPass {
    pub entry: Arc<RetargetEntry>,
    pub dst: Arc<JointHierarchy>,
    pub dst_segment: usize,
    pub additive: bool,
}

/// What gets retargeted.
#[derive(Copy, Clone, Debug)]
pub enum RetargetSource<'a> {
    Clip { clip: &'a Arc<AnimClip>, frame: f32 },
    Pose { pose: &'a Arc<AnimatedJointPose>, additive: bool },
}

impl RetargetSource<'_> {
    fn is_additive(&self) -> bool {
        match self {
            RetargetSource::Clip { clip, .. } => clip.additive,
            RetargetSource::Pose { additive, .. } => *additive,
        }
    }
}

/// Fills `dst_segment` of `out` by evaluating `source` on `src` and retargeting every source
/// segment the target segment reads from. Other segments of `out` are left untouched.
#[allow(clippy::too_many_arguments)]
pub fn retarget_pose_for_segment(
    services: &AnimServices,
    source: RetargetSource<'_>,
    src: &Arc<JointHierarchy>,
    dst: &Arc<JointHierarchy>,
    entry: &Arc<RetargetEntry>,
    dst_segment: usize,
    out: &mut AnimatedJointPose,
    mode: EvalMode,
) -> Result<(), Error> {
    out.check_layout(dst)?;
    clear_segment_channels(dst, dst_segment, out);

    let required = entry.source_segments_for(dst_segment) & src.all_segments();
    if required.is_empty() {
        return Ok(());
    }

    let command = match source {
        RetargetSource::Clip { clip, frame } => {
            if !clip_has_channels_in(clip, src, required) {
                log::debug!(
                    "clip '{}' animates nothing in segments {required:?} of '{}'",
                    clip.name,
                    src.name()
                );
                return Ok(());
            }
            Command::EvaluateClip {
                clip: clip.clone(),
                output: 0,
                frame,
            }
        }
        RetargetSource::Pose { pose, .. } => Command::EvaluatePoseDeferred {
            output: 0,
            hierarchy_id: src.hierarchy_id(),
            pose: pose.clone(),
        },
    };
    let pass = Arc::new(RetargetPass {
        entry: entry.clone(),
        dst: dst.clone(),
        dst_segment,
        additive: source.is_additive(),
    });

    let mut ctx = ExecutionContext::new(src.clone(), src.initial_persistent_data().to_vec())?;
    ctx.set_commands(CommandList::retarget_pass(command, pass));
    *ctx.retarget_output_mut() = Some(std::mem::take(out));
    let result = request_segments(&mut ctx, None, required, OutputMask::NONE, services, mode);
    if let Some(pose) = ctx.take_retarget_output() {
        *out = pose;
    }
    result
}

fn clip_has_channels_in(
    clip: &AnimClip,
    hierarchy: &JointHierarchy,
    segments: SegmentMask,
) -> bool {
    segments.iter().any(|seg| {
        hierarchy.processing_groups_in_segment(seg).iter().any(|pg| {
            !clip.channel_group_bits(pg.joint_channel_group).is_empty()
                || pg
                    .float_channel_group
                    .is_some_and(|cg| !clip.channel_group_bits(cg).is_empty())
        })
    })
}

/// Outcome of evaluating a clip recorded against another hierarchy.
#[derive(Clone, Debug, PartialEq)]
pub enum ClipFallback {
    /// Retargeted pose over the whole target hierarchy; only the requested segment is valid.
    Pose(AnimatedJointPose),
    /// Nothing to contribute.
    Empty,
    /// No route to the target: default pose, or empty for additive clips.
    Unresolved,
}

/// Resolves a clip whose hierarchy differs from `dst`, trying in order a registered retarget
/// entry (with double retargeting when the clip is out of date against its own skeleton),
/// then a name-matched retarget through the clip's debug skeleton.
pub fn evaluate_mismatched_clip(
    services: &AnimServices,
    mode: EvalMode,
    dst: &Arc<JointHierarchy>,
    segment: usize,
    clip: &Arc<AnimClip>,
    frame: f32,
) -> ClipFallback {
    let options = &services.options;

    if clip.skeleton_id != dst.skeleton_id() && options.enable_retargeting {
        let entry = services
            .assets()
            .lookup_retarget(clip.skeleton_id, dst.skeleton_id())
            .filter(|e| !e.is_disabled());
        let src_skel = services.assets().lookup_hierarchy(clip.skeleton_id);
        if let (Some(entry), Some(src_skel)) = (entry, src_skel) {
            if src_skel.hierarchy_id() != clip.hierarchy_id {
                if !options.enable_double_retargeting {
                    return ClipFallback::Empty;
                }
                let retargeted = services
                    .tasks()
                    .blocking(|| {
                        double_retarget(services, mode, clip, frame, &src_skel, dst, &entry, segment)
                    })
                    .wait();
                return retargeted.map_or(ClipFallback::Unresolved, ClipFallback::Pose);
            }
            if entry.source_segments_for(segment).is_empty() {
                return ClipFallback::Empty;
            }
            return retarget_clip(services, mode, clip, frame, &src_skel, dst, &entry, segment);
        }
    }

    if options.allow_out_of_date_retargeting
        && options.debug_metadata_available
        && clip.skeleton_id == dst.skeleton_id()
        && clip.debug_info.is_some()
    {
        let Some(anim) = intermediate_hierarchy(services, clip) else {
            return ClipFallback::Unresolved;
        };
        let entry = services.retarget_cache().get_or_construct(
            anim.hierarchy_id(),
            dst.hierarchy_id(),
            || construct_retarget_entry(&anim, None, dst),
        );
        if entry.is_disabled() {
            return ClipFallback::Unresolved;
        }
        return retarget_clip(services, mode, clip, frame, &anim, dst, &entry, segment);
    }

    ClipFallback::Unresolved
}

fn intermediate_hierarchy(services: &AnimServices, clip: &AnimClip) -> Option<Arc<JointHierarchy>> {
    services
        .skeleton_cache()
        .get_or_try_construct(clip.hierarchy_id, || construct_intermediate_hierarchy(clip))
}

#[allow(clippy::too_many_arguments)]
fn retarget_clip(
    services: &AnimServices,
    mode: EvalMode,
    clip: &Arc<AnimClip>,
    frame: f32,
    src: &Arc<JointHierarchy>,
    dst: &Arc<JointHierarchy>,
    entry: &Arc<RetargetEntry>,
    segment: usize,
) -> ClipFallback {
    let mut out = AnimatedJointPose::empty(dst);
    match retarget_pose_for_segment(
        services,
        RetargetSource::Clip { clip, frame },
        src,
        dst,
        entry,
        segment,
        &mut out,
        mode,
    ) {
        Ok(()) => ClipFallback::Pose(out),
        Err(err) => {
            log::warn!(
                "retargeting clip '{}' onto '{}' segment {segment} failed: {err}",
                clip.name,
                dst.name()
            );
            ClipFallback::Unresolved
        }
    }
}

/// Clip -> up-to-date source skeleton through the clip's debug skeleton, then source -> `dst`.
#[allow(clippy::too_many_arguments)]
fn double_retarget(
    services: &AnimServices,
    mode: EvalMode,
    clip: &Arc<AnimClip>,
    frame: f32,
    src_skel: &Arc<JointHierarchy>,
    dst: &Arc<JointHierarchy>,
    entry: &Arc<RetargetEntry>,
    segment: usize,
) -> Option<AnimatedJointPose> {
    if !services.options.debug_metadata_available {
        log::debug!("clip '{}' is out of date and no debug skeleton is available", clip.name);
        return None;
    }
    let anim = intermediate_hierarchy(services, clip)?;
    let anim_entry = services.retarget_cache().get_or_construct(
        anim.hierarchy_id(),
        src_skel.hierarchy_id(),
        || construct_retarget_entry(&anim, None, src_skel),
    );
    if anim_entry.is_disabled() {
        return None;
    }

    let run = || -> Result<AnimatedJointPose, Error> {
        let mut src_pose = AnimatedJointPose::empty(src_skel);
        for src_segment in entry.source_segments_for(segment).iter() {
            retarget_pose_for_segment(
                services,
                RetargetSource::Clip { clip, frame },
                &anim,
                src_skel,
                &anim_entry,
                src_segment,
                &mut src_pose,
                mode,
            )?;
        }
        let src_pose = Arc::new(src_pose);
        let mut out = AnimatedJointPose::empty(dst);
        retarget_pose_for_segment(
            services,
            RetargetSource::Pose {
                pose: &src_pose,
                additive: clip.additive,
            },
            src_skel,
            dst,
            entry,
            segment,
            &mut out,
            mode,
        )?;
        Ok(out)
    };
    match run() {
        Ok(pose) => Some(pose),
        Err(err) => {
            log::warn!("double retargeting of clip '{}' failed: {err}", clip.name);
            None
        }
    }
}

/// Joint valid bits a clip will produce in processing group `group` of `hierarchy` once
/// retargeted onto it.
pub fn retargeted_valid_bits(
    services: &AnimServices,
    hierarchy: &JointHierarchy,
    clip: &AnimClip,
    group: usize,
) -> ValidBits {
    let Some(pg) = hierarchy.processing_group(group) else {
        return ValidBits::EMPTY;
    };
    if clip.hierarchy_id == hierarchy.hierarchy_id() {
        return if group < clip.groups.len() {
            clip.channel_group_bits(pg.joint_channel_group)
        } else {
            ValidBits::ALL
        };
    }
    if !services.options.enable_retargeting {
        return ValidBits::EMPTY;
    }

    let entry = services
        .assets()
        .lookup_retarget(clip.skeleton_id, hierarchy.skeleton_id());
    let entry = match entry {
        None if clip.skeleton_id == hierarchy.skeleton_id() => {
            return clip.channel_group_bits(pg.joint_channel_group);
        }
        Some(entry) if !entry.is_disabled() => entry,
        _ => return ValidBits::EMPTY,
    };

    let src = services.assets().lookup_hierarchy(clip.skeleton_id);
    let mut bits = ValidBits::EMPTY;
    for jr in &entry.joints {
        let Some(dst_bit) = hierarchy
            .joint_valid_bit(jr.dst_anim_index)
            .filter(|b| b.channel_group == pg.joint_channel_group)
        else {
            continue;
        };
        let src_set = match &src {
            Some(src) => src
                .joint_valid_bit(jr.src_anim_index)
                .is_some_and(|b| b.is_set(&clip.valid_bits)),
            None => true,
        };
        if src_set {
            bits.set_bit(dst_bit.bit);
        }
    }
    bits
}
