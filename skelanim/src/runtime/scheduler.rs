use crate::{
    AnimServices, CommandList, Error, EvalMode, ExecutionContext, OutputKind, OutputMask,
    SegmentMask, emit_fallback_outputs, interpret_segment,
};

/// Runs every segment in `required` (and, for kinematic outputs, its ancestor segments) that
/// has not yet produced all of `outputs`. [`OutputMask::NONE`] runs the segments regardless.
///
/// A segment whose commands fail still receives fallback outputs; the first failure is
/// returned after the remaining segments ran.
pub fn request_segments(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    required: SegmentMask,
    outputs: OutputMask,
    services: &AnimServices,
    mode: EvalMode,
) -> Result<(), Error> {
    schedule(ctx, prev, required, outputs, services, mode, false)
}

/// Like [`request_segments`], but segment 0 rebuilds its outputs from the joint params
/// already stored in the context (edited by gameplay) instead of running its commands.
pub fn request_segments_with_implied_pose(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    required: SegmentMask,
    outputs: OutputMask,
    services: &AnimServices,
    mode: EvalMode,
) -> Result<(), Error> {
    if outputs.contains(OutputKind::JointParams) {
        return Err(Error::ImpliedPoseJointParams);
    }
    schedule(ctx, prev, required, outputs, services, mode, true)
}

fn schedule(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    required: SegmentMask,
    outputs: OutputMask,
    services: &AnimServices,
    mode: EvalMode,
    implied_pose: bool,
) -> Result<(), Error> {
    let hierarchy = ctx.hierarchy().clone();
    let all = hierarchy.all_segments();
    if let Some(segment) = required.difference(all).iter().next() {
        return Err(Error::SegmentOutOfRange {
            segment,
            count: hierarchy.num_segments(),
        });
    }

    let mut segments = required;
    if needs_ancestors(ctx, outputs) {
        for segment in required.iter() {
            segments = segments | hierarchy.dependencies(segment);
        }
    }

    let mut first_error = None;
    for segment in segments.iter() {
        let pending = outputs
            .kinds()
            .any(|kind| !ctx.is_processed(kind, segment));
        if !outputs.is_empty() && !pending {
            continue;
        }

        let result = if implied_pose && segment == 0 && ctx.joint_params(0).is_some() {
            log::debug!("segment 0 of '{}': implied pose, outputs {outputs:?}", hierarchy.name());
            run_with(ctx, prev, segment, outputs, services, mode, CommandList::implied_pose())
        } else if ctx.commands().is_empty() {
            if use_bind_pose(ctx, prev, segment, outputs) {
                log::debug!("segment {segment} of '{}': bind pose, outputs {outputs:?}", hierarchy.name());
                run_with(ctx, prev, segment, outputs, services, mode, CommandList::bind_pose())
            } else {
                log::debug!("segment {segment} of '{}': no commands, outputs {outputs:?}", hierarchy.name());
                emit_fallback_outputs(ctx, prev, segment, outputs);
                Ok(())
            }
        } else {
            log::debug!(
                "segment {segment} of '{}': outputs {outputs:?}, retarget {}",
                hierarchy.name(),
                ctx.has_retarget_output()
            );
            interpret_segment(ctx, prev, segment, outputs, services, mode)
        };

        if let Err(err) = result {
            log::error!(
                "segment {segment} of '{}' failed: {err}\n{}",
                hierarchy.name(),
                ctx.commands().dump()
            );
            emit_fallback_outputs(ctx, prev, segment, outputs);
            first_error.get_or_insert(err);
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let mut missing = SegmentMask::EMPTY;
    for kind in outputs.kinds() {
        missing = missing | required.difference(ctx.processed(kind));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::SegmentNotProcessed { missing, outputs })
    }
}

/// Pure joint-param and float requests only need the requested segments themselves.
fn needs_ancestors(ctx: &ExecutionContext, outputs: OutputMask) -> bool {
    outputs.intersects(OutputMask::TRANSFORMS | OutputMask::SKINNING_MATS)
        || (outputs.contains(OutputKind::JointParams) && ctx.include_procedural_joint_params)
}

/// A character without commands this frame gets a bind pose on segments past 0 when
/// neither frame has skinning or output controls for them yet.
fn use_bind_pose(
    ctx: &ExecutionContext,
    prev: Option<&ExecutionContext>,
    segment: usize,
    outputs: OutputMask,
) -> bool {
    let Some(prev) = prev else {
        return false;
    };
    let unavailable = |kind: OutputKind| {
        outputs.contains(kind) && !ctx.is_processed(kind, segment) && !prev.is_processed(kind, segment)
    };
    segment > 0
        && ctx.has_dependencies_for(segment)
        && (unavailable(OutputKind::SkinningMats) || unavailable(OutputKind::OutputControls))
}

fn run_with(
    ctx: &mut ExecutionContext,
    prev: Option<&ExecutionContext>,
    segment: usize,
    outputs: OutputMask,
    services: &AnimServices,
    mode: EvalMode,
    commands: CommandList,
) -> Result<(), Error> {
    let recorded = ctx.commands().clone();
    ctx.set_commands(commands);
    let result = interpret_segment(ctx, prev, segment, outputs, services, mode);
    ctx.set_commands(recorded);
    result
}

/// One character's request in a [`process_batch`] call.
#[derive(Debug)]
pub struct BatchJob<'a> {
    pub ctx: &'a mut ExecutionContext,
    pub prev: Option<&'a ExecutionContext>,
    pub required: SegmentMask,
    pub outputs: OutputMask,
}

/// Runs many characters' requests on the task pool. Jobs are dealt round-robin into
/// batches of [`AnimOptions::batch_size`](crate::AnimOptions::batch_size), one task per
/// batch, and the call returns once every batch finished. Results are in job order.
pub fn process_batch(
    jobs: Vec<BatchJob<'_>>,
    services: &AnimServices,
    mode: EvalMode,
) -> Vec<Result<(), Error>> {
    let count = jobs.len();
    if count == 0 {
        return Vec::new();
    }
    let batch_size = services.options.batch_size(count);
    let num_batches = count.div_ceil(batch_size);
    log::debug!("processing {count} contexts in {num_batches} batches of up to {batch_size}");

    let mut batches: Vec<Vec<(usize, BatchJob<'_>)>> =
        (0..num_batches).map(|_| Vec::with_capacity(batch_size)).collect();
    for (index, job) in jobs.into_iter().enumerate() {
        batches[index % num_batches].push((index, job));
    }

    let done = services.tasks().map_batches(batches, |batch| {
        batch
            .into_iter()
            .map(|(index, job)| {
                let result =
                    request_segments(job.ctx, job.prev, job.required, job.outputs, services, mode);
                (index, result)
            })
            .collect::<Vec<_>>()
    });

    let mut results: Vec<(usize, Result<(), Error>)> = done.into_iter().flatten().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}
