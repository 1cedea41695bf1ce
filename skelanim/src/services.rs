use crate::{
    AnimClip, AnimOptions, CompiledRig, HierarchyId, Instance, JointHierarchy, PluginHandler,
    ProcessingGroup, RetargetCache, RetargetEntry, SkeletonCache, SkeletonId, TaskPool,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Skeleton and retarget lookups provided by the asset system.
pub trait AssetTable: Send + Sync {
    fn lookup_hierarchy(&self, skeleton: SkeletonId) -> Option<Arc<JointHierarchy>>;
    fn lookup_retarget(&self, src: SkeletonId, dst: SkeletonId) -> Option<Arc<RetargetEntry>>;
}

/// In-memory [`AssetTable`].
#[derive(Debug, Default)]
pub struct SkeletonTable {
    hierarchies: HashMap<SkeletonId, Arc<JointHierarchy>>,
    retargets: HashMap<(SkeletonId, SkeletonId), Arc<RetargetEntry>>,
}

impl SkeletonTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_hierarchy(&mut self, hierarchy: Arc<JointHierarchy>) {
        self.hierarchies.insert(hierarchy.skeleton_id(), hierarchy);
    }

    pub fn insert_retarget(&mut self, entry: Arc<RetargetEntry>) {
        self.retargets
            .insert((entry.src_skeleton, entry.dst_skeleton), entry);
    }
}

impl AssetTable for SkeletonTable {
    fn lookup_hierarchy(&self, skeleton: SkeletonId) -> Option<Arc<JointHierarchy>> {
        self.hierarchies.get(&skeleton).cloned()
    }

    fn lookup_retarget(&self, src: SkeletonId, dst: SkeletonId) -> Option<Arc<RetargetEntry>> {
        self.retargets.get(&(src, dst)).cloned()
    }
}

/// Debug hook around clip sampling.
pub trait ClipEvalHook: Send + Sync {
    /// Returns `true` if the hook filled `instance` itself, skipping normal sampling.
    fn before_clip(
        &self,
        clip: &AnimClip,
        frame: f32,
        group: &ProcessingGroup,
        instance: &mut Instance,
    ) -> bool {
        let _ = (clip, frame, group, instance);
        false
    }

    fn after_clip(
        &self,
        clip: &AnimClip,
        frame: f32,
        group: &ProcessingGroup,
        instance: &mut Instance,
    ) {
        let _ = (clip, frame, group, instance);
    }
}

/// Everything the interpreter needs beyond a character's own context.
pub struct AnimServices {
    pub options: AnimOptions,
    assets: Arc<dyn AssetTable>,
    retarget_cache: RetargetCache,
    skeleton_cache: SkeletonCache,
    plugins: Option<Arc<dyn PluginHandler>>,
    clip_hook: Option<Arc<dyn ClipEvalHook>>,
    compiled_rigs: HashMap<HierarchyId, Arc<dyn CompiledRig>>,
    tasks: TaskPool,
}

impl AnimServices {
    pub fn new(options: AnimOptions, assets: Arc<dyn AssetTable>) -> Self {
        Self {
            retarget_cache: RetargetCache::new(options.retarget_cache_capacity),
            skeleton_cache: SkeletonCache::new(options.skeleton_cache_capacity),
            options,
            assets,
            plugins: None,
            clip_hook: None,
            compiled_rigs: HashMap::new(),
            tasks: TaskPool::global(),
        }
    }

    pub fn with_plugins(mut self, plugins: Arc<dyn PluginHandler>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn with_clip_hook(mut self, hook: Arc<dyn ClipEvalHook>) -> Self {
        self.clip_hook = Some(hook);
        self
    }

    pub fn with_compiled_rig(mut self, hierarchy: HierarchyId, rig: Arc<dyn CompiledRig>) -> Self {
        self.compiled_rigs.insert(hierarchy, rig);
        self
    }

    pub fn with_task_pool(mut self, tasks: TaskPool) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn assets(&self) -> &dyn AssetTable {
        self.assets.as_ref()
    }

    pub fn retarget_cache(&self) -> &RetargetCache {
        &self.retarget_cache
    }

    pub fn skeleton_cache(&self) -> &SkeletonCache {
        &self.skeleton_cache
    }

    pub fn plugins(&self) -> Option<&dyn PluginHandler> {
        self.plugins.as_deref()
    }

    pub fn clip_hook(&self) -> Option<&dyn ClipEvalHook> {
        self.clip_hook.as_deref()
    }

    pub fn compiled_rig(&self, hierarchy: HierarchyId) -> Option<&dyn CompiledRig> {
        self.compiled_rigs.get(&hierarchy).map(|r| r.as_ref())
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }
}
