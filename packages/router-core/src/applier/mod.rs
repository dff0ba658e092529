//! Configuration applier (spec 4.6): diffs a declarative [`DesiredState`]
//! against the live topology and performs the minimal set of creates,
//! updates, and removals. Every call is serialized behind a single
//! reentrant-style lock so concurrent `apply_state` calls never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::{ConfigEvent, EventEmitter};
use crate::packet::SourceTag;
use crate::processor::SourcePathConfig;
use crate::sink::SinkConfig;
use crate::utils::now_millis;

/// A declarative snapshot of what should be running: the full set of sinks
/// and source paths (spec 3 "Desired state"). The applier consumes this
/// atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    pub sinks: Vec<SinkDesired>,
    pub paths: Vec<PathDesired>,
}

/// One sink's desired configuration, keyed by `sink_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkDesired {
    pub sink_id: String,
    pub config: SinkConfig,
}

/// One source path's desired configuration, keyed by `path_id`. `source_tag`
/// may name a tag that hasn't been seen yet; the applier tracks it as
/// pending until a receiver's discovery notification resolves it (spec 4.6
/// step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathDesired {
    pub path_id: String,
    pub source_tag: SourceTag,
    pub target_sink_id: String,
    pub config: SourcePathConfig,
}

/// Outcome of diffing one `apply_state` call against the shadow state.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub sinks_to_add: Vec<SinkDesired>,
    pub sinks_to_update: Vec<SinkDesired>,
    pub sinks_to_remove: Vec<String>,
    pub paths_to_add: Vec<PathDesired>,
    pub paths_to_update: Vec<PathDesired>,
    pub paths_to_remove: Vec<String>,
    /// Paths whose `source_tag` has not yet been seen by any receiver;
    /// these are added to the pending set rather than instantiated.
    pub paths_pending: Vec<PathDesired>,
}

/// Serde-comparable identity used to decide whether an unchanged-id entry
/// actually needs updating. Cloning the whole config and comparing via
/// `PartialEq` would require deriving it across every DSP tunable; instead
/// we compare the canonical JSON encoding, which is already required for
/// the control-plane transport and catches any field change.
fn fingerprint<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

struct Shadow {
    sinks: HashMap<String, (SinkDesired, String)>,
    paths: HashMap<String, (PathDesired, String)>,
    /// `source_tag -> path_id`s waiting on that tag's first sighting.
    pending_by_tag: HashMap<SourceTag, Vec<String>>,
    known_tags: HashSet<SourceTag>,
}

impl Shadow {
    fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            paths: HashMap::new(),
            pending_by_tag: HashMap::new(),
            known_tags: HashSet::new(),
        }
    }
}

/// Diffs and applies [`DesiredState`] snapshots, and resolves pending paths
/// as receivers report first-seen tags.
pub struct ConfigApplier {
    shadow: Mutex<Shadow>,
    emitter: Arc<dyn EventEmitter>,
}

impl ConfigApplier {
    #[must_use]
    pub fn new(emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            shadow: Mutex::new(Shadow::new()),
            emitter,
        }
    }

    /// Computes and applies the diff between the current shadow and
    /// `desired`, returning the plan that was executed. Idempotent: a
    /// second call with the same `desired` produces an empty plan (spec
    /// 4.6 "Idempotency is required").
    ///
    /// The caller (`engine`) is responsible for actually instantiating and
    /// tearing down receivers/processors/mixers per the returned plan; this
    /// method only owns the bookkeeping and ordering guarantees (sinks
    /// before paths on create, paths before sinks on remove).
    pub fn apply_state(&self, desired: DesiredState) -> ReconcilePlan {
        let mut shadow = self.shadow.lock();

        let desired_sink_ids: HashSet<String> = desired.sinks.iter().map(|s| s.sink_id.clone()).collect();
        let desired_path_ids: HashSet<String> = desired.paths.iter().map(|p| p.path_id.clone()).collect();

        let sinks_to_remove: Vec<String> = shadow
            .sinks
            .keys()
            .filter(|id| !desired_sink_ids.contains(*id))
            .cloned()
            .collect();
        let paths_to_remove: Vec<String> = shadow
            .paths
            .keys()
            .filter(|id| !desired_path_ids.contains(*id))
            .cloned()
            .collect();

        let mut sinks_to_add = Vec::new();
        let mut sinks_to_update = Vec::new();
        for sink in &desired.sinks {
            let fp = fingerprint(sink);
            match shadow.sinks.get(&sink.sink_id) {
                None => sinks_to_add.push(sink.clone()),
                Some((_, existing_fp)) if existing_fp != &fp => sinks_to_update.push(sink.clone()),
                Some(_) => {}
            }
        }

        let mut paths_to_add = Vec::new();
        let mut paths_to_update = Vec::new();
        let mut paths_pending = Vec::new();
        for path in &desired.paths {
            let fp = fingerprint(path);
            let is_new = !shadow.paths.contains_key(&path.path_id);
            let changed = shadow
                .paths
                .get(&path.path_id)
                .map(|(_, existing_fp)| existing_fp != &fp)
                .unwrap_or(false);
            if !is_new && !changed {
                continue;
            }
            if shadow.known_tags.contains(&path.source_tag) {
                if is_new {
                    paths_to_add.push(path.clone());
                } else {
                    paths_to_update.push(path.clone());
                }
            } else {
                paths_pending.push(path.clone());
            }
        }

        // Apply to the shadow. Paths before their sinks are removed after
        // sinks detach; here we only track identity, so order doesn't
        // matter for the map mutation itself - only for what the engine
        // does with the returned plan.
        for id in &paths_to_remove {
            shadow.paths.remove(id);
        }
        for id in &sinks_to_remove {
            shadow.sinks.remove(id);
        }
        for sink in sinks_to_add.iter().chain(sinks_to_update.iter()) {
            shadow.sinks.insert(sink.sink_id.clone(), (sink.clone(), fingerprint(sink)));
        }
        for path in paths_to_add.iter().chain(paths_to_update.iter()) {
            shadow.paths.insert(path.path_id.clone(), (path.clone(), fingerprint(path)));
        }
        for path in &paths_pending {
            shadow
                .pending_by_tag
                .entry(path.source_tag.clone())
                .or_default()
                .push(path.path_id.clone());
        }

        let plan = ReconcilePlan {
            sinks_to_add,
            sinks_to_update,
            sinks_to_remove,
            paths_to_add,
            paths_to_update,
            paths_to_remove,
            paths_pending,
        };

        self.emitter.emit_config(ConfigEvent::Applied {
            sinks_created: plan.sinks_to_add.len(),
            sinks_removed: plan.sinks_to_remove.len(),
            paths_created: plan.paths_to_add.len(),
            paths_updated: plan.paths_to_update.len(),
            paths_removed: plan.paths_to_remove.len(),
            timestamp: now_millis(),
        });

        plan
    }

    /// Called when a receiver reports a first-seen tag. Returns the set of
    /// previously-pending paths that should now be instantiated (spec 4.6
    /// step 4: "re-run the apply step for the affected paths only").
    pub fn resolve_pending_tag(&self, tag: &SourceTag) -> Vec<PathDesired> {
        let mut shadow = self.shadow.lock();
        shadow.known_tags.insert(tag.clone());
        let Some(path_ids) = shadow.pending_by_tag.remove(tag) else {
            return Vec::new();
        };
        path_ids
            .into_iter()
            .filter_map(|id| shadow.paths.get(&id).map(|(path, _)| path.clone()))
            .collect()
    }

    #[must_use]
    pub fn live_sink_count(&self) -> usize {
        self.shadow.lock().sinks.len()
    }

    #[must_use]
    pub fn live_path_count(&self) -> usize {
        self.shadow.lock().paths.len()
    }

    #[must_use]
    pub fn pending_path_count(&self) -> usize {
        self.shadow.lock().pending_by_tag.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::packet::FormatDescriptor;
    use crate::sink::SinkProtocol;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    fn sink(id: &str) -> SinkDesired {
        SinkDesired {
            sink_id: id.into(),
            config: SinkConfig::new(id, SinkProtocol::ScreamUdp, fmt()),
        }
    }

    fn path(id: &str, tag: &str, sink_id: &str) -> PathDesired {
        PathDesired {
            path_id: id.into(),
            source_tag: tag.into(),
            target_sink_id: sink_id.into(),
            config: SourcePathConfig::new(id, fmt()),
        }
    }

    fn applier() -> ConfigApplier {
        ConfigApplier::new(Arc::new(NoopEventEmitter))
    }

    #[test]
    fn first_apply_creates_everything() {
        let applier = applier();
        let plan = applier.apply_state(DesiredState {
            sinks: vec![sink("s1")],
            paths: vec![path("p1", "10.0.0.5", "s1")],
        });
        assert_eq!(plan.sinks_to_add.len(), 1);
        assert_eq!(plan.paths_pending.len(), 1);
        assert_eq!(applier.pending_path_count(), 1);
    }

    #[test]
    fn reapplying_identical_state_is_a_no_op() {
        let applier = applier();
        let state = DesiredState {
            sinks: vec![sink("s1")],
            paths: vec![],
        };
        applier.apply_state(state.clone());
        let second = applier.apply_state(state);
        assert!(second.sinks_to_add.is_empty());
        assert!(second.sinks_to_update.is_empty());
        assert!(second.sinks_to_remove.is_empty());
    }

    #[test]
    fn removing_a_sink_from_desired_state_schedules_removal() {
        let applier = applier();
        applier.apply_state(DesiredState {
            sinks: vec![sink("s1")],
            paths: vec![],
        });
        let plan = applier.apply_state(DesiredState {
            sinks: vec![],
            paths: vec![],
        });
        assert_eq!(plan.sinks_to_remove, vec!["s1".to_string()]);
        assert_eq!(applier.live_sink_count(), 0);
    }

    #[test]
    fn path_with_unseen_tag_becomes_pending_until_resolved() {
        let applier = applier();
        applier.apply_state(DesiredState {
            sinks: vec![sink("s1")],
            paths: vec![path("p1", "10.0.0.5", "s1")],
        });
        assert_eq!(applier.pending_path_count(), 1);

        let resolved = applier.resolve_pending_tag(&"10.0.0.5".to_string());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path_id, "p1");
    }

    #[test]
    fn resolving_an_unknown_tag_returns_nothing() {
        let applier = applier();
        assert!(applier.resolve_pending_tag(&"ghost".to_string()).is_empty());
    }
}
