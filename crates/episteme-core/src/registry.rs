// In-memory registry of active groups, each behind its own lock.
//
// Every mutation runs on a clone of the group while its lock is held, the
// clone is persisted, and only then does it replace the in-memory copy. A
// failed write therefore leaves memory equal to the last successful write.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{info, warn};

use crate::error::{ForecastError, Result};
use crate::group::{PredictionGroup, TruthValue};
use crate::scoring::Resolution;
use crate::store::Store;

/// Shared reference to an active group.
pub type GroupHandle = Arc<Mutex<PredictionGroup>>;

/// Outcome of feeding drafted truths to [`GroupRegistry::resolve_drafted`].
#[derive(Debug)]
pub enum ResolveProgress {
    /// Some question still lacks a truth value.
    Pending { next_question: String },
    /// The group was resolved and moved to the finished collection.
    Resolved {
        group: PredictionGroup,
        resolution: Resolution,
    },
}

pub struct GroupRegistry {
    store: Store,
    groups: RwLock<HashMap<String, GroupHandle>>,
}

fn lock(handle: &GroupHandle) -> MutexGuard<'_, PredictionGroup> {
    handle.lock().expect("group mutex poisoned")
}

impl GroupRegistry {
    /// Build the registry from every active group in `store`.
    pub fn load(store: Store) -> anyhow::Result<Self> {
        let groups: HashMap<String, GroupHandle> = store
            .load_all_active()?
            .into_iter()
            .map(|g| (g.name().to_string(), Arc::new(Mutex::new(g))))
            .collect();
        info!("Loaded {} active prediction groups", groups.len());
        Ok(Self {
            store,
            groups: RwLock::new(groups),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Look up an active group.
    pub fn get(&self, name: &str) -> Result<GroupHandle> {
        self.groups
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| ForecastError::UnknownGroup(name.to_string()))
    }

    /// Active group names with their question counts, alphabetically.
    pub fn summaries(&self) -> Vec<(String, usize)> {
        let groups = self.groups.read().expect("registry lock poisoned");
        let mut summaries: Vec<(String, usize)> = groups
            .iter()
            .map(|(name, handle)| (name.clone(), lock(handle).questions().len()))
            .collect();
        summaries.sort();
        summaries
    }

    /// Whether `name` is used by an active or a finished group.
    pub fn is_name_taken(&self, name: &str) -> Result<bool> {
        if self.groups.read().expect("registry lock poisoned").contains_key(name) {
            return Ok(true);
        }
        Ok(self.store.exists(name)?)
    }

    /// Read a group under its lock.
    pub fn read<T>(&self, handle: &GroupHandle, f: impl FnOnce(&PredictionGroup) -> T) -> T {
        f(&lock(handle))
    }

    /// Mutate a group under its lock, persisting before committing in memory.
    pub fn update<T>(
        &self,
        handle: &GroupHandle,
        f: impl FnOnce(&mut PredictionGroup) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(handle);
        if guard.is_resolved() {
            return Err(ForecastError::AlreadyResolved(guard.name().to_string()));
        }
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.store.save(&draft)?;
        *guard = draft;
        Ok(out)
    }

    /// Append a question to an active group.
    pub fn add_question(&self, name: &str, text: &str) -> Result<()> {
        let handle = self.get(name)?;
        self.update(&handle, |g| g.add_question(text))?;
        info!("Question added to `{}`: {}", name, text);
        Ok(())
    }

    /// Make a freshly authored group active.
    pub fn publish(&self, group: PredictionGroup) -> Result<GroupHandle> {
        PredictionGroup::validate_name(group.name())?;
        let mut groups = self.groups.write().expect("registry lock poisoned");
        let name = group.name().to_string();
        if groups.contains_key(&name) || self.store.exists(&name)? {
            return Err(ForecastError::GroupExists(name));
        }
        if group.questions().is_empty() {
            return Err(ForecastError::EmptyGroup(name));
        }
        self.store.save(&group)?;
        let handle = Arc::new(Mutex::new(group));
        groups.insert(name.clone(), handle.clone());
        info!("Prediction group `{}` published", name);
        Ok(handle)
    }

    /// Resolve the group once `drafted` covers every question.
    ///
    /// The completeness check, scoring, and relocation to the finished
    /// collection all happen under the group's lock, so no prediction can
    /// commit between truth capture and resolution.
    pub fn resolve_drafted(
        &self,
        handle: &GroupHandle,
        drafted: &BTreeMap<String, TruthValue>,
    ) -> Result<ResolveProgress> {
        let mut guard = lock(handle);
        if guard.is_resolved() {
            return Err(ForecastError::AlreadyResolved(guard.name().to_string()));
        }
        if let Some(next) = guard.next_undrafted_question(drafted) {
            return Ok(ResolveProgress::Pending {
                next_question: next.to_string(),
            });
        }

        // Drafted truths for questions that vanished cannot happen today
        // (questions are never removed), but only pass what the group asks.
        let truths: BTreeMap<String, TruthValue> = drafted
            .iter()
            .filter(|(q, _)| guard.has_question(q))
            .map(|(q, t)| (q.clone(), *t))
            .collect();

        let mut draft = guard.clone();
        let resolution = draft.resolve(truths)?;
        self.store.move_to_finished(&draft, &resolution)?;
        *guard = draft.clone();
        drop(guard);

        let name = draft.name().to_string();
        if self
            .groups
            .write()
            .expect("registry lock poisoned")
            .remove(&name)
            .is_none()
        {
            warn!("Resolved group `{}` was already gone from the registry", name);
        }
        info!("Prediction group `{}` resolved", name);
        Ok(ResolveProgress::Resolved {
            group: draft,
            resolution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, questions: &[&str]) -> GroupRegistry {
        let registry = GroupRegistry::load(Store::open(":memory:").unwrap()).unwrap();
        let mut group = PredictionGroup::new(name);
        for q in questions {
            group.add_question(q).unwrap();
        }
        registry.publish(group).unwrap();
        registry
    }

    #[test]
    fn load_picks_up_persisted_groups() {
        let store = Store::open(":memory:").unwrap();
        let mut group = PredictionGroup::new("G");
        group.add_question("Q1").unwrap();
        store.save(&group).unwrap();

        let registry = GroupRegistry::load(store).unwrap();
        assert_eq!(registry.summaries(), vec![("G".to_string(), 1)]);
    }

    #[test]
    fn get_unknown_group_fails() {
        let registry = registry_with("G", &["Q1"]);
        assert!(matches!(
            registry.get("H"),
            Err(ForecastError::UnknownGroup(name)) if name == "H"
        ));
    }

    #[test]
    fn publish_rejects_existing_and_empty_groups() {
        let registry = registry_with("G", &["Q1"]);
        let mut dup = PredictionGroup::new("G");
        dup.add_question("Q").unwrap();
        assert!(matches!(registry.publish(dup), Err(ForecastError::GroupExists(_))));
        assert!(matches!(
            registry.publish(PredictionGroup::new("H")),
            Err(ForecastError::EmptyGroup(_))
        ));
    }

    #[test]
    fn update_persists_and_commits() {
        let registry = registry_with("G", &["Q1"]);
        let handle = registry.get("G").unwrap();
        registry
            .update(&handle, |g| g.set_prediction("alice", "Q1", 0.5))
            .unwrap();

        assert_eq!(registry.read(&handle, |g| g.answered_count("alice")), 1);
        let stored = registry.store().load("G").unwrap().unwrap();
        assert_eq!(stored.answered_count("alice"), 1);
    }

    #[test]
    fn failed_update_leaves_group_unchanged() {
        let registry = registry_with("G", &["Q1"]);
        let handle = registry.get("G").unwrap();
        let err = registry
            .update(&handle, |g| g.set_prediction("alice", "Q2", 0.5))
            .unwrap_err();
        assert!(matches!(err, ForecastError::UnknownQuestion(_)));
        assert!(registry.read(&handle, |g| g.predictions().is_empty()));
    }

    #[test]
    fn add_question_through_registry() {
        let registry = registry_with("G", &["Q1"]);
        registry.add_question("G", "Q2").unwrap();
        assert!(matches!(
            registry.add_question("G", "Q2"),
            Err(ForecastError::DuplicateQuestion(_))
        ));
        let stored = registry.store().load("G").unwrap().unwrap();
        assert_eq!(stored.questions().len(), 2);
    }

    #[test]
    fn resolve_drafted_reports_pending_question() {
        let registry = registry_with("G", &["Q1", "Q2"]);
        let handle = registry.get("G").unwrap();
        let mut drafted = BTreeMap::new();
        drafted.insert("Q1".to_string(), TruthValue::True);

        match registry.resolve_drafted(&handle, &drafted).unwrap() {
            ResolveProgress::Pending { next_question } => assert_eq!(next_question, "Q2"),
            other => panic!("expected pending, got {other:?}"),
        }
        assert!(registry.get("G").is_ok());
    }

    #[test]
    fn resolve_drafted_moves_group_to_finished() {
        let registry = registry_with("G", &["Q1"]);
        let handle = registry.get("G").unwrap();
        registry
            .update(&handle, |g| g.set_prediction("alice", "Q1", 0.9))
            .unwrap();

        let mut drafted = BTreeMap::new();
        drafted.insert("Q1".to_string(), TruthValue::True);
        let progress = registry.resolve_drafted(&handle, &drafted).unwrap();
        assert!(matches!(progress, ResolveProgress::Resolved { .. }));

        assert!(matches!(registry.get("G"), Err(ForecastError::UnknownGroup(_))));
        assert!(registry.store().load("G").unwrap().is_none());
        assert!(registry.store().load_finished("G").unwrap().is_some());
        assert!(registry.is_name_taken("G").unwrap());

        // Sessions still holding the handle see the resolved state.
        let err = registry
            .update(&handle, |g| g.set_prediction("bob", "Q1", 0.1))
            .unwrap_err();
        assert!(matches!(err, ForecastError::AlreadyResolved(_)));
        assert!(matches!(
            registry.resolve_drafted(&handle, &drafted),
            Err(ForecastError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn publish_rejects_unsafe_names() {
        let registry = GroupRegistry::load(Store::open(":memory:").unwrap()).unwrap();
        let mut group = PredictionGroup::new("../escape");
        group.add_question("Q1").unwrap();
        assert!(matches!(
            registry.publish(group),
            Err(ForecastError::InvalidGroupName(_))
        ));
        assert!(registry.store().list_active().unwrap().is_empty());
    }

    #[test]
    fn concurrent_predictions_are_all_persisted() {
        let registry = registry_with("G", &["Q1", "Q2"]);
        let handle = registry.get("G").unwrap();

        std::thread::scope(|scope| {
            for i in 0..16 {
                let registry = &registry;
                let handle = &handle;
                scope.spawn(move || {
                    let user = format!("user{i}");
                    for question in ["Q1", "Q2"] {
                        registry
                            .update(handle, |g| {
                                g.set_prediction(&user, question, f64::from(i) / 16.0)
                            })
                            .unwrap();
                    }
                });
            }
        });

        let stored = registry.store().load("G").unwrap().unwrap();
        assert_eq!(stored.predictions().len(), 16);
        for i in 0..16 {
            assert_eq!(stored.answered_count(&format!("user{i}")), 2);
        }
        assert_eq!(registry.read(&handle, |g| g.clone()), stored);
    }

    #[test]
    fn failed_save_keeps_memory_at_last_write() {
        let registry = registry_with("G", &["Q1"]);
        let handle = registry.get("G").unwrap();
        registry
            .update(&handle, |g| g.set_prediction("alice", "Q1", 0.3))
            .unwrap();
        let before = registry.read(&handle, |g| g.clone());

        registry
            .store()
            .conn()
            .execute_batch(
                "CREATE TRIGGER reject_writes BEFORE INSERT ON active_groups
                 BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;",
            )
            .unwrap();

        let err = registry
            .update(&handle, |g| g.set_prediction("alice", "Q1", 0.9))
            .unwrap_err();
        assert!(matches!(err, ForecastError::Storage(_)));
        assert!(!err.is_user_error());
        assert!(matches!(
            registry.add_question("G", "Q2"),
            Err(ForecastError::Storage(_))
        ));

        assert_eq!(registry.read(&handle, |g| g.clone()), before);
        assert_eq!(registry.store().load("G").unwrap().unwrap(), before);
    }
}
