use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::{Rule, RuleType};
use crate::db::SharedDatabase;
use crate::error::RuleStoreError;

/// Immutable view of the active rules, handed to each evaluation.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
    rules: Vec<Rule>,
}

impl RuleSnapshot {
    pub fn new(generation: u64, rules: Vec<Rule>) -> Self {
        let mut active: Vec<Rule> = rules.into_iter().filter(|r| r.is_active).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            generation,
            taken_at: Utc::now(),
            rules: active,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_type(&self, rule_type: RuleType) -> bool {
        self.rules.iter().any(|r| r.rule_type() == rule_type)
    }
}

#[derive(Default)]
struct StoreState {
    /// Every version of every live rule, oldest first.
    versions: HashMap<String, Vec<Rule>>,
    generation: u64,
}

impl StoreState {
    fn current(&self) -> impl Iterator<Item = &Rule> {
        self.versions.values().filter_map(|v| v.last())
    }
}

/// Versioned rule definitions plus the snapshot the engine reads.
///
/// Every mutation rebuilds the snapshot, so activation changes apply to the
/// next transaction screened. In-flight evaluations keep the snapshot they
/// started with.
pub struct RuleStore {
    state: RwLock<StoreState>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    db: Option<SharedDatabase>,
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<toml::Value>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshot: RwLock::new(Arc::new(RuleSnapshot::empty())),
            db: None,
        }
    }

    /// Load the latest version of every rule from the database.
    pub fn load_from_db(db: &SharedDatabase) -> Result<Self, RuleStoreError> {
        let store = Self {
            db: Some(db.clone()),
            ..Self::new()
        };
        store.reload_from_db()?;
        Ok(store)
    }

    /// Re-read rule definitions from the database and rebuild the snapshot.
    /// Rows that no longer parse are skipped with a warning.
    ///
    /// The state lock is held across the read, so a mutation cannot land
    /// between the read and the swap and be lost.
    pub fn reload_from_db(&self) -> Result<usize, RuleStoreError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut versions: HashMap<String, Vec<Rule>> = HashMap::new();
        for row in db.all_rule_versions()? {
            if row.deleted {
                versions.remove(&row.rule_id);
                continue;
            }
            match serde_json::from_str::<Rule>(&row.definition) {
                Ok(rule) => versions.entry(row.rule_id).or_default().push(rule),
                Err(e) => warn!(
                    rule_id = %row.rule_id,
                    version = row.version,
                    "Skipping unreadable rule definition: {e}"
                ),
            }
        }
        let count = versions.len();
        state.versions = versions;
        self.publish(&mut state);
        drop(state);
        info!("Rule store loaded {count} rules from database");
        Ok(count)
    }

    /// Seed rules from a TOML file of `[[rules]]` tables. Entries that fail to
    /// parse or validate are logged and skipped; existing ids are left alone.
    pub fn seed_from_file(&self, path: impl AsRef<Path>) -> Result<usize, crate::error::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let file: RuleFile = match toml::from_str(&contents) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to parse rule file {}: {e}", path.display());
                return Ok(0);
            }
        };

        let mut loaded = 0;
        for value in file.rules {
            let rule: Rule = match value.try_into() {
                Ok(rule) => rule,
                Err(e) => {
                    warn!("Configuration error in {}: {e}", path.display());
                    continue;
                }
            };
            if self.get(&rule.id).is_some() {
                continue;
            }
            match self.create(rule) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Configuration error in {}: {e}", path.display()),
            }
        }
        info!("Seeded {loaded} rules from {}", path.display());
        Ok(loaded)
    }

    pub fn create(&self, mut rule: Rule) -> Result<Rule, RuleStoreError> {
        if rule.is_active {
            rule.validate()?;
        }
        rule.version = 1;
        rule.updated_at = Utc::now();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.versions.contains_key(&rule.id) {
                return Err(RuleStoreError::Duplicate(rule.id));
            }
            self.persist(&rule, false)?;
            state.versions.insert(rule.id.clone(), vec![rule.clone()]);
            self.publish(&mut state);
        }
        info!(rule_id = %rule.id, rule_type = rule.rule_type().as_str(), "Rule created");
        Ok(rule)
    }

    /// Replace a rule's definition, recording it as the next version.
    pub fn update(&self, rule: Rule) -> Result<Rule, RuleStoreError> {
        let id = rule.id.clone();
        self.revise(&id, move |_| Ok(rule))
    }

    pub fn activate(&self, id: &str) -> Result<Rule, RuleStoreError> {
        self.revise(id, |mut rule| {
            rule.is_active = true;
            Ok(rule)
        })
    }

    pub fn deactivate(&self, id: &str) -> Result<Rule, RuleStoreError> {
        self.revise(id, |mut rule| {
            rule.is_active = false;
            Ok(rule)
        })
    }

    /// Remove a rule from the live set. Its history stays in the database.
    pub fn delete(&self, id: &str) -> Result<Rule, RuleStoreError> {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let last = state
                .versions
                .get(id)
                .and_then(|v| v.last())
                .cloned()
                .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
            let mut tombstone = last.clone();
            tombstone.version += 1;
            tombstone.is_active = false;
            self.persist(&tombstone, true)?;
            state.versions.remove(id);
            self.publish(&mut state);
            last
        };
        info!(rule_id = %id, "Rule deleted");
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.versions.get(id).and_then(|v| v.last()).cloned()
    }

    pub fn list(&self) -> Vec<Rule> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut rules: Vec<Rule> = state.current().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// All versions of a rule, oldest first.
    pub fn history(&self, id: &str) -> Vec<Rule> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.versions.get(id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn revise(
        &self,
        id: &str,
        change: impl FnOnce(Rule) -> Result<Rule, RuleStoreError>,
    ) -> Result<Rule, RuleStoreError> {
        let revised = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let history = state
                .versions
                .get_mut(id)
                .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
            let Some(current) = history.last() else {
                return Err(RuleStoreError::NotFound(id.to_string()));
            };
            let next_version = current.version + 1;
            let mut revised = change(current.clone())?;
            revised.id = id.to_string();
            if revised.is_active {
                revised.validate()?;
            }
            revised.version = next_version;
            revised.updated_at = Utc::now();
            self.persist(&revised, false)?;
            history.push(revised.clone());
            self.publish(&mut state);
            revised
        };
        info!(
            rule_id = %revised.id,
            version = revised.version,
            active = revised.is_active,
            "Rule revised"
        );
        Ok(revised)
    }

    fn persist(&self, rule: &Rule, deleted: bool) -> Result<(), RuleStoreError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let definition = serde_json::to_string(rule)
            .map_err(|e| crate::error::ConfigurationError::new(&rule.id, e.to_string()))?;
        db.insert_rule_version(&rule.id, rule.version, &definition, deleted)?;
        Ok(())
    }

    /// Swap in a new snapshot. Called with the state lock held so snapshots
    /// are installed in generation order.
    fn publish(&self, state: &mut StoreState) {
        state.generation += 1;
        let next = RuleSnapshot::new(state.generation, state.current().cloned().collect());
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Arc::new(next);
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
