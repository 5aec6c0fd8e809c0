use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{FormcalcError, Result};
use crate::value::{fold, FieldHasher};

// ------------- DependencyGraph -------------
/// Directed acyclic graph of "field depends on field" edges.
///
/// Two adjacency maps are kept mutually consistent: forward (dependent to
/// the fields it reads) and reverse (field to the fields that read it).
/// Every edge insertion is cycle-checked before any state changes, so the
/// acyclic invariant holds at all times. One coarse lock covers mutation
/// and compound reads alike; a topological computation observed
/// mid-mutation would be inconsistent.
#[derive(Debug)]
pub struct DependencyGraph {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    dependencies: HashMap<String, HashSet<String, FieldHasher>, FieldHasher>,
    dependents: HashMap<String, HashSet<String, FieldHasher>, FieldHasher>,
    // folded key to first-seen spelling, for readable output
    names: HashMap<String, String, FieldHasher>,
}

/// A point-in-time summary of the graph's shape.
#[derive(Debug, Clone)]
pub struct GraphStats {
    pub total_fields: usize,
    pub total_dependencies: usize,
    /// Fields that depend on nothing (form inputs).
    pub root_fields: Vec<String>,
    /// Fields nothing depends on (final outputs).
    pub leaf_fields: Vec<String>,
    /// Longest dependency chain, counting both ends.
    pub max_depth: usize,
    pub has_cycle: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records that `dependent`'s formula reads `depends_on`. Rejects empty
    /// and self-referential names, and rejects any edge that would close a
    /// cycle before touching either map.
    pub fn add_dependency(&self, dependent: &str, depends_on: &str) -> Result<()> {
        if dependent.trim().is_empty() || depends_on.trim().is_empty() {
            return Err(FormcalcError::InvalidField(
                "field names must not be empty".to_owned(),
            ));
        }
        let dependent_key = fold(dependent);
        let depends_on_key = fold(depends_on);
        if dependent_key == depends_on_key {
            return Err(FormcalcError::InvalidField(format!(
                "'{}' cannot depend on itself",
                dependent
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if reachable(&inner.dependencies, &depends_on_key, &dependent_key) {
            return Err(FormcalcError::CircularDependency(format!(
                "'{}' -> '{}' would close a cycle",
                dependent, depends_on
            )));
        }
        inner
            .names
            .entry(dependent_key.clone())
            .or_insert_with(|| dependent.to_owned());
        inner
            .names
            .entry(depends_on_key.clone())
            .or_insert_with(|| depends_on.to_owned());
        inner
            .dependencies
            .entry(dependent_key.clone())
            .or_default()
            .insert(depends_on_key.clone());
        inner
            .dependents
            .entry(depends_on_key)
            .or_default()
            .insert(dependent_key);
        Ok(())
    }

    /// Removes one edge from both maps, pruning emptied entries. A missing
    /// edge is a silent no-op.
    pub fn remove_dependency(&self, dependent: &str, depends_on: &str) {
        let dependent_key = fold(dependent);
        let depends_on_key = fold(depends_on);
        let mut inner = self.inner.lock().unwrap();
        let prune = match inner.dependencies.get_mut(&dependent_key) {
            Some(set) => {
                set.remove(&depends_on_key);
                set.is_empty()
            }
            None => false,
        };
        if prune {
            inner.dependencies.remove(&dependent_key);
        }
        let prune = match inner.dependents.get_mut(&depends_on_key) {
            Some(set) => {
                set.remove(&dependent_key);
                set.is_empty()
            }
            None => false,
        };
        if prune {
            inner.dependents.remove(&depends_on_key);
        }
    }

    /// Direct fields `field`'s formula reads; empty for an unknown field.
    pub fn dependencies_of(&self, field: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        neighbors(&inner, &inner.dependencies, field)
    }

    /// Direct fields whose formulas read `field`; empty for an unknown field.
    pub fn dependents_of(&self, field: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        neighbors(&inner, &inner.dependents, field)
    }

    /// True when inserting `dependent` -> `depends_on` would close a cycle.
    /// Read-only; intended for authoring tools probing ahead of an edit.
    pub fn would_create_cycle(&self, dependent: &str, depends_on: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        reachable(&inner.dependencies, &fold(depends_on), &fold(dependent))
    }

    /// Every known field ordered so that each `depends_on` precedes its
    /// dependents. Deterministic on an unchanged graph. The cycle error is
    /// defensive; `add_dependency`'s pre-check keeps it unreachable.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let order = order_inner(&inner)?;
        Ok(order.iter().map(|key| spelled(&inner, key)).collect())
    }

    /// The transitive dependents of `changed_field`, sorted into the full
    /// topological order: a dependency-correct recalculation sequence. The
    /// changed field itself is not included.
    pub fn fields_to_recalculate(&self, changed_field: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let changed_key = fold(changed_field);
        let mut seen: HashSet<String, FieldHasher> = HashSet::default();
        seen.insert(changed_key.clone());
        let mut impacted: Vec<String> = Vec::new();
        let mut stack = vec![changed_key];
        while let Some(current) = stack.pop() {
            if let Some(readers) = inner.dependents.get(&current) {
                for reader in readers {
                    if seen.insert(reader.clone()) {
                        impacted.push(reader.clone());
                        stack.push(reader.clone());
                    }
                }
            }
        }
        let order = order_inner(&inner)?;
        let index: HashMap<&str, usize, FieldHasher> = order
            .iter()
            .enumerate()
            .map(|(i, key)| (key.as_str(), i))
            .collect();
        impacted.sort_by_key(|key| index.get(key.as_str()).copied().unwrap_or(usize::MAX));
        Ok(impacted.iter().map(|key| spelled(&inner, key)).collect())
    }

    /// Dedicated boolean cycle probe; never fails, never sorts.
    pub fn has_cycle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        probe_cycle(&inner)
    }

    pub fn stats(&self) -> GraphStats {
        let inner = self.inner.lock().unwrap();
        let keys = known_keys(&inner);
        let total_dependencies = inner.dependencies.values().map(|set| set.len()).sum();
        let root_fields = keys
            .iter()
            .filter(|key| !inner.dependencies.contains_key(*key))
            .map(|key| spelled(&inner, key))
            .collect();
        let leaf_fields = keys
            .iter()
            .filter(|key| !inner.dependents.contains_key(*key))
            .map(|key| spelled(&inner, key))
            .collect();
        let mut visited: HashSet<String, FieldHasher> = HashSet::default();
        let max_depth = keys
            .iter()
            .map(|key| depth_of(&inner, key, &mut visited))
            .max()
            .unwrap_or(0);
        GraphStats {
            total_fields: keys.len(),
            total_dependencies,
            root_fields,
            leaf_fields,
            max_depth,
            has_cycle: probe_cycle(&inner),
        }
    }

    /// Drops every edge and field.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.dependencies.clear();
        inner.dependents.clear();
        inner.names.clear();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        known_keys(&inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn spelled(inner: &Inner, key: &str) -> String {
    inner
        .names
        .get(key)
        .cloned()
        .unwrap_or_else(|| key.to_owned())
}

fn neighbors(
    inner: &Inner,
    map: &HashMap<String, HashSet<String, FieldHasher>, FieldHasher>,
    field: &str,
) -> Vec<String> {
    match map.get(&fold(field)) {
        Some(set) => {
            let mut keys: Vec<&String> = set.iter().collect();
            keys.sort();
            keys.iter().map(|key| spelled(inner, key)).collect()
        }
        None => Vec::new(),
    }
}

// Folded names of every field that appears in at least one edge, sorted so
// that traversal output is deterministic.
fn known_keys(inner: &Inner) -> Vec<String> {
    let mut keys: HashSet<&String, FieldHasher> = HashSet::default();
    keys.extend(inner.dependencies.keys());
    keys.extend(inner.dependents.keys());
    let mut keys: Vec<String> = keys.into_iter().cloned().collect();
    keys.sort();
    keys
}

// Depth-first reachability over the forward map; used both by the insert
// pre-check and by the public probe.
fn reachable(
    forward: &HashMap<String, HashSet<String, FieldHasher>, FieldHasher>,
    from: &str,
    target: &str,
) -> bool {
    let mut visited: HashSet<&str, FieldHasher> = HashSet::default();
    let mut stack: Vec<&str> = vec![from];
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = forward.get(current) {
            stack.extend(next.iter().map(|key| key.as_str()));
        }
    }
    false
}

// Post-order three-color walk: dependencies land before their dependents,
// so no reversal is needed afterwards.
fn order_inner(inner: &Inner) -> Result<Vec<String>> {
    let mut visiting: HashSet<String, FieldHasher> = HashSet::default();
    let mut done: HashSet<String, FieldHasher> = HashSet::default();
    let mut order = Vec::new();
    for key in known_keys(inner) {
        visit(inner, &key, &mut visiting, &mut done, &mut order)?;
    }
    Ok(order)
}

fn visit(
    inner: &Inner,
    field: &str,
    visiting: &mut HashSet<String, FieldHasher>,
    done: &mut HashSet<String, FieldHasher>,
    order: &mut Vec<String>,
) -> Result<()> {
    if done.contains(field) {
        return Ok(());
    }
    if !visiting.insert(field.to_owned()) {
        return Err(FormcalcError::CircularDependency(format!(
            "cycle detected at '{}'",
            spelled(inner, field)
        )));
    }
    if let Some(deps) = inner.dependencies.get(field) {
        let mut deps: Vec<&String> = deps.iter().collect();
        deps.sort();
        for dep in deps {
            visit(inner, dep, visiting, done, order)?;
        }
    }
    visiting.remove(field);
    done.insert(field.to_owned());
    order.push(field.to_owned());
    Ok(())
}

fn probe_cycle(inner: &Inner) -> bool {
    let mut visiting: HashSet<String, FieldHasher> = HashSet::default();
    let mut done: HashSet<String, FieldHasher> = HashSet::default();
    for key in known_keys(inner) {
        if walk(inner, &key, &mut visiting, &mut done) {
            return true;
        }
    }
    false
}

fn walk(
    inner: &Inner,
    field: &str,
    visiting: &mut HashSet<String, FieldHasher>,
    done: &mut HashSet<String, FieldHasher>,
) -> bool {
    if done.contains(field) {
        return false;
    }
    if !visiting.insert(field.to_owned()) {
        return true;
    }
    if let Some(deps) = inner.dependencies.get(field) {
        for dep in deps {
            if walk(inner, dep, visiting, done) {
                return true;
            }
        }
    }
    visiting.remove(field);
    done.insert(field.to_owned());
    false
}

// Longest chain below `field`, bounded by a per-path visited set. A lone
// field counts as depth 1.
fn depth_of(inner: &Inner, field: &str, visited: &mut HashSet<String, FieldHasher>) -> usize {
    if !visited.insert(field.to_owned()) {
        return 0;
    }
    let depth = match inner.dependencies.get(field) {
        Some(deps) if !deps.is_empty() => {
            let mut deepest = 0;
            for dep in deps {
                deepest = deepest.max(depth_of(inner, dep, visited));
            }
            deepest + 1
        }
        _ => 1,
    };
    visited.remove(field);
    depth
}
