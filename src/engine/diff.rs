use std::collections::BTreeMap;

/// A keyed item tracked across builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance<V> {
    pub key: String,
    pub content: V,
}

impl<V> Instance<V> {
    pub fn new(key: impl Into<String>, content: V) -> Self {
        Self {
            key: key.into(),
            content,
        }
    }
}

/// Classification of the current instance set against the previous one.
///
/// Every list is sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<V> {
    pub created: Vec<Instance<V>>,
    /// `(old, new)` pairs sharing a key but not content.
    pub updated: Vec<(Instance<V>, Instance<V>)>,
    pub deleted: Vec<Instance<V>>,
    pub unchanged: Vec<Instance<V>>,
}

impl<V> Default for ChangeSet<V> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<V: PartialEq + Clone> ChangeSet<V> {
    pub fn diff(prev: &BTreeMap<String, V>, curr: &BTreeMap<String, V>) -> Self {
        let mut changes = ChangeSet::default();

        for (key, content) in curr {
            let instance = Instance::new(key.clone(), content.clone());
            match prev.get(key) {
                None => changes.created.push(instance),
                Some(old) if old == content => changes.unchanged.push(instance),
                Some(old) => changes
                    .updated
                    .push((Instance::new(key.clone(), old.clone()), instance)),
            }
        }

        for (key, content) in prev {
            if !curr.contains_key(key) {
                changes.deleted.push(Instance::new(key.clone(), content.clone()));
            }
        }

        changes
    }
}

impl<V> ChangeSet<V> {
    /// True when nothing was created, updated or deleted.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of instances that need work this build.
    pub fn pending(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}
