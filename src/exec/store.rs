use std::collections::HashMap;

/// A table of values addressed by task identifier.
///
/// The executor keeps one of these per concern (handles, outcomes, commands)
/// so each can be cleared independently once a task's result is consumed.
#[derive(Debug)]
pub struct KeyedStore<V> {
    entries: HashMap<String, V>,
}

impl<V> Default for KeyedStore<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> KeyedStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Store `value` under `key`, returning whatever was there before.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        self.entries.insert(key.into(), value)
    }

    pub fn unset(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
