//! The readiness result set.

use std::collections::HashSet;
use std::slice;
use std::vec;

use crate::select::{SelectionKey, Token};

/// Keys found ready by polls and not yet acknowledged.
///
/// Callers acknowledge a key by removing it (or draining the set). A key
/// left in the set stays selected: the next poll merges new readiness into
/// its ready operations instead of replacing them.
#[derive(Debug, Default)]
pub struct SelectedKeys {
    /// Selection order.
    keys: Vec<SelectionKey>,

    /// Index over `keys`.
    tokens: HashSet<Token>,
}

impl SelectedKeys {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, SelectionKey> {
        self.keys.iter()
    }

    pub fn contains(&self, key: &SelectionKey) -> bool {
        self.tokens.contains(&key.token()) && self.keys.contains(key)
    }

    /// Acknowledges one key. Returns whether it was selected.
    pub fn remove(&mut self, key: &SelectionKey) -> bool {
        match self.keys.iter().position(|k| k == key) {
            Some(index) => {
                self.keys.remove(index);
                self.tokens.remove(&key.token());
                true
            }
            None => false,
        }
    }

    /// Keeps only the keys for which `f` returns `true`.
    pub fn retain(&mut self, mut f: impl FnMut(&SelectionKey) -> bool) {
        let tokens = &mut self.tokens;
        self.keys.retain(|key| {
            let keep = f(key);
            if !keep {
                tokens.remove(&key.token());
            }
            keep
        });
    }

    /// Acknowledges every key, yielding them in selection order.
    pub fn drain(&mut self) -> vec::Drain<'_, SelectionKey> {
        self.tokens.clear();
        self.keys.drain(..)
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.keys.clear();
    }

    pub(crate) fn contains_token(&self, token: Token) -> bool {
        self.tokens.contains(&token)
    }

    pub(crate) fn insert(&mut self, key: SelectionKey) {
        if self.tokens.insert(key.token()) {
            self.keys.push(key);
        }
    }

    pub(crate) fn remove_token(&mut self, token: Token) {
        if self.tokens.remove(&token) {
            self.keys.retain(|key| key.token() != token);
        }
    }
}

impl<'a> IntoIterator for &'a SelectedKeys {
    type Item = &'a SelectionKey;
    type IntoIter = slice::Iter<'a, SelectionKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
