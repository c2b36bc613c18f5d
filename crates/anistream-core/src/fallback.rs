//! Ordered fallback chains
//!
//! A [`FallbackChain`] is a cursor over an ordered list of alternatives (providers,
//! CDN servers). Walking it records every failure so the final error can name
//! each attempt.

use std::fmt::Display;

/// Cursor over ordered alternatives with an error ledger
#[derive(Debug, Clone)]
pub struct FallbackChain<T> {
    items: Vec<T>,
    position: usize,
    errors: Vec<String>,
}

impl<T: Clone + PartialEq + Display> FallbackChain<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            position: 0,
            errors: Vec::new(),
        }
    }

    /// Chain that starts at `first` and continues with the remaining items in
    /// their configured order. `first` is prepended when it isn't configured.
    pub fn starting_at(first: T, configured: &[T]) -> Self {
        let mut items = vec![first.clone()];
        items.extend(configured.iter().filter(|item| **item != first).cloned());
        Self::new(items)
    }

    /// Alternative currently being tried
    pub fn current(&self) -> Option<&T> {
        self.items.get(self.position)
    }

    pub fn is_first(&self) -> bool {
        self.position == 0
    }

    /// Record the failure of the current alternative and move to the next one
    pub fn fail(&mut self, error: impl Display) -> Option<&T> {
        if let Some(item) = self.items.get(self.position) {
            self.errors.push(format!("[{}] {}", item, error));
            self.position += 1;
        }
        self.current()
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.items.len()
    }

    /// Alternatives not yet tried, current one included
    pub fn remaining(&self) -> &[T] {
        self.items.get(self.position..).unwrap_or_default()
    }

    /// Alternatives already tried and failed
    pub fn attempted(&self) -> &[T] {
        &self.items[..self.position.min(self.items.len())]
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Accumulated failures, one per attempt
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }
}
