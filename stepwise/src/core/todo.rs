//! Ordered, case-insensitive status tracker keyed by title.

use serde::{Deserialize, Serialize};

use crate::core::types::TodoStatus;

/// Rendering of an empty store.
pub const EMPTY_TODOS: &str = "(no todos)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: u32,
    pub title: String,
    pub status: TodoStatus,
}

/// Todo list for a single run. Construct a fresh one per run.
#[derive(Debug, Clone, Default)]
pub struct TodoStore {
    items: Vec<TodoItem>,
}

impl TodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the status of the item whose title matches case-insensitively,
    /// or append a new item. Blank titles are ignored and yield `None`.
    pub fn upsert(&mut self, title: &str, status: TodoStatus) -> Option<TodoItem> {
        let title = title.trim();
        if title.is_empty() {
            return None;
        }
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|item| titles_match(&item.title, title))
        {
            item.status = status;
            return Some(item.clone());
        }
        let item = TodoItem {
            id: self.items.len() as u32 + 1,
            title: title.to_string(),
            status,
        };
        self.items.push(item.clone());
        Some(item)
    }

    pub fn all(&self) -> Vec<TodoItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return EMPTY_TODOS.to_string();
        }
        self.items
            .iter()
            .map(|item| format!("- [{}] {}. {}", item.status, item.id, item.title))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn titles_match(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
