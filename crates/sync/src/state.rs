//! The externally observed state container. The UI never calls into engine
//! internals; it watches a [`ViewState`] channel and renders whatever is
//! there.

use std::collections::HashMap;

use daylist_core::model::{Group, Project, Task};
use daylist_core::selection::Selection;

use crate::notice::{ConflictNotice, Notice};

#[derive(Debug, Clone)]
pub struct ViewState {
    /// The selection currently driving the visible list.
    pub selection: Selection,
    /// Visible task list for `selection`.
    pub tasks: Vec<Task>,
    /// Badge counts keyed by selection cache key.
    pub counts: HashMap<String, i64>,
    pub groups: Vec<Group>,
    pub projects: Vec<Project>,
    /// Blocking load in progress (cache miss, non-silent).
    pub loading: bool,
    /// Dismissible foreground error banner.
    pub error: Option<String>,
    /// Inline error tied to the add-task action.
    pub new_task_error: Option<String>,
    /// Transient auto-expiring notice.
    pub notice: Option<Notice>,
    /// Persists until explicitly cleared.
    pub conflict: Option<ConflictNotice>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            selection: Selection::Today,
            tasks: Vec::new(),
            counts: HashMap::new(),
            groups: Vec::new(),
            projects: Vec::new(),
            loading: false,
            error: None,
            new_task_error: None,
            notice: None,
            conflict: None,
        }
    }
}

impl ViewState {
    pub fn count_for_key(&self, key: &str) -> Option<i64> {
        self.counts.get(key).copied()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
