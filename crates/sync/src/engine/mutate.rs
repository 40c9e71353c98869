//! Optimistic mutations. Every edit follows the same pipeline: validate,
//! apply the full local effect synchronously, persist the op to the outbox
//! with a rollback snapshot, then kick off a flush and a delayed silent
//! reconcile when online. The visible result never waits for the network.

use chrono::{Duration, NaiveDate, Utc};

use daylist_core::model::{
    temp_task_id, MutationOp, RepeatRule, Task, TaskStatus,
};
use daylist_core::selection::Selection;

use crate::error::EngineError;

use super::TaskStore;

/// Fields of an add-task request. Anything left unset is defaulted from the
/// selection the user is looking at.
#[derive(Debug, Clone, Default)]
pub struct NewTaskInput {
    pub title: String,
    pub notes: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub group_id: Option<String>,
    pub project_id: Option<String>,
}

impl TaskStore {
    /// Creates a task under a temporary client id and queues the create.
    /// Returns the temporary id; the sync ack swaps in the canonical one
    /// without moving the task's list position.
    pub fn add_task(&self, input: NewTaskInput) -> Result<String, EngineError> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            self.update_state(|s| s.new_task_error = Some("Title cannot be empty".to_string()));
            return Err(EngineError::EmptyTitle);
        }

        let mut task = Task::new(temp_task_id(), title.clone());
        task.notes = input.notes;
        task.deadline = input.deadline;
        task.group_id = input.group_id;
        task.project_id = input.project_id;

        if task.deadline.is_none() && task.group_id.is_none() && task.project_id.is_none() {
            let selection = self.inner.state_tx.borrow().selection.clone();
            match &selection {
                Selection::Today => task.deadline = Some(Utc::now().date_naive()),
                Selection::Upcoming => {
                    task.deadline = Some(Utc::now().date_naive() + Duration::days(1));
                }
                Selection::Inbox => task.status = TaskStatus::Inbox,
                Selection::Group { id } => task.group_id = Some(id.clone()),
                Selection::Project { id } => task.project_id = Some(id.clone()),
                Selection::Search { .. } => {
                    self.update_state(|s| {
                        s.new_task_error = Some("Pick a list for the new task".to_string());
                    });
                    return Err(EngineError::NoTargetList);
                }
            }
        }

        self.apply_record(Some(&task), None);

        let op = MutationOp::Add {
            id: task.id.clone(),
            title,
            notes: task.notes.clone(),
            status: task.status,
            deadline: task.deadline,
            group_id: task.group_id.clone(),
            project_id: task.project_id.clone(),
        };
        if let Err(err) = self.inner.store.enqueue_outbox(op, None) {
            self.apply_record(None, Some(&task));
            return Err(EngineError::Store(err));
        }

        self.update_state(|s| s.new_task_error = None);
        self.after_mutation();
        Ok(task.id)
    }

    pub fn complete_task(&self, id: &str) -> Result<(), EngineError> {
        self.mutate_existing(id, MutationOp::Complete { id: id.to_string() }, |task| {
            task.status = TaskStatus::Completed;
        })
    }

    pub fn rename_task(&self, id: &str, title: &str) -> Result<(), EngineError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(EngineError::EmptyTitle);
        }
        let op = MutationOp::Rename {
            id: id.to_string(),
            title: title.clone(),
        };
        self.mutate_existing(id, op, move |task| task.title = title)
    }

    pub fn set_notes(&self, id: &str, notes: &str) -> Result<(), EngineError> {
        let notes = notes.to_string();
        let op = MutationOp::Notes {
            id: id.to_string(),
            notes: notes.clone(),
        };
        self.mutate_existing(id, op, move |task| {
            task.notes = if notes.is_empty() { None } else { Some(notes) };
        })
    }

    /// Moving replaces both placement fields at once; the two are a unit,
    /// not independent knobs.
    pub fn move_task(
        &self,
        id: &str,
        group_id: Option<String>,
        project_id: Option<String>,
    ) -> Result<(), EngineError> {
        let op = MutationOp::Move {
            id: id.to_string(),
            group_id: group_id.clone(),
            project_id: project_id.clone(),
        };
        self.mutate_existing(id, op, move |task| {
            task.group_id = group_id;
            task.project_id = project_id;
        })
    }

    pub fn trash_task(&self, id: &str) -> Result<(), EngineError> {
        self.mutate_existing(id, MutationOp::Trash { id: id.to_string() }, |task| {
            task.status = TaskStatus::Trashed;
        })
    }

    pub fn set_due_date(&self, id: &str, deadline: NaiveDate) -> Result<(), EngineError> {
        let op = MutationOp::Defer {
            id: id.to_string(),
            deadline,
        };
        self.mutate_existing(id, op, move |task| task.deadline = Some(deadline))
    }

    pub fn clear_due_date(&self, id: &str) -> Result<(), EngineError> {
        self.mutate_existing(id, MutationOp::ClearDue { id: id.to_string() }, |task| {
            task.deadline = None;
        })
    }

    pub fn set_repeat(&self, id: &str, repeat: Option<RepeatRule>) -> Result<(), EngineError> {
        let op = MutationOp::SetRepeat {
            id: id.to_string(),
            repeat: repeat.clone(),
        };
        self.mutate_existing(id, op, move |task| task.repeat = repeat)
    }

    /// The shared pipeline for edits of an existing record: optimistic
    /// apply, outbox enqueue with the pre-mutation snapshot, and rollback of
    /// the optimistic effect if the enqueue itself fails.
    fn mutate_existing(
        &self,
        id: &str,
        op: MutationOp,
        edit: impl FnOnce(&mut Task),
    ) -> Result<(), EngineError> {
        let before = self
            .find_task(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        let mut after = before.clone();
        edit(&mut after);
        after.updated_at = Utc::now();

        self.apply_record(Some(&after), Some(&before));

        if let Err(err) = self.inner.store.enqueue_outbox(op, Some(before.clone())) {
            self.apply_record(Some(&before), Some(&after));
            return Err(EngineError::Store(err));
        }

        self.after_mutation();
        Ok(())
    }

    /// When online: start draining the outbox now, then reconcile the
    /// visible view against the server after a short delay. When offline
    /// the entry simply waits for the connectivity listener.
    fn after_mutation(&self) {
        if !self.inner.connectivity.is_online() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.flush_outbox().await;
        });
        self.schedule_reconcile();
    }
}
