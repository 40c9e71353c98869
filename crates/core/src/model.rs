use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ulid::Ulid;

/// Prefix of client-assigned ids for tasks created while the server ack is
/// still outstanding. The server never issues ids of this shape.
pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn temp_task_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Ulid::new())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Open,
    Completed,
    Trashed,
    Someday,
    Inbox,
    ProjectMarker,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Completed => "completed",
            TaskStatus::Trashed => "trashed",
            TaskStatus::Someday => "someday",
            TaskStatus::Inbox => "inbox",
            TaskStatus::ProjectMarker => "project-marker",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(TaskStatus::Open),
            "completed" | "done" => Ok(TaskStatus::Completed),
            "trashed" => Ok(TaskStatus::Trashed),
            "someday" => Ok(TaskStatus::Someday),
            "inbox" => Ok(TaskStatus::Inbox),
            "project-marker" | "project_marker" => Ok(TaskStatus::ProjectMarker),
            other => Err(anyhow!(
                "Unknown status '{}': expected open|completed|trashed|someday|inbox|project-marker",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepeatKind {
    Daily,
    Weekly,
    Monthly,
}

impl RepeatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatKind::Daily => "daily",
            RepeatKind::Weekly => "weekly",
            RepeatKind::Monthly => "monthly",
        }
    }
}

impl fmt::Display for RepeatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recurrence rule attached to a task. Successor instances are generated by
/// the server when a recurring task completes; the client never computes the
/// next occurrence itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepeatRule {
    pub kind: RepeatKind,
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
}

impl RepeatRule {
    pub fn every(kind: RepeatKind, interval: u32) -> Self {
        Self {
            kind,
            interval,
            weekday: None,
            day_of_month: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Minimal open task; optimistic creates start from this.
    pub fn new(id: String, title: String) -> Self {
        Self {
            id,
            title,
            notes: None,
            status: TaskStatus::Open,
            deadline: None,
            repeat: None,
            group_id: None,
            project_id: None,
            deleted_at: None,
            updated_at: Utc::now(),
        }
    }

    /// A hidden task never appears in any view.
    pub fn is_hidden(&self) -> bool {
        self.deleted_at.is_some()
            || matches!(self.status, TaskStatus::Completed | TaskStatus::Trashed)
    }

    /// The group a task is listed under: explicit, or inherited from its
    /// owning project.
    pub fn effective_group<'a>(&'a self, projects: &'a [Project]) -> Option<&'a str> {
        if let Some(group) = self.group_id.as_deref() {
            return Some(group);
        }
        let project_id = self.project_id.as_deref()?;
        projects
            .iter()
            .find(|p| p.id == project_id)
            .and_then(|p| p.group_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Deserializes a present-but-possibly-null field into `Some(inner)`, so that
/// combined with `#[serde(default)]` the three wire cases stay distinct:
/// absent => `None` (keep), `null` => `Some(None)` (clear), value =>
/// `Some(Some(v))` (set).
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Partial, authoritative task record from a sync response. Only fields the
/// server actually sent are applied to the local copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub id: String,
    /// Server-assigned replacement for a temporary client id (add ack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Option<NaiveDate>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub repeat: Option<Option<RepeatRule>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_id: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(id) = &self.canonical_id {
            task.id = id.clone();
        }
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(notes) = &self.notes {
            task.notes = notes.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(deadline) = self.deadline {
            task.deadline = deadline;
        }
        if let Some(repeat) = &self.repeat {
            task.repeat = repeat.clone();
        }
        if let Some(group) = &self.group_id {
            task.group_id = group.clone();
        }
        if let Some(project) = &self.project_id {
            task.project_id = project.clone();
        }
        if let Some(deleted) = self.deleted_at {
            task.deleted_at = deleted;
        }
        if let Some(updated) = self.updated_at {
            task.updated_at = updated;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl GroupPatch {
    pub fn apply_to(&self, group: &mut Group) {
        if let Some(title) = &self.title {
            group.title = title.clone();
        }
    }

    pub fn into_group(self) -> Option<Group> {
        Some(Group {
            id: self.id,
            title: self.title?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_id: Option<Option<String>>,
}

impl ProjectPatch {
    pub fn apply_to(&self, project: &mut Project) {
        if let Some(title) = &self.title {
            project.title = title.clone();
        }
        if let Some(group) = &self.group_id {
            project.group_id = group.clone();
        }
    }

    pub fn into_project(self) -> Option<Project> {
        Some(Project {
            id: self.id,
            title: self.title?,
            group_id: self.group_id.flatten(),
        })
    }
}

/// One queued mutation as sent to the remote mutation endpoint. The wire
/// shape is flat: `{op, id, ...fields}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    Add {
        id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<NaiveDate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    Complete {
        id: String,
    },
    Rename {
        id: String,
        title: String,
    },
    Notes {
        id: String,
        notes: String,
    },
    Move {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    Trash {
        id: String,
    },
    SetRepeat {
        id: String,
        #[serde(default)]
        repeat: Option<RepeatRule>,
    },
    ClearDue {
        id: String,
    },
    Defer {
        id: String,
        deadline: NaiveDate,
    },
}

impl MutationOp {
    pub fn name(&self) -> &'static str {
        match self {
            MutationOp::Add { .. } => "add",
            MutationOp::Complete { .. } => "complete",
            MutationOp::Rename { .. } => "rename",
            MutationOp::Notes { .. } => "notes",
            MutationOp::Move { .. } => "move",
            MutationOp::Trash { .. } => "trash",
            MutationOp::SetRepeat { .. } => "set_repeat",
            MutationOp::ClearDue { .. } => "clear_due",
            MutationOp::Defer { .. } => "defer",
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            MutationOp::Add { id, .. }
            | MutationOp::Complete { id }
            | MutationOp::Rename { id, .. }
            | MutationOp::Notes { id, .. }
            | MutationOp::Move { id, .. }
            | MutationOp::Trash { id }
            | MutationOp::SetRepeat { id, .. }
            | MutationOp::ClearDue { id }
            | MutationOp::Defer { id, .. } => id,
        }
    }

    /// Duplicate key for UI-originated repeats at enqueue time. Entries are
    /// never deduplicated once persisted.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.name(), self.target_id())
    }
}

/// A persisted outbox record. `prior` holds the pre-mutation task so a
/// permanently rejected entry can be rolled back exactly; it stays local and
/// is never part of the wire batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub op: MutationOp,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpdates {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskPatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ProjectPatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupPatch>,
}

impl SyncUpdates {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.projects.is_empty() && self.groups.is_empty()
    }
}

/// Authoritative result of replaying an outbox batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<SyncUpdates>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<SyncConflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_tasks: Vec<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_task() -> Task {
        Task::new("t1".into(), "Write release notes".into())
    }

    #[test]
    fn temp_ids_are_recognizable() {
        let id = temp_task_id();
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("01HZX3Q4"));
    }

    #[test]
    fn hidden_covers_completed_trashed_and_deleted() {
        let mut task = base_task();
        assert!(!task.is_hidden());
        task.status = TaskStatus::Completed;
        assert!(task.is_hidden());
        task.status = TaskStatus::Open;
        task.deleted_at = Some(Utc::now());
        assert!(task.is_hidden());
    }

    #[test]
    fn effective_group_prefers_explicit_over_inherited() {
        let projects = vec![Project {
            id: "p1".into(),
            title: "Launch".into(),
            group_id: Some("g1".into()),
        }];

        let mut task = base_task();
        task.project_id = Some("p1".into());
        assert_eq!(task.effective_group(&projects), Some("g1"));

        task.group_id = Some("g2".into());
        assert_eq!(task.effective_group(&projects), Some("g2"));
    }

    #[test]
    fn patch_distinguishes_absent_null_and_value() {
        let patch: TaskPatch =
            serde_json::from_str(r#"{"id":"t1","title":"New","deadline":null}"#).expect("parse");
        assert_eq!(patch.title.as_deref(), Some("New"));
        assert_eq!(patch.deadline, Some(None));
        assert_eq!(patch.notes, None);

        let mut task = base_task();
        task.deadline = NaiveDate::from_ymd_opt(2026, 9, 1);
        task.notes = Some("keep me".into());
        patch.apply_to(&mut task);

        assert_eq!(task.title, "New");
        assert_eq!(task.deadline, None);
        assert_eq!(task.notes.as_deref(), Some("keep me"));
    }

    #[test]
    fn patch_canonical_id_replaces_temp_id() {
        let mut task = base_task();
        task.id = temp_task_id();
        let patch = TaskPatch {
            id: task.id.clone(),
            canonical_id: Some("srv-42".into()),
            ..TaskPatch::default()
        };
        patch.apply_to(&mut task);
        assert_eq!(task.id, "srv-42");
    }

    #[test]
    fn mutation_op_wire_shape_is_flat() {
        let op = MutationOp::Defer {
            id: "t1".into(),
            deadline: NaiveDate::from_ymd_opt(2026, 9, 2).expect("date"),
        };
        let json = serde_json::to_value(&op).expect("serialize");
        assert_eq!(json["op"], "defer");
        assert_eq!(json["id"], "t1");
        assert_eq!(json["deadline"], "2026-09-02");
        assert_eq!(op.idempotency_key(), "defer:t1");
    }

    #[test]
    fn sync_response_defaults_are_empty() {
        let response: SyncResponse = serde_json::from_str("{}").expect("parse");
        assert!(response.updates.is_none());
        assert!(response.conflicts.is_empty());
        assert!(response.next_tasks.is_empty());
    }

    #[test]
    fn sync_response_reads_camel_case_next_tasks() {
        let response: SyncResponse = serde_json::from_str(
            r#"{"nextTasks":[{"id":"t9","title":"Water plants","status":"open","updatedAt":"2026-08-30T08:00:00Z"}]}"#,
        )
        .expect("parse");
        assert_eq!(response.next_tasks.len(), 1);
        assert_eq!(response.next_tasks[0].id, "t9");
    }
}
