//! Cache-bucket fan-out. Every code path that changes a task record (the
//! optimistic mutation pipeline, sync-response merges, rollbacks) funnels
//! through [`TaskStore::apply_record`], which rewrites each cache bucket the
//! task could plausibly appear in plus the visible list and counts.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};

use daylist_core::cache::{view_bucket_key, CacheName, COUNTS_KEY};
use daylist_core::model::{Project, Task, TaskStatus};
use daylist_core::selection::{count_for, Selection};

use super::TaskStore;

/// Membership test for a non-search bucket. Hidden tasks belong nowhere.
pub(crate) fn bucket_accepts(
    selection: &Selection,
    task: &Task,
    today: NaiveDate,
    projects: &[Project],
) -> bool {
    if task.is_hidden() {
        return false;
    }
    match selection {
        Selection::Today => task.deadline.is_some_and(|d| d <= today),
        Selection::Upcoming => task.deadline.is_some_and(|d| d > today),
        Selection::Inbox => task.status == TaskStatus::Inbox,
        Selection::Group { id } => task.effective_group(projects) == Some(id.as_str()),
        Selection::Project { id } => task.project_id.as_deref() == Some(id.as_str()),
        // Search results are never rewritten optimistically; they refresh
        // on the next query.
        Selection::Search { .. } => false,
    }
}

/// Buckets a record transition could touch: the fixed primary views plus the
/// group/project buckets of both the old and the new record.
fn candidate_selections(
    after: Option<&Task>,
    before: Option<&Task>,
    projects: &[Project],
) -> Vec<Selection> {
    let mut candidates = vec![Selection::Today, Selection::Upcoming, Selection::Inbox];
    for task in [before, after].into_iter().flatten() {
        if let Some(group) = task.effective_group(projects) {
            candidates.push(Selection::group(group));
        }
        if let Some(group) = task.group_id.as_deref() {
            candidates.push(Selection::group(group));
        }
        if let Some(project) = task.project_id.as_deref() {
            candidates.push(Selection::project(project));
        }
    }
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|s| seen.insert(s.cache_key()));
    candidates
}

fn upsert_in_place(tasks: &mut Vec<Task>, old_id: &str, record: &Task) -> bool {
    if let Some(pos) = tasks.iter().position(|t| t.id == old_id || t.id == record.id) {
        if tasks[pos] == *record {
            return false;
        }
        // Same list position: an acked create must not visibly reorder.
        tasks[pos] = record.clone();
    } else {
        tasks.push(record.clone());
    }
    true
}

fn remove_by_id(tasks: &mut Vec<Task>, old_id: &str, new_id: &str) -> bool {
    let before = tasks.len();
    tasks.retain(|t| t.id != old_id && t.id != new_id);
    tasks.len() != before
}

fn apply_count_deltas(
    counts: &mut HashMap<String, i64>,
    deltas: &[(String, i64)],
    inferred: &[(String, i64)],
) {
    for (key, delta) in deltas {
        let slot = counts.entry(key.clone()).or_insert(0);
        *slot = (*slot + delta).max(0);
    }
    for (key, delta) in inferred {
        if let Some(slot) = counts.get_mut(key) {
            *slot = (*slot + delta).max(0);
        }
    }
}

impl TaskStore {
    /// Applies one record transition everywhere at once: existing cache
    /// buckets, the counts cache (±1 arithmetic, no recomputation pass),
    /// the visible list, and the durable store. `before` is the record as it
    /// was (None for a create), `after` the record as it should be (None for
    /// a hard removal). Passing the arguments swapped rolls the transition
    /// back.
    pub(crate) fn apply_record(&self, after: Option<&Task>, before: Option<&Task>) {
        let Some(reference) = after.or(before) else {
            return;
        };
        let old_id = before.unwrap_or(reference).id.clone();
        let new_id = after.unwrap_or(reference).id.clone();

        let today = Utc::now().date_naive();
        let projects = self.projects_snapshot();
        let views = CacheName::Views.policy();
        let counts_policy = CacheName::Counts.policy();

        let mut deltas: Vec<(String, i64)> = Vec::new();
        // Deltas for buckets that were never fetched; applied only to count
        // keys that already exist (seeded by the counts endpoint), since a
        // delta against an unknown base would fabricate a count.
        let mut inferred_deltas: Vec<(String, i64)> = Vec::new();

        for selection in candidate_selections(after, before, &projects) {
            let bucket = view_bucket_key(&selection);
            let accepts_after = after
                .map(|t| bucket_accepts(&selection, t, today, &projects))
                .unwrap_or(false);
            // Read-modify-write from the freshly read value; a captured list
            // could lose updates across interleavings.
            match self.inner.cache.get::<Vec<Task>>(&bucket, views) {
                Some(mut tasks) => {
                    let was_present = tasks.iter().any(|t| t.id == old_id || t.id == new_id);
                    let changed = if accepts_after {
                        upsert_in_place(&mut tasks, &old_id, after.expect("accepts implies after"))
                    } else {
                        remove_by_id(&mut tasks, &old_id, &new_id)
                    };
                    if changed {
                        self.inner.cache.set(&bucket, &tasks, views);
                    }
                    match (was_present, accepts_after) {
                        (false, true) => deltas.push((selection.cache_key(), 1)),
                        (true, false) => deltas.push((selection.cache_key(), -1)),
                        _ => {}
                    }
                }
                None => {
                    let accepted_before = before
                        .map(|t| bucket_accepts(&selection, t, today, &projects))
                        .unwrap_or(false);
                    match (accepted_before, accepts_after) {
                        (false, true) => inferred_deltas.push((selection.cache_key(), 1)),
                        (true, false) => inferred_deltas.push((selection.cache_key(), -1)),
                        _ => {}
                    }
                }
            }
        }

        if !deltas.is_empty() || !inferred_deltas.is_empty() {
            let mut counts: HashMap<String, i64> = self
                .inner
                .cache
                .get(COUNTS_KEY, counts_policy)
                .unwrap_or_default();
            apply_count_deltas(&mut counts, &deltas, &inferred_deltas);
            self.inner.cache.set(COUNTS_KEY, &counts, counts_policy);
            self.update_state(|s| {
                apply_count_deltas(&mut s.counts, &deltas, &inferred_deltas);
            });
        }

        // Visible list follows the same membership rules as its bucket.
        {
            let projects = projects.clone();
            let after = after.cloned();
            let old_id = old_id.clone();
            let new_id = new_id.clone();
            self.update_state(move |s| {
                if s.selection.is_search() {
                    // Search membership is query-defined, not derivable
                    // locally: edits replace the record in place, and only a
                    // hidden or removed record leaves the results.
                    match after.as_ref().filter(|t| !t.is_hidden()) {
                        Some(record) => {
                            if let Some(pos) = s
                                .tasks
                                .iter()
                                .position(|t| t.id == old_id || t.id == record.id)
                            {
                                s.tasks[pos] = record.clone();
                            }
                        }
                        None => {
                            remove_by_id(&mut s.tasks, &old_id, &new_id);
                        }
                    }
                    return;
                }
                let accepts = after
                    .as_ref()
                    .map(|t| bucket_accepts(&s.selection, t, today, &projects))
                    .unwrap_or(false);
                if accepts {
                    upsert_in_place(&mut s.tasks, &old_id, after.as_ref().expect("accepts"));
                } else {
                    remove_by_id(&mut s.tasks, &old_id, &new_id);
                }
                if let Selection::Group { .. } = &s.selection {
                    // Group counts ignore project markers, so recompute the
                    // visible one from the list we just rewrote.
                    s.counts
                        .insert(s.selection.cache_key(), count_for(&s.selection, &s.tasks, &projects) as i64);
                }
            });
        }

        // Durable mirror: full merged records, keyed replace.
        if old_id != new_id {
            if let Err(err) = self.inner.store.remove_tasks(std::slice::from_ref(&old_id)) {
                tracing::debug!("durable remove failed for {old_id}: {err:#}");
            }
        }
        match after {
            Some(task) => {
                if let Err(err) = self.inner.store.upsert_tasks(std::slice::from_ref(task)) {
                    tracing::debug!("durable upsert failed for {}: {err:#}", task.id);
                }
            }
            None => {
                if let Err(err) = self.inner.store.remove_tasks(std::slice::from_ref(&new_id)) {
                    tracing::debug!("durable remove failed for {new_id}: {err:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn projects() -> Vec<Project> {
        vec![Project {
            id: "p1".into(),
            title: "Launch".into(),
            group_id: Some("g1".into()),
        }]
    }

    fn dated(id: &str, offset_days: i64) -> Task {
        let mut task = Task::new(id.into(), format!("task {id}"));
        task.deadline = Some(Utc::now().date_naive() + Duration::days(offset_days));
        task
    }

    #[test]
    fn today_and_upcoming_are_deadline_partitioned() {
        let today = Utc::now().date_naive();
        let due_today = dated("a", 0);
        let overdue = dated("b", -3);
        let future = dated("c", 5);

        assert!(bucket_accepts(&Selection::Today, &due_today, today, &[]));
        assert!(bucket_accepts(&Selection::Today, &overdue, today, &[]));
        assert!(!bucket_accepts(&Selection::Today, &future, today, &[]));
        assert!(bucket_accepts(&Selection::Upcoming, &future, today, &[]));
        assert!(!bucket_accepts(&Selection::Upcoming, &due_today, today, &[]));
    }

    #[test]
    fn hidden_tasks_belong_to_no_bucket() {
        let today = Utc::now().date_naive();
        let mut task = dated("a", 0);
        task.status = TaskStatus::Completed;
        assert!(!bucket_accepts(&Selection::Today, &task, today, &[]));
        assert!(!bucket_accepts(&Selection::Inbox, &task, today, &[]));
    }

    #[test]
    fn group_membership_follows_effective_group() {
        let today = Utc::now().date_naive();
        let mut task = Task::new("a".into(), "x".into());
        task.project_id = Some("p1".into());
        assert!(bucket_accepts(
            &Selection::group("g1"),
            &task,
            today,
            &projects()
        ));
        assert!(!bucket_accepts(
            &Selection::group("g2"),
            &task,
            today,
            &projects()
        ));
    }

    #[test]
    fn candidates_cover_old_and_new_homes() {
        let mut before = Task::new("a".into(), "x".into());
        before.group_id = Some("g1".into());
        let mut after = before.clone();
        after.group_id = None;
        after.project_id = Some("p2".into());

        let keys: Vec<String> = candidate_selections(Some(&after), Some(&before), &[])
            .iter()
            .map(|s| s.cache_key())
            .collect();
        assert!(keys.contains(&"group:g1".to_string()));
        assert!(keys.contains(&"project:p2".to_string()));
        assert!(keys.contains(&"today".to_string()));
    }

    #[test]
    fn upsert_replaces_in_place_keeping_position() {
        let mut tasks = vec![dated("a", 0), dated("b", 0), dated("c", 0)];
        let mut replacement = dated("srv-9", 0);
        replacement.title = "renamed".into();
        assert!(upsert_in_place(&mut tasks, "b", &replacement));
        assert_eq!(tasks[1].id, "srv-9");
        assert_eq!(tasks[1].title, "renamed");
        assert_eq!(tasks.len(), 3);
    }
}
