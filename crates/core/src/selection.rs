use std::fmt;
use std::hash::{Hash, Hasher};

use crate::model::{Project, Task, TaskStatus};

/// A logical task view. Selections double as cache identities: `cache_key`
/// is the canonical string used for cache buckets and in-flight request
/// deduplication.
#[derive(Debug, Clone)]
pub enum Selection {
    Today,
    Upcoming,
    Inbox,
    Group { id: String },
    Project { id: String },
    Search { query: String },
}

impl Selection {
    pub fn group(id: impl Into<String>) -> Self {
        Selection::Group { id: id.into() }
    }

    pub fn project(id: impl Into<String>) -> Self {
        Selection::Project { id: id.into() }
    }

    pub fn search(query: impl Into<String>) -> Self {
        Selection::Search {
            query: query.into(),
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Selection::Search { .. })
    }

    /// Canonical identity string: `<tag>`, `<tag>:<id>`, or
    /// `search:<lowercased query>`.
    pub fn cache_key(&self) -> String {
        match self {
            Selection::Today => "today".to_string(),
            Selection::Upcoming => "upcoming".to_string(),
            Selection::Inbox => "inbox".to_string(),
            Selection::Group { id } => format!("group:{}", id),
            Selection::Project { id } => format!("project:{}", id),
            Selection::Search { query } => format!("search:{}", query.to_lowercase()),
        }
    }
}

/// Equality per tag and id; search queries compare case-insensitively.
impl PartialEq for Selection {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Selection::Today, Selection::Today)
            | (Selection::Upcoming, Selection::Upcoming)
            | (Selection::Inbox, Selection::Inbox) => true,
            (Selection::Group { id: a }, Selection::Group { id: b }) => a == b,
            (Selection::Project { id: a }, Selection::Project { id: b }) => a == b,
            (Selection::Search { query: a }, Selection::Search { query: b }) => {
                a.to_lowercase() == b.to_lowercase()
            }
            _ => false,
        }
    }
}

impl Eq for Selection {}

impl Hash for Selection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must agree with the case-insensitive PartialEq.
        self.cache_key().hash(state);
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

pub fn same_selection(a: &Selection, b: &Selection) -> bool {
    a == b
}

/// Badge count for a selection over a fetched task list. Group counts
/// reflect leaf tasks: a project-marker task standing in for a project that
/// belongs to the group is not counted.
pub fn count_for(selection: &Selection, tasks: &[Task], projects: &[Project]) -> usize {
    match selection {
        Selection::Group { id } => tasks
            .iter()
            .filter(|task| !is_marker_for_group(task, id, projects))
            .count(),
        _ => tasks.len(),
    }
}

fn is_marker_for_group(task: &Task, group_id: &str, projects: &[Project]) -> bool {
    if task.status != TaskStatus::ProjectMarker {
        return false;
    }
    let Some(project_id) = task.project_id.as_deref() else {
        return false;
    };
    projects
        .iter()
        .any(|p| p.id == project_id && p.group_id.as_deref() == Some(group_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Selection::Today, "today")]
    #[case(Selection::Upcoming, "upcoming")]
    #[case(Selection::Inbox, "inbox")]
    #[case(Selection::group("g1"), "group:g1")]
    #[case(Selection::project("p1"), "project:p1")]
    #[case(Selection::search("Buy Milk"), "search:buy milk")]
    fn cache_keys_are_canonical(#[case] selection: Selection, #[case] expected: &str) {
        assert_eq!(selection.cache_key(), expected);
    }

    #[test]
    fn cache_keys_are_injective_over_distinct_selections() {
        let selections = [
            Selection::Today,
            Selection::Upcoming,
            Selection::Inbox,
            Selection::group("x"),
            Selection::project("x"),
            Selection::search("x"),
        ];
        for (i, a) in selections.iter().enumerate() {
            for (j, b) in selections.iter().enumerate() {
                assert_eq!(i == j, a.cache_key() == b.cache_key());
            }
        }
    }

    #[test]
    fn search_equality_ignores_case() {
        let a = Selection::search("Groceries");
        let b = Selection::search("groceries");
        let c = Selection::search("GROCERIES");

        // Reflexive, symmetric, transitive.
        assert!(same_selection(&a, &a));
        assert!(same_selection(&a, &b) && same_selection(&b, &a));
        assert!(same_selection(&a, &b) && same_selection(&b, &c) && same_selection(&a, &c));
        assert!(!same_selection(&a, &Selection::search("errands")));
    }

    #[test]
    fn group_and_project_with_same_id_differ() {
        assert!(!same_selection(
            &Selection::group("42"),
            &Selection::project("42")
        ));
    }

    #[test]
    fn group_count_excludes_own_project_markers() {
        let projects = vec![
            Project {
                id: "p1".into(),
                title: "Launch".into(),
                group_id: Some("g1".into()),
            },
            Project {
                id: "p2".into(),
                title: "Elsewhere".into(),
                group_id: Some("g9".into()),
            },
        ];

        let mut marker = Task::new("m1".into(), "Launch".into());
        marker.status = TaskStatus::ProjectMarker;
        marker.project_id = Some("p1".into());

        let mut foreign_marker = Task::new("m2".into(), "Elsewhere".into());
        foreign_marker.status = TaskStatus::ProjectMarker;
        foreign_marker.project_id = Some("p2".into());

        let leaf = Task::new("t1".into(), "Order stickers".into());

        let tasks = vec![marker, foreign_marker, leaf];
        assert_eq!(count_for(&Selection::group("g1"), &tasks, &projects), 2);
        // Non-group selections count everything present.
        assert_eq!(count_for(&Selection::Today, &tasks, &projects), 3);
    }
}
