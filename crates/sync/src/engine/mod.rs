//! The `TaskStore` facade: one explicitly constructed coordinator object per
//! session, holding every piece of engine state that would otherwise live in
//! hidden module-level globals (in-flight maps, last-selection memory,
//! debounce state). Disposable and resettable, which is what the tests rely
//! on.

mod buckets;
mod coordinator;
mod loader;
mod mutate;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use daylist_core::cache::KvCache;
use daylist_core::model::{Group, Project, Task};
use daylist_core::selection::Selection;
use daylist_core::store::DurableStore;

use crate::api::{Connectivity, RemoteApi};
use crate::notice::Notice;
use crate::state::ViewState;

pub use loader::LoadOptions;
pub use mutate::NewTaskInput;

pub type NextTasksHook = Box<dyn Fn(&[Task]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum outbox entries replayed per sync request.
    pub outbox_batch: usize,
    /// Quiet period before a queued search query fetches.
    pub search_debounce: Duration,
    /// Gap between opportunistic preloads of the primary views.
    pub preload_stagger: Duration,
    /// Lifetime of transient notices.
    pub notice_ttl: Duration,
    /// Bounds every fetch so a hung request cannot wedge its in-flight
    /// dedup slot forever.
    pub fetch_timeout: Duration,
    /// Delay before the post-mutation silent reconcile reload.
    pub reconcile_delay: Duration,
    /// Initialization is skipped entirely in non-interactive environments
    /// (server-side rendering, widget data refresh).
    pub interactive: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            outbox_batch: 20,
            search_debounce: Duration::from_millis(250),
            preload_stagger: Duration::from_millis(300),
            notice_ttl: Duration::from_secs(6),
            fetch_timeout: Duration::from_secs(30),
            reconcile_delay: Duration::from_millis(400),
            interactive: true,
        }
    }
}

/// Metadata mirror merged from snapshots and fetch responses.
#[derive(Default)]
pub(crate) struct MetaState {
    pub(crate) groups: BTreeMap<String, Group>,
    pub(crate) projects: BTreeMap<String, Project>,
    /// Restored by `clear_search`.
    pub(crate) last_non_search: Option<Selection>,
}

impl MetaState {
    pub(crate) fn groups_vec(&self) -> Vec<Group> {
        self.groups.values().cloned().collect()
    }

    pub(crate) fn projects_vec(&self) -> Vec<Project> {
        self.projects.values().cloned().collect()
    }
}

#[derive(Default)]
pub(crate) struct SearchState {
    pub(crate) pending: Option<String>,
    pub(crate) draining: bool,
}

/// Cached metadata envelope stored under `tasks.meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CachedMeta {
    pub(crate) groups: Vec<Group>,
    pub(crate) projects: Vec<Project>,
}

pub(crate) struct Inner {
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) connectivity: Arc<dyn Connectivity>,
    pub(crate) store: Arc<DurableStore>,
    pub(crate) cache: KvCache,
    pub(crate) options: EngineOptions,
    pub(crate) state_tx: watch::Sender<ViewState>,
    pub(crate) meta: Mutex<MetaState>,
    /// One outstanding fetch per view key; joiners await the receiver.
    pub(crate) in_flight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    /// Monotonic load tokens; a boolean could not tell "still superseded"
    /// from "became current again".
    pub(crate) load_seq: AtomicU64,
    pub(crate) display_token: AtomicU64,
    pub(crate) preload_started: AtomicBool,
    pub(crate) initialized: AtomicBool,
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    pub(crate) search: Mutex<SearchState>,
    pub(crate) notice_seq: AtomicU64,
    pub(crate) next_tasks_hook: Mutex<Option<NextTasksHook>>,
}

/// Client-side task synchronization and cache engine.
#[derive(Clone)]
pub struct TaskStore {
    pub(crate) inner: Arc<Inner>,
}

impl TaskStore {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
        store: Arc<DurableStore>,
        options: EngineOptions,
    ) -> Self {
        let cache = KvCache::open(store.clone());
        let (state_tx, _) = watch::channel(ViewState::default());
        Self {
            inner: Arc::new(Inner {
                remote,
                connectivity,
                store,
                cache,
                options,
                state_tx,
                meta: Mutex::new(MetaState::default()),
                in_flight: Mutex::new(HashMap::new()),
                load_seq: AtomicU64::new(0),
                display_token: AtomicU64::new(0),
                preload_started: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                flush_lock: tokio::sync::Mutex::new(()),
                search: Mutex::new(SearchState::default()),
                notice_seq: AtomicU64::new(0),
                next_tasks_hook: Mutex::new(None),
            }),
        }
    }

    /// The UI's only window into the engine.
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> ViewState {
        self.inner.state_tx.borrow().clone()
    }

    /// Called when a sync response carries server-generated successor
    /// instances of completed recurring tasks.
    pub fn set_next_tasks_hook(&self, hook: NextTasksHook) {
        *self.inner.next_tasks_hook.lock() = Some(hook);
    }

    pub fn clear_conflict(&self) {
        self.update_state(|s| s.conflict = None);
    }

    pub fn clear_error(&self) {
        self.update_state(|s| s.error = None);
    }

    pub fn clear_new_task_error(&self) {
        self.update_state(|s| s.new_task_error = None);
    }

    /// Wholesale reset (logout): every cache bucket, every durable table,
    /// and the visible state go back to empty.
    pub fn reset(&self) {
        if let Err(err) = self.inner.store.wipe() {
            debug!("store wipe failed during reset: {err:#}");
        }
        self.inner.cache.clear();
        *self.inner.meta.lock() = MetaState::default();
        *self.inner.search.lock() = SearchState::default();
        self.inner.in_flight.lock().clear();
        self.inner.preload_started.store(false, Ordering::SeqCst);
        self.inner.initialized.store(false, Ordering::SeqCst);
        let _ = self.inner.state_tx.send(ViewState::default());
    }

    pub(crate) fn update_state(&self, f: impl FnOnce(&mut ViewState)) {
        self.inner.state_tx.send_modify(f);
    }

    pub(crate) fn publish_meta(&self) {
        let (groups, projects) = {
            let meta = self.inner.meta.lock();
            (meta.groups_vec(), meta.projects_vec())
        };
        self.update_state(|s| {
            s.groups = groups;
            s.projects = projects;
        });
    }

    /// Posts a transient notice and schedules its expiry; a newer notice
    /// cancels the older expiry.
    pub(crate) fn post_notice(&self, notice: Notice) {
        let seq = self.inner.notice_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_state(|s| s.notice = Some(notice));
        let this = self.clone();
        let ttl = self.inner.options.notice_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if this.inner.notice_seq.load(Ordering::SeqCst) == seq {
                this.update_state(|s| s.notice = None);
            }
        });
    }

    /// Current record for a task: visible list first, then the durable
    /// snapshot.
    pub(crate) fn find_task(&self, id: &str) -> Option<Task> {
        if let Some(task) = self.inner.state_tx.borrow().task(id) {
            return Some(task.clone());
        }
        match self.inner.store.load_snapshot() {
            Ok(snapshot) => snapshot.tasks.into_iter().find(|t| t.id == id),
            Err(err) => {
                debug!("snapshot read failed while resolving task {id}: {err:#}");
                None
            }
        }
    }

    pub(crate) fn projects_snapshot(&self) -> Vec<Project> {
        self.inner.meta.lock().projects_vec()
    }
}
