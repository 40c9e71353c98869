//! View loader: resolves "show me selection S" with minimal redundant
//! network I/O and without UI flicker.
//!
//! Correctness here is about interleaving order, not data races: every
//! decision that depends on shared state is re-derived from a fresh read
//! after each await, and superseded responses are discarded by comparing
//! monotonic load tokens rather than a boolean flag.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use daylist_core::cache::{view_bucket_key, CacheName, COUNTS_KEY, META_KEY};
use daylist_core::model::{Group, Project, Task};
use daylist_core::selection::{count_for, Selection};

use crate::api::{ApiResult, FetchResponse, ListScope};
use crate::notice::Notice;

use super::{CachedMeta, TaskStore};

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Bypass both the TTL check and in-flight deduplication.
    pub force: bool,
    /// Never touch the loading flag or the error banner.
    pub silent: bool,
    /// Allow the low-priority "tasks updated" notice.
    pub notify: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            force: false,
            silent: false,
            notify: true,
        }
    }
}

impl LoadOptions {
    /// Silent, non-notifying refresh (preloads, post-mutation reconciles).
    pub fn background() -> Self {
        Self {
            force: false,
            silent: true,
            notify: false,
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

impl TaskStore {
    /// Resolves a selection against cache and network per the decision
    /// ladder: render cache immediately, revalidate when stale, dedup
    /// concurrent fetches per view key, and only ever write the visible
    /// list when this pass still owns the display.
    pub async fn load(&self, selection: Selection, opts: LoadOptions) {
        let inner = &self.inner;
        if !selection.is_search() {
            inner.meta.lock().last_non_search = Some(selection.clone());
        }

        let views = CacheName::Views.policy();
        let counts_policy = CacheName::Counts.policy();
        let bucket = view_bucket_key(&selection);

        let cached_tasks: Option<Vec<Task>> = inner.cache.get(&bucket, views);
        if let Some(counts) = inner
            .cache
            .get::<HashMap<String, i64>>(COUNTS_KEY, counts_policy)
        {
            self.update_state(move |s| s.counts.extend(counts));
        }
        if let Some(meta) = inner.cache.get::<CachedMeta>(META_KEY, CacheName::Meta.policy()) {
            self.absorb_meta(meta.groups, meta.projects, false);
        }
        if selection != Selection::Today {
            // Keeps the persistent today badge fresh while another list is
            // on screen.
            let today_bucket = view_bucket_key(&Selection::Today);
            if let Some(today_tasks) = inner.cache.get::<Vec<Task>>(&today_bucket, views) {
                let count = today_tasks.len() as i64;
                self.update_state(move |s| {
                    s.counts.insert("today".into(), count);
                });
            }
        }

        let mut silent = opts.silent;
        let notify = opts.notify;

        let token = inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let foreground = !silent;
        if foreground {
            inner.display_token.store(token, Ordering::SeqCst);
            let sel = selection.clone();
            self.update_state(move |s| s.selection = sel);
        }

        match (&cached_tasks, opts.force) {
            (Some(tasks), false) => {
                // Cache hit: the UI is never empty here.
                if self.display_allowed(foreground, token, &selection) {
                    let list = tasks.clone();
                    let projects = self.projects_snapshot();
                    let count = count_for(&selection, &list, &projects) as i64;
                    let key = selection.cache_key();
                    self.update_state(move |s| {
                        s.tasks = list;
                        s.loading = false;
                        s.counts.insert(key, count);
                    });
                }
                if !inner.cache.is_stale(&bucket, views) {
                    // Fresh hit: no fetch, no spinner, no toast, even when
                    // the caller asked for one.
                    return;
                }
                // Expired but version-valid: serve it, revalidate quietly.
                silent = true;
            }
            (None, _) => {
                if !silent {
                    let is_search = selection.is_search();
                    self.update_state(move |s| {
                        s.loading = true;
                        // Only searches clear the visible list; other
                        // selections keep showing the previous tasks to
                        // avoid flicker.
                        if is_search {
                            s.tasks.clear();
                        }
                    });
                }
            }
            (Some(_), true) => {
                if !silent {
                    self.update_state(|s| s.loading = true);
                }
            }
        }

        if !opts.force {
            let waiter = inner.in_flight.lock().get(&bucket).cloned();
            if let Some(mut rx) = waiter {
                // Await the leader instead of issuing a duplicate fetch. If
                // this pass took the display token from the leader, the
                // leader's own write was suppressed, so render the cache the
                // leader just filled.
                let _ = rx.changed().await;
                if self.display_allowed(foreground, token, &selection) {
                    if let Some(tasks) = inner.cache.get::<Vec<Task>>(&bucket, views) {
                        let projects = self.projects_snapshot();
                        let count = count_for(&selection, &tasks, &projects) as i64;
                        let key = selection.cache_key();
                        self.update_state(move |s| {
                            s.tasks = tasks;
                            s.loading = false;
                            s.counts.insert(key, count);
                        });
                    } else {
                        self.update_state(|s| s.loading = false);
                    }
                }
                return;
            }
        }

        let (done_tx, done_rx) = watch::channel(false);
        inner.in_flight.lock().insert(bucket.clone(), done_rx);

        let outcome = timeout(inner.options.fetch_timeout, self.fetch_selection(&selection)).await;

        inner.in_flight.lock().remove(&bucket);
        let _ = done_tx.send(true);

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.handle_load_failure(err.to_string(), silent, cached_tasks.is_some());
                return;
            }
            Err(_) => {
                self.handle_load_failure(
                    "request timed out".to_string(),
                    silent,
                    cached_tasks.is_some(),
                );
                return;
            }
        };

        let tasks: Vec<Task> = response
            .tasks
            .into_iter()
            .filter(|t| !t.is_hidden())
            .collect();
        self.absorb_meta(response.groups, response.projects, true);
        if let Err(err) = inner.store.upsert_tasks(&tasks) {
            debug!("durable upsert after fetch failed: {err:#}");
        }
        inner.cache.set(&bucket, &tasks, views);

        let projects = self.projects_snapshot();
        let count = count_for(&selection, &tasks, &projects) as i64;
        let mut counts: HashMap<String, i64> = inner
            .cache
            .get(COUNTS_KEY, counts_policy)
            .unwrap_or_default();
        counts.insert(selection.cache_key(), count);
        inner.cache.set(COUNTS_KEY, &counts, counts_policy);
        if let Err(err) = inner.store.set_last_sync(&Utc::now().to_rfc3339()) {
            debug!("last-sync marker write failed: {err:#}");
        }

        let display = self.display_allowed(foreground, token, &selection);
        if display {
            let list = tasks.clone();
            let key = selection.cache_key();
            self.update_state(move |s| {
                s.tasks = list;
                s.loading = false;
                s.error = None;
                s.counts.insert(key, count);
            });
        } else if silent {
            // Background refresh of a view that is not on screen: counts and
            // metadata only. Yanking the visible list out from under the
            // user is what the notice is for.
            let key = selection.cache_key();
            self.update_state(move |s| {
                s.counts.insert(key, count);
            });
            if notify && cached_tasks.as_ref() != Some(&tasks) {
                self.post_notice(Notice::TasksUpdated(selection.cache_key()));
            }
        }

        if foreground && display {
            self.maybe_preload(&selection);
        }
    }

    /// Debounced search entry point. Queues the query and guarantees that
    /// only the latest pending query ever fetches.
    pub fn queue_search(&self, query: impl Into<String>) {
        let query = query.into();
        {
            let mut search = self.inner.search.lock();
            search.pending = Some(query);
            if search.draining {
                return;
            }
            search.draining = true;
        }
        let this = self.clone();
        let debounce = self.inner.options.search_debounce;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;
                let query = {
                    let mut search = this.inner.search.lock();
                    match search.pending.take() {
                        Some(query) => query,
                        None => {
                            search.draining = false;
                            break;
                        }
                    }
                };
                this.load(Selection::search(query), LoadOptions::default())
                    .await;
            }
        });
    }

    /// Leaves search mode and restores the last non-search selection.
    pub async fn clear_search(&self) {
        let previous = self.inner.meta.lock().last_non_search.clone();
        let selection = previous.unwrap_or(Selection::Today);
        self.load(selection, LoadOptions::default()).await;
    }

    /// Authoritative counts, merged silently.
    pub(crate) async fn refresh_counts(&self) {
        match self.inner.remote.counts().await {
            Ok(counts) => {
                let policy = CacheName::Counts.policy();
                let mut merged: HashMap<String, i64> = self
                    .inner
                    .cache
                    .get(COUNTS_KEY, policy)
                    .unwrap_or_default();
                merged.extend(counts);
                self.inner.cache.set(COUNTS_KEY, &merged, policy);
                self.update_state(move |s| s.counts = merged);
            }
            Err(err) => debug!("counts refresh skipped: {err}"),
        }
    }

    /// Merges metadata by id; fields from newer records win, existing
    /// records survive fetches that did not include them.
    pub(crate) fn absorb_meta(&self, groups: Vec<Group>, projects: Vec<Project>, persist: bool) {
        if groups.is_empty() && projects.is_empty() {
            return;
        }
        {
            let mut meta = self.inner.meta.lock();
            for group in groups {
                meta.groups.insert(group.id.clone(), group);
            }
            for project in projects {
                meta.projects.insert(project.id.clone(), project);
            }
        }
        self.publish_meta();
        if persist {
            let (groups, projects) = {
                let meta = self.inner.meta.lock();
                (meta.groups_vec(), meta.projects_vec())
            };
            if let Err(err) = self.inner.store.upsert_groups(&groups) {
                debug!("group persist failed: {err:#}");
            }
            if let Err(err) = self.inner.store.upsert_projects(&projects) {
                debug!("project persist failed: {err:#}");
            }
            self.inner.cache.set(
                META_KEY,
                &CachedMeta { groups, projects },
                CacheName::Meta.policy(),
            );
        }
    }

    fn display_allowed(&self, foreground: bool, token: u64, selection: &Selection) -> bool {
        if foreground {
            // Another foreground load has claimed the display since this
            // pass began; its result wins no matter who resolves first.
            self.inner.display_token.load(Ordering::SeqCst) == token
        } else {
            self.inner.state_tx.borrow().selection == *selection
        }
    }

    fn handle_load_failure(&self, message: String, silent: bool, has_cache: bool) {
        if !silent {
            self.update_state(move |s| {
                s.loading = false;
                s.error = Some(message);
            });
            return;
        }
        debug!("silent load failed: {message}");
        self.update_state(|s| s.loading = false);
        if !self.inner.connectivity.is_online() && has_cache {
            self.post_notice(Notice::Offline);
        }
    }

    async fn fetch_selection(&self, selection: &Selection) -> ApiResult<FetchResponse> {
        let remote = &self.inner.remote;
        match selection {
            Selection::Today => remote.list(ListScope::Today).await,
            Selection::Upcoming => remote.list(ListScope::Upcoming).await,
            Selection::Inbox => remote.list(ListScope::Inbox).await,
            Selection::Group { id } => remote.group_tasks(id).await,
            Selection::Project { id } => remote.project_tasks(id).await,
            Selection::Search { query } => remote.search(query).await,
        }
    }

    /// One-time-per-process staggered warmup of the primary views so
    /// switching to them later is typically a cache hit.
    fn maybe_preload(&self, current: &Selection) {
        if self.inner.preload_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut delay = self.inner.options.preload_stagger;
        for selection in [Selection::Today, Selection::Upcoming] {
            if selection == *current {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.load(selection, LoadOptions::background()).await;
            });
            delay += self.inner.options.preload_stagger;
        }
    }
}
