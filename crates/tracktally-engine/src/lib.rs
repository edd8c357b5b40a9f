pub mod layers;
pub mod report;

use crate::report::ReportSource;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};
use tracktally_core::{
    parse_job_path, CountEntry, JobContext, RenderItem, StatesOrdering, TrackObject,
};
use tracktally_storage::{CountStore, ReportMeta, StorageError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Permission to run one report fetch for a namespace. Only the holder
/// of the current generation may complete the bootstrap; anything else
/// is a stale fetch whose result gets discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    context: JobContext,
    generation: u64,
}

impl FetchTicket {
    pub fn context(&self) -> JobContext {
        self.context
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStart {
    Started(FetchTicket),
    AlreadyPrimed,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// First primary table for the namespace.
    Installed { entries: usize },
    /// Report digest changed; primary replaced, advisory data cleared.
    Replaced { entries: usize },
    /// Fetched report matches the installed digest.
    Unchanged,
    AlreadyPrimed,
    InFlight,
    /// Both reports of the fallback chain failed; namespace stays
    /// uninitialized for this session.
    Unavailable,
    /// Completion arrived for a cancelled or superseded ticket.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// New frame for this track; overflow count after the increment.
    Counted { count: u64 },
    AlreadyVisited,
    /// No primary table for the namespace: the bootstrap gate is
    /// closed and nothing is written.
    NotTracked,
}

/// Point-in-time view of a namespace's count tables, keyed by client id.
#[derive(Debug, Clone, Default)]
pub struct CountsSnapshot {
    primary: Option<BTreeMap<u64, u64>>,
    overflow: BTreeMap<u64, u64>,
}

impl CountsSnapshot {
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Resolve a display count: primary wins over overflow; `None` when
    /// neither table defines the id (no synthetic zero).
    pub fn resolve(&self, client_id: u64) -> Option<u64> {
        if let Some(primary) = &self.primary {
            if let Some(count) = primary.get(&client_id) {
                return Some(*count);
            }
        }
        self.overflow.get(&client_id).copied()
    }

    fn note_overflow(&mut self, client_id: u64, count: u64) {
        self.overflow.insert(client_id, count);
    }
}

/// Persistent frame-count cache for annotation tracks.
///
/// Wraps the key/value store with the namespace policy: a primary table
/// bootstrapped once per namespace from a count report, an overflow
/// table for tracks the report does not cover, and per-track
/// visited-frame sets that make counting idempotent. All count reads
/// and writes go through here.
pub struct FrameCountCache {
    store: CountStore,
    inflight: HashMap<JobContext, u64>,
    generations: HashMap<JobContext, u64>,
}

impl FrameCountCache {
    pub fn new(store: CountStore) -> Self {
        Self {
            store,
            inflight: HashMap::new(),
            generations: HashMap::new(),
        }
    }

    pub fn store(&self) -> &CountStore {
        &self.store
    }

    pub fn has_primary(&self, context: &JobContext) -> Result<bool, EngineError> {
        Ok(self.store.primary_counts(context)?.is_some())
    }

    pub fn counts_snapshot(&self, context: &JobContext) -> Result<CountsSnapshot, EngineError> {
        Ok(CountsSnapshot {
            primary: self.store.primary_counts(context)?.map(entry_map),
            overflow: entry_map(self.store.overflow_counts(context)?.unwrap_or_default()),
        })
    }

    pub fn get(&self, context: &JobContext, client_id: u64) -> Result<Option<u64>, EngineError> {
        Ok(self.counts_snapshot(context)?.resolve(client_id))
    }

    /// Record that `frame` currently shows a shape for `client_id`.
    ///
    /// Idempotent per `(client_id, namespace, frame)`: a frame already in
    /// the visited set is a no-op. With no primary table the bootstrap
    /// gate is closed and neither the visited set nor the overflow table
    /// is touched.
    pub fn record_visit(
        &mut self,
        context: &JobContext,
        client_id: u64,
        frame: u64,
    ) -> Result<VisitOutcome, EngineError> {
        if !self.has_primary(context)? {
            return Ok(VisitOutcome::NotTracked);
        }

        let mut visited: BTreeSet<u64> = self
            .store
            .visited_frames(context, client_id)?
            .unwrap_or_default()
            .into_iter()
            .collect();
        if !visited.insert(frame) {
            return Ok(VisitOutcome::AlreadyVisited);
        }
        let frames: Vec<u64> = visited.into_iter().collect();
        self.store.set_visited_frames(context, client_id, &frames)?;

        let mut overflow = entry_map(self.store.overflow_counts(context)?.unwrap_or_default());
        let count = *overflow
            .entry(client_id)
            .and_modify(|count| *count += 1)
            .or_insert(1);
        self.store
            .set_overflow_counts(context, &map_entries(&overflow))?;
        debug!(context = %context, client_id, frame, count, "new frame counted");
        Ok(VisitOutcome::Counted { count })
    }

    /// Ask to fetch the namespace's report. Refused while a fetch is
    /// outstanding or once a primary table exists.
    pub fn begin_bootstrap(&mut self, context: &JobContext) -> Result<BootstrapStart, EngineError> {
        if self.inflight.contains_key(context) {
            return Ok(BootstrapStart::InFlight);
        }
        if self.has_primary(context)? {
            return Ok(BootstrapStart::AlreadyPrimed);
        }
        Ok(BootstrapStart::Started(self.issue_ticket(*context)))
    }

    /// Like [`begin_bootstrap`](Self::begin_bootstrap) but allowed when a
    /// primary table exists, so a changed report can replace it.
    pub fn begin_refresh(&mut self, context: &JobContext) -> Result<BootstrapStart, EngineError> {
        if self.inflight.contains_key(context) {
            return Ok(BootstrapStart::InFlight);
        }
        Ok(BootstrapStart::Started(self.issue_ticket(*context)))
    }

    fn issue_ticket(&mut self, context: JobContext) -> FetchTicket {
        let generation = self.generations.entry(context).or_insert(0);
        *generation += 1;
        self.inflight.insert(context, *generation);
        FetchTicket {
            context,
            generation: *generation,
        }
    }

    /// Install the fetched report text. A ticket whose generation is no
    /// longer the outstanding one (navigation cancelled it, or a newer
    /// fetch superseded it) is discarded without touching the store.
    pub fn complete_bootstrap(
        &mut self,
        ticket: FetchTicket,
        text: &str,
    ) -> Result<BootstrapOutcome, EngineError> {
        if self.inflight.get(&ticket.context) != Some(&ticket.generation) {
            debug!(context = %ticket.context, "stale bootstrap completion discarded");
            return Ok(BootstrapOutcome::Discarded);
        }
        self.inflight.remove(&ticket.context);
        self.install_report(&ticket.context, text)
    }

    /// Give the ticket back after a failed fetch so a later render pass
    /// may try again.
    pub fn abort_bootstrap(&mut self, ticket: FetchTicket) {
        if self.inflight.get(&ticket.context) == Some(&ticket.generation) {
            self.inflight.remove(&ticket.context);
        }
    }

    /// Navigation moved away from the namespace: any outstanding fetch
    /// result must not be installed.
    pub fn cancel_bootstrap(&mut self, context: &JobContext) {
        self.inflight.remove(context);
    }

    /// Run the full fallback chain (`T_{taskID}.txt`, then
    /// `J_{jobID}.txt`) against `source` unless the namespace is already
    /// primed or a fetch is outstanding.
    pub fn bootstrap_from(
        &mut self,
        context: &JobContext,
        source: &dyn ReportSource,
    ) -> Result<BootstrapOutcome, EngineError> {
        match self.begin_bootstrap(context)? {
            BootstrapStart::AlreadyPrimed => Ok(BootstrapOutcome::AlreadyPrimed),
            BootstrapStart::InFlight => Ok(BootstrapOutcome::InFlight),
            BootstrapStart::Started(ticket) => self.fetch_and_complete(ticket, source),
        }
    }

    /// Fallback chain with the primed check skipped: a changed report
    /// replaces the primary table per the digest policy.
    pub fn refresh_from(
        &mut self,
        context: &JobContext,
        source: &dyn ReportSource,
    ) -> Result<BootstrapOutcome, EngineError> {
        match self.begin_refresh(context)? {
            BootstrapStart::AlreadyPrimed => Ok(BootstrapOutcome::AlreadyPrimed),
            BootstrapStart::InFlight => Ok(BootstrapOutcome::InFlight),
            BootstrapStart::Started(ticket) => self.fetch_and_complete(ticket, source),
        }
    }

    fn fetch_and_complete(
        &mut self,
        ticket: FetchTicket,
        source: &dyn ReportSource,
    ) -> Result<BootstrapOutcome, EngineError> {
        let context = ticket.context;
        let task_report = context.task_report_name();
        match source.fetch(&task_report) {
            Ok(text) => return self.complete_bootstrap(ticket, &text),
            Err(err) => {
                debug!(context = %context, report = %task_report, error = %err, "task report unavailable, trying job report");
            }
        }

        let job_report = context.job_report_name();
        match source.fetch(&job_report) {
            Ok(text) => self.complete_bootstrap(ticket, &text),
            Err(err) => {
                debug!(context = %context, report = %job_report, error = %err, "job report unavailable, namespace stays uninitialized");
                self.abort_bootstrap(ticket);
                Ok(BootstrapOutcome::Unavailable)
            }
        }
    }

    fn install_report(
        &mut self,
        context: &JobContext,
        text: &str,
    ) -> Result<BootstrapOutcome, EngineError> {
        let digest = report::report_digest(text);
        let had_primary = self.has_primary(context)?;
        if had_primary {
            if let Some(meta) = self.store.report_meta(context)? {
                if meta.digest == digest {
                    return Ok(BootstrapOutcome::Unchanged);
                }
            }
        }

        let entries = map_entries(&entry_map(report::parse_report(text)));
        self.store.set_primary_counts(context, &entries)?;
        self.store.set_report_meta(
            context,
            &ReportMeta {
                digest,
                fetched_at: Utc::now(),
            },
        )?;

        if had_primary {
            // Overflow and visited sets were deltas against the old
            // report version.
            self.store.clear_advisory(context)?;
            Ok(BootstrapOutcome::Replaced {
                entries: entries.len(),
            })
        } else {
            Ok(BootstrapOutcome::Installed {
                entries: entries.len(),
            })
        }
    }
}

/// One track of the render sequence with its resolved display count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTrack {
    pub client_id: u64,
    pub frame: u64,
    pub z_order: Option<i64>,
    pub frame_count: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resolved: Vec<ResolvedTrack>,
    pub visits_counted: usize,
    pub visits_repeated: usize,
    pub untracked: usize,
}

/// One render pass over the object list: mark every rendered
/// `(track, frame)` pair visited and resolve each track's display count.
/// Re-rendering a pair never re-increments; the visited set in the cache
/// guarantees that, not the caller.
pub fn reconcile(
    cache: &mut FrameCountCache,
    context: &JobContext,
    sorted_ids: &[u64],
    objects: &[TrackObject],
) -> Result<ReconcileReport, EngineError> {
    let by_id: HashMap<u64, &TrackObject> = objects
        .iter()
        .map(|object| (object.client_id, object))
        .collect();
    let mut snapshot = cache.counts_snapshot(context)?;
    let mut report = ReconcileReport::default();

    for &client_id in sorted_ids {
        let Some(object) = by_id.get(&client_id) else {
            continue;
        };
        match cache.record_visit(context, client_id, object.frame)? {
            VisitOutcome::Counted { count } => {
                snapshot.note_overflow(client_id, count);
                report.visits_counted += 1;
            }
            VisitOutcome::AlreadyVisited => report.visits_repeated += 1,
            VisitOutcome::NotTracked => report.untracked += 1,
        }
        report.resolved.push(ResolvedTrack {
            client_id,
            frame: object.frame,
            z_order: object.z_order,
            frame_count: snapshot.resolve(client_id),
        });
    }

    Ok(report)
}

/// The whole subsystem for one render: parse the navigation path,
/// bootstrap the namespace if needed, reconcile visits, group layers.
/// `None` means the path carries no task/job identity and the subsystem
/// is disabled for this render.
pub fn render_pass(
    cache: &mut FrameCountCache,
    path: &str,
    ordering: StatesOrdering,
    sorted_ids: &[u64],
    objects: &[TrackObject],
    source: &dyn ReportSource,
) -> Result<Option<Vec<RenderItem>>, EngineError> {
    let Some(context) = parse_job_path(path) else {
        warn!(path, "no task/job ids in path, frame counting disabled for this render");
        return Ok(None);
    };

    if !cache.has_primary(&context)? {
        let outcome = cache.bootstrap_from(&context, source)?;
        debug!(context = %context, ?outcome, "bootstrap attempted");
    }

    let report = reconcile(cache, &context, sorted_ids, objects)?;
    Ok(Some(layers::group_layers(ordering, &report.resolved)))
}

/// First occurrence wins for a duplicated id, matching lookup order on
/// the stored list.
fn entry_map(entries: Vec<CountEntry>) -> BTreeMap<u64, u64> {
    let mut map = BTreeMap::new();
    for entry in entries {
        map.entry(entry.client_id).or_insert(entry.count);
    }
    map
}

fn map_entries(map: &BTreeMap<u64, u64>) -> Vec<CountEntry> {
    map.iter()
        .map(|(client_id, count)| CountEntry::new(*client_id, *count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FetchError;
    use std::cell::RefCell;

    const REPORT: &str = "1. Track ID: 5, Shape Count: 12\n2. Track ID: 7, Shape Count: 3";

    fn context() -> JobContext {
        JobContext::new(25, 3)
    }

    fn cache() -> FrameCountCache {
        FrameCountCache::new(CountStore::open_in_memory().expect("open store"))
    }

    fn primed_cache() -> FrameCountCache {
        let mut cache = cache();
        match cache.begin_bootstrap(&context()).expect("begin") {
            BootstrapStart::Started(ticket) => {
                cache.complete_bootstrap(ticket, REPORT).expect("complete");
            }
            other => panic!("unexpected start: {other:?}"),
        }
        cache
    }

    struct ScriptedSource {
        files: Vec<(&'static str, &'static str)>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(files: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                files,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ReportSource for ScriptedSource {
        fn fetch(&self, name: &str) -> Result<String, FetchError> {
            self.calls.borrow_mut().push(name.to_string());
            self.files
                .iter()
                .find(|(file, _)| *file == name)
                .map(|(_, text)| (*text).to_string())
                .ok_or(FetchError::NotFound {
                    name: name.to_string(),
                })
        }
    }

    #[test]
    fn visit_gate_stays_closed_without_primary() {
        let mut cache = cache();
        let outcome = cache
            .record_visit(&context(), 9, 4)
            .expect("record visit");
        assert_eq!(outcome, VisitOutcome::NotTracked);

        let store = cache.store();
        assert_eq!(store.overflow_counts(&context()).expect("read"), None);
        assert_eq!(store.visited_frames(&context(), 9).expect("read"), None);
    }

    #[test]
    fn repeat_visits_count_once() {
        let mut cache = primed_cache();
        assert_eq!(
            cache.record_visit(&context(), 9, 4).expect("first"),
            VisitOutcome::Counted { count: 1 }
        );
        assert_eq!(
            cache.record_visit(&context(), 9, 4).expect("second"),
            VisitOutcome::AlreadyVisited
        );
        assert_eq!(cache.get(&context(), 9).expect("get"), Some(1));

        // A genuinely new frame still counts.
        assert_eq!(
            cache.record_visit(&context(), 9, 5).expect("third"),
            VisitOutcome::Counted { count: 2 }
        );
        assert_eq!(cache.get(&context(), 9).expect("get"), Some(2));
    }

    #[test]
    fn primary_wins_over_overflow() {
        let mut cache = primed_cache();
        // Track 5 is in the primary table with count 12; visiting frames
        // accumulates overflow for it, but lookups keep preferring
        // primary.
        cache.record_visit(&context(), 5, 0).expect("visit");
        cache.record_visit(&context(), 5, 1).expect("visit");
        assert_eq!(cache.get(&context(), 5).expect("get"), Some(12));
        // An id in neither table resolves to nothing.
        assert_eq!(cache.get(&context(), 99).expect("get"), None);
    }

    #[test]
    fn bootstrap_prefers_task_report() {
        let mut cache = cache();
        let source = ScriptedSource::new(vec![("T_25.txt", REPORT), ("J_3.txt", "ignored")]);
        let outcome = cache
            .bootstrap_from(&context(), &source)
            .expect("bootstrap");
        assert_eq!(outcome, BootstrapOutcome::Installed { entries: 2 });
        assert_eq!(source.calls.borrow().as_slice(), ["T_25.txt"]);
        assert_eq!(cache.get(&context(), 5).expect("get"), Some(12));
    }

    #[test]
    fn bootstrap_falls_back_to_job_report() {
        let mut cache = cache();
        let source = ScriptedSource::new(vec![("J_3.txt", REPORT)]);
        let outcome = cache
            .bootstrap_from(&context(), &source)
            .expect("bootstrap");
        assert_eq!(outcome, BootstrapOutcome::Installed { entries: 2 });
        assert_eq!(source.calls.borrow().as_slice(), ["T_25.txt", "J_3.txt"]);
    }

    #[test]
    fn failed_chain_leaves_namespace_uninitialized_but_retryable() {
        let mut cache = cache();
        let empty = ScriptedSource::new(Vec::new());
        assert_eq!(
            cache.bootstrap_from(&context(), &empty).expect("bootstrap"),
            BootstrapOutcome::Unavailable
        );
        assert!(!cache.has_primary(&context()).expect("primary"));

        // The failed attempt released its ticket.
        let source = ScriptedSource::new(vec![("T_25.txt", REPORT)]);
        assert_eq!(
            cache.bootstrap_from(&context(), &source).expect("retry"),
            BootstrapOutcome::Installed { entries: 2 }
        );
    }

    #[test]
    fn second_begin_is_refused_while_fetch_outstanding() {
        let mut cache = cache();
        let first = cache.begin_bootstrap(&context()).expect("begin");
        assert!(matches!(first, BootstrapStart::Started(_)));
        assert_eq!(
            cache.begin_bootstrap(&context()).expect("second begin"),
            BootstrapStart::InFlight
        );
    }

    #[test]
    fn cancelled_fetch_completion_is_discarded() {
        let mut cache = cache();
        let BootstrapStart::Started(ticket) = cache.begin_bootstrap(&context()).expect("begin")
        else {
            panic!("expected ticket");
        };
        cache.cancel_bootstrap(&context());

        assert_eq!(
            cache.complete_bootstrap(ticket, REPORT).expect("complete"),
            BootstrapOutcome::Discarded
        );
        assert!(!cache.has_primary(&context()).expect("primary"));
    }

    #[test]
    fn superseded_ticket_cannot_install() {
        let mut cache = cache();
        let BootstrapStart::Started(stale) = cache.begin_bootstrap(&context()).expect("begin")
        else {
            panic!("expected ticket");
        };
        cache.cancel_bootstrap(&context());
        let BootstrapStart::Started(fresh) = cache.begin_bootstrap(&context()).expect("begin")
        else {
            panic!("expected ticket");
        };

        assert_eq!(
            cache.complete_bootstrap(stale, "1. Track ID: 1, Shape Count: 1").expect("stale"),
            BootstrapOutcome::Discarded
        );
        assert_eq!(
            cache.complete_bootstrap(fresh, REPORT).expect("fresh"),
            BootstrapOutcome::Installed { entries: 2 }
        );
        assert_eq!(cache.get(&context(), 5).expect("get"), Some(12));
    }

    #[test]
    fn primed_namespace_refuses_plain_bootstrap() {
        let mut cache = primed_cache();
        let source = ScriptedSource::new(vec![("T_25.txt", REPORT)]);
        assert_eq!(
            cache.bootstrap_from(&context(), &source).expect("bootstrap"),
            BootstrapOutcome::AlreadyPrimed
        );
        assert!(source.calls.borrow().is_empty());
    }

    #[test]
    fn refresh_with_same_digest_changes_nothing() {
        let mut cache = primed_cache();
        cache.record_visit(&context(), 9, 4).expect("visit");

        let source = ScriptedSource::new(vec![("T_25.txt", REPORT)]);
        assert_eq!(
            cache.refresh_from(&context(), &source).expect("refresh"),
            BootstrapOutcome::Unchanged
        );
        // Advisory data survives an unchanged report.
        assert_eq!(cache.get(&context(), 9).expect("get"), Some(1));
    }

    #[test]
    fn refresh_with_new_digest_replaces_primary_and_clears_advisory() {
        let mut cache = primed_cache();
        cache.record_visit(&context(), 9, 4).expect("visit");

        let updated = "1. Track ID: 5, Shape Count: 20";
        let source = ScriptedSource::new(vec![("T_25.txt", updated)]);
        assert_eq!(
            cache.refresh_from(&context(), &source).expect("refresh"),
            BootstrapOutcome::Replaced { entries: 1 }
        );
        assert_eq!(cache.get(&context(), 5).expect("get"), Some(20));
        assert_eq!(cache.get(&context(), 7).expect("get"), None);
        assert_eq!(cache.get(&context(), 9).expect("get"), None);
        assert_eq!(
            cache.store().visited_frames(&context(), 9).expect("read"),
            None
        );
    }

    #[test]
    fn corrupted_primary_closes_the_gate() {
        let mut cache = primed_cache();
        cache
            .store()
            .put_raw(&context().primary_key(), "{corrupted")
            .expect("corrupt");

        assert!(!cache.has_primary(&context()).expect("primary"));
        assert_eq!(
            cache.record_visit(&context(), 9, 4).expect("visit"),
            VisitOutcome::NotTracked
        );
    }

    #[test]
    fn reconcile_resolves_counts_and_tracks_visits() {
        let mut cache = primed_cache();
        let objects = vec![
            TrackObject {
                client_id: 5,
                frame: 0,
                z_order: Some(2),
            },
            TrackObject {
                client_id: 9,
                frame: 0,
                z_order: None,
            },
        ];

        let report = reconcile(&mut cache, &context(), &[5, 9], &objects).expect("reconcile");
        assert_eq!(report.visits_counted, 2);
        assert_eq!(report.visits_repeated, 0);
        assert_eq!(
            report.resolved,
            vec![
                ResolvedTrack {
                    client_id: 5,
                    frame: 0,
                    z_order: Some(2),
                    frame_count: Some(12),
                },
                ResolvedTrack {
                    client_id: 9,
                    frame: 0,
                    z_order: None,
                    frame_count: Some(1),
                },
            ]
        );

        // Same frame again: idempotent, counts unchanged.
        let again = reconcile(&mut cache, &context(), &[5, 9], &objects).expect("reconcile");
        assert_eq!(again.visits_counted, 0);
        assert_eq!(again.visits_repeated, 2);
        assert_eq!(again.resolved, report.resolved);
    }

    #[test]
    fn reconcile_skips_ids_without_objects() {
        let mut cache = primed_cache();
        let objects = vec![TrackObject {
            client_id: 5,
            frame: 0,
            z_order: None,
        }];
        let report = reconcile(&mut cache, &context(), &[5, 42], &objects).expect("reconcile");
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].client_id, 5);
    }

    #[test]
    fn render_pass_disabled_without_navigation_match() {
        let mut cache = cache();
        let source = ScriptedSource::new(Vec::new());
        let rows = render_pass(
            &mut cache,
            "/projects/9",
            StatesOrdering::ZOrder,
            &[],
            &[],
            &source,
        )
        .expect("render");
        assert_eq!(rows, None);
        assert!(source.calls.borrow().is_empty());
    }
}
