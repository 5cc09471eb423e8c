//! One Run, end to end.
//!
//! The document is parsed on a blocking thread that streams target subtrees
//! into a bounded queue. A semaphore-limited pool of async workers drains the
//! queue: each worker redacts, extracts, normalizes and stores the facts of
//! one subtree and, for identify Runs, classifies them. Subtree failures are
//! recorded and never cancel siblings; a parse error or the Run deadline
//! stops the pool.
//!
//! Catalog writes (pattern mints, counter bumps, matches) are applied only
//! after the document has parsed to the end or the deadline has passed. A
//! Run failed by a parse error leaves the catalog exactly as it found it.

use std::collections::BTreeSet;
use std::io::BufRead;
use std::sync::Arc;

use aeroschema_core::{
    ExtractionConfig, PatternScope, Profile, Run, RunKind, RunStatus, RunSummary, RunWarning,
    SubtreeFailure, normalize_section_path,
};
use aeroschema_engine::{
    Classification, ExtractionContext, FactExtractor, FactNormalizer, IdentificationEngine, PatternGenerator,
    PiiMasker, gap_report,
};
use aeroschema_ingest::{IngestError, PathTrie, Subtree, XmlScanner};
use aeroschema_store::CatalogStore;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use crate::{RunError, RunSettings};

/// What the parser learned from the root element.
struct Prelude {
    spec_version: String,
    message_root: String,
    warnings: Vec<RunWarning>,
    profile: Option<Profile>,
}

type SubtreeItem = Result<Subtree, IngestError>;

/// Runs discovery and identification over documents for one workspace.
pub struct RunCoordinator {
    store: Arc<dyn CatalogStore>,
    config: Arc<ExtractionConfig>,
    extractor: Arc<dyn FactExtractor>,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        config: Arc<ExtractionConfig>,
        extractor: Arc<dyn FactExtractor>,
    ) -> Self {
        Self {
            store,
            config,
            extractor,
            settings: RunSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Learn patterns from one document.
    pub async fn discover<R>(&self, source: R) -> Result<RunSummary, RunError>
    where
        R: BufRead + Send + 'static,
    {
        self.execute(RunKind::Discovery, source).await
    }

    /// Match one document against the catalog of its version and message root.
    pub async fn identify<R>(&self, source: R) -> Result<RunSummary, RunError>
    where
        R: BufRead + Send + 'static,
    {
        self.execute(RunKind::Identify, source).await
    }

    async fn execute<R>(&self, kind: RunKind, source: R) -> Result<RunSummary, RunError>
    where
        R: BufRead + Send + 'static,
    {
        let mut run = Run::new(self.store.workspace(), kind);
        self.store.create_run(&run)?;
        info!(
            run_id = %run.id,
            workspace = %run.workspace,
            kind = kind.as_str(),
            extractor = self.extractor.name(),
            workers = self.settings.workers(),
            "run started"
        );
        match self.drive(&mut run, source).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(run_id = %run.id, error = %err, "run aborted");
                self.settle_failed(&mut run, err.to_string());
                Err(err)
            }
        }
    }

    async fn drive<R>(&self, run: &mut Run, source: R) -> Result<RunSummary, RunError>
    where
        R: BufRead + Send + 'static,
    {
        let deadline = Instant::now() + self.settings.run_timeout;
        let (tx, mut rx) = mpsc::channel(self.settings.queue_depth());
        let (prelude_tx, prelude_rx) = oneshot::channel();
        let config = Arc::clone(&self.config);
        let workspace = run.workspace.clone();
        let parser = tokio::task::spawn_blocking(move || {
            parse_document(source, &config, &workspace, prelude_tx, tx)
        });

        let prelude = match timeout_at(deadline, prelude_rx).await {
            Ok(Ok(Ok(prelude))) => prelude,
            Ok(Ok(Err(parse))) => return Ok(self.parse_failed(run, parse)),
            Ok(Err(_)) => return Err(RunError::Parser(join_message(parser.await))),
            Err(_) => {
                run.warnings.push(RunWarning::TimedOut { outstanding: 0 });
                self.settle_failed(run, "timed out before the document header was read".into());
                return Ok(summary(run, 0, None, None));
            }
        };

        run.spec_version = Some(prelude.spec_version.clone());
        run.message_root = Some(prelude.message_root.clone());
        run.warnings.extend(prelude.warnings);
        if prelude.profile.is_none() {
            warn!(
                run_id = %run.id,
                spec_version = %prelude.spec_version,
                message_root = %prelude.message_root,
                "no target paths configured"
            );
            run.warnings.push(RunWarning::ConfigurationGap {
                spec_version: prelude.spec_version.clone(),
                message_root: prelude.message_root.clone(),
            });
        }
        run.status = RunStatus::InProgress;
        self.store.update_run(run)?;

        let scope = PatternScope::new(&run.workspace, &prelude.spec_version, &prelude.message_root);
        let synonyms = self.config.synonyms_for(&prelude.spec_version);
        let identifier = match run.kind {
            RunKind::Identify => Some(IdentificationEngine::for_scope(
                Arc::clone(&self.store),
                scope,
                synonyms.clone(),
            )?),
            RunKind::Discovery => None,
        };
        let worker = Arc::new(Worker {
            store: Arc::clone(&self.store),
            extractor: Arc::clone(&self.extractor),
            normalizer: FactNormalizer::new(
                run.id,
                &run.workspace,
                &prelude.spec_version,
                &prelude.message_root,
                PiiMasker::new(&self.config.sensitive_fields),
            ),
            identifier,
        });

        // ── Dispatch ──

        let semaphore = Arc::new(Semaphore::new(self.settings.workers()));
        let mut tasks: JoinSet<Result<Processed, SubtreeFailure>> = JoinSet::new();
        let mut tally = Tally::default();
        let mut present = BTreeSet::new();
        let mut parse_error = None;
        let mut timed_out = false;
        let mut unstarted = 0;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                tally.record(joined);
            }
            let subtree = match timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    timed_out = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    parse_error = Some(e);
                    break;
                }
                Ok(Some(Ok(subtree))) => subtree,
            };
            run.subtrees_seen += 1;
            present.insert(normalize_section_path(&subtree.section_path));
            if subtree.truncated {
                warn!(
                    run_id = %run.id,
                    section_path = %subtree.section_path,
                    ordinal = subtree.ordinal,
                    "subtree truncated at size ceiling"
                );
                run.warnings.push(RunWarning::TruncatedSubtree {
                    section_path: subtree.section_path.clone(),
                    ordinal: subtree.ordinal,
                });
            }
            let permit = match timeout_at(deadline, Arc::clone(&semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    unstarted += 1;
                    timed_out = true;
                    break;
                }
            };
            let worker = Arc::clone(&worker);
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(subtree).await
            });
        }
        let mut queued = 0;
        if timed_out {
            while let Ok(item) = rx.try_recv() {
                if item.is_ok() {
                    queued += 1;
                }
            }
        }
        drop(rx);

        // ── Drain ──

        if parse_error.is_none() && !timed_out {
            loop {
                match timeout_at(deadline, tasks.join_next()).await {
                    Ok(Some(joined)) => tally.record(joined),
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            tally.record(joined);
        }

        if let Some(e) = parse_error {
            return Ok(self.parse_failed(run, e));
        }
        if !timed_out {
            // The queue closed, so the parser has returned; a join error here
            // means it panicked mid-document.
            if let Err(e) = parser.await {
                return Err(RunError::Parser(e.to_string()));
            }
        }

        // ── Commit ──

        if let Some(engine) = &worker.identifier {
            let mut pending = std::mem::take(&mut tally.pending);
            pending.sort_by_key(Classification::fact_id);
            for c in &pending {
                engine.record(run.id, c)?;
            }
            tally.matches = pending.len();
        }

        // ── Settle ──

        let outstanding = tally.cancelled + unstarted + queued;
        let status = if timed_out {
            warn!(run_id = %run.id, outstanding, "run timed out");
            run.warnings.push(RunWarning::TimedOut { outstanding });
            if tally.succeeded > 0 {
                RunStatus::PartialFailure
            } else {
                RunStatus::Failed
            }
        } else {
            RunStatus::settle(tally.succeeded, tally.failures.len())
        };

        let (patterns_count, matches_count) = match run.kind {
            RunKind::Discovery => {
                let facts = self.store.facts_for_run(run.id)?;
                let generator = PatternGenerator::new(Arc::clone(&self.store), synonyms);
                let report = generator.generate(&facts)?;
                (Some(report.groups), None)
            }
            RunKind::Identify => {
                let matches = self.store.matches_for_run(run.id)?;
                let expected = prelude
                    .profile
                    .as_ref()
                    .map(Profile::expected_sections)
                    .unwrap_or_default();
                run.gap_report = Some(gap_report(&matches, &expected, &present));
                (None, Some(matches.len()))
            }
        };

        let detail = match status {
            RunStatus::Completed => None,
            _ if timed_out => Some(format!(
                "timed out with {outstanding} subtree(s) outstanding, {} failed",
                tally.failures.len()
            )),
            _ => Some(format!(
                "{} of {} subtree(s) failed",
                tally.failures.len(),
                run.subtrees_seen
            )),
        };
        run.subtrees_succeeded = tally.succeeded;
        run.subtree_failures = std::mem::take(&mut tally.failures);
        run.finish(status, detail);
        self.store.update_run(run)?;

        info!(
            run_id = %run.id,
            status = status.as_str(),
            subtrees = run.subtrees_seen,
            facts = tally.facts,
            matches = tally.matches,
            "run finished"
        );
        Ok(summary(run, tally.facts, patterns_count, matches_count))
    }

    /// A malformed document fails the Run and leaves no partial results.
    fn parse_failed(&self, run: &mut Run, err: IngestError) -> RunSummary {
        error!(run_id = %run.id, error = %err, "document could not be parsed");
        self.settle_failed(run, format!("parse error: {err}"));
        summary(run, 0, None, None)
    }

    fn settle_failed(&self, run: &mut Run, detail: String) {
        match self.store.discard_run_results(run.id) {
            Ok(0) => {}
            Ok(removed) => info!(run_id = %run.id, removed, "discarded partial run results"),
            Err(e) => warn!(run_id = %run.id, error = %e, "could not discard run results"),
        }
        run.finish(RunStatus::Failed, Some(detail));
        if let Err(e) = self.store.update_run(run) {
            warn!(run_id = %run.id, error = %e, "could not record failed run");
        }
    }
}

fn summary(
    run: &Run,
    node_facts_count: usize,
    patterns_count: Option<usize>,
    matches_count: Option<usize>,
) -> RunSummary {
    RunSummary {
        run_id: run.id,
        kind: run.kind,
        status: run.status,
        node_facts_count,
        patterns_count,
        matches_count,
        gap_report: run.gap_report.clone(),
    }
}

fn join_message(joined: Result<(), JoinError>) -> String {
    match joined {
        Ok(()) => "header channel closed".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Blocking half: header, profile, then every target subtree in order.
fn parse_document<R: BufRead>(
    source: R,
    config: &ExtractionConfig,
    workspace: &str,
    prelude_tx: oneshot::Sender<Result<Prelude, IngestError>>,
    tx: mpsc::Sender<SubtreeItem>,
) {
    let mut scanner = XmlScanner::new(source);
    let header = match scanner.read_header() {
        Ok(header) => header,
        Err(e) => {
            let _ = prelude_tx.send(Err(e));
            return;
        }
    };
    let resolved = header.resolve_version(config);
    let profile = config
        .resolve(&resolved.spec_version, &header.message_root, Some(workspace))
        .cloned();
    let trie = profile.as_ref().map(PathTrie::from_profile).unwrap_or_default();
    let prelude = Prelude {
        spec_version: resolved.spec_version,
        message_root: header.message_root,
        warnings: resolved.warnings,
        profile,
    };
    if prelude_tx.send(Ok(prelude)).is_err() {
        return;
    }
    for item in scanner.into_subtrees(trie, config.limits) {
        // A closed queue means the Run stopped listening.
        if tx.blocking_send(item).is_err() {
            return;
        }
    }
}

// ── Workers ──

struct Processed {
    facts: usize,
    pending: Vec<Classification>,
}

struct Worker {
    store: Arc<dyn CatalogStore>,
    extractor: Arc<dyn FactExtractor>,
    normalizer: FactNormalizer,
    identifier: Option<IdentificationEngine>,
}

impl Worker {
    async fn process(&self, subtree: Subtree) -> Result<Processed, SubtreeFailure> {
        let (root, redacted) = self.normalizer.masker().redact(&subtree.root);
        let subtree = Subtree { root, ..subtree };
        let failure = |message: String| SubtreeFailure {
            section_path: subtree.section_path.clone(),
            ordinal: subtree.ordinal,
            message,
        };

        let ctx = ExtractionContext::for_subtree(
            &self.normalizer.spec_version,
            &self.normalizer.message_root,
            &subtree,
        );
        let extracted = self
            .extractor
            .extract(&subtree, &ctx)
            .await
            .map_err(|e| failure(e.to_string()))?;
        let mut facts = self.normalizer.normalize(&subtree, extracted, redacted);
        self.store
            .insert_facts(&mut facts)
            .map_err(|e| failure(e.to_string()))?;

        let mut pending = Vec::new();
        if let Some(engine) = &self.identifier {
            for fact in &facts {
                pending.push(engine.classify(fact).map_err(|e| failure(e.to_string()))?);
            }
        }
        Ok(Processed {
            facts: facts.len(),
            pending,
        })
    }
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    facts: usize,
    matches: usize,
    pending: Vec<Classification>,
    failures: Vec<SubtreeFailure>,
    cancelled: usize,
}

impl Tally {
    fn record(&mut self, joined: Result<Result<Processed, SubtreeFailure>, JoinError>) {
        match joined {
            Ok(Ok(done)) => {
                self.succeeded += 1;
                self.facts += done.facts;
                self.pending.extend(done.pending);
            }
            Ok(Err(failure)) => {
                warn!(
                    section_path = %failure.section_path,
                    ordinal = failure.ordinal,
                    error = %failure.message,
                    "subtree failed"
                );
                self.failures.push(failure);
            }
            Err(e) if e.is_cancelled() => self.cancelled += 1,
            Err(e) => {
                warn!(error = %e, "worker panicked");
                self.failures.push(SubtreeFailure {
                    section_path: String::new(),
                    ordinal: 0,
                    message: format!("worker panicked: {e}"),
                });
            }
        }
    }
}
