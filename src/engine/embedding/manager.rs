// Lorekeep Runtime — Embedding Manager
//
// One indexing job per domain. A request against a domain with a running
// job sets its dirty flag and returns; the running loop reruns while dirty
// and not aborted, so bursts of file changes coalesce into one extra pass.
// Cache invalidation for (domain, model) happens after every pass.

use crate::atoms::error::EngineError;
use crate::engine::embedding::indexer::{index_domain_kb, IndexFile};
use crate::engine::embedding::EmbeddingClient;
use crate::engine::store::Store;
use crate::engine::types::{EmbeddingJob, JobStatus};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ActiveJob {
    abort: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Invalidation hook: called with (domain_id, model_name) after each pass
/// so retrieval caches drop stale entries.
pub type InvalidateFn = dyn Fn(&str, &str) + Send + Sync;

pub struct EmbeddingManager {
    store: Arc<Store>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    invalidate: Mutex<Option<Arc<InvalidateFn>>>,
}

impl EmbeddingManager {
    pub fn new(store: Arc<Store>) -> Self {
        EmbeddingManager {
            store,
            jobs: Mutex::new(HashMap::new()),
            invalidate: Mutex::new(None),
        }
    }

    pub fn set_invalidation_hook(&self, hook: Arc<InvalidateFn>) {
        *self.invalidate.lock() = Some(hook);
    }

    /// Start (or coalesce into) an indexing job for a domain.
    /// The files closure is re-invoked for each pass so a dirty rerun
    /// sees the current state of the KB.
    pub fn index_domain(
        self: &Arc<Self>,
        domain_id: &str,
        client: Arc<EmbeddingClient>,
        files: Arc<dyn Fn() -> Vec<IndexFile> + Send + Sync>,
    ) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(domain_id) {
            if !job.handle.is_finished() {
                info!("[indexer] Domain {} already indexing — marking dirty", domain_id);
                job.dirty.store(true, Ordering::Relaxed);
                return;
            }
            // Finished job left in the map; replace it below.
        }

        let abort = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Self::run_job(
            self.clone(),
            domain_id.to_string(),
            client,
            files,
            abort.clone(),
            dirty.clone(),
        ));
        jobs.insert(domain_id.to_string(), ActiveJob { abort, dirty, handle });
    }

    async fn run_job(
        manager: Arc<Self>,
        domain_id: String,
        client: Arc<EmbeddingClient>,
        files: Arc<dyn Fn() -> Vec<IndexFile> + Send + Sync>,
        abort: Arc<AtomicBool>,
        dirty: Arc<AtomicBool>,
    ) {
        let model = client.model_name().to_string();
        loop {
            dirty.store(false, Ordering::Relaxed);

            let file_set = files();
            let mut job = EmbeddingJob {
                domain_id: domain_id.clone(),
                model_name: model.clone(),
                status: JobStatus::Running,
                total_files: file_set.len() as i64,
                processed_files: 0,
                total_chunks: 0,
                embedded_chunks: 0,
                last_error: None,
                provider_fingerprint: Some(client.fingerprint()),
                started_at: Some(chrono::Utc::now().to_rfc3339()),
                finished_at: None,
            };
            manager.store.upsert_embedding_job(&job).ok();

            let result =
                index_domain_kb(&manager.store, &client, &domain_id, &file_set, &abort, None).await;

            job.finished_at = Some(chrono::Utc::now().to_rfc3339());
            match result {
                Ok((processed, embedded)) => {
                    job.status = JobStatus::Idle;
                    job.processed_files = processed;
                    job.embedded_chunks = embedded;
                }
                Err(EngineError::Cancelled) => {
                    job.status = JobStatus::Idle;
                    job.last_error = Some("cancelled".into());
                }
                Err(e) => {
                    warn!("[indexer] Domain {} pass failed: {}", domain_id, e);
                    job.status = JobStatus::Error;
                    job.last_error = Some(e.to_string());
                }
            }
            manager.store.upsert_embedding_job(&job).ok();

            // Invalidate retrieval caches after every pass, success or not.
            if let Some(hook) = manager.invalidate.lock().clone() {
                hook(&domain_id, &model);
            }

            if dirty.load(Ordering::Relaxed) && !abort.load(Ordering::Relaxed) {
                info!("[indexer] Domain {} dirtied during pass — rerunning", domain_id);
                continue;
            }
            break;
        }
        manager.jobs.lock().remove(&domain_id);
    }

    /// Abort a domain's job and forget it.
    pub fn cancel(&self, domain_id: &str) {
        if let Some(job) = self.jobs.lock().remove(domain_id) {
            job.abort.store(true, Ordering::Relaxed);
            info!("[indexer] Cancelled indexing for domain {}", domain_id);
        }
    }

    pub fn cancel_all(&self) {
        let mut jobs = self.jobs.lock();
        for (domain_id, job) in jobs.drain() {
            job.abort.store(true, Ordering::Relaxed);
            info!("[indexer] Cancelled indexing for domain {}", domain_id);
        }
    }

    pub fn is_indexing(&self, domain_id: &str) -> bool {
        self.jobs
            .lock()
            .get(domain_id)
            .map(|j| !j.handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> Arc<EmbeddingManager> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_domain("d1", "Research", "/kb").unwrap();
        Arc::new(EmbeddingManager::new(store))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dirty_flag_coalesces_and_reruns() {
        let mgr = manager();
        let passes = Arc::new(AtomicUsize::new(0));
        let passes2 = passes.clone();
        // Empty file sets make each pass instant and network-free.
        let files: Arc<dyn Fn() -> Vec<IndexFile> + Send + Sync> = Arc::new(move || {
            passes2.fetch_add(1, Ordering::SeqCst);
            // Hold the pass open long enough for the second request to land.
            std::thread::sleep(std::time::Duration::from_millis(50));
            vec![]
        });
        let client = Arc::new(EmbeddingClient::new("http://localhost:1", "m"));

        mgr.index_domain("d1", client.clone(), files.clone());
        // Let the first pass start before coalescing into it.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        mgr.index_domain("d1", client.clone(), files.clone());
        mgr.index_domain("d1", client, files);

        // Wait for the job to drain.
        for _ in 0..100 {
            if !mgr.is_indexing("d1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        // Three requests, two passes: first + one dirty rerun.
        assert_eq!(passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_aborts_and_forgets() {
        let mgr = manager();
        let files: Arc<dyn Fn() -> Vec<IndexFile> + Send + Sync> = Arc::new(|| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            vec![]
        });
        let client = Arc::new(EmbeddingClient::new("http://localhost:1", "m"));
        mgr.index_domain("d1", client, files);
        mgr.cancel("d1");
        assert!(!mgr.is_indexing("d1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidation_hook_fires_after_pass() {
        let mgr = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.set_invalidation_hook(Arc::new(move |domain, model| {
            assert_eq!(domain, "d1");
            assert_eq!(model, "m");
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        let files: Arc<dyn Fn() -> Vec<IndexFile> + Send + Sync> = Arc::new(|| Vec::new());
        mgr.index_domain("d1", Arc::new(EmbeddingClient::new("http://localhost:1", "m")), files);
        for _ in 0..100 {
            if !mgr.is_indexing("d1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
