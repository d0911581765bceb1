//! In-memory store with the same compare-and-swap semantics as [`PgStore`].
//!
//! Tables sit behind separate locks so output ingestion never waits on
//! scheduling. When two tables are touched together the build table is
//! always locked first.
//!
//! [`PgStore`]: crate::PgStore

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use buildfleet_core::id::{BuildKey, JobKey, ResourceId, WorkerId, WorkerKind};
use buildfleet_core::job::{Job, JobState};
use buildfleet_core::maintenance::MaintenanceOperation;
use buildfleet_core::output::{JobOutputSection, SectionStatus};
use buildfleet_core::project::{Build, Project};
use buildfleet_core::worker::{ExternalWorkerSpec, InstanceSpec, Worker};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::repo::{BuildRepo, MaintenanceRepo, OutputRepo, ProjectRepo, WorkerRepo};
use crate::{DbError, DbResult};

#[derive(Default)]
struct BuildTable {
    builds: BTreeMap<BuildKey, Build>,
    jobs: BTreeMap<JobKey, Job>,
    next_section_id: HashMap<JobKey, i64>,
}

#[derive(Default)]
struct WorkerTable {
    workers: BTreeMap<WorkerId, Worker>,
    last_controlled_id: i64,
    last_external_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<i64, Project>>,
    builds: Mutex<BuildTable>,
    workers: Mutex<WorkerTable>,
    sections: Mutex<BTreeMap<(JobKey, i64), JobOutputSection>>,
    operations: Mutex<Vec<MaintenanceOperation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(entity: String, expected: buildfleet_core::Version) -> DbError {
    DbError::VersionConflict { entity, expected }
}

#[async_trait]
impl ProjectRepo for MemoryStore {
    async fn upsert_project(&self, project: &Project) -> DbResult<()> {
        self.projects
            .lock()
            .await
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: i64) -> DbResult<Project> {
        self.projects
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn insert_build(&self, build: &Build, jobs: &[Job]) -> DbResult<()> {
        let mut table = self.builds.lock().await;
        if table.builds.contains_key(&build.key) {
            return Err(DbError::Duplicate(format!("build {}", build.key)));
        }
        if let Some(job) = jobs.iter().find(|j| table.jobs.contains_key(&j.key)) {
            return Err(DbError::Duplicate(format!("job {}", job.key)));
        }
        table.builds.insert(build.key, build.clone());
        for job in jobs {
            table.jobs.insert(job.key, job.clone());
        }
        Ok(())
    }

    async fn get_build(&self, key: BuildKey) -> DbResult<Build> {
        self.builds
            .lock()
            .await
            .builds
            .get(&key)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", key)))
    }

    async fn update_build(&self, build: &Build) -> DbResult<Build> {
        let mut table = self.builds.lock().await;
        let stored = table
            .builds
            .get_mut(&build.key)
            .ok_or_else(|| DbError::NotFound(format!("build {}", build.key)))?;
        if stored.version != build.version {
            return Err(conflict(format!("build {}", build.key), build.version));
        }
        let mut next = build.clone();
        next.version = build.version.next();
        *stored = next.clone();
        Ok(next)
    }

    async fn get_job(&self, key: JobKey) -> DbResult<Job> {
        self.builds
            .lock()
            .await
            .jobs
            .get(&key)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", key)))
    }

    async fn update_job(&self, job: &Job) -> DbResult<Job> {
        let mut table = self.builds.lock().await;
        let stored = table
            .jobs
            .get_mut(&job.key)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.key)))?;
        if stored.version != job.version {
            return Err(conflict(format!("job {}", job.key), job.version));
        }
        let mut next = job.clone();
        next.version = job.version.next();
        // Purge bookkeeping is not versioned; never let a stale copy clear it.
        next.output_purged |= stored.output_purged;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_jobs_for_build(&self, key: BuildKey) -> DbResult<Vec<Job>> {
        let table = self.builds.lock().await;
        Ok(table
            .jobs
            .range(key.job(i64::MIN)..=key.job(i64::MAX))
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn list_jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let table = self.builds.lock().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.queued_at, j.key));
        Ok(jobs)
    }

    async fn list_unpurged_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Job>> {
        let table = self.builds.lock().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| !j.output_purged && j.finished_at.is_some_and(|f| f < cutoff))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.finished_at);
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }
}

#[async_trait]
impl WorkerRepo for MemoryStore {
    async fn insert_controlled(
        &self,
        spec: &InstanceSpec,
        now: DateTime<Utc>,
    ) -> DbResult<Worker> {
        let mut table = self.workers.lock().await;
        table.last_controlled_id += 1;
        let worker = Worker::new_controlled(table.last_controlled_id, spec, now);
        table.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn insert_external(
        &self,
        spec: &ExternalWorkerSpec,
        now: DateTime<Utc>,
    ) -> DbResult<Worker> {
        let mut table = self.workers.lock().await;
        if table
            .workers
            .values()
            .any(|w| w.kind() == WorkerKind::External && w.name == spec.name)
        {
            return Err(DbError::Duplicate(format!("worker {}", spec.name)));
        }
        table.last_external_id += 1;
        let worker = Worker::new_external(table.last_external_id, spec, now);
        table.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn find_external_by_name(&self, name: &str) -> DbResult<Option<Worker>> {
        let table = self.workers.lock().await;
        Ok(table
            .workers
            .values()
            .find(|w| w.kind() == WorkerKind::External && w.name == name)
            .cloned())
    }

    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker> {
        self.workers
            .lock()
            .await
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))
    }

    async fn update_worker(&self, worker: &Worker) -> DbResult<Worker> {
        let mut table = self.workers.lock().await;
        let stored = table
            .workers
            .get_mut(&worker.id)
            .ok_or_else(|| DbError::NotFound(format!("worker {}", worker.id)))?;
        if stored.version != worker.version {
            return Err(conflict(format!("worker {}", worker.id), worker.version));
        }
        let mut next = worker.clone();
        next.version = worker.version.next();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        Ok(self.workers.lock().await.workers.values().cloned().collect())
    }

    async fn list_free_workers(&self) -> DbResult<Vec<Worker>> {
        let table = self.workers.lock().await;
        let mut workers: Vec<Worker> = table
            .workers
            .values()
            .filter(|w| w.is_eligible())
            .cloned()
            .collect();
        workers.sort_by_key(|w| (w.priority, w.id));
        Ok(workers)
    }
}

#[async_trait]
impl OutputRepo for MemoryStore {
    async fn open_section(
        &self,
        job: JobKey,
        name: &str,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection> {
        let section_id = {
            let mut table = self.builds.lock().await;
            if !table.jobs.contains_key(&job) {
                return Err(DbError::NotFound(format!("job {}", job)));
            }
            let next = table.next_section_id.entry(job).or_insert(0);
            *next += 1;
            *next
        };
        let section = JobOutputSection::new(job, section_id, name.to_string(), now);
        self.sections
            .lock()
            .await
            .insert((job, section_id), section.clone());
        Ok(section)
    }

    async fn append_output(
        &self,
        job: JobKey,
        section_id: i64,
        text: &str,
        max_len: usize,
    ) -> DbResult<usize> {
        let mut sections = self.sections.lock().await;
        let section = sections
            .get_mut(&(job, section_id))
            .ok_or_else(|| DbError::NotFound(format!("section {} of job {}", section_id, job)))?;
        Ok(section.append(text, max_len)?)
    }

    async fn close_section(
        &self,
        job: JobKey,
        section_id: i64,
        status: SectionStatus,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection> {
        let mut sections = self.sections.lock().await;
        let section = sections
            .get_mut(&(job, section_id))
            .ok_or_else(|| DbError::NotFound(format!("section {} of job {}", section_id, job)))?;
        section.close(status, now)?;
        Ok(section.clone())
    }

    async fn get_section(&self, job: JobKey, section_id: i64) -> DbResult<JobOutputSection> {
        self.sections
            .lock()
            .await
            .get(&(job, section_id))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("section {} of job {}", section_id, job)))
    }

    async fn list_sections(&self, job: JobKey) -> DbResult<Vec<JobOutputSection>> {
        let sections = self.sections.lock().await;
        Ok(sections
            .range((job, i64::MIN)..=(job, i64::MAX))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn purge_output(&self, job: JobKey) -> DbResult<u64> {
        let mut table = self.builds.lock().await;
        let mut sections = self.sections.lock().await;

        let mut touched = 0;
        for (_, section) in sections.range_mut((job, i64::MIN)..=(job, i64::MAX)) {
            if section.output_length > 0 {
                section.purge();
                touched += 1;
            }
        }
        if let Some(stored) = table.jobs.get_mut(&job) {
            stored.output_purged = true;
        }
        Ok(touched)
    }
}

#[async_trait]
impl MaintenanceRepo for MemoryStore {
    async fn insert_operation(&self, op: &MaintenanceOperation) -> DbResult<()> {
        self.operations.lock().await.push(op.clone());
        Ok(())
    }

    async fn finish_operation(
        &self,
        id: ResourceId,
        failed: bool,
        now: DateTime<Utc>,
    ) -> DbResult<MaintenanceOperation> {
        let mut ops = self.operations.lock().await;
        let op = ops
            .iter_mut()
            .find(|op| op.id == id && !op.is_finished())
            .ok_or_else(|| {
                DbError::InvalidState(format!(
                    "maintenance operation {} is missing or finished",
                    id
                ))
            })?;
        op.finished_at = Some(now);
        op.failed = failed;
        Ok(op.clone())
    }

    async fn list_operations(
        &self,
        worker: Option<WorkerId>,
        limit: i64,
    ) -> DbResult<Vec<MaintenanceOperation>> {
        let ops = self.operations.lock().await;
        let mut matching: Vec<MaintenanceOperation> = ops
            .iter()
            .filter(|op| worker.is_none() || op.worker == worker)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Store;
    use buildfleet_core::job::NewJob;
    use buildfleet_core::maintenance::MaintenanceKind;
    use buildfleet_core::project::BuildStatus;
    use buildfleet_core::worker::{Reservation, WorkerStatus};
    use chrono::Duration;
    use std::sync::Arc;

    fn build(key: BuildKey) -> Build {
        Build {
            key,
            commit_hash: "abc123".to_string(),
            remote_ref: "refs/heads/main".to_string(),
            commit_message: "fix the thing".to_string(),
            is_safe: true,
            status: BuildStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
            version: buildfleet_core::Version::initial(),
        }
    }

    fn job(key: JobKey) -> Job {
        Job::new(
            key,
            NewJob {
                job_id: key.job_id,
                name: format!("job-{}", key.job_id),
                kind: "test".to_string(),
                image: "rust:1".to_string(),
                cache_config: serde_json::Value::Null,
                secret_names: vec![],
                pool: None,
            },
            Utc::now(),
        )
    }

    async fn seeded() -> (MemoryStore, BuildKey) {
        let store = MemoryStore::new();
        let key = BuildKey::new(1, 1);
        store
            .insert_build(&build(key), &[job(key.job(1)), job(key.job(2))])
            .await
            .unwrap();
        (store, key)
    }

    fn external(name: &str) -> ExternalWorkerSpec {
        ExternalWorkerSpec {
            name: name.to_string(),
            address: "http://10.0.0.5:7000".to_string(),
            priority: 5,
            ssh_key_ref: None,
        }
    }

    #[tokio::test]
    async fn test_insert_build_rejects_duplicates() {
        let (store, key) = seeded().await;
        let err = store.insert_build(&build(key), &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
        assert_eq!(store.list_jobs_for_build(key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_job_update_conflicts() {
        let (store, key) = seeded().await;
        let original = store.get_job(key.job(1)).await.unwrap();

        let mut first = original.clone();
        first.cancel(Utc::now()).unwrap();
        let committed = store.update_job(&first).await.unwrap();
        assert_eq!(committed.version, original.version.next());

        let mut second = original.clone();
        second
            .begin_dispatch(
                WorkerId::external(1),
                "mac-mini (external-1)".to_string(),
                "hash".to_string(),
                Utc::now(),
            )
            .unwrap();
        let err = store.update_job(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.get_job(key.job(1)).await.unwrap().state,
            JobState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservation_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let worker = store
            .insert_external(&external("mac-mini"), Utc::now())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for job_id in 0..8 {
            let store = store.clone();
            let mut candidate = worker.clone();
            handles.push(tokio::spawn(async move {
                candidate.reservation = Reservation::Job(JobKey::new(1, 1, job_id));
                store.update_worker(&candidate).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_external_names_are_unique() {
        let store = MemoryStore::new();
        store
            .insert_external(&external("mac-mini"), Utc::now())
            .await
            .unwrap();
        let err = store
            .insert_external(&external("mac-mini"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
        assert!(
            store
                .find_external_by_name("mac-mini")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_free_workers_excludes_reserved_and_provisioning() {
        let store = MemoryStore::new();
        let spec = InstanceSpec {
            source_image: "img".to_string(),
            instance_class: "small".to_string(),
            volume_gb: 20,
            priority: 1,
        };
        store.insert_controlled(&spec, Utc::now()).await.unwrap();
        let mut a = store
            .insert_external(&external("a"), Utc::now())
            .await
            .unwrap();
        store
            .insert_external(&external("b"), Utc::now())
            .await
            .unwrap();
        a.reservation = Reservation::Maintenance;
        store.update_worker(&a).await.unwrap();

        let free = store.list_free_workers().await.unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].name, "b");
        assert_eq!(free[0].status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_section_ids_are_per_job() {
        let (store, key) = seeded().await;
        let a = store
            .open_section(key.job(1), "checkout", Utc::now())
            .await
            .unwrap();
        let b = store
            .open_section(key.job(1), "compile", Utc::now())
            .await
            .unwrap();
        let c = store
            .open_section(key.job(2), "checkout", Utc::now())
            .await
            .unwrap();
        assert_eq!((a.section_id, b.section_id, c.section_id), (1, 2, 1));

        let names: Vec<String> = store
            .list_sections(key.job(1))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["checkout", "compile"]);
    }

    #[tokio::test]
    async fn test_open_section_for_unknown_job() {
        let store = MemoryStore::new();
        let err = store
            .open_section(JobKey::new(9, 9, 9), "x", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_purge_is_idempotent_and_survives_job_updates() {
        let (store, key) = seeded().await;
        let job_key = key.job(1);
        store
            .open_section(job_key, "compile", Utc::now())
            .await
            .unwrap();
        store
            .append_output(job_key, 1, "warning: unused", 1024)
            .await
            .unwrap();
        let stale = store.get_job(job_key).await.unwrap();

        assert_eq!(store.purge_output(job_key).await.unwrap(), 1);
        assert_eq!(store.purge_output(job_key).await.unwrap(), 0);

        let section = store.get_section(job_key, 1).await.unwrap();
        assert_eq!(section.output_length, 0);
        assert_eq!(section.name, "compile");

        let mut update = stale;
        update.cancel(Utc::now()).unwrap();
        let committed = store.update_job(&update).await.unwrap();
        assert!(committed.output_purged);
    }

    #[tokio::test]
    async fn test_unpurged_finished_before_cutoff() {
        let (store, key) = seeded().await;
        let mut done = store.get_job(key.job(1)).await.unwrap();
        done.cancel(Utc::now() - Duration::days(40)).unwrap();
        store.update_job(&done).await.unwrap();

        let old = store
            .list_unpurged_finished_before(Utc::now() - Duration::days(30), 10)
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].key, key.job(1));

        store.purge_output(key.job(1)).await.unwrap();
        assert!(
            store
                .list_unpurged_finished_before(Utc::now(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_operations_finish_once() {
        let store = MemoryStore::new();
        let op = MaintenanceOperation::new(
            MaintenanceKind::Cleanup,
            Some(WorkerId::controlled(1)),
            "disk at 91%",
            "health-check",
            Utc::now(),
        );
        store.insert_operation(&op).await.unwrap();
        let finished = store.finish_operation(op.id, false, Utc::now()).await.unwrap();
        assert!(finished.is_finished());
        assert!(store.finish_operation(op.id, true, Utc::now()).await.is_err());

        let listed = store
            .list_operations(Some(WorkerId::controlled(1)), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(
            store
                .list_operations(Some(WorkerId::external(1)), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_memory_store_is_a_store() {
        fn assert_store<T: Store>() {}
        assert_store::<MemoryStore>();
    }
}
