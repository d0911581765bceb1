//! In-process fakes and a wired-up fleet for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use buildfleet_config::SystemConfig;
use buildfleet_core::artifact::MemoryArtifactStore;
use buildfleet_core::cloud::{CloudProvisioner, InstanceState};
use buildfleet_core::control::{DispatchMessage, WorkerControl};
use buildfleet_core::event::{Event, Notifier};
use buildfleet_core::id::{JobKey, WorkerId};
use buildfleet_core::job::NewJob;
use buildfleet_core::maintenance::MaintenanceKind;
use buildfleet_core::project::{Build, NewBuild, Project};
use buildfleet_core::secret::MemorySecretStore;
use buildfleet_core::worker::{
    DiskUsage, ExternalWorkerSpec, HealthSnapshot, InstanceSpec, Worker,
};
use buildfleet_core::{Error, Result};
use buildfleet_db::{MemoryStore, Store};
use chrono::Utc;

use crate::{
    Collaborators, FleetService, MaintenanceCoordinator, OutputAggregator, Scheduler, WorkerPool,
};

/// How a fake collaborator answers a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    #[default]
    Ack,
    Fail,
    /// Never answer.
    Hang,
}

#[derive(Default)]
pub(crate) struct FakeControl {
    dispatched: Mutex<Vec<DispatchMessage>>,
    stops: Mutex<Vec<JobKey>>,
    maintained: Mutex<Vec<(WorkerId, MaintenanceKind)>>,
    dispatch_mode: Mutex<DispatchMode>,
    stop_hangs: AtomicBool,
    maintenance_fails: AtomicBool,
    unreachable: Mutex<HashSet<WorkerId>>,
    disk: Mutex<HashMap<WorkerId, DiskUsage>>,
    probe_delay: Mutex<StdDuration>,
}

impl FakeControl {
    pub fn set_dispatch_mode(&self, mode: DispatchMode) {
        *self.dispatch_mode.lock().unwrap() = mode;
    }

    pub fn set_stop_hangs(&self, hangs: bool) {
        self.stop_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn set_maintenance_fails(&self, fails: bool) {
        self.maintenance_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, worker: WorkerId, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if reachable {
            unreachable.remove(&worker);
        } else {
            unreachable.insert(worker);
        }
    }

    pub fn set_disk(&self, worker: WorkerId, used_bytes: i64, total_bytes: i64) {
        self.disk.lock().unwrap().insert(
            worker,
            DiskUsage {
                used_bytes,
                total_bytes,
            },
        );
    }

    pub fn set_probe_delay(&self, delay: StdDuration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn dispatched(&self) -> Vec<DispatchMessage> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<JobKey> {
        self.stops.lock().unwrap().clone()
    }

    pub fn maintained(&self) -> Vec<(WorkerId, MaintenanceKind)> {
        self.maintained.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerControl for FakeControl {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn dispatch(&self, worker: &Worker, message: &DispatchMessage) -> Result<()> {
        let mode = *self.dispatch_mode.lock().unwrap();
        match mode {
            DispatchMode::Ack => {
                self.dispatched.lock().unwrap().push(message.clone());
                Ok(())
            }
            DispatchMode::Fail => Err(Error::Unreachable(worker.id.to_string())),
            DispatchMode::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self, _worker: &Worker, job: &JobKey) -> Result<()> {
        self.stops.lock().unwrap().push(*job);
        if self.stop_hangs.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        Ok(())
    }

    async fn maintain(&self, worker: &Worker, kind: MaintenanceKind) -> Result<()> {
        self.maintained.lock().unwrap().push((worker.id, kind));
        if self.maintenance_fails.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} failed on {}", kind.as_str(), worker.id)));
        }
        Ok(())
    }

    async fn probe(&self, worker: &Worker) -> Result<HealthSnapshot> {
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().unwrap().contains(&worker.id) {
            return Err(Error::Unreachable(worker.id.to_string()));
        }
        Ok(HealthSnapshot {
            reachable: true,
            disk_usage: self.disk.lock().unwrap().get(&worker.id).copied(),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeCloud {
    instances: tokio::sync::Mutex<HashMap<String, InstanceState>>,
    next: AtomicU64,
    destroyed: tokio::sync::Mutex<Vec<String>>,
    stopped: tokio::sync::Mutex<Vec<String>>,
    create_mode: Mutex<DispatchMode>,
    start_mode: Mutex<DispatchMode>,
}

impl FakeCloud {
    pub fn set_create_mode(&self, mode: DispatchMode) {
        *self.create_mode.lock().unwrap() = mode;
    }

    pub fn set_start_mode(&self, mode: DispatchMode) {
        *self.start_mode.lock().unwrap() = mode;
    }

    pub async fn set_ready(&self, handle: &str, address: &str) {
        self.instances.lock().await.insert(
            handle.to_string(),
            InstanceState::Ready {
                address: address.to_string(),
            },
        );
    }

    pub async fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().await.clone()
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl CloudProvisioner for FakeCloud {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _spec: &InstanceSpec) -> Result<String> {
        let mode = *self.create_mode.lock().unwrap();
        match mode {
            DispatchMode::Ack => {}
            DispatchMode::Fail => return Err(Error::Internal("quota exceeded".to_string())),
            DispatchMode::Hang => return std::future::pending().await,
        }
        let handle = format!("i-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.instances
            .lock()
            .await
            .insert(handle.clone(), InstanceState::Pending);
        Ok(handle)
    }

    async fn describe(&self, handle: &str) -> Result<InstanceState> {
        Ok(self
            .instances
            .lock()
            .await
            .get(handle)
            .cloned()
            .unwrap_or(InstanceState::Pending))
    }

    async fn start(&self, handle: &str) -> Result<()> {
        let mode = *self.start_mode.lock().unwrap();
        match mode {
            DispatchMode::Ack => Ok(()),
            DispatchMode::Fail => Err(Error::Internal(format!("{handle} failed to start"))),
            DispatchMode::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.stopped.lock().await.push(handle.to_string());
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.instances.lock().await.remove(handle);
        self.destroyed.lock().await.push(handle.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub(crate) fn instance_spec() -> InstanceSpec {
    InstanceSpec {
        source_image: "worker-image-v1".to_string(),
        instance_class: "c6.large".to_string(),
        volume_gb: 100,
        priority: 1,
    }
}

pub(crate) fn job_spec(job_id: i64) -> NewJob {
    NewJob {
        job_id,
        name: format!("job-{job_id}"),
        kind: "build".to_string(),
        image: "rust:1.85".to_string(),
        cache_config: serde_json::json!({}),
        secret_names: Vec::new(),
        pool: None,
    }
}

/// A full fleet over in-memory storage and fake collaborators.
pub(crate) struct Harness {
    pub store: Arc<dyn Store>,
    pub control: Arc<FakeControl>,
    pub cloud: Arc<FakeCloud>,
    pub secrets: Arc<MemorySecretStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub config: SystemConfig,
    pub service: FleetService,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub output: Arc<OutputAggregator>,
    pub maintenance: Arc<MaintenanceCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut SystemConfig)) -> Self {
        let mut config = SystemConfig::default();
        configure(&mut config);

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let control = Arc::new(FakeControl::default());
        let cloud = Arc::new(FakeCloud::default());
        let secrets = Arc::new(MemorySecretStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let collab = Collaborators {
            store: store.clone(),
            control: control.clone(),
            cloud: cloud.clone(),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            secrets: secrets.clone(),
            notifier: notifier.clone(),
        };
        let service = FleetService::new(collab, &config);

        Self {
            pool: service.pool().clone(),
            scheduler: service.scheduler().clone(),
            output: service.output().clone(),
            maintenance: service.maintenance().clone(),
            store,
            control,
            cloud,
            secrets,
            notifier,
            config,
            service,
        }
    }

    pub async fn seed_project(&self) {
        self.store
            .upsert_project(&Project {
                id: 1,
                name: "widgets".to_string(),
                repository: "https://git.example.com/widgets.git".to_string(),
                default_branch: "main".to_string(),
                enabled: true,
                deleted: false,
            })
            .await
            .unwrap();
    }

    pub fn new_build(&self, build_id: i64, jobs: Vec<NewJob>, is_safe: bool) -> NewBuild {
        NewBuild {
            project_id: 1,
            build_id,
            commit_hash: format!("c0ffee{build_id:02}"),
            remote_ref: "refs/heads/main".to_string(),
            commit_message: format!("build {build_id}"),
            is_safe,
            jobs,
        }
    }

    pub async fn enqueue(&self, build_id: i64, jobs: Vec<NewJob>, is_safe: bool) -> Build {
        self.seed_project().await;
        self.scheduler
            .enqueue(self.new_build(build_id, jobs, is_safe))
            .await
            .unwrap()
    }

    pub async fn external(&self, name: &str, priority: i32) -> Worker {
        let spec = ExternalWorkerSpec {
            name: name.to_string(),
            address: format!("http://{name}.local:7000"),
            priority,
            ssh_key_ref: None,
        };
        self.pool.register_external(&spec, Utc::now()).await.unwrap()
    }

    /// A single job running on an external worker. Returns the job, its
    /// connect credential and the worker.
    pub async fn running_job(&self) -> (JobKey, String, Worker) {
        let worker = self.external("runner", 5).await;
        self.enqueue(1, vec![job_spec(1)], true).await;
        self.scheduler.run_pass(Utc::now()).await.unwrap();
        let credential = self
            .control
            .dispatched()
            .last()
            .map(|m| m.connect_credential.clone())
            .unwrap();
        (JobKey::new(1, 1, 1), credential, worker)
    }
}
