//! In-memory container runtime for manager tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};

use nodeisp_service::labels::{self, ContainerQuery};
use nodeisp_service::runtime::{
    ContainerRuntime, ContainerState, ContainerSummary, CreateContainer, OutputStream,
};
use nodeisp_service::RuntimeError;

/// A call made against the fake runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindNetwork(String),
    CreateNetwork(String),
    List(Option<String>),
    Pull {
        image: String,
        platform: Option<String>,
    },
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Attach(String),
    Wait(String),
    Exec {
        container: String,
        cmd: Vec<String>,
    },
}

impl Call {
    /// Calls that change runtime state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::CreateNetwork(_)
                | Call::Pull { .. }
                | Call::Create(_)
                | Call::Start(_)
                | Call::Stop(_)
                | Call::Remove(_)
        )
    }
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    networks: Vec<String>,
    containers: Vec<ContainerSummary>,
    created: Vec<CreateContainer>,
    next_id: u64,
    fail_remove: HashSet<String>,
    fail_stop: HashSet<String>,
    fail_find_network: bool,
    fail_create_network: bool,
    fail_attach: bool,
    hang_pull: bool,
    output: Vec<Vec<u8>>,
    exec_output: Vec<u8>,
}

#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
    pending_waits: Arc<AtomicUsize>,
}

/// Counts a wait future until it is dropped.
struct WaitGuard(Arc<AtomicUsize>);

impl WaitGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(self, id: &str) -> Self {
        self.inner.lock().unwrap().networks.push(id.to_string());
        self
    }

    /// Seed a container owned by `service` carrying `hash`.
    pub fn add_container(&self, service: &str, hash: &str, state: ContainerState) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("seed-{}", inner.next_id);
        inner.containers.push(ContainerSummary {
            id: id.clone(),
            names: vec![format!("/nodeisp_{service}_{}", &hash[..hash.len().min(8)])],
            state,
            created: None,
            labels: labels::container_labels(service, hash),
        });
        id
    }

    pub fn fail_remove(&self, id: &str) {
        self.inner.lock().unwrap().fail_remove.insert(id.to_string());
    }

    pub fn fail_stop(&self, id: &str) {
        self.inner.lock().unwrap().fail_stop.insert(id.to_string());
    }

    pub fn fail_find_network(&self) {
        self.inner.lock().unwrap().fail_find_network = true;
    }

    pub fn fail_create_network(&self) {
        self.inner.lock().unwrap().fail_create_network = true;
    }

    pub fn fail_attach(&self) {
        self.inner.lock().unwrap().fail_attach = true;
    }

    pub fn hang_pull(&self) {
        self.inner.lock().unwrap().hang_pull = true;
    }

    /// Chunks returned by every output attachment, after which the stream
    /// stays open.
    pub fn set_output(&self, chunks: &[&[u8]]) {
        self.inner.lock().unwrap().output = chunks.iter().map(|c| c.to_vec()).collect();
    }

    pub fn set_exec_output(&self, output: &[u8]) {
        self.inner.lock().unwrap().exec_output = output.to_vec();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.inner.lock().unwrap().containers.clone()
    }

    /// Wait futures handed out and not yet dropped.
    pub fn pending_waits(&self) -> usize {
        self.pending_waits.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<CreateContainer> {
        self.inner.lock().unwrap().created.clone()
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn find_network(&self, label: &str) -> Result<Option<String>, RuntimeError> {
        self.record(Call::FindNetwork(label.to_string()));
        let inner = self.inner.lock().unwrap();
        if inner.fail_find_network {
            return Err(RuntimeError::Api("network list refused".into()));
        }
        Ok(inner.networks.first().cloned())
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        self.record(Call::CreateNetwork(name.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create_network {
            return Err(RuntimeError::Api("network create refused".into()));
        }
        let id = format!("net-{name}");
        inner.networks.push(id.clone());
        Ok(id)
    }

    async fn list_containers(
        &self,
        query: &ContainerQuery,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record(Call::List(query.service_name().map(str::to_string)));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .iter()
            .filter(|c| query.matches(&c.labels))
            .cloned()
            .collect())
    }

    async fn pull_image(&self, image: &str, platform: Option<&str>) -> Result<(), RuntimeError> {
        self.record(Call::Pull {
            image: image.to_string(),
            platform: platform.map(str::to_string),
        });
        let hang = self.inner.lock().unwrap().hang_pull;
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError> {
        self.record(Call::Create(spec.name.clone()));
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("ctr-{}", inner.next_id);
        inner.containers.push(ContainerSummary {
            id: id.clone(),
            names: vec![format!("/{}", spec.name)],
            state: ContainerState::Created,
            created: None,
            labels: spec.labels.clone(),
        });
        inner.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Start(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Stop(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_stop.contains(id) {
            return Err(RuntimeError::Api(format!("stop of {id} timed out")));
        }
        if let Some(container) = inner.containers.iter_mut().find(|c| c.id == id) {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Remove(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_remove.contains(id) {
            return Err(RuntimeError::Api(format!("removal of {id} refused")));
        }
        inner.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn attach_output(&self, id: &str) -> Result<OutputStream, RuntimeError> {
        self.record(Call::Attach(id.to_string()));
        let inner = self.inner.lock().unwrap();
        if inner.fail_attach {
            return Err(RuntimeError::Api("attach refused".into()));
        }
        let chunks: Vec<Result<Vec<u8>, RuntimeError>> =
            inner.output.iter().cloned().map(Ok).collect();
        Ok(stream::iter(chunks).chain(stream::pending()).boxed())
    }

    fn wait_not_running(&self, id: &str) -> BoxFuture<'static, Result<i64, RuntimeError>> {
        self.record(Call::Wait(id.to_string()));
        let guard = WaitGuard::new(&self.pending_waits);
        async move {
            let _guard = guard;
            futures::future::pending::<Result<i64, RuntimeError>>().await
        }
        .boxed()
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<OutputStream, RuntimeError> {
        self.record(Call::Exec {
            container: container.to_string(),
            cmd: cmd.to_vec(),
        });
        let inner = self.inner.lock().unwrap();
        let wanted = format!("/{container}");
        if !inner.containers.iter().any(|c| c.names.contains(&wanted)) {
            return Err(RuntimeError::NotFound(container.to_string()));
        }
        let output = inner.exec_output.clone();
        Ok(stream::iter(vec![Ok(output)]).boxed())
    }
}
