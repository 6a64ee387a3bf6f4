//! A microservice: one routable (or dependency-only) unit of a project.
//!
//! State machine:
//!
//! ```text
//! INACTIVE --launch--> STARTUP --ok--> ACTIVE --shutdown--> STOPPING --> INACTIVE
//!                         |
//!                         +--failure--> INACTIVE
//! ```
//!
//! Lifecycle jobs (launch and shutdown) are serialized per microservice: a job
//! only starts after every earlier job finished, and it re-checks the state
//! once it runs. Jobs run on their own task, so a caller that stops waiting
//! cannot leave a job half done.

use crate::config::ServiceConfig;
use crate::context::RuntimeContext;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::source::Source;
use crate::ProxyBody;
use hyper::{Request, Response};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Lifecycle state of a microservice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No source, no environment
    Inactive,
    /// Activation in progress
    Startup,
    /// Serving traffic
    Active,
    /// Deactivation in progress
    Stopping,
}

impl ServiceState {
    /// Whether the service is running or about to be
    pub fn is_live(self) -> bool {
        matches!(self, ServiceState::Startup | ServiceState::Active)
    }
}

/// A state transition, broadcast to project subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub project: String,
    pub service: String,
    pub state: ServiceState,
}

/// Resources held while ACTIVE
struct Runtime {
    source: Source,
    environment: Environment,
}

pub struct Microservice {
    id: String,
    project_id: String,
    config: ServiceConfig,
    context: RuntimeContext,
    idle_timeout: Duration,
    startup_timeout: Duration,
    dependents: Vec<String>,
    state: Mutex<ServiceState>,
    /// Held for the whole duration of a lifecycle job
    lifecycle: tokio::sync::Mutex<()>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    open_connections: AtomicUsize,
    inactive: AtomicBool,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    idle_listener: Mutex<Option<oneshot::Sender<()>>>,
    activations: AtomicU64,
    events: broadcast::Sender<ServiceEvent>,
}

impl Microservice {
    pub fn new(
        project_id: &str,
        config: ServiceConfig,
        context: RuntimeContext,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        Self {
            id: config.id.clone(),
            project_id: project_id.to_string(),
            idle_timeout: config.idle_timeout(&context.defaults),
            startup_timeout: config.startup_timeout(&context.defaults),
            config,
            context,
            dependents: Vec::new(),
            state: Mutex::new(ServiceState::Inactive),
            lifecycle: tokio::sync::Mutex::new(()),
            runtime: RwLock::new(None),
            open_connections: AtomicUsize::new(0),
            inactive: AtomicBool::new(false),
            idle_timer: Mutex::new(None),
            idle_listener: Mutex::new(None),
            activations: AtomicU64::new(0),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// `project/service`, used in logs and as the working-copy scope
    pub fn label(&self) -> String {
        format!("{}/{}", self.project_id, self.id)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn dependencies(&self) -> &[String] {
        &self.config.dependencies
    }

    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    pub(crate) fn add_dependent(&mut self, id: &str) {
        if !self.dependents.iter().any(|d| d == id) {
            self.dependents.push(id.to_string());
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Set once the inactivity delay elapses, cleared by traffic
    pub fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Number of times activation has been attempted
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    /// Backend port while ACTIVE with a process-backed environment
    pub fn port(&self) -> Option<u16> {
        self.runtime.read().as_ref().and_then(|rt| rt.environment.port())
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock() = state;
        debug!(service = %self.label(), ?state, "State changed");
        // No subscribers is fine
        let _ = self.events.send(ServiceEvent {
            project: self.project_id.clone(),
            service: self.id.clone(),
            state,
        });
    }

    /// Activate the service if it is INACTIVE. Resolves once this launch job
    /// has run, whatever state it found.
    pub async fn launch(self: &Arc<Self>) -> Result<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.launch_job().await })
            .await
            .map_err(|e| Error::Internal(format!("launch job for '{}' failed: {}", self.label(), e)))?
    }

    /// Deactivate the service if it is ACTIVE. Resolves once this shutdown
    /// job has run.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.spawn_shutdown(None).await.map(|_| ())
    }

    /// Deactivate the service only if, once the job holds the lifecycle lock,
    /// the inactivity flag is still set and none of `dependents` is live.
    /// Returns whether the service was stopped.
    pub async fn shutdown_if_idle(self: &Arc<Self>, dependents: Vec<Arc<Microservice>>) -> Result<bool> {
        self.spawn_shutdown(Some(dependents)).await
    }

    async fn spawn_shutdown(self: &Arc<Self>, idle_guard: Option<Vec<Arc<Microservice>>>) -> Result<bool> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.shutdown_job(idle_guard).await })
            .await
            .map_err(|e| Error::Internal(format!("shutdown job for '{}' failed: {}", self.label(), e)))?
    }

    async fn launch_job(self: Arc<Self>) -> Result<()> {
        let _job = self.lifecycle.lock().await;

        let state = self.state();
        if state != ServiceState::Inactive {
            debug!(service = %self.label(), ?state, "Launch skipped");
            return Ok(());
        }

        self.set_state(ServiceState::Startup);
        self.activations.fetch_add(1, Ordering::SeqCst);
        info!(service = %self.label(), "Activating");

        match self.activate().await {
            Ok(runtime) => {
                *self.runtime.write() = Some(Arc::new(runtime));
                self.inactive.store(false, Ordering::SeqCst);
                self.set_state(ServiceState::Active);
                self.touch();
                info!(service = %self.label(), port = ?self.port(), "Service active");
                Ok(())
            }
            Err(e) => {
                error!(service = %self.label(), error = %e, "Activation failed");
                self.set_state(ServiceState::Inactive);
                Err(e)
            }
        }
    }

    async fn activate(&self) -> Result<Runtime> {
        let label = self.label();
        let mut source = Source::from_config(&self.config.source, &self.context.roots, &label)?;

        let workdir = match source.fetch().await {
            Ok(dir) => dir,
            Err(e) => {
                source.clear().await;
                return Err(self.activation_error(e));
            }
        };

        let mut environment = match Environment::from_config(
            &self.config.environment,
            &workdir,
            &self.context,
            self.startup_timeout,
            &label,
        ) {
            Ok(environment) => environment,
            Err(e) => {
                source.clear().await;
                return Err(e);
            }
        };

        if let Err(e) = environment.start().await {
            source.clear().await;
            return Err(self.activation_error(e));
        }

        Ok(Runtime { source, environment })
    }

    /// Configuration errors keep their kind so they surface as setup problems
    fn activation_error(&self, err: Error) -> Error {
        match err {
            Error::Config(_) | Error::Activation { .. } => err,
            other => Error::activation(&self.label(), other),
        }
    }

    async fn shutdown_job(self: Arc<Self>, idle_guard: Option<Vec<Arc<Microservice>>>) -> Result<bool> {
        let _job = self.lifecycle.lock().await;

        let state = self.state();
        if state != ServiceState::Active {
            debug!(service = %self.label(), ?state, "Shutdown skipped");
            return Ok(false);
        }

        if let Some(dependents) = &idle_guard {
            if let Some(dependent) = dependents.iter().find(|d| d.state().is_live()) {
                debug!(service = %self.label(), dependent = dependent.id(), "Shutdown deferred, dependent is live");
                return Ok(false);
            }
            if !self.is_inactive() {
                debug!(service = %self.label(), "Shutdown skipped, service saw recent traffic");
                return Ok(false);
            }
            info!(service = %self.label(), "Shutting down inactive service");
        }

        self.set_state(ServiceState::Stopping);
        info!(service = %self.label(), "Deactivating");
        self.cancel_idle_timer();

        let runtime = self.runtime.write().take();
        let result = match &runtime {
            Some(runtime) => runtime.environment.shutdown().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            error!(service = %self.label(), error = %e, "Environment shutdown failed");
        }
        if let Some(runtime) = &runtime {
            debug!(service = %self.label(), source = runtime.source.kind(), "Released source");
        }
        drop(runtime);

        self.inactive.store(false, Ordering::SeqCst);
        self.set_state(ServiceState::Inactive);
        info!(service = %self.label(), "Service inactive");
        result.map(|_| true)
    }

    /// Register the single inactivity listener. A previous listener is
    /// dropped and its receiver resolves with an error.
    pub fn subscribe_inactivity(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.idle_listener.lock() = Some(tx);
        rx
    }

    /// Note activity: clears the inactivity flag and restarts the timer
    pub fn touch(self: &Arc<Self>) {
        self.inactive.store(false, Ordering::SeqCst);

        let service = Arc::downgrade(self);
        let delay = self.idle_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = service.upgrade() {
                service.on_idle();
            }
        });

        if let Some(previous) = self.idle_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
        }
    }

    fn on_idle(&self) {
        // Open connections keep the service alive; closing the last one restarts the timer
        if self.open_connections() > 0 {
            debug!(service = %self.label(), connections = self.open_connections(), "Idle timer ignored");
            return;
        }

        self.inactive.store(true, Ordering::SeqCst);
        debug!(service = %self.label(), "Inactivity delay elapsed");
        if let Some(listener) = self.idle_listener.lock().take() {
            let _ = listener.send(());
        }
    }

    fn current_runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .clone()
            .ok_or_else(|| Error::Unavailable(self.label()))
    }

    /// Serve a request. The service must be ACTIVE.
    pub async fn handle_request(self: &Arc<Self>, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let runtime = self.current_runtime()?;
        self.touch();
        runtime.environment.handle_request(req).await
    }

    /// Hand an upgrade to the environment. The connection counts as open
    /// until the environment lets go of it.
    pub async fn handle_upgrade(self: &Arc<Self>, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let runtime = self.current_runtime()?;
        let guard = ConnectionGuard::open(self);
        runtime.environment.handle_upgrade(req, guard).await
    }
}

/// Counts one open upgraded connection for as long as it lives
pub struct ConnectionGuard {
    service: Arc<Microservice>,
}

impl ConnectionGuard {
    pub fn open(service: &Arc<Microservice>) -> Self {
        service.open_connections.fetch_add(1, Ordering::SeqCst);
        service.touch();
        Self {
            service: Arc::clone(service),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.service.open_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.service.touch();
        }
    }
}
