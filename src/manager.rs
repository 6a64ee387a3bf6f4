//! Project registry and host-based dispatch.
//!
//! The manager maps the project label of a request's host to a [`Project`].
//! While projects are still being loaded it can hold dispatch behind a load
//! barrier so early requests are not answered with "project not found".

use crate::config::{ProjectConfig, ServerConfig};
use crate::context::RuntimeContext;
use crate::error::{settle, Dispatch, Error, Result};
use crate::project::{Project, ServiceStatus};
use crate::ProxyBody;
use dashmap::DashMap;
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[derive(Default)]
struct LoadLatch {
    loaded: bool,
    /// Released in arrival order
    waiters: Vec<oneshot::Sender<()>>,
}

pub struct ProjectManager {
    projects: DashMap<String, Arc<Project>>,
    context: RuntimeContext,
    /// Infrastructure labels (base domain, then subdomain), most significant first
    infrastructure: Vec<String>,
    halt_while_loading: bool,
    latch: Mutex<LoadLatch>,
}

impl ProjectManager {
    /// Returns `Arc<Self>`: the manager is shared by every connection task.
    pub fn new(server: &ServerConfig, context: RuntimeContext) -> Arc<Self> {
        let mut infrastructure = host_labels(&server.base_domain);
        if let Some(subdomain) = &server.subdomain {
            infrastructure.extend(host_labels(subdomain));
        }
        debug_assert_eq!(infrastructure.len(), server.subdomain_offset());

        Arc::new(Self {
            projects: DashMap::new(),
            context,
            infrastructure,
            halt_while_loading: server.halt_while_loading,
            latch: Mutex::new(LoadLatch::default()),
        })
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    /// Register one project, replacing nothing: a duplicate id is an error
    pub fn add_project(&self, config: &ProjectConfig) -> Result<Arc<Project>> {
        if self.projects.contains_key(&config.id) {
            return Err(Error::config(format!("Project '{}' is already registered", config.id)));
        }

        let project = Arc::new(Project::new(config, &self.context)?);
        self.projects.insert(config.id.clone(), Arc::clone(&project));
        Ok(project)
    }

    /// Register a batch of projects. Every project is attempted; failures are
    /// logged and reported together. With `mark_loaded` the load barrier
    /// opens afterwards even if some projects failed.
    pub fn add_projects<I>(&self, configs: I, mark_loaded: bool) -> Result<()>
    where
        I: IntoIterator<Item = ProjectConfig>,
    {
        let mut failures = Vec::new();
        for config in configs {
            if let Err(e) = self.add_project(&config) {
                error!(project = %config.id, error = %e, "Failed to register project");
                failures.push(format!("{}: {}", config.id, e));
            }
        }

        info!(projects = self.projects.len(), failed = failures.len(), "Projects loaded");

        if mark_loaded {
            self.set_loaded(true);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::config(failures.join("; ")))
        }
    }

    pub fn project(&self, id: &str) -> Option<Arc<Project>> {
        self.projects.get(id).map(|p| Arc::clone(p.value()))
    }

    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_loaded(&self) -> bool {
        self.latch.lock().loaded
    }

    /// Open or close the load barrier. Opening releases every waiter.
    pub fn set_loaded(&self, loaded: bool) {
        let waiters = {
            let mut latch = self.latch.lock();
            latch.loaded = loaded;
            if loaded {
                std::mem::take(&mut latch.waiters)
            } else {
                Vec::new()
            }
        };

        if loaded && !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Releasing requests held while loading");
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Resolve once projects are loaded. Immediate when the barrier is open
    /// or disabled.
    pub async fn wait_load(&self) {
        if !self.halt_while_loading {
            return;
        }

        let rx = {
            let mut latch = self.latch.lock();
            if latch.loaded {
                return;
            }
            let (tx, rx) = oneshot::channel();
            latch.waiters.push(tx);
            rx
        };

        // The sender only goes away with the manager
        let _ = rx.await;
    }

    /// Split `host` into the project-relative labels, most significant first.
    /// `None` when the host does not sit under the base domain or names no
    /// project.
    pub fn project_labels(&self, host: &str) -> Option<Vec<String>> {
        let labels = host_labels(host);
        if labels.len() <= self.infrastructure.len() {
            return None;
        }

        let (infrastructure, rest) = labels.split_at(self.infrastructure.len());
        if infrastructure != self.infrastructure.as_slice() {
            return None;
        }

        Some(rest.to_vec())
    }

    async fn route(&self, host: &str) -> Result<(Arc<Project>, Vec<String>)> {
        self.wait_load().await;

        let labels = self
            .project_labels(host)
            .ok_or_else(|| Error::ProjectNotFound(host.to_string()))?;
        let project = self
            .project(&labels[0])
            .ok_or_else(|| Error::ProjectNotFound(labels[0].clone()))?;
        Ok((project, labels))
    }

    /// Dispatch a plain request. Always produces a response.
    pub async fn dispatch_request(&self, host: &str, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let result = match self.route(host).await {
            Ok((project, labels)) => project.handle_request(&labels, req).await,
            Err(e) => Err(e),
        };

        match settle(Dispatch::Request, result) {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    /// Dispatch an upgrade request. An error means the connection must be
    /// dropped.
    pub async fn dispatch_upgrade(&self, host: &str, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let result = match self.route(host).await {
            Ok((project, labels)) => project.handle_upgrade(&labels, req).await,
            Err(e) => Err(e),
        };
        settle(Dispatch::Upgrade, result)
    }

    /// Stop every microservice of every project
    pub async fn stop_all(&self) {
        let projects: Vec<Arc<Project>> = self.projects.iter().map(|e| Arc::clone(e.value())).collect();
        for project in projects {
            info!(project = %project.id(), "Stopping project");
            project.shutdown_all().await;
        }
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        let mut status: Vec<ServiceStatus> = self
            .projects
            .iter()
            .flat_map(|e| e.value().status())
            .collect();
        status.sort_by(|a, b| (&a.project, &a.service).cmp(&(&b.project, &b.service)));
        status
    }
}

/// Host labels, most significant first, lowercased
fn host_labels(host: &str) -> Vec<String> {
    host.split('.')
        .filter(|l| !l.is_empty())
        .rev()
        .map(str::to_lowercase)
        .collect()
}
