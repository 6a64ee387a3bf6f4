//! A project groups the microservices served under one host label and owns
//! their dependency graph.
//!
//! Launching a microservice first launches everything it depends on.
//! Shutting one down (after its inactivity delay) cascades to its
//! dependencies, but only to those no live dependent still needs.

use crate::config::ProjectConfig;
use crate::context::RuntimeContext;
use crate::environment::EnvironmentKind;
use crate::error::{Error, Result};
use crate::matcher::{MatchPattern, MatchTable, ROOT_QUERY};
use crate::microservice::{Microservice, ServiceEvent, ServiceState};
use crate::source::Source;
use crate::ProxyBody;
use futures::future::{join_all, BoxFuture, FutureExt};
use hyper::{Request, Response};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Capacity of the state event channel
const EVENT_CAPACITY: usize = 256;

/// Point-in-time view of one microservice
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub project: String,
    pub service: String,
    pub state: ServiceState,
    pub inactive: bool,
    pub port: Option<u16>,
    pub open_connections: usize,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

pub struct Project {
    id: String,
    services: HashMap<String, Arc<Microservice>>,
    table: MatchTable,
    /// Dependents before their dependencies
    shutdown_order: Vec<String>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Project {
    /// Register every microservice of `config`.
    ///
    /// Dependencies may name services declared later in the list. Unknown
    /// dependencies, cycles and unknown kinds are configuration errors.
    pub fn new(config: &ProjectConfig, context: &RuntimeContext) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::config(errors.join("; ")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut project = Self {
            id: config.id.clone(),
            services: HashMap::new(),
            table: MatchTable::new(),
            shutdown_order: Vec::new(),
            events,
        };

        // Edges to dependencies that are not registered yet: dependency id -> dependents
        let mut pending: HashMap<String, Vec<String>> = HashMap::new();
        for service in &config.services {
            project.register(service.clone(), context, &mut pending)?;
        }

        if !pending.is_empty() {
            let mut missing: Vec<String> = pending
                .iter()
                .map(|(dependency, dependents)| {
                    format!("'{}' (needed by {})", dependency, dependents.join(", "))
                })
                .collect();
            missing.sort();
            return Err(Error::config(format!(
                "Project '{}': unknown dependencies {}",
                project.id,
                missing.join(", ")
            )));
        }

        project.shutdown_order = project.topological_order()?;
        debug!(project = %project.id, table = %project.table.describe(), "Match table built");
        info!(project = %project.id, services = project.services.len(), "Project registered");
        Ok(project)
    }

    fn register(
        &mut self,
        config: crate::config::ServiceConfig,
        context: &RuntimeContext,
        pending: &mut HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let id = config.id.clone();
        let label = format!("{}/{}", self.id, id);

        // Catch unknown kinds at registration rather than on first request
        Source::from_config(&config.source, &context.roots, &label)?;
        EnvironmentKind::from_tag(&config.environment.kind)?;

        if config.dependencies.iter().any(|d| *d == id) {
            return Err(Error::config(format!("Service '{}' depends on itself", label)));
        }

        let pattern = config
            .match_pattern
            .as_deref()
            .map(MatchPattern::compile)
            .transpose()?;

        let mut service = Microservice::new(&self.id, config, context.clone(), self.events.clone());

        if let Some(waiting) = pending.remove(&id) {
            for dependent in waiting {
                service.add_dependent(&dependent);
            }
        }

        for dependency in service.dependencies().to_vec() {
            match self.services.get_mut(&dependency) {
                Some(target) => Arc::get_mut(target)
                    .ok_or_else(|| Error::Internal(format!("'{}' is already shared", dependency)))?
                    .add_dependent(&id),
                None => pending.entry(dependency).or_default().push(id.clone()),
            }
        }

        if let Some(pattern) = pattern {
            self.table.insert(pattern, &id);
        }

        debug!(service = %label, "Microservice registered");
        self.services.insert(id, Arc::new(service));
        Ok(())
    }

    /// Kahn's algorithm over dependent -> dependency edges
    fn topological_order(&self) -> Result<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .services
            .values()
            .map(|s| (s.id(), s.dependents().len()))
            .collect();

        let mut ready: VecDeque<&str> = {
            let mut roots: Vec<&str> = remaining
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(id, _)| *id)
                .collect();
            roots.sort_unstable();
            roots.into_iter().collect()
        };

        let mut order = Vec::with_capacity(self.services.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            let dependencies: HashSet<&str> =
                self.services[id].dependencies().iter().map(String::as_str).collect();
            for dependency in dependencies {
                if let Some(count) = remaining.get_mut(dependency) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependency);
                    }
                }
            }
        }

        if order.len() != self.services.len() {
            let mut cyclic: Vec<&str> = remaining
                .iter()
                .filter(|(id, _)| !order.iter().any(|o| o == *id))
                .map(|(id, _)| *id)
                .collect();
            cyclic.sort_unstable();
            return Err(Error::config(format!(
                "Project '{}': dependency cycle between {}",
                self.id,
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self, id: &str) -> Option<&Arc<Microservice>> {
        self.services.get(id)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<Microservice>> {
        self.services.values()
    }

    /// Service ids, dependents before their dependencies
    pub fn shutdown_order(&self) -> &[String] {
        &self.shutdown_order
    }

    /// Receive every state transition of this project's microservices
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Build the routing query from the host labels below the infrastructure
    /// part, most significant first (`labels[0]` is the project id).
    pub fn routing_query<S: AsRef<str>>(labels: &[S]) -> String {
        let rest: Vec<&str> = labels.iter().skip(1).map(AsRef::as_ref).collect();
        if rest.is_empty() {
            ROOT_QUERY.to_string()
        } else {
            rest.join(".")
        }
    }

    /// The microservice routed to by `query`
    pub fn match_service(&self, query: &str) -> Result<&Arc<Microservice>> {
        let found = self.table.find(query).and_then(|id| self.services.get(id));
        debug!(project = %self.id, query, matched = ?found.map(|s| s.id()), "Routing query");
        found.ok_or_else(|| Error::ServiceNotFound {
            project: self.id.clone(),
            query: query.to_string(),
        })
    }

    pub async fn handle_request<S: AsRef<str>>(
        self: &Arc<Self>,
        labels: &[S],
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>> {
        let service = Arc::clone(self.match_service(&Self::routing_query(labels))?);
        self.launch_service(&service).await?;
        service.handle_request(req).await
    }

    pub async fn handle_upgrade<S: AsRef<str>>(
        self: &Arc<Self>,
        labels: &[S],
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>> {
        let service = Arc::clone(self.match_service(&Self::routing_query(labels))?);
        self.launch_service(&service).await?;
        service.handle_upgrade(req).await
    }

    fn dependencies_of(&self, service: &Microservice) -> Vec<Arc<Microservice>> {
        service
            .dependencies()
            .iter()
            .filter_map(|id| self.services.get(id).cloned())
            .collect()
    }

    /// Launch every dependency (concurrently), then the service itself.
    /// The first dependency failure aborts the launch.
    ///
    /// An already ACTIVE service counts as used again, so a shutdown cascade
    /// still queued behind this launch leaves it running.
    pub fn launch_service<'a>(
        self: &'a Arc<Self>,
        service: &'a Arc<Microservice>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if service.state() == ServiceState::Active {
                service.touch();
            }

            let dependencies = self.dependencies_of(service);
            let results = join_all(dependencies.iter().map(|dep| self.launch_service(dep))).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                error!(service = %service.label(), error = %err, "Dependency failed to launch");
                return Err(err);
            }

            self.watch_inactivity(service);
            service.launch().await
        }
        .boxed()
    }

    /// Shut `service` down once its inactivity delay elapses
    fn watch_inactivity(self: &Arc<Self>, service: &Arc<Microservice>) {
        let idle = service.subscribe_inactivity();
        let project = Arc::downgrade(self);
        let service = Arc::clone(service);

        tokio::spawn(async move {
            // Err means a newer listener took over
            if idle.await.is_err() {
                return;
            }
            if let Some(project) = project.upgrade() {
                project.shutdown_service(&service).await;
            }
        });
    }

    /// Shut `service` down if nothing needs it any more, then offer the same
    /// to each of its dependencies.
    pub fn shutdown_service<'a>(self: &'a Arc<Self>, service: &'a Arc<Microservice>) -> BoxFuture<'a, ()> {
        async move {
            let dependents: Vec<Arc<Microservice>> = service
                .dependents()
                .iter()
                .filter_map(|id| self.services.get(id).cloned())
                .collect();

            match service.shutdown_if_idle(dependents).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => error!(service = %service.label(), error = %e, "Shutdown failed"),
            }

            let dependencies = self.dependencies_of(service);
            join_all(dependencies.iter().map(|dep| self.shutdown_service(dep))).await;
        }
        .boxed()
    }

    /// Stop every microservice regardless of traffic, dependents first
    pub async fn shutdown_all(&self) {
        for id in &self.shutdown_order {
            if let Some(service) = self.services.get(id) {
                if let Err(e) = service.shutdown().await {
                    error!(service = %service.label(), error = %e, "Shutdown failed");
                }
            }
        }
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        let mut status: Vec<ServiceStatus> = self
            .services
            .values()
            .map(|s| ServiceStatus {
                project: self.id.clone(),
                service: s.id().to_string(),
                state: s.state(),
                inactive: s.is_inactive(),
                port: s.port(),
                open_connections: s.open_connections(),
                dependencies: s.dependencies().to_vec(),
                dependents: s.dependents().to_vec(),
            })
            .collect();
        status.sort_by(|a, b| a.service.cmp(&b.service));
        status
    }
}
