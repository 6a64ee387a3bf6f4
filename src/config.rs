use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for microservices
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Projects declared inline
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base domain every project is hosted under (default: localhost)
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Optional fixed subdomain between the project label and the base domain
    pub subdomain: Option<String>,

    /// Hold all dispatch until the project registry has been loaded (default: true)
    #[serde(default = "default_halt_while_loading")]
    pub halt_while_loading: bool,

    /// Open the load barrier after this long even if loading never finished
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Canonical root that source paths are resolved against
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,

    /// Root for isolated working copies (wiped at startup)
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// TOML file holding `[[projects]]`, loaded after the listener is up
    pub projects_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Number of leading host labels (most significant first) that belong to the
    /// infrastructure rather than to a project
    pub fn subdomain_offset(&self) -> usize {
        let labels = |s: &str| s.split('.').filter(|l| !l.is_empty()).count();
        labels(&self.base_domain) + self.subdomain.as_deref().map(labels).unwrap_or(0)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            base_domain: default_base_domain(),
            subdomain: None,
            halt_while_loading: default_halt_while_loading(),
            load_timeout_secs: default_load_timeout(),
            projects_dir: default_projects_dir(),
            workspace_dir: default_workspace_dir(),
            projects_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Inactivity delay in seconds before a microservice is offered for shutdown
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long a process-backed environment may take to open its port
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Max time to wait for a proxied backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// First port handed to process-backed environments
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port (inclusive) handed to process-backed environments
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Maximum idle pooled connections per backend
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServiceDefaults {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Wrapper for a standalone projects file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProjectsFile {
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl ProjectsFile {
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ProjectConfig>> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: ProjectsFile = toml::from_str(&content)?;
        Ok(file.projects)
    }
}

/// One tenant: an id (the host label) and its microservices
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub id: String,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single microservice
///
/// # Security Warning
///
/// The `nodejs-web` environment runs the configured `install` and `start`
/// commands with the permissions of the router process. Project configuration
/// must come from trusted sources only.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub id: String,

    /// Routing pattern (e.g. `api`, `app.*`, `@`); absent means not routable.
    ///
    /// Patterns are written most significant label first, the reverse of
    /// host order. Host `x.app.demo.example.com` in project `demo` yields the
    /// query `app.x`, so `app.*` matches it while `*.app` does not. `@` is the
    /// project root (`demo.example.com`).
    #[serde(default, rename = "match")]
    pub match_pattern: Option<String>,

    /// Ids of microservices that must be active before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub source: SourceConfig,

    pub environment: EnvironmentConfig,

    /// Inactivity delay in seconds (overrides default)
    pub idle_timeout_secs: Option<u64>,

    /// Port readiness timeout in seconds (overrides default)
    pub startup_timeout_secs: Option<u64>,
}

impl ServiceConfig {
    /// Create a service config from its source and environment
    pub fn new(id: &str, source: SourceConfig, environment: EnvironmentConfig) -> Self {
        Self {
            id: id.to_string(),
            match_pattern: None,
            dependencies: Vec::new(),
            source,
            environment,
            idle_timeout_secs: None,
            startup_timeout_secs: None,
        }
    }

    /// Set the match pattern (builder pattern)
    pub fn with_match(mut self, pattern: &str) -> Self {
        self.match_pattern = Some(pattern.to_string());
        self
    }

    /// Set dependencies (builder pattern)
    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn idle_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs))
    }

    pub fn startup_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs))
    }
}

/// Where a microservice's code comes from
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `local` or `safe-local`
    pub kind: String,

    /// Code path relative to the projects directory
    #[serde(default)]
    pub src: String,
}

impl SourceConfig {
    pub fn local(src: &str) -> Self {
        Self {
            kind: "local".to_string(),
            src: src.to_string(),
        }
    }

    pub fn safe_local(src: &str) -> Self {
        Self {
            kind: "safe-local".to_string(),
            src: src.to_string(),
        }
    }
}

/// How a microservice's code runs
#[derive(Debug, Deserialize, Clone)]
pub struct EnvironmentConfig {
    /// `static-web` or `nodejs-web`
    pub kind: String,

    /// Start command (nodejs-web, default `npm start`)
    pub start: Option<String>,

    /// Install command run to completion before start (nodejs-web, default
    /// `npm install`, empty string skips)
    pub install: Option<String>,

    /// Extra environment variables for the process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl EnvironmentConfig {
    pub fn static_web() -> Self {
        Self {
            kind: "static-web".to_string(),
            start: None,
            install: None,
            env: HashMap::new(),
        }
    }

    pub fn nodejs_web(start: &str) -> Self {
        Self {
            kind: "nodejs-web".to_string(),
            start: Some(start.to_string()),
            install: None,
            env: HashMap::new(),
        }
    }

    /// Set the install command (builder pattern)
    pub fn with_install(mut self, install: &str) -> Self {
        self.install = Some(install.to_string());
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_halt_while_loading() -> bool {
    true
}

fn default_load_timeout() -> u64 {
    10
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("./projects/local")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./projects/temp")
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_request_timeout() -> u64 {
    30
}

fn default_port_range_start() -> u16 {
    3000
}

fn default_port_range_end() -> u16 {
    3999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate server settings and inline projects.
    ///
    /// Kind strings and the dependency graph are checked again by
    /// `Project::new`; this pass only catches what can be caught statically.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.base_domain.trim_matches('.').is_empty() {
            errors.push("server.base_domain must not be empty".to_string());
        }

        if self.defaults.port_range_start == 0
            || self.defaults.port_range_start > self.defaults.port_range_end
        {
            errors.push(format!(
                "defaults: invalid port range {}..={}",
                self.defaults.port_range_start, self.defaults.port_range_end
            ));
        }

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if !project_ids.insert(project.id.as_str()) {
                errors.push(format!("Project '{}' is declared twice", project.id));
            }
            if let Err(e) = project.validate() {
                errors.extend(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl ProjectConfig {
    /// Static checks on a single project, all problems reported together
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.is_empty() || self.id.contains('.') {
            errors.push(format!("Project '{}': id must be a single host label", self.id));
        }

        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id.as_str()) {
                errors.push(format!(
                    "Project '{}': service '{}' is declared twice",
                    self.id, service.id
                ));
            }
            if service.source.kind.is_empty() {
                errors.push(format!(
                    "Project '{}': service '{}' has no source kind",
                    self.id, service.id
                ));
            }
            let mut dependencies = HashSet::new();
            for dependency in &service.dependencies {
                if !dependencies.insert(dependency.as_str()) {
                    errors.push(format!(
                        "Project '{}': service '{}' lists dependency '{}' more than once",
                        self.id, service.id, dependency
                    ));
                }
            }
            if service.environment.kind.is_empty() {
                errors.push(format!(
                    "Project '{}': service '{}' has no environment kind",
                    self.id, service.id
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
