//! Environments run a microservice's fetched code and answer its traffic.
//!
//! * `static-web` serves files straight from the working directory.
//! * `nodejs-web` runs an install step, spawns the start command with a
//!   freshly allocated `PORT`, waits for that port to accept connections and
//!   proxies to it.

use crate::config::EnvironmentConfig;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::executor::{ProcessExecutor, RunningProcess};
use crate::pool::{BackendClient, PoolConfig};
use crate::ports::{PortAllocator, PortLease};
use crate::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const DEFAULT_INSTALL_COMMAND: &str = "npm install";
const DEFAULT_START_COMMAND: &str = "npm start";

/// Interval between readiness probes of a starting process
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Environment kinds accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    StaticWeb,
    NodejsWeb,
}

impl EnvironmentKind {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "static-web" => Ok(EnvironmentKind::StaticWeb),
            "nodejs-web" => Ok(EnvironmentKind::NodejsWeb),
            other => Err(Error::config(format!("Environment kind not found: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::StaticWeb => "static-web",
            EnvironmentKind::NodejsWeb => "nodejs-web",
        }
    }
}

pub enum Environment {
    Static(StaticSite),
    Process(ProcessBacked),
}

impl Environment {
    /// Build the environment named by `config.kind` around `workdir`
    pub fn from_config(
        config: &EnvironmentConfig,
        workdir: &Path,
        context: &RuntimeContext,
        startup_timeout: Duration,
        label: &str,
    ) -> Result<Self> {
        match EnvironmentKind::from_tag(&config.kind)? {
            EnvironmentKind::StaticWeb => Ok(Environment::Static(StaticSite::new(workdir, label))),
            EnvironmentKind::NodejsWeb => Ok(Environment::Process(ProcessBacked::new(
                config,
                workdir,
                context,
                startup_timeout,
                label,
            ))),
        }
    }

    pub fn kind(&self) -> EnvironmentKind {
        match self {
            Environment::Static(_) => EnvironmentKind::StaticWeb,
            Environment::Process(_) => EnvironmentKind::NodejsWeb,
        }
    }

    /// Port the backend listens on, once started
    pub fn port(&self) -> Option<u16> {
        match self {
            Environment::Static(_) => None,
            Environment::Process(process) => process.port(),
        }
    }

    /// Bring the environment up. On failure everything it started is torn down.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Environment::Static(_) => Ok(()),
            Environment::Process(process) => process.start().await,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self {
            Environment::Static(_) => Ok(()),
            Environment::Process(process) => process.shutdown().await,
        }
    }

    pub async fn handle_request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        match self {
            Environment::Static(site) => site.serve(&req).await,
            Environment::Process(process) => process.client()?.forward(req).await,
        }
    }

    /// Take over an upgraded connection. `hold` lives as long as the connection.
    pub async fn handle_upgrade<H>(&self, req: Request<ProxyBody>, hold: H) -> Result<Response<ProxyBody>>
    where
        H: Send + 'static,
    {
        match self {
            Environment::Static(site) => Err(Error::UpgradeUnsupported(site.label.clone())),
            Environment::Process(process) => process.client()?.upgrade(req, hold).await,
        }
    }
}

/// Serves files from a directory
pub struct StaticSite {
    root: PathBuf,
    label: String,
}

impl StaticSite {
    pub fn new(root: &Path, label: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            label: label.to_string(),
        }
    }

    async fn serve(&self, req: &Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let Some(path) = resolve_static_path(&self.root, req.uri().path()) else {
            return Ok(not_found());
        };

        let path = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => path.join("index.html"),
            Ok(_) => path,
            Err(_) => return Ok(not_found()),
        };

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(not_found()),
            Err(e) => return Err(e.into()),
        };

        debug!(service = %self.label, path = %path.display(), bytes = contents.len(), "Serving static file");

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type(&path))
            .body(Full::new(Bytes::from(contents)).map_err(|never| match never {}).boxed())
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Map a request path onto `root`. `None` for paths that try to leave it.
fn resolve_static_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(uri_path).ok()?;
    let mut path = root.to_path_buf();

    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') => return None,
            s => {
                // A segment like "C:" would replace the whole path on some platforms
                if !matches!(Path::new(s).components().next(), Some(Component::Normal(_))) {
                    return None;
                }
                path.push(s);
            }
        }
    }

    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"Not Found"))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Runs the microservice as a local process and proxies to it
pub struct ProcessBacked {
    start_command: String,
    install_command: Option<String>,
    env: HashMap<String, String>,
    workdir: PathBuf,
    startup_timeout: Duration,
    grace_period: Duration,
    pool: PoolConfig,
    ports: Arc<PortAllocator>,
    label: String,
    lease: Option<PortLease>,
    client: Option<BackendClient>,
    process: tokio::sync::Mutex<Option<RunningProcess>>,
}

impl ProcessBacked {
    fn new(
        config: &EnvironmentConfig,
        workdir: &Path,
        context: &RuntimeContext,
        startup_timeout: Duration,
        label: &str,
    ) -> Self {
        let install_command = match config.install.as_deref() {
            None => Some(DEFAULT_INSTALL_COMMAND.to_string()),
            Some(cmd) if cmd.trim().is_empty() => None,
            Some(cmd) => Some(cmd.to_string()),
        };

        Self {
            start_command: config
                .start
                .clone()
                .unwrap_or_else(|| DEFAULT_START_COMMAND.to_string()),
            install_command,
            env: config.env.clone(),
            workdir: workdir.to_path_buf(),
            startup_timeout,
            grace_period: context.defaults.shutdown_grace_period(),
            pool: context.pool_config(),
            ports: Arc::clone(&context.ports),
            label: label.to_string(),
            lease: None,
            client: None,
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.lease.as_ref().map(PortLease::port)
    }

    fn client(&self) -> Result<&BackendClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Unavailable(self.label.clone()))
    }

    async fn start(&mut self) -> Result<()> {
        let lease = self.ports.allocate()?;
        let port = lease.port();
        let client = BackendClient::new(Some(port), self.pool.clone(), &self.label)?;

        let mut env = self.env.clone();
        env.insert("PORT".to_string(), port.to_string());
        let executor = ProcessExecutor::new(&self.workdir, env, &self.label);

        if let Some(install) = &self.install_command {
            executor.run(install).await?;
        }

        let mut process = executor.spawn(&self.start_command)?;
        if let Err(e) = self.wait_for_port(port, &mut process).await {
            if let Err(term_err) = process.terminate(self.grace_period).await {
                warn!(service = %self.label, error = %term_err, "Failed to stop process after failed start");
            }
            return Err(e);
        }

        info!(service = %self.label, port, "Process is accepting connections");
        *self.process.get_mut() = Some(process);
        self.lease = Some(lease);
        self.client = Some(client);
        Ok(())
    }

    async fn wait_for_port(&self, port: u16, process: &mut RunningProcess) -> Result<()> {
        let started = Instant::now();

        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                debug!(service = %self.label, port, elapsed_ms = started.elapsed().as_millis(), "Port is open");
                return Ok(());
            }

            if let Some(status) = process.try_exited() {
                return Err(Error::activation(
                    &self.label,
                    format!("process exited with {} before opening port {}", status, port),
                ));
            }

            if started.elapsed() >= self.startup_timeout {
                return Err(Error::activation(
                    &self.label,
                    format!(
                        "port {} not open after {}ms",
                        port,
                        self.startup_timeout.as_millis()
                    ),
                ));
            }

            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let process = self.process.lock().await.take();
        match process {
            Some(process) => process.terminate(self.grace_period).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDefaults;

    fn context(base: &Path, ports: (u16, u16)) -> RuntimeContext {
        let mut defaults = ServiceDefaults::default();
        defaults.port_range_start = ports.0;
        defaults.port_range_end = ports.1;
        defaults.shutdown_grace_period_secs = 1;
        RuntimeContext::new(&base.join("local"), &base.join("temp"), defaults)
    }

    fn request(path: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(path)
            .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_environment_kinds() {
        assert_eq!(EnvironmentKind::from_tag("static-web").unwrap(), EnvironmentKind::StaticWeb);
        assert_eq!(EnvironmentKind::from_tag("nodejs-web").unwrap().as_str(), "nodejs-web");
        let err = EnvironmentKind::from_tag("php").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("Environment kind not found: php")));
    }

    #[test]
    fn test_resolve_static_path() {
        let root = Path::new("/srv/site");
        assert_eq!(resolve_static_path(root, "/"), Some(PathBuf::from("/srv/site")));
        assert_eq!(
            resolve_static_path(root, "/css/app.css"),
            Some(PathBuf::from("/srv/site/css/app.css"))
        );
        assert_eq!(
            resolve_static_path(root, "/my%20file.txt"),
            Some(PathBuf::from("/srv/site/my file.txt"))
        );
        assert_eq!(resolve_static_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_static_path(root, "/a/%2e%2e/%2e%2e/etc"), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("app.JS")), "application/javascript; charset=utf-8");
        assert_eq!(content_type(Path::new("logo.png")), "image/png");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_static_site_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();

        let ctx = context(dir.path(), (42000, 42010));
        let mut env = Environment::from_config(
            &EnvironmentConfig::static_web(),
            dir.path(),
            &ctx,
            Duration::from_secs(1),
            "demo/site",
        )
        .unwrap();
        env.start().await.unwrap();
        assert_eq!(env.kind(), EnvironmentKind::StaticWeb);
        assert_eq!(env.port(), None);

        let response = env.handle_request(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(body_string(response).await, "<h1>home</h1>");

        let response = env.handle_request(request("/docs")).await.unwrap();
        assert_eq!(body_string(response).await, "docs");

        let response = env.handle_request(request("/style.css?v=2")).await.unwrap();
        assert_eq!(response.headers().get("content-type").unwrap(), "text/css; charset=utf-8");

        let response = env.handle_request(request("/missing.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = env.handle_request(request("/../secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        env.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_site_rejects_upgrades() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42000, 42010));
        let env = Environment::from_config(
            &EnvironmentConfig::static_web(),
            dir.path(),
            &ctx,
            Duration::from_secs(1),
            "demo/site",
        )
        .unwrap();

        let result = env.handle_upgrade(request("/ws"), ()).await;
        assert!(matches!(result, Err(Error::UpgradeUnsupported(_))));
    }

    #[test]
    fn test_process_backed_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42000, 42010));
        let config = EnvironmentConfig {
            kind: "nodejs-web".to_string(),
            start: None,
            install: None,
            env: HashMap::new(),
        };
        let Environment::Process(process) =
            Environment::from_config(&config, dir.path(), &ctx, Duration::from_secs(1), "demo/api")
                .unwrap()
        else {
            panic!("expected a process-backed environment");
        };
        assert_eq!(process.start_command, "npm start");
        assert_eq!(process.install_command.as_deref(), Some("npm install"));
        assert!(process.port().is_none());

        let config = EnvironmentConfig::nodejs_web("node index.js").with_install("");
        let Environment::Process(process) =
            Environment::from_config(&config, dir.path(), &ctx, Duration::from_secs(1), "demo/api")
                .unwrap()
        else {
            panic!("expected a process-backed environment");
        };
        assert_eq!(process.start_command, "node index.js");
        assert!(process.install_command.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_early_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42100, 42110));
        let config = EnvironmentConfig::nodejs_web("sh -c 'exit 3'").with_install("");
        let mut env =
            Environment::from_config(&config, dir.path(), &ctx, Duration::from_secs(10), "demo/api")
                .unwrap();

        let started = Instant::now();
        let err = env.start().await.unwrap_err();
        assert!(matches!(err, Error::Activation { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(ctx.ports.in_use(), 0);
        assert!(env.port().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42200, 42210));
        let config = EnvironmentConfig::nodejs_web("sleep 30").with_install("");
        let mut env = Environment::from_config(
            &config,
            dir.path(),
            &ctx,
            Duration::from_millis(300),
            "demo/api",
        )
        .unwrap();

        let started = Instant::now();
        let err = env.start().await.unwrap_err();
        assert!(matches!(err, Error::Activation { ref reason, .. } if reason.contains("not open")));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ctx.ports.in_use(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_install_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42300, 42310));
        let config = EnvironmentConfig::nodejs_web("sleep 30").with_install("false");
        let mut env =
            Environment::from_config(&config, dir.path(), &ctx, Duration::from_secs(5), "demo/api")
                .unwrap();

        assert!(matches!(env.start().await, Err(Error::Activation { .. })));
        assert_eq!(ctx.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_requests_before_start_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), (42400, 42410));
        let config = EnvironmentConfig::nodejs_web("sleep 30").with_install("");
        let env =
            Environment::from_config(&config, dir.path(), &ctx, Duration::from_secs(5), "demo/api")
                .unwrap();

        assert!(matches!(env.handle_request(request("/")).await, Err(Error::Unavailable(_))));
        env.shutdown().await.unwrap();
    }
}
