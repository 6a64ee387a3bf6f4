//! Sources resolve a microservice's code to a directory before startup.

use crate::config::SourceConfig;
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Directories sources resolve against
#[derive(Debug, Clone)]
pub struct SourceRoots {
    /// Canonical code root (`local` sources point inside it)
    pub projects_dir: PathBuf,
    /// Root for isolated working copies
    pub workspace_dir: PathBuf,
}

/// Where a microservice's code comes from
#[derive(Debug)]
pub enum Source {
    /// `local`: serve the canonical directory as-is
    Direct { dir: PathBuf },
    /// `safe-local`: copy the canonical directory into a private working copy
    CopyOnFetch {
        canonical: PathBuf,
        workdir: PathBuf,
        fetched: bool,
    },
}

impl Source {
    /// Build the source named by `config.kind`
    pub fn from_config(config: &SourceConfig, roots: &SourceRoots, scope: &str) -> Result<Self> {
        match config.kind.as_str() {
            "local" => Self::direct(config, roots),
            "safe-local" => Self::copy_on_fetch(config, roots, scope),
            other => Err(Error::config(format!("Source kind not found: {}", other))),
        }
    }

    fn direct(config: &SourceConfig, roots: &SourceRoots) -> Result<Self> {
        Ok(Source::Direct {
            dir: roots.projects_dir.join(relative_src(&config.src)?),
        })
    }

    fn copy_on_fetch(config: &SourceConfig, roots: &SourceRoots, scope: &str) -> Result<Self> {
        let src = relative_src(&config.src)?;
        Ok(Source::CopyOnFetch {
            canonical: roots.projects_dir.join(src),
            workdir: roots.workspace_dir.join(relative_src(scope)?),
            fetched: false,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Source::Direct { .. } => "local",
            Source::CopyOnFetch { .. } => "safe-local",
        }
    }

    /// Resolved working directory, available once `fetch` succeeded
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Source::Direct { dir } => Some(dir.as_path()),
            Source::CopyOnFetch { workdir, fetched: true, .. } => Some(workdir.as_path()),
            Source::CopyOnFetch { .. } => None,
        }
    }

    /// Obtain the code and return the directory it lives in
    pub async fn fetch(&mut self) -> Result<PathBuf> {
        match self {
            Source::Direct { dir } => {
                if !tokio::fs::metadata(&*dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                    return Err(Error::config(format!(
                        "Source directory does not exist: {}",
                        dir.display()
                    )));
                }
                Ok(dir.clone())
            }
            Source::CopyOnFetch {
                canonical,
                workdir,
                fetched,
            } => {
                // A stale copy from an earlier activation would keep deleted files
                remove_dir_if_exists(workdir).await?;
                copy_dir_all(canonical, workdir).await?;
                *fetched = true;
                debug!(from = %canonical.display(), to = %workdir.display(), "Source copied");
                Ok(workdir.clone())
            }
        }
    }

    /// Remove fetched artifacts. Safe to call repeatedly or before `fetch`.
    pub async fn clear(&mut self) {
        if let Source::CopyOnFetch { workdir, fetched, .. } = self {
            if let Err(e) = remove_dir_if_exists(workdir).await {
                warn!(dir = %workdir.display(), error = %e, "Failed to clear working copy");
            }
            *fetched = false;
        }
    }
}

/// Accept only plain relative paths so a source can never escape its root
fn relative_src(src: &str) -> Result<PathBuf> {
    let path = Path::new(src);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::config(format!("Source path must stay inside its root: '{}'", src)));
    }
    Ok(path.to_path_buf())
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively copy `from` into `to`
pub async fn copy_dir_all(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(base: &Path) -> SourceRoots {
        SourceRoots {
            projects_dir: base.join("local"),
            workspace_dir: base.join("temp"),
        }
    }

    #[test]
    fn test_unknown_kind_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig {
            kind: "ftp".to_string(),
            src: "x".to_string(),
        };
        let err = Source::from_config(&config, &roots(dir.path()), "p/s").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("Source kind not found: ftp")));
    }

    #[test]
    fn test_source_path_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig::local("../secrets");
        assert!(matches!(
            Source::from_config(&config, &roots(dir.path()), "p/s"),
            Err(Error::Config(_))
        ));
        let config = SourceConfig::local("/etc");
        assert!(Source::from_config(&config, &roots(dir.path()), "p/s").is_err());
    }

    #[tokio::test]
    async fn test_direct_source_resolves_canonical_dir() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        std::fs::create_dir_all(roots.projects_dir.join("site")).unwrap();

        let mut source = Source::from_config(&SourceConfig::local("site"), &roots, "demo/web").unwrap();
        assert_eq!(source.kind(), "local");

        let resolved = source.fetch().await.unwrap();
        assert_eq!(resolved, roots.projects_dir.join("site"));
        assert_eq!(source.dir(), Some(resolved.as_path()));

        // Nothing to isolate, so clearing leaves the canonical copy alone
        source.clear().await;
        assert!(resolved.exists());
    }

    #[tokio::test]
    async fn test_direct_source_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            Source::from_config(&SourceConfig::local("nope"), &roots(dir.path()), "demo/web").unwrap();
        assert!(matches!(source.fetch().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_copy_on_fetch_isolates_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        let canonical = roots.projects_dir.join("app");
        std::fs::create_dir_all(canonical.join("public")).unwrap();
        std::fs::write(canonical.join("index.html"), "hello").unwrap();
        std::fs::write(canonical.join("public/app.js"), "js").unwrap();

        let mut source =
            Source::from_config(&SourceConfig::safe_local("app"), &roots, "demo/web").unwrap();
        assert!(source.dir().is_none());

        let workdir = source.fetch().await.unwrap();
        assert_eq!(workdir, roots.workspace_dir.join("demo/web"));
        assert_eq!(std::fs::read_to_string(workdir.join("index.html")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(workdir.join("public/app.js")).unwrap(), "js");

        // Writes to the working copy never reach the canonical one
        std::fs::write(workdir.join("index.html"), "changed").unwrap();
        assert_eq!(std::fs::read_to_string(canonical.join("index.html")).unwrap(), "hello");

        source.clear().await;
        assert!(!workdir.exists());
        assert!(canonical.exists());
        assert!(source.dir().is_none());
    }

    #[tokio::test]
    async fn test_copy_on_fetch_refetch_drops_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        let canonical = roots.projects_dir.join("app");
        std::fs::create_dir_all(&canonical).unwrap();
        std::fs::write(canonical.join("a.txt"), "a").unwrap();

        let mut source =
            Source::from_config(&SourceConfig::safe_local("app"), &roots, "demo/web").unwrap();
        let workdir = source.fetch().await.unwrap();
        std::fs::write(workdir.join("stale.txt"), "old").unwrap();

        source.fetch().await.unwrap();
        assert!(workdir.join("a.txt").exists());
        assert!(!workdir.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_clear_before_fetch_and_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            Source::from_config(&SourceConfig::safe_local("app"), &roots(dir.path()), "demo/web")
                .unwrap();
        source.clear().await;
        source.clear().await;
        assert!(source.dir().is_none());
    }

    #[tokio::test]
    async fn test_copy_on_fetch_missing_canonical_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            Source::from_config(&SourceConfig::safe_local("missing"), &roots(dir.path()), "demo/web")
                .unwrap();
        assert!(matches!(source.fetch().await, Err(Error::Io(_))));
    }
}
