//! Process-wide resources shared by every project and microservice

use crate::config::{Config, ServiceDefaults};
use crate::pool::PoolConfig;
use crate::ports::PortAllocator;
use crate::source::SourceRoots;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub roots: SourceRoots,
    pub defaults: ServiceDefaults,
    pub ports: Arc<PortAllocator>,
}

impl RuntimeContext {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.server.projects_dir,
            &config.server.workspace_dir,
            config.defaults.clone(),
        )
    }

    pub fn new(projects_dir: &Path, workspace_dir: &Path, defaults: ServiceDefaults) -> Self {
        let ports = PortAllocator::new(defaults.port_range_start..=defaults.port_range_end);
        Self {
            roots: SourceRoots {
                projects_dir: projects_dir.to_path_buf(),
                workspace_dir: workspace_dir.to_path_buf(),
            },
            defaults,
            ports,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from_defaults(&self.defaults)
    }
}
