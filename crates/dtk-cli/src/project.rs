//! Project model: the project file, profiles, and metric declarations.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use dtk_common::{interpolate_env, Error, MetricConfig, ProfilesFile, Result};

pub const PROJECT_FILE: &str = "driftkit_project.yml";

/// `driftkit_project.yml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    pub name: String,
    #[serde(default = "default_metrics_dir")]
    pub metrics_dir: PathBuf,
    #[serde(default = "default_profiles_file")]
    pub profiles_file: PathBuf,
}

fn default_metrics_dir() -> PathBuf {
    PathBuf::from("metrics")
}

fn default_profiles_file() -> PathBuf {
    PathBuf::from("profiles.yml")
}

/// A fully loaded project: profiles plus every metric declaration
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub file: ProjectFile,
    pub profiles: ProfilesFile,
    pub metrics: Vec<MetricConfig>,
}

impl Project {
    pub fn load(root: &Path) -> Result<Project> {
        let project_path = root.join(PROJECT_FILE);
        let raw = std::fs::read_to_string(&project_path).map_err(|e| {
            Error::Configuration(format!(
                "cannot read {} (is this a driftkit project?): {}",
                project_path.display(),
                e
            ))
        })?;
        let file: ProjectFile = serde_yaml::from_str(&interpolate_env(&raw)?)
            .map_err(|e| Error::Configuration(format!("invalid project file: {}", e)))?;

        let profiles = ProfilesFile::from_yaml_file(&root.join(&file.profiles_file))?;
        let metrics = load_metrics(&root.join(&file.metrics_dir))?;

        Ok(Project {
            root: root.to_path_buf(),
            file,
            profiles,
            metrics,
        })
    }

    pub fn metric_by_name(&self, name: &str) -> Result<&MetricConfig> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::Configuration(format!("metric '{}' is not declared", name)))
    }
}

fn load_metrics(metrics_dir: &Path) -> Result<Vec<MetricConfig>> {
    if !metrics_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "metrics directory {} does not exist",
            metrics_dir.display()
        )));
    }
    let mut paths = Vec::new();
    for extension in ["yml", "yaml"] {
        let pattern = format!("{}/**/*.{}", metrics_dir.display(), extension);
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Configuration(format!("bad metrics pattern: {}", e)))?;
        for entry in entries {
            let path =
                entry.map_err(|e| Error::Configuration(format!("cannot list metrics: {}", e)))?;
            paths.push(path);
        }
    }
    paths.sort();

    let mut metrics = Vec::with_capacity(paths.len());
    for path in paths {
        let metric = MetricConfig::from_yaml_file(&path)?;
        if metrics.iter().any(|m: &MetricConfig| m.name == metric.name) {
            return Err(Error::Configuration(format!(
                "metric '{}' is declared more than once ({})",
                metric.name,
                path.display()
            )));
        }
        metrics.push(metric);
    }
    Ok(metrics)
}
