//! Metric selection: exact names, file-path globs, and `tag:` selectors.

use glob::Pattern;
use std::path::Path;

use dtk_common::{Error, MetricConfig, Result};

/// One `--select` / `--exclude` expression
#[derive(Debug, Clone)]
pub enum Selector {
    Name(String),
    Tag(String),
    PathGlob(Pattern),
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Selector> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Configuration("empty selector".to_string()));
        }
        if let Some(tag) = raw.strip_prefix("tag:") {
            return Ok(Selector::Tag(tag.to_string()));
        }
        let looks_like_path = raw.contains('*')
            || raw.contains('?')
            || raw.contains('/')
            || raw.ends_with(".yml")
            || raw.ends_with(".yaml");
        if looks_like_path {
            let pattern = Pattern::new(raw)
                .map_err(|e| Error::Configuration(format!("invalid selector glob '{}': {}", raw, e)))?;
            return Ok(Selector::PathGlob(pattern));
        }
        Ok(Selector::Name(raw.to_string()))
    }

    pub fn matches(&self, metric: &MetricConfig, project_root: &Path) -> bool {
        match self {
            Selector::Name(name) => metric.name == *name,
            Selector::Tag(tag) => metric.tags.iter().any(|t| t == tag),
            Selector::PathGlob(pattern) => {
                let Some(path) = &metric.source_path else {
                    return false;
                };
                if pattern.matches_path(path) {
                    return true;
                }
                // Also try the path relative to the project root, so
                // `metrics/billing/*.yml` works from anywhere
                path.strip_prefix(project_root)
                    .map(|relative| pattern.matches_path(relative))
                    .unwrap_or(false)
            }
        }
    }
}

/// Apply include/exclude selectors. Empty include means "everything";
/// disabled metrics are always skipped.
pub fn select<'a>(
    metrics: &'a [MetricConfig],
    include: &[String],
    exclude: &[String],
    project_root: &Path,
) -> Result<Vec<&'a MetricConfig>> {
    let include: Vec<Selector> = include
        .iter()
        .map(|raw| Selector::parse(raw))
        .collect::<Result<_>>()?;
    let exclude: Vec<Selector> = exclude
        .iter()
        .map(|raw| Selector::parse(raw))
        .collect::<Result<_>>()?;

    Ok(metrics
        .iter()
        .filter(|metric| metric.enabled)
        .filter(|metric| {
            include.is_empty() || include.iter().any(|s| s.matches(metric, project_root))
        })
        .filter(|metric| !exclude.iter().any(|s| s.matches(metric, project_root)))
        .collect())
}
