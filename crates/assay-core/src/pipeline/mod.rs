pub mod runner;

pub use runner::{PipelineResult, PipelineRunner, StepReport};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::AssayConfig;
use crate::graph::topological_order;
use crate::models::{CoreError, CoreErrorKind, PipelineDefinition, PipelineStep};

pub type CatalogResult<T> = Result<T, CoreError>;

const DEFINITION_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Steps of `definition` in execution order. Rejects empty pipelines,
/// duplicate step names, dangling `depends_on` and cycles.
pub fn execution_order(definition: &PipelineDefinition) -> CatalogResult<Vec<&PipelineStep>> {
    let invalid = |message: String| {
        CoreError::new(
            CoreErrorKind::ValidationError,
            format!("pipeline '{}': {message}", definition.name),
        )
    };

    if definition.name.trim().is_empty() {
        return Err(CoreError::new(
            CoreErrorKind::ValidationError,
            "pipeline name must not be empty",
        ));
    }
    if definition.steps.is_empty() {
        return Err(invalid("defines no steps".to_string()));
    }
    if let Some(step) = definition
        .steps
        .iter()
        .find(|step| step.skill.trim().is_empty())
    {
        return Err(invalid(format!("step '{}' names no skill", step.name)));
    }

    let nodes: Vec<_> = definition
        .steps
        .iter()
        .map(|step| (step.name.as_str(), &step.depends_on))
        .collect();
    let order = topological_order(&nodes).map_err(|error| invalid(error.message))?;
    Ok(order
        .into_iter()
        .map(|position| &definition.steps[position])
        .collect())
}

pub fn parse_definition(raw: &str, path: &Path) -> CatalogResult<PipelineDefinition> {
    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let parsed: Result<PipelineDefinition, String> = if is_json {
        serde_json::from_str(raw).map_err(|error| error.to_string())
    } else {
        serde_yaml::from_str(raw).map_err(|error| error.to_string())
    };
    let definition: PipelineDefinition = parsed.map_err(|error| {
        CoreError::new(
            CoreErrorKind::ValidationError,
            format!("invalid pipeline definition '{}': {error}", path.display()),
        )
    })?;
    execution_order(&definition)?;
    Ok(definition)
}

/// Named pipeline definitions available to the runner.
#[derive(Clone, Debug, Default)]
pub struct PipelineCatalog {
    pipelines: BTreeMap<String, PipelineDefinition>,
    sources: BTreeMap<String, PathBuf>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configured pipelines directory (if it exists) and every
    /// explicitly listed definition file.
    pub fn from_config(config: &AssayConfig) -> CatalogResult<Self> {
        let mut catalog = Self::new();
        catalog.load_dir(&config.pipelines_dir())?;
        for path in &config.pipelines {
            catalog.load_file(path)?;
        }
        Ok(catalog)
    }

    pub fn with(mut self, definition: PipelineDefinition) -> CatalogResult<Self> {
        self.insert(definition, None)?;
        Ok(self)
    }

    pub fn load_dir(&mut self, dir: &Path) -> CatalogResult<usize> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => {
                return Err(CoreError::new(
                    CoreErrorKind::ConfigError,
                    format!("failed to read pipelines directory '{}': {error}", dir.display()),
                ));
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|extension| extension.to_str())
                    .is_some_and(|extension| {
                        DEFINITION_EXTENSIONS
                            .iter()
                            .any(|known| extension.eq_ignore_ascii_case(known))
                    })
            })
            .collect();
        paths.sort();

        for path in &paths {
            self.load_file(path)?;
        }
        Ok(paths.len())
    }

    pub fn load_file(&mut self, path: &Path) -> CatalogResult<&PipelineDefinition> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ConfigError,
                format!("failed to read pipeline definition '{}': {error}", path.display()),
            )
        })?;
        let definition = parse_definition(&raw, path)?;
        tracing::debug!(
            pipeline = %definition.name,
            path = %path.display(),
            steps = definition.steps.len(),
            "loaded pipeline definition"
        );
        self.insert(definition, Some(path.to_path_buf()))
    }

    pub fn get(&self, name: &str) -> CatalogResult<&PipelineDefinition> {
        self.pipelines.get(name).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("pipeline '{name}' is not defined"),
            )
        })
    }

    pub fn source(&self, name: &str) -> Option<&Path> {
        self.sources.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineDefinition> {
        self.pipelines.values()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    fn insert(
        &mut self,
        definition: PipelineDefinition,
        source: Option<PathBuf>,
    ) -> CatalogResult<&PipelineDefinition> {
        execution_order(&definition)?;
        let name = definition.name.clone();
        if self.pipelines.contains_key(&name) {
            let previous = self
                .sources
                .get(&name)
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "an earlier definition".to_string());
            return Err(CoreError::new(
                CoreErrorKind::AlreadyExists,
                format!("pipeline '{name}' is already defined by {previous}"),
            ));
        }
        if let Some(source) = source {
            self.sources.insert(name.clone(), source);
        }
        let stored: &PipelineDefinition = self.pipelines.entry(name).or_insert(definition);
        Ok(stored)
    }
}
