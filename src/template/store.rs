//! Template Store
//!
//! Read-only access to template documents. The engine looks templates up by
//! name (default version only) when exploding and never writes them back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, warn};

use super::model::WorkflowTemplate;
use super::parser::{is_template_file, load_template};
use crate::error::{Result, WorkflowError};

/// Document store holding workflow templates.
pub trait TemplateStore: Send + Sync {
    /// Returns the single default template with this name.
    fn find_default(&self, name: &str) -> Result<WorkflowTemplate>;

    /// Returns the template with this UUID.
    fn find_by_uuid(&self, uuid: &str) -> Result<WorkflowTemplate>;
}

/// Picks the one default template named `name` out of a candidate set.
fn single_default(name: &str, candidates: Vec<WorkflowTemplate>) -> Result<WorkflowTemplate> {
    let mut defaults: Vec<WorkflowTemplate> = candidates
        .into_iter()
        .filter(|t| t.name == name && t.is_default)
        .collect();

    match defaults.len() {
        1 => Ok(defaults.remove(0)),
        0 => Err(WorkflowError::TemplateNotFound(name.to_string())),
        n => {
            warn!("{} templates named '{}' are marked default", n, name);
            Err(WorkflowError::TemplateNotFound(format!(
                "{} ({} conflicting default versions)",
                name, n
            )))
        }
    }
}

/// In-process template set, used for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    templates: RwLock<Vec<WorkflowTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given templates.
    pub fn from_templates(templates: Vec<WorkflowTemplate>) -> Self {
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Adds a template; an existing template with the same UUID is replaced.
    pub fn insert(&self, template: WorkflowTemplate) {
        let mut templates = match self.templates.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        templates.retain(|t| t.uuid != template.uuid);
        templates.push(template);
    }

    fn snapshot(&self) -> Vec<WorkflowTemplate> {
        match self.templates.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn find_default(&self, name: &str) -> Result<WorkflowTemplate> {
        single_default(name, self.snapshot())
    }

    fn find_by_uuid(&self, uuid: &str) -> Result<WorkflowTemplate> {
        self.snapshot()
            .into_iter()
            .find(|t| t.uuid == uuid)
            .ok_or_else(|| WorkflowError::TemplateNotFound(uuid.to_string()))
    }
}

/// Serves every `.yaml`, `.yml` and `.json` file of a directory.
///
/// Files are re-read on each lookup so edits are picked up without a
/// restart; running instances are unaffected because they execute from
/// their own snapshot. Files that fail to parse are skipped with a warning.
#[derive(Debug, Clone)]
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every parseable template in the directory.
    pub fn load_all(&self) -> Result<Vec<WorkflowTemplate>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            WorkflowError::TemplateNotFound(format!(
                "cannot read template directory '{}': {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_template_file(p))
            .collect();
        paths.sort();

        let mut templates = Vec::new();
        for path in paths {
            match load_template(&path) {
                Ok(template) => templates.push(template),
                Err(e) => warn!("Skipping template {}: {}", path.display(), e),
            }
        }

        debug!(
            "Loaded {} templates from {}",
            templates.len(),
            self.dir.display()
        );
        Ok(templates)
    }
}

impl TemplateStore for DirTemplateStore {
    fn find_default(&self, name: &str) -> Result<WorkflowTemplate> {
        single_default(name, self.load_all()?)
    }

    fn find_by_uuid(&self, uuid: &str) -> Result<WorkflowTemplate> {
        self.load_all()?
            .into_iter()
            .find(|t| t.uuid == uuid)
            .ok_or_else(|| WorkflowError::TemplateNotFound(uuid.to_string()))
    }
}
