//! Template Parser
//!
//! Handles loading and saving workflow templates. Templates are stored as
//! YAML documents; JSON is accepted as well since it is a YAML subset and is
//! the format entity snapshots are written in.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};
use uuid::Uuid;

use super::model::WorkflowTemplate;
use super::validator::validate_template;

/// Stable UUID for a template document that does not carry one.
///
/// Derived from name and version so re-reading the same file always yields
/// the same identity.
pub fn derived_uuid(name: &str, version: u32) -> String {
    let key = format!("flowcore:template:{}:{}", name, version);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Parses a template document from a string.
pub fn parse_template(content: &str) -> Result<WorkflowTemplate, Box<dyn Error>> {
    let mut template: WorkflowTemplate = serde_yaml::from_str(content).map_err(|e| {
        format!("Failed to parse workflow template: {}. Check the file format.", e)
    })?;

    if template.uuid.trim().is_empty() {
        template.uuid = derived_uuid(&template.name, template.version);
        debug!(
            "Template '{}' has no uuid - assigned {}",
            template.name, template.uuid
        );
    }

    Ok(template)
}

/// Loads a template from a YAML or JSON file.
///
/// The template is parsed but not validated; use [`load_validated_template`]
/// when the file must be usable as-is.
///
/// # Example
///
/// ```rust,no_run
/// use flowcore::template::parser::load_template;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_template("templates/purchase_order.yaml")?;
///     println!("Loaded {} nodes", template.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_template(path: impl AsRef<Path>) -> Result<WorkflowTemplate, Box<dyn Error>> {
    let path = path.as_ref();
    debug!("Loading template from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read template file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    let template = parse_template(&content)?;
    debug!(
        "Parsed template '{}' v{} ({} nodes, {} links)",
        template.name,
        template.version,
        template.nodes.len(),
        template.links.len()
    );
    Ok(template)
}

/// Loads a template and rejects it if validation reports any problem.
pub fn load_validated_template(path: impl AsRef<Path>) -> Result<WorkflowTemplate, Box<dyn Error>> {
    let template = load_template(path)?;
    let errors = validate_template(&template);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(messages.join("\n").into());
    }
    Ok(template)
}

/// Returns true if the path has a template file extension.
pub fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Saves a template to a YAML file.
pub fn save_template(template: &WorkflowTemplate, path: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(template)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Template saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::model::{Node, NodeType};
    use tempfile::tempdir;

    const SIMPLE: &str = r#"
name: simple
nodes:
  - id: start
    type: start
  - id: a
    type: task
  - id: end
    type: end
links:
  - source: start
    target: a
  - source: a
    target: end
"#;

    #[test]
    fn test_parse_assigns_missing_uuid() {
        let template = parse_template(SIMPLE).unwrap();
        assert_eq!(template.name, "simple");
        assert!(!template.uuid.is_empty());
        assert!(!template.is_default);

        // Same document, same identity
        assert_eq!(parse_template(SIMPLE).unwrap().uuid, template.uuid);
        assert_eq!(template.uuid, derived_uuid("simple", template.version));
        assert_ne!(template.uuid, derived_uuid("simple", template.version + 1));
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"name":"j","uuid":"u1","nodes":[{"id":"s","type":"start"}]}"#;
        let template = parse_template(json).unwrap();
        assert_eq!(template.uuid, "u1");
        assert_eq!(template.nodes[0].node_type, NodeType::Start);
    }

    #[test]
    fn test_parse_invalid_document() {
        let result = parse_template("name: [unterminated");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_template("/nonexistent/template.yaml");
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("t.yaml");

        let template = WorkflowTemplate::new("saved")
            .with_node(Node::start("s"))
            .with_node(Node::task("a").with_page("p"))
            .with_link("s", "a");
        save_template(&template, &path).unwrap();

        let loaded = load_validated_template(&path).unwrap();
        assert_eq!(loaded, template);
    }

    #[test]
    fn test_load_validated_rejects_invalid() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "name: bad\nnodes:\n  - id: a\n    type: task\n").unwrap();

        let result = load_validated_template(&path);
        assert!(result.unwrap_err().to_string().contains("no start node"));
    }

    #[test]
    fn test_is_template_file() {
        assert!(is_template_file(Path::new("a.yaml")));
        assert!(is_template_file(Path::new("a.yml")));
        assert!(is_template_file(Path::new("a.json")));
        assert!(!is_template_file(Path::new("a.txt")));
        assert!(!is_template_file(Path::new("README")));
    }
}
