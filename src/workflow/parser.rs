//! Definition Parser
//!
//! Loads workflow definitions from YAML or JSON files. The format is chosen
//! by file extension (`.json` is JSON, anything else is YAML).

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::Result;

/// Serialization format for a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parses a definition from text without validating it.
pub fn parse_definition(content: &str, format: DefinitionFormat) -> Result<WorkflowDefinition> {
    let definition = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(content)?,
        DefinitionFormat::Json => serde_json::from_str(content)?,
    };
    Ok(definition)
}

/// Loads and validates a definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use milestone_flow::workflow::load_definition;
///
/// fn main() -> milestone_flow::Result<()> {
///     let definition = load_definition("approval.yaml")?;
///     println!("Loaded {} nodes", definition.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow definition from: {}", path.display());

    let content = fs::read_to_string(path)?;
    debug!("Definition content loaded ({} bytes)", content.len());

    let mut definition = parse_definition(&content, DefinitionFormat::from_path(path))?;

    if definition.id.trim().is_empty() {
        definition.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!(
        "Parsed definition '{}': {} nodes, {} edges",
        definition.id,
        definition.nodes.len(),
        definition.edges.len()
    );

    validate_definition(&definition)?;
    Ok(definition)
}

/// Writes a definition to a file in the format matching its extension.
pub fn save_definition(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = match DefinitionFormat::from_path(path) {
        DefinitionFormat::Yaml => serde_yaml::to_string(definition)?,
        DefinitionFormat::Json => serde_json::to_string_pretty(definition)?,
    };
    fs::write(path, content)?;

    info!("Saved definition '{}' to {}", definition.id, path.display());
    Ok(())
}
