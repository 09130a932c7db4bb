use std::{collections::HashMap, sync::Arc};

use tracing::info;

use crate::{error::RegistryError, tools::model::Tool};

/// Name to tool mapping shared by every agent and the engine.
///
/// Registration needs `&mut self` and is expected to finish before the registry is wrapped in
/// an `Arc` and handed to the engine. From then on it is only read, so concurrent lookups need
/// no locking.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
    domain_index: HashMap<String, Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), RegistryError> {
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateTool(tool.name));
        }

        let name = tool.name.clone();
        if let Some(domain) = &tool.domain {
            self.domain_index
                .entry(domain.clone())
                .or_default()
                .push(name.clone());
        }
        self.tools.insert(name.clone(), Arc::new(tool));

        info!(tool = %name, "tool registered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Tool>, RegistryError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Every registered tool. Call again to iterate again.
    pub fn tools(&self) -> impl Iterator<Item = &Arc<Tool>> + '_ {
        self.tools.values()
    }

    pub fn by_domain<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a Arc<Tool>> + 'a {
        self.domain_index
            .get(domain)
            .into_iter()
            .flatten()
            .filter_map(|name| self.tools.get(name))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
