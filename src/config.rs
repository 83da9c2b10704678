//! Configuration (§6): the host hands `VM::create` an opaque configuration
//! tree rather than a fixed struct, so embedders can back it with whatever
//! format they already parse (JSON, TOML, a hand-rolled key/value store)
//! without this crate depending on a parser.

use thiserror::Error;

use crate::core_runtime::YieldStrategy;
use crate::paging::PagingStrategy;

/// An opaque configuration handle, as described in §6: "val" reads a leaf
/// value by key, "subtree" descends into a nested node. Implementations
/// decide their own key syntax and nesting rules; this crate only ever
/// calls these two methods.
pub trait ConfigNode {
    fn val(&self, key: &str) -> Option<&str>;
    fn subtree(&self, key: &str) -> Option<&dyn ConfigNode>;
}

/// A small in-memory tree keyed by `String`, used by tests and the demo
/// binary as the reference `ConfigNode` implementation — no external
/// parser dependency, the same "host hands us an opaque tree" shape
/// `vm-memory`/`vmm-sys-util`-style crates use for config plumbing
/// elsewhere in the rust-vmm ecosystem.
#[derive(Default)]
pub struct StaticConfigNode {
    values: std::collections::BTreeMap<String, String>,
    children: std::collections::BTreeMap<String, StaticConfigNode>,
}

impl StaticConfigNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_val(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_subtree(mut self, key: impl Into<String>, child: StaticConfigNode) -> Self {
        self.children.insert(key.into(), child);
        self
    }
}

impl ConfigNode for StaticConfigNode {
    fn val(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn subtree(&self, key: &str) -> Option<&dyn ConfigNode> {
        self.children.get(key).map(|c| c as &dyn ConfigNode)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0:?}")]
    Missing(&'static str),
    #[error("configuration key {0:?} has an invalid value {1:?}")]
    Invalid(&'static str, String),
}

/// The subset of VM-wide configuration this crate's own bootstrap reads
/// from a `ConfigNode` at `VM::create` time (§6). Anything device- or
/// extension-specific stays in the host's own config tree, read by the
/// host's own code, not by this crate.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub vcpu_count: u32,
    pub memory_size_bytes: u64,
    pub paging_strategy: PagingStrategy,
    pub yield_strategy: YieldStrategy,
}

impl VmConfig {
    pub fn from_node(node: &dyn ConfigNode) -> Result<Self, ConfigError> {
        let vcpu_count = node
            .val("vcpu_count")
            .ok_or(ConfigError::Missing("vcpu_count"))?
            .parse()
            .map_err(|_| ConfigError::Invalid("vcpu_count", node.val("vcpu_count").unwrap().to_string()))?;

        let memory_size_bytes = node
            .val("memory_size_bytes")
            .ok_or(ConfigError::Missing("memory_size_bytes"))?
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "memory_size_bytes",
                    node.val("memory_size_bytes").unwrap().to_string(),
                )
            })?;

        let paging_strategy = match node.val("paging_strategy") {
            Some("shadow") | None => PagingStrategy::Shadow,
            Some("nested") => PagingStrategy::Nested,
            Some(other) => return Err(ConfigError::Invalid("paging_strategy", other.to_string())),
        };

        let yield_strategy = match node.val("yield_strategy") {
            Some("greedy") => YieldStrategy::Greedy,
            Some("friendly") => YieldStrategy::Friendly,
            Some("adaptive") | None => YieldStrategy::Adaptive,
            Some(other) => return Err(ConfigError::Invalid("yield_strategy", other.to_string())),
        };

        Ok(Self {
            vcpu_count,
            memory_size_bytes,
            paging_strategy,
            yield_strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_config_tree() {
        let node = StaticConfigNode::new()
            .with_val("vcpu_count", "4")
            .with_val("memory_size_bytes", "1073741824")
            .with_val("paging_strategy", "nested")
            .with_val("yield_strategy", "friendly");
        let config = VmConfig::from_node(&node).unwrap();
        assert_eq!(config.vcpu_count, 4);
        assert_eq!(config.memory_size_bytes, 1 << 30);
        assert_eq!(config.paging_strategy, PagingStrategy::Nested);
        assert_eq!(config.yield_strategy, YieldStrategy::Friendly);
    }

    #[test]
    fn defaults_apply_when_optional_keys_are_absent() {
        let node = StaticConfigNode::new()
            .with_val("vcpu_count", "1")
            .with_val("memory_size_bytes", "4096");
        let config = VmConfig::from_node(&node).unwrap();
        assert_eq!(config.paging_strategy, PagingStrategy::Shadow);
        assert_eq!(config.yield_strategy, YieldStrategy::Adaptive);
    }

    #[test]
    fn missing_required_key_is_reported() {
        let node = StaticConfigNode::new();
        assert!(matches!(
            VmConfig::from_node(&node),
            Err(ConfigError::Missing("vcpu_count"))
        ));
    }

    #[test]
    fn nested_subtrees_are_reachable() {
        let node = StaticConfigNode::new().with_subtree(
            "devices",
            StaticConfigNode::new().with_val("serial_port", "0x3f8"),
        );
        let devices = node.subtree("devices").unwrap();
        assert_eq!(devices.val("serial_port"), Some("0x3f8"));
    }
}


