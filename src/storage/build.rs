//! Build storage trees from configuration

use super::{Device, Extent, Node};
use crate::config::{Config, ConfigError};
use std::collections::HashSet;

/// Build the (unopened) tree rooted at the extent or device named `root`.
pub fn build_tree(config: &Config, root: &str) -> Result<Node, ConfigError> {
    let mut visiting = HashSet::new();
    build_node(config, root, &mut visiting)
}

fn build_node<'a>(
    config: &'a Config,
    name: &'a str,
    visiting: &mut HashSet<&'a str>,
) -> Result<Node, ConfigError> {
    if let Some(extent) = config.extent.iter().find(|e| e.name == name) {
        return Ok(Node::Extent(Extent::new(
            &extent.name,
            &extent.path,
            extent.offset,
            extent.size,
        )));
    }

    let device = config
        .device
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown storage node: {}", name)))?;

    if !visiting.insert(device.name.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "device {} contains itself",
            device.name
        )));
    }

    let children = device
        .children
        .iter()
        .map(|child| build_node(config, child, visiting))
        .collect::<Result<Vec<_>, _>>()?;

    visiting.remove(device.name.as_str());

    let device = Device::new(&device.name, device.raid, children)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    log::debug!(
        "Built {} device {} ({} bytes, {} children)",
        device.raid(),
        device.name(),
        device.size(),
        device.children().len()
    );
    Ok(Node::Device(device))
}
