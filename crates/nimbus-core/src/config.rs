//! Planet configuration document parser.
//!
//! A planet document declares the atmosphere components, the flows,
//! and per-component wiring: which worker hosts it, what it eats,
//! what it feeds, and element properties (string-valued; coercion to
//! the element's property types happens at the pipeline).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanetConfig {
    pub planet: PlanetSection,
    #[serde(default)]
    pub atmosphere: ContainerConfig,
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanetSection {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    /// Worker this component must run on.
    pub worker: String,
    /// Eater alias -> feed ids to eat from.
    #[serde(default)]
    pub eaters: BTreeMap<String, Vec<String>>,
    /// Feed names this component produces.
    #[serde(default)]
    pub feeds: Vec<String>,
    /// Element properties, string-valued until coerced.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Whether this component's type takes part in clock-master
    /// election for its flow.
    #[serde(default, rename = "needs-synchronization")]
    pub needs_synchronization: bool,
    /// Candidate priority for clock-master election.
    #[serde(default, rename = "clock-priority")]
    pub clock_priority: u32,
}

impl PlanetConfig {
    pub fn from_str(text: &str) -> Result<Self, Error> {
        let config: PlanetConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_str(&text)
    }

    /// Flow names unique within the planet; component names unique
    /// within their container.
    fn validate(&self) -> Result<(), Error> {
        let mut flow_names = std::collections::HashSet::new();
        for flow in &self.flows {
            if !flow_names.insert(flow.name.as_str()) {
                return Err(Error::Config(format!("duplicate flow name: {}", flow.name)));
            }
            check_unique_components(&flow.name, &flow.components)?;
        }
        check_unique_components("atmosphere", &self.atmosphere.components)?;
        Ok(())
    }
}

fn check_unique_components(container: &str, components: &[ComponentConfig]) -> Result<(), Error> {
    let mut names = std::collections::HashSet::new();
    for component in components {
        if !names.insert(component.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate component name {} in {container}",
                component.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[planet]
name = "default"
version = "0.1.0"

[[atmosphere.component]]
name = "porter"
type = "porter"
worker = "w1"

[[flow]]
name = "default"

[[flow.component]]
name = "producer"
type = "videotest-producer"
worker = "w1"
feeds = ["default"]
needs-synchronization = true
clock-priority = 130

[flow.component.properties]
framerate = "25"
is-live = "True"

[[flow.component]]
name = "muxer-video"
type = "ogg-muxer"
worker = "w2"
feeds = ["default"]
needs-synchronization = true
clock-priority = 100

[flow.component.eaters]
default = ["producer:default"]
"#;

    #[test]
    fn parses_sample_document() {
        let config = PlanetConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.planet.name, "default");
        assert_eq!(config.atmosphere.components.len(), 1);
        assert_eq!(config.flows.len(), 1);

        let flow = &config.flows[0];
        assert_eq!(flow.name, "default");
        assert_eq!(flow.components.len(), 2);

        let muxer = &flow.components[1];
        assert_eq!(muxer.component_type, "ogg-muxer");
        assert_eq!(muxer.eaters["default"], vec!["producer:default"]);
        assert_eq!(muxer.clock_priority, 100);

        let producer = &flow.components[0];
        assert_eq!(producer.properties["is-live"], "True");
        assert!(producer.needs_synchronization);
    }

    #[test]
    fn rejects_duplicate_flow_names() {
        let text = r#"
[planet]
name = "p"

[[flow]]
name = "a"

[[flow]]
name = "a"
"#;
        assert!(PlanetConfig::from_str(text).is_err());
    }

    #[test]
    fn rejects_duplicate_component_names_in_flow() {
        let text = r#"
[planet]
name = "p"

[[flow]]
name = "a"

[[flow.component]]
name = "c"
type = "t"
worker = "w"

[[flow.component]]
name = "c"
type = "t"
worker = "w"
"#;
        assert!(PlanetConfig::from_str(text).is_err());
    }
}
