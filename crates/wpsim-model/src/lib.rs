//! # wpsim-model
//!
//! YAML scenario loading and simulation building for wpsim.
//!
//! This crate provides:
//! - YAML schema types for scenarios
//! - Scenario loading and merging from files and strings
//! - The [`Channel`] entity that carries transmissions between PHYs
//! - The [`Station`] entity that owns a PHY and originates its traffic
//! - Simulation building from loaded models
//!
//! ## Layered PHY configuration
//!
//! Each node's [`PhyConfig`] is resolved in order: built-in defaults →
//! `defaults.phy` → the node's own `phy` section. Only the keys present in a
//! layer override the layer below it.

mod channel;
mod station;

pub use channel::{Channel, LinkModel, LinkParams};
pub use station::{Station, StationStats, TrafficConfig};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use wpsim_common::{EntityId, EntityRegistry, Event, EventId, EventPayload, PhyControl, SimTime};
use wpsim_metrics::MetricLabels;
use wpsim_phy::{Phy, PhyConfig, RssGateDriver};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid link definition.
    #[error("Invalid link: {from} -> {to}")]
    InvalidLink {
        /// Source node name.
        from: String,
        /// Destination node name.
        to: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Public Model API
// ============================================================================

/// A loaded scenario with resolved node configurations.
#[derive(Debug, Clone)]
pub struct Model {
    nodes: BTreeMap<String, Node>,
    links: BTreeMap<(String, String), Link>,
    traffic: Vec<TrafficConfig>,
    control: Vec<ControlConfig>,
    simulation: SimulationConfig,
}

impl Model {
    /// Nodes by name.
    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    /// Directed links keyed by (from, to).
    pub fn links(&self) -> &BTreeMap<(String, String), Link> {
        &self.links
    }

    /// Traffic flows.
    pub fn traffic(&self) -> &[TrafficConfig] {
        &self.traffic
    }

    /// Scheduled PHY control actions.
    pub fn control(&self) -> &[ControlConfig] {
        &self.control
    }

    /// Simulation-wide settings.
    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }
}

/// A node with its resolved PHY configuration.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name (unique identifier).
    pub name: String,
    /// Resolved PHY configuration.
    pub phy: PhyConfig,
    /// Optional driver.
    pub driver: Option<DriverConfig>,
    /// Role label for metrics.
    pub role: String,
    /// Metric groups.
    pub groups: Vec<String>,
}

/// A directed link.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Source node name.
    pub from: String,
    /// Destination node name.
    pub to: String,
    /// Path loss in dB.
    pub loss_db: f64,
    /// Propagation delay.
    pub delay: SimTime,
}

/// Driver attached to a node's PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Admit receptions only when the measured RSS reaches this level.
    pub rss_gate_dbm: f64,
}

/// A PHY control action at a fixed time.
///
/// ```yaml
/// control:
///   - node: sta1
///     at_s: 0.5
///     action: switch_channel
///     channel: 6
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Target node.
    pub node: String,
    /// Time in seconds.
    pub at_s: f64,
    /// The action.
    #[serde(flatten)]
    pub action: PhyControl,
}

/// Simulation-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Simulated duration in seconds.
    pub duration_s: Option<f64>,
    /// Random seed.
    pub seed: Option<u64>,
}

// ============================================================================
// YAML Schema Types (Internal)
// ============================================================================

/// Defaults section in YAML.
///
/// ```yaml
/// defaults:
///   phy:
///     ed_threshold_dbm: -82
///     capture:
///       enabled: true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    phy: Option<Value>,
}

/// Root scenario structure (YAML schema).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioYaml {
    #[serde(default)]
    defaults: DefaultsYaml,
    #[serde(default)]
    nodes: Vec<NodeYaml>,
    #[serde(default)]
    links: Vec<LinkYaml>,
    #[serde(default)]
    traffic: Vec<TrafficConfig>,
    #[serde(default)]
    control: Vec<ControlConfig>,
    #[serde(default)]
    simulation: Option<SimulationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeYaml {
    name: String,
    /// When true, the node is removed during merging.
    #[serde(default)]
    remove: bool,
    #[serde(default)]
    phy: Option<Value>,
    #[serde(default)]
    driver: Option<DriverConfig>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

/// ```yaml
/// links:
///   - from: ap
///     to: sta1
///     loss_db: 70
///     delay_ns: 100
///     symmetric: true
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkYaml {
    from: String,
    to: String,
    #[serde(default)]
    loss_db: f64,
    #[serde(default)]
    delay_ns: u64,
    /// Also add the reverse link.
    #[serde(default)]
    symmetric: bool,
    /// When true, the link (and its reverse, if symmetric) is removed.
    #[serde(default)]
    remove: bool,
}

/// A node before its PHY configuration is resolved.
struct PendingNode {
    phy: Value,
    driver: Option<DriverConfig>,
    role: Option<String>,
    groups: Option<Vec<String>>,
}

/// Overlay `overlay` onto `base`: mappings merge key by key, anything else replaces.
fn merge_yaml(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Resolve a node's PHY configuration from the layered values.
fn resolve_phy(name: &str, defaults: &Value, overlay: &Value) -> Result<PhyConfig, ModelError> {
    let mut value = serde_yaml::to_value(PhyConfig::default())?;
    merge_yaml(&mut value, defaults);
    merge_yaml(&mut value, overlay);
    let config: PhyConfig = serde_yaml::from_value(value)?;
    config
        .validate()
        .map_err(|e| ModelError::InvalidConfig(format!("node '{}': {}", name, e)))?;
    Ok(config)
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge multiple scenario files.
///
/// Later files override earlier ones:
/// - `defaults.phy` keys from later files override earlier ones
/// - Nodes with the same name merge, later values winning
/// - Links with the same endpoints are replaced
/// - Traffic and control entries accumulate
///
/// References are validated on the final merged model only.
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario files provided".to_string()));
    }

    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_models_from_str(&yaml_strs)
}

/// Load and merge multiple scenarios from YAML strings. See [`load_models`].
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario strings provided".to_string()));
    }

    let mut phy_defaults = Value::Mapping(Default::default());
    let mut yamls = Vec::new();
    for yaml_str in yaml_strs {
        let yaml: ScenarioYaml = serde_yaml::from_str(yaml_str)?;
        if let Some(phy) = &yaml.defaults.phy {
            merge_yaml(&mut phy_defaults, phy);
        }
        yamls.push(yaml);
    }

    let mut pending: BTreeMap<String, PendingNode> = BTreeMap::new();
    let mut links: BTreeMap<(String, String), Link> = BTreeMap::new();
    let mut traffic = Vec::new();
    let mut control = Vec::new();
    let mut simulation = SimulationConfig::default();

    for yaml in yamls {
        for node in yaml.nodes {
            if node.remove {
                if pending.remove(&node.name).is_none() {
                    return Err(ModelError::NodeNotFound(node.name));
                }
                links.retain(|(from, to), _| from != &node.name && to != &node.name);
                continue;
            }
            let entry = pending.entry(node.name.clone()).or_insert_with(|| PendingNode {
                phy: Value::Mapping(Default::default()),
                driver: None,
                role: None,
                groups: None,
            });
            if let Some(phy) = &node.phy {
                merge_yaml(&mut entry.phy, phy);
            }
            if node.driver.is_some() {
                entry.driver = node.driver;
            }
            if node.role.is_some() {
                entry.role = node.role;
            }
            if node.groups.is_some() {
                entry.groups = node.groups;
            }
        }

        for link in yaml.links {
            let mut keys = vec![(link.from.clone(), link.to.clone())];
            if link.symmetric {
                keys.push((link.to.clone(), link.from.clone()));
            }
            for (from, to) in keys {
                if link.remove {
                    if links.remove(&(from.clone(), to.clone())).is_none() {
                        return Err(ModelError::InvalidLink { from, to });
                    }
                } else {
                    links.insert(
                        (from.clone(), to.clone()),
                        Link {
                            from,
                            to,
                            loss_db: link.loss_db,
                            delay: SimTime::from_nanos(link.delay_ns),
                        },
                    );
                }
            }
        }

        traffic.extend(yaml.traffic);
        control.extend(yaml.control);

        if let Some(sim) = yaml.simulation {
            if sim.duration_s.is_some() {
                simulation.duration_s = sim.duration_s;
            }
            if sim.seed.is_some() {
                simulation.seed = sim.seed;
            }
        }
    }

    // Validate references
    for (from, to) in links.keys() {
        if !pending.contains_key(from) || !pending.contains_key(to) {
            return Err(ModelError::InvalidLink {
                from: from.clone(),
                to: to.clone(),
            });
        }
    }
    for flow in &traffic {
        if !pending.contains_key(&flow.node) {
            return Err(ModelError::NodeNotFound(flow.node.clone()));
        }
        if flow.burst == 0 {
            return Err(ModelError::InvalidConfig(format!("traffic from '{}': burst must be at least 1", flow.node)));
        }
        if let Some(interval) = flow.interval_s {
            // the repeat timer must advance simulated time
            if !interval.is_finite() || SimTime::from_secs(interval).is_zero() {
                return Err(ModelError::InvalidConfig(format!(
                    "traffic from '{}': interval_s must be at least one nanosecond, got {}",
                    flow.node, interval
                )));
            }
        }
    }
    for entry in &control {
        if !pending.contains_key(&entry.node) {
            return Err(ModelError::NodeNotFound(entry.node.clone()));
        }
    }

    let mut nodes = BTreeMap::new();
    for (name, node) in pending {
        let phy = resolve_phy(&name, &phy_defaults, &node.phy)?;
        nodes.insert(
            name.clone(),
            Node {
                name,
                phy,
                driver: node.driver,
                role: node.role.unwrap_or_else(|| "station".to_string()),
                groups: node.groups.unwrap_or_default(),
            },
        );
    }

    Ok(Model {
        nodes,
        links,
        traffic,
        control,
        simulation,
    })
}

// ============================================================================
// Model Building
// ============================================================================

/// Information about a node for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node name from the model.
    pub name: String,
    /// Role label.
    pub role: String,
    /// Entity ID of the station (and its PHY).
    pub entity_id: u64,
    /// Initial channel.
    pub channel_number: u16,
    /// Initial center frequency in MHz.
    pub frequency_mhz: u32,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Link model used by the channel.
    pub link_model: LinkModel,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node for display.
    pub node_infos: Vec<NodeInfo>,
}

/// Build a simulation from a model.
///
/// The channel is entity 0; stations follow in node-name order. Each PHY's
/// random source is seeded from `seed` in that same order unless its
/// configuration carries a seed.
pub fn build_simulation(model: &Model, seed: u64) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut next_event_id: u64 = 0;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let channel_id = EntityId::new(0);
    let node_ids: BTreeMap<&str, EntityId> = model
        .nodes
        .keys()
        .enumerate()
        .map(|(i, name)| (name.as_str(), EntityId::new(i as u64 + 1)))
        .collect();

    let mut node_infos = Vec::new();
    for (index, node) in model.nodes.values().enumerate() {
        let id = node_ids[node.name.as_str()];
        let node_seed: u64 = rng.gen();
        let labels = MetricLabels::new(node.name.clone(), &node.role).with_groups(node.groups.clone());

        let mut phy = Phy::new(id, node.name.clone(), node.phy.clone(), channel_id, node_seed).with_metric_labels(labels);
        if let Some(driver) = &node.driver {
            phy = phy.with_driver(Box::new(RssGateDriver::new(driver.rss_gate_dbm)));
        }
        node_infos.push(NodeInfo {
            name: node.name.clone(),
            role: node.role.clone(),
            entity_id: id.0,
            channel_number: phy.channel_number(),
            frequency_mhz: phy.frequency_mhz(),
        });

        let mut station = Station::new(phy, index as u32);
        for flow in model.traffic.iter().filter(|f| f.node == node.name) {
            let timer_id = station.add_flow(flow.clone());
            initial_events.push(Event {
                id: EventId(next_event_id),
                time: SimTime::from_secs(flow.start_s.max(0.0)),
                source: id,
                targets: vec![id],
                payload: EventPayload::Timer { timer_id },
            });
            next_event_id += 1;
        }
        debug!(node = %node.name, id = id.0, seed = node_seed, "built station");
        entities.register(Box::new(station));
    }

    for entry in &model.control {
        let id = node_ids[entry.node.as_str()];
        initial_events.push(Event {
            id: EventId(next_event_id),
            time: SimTime::from_secs(entry.at_s.max(0.0)),
            source: id,
            targets: vec![id],
            payload: EventPayload::PhyControl(entry.action),
        });
        next_event_id += 1;
    }

    let mut link_model = LinkModel::new();
    for link in model.links.values() {
        let from = node_ids
            .get(link.from.as_str())
            .ok_or_else(|| ModelError::NodeNotFound(link.from.clone()))?;
        let to = node_ids
            .get(link.to.as_str())
            .ok_or_else(|| ModelError::NodeNotFound(link.to.clone()))?;
        link_model.add_link(
            *from,
            *to,
            LinkParams {
                loss_db: link.loss_db,
                delay: link.delay,
            },
        );
    }
    entities.register(Box::new(Channel::new(channel_id, link_model.clone())));

    Ok(BuiltSimulation {
        entities,
        link_model,
        initial_events,
        node_infos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
defaults:
  phy:
    ed_threshold_dbm: -82
    capture:
      enabled: true
nodes:
  - name: ap
  - name: sta
    phy:
      channel_number: 6
      capture:
        margin_db: 10
    driver:
      rss_gate_dbm: -85
links:
  - from: ap
    to: sta
    loss_db: 70
    delay_ns: 100
    symmetric: true
traffic:
  - node: ap
    mode: ofdm-54
    interval_s: 0.001
    count: 5
control:
  - node: sta
    at_s: 0.002
    action: switch_channel
    channel: 1
  - node: sta
    at_s: 0.004
    action: sleep
simulation:
  duration_s: 0.01
  seed: 7
"#;

    #[test]
    fn test_layered_phy_config() {
        let model = load_model_from_str(BASIC).unwrap();
        let ap = model.find_node("ap").unwrap();
        assert_eq!(ap.phy.ed_threshold_dbm, -82.0);
        assert!(ap.phy.capture.enabled);
        assert_eq!(ap.phy.capture.margin_db, 6.0);
        assert_eq!(ap.phy.channel_number, 1);

        let sta = model.find_node("sta").unwrap();
        assert_eq!(sta.phy.ed_threshold_dbm, -82.0);
        assert!(sta.phy.capture.enabled);
        assert_eq!(sta.phy.capture.margin_db, 10.0);
        assert_eq!(sta.phy.channel_number, 6);
        assert_eq!(sta.driver, Some(DriverConfig { rss_gate_dbm: -85.0 }));
        assert_eq!(sta.role, "station");
    }

    #[test]
    fn test_links_control_and_simulation() {
        let model = load_model_from_str(BASIC).unwrap();
        assert_eq!(model.links().len(), 2);
        let link = &model.links()[&("sta".to_string(), "ap".to_string())];
        assert_eq!(link.loss_db, 70.0);
        assert_eq!(link.delay, SimTime::from_nanos(100));
        assert_eq!(model.control()[0].action, PhyControl::SwitchChannel { channel: 1 });
        assert_eq!(model.control()[1].action, PhyControl::Sleep);
        assert_eq!(model.simulation().seed, Some(7));
        assert_eq!(model.traffic()[0].count, Some(5));
    }

    #[test]
    fn test_later_files_override() {
        let overlay = r#"
defaults:
  phy:
    ed_threshold_dbm: -62
nodes:
  - name: sta
    phy:
      channel_number: 11
    role: monitor
  - name: extra
simulation:
  seed: 9
"#;
        let model = load_models_from_str(&[BASIC, overlay]).unwrap();
        assert_eq!(model.nodes().len(), 3);
        let sta = model.find_node("sta").unwrap();
        assert_eq!(sta.phy.ed_threshold_dbm, -62.0);
        assert_eq!(sta.phy.channel_number, 11);
        assert_eq!(sta.phy.capture.margin_db, 10.0);
        assert_eq!(sta.role, "monitor");
        assert_eq!(model.simulation().seed, Some(9));
        assert_eq!(model.simulation().duration_s, Some(0.01));
    }

    #[test]
    fn test_remove_node_drops_links() {
        let overlay = "nodes:\n  - name: sta\n    remove: true\n";
        let model = load_models_from_str(&[
            "nodes:\n  - name: ap\n  - name: sta\nlinks:\n  - from: ap\n    to: sta\n    symmetric: true\n",
            overlay,
        ])
        .unwrap();
        assert_eq!(model.nodes().len(), 1);
        assert!(model.links().is_empty());
    }

    #[test]
    fn test_invalid_references() {
        let bad_link = "nodes:\n  - name: ap\nlinks:\n  - from: ap\n    to: ghost\n";
        assert!(matches!(load_model_from_str(bad_link), Err(ModelError::InvalidLink { .. })));
        let bad_flow = "nodes:\n  - name: ap\ntraffic:\n  - node: ghost\n";
        assert!(matches!(load_model_from_str(bad_flow), Err(ModelError::NodeNotFound(_))));
        let bad_control = "nodes:\n  - name: ap\ncontrol:\n  - node: ghost\n    at_s: 1\n    action: sleep\n";
        assert!(matches!(load_model_from_str(bad_control), Err(ModelError::NodeNotFound(_))));
    }

    #[test]
    fn test_interval_must_advance_time() {
        for interval in ["0", "-0.5", "1.0e-10", ".nan", ".inf"] {
            let yaml = format!("nodes:\n  - name: ap\ntraffic:\n  - node: ap\n    interval_s: {}\n", interval);
            assert!(
                matches!(load_model_from_str(&yaml), Err(ModelError::InvalidConfig(_))),
                "interval {} accepted",
                interval
            );
        }
        let yaml = "nodes:\n  - name: ap\ntraffic:\n  - node: ap\n    interval_s: 1.0e-9\n";
        assert!(load_model_from_str(yaml).is_ok());
    }

    #[test]
    fn test_unknown_phy_key_rejected() {
        let yaml = "nodes:\n  - name: ap\n    phy:\n      ed_treshold_dbm: -82\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::YamlError(_))));
    }

    #[test]
    fn test_invalid_phy_values_rejected() {
        let yaml = "nodes:\n  - name: ap\n    phy:\n      tx_power_levels: 0\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_simulation() {
        let model = load_model_from_str(BASIC).unwrap();
        let built = build_simulation(&model, 7).unwrap();
        assert_eq!(built.entities.len(), 3);
        assert_eq!(built.link_model.len(), 2);
        // one flow start plus two control actions
        assert_eq!(built.initial_events.len(), 3);
        let names: Vec<_> = built.node_infos.iter().map(|n| (n.name.as_str(), n.entity_id)).collect();
        assert_eq!(names, vec![("ap", 1), ("sta", 2)]);
        assert_eq!(built.node_infos[1].frequency_mhz, 2437);
        let ids: Vec<u64> = built.initial_events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_load_model_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, BASIC.as_bytes()).unwrap();
        let model = load_model(file.path()).unwrap();
        assert_eq!(model.nodes().len(), 2);
        assert!(matches!(load_models(&[]), Err(ModelError::InvalidConfig(_))));
    }
}
