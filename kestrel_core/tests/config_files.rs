use kestrel_core::{
    Component, ComponentManager, ComponentParams, Device, KestrelResult, ManagerConfig,
    Requirement, TaskContext,
};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const TOML_CONFIG: &str = r#"
[components.joint]
gain = 4.0
label = "elbow"

[[connections]]
client = "joint"
required = "Encoder"
server = "encoder"
provided = "Encoder"
"#;

const YAML_CONFIG: &str = r#"
components:
  joint:
    gain: 4.0
    label: elbow
connections:
  - client: joint
    required: Encoder
    server: encoder
    provided: Encoder
"#;

#[test]
fn formats_are_detected_by_extension() {
    let toml = ManagerConfig::from_file(write_config(".toml", TOML_CONFIG).path()).unwrap();
    let yaml = ManagerConfig::from_file(write_config(".yaml", YAML_CONFIG).path()).unwrap();
    let json_text = serde_json::to_string_pretty(&toml).unwrap();
    let json = ManagerConfig::from_file(write_config(".json", &json_text).path()).unwrap();

    assert_eq!(toml, yaml);
    assert_eq!(toml, json);
    assert_eq!(toml.params_for("joint").unwrap().get::<f64>("gain"), Some(4.0));

    // Unknown extension: try each format in turn
    let unknown = ManagerConfig::from_file(write_config(".conf", YAML_CONFIG).path()).unwrap();
    assert_eq!(unknown, toml);
}

#[test]
fn unreadable_or_malformed_files_are_config_errors() {
    let missing = ManagerConfig::from_file("/nonexistent/kestrel/manager.toml");
    assert!(matches!(missing, Err(kestrel_core::KestrelError::Config(_))));

    let broken = write_config(".toml", "[components.joint\ngain = ");
    assert!(matches!(
        ManagerConfig::from_file(broken.path()),
        Err(kestrel_core::KestrelError::Config(_))
    ));
}

struct Joint {
    seen: Arc<Mutex<Option<(f64, String)>>>,
}

impl Component for Joint {
    fn configure(&mut self, _ctx: &mut TaskContext, params: &ComponentParams) -> KestrelResult<()> {
        *self.seen.lock() = Some((params.get_or("gain", 1.0), params.get_or("label", String::new())));
        Ok(())
    }

    fn run(&mut self, _ctx: &mut TaskContext) {}
}

#[test]
fn applied_config_reaches_components() {
    let manager = ComponentManager::new();
    let encoder = manager.add_device(Device::new("encoder").unwrap()).unwrap();
    encoder
        .add_interface_provided("Encoder")
        .unwrap()
        .add_command_read("Ticks", || 1024u32)
        .unwrap();

    let joint = manager.add_device(Device::new("joint").unwrap()).unwrap();
    let ticks = joint
        .add_interface_required("Encoder", Requirement::Mandatory)
        .unwrap()
        .add_function_read::<u32>("Ticks", Requirement::Mandatory)
        .unwrap();
    let seen = Arc::new(Mutex::new(None));
    joint.set_component(Joint { seen: seen.clone() }).unwrap();

    let config = ManagerConfig::from_file(write_config(".toml", TOML_CONFIG).path()).unwrap();
    manager.apply_config(&config).unwrap();
    manager
        .create_all_and_wait(Duration::from_secs(3))
        .unwrap();

    assert_eq!(*seen.lock(), Some((4.0, "elbow".to_string())));
    assert_eq!(ticks.call().unwrap(), 1024);
    assert_eq!(manager.connections(), config.connections);

    let mut unknown = config.clone();
    unknown.components.insert("ghost".to_string(), ComponentParams::new());
    assert!(manager.apply_config(&unknown).is_err());

    manager.kill_all_and_wait(Duration::from_secs(3)).unwrap();
}
