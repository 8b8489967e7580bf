use kestrel::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Gains {
    kp: f64,
    kd: f64,
}

struct Controller {
    gains: Option<Gains>,
    sensor: FunctionRead<f64>,
    command: FunctionWrite<f64>,
    output: Option<StateElement<f64>>,
}

impl Component for Controller {
    fn configure(&mut self, ctx: &mut TaskContext, params: &ComponentParams) -> KestrelResult<()> {
        self.gains = params.get("gains");
        if self.gains.is_none() {
            return Err(KestrelError::config("controller needs 'gains'"));
        }
        self.output = Some(ctx.state_table_mut().new_element("output", 0.0)?);
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) {
        let (Some(gains), Some(output)) = (&self.gains, &self.output) else {
            return;
        };
        match self.sensor.call() {
            Ok(position) => {
                let effort = -gains.kp * position;
                output.set(effort);
                if let Err(e) = self.command.call(&effort) {
                    ctx.log_warning(&format!("actuator rejected command: {}", e));
                }
            }
            Err(e) => ctx.log_error(&format!("sensor read failed: {}", e)),
        }
    }
}

fn plant(manager: &ComponentManager, commands: Arc<AtomicU32>) -> AnyResult<()> {
    let device = manager.add_device(Device::new("plant")?)?;
    let provided = device.add_interface_provided("Plant")?;
    provided.add_command_read("Position", || 2.0f64)?;
    provided.add_command_write("Effort", move |_: &f64| {
        commands.fetch_add(1, Ordering::SeqCst);
    })?;
    Ok(())
}

#[test]
fn closed_loop_through_the_prelude() -> AnyResult<()> {
    let manager = ComponentManager::new();
    let commands = Arc::new(AtomicU32::new(0));
    plant(&manager, commands.clone())?;

    let task = manager.add_task(Task::periodic("controller", Duration::from_millis(2))?)?;
    let required = task.add_interface_required("Plant", Requirement::Mandatory)?;
    let sensor = required.add_function_read::<f64>("Position", Requirement::Mandatory)?;
    let command = required.add_function_write::<f64>("Effort", Requirement::Mandatory)?;
    task.set_component(Controller {
        gains: None,
        sensor,
        command,
        output: None,
    })?;
    task.set_params(ComponentParams::new().with("gains", Gains { kp: 1.5, kd: 0.1 })?);

    manager.connect("controller", "Plant", "plant", "Plant")?;
    manager.create_all_and_wait(Duration::from_secs(3))?;
    manager.start_all_and_wait(Duration::from_secs(3))?;

    let deadline = Instant::now() + Duration::from_secs(3);
    while commands.load(Ordering::SeqCst) < 5 {
        ensure!(Instant::now() < deadline, "controller never drove the plant");
        std::thread::sleep(Duration::from_millis(2));
    }
    manager.kill_all_and_wait(Duration::from_secs(3))?;

    let output = task.state_table().accessor::<f64>("output")?;
    assert_eq!(output.get_latest()?, -3.0);
    assert_eq!(task.metrics().errors_count, 0);
    Ok(())
}

#[test]
fn configure_errors_surface_from_create() -> AnyResult<()> {
    let manager = ComponentManager::new();
    plant(&manager, Arc::new(AtomicU32::new(0)))?;
    let task = manager.add_task(Task::periodic("controller", Duration::from_millis(2))?)?;
    let required = task.add_interface_required("Plant", Requirement::Mandatory)?;
    task.set_component(Controller {
        gains: None,
        sensor: required.add_function_read("Position", Requirement::Mandatory)?,
        command: required.add_function_write("Effort", Requirement::Mandatory)?,
        output: None,
    })?;

    let err = task.create().unwrap_err();
    assert!(err.to_string().contains("gains"));
    assert_eq!(task.state(), ComponentState::Finished);
    Ok(())
}

#[test]
fn version_matches_manifest() {
    assert_eq!(kestrel::version(), env!("CARGO_PKG_VERSION"));
    assert!(!kestrel::VERSION.is_empty());
}
