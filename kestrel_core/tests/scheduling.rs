use kestrel_core::{
    Component, ComponentManager, ComponentState, ContinuousMode, KestrelError, KestrelResult,
    Passive, Requirement, StateElement, Task, TaskConfig, TaskContext,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct RunRecord {
    run: u64,
    started: Instant,
    overruns_at_start: u64,
    commands_at_start: u64,
}

/// Sleeps longer than its period on the third run only
struct SlowThird {
    runs: u64,
    records: Arc<Mutex<Vec<RunRecord>>>,
}

impl Component for SlowThird {
    fn run(&mut self, ctx: &mut TaskContext) {
        self.runs += 1;
        let metrics = ctx.metrics();
        self.records.lock().push(RunRecord {
            run: self.runs,
            started: ctx.cycle_start(),
            overruns_at_start: metrics.overruns,
            commands_at_start: metrics.commands_executed,
        });
        if self.runs == 3 {
            std::thread::sleep(Duration::from_millis(15));
        }
    }
}

#[test]
fn single_slow_cycle_counts_one_overrun() {
    let task = Task::periodic("slow_third", Duration::from_millis(10)).unwrap();
    let pings = Arc::new(AtomicU64::new(0));
    let counter = pings.clone();
    task.add_interface_provided("Prov")
        .unwrap()
        .add_command_void("Ping", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let records = Arc::new(Mutex::new(Vec::new()));
    task.set_component(SlowThird {
        runs: 0,
        records: records.clone(),
    })
    .unwrap();

    let client = kestrel_core::Device::new("pinger").unwrap();
    let required = client
        .add_interface_required("Req", Requirement::Mandatory)
        .unwrap();
    let ping = required
        .add_function_void("Ping", Requirement::Mandatory)
        .unwrap();
    required
        .connect_to(&task.component_core().provided_interface("Prov").unwrap())
        .unwrap();

    task.create().unwrap();
    task.start().unwrap();

    // One queued command per cycle; every drain must pick it up
    let mut sent = 0u64;
    while records.lock().len() < 5 {
        ping.call().unwrap();
        sent += 1;
        std::thread::sleep(Duration::from_millis(10));
        assert!(sent < 300, "task stopped running");
    }
    task.kill().unwrap();
    assert!(task.wait_to_terminate(Some(TIMEOUT)));

    let records = records.lock();
    let by_run = |run: u64| records.iter().find(|r| r.run == run).cloned().unwrap();
    assert_eq!(by_run(1).overruns_at_start, 0);
    assert_eq!(by_run(3).overruns_at_start, 0);
    assert_eq!(by_run(4).overruns_at_start, 1);
    assert_eq!(by_run(5).overruns_at_start, 1);

    let metrics = task.metrics();
    assert_eq!(metrics.overruns, 1);
    assert!(metrics.last_overrun_cycle.is_some());

    // Cycles around the slow one keep the nominal spacing
    let gap = |a: u64, b: u64| by_run(b).started.duration_since(by_run(a).started);
    assert!(gap(1, 2) >= Duration::from_millis(5) && gap(1, 2) <= Duration::from_millis(30));
    assert!(gap(4, 5) >= Duration::from_millis(5) && gap(4, 5) <= Duration::from_millis(30));
    assert!(gap(3, 4) >= Duration::from_millis(15));

    // Pings sent while running were drained cycle after cycle, including around the slow one
    assert!(by_run(5).commands_at_start > by_run(1).commands_at_start);
    assert!(pings.load(Ordering::SeqCst) >= sent.saturating_sub(2));
}

#[test]
fn kill_twice_stays_finished() {
    let task = Task::periodic("twice", Duration::from_millis(2)).unwrap();
    task.set_component(Passive).unwrap();
    task.create().unwrap();
    task.start().unwrap();

    task.kill().unwrap();
    assert!(task.wait_to_terminate(Some(TIMEOUT)));
    assert_eq!(task.state(), ComponentState::Finished);

    task.kill().unwrap();
    assert_eq!(task.state(), ComponentState::Finished);
    assert!(task.wait_to_terminate(Some(TIMEOUT)));
    assert!(matches!(
        task.start(),
        Err(KestrelError::Lifecycle {
            state: ComponentState::Finished,
            ..
        })
    ));
}

#[test]
fn unconnected_mandatory_interface_blocks_startup() {
    let manager = ComponentManager::new();
    let task = manager
        .add_task(Task::periodic("orphan", Duration::from_millis(5)).unwrap())
        .unwrap();
    task.set_component(Passive).unwrap();
    task.add_interface_required("Sensor", Requirement::Mandatory)
        .unwrap();
    task.add_interface_required("Logger", Requirement::Optional)
        .unwrap();

    assert!(manager.create_all_and_wait(Duration::from_millis(500)).is_err());
    assert!(task.wait_to_terminate(Some(TIMEOUT)));
    assert_eq!(task.metrics().runs, 0);
}

#[test]
fn signal_driven_task_sleeps_until_work_arrives() {
    let task = Task::continuous("on_demand", ContinuousMode::FromSignal).unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let sink = hits.clone();
    task.add_interface_provided("Prov")
        .unwrap()
        .add_command_write("Add", move |v: &u64| {
            sink.fetch_add(*v, Ordering::SeqCst);
        })
        .unwrap();
    task.set_component(Passive).unwrap();

    let client = kestrel_core::Device::new("client").unwrap();
    let required = client
        .add_interface_required("Req", Requirement::Mandatory)
        .unwrap();
    let add = required
        .add_function_write::<u64>("Add", Requirement::Mandatory)
        .unwrap();
    required
        .connect_to(&task.component_core().provided_interface("Prov").unwrap())
        .unwrap();

    task.create().unwrap();
    task.start().unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let idle_cycles = task.metrics().cycles;
    // Waiting on the signal, not spinning
    assert!(idle_cycles < 10, "idle task ran {} cycles", idle_cycles);

    let started = Instant::now();
    add.call_blocking(&5).unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(hits.load(Ordering::SeqCst), 5);

    let killed = Instant::now();
    task.kill().unwrap();
    assert!(task.wait_to_terminate(Some(TIMEOUT)));
    assert!(killed.elapsed() < Duration::from_millis(250));
}

struct Integrator {
    velocity: f64,
    position: Option<StateElement<f64>>,
}

impl Component for Integrator {
    fn configure(&mut self, ctx: &mut TaskContext, params: &kestrel_core::ComponentParams) -> KestrelResult<()> {
        self.velocity = params.get_or("velocity", 1.0);
        self.position = Some(ctx.state_table_mut().new_element("position", 0.0f64)?);
        Ok(())
    }

    fn run(&mut self, _ctx: &mut TaskContext) {
        if let Some(position) = &self.position {
            let velocity = self.velocity;
            position.modify(|p| *p += velocity);
        }
    }
}

#[test]
fn state_table_is_published_every_cycle() {
    let task = Task::new(
        TaskConfig::periodic("integrator", Duration::from_millis(2)).with_state_table_size(32),
    )
    .unwrap();
    task.set_params(
        kestrel_core::ComponentParams::new()
            .with("velocity", 0.5f64)
            .unwrap(),
    );
    task.set_component(Integrator {
        velocity: 0.0,
        position: None,
    })
    .unwrap();

    task.create().unwrap();
    assert!(task.wait_to_start(Some(TIMEOUT)));
    let reader = task.state_table();
    let position = reader.accessor::<f64>("position").unwrap();
    assert_eq!(position.get_latest().unwrap(), 0.0);

    task.start().unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while position.get_latest().unwrap() < 5.0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    task.kill().unwrap();
    assert!(task.wait_to_terminate(Some(TIMEOUT)));

    let latest = position.get_latest().unwrap();
    assert!(latest >= 5.0);
    let previous = position.get_ago(1).unwrap();
    assert!(latest - previous == 0.0 || latest - previous == 0.5);
    assert!(reader.average_period() > 0.0);
}

#[test]
fn realtime_request_falls_back_to_normal_priority() {
    // Without CAP_SYS_NICE promotion fails; the task must keep running either way
    let task = Task::new(
        TaskConfig::periodic("rt", Duration::from_millis(2)).with_realtime(10, None),
    )
    .unwrap();
    let runs = Arc::new(AtomicU64::new(0));

    struct Count(Arc<AtomicU64>);
    impl Component for Count {
        fn run(&mut self, _ctx: &mut TaskContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    task.set_component(Count(runs.clone())).unwrap();
    task.create().unwrap();
    task.start().unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while runs.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    task.kill().unwrap();
    assert!(task.wait_to_terminate(Some(TIMEOUT)));
    assert!(runs.load(Ordering::SeqCst) >= 5);
}
