//! End-to-end scenarios driven through the engine tick.

use plexec_engine::{
    BodyContext, Emissions, Engine, EngineConfig, EngineError, Record, TaskBody,
};
use plexec_interval::IntervalSet;
use plexec_plan::{
    EventFlags, EventLink, GeneratorKind, TaskId, TaskSpec, TaskState, Value,
};
use plexec_temporal::TemporalError;

use std::cell::RefCell;
use std::rc::Rc;

fn init_log() {
    let _ = simple_logger::SimpleLogger::new().init();
}

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

fn spec(executable: bool) -> TaskSpec {
    TaskSpec {
        executable,
        ..TaskSpec::default()
    }
}

#[test]
fn a_sequence_starts_one_task_per_prerequisite() {
    init_log();
    let mut engine = engine();
    let a = engine.add_task(0.0, spec(true));
    let b = engine.add_task(0.0, spec(true));
    engine.should_start_after(b, a).unwrap();

    let report = engine.tick(0.0);
    assert_eq!(report.started, vec![a]);
    assert!(report.errors.is_empty());

    let report = engine.tick(1.0);
    assert_eq!(report.started, vec![b]);

    assert_eq!(engine.plan().task(a).unwrap().state(), TaskState::Running);
    assert_eq!(engine.plan().task(b).unwrap().state(), TaskState::Running);
}

#[test]
fn occurrence_constraints_meter_commanded_emissions() {
    init_log();
    let mut engine = engine();
    let a = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let b = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    engine.add_occurrence_constraint(a, b, 1, 2, true).unwrap();

    // No source emission yet.
    assert_eq!(
        engine.emit(b, 0.0, None),
        Err(EngineError::Temporal(
            TemporalError::OccurrenceConstraintViolation {
                source: a,
                target: b
            }
        ))
    );
    assert_eq!(engine.plan().event(b).unwrap().count(), 0);

    engine.emit(a, 1.0, None).unwrap();
    engine.emit(b, 2.0, None).unwrap();
    assert_eq!(engine.plan().event(b).unwrap().count(), 1);

    // The recurrent epoch advanced; b needs a fresh a emission.
    assert_eq!(
        engine.emit(b, 3.0, None),
        Err(EngineError::Temporal(
            TemporalError::OccurrenceConstraintViolation {
                source: a,
                target: b
            }
        ))
    );
}

#[test]
fn missed_deadlines_surface_in_the_tick_report() {
    init_log();
    let mut engine = engine();
    let a = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let b = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    engine
        .add_temporal_constraint(a, b, IntervalSet::from_bounds(0.0, 10.0))
        .unwrap();

    engine.emit(a, 0.0, None).unwrap();

    // Within the window nothing is reported.
    let report = engine.tick(10.0);
    assert!(report.errors.is_empty());

    let report = engine.tick(11.0);
    assert_eq!(
        report.errors,
        vec![EngineError::Temporal(TemporalError::MissedDeadline {
            source: a,
            target: b,
            deadline: 10.0
        })]
    );

    // The deadline was consumed; it is not reported twice.
    let report = engine.tick(12.0);
    assert!(report.errors.is_empty());
}

#[test]
fn a_parent_waits_for_its_child() {
    init_log();
    let mut engine = engine();
    let parent = engine.add_task(0.0, spec(true));
    let child = engine.add_task(0.0, spec(true));
    engine.depends_on(parent, child).unwrap();
    engine.should_start_after(parent, child).unwrap();

    let report = engine.tick(0.0);
    assert_eq!(report.started, vec![child]);
    assert_eq!(report.refused.len(), 1);

    let report = engine.tick(1.0);
    assert_eq!(report.started, vec![parent]);
}

#[test]
fn coupled_tasks_start_together_or_not_at_all() {
    init_log();
    let mut engine = engine();
    let a = engine.add_task(0.0, spec(true));
    let b = engine.add_task(0.0, spec(false));
    engine.schedule_as(a, b).unwrap();
    engine.schedule_as(b, a).unwrap();

    let report = engine.tick(0.0);
    assert_eq!(report.started, Vec::<TaskId>::new());
    assert_eq!(report.refused.len(), 1);

    engine.set_task_executable(b, true).unwrap();
    let report = engine.tick(1.0);
    assert_eq!(report.started, vec![a, b]);
}

#[test]
fn a_planner_runs_before_the_task_it_plans() {
    init_log();
    let mut engine = engine();
    let planned = engine.add_task(0.0, spec(false));
    let planner = engine.add_task(0.0, spec(true));
    engine.planned_by(planned, planner).unwrap();
    engine.schedule_as(planner, planned).unwrap();

    let report = engine.tick(0.0);
    assert_eq!(report.started, vec![planner]);

    engine.success_task(planner, 1.0).unwrap();
    assert_eq!(
        engine.plan().task(planner).unwrap().state(),
        TaskState::Succeeded
    );
    engine.set_task_executable(planned, true).unwrap();

    let report = engine.tick(2.0);
    assert_eq!(report.started, vec![planned]);
}

#[test]
fn finalized_tasks_are_never_started() {
    init_log();
    let mut engine = engine();
    let task = engine.add_task(0.0, spec(true));
    engine.remove_task(task, 1.0).unwrap();

    let report = engine.tick(2.0);
    assert_eq!(report.started, Vec::<TaskId>::new());
    assert!(report.errors.is_empty());
}

#[test]
fn identical_plans_schedule_identically() {
    init_log();
    let build = || {
        let mut engine = engine();
        let mut tasks = Vec::new();
        for i in 0..8 {
            tasks.push(engine.add_task((i % 3) as f64, spec(true)));
        }
        engine.depends_on(tasks[0], tasks[3]).unwrap();
        engine.should_start_after(tasks[5], tasks[2]).unwrap();
        engine.schedule_as(tasks[6], tasks[7]).unwrap();
        engine
    };

    let first = build().tick(4.0);
    let second = build().tick(4.0);
    assert_eq!(first.started, second.started);
    assert_eq!(first.errors, second.errors);
}

#[test]
fn terminal_events_forward_to_stop() {
    init_log();
    let mut engine = engine();
    let task = engine.add_task(0.0, spec(true));

    let _ = engine.tick(0.0);
    engine.success_task(task, 1.0).unwrap();

    let record = engine.plan().task(task).unwrap();
    assert_eq!(record.state(), TaskState::Succeeded);
    let stop = record.stop_event();
    assert_eq!(engine.plan().event(stop).unwrap().count(), 1);
}

struct OneShot;

impl TaskBody for OneShot {
    fn poll(&mut self, ctx: BodyContext<'_>) -> Emissions {
        let success = ctx.plan.task(ctx.task).unwrap().success_event();
        Emissions::none().emit_with(success, Value::from("done"))
    }
}

#[test]
fn bodies_emit_on_the_next_tick() {
    init_log();
    let mut engine = engine();
    let task = engine.add_task(0.0, spec(true));
    engine.set_body(task, Box::new(OneShot)).unwrap();

    let report = engine.tick(0.0);
    assert_eq!(report.started, vec![task]);
    assert_eq!(engine.plan().task(task).unwrap().state(), TaskState::Running);

    // The body's success request is delivered at the next tick boundary.
    let report = engine.tick(1.0);
    assert!(report.errors.is_empty());
    assert_eq!(
        engine.plan().task(task).unwrap().state(),
        TaskState::Succeeded
    );
}

#[test]
fn and_generators_wait_for_every_parent() {
    init_log();
    let mut engine = engine();
    let left = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let right = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let both = engine.add_free_event(
        EventFlags::empty(),
        GeneratorKind::And {
            seen: Default::default(),
        },
    );
    engine.connect(EventLink::Signal, left, both).unwrap();
    engine.connect(EventLink::Signal, right, both).unwrap();

    engine.emit(left, 0.0, None).unwrap();
    assert_eq!(engine.plan().event(both).unwrap().count(), 0);

    engine.emit(right, 1.0, None).unwrap();
    assert_eq!(engine.plan().event(both).unwrap().count(), 1);
}

#[test]
fn or_generators_fire_once_then_stay_quiet() {
    init_log();
    let mut engine = engine();
    let left = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let right = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let first = engine.add_free_event(EventFlags::empty(), GeneratorKind::Or { fired: false });
    engine.connect(EventLink::Signal, left, first).unwrap();
    engine.connect(EventLink::Signal, right, first).unwrap();

    engine
        .emit(left, 0.0, Some(Value::from("winner")))
        .unwrap();
    assert_eq!(engine.plan().event(first).unwrap().count(), 1);
    assert_eq!(
        engine.plan().event(first).unwrap().last().unwrap().payload,
        Some(Value::from("winner"))
    );

    // Later parents are dropped, the other parent included.
    engine.emit(right, 1.0, None).unwrap();
    engine.emit(left, 2.0, None).unwrap();
    assert_eq!(engine.plan().event(first).unwrap().count(), 1);
}

#[test]
fn filter_generators_forward_matching_payloads_only() {
    init_log();
    let mut engine = engine();
    let source = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let predicate: Rc<dyn Fn(Option<&Value>) -> bool> =
        Rc::new(|payload| matches!(payload, Some(Value::Int(value)) if *value > 0));
    let positive = engine.add_free_event(EventFlags::empty(), GeneratorKind::Filter { predicate });
    engine.connect(EventLink::Signal, source, positive).unwrap();

    engine.emit(source, 0.0, Some(Value::Int(-3))).unwrap();
    engine.emit(source, 1.0, None).unwrap();
    assert_eq!(engine.plan().event(positive).unwrap().count(), 0);

    engine.emit(source, 2.0, Some(Value::Int(5))).unwrap();
    assert_eq!(engine.plan().event(positive).unwrap().count(), 1);
    assert_eq!(
        engine.plan().event(positive).unwrap().last().unwrap().payload,
        Some(Value::Int(5))
    );

    // The gate keeps filtering afterwards.
    engine.emit(source, 3.0, Some(Value::Int(-1))).unwrap();
    assert_eq!(engine.plan().event(positive).unwrap().count(), 1);
}

#[test]
fn until_generators_forward_until_the_limit_emits() {
    init_log();
    let mut engine = engine();
    let source = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let limit = engine.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
    let gated = engine.add_free_event(
        EventFlags::empty(),
        GeneratorKind::Until {
            limit,
            expired: false,
        },
    );
    engine.connect(EventLink::Signal, source, gated).unwrap();
    engine.connect(EventLink::Signal, limit, gated).unwrap();

    engine.emit(source, 0.0, None).unwrap();
    engine.emit(source, 1.0, None).unwrap();
    assert_eq!(engine.plan().event(gated).unwrap().count(), 2);

    // The limit emission shuts the gate without emitting through it.
    engine.emit(limit, 2.0, None).unwrap();
    assert_eq!(engine.plan().event(gated).unwrap().count(), 2);

    engine.emit(source, 3.0, None).unwrap();
    assert_eq!(engine.plan().event(gated).unwrap().count(), 2);
}

#[test]
fn the_stream_reports_emissions_and_ticks() {
    init_log();
    let mut engine = engine();
    let records = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&records);
    engine.subscribe(move |record: &Record| sink.borrow_mut().push(format!("{:?}", record)));

    let task = engine.add_task(0.0, spec(true));
    let _ = engine.tick(0.0);
    engine.success_task(task, 1.0).unwrap();

    let records = records.borrow();
    assert!(records.iter().any(|r| r.starts_with("TaskAdded")));
    assert!(records.iter().any(|r| r.starts_with("Emitted")));
    assert!(records.iter().any(|r| r.starts_with("TickReport")));
}
