//! The engine: one plan, one clock, one tick pipeline.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use derivative::Derivative;
use parking_lot::Mutex;

use plexec_interval::IntervalSet;
use plexec_plan::{
    Emission, EventFlags, EventId, EventLink, FinalizationHandler, GeneratorKind, ObjectRef, Plan,
    PlanError, PlanId, TaskId, TaskLink, TaskSpec, TaskState, Value,
};
use plexec_sched::compute;
use plexec_temporal::{TemporalEngine, TemporalError};

use crate::{
    body::{BodyContext, EmissionRequest, TaskBody},
    error::EngineError,
    record::{Record, TickReport},
};

type Subscriber = Box<dyn FnMut(&Record)>;

/// Engine construction parameters.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Id of the plan this engine owns.
    pub plan: PlanId,

    /// Bound on propagation rounds within one emission delivery. A
    /// delivery that does not settle within this many rounds is cut and
    /// reported; the signal graph almost certainly contains a loop.
    pub propagation_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            plan: PlanId(0),
            propagation_limit: 64,
        }
    }
}

/// The executor facade.
///
/// Owns the plan and the temporal engine; everything mutates through the
/// engine so the observability stream sees every change.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Engine {
    config: EngineConfig,
    plan: Plan,
    temporal: TemporalEngine,
    #[derivative(Debug = "ignore")]
    bodies: BTreeMap<TaskId, Box<dyn TaskBody>>,
    queued: Vec<EmissionRequest>,
    pending_errors: Vec<EngineError>,
    #[derivative(Debug = "ignore")]
    subscribers: Mutex<Vec<Subscriber>>,
    #[derivative(Debug = "ignore")]
    cycle_end: Vec<Box<dyn FnMut(&TickReport)>>,
}

impl Engine {
    /// Create new engine owning an empty plan.
    pub fn new(config: EngineConfig) -> Self {
        let plan = Plan::new(config.plan);
        Engine {
            config,
            plan,
            temporal: TemporalEngine::new(),
            bodies: BTreeMap::new(),
            queued: Vec::new(),
            pending_errors: Vec::new(),
            subscribers: Mutex::new(Vec::new()),
            cycle_end: Vec::new(),
        }
    }

    /// Get the plan.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Get the temporal engine.
    pub fn temporal(&self) -> &TemporalEngine {
        &self.temporal
    }

    /// Subscribe to the observability stream. Subscribers must not block.
    pub fn subscribe(&self, subscriber: impl FnMut(&Record) + 'static) {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    /// Register a hook that runs at the end of every tick.
    pub fn at_cycle_end(&mut self, hook: impl FnMut(&TickReport) + 'static) {
        self.cycle_end.push(Box::new(hook));
    }

    fn publish(&self, record: &Record) {
        for subscriber in self.subscribers.lock().iter_mut() {
            subscriber(record);
        }
    }

    // === Plan construction ==============================================

    /// Add a task; `now` becomes its addition time.
    pub fn add_task(&mut self, now: f64, spec: TaskSpec) -> TaskId {
        let task = self.plan.add_task(now, spec);
        self.publish(&Record::TaskAdded { task });
        task
    }

    /// Finalize a task and drop the deadlines expecting its events.
    pub fn remove_task(&mut self, task: TaskId, now: f64) -> Result<(), EngineError> {
        let bound: Vec<EventId> = self
            .plan
            .task(task)?
            .events()
            .map(|(_, event)| event)
            .collect();
        self.plan.finalize_task(task, now)?;
        for event in bound {
            self.temporal.forget_target(event);
        }
        self.bodies.remove(&task);
        self.publish(&Record::TaskRemoved { task });
        Ok(())
    }

    /// Add a free, plan-owned event.
    pub fn add_free_event(&mut self, flags: EventFlags, kind: GeneratorKind) -> EventId {
        self.plan.add_free_event(flags, kind)
    }

    /// Add an event bound to a task.
    pub fn add_task_event(
        &mut self,
        task: TaskId,
        name: &str,
        flags: EventFlags,
        kind: GeneratorKind,
    ) -> Result<EventId, EngineError> {
        Ok(self.plan.add_task_event(task, name, flags, kind)?)
    }

    /// Remove a free event and drop the deadlines expecting it.
    pub fn remove_free_event(&mut self, event: EventId, now: f64) -> Result<(), EngineError> {
        self.plan.finalize_event(event, now)?;
        self.temporal.forget_target(event);
        Ok(())
    }

    /// Set whether the scheduler may start the task.
    pub fn set_task_executable(&mut self, task: TaskId, executable: bool) -> Result<(), EngineError> {
        Ok(self.plan.set_task_executable(task, executable)?)
    }

    /// Set one argument of the task.
    pub fn set_task_argument(
        &mut self,
        task: TaskId,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        Ok(self.plan.set_task_argument(task, key, value)?)
    }

    /// Install the body polled while the task runs.
    pub fn set_body(&mut self, task: TaskId, body: Box<dyn TaskBody>) -> Result<(), EngineError> {
        self.plan.task(task)?;
        self.bodies.insert(task, body);
        Ok(())
    }

    // === Relations ======================================================

    /// Add a data-less event-space edge.
    pub fn connect(
        &mut self,
        link: EventLink,
        source: EventId,
        target: EventId,
    ) -> Result<(), EngineError> {
        self.plan.link_events(link, source, target)?;
        self.publish(&Record::RelationAdded {
            kind: link.kind(),
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        Ok(())
    }

    /// Remove a data-less event-space edge.
    pub fn disconnect(
        &mut self,
        link: EventLink,
        source: EventId,
        target: EventId,
    ) -> Result<(), EngineError> {
        self.plan.unlink_events(link, source, target)?;
        self.publish(&Record::RelationRemoved {
            kind: link.kind(),
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        Ok(())
    }

    /// Add a data-less task-space edge.
    pub fn relate_tasks(
        &mut self,
        link: TaskLink,
        source: TaskId,
        target: TaskId,
    ) -> Result<(), EngineError> {
        self.plan.link_tasks(link, source, target)?;
        self.publish(&Record::RelationAdded {
            kind: link.kind(),
            source: ObjectRef::Task(source),
            target: ObjectRef::Task(target),
        });
        Ok(())
    }

    /// Remove a data-less task-space edge.
    pub fn unrelate_tasks(
        &mut self,
        link: TaskLink,
        source: TaskId,
        target: TaskId,
    ) -> Result<(), EngineError> {
        self.plan.unlink_tasks(link, source, target)?;
        self.publish(&Record::RelationRemoved {
            kind: link.kind(),
            source: ObjectRef::Task(source),
            target: ObjectRef::Task(target),
        });
        Ok(())
    }

    /// Declare that `parent` depends on `child`.
    pub fn depends_on(&mut self, parent: TaskId, child: TaskId) -> Result<(), EngineError> {
        self.relate_tasks(TaskLink::Dependency, parent, child)
    }

    /// Declare that `planner` produces `task`.
    pub fn planned_by(&mut self, task: TaskId, planner: TaskId) -> Result<(), EngineError> {
        self.relate_tasks(TaskLink::PlannedBy, task, planner)
    }

    /// Couple the start of `task` to the start of `other`.
    pub fn schedule_as(&mut self, task: TaskId, other: TaskId) -> Result<(), EngineError> {
        let source = self.plan.task(task)?.start_event();
        let target = self.plan.task(other)?.start_event();
        self.connect(EventLink::SchedulingConstraint, source, target)
    }

    /// Order the start of `task` after the start of `after`.
    pub fn should_start_after(&mut self, task: TaskId, after: TaskId) -> Result<(), EngineError> {
        let prerequisite = self.plan.task(after)?.start_event();
        self.plan.add_should_start_after(task, after, prerequisite)?;
        self.publish(&Record::RelationAdded {
            kind: plexec_plan::RelationKind::ShouldStartAfter,
            source: ObjectRef::Task(task),
            target: ObjectRef::Task(after),
        });
        Ok(())
    }

    /// Declare allowed time offsets between two emissions; the mirror
    /// constraint is installed automatically.
    pub fn add_temporal_constraint(
        &mut self,
        source: EventId,
        target: EventId,
        set: IntervalSet,
    ) -> Result<(), EngineError> {
        self.plan.add_temporal_constraint(source, target, set)?;
        self.publish(&Record::RelationAdded {
            kind: plexec_plan::RelationKind::TemporalConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        Ok(())
    }

    /// Bound the number of source emissions per target emission.
    pub fn add_occurrence_constraint(
        &mut self,
        source: EventId,
        target: EventId,
        min: u32,
        max: u32,
        recurrent: bool,
    ) -> Result<(), EngineError> {
        self.plan
            .add_occurrence_constraint(source, target, min, max, recurrent)?;
        self.publish(&Record::RelationAdded {
            kind: plexec_plan::RelationKind::OccurrenceConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        Ok(())
    }

    /// Register a finalization handler on a plan object.
    pub fn add_finalization_handler(
        &mut self,
        object: ObjectRef,
        handler: FinalizationHandler,
    ) -> Result<(), EngineError> {
        Ok(self.plan.add_finalization_handler(object, handler)?)
    }

    /// Register a callback for when the event becomes unreachable.
    pub fn if_unreachable(
        &mut self,
        event: EventId,
        callback: impl FnOnce(&mut Plan, EventId) + 'static,
    ) -> Result<(), EngineError> {
        Ok(self.plan.if_unreachable(event, callback)?)
    }

    // === Emission =======================================================

    /// Command an emission right away. Controllable events only.
    ///
    /// Structural and temporal failures of this emission surface here;
    /// failures of downstream propagated emissions are collected into the
    /// next tick report.
    pub fn emit(
        &mut self,
        event: EventId,
        now: f64,
        payload: Option<Value>,
    ) -> Result<(), EngineError> {
        if !self.plan.event(event)?.controllable() {
            return Err(PlanError::NotControllable.into());
        }
        self.deliver(event, now, payload)
    }

    /// Enqueue an emission for delivery at the next tick boundary.
    pub fn queue_emission(&mut self, event: EventId, payload: Option<Value>) {
        self.queued.push(EmissionRequest { event, payload });
    }

    /// Record that the event failed to emit. History is untouched; the
    /// event becomes unreachable and its pending deadlines are dropped.
    pub fn emit_failed(&mut self, event: EventId, reason: &str) -> Result<(), EngineError> {
        self.plan.event(event)?;
        log::warn!("event {:?} failed to emit: {}", event, reason);
        self.temporal.forget_target(event);
        self.plan.mark_unreachable(event)?;
        Ok(())
    }

    /// Command the task's `start` event.
    pub fn start_task(&mut self, task: TaskId, now: f64) -> Result<(), EngineError> {
        self.plan.mark_starting(task)?;
        let start = self.plan.task(task)?.start_event();
        self.deliver(start, now, None)
    }

    /// Command the task's `success` event.
    pub fn success_task(&mut self, task: TaskId, now: f64) -> Result<(), EngineError> {
        let success = self.plan.task(task)?.success_event();
        self.emit(success, now, None)
    }

    /// Command the task's `failed` event.
    pub fn fail_task(&mut self, task: TaskId, now: f64) -> Result<(), EngineError> {
        let failed = self.plan.task(task)?.failed_event();
        self.emit(failed, now, None)
    }

    /// Command the task's `stop` event.
    pub fn stop_task(&mut self, task: TaskId, now: f64) -> Result<(), EngineError> {
        let stop = self.plan.task(task)?.stop_event();
        self.emit(stop, now, None)
    }

    // === The tick =======================================================

    /// Run one tick at the fixed clock value `now`.
    ///
    /// Order within the tick is strict: deliver queued emissions, check
    /// deadlines, compute the startable set, command the starts, poll
    /// running bodies, run cycle-end hooks. Structural and temporal
    /// failures are accumulated in the report, never swallowed; panics
    /// are reserved for kernel invariant violations.
    pub fn tick(&mut self, now: f64) -> TickReport {
        #[cfg(feature = "profiler")]
        thread_profiler::profile_scope!("tick");

        let guard = relevant::Relevant;
        let mut errors = mem::replace(&mut self.pending_errors, Vec::new());

        // (b) deliveries queued by the previous tick's bodies and by
        // external collaborators.
        let queued = mem::replace(&mut self.queued, Vec::new());
        for request in queued {
            let result = match self.plan.event(request.event) {
                Err(error) => Err(error.into()),
                Ok(record) if !record.controllable() => Err(PlanError::NotControllable.into()),
                Ok(_) => self.deliver(request.event, now, request.payload),
            };
            if let Err(error) = result {
                log::debug!("queued emission failed: {}", error);
                errors.push(error);
            }
        }
        errors.append(&mut self.pending_errors);

        // (c) deadline check.
        for deadline in self.temporal.check_deadlines(&self.plan, now) {
            log::warn!(
                "deadline {} for {:?} -> {:?} missed",
                deadline.at,
                deadline.source,
                deadline.target
            );
            errors.push(EngineError::Temporal(TemporalError::MissedDeadline {
                source: deadline.source,
                target: deadline.target,
                deadline: deadline.at,
            }));
        }

        // (d) the scheduling decision.
        let resolution = compute(&self.plan, &self.temporal, now);

        // (e) start commands, in the scheduler's order.
        let mut started = Vec::new();
        for &task in &resolution.startable {
            match self.start_task(task, now) {
                Ok(()) => started.push(task),
                Err(error) => {
                    log::warn!("start of {:?} failed: {}", task, error);
                    errors.push(error);
                }
            }
        }
        errors.append(&mut self.pending_errors);

        // Bodies run after the starts so a task started this tick is
        // polled for the first time in the same cycle.
        self.poll_bodies(now);

        let report = TickReport {
            now,
            started,
            errors,
            refused: resolution.refused().cloned().collect(),
        };
        self.publish(&Record::TickReport(report.clone()));

        // (f) cycle end.
        let mut hooks = mem::replace(&mut self.cycle_end, Vec::new());
        for hook in hooks.iter_mut() {
            hook(&report);
        }
        hooks.extend(mem::replace(&mut self.cycle_end, Vec::new()));
        self.cycle_end = hooks;

        guard.dispose();
        report
    }

    fn poll_bodies(&mut self, now: f64) {
        let plan = &self.plan;
        let mut requests = Vec::new();
        for (&task, body) in self.bodies.iter_mut() {
            let running = plan
                .task(task)
                .map(|record| record.state() == TaskState::Running)
                .unwrap_or(false);
            if !running {
                continue;
            }
            let emissions = body.poll(BodyContext { task, plan, now });
            requests.extend(emissions.into_requests());
        }
        self.queued.extend(requests);
    }

    // === Emission pipeline ==============================================

    fn check_emittable(&self, event: EventId, now: f64) -> Result<(), EngineError> {
        self.temporal.emittable_at(&self.plan, event, now)?;
        self.temporal.check_occurrence(&self.plan, event)?;
        Ok(())
    }

    fn apply_emission(&mut self, event: EventId, emission: Emission) -> Result<(), EngineError> {
        let time = emission.time;
        let payload = emission.payload.clone();
        self.plan.append_emission(event, emission)?;
        self.temporal.note_emission(&self.plan, event, time);
        self.temporal.commit_occurrence(&mut self.plan, event);
        self.publish(&Record::Emitted {
            event,
            time,
            payload,
        });
        Ok(())
    }

    /// Deliver one validated root emission and propagate it breadth-first
    /// through the signal and forward graphs.
    fn deliver(
        &mut self,
        root: EventId,
        now: f64,
        payload: Option<Value>,
    ) -> Result<(), EngineError> {
        self.check_emittable(root, now)?;
        self.apply_emission(root, Emission::commanded(now, payload.clone()))?;

        let mut queue: VecDeque<(EventId, Option<Value>, usize)> = VecDeque::new();
        queue.push_back((root, payload, 0));
        while let Some((source, payload, depth)) = queue.pop_front() {
            if depth >= self.config.propagation_limit {
                log::error!(
                    "propagation from {:?} did not settle within {} rounds",
                    root,
                    self.config.propagation_limit
                );
                self.pending_errors
                    .push(EngineError::PropagationLoop(self.config.propagation_limit));
                break;
            }
            let signalled: Vec<EventId> = self
                .plan
                .relations()
                .signal()
                .out_edges(source)
                .map(|(target, _)| target)
                .collect();
            let forwarded: Vec<EventId> = self
                .plan
                .relations()
                .forward()
                .out_edges(source)
                .map(|(target, _)| target)
                .collect();
            for target in signalled {
                self.feed(&mut queue, target, source, now, payload.as_ref(), depth, true);
            }
            for target in forwarded {
                self.feed(&mut queue, target, source, now, payload.as_ref(), depth, false);
            }
        }
        Ok(())
    }

    /// Advance one propagation target. Signals command the target and
    /// require controllability; forwards replay the emission directly.
    /// Combinator generators consume the parent emission instead.
    fn feed(
        &mut self,
        queue: &mut VecDeque<(EventId, Option<Value>, usize)>,
        target: EventId,
        source: EventId,
        now: f64,
        payload: Option<&Value>,
        depth: usize,
        is_signal: bool,
    ) {
        let (kind, controllable, dead) = match self.plan.event(target) {
            Ok(record) => (
                record.kind().clone(),
                record.controllable(),
                record.is_finalized() || record.is_unreachable(),
            ),
            Err(error) => {
                self.pending_errors.push(error.into());
                return;
            }
        };
        if dead {
            log::debug!("propagation into dead event {:?} dropped", target);
            return;
        }

        let outcome: Option<Option<Value>> = match kind {
            GeneratorKind::Plain => {
                if is_signal && !controllable {
                    self.pending_errors
                        .push(PlanError::NotControllable.into());
                    None
                } else {
                    Some(payload.cloned())
                }
            }
            GeneratorKind::And { mut seen } => {
                if !seen.contains(&source) {
                    seen.push(source);
                }
                let parents: BTreeSet<EventId> = self
                    .plan
                    .relations()
                    .signal()
                    .in_edges(target)
                    .chain(self.plan.relations().forward().in_edges(target))
                    .collect();
                let complete = parents.iter().all(|parent| seen.contains(parent));
                let next = if complete {
                    seen.clear();
                    Some(None)
                } else {
                    None
                };
                *self.plan.generator_kind_mut(target) = GeneratorKind::And { seen };
                next
            }
            GeneratorKind::Or { fired } => {
                if fired {
                    None
                } else {
                    *self.plan.generator_kind_mut(target) = GeneratorKind::Or { fired: true };
                    Some(payload.cloned())
                }
            }
            GeneratorKind::Filter { predicate } => {
                if predicate(payload) {
                    Some(payload.cloned())
                } else {
                    None
                }
            }
            GeneratorKind::Until { limit, expired } => {
                if source == limit {
                    *self.plan.generator_kind_mut(target) = GeneratorKind::Until {
                        limit,
                        expired: true,
                    };
                    None
                } else if expired {
                    None
                } else {
                    Some(payload.cloned())
                }
            }
        };

        let emitted_payload = match outcome {
            Some(value) => value,
            None => return,
        };

        if let Err(error) = self.check_emittable(target, now) {
            log::debug!("propagated emission of {:?} forbidden: {}", target, error);
            self.pending_errors.push(error);
            return;
        }
        let emission = Emission::propagated(now, emitted_payload.clone(), source);
        match self.apply_emission(target, emission) {
            Ok(()) => queue.push_back((target, emitted_payload, depth + 1)),
            Err(error) => self.pending_errors.push(error),
        }
    }
}
