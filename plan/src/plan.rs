//! The plan: arena-owned tasks and events plus their relation tables.

use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use derivative::Derivative;
use fnv::FnvHashMap;
use plexec_interval::IntervalSet;

use crate::{
    error::PlanError,
    event::{Emission, Event, EventFlags, EventOwner, GeneratorKind},
    relations::{EventLink, OccurrenceData, PlanRelations, RelationKind, TaskLink},
    task::{Task, TaskState},
    value::Value,
    EventId, PlanId, TaskId,
};

/// A handle to either kind of plan object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectRef {
    /// A task handle.
    Task(TaskId),

    /// An event handle.
    Event(EventId),
}

/// One structural mutation of a plan.
///
/// Handed to the transaction observer before the mutation commits.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// A task is being added.
    TaskAdded(TaskId),

    /// A task is being finalized.
    TaskRemoved(TaskId),

    /// An event is being added.
    EventAdded(EventId),

    /// An event is being finalized.
    EventRemoved(EventId),

    /// An emission is being appended to an event history.
    Emitted {
        /// Emitting event.
        event: EventId,

        /// Emission time.
        time: f64,
    },

    /// A relation edge is being added.
    RelationAdded {
        /// Relation kind.
        kind: RelationKind,

        /// Edge source.
        source: ObjectRef,

        /// Edge target.
        target: ObjectRef,
    },

    /// A relation edge is being removed.
    RelationRemoved {
        /// Relation kind.
        kind: RelationKind,

        /// Edge source.
        source: ObjectRef,

        /// Edge target.
        target: ObjectRef,
    },

    /// An event is being marked unreachable.
    EventUnreachable(EventId),

    /// A task is being replaced by another.
    TaskReplaced {
        /// Task giving up its weak edges.
        from: TaskId,

        /// Task receiving them.
        to: TaskId,
    },
}

/// Transaction observer notified before each mutation commits.
pub trait PlanObserver {
    /// Called with the mutation about to commit.
    fn before_mutation(&mut self, plan: PlanId, mutation: &Mutation);
}

/// A finalization handler attached to a plan object.
///
/// Handlers run in registration order when the object is finalized. They
/// receive the plan, so a handler may queue further mutations.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct FinalizationHandler {
    #[derivative(Debug = "ignore")]
    callback: Rc<dyn Fn(&mut Plan, ObjectRef, f64)>,
    copy_on_replace: bool,
}

impl FinalizationHandler {
    /// Create new handler.
    pub fn new(callback: impl Fn(&mut Plan, ObjectRef, f64) + 'static) -> Self {
        FinalizationHandler {
            callback: Rc::new(callback),
            copy_on_replace: false,
        }
    }

    /// Create new handler that is re-installed on the replacement object
    /// when its owner is replaced.
    pub fn copied_on_replace(callback: impl Fn(&mut Plan, ObjectRef, f64) + 'static) -> Self {
        FinalizationHandler {
            callback: Rc::new(callback),
            copy_on_replace: true,
        }
    }

    /// Check if the handler follows replacements.
    pub fn is_copied_on_replace(&self) -> bool {
        self.copy_on_replace
    }
}

type UnreachableHandler = Box<dyn FnOnce(&mut Plan, EventId)>;

/// Construction parameters for a task.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    /// Whether the scheduler may start the task.
    pub executable: bool,

    /// Initial argument mapping.
    pub arguments: BTreeMap<String, Value>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        TaskSpec {
            executable: true,
            arguments: BTreeMap::new(),
        }
    }
}

/// The collection of tasks, events and relations owned by one engine.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Plan {
    id: PlanId,
    executable: bool,
    tasks: Vec<Task>,
    events: Vec<Event>,
    relations: PlanRelations,
    task_handlers: FnvHashMap<TaskId, Vec<FinalizationHandler>>,
    event_handlers: FnvHashMap<EventId, Vec<FinalizationHandler>>,
    task_hooks: Vec<FinalizationHandler>,
    #[derivative(Debug = "ignore")]
    unreachable_handlers: FnvHashMap<EventId, Vec<UnreachableHandler>>,
    #[derivative(Debug = "ignore")]
    observer: Option<Box<dyn PlanObserver>>,
}

impl Plan {
    /// Create new empty plan.
    pub fn new(id: PlanId) -> Self {
        Plan {
            id,
            executable: true,
            tasks: Vec::new(),
            events: Vec::new(),
            relations: PlanRelations::new(),
            task_handlers: FnvHashMap::default(),
            event_handlers: FnvHashMap::default(),
            task_hooks: Vec::new(),
            unreachable_handlers: FnvHashMap::default(),
            observer: None,
        }
    }

    /// Get the plan id.
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// Check if model-level finalization hooks fire for this plan.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Set whether model-level finalization hooks fire.
    pub fn set_executable(&mut self, executable: bool) {
        self.executable = executable;
    }

    /// Install the transaction observer, returning the previous one.
    pub fn set_observer(&mut self, observer: Box<dyn PlanObserver>) -> Option<Box<dyn PlanObserver>> {
        self.observer.replace(observer)
    }

    /// Remove the transaction observer.
    pub fn take_observer(&mut self) -> Option<Box<dyn PlanObserver>> {
        self.observer.take()
    }

    fn notify(&mut self, mutation: Mutation) {
        if let Some(observer) = self.observer.as_mut() {
            observer.before_mutation(self.id, &mutation);
        }
    }

    // === Object access ===================================================

    /// Get a task by id.
    pub fn task(&self, id: TaskId) -> Result<&Task, PlanError> {
        if id.plan != self.id {
            return Err(PlanError::UnknownObject);
        }
        self.tasks.get(id.index()).ok_or(PlanError::UnknownObject)
    }

    /// Get an event by id.
    pub fn event(&self, id: EventId) -> Result<&Event, PlanError> {
        if id.plan != self.id {
            return Err(PlanError::UnknownObject);
        }
        self.events.get(id.index()).ok_or(PlanError::UnknownObject)
    }

    /// Iterate over all tasks in id order, finalized ones included.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Iterate over all events in id order, finalized ones included.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Get the relation tables.
    pub fn relations(&self) -> &PlanRelations {
        &self.relations
    }

    fn live_task(&self, id: TaskId) -> Result<&Task, PlanError> {
        let task = self.task(id)?;
        if task.is_finalized() {
            return Err(PlanError::FinalizedObject);
        }
        Ok(task)
    }

    fn live_event(&self, id: EventId) -> Result<&Event, PlanError> {
        let event = self.event(id)?;
        if event.is_finalized() {
            return Err(PlanError::FinalizedObject);
        }
        Ok(event)
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.index()]
    }

    fn event_mut(&mut self, id: EventId) -> &mut Event {
        &mut self.events[id.index()]
    }

    // === Object construction =============================================

    fn push_event(&mut self, owner: EventOwner, flags: EventFlags, kind: GeneratorKind) -> EventId {
        let id = EventId::new(self.id, self.events.len() as u32);
        self.notify(Mutation::EventAdded(id));
        self.events.push(Event {
            id,
            owner,
            flags,
            kind,
            history: Vec::new(),
            finalized_at: None,
            unreachable: false,
        });
        id
    }

    /// Add a task together with its standard `start`, `success`, `failed`
    /// and `stop` events. `success` and `failed` are forwarded to `stop`.
    pub fn add_task(&mut self, now: f64, spec: TaskSpec) -> TaskId {
        let id = TaskId::new(self.id, self.tasks.len() as u32);
        self.notify(Mutation::TaskAdded(id));

        let bound = |name: &str| EventOwner::Bound {
            task: id,
            name: name.to_string(),
        };
        let start = self.push_event(bound("start"), EventFlags::CONTROLLABLE, GeneratorKind::Plain);
        let success = self.push_event(
            bound("success"),
            EventFlags::CONTROLLABLE | EventFlags::TERMINAL,
            GeneratorKind::Plain,
        );
        let failed = self.push_event(
            bound("failed"),
            EventFlags::CONTROLLABLE | EventFlags::TERMINAL,
            GeneratorKind::Plain,
        );
        let stop = self.push_event(
            bound("stop"),
            EventFlags::CONTROLLABLE | EventFlags::TERMINAL,
            GeneratorKind::Plain,
        );

        let mut bound_events = BTreeMap::new();
        bound_events.insert("start".to_string(), start);
        bound_events.insert("success".to_string(), success);
        bound_events.insert("failed".to_string(), failed);
        bound_events.insert("stop".to_string(), stop);

        self.tasks.push(Task {
            id,
            state: TaskState::Pending,
            executable: spec.executable,
            addition_time: now,
            finalized_at: None,
            arguments: spec.arguments,
            start,
            success,
            failed,
            stop,
            bound_events,
        });

        // Terminal events reach `stop` through the regular relation
        // machinery so propagation sees nothing special about them.
        self.link_events(EventLink::Forward, success, stop)
            .expect("fresh standard events cannot carry edges");
        self.link_events(EventLink::Forward, failed, stop)
            .expect("fresh standard events cannot carry edges");

        log::trace!("plan {:?}: task {:?} added at {}", self.id, id, now);
        id
    }

    /// Add a free, plan-owned event.
    pub fn add_free_event(&mut self, flags: EventFlags, kind: GeneratorKind) -> EventId {
        let id = self.push_event(EventOwner::Free, flags, kind);
        log::trace!("plan {:?}: free event {:?} added", self.id, id);
        id
    }

    /// Add an event bound to a task. The name must be unique within the
    /// task.
    pub fn add_task_event(
        &mut self,
        task: TaskId,
        name: &str,
        flags: EventFlags,
        kind: GeneratorKind,
    ) -> Result<EventId, PlanError> {
        self.live_task(task)?;
        if self.task(task)?.event(name).is_some() {
            return Err(PlanError::DuplicateEventName);
        }
        let id = self.push_event(
            EventOwner::Bound {
                task,
                name: name.to_string(),
            },
            flags,
            kind,
        );
        self.task_mut(task)
            .bound_events
            .insert(name.to_string(), id);
        Ok(id)
    }

    /// Set whether the scheduler may start the task.
    pub fn set_task_executable(&mut self, task: TaskId, executable: bool) -> Result<(), PlanError> {
        self.live_task(task)?;
        self.task_mut(task).executable = executable;
        Ok(())
    }

    /// Set one argument of the task.
    pub fn set_task_argument(
        &mut self,
        task: TaskId,
        key: &str,
        value: Value,
    ) -> Result<(), PlanError> {
        self.live_task(task)?;
        self.task_mut(task).arguments.insert(key.to_string(), value);
        Ok(())
    }

    /// Record that the scheduler committed to starting the task.
    pub fn mark_starting(&mut self, task: TaskId) -> Result<(), PlanError> {
        self.live_task(task)?;
        let task = self.task_mut(task);
        if task.state == TaskState::Pending {
            task.state = TaskState::Starting;
        }
        Ok(())
    }

    // === Relations =======================================================

    fn check_event_pair(&self, source: EventId, target: EventId) -> Result<(), PlanError> {
        if source.plan != target.plan {
            return Err(PlanError::CrossPlanEdge);
        }
        self.live_event(source)?;
        self.live_event(target)?;
        Ok(())
    }

    fn check_task_pair(&self, source: TaskId, target: TaskId) -> Result<(), PlanError> {
        if source.plan != target.plan {
            return Err(PlanError::CrossPlanEdge);
        }
        self.live_task(source)?;
        self.live_task(target)?;
        Ok(())
    }

    /// Add a data-less event-space edge.
    pub fn link_events(
        &mut self,
        link: EventLink,
        source: EventId,
        target: EventId,
    ) -> Result<(), PlanError> {
        self.check_event_pair(source, target)?;
        let kind = link.kind();
        if self.relations.event_set_mut(link).contains(source, target) {
            return Err(PlanError::DuplicateEdge(kind));
        }
        self.notify(Mutation::RelationAdded {
            kind,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        self.relations
            .event_set_mut(link)
            .add(source, target, ())
            .map_err(|_| PlanError::DuplicateEdge(kind))
    }

    /// Remove a data-less event-space edge.
    pub fn unlink_events(
        &mut self,
        link: EventLink,
        source: EventId,
        target: EventId,
    ) -> Result<(), PlanError> {
        let kind = link.kind();
        if !self.relations.event_set_mut(link).contains(source, target) {
            return Err(PlanError::NoSuchEdge(kind));
        }
        self.notify(Mutation::RelationRemoved {
            kind,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        self.relations
            .event_set_mut(link)
            .remove(source, target)
            .map(|_| ())
            .map_err(|_| PlanError::NoSuchEdge(kind))
    }

    /// Add a data-less task-space edge.
    pub fn link_tasks(
        &mut self,
        link: TaskLink,
        source: TaskId,
        target: TaskId,
    ) -> Result<(), PlanError> {
        self.check_task_pair(source, target)?;
        let kind = link.kind();
        if self.relations.task_set_mut(link).contains(source, target) {
            return Err(PlanError::DuplicateEdge(kind));
        }
        self.notify(Mutation::RelationAdded {
            kind,
            source: ObjectRef::Task(source),
            target: ObjectRef::Task(target),
        });
        self.relations
            .task_set_mut(link)
            .add(source, target, ())
            .map_err(|_| PlanError::DuplicateEdge(kind))
    }

    /// Remove a data-less task-space edge.
    pub fn unlink_tasks(
        &mut self,
        link: TaskLink,
        source: TaskId,
        target: TaskId,
    ) -> Result<(), PlanError> {
        let kind = link.kind();
        if !self.relations.task_set_mut(link).contains(source, target) {
            return Err(PlanError::NoSuchEdge(kind));
        }
        self.notify(Mutation::RelationRemoved {
            kind,
            source: ObjectRef::Task(source),
            target: ObjectRef::Task(target),
        });
        self.relations
            .task_set_mut(link)
            .remove(source, target)
            .map(|_| ())
            .map_err(|_| PlanError::NoSuchEdge(kind))
    }

    /// Declare allowed time offsets between `source` and `target`
    /// emissions.
    ///
    /// Declaring `source -> target` over `[a, b]` also installs the mirror
    /// `target -> source` over `[-b, -a]`; both sides are canonicalized
    /// against previously declared constraints.
    pub fn add_temporal_constraint(
        &mut self,
        source: EventId,
        target: EventId,
        set: IntervalSet,
    ) -> Result<(), PlanError> {
        self.check_event_pair(source, target)?;
        self.notify(Mutation::RelationAdded {
            kind: RelationKind::TemporalConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        let mirror = set.negated();
        Self::upsert_temporal(&mut self.relations, source, target, set);
        Self::upsert_temporal(&mut self.relations, target, source, mirror);
        Ok(())
    }

    fn upsert_temporal(relations: &mut PlanRelations, source: EventId, target: EventId, set: IntervalSet) {
        if let Some(existing) = relations.temporal.edge_data_mut(source, target) {
            existing.union(&set);
        } else {
            relations
                .temporal
                .add(source, target, set)
                .expect("edge presence was checked above");
        }
    }

    /// Remove a temporal constraint together with its mirror.
    pub fn remove_temporal_constraint(
        &mut self,
        source: EventId,
        target: EventId,
    ) -> Result<(), PlanError> {
        if !self.relations.temporal.contains(source, target) {
            return Err(PlanError::NoSuchEdge(RelationKind::TemporalConstraint));
        }
        self.notify(Mutation::RelationRemoved {
            kind: RelationKind::TemporalConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        self.relations
            .temporal
            .remove(source, target)
            .map_err(|_| PlanError::NoSuchEdge(RelationKind::TemporalConstraint))?;
        let _ = self.relations.temporal.remove(target, source);
        Ok(())
    }

    /// Bound the number of `source` emissions per `target` emission.
    pub fn add_occurrence_constraint(
        &mut self,
        source: EventId,
        target: EventId,
        min: u32,
        max: u32,
        recurrent: bool,
    ) -> Result<(), PlanError> {
        self.check_event_pair(source, target)?;
        if self.relations.occurrence.contains(source, target) {
            return Err(PlanError::DuplicateEdge(RelationKind::OccurrenceConstraint));
        }
        self.notify(Mutation::RelationAdded {
            kind: RelationKind::OccurrenceConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        self.relations
            .occurrence
            .add(source, target, OccurrenceData::new(min, max, recurrent))
            .map_err(|_| PlanError::DuplicateEdge(RelationKind::OccurrenceConstraint))
    }

    /// Remove an occurrence constraint.
    pub fn remove_occurrence_constraint(
        &mut self,
        source: EventId,
        target: EventId,
    ) -> Result<(), PlanError> {
        if !self.relations.occurrence.contains(source, target) {
            return Err(PlanError::NoSuchEdge(RelationKind::OccurrenceConstraint));
        }
        self.notify(Mutation::RelationRemoved {
            kind: RelationKind::OccurrenceConstraint,
            source: ObjectRef::Event(source),
            target: ObjectRef::Event(target),
        });
        self.relations
            .occurrence
            .remove(source, target)
            .map(|_| ())
            .map_err(|_| PlanError::NoSuchEdge(RelationKind::OccurrenceConstraint))
    }

    /// Get mutable occurrence-constraint data. The temporal engine uses
    /// this to advance recurrent epochs.
    pub fn occurrence_data_mut(
        &mut self,
        source: EventId,
        target: EventId,
    ) -> Option<&mut OccurrenceData> {
        self.relations.occurrence.edge_data_mut(source, target)
    }

    /// Declare that `task` may start only once `prerequisite` has emitted.
    /// The edge is kept on the task pair; the prerequisite is usually the
    /// start event of `after`.
    pub fn add_should_start_after(
        &mut self,
        task: TaskId,
        after: TaskId,
        prerequisite: EventId,
    ) -> Result<(), PlanError> {
        self.check_task_pair(task, after)?;
        if prerequisite.plan != self.id {
            return Err(PlanError::CrossPlanEdge);
        }
        self.live_event(prerequisite)?;
        if self.relations.should_start_after.contains(task, after) {
            return Err(PlanError::DuplicateEdge(RelationKind::ShouldStartAfter));
        }
        self.notify(Mutation::RelationAdded {
            kind: RelationKind::ShouldStartAfter,
            source: ObjectRef::Task(task),
            target: ObjectRef::Task(after),
        });
        self.relations
            .should_start_after
            .add(task, after, prerequisite)
            .map_err(|_| PlanError::DuplicateEdge(RelationKind::ShouldStartAfter))
    }

    /// Remove a should-start-after edge.
    pub fn remove_should_start_after(
        &mut self,
        task: TaskId,
        after: TaskId,
    ) -> Result<(), PlanError> {
        if !self.relations.should_start_after.contains(task, after) {
            return Err(PlanError::NoSuchEdge(RelationKind::ShouldStartAfter));
        }
        self.notify(Mutation::RelationRemoved {
            kind: RelationKind::ShouldStartAfter,
            source: ObjectRef::Task(task),
            target: ObjectRef::Task(after),
        });
        self.relations
            .should_start_after
            .remove(task, after)
            .map(|_| ())
            .map_err(|_| PlanError::NoSuchEdge(RelationKind::ShouldStartAfter))
    }

    // === Emissions =======================================================

    /// Append an emission to the event history and drive the owning task's
    /// state machine.
    ///
    /// Structural rules only: temporal and occurrence constraints are the
    /// emission pipeline's business, controllability is checked at the
    /// command boundary.
    pub fn append_emission(&mut self, event: EventId, emission: Emission) -> Result<(), PlanError> {
        self.live_event(event)?;
        if self.event(event)?.unreachable {
            return Err(PlanError::UnreachableEvent);
        }
        self.notify(Mutation::Emitted {
            event,
            time: emission.time,
        });
        self.event_mut(event).history.push(emission);
        self.apply_task_transition(event);
        Ok(())
    }

    fn apply_task_transition(&mut self, event: EventId) {
        let owner = match self.events[event.index()].owner.task() {
            Some(task) => task,
            None => return,
        };
        let (start, success, failed, stop) = {
            let task = &self.tasks[owner.index()];
            (task.start, task.success, task.failed, task.stop)
        };
        let new_state = if event == start {
            Some(TaskState::Running)
        } else if event == success || event == failed {
            Some(TaskState::Finishing)
        } else if event == stop {
            if self.events[success.index()].emitted() {
                Some(TaskState::Succeeded)
            } else {
                Some(TaskState::Failed)
            }
        } else {
            None
        };
        if let Some(state) = new_state {
            let task = self.task_mut(owner);
            log::trace!("task {:?}: {:?} -> {:?}", owner, task.state, state);
            task.state = state;
        }
    }

    /// Get mutable generator state. The propagation pipeline uses this to
    /// advance combinator generators.
    pub fn generator_kind_mut(&mut self, event: EventId) -> &mut GeneratorKind {
        &mut self.events[event.index()].kind
    }

    // === Unreachability ==================================================

    /// Register a callback for when the event becomes unreachable. If it
    /// already is, the callback runs immediately.
    pub fn if_unreachable(
        &mut self,
        event: EventId,
        callback: impl FnOnce(&mut Plan, EventId) + 'static,
    ) -> Result<(), PlanError> {
        self.event(event)?;
        if self.event(event)?.unreachable {
            callback(self, event);
            return Ok(());
        }
        self.unreachable_handlers
            .entry(event)
            .or_insert_with(Vec::new)
            .push(Box::new(callback));
        Ok(())
    }

    /// Mark the event as unable to ever emit again and fire the registered
    /// callbacks.
    pub fn mark_unreachable(&mut self, event: EventId) -> Result<(), PlanError> {
        self.event(event)?;
        if self.event(event)?.unreachable {
            return Ok(());
        }
        self.notify(Mutation::EventUnreachable(event));
        self.event_mut(event).unreachable = true;
        let handlers = self.unreachable_handlers.remove(&event).unwrap_or_default();
        for handler in handlers {
            handler(self, event);
        }
        Ok(())
    }

    // === Finalization ====================================================

    /// Register a finalization handler on a plan object.
    pub fn add_finalization_handler(
        &mut self,
        object: ObjectRef,
        handler: FinalizationHandler,
    ) -> Result<(), PlanError> {
        match object {
            ObjectRef::Task(task) => {
                self.live_task(task)?;
                self.task_handlers
                    .entry(task)
                    .or_insert_with(Vec::new)
                    .push(handler);
            }
            ObjectRef::Event(event) => {
                self.live_event(event)?;
                self.event_handlers
                    .entry(event)
                    .or_insert_with(Vec::new)
                    .push(handler);
            }
        }
        Ok(())
    }

    /// Register a model-level hook that runs for every task finalization
    /// while the plan is executable.
    pub fn add_task_finalization_hook(&mut self, handler: FinalizationHandler) {
        self.task_hooks.push(handler);
    }

    fn finalize_event_record(&mut self, event: EventId, now: f64) {
        self.notify(Mutation::EventRemoved(event));
        let severed = self.relations.sever_event(event);
        for (kind, source, target) in severed {
            self.notify(Mutation::RelationRemoved {
                kind,
                source: ObjectRef::Event(source),
                target: ObjectRef::Event(target),
            });
        }
        self.event_mut(event).finalized_at = Some(now);
        // Finalized generators cannot emit; reachability callbacks fire
        // before the handlers below so they observe the severed state.
        let _ = self.mark_unreachable(event);
        let handlers = self.event_handlers.remove(&event).unwrap_or_default();
        for handler in &handlers {
            (handler.callback)(self, ObjectRef::Event(event), now);
        }
    }

    /// Remove a free event from the plan.
    pub fn finalize_event(&mut self, event: EventId, now: f64) -> Result<(), PlanError> {
        self.live_event(event)?;
        if self.event(event)?.owner.task().is_some() {
            return Err(PlanError::TaskOwnedEvent);
        }
        self.finalize_event_record(event, now);
        log::trace!("plan {:?}: event {:?} finalized at {}", self.id, event, now);
        Ok(())
    }

    /// Remove a task from the plan: sever its relations, finalize its
    /// bound events and run finalization handlers in registration order.
    pub fn finalize_task(&mut self, task: TaskId, now: f64) -> Result<(), PlanError> {
        self.live_task(task)?;
        self.notify(Mutation::TaskRemoved(task));

        let severed = self.relations.sever_task(task);
        for (kind, source, target) in severed {
            self.notify(Mutation::RelationRemoved {
                kind,
                source: ObjectRef::Task(source),
                target: ObjectRef::Task(target),
            });
        }

        let bound: Vec<EventId> = self.tasks[task.index()]
            .bound_events
            .values()
            .copied()
            .collect();
        for event in bound {
            if !self.events[event.index()].is_finalized() {
                self.finalize_event_record(event, now);
            }
        }

        self.task_mut(task).finalized_at = Some(now);

        let handlers = self.task_handlers.remove(&task).unwrap_or_default();
        for handler in &handlers {
            (handler.callback)(self, ObjectRef::Task(task), now);
        }
        if self.executable {
            let mut hooks = mem::replace(&mut self.task_hooks, Vec::new());
            for hook in &hooks {
                (hook.callback)(self, ObjectRef::Task(task), now);
            }
            hooks.extend(mem::replace(&mut self.task_hooks, Vec::new()));
            self.task_hooks = hooks;
        }

        log::trace!("plan {:?}: task {:?} finalized at {}", self.id, task, now);
        Ok(())
    }

    // === Replacement =====================================================

    /// Replace `from` by `to`: weak task edges and weak edges of the
    /// standard event pairs move over with their data, strong relations
    /// stay, and finalization handlers flagged `copy_on_replace` are
    /// re-installed on `to` (while `from` keeps them).
    pub fn replace_task(&mut self, from: TaskId, to: TaskId) -> Result<(), PlanError> {
        self.check_task_pair(from, to)?;
        self.notify(Mutation::TaskReplaced { from, to });

        let (severed, created) = self.relations.dependency.replace_vertex(from, to);
        self.notify_task_edges(RelationKind::Dependency, &severed, &created);
        let (severed, created) = self.relations.should_start_after.replace_vertex(from, to);
        self.notify_task_edges(RelationKind::ShouldStartAfter, &severed, &created);

        let pairs = {
            let from_task = self.task(from)?;
            let to_task = self.task(to)?;
            [
                (from_task.start, to_task.start),
                (from_task.success, to_task.success),
                (from_task.failed, to_task.failed),
                (from_task.stop, to_task.stop),
            ]
        };
        for (from_event, to_event) in pairs.iter().copied() {
            self.replace_event_edges(from_event, to_event);
        }

        let copied: Vec<FinalizationHandler> = self
            .task_handlers
            .get(&from)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|handler| handler.copy_on_replace)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !copied.is_empty() {
            self.task_handlers
                .entry(to)
                .or_insert_with(Vec::new)
                .extend(copied);
        }
        Ok(())
    }

    fn notify_task_edges(
        &mut self,
        kind: RelationKind,
        severed: &[(TaskId, TaskId)],
        created: &[(TaskId, TaskId)],
    ) {
        for &(source, target) in severed {
            self.notify(Mutation::RelationRemoved {
                kind,
                source: ObjectRef::Task(source),
                target: ObjectRef::Task(target),
            });
        }
        for &(source, target) in created {
            self.notify(Mutation::RelationAdded {
                kind,
                source: ObjectRef::Task(source),
                target: ObjectRef::Task(target),
            });
        }
    }

    fn notify_event_edges(
        &mut self,
        kind: RelationKind,
        severed: &[(EventId, EventId)],
        created: &[(EventId, EventId)],
    ) {
        for &(source, target) in severed {
            self.notify(Mutation::RelationRemoved {
                kind,
                source: ObjectRef::Event(source),
                target: ObjectRef::Event(target),
            });
        }
        for &(source, target) in created {
            self.notify(Mutation::RelationAdded {
                kind,
                source: ObjectRef::Event(source),
                target: ObjectRef::Event(target),
            });
        }
    }

    fn replace_event_edges(&mut self, from: EventId, to: EventId) {
        let (severed, created) = self.relations.signal.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::Signal, &severed, &created);
        let (severed, created) = self.relations.forward.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::Forward, &severed, &created);
        let (severed, created) = self.relations.causal_link.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::CausalLink, &severed, &created);
        let (severed, created) = self.relations.precedence.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::Precedence, &severed, &created);
        let (severed, created) = self.relations.temporal.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::TemporalConstraint, &severed, &created);
        let (severed, created) = self.relations.occurrence.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::OccurrenceConstraint, &severed, &created);
        let (severed, created) = self.relations.scheduling.replace_vertex(from, to);
        self.notify_event_edges(RelationKind::SchedulingConstraint, &severed, &created);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn plan() -> Plan {
        Plan::new(PlanId(0))
    }

    #[test]
    fn add_task_creates_standard_events() {
        let mut plan = plan();
        let task = plan.add_task(0.0, TaskSpec::default());

        let record = plan.task(task).unwrap();
        assert_eq!(record.state(), TaskState::Pending);
        assert!(record.executable());
        assert_eq!(record.addition_time(), 0.0);

        let start = plan.event(record.start_event()).unwrap();
        assert!(start.controllable());
        assert!(!start.terminal());

        let success = plan.event(record.success_event()).unwrap();
        assert!(success.controllable());
        assert!(success.terminal());

        // Terminal events are wired to stop through the forward relation.
        let stop = plan.task(task).unwrap().stop_event();
        assert!(plan
            .relations()
            .forward()
            .contains(plan.task(task).unwrap().success_event(), stop));
        assert!(plan
            .relations()
            .forward()
            .contains(plan.task(task).unwrap().failed_event(), stop));
    }

    #[test]
    fn emissions_drive_the_task_state_machine() {
        let mut plan = plan();
        let task = plan.add_task(0.0, TaskSpec::default());
        let (start, success, stop) = {
            let record = plan.task(task).unwrap();
            (
                record.start_event(),
                record.success_event(),
                record.stop_event(),
            )
        };

        plan.append_emission(start, Emission::commanded(1.0, None))
            .unwrap();
        assert_eq!(plan.task(task).unwrap().state(), TaskState::Running);

        plan.append_emission(success, Emission::commanded(2.0, None))
            .unwrap();
        assert_eq!(plan.task(task).unwrap().state(), TaskState::Finishing);

        plan.append_emission(stop, Emission::propagated(2.0, None, success))
            .unwrap();
        assert_eq!(plan.task(task).unwrap().state(), TaskState::Succeeded);
    }

    #[test]
    fn stop_without_success_fails_the_task() {
        let mut plan = plan();
        let task = plan.add_task(0.0, TaskSpec::default());
        let (failed, stop) = {
            let record = plan.task(task).unwrap();
            (record.failed_event(), record.stop_event())
        };
        plan.append_emission(failed, Emission::commanded(1.0, None))
            .unwrap();
        plan.append_emission(stop, Emission::propagated(1.0, None, failed))
            .unwrap();
        assert_eq!(plan.task(task).unwrap().state(), TaskState::Failed);
    }

    #[test]
    fn cross_plan_edges_are_rejected() {
        let mut left = Plan::new(PlanId(0));
        let mut right = Plan::new(PlanId(1));
        let a = left.add_task(0.0, TaskSpec::default());
        let b = right.add_task(0.0, TaskSpec::default());

        assert_eq!(
            left.link_tasks(TaskLink::Dependency, a, b),
            Err(PlanError::CrossPlanEdge)
        );
        let a_start = left.task(a).unwrap().start_event();
        let b_start = right.task(b).unwrap().start_event();
        assert_eq!(
            left.link_events(EventLink::Signal, a_start, b_start),
            Err(PlanError::CrossPlanEdge)
        );
    }

    #[test]
    fn duplicate_edges_are_rejected() {
        let mut plan = plan();
        let a = plan.add_task(0.0, TaskSpec::default());
        let b = plan.add_task(0.0, TaskSpec::default());
        plan.link_tasks(TaskLink::Dependency, a, b).unwrap();
        assert_eq!(
            plan.link_tasks(TaskLink::Dependency, a, b),
            Err(PlanError::DuplicateEdge(RelationKind::Dependency))
        );
    }

    #[test]
    fn temporal_constraints_install_their_mirror() {
        let mut plan = plan();
        let a = plan.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
        let b = plan.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);

        plan.add_temporal_constraint(a, b, IntervalSet::from_bounds(1.0, 5.0))
            .unwrap();

        let forward = plan.relations().temporal().edge_data(a, b).unwrap();
        assert_eq!(forward, &IntervalSet::from_bounds(1.0, 5.0));
        let mirror = plan.relations().temporal().edge_data(b, a).unwrap();
        assert_eq!(mirror, &IntervalSet::from_bounds(-5.0, -1.0));
    }

    #[test]
    fn finalized_tasks_reject_mutation() {
        let mut plan = plan();
        let task = plan.add_task(0.0, TaskSpec::default());
        let other = plan.add_task(0.0, TaskSpec::default());
        plan.finalize_task(task, 3.0).unwrap();

        assert_eq!(plan.task(task).unwrap().finalized_at(), Some(3.0));
        assert_eq!(
            plan.set_task_executable(task, false),
            Err(PlanError::FinalizedObject)
        );
        assert_eq!(
            plan.link_tasks(TaskLink::Dependency, task, other),
            Err(PlanError::FinalizedObject)
        );
        assert_eq!(
            plan.finalize_task(task, 4.0),
            Err(PlanError::FinalizedObject)
        );

        let start = plan.task(task).unwrap().start_event();
        assert_eq!(
            plan.append_emission(start, Emission::commanded(4.0, None)),
            Err(PlanError::FinalizedObject)
        );
    }

    #[test]
    fn finalization_severs_relations_and_runs_handlers_in_order() {
        let mut plan = plan();
        let a = plan.add_task(0.0, TaskSpec::default());
        let b = plan.add_task(0.0, TaskSpec::default());
        plan.link_tasks(TaskLink::Dependency, a, b).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"].iter().copied() {
            let order = Rc::clone(&order);
            plan.add_finalization_handler(
                ObjectRef::Task(a),
                FinalizationHandler::new(move |_, _, _| order.borrow_mut().push(tag)),
            )
            .unwrap();
        }

        plan.finalize_task(a, 1.0).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert!(!plan.relations().dependency().contains(a, b));
    }

    #[test]
    fn unreachable_callbacks_fire_once() {
        let mut plan = plan();
        let event = plan.add_free_event(EventFlags::CONTROLLABLE, GeneratorKind::Plain);
        let fired = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&fired);
        plan.if_unreachable(event, move |_, _| *counter.borrow_mut() += 1)
            .unwrap();
        plan.mark_unreachable(event).unwrap();
        plan.mark_unreachable(event).unwrap();
        assert_eq!(*fired.borrow(), 1);

        // Registration after the fact runs immediately.
        let counter = Rc::clone(&fired);
        plan.if_unreachable(event, move |_, _| *counter.borrow_mut() += 1)
            .unwrap();
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    fn replace_task_moves_weak_edges_and_copied_handlers() {
        let mut plan = plan();
        let a = plan.add_task(0.0, TaskSpec::default());
        let b = plan.add_task(0.0, TaskSpec::default());
        let parent = plan.add_task(0.0, TaskSpec::default());
        let planner = plan.add_task(0.0, TaskSpec::default());

        plan.link_tasks(TaskLink::Dependency, parent, a).unwrap();
        plan.link_tasks(TaskLink::PlannedBy, a, planner).unwrap();

        let copied = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&copied);
        plan.add_finalization_handler(
            ObjectRef::Task(a),
            FinalizationHandler::copied_on_replace(move |_, _, _| *counter.borrow_mut() += 1),
        )
        .unwrap();

        plan.replace_task(a, b).unwrap();

        // Weak dependency moved, strong planned_by stayed.
        assert!(plan.relations().dependency().contains(parent, b));
        assert!(!plan.relations().dependency().contains(parent, a));
        assert!(plan.relations().planned_by().contains(a, planner));
        assert!(!plan.relations().planned_by().contains(b, planner));

        // The handler now fires for both tasks.
        plan.finalize_task(a, 1.0).unwrap();
        plan.finalize_task(b, 1.0).unwrap();
        assert_eq!(*copied.borrow(), 2);
    }

    #[test]
    fn bound_event_names_are_unique() {
        let mut plan = plan();
        let task = plan.add_task(0.0, TaskSpec::default());
        plan.add_task_event(task, "updated", EventFlags::CONTROLLABLE, GeneratorKind::Plain)
            .unwrap();
        assert_eq!(
            plan.add_task_event(task, "updated", EventFlags::CONTROLLABLE, GeneratorKind::Plain),
            Err(PlanError::DuplicateEventName)
        );
        assert_eq!(
            plan.add_task_event(task, "start", EventFlags::CONTROLLABLE, GeneratorKind::Plain),
            Err(PlanError::DuplicateEventName)
        );
    }

    #[test]
    fn observer_sees_mutations_before_commit() {
        struct Recorder(Rc<RefCell<Vec<Mutation>>>);
        impl PlanObserver for Recorder {
            fn before_mutation(&mut self, _plan: PlanId, mutation: &Mutation) {
                self.0.borrow_mut().push(mutation.clone());
            }
        }

        let mut plan = plan();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _ = plan.set_observer(Box::new(Recorder(Rc::clone(&seen))));

        let task = plan.add_task(0.0, TaskSpec::default());
        let seen = seen.borrow();
        assert_eq!(seen[0], Mutation::TaskAdded(task));
        assert!(matches!(seen[1], Mutation::EventAdded(_)));
        // Four standard events plus the two forward edges to stop.
        assert_eq!(
            seen.iter()
                .filter(|m| matches!(m, Mutation::RelationAdded { .. }))
                .count(),
            2
        );
    }
}
