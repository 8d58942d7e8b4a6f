//! Coordination core for the taskswarm simulation.
//!
//! Mobile workers roam a bounded 2D space and allocate themselves to spatial
//! tasks through pure local search or broadcast recruiting, with optional
//! release of surplus recruits. The crate owns all live state behind
//! generational ids, advances it with a deterministic two-phase tick, and
//! exposes read-only per-tick snapshots for external renderers and exporters.

use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{Key, SecondaryMap, SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use taskswarm_index::{BoundaryMode, IndexError, Space, UniformGrid};
use thiserror::Error;

new_key_type! {
    /// Stable handle for workers backed by a generational slot map.
    pub struct WorkerId;

    /// Stable handle for tasks backed by a generational slot map.
    pub struct TaskId;
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// The position as an `(x, y)` pair for spatial queries.
    #[must_use]
    pub const fn xy(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// Coordination protocol governing how Searching workers recruit help.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Pure local search; workers never communicate.
    #[default]
    Random,
    /// Broadcast recruiting without releasing surplus responders.
    CallOut,
    /// Broadcast recruiting; surplus and losing waiters are released back to
    /// Searching the tick staffing completes.
    CallOff,
}

impl Protocol {
    /// Canonical configuration string for this protocol.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::CallOut => "call-out",
            Self::CallOff => "call-off",
        }
    }

    /// Whether discovering a multi-worker task triggers a recruit broadcast.
    #[must_use]
    pub const fn uses_broadcast(&self) -> bool {
        matches!(self, Self::CallOut | Self::CallOff)
    }

    /// Whether waiters not selected at staffing time are released immediately.
    #[must_use]
    pub const fn releases_surplus(&self) -> bool {
        matches!(self, Self::CallOff)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "call-out" => Ok(Self::CallOut),
            "call-off" => Ok(Self::CallOff),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Errors raised while validating a simulation configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// A protocol string that names no known protocol.
    #[error("unknown protocol `{0}` (expected `random`, `call-out`, or `call-off`)")]
    UnknownProtocol(String),
    /// Spatial parameters rejected by the index layer.
    #[error(transparent)]
    Space(#[from] IndexError),
}

/// Static configuration for a taskswarm simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Optional RNG seed for reproducible runs.
    pub seed: Option<u64>,
    /// Number of workers spawned at start.
    pub num_workers: u32,
    /// Number of tasks kept alive in the world (closed-world renewal).
    pub num_tasks: u32,
    /// Recruiting protocol used by Searching workers.
    pub protocol: Protocol,
    /// Maximum distance a worker covers per tick.
    pub worker_speed: f32,
    /// Radius of the recruit broadcast.
    pub worker_comm_range: f32,
    /// Radius within which a worker perceives and works tasks.
    pub worker_action_range: f32,
    /// Ticks a worker waits or responds before giving up.
    pub worker_response_timeout: u32,
    /// Cooldown ticks of plain random walk after a release or timeout.
    pub worker_break_time: u32,
    /// Radius within which a task counts staffed waiters.
    pub task_action_range: f32,
    /// Distinct workers a task needs before it starts executing.
    pub task_workers_required: u32,
    /// Ticks of work once a task is staffed.
    pub task_time_required: u32,
    /// Width of the space in world units.
    pub space_width: f32,
    /// Height of the space in world units.
    pub space_height: f32,
    /// Whether positions clamp at the edges or wrap toroidally.
    pub boundary_mode: BoundaryMode,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Edge length of the neighbor-index grid cells.
    pub index_cell_size: f32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            seed: None,
            num_workers: 10,
            num_tasks: 5,
            protocol: Protocol::Random,
            worker_speed: 5.0,
            worker_comm_range: 200.0,
            worker_action_range: 50.0,
            worker_response_timeout: 10,
            worker_break_time: 5,
            task_action_range: 50.0,
            task_workers_required: 1,
            task_time_required: 3,
            space_width: 1_000.0,
            space_height: 1_000.0,
            boundary_mode: BoundaryMode::Wrap,
            history_capacity: 256,
            index_cell_size: 50.0,
        }
    }
}

impl SwarmConfig {
    /// Validates the configuration before any tick runs.
    ///
    /// `task_workers_required` exceeding `num_workers` is deliberately not an
    /// error: such a task simply never staffs, which is a liveness property
    /// rather than a configuration fault.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be positive"));
        }
        if self.num_tasks == 0 {
            return Err(ConfigError::Invalid("num_tasks must be positive"));
        }
        if !self.worker_speed.is_finite() || self.worker_speed < 0.0 {
            return Err(ConfigError::Invalid(
                "worker_speed must be non-negative and finite",
            ));
        }
        if !self.worker_comm_range.is_finite() || self.worker_comm_range < 0.0 {
            return Err(ConfigError::Invalid(
                "worker_comm_range must be non-negative and finite",
            ));
        }
        if !self.worker_action_range.is_finite() || self.worker_action_range < 0.0 {
            return Err(ConfigError::Invalid(
                "worker_action_range must be non-negative and finite",
            ));
        }
        if !self.task_action_range.is_finite() || self.task_action_range < 0.0 {
            return Err(ConfigError::Invalid(
                "task_action_range must be non-negative and finite",
            ));
        }
        if self.task_workers_required == 0 {
            return Err(ConfigError::Invalid(
                "task_workers_required must be at least 1",
            ));
        }
        if self.task_time_required == 0 {
            return Err(ConfigError::Invalid(
                "task_time_required must be at least 1",
            ));
        }
        if !self.space_width.is_finite() || self.space_width <= 0.0 {
            return Err(ConfigError::Invalid(
                "space_width must be positive and finite",
            ));
        }
        if !self.space_height.is_finite() || self.space_height <= 0.0 {
            return Err(ConfigError::Invalid(
                "space_height must be positive and finite",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be positive"));
        }
        if !self.index_cell_size.is_finite() || self.index_cell_size <= 0.0 {
            return Err(ConfigError::Invalid(
                "index_cell_size must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// Worker state machine variants, carrying state-local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Wandering; `break_ticks` forces plain random walk before task search
    /// resumes.
    Searching { break_ticks: u32 },
    /// Holding a claim on a task, waiting for it to staff. `since` records
    /// the tick the claim was placed, for arrival-order staffing.
    Waiting { task: TaskId, timer: u32, since: Tick },
    /// Moving toward a recruiting call.
    Responding { task: TaskId, timer: u32 },
    /// Performing assigned work; stationary until the task completes.
    Working { task: TaskId },
}

impl WorkerState {
    /// Human-readable label exposed to external collaborators.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Searching { .. } => "searching",
            Self::Waiting { .. } => "waiting",
            Self::Responding { .. } => "responding",
            Self::Working { .. } => "working",
        }
    }

    /// The task this worker is currently bound to, if any.
    #[must_use]
    pub const fn target_task(&self) -> Option<TaskId> {
        match self {
            Self::Searching { .. } => None,
            Self::Waiting { task, .. } | Self::Responding { task, .. } | Self::Working { task } => {
                Some(*task)
            }
        }
    }
}

/// Task state machine variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Unclaimed, discoverable by Searching workers.
    Idle,
    /// Staffed and counting down work ticks.
    Executing {
        assigned: Vec<WorkerId>,
        remaining: u32,
    },
    /// Terminal; the record survives exactly one tick for metrics before it
    /// is purged (its replacement is a distinct entity with a new id).
    Completed,
}

impl TaskState {
    /// Human-readable label exposed to external collaborators.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing { .. } => "executing",
            Self::Completed => "completed",
        }
    }

    /// Workers assigned to this task (empty unless Executing).
    #[must_use]
    pub fn assigned(&self) -> &[WorkerId] {
        match self {
            Self::Executing { assigned, .. } => assigned,
            _ => &[],
        }
    }
}

/// A mobile worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub position: Position,
    pub speed: f32,
    pub comm_range: f32,
    pub action_range: f32,
    pub response_timeout: u32,
    pub break_time: u32,
    pub state: WorkerState,
}

/// A stationary task awaiting workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub position: Position,
    pub action_range: f32,
    pub workers_required: u32,
    pub time_required: u32,
    pub state: TaskState,
}

/// Entity registry with generational handles and a dense handle vector for
/// deterministic iteration order.
#[derive(Debug)]
pub struct Arena<K: Key, V> {
    slots: SlotMap<K, V>,
    handles: Vec<K>,
}

impl<K: Key, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V> Arena<K, V> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true when no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Live handles in insertion order.
    #[must_use]
    pub fn handles(&self) -> &[K] {
        &self.handles
    }

    /// Iterate over live handles in insertion order.
    pub fn iter_handles(&self) -> impl Iterator<Item = K> + '_ {
        self.handles.iter().copied()
    }

    /// Returns true if `id` refers to a live entry.
    #[must_use]
    pub fn contains(&self, id: K) -> bool {
        self.slots.contains_key(id)
    }

    /// Borrow the entry for `id`, if present.
    #[must_use]
    pub fn get(&self, id: K) -> Option<&V> {
        self.slots.get(id)
    }

    /// Mutably borrow the entry for `id`, if present.
    #[must_use]
    pub fn get_mut(&mut self, id: K) -> Option<&mut V> {
        self.slots.get_mut(id)
    }

    /// Insert a new entry and return its handle.
    pub fn insert(&mut self, value: V) -> K {
        let id = self.slots.insert(value);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its value if it was present.
    pub fn remove(&mut self, id: K) -> Option<V> {
        let value = self.slots.remove(id)?;
        if let Some(index) = self.handles.iter().position(|&h| h == id) {
            self.handles.swap_remove(index);
        }
        Some(value)
    }
}

/// Registry of live workers.
pub type WorkerArena = Arena<WorkerId, Worker>;
/// Registry of live tasks.
pub type TaskArena = Arena<TaskId, Task>;

/// Discriminates entity snapshots for external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Worker,
    Task,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Task => "task",
        }
    }
}

/// Read-only view of one worker at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub position: Position,
    pub state: WorkerState,
}

impl WorkerSnapshot {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        EntityKind::Worker
    }

    #[must_use]
    pub const fn state_label(&self) -> &'static str {
        self.state.label()
    }
}

/// Read-only view of one task at the end of a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub position: Position,
    pub state: TaskState,
}

impl TaskSnapshot {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        EntityKind::Task
    }

    #[must_use]
    pub const fn state_label(&self) -> &'static str {
        self.state.label()
    }
}

/// Aggregate counters derived at the end of each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    /// Tasks completed since the start of the run.
    pub completed_total: u64,
    /// Tasks that completed during this tick.
    pub completed_this_tick: u32,
    /// Idle plus executing tasks.
    pub active_tasks: usize,
    pub idle_tasks: usize,
    pub executing_tasks: usize,
    pub searching_workers: usize,
    pub waiting_workers: usize,
    pub responding_workers: usize,
    pub working_workers: usize,
}

/// Full per-tick observation: counters plus per-entity snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickBatch {
    pub summary: TickSummary,
    pub workers: Vec<WorkerSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
}

/// Observer invoked after each committed tick; read-only with respect to the
/// simulation.
pub trait TickObserver: Send {
    fn on_tick(&mut self, batch: &TickBatch);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl TickObserver for NullObserver {
    fn on_tick(&mut self, _batch: &TickBatch) {}
}

#[derive(Debug)]
enum TaskCommand {
    Staff { assigned: Vec<WorkerId> },
    Countdown,
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct WaitRecord {
    since: Tick,
    worker: WorkerId,
    position: Position,
}

/// The simulation world: registries, scheduler and metrics in one place.
pub struct SwarmWorld {
    config: SwarmConfig,
    space: Space,
    tick: Tick,
    rng: SmallRng,
    workers: WorkerArena,
    tasks: TaskArena,
    worker_grid: UniformGrid,
    task_grid: UniformGrid,
    observer: Box<dyn TickObserver>,
    completed_total: u64,
    completed_this_tick: u32,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for SwarmWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmWorld")
            .field("tick", &self.tick)
            .field("workers", &self.workers.len())
            .field("tasks", &self.tasks.len())
            .field("completed_total", &self.completed_total)
            .finish()
    }
}

fn random_position_in(rng: &mut SmallRng, space: Space) -> Position {
    Position::new(
        rng.random_range(0.0..space.width()),
        rng.random_range(0.0..space.height()),
    )
}

fn random_walk(rng: &mut SmallRng, space: Space, from: Position, speed: f32) -> Position {
    let heading = rng.random_range(0.0..std::f32::consts::TAU);
    let step = rng.random_range(0.0..=speed);
    let (x, y) = space.apply(from.x + heading.cos() * step, from.y + heading.sin() * step);
    Position::new(x, y)
}

fn nearest_idle_task(
    grid: &UniformGrid,
    tasks: &TaskArena,
    task_handles: &[TaskId],
    origin: Position,
    radius: f32,
) -> Option<TaskId> {
    let mut best: Option<(OrderedFloat<f32>, TaskId)> = None;
    grid.neighbors_within(origin.xy(), radius, &mut |idx, distance| {
        let id = task_handles[idx];
        let idle = tasks
            .get(id)
            .map_or(false, |task| matches!(task.state, TaskState::Idle));
        if idle {
            let key = (OrderedFloat(distance), id);
            if best.map_or(true, |current| key < current) {
                best = Some(key);
            }
        }
    });
    best.map(|(_, id)| id)
}

impl SwarmWorld {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SwarmConfig) -> Result<Self, ConfigError> {
        Self::with_observer(config, Box::new(NullObserver))
    }

    /// Instantiate a new world with a tick observer attached.
    pub fn with_observer(
        config: SwarmConfig,
        observer: Box<dyn TickObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let space = Space::new(config.space_width, config.space_height, config.boundary_mode)?;
        let worker_grid = UniformGrid::new(space, config.index_cell_size)?;
        let task_grid = UniformGrid::new(space, config.index_cell_size)?;
        let mut rng = config.seeded_rng();

        let mut workers = WorkerArena::new();
        for _ in 0..config.num_workers {
            let position = random_position_in(&mut rng, space);
            workers.insert(Worker {
                position,
                speed: config.worker_speed,
                comm_range: config.worker_comm_range,
                action_range: config.worker_action_range,
                response_timeout: config.worker_response_timeout,
                break_time: config.worker_break_time,
                state: WorkerState::Searching { break_ticks: 0 },
            });
        }

        let mut tasks = TaskArena::new();
        for _ in 0..config.num_tasks {
            let position = random_position_in(&mut rng, space);
            tasks.insert(Task {
                position,
                action_range: config.task_action_range,
                workers_required: config.task_workers_required,
                time_required: config.task_time_required,
                state: TaskState::Idle,
            });
        }

        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            space,
            tick: Tick::zero(),
            rng,
            workers,
            tasks,
            worker_grid,
            task_grid,
            observer,
            completed_total: 0,
            completed_this_tick: 0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// The space the simulation runs in.
    #[must_use]
    pub const fn space(&self) -> Space {
        self.space
    }

    /// Read-only access to the worker registry.
    #[must_use]
    pub fn workers(&self) -> &WorkerArena {
        &self.workers
    }

    /// Mutable access to the worker registry (scenario setup, tooling).
    #[must_use]
    pub fn workers_mut(&mut self) -> &mut WorkerArena {
        &mut self.workers
    }

    /// Read-only access to the task registry.
    #[must_use]
    pub fn tasks(&self) -> &TaskArena {
        &self.tasks
    }

    /// Mutable access to the task registry (scenario setup, tooling).
    #[must_use]
    pub fn tasks_mut(&mut self) -> &mut TaskArena {
        &mut self.tasks
    }

    /// Tasks completed since the start of the run.
    #[must_use]
    pub const fn completed_total(&self) -> u64 {
        self.completed_total
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the tick observer.
    pub fn set_observer(&mut self, observer: Box<dyn TickObserver>) {
        self.observer = observer;
    }

    /// Current per-entity view without advancing the simulation.
    #[must_use]
    pub fn snapshot(&self) -> TickBatch {
        self.build_batch(self.tick)
    }

    fn random_position(&mut self) -> Position {
        random_position_in(&mut self.rng, self.space)
    }

    /// Execute one simulation tick and return its summary.
    ///
    /// Tasks advance before workers: staffing observes the previous tick's
    /// committed worker states, while workers observe the just-committed task
    /// states, so a task that staffs and the workers it assigned move to
    /// Executing and Working within the same tick.
    pub fn step(&mut self) -> TickSummary {
        let next_tick = self.tick.next();
        self.stage_purge_completed();

        let mut task_order = self.tasks.handles().to_vec();
        task_order.shuffle(&mut self.rng);
        let mut worker_order = self.workers.handles().to_vec();
        worker_order.shuffle(&mut self.rng);

        self.stage_tasks(&task_order);
        self.stage_workers(&worker_order, next_tick);

        let summary = self.collect_metrics(next_tick);
        self.tick = next_tick;
        summary
    }

    /// Drop task records that completed on the previous tick; they were
    /// visible to that tick's metrics and their replacements already exist.
    fn stage_purge_completed(&mut self) {
        let stale: Vec<TaskId> = self
            .tasks
            .iter_handles()
            .filter(|&id| {
                self.tasks
                    .get(id)
                    .map_or(false, |task| matches!(task.state, TaskState::Completed))
            })
            .collect();
        for id in stale {
            self.tasks.remove(id);
        }
    }

    fn stage_tasks(&mut self, order: &[TaskId]) {
        // Waiter snapshot from the previous tick's committed worker states.
        let mut waiters: SecondaryMap<TaskId, Vec<WaitRecord>> = SecondaryMap::new();
        for &wid in self.workers.handles() {
            if let Some(worker) = self.workers.get(wid) {
                if let WorkerState::Waiting { task, since, .. } = worker.state {
                    if self.tasks.contains(task) {
                        if !waiters.contains_key(task) {
                            waiters.insert(task, Vec::new());
                        }
                        waiters[task].push(WaitRecord {
                            since,
                            worker: wid,
                            position: worker.position,
                        });
                    }
                }
            }
        }

        let mut commands: Vec<(TaskId, TaskCommand)> = Vec::new();
        for &tid in order {
            let task = match self.tasks.get(tid) {
                Some(task) => task,
                None => continue,
            };
            let command = match &task.state {
                TaskState::Idle => {
                    let required = task.workers_required as usize;
                    let mut arrivals: Vec<(u64, WorkerId)> = waiters
                        .get(tid)
                        .map(|records| {
                            records
                                .iter()
                                .filter(|record| {
                                    self.space
                                        .distance(record.position.xy(), task.position.xy())
                                        <= task.action_range
                                })
                                .map(|record| (record.since.0, record.worker))
                                .collect()
                        })
                        .unwrap_or_default();
                    if arrivals.len() >= required {
                        arrivals.sort_unstable();
                        let assigned = arrivals
                            .into_iter()
                            .take(required)
                            .map(|(_, worker)| worker)
                            .collect();
                        Some(TaskCommand::Staff { assigned })
                    } else {
                        None
                    }
                }
                TaskState::Executing { remaining, .. } => {
                    // The decrement and the zero check share a tick, so
                    // `time_required = t` yields exactly t executing ticks.
                    if *remaining <= 1 {
                        Some(TaskCommand::Complete)
                    } else {
                        Some(TaskCommand::Countdown)
                    }
                }
                TaskState::Completed => None,
            };
            if let Some(command) = command {
                commands.push((tid, command));
            }
        }

        for (tid, command) in commands {
            match command {
                TaskCommand::Staff { assigned } => {
                    if let Some(task) = self.tasks.get_mut(tid) {
                        task.state = TaskState::Executing {
                            assigned,
                            remaining: task.time_required,
                        };
                    }
                }
                TaskCommand::Countdown => {
                    if let Some(task) = self.tasks.get_mut(tid) {
                        if let TaskState::Executing { remaining, .. } = &mut task.state {
                            *remaining -= 1;
                        }
                    }
                }
                TaskCommand::Complete => {
                    let blueprint = match self.tasks.get_mut(tid) {
                        Some(task) => {
                            task.state = TaskState::Completed;
                            Some((task.action_range, task.workers_required, task.time_required))
                        }
                        None => None,
                    };
                    if let Some((action_range, workers_required, time_required)) = blueprint {
                        self.completed_total += 1;
                        self.completed_this_tick += 1;
                        let position = self.random_position();
                        self.tasks.insert(Task {
                            position,
                            action_range,
                            workers_required,
                            time_required,
                            state: TaskState::Idle,
                        });
                    }
                }
            }
        }
    }

    fn stage_workers(&mut self, order: &[WorkerId], next_tick: Tick) {
        if self.workers.is_empty() {
            return;
        }

        let worker_handles: Vec<WorkerId> = self.workers.handles().to_vec();
        let snapshot: Vec<Worker> = worker_handles
            .iter()
            .filter_map(|&id| self.workers.get(id).cloned())
            .collect();
        let mut index_of: SecondaryMap<WorkerId, usize> = SecondaryMap::new();
        for (idx, &id) in worker_handles.iter().enumerate() {
            index_of.insert(id, idx);
        }

        let worker_points: Vec<(f32, f32)> = snapshot.iter().map(|w| w.position.xy()).collect();
        self.worker_grid.rebuild(&worker_points);

        let task_handles: Vec<TaskId> = self.tasks.handles().to_vec();
        let task_points: Vec<(f32, f32)> = task_handles
            .iter()
            .filter_map(|&id| self.tasks.get(id).map(|task| task.position.xy()))
            .collect();
        self.task_grid.rebuild(&task_points);

        let mut next_positions: Vec<Position> = snapshot.iter().map(|w| w.position).collect();
        let mut next_states: Vec<WorkerState> = snapshot.iter().map(|w| w.state).collect();
        let mut claims: SecondaryMap<WorkerId, TaskId> = SecondaryMap::new();

        let space = self.space;
        let protocol = self.config.protocol;
        let rng = &mut self.rng;
        let tasks = &self.tasks;
        let worker_grid = &self.worker_grid;
        let task_grid = &self.task_grid;

        for &wid in order {
            let idx = match index_of.get(wid) {
                Some(&idx) => idx,
                None => continue,
            };
            let worker = &snapshot[idx];
            match worker.state {
                WorkerState::Searching { break_ticks } => {
                    if break_ticks > 0 {
                        next_positions[idx] = random_walk(rng, space, worker.position, worker.speed);
                        next_states[idx] = WorkerState::Searching {
                            break_ticks: break_ticks - 1,
                        };
                        continue;
                    }
                    match nearest_idle_task(
                        task_grid,
                        tasks,
                        &task_handles,
                        worker.position,
                        worker.action_range,
                    ) {
                        None => {
                            next_positions[idx] =
                                random_walk(rng, space, worker.position, worker.speed);
                            next_states[idx] = WorkerState::Searching { break_ticks: 0 };
                        }
                        Some(task_id) => {
                            next_states[idx] = WorkerState::Waiting {
                                task: task_id,
                                timer: worker.response_timeout,
                                since: next_tick,
                            };
                            let crew = tasks.get(task_id).map_or(1, |task| task.workers_required);
                            if crew > 1 && protocol.uses_broadcast() {
                                worker_grid.neighbors_within(
                                    worker.position.xy(),
                                    worker.comm_range,
                                    &mut |other_idx, _distance| {
                                        if other_idx == idx {
                                            return;
                                        }
                                        let other_id = worker_handles[other_idx];
                                        let eligible = matches!(
                                            snapshot[other_idx].state,
                                            WorkerState::Searching { .. }
                                        );
                                        if eligible && !claims.contains_key(other_id) {
                                            claims.insert(other_id, task_id);
                                        }
                                    },
                                );
                            }
                        }
                    }
                }
                WorkerState::Waiting { task, timer, since } => {
                    next_states[idx] = match tasks.get(task) {
                        None => WorkerState::Searching {
                            break_ticks: worker.break_time,
                        },
                        Some(target) => match &target.state {
                            TaskState::Executing { assigned, .. } if assigned.contains(&wid) => {
                                WorkerState::Working { task }
                            }
                            TaskState::Executing { .. } if protocol.releases_surplus() => {
                                WorkerState::Searching {
                                    break_ticks: worker.break_time,
                                }
                            }
                            _ => {
                                if timer == 0 {
                                    WorkerState::Searching {
                                        break_ticks: worker.break_time,
                                    }
                                } else {
                                    WorkerState::Waiting {
                                        task,
                                        timer: timer - 1,
                                        since,
                                    }
                                }
                            }
                        },
                    };
                }
                WorkerState::Responding { task, timer } => match tasks.get(task) {
                    None => {
                        next_states[idx] = WorkerState::Searching {
                            break_ticks: worker.break_time,
                        };
                    }
                    Some(target) => {
                        let distance = space.distance(worker.position.xy(), target.position.xy());
                        if distance <= worker.action_range {
                            next_states[idx] = WorkerState::Waiting {
                                task,
                                timer,
                                since: next_tick,
                            };
                        } else if timer == 0 {
                            next_states[idx] = WorkerState::Searching {
                                break_ticks: worker.break_time,
                            };
                        } else {
                            let (dx, dy) =
                                space.displacement(worker.position.xy(), target.position.xy());
                            let step = worker.speed.min(distance);
                            let (x, y) = space.apply(
                                worker.position.x + dx / distance * step,
                                worker.position.y + dy / distance * step,
                            );
                            next_positions[idx] = Position::new(x, y);
                            next_states[idx] = WorkerState::Responding {
                                task,
                                timer: timer - 1,
                            };
                        }
                    }
                },
                WorkerState::Working { task } => {
                    let finished = tasks
                        .get(task)
                        .map_or(true, |target| matches!(target.state, TaskState::Completed));
                    if finished {
                        // Re-entry after honest completion carries no break.
                        next_states[idx] = WorkerState::Searching { break_ticks: 0 };
                    }
                }
            }
        }

        // Recruit broadcasts land on workers that stayed plain searchers this
        // tick; a searcher that claimed a task for itself keeps its claim.
        for (claimed_id, &task_id) in claims.iter() {
            if let Some(&idx) = index_of.get(claimed_id) {
                if matches!(next_states[idx], WorkerState::Searching { .. }) {
                    next_states[idx] = WorkerState::Responding {
                        task: task_id,
                        timer: snapshot[idx].response_timeout,
                    };
                }
            }
        }

        for (idx, &id) in worker_handles.iter().enumerate() {
            if let Some(worker) = self.workers.get_mut(id) {
                worker.position = next_positions[idx];
                worker.state = next_states[idx];
            }
        }
    }

    fn build_batch(&self, tick: Tick) -> TickBatch {
        let mut workers = Vec::with_capacity(self.workers.len());
        let mut searching = 0usize;
        let mut waiting = 0usize;
        let mut responding = 0usize;
        let mut working = 0usize;
        for &id in self.workers.handles() {
            if let Some(worker) = self.workers.get(id) {
                match worker.state {
                    WorkerState::Searching { .. } => searching += 1,
                    WorkerState::Waiting { .. } => waiting += 1,
                    WorkerState::Responding { .. } => responding += 1,
                    WorkerState::Working { .. } => working += 1,
                }
                workers.push(WorkerSnapshot {
                    id,
                    position: worker.position,
                    state: worker.state,
                });
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut idle = 0usize;
        let mut executing = 0usize;
        for &id in self.tasks.handles() {
            if let Some(task) = self.tasks.get(id) {
                match task.state {
                    TaskState::Idle => idle += 1,
                    TaskState::Executing { .. } => executing += 1,
                    TaskState::Completed => {}
                }
                tasks.push(TaskSnapshot {
                    id,
                    position: task.position,
                    state: task.state.clone(),
                });
            }
        }

        TickBatch {
            summary: TickSummary {
                tick,
                completed_total: self.completed_total,
                completed_this_tick: self.completed_this_tick,
                active_tasks: idle + executing,
                idle_tasks: idle,
                executing_tasks: executing,
                searching_workers: searching,
                waiting_workers: waiting,
                responding_workers: responding,
                working_workers: working,
            },
            workers,
            tasks,
        }
    }

    fn collect_metrics(&mut self, next_tick: Tick) -> TickSummary {
        let batch = self.build_batch(next_tick);
        let summary = batch.summary;
        self.observer.on_tick(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.completed_this_tick = 0;
        summary
    }
}
