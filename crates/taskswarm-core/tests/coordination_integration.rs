use std::collections::HashSet;
use taskswarm_core::{
    Position, Protocol, SwarmConfig, SwarmWorld, TaskId, TaskState, Tick, WorkerId, WorkerState,
};
use taskswarm_index::BoundaryMode;

fn scenario_config(num_workers: u32, protocol: Protocol) -> SwarmConfig {
    SwarmConfig {
        seed: Some(0xDECAF),
        num_workers,
        num_tasks: 1,
        protocol,
        worker_speed: 5.0,
        worker_comm_range: 100.0,
        worker_action_range: 10.0,
        worker_response_timeout: 5,
        worker_break_time: 3,
        task_action_range: 10.0,
        task_workers_required: 1,
        task_time_required: 2,
        space_width: 1_000.0,
        space_height: 1_000.0,
        boundary_mode: BoundaryMode::Clamp,
        ..SwarmConfig::default()
    }
}

fn place_worker(world: &mut SwarmWorld, id: WorkerId, x: f32, y: f32) {
    world.workers_mut().get_mut(id).expect("worker").position = Position::new(x, y);
}

fn place_task(world: &mut SwarmWorld, id: TaskId, x: f32, y: f32) {
    world.tasks_mut().get_mut(id).expect("task").position = Position::new(x, y);
}

/// A lone worker colocated with a single one-worker task staffs it on the
/// second tick, and the task completes after exactly `time_required`
/// executing ticks, spawning a replacement the same tick.
#[test]
fn lone_worker_staffs_and_completes_a_task() {
    let mut world = SwarmWorld::new(scenario_config(1, Protocol::Random)).expect("world");
    let wid = world.workers().handles()[0];
    let tid = world.tasks().handles()[0];
    place_worker(&mut world, wid, 100.0, 100.0);
    place_task(&mut world, tid, 100.0, 100.0);

    // Tick 1: the worker discovers the idle task and claims it.
    let summary = world.step();
    assert_eq!(
        world.workers().get(wid).expect("worker").state,
        WorkerState::Waiting {
            task: tid,
            timer: 5,
            since: Tick(1),
        },
    );
    assert_eq!(world.tasks().get(tid).expect("task").state, TaskState::Idle);
    assert_eq!(summary.waiting_workers, 1);

    // Tick 2: the task staffs with exactly one worker; the worker starts
    // working within the same tick.
    world.step();
    assert_eq!(
        world.tasks().get(tid).expect("task").state,
        TaskState::Executing {
            assigned: vec![wid],
            remaining: 2,
        },
    );
    assert_eq!(
        world.workers().get(wid).expect("worker").state,
        WorkerState::Working { task: tid },
    );

    // Tick 3: one executing tick elapses.
    world.step();
    assert_eq!(
        world.tasks().get(tid).expect("task").state,
        TaskState::Executing {
            assigned: vec![wid],
            remaining: 1,
        },
    );

    // Tick 4: the timer reaches zero and the task completes in the same
    // tick; a replacement is created and the worker resumes searching
    // without a break.
    let summary = world.step();
    assert_eq!(
        world.tasks().get(tid).expect("task").state,
        TaskState::Completed,
    );
    assert_eq!(world.tasks().len(), 2, "replacement exists alongside the completed record");
    assert_eq!(
        world.workers().get(wid).expect("worker").state,
        WorkerState::Searching { break_ticks: 0 },
    );
    assert_eq!(summary.completed_total, 1);
    assert_eq!(summary.completed_this_tick, 1);
    assert_eq!(summary.active_tasks, 1);

    // Tick 5: the completed record is purged; the replacement carries on.
    world.step();
    assert_eq!(world.tasks().len(), 1);
    assert!(!world.tasks().contains(tid));
}

/// Call-out recruiting: the discovering worker broadcasts, both recruits
/// respond, and the task staffs with exactly three workers.
#[test]
fn call_out_recruits_enough_workers_to_staff() {
    let mut config = scenario_config(3, Protocol::CallOut);
    config.worker_speed = 10.0;
    config.worker_response_timeout = 10;
    config.task_workers_required = 3;
    let mut world = SwarmWorld::new(config).expect("world");
    let workers: Vec<WorkerId> = world.workers().handles().to_vec();
    let tid = world.tasks().handles()[0];

    place_task(&mut world, tid, 100.0, 100.0);
    // Only the first worker perceives the task; the others are in comm range
    // of the first but outside the task's action range.
    place_worker(&mut world, workers[0], 105.0, 100.0);
    place_worker(&mut world, workers[1], 130.0, 100.0);
    place_worker(&mut world, workers[2], 70.0, 100.0);

    let first = world.step();
    assert_eq!(first.waiting_workers, 1);
    assert_eq!(first.responding_workers, 2, "broadcast reached both searchers");

    let mut staffed_at = None;
    for _ in 0..11 {
        let summary = world.step();
        for &id in world.tasks().handles() {
            if let TaskState::Executing { assigned, .. } =
                &world.tasks().get(id).expect("task").state
            {
                assert_eq!(assigned.len(), 3, "tasks staff with exactly the required crew");
                if staffed_at.is_none() {
                    staffed_at = Some(summary.tick);
                    assert!(assigned.contains(&workers[0]));
                }
            }
        }
        if summary.completed_total >= 1 {
            break;
        }
    }
    assert!(staffed_at.is_some(), "the task staffed within the timeout window");
    assert!(world.completed_total() >= 1, "the staffed task ran to completion");
}

/// Surplus waiters are released the staffing tick under call-off but stay
/// waiting under call-out until their own timer runs out.
#[test]
fn surplus_waiter_release_depends_on_protocol() {
    for protocol in [Protocol::CallOff, Protocol::CallOut] {
        let mut config = scenario_config(4, protocol);
        config.task_workers_required = 3;
        config.task_time_required = 10;
        config.worker_response_timeout = 4;
        config.worker_break_time = 2;
        config.worker_speed = 0.0;
        let mut world = SwarmWorld::new(config).expect("world");
        let mut workers: Vec<WorkerId> = world.workers().handles().to_vec();
        workers.sort_unstable();
        let tid = world.tasks().handles()[0];

        place_task(&mut world, tid, 100.0, 100.0);
        place_worker(&mut world, workers[0], 95.0, 100.0);
        place_worker(&mut world, workers[1], 105.0, 100.0);
        place_worker(&mut world, workers[2], 100.0, 95.0);
        place_worker(&mut world, workers[3], 100.0, 105.0);

        // Tick 1: all four workers reach Waiting.
        let summary = world.step();
        assert_eq!(summary.waiting_workers, 4);

        // Tick 2: staffing selects the first three by arrival order with the
        // worker-id tie-break; the surplus waiter's fate depends on release.
        world.step();
        let assigned = match &world.tasks().get(tid).expect("task").state {
            TaskState::Executing { assigned, .. } => assigned.clone(),
            other => panic!("task should be executing, got {other:?}"),
        };
        let mut expected = workers[..3].to_vec();
        expected.sort_unstable();
        let mut got = assigned.clone();
        got.sort_unstable();
        assert_eq!(got, expected);

        let surplus = workers[3];
        let surplus_state = world.workers().get(surplus).expect("worker").state;
        match protocol {
            Protocol::CallOff => assert_eq!(
                surplus_state,
                WorkerState::Searching { break_ticks: 2 },
                "call-off releases the surplus waiter the tick staffing completes",
            ),
            Protocol::CallOut => assert_eq!(
                surplus_state,
                WorkerState::Waiting {
                    task: tid,
                    timer: 3,
                    since: Tick(1),
                },
                "call-out leaves the surplus waiter holding its claim",
            ),
            Protocol::Random => unreachable!(),
        }

        if protocol == Protocol::CallOut {
            // Ticks 3-5 drain the timer; tick 6 observes zero and releases.
            for expected_timer in [2, 1, 0] {
                world.step();
                assert_eq!(
                    world.workers().get(surplus).expect("worker").state,
                    WorkerState::Waiting {
                        task: tid,
                        timer: expected_timer,
                        since: Tick(1),
                    },
                );
            }
            world.step();
            assert_eq!(
                world.workers().get(surplus).expect("worker").state,
                WorkerState::Searching { break_ticks: 2 },
            );
        }
    }
}

/// With a zero comm range no broadcast ever lands, so a multi-worker task
/// can never assemble its crew: a pure liveness failure, not an error.
#[test]
fn zero_comm_range_starves_multi_worker_tasks() {
    let mut config = scenario_config(2, Protocol::CallOut);
    config.worker_comm_range = 0.0;
    config.worker_speed = 0.0;
    config.worker_response_timeout = 3;
    config.worker_break_time = 1;
    config.task_workers_required = 2;
    let mut world = SwarmWorld::new(config).expect("world");
    let workers: Vec<WorkerId> = world.workers().handles().to_vec();
    let tid = world.tasks().handles()[0];

    place_task(&mut world, tid, 100.0, 100.0);
    place_worker(&mut world, workers[0], 100.0, 100.0);
    place_worker(&mut world, workers[1], 900.0, 900.0);

    for _ in 0..100 {
        let summary = world.step();
        assert_eq!(summary.completed_total, 0);
        assert_eq!(summary.executing_tasks, 0);
        assert_eq!(summary.active_tasks, 1);
        assert!(matches!(
            world.workers().get(workers[1]).expect("worker").state,
            WorkerState::Searching { .. },
        ));
    }
}

/// A responder whose timer is already zero gives up on its next evaluation
/// without moving.
#[test]
fn expired_responder_reverts_without_completing() {
    let mut config = scenario_config(1, Protocol::CallOut);
    config.worker_break_time = 2;
    config.task_workers_required = 2;
    let mut world = SwarmWorld::new(config).expect("world");
    let wid = world.workers().handles()[0];
    let tid = world.tasks().handles()[0];

    place_task(&mut world, tid, 100.0, 100.0);
    {
        let worker = world.workers_mut().get_mut(wid).expect("worker");
        worker.position = Position::new(60.0, 100.0);
        worker.state = WorkerState::Responding { task: tid, timer: 0 };
    }

    world.step();
    let worker = world.workers().get(wid).expect("worker");
    assert_eq!(worker.state, WorkerState::Searching { break_ticks: 2 });
    assert_eq!(worker.position, Position::new(60.0, 100.0));
}

/// Requiring more workers than exist is a liveness degradation, not a
/// configuration error.
#[test]
fn oversized_crew_requirement_never_staffs() {
    let mut config = scenario_config(2, Protocol::CallOff);
    config.worker_comm_range = 500.0;
    config.worker_action_range = 50.0;
    config.task_action_range = 50.0;
    config.task_workers_required = 3;
    config.space_width = 200.0;
    config.space_height = 200.0;
    let mut world = SwarmWorld::new(config).expect("world");

    for _ in 0..80 {
        let summary = world.step();
        assert_eq!(summary.executing_tasks, 0);
        assert_eq!(summary.completed_total, 0);
    }
}

fn dense_config(seed: u64) -> SwarmConfig {
    SwarmConfig {
        seed: Some(seed),
        num_workers: 12,
        num_tasks: 4,
        protocol: Protocol::CallOff,
        worker_speed: 8.0,
        worker_comm_range: 150.0,
        worker_action_range: 40.0,
        worker_response_timeout: 6,
        worker_break_time: 2,
        task_action_range: 40.0,
        task_workers_required: 2,
        task_time_required: 4,
        space_width: 500.0,
        space_height: 500.0,
        boundary_mode: BoundaryMode::Wrap,
        ..SwarmConfig::default()
    }
}

#[test]
fn seeded_runs_are_deterministic() {
    let mut world_a = SwarmWorld::new(dense_config(1234)).expect("world_a");
    let mut world_b = SwarmWorld::new(dense_config(1234)).expect("world_b");

    for _ in 0..60 {
        let a = world_a.step();
        let b = world_b.step();
        assert_eq!(a, b);
    }
    assert_eq!(world_a.snapshot(), world_b.snapshot());
}

#[test]
fn invariants_hold_across_a_dense_seeded_run() {
    let config = dense_config(0xBEE5);
    let num_tasks = config.num_tasks as usize;
    let required = config.task_workers_required as usize;
    let mut world = SwarmWorld::new(config).expect("world");
    let space = world.space();

    for _ in 0..300 {
        world.step();

        let mut seen_assigned: HashSet<WorkerId> = HashSet::new();
        let mut live_tasks = 0usize;
        for &tid in world.tasks().handles() {
            let task = world.tasks().get(tid).expect("task");
            assert!(space.contains(task.position.x, task.position.y));
            match &task.state {
                TaskState::Completed => {}
                TaskState::Idle => live_tasks += 1,
                TaskState::Executing { assigned, remaining } => {
                    live_tasks += 1;
                    assert!(*remaining >= 1, "zero timers complete within their tick");
                    assert_eq!(assigned.len(), required);
                    for &wid in assigned {
                        assert!(
                            seen_assigned.insert(wid),
                            "worker assigned to two executing tasks",
                        );
                        assert_eq!(
                            world.workers().get(wid).expect("worker").state,
                            WorkerState::Working { task: tid },
                        );
                    }
                }
            }
        }
        assert_eq!(live_tasks, num_tasks, "completion pairs with replacement");

        for &wid in world.workers().handles() {
            let worker = world.workers().get(wid).expect("worker");
            assert!(space.contains(worker.position.x, worker.position.y));
            if let Some(target) = worker.state.target_task() {
                assert!(
                    world.tasks().contains(target),
                    "bound workers always point at a live task record",
                );
            }
            if let WorkerState::Working { task } = worker.state {
                let state = &world.tasks().get(task).expect("task").state;
                assert!(
                    state.assigned().contains(&wid),
                    "working workers appear in their task's crew",
                );
            }
        }
    }
}
