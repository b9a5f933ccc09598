//! Integration tests driving the full environment against the in-memory
//! substrate and runtime fakes, tick by tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use tasknotify::test_utils::{FakeRuntime, FakeSubstrate};
use tasknotify::{
    Config, Environment, GroupPolicy, MemoryLocation, NotificationUpdate, OpKind, TaskingRuntime,
    WaitOutcome,
};

fn small_config() -> Config {
    Config::default()
        .pool_capacity(4096)
        .handoff_capacity(4096)
}

fn make_env(
    segments: u32,
    queues: u32,
    slots: usize,
) -> Environment<FakeSubstrate, FakeRuntime> {
    let substrate = FakeSubstrate::new(segments, queues, slots);
    let runtime = FakeRuntime::new();
    Environment::initialize(substrate, runtime, small_config()).unwrap()
}

/// Tick both duties until `done` holds, failing the test if it never does.
fn tick_until(env: &Environment<FakeSubstrate, FakeRuntime>, mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        env.runtime().tick_all();
    }
    panic!("condition not reached within 100 polling ticks");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_duties_registered_and_unregistered() {
    let env = make_env(2, 4, 64);
    let names = env.runtime().registered_names();
    assert!(names.iter().any(|n| n.starts_with("tasknotify-queues")));
    assert!(names.iter().any(|n| n == "tasknotify-notifications"));

    // Explicit shutdown (and drop) unregister every duty.
    let substrate = FakeSubstrate::new(1, 1, 16);
    let runtime = FakeRuntime::new();
    let env2 = Environment::initialize(substrate, runtime, small_config()).unwrap();
    assert!(!env2.runtime().registered_names().is_empty());
    env2.shutdown();
}

#[test]
fn test_queue_shards_cover_all_queues() {
    let substrate = FakeSubstrate::new(1, 8, 16);
    let runtime = FakeRuntime::new();
    let env =
        Environment::initialize(substrate, runtime, small_config().queue_pollers(3)).unwrap();

    let queue_shards = env
        .runtime()
        .registered_names()
        .iter()
        .filter(|n| n.starts_with("tasknotify-queues"))
        .count();
    assert_eq!(queue_shards, 3);

    // A completion on every queue is picked up regardless of shard.
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);
    for queue in 0..8 {
        env.runtime().increase_counter(task, 1);
        env.substrate().push_completion(queue, task.as_raw(), true);
    }
    tick_until(&env, || env.runtime().counter_value(task) == 0);
}

// ============================================================================
// Tracked transfers
// ============================================================================

#[test]
fn test_write_completion_releases_task() {
    let env = make_env(2, 2, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    env.write(
        MemoryLocation::new(0, 0),
        1,
        MemoryLocation::new(1, 128),
        256,
        0,
    )
    .unwrap();
    assert_eq!(env.runtime().counter_value(task), 1);

    tick_until(&env, || env.runtime().counter_value(task) == 0);
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 1);
}

#[test]
fn test_failed_submit_rolls_counter_back() {
    let env = make_env(1, 1, 16);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    env.substrate().fail_next_submit();
    let result = env.read(
        MemoryLocation::new(0, 0),
        3,
        MemoryLocation::new(0, 0),
        64,
        0,
    );
    assert!(result.is_err());
    assert_eq!(env.runtime().counter_value(task), 0);
}

#[test]
fn test_list_submit_counts_every_entry() {
    let env = make_env(2, 1, 16);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    let entries = [
        tasknotify::TransferEntry {
            local: MemoryLocation::new(0, 0),
            remote: MemoryLocation::new(1, 0),
            size: 64,
        },
        tasknotify::TransferEntry {
            local: MemoryLocation::new(0, 64),
            remote: MemoryLocation::new(1, 64),
            size: 64,
        },
    ];
    env.write_list_notify(&entries, 1, 1, NotificationUpdate { id: 4, value: 9 }, 0)
        .unwrap();
    assert_eq!(env.runtime().counter_value(task), 2);

    tick_until(&env, || env.runtime().counter_value(task) == 0);
}

// ============================================================================
// Waits
// ============================================================================

#[test]
fn test_wait_already_notified_is_synchronous() {
    let env = make_env(4, 1, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    env.substrate().post_notification(2, 8, 11);
    env.substrate().post_notification(2, 9, 12);

    let mut values = [0u32; 2];
    let outcome =
        unsafe { env.wait_notifications(2, 8, 2, values.as_mut_ptr()) }.unwrap();
    assert_eq!(outcome, WaitOutcome::Satisfied);
    assert_eq!(values, [11, 12]);
    assert_eq!(env.runtime().counter_value(task), 0, "no counter traffic");
    assert_eq!(env.outstanding_waits(), 0, "no range allocated");
}

#[test]
fn test_zero_count_wait_is_synchronous() {
    let env = make_env(1, 1, 16);
    let outcome =
        unsafe { env.wait_notifications(0, 0, 0, std::ptr::null_mut()) }.unwrap();
    assert_eq!(outcome, WaitOutcome::Satisfied);
}

#[test]
fn test_wait_invalid_segment() {
    let env = make_env(2, 1, 16);
    assert!(unsafe { env.wait_notifications(7, 0, 1, std::ptr::null_mut()) }.is_err());
}

#[test]
fn test_range_values_land_in_correct_slots() {
    // Notifications 10..13 on segment 3 arrive out of order with values
    // 5, 7, 5; the wait's buffer must read [5, 7, 5] by slot offset.
    let env = make_env(4, 1, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    env.substrate().post_notification(3, 11, 7);

    let mut values = [0u32; 3];
    let outcome =
        unsafe { env.wait_notifications(3, 10, 3, values.as_mut_ptr()) }.unwrap();
    assert_eq!(outcome, WaitOutcome::Deferred);
    assert_eq!(env.runtime().counter_value(task), 1);

    // One tick with only id 11 consumed pre-registration: still pending.
    env.runtime().tick_all();
    assert_eq!(env.runtime().counter_value(task), 1);

    env.substrate().post_notification(3, 12, 5);
    env.substrate().post_notification(3, 10, 5);

    tick_until(&env, || env.runtime().counter_value(task) == 0);
    assert_eq!(values, [5, 7, 5]);
    assert_eq!(env.outstanding_waits(), 0);
}

#[test]
fn test_two_producers_thousand_waits_each() {
    const PER_PRODUCER: u32 = 1000;

    let env = make_env(1, 1, 2 * PER_PRODUCER as usize);
    let task_a = env.runtime().new_task();
    let task_b = env.runtime().new_task();
    let registered = AtomicUsize::new(0);

    let env_ref = &env;
    let registered_ref = &registered;
    std::thread::scope(|scope| {
        for (producer, task) in [(0u32, task_a), (1u32, task_b)] {
            scope.spawn(move || {
                env_ref.runtime().set_current_task(task);
                for i in 0..PER_PRODUCER {
                    let id = producer * PER_PRODUCER + i;
                    let outcome = unsafe {
                        env_ref.wait_notifications(0, id, 1, std::ptr::null_mut())
                    }
                    .unwrap();
                    assert_eq!(outcome, WaitOutcome::Deferred);
                    registered_ref.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // The polling agent runs concurrently with registration.
        scope.spawn(move || {
            while registered_ref.load(Ordering::Relaxed) < 2 * PER_PRODUCER as usize {
                env_ref.poll_notifications_now();
                std::hint::spin_loop();
            }
        });
    });

    assert_eq!(
        env.runtime().counter_value(task_a) + env.runtime().counter_value(task_b),
        2 * i64::from(PER_PRODUCER)
    );

    // Notify in a random order; retirement must not depend on arrival order.
    let mut ids: Vec<u32> = (0..2 * PER_PRODUCER).collect();
    ids.shuffle(&mut rand::thread_rng());
    for id in ids {
        env.substrate().post_notification(0, id, 1);
    }

    tick_until(&env, || {
        env.runtime().counter_value(task_a) == 0 && env.runtime().counter_value(task_b) == 0
    });
    assert_eq!(env.outstanding_waits(), 0, "every range retired exactly once");
}

// ============================================================================
// Acknowledged transfers
// ============================================================================

#[test]
fn test_ack_write_fires_once_after_all_acks() {
    let env = make_env(2, 2, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    let mut ack_values = [0u32; 2];
    unsafe {
        env.ack_write(
            0,
            20,
            2,
            ack_values.as_mut_ptr(),
            MemoryLocation::new(0, 0),
            5,
            MemoryLocation::new(1, 4096),
            512,
            1,
        )
    }
    .unwrap();
    assert_eq!(env.runtime().counter_value(task), 1);
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 0);

    // First acknowledgement: must not fire.
    env.substrate().post_notification(0, 21, 3);
    env.runtime().tick_all();
    env.runtime().tick_all();
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 0);
    assert_eq!(env.runtime().counter_value(task), 1);

    // Second acknowledgement: fires exactly once, and the write's own
    // completion releases the task.
    env.substrate().post_notification(0, 20, 4);
    tick_until(&env, || env.runtime().counter_value(task) == 0);
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 1);
    assert_eq!(ack_values, [4, 3]);

    // More ticks never re-fire the action.
    env.runtime().tick_all();
    env.runtime().tick_all();
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 1);
    assert_eq!(env.outstanding_waits(), 0);
}

#[test]
fn test_ack_write_already_acknowledged_fires_immediately() {
    let env = make_env(2, 2, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    env.substrate().post_notification(1, 0, 1);

    unsafe {
        env.ack_write(
            1,
            0,
            1,
            std::ptr::null_mut(),
            MemoryLocation::new(0, 0),
            2,
            MemoryLocation::new(1, 0),
            64,
            0,
        )
    }
    .unwrap();
    assert_eq!(env.substrate().submitted_count(OpKind::Write), 1);
    assert_eq!(env.outstanding_waits(), 0);

    tick_until(&env, || env.runtime().counter_value(task) == 0);
}

#[test]
fn test_ack_write_notify_carries_notification() {
    let env = make_env(2, 2, 64);
    let task = env.runtime().new_task();
    env.runtime().set_current_task(task);

    unsafe {
        env.ack_write_notify(
            0,
            0,
            1,
            std::ptr::null_mut(),
            MemoryLocation::new(0, 0),
            1,
            MemoryLocation::new(1, 0),
            128,
            NotificationUpdate { id: 7, value: 1 },
            1,
        )
    }
    .unwrap();

    env.substrate().post_notification(0, 0, 9);
    tick_until(&env, || env.runtime().counter_value(task) == 0);
    assert_eq!(env.substrate().submitted_count(OpKind::WriteNotify), 1);
}

// ============================================================================
// Queue groups
// ============================================================================

#[test]
fn test_round_robin_group_spreads_calls() {
    const CALLS: usize = 10_000;
    const QUEUES: u32 = 4;

    let env = make_env(1, 8, 16);
    env.create_queue_group(0, 2, QUEUES, GroupPolicy::RoundRobin)
        .unwrap();

    let mut totals: HashMap<u16, usize> = HashMap::new();
    std::thread::scope(|scope| {
        let mut joins = Vec::new();
        for _ in 0..4 {
            let env = &env;
            joins.push(scope.spawn(move || {
                let mut counts: HashMap<u16, usize> = HashMap::new();
                for _ in 0..CALLS / 4 {
                    let queue = env.queue_group_queue(0).unwrap();
                    assert!((2..2 + QUEUES as u16).contains(&queue));
                    *counts.entry(queue).or_default() += 1;
                }
                counts
            }));
        }
        for join in joins {
            for (queue, count) in join.join().unwrap() {
                *totals.entry(queue).or_default() += count;
            }
        }
    });

    let expected = CALLS / QUEUES as usize;
    for queue in 2..2 + QUEUES as u16 {
        let share = *totals.get(&queue).unwrap_or(&0);
        assert!(
            share > expected / 4 && share < expected * 4,
            "queue {} received {} of {} calls",
            queue,
            share,
            CALLS
        );
    }
}

#[test]
fn test_affinity_group_respects_numa_blocks() {
    let env = make_env(1, 4, 16);
    // Two NUMA nodes with two CPUs each; 4 queues split 2 + 2.
    env.runtime().set_cpu_numa_map(vec![0, 0, 1, 1]);
    env.create_queue_group(1, 0, 4, GroupPolicy::CpuAffinity)
        .unwrap();

    for cpu in 0..4 {
        env.runtime().set_current_cpu(cpu);
        let queue = env.queue_group_queue(1).unwrap();
        if cpu < 2 {
            assert!((0..2).contains(&queue), "cpu {} got queue {}", cpu, queue);
        } else {
            assert!((2..4).contains(&queue), "cpu {} got queue {}", cpu, queue);
        }
    }
}

#[test]
fn test_group_lifecycle_errors() {
    let env = make_env(1, 4, 16);
    env.create_queue_group(0, 0, 4, GroupPolicy::RoundRobin)
        .unwrap();
    assert!(env.create_queue_group(0, 0, 2, GroupPolicy::RoundRobin).is_err());
    assert!(env.create_queue_group(1, 2, 4, GroupPolicy::RoundRobin).is_err());
    assert!(env.queue_group_queue(3).is_err());

    env.delete_queue_group(0).unwrap();
    assert!(env.delete_queue_group(0).is_err());
    env.create_queue_group(0, 1, 2, GroupPolicy::RoundRobin)
        .unwrap();
}
