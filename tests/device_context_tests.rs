//! DeviceContext queue, capability and accounting behavior

mod common;

use std::sync::Arc;

use common::{multi_queue_context, serial, single_queue_context};
use forgemem::device::config::{BACKEND_ENV, QUEUE_COUNT_ENV};
use forgemem::{
    Backend, DeviceBackend, DeviceConfig, DeviceContext, EmulatedAccelerator, EmulatedConfig,
    MemError, SyncedMemory, MAX_EXTENSIONS_QUERY, MULTI_QUEUE_COUNT,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Counter {
    Increase(usize),
    Decrease(usize),
    ResetPeak,
}

fn counter_strategy() -> impl Strategy<Value = Counter> {
    prop_oneof![
        (0usize..10_000).prop_map(Counter::Increase),
        (0usize..10_000).prop_map(Counter::Decrease),
        Just(Counter::ResetPeak),
    ]
}

proptest! {
    #[test]
    fn prop_switch_queue_wraps(queues in 2usize..=8, requests in prop::collection::vec(any::<usize>(), 1..16)) {
        let (mut context, backend) = multi_queue_context(queues);
        prop_assert_eq!(context.num_queues(), queues);
        for request in requests {
            context.switch_queue(request);
            prop_assert_eq!(context.current_queue_id(), request % queues);
            prop_assert_eq!(backend.active_queue(), request % queues);
        }
    }

    #[test]
    fn prop_switch_queue_before_init(request in any::<usize>()) {
        let backend = Arc::new(EmulatedAccelerator::multi_queue());
        let mut context = DeviceContext::new(0, 0, backend.clone());
        context.switch_queue(request);
        prop_assert_eq!(context.current_queue_id(), request % MULTI_QUEUE_COUNT);

        context.init();
        prop_assert_eq!(backend.active_queue(), request % MULTI_QUEUE_COUNT);
    }

    #[test]
    fn prop_finish_queues_resets_to_zero(queues in 2usize..=8, request in any::<usize>()) {
        let (mut context, backend) = multi_queue_context(queues);
        context.switch_queue(request);
        context.finish_queues();
        prop_assert_eq!(context.current_queue_id(), 0);
        prop_assert_eq!(backend.active_queue(), 0);
    }

    #[test]
    fn prop_peak_never_below_usage(ops in prop::collection::vec(counter_strategy(), 1..64)) {
        let context = DeviceContext::cpu();
        let mut usage = 0usize;
        for op in ops {
            match op {
                Counter::Increase(bytes) => {
                    context.increase_memory_usage(bytes);
                    usage += bytes;
                }
                Counter::Decrease(bytes) => {
                    context.decrease_memory_usage(bytes);
                    usage = usage.saturating_sub(bytes);
                }
                Counter::ResetPeak => {
                    context.reset_peak_memory_usage();
                    prop_assert_eq!(context.peak_memory_usage(), context.memory_usage());
                }
            }
            prop_assert_eq!(context.memory_usage(), usage);
            prop_assert!(context.peak_memory_usage() >= context.memory_usage());
        }
    }
}

#[test]
fn test_cpu_scenario() {
    let mut context = DeviceContext::cpu();
    context.init();
    assert_eq!(context.num_queues(), 1);
    context.switch_queue(7);
    assert_eq!(context.current_queue_id(), 0);
    assert!(context.check_capability("anything"));
    assert_eq!(context.workgroup_size(0), 0);
}

#[test]
fn test_multi_queue_scenario() {
    let (mut context, _backend) = multi_queue_context(MULTI_QUEUE_COUNT);
    assert_eq!(context.num_queues(), 8);
    assert_eq!(
        [0, 1, 2].map(|dim| context.workgroup_size(dim)),
        EmulatedConfig::default().max_work_item_sizes
    );
    context.switch_queue(10);
    assert_eq!(context.current_queue_id(), 2);
}

#[test]
fn test_single_queue_finish_drains_pushes() {
    let (mut context, backend) = single_queue_context();
    let mut mem = SyncedMemory::new(64, &context);
    mem.mutable_cpu_data().fill(0xAB);
    mem.async_gpu_push(0);
    assert_eq!(backend.pending_writes(0), 1);

    context.finish_queues();
    assert_eq!(backend.pending_writes(0), 0);
    assert_eq!(context.current_queue_id(), 0);
}

#[test]
fn test_multi_queue_pushes_on_separate_queues() {
    let (mut context, backend) = multi_queue_context(4);
    let mut buffers: Vec<SyncedMemory> = (0..4).map(|_| SyncedMemory::new(16, &context)).collect();
    for (queue, mem) in buffers.iter_mut().enumerate() {
        mem.mutable_cpu_data().fill(queue as u8);
        mem.async_gpu_push(queue);
    }
    for queue in 0..4 {
        assert_eq!(backend.pending_writes(queue), 1);
    }

    context.finish_queues();
    for queue in 0..4 {
        assert_eq!(backend.pending_writes(queue), 0);
        assert_eq!(backend.completed_writes(queue), 1);
    }
    for (queue, mem) in buffers.iter_mut().enumerate() {
        let ptr = mem.gpu_data();
        assert_eq!(common::device_read(&backend, ptr, 16), vec![queue as u8; 16]);
    }
}

#[test]
fn test_capability_query_is_truncated() {
    let mut extensions = "x".repeat(MAX_EXTENSIONS_QUERY);
    extensions.push_str(" cl_khr_beyond_the_cap");
    let backend = Arc::new(EmulatedAccelerator::new(
        EmulatedConfig::multi_queue().with_extensions(&extensions),
    ));
    let mut context = DeviceContext::new(0, 0, backend);
    context.init();

    assert!(context.check_capability("xxxx"));
    assert!(!context.check_capability("cl_khr_beyond_the_cap"));
}

#[test]
fn test_capability_with_misreported_length() {
    let backend = Arc::new(EmulatedAccelerator::new(
        EmulatedConfig::multi_queue()
            .with_extensions("cl_khr_fp16 cl_khr_subgroups")
            .with_reported_extensions_len(usize::MAX / 2),
    ));
    let mut context = DeviceContext::new(0, 0, backend);
    context.init();
    assert!(context.check_capability("cl_khr_subgroups"));
    assert!(!context.check_capability("cl_khr_fp64"));
}

#[test]
fn test_init_failure_reported() {
    let backend = Arc::new(EmulatedAccelerator::new(
        EmulatedConfig::multi_queue().with_failing_query(),
    ));
    let mut context = DeviceContext::new(3, 1, backend);
    match context.try_init() {
        Err(MemError::InitializationFailed(msg)) => assert!(msg.contains("device 3")),
        other => panic!("expected an initialization failure, got {:?}", other),
    }
}

#[test]
fn test_init_fails_when_queues_cannot_be_created() {
    let backend = Arc::new(EmulatedAccelerator::new(
        EmulatedConfig::multi_queue().with_max_queues(2),
    ));
    let mut context = DeviceContext::new(0, 0, backend).with_queue_count(4);
    assert!(matches!(
        context.try_init(),
        Err(MemError::InitializationFailed(_))
    ));
}

#[test]
fn test_program_retained_after_init() {
    let backend = Arc::new(EmulatedAccelerator::new(
        EmulatedConfig::single_queue().with_kernels(&["scale", "relu"]),
    ));
    let mut context = DeviceContext::new(0, 0, backend.clone());
    assert!(context.program().is_none());
    context.init();
    context.init();

    let program = context.program().unwrap();
    assert!(program.has_kernel("relu"));
    assert!(!program.has_kernel("fill"));
    assert_eq!(backend.programs_registered(), 1);
    assert_eq!(context.device_info().unwrap().compute_units, 32);
}

#[test]
fn test_distinct_contexts_are_independent() {
    let (first, _a) = single_queue_context();
    let (second, _b) = single_queue_context();
    let mut x = SyncedMemory::new(100, &first);
    let mut y = SyncedMemory::new(300, &second);
    x.gpu_data();
    y.gpu_data();

    assert_eq!(first.memory_usage(), 100);
    assert_eq!(second.memory_usage(), 300);
    assert!(!x.device().same_device(y.device()));

    let threads: Vec<_> = [first, second]
        .into_iter()
        .map(|mut context| {
            std::thread::spawn(move || {
                context.finish_queues();
                context.memory_usage()
            })
        })
        .collect();
    let usages: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(usages, vec![100, 300]);
}

#[test]
fn test_peak_over_a_phase() {
    let (context, _backend) = single_queue_context();
    let _resident = {
        let mut mem = SyncedMemory::new(1000, &context);
        mem.gpu_data();
        mem
    };

    context.reset_peak_memory_usage();
    {
        let mut scratch = SyncedMemory::new(500, &context);
        scratch.gpu_data();
    }
    assert_eq!(context.memory_usage(), 1000);
    assert_eq!(context.peak_memory_usage(), 1500);

    context.reset_peak_memory_usage();
    assert_eq!(context.peak_memory_usage(), 1000);
}

#[test]
#[serial]
fn test_context_from_env() {
    std::env::set_var(BACKEND_ENV, "multi");
    std::env::set_var(QUEUE_COUNT_ENV, "3");
    let config = DeviceConfig::from_env().unwrap();
    std::env::remove_var(BACKEND_ENV);
    std::env::remove_var(QUEUE_COUNT_ENV);

    let mut context = DeviceContext::from_config(&config).unwrap();
    context.init();
    assert_eq!(context.backend(), Backend::MultiQueue);
    assert_eq!(context.num_queues(), 3);
    assert_eq!(context.handle().backend().queue_count(), 3);
}
