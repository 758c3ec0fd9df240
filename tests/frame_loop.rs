//! Frame loop integration tests on the dummy backend.
//!
//! # Test Categories
//!
//! - **Frame Cycling**: slot indices, frame numbers, blocking on in-flight work
//! - **Deferred Deletion**: objects outlive every submission that may use them
//! - **Uploads**: staged copies land before the frame's main work, overflow policies
//! - **Concurrency**: producers on other threads while a frame is recorded
//! - **Render Passes**: cached passes and framebuffers, dynamic rendering
//! - **Contract Violations**: misuse panics or is refused
//!
//! ```bash
//! cargo test --test frame_loop
//! ```

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;

use common::{generate_test_pattern, parameters, TestContext, TEST_STAGING_SIZE};
use gpu_frames::{
    AttachmentDescriptor, FrameError, GpuObject, LoadOp, ObjectKind, OverflowPolicy,
    RenderPassBinding, RenderPassDescriptor, RenderPassKey, StoreOp, SupportedFeatures, Texture,
    TextureDescriptor, TextureFormat, TextureUsage, MAX_FRAMES_IN_FLIGHT,
};

// ============================================================================
// Frame Cycling
// ============================================================================

#[test]
fn test_frame_index_cycles_through_slots() {
    let ctx = TestContext::new();
    let n = MAX_FRAMES_IN_FLIGHT as u32;
    assert_eq!(ctx.core.num_frames_in_flight(), n);

    for frame in 0..(3 * n) {
        assert_eq!(ctx.core.frame_index(), frame % n);
        assert_eq!(ctx.core.next_frame_index(), (frame + 1) % n);
        assert_eq!(ctx.core.previous_frame_index(), (frame + n - 1) % n);
        assert_eq!(ctx.core.frame_number(), u64::from(frame));

        ctx.core.begin_frame().unwrap();
        assert!(ctx.core.is_recording());
        assert_eq!(
            ctx.core.frame_command_buffer(),
            ctx.core.frame_command_buffer_at((frame % n) as usize)
        );
        ctx.core.end_frame().unwrap();
        assert!(!ctx.core.is_recording());
    }
    ctx.finish();
}

#[test]
fn test_slots_own_distinct_command_buffers() {
    let ctx = TestContext::new();
    let buffers: Vec<_> = (0..MAX_FRAMES_IN_FLIGHT)
        .map(|index| ctx.core.frame_command_buffer_at(index))
        .collect();
    for (i, a) in buffers.iter().enumerate() {
        for b in &buffers[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_begin_frame_blocks_until_slot_work_completes() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(4);
    ctx.dummy.pause();

    // Every slot can be filled without waiting.
    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.core.begin_frame().unwrap();
        ctx.core.queue_buffer_upload(buffer.handle(), b"TEST", 0).unwrap();
        ctx.core.end_frame().unwrap();
    }
    // One upload and one main submission per frame, none executed yet.
    assert_eq!(ctx.dummy.pending_submissions(), 2 * MAX_FRAMES_IN_FLIGHT);
    assert_eq!(ctx.dummy.buffer_contents(buffer.handle()).unwrap(), vec![0; 4]);

    let started = Arc::new(AtomicBool::new(false));
    let worker = {
        let core = ctx.core.clone();
        let started = started.clone();
        thread::spawn(move || {
            core.begin_frame().unwrap();
            started.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(
        !started.load(Ordering::SeqCst),
        "begin_frame returned while the slot's work was still pending"
    );

    ctx.dummy.resume();
    worker.join().unwrap();
    assert!(started.load(Ordering::SeqCst));
    assert_eq!(ctx.core.frame_index(), 0);
    assert_eq!(ctx.dummy.buffer_contents(buffer.handle()).unwrap(), b"TEST");

    ctx.core.end_frame().unwrap();
    ctx.finish();
}

#[test]
fn test_submissions_signal_slot_fence_and_completion_semaphore() {
    let ctx = TestContext::new();

    ctx.core.begin_frame().unwrap();
    let completion = ctx.core.frame_completion_semaphore();
    let command_buffer = ctx.core.frame_command_buffer();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    let submissions = ctx.dummy.submissions();
    assert_eq!(submissions.len(), 1, "no uploads, so only the main submission");
    let main = &submissions[0];
    assert_eq!(main.command_buffers, vec![command_buffer]);
    assert!(main.wait_semaphores.is_empty());
    assert_eq!(main.signal_semaphores, vec![completion]);
    assert!(main.signal_fence.is_some());
}

#[test]
fn test_completion_semaphore_can_be_disabled() {
    let ctx = TestContext::with_parameters(
        parameters(TEST_STAGING_SIZE, OverflowPolicy::Grow).with_present_semaphore(false),
    );
    ctx.run_frame();
    ctx.finish();

    let submissions = ctx.dummy.submissions();
    assert!(submissions[0].signal_semaphores.is_empty());
}

// ============================================================================
// Deferred Deletion
// ============================================================================

#[test]
fn test_object_dropped_during_frame_survives_until_slot_reuse() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(64);
    let object = GpuObject::Buffer(buffer.handle());

    ctx.core.begin_frame().unwrap();
    drop(buffer);
    ctx.core.end_frame().unwrap();

    // Slots other than the one that used the buffer do not release it.
    for _ in 1..MAX_FRAMES_IN_FLIGHT {
        ctx.run_frame();
        assert!(ctx.dummy.is_alive(object));
    }

    ctx.core.begin_frame().unwrap();
    assert!(!ctx.dummy.is_alive(object));
    ctx.core.end_frame().unwrap();

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.run_frame();
    }
    let destroyed = ctx.dummy.destroyed_objects();
    assert_eq!(destroyed.iter().filter(|o| **o == object).count(), 1);
    ctx.finish();
}

#[test]
fn test_object_dropped_between_frames_waits_for_last_submission() {
    let ctx = TestContext::new();
    let texture = ctx
        .core
        .create_texture(&TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        ))
        .unwrap();
    let object = GpuObject::Texture(texture.handle());

    ctx.run_frame();
    drop(texture);

    // Recycling the other slot must not release the texture.
    ctx.core.begin_frame().unwrap();
    assert!(ctx.dummy.is_alive(object));
    ctx.core.end_frame().unwrap();

    ctx.run_frame();
    assert!(!ctx.dummy.is_alive(object));
    ctx.finish();
}

#[rstest]
#[case::sampler(ObjectKind::Sampler)]
#[case::pipeline(ObjectKind::Pipeline)]
#[case::pipeline_layout(ObjectKind::PipelineLayout)]
#[case::descriptor_set(ObjectKind::DescriptorSet)]
#[case::texture_view(ObjectKind::TextureView)]
#[case::event(ObjectKind::Event)]
fn test_sink_defers_every_object_kind(#[case] kind: ObjectKind) {
    let ctx = TestContext::new();
    let object = ctx.dummy.create_object(kind);
    let sink = ctx.core.deletion_sink();

    ctx.core.begin_frame().unwrap();
    sink.queue_object_deletion(object);
    ctx.core.end_frame().unwrap();
    assert!(ctx.dummy.is_alive(object));

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.run_frame();
    }
    assert!(!ctx.dummy.is_alive(object));
    ctx.finish();
}

#[test]
fn test_pending_deletions_are_released_on_drop() {
    let ctx = TestContext::new();
    let objects: Vec<_> = [ObjectKind::Sampler, ObjectKind::Framebuffer]
        .into_iter()
        .map(|kind| ctx.dummy.create_object(kind))
        .collect();

    ctx.core.begin_frame().unwrap();
    for object in &objects {
        ctx.core.deletion_sink().queue_object_deletion(*object);
    }
    ctx.core.end_frame().unwrap();

    let TestContext { dummy, core } = ctx;
    drop(core);
    for object in &objects {
        assert!(!dummy.is_alive(*object));
    }
    assert_eq!(dummy.violations(), vec![]);
}

#[test]
fn test_resource_outliving_core_is_destroyed_immediately() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(16);
    let object = GpuObject::Buffer(buffer.handle());
    ctx.run_frame();

    let TestContext { dummy, core } = ctx;
    drop(core);
    assert!(dummy.is_alive(object));

    drop(buffer);
    assert!(!dummy.is_alive(object));
    assert_eq!(dummy.violations(), vec![]);
}

// ============================================================================
// Uploads
// ============================================================================

#[test]
fn test_buffer_upload_lands_before_main_work() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(256);
    let data = generate_test_pattern(200);

    ctx.core.begin_frame().unwrap();
    ctx.core
        .queue_buffer_upload(buffer.handle(), &data, 56)
        .unwrap();
    let command_buffer = ctx.core.frame_command_buffer();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    let contents = ctx.dummy.buffer_contents(buffer.handle()).unwrap();
    assert_eq!(&contents[56..], &data[..]);
    assert!(contents[..56].iter().all(|&b| b == 0));

    let submissions = ctx.dummy.submissions();
    assert_eq!(submissions.len(), 2);
    let (upload, main) = (&submissions[0], &submissions[1]);
    assert_ne!(upload.command_buffers, main.command_buffers);
    assert_eq!(main.command_buffers, vec![command_buffer]);
    assert_eq!(upload.signal_semaphores.len(), 1);
    assert_eq!(main.wait_semaphores, upload.signal_semaphores);
    assert!(upload.signal_fence.is_none());
    assert!(main.signal_fence.is_some());
}

#[test]
fn test_uploads_are_applied_in_queue_order() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(8);

    ctx.core.begin_frame().unwrap();
    ctx.core.queue_buffer_upload(buffer.handle(), &[1; 8], 0).unwrap();
    ctx.core.queue_buffer_upload(buffer.handle(), &[2; 4], 4).unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert_eq!(
        ctx.dummy.buffer_contents(buffer.handle()).unwrap(),
        vec![1, 1, 1, 1, 2, 2, 2, 2]
    );
}

#[test]
fn test_pod_upload() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(16);
    let values = [1.0f32, 2.0, 3.0, 4.0];

    ctx.core.begin_frame().unwrap();
    ctx.core
        .queue_buffer_upload_pod(buffer.handle(), &values, 0)
        .unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    let contents = ctx.dummy.buffer_contents(buffer.handle()).unwrap();
    assert_eq!(contents, bytemuck::cast_slice::<f32, u8>(&values));
}

#[rstest]
#[case::all_levels(None, 3)]
#[case::base_level_only(Some(1), 1)]
#[case::two_levels(Some(2), 2)]
fn test_texture_upload_copies_mip_chain(#[case] mip_count: Option<u32>, #[case] copied: u32) {
    let ctx = TestContext::new();
    let texture = ctx
        .core
        .create_texture(
            &TextureDescriptor::new_2d(4, 4, TextureFormat::R8Unorm, TextureUsage::COPY_DST)
                .with_mip_levels(3),
        )
        .unwrap();
    let data = generate_test_pattern(texture.upload_size() as usize);

    ctx.core.begin_frame().unwrap();
    ctx.core
        .queue_texture_upload(texture.handle(), &data, mip_count)
        .unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    let copied_size = texture.info().upload_size(copied) as usize;
    let contents = ctx.dummy.texture_contents(texture.handle()).unwrap();
    assert_eq!(&contents[..copied_size], &data[..copied_size]);
    assert!(contents[copied_size..].iter().all(|&b| b == 0));
}

#[test]
fn test_buffer_to_texture_copy_uses_caller_buffer() {
    let ctx = TestContext::new();
    let texture = ctx
        .core
        .create_texture(&TextureDescriptor::new_2d(
            2,
            2,
            TextureFormat::Rgba8Unorm,
            TextureUsage::COPY_DST,
        ))
        .unwrap();
    let source = ctx.create_target_buffer(64);
    let data = generate_test_pattern(16);

    ctx.core.begin_frame().unwrap();
    ctx.core.queue_buffer_upload(source.handle(), &data, 32).unwrap();
    ctx.core
        .queue_buffer_to_texture_copy(source.handle(), texture.handle(), 32)
        .unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert_eq!(ctx.dummy.texture_contents(texture.handle()).unwrap(), data);
    // The copy reads what the upload just wrote.
    assert_eq!(ctx.dummy.transfer_barrier_count(), 1);
}

#[test]
fn test_repeated_copies_into_one_texture_are_ordered() {
    let ctx = TestContext::new();
    let texture = ctx
        .core
        .create_texture(&TextureDescriptor::new_2d(
            2,
            2,
            TextureFormat::Rgba8Unorm,
            TextureUsage::COPY_DST,
        ))
        .unwrap();
    let first = generate_test_pattern(16);
    let second: Vec<u8> = first.iter().rev().copied().collect();

    ctx.core.begin_frame().unwrap();
    ctx.core
        .queue_texture_upload(texture.handle(), &first, None)
        .unwrap();
    ctx.core
        .queue_texture_upload(texture.handle(), &second, None)
        .unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert_eq!(ctx.dummy.texture_contents(texture.handle()).unwrap(), second);
    assert_eq!(ctx.dummy.transfer_barrier_count(), 1);
}

#[test]
fn test_staging_region_is_reused_each_frame() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(TEST_STAGING_SIZE);
    let buffers_before = ctx.dummy.created_count(ObjectKind::Buffer);

    // Each frame fills its whole slot region; no extra staging is ever needed.
    for frame in 0..(2 * MAX_FRAMES_IN_FLIGHT) {
        ctx.core.begin_frame().unwrap();
        ctx.core
            .queue_buffer_upload(buffer.handle(), &vec![frame as u8; TEST_STAGING_SIZE as usize], 0)
            .unwrap();
        ctx.core.end_frame().unwrap();
    }
    ctx.finish();

    assert_eq!(ctx.dummy.created_count(ObjectKind::Buffer), buffers_before);
    let last = (2 * MAX_FRAMES_IN_FLIGHT - 1) as u8;
    assert!(ctx
        .dummy
        .buffer_contents(buffer.handle())
        .unwrap()
        .iter()
        .all(|&b| b == last));
}

#[test]
fn test_overflow_grow_allocates_dedicated_staging() {
    let ctx = TestContext::with_parameters(parameters(64, OverflowPolicy::Grow));
    let buffer = ctx.create_target_buffer(256);
    let data = generate_test_pattern(256);
    let buffers_before = ctx.dummy.live_count(ObjectKind::Buffer);

    ctx.core.begin_frame().unwrap();
    ctx.core.queue_buffer_upload(buffer.handle(), &data, 0).unwrap();
    ctx.core.end_frame().unwrap();
    assert_eq!(ctx.dummy.live_count(ObjectKind::Buffer), buffers_before + 1);

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.run_frame();
    }
    ctx.finish();

    assert_eq!(ctx.dummy.buffer_contents(buffer.handle()).unwrap(), data);
    assert_eq!(ctx.dummy.live_count(ObjectKind::Buffer), buffers_before);
}

#[test]
fn test_overflow_fail_reports_exhaustion() {
    let ctx = TestContext::with_parameters(parameters(64, OverflowPolicy::Fail));
    let buffer = ctx.create_target_buffer(128);

    ctx.core.begin_frame().unwrap();
    ctx.core
        .queue_buffer_upload(buffer.handle(), &[7; 48], 0)
        .unwrap();
    let err = ctx
        .core
        .queue_buffer_upload(buffer.handle(), &[9; 32], 48)
        .unwrap_err();
    assert!(matches!(
        err,
        FrameError::StagingExhausted {
            requested: 32,
            available: 16
        }
    ));
    ctx.core.end_frame().unwrap();
    ctx.finish();

    // The rejected upload left no trace; the accepted one was applied.
    let contents = ctx.dummy.buffer_contents(buffer.handle()).unwrap();
    assert!(contents[..48].iter().all(|&b| b == 7));
    assert!(contents[48..].iter().all(|&b| b == 0));
}

#[test]
fn test_upload_outside_frame_is_refused() {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(16);

    let err = ctx
        .core
        .queue_buffer_upload(buffer.handle(), &[1; 4], 0)
        .unwrap_err();
    assert!(matches!(err, FrameError::NotRecording));

    ctx.run_frame();
    let err = ctx
        .core
        .queue_buffer_upload(buffer.handle(), &[1; 4], 0)
        .unwrap_err();
    assert!(matches!(err, FrameError::NotRecording));

    // Empty uploads are a no-op everywhere.
    ctx.core.queue_buffer_upload(buffer.handle(), &[], 0).unwrap();
    ctx.finish();
}

#[rstest]
#[case::past_end(12, 8)]
#[case::offset_beyond_size(32, 1)]
#[case::offset_overflow(u64::MAX, 2)]
fn test_out_of_range_buffer_upload_is_rejected(#[case] offset: u64, #[case] len: usize) {
    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer(16);

    ctx.core.begin_frame().unwrap();
    let err = ctx
        .core
        .queue_buffer_upload(buffer.handle(), &vec![0; len], offset)
        .unwrap_err();
    assert!(matches!(err, FrameError::InvalidParameter(_)));
    ctx.core.end_frame().unwrap();
    ctx.finish();
}

#[test]
fn test_invalid_texture_uploads_are_rejected() {
    let ctx = TestContext::new();
    let texture = ctx
        .core
        .create_texture(
            &TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::COPY_DST)
                .with_mip_levels(2),
        )
        .unwrap();
    let data = vec![0; texture.upload_size() as usize];

    ctx.core.begin_frame().unwrap();
    for mip_count in [Some(0), Some(3)] {
        let err = ctx
            .core
            .queue_texture_upload(texture.handle(), &data, mip_count)
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidParameter(_)));
    }
    let err = ctx
        .core
        .queue_texture_upload(texture.handle(), &data[..10], None)
        .unwrap_err();
    assert!(matches!(err, FrameError::InvalidParameter(_)));
    ctx.core.end_frame().unwrap();
    ctx.finish();
}

#[rstest]
#[case::multisampled(
    TextureDescriptor::new_2d(
        4,
        4,
        TextureFormat::Rgba8Unorm,
        TextureUsage::COPY_DST | TextureUsage::RENDER_ATTACHMENT,
    )
    .with_sample_count(4),
    "samples"
)]
#[case::combined_depth_stencil(
    TextureDescriptor::new_2d(4, 4, TextureFormat::Depth24PlusStencil8, TextureUsage::COPY_DST),
    "depth-stencil"
)]
#[case::missing_copy_dst(
    TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING),
    "COPY_DST"
)]
fn test_uncopyable_textures_are_rejected(
    #[case] descriptor: TextureDescriptor,
    #[case] reason: &str,
) {
    let ctx = TestContext::new();
    let texture = ctx.core.create_texture(&descriptor).unwrap();
    let data = generate_test_pattern(texture.upload_size() as usize);
    let source = ctx.create_target_buffer(texture.upload_size());

    ctx.core.begin_frame().unwrap();
    let errors = [
        ctx.core
            .queue_texture_upload(texture.handle(), &data, None)
            .unwrap_err(),
        ctx.core
            .queue_buffer_to_texture_copy(source.handle(), texture.handle(), 0)
            .unwrap_err(),
    ];
    for err in errors {
        match err {
            FrameError::InvalidParameter(message) => assert!(
                message.contains(reason),
                "unexpected message: {}",
                message
            ),
            other => panic!("unexpected error: {:?}", other),
        }
    }
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert!(ctx
        .dummy
        .texture_contents(texture.handle())
        .unwrap()
        .iter()
        .all(|&b| b == 0));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_producers_during_frame() {
    const PRODUCERS: usize = 4;
    const CHUNK: usize = 64;

    let ctx = TestContext::new();
    let buffer = ctx.create_target_buffer((PRODUCERS * CHUNK) as u64);
    let handle = buffer.handle();

    ctx.core.begin_frame().unwrap();
    let workers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let core = ctx.core.clone();
            thread::spawn(move || {
                core.queue_buffer_upload(
                    handle,
                    &[producer as u8 + 1; CHUNK],
                    (producer * CHUNK) as u64,
                )
                .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    ctx.core.end_frame().unwrap();
    ctx.finish();

    let contents = ctx.dummy.buffer_contents(handle).unwrap();
    for (producer, chunk) in contents.chunks(CHUNK).enumerate() {
        assert!(chunk.iter().all(|&b| b == producer as u8 + 1));
    }
}

#[test]
fn test_concurrent_drops_are_destroyed_exactly_once() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 16;

    let ctx = TestContext::new();
    let buffers: Vec<Vec<_>> = (0..THREADS)
        .map(|_| {
            (0..PER_THREAD)
                .map(|_| ctx.create_target_buffer(4))
                .collect()
        })
        .collect();
    let objects: Vec<GpuObject> = buffers
        .iter()
        .flatten()
        .map(|b| GpuObject::Buffer(b.handle()))
        .collect();

    ctx.core.begin_frame().unwrap();
    let workers: Vec<_> = buffers
        .into_iter()
        .map(|batch| thread::spawn(move || drop(batch)))
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    ctx.core.end_frame().unwrap();

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.run_frame();
    }
    ctx.finish();

    let destroyed = ctx.dummy.destroyed_objects();
    for object in &objects {
        assert!(!ctx.dummy.is_alive(*object));
        assert_eq!(destroyed.iter().filter(|o| *o == object).count(), 1);
    }
}

// ============================================================================
// Render Passes
// ============================================================================

fn render_target(ctx: &TestContext, format: TextureFormat, usage: TextureUsage) -> Texture {
    ctx.core
        .create_texture(&TextureDescriptor::new_2d(64, 64, format, usage).with_label("target"))
        .unwrap()
}

#[test]
fn test_render_pass_cache_returns_same_pass_for_equal_keys() {
    let ctx = TestContext::new();
    let cache = ctx
        .core
        .render_pass_cache()
        .expect("dummy without dynamic rendering has a cache");

    let key = RenderPassKey {
        view_mask: 0,
        color: Some(AttachmentDescriptor::new(
            TextureFormat::Bgra8UnormSrgb,
            LoadOp::Clear,
            StoreOp::Store,
        )),
        depth: Some(AttachmentDescriptor::new(
            TextureFormat::Depth32Float,
            LoadOp::Clear,
            StoreOp::DontCare,
        )),
    };
    let pass = cache.get_pass(&key).unwrap();
    let equal_key = RenderPassKey { ..key };
    assert_eq!(cache.get_pass(&equal_key).unwrap(), pass);
    assert_eq!(ctx.dummy.created_count(ObjectKind::RenderPass), 1);

    let TestContext { dummy, core } = ctx;
    drop(core);
    assert!(!dummy.is_alive(GpuObject::RenderPass(pass)));
}

#[test]
fn test_no_render_pass_cache_with_dynamic_rendering() {
    let ctx = TestContext::with_features(
        parameters(TEST_STAGING_SIZE, OverflowPolicy::Grow),
        SupportedFeatures {
            dynamic_rendering: true,
            ..Default::default()
        },
    );
    assert!(ctx.core.render_pass_cache().is_none());
}

#[test]
fn test_cached_render_pass_is_reused_across_frames() {
    let ctx = TestContext::new();
    let color = render_target(&ctx, TextureFormat::Rgba8Unorm, TextureUsage::RENDER_ATTACHMENT);
    let depth = render_target(&ctx, TextureFormat::Depth32Float, TextureUsage::RENDER_ATTACHMENT);
    let descriptor = RenderPassDescriptor::new(64, 64)
        .with_color(color.handle(), LoadOp::Clear, StoreOp::Store)
        .with_depth(depth.handle(), LoadOp::Clear, StoreOp::DontCare);

    let frames = 2 * MAX_FRAMES_IN_FLIGHT;
    let mut bindings = Vec::new();
    for _ in 0..frames {
        ctx.core.begin_frame().unwrap();
        let pass = ctx.core.begin_render_pass(&descriptor).unwrap();
        assert_eq!(pass.command_buffer(), ctx.core.frame_command_buffer());
        bindings.push(pass.binding());
        ctx.core.end_render_pass(pass).unwrap();
        ctx.core.end_frame().unwrap();
    }
    ctx.finish();

    assert!(matches!(bindings[0], RenderPassBinding::Cached { .. }));
    assert!(bindings.iter().all(|binding| *binding == bindings[0]));
    assert_eq!(ctx.dummy.created_count(ObjectKind::RenderPass), 1);
    assert_eq!(ctx.dummy.created_count(ObjectKind::Framebuffer), 1);

    let records = ctx.dummy.render_passes();
    assert_eq!(records.len(), frames);
    for record in &records {
        assert_eq!(record.attachments, vec![depth.handle(), color.handle()]);
        assert_eq!(record.binding, bindings[0]);
    }
}

#[test]
fn test_render_pass_changes_with_load_op() {
    let ctx = TestContext::new();
    let color = render_target(&ctx, TextureFormat::Bgra8UnormSrgb, TextureUsage::RENDER_ATTACHMENT);
    let clear =
        RenderPassDescriptor::new(64, 64).with_color(color.handle(), LoadOp::Clear, StoreOp::Store);
    let load =
        RenderPassDescriptor::new(64, 64).with_color(color.handle(), LoadOp::Load, StoreOp::Store);

    ctx.core.begin_frame().unwrap();
    let first = ctx.core.begin_render_pass(&clear).unwrap();
    let first_binding = first.binding();
    ctx.core.end_render_pass(first).unwrap();
    let second = ctx.core.begin_render_pass(&load).unwrap();
    let second_binding = second.binding();
    ctx.core.end_render_pass(second).unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert_ne!(first_binding, second_binding);
    assert_eq!(ctx.dummy.created_count(ObjectKind::RenderPass), 2);
    assert_eq!(ctx.dummy.render_passes().len(), 2);
}

#[test]
fn test_dynamic_rendering_binds_without_render_pass() {
    let ctx = TestContext::with_features(
        parameters(TEST_STAGING_SIZE, OverflowPolicy::Grow),
        SupportedFeatures {
            dynamic_rendering: true,
            ..Default::default()
        },
    );
    let color = render_target(&ctx, TextureFormat::Rgba16Float, TextureUsage::RENDER_ATTACHMENT);
    let descriptor =
        RenderPassDescriptor::new(32, 32).with_color(color.handle(), LoadOp::Clear, StoreOp::Store);

    ctx.core.begin_frame().unwrap();
    let pass = ctx.core.begin_render_pass(&descriptor).unwrap();
    assert_eq!(pass.binding(), RenderPassBinding::Dynamic);
    ctx.core.end_render_pass(pass).unwrap();
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert_eq!(ctx.dummy.created_count(ObjectKind::RenderPass), 0);
    assert_eq!(ctx.dummy.created_count(ObjectKind::Framebuffer), 0);
    let records = ctx.dummy.render_passes();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].binding, RenderPassBinding::Dynamic);
}

#[test]
fn test_render_pass_on_sampled_texture_is_rejected() {
    let ctx = TestContext::new();
    let color = render_target(&ctx, TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING);
    let descriptor =
        RenderPassDescriptor::new(64, 64).with_color(color.handle(), LoadOp::Clear, StoreOp::Store);

    ctx.core.begin_frame().unwrap();
    let err = ctx.core.begin_render_pass(&descriptor).unwrap_err();
    assert!(matches!(err, FrameError::InvalidParameter(_)));
    ctx.core.end_frame().unwrap();
    ctx.finish();

    assert!(ctx.dummy.render_passes().is_empty());
    assert_eq!(ctx.dummy.created_count(ObjectKind::RenderPass), 0);
}

// ============================================================================
// Contract Violations
// ============================================================================

#[test]
#[should_panic(expected = "without a matching begin_frame")]
fn test_end_frame_without_begin_panics() {
    let ctx = TestContext::new();
    let _ = ctx.core.end_frame();
}

#[test]
#[should_panic(expected = "already being recorded")]
fn test_nested_begin_frame_panics() {
    let ctx = TestContext::new();
    ctx.core.begin_frame().unwrap();
    let _ = ctx.core.begin_frame();
}

#[test]
#[should_panic(expected = "outside a recording window")]
fn test_command_buffer_outside_frame_panics() {
    let ctx = TestContext::new();
    let _ = ctx.core.frame_command_buffer();
}

#[test]
#[should_panic(expected = "out of range")]
fn test_slot_index_out_of_range_panics() {
    let ctx = TestContext::new();
    let _ = ctx.core.frame_command_buffer_at(MAX_FRAMES_IN_FLIGHT);
}
