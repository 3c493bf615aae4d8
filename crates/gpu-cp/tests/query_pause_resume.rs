use std::sync::Arc;

use gpu_cp::{
    Context, CpConfig, CpError, DrawInfo, PipelineStatistics, QueryResult, QueryType, Ring,
    SoftwareWinsys, Topology, Winsys,
};
use pretty_assertions::assert_eq;

const SAMPLES: u64 = 16;

fn context(config: CpConfig) -> (Arc<SoftwareWinsys>, Context) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let winsys = Arc::new(SoftwareWinsys::new(1 << 24).with_samples_per_primitive(SAMPLES));
    let ctx = Context::new(winsys.clone(), &config).unwrap();
    (winsys, ctx)
}

fn triangle() -> DrawInfo {
    DrawInfo::new(Topology::TriangleList, 3)
}

#[test]
fn occlusion_accumulates_across_flushes() {
    let (winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::Occlusion);

    ctx.begin_query(query).unwrap();
    for _ in 0..5 {
        ctx.draw(&triangle()).unwrap();
        ctx.flush().unwrap();
    }
    ctx.end_query(query).unwrap();

    let result = ctx.get_query_result(query, true).unwrap();
    assert_eq!(result, Some(QueryResult::U64(5 * SAMPLES)));
    // Five batches with draws, plus the one synced for the result.
    assert_eq!(winsys.submissions().len(), 6);
    assert_eq!(ctx.render().owner_reserve(), 0);
}

#[test]
fn full_query_buffers_are_drained_on_resume() {
    let (_winsys, mut ctx) = context(CpConfig {
        query_buffer_bytes: 16,
        ..CpConfig::default()
    });
    let query = ctx.create_query(QueryType::Occlusion);

    ctx.begin_query(query).unwrap();
    for _ in 0..5 {
        ctx.draw(&triangle()).unwrap();
        ctx.flush().unwrap();
    }
    ctx.end_query(query).unwrap();

    assert_eq!(ctx.stats().query_drains, 5);
    let result = ctx.get_query_result(query, true).unwrap();
    assert_eq!(result, Some(QueryResult::U64(5 * SAMPLES)));
}

#[test]
fn queries_skip_the_work_outside_them() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::Occlusion);

    ctx.draw(&triangle()).unwrap();
    ctx.begin_query(query).unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(query).unwrap();
    ctx.draw(&triangle()).unwrap();

    let result = ctx.get_query_result(query, true).unwrap();
    assert_eq!(result, Some(QueryResult::U64(SAMPLES)));
}

#[test]
fn blits_pause_active_queries() {
    let (winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::Occlusion);
    let src = winsys.alloc_buffer("src", 256).unwrap();
    let dst = winsys.alloc_buffer("dst", 256).unwrap();
    src.write_u64(0, 0xfeed);

    ctx.begin_query(query).unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.copy_buffer(&dst, 0, &src, 0, 256).unwrap();
    assert_eq!(ctx.cp().ring(), Ring::Blt);
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(query).unwrap();

    let result = ctx.get_query_result(query, true).unwrap();
    assert_eq!(result, Some(QueryResult::U64(2 * SAMPLES)));

    let rings: Vec<Ring> = winsys.submissions().iter().map(|s| s.ring).collect();
    assert_eq!(rings, vec![Ring::Render, Ring::Blt, Ring::Render]);
    assert_eq!(dst.read_u64(0), 0xfeed);
}

#[test]
fn time_elapsed_counts_whole_ticks() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::TimeElapsed);

    ctx.begin_query(query).unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.flush().unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(query).unwrap();

    let ns = ctx.get_query_result(query, true).unwrap().unwrap().as_u64();
    assert!(ns > 0);
    assert_eq!(ns % 80, 0);
}

#[test]
fn timestamp_is_captured_at_end() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::Timestamp);

    ctx.draw(&triangle()).unwrap();
    ctx.begin_query(query).unwrap();
    ctx.end_query(query).unwrap();
    assert!(!ctx.render().active_queries(QueryType::Timestamp).contains(&query));

    let ns = ctx.get_query_result(query, true).unwrap().unwrap().as_u64();
    assert!(ns > 0);
    assert_eq!(ns % 80, 0);
}

#[test]
fn pipeline_statistics_follow_draw_parameters() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::PipelineStatistics);

    let mut draw = DrawInfo::new(Topology::TriangleList, 6);
    draw.instance_count = 2;
    ctx.begin_query(query).unwrap();
    ctx.draw(&draw).unwrap();
    ctx.flush().unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(query).unwrap();

    let result = ctx.get_query_result(query, true).unwrap();
    assert_eq!(
        result,
        Some(QueryResult::PipelineStatistics(PipelineStatistics {
            ia_vertices: 15,
            ia_primitives: 5,
            vs_invocations: 15,
            c_invocations: 5,
            c_primitives: 5,
            ps_invocations: 5 * SAMPLES,
            ..PipelineStatistics::default()
        }))
    );
}

#[test]
fn primitive_queries_are_counted_in_software() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let generated = ctx.create_query(QueryType::PrimitivesGenerated);
    let emitted = ctx.create_query(QueryType::PrimitivesEmitted);

    let mut draw = DrawInfo::new(Topology::TriangleStrip, 6);
    draw.so_capacity = Some(3);
    ctx.begin_query(generated).unwrap();
    ctx.begin_query(emitted).unwrap();
    ctx.draw(&draw).unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(generated).unwrap();
    ctx.end_query(emitted).unwrap();

    assert_eq!(
        ctx.get_query_result(generated, true).unwrap(),
        Some(QueryResult::U64(5))
    );
    // The second draw has stream output disabled.
    assert_eq!(
        ctx.get_query_result(emitted, true).unwrap(),
        Some(QueryResult::U64(3))
    );
}

#[test]
fn results_are_unavailable_while_the_gpu_is_busy() {
    let (winsys, mut ctx) = context(CpConfig::default());
    winsys.set_deferred_completion(true);
    let query = ctx.create_query(QueryType::Occlusion);

    ctx.begin_query(query).unwrap();
    ctx.draw(&triangle()).unwrap();
    ctx.end_query(query).unwrap();

    assert_eq!(ctx.get_query_result(query, false).unwrap(), None);
    assert_eq!(winsys.submissions().len(), 1);

    winsys.retire();
    assert_eq!(
        ctx.get_query_result(query, false).unwrap(),
        Some(QueryResult::U64(SAMPLES))
    );
}

#[test]
fn query_misuse_is_reported() {
    let (_winsys, mut ctx) = context(CpConfig::default());
    let query = ctx.create_query(QueryType::Occlusion);

    assert!(matches!(
        ctx.end_query(query),
        Err(CpError::QueryNotActive(id)) if id == query
    ));
    ctx.begin_query(query).unwrap();
    assert!(matches!(
        ctx.begin_query(query),
        Err(CpError::QueryActive(id)) if id == query
    ));
    assert!(matches!(
        ctx.get_query_result(query, true),
        Err(CpError::QueryActive(_))
    ));

    // Destroying an active query ends it first and releases its reservation.
    ctx.destroy_query(query).unwrap();
    assert_eq!(ctx.render().owner_reserve(), 0);
    assert!(matches!(
        ctx.get_query_result(query, true),
        Err(CpError::UnknownQuery(_))
    ));
}
