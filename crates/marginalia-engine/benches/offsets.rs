use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use marginalia_engine::{
    BlockId, BlockOverlay, CellMetrics, ContentTree, HighlightEntity, MonospaceSurface,
    OverlayConfig, TextRange, TextSurface, resolve_range,
};

fn paragraph(sentences: usize) -> String {
    "The *quick* brown fox jumps over the **lazy** dog, then $e^{i\\pi}$ happens. ".repeat(sentences)
}

fn bench_resolve_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("offsets");
    group.sample_size(10);

    let surface = MonospaceSurface::new(
        ContentTree::from_markdown(&paragraph(50)),
        CellMetrics::default(),
        640.0,
    );
    let len = surface.content().text_len();

    group.bench_function("resolve_range_short", |b| {
        b.iter(|| resolve_range(std::hint::black_box(&surface), TextRange::new(len / 2, len / 2 + 5)));
    });

    group.bench_function("resolve_range_whole_block", |b| {
        b.iter(|| resolve_range(std::hint::black_box(&surface), TextRange::new(0, len)));
    });

    group.finish();
}

fn bench_overlay_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("overlay");
    group.sample_size(10);

    let block = BlockId::new("bench");
    let mut surface = MonospaceSurface::new(
        ContentTree::from_markdown(&paragraph(20)),
        CellMetrics::default(),
        640.0,
    );
    let len = surface.content().text_len();
    let entities: Vec<HighlightEntity> = (0..len.saturating_sub(20))
        .step_by(7)
        .enumerate()
        .map(|(i, start)| {
            let range = TextRange::new(start, start + 12);
            match i % 3 {
                0 => HighlightEntity::annotation(block.clone(), range, "", "", i as u64),
                1 => HighlightEntity::definition(block.clone(), range, "", "", i as u64),
                _ => HighlightEntity::rabbithole(block.clone(), range, "c", "", i as u64),
            }
        })
        .collect();
    let entities = Arc::new(entities);

    group.bench_function("render_after_resize", |b| {
        let mut overlay = BlockOverlay::new(block.clone(), OverlayConfig::default());
        overlay.set_entities(entities.clone());
        let mut wide = false;
        b.iter(|| {
            wide = !wide;
            surface.set_width(if wide { 800.0 } else { 640.0 });
            std::hint::black_box(overlay.render(&surface).placed.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_resolve_range, bench_overlay_pass);
criterion_main!(benches);
