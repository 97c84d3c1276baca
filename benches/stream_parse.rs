use criterion::{black_box, criterion_group, criterion_main, Criterion};

use branchchat::accounting::{HeuristicTokenCounter, StreamAccumulator};
use branchchat::stream::{normalize_frame, FrameOutcome, SseParser, Utf8ChunkDecoder};
use branchchat::tree::types::{ChatId, ContentPart, MessageId, MessageNode, Role};
use branchchat::tree::ChatForest;
use chrono::Utc;

fn completion_body(deltas: usize) -> Vec<u8> {
    let mut body = String::new();
    for index in 0..deltas {
        body.push_str(&format!(
            "data: {{\"id\":\"chatcmpl-1\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"token {index} \u{00e9}\u{4e2d} \"}}}}]}}\n\n"
        ));
    }
    body.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":120,\"completion_tokens\":400,\"total_tokens\":520}}\n\n");
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

fn run_pipeline(body: &[u8], chunk_size: usize) -> usize {
    let mut decoder = Utf8ChunkDecoder::new();
    let mut parser = SseParser::new();
    let mut frames = Vec::with_capacity(8);
    let now = std::time::Instant::now();
    let mut acc = StreamAccumulator::new(now, now);
    for chunk in body.chunks(chunk_size) {
        let text = decoder.decode(chunk).expect("valid utf-8");
        parser.feed_into(&text, &mut frames);
        for frame in frames.drain(..) {
            match normalize_frame(&frame).expect("valid frame") {
                FrameOutcome::Delta(delta) => acc.push(&delta),
                FrameOutcome::Done => return acc.text().len(),
                FrameOutcome::Skip => {}
            }
        }
    }
    acc.text().len()
}

fn bench_stream_pipeline(c: &mut Criterion) {
    let body = completion_body(400);

    for chunk_size in [7usize, 64, 1024, 16 * 1024] {
        let name = format!("sse_normalize_400_deltas_chunk_{chunk_size}");
        c.bench_function(&name, |b| {
            b.iter(|| black_box(run_pipeline(black_box(&body), chunk_size)));
        });
    }

    c.bench_function("finish_incomplete_estimate", |b| {
        let now = std::time::Instant::now();
        let mut acc = StreamAccumulator::new(now, now);
        acc.push(&branchchat::stream::NormalizedDelta::text("x".repeat(8_000)));
        b.iter(|| {
            black_box(acc.finish_incomplete(
                branchchat::accounting::FinishReason::Cancelled,
                &HeuristicTokenCounter,
                black_box(120),
            ))
        });
    });
}

fn bench_forest(c: &mut Criterion) {
    let created_at = Utc::now();
    let nodes: Vec<MessageNode> = (1..=5_000u64)
        .map(|id| MessageNode {
            id: MessageId(id),
            parent_id: (id > 1).then(|| MessageId(id / 2)),
            chat_id: ChatId(1),
            role: if id % 2 == 0 { Role::Assistant } else { Role::User },
            content: vec![ContentPart::text("hello")],
            created_at,
            edited: false,
            usage: None,
            reaction: None,
        })
        .collect();

    c.bench_function("forest_build_5000", |b| {
        b.iter(|| black_box(ChatForest::from_nodes(ChatId(1), black_box(nodes.clone()))));
    });

    let forest = ChatForest::from_nodes(ChatId(1), nodes).expect("forest");
    c.bench_function("forest_descendant_closure_root_5000", |b| {
        b.iter(|| black_box(forest.descendant_closure(black_box(MessageId(1)))));
    });
}

criterion_group!(benches, bench_stream_pipeline, bench_forest);
criterion_main!(benches);
