use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ember_bench::{logits, vocab, N_VOCAB};
use ember_infer::grammar::GrammarState;
use ember_infer::sampler::{SamplerPipeline, TokenConstraint};
use ember_infer::{GrammarSpec, SamplingParams};
use std::sync::Arc;

fn bench_sampler(c: &mut Criterion) {
    let (vocab, pieces) = vocab().expect("bench vocab");
    let logits = logits();
    let history: Vec<u32> = (0..256).map(|i| (i * 37 % N_VOCAB) as u32).collect();

    let configs = [
        ("greedy", SamplingParams { temperature: 0.0, seed: 1, ..Default::default() }),
        ("default chain", SamplingParams { seed: 1, ..Default::default() }),
        (
            "penalties + dry",
            SamplingParams {
                seed: 1,
                penalty_repeat: 1.1,
                penalty_freq: 0.1,
                dry_multiplier: 0.8,
                ..Default::default()
            },
        ),
        ("mirostat v2", SamplingParams { seed: 1, mirostat: 2, ..Default::default() }),
    ];
    for (name, params) in configs {
        c.bench_function(&format!("sample 32k {name}"), |b| {
            b.iter_batched(
                || {
                    let mut s = SamplerPipeline::new(&params, &vocab, &pieces, 4096, None);
                    s.prime(&history);
                    s
                },
                |mut s| s.sample(black_box(&logits)),
                BatchSize::SmallInput,
            )
        });
    }
}

fn bench_grammar(c: &mut Criterion) {
    let (vocab, pieces) = vocab().expect("bench vocab");
    let spec = GrammarSpec {
        json_schema: Some(serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "count": { "type": "integer" }
            },
            "required": ["name", "count"]
        })),
        ..Default::default()
    };

    c.bench_function("json schema compile", |b| {
        b.iter(|| GrammarState::compile(black_box(&spec), &vocab, Arc::clone(&pieces)))
    });

    let state = GrammarState::compile(&spec, &vocab, Arc::clone(&pieces))
        .expect("compile")
        .expect("grammar");
    c.bench_function("grammar mask 32k at start", |b| {
        b.iter(|| (0..N_VOCAB as u32).filter(|&t| state.allows(black_box(t))).count())
    });
}

criterion_group!(benches, bench_sampler, bench_grammar);
criterion_main!(benches);
