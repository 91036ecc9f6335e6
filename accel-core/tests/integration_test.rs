use accel_core::testing::{
    one_hot, CacheSumModel, FixedNoise, FlakyModel, OneHotEmbedder, ScriptedModel, TransitionModel,
};
use accel_core::*;
use candle_core::{DType, Device, Tensor};
use candle_nn::Linear;

const STOP: u32 = 31;

fn small_config(graphs: bool) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            num_layers: 1,
            num_kv_heads: 1,
            head_dim: 1,
            block_size: 4,
            num_blocks: 32,
            dtype: CacheDtype::F32,
        },
        graph: if graphs {
            GraphConfig {
                max_context_len: 64,
                ..Default::default()
            }
        } else {
            GraphConfig::disabled()
        },
        ..Default::default()
    }
}

fn token_engine(model: Box<dyn DecoderModel>, graphs: bool) -> AccelEngine {
    AccelEngine::new(model, None, InputMode::Tokens, small_config(graphs)).unwrap()
}

fn logits_row(vocab: usize, hot: usize) -> Vec<f32> {
    let mut row = vec![0.0; vocab];
    row[hot] = 5.0;
    row
}

#[test]
fn test_end_to_end_greedy() {
    // One scripted row per forward call, so no capture calls may run
    let model = ScriptedModel::new(vec![logits_row(20, 11), logits_row(20, 3), logits_row(20, 17)]).unwrap();
    let mut engine = token_engine(Box::new(model), false);

    let out = engine
        .generate(&GenerateRequest::new(vec![vec![5, 9, 2]], GenerationParams::greedy(3)))
        .unwrap();

    assert_eq!(out.sequences, vec![vec![5, 9, 2, 11, 3, 17]]);
    assert_eq!(out.generated, vec![vec![11, 3, 17]]);
    assert_eq!(out.finish_reason, FinishReason::Length);
    assert_eq!(engine.cache_stats().free_blocks, 32);
}

#[test]
fn test_greedy_is_repeatable() {
    let prompts = vec![vec![3, 1, 4], vec![1, 5]];
    let mut engine = token_engine(Box::new(CacheSumModel::new(50, 4)), true);
    let first = engine
        .generate(&GenerateRequest::new(prompts.clone(), GenerationParams::greedy(6)))
        .unwrap();
    for _ in 0..3 {
        let again = engine
            .generate(&GenerateRequest::new(prompts.clone(), GenerationParams::greedy(6)))
            .unwrap();
        assert_eq!(again.sequences, first.sequences);
    }
}

#[test]
fn test_batch_wide_stop() {
    let model = TransitionModel::new(32)
        .with_transition(10, 11)
        .with_transition(11, STOP)
        .with_transition(20, 21)
        .with_transition(21, 22)
        .with_transition(22, 23);
    let mut engine = token_engine(Box::new(model), true);
    let params = GenerationParams {
        max_new_tokens: 5,
        temperature: 0.0,
        stop_tokens: vec![STOP],
    };

    let out = engine
        .generate(&GenerateRequest::new(vec![vec![10], vec![20]], params))
        .unwrap();

    assert_eq!(out.finish_reason, FinishReason::Stop);
    assert_eq!(out.generated, vec![vec![11], vec![21, 22]]);
    assert_eq!(out.sequences, vec![vec![10, 11], vec![20, 21, 22]]);
    assert_eq!(engine.cache_stats().free_blocks, 32);
}

#[test]
fn test_stop_at_first_token_returns_immediately() {
    let model = TransitionModel::new(32).with_transition(5, STOP);
    let mut engine = token_engine(Box::new(model), true);
    let params = GenerationParams {
        max_new_tokens: 10,
        temperature: 0.0,
        stop_tokens: vec![STOP],
    };

    let out = engine
        .generate(&GenerateRequest::new(vec![vec![5], vec![7]], params))
        .unwrap();

    assert_eq!(out.finish_reason, FinishReason::Stop);
    assert_eq!(out.sequences, vec![vec![5], vec![7, 8]]);
    // Decode never started, so nothing was captured
    assert!(engine.stats().captured_sizes.is_empty());
    assert_eq!(engine.cache_stats().free_blocks, 32);
}

#[test]
fn test_replay_matches_direct_execution() {
    let prompts = vec![vec![3, 5, 7], vec![2, 2, 2, 2, 2, 2], vec![9]];
    let params = GenerationParams {
        max_new_tokens: 6,
        temperature: 0.8,
        stop_tokens: vec![],
    };

    let run = |graphs: bool, params: &GenerationParams| {
        let mut engine = token_engine(Box::new(CacheSumModel::new(50, 4)), graphs)
            .with_sampler(Sampler::with_noise(Box::new(FixedNoise(1.0))));
        let out = engine
            .generate(&GenerateRequest::new(prompts.clone(), params.clone()))
            .unwrap();
        (out, engine.stats())
    };

    let (replayed, replay_stats) = run(true, &params);
    let (direct, direct_stats) = run(false, &params);
    let (greedy, _) = run(false, &GenerationParams::greedy(6));

    assert_eq!(replayed.sequences, direct.sequences);
    assert_eq!(direct.sequences, greedy.sequences);
    assert_eq!(replay_stats.captured_sizes, vec![1, 2, 4, 8]);
    assert_eq!(replay_stats.replays, 5);
    assert_eq!(replay_stats.fallbacks, 0);
    assert_eq!(direct_stats.replays, 0);
    assert_eq!(direct_stats.fallbacks, 0);
    assert_eq!(direct_stats.direct_steps, 5);
}

#[test]
fn test_cache_backed_decode_follows_context() {
    let mut engine = token_engine(Box::new(CacheSumModel::new(1000, 4)), true);
    let out = engine
        .generate(&GenerateRequest::new(vec![vec![1, 2, 3]], GenerationParams::greedy(4)))
        .unwrap();

    // Each token is the sum of everything before it
    assert_eq!(out.sequences, vec![vec![1, 2, 3, 6, 12, 24, 48]]);
}

#[test]
fn test_prefix_reuse_across_calls() {
    let prompt: Vec<u32> = (1..=10).collect();
    let mut engine = token_engine(Box::new(CacheSumModel::new(97, 4)), false);

    let first = engine
        .generate(&GenerateRequest::new(vec![prompt.clone()], GenerationParams::greedy(4)))
        .unwrap();
    assert!(engine.cache_stats().cached_blocks >= 2);

    let second = engine
        .generate(&GenerateRequest::new(vec![prompt], GenerationParams::greedy(4)))
        .unwrap();
    assert_eq!(second.sequences, first.sequences);
    assert_eq!(engine.cache_stats().free_blocks, 32);
    assert_eq!(engine.stats().requests, 2);
    assert_eq!(engine.stats().tokens_generated, 8);
}

#[test]
fn test_block_completed_by_decode_is_reused() {
    let mut engine = token_engine(Box::new(CacheSumModel::new(97, 4)), true);

    let first = engine
        .generate(&GenerateRequest::new(vec![vec![1, 2, 3]], GenerationParams::greedy(3)))
        .unwrap();
    assert_eq!(first.sequences, vec![vec![1, 2, 3, 6, 12, 24]]);
    // Block 0 was completed by `6` and written by the following decode step
    assert_eq!(engine.cache_stats().cached_blocks, 1);

    let second = engine
        .generate(&GenerateRequest::new(vec![vec![1, 2, 3, 6, 10]], GenerationParams::greedy(2)))
        .unwrap();
    assert_eq!(second.sequences, vec![vec![1, 2, 3, 6, 10, 22, 44]]);
}

#[test]
fn test_block_filled_by_final_token_is_not_reused() {
    let follow_up = GenerateRequest::new(vec![vec![1, 2, 3, 6, 10]], GenerationParams::greedy(1));
    let expected = vec![vec![1, 2, 3, 6, 10, 22]];
    let stop_at_80 = GenerationParams {
        stop_tokens: vec![80],
        ..GenerationParams::greedy(5)
    };

    // Each first call ends on a token that fills block 0 without a forward
    // pass writing it: single-token prefill, length limit, batch-wide stop.
    let first_calls = vec![
        GenerateRequest::new(vec![vec![1, 2, 3]], GenerationParams::greedy(1)),
        GenerateRequest::new(vec![vec![1, 2]], GenerationParams::greedy(2)),
        GenerateRequest::new(vec![vec![1, 2], vec![40]], stop_at_80),
    ];
    for first_call in first_calls {
        let mut engine = token_engine(Box::new(CacheSumModel::new(97, 4)), false);
        let first = engine.generate(&first_call).unwrap();
        assert_eq!(first.sequences[0], vec![1, 2, 3, 6]);
        assert_eq!(engine.cache_stats().cached_blocks, 0);

        let second = engine.generate(&follow_up).unwrap();
        assert_eq!(second.sequences, expected);
    }
}

#[test]
fn test_failed_prefill_leaves_no_reusable_blocks() {
    let model = FlakyModel::new(CacheSumModel::new(97, 4), 1);
    let mut engine = token_engine(Box::new(model), false);
    let req = GenerateRequest::new(vec![vec![1, 2, 3, 4, 5]], GenerationParams::greedy(1));

    assert!(engine.generate(&req).is_err());
    assert_eq!(engine.cache_stats().free_blocks, 32);
    assert_eq!(engine.cache_stats().cached_blocks, 0);

    let out = engine.generate(&req).unwrap();
    assert_eq!(out.sequences, vec![vec![1, 2, 3, 4, 5, 15]]);
}

#[test]
fn test_decode_ceiling() {
    let mut engine = token_engine(Box::new(TransitionModel::new(32)), true);
    let prompts: Vec<Vec<u32>> = (0..9).map(|i| vec![i, i + 1]).collect();

    let err = engine
        .generate(&GenerateRequest::new(prompts.clone(), GenerationParams::greedy(3)))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::BatchTooLarge { size: 9, limit: 8 })
    );
    assert_eq!(engine.cache_stats().free_blocks, 32);

    // A prefill-only call never reaches a decode step
    let out = engine
        .generate(&GenerateRequest::new(prompts, GenerationParams::greedy(1)))
        .unwrap();
    assert_eq!(out.sequences.len(), 9);
}

#[test]
fn test_out_of_blocks_rejects_whole_batch() {
    let mut config = small_config(false);
    config.cache.num_blocks = 3;
    let mut engine = AccelEngine::new(Box::new(TransitionModel::new(32)), None, InputMode::Tokens, config).unwrap();

    let err = engine
        .generate(&GenerateRequest::new(
            vec![vec![1; 8], vec![2; 5]],
            GenerationParams::greedy(2),
        ))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::OutOfBlocks {
            requested: 4,
            available: 3
        })
    );
    assert_eq!(engine.cache_stats().free_blocks, 3);
}

#[test]
fn test_embedding_mode_positions() {
    let embedder = OneHotEmbedder::new(16);
    let mut engine = AccelEngine::new(
        Box::new(TransitionModel::new(16)),
        None,
        InputMode::Embeddings(Box::new(embedder.clone())),
        small_config(false),
    )
    .unwrap();

    let conditioning = one_hot(&[2, 3, 4], 16, &Device::Cpu)
        .unwrap()
        .unsqueeze(0)
        .unwrap();
    let req = GenerateRequest::new(vec![vec![0, 0, 0, 9]], GenerationParams::greedy(3))
        .with_conditioning(conditioning);

    let out = engine.generate(&req).unwrap();
    assert_eq!(out.generated, vec![vec![10, 11, 12]]);
    assert_eq!(out.sequences, vec![vec![0, 0, 0, 9, 10, 11, 12]]);
    // Start token at position 0, then one position per decoded token
    assert_eq!(embedder.seen_positions(), vec![0, 1, 2]);
    assert_eq!(engine.cache_stats().cached_blocks, 0);
}

#[test]
fn test_embedding_mode_with_plans() {
    let mut engine = AccelEngine::new(
        Box::new(TransitionModel::new(16)),
        None,
        InputMode::Embeddings(Box::new(OneHotEmbedder::new(16))),
        small_config(true),
    )
    .unwrap();

    let conditioning = one_hot(&[1, 1, 5, 6, 7, 8], 16, &Device::Cpu)
        .unwrap()
        .reshape((2, 3, 16))
        .unwrap();
    let req = GenerateRequest::new(vec![vec![0, 0, 0, 3], vec![0, 0, 0, 12]], GenerationParams::greedy(3))
        .with_conditioning(conditioning);

    let out = engine.generate(&req).unwrap();
    assert_eq!(out.generated, vec![vec![4, 5, 6], vec![13, 14, 15]]);
    assert_eq!(engine.stats().replays, 2);
}

#[test]
fn test_linear_head_projects_hidden() {
    // Permutation head: hidden one-hot i becomes logits one-hot (i + 1) % 8
    let mut weight = vec![0f32; 64];
    for i in 0..8 {
        weight[((i + 1) % 8) * 8 + i] = 1.0;
    }
    let weight = Tensor::from_vec(weight, (8, 8), &Device::Cpu).unwrap();
    let head: Box<dyn LmHead> = Box::new(Linear::new(weight, None));

    let mut engine = AccelEngine::new(
        Box::new(TransitionModel::new(8)),
        Some(head),
        InputMode::Tokens,
        small_config(true),
    )
    .unwrap();

    let out = engine
        .generate(&GenerateRequest::new(vec![vec![1]], GenerationParams::greedy(2)))
        .unwrap();
    assert_eq!(out.sequences, vec![vec![1, 3, 5]]);
}

#[test]
fn test_seeded_sampling_reproducible() {
    let flat = vec![vec![1.0f32; 16]];
    let params = GenerationParams {
        max_new_tokens: 8,
        temperature: 1.0,
        stop_tokens: vec![],
    };
    let run = || {
        let mut engine = token_engine(Box::new(ScriptedModel::new(flat.clone()).unwrap()), true);
        engine
            .generate(&GenerateRequest::new(vec![vec![0], vec![1]], params.clone()))
            .unwrap()
            .sequences
    };
    assert_eq!(run(), run());
}

#[test]
fn test_config_from_json_drives_engine() {
    let config = EngineConfig::from_json_str(
        r#"{
            "cache": { "num_layers": 1, "num_kv_heads": 1, "head_dim": 1,
                       "block_size": 8, "num_blocks": 4, "dtype": "f32" },
            "graph": { "enabled": false },
            "seed": 7
        }"#,
    )
    .unwrap();
    assert_eq!(config.seed, 7);

    let mut engine = AccelEngine::new(Box::new(TransitionModel::new(32)), None, InputMode::Tokens, config).unwrap();
    let out = engine
        .generate(&GenerateRequest::new(vec![vec![1, 2]], GenerationParams::greedy(3)))
        .unwrap();
    assert_eq!(out.sequences, vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(engine.cache_stats().total_blocks, 4);
}

#[test]
fn test_cache_dtype_roundtrip() {
    assert_eq!(CacheDtype::Bf16.as_dtype(), DType::BF16);
}
