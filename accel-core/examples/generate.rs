//! Example: batched generation with a randomly initialised toy decoder
//!
//! Runs the token path and the conditioning-embedding path on CPU.
//!
//! Run with:
//!   cargo run --example generate -- --max-tokens 16
//!   cargo run --example generate -- --config engine.json --temperature 0
//!   RUST_LOG=debug cargo run --example generate

use accel_core::{
    AccelEngine, CacheConfig, CacheDtype, DecoderModel, EngineConfig, ForwardContext,
    GenerateRequest, GenerationParams, InputMode, LearnedEmbedder, LmHead, ModelInput,
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VOCAB: usize = 256;
const HIDDEN: usize = 32;

/// Embedding followed by one tanh projection. Keeps no cache.
struct ToyDecoder {
    embed: Embedding,
    mix: Linear,
    device: Device,
}

impl ToyDecoder {
    fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embed: candle_nn::embedding(VOCAB, HIDDEN, vb.pp("embed"))?,
            mix: candle_nn::linear(HIDDEN, HIDDEN, vb.pp("mix"))?,
            device: vb.device().clone(),
        })
    }
}

impl DecoderModel for ToyDecoder {
    fn forward(&mut self, input: ModelInput, _ctx: &ForwardContext) -> Result<Tensor> {
        let x = match input {
            ModelInput::Tokens { input_ids, .. } => self.embed.forward(&input_ids)?,
            ModelInput::Embeddings { inputs_embeds } => inputs_embeds,
        };
        Ok(Module::forward(&self.mix, &x)?.tanh()?)
    }

    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn arg<T: std::str::FromStr>(args: &[String], name: &str) -> Option<T> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let max_tokens: usize = arg(&args, "--max-tokens").unwrap_or(16);
    let temperature: f64 = arg(&args, "--temperature").unwrap_or(0.8);

    let config = match arg::<String>(&args, "--config") {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::with_cache(CacheConfig {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 16,
            block_size: 16,
            num_blocks: 64,
            dtype: CacheDtype::F32,
        }),
    };
    info!("Engine config: {}", serde_json::to_string(&config)?);

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let params = GenerationParams {
        max_new_tokens: max_tokens,
        temperature,
        stop_tokens: vec![0],
    };

    // Token path
    let head: Box<dyn LmHead> =
        Box::new(candle_nn::linear_no_bias(HIDDEN, VOCAB, vb.pp("head"))?);
    let mut engine = AccelEngine::new(
        Box::new(ToyDecoder::new(vb.pp("decoder"))?),
        Some(head),
        InputMode::Tokens,
        config.clone(),
    )?;
    let prompts = vec![vec![5, 9, 2], vec![17, 3, 3, 8, 1], vec![42]];
    let out = engine.generate(&GenerateRequest::new(prompts, params.clone()))?;
    for (i, seq) in out.sequences.iter().enumerate() {
        println!("row {}: {:?}", i, seq);
    }
    println!(
        "finish: {:?}, {:.1} tok/s",
        out.finish_reason, out.tokens_per_second
    );

    // Conditioning-embedding path
    let embedder = LearnedEmbedder::load(vb.pp("cond"), VOCAB, 1024, HIDDEN)?;
    let head: Box<dyn LmHead> =
        Box::new(candle_nn::linear_no_bias(HIDDEN, VOCAB, vb.pp("head"))?);
    let mut engine = AccelEngine::new(
        Box::new(ToyDecoder::new(vb.pp("decoder"))?),
        Some(head),
        InputMode::Embeddings(Box::new(embedder)),
        config,
    )?;
    let cond_len = 12;
    let conditioning = Tensor::randn(0f32, 1.0, (2, cond_len, HIDDEN), &device)?;
    let start_token = 255;
    let prompts = vec![vec![start_token]; 2];
    let req = GenerateRequest::new(prompts, params).with_conditioning(conditioning);
    let out = engine.generate(&req)?;
    for (i, gen) in out.generated.iter().enumerate() {
        println!("speech row {}: {:?}", i, gen);
    }

    let stats = engine.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
