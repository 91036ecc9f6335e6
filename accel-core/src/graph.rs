//! Decode executors
//!
//! `DirectExecutor` dispatches every decode step to the model.
//! `GraphExecutor` captures one fixed-shape plan per supported batch size over
//! a single set of fixed buffers and replays the plan with refreshed buffer
//! contents. With the `cuda` feature on a CUDA device the plan is a recorded
//! device graph; otherwise replay re-executes the recorded call sequence on
//! the same buffers.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::batcher::DecodeBatch;
use crate::config::GraphConfig;
use crate::context::{DecodeMetadata, ForwardContext};
use crate::error::EngineError;
use crate::model::{ConditioningEmbedder, DecoderModel, ModelInput};

#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub captured_sizes: Vec<usize>,
    pub replays: u64,
    /// Steps a plan executor ran directly because no plan fit
    pub fallbacks: u64,
    /// Steps dispatched straight to the model, fallbacks included
    pub direct_steps: u64,
}

/// Runs the decode forward pass for one step
pub trait DecodeExecutor: Send {
    /// Whether `capture` still has to run before the first step
    fn needs_capture(&self) -> bool;

    fn capture(
        &mut self,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
    ) -> Result<()>;

    /// Hidden state of each row, [batch, hidden]. The returned tensor may
    /// alias executor-owned memory and is only valid until the next call.
    fn execute(
        &mut self,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
        batch: &DecodeBatch,
    ) -> Result<Tensor>;

    fn stats(&self) -> ExecutorStats;
}

/// Plan-replaying executor when plans are enabled, direct dispatch otherwise
pub fn executor_for(config: &GraphConfig, max_blocks: usize) -> Box<dyn DecodeExecutor> {
    if config.enabled {
        Box::new(GraphExecutor::new(config, max_blocks))
    } else {
        Box::new(DirectExecutor::default())
    }
}

/// One decode forward over `input_ids` [batch] and `positions` [batch].
///
/// With an embedder the tokens are embedded and summed with the positional
/// embedding of the clamped position; otherwise the ids go to the model.
pub fn decode_forward(
    model: &mut dyn DecoderModel,
    embedder: Option<&dyn ConditioningEmbedder>,
    input_ids: &Tensor,
    positions: &Tensor,
    ctx: &ForwardContext,
) -> Result<Tensor> {
    let input = match embedder {
        Some(embedder) => {
            let positions = positions.maximum(0i64)?;
            let embeds = embedder
                .embed(input_ids, &positions)?
                .to_dtype(model.dtype())?
                .unsqueeze(1)?;
            ModelInput::Embeddings {
                inputs_embeds: embeds,
            }
        }
        None => ModelInput::tokens(input_ids.unsqueeze(1)?, positions.unsqueeze(1)?),
    };
    let out = model.forward(input, ctx)?;
    if out.rank() == 3 {
        Ok(out.squeeze(1)?)
    } else {
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct DirectExecutor {
    steps: u64,
}

impl DecodeExecutor for DirectExecutor {
    fn needs_capture(&self) -> bool {
        false
    }

    fn capture(
        &mut self,
        _model: &mut dyn DecoderModel,
        _embedder: Option<&dyn ConditioningEmbedder>,
    ) -> Result<()> {
        Ok(())
    }

    fn execute(
        &mut self,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
        batch: &DecodeBatch,
    ) -> Result<Tensor> {
        self.steps += 1;
        decode_forward(model, embedder, &batch.input_ids, &batch.positions, &batch.context)
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            direct_steps: self.steps,
            ..Default::default()
        }
    }
}

/// Fixed buffers shared by every captured plan, sized for the largest one
struct PlanBuffers {
    /// [max_bs], u32
    input_ids: Tensor,
    /// [max_bs], i64
    positions: Tensor,
    /// [max_bs], i64
    slot_mapping: Tensor,
    /// [max_bs], u32
    context_lens: Tensor,
    /// [max_bs, max_blocks], i64
    block_tables: Tensor,
    /// [max_bs, hidden], model dtype
    outputs: Tensor,
}

impl PlanBuffers {
    fn new(
        max_bs: usize,
        max_blocks: usize,
        hidden: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            input_ids: Tensor::zeros(max_bs, DType::U32, device)?,
            positions: Tensor::zeros(max_bs, DType::I64, device)?,
            slot_mapping: Tensor::zeros(max_bs, DType::I64, device)?,
            context_lens: Tensor::zeros(max_bs, DType::U32, device)?,
            block_tables: Tensor::zeros((max_bs, max_blocks), DType::I64, device)?,
            outputs: Tensor::zeros((max_bs, hidden), dtype, device)?,
        })
    }

    fn max_blocks(&self) -> usize {
        self.block_tables.dims()[1]
    }

    /// Context viewing the first `size` rows of the buffers
    fn context(&self, size: usize) -> Result<ForwardContext> {
        Ok(ForwardContext::Decode(DecodeMetadata {
            slot_mapping: self.slot_mapping.narrow(0, 0, size)?,
            context_lens: self.context_lens.narrow(0, 0, size)?,
            block_tables: self.block_tables.narrow(0, 0, size)?,
        }))
    }

    /// Synthetic, shape-correct contents for capturing a plan of `size` rows.
    /// Slots are -1 so nothing lands in live cache cells.
    fn fill_synthetic(&self, size: usize, token_id: u32) -> Result<()> {
        let device = self.input_ids.device();
        self.input_ids
            .slice_set(&Tensor::from_vec(vec![token_id; size], size, device)?, 0, 0)?;
        self.positions
            .slice_set(&Tensor::zeros(size, DType::I64, device)?, 0, 0)?;
        fill_i64(&self.slot_mapping, -1)?;
        self.context_lens
            .slice_set(&Tensor::from_vec(vec![1u32; size], size, device)?, 0, 0)?;
        fill_i64(&self.block_tables, -1)?;
        let first_block = Tensor::zeros((size, 1), DType::I64, device)?;
        let rest = neg_ones((size, self.max_blocks() - 1), device)?;
        self.block_tables
            .slice_set(&Tensor::cat(&[&first_block, &rest], 1)?, 0, 0)?;
        Ok(())
    }

    /// Overwrite buffer contents for a step of `batch`; rows past the batch
    /// get -1 slots and zero context length.
    fn load(&self, batch: &DecodeBatch) -> Result<()> {
        let meta = match &batch.context {
            ForwardContext::Decode(meta) => meta,
            ForwardContext::Prefill(_) => {
                return Err(EngineError::Contract("replay needs a decode context".into()).into())
            }
        };
        let bs = batch.batch_size();
        let (rows, width) = meta.block_tables.dims2()?;
        if rows != bs || meta.slot_mapping.dims1()? != bs || meta.context_lens.dims1()? != bs {
            return Err(EngineError::Contract(format!(
                "decode context rows disagree with batch size {}",
                bs
            ))
            .into());
        }
        let max_blocks = self.max_blocks();
        if width > max_blocks {
            return Err(EngineError::ContextTooLong {
                blocks: width,
                limit: max_blocks,
            }
            .into());
        }

        self.input_ids.slice_set(&batch.input_ids.contiguous()?, 0, 0)?;
        self.positions.slice_set(&batch.positions.contiguous()?, 0, 0)?;
        fill_i64(&self.slot_mapping, -1)?;
        self.slot_mapping
            .slice_set(&meta.slot_mapping.contiguous()?, 0, 0)?;
        self.context_lens.slice_set(
            &Tensor::zeros(self.context_lens.dims1()?, DType::U32, self.context_lens.device())?,
            0,
            0,
        )?;
        self.context_lens
            .slice_set(&meta.context_lens.contiguous()?, 0, 0)?;

        let tables = if width < max_blocks {
            let pad = neg_ones((bs, max_blocks - width), meta.block_tables.device())?;
            Tensor::cat(&[&meta.block_tables, &pad], 1)?
        } else {
            meta.block_tables.contiguous()?
        };
        self.block_tables.slice_set(&tables, 0, 0)?;
        Ok(())
    }
}

fn neg_ones(shape: (usize, usize), device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(vec![-1i64; shape.0 * shape.1], shape, device)?)
}

fn fill_i64(buf: &Tensor, value: i64) -> Result<()> {
    let src = Tensor::from_vec(vec![value; buf.elem_count()], buf.shape().clone(), buf.device())?;
    buf.slice_set(&src, 0, 0)?;
    Ok(())
}

/// Run the decode call sequence of a plan of `size` rows over the buffers
/// and copy the result into the output buffer.
fn run_plan(
    buffers: &PlanBuffers,
    size: usize,
    model: &mut dyn DecoderModel,
    embedder: Option<&dyn ConditioningEmbedder>,
) -> Result<()> {
    let ctx = buffers.context(size)?;
    let input_ids = buffers.input_ids.narrow(0, 0, size)?;
    let positions = buffers.positions.narrow(0, 0, size)?;
    let out = decode_forward(model, embedder, &input_ids, &positions, &ctx)?;
    let out = out.to_dtype(buffers.outputs.dtype())?.contiguous()?;
    buffers.outputs.slice_set(&out, 0, 0)?;
    Ok(())
}

struct CapturedPlan {
    #[cfg(feature = "cuda")]
    graph: Option<native::DeviceGraph>,
}

/// Captured-plan executor
pub struct GraphExecutor {
    capture_sizes: Vec<usize>,
    max_blocks: usize,
    capture_token_id: u32,
    buffers: Option<PlanBuffers>,
    plans: BTreeMap<usize, CapturedPlan>,
    replays: u64,
    fallbacks: u64,
}

impl GraphExecutor {
    pub fn new(config: &GraphConfig, max_blocks: usize) -> Self {
        let mut capture_sizes = config.capture_sizes.clone();
        capture_sizes.sort_unstable();
        capture_sizes.dedup();
        Self {
            capture_sizes,
            max_blocks,
            capture_token_id: config.capture_token_id,
            buffers: None,
            plans: BTreeMap::new(),
            replays: 0,
            fallbacks: 0,
        }
    }

    /// Smallest captured size able to hold `batch_size` rows
    pub fn plan_size_for(&self, batch_size: usize) -> Option<usize> {
        self.plans.range(batch_size..).next().map(|(&size, _)| size)
    }

    fn record(
        buffers: &PlanBuffers,
        size: usize,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
    ) -> Result<CapturedPlan> {
        #[cfg(feature = "cuda")]
        if model.device().is_cuda() {
            let device = model.device().clone();
            let graph = native::DeviceGraph::record(&device, || {
                run_plan(buffers, size, model, embedder)
            })?;
            return Ok(CapturedPlan { graph: Some(graph) });
        }

        run_plan(buffers, size, model, embedder)?;
        Ok(CapturedPlan {
            #[cfg(feature = "cuda")]
            graph: None,
        })
    }
}

impl DecodeExecutor for GraphExecutor {
    fn needs_capture(&self) -> bool {
        self.buffers.is_none()
    }

    fn capture(
        &mut self,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
    ) -> Result<()> {
        if self.buffers.is_some() {
            return Ok(());
        }
        let max_bs = match self.capture_sizes.last() {
            Some(&size) => size,
            None => return Err(EngineError::InvalidConfig("no capture sizes".into()).into()),
        };
        let buffers = PlanBuffers::new(
            max_bs,
            self.max_blocks,
            model.hidden_size(),
            model.dtype(),
            model.device(),
        )?;

        for &size in self.capture_sizes.iter().rev() {
            buffers.fill_synthetic(size, self.capture_token_id)?;
            // Warm-up, not recorded
            run_plan(&buffers, size, model, embedder)?;
            let plan = Self::record(&buffers, size, model, embedder)?;
            model.device().synchronize()?;
            self.plans.insert(size, plan);
            debug!(batch_size = size, "captured decode plan");
        }

        info!(
            sizes = ?self.capture_sizes,
            max_blocks = self.max_blocks,
            "decode plans captured"
        );
        self.buffers = Some(buffers);
        Ok(())
    }

    fn execute(
        &mut self,
        model: &mut dyn DecoderModel,
        embedder: Option<&dyn ConditioningEmbedder>,
        batch: &DecodeBatch,
    ) -> Result<Tensor> {
        let bs = batch.batch_size();
        let size = match self.plan_size_for(bs) {
            Some(size) => size,
            None => {
                if self.fallbacks == 0 {
                    warn!(batch_size = bs, "no captured plan fits, running decode directly");
                }
                self.fallbacks += 1;
                return decode_forward(
                    model,
                    embedder,
                    &batch.input_ids,
                    &batch.positions,
                    &batch.context,
                );
            }
        };
        let buffers = self.buffers.as_ref().ok_or(EngineError::PlanNotInitialized)?;

        buffers.load(batch)?;

        #[cfg(feature = "cuda")]
        let launched = match self.plans.get(&size).and_then(|p| p.graph.as_ref()) {
            Some(graph) => {
                graph.launch()?;
                true
            }
            None => false,
        };
        #[cfg(not(feature = "cuda"))]
        let launched = false;

        if !launched {
            run_plan(buffers, size, model, embedder)?;
        }
        self.replays += 1;

        Ok(buffers.outputs.narrow(0, 0, bs)?)
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            captured_sizes: self.plans.keys().copied().collect(),
            replays: self.replays,
            fallbacks: self.fallbacks,
            direct_steps: self.fallbacks,
        }
    }
}

#[cfg(feature = "cuda")]
mod native {
    use anyhow::{anyhow, bail, Result};
    use candle_core::cuda::cudarc::driver::sys::{
        cuGraphDestroy, cuGraphExecDestroy, cuGraphInstantiateWithFlags, cuGraphLaunch,
        cuStreamBeginCapture_v2, cuStreamEndCapture, CUgraph, CUgraphExec, CUresult, CUstream,
        CUstreamCaptureMode,
    };
    use candle_core::Device;

    fn check(result: CUresult, what: &str) -> Result<()> {
        if result != CUresult::CUDA_SUCCESS {
            bail!("{} failed: {:?}", what, result);
        }
        Ok(())
    }

    fn stream_of(device: &Device) -> Result<CUstream> {
        match device {
            Device::Cuda(dev) => Ok(dev.cuda_stream().cu_stream()),
            _ => Err(anyhow!("device graphs need a CUDA device")),
        }
    }

    /// Instantiated device graph bound to the device's stream
    pub struct DeviceGraph {
        graph: CUgraph,
        exec: CUgraphExec,
        stream: CUstream,
        device: Device,
    }

    // SAFETY: the handles are opaque driver pointers; the executor never
    // launches one graph from two threads at once.
    unsafe impl Send for DeviceGraph {}

    impl DeviceGraph {
        pub fn record<F>(device: &Device, body: F) -> Result<Self>
        where
            F: FnOnce() -> Result<()>,
        {
            let stream = stream_of(device)?;
            device.synchronize()?;

            check(
                unsafe {
                    cuStreamBeginCapture_v2(stream, CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_GLOBAL)
                },
                "cuStreamBeginCapture",
            )?;
            let recorded = body();
            let mut graph: CUgraph = std::ptr::null_mut();
            let ended = unsafe { cuStreamEndCapture(stream, &mut graph) };
            recorded?;
            check(ended, "cuStreamEndCapture")?;
            if graph.is_null() {
                bail!("stream capture produced no graph");
            }

            let mut exec: CUgraphExec = std::ptr::null_mut();
            let instantiated = unsafe { cuGraphInstantiateWithFlags(&mut exec, graph, 0) };
            if instantiated != CUresult::CUDA_SUCCESS {
                unsafe {
                    cuGraphDestroy(graph);
                }
                bail!("cuGraphInstantiateWithFlags failed: {:?}", instantiated);
            }
            Ok(Self {
                graph,
                exec,
                stream,
                device: device.clone(),
            })
        }

        pub fn launch(&self) -> Result<()> {
            check(unsafe { cuGraphLaunch(self.exec, self.stream) }, "cuGraphLaunch")?;
            self.device.synchronize()?;
            Ok(())
        }
    }

    impl Drop for DeviceGraph {
        fn drop(&mut self) {
            unsafe {
                if !self.exec.is_null() {
                    cuGraphExecDestroy(self.exec);
                }
                if !self.graph.is_null() {
                    cuGraphDestroy(self.graph);
                }
            }
        }
    }
}
