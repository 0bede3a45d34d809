pub mod functions;
pub mod pipeline;

pub use pipeline::{CompiledScript, IndicatorPipeline, IndicatorSet, IndicatorTable};
