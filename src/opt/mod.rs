// This module runs the fixed optimization pipeline over one freshly lifted function. The
// pipeline is selected once from `opt_pass_pipeline`; level 0 leaves the function alone, level 1
// folds constants and removes dead code, level 2 and above first inlines always-inline helpers
// and forwards CPU state accesses inside blocks, then drops flag stores that die at
// flag-clobbering exits. The function is detached from the module while the passes rewrite it,
// which lets the inliner read helper bodies from the module at the same time, and is reattached
// under the same FuncId before returning.

//! IR optimizer.

mod passes;

use crate::ir::{FuncId, Module, ModuleError};
use crate::protocol::ServerConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    InlineHelpers,
    ForwardState,
    DeadFlagStores,
    ConstFold,
    DeadCode,
}

impl Pass {
    pub const fn name(self) -> &'static str {
        match self {
            Pass::InlineHelpers => "inline-helpers",
            Pass::ForwardState => "forward-state",
            Pass::DeadFlagStores => "dead-flag-stores",
            Pass::ConstFold => "const-fold",
            Pass::DeadCode => "dce",
        }
    }
}

/// Wall time spent in one pass during one `optimize` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassTiming {
    pub pass: Pass,
    pub duration: Duration,
}

pub struct Optimizer {
    pipeline: Vec<Pass>,
    time_passes: bool,
}

impl Optimizer {
    pub fn new(config: &ServerConfig) -> Self {
        let pipeline = match config.opt_pass_pipeline {
            level if level <= 0 => Vec::new(),
            1 => vec![Pass::ConstFold, Pass::DeadCode],
            _ => vec![
                Pass::InlineHelpers,
                Pass::ForwardState,
                Pass::DeadFlagStores,
                Pass::ConstFold,
                Pass::DeadCode,
            ],
        };
        Self {
            pipeline,
            time_passes: config.debug_time_passes,
        }
    }

    pub fn pipeline(&self) -> &[Pass] {
        &self.pipeline
    }

    /// Optimize the function `id` in place.
    ///
    /// Returns per-pass timings when pass timing is enabled, otherwise an empty list.
    pub fn optimize(&self, module: &mut Module, id: FuncId) -> Result<Vec<PassTiming>, ModuleError> {
        let mut timings = Vec::new();
        if self.pipeline.is_empty() {
            return Ok(timings);
        }

        let mut function = module.detach(id)?;
        if let Some(body) = function.body.as_mut() {
            for &pass in &self.pipeline {
                let start = Instant::now();
                let changed = match pass {
                    Pass::InlineHelpers => passes::inline_helpers(body, module),
                    Pass::ForwardState => passes::forward_state(body),
                    Pass::DeadFlagStores => passes::dead_flag_stores(body),
                    Pass::ConstFold => passes::const_fold(body),
                    Pass::DeadCode => passes::dead_code(body),
                };
                log::trace!("{} on {}: changed={changed}", pass.name(), function.name);
                if self.time_passes {
                    timings.push(PassTiming {
                        pass,
                        duration: start.elapsed(),
                    });
                }
            }
        }
        module.reattach(id, function)?;
        Ok(timings)
    }
}
