//! Pass driver.
//!
//! ```text
//!   validate ─▶ verify ─▶ scan ─▶ plan ─▶ checkpoint
//!                                             │
//!                      ┌── per group ─────────▼──────────┐
//!                      │  refresh positions, fuse_group, │
//!                      │  stage output slots             │
//!                      └──────────────────┬──────────────┘
//!                                         ▼
//!                  rewrite output ─▶ dead-code sweep ─▶ verify
//! ```
//!
//! Everything before the checkpoint is read-only. Any failure after it
//! restores the checkpoint wholesale, so callers never observe a
//! half-rewritten graph.

use std::ops::Range;

use tracing::{debug, debug_span, info, trace};

use sheaf_graph::{Arg, Graph};

use crate::concat::Concatenation;
use crate::config::FusionOptions;
use crate::element::ElementState;
use crate::error::FuseError;
use crate::info::GraphInfo;
use crate::jit::JustInTime;
use crate::rewrite;
use crate::ring::RingBufferCopy;
use crate::strategy::FusionStrategy;

/// What one pass invocation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FusionReport {
    /// Collective sequences the scanner matched.
    pub elements: usize,
    /// Groups the strategy fused them into.
    pub groups: usize,
    /// Nodes removed by the final dead-code sweep.
    pub removed_nodes: usize,
}

/// Runs one fusion strategy over a captured graph, in place.
pub struct CommFusion {
    options: FusionOptions,
    strategy: Box<dyn FusionStrategy>,
}

impl CommFusion {
    /// Pairs a strategy with the options the scanner honors. The strategy
    /// is expected to have been built from the same options.
    pub fn new(options: FusionOptions, strategy: Box<dyn FusionStrategy>) -> Self {
        CommFusion { options, strategy }
    }

    /// Ring-buffer copy fusion (count grouping, pooled staging).
    pub fn ring(options: FusionOptions) -> Self {
        let strategy = RingBufferCopy::new(options.clone());
        Self::new(options, Box::new(strategy))
    }

    /// Concatenation fusion (count grouping, owned results).
    pub fn concat(options: FusionOptions) -> Self {
        let strategy = Concatenation::new(options.clone());
        Self::new(options, Box::new(strategy))
    }

    /// Just-in-time buffer fusion (byte-budget grouping, view results).
    pub fn jit(options: FusionOptions) -> Self {
        let strategy = JustInTime::new(options.clone());
        Self::new(options, Box::new(strategy))
    }

    /// Fuses the graph's collective reductions in place.
    ///
    /// On success the graph's output reads the fused results in the
    /// original slot order and dead nodes are swept. On any error the
    /// graph is exactly as it was handed in.
    pub fn run(&self, graph: &mut Graph) -> Result<FusionReport, FuseError> {
        let span = debug_span!("comm_fusion", strategy = self.strategy.name());
        let _guard = span.enter();

        self.strategy.validate()?;
        graph
            .verify()
            .map_err(|err| FuseError::malformed(format!("graph failed verification: {err}")))?;
        let mut info = GraphInfo::capture(graph, self.options.reduce)?;
        let plan = self.strategy.plan(&info.elements);
        debug!(
            elements = info.starting_elements,
            groups = plan.len(),
            nodes = info.starting_len,
            "scanned captured graph"
        );

        let checkpoint = graph.clone();
        match self.apply(graph, &mut info, &plan) {
            Ok(removed_nodes) => {
                info!(
                    elements = info.starting_elements,
                    groups = plan.len(),
                    removed_nodes,
                    "fused collective reductions"
                );
                Ok(FusionReport {
                    elements: info.starting_elements,
                    groups: plan.len(),
                    removed_nodes,
                })
            }
            Err(err) => {
                *graph = checkpoint;
                Err(err)
            }
        }
    }

    fn apply(
        &self,
        graph: &mut Graph,
        info: &mut GraphInfo,
        plan: &[Range<usize>],
    ) -> Result<usize, FuseError> {
        self.strategy.prepare(graph, info)?;
        let mut staged: Vec<Arg> = graph.output_args()?.to_vec();

        for (group_index, group) in plan.iter().enumerate() {
            info.refresh_grad_positions(graph);
            for element in &mut info.elements[group.clone()] {
                element.state = ElementState::InGraph;
            }
            let results = self
                .strategy
                .fuse_group(graph, info, group.clone())
                .map_err(|err| err.in_group(group_index))?;
            rewrite::stage_group(info, &mut staged, &info.elements[group.clone()], &results)
                .map_err(|err| err.in_group(group_index))?;
            for element in &mut info.elements[group.clone()] {
                element.state = ElementState::Fused;
            }
            debug!(group = group_index, members = group.len(), "staged fused group");
        }

        graph.rewrite_output(staged)?;
        let removed = graph.eliminate_dead_code();
        graph.verify()?;
        trace!("rewritten graph:\n{}", graph.dump());
        Ok(removed)
    }
}
