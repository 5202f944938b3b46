// Local runner: executes each stage's units in parallel, one stage at a time.
//
// An external scheduler can call `run_unit` directly instead; the barrier checks
// live in the stage functions themselves, so both paths enforce the same order.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::time::Instant;
use tracing::{error, info};

use crate::buckets::run_bucket_stage;
use crate::cluster::run_cluster_stage;
use crate::config::DedupConfig;
use crate::documents::DocumentSource;
use crate::errors::{DedupError, Result, Stage};
use crate::filter::run_filter_stage;
use crate::minhash::threshold_estimate;
use crate::signature::run_signature_stage;
use crate::storage::WorkDir;

pub fn build_pbar(num_items: usize, units: &str) -> ProgressBar {
    let template = format!(
        "{} {{human_pos}}/{{human_len}} [{{elapsed_precise}}/{{duration_precise}}] [{{wide_bar:.cyan/blue}}]",
        units
    );
    let pbar = ProgressBar::new(num_items as u64);
    pbar.set_style(ProgressStyle::with_template(&template).unwrap_or_else(|_| ProgressStyle::default_bar()));
    pbar
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub ran: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: Stage,
    pub complete: u32,
    pub total: u32,
}

pub struct Pipeline<'a> {
    config: &'a DedupConfig,
    source: &'a dyn DocumentSource,
    work: WorkDir,
    num_shards: u32,
    resume: bool,
}

impl<'a> Pipeline<'a> {
    /// Validates the config and binds it to the work dir. Fails before any stage runs
    /// if the work dir belongs to a run with a different config, or if the output
    /// directories overlap.
    pub fn new(config: &'a DedupConfig, source: &'a dyn DocumentSource) -> Result<Self> {
        config.validate()?;
        config.check_output_dirs()?;
        let work = WorkDir::new(&config.work_dir);
        let num_shards = source.num_shards();
        work.open_run(config, num_shards)?;
        info!(
            shards = num_shards,
            partitions = config.partition_count,
            bands = config.num_bands,
            rows_per_band = config.rows_per_band,
            threshold = threshold_estimate(config.rows_per_band, config.num_bands),
            "pipeline ready"
        );
        Ok(Self {
            config,
            source,
            work,
            num_shards,
            resume: true,
        })
    }

    /// With resume off every unit is re-run, overwriting earlier outputs.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work
    }

    pub fn num_units(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Signature | Stage::Filter => self.num_shards,
            Stage::Bucket => self.config.partition_count as u32,
            Stage::Cluster => 1,
        }
    }

    pub fn run_unit(&self, stage: Stage, unit: u32) -> Result<()> {
        let total = self.num_units(stage);
        if unit >= total {
            return Err(DedupError::Config(format!(
                "{} unit {} out of range ({} units)",
                stage, unit, total
            )));
        }
        match stage {
            Stage::Signature => run_signature_stage(self.config, &self.work, self.source, unit).map(|_| ()),
            Stage::Bucket => run_bucket_stage(self.config, &self.work, self.num_shards, unit).map(|_| ()),
            Stage::Cluster => run_cluster_stage(self.config, &self.work, self.num_shards).map(|_| ()),
            Stage::Filter => run_filter_stage(self.config, &self.work, self.source, unit).map(|_| ()),
        }
    }

    /// Runs every pending unit of `stage`. All units are attempted; failures are
    /// reported together, and the stage only counts as done once every marker exists.
    pub fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let start = Instant::now();
        let total = self.num_units(stage);
        let pending: Vec<u32> = if self.resume {
            self.work.missing_units(stage, total)
        } else {
            (0..total).collect()
        };
        let skipped = total - pending.len() as u32;
        if skipped > 0 {
            info!(stage = %stage, skipped, "resuming, skipping completed units");
        }

        let pbar = build_pbar(pending.len(), stage.name());
        let mut failures: Vec<(u32, String)> = pending
            .par_iter()
            .filter_map(|&unit| {
                let outcome = self.run_unit(stage, unit);
                pbar.inc(1);
                match outcome {
                    Ok(()) => None,
                    Err(e) => {
                        error!(stage = %stage, unit, retryable = e.is_retryable(), error = %e, "unit failed");
                        Some((unit, e.to_string()))
                    }
                }
            })
            .collect();
        pbar.finish_and_clear();

        if !failures.is_empty() {
            failures.sort();
            return Err(DedupError::StageFailed { stage, failures });
        }
        self.work.require_complete(stage, total)?;

        info!(
            stage = %stage,
            ran = pending.len(),
            skipped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "stage complete"
        );
        Ok(StageReport {
            stage,
            ran: pending.len() as u32,
            skipped,
        })
    }

    /// SIGNATURE -> BUCKET -> CLUSTER -> FILTER, stopping at the first failed stage.
    pub fn run(&self) -> Result<Vec<StageReport>> {
        Stage::ALL.iter().map(|&stage| self.run_stage(stage)).collect()
    }

    pub fn status(&self) -> Vec<StageStatus> {
        Stage::ALL
            .iter()
            .map(|&stage| {
                let total = self.num_units(stage);
                StageStatus {
                    stage,
                    complete: total - self.work.missing_units(stage, total).len() as u32,
                    total,
                }
            })
            .collect()
    }
}
