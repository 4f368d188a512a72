use derive_more::derive::Display;
use serde::Serialize;
use tracing::warn;

/// Non-fatal anomalies noticed during a run. They are handed back next to the results.
#[derive(Debug, Clone, PartialEq, Display, Serialize)]
pub enum Diagnostic {
    #[display("more than one partition was logged for job {job_id} that ran ({}), the first one is used", partitions.join(","))]
    MultiplePartitions { job_id: String, partitions: Vec<String> },
    #[display("`AllocTRES` is not available from this slurm version, GPU jobs are assumed to use 1 GPU")]
    MissingAllocTres,
    #[display("no carbon intensity for job {job_id} ({reason}), using the UK average instead")]
    CarbonIntensityFallback { job_id: String, reason: String },
}

/// Collects [`Diagnostic`]s and logs each one as it comes in.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        warn!("{diagnostic}");
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        diagnostics.into_iter().for_each(|d| self.push(d));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}
