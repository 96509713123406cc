//! Read handler: exercise list endpoints under load.
use tracing::warn;

use crate::error::Error;

use super::{pause, Executor, JobOutcome};

impl Executor {
    pub(crate) async fn run_read(&mut self) -> Result<JobOutcome, Error> {
        let mut outcome = JobOutcome::default();
        for _iteration in 0..self.job.job_iterations.max(1) {
            for object in &self.objects {
                match self.list_object_items(object).await {
                    Ok(_) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(
                            resource = object.ar.plural.as_str(),
                            "list failed: {err}"
                        );
                        outcome.failures += 1;
                    }
                }
            }
            pause(&self.cancel, self.job.job_iteration_delay).await?;
        }
        Ok(outcome)
    }
}
