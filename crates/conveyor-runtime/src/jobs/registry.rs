use std::collections::HashMap;
use std::sync::Arc;

use conveyor_core::job::{ConveyorJob, Job, JobContext, JobMetadata};
use conveyor_core::transport::ProcessEvent;
use conveyor_core::{ConveyorError, Result};
use futures::future::BoxFuture;
use serde_json::Value;

/// Type alias for boxed job handler function.
pub type BoxedJobHandler =
    Arc<dyn Fn(JobContext, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Type alias for a job id factory working on raw arguments.
pub type BoxedIdGenerator = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// Entry in the job registry.
pub struct JobEntry {
    /// Job metadata.
    pub metadata: JobMetadata,
    /// Job handler function.
    pub handler: BoxedJobHandler,
    /// Stable id factory.
    pub id_generator: BoxedIdGenerator,
}

impl JobEntry {
    /// Run the handler.
    pub fn execute(&self, ctx: JobContext, args: Value) -> BoxFuture<'static, Result<()>> {
        (self.handler)(ctx, args)
    }

    /// Build the stable job id for the given arguments.
    pub fn generate_job_id(&self, args: &Value) -> Result<String> {
        (self.id_generator)(args)
    }
}

/// Registry of job types, keyed by logical name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobEntry>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Register a job type.
    pub fn register<J: ConveyorJob>(&mut self) {
        let metadata = J::metadata();
        let name = metadata.name.to_string();

        let handler: BoxedJobHandler =
            Arc::new(|ctx: JobContext, args: Value| -> BoxFuture<'static, Result<()>> {
                Box::pin(async move {
                    let parsed_args: J::Args = serde_json::from_value(args)
                        .map_err(|e| ConveyorError::InvalidArgument(e.to_string()))?;
                    J::execute(&ctx, parsed_args).await
                })
            });

        let id_generator: BoxedIdGenerator = Arc::new(|args: &Value| {
            let parsed_args: J::Args = serde_json::from_value(args.clone())
                .map_err(|e| ConveyorError::InvalidArgument(e.to_string()))?;
            Ok(J::generate_job_id(&parsed_args))
        });

        self.jobs.insert(
            name,
            Arc::new(JobEntry {
                metadata,
                handler,
                id_generator,
            }),
        );
    }

    /// Get a job entry by name.
    pub fn get(&self, name: &str) -> Result<Arc<JobEntry>> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| ConveyorError::NotFound(format!("job type '{}'", name)))
    }

    /// Get job metadata by name.
    pub fn metadata(&self, name: &str) -> Option<&JobMetadata> {
        self.jobs.get(name).map(|e| &e.metadata)
    }

    /// Rebuild the job instance described by a `job:process` event.
    pub fn instantiate(&self, event: &ProcessEvent) -> Result<Job> {
        self.get(&event.job)?;
        Ok(Job::builder(event.job.clone())
            .args(event.args.clone())
            .id(event.job_id.clone())
            .dispatch_id(event.dispatch_id)
            .queue(event.queue.clone())
            .build())
    }

    /// Check if a job exists.
    pub fn exists(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Get all job names.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(|s| s.as_str())
    }

    /// Get the number of registered jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
