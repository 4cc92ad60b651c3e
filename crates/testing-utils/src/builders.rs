//! Test data builders
//!
//! 以合理默认值构造实体，按需覆盖字段。

use chrono::{DateTime, Utc};
use scheduler_domain::{
    ComputeResource, ComputeResourceStatus, ComputeResourceType, Experiment, ExperimentStatus,
    FileMetadata, ParameterSet, Task, TaskStatus, Worker, WorkerStatus,
};

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(experiment_id: &str) -> Self {
        Self {
            task: Task::new(experiment_id, "echo test"),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.task.command = command.to_string();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn queued(self) -> Self {
        self.with_status(TaskStatus::Queued)
    }

    pub fn on_resource(mut self, compute_resource_id: &str) -> Self {
        self.task.compute_resource_id = Some(compute_resource_id.to_string());
        self
    }

    pub fn assigned_to(mut self, worker_id: &str) -> Self {
        self.task.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn with_input(mut self, path: &str, size: i64) -> Self {
        self.task
            .input_files
            .push(FileMetadata::new(path, size, ""));
        self
    }

    pub fn with_input_file(mut self, file: FileMetadata) -> Self {
        self.task.input_files.push(file);
        self
    }

    pub fn with_priority(mut self, priority: &str) -> Self {
        self.task
            .metadata
            .insert("priority".to_string(), serde_json::json!(priority));
        self
    }

    pub fn with_retries(mut self, retry_count: i32, max_retries: i32) -> Self {
        self.task.retry_count = retry_count;
        self.task.max_retries = max_retries;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(id: &str, compute_resource_id: &str, experiment_id: &str) -> Self {
        Self {
            worker: Worker::new(id, compute_resource_id, experiment_id),
        }
    }

    pub fn busy_with(mut self, task_id: &str) -> Self {
        self.worker.status = WorkerStatus::Busy;
        self.worker.current_task_id = Some(task_id.to_string());
        self
    }

    pub fn terminated(mut self) -> Self {
        self.worker.status = WorkerStatus::Terminated;
        self.worker.terminated_at = Some(Utc::now());
        self
    }

    pub fn with_last_heartbeat(mut self, last_heartbeat: DateTime<Utc>) -> Self {
        self.worker.last_heartbeat = last_heartbeat;
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

pub struct ExperimentBuilder {
    experiment: Experiment,
}

impl ExperimentBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            experiment: Experiment::new(name, "run --seed {seed}", "tester"),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.experiment.id = id.to_string();
        self
    }

    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.experiment.status = status;
        self
    }

    pub fn with_command_template(mut self, template: &str) -> Self {
        self.experiment.command_template = template.to_string();
        self
    }

    /// 生成 `count` 组 `seed` 参数
    pub fn with_seeds(mut self, count: usize) -> Self {
        self.experiment.parameters = (0..count)
            .map(|i| ParameterSet::new([("seed", i.to_string())]))
            .collect();
        self
    }

    pub fn with_preferred_resource(mut self, resource_id: &str) -> Self {
        self.experiment.metadata.insert(
            "preferred_resource_id".to_string(),
            serde_json::json!(resource_id),
        );
        self
    }

    pub fn build(self) -> Experiment {
        self.experiment
    }
}

pub struct ComputeResourceBuilder {
    resource: ComputeResource,
}

impl ComputeResourceBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            resource: ComputeResource::new(id, id, ComputeResourceType::Slurm, 4),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.resource.name = name.to_string();
        self
    }

    pub fn with_type(mut self, resource_type: ComputeResourceType) -> Self {
        self.resource.resource_type = resource_type;
        self
    }

    pub fn with_max_workers(mut self, max_workers: i32) -> Self {
        self.resource.max_workers = max_workers;
        self
    }

    pub fn with_cost_per_hour(mut self, cost: f64) -> Self {
        self.resource.cost_per_hour = cost;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.resource.status = ComputeResourceStatus::Inactive;
        self
    }

    pub fn build(self) -> ComputeResource {
        self.resource
    }
}
