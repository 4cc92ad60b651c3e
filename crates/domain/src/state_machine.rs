//! 状态机
//!
//! 任务、Worker、实验的合法状态转换图。纯函数，无副作用。

use crate::entities::{ExperimentStatus, TaskStatus, WorkerStatus};

impl TaskStatus {
    /// 从当前状态出发允许到达的状态
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Created => &[Queued, Canceled, Failed],
            Queued => &[Running, DataStaging, Failed, Canceled],
            DataStaging => &[Queued, EnvSetup, Running, Failed, Canceled],
            EnvSetup => &[Running, Queued, Failed, Canceled],
            Running => &[DataStaging, OutputStaging, Queued, Completed, Failed, Canceled],
            OutputStaging => &[Completed, Queued, Failed, Canceled],
            // 重试
            Failed => &[Queued],
            Completed | Canceled => &[],
        }
    }
}

impl WorkerStatus {
    pub fn allowed_transitions(&self) -> &'static [WorkerStatus] {
        use WorkerStatus::*;
        match self {
            Idle => &[Busy, Terminated],
            Busy => &[Idle, Terminated],
            Terminated => &[],
        }
    }
}

impl ExperimentStatus {
    pub fn allowed_transitions(&self) -> &'static [ExperimentStatus] {
        use ExperimentStatus::*;
        match self {
            Created => &[Executing, Canceled],
            Executing => &[Completed, Canceled],
            Completed | Canceled => &[],
        }
    }
}

pub fn is_valid_task_transition(from: TaskStatus, to: TaskStatus) -> bool {
    from.allowed_transitions().contains(&to)
}

pub fn is_valid_worker_transition(from: WorkerStatus, to: WorkerStatus) -> bool {
    from.allowed_transitions().contains(&to)
}

pub fn is_valid_experiment_transition(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    from.allowed_transitions().contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_task_lifecycle() {
        let path = [
            TaskStatus::Created,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::DataStaging,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                is_valid_task_transition(pair[0], pair[1]),
                "{} -> {} 应当合法",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_retry_edges() {
        assert!(is_valid_task_transition(TaskStatus::Failed, TaskStatus::Queued));
        assert!(is_valid_task_transition(TaskStatus::Running, TaskStatus::Queued));
        assert!(!is_valid_task_transition(TaskStatus::Failed, TaskStatus::Running));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in TaskStatus::ALL {
            assert!(!is_valid_task_transition(TaskStatus::Completed, *to));
            assert!(!is_valid_task_transition(TaskStatus::Canceled, *to));
        }
        for to in WorkerStatus::ALL {
            assert!(!is_valid_worker_transition(WorkerStatus::Terminated, *to));
        }
        for to in ExperimentStatus::ALL {
            assert!(!is_valid_experiment_transition(ExperimentStatus::Completed, *to));
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for s in TaskStatus::ALL {
            assert!(!is_valid_task_transition(*s, *s));
        }
        for s in WorkerStatus::ALL {
            assert!(!is_valid_worker_transition(*s, *s));
        }
        for s in ExperimentStatus::ALL {
            assert!(!is_valid_experiment_transition(*s, *s));
        }
    }

    #[test]
    fn test_worker_and_experiment_edges() {
        assert!(is_valid_worker_transition(WorkerStatus::Idle, WorkerStatus::Busy));
        assert!(is_valid_worker_transition(WorkerStatus::Busy, WorkerStatus::Idle));
        assert!(is_valid_experiment_transition(
            ExperimentStatus::Created,
            ExperimentStatus::Executing
        ));
        assert!(!is_valid_experiment_transition(
            ExperimentStatus::Created,
            ExperimentStatus::Completed
        ));
    }
}
