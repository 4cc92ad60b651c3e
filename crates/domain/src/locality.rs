//! 数据本地性推断
//!
//! 通过文件路径推断存储类别，再以名称包含关系判断存储与计算资源是否同址。

use crate::entities::{ComputeResource, FileMetadata, Task};

pub const S3_STORAGE: &str = "s3-storage";
pub const NFS_STORAGE: &str = "nfs-storage";
pub const LOCAL_STORAGE: &str = "local-storage";

/// 根据路径推断文件所在的存储类别
pub fn infer_storage_class(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.contains("s3") || lower.contains("minio") {
        S3_STORAGE
    } else if lower.contains("nfs") {
        NFS_STORAGE
    } else {
        LOCAL_STORAGE
    }
}

/// 存储类别与计算资源互相包含（ID或名称）即视为同址
pub fn is_colocated(storage: &str, resource: &ComputeResource) -> bool {
    let storage = storage.to_lowercase();
    [resource.id.to_lowercase(), resource.name.to_lowercase()]
        .iter()
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| storage.contains(candidate.as_str()) || candidate.contains(&storage))
}

pub fn is_file_colocated(file: &FileMetadata, resource: &ComputeResource) -> bool {
    is_colocated(infer_storage_class(&file.path), resource)
}

/// 任务输入文件中与资源同址的比例；没有输入文件时返回 None
pub fn input_locality_fraction(task: &Task, resource: &ComputeResource) -> Option<f64> {
    if task.input_files.is_empty() {
        return None;
    }
    let colocated = task
        .input_files
        .iter()
        .filter(|f| is_file_colocated(f, resource))
        .count();
    Some(colocated as f64 / task.input_files.len() as f64)
}

/// 任务的全部输入都在该资源上（无输入视为同址）
pub fn task_fully_colocated(task: &Task, resource: &ComputeResource) -> bool {
    task.input_files
        .iter()
        .all(|f| is_file_colocated(f, resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ComputeResourceType;

    #[test]
    fn test_infer_storage_class() {
        assert_eq!(infer_storage_class("s3://bucket/data.h5"), S3_STORAGE);
        assert_eq!(infer_storage_class("/mnt/MinIO/x"), S3_STORAGE);
        assert_eq!(infer_storage_class("/nfs/home/data"), NFS_STORAGE);
        assert_eq!(infer_storage_class("/tmp/data.csv"), LOCAL_STORAGE);
    }

    #[test]
    fn test_colocation_by_name_containment() {
        let nfs = ComputeResource::new("nfs", "nfs cluster", ComputeResourceType::Slurm, 4);
        let k8s = ComputeResource::new("k8s-1", "kube", ComputeResourceType::Kubernetes, 4);
        assert!(is_colocated(NFS_STORAGE, &nfs));
        assert!(!is_colocated(NFS_STORAGE, &k8s));

        let s3 = ComputeResource::new("r-9", "s3-storage-gateway", ComputeResourceType::BareMetal, 1);
        assert!(is_colocated(S3_STORAGE, &s3));
    }

    #[test]
    fn test_input_locality_fraction() {
        let nfs = ComputeResource::new("nfs", "nfs", ComputeResourceType::Slurm, 4);
        let mut task = Task::new("exp", "run");
        assert_eq!(input_locality_fraction(&task, &nfs), None);
        assert!(task_fully_colocated(&task, &nfs));

        task.input_files = vec![
            FileMetadata::new("/nfs/a", 10, "x"),
            FileMetadata::new("/tmp/b", 10, "y"),
        ];
        assert_eq!(input_locality_fraction(&task, &nfs), Some(0.5));
        assert!(!task_fully_colocated(&task, &nfs));
    }
}
