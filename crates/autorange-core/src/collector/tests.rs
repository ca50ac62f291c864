//! Tests against a mock cgroup v2 hierarchy
//!
//! A temporary directory stands in for `/sys/fs/cgroup` and `/proc`, so the
//! sampler and runtime can be exercised without a container runtime.

#[cfg(test)]
mod mock_cgroup_tests {
    use crate::collector::{CgroupV2Runtime, CgroupV2Sampler, UsageSampler, WorkloadRuntime};
    use crate::models::{LimitUpdate, Workload, WorkloadState};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::fs;

    const PROC_STAT: &str = r#"cpu  1000 0 500 8000 500 0 0 0 0 0
cpu0 250 0 125 2000 125 0 0 0 0 0
cpu1 250 0 125 2000 125 0 0 0 0 0
cpu2 250 0 125 2000 125 0 0 0 0 0
cpu3 250 0 125 2000 125 0 0 0 0 0
intr 123456
ctxt 654321
"#;

    fn workload(cgroup_path: &str) -> Workload {
        Workload {
            id: "f00d".to_string(),
            name: "worker-1".to_string(),
            service: Some("worker".to_string()),
            cgroup_path: cgroup_path.to_string(),
        }
    }

    /// Create a workload cgroup with usage files and a running process
    async fn create_mock_cgroup(root: &Path, cgroup_path: &str) -> PathBuf {
        let dir = root.join(cgroup_path.trim_start_matches('/'));
        fs::create_dir_all(&dir).await.unwrap();

        let cpu_stat = r#"usage_usec 5000000
user_usec 3000000
system_usec 2000000
nr_periods 100
nr_throttled 5
throttled_usec 50000
"#;
        fs::write(dir.join("cpu.stat"), cpu_stat).await.unwrap();
        fs::write(dir.join("memory.current"), "104857600\n")
            .await
            .unwrap();
        fs::write(dir.join("cgroup.procs"), "4242\n").await.unwrap();

        for control in ["memory.max", "memory.low", "memory.swap.max", "cpuset.cpus"] {
            fs::write(dir.join(control), "").await.unwrap();
        }

        dir
    }

    async fn create_mock_proc(root: &Path) -> PathBuf {
        let proc_path = root.join("proc");
        fs::create_dir_all(&proc_path).await.unwrap();
        fs::write(proc_path.join("stat"), PROC_STAT).await.unwrap();
        proc_path
    }

    #[tokio::test]
    async fn test_sampler_reads_usage() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root = temp_dir.path().join("cgroup");
        create_mock_cgroup(&cgroup_root, "/system.slice/worker-1.scope").await;
        let proc_path = create_mock_proc(temp_dir.path()).await;

        let sampler = CgroupV2Sampler::with_proc_path(&cgroup_root, proc_path);
        let sample = sampler
            .sample(&workload("/system.slice/worker-1.scope"))
            .await
            .unwrap();

        assert_eq!(sample.workload_id, "f00d");
        assert_eq!(sample.memory_usage_bytes, 104_857_600);
        // usage_usec in nanoseconds
        assert_eq!(sample.cpu_total_usage, 5_000_000_000);
        // 10000 ticks of 10ms
        assert_eq!(sample.system_cpu_usage, 100_000_000_000);
        assert_eq!(sample.online_cpus, 4);
    }

    #[tokio::test]
    async fn test_sampler_missing_cgroup() {
        let temp_dir = TempDir::new().unwrap();
        let proc_path = create_mock_proc(temp_dir.path()).await;
        let sampler = CgroupV2Sampler::with_proc_path(temp_dir.path(), proc_path);

        let result = sampler.sample(&workload("/gone.scope")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sampler_fails_without_memory_current() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/no-mem").await;
        fs::remove_file(dir.join("memory.current")).await.unwrap();
        let proc_path = create_mock_proc(temp_dir.path()).await;
        let sampler = CgroupV2Sampler::with_proc_path(temp_dir.path(), proc_path);

        let err = sampler.sample(&workload("/no-mem")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("memory.current"));
    }

    #[tokio::test]
    async fn test_sampler_fails_without_cpu_usage() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/no-cpu").await;
        let proc_path = create_mock_proc(temp_dir.path()).await;
        let sampler = CgroupV2Sampler::with_proc_path(temp_dir.path(), proc_path);

        fs::write(dir.join("cpu.stat"), "nr_periods 0\n").await.unwrap();
        let err = sampler.sample(&workload("/no-cpu")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("usage_usec"));

        fs::remove_file(dir.join("cpu.stat")).await.unwrap();
        assert!(sampler.sample(&workload("/no-cpu")).await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_state() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/running").await;
        let runtime = CgroupV2Runtime::new(temp_dir.path());

        assert_eq!(
            runtime.state(&workload("/running")).await.unwrap(),
            WorkloadState::Running
        );

        fs::write(dir.join("cgroup.procs"), "").await.unwrap();
        assert_eq!(
            runtime.state(&workload("/running")).await.unwrap(),
            WorkloadState::Stopped
        );

        assert_eq!(
            runtime.state(&workload("/removed")).await.unwrap(),
            WorkloadState::Dead
        );
    }

    #[tokio::test]
    async fn test_runtime_writes_limits() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/limited").await;
        fs::write(dir.join("cpu.rt_runtime_us"), "0").await.unwrap();
        let runtime = CgroupV2Runtime::new(temp_dir.path());

        let update = LimitUpdate {
            memory_limit_bytes: Some(268_435_456),
            memory_reservation_bytes: Some(134_217_728),
            memory_swap_bytes: Some(-1),
            cpuset_cpus: Some("0,1".to_string()),
            cpu_realtime_runtime_us: Some(950),
        };
        runtime
            .update_resources(&workload("/limited"), &update)
            .await
            .unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap();
        assert_eq!(read("memory.max"), "268435456");
        assert_eq!(read("memory.low"), "134217728");
        assert_eq!(read("memory.swap.max"), "max");
        assert_eq!(read("cpuset.cpus"), "0,1");
        assert_eq!(read("cpu.rt_runtime_us"), "950");
    }

    #[tokio::test]
    async fn test_runtime_skips_unsupported_rt_budget() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/no-rt").await;
        let runtime = CgroupV2Runtime::new(temp_dir.path());

        let update = LimitUpdate {
            cpuset_cpus: Some("0".to_string()),
            cpu_realtime_runtime_us: Some(100),
            ..Default::default()
        };
        runtime
            .update_resources(&workload("/no-rt"), &update)
            .await
            .unwrap();

        assert!(!dir.join("cpu.rt_runtime_us").exists());
        assert_eq!(std::fs::read_to_string(dir.join("cpuset.cpus")).unwrap(), "0");
        // Unset fields leave their files alone
        assert_eq!(std::fs::read_to_string(dir.join("memory.max")).unwrap(), "");
    }

    #[tokio::test]
    async fn test_runtime_update_missing_cgroup() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = CgroupV2Runtime::new(temp_dir.path());

        let result = runtime
            .update_resources(&workload("/gone"), &LimitUpdate::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runtime_update_leaves_limits_when_a_control_is_unwritable() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/partial").await;
        fs::write(dir.join("memory.max"), "max\n").await.unwrap();
        fs::remove_file(dir.join("cpuset.cpus")).await.unwrap();
        fs::create_dir(dir.join("cpuset.cpus")).await.unwrap();
        let runtime = CgroupV2Runtime::new(temp_dir.path());

        let update = LimitUpdate {
            memory_limit_bytes: Some(67_108_864),
            memory_reservation_bytes: Some(33_554_432),
            memory_swap_bytes: Some(-1),
            cpuset_cpus: Some("0".to_string()),
            cpu_realtime_runtime_us: None,
        };
        let result = runtime.update_resources(&workload("/partial"), &update).await;

        assert!(result.is_err());
        let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap();
        assert_eq!(read("memory.max"), "max\n");
        assert_eq!(read("memory.low"), "");
        assert_eq!(read("memory.swap.max"), "");
    }

    #[tokio::test]
    async fn test_restore_writes_previous_values_back() {
        let temp_dir = TempDir::new().unwrap();
        let dir = create_mock_cgroup(temp_dir.path(), "/restored").await;
        fs::write(dir.join("memory.max"), "67108864").await.unwrap();
        fs::write(dir.join("memory.low"), "33554432").await.unwrap();

        let previous = vec![
            ("memory.max", "max\n".to_string()),
            ("memory.low", "0\n".to_string()),
        ];
        CgroupV2Runtime::restore(&dir, &workload("/restored"), &previous).await;

        let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap();
        assert_eq!(read("memory.max"), "max");
        assert_eq!(read("memory.low"), "0");
    }
}
