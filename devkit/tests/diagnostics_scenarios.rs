use spark_agent::config::Role;
use spark_agent::diagnostics::{full_sections, quick_sections, DiagnosticCollector, SectionStatus, LOCAL_HOST};
use spark_agent::execution::SshTarget;
use spark_devkit::{FakeHost, TestHarness};
use std::time::Duration;

fn collector(harness: &TestHarness) -> DiagnosticCollector {
    DiagnosticCollector::new(harness.runner(), Duration::from_secs(5), Duration::from_secs(2))
}

fn status(report: &spark_agent::DiagnosticReport, host: &str, name: &str) -> SectionStatus {
    report
        .section(host, name)
        .unwrap_or_else(|| panic!("missing section {} on {}", name, host))
        .status
}

#[tokio::test]
async fn failing_gpu_probe_does_not_hide_other_sections() {
    let harness = TestHarness::new(FakeHost::new().fail_when("nvidia-smi")).await.unwrap();
    assert!(harness.up(Role::Coordinator).await.result.is_ok());

    let sections = full_sections(&harness.config);
    let report = collector(&harness).collect(&sections, &[]).await;

    assert_eq!(report.sections.len(), sections.len());
    assert_eq!(status(&report, LOCAL_HOST, "gpu"), SectionStatus::Fail);
    assert_eq!(status(&report, LOCAL_HOST, "container"), SectionStatus::Pass);
    assert_eq!(status(&report, LOCAL_HOST, "ray"), SectionStatus::Pass);
    assert_eq!(status(&report, LOCAL_HOST, "inference"), SectionStatus::Pass);
    assert_eq!(status(&report, LOCAL_HOST, "logs"), SectionStatus::Pass);
    assert!(report.issue_count() >= 1);
    assert!(report.render_text().contains("FAIL"));
}

#[tokio::test]
async fn nothing_running_reports_container_failure() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();
    harness.server.set_healthy(false);

    let report = collector(&harness).collect(&quick_sections(&harness.config), &[]).await;

    assert_eq!(status(&report, LOCAL_HOST, "tools"), SectionStatus::Pass);
    assert_eq!(status(&report, LOCAL_HOST, "container"), SectionStatus::Fail);
    assert_eq!(status(&report, LOCAL_HOST, "inference"), SectionStatus::Fail);
    assert_eq!(report.issue_count(), 2);
}

#[tokio::test]
async fn unreachable_remote_is_one_failed_entry() {
    let harness = TestHarness::new(FakeHost::new().unreachable("spark-b")).await.unwrap();
    assert!(harness.up(Role::Coordinator).await.result.is_ok());

    let remotes = vec![SshTarget::new("spark-a"), SshTarget::new("spark-b")];
    let report = collector(&harness)
        .collect(&quick_sections(&harness.config), &remotes)
        .await;

    let unreachable: Vec<_> = report.sections.iter().filter(|s| s.host == "spark-b").collect();
    assert_eq!(unreachable.len(), 1);
    assert_eq!(unreachable[0].name, "reachability");
    assert_eq!(unreachable[0].status, SectionStatus::Fail);
    assert!(unreachable[0].facts.contains(&("ssh".to_string(), "unreachable".to_string())));

    // The reachable remote ran everything except local-only sections
    assert_eq!(status(&report, "spark-a", "container"), SectionStatus::Pass);
    assert!(report.section("spark-a", "inference").is_none());
    assert_eq!(status(&report, LOCAL_HOST, "inference"), SectionStatus::Pass);
}

#[tokio::test]
async fn report_is_written_as_text_and_json() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let report = collector(&harness).collect(&quick_sections(&harness.config), &[]).await;
    let (text_path, json_path) = report.write_to(dir.path()).await.unwrap();

    let text = std::fs::read_to_string(&text_path).unwrap();
    assert!(text.contains("Spark cluster diagnostics"));

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(json["sections"].as_array().unwrap().len(), 4);
    assert_eq!(json["summary"]["fail"], report.summary.fail);
}

#[tokio::test]
async fn gpu_section_lists_each_device() {
    let harness = TestHarness::new(FakeHost::new().with_gpus(&["NVIDIA GB10", "NVIDIA GB10"]))
        .await
        .unwrap();

    let report = collector(&harness).collect(&quick_sections(&harness.config), &[]).await;
    let gpu = report.section(LOCAL_HOST, "gpu").unwrap();

    assert_eq!(gpu.status, SectionStatus::Pass);
    assert!(gpu.facts.contains(&("gpus".to_string(), "2".to_string())));
    assert!(gpu.facts.iter().any(|(k, v)| k == "gpu1" && v.contains("NVIDIA GB10")));
}

#[tokio::test]
async fn host_without_gpus_fails_gpu_section() {
    let harness = TestHarness::new(FakeHost::new().with_gpus(&[])).await.unwrap();

    let report = collector(&harness).collect(&quick_sections(&harness.config), &[]).await;
    assert_eq!(status(&report, LOCAL_HOST, "gpu"), SectionStatus::Fail);
}

#[tokio::test]
async fn network_section_grades_the_selected_interface() {
    let addressed = TestHarness::new(FakeHost::new().with_address("enp1s0f1np1", "192.168.100.10"))
        .await
        .unwrap();
    let report = collector(&addressed).collect(&full_sections(&addressed.config), &[]).await;
    let network = report.section(LOCAL_HOST, "network").unwrap();
    assert_eq!(network.status, SectionStatus::Pass);
    assert!(network.facts.contains(&("selected".to_string(), "enp1s0f1np1".to_string())));
    let row = &network.facts.iter().find(|(k, _)| k == "enp1s0f1np1").unwrap().1;
    assert!(row.contains("192.168.100.10"));
    assert!(row.contains("200000 Mb/s"));

    let bare = TestHarness::new(FakeHost::new()).await.unwrap();
    let report = collector(&bare).collect(&full_sections(&bare.config), &[]).await;
    assert_eq!(status(&report, LOCAL_HOST, "network"), SectionStatus::Warn);

    let no_tool = TestHarness::new(FakeHost::new().without_tool("ibdev2netdev")).await.unwrap();
    let report = collector(&no_tool).collect(&full_sections(&no_tool.config), &[]).await;
    assert_eq!(status(&report, LOCAL_HOST, "network"), SectionStatus::Unknown);
}
