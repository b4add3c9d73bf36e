//! Failure-isolated diagnostics collection
//!
//! Every section is an independent probe: an error or timeout in one section
//! is recorded as that section's failure and never stops the others. Remote
//! hosts are probed over ssh; a host that cannot be reached becomes a failed
//! "unreachable" entry in the report.

mod sections;

pub use sections::{full_sections, quick_sections};

use crate::execution::{CommandRunner, CommandSpec, RemoteRunner, SshTarget};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::future::join_all;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOCAL_HOST: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionStatus {
    Pass,
    /// Working, but degraded; not counted as an issue
    Warn,
    Fail,
    Unknown,
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionStatus::Pass => write!(f, "PASS"),
            SectionStatus::Warn => write!(f, "WARN"),
            SectionStatus::Fail => write!(f, "FAIL"),
            SectionStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// What a section probe observed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Findings {
    pub status: SectionStatus,
    pub facts: Vec<(String, String)>,
    pub text: String,
}

impl Findings {
    pub fn new(status: SectionStatus) -> Self {
        Self {
            status,
            facts: Vec::new(),
            text: String::new(),
        }
    }

    pub fn fact(mut self, key: &str, value: impl ToString) -> Self {
        self.facts.push((key.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

#[async_trait]
pub trait SectionProbe: Send + Sync {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings>;
}

#[derive(Clone)]
pub struct Section {
    pub name: &'static str,
    pub title: &'static str,
    /// Observes this machine directly rather than through the runner
    pub local_only: bool,
    pub probe: Arc<dyn SectionProbe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionResult {
    pub name: String,
    pub title: String,
    pub host: String,
    pub status: SectionStatus,
    pub facts: Vec<(String, String)>,
    pub text: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub run_id: Uuid,
    pub hostname: String,
    pub timestamp: DateTime<Local>,
    pub sections: Vec<SectionResult>,
    pub summary: Summary,
}

impl DiagnosticReport {
    fn new(sections: Vec<SectionResult>) -> Self {
        let mut summary = Summary::default();
        for section in &sections {
            match section.status {
                SectionStatus::Pass => summary.pass += 1,
                SectionStatus::Warn => summary.warn += 1,
                SectionStatus::Fail => summary.fail += 1,
                SectionStatus::Unknown => summary.unknown += 1,
            }
        }

        Self {
            run_id: Uuid::new_v4(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            timestamp: Local::now(),
            sections,
            summary,
        }
    }

    /// Failed sections, used as the process exit status
    pub fn issue_count(&self) -> usize {
        self.summary.fail
    }

    pub fn section(&self, host: &str, name: &str) -> Option<&SectionResult> {
        self.sections.iter().find(|s| s.host == host && s.name == name)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "==== Spark cluster diagnostics ====");
        let _ = writeln!(out, "run:  {}", self.run_id);
        let _ = writeln!(out, "host: {}", self.hostname);
        let _ = writeln!(out, "time: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S %z"));

        for section in &self.sections {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "--- [{}] {} ({}) ---",
                section.status, section.title, section.host
            );
            for (key, value) in &section.facts {
                let _ = writeln!(out, "{:<24} {}", format!("{}:", key), value);
            }
            if !section.text.trim().is_empty() {
                let _ = writeln!(out, "{}", section.text.trim_end());
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Summary: {} pass, {} warn, {} fail, {} unknown",
            self.summary.pass, self.summary.warn, self.summary.fail, self.summary.unknown
        );
        out
    }

    /// Write `diagnostics_<timestamp>.log` and `.json` into `dir`
    pub async fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let stem = format!("diagnostics_{}", self.timestamp.format("%Y%m%d_%H%M%S"));
        let text_path = dir.join(format!("{}.log", stem));
        let json_path = dir.join(format!("{}.json", stem));

        tokio::fs::write(&text_path, self.render_text())
            .await
            .with_context(|| format!("Failed to write {}", text_path.display()))?;
        tokio::fs::write(&json_path, serde_json::to_string_pretty(self)?)
            .await
            .with_context(|| format!("Failed to write {}", json_path.display()))?;

        Ok((text_path, json_path))
    }
}

pub struct DiagnosticCollector {
    runner: Arc<dyn CommandRunner>,
    section_timeout: Duration,
    remote_timeout: Duration,
}

impl DiagnosticCollector {
    pub fn new(runner: Arc<dyn CommandRunner>, section_timeout: Duration, remote_timeout: Duration) -> Self {
        Self {
            runner,
            section_timeout,
            remote_timeout,
        }
    }

    /// Run `sections` locally and on every remote target, all concurrently
    pub async fn collect(&self, sections: &[Section], remote: &[SshTarget]) -> DiagnosticReport {
        info!(
            "🔍 Collecting {} section(s) locally and on {} remote host(s)",
            sections.len(),
            remote.len()
        );

        let local = self.collect_host(LOCAL_HOST, self.runner.clone(), sections.iter().collect());
        let remotes = join_all(remote.iter().map(|target| self.collect_remote(target, sections)));
        let (mut results, remote_results) = futures::join!(local, remotes);

        results.extend(remote_results.into_iter().flatten());
        DiagnosticReport::new(results)
    }

    async fn collect_remote(&self, target: &SshTarget, sections: &[Section]) -> Vec<SectionResult> {
        let started = Instant::now();
        let runner: Arc<dyn CommandRunner> = Arc::new(RemoteRunner::new(self.runner.clone(), target.clone()));

        let ping = CommandSpec::new("true", Vec::<String>::new()).with_timeout(self.remote_timeout);
        let result = runner.run(&ping).await;
        if !result.success() {
            warn!("Remote host {} unreachable: {}", target.host, result.status_label());
            return vec![SectionResult {
                name: "reachability".to_string(),
                title: "SSH reachability".to_string(),
                host: target.host.clone(),
                status: SectionStatus::Fail,
                facts: vec![("ssh".to_string(), "unreachable".to_string())],
                text: result.tail(5),
                duration_ms: started.elapsed().as_millis(),
            }];
        }

        let remote_sections = sections.iter().filter(|s| !s.local_only).collect();
        self.collect_host(&target.host, runner, remote_sections).await
    }

    async fn collect_host(&self, host: &str, runner: Arc<dyn CommandRunner>, sections: Vec<&Section>) -> Vec<SectionResult> {
        join_all(
            sections
                .into_iter()
                .map(|section| self.run_section(host, runner.clone(), section)),
        )
        .await
    }

    async fn run_section(&self, host: &str, runner: Arc<dyn CommandRunner>, section: &Section) -> SectionResult {
        let started = Instant::now();
        debug!("Running section {} on {}", section.name, host);

        let findings = match tokio::time::timeout(self.section_timeout, section.probe.probe(runner)).await {
            Ok(Ok(findings)) => findings,
            Ok(Err(e)) => Findings::new(SectionStatus::Fail).fact("error", format!("{:#}", e)),
            Err(_) => Findings::new(SectionStatus::Fail).fact("error", format!("timed out after {:?}", self.section_timeout)),
        };

        SectionResult {
            name: section.name.to_string(),
            title: section.title.to_string(),
            host: host.to_string(),
            status: findings.status,
            facts: findings.facts,
            text: findings.text,
            duration_ms: started.elapsed().as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::ScriptedRunner;
    use anyhow::anyhow;

    struct Always(Option<SectionStatus>);

    #[async_trait]
    impl SectionProbe for Always {
        async fn probe(&self, _runner: Arc<dyn CommandRunner>) -> Result<Findings> {
            match self.0 {
                Some(status) => Ok(Findings::new(status).fact("probe", "ran")),
                None => Err(anyhow!("probe exploded")),
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl SectionProbe for Hangs {
        async fn probe(&self, _runner: Arc<dyn CommandRunner>) -> Result<Findings> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Findings::new(SectionStatus::Pass))
        }
    }

    fn section(name: &'static str, probe: impl SectionProbe + 'static) -> Section {
        Section {
            name,
            title: name,
            local_only: false,
            probe: Arc::new(probe),
        }
    }

    fn collector(runner: ScriptedRunner) -> DiagnosticCollector {
        DiagnosticCollector::new(Arc::new(runner), Duration::from_millis(200), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_failing_section_is_isolated() {
        let sections = vec![
            section("a", Always(Some(SectionStatus::Pass))),
            section("b", Always(None)),
            section("c", Hangs),
            section("d", Always(Some(SectionStatus::Unknown))),
        ];
        let report = collector(ScriptedRunner::new()).collect(&sections, &[]).await;

        assert_eq!(report.sections.len(), 4);
        let names: Vec<&str> = report.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);

        assert_eq!(report.section(LOCAL_HOST, "a").unwrap().status, SectionStatus::Pass);
        let failed = report.section(LOCAL_HOST, "b").unwrap();
        assert_eq!(failed.status, SectionStatus::Fail);
        assert!(failed.facts[0].1.contains("probe exploded"));
        assert_eq!(report.section(LOCAL_HOST, "c").unwrap().status, SectionStatus::Fail);
        assert_eq!(report.section(LOCAL_HOST, "d").unwrap().status, SectionStatus::Unknown);

        assert_eq!(report.summary, Summary { pass: 1, warn: 0, fail: 2, unknown: 1 });
        assert_eq!(report.issue_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_recorded() {
        let runner = ScriptedRunner::new().on("ssh", 255, "");
        let sections = vec![section("a", Always(Some(SectionStatus::Pass)))];
        let report = collector(runner)
            .collect(&sections, &[SshTarget::new("spark-b")])
            .await;

        assert_eq!(report.sections.len(), 2);
        let remote = report.section("spark-b", "reachability").unwrap();
        assert_eq!(remote.status, SectionStatus::Fail);
        assert_eq!(remote.facts, vec![("ssh".to_string(), "unreachable".to_string())]);
        assert_eq!(report.section(LOCAL_HOST, "a").unwrap().status, SectionStatus::Pass);
    }

    #[tokio::test]
    async fn test_remote_skips_local_only_sections() {
        let runner = ScriptedRunner::new().on("ssh", 0, "");
        let mut local_only = section("system", Always(Some(SectionStatus::Pass)));
        local_only.local_only = true;
        let sections = vec![local_only, section("gpu", Always(Some(SectionStatus::Pass)))];

        let report = collector(runner)
            .collect(&sections, &[SshTarget::new("spark-b")])
            .await;
        assert!(report.section("spark-b", "gpu").is_some());
        assert!(report.section("spark-b", "system").is_none());
        assert_eq!(report.sections.len(), 3);
    }

    #[tokio::test]
    async fn test_report_files() {
        let sections = vec![section("a", Always(Some(SectionStatus::Fail)))];
        let report = collector(ScriptedRunner::new()).collect(&sections, &[]).await;

        let dir = tempfile::tempdir().unwrap();
        let (text_path, json_path) = report.write_to(dir.path()).await.unwrap();

        let text = std::fs::read_to_string(text_path).unwrap();
        assert!(text.contains("--- [FAIL] a (local) ---"));
        assert!(text.contains("Summary: 0 pass, 0 warn, 1 fail, 0 unknown"));

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(json["sections"][0]["status"], "fail");
        assert_eq!(json["summary"]["fail"], 1);
    }
}
