//! Multi-agent AI analysis pipeline.
//!
//! Reads collector artifacts from an analysis report directory, dispatches
//! each tool's data to a specialized agent, collects their structured JSON
//! responses, then feeds everything to the threat-summarizer agent for a
//! final risk score and executive summary. Results land under
//! `report_dir/ai_analysis/`.

pub mod loaders;
pub mod normalize;

use crate::ai::agents::{summarizer_agent, tool_agents, AgentProfile};
use crate::ai::provider::{ChatMessage, ChatProvider};
use chrono::Utc;
use normalize::{
    clean_json_response, coerce_score, infer_verdict_from_text, normalize_findings,
    normalize_iocs, normalize_mitre, normalize_recommendations, normalize_tool_findings,
    normalize_tool_iocs,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;

/// Result from a single tool-specific agent.
#[derive(Debug, Clone, Serialize)]
pub struct ToolAnalysisResult {
    pub tool: String,
    pub agent_name: String,
    pub verdict: String,
    pub confidence: i64,
    pub findings_count: usize,
    pub iocs_count: usize,
    pub summary: String,
    pub findings: Vec<Value>,
    pub iocs: Vec<Value>,
    pub raw_response: String,
    pub error: Option<String>,
}

impl ToolAnalysisResult {
    fn new(tool: &str, agent_name: &str) -> Self {
        ToolAnalysisResult {
            tool: tool.to_string(),
            agent_name: agent_name.to_string(),
            verdict: "inconclusive".to_string(),
            confidence: 0,
            findings_count: 0,
            iocs_count: 0,
            summary: String::new(),
            findings: Vec::new(),
            iocs: Vec::new(),
            raw_response: String::new(),
            error: None,
        }
    }
}

/// Final AI-driven threat analysis for one report.
#[derive(Debug, Clone)]
pub struct ThreatAnalysisReport {
    pub analysis_id: String,
    pub model: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub status: String, // pending | running | complete | failed
    pub error: Option<String>,
    pub tool_results: Vec<ToolAnalysisResult>,
    pub risk_score: i64,
    pub threat_level: String,
    pub malware_type: String,
    pub malware_family: String,
    pub platform: String,
    pub classification_confidence: i64,
    pub executive_summary: String,
    pub detailed_analysis: String,
    pub key_findings: Vec<Value>,
    pub iocs: Vec<Value>,
    pub mitre_attack: Vec<Value>,
    pub recommendations: Vec<Value>,
    pub raw_summary: String,
}

impl ThreatAnalysisReport {
    fn new(analysis_id: &str, model: &str) -> Self {
        ThreatAnalysisReport {
            analysis_id: analysis_id.to_string(),
            model: model.to_string(),
            started_at: Some(utc_now_iso()),
            completed_at: None,
            status: "pending".to_string(),
            error: None,
            tool_results: Vec::new(),
            risk_score: 0,
            threat_level: "none".to_string(),
            malware_type: "unknown".to_string(),
            malware_family: "unknown".to_string(),
            platform: "unknown".to_string(),
            classification_confidence: 0,
            executive_summary: String::new(),
            detailed_analysis: String::new(),
            key_findings: Vec::new(),
            iocs: Vec::new(),
            mitre_attack: Vec::new(),
            recommendations: Vec::new(),
            raw_summary: String::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "analysis_id": self.analysis_id,
            "model": self.model,
            "started_at": self.started_at,
            "completed_at": self.completed_at,
            "status": self.status,
            "error": self.error,
            "risk_score": self.risk_score,
            "threat_level": self.threat_level,
            "classification": {
                "malware_type": self.malware_type,
                "malware_family": self.malware_family,
                "platform": self.platform,
                "confidence": self.classification_confidence,
            },
            "executive_summary": self.executive_summary,
            "detailed_analysis": self.detailed_analysis,
            "key_findings": self.key_findings,
            "iocs": self.iocs,
            "mitre_attack": self.mitre_attack,
            "recommendations": self.recommendations,
            "tool_results": self.tool_results,
            "raw_summary": self.raw_summary,
        })
    }
}

fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn no_data_fallback(tool: &str) -> String {
    json!({
        "tool": tool,
        "verdict": "inconclusive",
        "confidence": 0,
        "findings": [],
        "iocs": [],
        "summary": format!("No data collected by {} collector.", tool),
    })
    .to_string()
}

fn error_fallback(tool: &str, error: &str) -> String {
    json!({
        "tool": tool,
        "verdict": "inconclusive",
        "confidence": 0,
        "findings": [],
        "iocs": [],
        "summary": format!("Agent error: {}", error),
    })
    .to_string()
}

/// Parse a tool agent's JSON response into the result record. On decode
/// failure the prose is kept as the summary and a keyword heuristic
/// supplies the verdict.
pub fn parse_tool_json(raw: &str, result: &mut ToolAnalysisResult) {
    match serde_json::from_str::<Value>(raw) {
        Ok(data) => {
            result.verdict = data
                .get("verdict")
                .and_then(Value::as_str)
                .unwrap_or("inconclusive")
                .trim()
                .to_lowercase();
            result.confidence = coerce_score(data.get("confidence"));
            result.summary = data
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            result.findings = normalize_tool_findings(data.get("findings").unwrap_or(&Value::Null));
            result.findings_count = result.findings.len();
            result.iocs = normalize_tool_iocs(data.get("iocs").unwrap_or(&Value::Null));
            result.iocs_count = result.iocs.len();
        }
        Err(e) => {
            log::warn!("Failed to parse tool JSON for {}: {}", result.tool, e);
            if !raw.trim().is_empty() {
                result.summary = truncate_chars(raw.trim(), 2000);
                result.verdict = infer_verdict_from_text(raw).to_string();
                result.confidence = 40; // lower confidence for non-JSON
            }
            result.error = Some(format!("JSON parse error: {}", e));
        }
    }
}

/// Parse the summarizer's JSON into the report. On decode failure the
/// prose becomes the executive summary and the risk score is derived from
/// the tool verdicts.
pub fn parse_summary_json(raw: &str, report: &mut ThreatAnalysisReport) {
    match serde_json::from_str::<Value>(raw) {
        Ok(data) => {
            report.risk_score = coerce_score(data.get("risk_score"));
            report.threat_level = data
                .get("threat_level")
                .and_then(Value::as_str)
                .unwrap_or("none")
                .trim()
                .to_lowercase();

            match data.get("classification") {
                Some(Value::Object(classification)) => {
                    let get = |key: &str| {
                        classification
                            .get(key)
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .trim()
                            .to_string()
                    };
                    report.malware_type = get("malware_type");
                    report.malware_family = get("malware_family");
                    report.platform = get("platform");
                    report.classification_confidence = coerce_score(classification.get("confidence"));
                }
                Some(Value::String(flat)) => {
                    // Model returned a flat string classification.
                    report.malware_type = flat.trim().to_string();
                    report.classification_confidence = 50;
                }
                _ => {}
            }

            report.executive_summary = data
                .get("executive_summary")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            report.detailed_analysis = data
                .get("detailed_analysis")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();

            report.key_findings = normalize_findings(data.get("key_findings").unwrap_or(&Value::Null));
            report.iocs = normalize_iocs(data.get("iocs").unwrap_or(&Value::Null));
            report.mitre_attack = normalize_mitre(data.get("mitre_attack").unwrap_or(&Value::Null));
            report.recommendations =
                normalize_recommendations(data.get("recommendations").unwrap_or(&Value::Null));
        }
        Err(e) => {
            log::warn!("Failed to parse summary JSON: {}", e);
            if !raw.trim().is_empty() {
                report.executive_summary = truncate_chars(raw.trim(), 3000);
                report.detailed_analysis = raw.trim().to_string();
                apply_fallback_risk(report);
                report.error = None; // usable despite the JSON failure
            } else {
                report.error = Some(format!("Summary JSON parse error: {}", e));
            }
        }
    }
}

fn apply_fallback_risk(report: &mut ThreatAnalysisReport) {
    let mal_count = report
        .tool_results
        .iter()
        .filter(|t| t.verdict == "malicious")
        .count() as i64;
    let sus_count = report
        .tool_results
        .iter()
        .filter(|t| t.verdict == "suspicious")
        .count() as i64;

    if mal_count > 0 {
        report.risk_score = (50 + mal_count * 15).min(85);
        report.threat_level = if report.risk_score >= 70 { "high" } else { "medium" }.to_string();
    } else if sus_count > 0 {
        report.risk_score = (30 + sus_count * 15).min(65);
        report.threat_level = "medium".to_string();
    } else {
        report.risk_score = 20;
        report.threat_level = "low".to_string();
    }
}

/// Orchestrates the fan-out/fan-in analysis pipeline.
///
/// The chat transport is injected by constructor; tests supply a stub that
/// returns canned JSON.
pub struct ThreatAnalyzer {
    reports_dir: PathBuf,
    provider: Arc<dyn ChatProvider>,
    call_timeout: Duration,
}

impl ThreatAnalyzer {
    pub fn new(reports_dir: PathBuf, provider: Arc<dyn ChatProvider>) -> Self {
        ThreatAnalyzer {
            reports_dir,
            provider,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    async fn ask_agent(
        &self,
        profile: &AgentProfile,
        prompt: String,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let history = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt,
        }];
        match tokio::time::timeout(
            self.call_timeout,
            self.provider.ask(history, profile.prompt.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "Agent {} timed out after {}s",
                profile.name,
                self.call_timeout.as_secs()
            )
            .into()),
        }
    }

    async fn run_tool_agent(
        &self,
        profile: AgentProfile,
        tool: String,
        payload: String,
        sample_name: String,
    ) -> ToolAnalysisResult {
        let mut result = ToolAnalysisResult::new(&tool, profile.name);
        let prompt = format!(
            "Analyze the following {tool} data from a malware sandbox execution.\n\
             Sample file: {sample}\n\n\
             --- BEGIN {tool_upper} DATA ---\n\
             {payload}\n\
             --- END {tool_upper} DATA ---\n\n\
             IMPORTANT: Respond with ONLY a valid JSON object. \
             First character must be '{{'. Last character must be '}}'. \
             Use the exact keys: tool, verdict, confidence, findings, iocs, summary.",
            tool = tool,
            sample = sample_name,
            tool_upper = tool.to_uppercase(),
            payload = payload,
        );

        log::info!("Calling agent {} ...", profile.name);
        match self.ask_agent(&profile, prompt).await {
            Ok(resp) => {
                let raw = clean_json_response(&resp);
                result.raw_response = raw.clone();
                parse_tool_json(&raw, &mut result);
                log::info!(
                    "Agent {} -> verdict={} confidence={} findings={}",
                    profile.name,
                    result.verdict,
                    result.confidence,
                    result.findings_count
                );
            }
            Err(e) => {
                log::error!("Agent {} failed: {}", profile.name, e);
                result.error = Some(e.to_string());
                result.raw_response = error_fallback(&tool, &e.to_string());
            }
        }
        result
    }

    /// Run the full AI analysis pipeline on an existing report.
    pub async fn analyze_report(&self, analysis_id: &str) -> ThreatAnalysisReport {
        let mut report = ThreatAnalysisReport::new(analysis_id, self.provider.model());

        let report_dir = self.reports_dir.join(analysis_id);
        if !report_dir.is_dir() {
            report.status = "failed".to_string();
            report.error = Some(format!("Report directory not found: {}", analysis_id));
            return report;
        }
        report.status = "running".to_string();

        let sample_name = sample_name_of(&report_dir);

        // Phase 1: per-tool analysis. Agents with data run in parallel;
        // agents without data get a synthesized inconclusive result and no
        // LLM call.
        let mut live = Vec::new();
        let mut no_data_results = Vec::new();
        for profile in tool_agents() {
            let payload = loaders::load_for_agent(profile.name, &report_dir);
            let tool = profile.name.trim_end_matches("-analyzer").to_string();
            if !payload.has_data {
                let mut result = ToolAnalysisResult::new(&tool, profile.name);
                result.summary = format!("No {} data was available for analysis.", tool);
                result.raw_response = no_data_fallback(&tool);
                no_data_results.push(result);
                log::info!("Skipped {} (no data)", profile.name);
                continue;
            }
            live.push((profile, tool, payload.text));
        }

        if !live.is_empty() {
            log::info!("Running {} tool agents in parallel ...", live.len());
            let dispatches = live.into_iter().map(|(profile, tool, payload)| {
                self.run_tool_agent(profile, tool, payload, sample_name.clone())
            });
            report.tool_results = futures::future::join_all(dispatches).await;
        }
        report.tool_results.extend(no_data_results);

        // Phase 2: final summary, sequential after the join. The per-tool
        // JSONs are presented in catalog order.
        let mut parts = vec![
            format!("Sample: {}", sample_name),
            String::new(),
            "Below are the analysis outputs from each specialized tool analyst.".to_string(),
            "Synthesize them into a final threat report.".to_string(),
            String::new(),
        ];
        for profile in tool_agents() {
            let tool = profile.name.trim_end_matches("-analyzer");
            if let Some(result) = report.tool_results.iter().find(|t| t.tool == tool) {
                parts.push(format!("--- {} ANALYSIS ---", tool.to_uppercase()));
                parts.push(result.raw_response.clone());
                parts.push(String::new());
            }
        }
        parts.push(
            "IMPORTANT: Respond with ONLY a valid JSON object. \
             First character must be '{'. Last character must be '}'. \
             Use the exact keys from the schema: risk_score, threat_level, classification, \
             executive_summary, key_findings, iocs, mitre_attack, recommendations, detailed_analysis."
                .to_string(),
        );
        let summary_prompt = parts.join("\n");

        let summarizer = summarizer_agent();
        log::info!("Calling threat-summarizer agent ...");
        match self.ask_agent(&summarizer, summary_prompt).await {
            Ok(resp) => {
                let raw = clean_json_response(&resp);
                report.raw_summary = raw.clone();
                parse_summary_json(&raw, &mut report);
                log::info!(
                    "Threat summary -> risk={} level={} type={}",
                    report.risk_score,
                    report.threat_level,
                    report.malware_type
                );
            }
            Err(e) => {
                report.error = Some(format!("Summarizer failed: {}", e));
                log::error!("Threat summarizer failed: {}", e);
            }
        }

        report.completed_at = Some(utc_now_iso());
        report.status = if report.error.is_none() {
            "complete".to_string()
        } else {
            "failed".to_string()
        };

        if let Err(e) = save_results(&report_dir, &report) {
            log::error!("Could not persist AI analysis: {}", e);
        }

        report
    }

    /// Load a previously saved AI analysis report from disk.
    pub fn get_ai_report(&self, analysis_id: &str) -> Option<Value> {
        let path = self
            .reports_dir
            .join(analysis_id)
            .join("ai_analysis")
            .join("ai_report.json");
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

fn sample_name_of(report_dir: &Path) -> String {
    std::fs::read_to_string(report_dir.join("analysis_manifest.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|manifest| {
            manifest
                .get("sample_name")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn save_results(
    report_dir: &Path,
    report: &ThreatAnalysisReport,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ai_dir = report_dir.join("ai_analysis");
    std::fs::create_dir_all(&ai_dir)?;

    std::fs::write(
        ai_dir.join("ai_report.json"),
        serde_json::to_vec_pretty(&report.to_value())?,
    )?;

    for result in &report.tool_results {
        std::fs::write(
            ai_dir.join(format!("{}_analysis.json", result.tool)),
            result.raw_response.as_bytes(),
        )?;
    }

    if !report.raw_summary.is_empty() {
        std::fs::write(ai_dir.join("threat_report.json"), report.raw_summary.as_bytes())?;
    }

    log::info!("AI analysis saved to {}", ai_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct StubProvider {
        tool_response: String,
        summary_response: String,
        calls: Mutex<Vec<String>>,
    }

    impl StubProvider {
        fn new(tool_response: &str, summary_response: &str) -> Arc<Self> {
            Arc::new(StubProvider {
                tool_response: tool_response.to_string(),
                summary_response: summary_response.to_string(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        fn name(&self) -> &str {
            "Stub"
        }

        fn model(&self) -> &str {
            crate::ai::REQUIRED_MODEL
        }

        async fn ask(
            &self,
            history: Vec<ChatMessage>,
            system_prompt: String,
        ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.lock().unwrap().push(history[0].content.clone());
            if system_prompt.contains("senior threat intelligence analyst") {
                Ok(self.summary_response.clone())
            } else {
                Ok(self.tool_response.clone())
            }
        }
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn report_dir_with_sysmon(reports: &Path, id: &str) -> PathBuf {
        let dir = reports.join(id);
        write(
            &dir.join("analysis_manifest.json"),
            r#"{"sample_name":"hello.exe","status":"complete","timeout":60,"files_collected":[]}"#,
        );
        write(
            &dir.join("artifacts/sysmon/sysmon_summary.json"),
            r#"{"sample":"hello.exe","total_events":12,"processes_created":[]}"#,
        );
        dir
    }

    const TOOL_JSON: &str = r#"{"tool":"sysmon","verdict":"Malicious","confidence":150,
        "findings":[{"severity":"high","indicator":"run key","description":"persistence"}],
        "iocs":[{"type":"registry","value":"HKCU\\Run\\upd"}],
        "summary":"Persistence via run key."}"#;

    const SUMMARY_JSON: &str = r#"{"risk_score":75,"threat_level":"HIGH",
        "classification":{"malware_type":"trojan","malware_family":"unknown","platform":"win32","confidence":80},
        "executive_summary":"Likely a trojan.","detailed_analysis":"Full narrative.",
        "key_findings":[{"source":"sysmon","severity":"high","description":"run key persistence"}],
        "iocs":[{"type":"registry","severity":"high","value":"HKCU\\Run\\upd"}],
        "mitre_attack":[{"technique_id":"T1547","name":"Boot Autostart","tactic":"persistence","description":"run key"}],
        "recommendations":[{"priority":"high","action":"Isolate the host"}]}"#;

    #[tokio::test]
    async fn pipeline_dispatches_only_agents_with_data() {
        let reports = tempdir().unwrap();
        report_dir_with_sysmon(reports.path(), "run1");
        let provider = StubProvider::new(TOOL_JSON, SUMMARY_JSON);
        let analyzer = ThreatAnalyzer::new(
            reports.path().to_path_buf(),
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
        );

        let report = analyzer.analyze_report("run1").await;

        assert_eq!(report.status, "complete");
        assert_eq!(report.model, crate::ai::REQUIRED_MODEL);
        assert_eq!(report.tool_results.len(), 6);
        // sysmon + metadata (manifest exists) are live; four have no data.
        // One call each plus the summarizer.
        assert_eq!(provider.call_count(), 3);

        let sysmon = report
            .tool_results
            .iter()
            .find(|t| t.tool == "sysmon")
            .unwrap();
        assert_eq!(sysmon.verdict, "malicious");
        assert_eq!(sysmon.confidence, 100); // clamped from 150
        assert_eq!(sysmon.findings_count, 1);

        let network = report
            .tool_results
            .iter()
            .find(|t| t.tool == "network")
            .unwrap();
        assert_eq!(network.verdict, "inconclusive");
        assert!(network.summary.contains("No network data"));

        assert_eq!(report.risk_score, 75);
        assert_eq!(report.threat_level, "high");
        assert_eq!(report.malware_type, "trojan");
        assert_eq!(report.mitre_attack[0]["id"], "T1547");
    }

    #[tokio::test]
    async fn pipeline_persists_report_files() {
        let reports = tempdir().unwrap();
        let dir = report_dir_with_sysmon(reports.path(), "run2");
        let provider = StubProvider::new(TOOL_JSON, SUMMARY_JSON);
        let analyzer = ThreatAnalyzer::new(
            reports.path().to_path_buf(),
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
        );

        analyzer.analyze_report("run2").await;

        let ai_dir = dir.join("ai_analysis");
        assert!(ai_dir.join("ai_report.json").is_file());
        assert!(ai_dir.join("sysmon_analysis.json").is_file());
        assert!(ai_dir.join("network_analysis.json").is_file());
        assert!(ai_dir.join("threat_report.json").is_file());

        let loaded = analyzer.get_ai_report("run2").unwrap();
        assert_eq!(loaded["risk_score"], 75);
        assert_eq!(loaded["classification"]["malware_type"], "trojan");
    }

    #[tokio::test]
    async fn missing_report_dir_fails_fast() {
        let reports = tempdir().unwrap();
        let provider = StubProvider::new(TOOL_JSON, SUMMARY_JSON);
        let analyzer = ThreatAnalyzer::new(
            reports.path().to_path_buf(),
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
        );
        let report = analyzer.analyze_report("missing").await;
        assert_eq!(report.status, "failed");
        assert!(report.error.unwrap().contains("not found"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn prose_tool_response_falls_back_to_heuristic() {
        let reports = tempdir().unwrap();
        report_dir_with_sysmon(reports.path(), "run3");
        let provider = StubProvider::new("This binary is clearly malicious.", SUMMARY_JSON);
        let analyzer = ThreatAnalyzer::new(
            reports.path().to_path_buf(),
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
        );

        let report = analyzer.analyze_report("run3").await;
        let sysmon = report
            .tool_results
            .iter()
            .find(|t| t.tool == "sysmon")
            .unwrap();
        assert_eq!(sysmon.verdict, "malicious");
        assert_eq!(sysmon.confidence, 40);
        assert!(sysmon.summary.contains("clearly malicious"));
        assert!(sysmon.error.as_ref().unwrap().contains("JSON parse error"));
    }

    #[tokio::test]
    async fn prose_summary_derives_fallback_risk() {
        let reports = tempdir().unwrap();
        report_dir_with_sysmon(reports.path(), "run4");
        // Tool responses decode as malicious; summary is prose.
        let provider = StubProvider::new(TOOL_JSON, "The sample is dangerous, isolate it.");
        let analyzer = ThreatAnalyzer::new(
            reports.path().to_path_buf(),
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
        );

        let report = analyzer.analyze_report("run4").await;
        assert_eq!(report.status, "complete");
        assert!(report.executive_summary.contains("dangerous"));
        // 2 malicious live tools (sysmon + metadata) -> 50 + 2*15 = 80.
        assert_eq!(report.risk_score, 80);
        assert_eq!(report.threat_level, "high");
    }

    #[test]
    fn fallback_risk_tiers() {
        let mut report = ThreatAnalysisReport::new("x", "m");
        let mut mk = |verdict: &str| {
            let mut r = ToolAnalysisResult::new("t", "a");
            r.verdict = verdict.to_string();
            r
        };
        report.tool_results = vec![mk("malicious"), mk("malicious"), mk("suspicious")];
        apply_fallback_risk(&mut report);
        assert_eq!(report.risk_score, 80);
        assert_eq!(report.threat_level, "high");

        report.tool_results = vec![mk("suspicious")];
        apply_fallback_risk(&mut report);
        assert_eq!(report.risk_score, 45);
        assert_eq!(report.threat_level, "medium");

        report.tool_results = vec![mk("benign"), mk("inconclusive")];
        apply_fallback_risk(&mut report);
        assert_eq!(report.risk_score, 20);
        assert_eq!(report.threat_level, "low");

        // Many malicious verdicts cap at 85.
        report.tool_results = (0..6).map(|_| mk("malicious")).collect();
        apply_fallback_risk(&mut report);
        assert_eq!(report.risk_score, 85);
    }

    #[test]
    fn empty_response_keeps_inconclusive_with_error() {
        let mut result = ToolAnalysisResult::new("sysmon", "sysmon-analyzer");
        parse_tool_json("", &mut result);
        assert_eq!(result.verdict, "inconclusive");
        assert_eq!(result.confidence, 0);
        assert!(result.error.is_some());
    }

    #[test]
    fn flat_string_classification_is_accepted() {
        let mut report = ThreatAnalysisReport::new("x", "m");
        parse_summary_json(
            r#"{"risk_score":10,"threat_level":"low","classification":"adware"}"#,
            &mut report,
        );
        assert_eq!(report.malware_type, "adware");
        assert_eq!(report.classification_confidence, 50);
    }
}
