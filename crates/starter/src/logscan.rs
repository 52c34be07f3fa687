//! Classification of the structured logs written by the replay application.
//!
//! Every log line is first assigned a severity tier by its signature. A line with a
//! tier is then matched against an ordered list of rules of that tier, first match
//! wins, and the tier's fallback code applies when no rule matches.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use nodeguard::exitcode::ExitCode;
use nodeguard::exitcode::codes::{
    ERR_MTS_CRASH, ERR_MTS_ERROR, ERR_MTS_EXCEPTION, ERR_MTS_RECORDING, ERR_MTS_SYNC,
    WARN_MTS_WARNING,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Crash,
    Exception,
    Error,
    Warning,
}

impl Tier {
    const ALL: [Tier; 4] = [Tier::Crash, Tier::Exception, Tier::Error, Tier::Warning];

    pub fn fallback_code(&self) -> &'static str {
        match self {
            Tier::Crash => ERR_MTS_CRASH,
            Tier::Exception => ERR_MTS_EXCEPTION,
            Tier::Error => ERR_MTS_ERROR,
            Tier::Warning => WARN_MTS_WARNING,
        }
    }

    fn signature(&self) -> &'static str {
        match self {
            Tier::Crash => r#"(?i)severity\s*=\s*"(crash|fatal)"|<crash[\s>]"#,
            Tier::Exception => r#"(?i)severity\s*=\s*"exception"|<exception[\s>]"#,
            Tier::Error => r#"(?i)severity\s*=\s*"error""#,
            Tier::Warning => r#"(?i)severity\s*=\s*"warning""#,
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Tier::Crash => "crash",
            Tier::Exception => "exception",
            Tier::Error => "error",
            Tier::Warning => "warning",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub tier: Tier,
    pub pattern: String,
    pub code: String,
}

/// Drops `code` from classification when `companion` appears anywhere in the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionConfig {
    pub code: String,
    pub companion: String,
}

fn default_extensions() -> Vec<String> {
    vec!["xml".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogScanConfig {
    /// Extensions of the scanned files.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Evaluated before the built-in rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub suppressions: Vec<SuppressionConfig>,
    #[serde(default = "default_true")]
    pub builtin_rules: bool,
}

impl Default for LogScanConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            rules: Vec::new(),
            suppressions: Vec::new(),
            builtin_rules: true,
        }
    }
}

fn builtin_rules() -> Vec<RuleConfig> {
    let rule = |tier, pattern: &str, code: &str| RuleConfig {
        tier,
        pattern: pattern.to_string(),
        code: code.to_string(),
    };
    vec![
        rule(
            Tier::Error,
            r"(?i)recording.*(not found|cannot be opened|is corrupt)",
            ERR_MTS_RECORDING,
        ),
        rule(
            Tier::Error,
            r"(?i)synchroni[sz]ation (lost|failed)|timestamp jump",
            ERR_MTS_SYNC,
        ),
        rule(
            Tier::Exception,
            r"(?i)recording.*(not found|cannot be opened|is corrupt)",
            ERR_MTS_RECORDING,
        ),
    ]
}

fn builtin_suppressions() -> Vec<SuppressionConfig> {
    // A sync error at the very end of a recording is an artifact of the replay
    vec![SuppressionConfig {
        code: ERR_MTS_SYNC.to_string(),
        companion: r"(?i)end of recording reached".to_string(),
    }]
}

impl LogScanConfig {
    pub fn compile(&self) -> crate::Result<LogScanner> {
        let mut rules = self.rules.clone();
        let mut suppressions = self.suppressions.clone();
        if self.builtin_rules {
            rules.extend(builtin_rules());
            suppressions.extend(builtin_suppressions());
        }
        Ok(LogScanner {
            signatures: Tier::ALL
                .iter()
                .map(|tier| -> crate::Result<(Tier, Regex)> {
                    Ok((*tier, Regex::new(tier.signature())?))
                })
                .collect::<crate::Result<_>>()?,
            rules: rules
                .into_iter()
                .map(|rule| -> crate::Result<ScanRule> {
                    Ok(ScanRule {
                        tier: rule.tier,
                        pattern: Regex::new(&rule.pattern)?,
                        code: rule.code,
                    })
                })
                .collect::<crate::Result<_>>()?,
            suppressions: suppressions
                .into_iter()
                .map(|s| -> crate::Result<Suppression> {
                    Ok(Suppression {
                        code: s.code,
                        companion: Regex::new(&s.companion)?,
                    })
                })
                .collect::<crate::Result<_>>()?,
            extensions: self.extensions.clone(),
        })
    }
}

struct ScanRule {
    tier: Tier,
    pattern: Regex,
    code: String,
}

struct Suppression {
    code: String,
    companion: Regex,
}

pub struct LogScanner {
    signatures: Vec<(Tier, Regex)>,
    rules: Vec<ScanRule>,
    suppressions: Vec<Suppression>,
    extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub file: PathBuf,
    pub line: usize,
    pub tier: Tier,
    pub code: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub findings: Vec<Finding>,
    /// Codes whose companion pattern was seen.
    pub suppressed: Vec<String>,
}

impl ScanReport {
    /// Reports each distinct finding code once, then applies the suppressions.
    pub fn apply(&self, exit_code: &mut ExitCode) {
        let mut reported: Vec<&str> = Vec::new();
        for finding in &self.findings {
            if reported.contains(&finding.code.as_str()) {
                continue;
            }
            reported.push(&finding.code);
            let count = self
                .findings
                .iter()
                .filter(|f| f.code == finding.code)
                .count();
            exit_code.report_with_detail(
                &finding.code,
                format!(
                    "{}:{}: {} ({count} {} finding(s))",
                    finding.file.display(),
                    finding.line,
                    finding.text,
                    finding.tier
                ),
            );
        }
        for code in &self.suppressed {
            exit_code.suppress(code);
        }
    }
}

impl LogScanner {
    fn classify(&self, line: &str) -> Option<(Tier, &str)> {
        let tier = self
            .signatures
            .iter()
            .find(|(_, signature)| signature.is_match(line))
            .map(|(tier, _)| *tier)?;
        let code = self
            .rules
            .iter()
            .filter(|rule| rule.tier == tier)
            .find(|rule| rule.pattern.is_match(line))
            .map(|rule| rule.code.as_str())
            .unwrap_or(tier.fallback_code());
        Some((tier, code))
    }

    pub fn scan_text(&self, file: &Path, text: &str, report: &mut ScanReport) {
        report.files_scanned += 1;
        for (index, line) in text.lines().enumerate() {
            if let Some((tier, code)) = self.classify(line) {
                report.findings.push(Finding {
                    file: file.to_path_buf(),
                    line: index + 1,
                    tier,
                    code: code.to_string(),
                    text: line.trim().to_string(),
                });
            }
            for suppression in &self.suppressions {
                if suppression.companion.is_match(line) && !report.suppressed.contains(&suppression.code) {
                    log::debug!(
                        "Companion of {} found in {}:{}",
                        suppression.code,
                        file.display(),
                        index + 1
                    );
                    report.suppressed.push(suppression.code.clone());
                }
            }
        }
    }

    fn is_scanned(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(ext))
            })
    }

    /// Scans all matching files below `dir`, in file name order.
    pub fn scan_dir(&self, dir: &Path) -> crate::Result<ScanReport> {
        let mut report = ScanReport::default();
        if !dir.is_dir() {
            return Ok(report);
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || !self.is_scanned(entry.path()) {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            self.scan_text(entry.path(), &String::from_utf8_lossy(&bytes), &mut report);
        }
        log::info!(
            "Scanned {} log file(s) in {}: {} finding(s)",
            report.files_scanned,
            dir.display(),
            report.findings.len()
        );
        Ok(report)
    }
}
