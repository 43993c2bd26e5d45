//! Policy signals: evidence that a snippet attempted a disallowed operation
//!
//! Signals come from two places. Before execution the snippet text is scanned
//! for operations the sandbox forbids (network tools, host paths, privilege
//! changes, fork bombs). After execution the captured output and termination
//! signal are scanned for the errors those operations produce inside the
//! sandbox. Any signal makes the run Unsafe.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ExecutionArtifacts;

const MAX_EVIDENCE_CHARS: usize = 120;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    NetworkEgress,
    FilesystemEscape,
    PrivilegeEscalation,
    DisallowedSyscall,
    ResourceAbuse,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NetworkEgress => "NetworkEgress",
            Self::FilesystemEscape => "FilesystemEscape",
            Self::PrivilegeEscalation => "PrivilegeEscalation",
            Self::DisallowedSyscall => "DisallowedSyscall",
            Self::ResourceAbuse => "ResourceAbuse",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Found in the snippet text before execution
    Static,
    /// Observed in the execution output or termination
    Runtime,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PolicySignal {
    pub kind: ViolationKind,
    pub source: SignalSource,
    pub evidence: String,
}

impl fmt::Display for PolicySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            SignalSource::Static => "static",
            SignalSource::Runtime => "runtime",
        };
        write!(f, "{} [{source}]: {}", self.kind, self.evidence)
    }
}

struct SnippetRule {
    kind: ViolationKind,
    pattern: Regex,
}

fn rule(kind: ViolationKind, pattern: &str) -> SnippetRule {
    SnippetRule {
        kind,
        // Patterns are constants covered by tests.
        pattern: Regex::new(pattern).unwrap(),
    }
}

static SNIPPET_RULES: LazyLock<Vec<SnippetRule>> = LazyLock::new(|| {
    use ViolationKind::*;
    vec![
        // Network egress
        rule(
            NetworkEgress,
            r"(?i)\b(?:curl|wget|nc|ncat|netcat|telnet|ssh|scp|sftp|ftp|rsync)\b",
        ),
        rule(NetworkEgress, r"/dev/(?:tcp|udp)/"),
        rule(
            NetworkEgress,
            r"\bimport\s+socket\b|\bsocket\.(?:socket|create_connection)\b",
        ),
        rule(
            NetworkEgress,
            r"\burllib\.request\b|\burlopen\s*\(|\brequests\.(?:get|post|put|patch|delete|head)\s*\(|\bhttp\.client\b|\bhttpx\.",
        ),
        // Filesystem escape
        rule(
            FilesystemEscape,
            r"/etc/(?:passwd|shadow|sudoers|ssh/)|~/\.ssh\b|\.aws/credentials|docker\.sock",
        ),
        rule(FilesystemEscape, r"(?:\.\./){2,}"),
        rule(FilesystemEscape, r"/proc/(?:self|\d+)/(?:root|mem|environ|cwd)"),
        rule(FilesystemEscape, r"\brm\s+-[a-zA-Z]*(?:rf|fr)[a-zA-Z]*\b"),
        rule(FilesystemEscape, r"\bdd\s+if=/dev/"),
        rule(FilesystemEscape, r"\b(?:mount|umount|chroot|pivot_root)\b"),
        // Privilege escalation
        rule(PrivilegeEscalation, r"\bsudo\b|\bsu\s+(?:-|root\b)"),
        rule(
            PrivilegeEscalation,
            r"\bchmod\s+(?:[ugoa]*\+s\b|[2-7][0-7]{3}\b)",
        ),
        rule(
            PrivilegeEscalation,
            r"\b(?:setuid|setgid|setreuid|setresuid|seteuid)\s*\(",
        ),
        rule(PrivilegeEscalation, r"\b(?:setcap|capsh|nsenter|unshare)\b"),
        // Resource abuse
        rule(
            ResourceAbuse,
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:|(?i)fork\s*bomb",
        ),
    ]
});

/// Output fragments (lowercase) produced by blocked operations inside the sandbox
const OUTPUT_MARKERS: &[(ViolationKind, &str)] = &[
    (ViolationKind::NetworkEgress, "could not resolve host"),
    (ViolationKind::NetworkEgress, "temporary failure in name resolution"),
    (ViolationKind::NetworkEgress, "name or service not known"),
    (ViolationKind::NetworkEgress, "network is unreachable"),
    (ViolationKind::NetworkEgress, "no route to host"),
    (ViolationKind::NetworkEgress, "failed to establish a new connection"),
    (ViolationKind::FilesystemEscape, "read-only file system"),
    (ViolationKind::PrivilegeEscalation, "operation not permitted"),
];

/// Scans snippet text for disallowed operations, one signal per matching rule
pub fn scan_snippet(snippet: &str) -> Vec<PolicySignal> {
    SNIPPET_RULES
        .iter()
        .filter_map(|rule| {
            rule.pattern.find(snippet).map(|m| PolicySignal {
                kind: rule.kind,
                source: SignalSource::Static,
                evidence: shorten(m.as_str()),
            })
        })
        .collect()
}

/// Scans captured output and termination for traces of blocked operations
pub fn scan_artifacts(artifacts: &ExecutionArtifacts) -> Vec<PolicySignal> {
    let mut signals = Vec::new();

    for stream in [&artifacts.stdout, &artifacts.stderr] {
        for line in stream.lines() {
            let lowered = line.to_lowercase();
            for (kind, marker) in OUTPUT_MARKERS {
                let seen = signals.iter().any(|s: &PolicySignal| s.kind == *kind);
                if !seen && lowered.contains(marker) {
                    signals.push(PolicySignal {
                        kind: *kind,
                        source: SignalSource::Runtime,
                        evidence: shorten(line.trim()),
                    });
                }
            }
        }
    }

    if artifacts.signal == Some(libc::SIGSYS) {
        signals.push(PolicySignal {
            kind: ViolationKind::DisallowedSyscall,
            source: SignalSource::Runtime,
            evidence: format!("terminated by signal {} (SIGSYS)", libc::SIGSYS),
        });
    }

    signals
}

fn shorten(text: &str) -> String {
    if text.chars().count() <= MAX_EVIDENCE_CHARS {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_EVIDENCE_CHARS).collect();
        cut.push_str("...");
        cut
    }
}
