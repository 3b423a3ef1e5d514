//! Stack-trace truncation.
//!
//! Raw traces from the host are dominated by framework frames. The driver
//! only wants the user-code lines, so traces are compressed once at ingestion
//! time: framework runs collapse into omission markers and the output is
//! bounded regardless of input size.

use crate::config::TruncationConfig;

/// Result of truncating one raw trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    pub text: String,
    /// Line count of the original trace, not the truncated one.
    pub frame_count: i64,
    /// True iff any omission marker was emitted or the candidate limit was hit.
    pub is_truncated: bool,
}

/// Truncate a raw stack trace according to `cfg`.
///
/// Total: never panics on well-formed UTF-8 input; the ingestion path still
/// guards the call and falls back to the raw trace.
pub fn truncate_stack(raw: &str, cfg: &TruncationConfig) -> Truncation {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let frame_count = lines.len() as i64;

    if lines.is_empty() {
        // Whitespace-only input: keep the raw text so the truncated rendering
        // is never empty when the raw trace is non-empty.
        return Truncation {
            text: raw.to_string(),
            frame_count: 0,
            is_truncated: false,
        };
    }

    let first_candidate = lines.iter().position(|l| is_candidate(l, cfg));

    let Some(first) = first_candidate else {
        return fallback_head(&lines, cfg, frame_count);
    };

    let mut out: Vec<String> = Vec::new();
    let mut framework_run = 0usize;
    let mut emitted = 0usize;
    let mut is_truncated = false;
    let mut idx = first;

    while idx < lines.len() {
        let line = lines[idx];
        if is_candidate(line, cfg) {
            if framework_run > 0 {
                out.push(format!("... {} framework calls omitted", framework_run));
                framework_run = 0;
                is_truncated = true;
            }
            if emitted == cfg.max_candidate_lines {
                let remaining = lines[idx..].iter().filter(|l| is_candidate(l, cfg)).count();
                out.push(format!("... {} more frames", remaining));
                is_truncated = true;
                break;
            }
            out.push(cap_line(
                &rewrite_paths(line.trim(), &cfg.path_markers),
                cfg.max_line_length,
            ));
            emitted += 1;
        } else {
            framework_run += 1;
        }
        idx += 1;
    }

    if idx >= lines.len() && framework_run > 0 {
        out.push(format!("... {} framework calls omitted", framework_run));
        is_truncated = true;
    }

    Truncation {
        text: out.join("\n"),
        frame_count,
        is_truncated,
    }
}

/// No user code anywhere: keep the first few raw lines and mark the rest.
fn fallback_head(lines: &[&str], cfg: &TruncationConfig, frame_count: i64) -> Truncation {
    let keep = cfg.fallback_head_lines.min(lines.len());
    let mut out: Vec<String> = lines[..keep]
        .iter()
        .map(|l| cap_line(&rewrite_paths(l.trim(), &cfg.path_markers), cfg.max_line_length))
        .collect();
    let mut is_truncated = false;
    if lines.len() > keep {
        out.push(format!("... {} more frames", lines.len() - keep));
        is_truncated = true;
    }
    Truncation {
        text: out.join("\n"),
        frame_count,
        is_truncated,
    }
}

fn is_candidate(line: &str, cfg: &TruncationConfig) -> bool {
    if cfg
        .important_patterns
        .iter()
        .any(|p| !p.is_empty() && line.contains(p.as_str()))
    {
        return true;
    }
    !is_framework(line, cfg)
}

fn is_framework(line: &str, cfg: &TruncationConfig) -> bool {
    let trimmed = line.trim_start();
    let trimmed = trimmed.strip_prefix("at ").unwrap_or(trimmed);
    cfg.framework_prefixes
        .iter()
        .any(|p| !p.is_empty() && trimmed.starts_with(p.as_str()))
}

/// Rewrite absolute paths to project-relative form: any path token ending at
/// a configured source-tree marker loses its machine-specific prefix.
fn rewrite_paths(line: &str, markers: &[String]) -> String {
    let mut out = line.to_string();
    let variants: Vec<String> = markers
        .iter()
        .filter(|m| !m.is_empty())
        .flat_map(|m| [m.clone(), m.replace('/', "\\")])
        .collect();
    for marker in &variants {
        let mut search_from = 0;
        while let Some(rel) = out[search_from..].find(marker.as_str()) {
            let pos = search_from + rel;
            let start = out[..pos]
                .bytes()
                .rposition(|b| matches!(b, b' ' | b'\t' | b'(' | b'"' | b'[' | b'<'))
                .map(|i| i + 1)
                .unwrap_or(0);
            // Only strip prefixes that look like a path, e.g. "/home/u/proj/"
            // or "C:\proj\"; a bare marker stays untouched.
            if start < pos && out[start..pos].contains(['/', '\\']) {
                out.replace_range(start..pos, "");
                search_from = start + marker.len();
            } else {
                search_from = pos + marker.len();
            }
        }
    }
    out
}

fn cap_line(s: &str, max: usize) -> String {
    if max == 0 || s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
