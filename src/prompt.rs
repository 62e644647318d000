use sha2::{Digest, Sha256};

use crate::checker::{CheckerReport, describe_finding};
use crate::snapshot::RepoSnapshot;

/// Assemble the full request payload for one iteration: preamble, framed
/// file contents, the spec diff when present, and the previous checker
/// findings when present. The payload is fully self-describing; the model
/// sees the roles, the boundary token, and the reply schema restated every
/// time because it is stateless across iterations.
pub fn assemble(snapshot: &RepoSnapshot, findings: Option<&CheckerReport>) -> String {
    let rendered: Vec<(String, &'static str, String)> = snapshot
        .files
        .iter()
        .map(|f| {
            (
                f.path.as_str().to_string(),
                f.role.label(),
                String::from_utf8_lossy(&f.contents).into_owned(),
            )
        })
        .collect();

    let findings_text = findings.map(render_findings);
    let boundary = boundary_token(
        &rendered,
        snapshot.spec_diff.as_deref(),
        findings_text.as_deref(),
    );

    let mut prompt = String::new();
    prompt.push_str(&preamble(&boundary));

    prompt.push_str("\n# Repository contents\n\n");
    for (path, role, text) in &rendered {
        prompt.push_str(&format!("{} FILE role={} path={}\n", boundary, role, path));
        prompt.push_str(text);
        if !text.ends_with('\n') {
            prompt.push('\n');
        }
        prompt.push_str(&format!("{} END\n", boundary));
    }

    if let Some(diff) = &snapshot.spec_diff {
        prompt.push_str(
            "\n# Specification changes under review\n\n\
             The specifications changed as follows relative to the main branch. \
             Treat this reconciliation as a task to verify: bring the code into \
             conformance with the specifications as they now stand.\n\n",
        );
        prompt.push_str(diff);
        if !diff.ends_with('\n') {
            prompt.push('\n');
        }
    }

    if let Some(text) = &findings_text {
        prompt.push_str(
            "\n# Findings from the previous iteration\n\n\
             The correctness checker reported the following on the current state \
             of the repository. Resolve each finding.\n\n",
        );
        prompt.push_str(text);
    }

    prompt
}

fn preamble(boundary: &str) -> String {
    format!(
        "You are reconciling a repository against its specifications.\n\
         \n\
         Ground rules:\n\
         - The specifications under specs/ are the source of truth. Do not \
         trust the existing code to be correct, complete, or honest about \
         what it does; verify it against the specifications and fix what \
         disagrees.\n\
         - Prefer small, reviewable edits. Preserve working behavior that the \
         specifications do not contradict.\n\
         - Every file below is framed by the boundary token `{boundary}` and \
         introduced by a line stating its role and path. Roles: Code (an \
         implementation file), Spec (a specification), NewlyAddedSpec (a \
         specification not yet on the main branch). Never emit the boundary \
         token yourself.\n\
         \n\
         Reply with exactly one JSON object in this schema:\n\
         \n\
         {{ \"create-or-update\": {{ \"<relative path>\": \"<full new file contents>\", ... }},\n\
           \"delete\": [ \"<relative path>\", ... ] }}\n\
         \n\
         Both fields may be empty or omitted. Paths are relative to the \
         repository root. Contents replace the whole file.\n"
    )
}

fn render_findings(report: &CheckerReport) -> String {
    let mut text = String::new();
    if !report.per_file_findings.is_empty() {
        text.push_str("Per-file findings:\n");
        for finding in &report.per_file_findings {
            text.push_str(&format!("- {}\n", describe_finding(finding)));
        }
    }
    if !report.overall_findings.is_empty() {
        text.push_str("Overall findings:\n");
        for finding in &report.overall_findings {
            text.push_str(&format!("- {}\n", describe_finding(finding)));
        }
    }
    text
}

/// Derive a boundary token no framed region can contain. The token is a
/// hash of everything that will appear between boundaries plus a counter;
/// on the (vanishing) chance some region contains the candidate, the
/// counter bumps and the token is re-derived.
fn boundary_token(
    rendered: &[(String, &'static str, String)],
    spec_diff: Option<&str>,
    findings_text: Option<&str>,
) -> String {
    let mut counter: u64 = 0;
    loop {
        let mut hasher = Sha256::new();
        for (path, _, text) in rendered {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(text.as_bytes());
        }
        if let Some(diff) = spec_diff {
            hasher.update(diff.as_bytes());
        }
        if let Some(text) = findings_text {
            hasher.update(text.as_bytes());
        }
        hasher.update(counter.to_le_bytes());

        let digest = hex::encode(hasher.finalize());
        let token = format!("====BORK-{}====", &digest[..32]);

        let collides = rendered.iter().any(|(_, _, text)| text.contains(&token))
            || spec_diff.is_some_and(|d| d.contains(&token))
            || findings_text.is_some_and(|t| t.contains(&token));
        if !collides {
            return token;
        }
        counter += 1;
    }
}
