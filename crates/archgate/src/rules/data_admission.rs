use once_cell::sync::Lazy;
use regex::Regex;

use crate::crawl::{self, SourceFile};
use crate::fix::FixKind;
use crate::report::{RuleResult, Status, Violation};
use crate::store::STATE_DIR_NAME;
use crate::util;

use super::{compile_globset, files_matching, line_containing, Inputs};

pub const RULE_INGEST_ATOMIC_MOVE: &str = "2.1-ingest-atomic-move";
pub const RULE_INGEST_RESUMABLE: &str = "2.2-ingest-resumable";
pub const RULE_ATOMIC_STATE_WRITES: &str = "2.3-atomic-state-writes";
pub const RULE_AUDIT_WRAPPED_MUTATIONS: &str = "2.4-audit-wrapped-mutations";
pub const RULE_AUDIT_APPEND_ONLY: &str = "2.5-audit-append-only";

const INGEST_STATE_FILE: &str = "ingest.state.json";
const RESUME_FLAG: &str = "--resume";

static RENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:rename|renameSync|move|moveSync)\s*\(").expect("rename regex"));
static COPY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:copyFile|copyFileSync|copy|copySync|cp|cpSync)\s*\(").expect("copy regex")
});
static DIRECT_WRITE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:writeFile|writeFileSync|writeSync|createWriteStream|outputFile|outputFileSync)\s*\(")
        .expect("direct write regex")
});
static WRITE_ANY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:writeFile|writeFileSync|writeSync|createWriteStream|appendFile|appendFileSync|open|openSync)\s*\(")
        .expect("write regex")
});
static APPEND_MODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bappendFile(?:Sync)?\s*\(|\bflags?\s*:\s*['"]a\+?['"]|O_APPEND|,\s*['"]a\+?['"]\s*\)"#)
        .expect("append regex")
});

/// Source file with its text, read once per evaluation.
struct Loaded<'a> {
    file: &'a SourceFile,
    text: String,
}

fn load<'a>(files: impl IntoIterator<Item = &'a SourceFile>) -> Vec<Loaded<'a>> {
    files
        .into_iter()
        .filter_map(|file| crawl::read_text(file).map(|text| Loaded { file, text }))
        .collect()
}

pub fn evaluate(inputs: &Inputs<'_>) -> Vec<RuleResult> {
    let ingest_set = compile_globset(&inputs.cfg.ingest_globs);
    let ingest = load(files_matching(inputs.files, &ingest_set));
    let all = load(inputs.files.iter());

    vec![
        ingest_atomic_move(&ingest),
        ingest_resumable(&ingest),
        atomic_state_writes(inputs, &all),
        audit_wrapped_mutations(inputs, &all),
        audit_append_only(inputs, &all),
    ]
}

fn ingest_atomic_move(ingest: &[Loaded<'_>]) -> RuleResult {
    let mut violations = Vec::new();
    for f in ingest {
        for (idx, line) in f.text.lines().enumerate() {
            if COPY_RE.is_match(line) {
                violations.push(Violation::new(
                    RULE_INGEST_ATOMIC_MOVE,
                    f.file.rel.clone(),
                    idx + 1,
                    "ingest copies files instead of moving them atomically",
                    "Replace the copy with fs.rename/renameSync into the locked area.",
                ));
            }
        }
        if !RENAME_RE.is_match(&f.text) {
            violations.push(Violation::new(
                RULE_INGEST_ATOMIC_MOVE,
                f.file.rel.clone(),
                1,
                "ingest implementation has no rename-based move",
                "Move admitted files with fs.rename/renameSync.",
            ));
        }
    }
    RuleResult::from_violations(
        RULE_INGEST_ATOMIC_MOVE,
        "Ingest moves files by atomic rename",
        Status::Fail,
        violations,
    )
    .with_evidence("ingestFiles", ingest.len() as u64)
}

fn ingest_resumable(ingest: &[Loaded<'_>]) -> RuleResult {
    let Some(first) = ingest.first() else {
        return RuleResult::pass(RULE_INGEST_RESUMABLE, "Ingest is resumable")
            .with_evidence("ingestFiles", 0u64);
    };
    let mut violations = Vec::new();
    for (needle, what, hint) in [
        (
            INGEST_STATE_FILE,
            "ingest never persists its state file",
            "Persist the pending list and moved count to ingest.state.json after each move.",
        ),
        (
            RESUME_FLAG,
            "ingest has no --resume entry point",
            "Accept --resume and reuse the persisted pending list.",
        ),
    ] {
        if !ingest.iter().any(|f| f.text.contains(needle)) {
            violations.push(Violation::new(
                RULE_INGEST_RESUMABLE,
                first.file.rel.clone(),
                1,
                what,
                hint,
            ));
        }
    }
    RuleResult::from_violations(
        RULE_INGEST_RESUMABLE,
        "Ingest is resumable",
        Status::Fail,
        violations,
    )
    .with_evidence("ingestFiles", ingest.len() as u64)
}

fn atomic_state_writes(inputs: &Inputs<'_>, all: &[Loaded<'_>]) -> RuleResult {
    let atomic_set = compile_globset(&inputs.cfg.atomic_writer_globs);
    let mut violations = Vec::new();
    for f in all {
        if atomic_set.is_match(&f.file.rel) || !f.text.contains(STATE_DIR_NAME) {
            continue;
        }
        for (idx, line) in f.text.lines().enumerate() {
            if DIRECT_WRITE_RE.is_match(line) && !line.contains(&inputs.cfg.audit_log_name) {
                violations.push(Violation::new(
                    RULE_ATOMIC_STATE_WRITES,
                    f.file.rel.clone(),
                    idx + 1,
                    format!("direct write to {STATE_DIR_NAME} outside the atomic writer"),
                    "Write state through the atomic temp-file-then-rename helper.",
                ));
            }
        }
    }
    RuleResult::from_violations(
        RULE_ATOMIC_STATE_WRITES,
        "State writes go through the atomic writer",
        Status::Fail,
        violations,
    )
}

/// Byte spans of whitespace-separated tokens.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// True when any marker occurs within `window` tokens of `offset`.
fn marker_near(text: &str, spans: &[(usize, usize)], offset: usize, window: usize, markers: &[String]) -> bool {
    if spans.is_empty() {
        return false;
    }
    let idx = spans
        .iter()
        .position(|&(_, end)| end > offset)
        .unwrap_or(spans.len() - 1);
    let lo = idx.saturating_sub(window);
    let hi = (idx + window).min(spans.len() - 1);
    let slice = &text[spans[lo].0..spans[hi].1];
    markers.iter().any(|m| slice.contains(m.as_str()))
}

fn audit_wrapped_mutations(inputs: &Inputs<'_>, all: &[Loaded<'_>]) -> RuleResult {
    let patterns: Vec<Regex> = inputs
        .cfg
        .mutation_patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern = %p, "ignoring invalid mutation pattern: {err}");
                None
            }
        })
        .collect();
    let wrapper = FixKind::InsertWrapper.marker();

    let mut violations = Vec::new();
    let mut mutations = 0u64;
    for f in all {
        if f.text.contains(wrapper) {
            continue;
        }
        let spans = token_spans(&f.text);
        let mut offsets: Vec<usize> = patterns
            .iter()
            .flat_map(|re| re.find_iter(&f.text).map(|m| m.start()))
            .collect();
        offsets.sort_unstable();
        offsets.dedup();

        let mut seen_lines = Vec::new();
        for offset in offsets {
            mutations += 1;
            if marker_near(&f.text, &spans, offset, inputs.cfg.audit_window_tokens, &inputs.cfg.audit_markers) {
                continue;
            }
            let line = util::line_of_offset(&f.text, offset);
            if seen_lines.contains(&line) {
                continue;
            }
            seen_lines.push(line);
            violations.push(Violation::new(
                RULE_AUDIT_WRAPPED_MUTATIONS,
                f.file.rel.clone(),
                line,
                "naked mutation: no audit wrapper near this data mutation",
                format!(
                    "Wrap the mutation with one of: {}.",
                    inputs.cfg.audit_markers.join(", ")
                ),
            ));
        }
    }
    RuleResult::from_violations(
        RULE_AUDIT_WRAPPED_MUTATIONS,
        "Mutations are audit-wrapped",
        Status::Fail,
        violations,
    )
    .with_evidence("mutations", mutations)
}

fn audit_append_only(inputs: &Inputs<'_>, all: &[Loaded<'_>]) -> RuleResult {
    let name = inputs.cfg.audit_log_name.as_str();
    let mut writers = 0u64;
    let mut violations = Vec::new();
    for f in all {
        if !f.text.contains(name) || !WRITE_ANY_RE.is_match(&f.text) {
            continue;
        }
        writers += 1;
        if !APPEND_MODE_RE.is_match(&f.text) {
            violations.push(Violation::new(
                RULE_AUDIT_APPEND_ONLY,
                f.file.rel.clone(),
                line_containing(&f.text, name),
                format!("{name} is written without an append-mode open"),
                "Open the audit log with appendFile or flags: 'a'; never truncate it.",
            ));
        }
    }
    RuleResult::from_violations(
        RULE_AUDIT_APPEND_ONLY,
        "Audit log is append-only",
        Status::Fail,
        violations,
    )
    .with_evidence("auditWriters", writers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixture::Fixture;

    fn run(fx: &mut Fixture) -> Vec<RuleResult> {
        fx.refresh();
        evaluate(&fx.inputs())
    }

    fn get<'a>(results: &'a [RuleResult], id: &str) -> &'a RuleResult {
        results.iter().find(|r| r.rule_id == id).expect("rule present")
    }

    #[test]
    fn ingest_copy_fails_and_rename_with_resume_passes() {
        let mut fx = Fixture::new();
        fx.write(
            "scripts/ingest.ts",
            "import fs from 'fs';\nfs.copyFileSync(src, dst);\n",
        );
        let results = run(&mut fx);
        let r = get(&results, RULE_INGEST_ATOMIC_MOVE);
        assert_eq!(r.status, Status::Fail);
        assert!(r.violations.iter().any(|v| v.line == 2));
        assert_eq!(get(&results, RULE_INGEST_RESUMABLE).violations.len(), 2);

        fx.write(
            "scripts/ingest.ts",
            "if (argv.includes('--resume')) load('ingest.state.json');\nfs.renameSync(src, dst);\n",
        );
        let results = run(&mut fx);
        assert_eq!(get(&results, RULE_INGEST_ATOMIC_MOVE).status, Status::Pass);
        assert_eq!(get(&results, RULE_INGEST_RESUMABLE).status, Status::Pass);
    }

    #[test]
    fn direct_state_write_outside_atomic_writer_fails() {
        let mut fx = Fixture::new();
        fx.write(
            "src/save.ts",
            "const p = '.governance/report.json';\nfs.writeFileSync(p, body);\n",
        );
        fx.write(
            "src/atomic-write.ts",
            "const p = '.governance/x';\nfs.writeFileSync(tmp, body);\nfs.renameSync(tmp, p);\n",
        );
        let results = run(&mut fx);
        let r = get(&results, RULE_ATOMIC_STATE_WRITES);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].file, "src/save.ts");
        assert_eq!(r.violations[0].line, 2);
    }

    #[test]
    fn naked_mutation_is_flagged_unless_marker_is_near() {
        let mut fx = Fixture::new();
        fx.write("src/repo.ts", "export async function f() {\n  await db.user.create({ data });\n}\n");
        fx.write(
            "src/ok.ts",
            "export const g = () => withAudit('user', () => db.user.update({ where }));\n",
        );
        let results = run(&mut fx);
        let r = get(&results, RULE_AUDIT_WRAPPED_MUTATIONS);
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].file, "src/repo.ts");
        assert_eq!(r.violations[0].line, 2);
        assert!(r.violations[0].message.contains("naked mutation"));
    }

    #[test]
    fn marker_outside_window_does_not_count() {
        let mut fx = Fixture::new();
        fx.cfg.audit_window_tokens = 2;
        let filler = "x ".repeat(20);
        fx.write("src/far.ts", &format!("withAudit(\n{filler}\ndb.user.delete(id);\n"));
        let results = run(&mut fx);
        assert_eq!(get(&results, RULE_AUDIT_WRAPPED_MUTATIONS).status, Status::Fail);
    }

    #[test]
    fn file_level_wrapper_marker_covers_file() {
        let mut fx = Fixture::new();
        fx.write(
            "src/repo.ts",
            &format!("{}\nawait db.user.create({{ data }});\n", FixKind::InsertWrapper.marker()),
        );
        let results = run(&mut fx);
        assert_eq!(get(&results, RULE_AUDIT_WRAPPED_MUTATIONS).status, Status::Pass);
    }

    #[test]
    fn audit_log_writers_must_append() {
        let mut fx = Fixture::new();
        fx.write("src/audit.ts", "fs.writeFileSync('audit.log', line);\n");
        fx.write("src/audit2.ts", "fs.appendFileSync('audit.log', line + '\\n');\n");
        fx.write("src/reader.ts", "const lines = read('audit.log');\n");
        let results = run(&mut fx);
        let r = get(&results, RULE_AUDIT_APPEND_ONLY);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].file, "src/audit.ts");
        assert_eq!(r.evidence["auditWriters"], 2);
    }

    #[test]
    fn token_spans_split_on_whitespace() {
        assert_eq!(token_spans("a  bc\nd"), vec![(0, 1), (3, 5), (6, 7)]);
    }
}
