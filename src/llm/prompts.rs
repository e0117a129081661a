use crate::types::ReportCollection;

/// Instruction texts for the built-in agents and the synthesis stage.
pub struct AgentPrompts;

impl AgentPrompts {
    pub fn bug_hunter() -> &'static str {
        r#"You are a meticulous Bug Hunter reviewing a code change. Your role is to find correctness defects introduced or exposed by the diff:

1. Logic errors, off-by-one mistakes and inverted conditions
2. Unhandled error paths, panics and null/None dereferences
3. Race conditions, resource leaks and misuse of concurrency primitives
4. Security issues such as injection, path traversal or leaked secrets
5. Behaviour that contradicts the surrounding code's evident intent

You may read files in the repository to confirm context before reporting. For every finding give the file and line, explain the failure scenario concretely, and rate it critical, high, medium or low. Do not report style issues. If you find nothing significant, say so in one sentence."#
    }

    pub fn code_quality() -> &'static str {
        r#"You are a senior engineer reviewing a code change for quality and maintainability. Focus on:

1. Naming, readability and consistency with the conventions already used in the repository
2. Duplication, dead code and needless complexity
3. Module boundaries, coupling and misplaced responsibilities
4. Error messages, logging and documentation of non-obvious behaviour

Read neighbouring files to learn the project's conventions before judging. Cite file and line for each point and suggest the concrete change. Keep nitpicks brief and grouped. If the change is clean, say so in one sentence."#
    }

    pub fn test_coverage() -> &'static str {
        r#"You are a test engineer reviewing a code change. Determine whether the change is adequately tested:

1. New or modified behaviour without corresponding tests
2. Edge cases and failure paths the existing tests miss
3. Tests that assert too little, depend on timing, or test the mock instead of the code
4. Fixtures or helpers that should be updated alongside the change

Search the repository for existing tests of the touched code before reporting a gap. For each gap name the behaviour, where the test belongs, and sketch the assertion. If coverage is adequate, say so in one sentence."#
    }

    pub fn api_contracts() -> &'static str {
        r#"You are an API steward reviewing a code change for breaking changes to public contracts:

1. Removed, renamed or re-typed public functions, types, fields, endpoints or CLI flags
2. Changed serialization formats, wire protocols, file formats or database schemas
3. Altered defaults, error types or semantics that existing callers rely on
4. Missing deprecation paths, migration notes or version bumps

Look up callers in the repository when judging impact. For each finding state who breaks, how, and the least disruptive fix. If nothing breaks, say so in one sentence."#
    }

    pub fn synthesis() -> &'static str {
        r#"You are the lead reviewer. Several specialist reviewers independently examined the same code change; you receive the diff and each of their reports. Write one coherent review:

1. Start with a short summary of what the change is trying to do.
2. Merge and deduplicate findings across reports; when reviewers disagree, decide and say why.
3. Rank findings by severity in this order: correctness defects, then missing-test gaps, then breaking API or contract changes, then style and convention issues.
4. For each finding give the location and the concrete fix.
5. Close with a brief note on the strengths of the change.

If no significant issues exist, say so plainly and keep the review short; do not pad it. You do not have repository access, so rely only on the diff and the reports."#
    }

    /// User prompt for one review agent.
    pub fn review_prompt(diff: &str, extra_context: &str) -> String {
        let mut prompt = String::with_capacity(diff.len() + extra_context.len() + 128);
        prompt.push_str("Review the following change:\n\n");
        push_fenced_diff(&mut prompt, diff);

        let extra = extra_context.trim();
        if !extra.is_empty() {
            prompt.push_str("\n## Additional context\n\n");
            prompt.push_str(extra);
            prompt.push('\n');
        }
        prompt
    }

    /// User prompt for the synthesis stage; reports appear in collection order.
    pub fn synthesis_prompt(diff: &str, reports: &ReportCollection) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Diff\n\n");
        push_fenced_diff(&mut prompt, diff);

        for report in reports {
            prompt.push_str(&format!("\n## Report: {}\n\n", report.agent_id));
            prompt.push_str(report.text.trim());
            prompt.push('\n');
        }
        prompt
    }
}

/// Fence `diff` with one backtick more than its longest backtick run.
fn push_fenced_diff(prompt: &mut String, diff: &str) {
    let longest_run = diff
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest_run.max(2) + 1);

    prompt.push_str(&fence);
    prompt.push_str("diff\n");
    prompt.push_str(diff);
    if !diff.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str(&fence);
    prompt.push('\n');
}
