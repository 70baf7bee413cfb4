use crate::context::{CommitContext, PushContext};

pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Appended to the agent's system prompt for every operation.
pub const SYSTEM_PREAMBLE: &str = "You are running unattended on behalf of gitpilot. \
Work only inside the current repository. Never rewrite history, force-push, or change \
git configuration. If a step fails, stop and report the error instead of retrying.";

/// Environment for agent-spawned git: no credential prompts, no editors.
pub const AGENT_ENV: &[(&str, &str)] = &[("GIT_TERMINAL_PROMPT", "0"), ("GIT_EDITOR", "true")];

fn instructions_block(custom: Option<&str>) -> String {
    match custom.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => format!("\nAdditional instructions from the user:\n---\n{text}\n---\n"),
        None => String::new(),
    }
}

pub fn commit_prompt(ctx: &CommitContext, custom: Option<&str>) -> String {
    format!(
        r#"You are committing staged changes in a git repository.

Repository state:
{preview}
{instructions}
STEPS:
1. Inspect the staged changes. Run `git diff --cached` if the excerpt above is not enough.
2. Write a concise commit message: a subject line under 72 characters in the imperative mood,
   then a blank line and a short body only if the change needs explaining. Match the style
   of the recent commits.
3. Run `git commit -m "<message>"`. Commit only what is staged; never run `git add`.
4. Reply with the commit message you used and nothing else."#,
        preview = ctx.preview(),
        instructions = instructions_block(custom),
    )
}

pub fn create_pr_prompt(
    push: &PushContext,
    commits: &CommitContext,
    base_branch: Option<&str>,
    custom: Option<&str>,
) -> String {
    let base = base_branch.unwrap_or(DEFAULT_BASE_BRANCH);
    let recent = commits
        .recent_commits
        .iter()
        .map(|c| format!("  {} {}", c.short_hash, c.subject))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are opening a pull request for branch '{branch}' into '{base}'.

Push state:
{preview}
Recent history:
{recent}
{instructions}
STEPS:
1. If the branch has unpushed commits or no upstream, run `git push -u {remote} {branch}`.
2. Read `git log {base}..{branch}` to understand the change set.
3. Run `gh pr create --base {base} --head {branch}` with a clear title and a body that
   summarizes the changes.
4. Reply with the pull request URL on its own line."#,
        branch = push.push_branch,
        remote = push.remote,
        preview = push.preview(),
        instructions = instructions_block(custom),
    )
}

/// First pull request URL in the agent's reply.
pub fn extract_pr_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '.' | ',')))
        .find(|w| w.starts_with("https://") && w.contains("/pull"))
        .map(String::from)
}
