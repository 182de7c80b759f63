//! Shell command parsing.
//!
//! Extracts the meaningful command from a raw compound shell string,
//! respecting quoting and balanced `$(...)` subshells. Pipes are not
//! split points; a piped command is one segment.

use once_cell::sync::Lazy;
use regex::Regex;

/// Segment starters that set up state rather than doing work.
const PREAMBLE_COMMANDS: &[&str] = &[
    "cd", "pushd", "popd", "set", "shopt", "source", ".", "export", "unset", "true", "false",
];

static VAR_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap());

/// One whitespace-split shell segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub raw: String,
    pub executable: String,
    pub args: Vec<String>,
}

/// Split a segment on whitespace into executable and args.
pub fn parse_segment(segment: &str) -> ParsedCommand {
    let raw = segment.trim().to_string();
    let mut parts = raw.split_whitespace().map(str::to_string);
    let executable = parts.next().unwrap_or_default();
    let args = parts.collect();
    ParsedCommand {
        raw,
        executable,
        args,
    }
}

fn strip_comment_lines(command: &str) -> String {
    command
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a compound command on top-level `&&`, `||` and `;`.
///
/// Single quotes take everything literally; double quotes honor backslash
/// escapes; `$(...)` subshells are kept balanced and never split inside.
pub fn split_compound(command: &str) -> Vec<String> {
    let stripped = strip_comment_lines(command);
    let chars: Vec<char> = stripped.chars().collect();

    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut subshell_depth = 0usize;

    let mut flush = |current: &mut String, segments: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            segments.push(trimmed.to_string());
        }
        current.clear();
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        if in_double {
            if c == '\\' && i + 1 < chars.len() {
                current.push(c);
                current.push(chars[i + 1]);
                i += 2;
                continue;
            }
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.push(c);
                i += 1;
            }
            '"' => {
                in_double = true;
                current.push(c);
                i += 1;
            }
            '$' if i + 1 < chars.len() && chars[i + 1] == '(' => {
                subshell_depth += 1;
                current.push('$');
                current.push('(');
                i += 2;
            }
            ')' if subshell_depth > 0 => {
                subshell_depth -= 1;
                current.push(c);
                i += 1;
            }
            '&' if subshell_depth == 0 && i + 1 < chars.len() && chars[i + 1] == '&' => {
                flush(&mut current, &mut segments);
                i += 2;
            }
            '|' if subshell_depth == 0 && i + 1 < chars.len() && chars[i + 1] == '|' => {
                flush(&mut current, &mut segments);
                i += 2;
            }
            ';' if subshell_depth == 0 => {
                flush(&mut current, &mut segments);
                i += 1;
            }
            '\n' if subshell_depth == 0 => {
                flush(&mut current, &mut segments);
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    flush(&mut current, &mut segments);
    segments
}

/// Whether a segment only sets up shell state.
pub fn is_preamble(segment: &str) -> bool {
    let parsed = parse_segment(segment);
    if parsed.executable.is_empty() {
        return true;
    }
    if PREAMBLE_COMMANDS.contains(&parsed.executable.as_str()) {
        return true;
    }
    VAR_ASSIGNMENT.is_match(&parsed.executable)
}

/// The first non-preamble segment; the last segment when all are preamble.
pub fn meaningful_command(command: &str) -> Option<String> {
    let segments = split_compound(command);
    segments
        .iter()
        .find(|s| !is_preamble(s))
        .or_else(|| segments.last())
        .cloned()
}

/// Rewrite an absolute path under `project_root` to its relative part.
/// Paths outside the root are returned unchanged.
pub fn project_relative(project_root: &str, path: &str) -> String {
    let root = project_root.trim_end_matches('/');
    if let Some(rest) = path.strip_prefix(root) {
        let relative = rest.trim_start_matches('/');
        if !relative.is_empty() {
            return relative.to_string();
        }
        return ".".to_string();
    }
    path.to_string()
}

/// Collapse runs of whitespace and trim; key for the pending-decision map.
pub fn normalize_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

static LEADING_CD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^cd\s+\S+\s*&&\s*").unwrap());
static LEADING_ASSIGNMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*=\S*\s+)+").unwrap());
static TRAILING_NULL_REDIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:2>\s*/dev/null|>\s*/dev/null\s+2>&1)\s*$").unwrap());
static TRAILING_ECHO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*;\s*echo\s.*$").unwrap());
static PNPM_FILTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pnpm\s+--filter\s+\S+\s+").unwrap());

/// Normalized form used as a secondary rule-matching target.
///
/// Strips leading `cd path &&`, leading variable assignments, trailing
/// null redirects and `; echo ...` suffixes, and the `pnpm --filter <pkg>`
/// prefix. Idempotent.
pub fn normalize_command(command: &str) -> String {
    let mut out = normalize_whitespace(command);

    loop {
        let next = LEADING_CD.replace(&out, "").into_owned();
        if next == out {
            break;
        }
        out = next;
    }

    out = LEADING_ASSIGNMENTS.replace(&out, "").into_owned();
    out = TRAILING_NULL_REDIRECT.replace(&out, "").into_owned();
    out = TRAILING_ECHO.replace(&out, "").into_owned();
    out = PNPM_FILTER.replace(&out, "pnpm ").into_owned();

    normalize_whitespace(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_quotes_and_subshells() {
        let segments = split_compound("echo 'a && b' && git status");
        assert_eq!(segments, vec!["echo 'a && b'", "git status"]);

        let segments = split_compound("echo \"x; y\" ; ls");
        assert_eq!(segments, vec!["echo \"x; y\"", "ls"]);

        let segments = split_compound("echo $(date; whoami) && pwd");
        assert_eq!(segments, vec!["echo $(date; whoami)", "pwd"]);
    }

    #[test]
    fn pipes_are_not_split_points() {
        let segments = split_compound("cat file | grep foo | wc -l");
        assert_eq!(segments, vec!["cat file | grep foo | wc -l"]);

        let segments = split_compound("true || echo fallback");
        assert_eq!(segments, vec!["true", "echo fallback"]);
    }

    #[test]
    fn comment_lines_are_stripped() {
        let segments = split_compound("# setup\n\ncd /tmp && ls");
        assert_eq!(segments, vec!["cd /tmp", "ls"]);
    }

    #[test]
    fn meaningful_skips_preamble() {
        assert_eq!(
            meaningful_command("cd /app && NODE_ENV=test npm test"),
            Some("NODE_ENV=test npm test".to_string())
        );
        assert_eq!(
            meaningful_command("export FOO=1 && cargo build"),
            Some("cargo build".to_string())
        );
        // All preamble: the last segment is the fallback.
        assert_eq!(
            meaningful_command("cd /app && export FOO=1"),
            Some("export FOO=1".to_string())
        );
    }

    #[test]
    fn var_assignment_is_preamble() {
        assert!(is_preamble("FOO=bar"));
        assert!(is_preamble("cd /somewhere"));
        assert!(!is_preamble("FOO=bar npm test"));
        assert!(!is_preamble("git status"));
    }

    #[test]
    fn project_relative_rewrites_inside_root() {
        assert_eq!(
            project_relative("/home/me/proj", "/home/me/proj/src/main.rs"),
            "src/main.rs"
        );
        assert_eq!(project_relative("/home/me/proj", "/etc/passwd"), "/etc/passwd");
        assert_eq!(project_relative("/home/me/proj", "/home/me/proj"), ".");
    }

    #[test]
    fn normalize_command_strips_wrappers() {
        assert_eq!(
            normalize_command("cd packages/web && npm test 2>/dev/null"),
            "npm test"
        );
        assert_eq!(
            normalize_command("NODE_ENV=test FOO=1 npm run lint"),
            "npm run lint"
        );
        assert_eq!(
            normalize_command("pnpm --filter web build"),
            "pnpm build"
        );
        assert_eq!(
            normalize_command("git status ; echo done"),
            "git status"
        );
    }

    #[test]
    fn normalize_command_is_idempotent() {
        for raw in [
            "cd a && cd b && npm test >/dev/null 2>&1",
            "  git   status  ",
            "pnpm --filter api test ; echo ok",
        ] {
            let once = normalize_command(raw);
            assert_eq!(normalize_command(&once), once);
        }
    }

    #[test]
    fn parse_segment_splits_whitespace() {
        let parsed = parse_segment("  git commit -m msg ");
        assert_eq!(parsed.executable, "git");
        assert_eq!(parsed.args, vec!["commit", "-m", "msg"]);
        assert_eq!(parsed.raw, "git commit -m msg");
    }
}
