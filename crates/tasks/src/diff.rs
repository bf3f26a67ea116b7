//! Unified diff generation, application and reversal.
//!
//! Generation delegates to `similar`. Application is strict: every context and
//! removed line must match the target exactly, otherwise the patch is refused
//! and the target is left untouched.

use similar::TextDiff;
use thiserror::Error;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    Malformed(String),

    #[error("hunk {hunk} does not apply at line {line}")]
    Mismatch { hunk: usize, line: usize },
}

/// Unified diff turning `old` into `new`. Empty when the texts are equal.
pub fn generate(path: &str, old: &str, new: &str) -> String {
    let diff = TextDiff::configure()
        .newline_terminated(true)
        .diff_lines(old, new);
    let rendered = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    rendered
}

/// Apply `diff` to `original` and return the patched text.
pub fn apply(original: &str, diff: &str) -> Result<String, PatchError> {
    parse(diff)?.apply(original)
}

/// The inverse of `diff`: applying it to the patched text restores the
/// original.
pub fn reverse(diff: &str) -> Result<String, PatchError> {
    Ok(parse(diff)?.reversed().render())
}

// ---------------------------------------------------------------------------
// Parsed representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Context,
    Remove,
    Add,
}

impl LineKind {
    fn marker(self) -> char {
        match self {
            Self::Context => ' ',
            Self::Remove => '-',
            Self::Add => '+',
        }
    }
}

#[derive(Debug, Clone)]
struct HunkLine {
    kind: LineKind,
    /// Line content including its trailing newline, if it had one.
    text: String,
}

/// Range numbers are kept exactly as written in the `@@` header.
#[derive(Debug, Clone)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    new_start: usize,
    new_len: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_seen(&self) -> usize {
        self.lines.iter().filter(|l| l.kind != LineKind::Add).count()
    }

    fn new_seen(&self) -> usize {
        self.lines.iter().filter(|l| l.kind != LineKind::Remove).count()
    }

    fn needs_more(&self) -> bool {
        self.old_seen() < self.old_len || self.new_seen() < self.new_len
    }

    /// Zero-based index of the first original line this hunk touches.
    fn anchor(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Patch {
    old_name: Option<String>,
    new_name: Option<String>,
    hunks: Vec<Hunk>,
}

fn parse(diff: &str) -> Result<Patch, PatchError> {
    let mut patch = Patch::default();
    let mut current: Option<Hunk> = None;

    for raw in diff.split_inclusive('\n') {
        if raw.starts_with('\\') {
            let last = current
                .as_mut()
                .and_then(|h| h.lines.last_mut())
                .ok_or_else(|| PatchError::Malformed("newline marker outside a hunk".into()))?;
            if last.text.ends_with('\n') {
                last.text.pop();
            }
            continue;
        }

        if let Some(hunk) = current.as_mut() {
            if hunk.needs_more() {
                let (kind, text) = match raw.chars().next() {
                    Some(' ') => (LineKind::Context, &raw[1..]),
                    Some('-') => (LineKind::Remove, &raw[1..]),
                    Some('+') => (LineKind::Add, &raw[1..]),
                    // Some editors strip the lone space of an empty context line.
                    Some('\n') => (LineKind::Context, raw),
                    _ => {
                        return Err(PatchError::Malformed(format!(
                            "unexpected line inside hunk: {:?}",
                            raw.trim_end()
                        )))
                    }
                };
                hunk.lines.push(HunkLine {
                    kind,
                    text: text.to_owned(),
                });
                continue;
            }
        }

        if let Some(name) = raw.strip_prefix("--- ") {
            patch.old_name = Some(name.trim_end().to_owned());
        } else if let Some(name) = raw.strip_prefix("+++ ") {
            patch.new_name = Some(name.trim_end().to_owned());
        } else if raw.starts_with("@@") {
            if let Some(done) = current.take() {
                patch.hunks.push(done);
            }
            current = Some(parse_header(raw)?);
        }
        // Anything else (`diff --git`, `index …`, blank lines) is preamble.
    }

    if let Some(done) = current.take() {
        if done.needs_more() {
            return Err(PatchError::Malformed("truncated hunk".into()));
        }
        patch.hunks.push(done);
    }

    if patch.hunks.is_empty() {
        return Err(PatchError::Malformed("no hunks found".into()));
    }
    Ok(patch)
}

fn parse_header(line: &str) -> Result<Hunk, PatchError> {
    let malformed = || PatchError::Malformed(format!("bad hunk header: {:?}", line.trim_end()));

    let body = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(malformed)?;
    let mut parts = body.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(malformed)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(malformed)?;

    let range = |spec: &str| -> Result<(usize, usize), PatchError> {
        match spec.split_once(',') {
            Some((start, len)) => Ok((
                start.parse().map_err(|_| malformed())?,
                len.parse().map_err(|_| malformed())?,
            )),
            None => Ok((spec.parse().map_err(|_| malformed())?, 1)),
        }
    };

    let (old_start, old_len) = range(old)?;
    let (new_start, new_len) = range(new)?;
    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    })
}

impl Patch {
    fn apply(&self, original: &str) -> Result<String, PatchError> {
        let lines: Vec<&str> = original.split_inclusive('\n').collect();
        let mut out = String::with_capacity(original.len());
        let mut cursor = 0usize;

        for (idx, hunk) in self.hunks.iter().enumerate() {
            let start = hunk.anchor();
            if start < cursor || start > lines.len() {
                return Err(PatchError::Mismatch {
                    hunk: idx + 1,
                    line: start + 1,
                });
            }
            lines[cursor..start].iter().for_each(|l| out.push_str(l));

            let mut pos = start;
            for line in &hunk.lines {
                match line.kind {
                    LineKind::Context | LineKind::Remove => {
                        if lines.get(pos).copied() != Some(line.text.as_str()) {
                            return Err(PatchError::Mismatch {
                                hunk: idx + 1,
                                line: pos + 1,
                            });
                        }
                        if line.kind == LineKind::Context {
                            out.push_str(&line.text);
                        }
                        pos += 1;
                    }
                    LineKind::Add => out.push_str(&line.text),
                }
            }
            cursor = pos;
        }

        lines[cursor..].iter().for_each(|l| out.push_str(l));
        Ok(out)
    }

    fn reversed(&self) -> Patch {
        let hunks = self
            .hunks
            .iter()
            .map(|h| Hunk {
                old_start: h.new_start,
                old_len: h.new_len,
                new_start: h.old_start,
                new_len: h.old_len,
                lines: h
                    .lines
                    .iter()
                    .map(|l| HunkLine {
                        kind: match l.kind {
                            LineKind::Remove => LineKind::Add,
                            LineKind::Add => LineKind::Remove,
                            LineKind::Context => LineKind::Context,
                        },
                        text: l.text.clone(),
                    })
                    .collect(),
            })
            .collect();

        Patch {
            old_name: self.new_name.clone(),
            new_name: self.old_name.clone(),
            hunks,
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let (Some(old), Some(new)) = (&self.old_name, &self.new_name) {
            out.push_str(&format!("--- {old}\n+++ {new}\n"));
        }
        for hunk in &self.hunks {
            out.push_str(&format!(
                "@@ -{} +{} @@\n",
                render_range(hunk.old_start, hunk.old_len),
                render_range(hunk.new_start, hunk.new_len)
            ));
            for line in &hunk.lines {
                out.push(line.kind.marker());
                out.push_str(&line.text);
                if !line.text.ends_with('\n') {
                    out.push('\n');
                    out.push_str(NO_NEWLINE_MARKER);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn render_range(start: usize, len: usize) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{start},{len}")
    }
}
