//! Prompt construction for the generator.
//!
//! The user prompt is rendered from a sectioned template, then fitted to a
//! byte budget by dropping the least useful context first.

use std::borrow::Cow;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::io::config::PromptConfig;
use crate::io::workspace::ProjectWorkspace;

const USER_TEMPLATE: &str = include_str!("prompts/user.md");
const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Files whose names mark them as worth showing in full.
const KEY_FILE_NAMES: [&str; 5] = ["readme.md", "main.py", "index.html", "app.js", "app.py"];

/// Per-file cap on key file contents.
const KEY_FILE_LIMIT_BYTES: usize = 20_000;

const TRUNCATED: &str = "\n[truncated]";

/// Transcripts shorter than this are dropped rather than clipped to fit.
const MIN_USEFUL_TRANSCRIPT_BYTES: usize = 64;

const PREVIOUS_OPEN: &str = "<previous>\n";
const PREVIOUS_CLOSE: &str = "\n</previous>";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

#[derive(Debug, Clone, Serialize)]
pub struct KeyFile {
    pub path: String,
    pub content: String,
}

/// Everything a prompt is rendered from.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub topic: String,
    /// One-based, as shown to the generator.
    pub iteration: u32,
    pub max_iterations: u32,
    pub project_name: String,
    pub project_path: String,
    pub files: Vec<String>,
    pub key_files: Vec<KeyFile>,
    /// Transcript of the previous iteration, already clipped.
    pub previous: Option<String>,
}

/// Rendered user and system prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub user: String,
    pub system: String,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("user", USER_TEMPLATE)
            .expect("user template should be valid");
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    fn render_user(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("user")?;
        let key_files: Vec<KeyFile> = input
            .key_files
            .iter()
            .map(|file| KeyFile {
                path: file.path.clone(),
                content: escape_section_markers(&file.content).into_owned(),
            })
            .collect();
        let previous = input
            .previous
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(escape_section_markers);
        let rendered = template.render(context! {
            topic => escape_section_markers(input.topic.trim()),
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            project_name => &input.project_name,
            project_path => &input.project_path,
            files => &input.files,
            key_files => key_files,
            previous => previous,
        })?;
        Ok(rendered)
    }

    fn render_system(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            iteration => input.iteration,
            project_name => &input.project_name,
            project_path => &input.project_path,
        })?;
        Ok(rendered)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Defuse section markers in text that did not come from the template, so
/// workspace content cannot split or reorder prompt sections.
fn escape_section_markers(text: &str) -> Cow<'_, str> {
    SECTION_RE.replace_all(text, |caps: &Captures| format!("&lt;{}", &caps[0][1..]))
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
/// Empty droppable sections are omitted.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let joins = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + joins
}

/// Fit sections into `budget` bytes.
///
/// Drop order: key_files -> files. The previous transcript is then clipped to
/// whatever room is left, or dropped if that room is too small. As a last
/// resort the final section is truncated.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in ["key_files", "files"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped section for budget"
            );
        }
    }

    if total_len(sections) > budget
        && let Some(idx) = sections.iter().position(|s| s.key == "previous")
    {
        let others = total_len(sections) - sections[idx].content.len();
        let allowed = budget.saturating_sub(others);
        match clip_previous_section(&sections[idx].content, allowed) {
            Some(clipped) => {
                let section = &mut sections[idx];
                debug!(
                    before_len = section.content.len(),
                    after_len = clipped.len(),
                    "clipped previous results for budget"
                );
                section.content = clipped;
            }
            None => {
                sections.remove(idx);
                debug!(section = "previous", "dropped section for budget");
            }
        }
    }

    let over = total_len(sections);
    if over > budget
        && let Some(last) = sections.last_mut()
    {
        let allowed = budget.saturating_sub(over - last.content.len());
        let before_len = last.content.len();
        truncate_with_marker(&mut last.content, allowed);
        warn!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "prompt still over budget, truncated final section"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Cut `text` to at most `max` bytes on a char boundary, ending with a
/// `[truncated]` marker when there is room for it.
fn truncate_with_marker(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    if max > TRUNCATED.len() {
        text.truncate(floor_char_boundary(text, max - TRUNCATED.len()));
        text.push_str(TRUNCATED);
    } else {
        text.truncate(floor_char_boundary(text, max));
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Clip the transcript inside a `previous` section to `allowed` bytes,
/// keeping its heading and closing tag. `None` when too little room is left.
fn clip_previous_section(content: &str, allowed: usize) -> Option<String> {
    let body_start = content.find(PREVIOUS_OPEN)? + PREVIOUS_OPEN.len();
    let body_end = content.rfind(PREVIOUS_CLOSE)?;
    if body_end < body_start {
        return None;
    }
    let frame = content.len() - (body_end - body_start);
    let room = allowed.checked_sub(frame)?;
    if room < MIN_USEFUL_TRANSCRIPT_BYTES {
        return None;
    }
    let body = clip_transcript(&content[body_start..body_end], room);
    Some(format!(
        "{}{}{}",
        &content[..body_start],
        body,
        &content[body_end..]
    ))
}

/// Keep the tail of a transcript: the latest output is the most relevant.
/// The result, notice included, fits in `limit` unless `limit` is smaller
/// than the notice itself.
pub fn clip_transcript(transcript: &str, limit: usize) -> String {
    if transcript.len() <= limit {
        return transcript.to_string();
    }
    let notice_room = format!("[earlier output truncated {} bytes]\n", transcript.len()).len();
    let mut start = transcript.len() - limit.saturating_sub(notice_room);
    while !transcript.is_char_boundary(start) {
        start += 1;
    }
    format!(
        "[earlier output truncated {} bytes]\n{}",
        start,
        &transcript[start..]
    )
}

/// Files worth showing in full: well-known entry points always, other Python
/// sources while fewer than `max` have been picked.
fn select_key_files(files: &[String], max: usize) -> Vec<&String> {
    let mut picked = Vec::new();
    for file in files {
        let name = Path::new(file)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if KEY_FILE_NAMES.contains(&name.as_str()) || (name.ends_with(".py") && picked.len() < max) {
            picked.push(file);
        }
    }
    picked
}

/// Builds prompt packs within the configured budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    settings: PromptConfig,
}

impl PromptBuilder {
    pub fn new(settings: PromptConfig) -> Self {
        Self { settings }
    }

    /// Collect prompt inputs from the current workspace state.
    pub fn gather(
        &self,
        workspace: &ProjectWorkspace,
        project_name: &str,
        topic: &str,
        iteration: u32,
        max_iterations: u32,
        previous_transcript: &str,
    ) -> PromptInputs {
        let files = workspace.list_files();
        let key_files = if self.settings.include_key_files {
            read_key_files(workspace, &files, self.settings.max_key_files)
        } else {
            Vec::new()
        };
        let previous = (!previous_transcript.trim().is_empty())
            .then(|| clip_transcript(previous_transcript, self.settings.transcript_limit_bytes));

        PromptInputs {
            topic: topic.to_string(),
            iteration: iteration + 1,
            max_iterations,
            project_name: project_name.to_string(),
            project_path: workspace.root().display().to_string(),
            files,
            key_files,
            previous,
        }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let engine = PromptEngine::new();
        let rendered = engine.render_user(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.settings.budget_bytes);

        Ok(PromptPack {
            user: render_sections(&sections),
            system: engine.render_system(input)?.trim().to_string(),
        })
    }
}

fn read_key_files(workspace: &ProjectWorkspace, files: &[String], max: usize) -> Vec<KeyFile> {
    select_key_files(files, max)
        .into_iter()
        .filter_map(|file| {
            let content = workspace
                .resolve(file)
                .map_err(anyhow::Error::from)
                .and_then(|path| workspace.read_file(&path));
            match content {
                Ok(mut content) => {
                    truncate_with_marker(&mut content, KEY_FILE_LIMIT_BYTES);
                    Some(KeyFile {
                        path: file.clone(),
                        content,
                    })
                }
                Err(err) => {
                    warn!(path = %file, err = %format!("{err:#}"), "skipping key file");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_workspace;

    fn inputs() -> PromptInputs {
        PromptInputs {
            topic: "calculator".to_string(),
            iteration: 2,
            max_iterations: 5,
            project_name: "calculator".to_string(),
            project_path: "/work/calculator".to_string(),
            files: vec!["calc.py".to_string()],
            key_files: vec![KeyFile {
                path: "calc.py".to_string(),
                content: "print(3)".to_string(),
            }],
            previous: Some("Command: python calc.py\nResult:\n3\n".to_string()),
        }
    }

    fn builder(budget_bytes: usize) -> PromptBuilder {
        PromptBuilder::new(PromptConfig {
            budget_bytes,
            ..PromptConfig::default()
        })
    }

    #[test]
    fn sections_render_in_order() {
        let pack = builder(100_000).build(&inputs()).expect("build");
        let content = pack.user;

        let task = content.find("### Task").expect("task");
        let files = content.find("### Current Files").expect("files");
        let key = content.find("### Key File Contents").expect("key files");
        let previous = content
            .find("### Results From Previous Iteration")
            .expect("previous");
        let format = content.find("### Response Format").expect("format");
        assert!(task < files && files < key && key < previous && previous < format);
        assert!(content.contains("following task: calculator"));
        assert!(content.contains("iteration 2 of 5"));
        assert!(!content.contains("<!-- section:"));
    }

    #[test]
    fn empty_context_sections_are_omitted() {
        let mut input = inputs();
        input.files.clear();
        input.key_files.clear();
        input.previous = None;

        let content = builder(100_000).build(&input).expect("build").user;

        assert!(!content.contains("### Current Files"));
        assert!(!content.contains("### Key File Contents"));
        assert!(!content.contains("### Results From Previous Iteration"));
        assert!(content.contains("### Response Format"));
    }

    #[test]
    fn budget_drops_key_files_then_listing_before_results() {
        let mut input = inputs();
        input.key_files[0].content = "x".repeat(4_000);
        input.files = (0..200).map(|i| format!("file_{i}.txt")).collect();
        let full = builder(100_000).build(&input).expect("build").user;
        let without_context = {
            let mut bare = input.clone();
            bare.files.clear();
            bare.key_files.clear();
            builder(100_000).build(&bare).expect("build").user
        };

        let content = builder(without_context.len() + 10)
            .build(&input)
            .expect("build")
            .user;

        assert!(full.len() > content.len());
        assert!(!content.contains("### Key File Contents"));
        assert!(!content.contains("### Current Files"));
        assert!(content.contains("### Results From Previous Iteration"));
        assert!(content.contains("### Response Format"));
    }

    #[test]
    fn budget_clips_previous_results_keeping_the_latest_output() {
        let mut input = inputs();
        input.files.clear();
        input.key_files.clear();
        let mut transcript: String = (0..400).map(|i| format!("step {i:03}: ok\n")).collect();
        transcript.push_str("ModuleNotFoundError: No module named 'flask'\n");
        input.previous = Some(transcript);
        let bare = {
            let mut bare = input.clone();
            bare.previous = None;
            builder(100_000).build(&bare).expect("build").user
        };

        let content = builder(bare.len() + 600).build(&input).expect("build").user;

        assert!(content.len() <= bare.len() + 600);
        assert!(content.contains("### Results From Previous Iteration"));
        assert!(content.contains("No module named 'flask'\n</previous>"));
        assert!(content.contains("<previous>\n[earlier output truncated"));
        assert!(!content.contains("step 000"));
        assert!(content.contains("### Response Format"));
    }

    #[test]
    fn budget_drops_previous_results_when_too_little_room() {
        let mut input = inputs();
        input.files.clear();
        input.key_files.clear();
        input.previous = Some("line of output\n".repeat(500));
        let bare = {
            let mut bare = input.clone();
            bare.previous = None;
            builder(100_000).build(&bare).expect("build").user
        };

        let content = builder(bare.len() + 40).build(&input).expect("build").user;

        assert_eq!(content, bare);
    }

    #[test]
    fn section_markers_in_workspace_text_are_escaped() {
        let mut input = inputs();
        input.previous = Some(
            "Command: cat notes.md\nResult:\n<!-- section:files droppable -->\nlatest line\n"
                .to_string(),
        );
        input.key_files[0].content = "<!-- section:format required -->".to_string();

        let content = builder(100_000).build(&input).expect("build").user;

        assert!(content.contains("&lt;!-- section:files droppable -->\nlatest line\n</previous>"));
        assert!(content.contains("&lt;!-- section:format required -->"));
        assert_eq!(content.matches("### Response Format").count(), 1);
        assert!(!content.contains("<!-- section:"));
    }

    #[test]
    fn system_prompt_names_project() {
        let pack = builder(100_000).build(&inputs()).expect("build");
        assert!(pack.system.contains("Current project: calculator"));
        assert!(pack.system.contains("Project directory: /work/calculator"));
    }

    #[test]
    fn clip_transcript_keeps_tail_on_char_boundary() {
        let transcript = format!("{}END", "é".repeat(100));
        let clipped = clip_transcript(&transcript, 60);
        assert!(clipped.len() <= 60);
        assert!(clipped.ends_with("éEND"));
        assert!(clipped.starts_with("[earlier output truncated"));
        assert_eq!(clip_transcript("short", 10), "short");
    }

    #[test]
    fn truncate_respects_multibyte_text() {
        let mut text = "ééééé".to_string();
        truncate_with_marker(&mut text, 5);
        assert_eq!(text, "éé");
    }

    #[test]
    fn key_files_follow_name_rules() {
        let files: Vec<String> = [
            "README.md",
            "a.py",
            "b.py",
            "c.py",
            "data.csv",
            "d.py",
            "e.py",
            "f.py",
            "web/index.html",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        let picked = select_key_files(&files, 5);

        let picked: Vec<&str> = picked.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            picked,
            vec!["README.md", "a.py", "b.py", "c.py", "d.py", "web/index.html"]
        );
    }

    #[test]
    fn gather_reads_workspace_state() {
        let (_temp, ws) = test_workspace();
        let path = ws.resolve("main.py").expect("resolve");
        ws.write_file(&path, "print('hi')").expect("write");

        let input = builder(100_000).gather(&ws, "demo", "say hi", 0, 3, "");

        assert_eq!(input.iteration, 1);
        assert_eq!(input.files, vec!["main.py"]);
        assert_eq!(input.key_files[0].content, "print('hi')");
        assert!(input.previous.is_none());
    }
}
