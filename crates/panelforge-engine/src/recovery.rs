//! Heuristic recovery of JSON values from unreliable model output.
//!
//! Chat models wrap JSON in prose, fence it in markdown, or stop mid-document
//! when they hit a token limit. [`recover_json`] tries, in order: a direct
//! parse, a bracket completion of the whole text, then the same two steps on
//! every fenced block and on the first top-level `{...}` span.

use serde_json::Value;

use crate::error::{truncate_text, ForgeError};

const FENCE: &str = "```";
const PREVIEW_CHARS: usize = 160;

pub fn recover_json(text: &str) -> Result<Value, ForgeError> {
    if let Some(value) = repair_json(text) {
        return Ok(value);
    }
    for candidate in extraction_candidates(text) {
        if let Some(value) = repair_json(candidate) {
            return Ok(value);
        }
    }
    Err(ForgeError::MalformedContent(format!(
        "no JSON value could be recovered from: {}",
        truncate_text(text.trim(), PREVIEW_CHARS)
    )))
}

/// Direct parse, falling back to appending the missing closers.
///
/// Returns `None` when the brackets already balance (completion cannot help)
/// or when the completed text still fails to parse.
pub fn repair_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let completed = complete_brackets(trimmed)?;
    serde_json::from_str::<Value>(&completed).ok()
}

/// Appends whatever closing characters the text is missing, or `None` when
/// nothing is missing.
pub fn complete_brackets(text: &str) -> Option<String> {
    let scan = BracketScan::of(text);
    if !scan.has_deficit() {
        return None;
    }

    let mut completed = text.trim_end().to_string();
    if scan.in_string {
        completed.push('"');
    } else {
        if completed.ends_with(',') {
            completed.pop();
        }
        if completed.ends_with(':') {
            completed.push_str("null");
        }
    }

    if scan.mismatched {
        completed.extend(std::iter::repeat(']').take(scan.bracket_deficit()));
        completed.extend(std::iter::repeat('}').take(scan.brace_deficit()));
    } else {
        completed.extend(scan.pending.iter().rev());
    }
    Some(completed)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BracketScan {
    pub open_braces: usize,
    pub close_braces: usize,
    pub open_brackets: usize,
    pub close_brackets: usize,
    pub in_string: bool,
    mismatched: bool,
    pending: Vec<char>,
}

impl BracketScan {
    /// Counts structural brackets, skipping string literals and escapes.
    pub fn of(text: &str) -> Self {
        let mut scan = Self::default();
        let mut escaped = false;
        for ch in text.chars() {
            if scan.in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => scan.in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => scan.in_string = true,
                '{' => {
                    scan.open_braces += 1;
                    scan.pending.push('}');
                }
                '[' => {
                    scan.open_brackets += 1;
                    scan.pending.push(']');
                }
                '}' => {
                    scan.close_braces += 1;
                    scan.close(ch);
                }
                ']' => {
                    scan.close_brackets += 1;
                    scan.close(ch);
                }
                _ => {}
            }
        }
        scan
    }

    fn close(&mut self, closer: char) {
        if self.pending.last() == Some(&closer) {
            self.pending.pop();
        } else {
            self.mismatched = true;
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.open_braces == self.close_braces && self.open_brackets == self.close_brackets
    }

    pub fn brace_deficit(&self) -> usize {
        self.open_braces.saturating_sub(self.close_braces)
    }

    pub fn bracket_deficit(&self) -> usize {
        self.open_brackets.saturating_sub(self.close_brackets)
    }

    pub fn has_deficit(&self) -> bool {
        self.brace_deficit() > 0 || self.bracket_deficit() > 0
    }
}

/// Fenced code blocks first, then the first top-level object span.
fn extraction_candidates(text: &str) -> Vec<&str> {
    let mut candidates = fenced_blocks(text);
    if let Some(span) = first_object_span(text) {
        if !candidates.contains(&span) {
            candidates.push(span);
        }
    }
    candidates
}

// An unterminated fence runs to the end of the text.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after = &rest[open + FENCE.len()..];
        let tag_len = after
            .find(|ch: char| !ch.is_ascii_alphanumeric())
            .unwrap_or(after.len());
        let body = &after[tag_len..];
        match body.find(FENCE) {
            Some(close) => {
                blocks.push(body[..close].trim());
                rest = &body[close + FENCE.len()..];
            }
            None => {
                blocks.push(body.trim());
                break;
            }
        }
    }
    blocks.retain(|block| !block.is_empty());
    blocks
}

fn first_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Some(&text[start..])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{complete_brackets, recover_json, repair_json, BracketScan};
    use crate::error::ForgeError;

    #[test]
    fn valid_json_parses_directly() -> anyhow::Result<()> {
        assert_eq!(recover_json(" {\"a\": 1} ")?, json!({"a": 1}));
        assert_eq!(recover_json("[1, 2]")?, json!([1, 2]));
        Ok(())
    }

    #[test]
    fn truncated_object_gets_closers_in_nesting_order() -> anyhow::Result<()> {
        assert_eq!(complete_brackets("{\"a\":[1,2").as_deref(), Some("{\"a\":[1,2]}"));
        assert_eq!(recover_json("{\"a\":[1,2")?, json!({"a": [1, 2]}));
        Ok(())
    }

    #[test]
    fn completion_appends_exactly_the_deficit() {
        let text = "{\"s\":[{\"n\":1},{\"n\":[2,3";
        let scan = BracketScan::of(text);
        let completed = complete_brackets(text).unwrap_or_default();
        let added = &completed[text.len()..];
        assert_eq!(added.matches('}').count(), scan.brace_deficit());
        assert_eq!(added.matches(']').count(), scan.bracket_deficit());
        assert!(BracketScan::of(&completed).is_balanced());
    }

    #[test]
    fn brackets_inside_strings_are_ignored() -> anyhow::Result<()> {
        let scan = BracketScan::of(r#"{"a":"}{[","b":"say \"]\""}"#);
        assert!(scan.is_balanced());
        assert_eq!(scan.open_braces, 1);

        assert_eq!(
            recover_json(r#"{"a":"x}y","b":[1"#)?,
            json!({"a": "x}y", "b": [1]})
        );
        Ok(())
    }

    #[test]
    fn truncation_inside_string_and_dangling_comma() -> anyhow::Result<()> {
        assert_eq!(recover_json(r#"{"title": "Drag"#)?, json!({"title": "Drag"}));
        assert_eq!(recover_json(r#"{"a":[1,2,"#)?, json!({"a": [1, 2]}));
        assert_eq!(recover_json(r#"{"a":1,"b":"#)?, json!({"a": 1, "b": null}));
        Ok(())
    }

    #[test]
    fn balanced_but_malformed_is_not_repaired() {
        assert!(repair_json(r#"{"a" 1}"#).is_none());
        assert!(complete_brackets(r#"{"a" 1}"#).is_none());
        let err = recover_json(r#"{"a" 1}"#).err();
        assert!(matches!(err, Some(ForgeError::MalformedContent(_))));
    }

    #[test]
    fn object_wrapped_in_prose_is_extracted() -> anyhow::Result<()> {
        let text = "Sure! Here is your storyboard: {\"story_title\": \"x\", \"n\": [1]} Hope it helps.";
        assert_eq!(recover_json(text)?, json!({"story_title": "x", "n": [1]}));
        Ok(())
    }

    #[test]
    fn fenced_block_is_extracted() -> anyhow::Result<()> {
        let text = "Here you go:\n```json\n{\"a\": {\"b\": true}}\n```\nAnything else?";
        assert_eq!(recover_json(text)?, json!({"a": {"b": true}}));

        let bare = "```\n[\"x\", \"y\"]\n```";
        assert_eq!(recover_json(bare)?, json!(["x", "y"]));
        Ok(())
    }

    #[test]
    fn truncated_fenced_block_is_extracted_and_repaired() -> anyhow::Result<()> {
        let text = "```json\n{\"storyboard\": [{\"scene_number\": 1, \"description\": \"rain";
        assert_eq!(
            recover_json(text)?,
            json!({"storyboard": [{"scene_number": 1, "description": "rain"}]})
        );
        Ok(())
    }

    #[test]
    fn excess_closers_fall_back_to_first_span() -> anyhow::Result<()> {
        assert_eq!(recover_json("{\"a\":1}}")?, json!({"a": 1}));
        Ok(())
    }

    #[test]
    fn empty_and_prose_only_fail() {
        assert!(matches!(recover_json("   "), Err(ForgeError::MalformedContent(_))));
        assert!(matches!(
            recover_json("I cannot help with that."),
            Err(ForgeError::MalformedContent(_))
        ));
    }
}
