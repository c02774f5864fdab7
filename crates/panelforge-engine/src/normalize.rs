use std::collections::BTreeSet;

use panelforge_contracts::script::{Scene, StoryboardScript};
use serde_json::Value;

use crate::error::ForgeError;
use crate::recovery::recover_json;

// Chat envelopes are unwrapped at most this many times.
const MAX_ENVELOPE_DEPTH: usize = 2;

const TITLE_KEYS: &[&str] = &["story_title", "title", "comic_title"];
const SCENE_INDEX_KEYS: &[&str] = &["scene_number", "scene", "index"];
const PANEL_INDEX_KEYS: &[&str] = &["panel_number", "panel", "index"];

/// The upstream shapes a storyboard can arrive in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpstreamShape<'a> {
    ChatEnvelope(&'a str),
    Storyboard(&'a [Value]),
    Panels(&'a [Value]),
}

impl<'a> UpstreamShape<'a> {
    pub fn classify(value: &'a Value) -> Option<Self> {
        if let Some(content) = chat_content(value) {
            return Some(Self::ChatEnvelope(content));
        }
        if let Some(scenes) = value.get("storyboard").and_then(Value::as_array) {
            return Some(Self::Storyboard(scenes));
        }
        if let Some(panels) = value.get("panels").and_then(Value::as_array) {
            return Some(Self::Panels(panels));
        }
        None
    }
}

pub fn normalize_text(text: &str) -> Result<StoryboardScript, ForgeError> {
    let value = recover_json(text)?;
    normalize_at_depth(&value, 0)
}

pub fn normalize_value(value: &Value) -> Result<StoryboardScript, ForgeError> {
    normalize_at_depth(value, 0)
}

fn normalize_at_depth(value: &Value, depth: usize) -> Result<StoryboardScript, ForgeError> {
    let shape = UpstreamShape::classify(value).ok_or_else(|| {
        ForgeError::UnrecognizedSchema(
            "expected a chat completion, a storyboard array or a panels array".to_string(),
        )
    })?;
    let scenes = match shape {
        UpstreamShape::ChatEnvelope(content) => {
            if depth >= MAX_ENVELOPE_DEPTH {
                return Err(ForgeError::UnrecognizedSchema(
                    "chat completion envelopes nested too deeply".to_string(),
                ));
            }
            let inner = recover_json(content)?;
            return normalize_at_depth(&inner, depth + 1);
        }
        UpstreamShape::Storyboard(entries) => entries
            .iter()
            .enumerate()
            .map(|(position, entry)| scene_from_storyboard_entry(position, entry))
            .collect::<Result<Vec<_>, _>>()?,
        UpstreamShape::Panels(panels) => panels
            .iter()
            .enumerate()
            .map(|(position, panel)| scene_from_panel(position, panel))
            .collect::<Result<Vec<_>, _>>()?,
    };
    validate_scene_numbers(&scenes)?;
    Ok(StoryboardScript {
        title: first_text(value, TITLE_KEYS).unwrap_or_default(),
        storyboard: scenes,
    })
}

fn chat_content(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

fn scene_from_storyboard_entry(position: usize, entry: &Value) -> Result<Scene, ForgeError> {
    let label = format!("scene at position {}", position + 1);
    let scene_number = index_field(entry, SCENE_INDEX_KEYS)
        .ok_or_else(|| ForgeError::InvalidScene(format!("{label} has no valid scene_number")))?;
    let description = first_text(entry, &["description"])
        .ok_or_else(|| ForgeError::InvalidScene(format!("scene {scene_number} has no description")))?;
    let visual_elements = first_text(entry, &["visual_elements", "visual_element"]).ok_or_else(|| {
        ForgeError::InvalidScene(format!("scene {scene_number} has no visual_elements"))
    })?;
    Ok(Scene {
        scene_number,
        description,
        visual_elements,
    })
}

fn scene_from_panel(position: usize, panel: &Value) -> Result<Scene, ForgeError> {
    let label = format!("panel at position {}", position + 1);
    let scene_number = index_field(panel, PANEL_INDEX_KEYS)
        .ok_or_else(|| ForgeError::InvalidScene(format!("{label} has no valid panel_number")))?;
    let frames = panel_frames(panel);
    let description = frames
        .first()
        .and_then(|frame| first_text(frame, &["visual_description"]))
        .ok_or_else(|| {
            ForgeError::InvalidScene(format!(
                "panel {scene_number} has no frame with a visual_description"
            ))
        })?;
    let visual_elements = describe_frames(&frames);
    Ok(Scene {
        scene_number,
        description,
        visual_elements,
    })
}

pub(crate) fn panel_number(panel: &Value) -> Option<u32> {
    index_field(panel, PANEL_INDEX_KEYS)
}

/// A panel without a `frames` array is treated as its own single frame.
pub(crate) fn panel_frames(panel: &Value) -> Vec<&Value> {
    match panel.get("frames").and_then(Value::as_array) {
        Some(frames) => frames.iter().collect(),
        None => vec![panel],
    }
}

pub(crate) fn describe_frames(frames: &[&Value]) -> String {
    let described: Vec<String> = frames
        .iter()
        .map(|frame| describe_frame(frame))
        .filter(|text| !text.is_empty())
        .collect();
    if described.len() <= 1 {
        return described.into_iter().next().unwrap_or_default();
    }
    described
        .iter()
        .enumerate()
        .map(|(idx, text)| format!("Frame {}: {text}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_frame(frame: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(visual) = first_text(frame, &["visual_description"]) {
        parts.push(visual);
    }
    for (key, label) in [
        ("dialogue", "Dialogue"),
        ("sound_effects", "SFX"),
        ("style_notes", "Style"),
    ] {
        if let Some(text) = first_text(frame, &[key]) {
            parts.push(format!("{label}: {text}"));
        }
    }
    parts.join("; ")
}

fn validate_scene_numbers(scenes: &[Scene]) -> Result<(), ForgeError> {
    if scenes.is_empty() {
        return Err(ForgeError::InvalidScene("storyboard contains no scenes".to_string()));
    }
    let mut seen = BTreeSet::new();
    for scene in scenes {
        if !seen.insert(scene.scene_number) {
            return Err(ForgeError::InvalidScene(format!(
                "duplicate scene number {}",
                scene.scene_number
            )));
        }
    }
    Ok(())
}

fn index_field(value: &Value, keys: &[&str]) -> Option<u32> {
    let raw = keys.iter().find_map(|key| value.get(*key))?;
    let index = match raw {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && *float >= 0.0)
                .map(|float| float as u64)
        })?,
        Value::String(text) => text.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(index).ok().filter(|index| *index > 0)
}

pub(crate) fn first_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(text_of)
}

// Models sometimes answer with lists or `{speaker, text}` objects where prose
// was asked for; flatten them rather than rejecting the scene.
pub(crate) fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(text_of)
            .collect::<Vec<_>>()
            .join(" / "),
        Value::Object(map) => {
            let line = ["text", "line", "content", "description"]
                .iter()
                .find_map(|key| map.get(*key).and_then(text_of))?;
            match map.get("speaker").or_else(|| map.get("character")).and_then(text_of) {
                Some(speaker) => format!("{speaker}: {line}"),
                None => line,
            }
        }
        Value::Bool(_) | Value::Null => return None,
    };
    Some(text).filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{normalize_text, normalize_value, UpstreamShape};
    use crate::error::ForgeError;

    #[test]
    fn single_panel_maps_to_one_scene() -> anyhow::Result<()> {
        let script = normalize_value(&json!({
            "panels": [{"panel_number": 1, "frames": [{"visual_description": "hero jumps"}]}]
        }))?;
        assert_eq!(script.storyboard.len(), 1);
        assert_eq!(script.storyboard[0].scene_number, 1);
        assert_eq!(script.storyboard[0].description, "hero jumps");
        assert_eq!(script.storyboard[0].visual_elements, "hero jumps");
        Ok(())
    }

    #[test]
    fn panel_frames_are_concatenated() -> anyhow::Result<()> {
        let script = normalize_value(&json!({
            "title": "Rooftops",
            "panels": [{
                "panel_number": "2",
                "frames": [
                    {"visual_description": "hero on a ledge", "dialogue": [{"speaker": "Hero", "text": "Now!"}]},
                    {"visual_description": "hero leaps", "sound_effects": "WHOOSH", "style_notes": "speed lines"}
                ]
            }]
        }))?;
        let scene = &script.storyboard[0];
        assert_eq!(script.title, "Rooftops");
        assert_eq!(scene.scene_number, 2);
        assert_eq!(scene.description, "hero on a ledge");
        assert_eq!(
            scene.visual_elements,
            "Frame 1: hero on a ledge; Dialogue: Hero: Now!\nFrame 2: hero leaps; SFX: WHOOSH; Style: speed lines"
        );
        Ok(())
    }

    #[test]
    fn canonical_storyboard_is_validated() -> anyhow::Result<()> {
        let script = normalize_value(&json!({
            "story_title": "Night Market",
            "storyboard": [
                {"scene_number": 1, "description": "stalls open", "visual_elements": "lanterns"},
                {"scene_number": "2", "description": "rain", "visual_elements": ["umbrellas", "neon"]}
            ]
        }))?;
        assert_eq!(script.title, "Night Market");
        assert_eq!(script.storyboard[1].scene_number, 2);
        assert_eq!(script.storyboard[1].visual_elements, "umbrellas / neon");
        Ok(())
    }

    #[test]
    fn missing_fields_reject_every_schema() {
        let cases = [
            json!({"storyboard": [{"scene_number": 1, "description": "a"}]}),
            json!({"storyboard": [{"description": "a", "visual_elements": "b"}]}),
            json!({"storyboard": [{"scene_number": 1, "description": "  ", "visual_elements": "b"}]}),
            json!({"storyboard": [{"scene_number": 0, "description": "a", "visual_elements": "b"}]}),
            json!({"panels": [{"panel_number": 1, "frames": [{"dialogue": "hi"}]}]}),
            json!({"panels": [{"frames": [{"visual_description": "x"}]}]}),
            json!({"panels": [{"panel_number": 1, "frames": []}]}),
        ];
        for case in cases {
            let result = normalize_value(&case);
            assert!(
                matches!(result, Err(ForgeError::InvalidScene(_))),
                "{case} should be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn duplicate_and_empty_storyboards_are_rejected() {
        let duplicate = json!({"storyboard": [
            {"scene_number": 1, "description": "a", "visual_elements": "b"},
            {"scene_number": "1", "description": "c", "visual_elements": "d"}
        ]});
        assert!(matches!(normalize_value(&duplicate), Err(ForgeError::InvalidScene(_))));
        assert!(matches!(
            normalize_value(&json!({"storyboard": []})),
            Err(ForgeError::InvalidScene(_))
        ));
    }

    #[test]
    fn chat_envelope_with_fenced_truncated_content() -> anyhow::Result<()> {
        let content = "Here is the script:\n```json\n{\"story_title\": \"Tides\", \"storyboard\": [{\"scene_number\": 1, \"description\": \"low tide\", \"visual_elements\": \"crabs\"}";
        let envelope = json!({"choices": [{"message": {"role": "assistant", "content": content}}]});
        let script = normalize_text(&envelope.to_string())?;
        assert_eq!(script.title, "Tides");
        assert_eq!(script.storyboard[0].visual_elements, "crabs");
        Ok(())
    }

    #[test]
    fn unknown_shapes_are_unrecognized() {
        assert!(matches!(
            normalize_value(&json!({"scenes": []})),
            Err(ForgeError::UnrecognizedSchema(_))
        ));
        assert!(matches!(
            normalize_value(&json!([1, 2])),
            Err(ForgeError::UnrecognizedSchema(_))
        ));
        assert!(UpstreamShape::classify(&json!({"choices": []})).is_none());
    }

    #[test]
    fn envelope_recursion_is_bounded() {
        let mut value = json!({"storyboard": [{"scene_number": 1, "description": "a", "visual_elements": "b"}]});
        for _ in 0..3 {
            value = json!({"choices": [{"message": {"content": value.to_string()}}]});
        }
        assert!(matches!(
            normalize_value(&value),
            Err(ForgeError::UnrecognizedSchema(_))
        ));
    }
}
