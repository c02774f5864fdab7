use panelforge_contracts::artifacts::ArtifactSlot;
use panelforge_contracts::script::{Scene, StoryboardScript};
use serde_json::{Map, Value};

use crate::error::ForgeError;
use crate::normalize::{
    describe_frames, first_text, normalize_value, panel_frames, panel_number, text_of, UpstreamShape,
};

/// One image to generate. `prompt` is the unstyled prompt; the style prefix
/// is applied by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub index: usize,
    pub slot: ArtifactSlot,
    pub prompt: String,
    pub description: String,
}

/// Ordered work list for one batch: cover first, then panels in scene order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub title: String,
    pub items: Vec<BatchItem>,
}

impl BatchPlan {
    pub fn from_script(script: &StoryboardScript, include_cover: bool) -> Self {
        let mut scenes: Vec<&Scene> = script.storyboard.iter().collect();
        scenes.sort_by_key(|scene| scene.scene_number);
        let total = scenes.len();

        let mut plan = Self {
            title: script.title.clone(),
            items: Vec::with_capacity(total + 1),
        };
        if include_cover {
            let opening = scenes.first().map(|scene| scene.description.as_str());
            plan.push(
                ArtifactSlot::Cover,
                script_cover_prompt(&script.title, opening),
                format!("Cover: {}", display_title(&script.title)),
            );
        }
        for scene in scenes {
            plan.push(
                ArtifactSlot::Panel(scene.scene_number),
                scene_prompt(scene, total),
                scene.description.clone(),
            );
        }
        plan
    }

    /// Accepts anything the normalizer accepts. A `panels` document keeps its
    /// frame, layout and cover detail in the prompts; other shapes go through
    /// the canonical script.
    pub fn from_document(document: &Value, include_cover: bool) -> Result<Self, ForgeError> {
        let script = normalize_value(document)?;
        // A `storyboard` array wins over `panels` in the normalizer, so the
        // panel detail only applies when the scenes were built from it.
        let Some(UpstreamShape::Panels(panels)) = UpstreamShape::classify(document) else {
            return Ok(Self::from_script(&script, include_cover));
        };

        let mut ordered: Vec<(&Scene, &Value)> = panels
            .iter()
            .filter_map(|panel| {
                let scene = panel_number(panel).and_then(|number| script.scene(number))?;
                Some((scene, panel))
            })
            .collect();
        ordered.sort_by_key(|(scene, _)| scene.scene_number);
        let total = ordered.len();

        let mut plan = Self {
            title: script.title.clone(),
            items: Vec::with_capacity(total + 1),
        };
        if include_cover {
            let cover_fields = document
                .get("cover")
                .and_then(Value::as_object)
                .map(labeled_fields)
                .filter(|fields| !fields.is_empty());
            let prompt = match cover_fields {
                Some(fields) => format!("Comic book cover. {fields}"),
                None => script_cover_prompt(
                    &script.title,
                    ordered.first().map(|(scene, _)| scene.description.as_str()),
                ),
            };
            plan.push(
                ArtifactSlot::Cover,
                prompt,
                format!("Cover: {}", display_title(&script.title)),
            );
        }
        for (scene, panel) in ordered {
            plan.push(
                ArtifactSlot::Panel(scene.scene_number),
                panel_prompt(scene.scene_number, total, panel),
                scene.description.clone(),
            );
        }
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, slot: ArtifactSlot, prompt: String, description: String) {
        self.items.push(BatchItem {
            index: self.items.len(),
            slot,
            prompt,
            description,
        });
    }
}

fn display_title(title: &str) -> &str {
    if title.trim().is_empty() {
        "Untitled"
    } else {
        title.trim()
    }
}

fn script_cover_prompt(title: &str, opening: Option<&str>) -> String {
    let mut prompt = format!("Comic book cover. Title: {}", display_title(title));
    if let Some(opening) = opening.filter(|text| !text.trim().is_empty()) {
        prompt.push_str(&format!(". Story: {}", opening.trim()));
    }
    prompt
}

fn scene_prompt(scene: &Scene, total: usize) -> String {
    format!(
        "Comic panel {} of {}. {}. Visual elements: {}",
        scene.scene_number,
        total,
        scene.description.trim().trim_end_matches('.'),
        scene.visual_elements.trim()
    )
}

fn panel_prompt(number: u32, total: usize, panel: &Value) -> String {
    let frames = panel_frames(panel);
    let layout = match first_text(panel, &["layout", "panel_layout"]) {
        Some(layout) => format!("{layout}, {} frame(s)", frames.len()),
        None => format!("{} frame(s)", frames.len()),
    };
    format!(
        "Comic panel {number} of {total}. Layout: {layout}.\n{}",
        describe_frames(&frames)
    )
}

const COVER_FIELD_ORDER: &[&str] = &[
    "title",
    "subtitle",
    "visual_description",
    "main_characters",
    "setting",
    "style_notes",
    "color_scheme",
];

// {"main_characters": "A, B"} -> "Main characters: A, B"
fn labeled_fields(fields: &Map<String, Value>) -> String {
    let known = COVER_FIELD_ORDER
        .iter()
        .filter_map(|key| fields.get(*key).map(|value| (*key, value)));
    let rest = fields
        .iter()
        .map(|(key, value)| (key.as_str(), value))
        .filter(|(key, _)| !COVER_FIELD_ORDER.contains(key));
    known
        .chain(rest)
        .filter_map(|(key, value)| Some(format!("{}: {}", field_label(key), text_of(value)?)))
        .collect::<Vec<_>>()
        .join("; ")
}

fn field_label(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
