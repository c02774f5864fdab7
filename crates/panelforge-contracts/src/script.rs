use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_number: u32,
    pub description: String,
    pub visual_elements: String,
}

/// Canonical storyboard shape every upstream schema is normalized into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryboardScript {
    #[serde(rename = "story_title", alias = "title", default)]
    pub title: String,
    pub storyboard: Vec<Scene>,
}

impl StoryboardScript {
    pub fn scene(&self, scene_number: u32) -> Option<&Scene> {
        self.storyboard
            .iter()
            .find(|scene| scene.scene_number == scene_number)
    }

    pub fn len(&self) -> usize {
        self.storyboard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storyboard.is_empty()
    }
}
