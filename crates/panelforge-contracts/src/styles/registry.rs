use indexmap::IndexMap;

pub const DEFAULT_STYLE: &str = "comic_american";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComicStyle {
    pub name: String,
    pub label: String,
    pub system_prompt: String,
}

impl ComicStyle {
    /// Prefixes the style prompt the way every generation request expects it:
    /// `"<style prompt>, <prompt>"`.
    pub fn apply(&self, prompt: &str) -> String {
        let system = self.system_prompt.trim();
        let prompt = prompt.trim();
        if system.is_empty() {
            return prompt.to_string();
        }
        format!("{system}, {prompt}")
    }
}

#[derive(Debug, Clone)]
pub struct StyleRegistry {
    styles: IndexMap<String, ComicStyle>,
}

impl StyleRegistry {
    pub fn new(styles: Option<IndexMap<String, ComicStyle>>) -> Self {
        Self {
            styles: styles.unwrap_or_else(builtin_styles),
        }
    }

    /// Builtin styles with prompt files layered on top. A file named after a
    /// builtin replaces its prompt; any other name adds a new style.
    pub fn with_prompt_overrides(
        overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut styles = builtin_styles();
        for (name, prompt) in overrides {
            let name = name.trim().to_string();
            if name.is_empty() || prompt.trim().is_empty() {
                continue;
            }
            match styles.get_mut(&name) {
                Some(existing) => existing.system_prompt = prompt.trim().to_string(),
                None => {
                    styles.insert(
                        name.clone(),
                        ComicStyle {
                            label: name.replace('_', " "),
                            name,
                            system_prompt: prompt.trim().to_string(),
                        },
                    );
                }
            }
        }
        Self { styles }
    }

    pub fn get(&self, name: &str) -> Option<&ComicStyle> {
        self.styles.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ComicStyle> {
        self.styles.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.styles.keys().cloned().collect()
    }

    pub fn fallback(&self) -> Option<&ComicStyle> {
        self.styles
            .get(DEFAULT_STYLE)
            .or_else(|| self.styles.values().next())
    }
}

fn builtin_styles() -> IndexMap<String, ComicStyle> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, label: &str, system_prompt: &str| {
        map.insert(
            name.to_string(),
            ComicStyle {
                name: name.to_string(),
                label: label.to_string(),
                system_prompt: system_prompt.to_string(),
            },
        );
    };

    insert(
        "comic_american",
        "American comic",
        "American comic book art, bold ink outlines, dynamic foreshortening, halftone shading, saturated flat colors, dramatic lighting, single comic panel",
    );
    insert(
        "comic_japanese",
        "Japanese manga",
        "Japanese manga style, clean black and white line art, screentone shading, expressive eyes, speed lines, cinematic panel composition",
    );
    insert(
        "comic_chinese",
        "Chinese ink comic",
        "Chinese ink wash comic style, flowing brush strokes, muted earth palette, xuan paper texture, elegant negative space",
    );
    insert(
        "comic_european",
        "European ligne claire",
        "European ligne claire comic style, uniform clean outlines, flat bright colors, detailed backgrounds, no hatching",
    );
    insert(
        "comic_webtoon",
        "Webtoon",
        "Korean webtoon style, soft cel shading, vibrant digital colors, vertical scroll composition, clean character designs",
    );

    map
}
