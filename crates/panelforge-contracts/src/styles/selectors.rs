use super::registry::{ComicStyle, StyleRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSelection {
    pub style: ComicStyle,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StyleSelector {
    pub registry: StyleRegistry,
}

impl StyleSelector {
    pub fn new(registry: Option<StyleRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| StyleRegistry::new(None)),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<StyleSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let fallback_reason = if let Some(requested_value) = requested {
            if let Some(style) = self.registry.get(requested_value) {
                return Ok(StyleSelection {
                    style: style.clone(),
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            format!("Requested style '{requested_value}' unavailable.")
        } else {
            "No style specified; using default.".to_string()
        };

        let Some(style) = self.registry.fallback().cloned() else {
            return Err("No comic styles configured.".to_string());
        };
        Ok(StyleSelection {
            style,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::StyleSelector;
    use crate::styles::{StyleRegistry, DEFAULT_STYLE};

    #[test]
    fn selector_returns_requested_style() {
        let selection = StyleSelector::new(None)
            .select(Some("comic_webtoon"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.style.name, "comic_webtoon");
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn selector_falls_back_when_requested_style_unknown() {
        let selection = StyleSelector::new(None)
            .select(Some("comic_missing"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.style.name, DEFAULT_STYLE);
        assert_eq!(selection.requested.as_deref(), Some("comic_missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested style 'comic_missing' unavailable.")
        );
    }

    #[test]
    fn selector_blank_request_uses_default_with_explanation() {
        let selection = StyleSelector::new(None)
            .select(Some("  "))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.style.name, DEFAULT_STYLE);
        assert!(selection.requested.is_none());
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No style specified; using default.")
        );
    }

    #[test]
    fn selector_errors_without_styles() {
        let err = StyleSelector::new(Some(StyleRegistry::new(Some(IndexMap::new()))))
            .select(None)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No comic styles configured.");
    }
}
