use std::sync::LazyLock;

use crate::geom::{AspectRatio, Rgba8};

/// Drawing algorithm selector. Closed set; each kind maps to exactly one
/// planner path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Social,
    Viral,
    Podcast,
    Travel,
    /// Media fills the surface; a draggable username bar and a bottom
    /// caption block are painted over it.
    Freeform,
}

impl LayoutKind {
    /// The four chat-style kinds share one parameterized layout algorithm.
    pub fn is_chat_style(self) -> bool {
        !matches!(self, LayoutKind::Freeform)
    }
}

/// Visual parameters of a template.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TemplateStyle {
    pub background: Rgba8,
    pub text_color: Rgba8,
    /// Body text size in logical layout units.
    pub font_size: f32,
    /// CSS-style weight (400 regular, 700 bold).
    pub font_weight: u16,
    pub layout: LayoutKind,
    pub aspect: AspectRatio,
}

/// A named visual layout configuration. Immutable; selected by id.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub style: TemplateStyle,
}

static REGISTRY: LazyLock<Vec<Template>> = LazyLock::new(|| {
    vec![
        Template {
            id: "social".to_string(),
            name: "Social Post".to_string(),
            style: TemplateStyle {
                background: Rgba8::rgb(255, 255, 255),
                text_color: Rgba8::rgb(0, 0, 0),
                font_size: 16.0,
                font_weight: 400,
                layout: LayoutKind::Social,
                aspect: AspectRatio::new(5, 6),
            },
        },
        Template {
            id: "viral".to_string(),
            name: "Viral".to_string(),
            style: TemplateStyle {
                background: Rgba8::rgba(0, 0, 0, 204),
                text_color: Rgba8::rgb(255, 255, 255),
                font_size: 20.0,
                font_weight: 700,
                layout: LayoutKind::Viral,
                aspect: AspectRatio::new(9, 16),
            },
        },
        Template {
            id: "podcast".to_string(),
            name: "Podcast".to_string(),
            style: TemplateStyle {
                background: Rgba8::rgba(17, 24, 39, 230),
                text_color: Rgba8::rgb(243, 244, 246),
                font_size: 18.0,
                font_weight: 500,
                layout: LayoutKind::Podcast,
                aspect: AspectRatio::new(1, 1),
            },
        },
        Template {
            id: "travel".to_string(),
            name: "Travel".to_string(),
            style: TemplateStyle {
                background: Rgba8::rgba(249, 115, 22, 204),
                text_color: Rgba8::rgb(255, 247, 237),
                font_size: 18.0,
                font_weight: 600,
                layout: LayoutKind::Travel,
                aspect: AspectRatio::new(4, 5),
            },
        },
    ]
});

/// The fixed, ordered template set.
pub fn templates() -> &'static [Template] {
    &REGISTRY
}

/// Look a template up by id, falling back to the default (first) template
/// for unknown ids. Never errors.
pub fn resolve(id: &str) -> &'static Template {
    templates()
        .iter()
        .find(|t| t.id == id)
        .unwrap_or(&templates()[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_fixed_and_ordered() {
        let ids: Vec<&str> = templates().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["social", "viral", "podcast", "travel"]);
    }

    #[test]
    fn resolve_falls_back_to_default() {
        assert_eq!(resolve("podcast").id, "podcast");
        assert_eq!(resolve("nope").id, "social");
        assert_eq!(resolve("").id, "social");
    }

    #[test]
    fn chat_style_covers_registry() {
        assert!(templates().iter().all(|t| t.style.layout.is_chat_style()));
        assert!(!LayoutKind::Freeform.is_chat_style());
    }

    #[test]
    fn json_roundtrip() {
        let t = resolve("travel").clone();
        let s = serde_json::to_string(&t).unwrap();
        let de: Template = serde_json::from_str(&s).unwrap();
        assert_eq!(de, t);
    }
}
