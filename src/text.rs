use std::sync::Arc;

use crate::error::{PostframeError, PostframeResult};

/// RGBA8 brush color carried through Parley layouts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextBrushRgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Typography of one text run, in device pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FontSpec {
    pub size_px: f32,
    /// CSS-style weight (400 regular, 700 bold).
    pub weight: u16,
}

impl FontSpec {
    pub fn regular(size_px: f32) -> Self {
        Self {
            size_px,
            weight: 400,
        }
    }

    pub fn bold(size_px: f32) -> Self {
        Self {
            size_px,
            weight: 700,
        }
    }
}

/// Stateful helper building Parley layouts from one set of font bytes.
///
/// Font bytes are an explicit input rather than a system lookup so that a
/// given font file always produces the same shaping, measurements and line
/// breaks.
pub struct TextLayoutEngine {
    font_bytes: Arc<Vec<u8>>,
    family_name: Option<String>,
    font_ctx: parley::FontContext,
    layout_ctx: parley::LayoutContext<TextBrushRgba8>,
}

impl TextLayoutEngine {
    pub fn new(font_bytes: Arc<Vec<u8>>) -> Self {
        Self {
            font_bytes,
            family_name: None,
            font_ctx: parley::FontContext::default(),
            layout_ctx: parley::LayoutContext::new(),
        }
    }

    /// The raw font bytes this engine shapes with.
    pub fn font_bytes(&self) -> &Arc<Vec<u8>> {
        &self.font_bytes
    }

    fn family_name(&mut self) -> PostframeResult<String> {
        if let Some(name) = &self.family_name {
            return Ok(name.clone());
        }

        let families = self.font_ctx.collection.register_fonts(
            parley::fontique::Blob::from(self.font_bytes.as_ref().clone()),
            None,
        );
        let family_id = families.first().map(|(id, _)| *id).ok_or_else(|| {
            PostframeError::validation("no font families registered from font bytes")
        })?;
        let name = self
            .font_ctx
            .collection
            .family_name(family_id)
            .ok_or_else(|| PostframeError::validation("registered font family has no name"))?
            .to_string();

        self.family_name = Some(name.clone());
        Ok(name)
    }

    /// Shape and lay out a single run of plain text.
    pub fn layout_plain(
        &mut self,
        text: &str,
        font: FontSpec,
        brush: TextBrushRgba8,
    ) -> PostframeResult<parley::Layout<TextBrushRgba8>> {
        if !font.size_px.is_finite() || font.size_px <= 0.0 {
            return Err(PostframeError::validation(
                "text size_px must be finite and > 0",
            ));
        }

        let family_name = self.family_name()?;

        let mut builder = self
            .layout_ctx
            .ranged_builder(&mut self.font_ctx, text, 1.0, true);
        builder.push_default(parley::style::StyleProperty::FontStack(
            parley::style::FontStack::Source(std::borrow::Cow::Owned(family_name)),
        ));
        builder.push_default(parley::style::StyleProperty::FontSize(font.size_px));
        builder.push_default(parley::style::StyleProperty::FontWeight(
            parley::style::FontWeight::new(f32::from(font.weight)),
        ));
        builder.push_default(parley::style::StyleProperty::Brush(brush));

        let mut layout: parley::Layout<TextBrushRgba8> = builder.build(text);
        layout.break_all_lines(None);
        Ok(layout)
    }

    /// Measured advance width of `text` in pixels, trailing whitespace
    /// included.
    pub fn measure(&mut self, text: &str, font: FontSpec) -> PostframeResult<f32> {
        if text.is_empty() {
            return Ok(0.0);
        }
        let layout = self.layout_plain(text, font, TextBrushRgba8::default())?;
        Ok(layout.full_width())
    }
}

/// Greedy caption word wrap.
///
/// Words accumulate into a line while the measured candidate stays within
/// `max_width`; on overflow the line is committed and the word opens the
/// next one. A single word wider than `max_width` occupies its own line and
/// is never split mid-word.
pub fn wrap_caption<F>(caption: &str, max_width: f32, mut measure: F) -> PostframeResult<Vec<String>>
where
    F: FnMut(&str) -> PostframeResult<f32>,
{
    let mut lines = Vec::new();
    let mut line = String::new();

    for word in caption.split_whitespace() {
        let candidate = if line.is_empty() {
            word.to_string()
        } else {
            format!("{line} {word}")
        };

        if line.is_empty() || measure(&candidate)? <= max_width {
            line = candidate;
        } else {
            lines.push(std::mem::take(&mut line));
            line = word.to_string();
        }
    }

    if !line.is_empty() {
        lines.push(line);
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 10px per char keeps the math readable.
    fn char_width(s: &str) -> PostframeResult<f32> {
        Ok(s.chars().count() as f32 * 10.0)
    }

    #[test]
    fn wrap_respects_max_width() {
        let lines = wrap_caption("aa bb cc dd ee", 50.0, char_width).unwrap();
        for line in &lines {
            assert!(char_width(line).unwrap() <= 50.0, "line too wide: {line}");
        }
        assert_eq!(lines, ["aa bb", "cc dd", "ee"]);
    }

    #[test]
    fn wrap_roundtrips_caption() {
        let caption = "the quick brown fox jumps over the lazy dog";
        let lines = wrap_caption(caption, 120.0, char_width).unwrap();
        assert_eq!(lines.join(" "), caption);
    }

    #[test]
    fn wrap_normalizes_whitespace() {
        let lines = wrap_caption("  a   b \t c  ", 1000.0, char_width).unwrap();
        assert_eq!(lines, ["a b c"]);
    }

    #[test]
    fn overlong_word_gets_its_own_line() {
        let lines = wrap_caption("hi incomprehensibilities yo", 80.0, char_width).unwrap();
        assert_eq!(lines, ["hi", "incomprehensibilities", "yo"]);
        // The overlong line is the only one allowed to exceed the limit.
        assert!(char_width(&lines[1]).unwrap() > 80.0);
    }

    #[test]
    fn empty_caption_produces_no_lines() {
        assert!(wrap_caption("", 100.0, char_width).unwrap().is_empty());
        assert!(wrap_caption("   ", 100.0, char_width).unwrap().is_empty());
    }

    #[test]
    fn forty_word_caption_wraps_to_multiple_lines() {
        let caption = vec!["word"; 40].join(" ");
        let lines = wrap_caption(&caption, 200.0, char_width).unwrap();
        assert!(lines.len() >= 2);
        for line in &lines {
            assert!(char_width(line).unwrap() <= 200.0);
        }
        assert_eq!(lines.join(" "), caption);
    }
}
