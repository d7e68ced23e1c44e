use crate::error::{PostframeError, PostframeResult};
use crate::geom::SurfaceSize;
use crate::template::Template;

/// Fixed set of export target widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExportQuality {
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
}

impl ExportQuality {
    pub fn width(self) -> u32 {
        match self {
            ExportQuality::Hd720 => 720,
            ExportQuality::Hd1080 => 1080,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExportQuality::Hd720 => "720p",
            ExportQuality::Hd1080 => "1080p",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Image,
    Video,
}

/// Position of the draggable username bar in unscaled layout units.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogoPosition {
    pub x: f64,
    pub y: f64,
}

impl Default for LogoPosition {
    fn default() -> Self {
        Self { x: 20.0, y: 20.0 }
    }
}

/// User-editable overlay fields for one post.
///
/// A `PostFields` value is an immutable snapshot at render time; the editor
/// mutates its own copy and passes it whole into each render/export call.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PostFields {
    pub username: String,
    pub display_name: String,
    pub caption: String,
    /// Speech-bubble text; empty means no bubble is drawn.
    pub overlay_text: String,
    /// Part-number label; empty means no badge is drawn.
    pub part_label: String,
    /// Watermark string; empty means no watermark is drawn.
    pub watermark: String,
    pub logo_position: LogoPosition,
    /// Display duration used when the media source is a still image.
    pub still_duration_secs: f64,
    pub quality: ExportQuality,
    pub format: ExportFormat,
}

impl Default for PostFields {
    fn default() -> Self {
        Self {
            username: String::new(),
            display_name: String::new(),
            caption: String::new(),
            overlay_text: String::new(),
            part_label: String::new(),
            watermark: String::new(),
            logo_position: LogoPosition::default(),
            still_duration_secs: 5.0,
            quality: ExportQuality::Hd1080,
            format: ExportFormat::Image,
        }
    }
}

impl PostFields {
    pub fn validate(&self) -> PostframeResult<()> {
        if !self.still_duration_secs.is_finite() || self.still_duration_secs <= 0.0 {
            return Err(PostframeError::validation(
                "still_duration_secs must be finite and > 0",
            ));
        }
        if !self.logo_position.x.is_finite() || !self.logo_position.y.is_finite() {
            return Err(PostframeError::validation(
                "logo_position must be finite",
            ));
        }
        Ok(())
    }

    /// Username with the leading `@` stripped, for filenames.
    pub fn username_slug(&self) -> &str {
        self.username.trim_start_matches('@')
    }
}

/// Export surface dimensions for a template at a target quality.
pub fn surface_size_for(template: &Template, quality: ExportQuality) -> PostframeResult<SurfaceSize> {
    let width = quality.width();
    let height = template.style.aspect.height_for_width(width)?;
    SurfaceSize::new(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::resolve;

    #[test]
    fn quality_widths_are_fixed() {
        assert_eq!(ExportQuality::Hd1080.width(), 1080);
        assert_eq!(ExportQuality::Hd720.width(), 720);
    }

    #[test]
    fn surface_size_follows_template_aspect() {
        let s = surface_size_for(resolve("social"), ExportQuality::Hd1080).unwrap();
        assert_eq!((s.width, s.height), (1080, 1296));

        let s = surface_size_for(resolve("viral"), ExportQuality::Hd720).unwrap();
        assert_eq!((s.width, s.height), (720, 1280));

        let s = surface_size_for(resolve("podcast"), ExportQuality::Hd1080).unwrap();
        assert_eq!((s.width, s.height), (1080, 1080));

        let s = surface_size_for(resolve("travel"), ExportQuality::Hd1080).unwrap();
        assert_eq!((s.width, s.height), (1080, 1350));
    }

    #[test]
    fn username_slug_strips_handle_prefix() {
        let fields = PostFields {
            username: "@johndoe".to_string(),
            ..PostFields::default()
        };
        assert_eq!(fields.username_slug(), "johndoe");
    }

    #[test]
    fn validate_rejects_bad_duration() {
        let fields = PostFields {
            still_duration_secs: 0.0,
            ..PostFields::default()
        };
        assert!(fields.validate().is_err());
    }

    #[test]
    fn fields_json_roundtrip_with_defaults() {
        let de: PostFields = serde_json::from_str(r#"{"username":"@a","quality":"720p"}"#).unwrap();
        assert_eq!(de.quality, ExportQuality::Hd720);
        assert_eq!(de.still_duration_secs, 5.0);
        assert_eq!(de.format, ExportFormat::Image);
    }
}
