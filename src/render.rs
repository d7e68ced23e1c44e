use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PostframeError, PostframeResult};
use crate::geom::{Rgba8, SurfaceSize};
use crate::media::PreparedImage;
use crate::plan::{FramePlan, ImageSlot, PaintOp, TextAnchor};
use crate::text::{FontSpec, TextBrushRgba8, TextLayoutEngine};

/// One rendered frame: premultiplied RGBA8 pixels.
#[derive(Clone, Debug)]
pub struct FrameRGBA {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub premultiplied: bool,
}

/// Images available to a frame's paint ops.
pub struct FrameImages<'a> {
    pub media: &'a Arc<PreparedImage>,
    pub logo: Option<&'a Arc<PreparedImage>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct GradientKey {
    start: [u8; 4],
    end: [u8; 4],
    w: u32,
    h: u32,
}

struct ImagePaintCache {
    key: usize,
    paint: vello_cpu::Image,
}

/// CPU rasterizer for [`FramePlan`]s.
///
/// Owns the pixel surface, the Parley text engine and small paint caches;
/// rendering has no side effects beyond painting the owned surface.
pub struct CpuRenderer {
    text: Option<TextLayoutEngine>,
    font_data: Option<vello_cpu::peniko::FontData>,
    surface: Option<CpuSurface>,
    media_cache: Option<ImagePaintCache>,
    logo_cache: Option<ImagePaintCache>,
    gradient_cache: HashMap<GradientKey, vello_cpu::Image>,
}

struct CpuSurface {
    width: u16,
    height: u16,
    pixmap: vello_cpu::Pixmap,
}

impl CpuRenderer {
    /// `font_bytes` may be `None` for plans that draw no text.
    pub fn new(font_bytes: Option<Arc<Vec<u8>>>) -> Self {
        Self {
            text: font_bytes.map(TextLayoutEngine::new),
            font_data: None,
            surface: None,
            media_cache: None,
            logo_cache: None,
            gradient_cache: HashMap::new(),
        }
    }

    /// Measured advance width of `text`, for the planner. Empty text is
    /// zero-width without touching the engine.
    pub fn measure(&mut self, text: &str, font: FontSpec) -> PostframeResult<f32> {
        if text.is_empty() {
            return Ok(0.0);
        }
        match &mut self.text {
            Some(engine) => engine.measure(text, font),
            None => Err(PostframeError::validation(
                "font bytes are required to lay out text",
            )),
        }
    }

    /// Paint one plan and read the surface back.
    pub fn render_plan(
        &mut self,
        plan: &FramePlan,
        images: &FrameImages<'_>,
    ) -> PostframeResult<FrameRGBA> {
        self.ensure_surface(plan.size)?;

        let (width_u16, height_u16) = {
            let s = self
                .surface
                .as_mut()
                .ok_or_else(|| PostframeError::surface("render surface missing"))?;
            clear_pixmap(&mut s.pixmap);
            (s.width, s.height)
        };

        let mut ctx = vello_cpu::RenderContext::new(width_u16, height_u16);
        for op in &plan.ops {
            self.exec_op(&mut ctx, op, images, plan.size)?;
        }
        ctx.flush();

        let s = self
            .surface
            .as_mut()
            .ok_or_else(|| PostframeError::surface("render surface missing"))?;
        ctx.render_to_pixmap(&mut s.pixmap);

        let data = s.pixmap.data_as_u8_slice().to_vec();
        let expected = plan.size.width as usize * plan.size.height as usize * 4;
        if data.len() != expected {
            return Err(PostframeError::pixel_readback(
                "surface pixels could not be read back at the expected size",
            ));
        }

        Ok(FrameRGBA {
            width: plan.size.width,
            height: plan.size.height,
            data,
            premultiplied: true,
        })
    }

    fn ensure_surface(&mut self, size: SurfaceSize) -> PostframeResult<()> {
        let width_u16: u16 = size
            .width
            .try_into()
            .map_err(|_| PostframeError::surface("surface width exceeds u16"))?;
        let height_u16: u16 = size
            .height
            .try_into()
            .map_err(|_| PostframeError::surface("surface height exceeds u16"))?;

        let needs_new = !matches!(
            &self.surface,
            Some(s) if s.width == width_u16 && s.height == height_u16
        );
        if needs_new {
            self.surface = Some(CpuSurface {
                width: width_u16,
                height: height_u16,
                pixmap: vello_cpu::Pixmap::new(width_u16, height_u16),
            });
        }
        Ok(())
    }

    fn exec_op(
        &mut self,
        ctx: &mut vello_cpu::RenderContext,
        op: &PaintOp,
        images: &FrameImages<'_>,
        size: SurfaceSize,
    ) -> PostframeResult<()> {
        ctx.set_paint_transform(vello_cpu::kurbo::Affine::IDENTITY);
        ctx.set_transform(vello_cpu::kurbo::Affine::IDENTITY);

        match op {
            PaintOp::Clear { color } => {
                ctx.set_paint(color_to_cpu(*color));
                ctx.fill_rect(&vello_cpu::kurbo::Rect::new(
                    0.0,
                    0.0,
                    f64::from(size.width),
                    f64::from(size.height),
                ));
            }
            PaintOp::Fill { path, color } => {
                ctx.set_paint(color_to_cpu(*color));
                ctx.fill_path(&bezpath_to_cpu(path));
            }
            PaintOp::GradientRect { rect, start, end } => {
                let w = rect.width().ceil().max(1.0) as u32;
                let h = rect.height().ceil().max(1.0) as u32;
                let paint = self.gradient_paint(*start, *end, w, h)?;
                ctx.set_transform(affine_to_cpu(kurbo::Affine::translate((rect.x0, rect.y0))));
                ctx.set_paint(paint);
                ctx.fill_rect(&vello_cpu::kurbo::Rect::new(
                    0.0,
                    0.0,
                    f64::from(w),
                    f64::from(h),
                ));
            }
            PaintOp::Image { slot, dest } => {
                let prepared = self.prepared_for(*slot, images)?;
                let (img_w, img_h) = (prepared.width, prepared.height);
                let paint = self.image_paint_for(*slot, images)?;
                let transform = kurbo::Affine::translate((dest.x0, dest.y0))
                    * kurbo::Affine::scale_non_uniform(
                        dest.width() / f64::from(img_w.max(1)),
                        dest.height() / f64::from(img_h.max(1)),
                    );
                ctx.set_transform(affine_to_cpu(transform));
                ctx.set_paint(paint);
                ctx.fill_rect(&vello_cpu::kurbo::Rect::new(
                    0.0,
                    0.0,
                    f64::from(img_w),
                    f64::from(img_h),
                ));
            }
            PaintOp::ImageCircle {
                slot,
                dest,
                center,
                radius,
            } => {
                let prepared = self.prepared_for(*slot, images)?;
                let (img_w, img_h) = (prepared.width, prepared.height);
                let paint = self.image_paint_for(*slot, images)?;

                // Geometry stays in device space; the paint transform maps
                // the image into the destination box, so the circle shows
                // the stretched image inside it.
                let paint_transform = kurbo::Affine::translate((dest.x0, dest.y0))
                    * kurbo::Affine::scale_non_uniform(
                        dest.width() / f64::from(img_w.max(1)),
                        dest.height() / f64::from(img_h.max(1)),
                    );
                ctx.set_paint_transform(affine_to_cpu(paint_transform));
                ctx.set_paint(paint);

                use kurbo::Shape as _;
                let circle = kurbo::Circle::new(*center, *radius).to_path(0.1);
                ctx.fill_path(&bezpath_to_cpu(&circle));
            }
            PaintOp::Text {
                content,
                font,
                color,
                anchor,
                x,
                baseline,
            } => {
                self.exec_text(ctx, content, *font, *color, *anchor, *x, *baseline)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_text(
        &mut self,
        ctx: &mut vello_cpu::RenderContext,
        content: &str,
        font: FontSpec,
        color: Rgba8,
        anchor: TextAnchor,
        x: f64,
        baseline: f64,
    ) -> PostframeResult<()> {
        if content.is_empty() {
            return Ok(());
        }

        let engine = self
            .text
            .as_mut()
            .ok_or_else(|| PostframeError::validation("font bytes are required to lay out text"))?;
        let brush = TextBrushRgba8 {
            r: color.r,
            g: color.g,
            b: color.b,
            a: color.a,
        };
        let layout = engine.layout_plain(content, font, brush)?;

        let width = f64::from(layout.full_width());
        let origin_x = match anchor {
            TextAnchor::Left => x,
            TextAnchor::Center => x - width / 2.0,
            TextAnchor::Right => x - width,
        };
        let first_baseline = layout
            .lines()
            .next()
            .map(|l| f64::from(l.metrics().baseline))
            .unwrap_or(0.0);
        let origin_y = baseline - first_baseline;

        if self.font_data.is_none() {
            let bytes = engine.font_bytes().as_ref().clone();
            self.font_data = Some(vello_cpu::peniko::FontData::new(
                vello_cpu::peniko::Blob::from(bytes),
                0,
            ));
        }
        let font_data = self
            .font_data
            .clone()
            .ok_or_else(|| PostframeError::validation("font data unavailable"))?;

        ctx.set_transform(affine_to_cpu(kurbo::Affine::translate((
            origin_x, origin_y,
        ))));

        for line in layout.lines() {
            for item in line.items() {
                let parley::layout::PositionedLayoutItem::GlyphRun(run) = item else {
                    continue;
                };

                let brush = run.style().brush;
                ctx.set_paint(vello_cpu::peniko::Color::from_rgba8(
                    brush.r, brush.g, brush.b, brush.a,
                ));

                let glyphs = run.glyphs().map(|g| vello_cpu::Glyph {
                    id: g.id,
                    x: g.x,
                    y: g.y,
                });
                ctx.glyph_run(&font_data)
                    .font_size(run.run().font_size())
                    .fill_glyphs(glyphs);
            }
        }

        Ok(())
    }

    fn prepared_for<'a>(
        &self,
        slot: ImageSlot,
        images: &'a FrameImages<'_>,
    ) -> PostframeResult<&'a Arc<PreparedImage>> {
        match slot {
            ImageSlot::Media => Ok(images.media),
            ImageSlot::Logo => images.logo.ok_or_else(|| {
                PostframeError::validation("plan references a logo image that is not loaded")
            }),
        }
    }

    fn image_paint_for(
        &mut self,
        slot: ImageSlot,
        images: &FrameImages<'_>,
    ) -> PostframeResult<vello_cpu::Image> {
        let prepared = self.prepared_for(slot, images)?.clone();
        let key = Arc::as_ptr(&prepared.rgba8_premul) as usize;

        let cache = match slot {
            ImageSlot::Media => &mut self.media_cache,
            ImageSlot::Logo => &mut self.logo_cache,
        };
        if let Some(c) = cache
            && c.key == key
        {
            return Ok(c.paint.clone());
        }

        let pixmap = image_premul_bytes_to_pixmap(
            prepared.rgba8_premul.as_slice(),
            prepared.width,
            prepared.height,
        )?;
        let paint = vello_cpu::Image {
            image: vello_cpu::ImageSource::Pixmap(Arc::new(pixmap)),
            sampler: vello_cpu::peniko::ImageSampler::default(),
        };
        *cache = Some(ImagePaintCache {
            key,
            paint: paint.clone(),
        });
        Ok(paint)
    }

    /// Two-stop ramp rasterized along the badge width.
    fn gradient_paint(
        &mut self,
        start: Rgba8,
        end: Rgba8,
        w: u32,
        h: u32,
    ) -> PostframeResult<vello_cpu::Image> {
        let start_pm = start.premul_bytes();
        let end_pm = end.premul_bytes();
        let key = GradientKey {
            start: start_pm,
            end: end_pm,
            w,
            h,
        };
        if let Some(img) = self.gradient_cache.get(&key).cloned() {
            return Ok(img);
        }

        let mut bytes = vec![0u8; (w as usize).saturating_mul(h as usize).saturating_mul(4)];
        let w1 = (w.max(1) - 1) as f32;
        for x in 0..w {
            let t = if w1 <= 0.0 { 0.0 } else { (x as f32) / w1 };
            let lerp = |a: u8, b: u8| -> u8 {
                let af = a as f32;
                let bf = b as f32;
                (af + (bf - af) * t).round().clamp(0.0, 255.0) as u8
            };
            let c = [
                lerp(start_pm[0], end_pm[0]),
                lerp(start_pm[1], end_pm[1]),
                lerp(start_pm[2], end_pm[2]),
                lerp(start_pm[3], end_pm[3]),
            ];
            for y in 0..h {
                let idx = ((y as usize) * (w as usize) + (x as usize)) * 4;
                bytes[idx..idx + 4].copy_from_slice(&c);
            }
        }

        let img_pixmap = image_premul_bytes_to_pixmap(&bytes, w, h)?;
        let img = vello_cpu::Image {
            image: vello_cpu::ImageSource::Pixmap(Arc::new(img_pixmap)),
            sampler: vello_cpu::peniko::ImageSampler::default(),
        };
        self.gradient_cache.insert(key, img.clone());
        Ok(img)
    }
}

fn clear_pixmap(pixmap: &mut vello_cpu::Pixmap) {
    let data = pixmap.data_as_u8_slice_mut();
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&[0, 0, 0, 0]);
    }
}

fn color_to_cpu(c: Rgba8) -> vello_cpu::peniko::Color {
    vello_cpu::peniko::Color::from_rgba8(c.r, c.g, c.b, c.a)
}

fn affine_to_cpu(a: kurbo::Affine) -> vello_cpu::kurbo::Affine {
    vello_cpu::kurbo::Affine::new(a.as_coeffs())
}

fn point_to_cpu(p: kurbo::Point) -> vello_cpu::kurbo::Point {
    vello_cpu::kurbo::Point::new(p.x, p.y)
}

fn bezpath_to_cpu(path: &kurbo::BezPath) -> vello_cpu::kurbo::BezPath {
    use kurbo::PathEl;
    use vello_cpu::kurbo::PathEl as CpuEl;

    let mut out = vello_cpu::kurbo::BezPath::new();
    for &el in path.elements() {
        out.push(match el {
            PathEl::MoveTo(p) => CpuEl::MoveTo(point_to_cpu(p)),
            PathEl::LineTo(p) => CpuEl::LineTo(point_to_cpu(p)),
            PathEl::QuadTo(p1, p2) => CpuEl::QuadTo(point_to_cpu(p1), point_to_cpu(p2)),
            PathEl::CurveTo(p1, p2, p3) => {
                CpuEl::CurveTo(point_to_cpu(p1), point_to_cpu(p2), point_to_cpu(p3))
            }
            PathEl::ClosePath => CpuEl::ClosePath,
        });
    }
    out
}

fn image_premul_bytes_to_pixmap(
    rgba8_premul: &[u8],
    width: u32,
    height: u32,
) -> PostframeResult<vello_cpu::Pixmap> {
    let w: u16 = width
        .try_into()
        .map_err(|_| PostframeError::surface("image width exceeds u16"))?;
    let h: u16 = height
        .try_into()
        .map_err(|_| PostframeError::surface("image height exceeds u16"))?;
    if rgba8_premul.len() != width as usize * height as usize * 4 {
        return Err(PostframeError::surface(
            "prepared image byte length mismatch",
        ));
    }

    let mut translucent = false;
    let pixels: Vec<_> = rgba8_premul
        .chunks_exact(4)
        .map(|px| {
            translucent |= px[3] != 255;
            vello_cpu::peniko::color::PremulRgba8 {
                r: px[0],
                g: px[1],
                b: px[2],
                a: px[3],
            }
        })
        .collect();

    Ok(vello_cpu::Pixmap::from_parts_with_opacity(
        pixels, w, h, translucent,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{ExportQuality, PostFields, surface_size_for};
    use crate::plan::plan_frame;
    use crate::template::resolve;

    fn solid_media(w: u32, h: u32, rgba: [u8; 4]) -> Arc<PreparedImage> {
        let px = Rgba8::rgba(rgba[0], rgba[1], rgba[2], rgba[3]).premul_bytes();
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            data.extend_from_slice(&px);
        }
        Arc::new(PreparedImage {
            width: w,
            height: h,
            rgba8_premul: Arc::new(data),
        })
    }

    fn render_default(template_id: &str) -> FrameRGBA {
        let template = resolve(template_id);
        let size = surface_size_for(template, ExportQuality::Hd720).unwrap();
        let fields = PostFields::default();
        let mut renderer = CpuRenderer::new(None);
        let plan = plan_frame(size, template, &fields, false, &mut |t, _| {
            Ok(t.chars().count() as f32 * 8.0)
        })
        .unwrap();
        let media = solid_media(4, 4, [200, 40, 40, 255]);
        renderer
            .render_plan(
                &plan,
                &FrameImages {
                    media: &media,
                    logo: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn rendered_frame_has_surface_dimensions() {
        let frame = render_default("podcast");
        assert_eq!((frame.width, frame.height), (720, 720));
        assert_eq!(frame.data.len(), 720 * 720 * 4);
        assert!(frame.premultiplied);
    }

    #[test]
    fn repeat_renders_are_pixel_identical() {
        let a = render_default("social");
        let b = render_default("social");
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn measure_of_empty_text_needs_no_font() {
        let mut renderer = CpuRenderer::new(None);
        assert_eq!(renderer.measure("", FontSpec::bold(16.0)).unwrap(), 0.0);
        assert!(renderer.measure("x", FontSpec::bold(16.0)).is_err());
    }

    #[test]
    fn oversized_surface_is_rejected() {
        let mut renderer = CpuRenderer::new(None);
        assert!(
            renderer
                .ensure_surface(SurfaceSize {
                    width: 70_000,
                    height: 10,
                })
                .is_err()
        );
    }

    #[test]
    fn gradient_ramp_interpolates_endpoints() {
        let mut renderer = CpuRenderer::new(None);
        let img = renderer
            .gradient_paint(Rgba8::rgb(251, 191, 36), Rgba8::rgb(245, 158, 11), 8, 2)
            .unwrap();
        let vello_cpu::ImageSource::Pixmap(p) = &img.image else {
            panic!("gradient paint should be a pixmap");
        };
        let data = p.data_as_u8_slice();
        assert_eq!(&data[0..4], &[251, 191, 36, 255]);
        let last = (8 * 2 - 1) * 4;
        assert_eq!(&data[last..last + 4], &[245, 158, 11, 255]);
    }
}
