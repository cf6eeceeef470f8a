//! Interactive crop tool: draw a rectangle over a scaled-down preview, move it
//! around, and rasterize the selected region at the source image's resolution.

use std::io::Cursor;

use anyhow::{Context, Result};
use eframe::egui;
use image::{DynamicImage, ImageFormat};

/// Crop region selected by the user, in display coordinates (pixels of the
/// on-screen preview, origin at the preview's top-left corner).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Selection {
    /// Normalized rectangle spanning two arbitrary corners, so dragging in any
    /// direction yields non-negative width/height.
    fn from_corners(anchor: egui::Pos2, pos: egui::Pos2) -> Self {
        Self {
            x: anchor.x.min(pos.x),
            y: anchor.y.min(pos.y),
            width: (pos.x - anchor.x).abs(),
            height: (pos.y - anchor.y).abs(),
        }
    }

    fn contains(&self, pos: egui::Pos2) -> bool {
        pos.x >= self.x
            && pos.x <= self.x + self.width
            && pos.y >= self.y
            && pos.y <= self.y + self.height
    }

    fn is_empty(&self) -> bool {
        self.width == 0.0 || self.height == 0.0
    }
}

/// Current pointer gesture. One of these is active at a time; a new
/// pointer-down always supersedes whatever was in progress.
#[derive(Clone, Copy, Debug, PartialEq)]
enum DragState {
    Idle,
    /// A new rectangle is being drawn out from a fixed anchor corner.
    Drawing { anchor: egui::Pos2 },
    /// An existing rectangle is being translated; the offset is from the
    /// rectangle's top-left to where the pointer grabbed it.
    Moving { grab: egui::Vec2 },
}

/// Encoded crop handed back to the caller.
pub struct CroppedResult {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

/// Terminal outcome of one tool invocation. Exactly one of these is returned
/// from [`CropTool::show`], after which the caller drops the tool.
pub enum CropOutcome {
    Applied(CroppedResult),
    Cancelled,
    Failed(anyhow::Error),
}

/// Pointer-down transition: grab the selection if the press lands inside it
/// (inclusive bounds), otherwise start drawing a fresh zero-size rectangle.
fn on_pointer_down(selection: &mut Option<Selection>, pos: egui::Pos2) -> DragState {
    if let Some(sel) = selection {
        if sel.contains(pos) {
            return DragState::Moving {
                grab: pos - egui::pos2(sel.x, sel.y),
            };
        }
    }
    *selection = Some(Selection {
        x: pos.x,
        y: pos.y,
        width: 0.0,
        height: 0.0,
    });
    DragState::Drawing { anchor: pos }
}

/// Translate a selection so its top-left follows the pointer minus the grab
/// offset, clamped per axis so the rectangle stays inside the display box.
/// Size never changes while moving.
fn moved_selection(
    sel: Selection,
    pos: egui::Pos2,
    grab: egui::Vec2,
    display: egui::Vec2,
) -> Selection {
    let target = pos - grab;
    Selection {
        x: target.x.clamp(0.0, (display.x - sel.width).max(0.0)),
        y: target.y.clamp(0.0, (display.y - sel.height).max(0.0)),
        ..sel
    }
}

/// Map a display-space selection into source pixel space.
///
/// The selection is first clamped to the display box (drawing is allowed to
/// wander outside it), then scaled by independent per-axis factors. The origin
/// is floored and the far edge is ceiled so fractional boundaries never lose a
/// pixel, then the result is clamped to the source dimensions.
///
/// Returns `None` when the clamped selection is empty or the display box has
/// no usable size yet (an image that has not laid out must not divide by
/// zero).
pub fn to_source_rect(
    sel: Selection,
    display_w: f32,
    display_h: f32,
    natural_w: u32,
    natural_h: u32,
) -> Option<(u32, u32, u32, u32)> {
    if display_w <= 0.0 || display_h <= 0.0 || natural_w == 0 || natural_h == 0 {
        return None;
    }

    let left = sel.x.clamp(0.0, display_w);
    let top = sel.y.clamp(0.0, display_h);
    let right = (sel.x + sel.width).clamp(0.0, display_w);
    let bottom = (sel.y + sel.height).clamp(0.0, display_h);
    if right <= left || bottom <= top {
        return None;
    }

    let scale_x = natural_w as f32 / display_w;
    let scale_y = natural_h as f32 / display_h;

    let x0 = (left * scale_x).floor() as u32;
    let y0 = (top * scale_y).floor() as u32;
    let x1 = ((right * scale_x).ceil() as u32).min(natural_w);
    let y1 = ((bottom * scale_y).ceil() as u32).min(natural_h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some((x0, y0, x1 - x0, y1 - y0))
}

/// A relayout of the preview changes the display box the selection's
/// coordinates are relative to, so the selection cannot be kept.
fn selection_survives_resize(prev: Option<egui::Vec2>, now: egui::Vec2) -> bool {
    prev.is_none_or(|p| p == now)
}

/// Copy the source-space region out of the image 1:1 and encode it.
///
/// The input's format is kept when the encoder supports it; JPEG sources are
/// flattened to RGB first since the JPEG encoder rejects alpha.
fn rasterize(
    source: &DynamicImage,
    region: (u32, u32, u32, u32),
    format: ImageFormat,
) -> Result<CroppedResult> {
    let (x, y, w, h) = region;
    let cropped = source.crop_imm(x, y, w, h);

    let (cropped, format) = match format {
        ImageFormat::Jpeg => (DynamicImage::ImageRgb8(cropped.to_rgb8()), format),
        ImageFormat::Png => (cropped, format),
        _ => (cropped, ImageFormat::Png),
    };

    let mut bytes = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut bytes), format)
        .context("failed to encode cropped image")?;

    Ok(CroppedResult {
        bytes,
        mime: format.to_mime_type(),
    })
}

/// Modal rectangle-selection widget over a single image.
///
/// Call [`show`](Self::show) every frame; it returns `Some(outcome)` exactly
/// once, at which point all internal state has been torn down and the tool
/// should be dropped.
pub struct CropTool {
    source: DynamicImage,
    format: ImageFormat,
    texture: Option<egui::TextureHandle>,
    selection: Option<Selection>,
    drag: DragState,
    // Last frame's preview size; a relayout invalidates display coordinates.
    display_size: Option<egui::Vec2>,
}

impl CropTool {
    pub fn new(source: DynamicImage, format: ImageFormat) -> Self {
        Self {
            source,
            format,
            texture: None,
            selection: None,
            drag: DragState::Idle,
            display_size: None,
        }
    }

    /// Single exit path for every terminal transition (apply, cancel, escape,
    /// failure): clear all gesture state before handing back the outcome.
    fn finish(&mut self, outcome: CropOutcome) -> CropOutcome {
        self.selection = None;
        self.drag = DragState::Idle;
        self.display_size = None;
        outcome
    }

    fn apply(&mut self, display: egui::Vec2) -> CropOutcome {
        let Some(sel) = self.selection else {
            return self.finish(CropOutcome::Cancelled);
        };
        // An empty crop is meaningless, not an error.
        let Some(region) = to_source_rect(
            sel,
            display.x,
            display.y,
            self.source.width(),
            self.source.height(),
        ) else {
            return self.finish(CropOutcome::Cancelled);
        };

        match rasterize(&self.source, region, self.format) {
            Ok(result) => {
                log::info!(
                    "applied crop: {}x{} at ({}, {})",
                    region.2,
                    region.3,
                    region.0,
                    region.1
                );
                self.finish(CropOutcome::Applied(result))
            }
            Err(err) => self.finish(CropOutcome::Failed(err)),
        }
    }

    fn ensure_texture(&mut self, ctx: &egui::Context) -> egui::TextureHandle {
        self.texture
            .get_or_insert_with(|| {
                let size = [self.source.width() as _, self.source.height() as _];
                let buffer = self.source.to_rgba8();
                let pixels = buffer.as_flat_samples();
                let color_image =
                    egui::ColorImage::from_rgba_unmultiplied(size, pixels.as_slice());
                ctx.load_texture("crop-source", color_image, egui::TextureOptions::LINEAR)
            })
            .clone()
    }

    pub fn show(&mut self, ctx: &egui::Context) -> Option<CropOutcome> {
        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            return Some(self.finish(CropOutcome::Cancelled));
        }

        let texture = self.ensure_texture(ctx);
        let mut outcome = None;

        egui::Window::new("Crop image")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, egui::Vec2::ZERO)
            .show(ctx, |ui| {
                let image_size = texture.size_vec2();
                let max_size = egui::vec2(
                    ctx.screen_rect().width() * 0.7,
                    ctx.screen_rect().height() * 0.6,
                );
                let scale = (max_size.x / image_size.x)
                    .min(max_size.y / image_size.y)
                    .min(1.0);
                let display_size = image_size * scale;

                if !selection_survives_resize(self.display_size, display_size) {
                    self.selection = None;
                    self.drag = DragState::Idle;
                }
                self.display_size = Some(display_size);

                let (image_rect, response) =
                    ui.allocate_exact_size(display_size, egui::Sense::drag());
                let painter = ui.painter_at(image_rect);

                painter.image(
                    texture.id(),
                    image_rect,
                    egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                    egui::Color32::WHITE,
                );

                self.handle_pointer(ctx, &response, image_rect, display_size);
                self.paint_selection(&painter, image_rect);

                ui.add_space(8.0);
                ui.label("Click and drag to select an area, or drag the selection to move it.");
                ui.horizontal(|ui| {
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        if ui.button("Apply").clicked() {
                            outcome = Some(self.apply(display_size));
                        }
                        if ui.button("Cancel").clicked() {
                            outcome = Some(self.finish(CropOutcome::Cancelled));
                        }
                    });
                });
            });

        outcome
    }

    fn handle_pointer(
        &mut self,
        ctx: &egui::Context,
        response: &egui::Response,
        image_rect: egui::Rect,
        display_size: egui::Vec2,
    ) {
        // Gestures are inert until the preview has a usable size.
        if display_size.x <= 0.0 || display_size.y <= 0.0 {
            return;
        }

        let local = |pos: egui::Pos2| pos - image_rect.min.to_vec2();

        if response.drag_started() {
            if let Some(pos) = response.interact_pointer_pos() {
                self.drag = on_pointer_down(&mut self.selection, local(pos));
            }
        } else if response.dragged() {
            if let Some(pos) = response.interact_pointer_pos() {
                let pos = local(pos);
                match self.drag {
                    DragState::Idle => {}
                    DragState::Drawing { anchor } => {
                        // Unclamped on purpose; apply() clamps before mapping.
                        self.selection = Some(Selection::from_corners(anchor, pos));
                    }
                    DragState::Moving { grab } => {
                        if let Some(sel) = self.selection {
                            self.selection = Some(moved_selection(sel, pos, grab, display_size));
                        }
                    }
                }
            }
        }

        // Pointer released or gone: the gesture ends, the selection stays.
        if response.drag_stopped() || !ctx.input(|i| i.pointer.has_pointer()) {
            self.drag = DragState::Idle;
        }

        if self.drag == DragState::Idle {
            if let Some(pos) = response.hover_pos() {
                let inside = self
                    .selection
                    .is_some_and(|sel| sel.contains(local(pos)));
                ctx.set_cursor_icon(if inside {
                    egui::CursorIcon::Move
                } else {
                    egui::CursorIcon::Crosshair
                });
            }
        }
    }

    fn paint_selection(&self, painter: &egui::Painter, image_rect: egui::Rect) {
        let Some(sel) = self.selection else { return };
        if sel.is_empty() {
            return;
        }

        let sel_rect = egui::Rect::from_min_size(
            image_rect.min + egui::vec2(sel.x, sel.y),
            egui::vec2(sel.width, sel.height),
        )
        .intersect(image_rect);

        // Dim everything outside the selection.
        let dim = egui::Color32::from_black_alpha(150);
        painter.rect_filled(
            egui::Rect::from_min_max(
                image_rect.min,
                egui::pos2(image_rect.max.x, sel_rect.min.y),
            ),
            0.0,
            dim,
        );
        painter.rect_filled(
            egui::Rect::from_min_max(
                egui::pos2(image_rect.min.x, sel_rect.max.y),
                image_rect.max,
            ),
            0.0,
            dim,
        );
        painter.rect_filled(
            egui::Rect::from_min_max(
                egui::pos2(image_rect.min.x, sel_rect.min.y),
                egui::pos2(sel_rect.min.x, sel_rect.max.y),
            ),
            0.0,
            dim,
        );
        painter.rect_filled(
            egui::Rect::from_min_max(
                egui::pos2(sel_rect.max.x, sel_rect.min.y),
                egui::pos2(image_rect.max.x, sel_rect.max.y),
            ),
            0.0,
            dim,
        );

        painter.rect_stroke(
            sel_rect,
            0.0,
            egui::Stroke::new(1.0, egui::Color32::WHITE),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eframe::egui::{pos2, vec2};
    use image::{Rgba, RgbaImage};

    fn sel(x: f32, y: f32, width: f32, height: f32) -> Selection {
        Selection {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn pointer_down_inside_selection_starts_moving() {
        let mut selection = Some(sel(10.0, 10.0, 50.0, 40.0));
        let state = on_pointer_down(&mut selection, pos2(30.0, 25.0));
        assert_eq!(
            state,
            DragState::Moving {
                grab: vec2(20.0, 15.0)
            }
        );
        // The selection itself is untouched.
        assert_eq!(selection, Some(sel(10.0, 10.0, 50.0, 40.0)));
    }

    #[test]
    fn pointer_down_on_selection_edge_counts_as_inside() {
        let mut selection = Some(sel(10.0, 10.0, 50.0, 40.0));
        let state = on_pointer_down(&mut selection, pos2(60.0, 50.0));
        assert!(matches!(state, DragState::Moving { .. }));
    }

    #[test]
    fn pointer_down_outside_selection_starts_drawing() {
        let mut selection = Some(sel(10.0, 10.0, 50.0, 40.0));
        let state = on_pointer_down(&mut selection, pos2(100.0, 100.0));
        assert_eq!(
            state,
            DragState::Drawing {
                anchor: pos2(100.0, 100.0)
            }
        );
        assert_eq!(selection, Some(sel(100.0, 100.0, 0.0, 0.0)));
    }

    #[test]
    fn pointer_down_without_selection_starts_drawing() {
        let mut selection = None;
        let state = on_pointer_down(&mut selection, pos2(5.0, 7.0));
        assert!(matches!(state, DragState::Drawing { .. }));
        assert_eq!(selection, Some(sel(5.0, 7.0, 0.0, 0.0)));
    }

    #[test]
    fn drawing_normalizes_all_four_drag_directions() {
        let anchor = pos2(50.0, 50.0);
        // Up-left: the scenario from the drag-direction requirement.
        assert_eq!(
            Selection::from_corners(anchor, pos2(10.0, 20.0)),
            sel(10.0, 20.0, 40.0, 30.0)
        );
        // Down-right.
        assert_eq!(
            Selection::from_corners(anchor, pos2(90.0, 80.0)),
            sel(50.0, 50.0, 40.0, 30.0)
        );
        // Up-right.
        assert_eq!(
            Selection::from_corners(anchor, pos2(90.0, 20.0)),
            sel(50.0, 20.0, 40.0, 30.0)
        );
        // Down-left.
        assert_eq!(
            Selection::from_corners(anchor, pos2(10.0, 80.0)),
            sel(10.0, 50.0, 40.0, 30.0)
        );
    }

    #[test]
    fn moving_clamps_to_display_bounds() {
        let display = vec2(200.0, 200.0);
        let start = sel(0.0, 0.0, 50.0, 50.0);

        // Dragged so the top-left would land at (-30, -10).
        let grabbed_at = pos2(20.0, 20.0);
        let grab = grabbed_at - pos2(start.x, start.y);
        let moved = moved_selection(start, pos2(-10.0, 10.0), grab, display);
        assert_eq!(moved, sel(0.0, 0.0, 50.0, 50.0));

        // Dragged past the far corner.
        let moved = moved_selection(start, pos2(400.0, 400.0), grab, display);
        assert_eq!(moved, sel(150.0, 150.0, 50.0, 50.0));

        // Size is unchanged by any move.
        let moved = moved_selection(start, pos2(100.0, 90.0), grab, display);
        assert_eq!((moved.width, moved.height), (50.0, 50.0));
        assert_eq!(moved, sel(80.0, 70.0, 50.0, 50.0));
    }

    #[test]
    fn source_rect_scales_by_independent_axis_factors() {
        // 400x300 display of an 800x600 bitmap: 2x on both axes.
        let region = to_source_rect(sel(100.0, 50.0, 100.0, 60.0), 400.0, 300.0, 800, 600);
        assert_eq!(region, Some((200, 100, 200, 120)));
    }

    #[test]
    fn source_rect_uses_floor_origin_and_ceil_extent() {
        // Scale 1/3: display x 10..20 maps to source 3.33..6.67, which must
        // round outward to 3..7 rather than dropping edge pixels.
        let region = to_source_rect(sel(10.0, 10.0, 10.0, 10.0), 300.0, 300.0, 100, 100);
        assert_eq!(region, Some((3, 3, 4, 4)));
    }

    #[test]
    fn source_rect_clamps_out_of_bounds_selection() {
        // Drawing may wander outside the display box; apply must clamp before
        // scaling or it would read out-of-bounds source pixels.
        let region = to_source_rect(sel(-20.0, -20.0, 100.0, 100.0), 200.0, 200.0, 200, 200);
        assert_eq!(region, Some((0, 0, 80, 80)));

        let region = to_source_rect(sel(150.0, 150.0, 100.0, 100.0), 200.0, 200.0, 200, 200);
        assert_eq!(region, Some((150, 150, 50, 50)));
    }

    #[test]
    fn source_rect_rejects_empty_selection() {
        assert_eq!(
            to_source_rect(sel(10.0, 10.0, 0.0, 40.0), 200.0, 200.0, 400, 400),
            None
        );
        assert_eq!(
            to_source_rect(sel(10.0, 10.0, 40.0, 0.0), 200.0, 200.0, 400, 400),
            None
        );
        // Entirely outside the display box clamps down to nothing.
        assert_eq!(
            to_source_rect(sel(300.0, 300.0, 50.0, 50.0), 200.0, 200.0, 400, 400),
            None
        );
    }

    #[test]
    fn source_rect_refuses_unloaded_dimensions() {
        let s = sel(10.0, 10.0, 40.0, 40.0);
        assert_eq!(to_source_rect(s, 0.0, 200.0, 400, 400), None);
        assert_eq!(to_source_rect(s, 200.0, 0.0, 400, 400), None);
        assert_eq!(to_source_rect(s, 200.0, 200.0, 0, 400), None);
    }

    fn checker_image() -> DynamicImage {
        let mut img = RgbaImage::new(4, 4);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgba([(x * 50) as u8, (y * 50) as u8, 0, 255]);
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn rasterize_copies_region_at_source_resolution() {
        let source = checker_image();
        let result = rasterize(&source, (1, 1, 2, 2), ImageFormat::Png).unwrap();
        assert_eq!(result.mime, "image/png");

        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (2, 2));
        let pixels = decoded.to_rgba8();
        assert_eq!(pixels.get_pixel(0, 0), &Rgba([50, 50, 0, 255]));
        assert_eq!(pixels.get_pixel(1, 1), &Rgba([100, 100, 0, 255]));
    }

    #[test]
    fn rasterize_is_deterministic() {
        let source = checker_image();
        let first = rasterize(&source, (0, 0, 3, 3), ImageFormat::Png).unwrap();
        let second = rasterize(&source, (0, 0, 3, 3), ImageFormat::Png).unwrap();
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn rasterize_keeps_jpeg_output_for_jpeg_input() {
        let source = checker_image();
        let result = rasterize(&source, (0, 0, 4, 4), ImageFormat::Jpeg).unwrap();
        assert_eq!(result.mime, "image/jpeg");
        assert_eq!(
            image::guess_format(&result.bytes).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn rasterize_falls_back_to_png_for_other_formats() {
        let source = checker_image();
        let result = rasterize(&source, (0, 0, 4, 4), ImageFormat::Bmp).unwrap();
        assert_eq!(result.mime, "image/png");
    }

    #[test]
    fn empty_selection_apply_routes_to_cancel() {
        let mut tool = CropTool::new(checker_image(), ImageFormat::Png);
        tool.selection = Some(sel(10.0, 10.0, 0.0, 0.0));
        assert!(matches!(
            tool.apply(vec2(200.0, 200.0)),
            CropOutcome::Cancelled
        ));
        assert_eq!(tool.selection, None);
    }

    #[test]
    fn apply_without_selection_routes_to_cancel() {
        let mut tool = CropTool::new(checker_image(), ImageFormat::Png);
        assert!(matches!(
            tool.apply(vec2(200.0, 200.0)),
            CropOutcome::Cancelled
        ));
    }

    #[test]
    fn apply_tears_down_state_on_success() {
        let mut tool = CropTool::new(checker_image(), ImageFormat::Png);
        tool.selection = Some(sel(0.0, 0.0, 2.0, 2.0));
        tool.drag = DragState::Drawing {
            anchor: pos2(0.0, 0.0),
        };
        let outcome = tool.apply(vec2(4.0, 4.0));
        assert!(matches!(outcome, CropOutcome::Applied(_)));
        assert_eq!(tool.selection, None);
        assert_eq!(tool.drag, DragState::Idle);
    }

    #[test]
    fn resizing_the_display_box_invalidates_the_selection() {
        assert!(selection_survives_resize(None, vec2(400.0, 300.0)));
        assert!(selection_survives_resize(
            Some(vec2(400.0, 300.0)),
            vec2(400.0, 300.0)
        ));
        assert!(!selection_survives_resize(
            Some(vec2(400.0, 300.0)),
            vec2(200.0, 150.0)
        ));
    }

    #[test]
    fn finish_clears_gesture_state() {
        // Escape mid-draw routes through the same teardown.
        let mut tool = CropTool::new(checker_image(), ImageFormat::Png);
        tool.selection = Some(sel(1.0, 1.0, 2.0, 2.0));
        tool.drag = DragState::Drawing {
            anchor: pos2(1.0, 1.0),
        };
        let outcome = tool.finish(CropOutcome::Cancelled);
        assert!(matches!(outcome, CropOutcome::Cancelled));
        assert_eq!(tool.selection, None);
        assert_eq!(tool.drag, DragState::Idle);
    }
}
