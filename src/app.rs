//! Application shell: the generate/edit form, the upload strip, the results
//! grid, and the worker thread that talks to the API.

use std::sync::mpsc;

use anyhow::{Context, Result};
use eframe::egui;
use image::{DynamicImage, ImageFormat};

use crate::api::{AspectRatio, GeminiClient, ImagePayload};
use crate::cropper::{CropOutcome, CropTool};

const MAX_EDIT_IMAGES: usize = 4;
const THUMBNAIL_SIZE: f32 = 140.0;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Generate,
    Edit,
}

/// Response from the worker thread, drained at the top of each frame.
enum ApiEvent {
    Generated(Result<Vec<ImagePayload>>),
    Edited(Result<ImagePayload>),
    Analyzed(Result<String>),
}

/// An image the user uploaded for editing, kept both encoded (for the API)
/// and decoded (for display and cropping).
struct Upload {
    payload: ImagePayload,
    decoded: DynamicImage,
    format: ImageFormat,
    texture: Option<egui::TextureHandle>,
}

impl Upload {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let format = image::guess_format(&bytes).context("unrecognized image format")?;
        let decoded = image::load_from_memory(&bytes).context("could not decode image")?;
        Ok(Self {
            payload: ImagePayload {
                mime: format.to_mime_type().to_owned(),
                bytes,
            },
            decoded,
            format,
            texture: None,
        })
    }
}

/// A generated or edited image returned by the API.
struct ResultImage {
    payload: ImagePayload,
    decoded: DynamicImage,
    texture: Option<egui::TextureHandle>,
}

impl ResultImage {
    fn from_payload(payload: ImagePayload) -> Result<Self> {
        let decoded =
            image::load_from_memory(&payload.bytes).context("could not decode API image")?;
        Ok(Self {
            payload,
            decoded,
            texture: None,
        })
    }
}

fn load_texture(
    ctx: &egui::Context,
    name: String,
    image: &DynamicImage,
) -> egui::TextureHandle {
    let size = [image.width() as _, image.height() as _];
    let buffer = image.to_rgba8();
    let pixels = buffer.as_flat_samples();
    let color_image = egui::ColorImage::from_rgba_unmultiplied(size, pixels.as_slice());
    ctx.load_texture(name, color_image, egui::TextureOptions::LINEAR)
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

pub struct StudioApp {
    client: GeminiClient,
    mode: Mode,
    prompt: String,
    aspect_ratio: AspectRatio,
    image_count: usize,
    uploads: Vec<Upload>,
    results: Vec<ResultImage>,
    loading: bool,
    analyzing: Option<usize>,
    error: Option<String>,
    cropping: Option<(usize, CropTool)>,
    events_tx: mpsc::Sender<ApiEvent>,
    events_rx: mpsc::Receiver<ApiEvent>,
}

impl StudioApp {
    pub fn new(_cc: &eframe::CreationContext<'_>) -> Result<Self> {
        let client = GeminiClient::from_env()?;
        let (events_tx, events_rx) = mpsc::channel();
        Ok(Self {
            client,
            mode: Mode::Generate,
            prompt: String::new(),
            aspect_ratio: AspectRatio::default(),
            image_count: 1,
            uploads: Vec::new(),
            results: Vec::new(),
            loading: false,
            analyzing: None,
            error: None,
            cropping: None,
            events_tx,
            events_rx,
        })
    }

    fn busy(&self) -> bool {
        self.loading || self.analyzing.is_some()
    }

    fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            self.mode = mode;
            self.prompt.clear();
            self.uploads.clear();
            self.results.clear();
            self.error = None;
            self.image_count = 1;
        }
    }

    fn reset(&mut self) {
        self.prompt.clear();
        self.results.clear();
        self.error = None;
        match self.mode {
            Mode::Generate => {
                self.aspect_ratio = AspectRatio::default();
                self.image_count = 1;
            }
            Mode::Edit => self.uploads.clear(),
        }
    }

    fn dirty(&self) -> bool {
        match self.mode {
            Mode::Generate => {
                !self.prompt.trim().is_empty()
                    || self.aspect_ratio != AspectRatio::default()
                    || self.image_count != 1
            }
            Mode::Edit => !self.prompt.trim().is_empty() || !self.uploads.is_empty(),
        }
    }

    fn add_upload(&mut self, bytes: Vec<u8>) {
        if self.uploads.len() >= MAX_EDIT_IMAGES {
            self.error = Some(format!("You can upload at most {MAX_EDIT_IMAGES} images."));
            return;
        }
        match Upload::from_bytes(bytes) {
            Ok(upload) => {
                self.uploads.push(upload);
                self.results.clear();
                self.error = None;
            }
            Err(err) => {
                log::warn!("rejected upload: {err:#}");
                self.error = Some(format!("Could not read image: {err:#}"));
            }
        }
    }

    fn pick_upload(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("Image", &["png", "jpg", "jpeg", "bmp", "webp"])
            .pick_file()
        {
            match std::fs::read(&path) {
                Ok(bytes) => self.add_upload(bytes),
                Err(err) => self.error = Some(format!("Could not read {}: {err}", path.display())),
            }
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        if self.mode != Mode::Edit || self.busy() {
            return;
        }
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        for file in dropped {
            if let Some(path) = &file.path {
                match std::fs::read(path) {
                    Ok(bytes) => self.add_upload(bytes),
                    Err(err) => {
                        self.error = Some(format!("Could not read {}: {err}", path.display()))
                    }
                }
            }
        }
    }

    fn submit(&mut self, ctx: &egui::Context) {
        if self.prompt.trim().is_empty() {
            self.error = Some("Please enter a prompt.".to_owned());
            return;
        }
        if self.mode == Mode::Edit && self.uploads.is_empty() {
            self.error = Some("Please upload an image to edit.".to_owned());
            return;
        }

        self.loading = true;
        self.error = None;
        self.results.clear();

        let client = self.client.clone();
        let tx = self.events_tx.clone();
        let ctx = ctx.clone();
        let prompt = self.prompt.clone();

        match self.mode {
            Mode::Generate => {
                let ratio = self.aspect_ratio;
                let count = self.image_count;
                std::thread::spawn(move || {
                    let result = client.generate(&prompt, ratio, count);
                    let _ = tx.send(ApiEvent::Generated(result));
                    ctx.request_repaint();
                });
            }
            Mode::Edit => {
                let images: Vec<ImagePayload> =
                    self.uploads.iter().map(|u| u.payload.clone()).collect();
                std::thread::spawn(move || {
                    let result = client.edit(&images, &prompt);
                    let _ = tx.send(ApiEvent::Edited(result));
                    ctx.request_repaint();
                });
            }
        }
    }

    fn analyze(&mut self, index: usize, ctx: &egui::Context) {
        self.analyzing = Some(index);
        self.error = None;

        let client = self.client.clone();
        let tx = self.events_tx.clone();
        let ctx = ctx.clone();
        let image = self.uploads[index].payload.clone();
        std::thread::spawn(move || {
            let result = client.analyze(&image);
            let _ = tx.send(ApiEvent::Analyzed(result));
            ctx.request_repaint();
        });
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ApiEvent::Generated(Ok(images)) => {
                    self.loading = false;
                    log::info!("received {} generated image(s)", images.len());
                    self.set_results(images);
                }
                ApiEvent::Generated(Err(err)) => {
                    self.loading = false;
                    log::error!("generate failed: {err:#}");
                    self.error = Some(format!("Generation failed: {err:#}"));
                }
                ApiEvent::Edited(Ok(payload)) => {
                    self.loading = false;
                    log::info!("received edited image ({})", payload.mime);
                    self.set_results(vec![payload]);
                    self.uploads.clear();
                    self.cropping = None;
                }
                ApiEvent::Edited(Err(err)) => {
                    self.loading = false;
                    log::error!("edit failed: {err:#}");
                    self.error = Some(format!("Edit failed: {err:#}"));
                }
                ApiEvent::Analyzed(Ok(text)) => {
                    self.analyzing = None;
                    self.prompt = text;
                }
                ApiEvent::Analyzed(Err(err)) => {
                    self.analyzing = None;
                    log::error!("analyze failed: {err:#}");
                    self.error = Some(format!("Analysis failed: {err:#}"));
                }
            }
        }
    }

    fn set_results(&mut self, images: Vec<ImagePayload>) {
        self.results.clear();
        for payload in images {
            match ResultImage::from_payload(payload) {
                Ok(result) => self.results.push(result),
                Err(err) => {
                    log::error!("dropping undecodable result: {err:#}");
                    self.error = Some(format!("Received an unreadable image: {err:#}"));
                }
            }
        }
    }

    fn save_result(&mut self, index: usize) {
        let payload = &self.results[index].payload;
        let ext = extension_for_mime(&payload.mime);
        let Some(path) = rfd::FileDialog::new()
            .set_file_name(format!("prompt-studio-{}.{ext}", index + 1))
            .add_filter("Image", &[ext])
            .save_file()
        else {
            return;
        };
        if let Err(err) = std::fs::write(&path, &payload.bytes) {
            log::error!("failed to save image: {err}");
            self.error = Some(format!("Could not save image: {err}"));
        } else {
            log::info!("saved result to {}", path.display());
        }
    }

    fn finish_crop(&mut self, index: usize, outcome: CropOutcome) {
        match outcome {
            CropOutcome::Applied(result) => match Upload::from_bytes(result.bytes) {
                Ok(upload) if index < self.uploads.len() => self.uploads[index] = upload,
                Ok(_) => {}
                Err(err) => self.error = Some(format!("Crop produced an unreadable image: {err:#}")),
            },
            CropOutcome::Cancelled => {}
            CropOutcome::Failed(err) => {
                log::error!("crop failed: {err:#}");
                self.error = Some(format!("Crop failed: {err:#}"));
            }
        }
    }

    fn prompt_form(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.label(match self.mode {
            Mode::Generate => "Describe the image you want to create.",
            Mode::Edit => "Upload images, then describe the change you want.",
        });

        ui.add_enabled(
            !self.busy(),
            egui::TextEdit::multiline(&mut self.prompt)
                .desired_rows(3)
                .desired_width(f32::INFINITY)
                .hint_text(match self.mode {
                    Mode::Generate => "e.g. a majestic lion wearing a crown, cinematic lighting",
                    Mode::Edit => "e.g. add a party hat to the cat, set the background in space",
                }),
        );

        ui.horizontal(|ui| {
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                let label = match self.mode {
                    Mode::Generate => "Generate",
                    Mode::Edit => "Edit",
                };
                let can_submit = !self.busy() && !self.prompt.trim().is_empty();
                if ui.add_enabled(can_submit, egui::Button::new(label)).clicked() {
                    self.submit(ctx);
                }
                if self.loading {
                    ui.add(egui::Spinner::new());
                }
                if self.dirty() && ui.add_enabled(!self.busy(), egui::Button::new("Reset")).clicked()
                {
                    self.reset();
                }
            });
        });

        if self.mode == Mode::Generate {
            ui.add_space(4.0);
            ui.horizontal(|ui| {
                ui.label("Aspect ratio:");
                for ratio in AspectRatio::ALL {
                    ui.selectable_value(&mut self.aspect_ratio, ratio, ratio.as_str());
                }
                ui.separator();
                ui.label("Images:");
                for count in 1..=MAX_EDIT_IMAGES {
                    ui.selectable_value(&mut self.image_count, count, count.to_string());
                }
            });
        }
    }

    fn upload_strip(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        let mut remove = None;
        let mut crop = None;
        let mut analyze = None;

        ui.horizontal_wrapped(|ui| {
            for (index, upload) in self.uploads.iter_mut().enumerate() {
                let texture = upload
                    .texture
                    .get_or_insert_with(|| {
                        load_texture(ctx, format!("upload-{index}"), &upload.decoded)
                    })
                    .clone();

                ui.vertical(|ui| {
                    let size = texture.size_vec2();
                    let scale = (THUMBNAIL_SIZE / size.x).min(THUMBNAIL_SIZE / size.y);
                    ui.image((texture.id(), size * scale));
                    ui.horizontal(|ui| {
                        let enabled = !self.loading && self.analyzing.is_none();
                        if ui.add_enabled(enabled, egui::Button::new("✕")).clicked() {
                            remove = Some(index);
                        }
                        if ui.add_enabled(enabled, egui::Button::new("Crop")).clicked() {
                            crop = Some(index);
                        }
                        if self.analyzing == Some(index) {
                            ui.add(egui::Spinner::new());
                        } else if ui
                            .add_enabled(enabled, egui::Button::new("Analyze"))
                            .on_hover_text("Build a prompt from this image")
                            .clicked()
                        {
                            analyze = Some(index);
                        }
                    });
                });
            }

            if self.uploads.len() < MAX_EDIT_IMAGES {
                ui.vertical(|ui| {
                    let label = if self.uploads.is_empty() {
                        "Upload image…"
                    } else {
                        "Add another…"
                    };
                    if ui.add_enabled(!self.busy(), egui::Button::new(label)).clicked() {
                        self.pick_upload();
                    }
                    ui.small(format!("({}/{MAX_EDIT_IMAGES}) or drag and drop", self.uploads.len()));
                });
            }
        });

        if let Some(index) = remove {
            self.uploads.remove(index);
        }
        if let Some(index) = crop {
            let upload = &self.uploads[index];
            self.cropping = Some((
                index,
                CropTool::new(upload.decoded.clone(), upload.format),
            ));
        }
        if let Some(index) = analyze {
            self.analyze(index, ctx);
        }
    }

    fn results_grid(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        let mut save = None;
        let columns = self.results.len().min(2).max(1) as f32;
        let cell = (ui.available_width() / columns - 16.0).max(64.0);

        ui.horizontal_wrapped(|ui| {
            for (index, result) in self.results.iter_mut().enumerate() {
                let texture = result
                    .texture
                    .get_or_insert_with(|| {
                        load_texture(ctx, format!("result-{index}"), &result.decoded)
                    })
                    .clone();

                ui.vertical(|ui| {
                    let size = texture.size_vec2();
                    let scale = (cell / size.x).min(cell / size.y).min(1.0);
                    ui.image((texture.id(), size * scale));
                    if ui.button("Save").clicked() {
                        save = Some(index);
                    }
                });
            }
        });

        if let Some(index) = save {
            self.save_result(index);
        }
    }
}

impl eframe::App for StudioApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();
        self.handle_dropped_files(ctx);

        // The crop tool is modal: exactly one outcome ends it, then it is
        // dropped whatever that outcome was.
        if let Some((index, tool)) = self.cropping.as_mut() {
            let index = *index;
            if let Some(outcome) = tool.show(ctx) {
                self.cropping = None;
                self.finish_crop(index, outcome);
            }
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add_enabled_ui(self.cropping.is_none(), |ui| {
                ui.vertical_centered(|ui| {
                    ui.heading("Prompt Studio");
                });
                ui.add_space(8.0);

                ui.horizontal(|ui| {
                    let busy = self.busy();
                    let mut mode = self.mode;
                    ui.add_enabled_ui(!busy, |ui| {
                        ui.selectable_value(&mut mode, Mode::Generate, "Generate");
                        ui.selectable_value(&mut mode, Mode::Edit, "Edit");
                    });
                    self.set_mode(mode);
                });
                ui.add_space(4.0);

                self.prompt_form(ui, ctx);

                if let Some(error) = self.error.clone() {
                    ui.add_space(4.0);
                    ui.colored_label(egui::Color32::LIGHT_RED, error);
                }

                ui.separator();

                if self.mode == Mode::Edit && self.results.is_empty() {
                    self.upload_strip(ui, ctx);
                }
                if !self.results.is_empty() {
                    egui::ScrollArea::vertical().show(ui, |ui| {
                        self.results_grid(ui, ctx);
                    });
                }
            });
        });
    }
}
