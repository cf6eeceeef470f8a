#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")] // hide console window on Windows in release

mod api;
mod app;
mod cropper;

use eframe::egui;

use crate::app::StudioApp;

fn main() -> eframe::Result {
    env_logger::init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([960.0, 720.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Prompt Studio",
        options,
        Box::new(|cc| Ok(Box::new(StudioApp::new(cc)?))),
    )
}
