use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::CameraConfig;

/// Capture parameters accepted by the stream and still-capture endpoints.
///
/// Values are kept as the caller sent them and only interpreted when a
/// command line is built, so a merge never loses what the client asked for.
/// Unknown keys are ignored by serde, which keeps older clients working.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter: Option<String>,      // microseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<String>,         // analog gain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ev: Option<String>,           // exposure compensation index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awb: Option<String>,          // white balance mode, e.g. "daylight"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awbgains: Option<String>,     // explicit "red,blue" gain pair, wins over awb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<String>,
}

impl StreamSettings {
    /// Overlay every entry present in `update` onto `self`.
    pub fn merge(&mut self, update: &StreamSettings) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }

        take(&mut self.shutter, &update.shutter);
        take(&mut self.gain, &update.gain);
        take(&mut self.ev, &update.ev);
        take(&mut self.awb, &update.awb);
        take(&mut self.awbgains, &update.awbgains);
        take(&mut self.brightness, &update.brightness);
        take(&mut self.contrast, &update.contrast);
        take(&mut self.saturation, &update.saturation);
        take(&mut self.sharpness, &update.sharpness);
        take(&mut self.denoise, &update.denoise);
        take(&mut self.framerate, &update.framerate);
    }

    /// Settings without a frame rate, for the legacy live endpoints.
    pub fn without_framerate(mut self) -> Self {
        self.framerate = None;
        self
    }

    /// Effective frame rate: the requested one when it is a positive number.
    pub fn framerate_or(&self, default: u32) -> u32 {
        positive("framerate", &self.framerate)
            .map(|v| v as u32)
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    /// Argument list for the continuous MJPEG producer writing to stdout.
    pub fn stream_args(&self, camera: &CameraConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--nopreview".into(),
            "--camera".into(), camera.index.to_string(),
            "--codec".into(), "mjpeg".into(),
            "--quality".into(), camera.stream_quality.to_string(),
            "--width".into(), camera.width.to_string(),
            "--height".into(), camera.height.to_string(),
            "--framerate".into(), self.framerate_or(camera.default_framerate).to_string(),
            "--timeout".into(), "0".into(),   // run until stopped
            "--output".into(), "-".into(),
        ];
        self.push_tuning_args(&mut args);
        args
    }

    /// Argument list for a single still written to `output`.
    pub fn still_args(&self, camera: &CameraConfig, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--immediate".into(),
            "--nopreview".into(),
            "--camera".into(), camera.index.to_string(),
            "--encoding".into(), "jpg".into(),
            "--quality".into(), camera.still_quality.to_string(),
            "--output".into(), output.display().to_string(),
        ];
        self.push_tuning_args(&mut args);
        args
    }

    fn push_tuning_args(&self, args: &mut Vec<String>) {
        if let Some(shutter) = positive("shutter", &self.shutter) {
            args.push("--shutter".into());
            args.push((shutter as u64).to_string());
        }
        if positive("gain", &self.gain).is_some() {
            push_raw(args, "--gain", &self.gain);
        }

        if non_empty(&self.awbgains).is_some() {
            push_raw(args, "--awbgains", &self.awbgains);
        } else if non_empty(&self.awb).is_some() {
            push_raw(args, "--awb", &self.awb);
        } else {
            args.push("--awb".into());
            args.push("auto".into());
        }

        for (flag, name, value) in [
            ("--brightness", "brightness", &self.brightness),
            ("--contrast", "contrast", &self.contrast),
            ("--saturation", "saturation", &self.saturation),
            ("--sharpness", "sharpness", &self.sharpness),
        ] {
            if numeric(name, value).is_some() {
                push_raw(args, flag, value);
            }
        }

        if non_empty(&self.denoise).is_some() {
            push_raw(args, "--denoise", &self.denoise);
        }
        if numeric("ev", &self.ev).is_some() {
            push_raw(args, "--ev", &self.ev);
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn push_raw(args: &mut Vec<String>, flag: &str, value: &Option<String>) {
    if let Some(v) = non_empty(value) {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

fn numeric(name: &str, value: &Option<String>) -> Option<f64> {
    let raw = non_empty(value)?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            warn!("Ignoring non-numeric {} value '{}'", name, raw);
            None
        }
    }
}

fn positive(name: &str, value: &Option<String>) -> Option<f64> {
    numeric(name, value).filter(|v| *v > 0.0)
}
