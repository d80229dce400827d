//! Deck compositing: crossfade, resampling to the display size and colour
//! correction.

use serde::{Deserialize, Serialize};

use crate::{
    render::{Framebuffer, CHANNELS},
    Parameter,
};

/// Draws `top` over an opaque `base` at `opacity`, per channel.
pub fn overlay(base: &Framebuffer, top: &Framebuffer, opacity: f32) -> Framebuffer {
    let opacity = sanitize_unit(opacity);
    let keep = 1.0 - opacity;
    let pixels = base
        .pixels()
        .iter()
        .zip(top.pixels())
        .map(|(&b, &t)| (b as f32 * keep + t as f32 * opacity).round().clamp(0.0, 255.0) as u8)
        .collect();
    Framebuffer::from_parts(base.width(), base.height(), pixels)
}

/// Blends deck `a` and deck `b`. Up to the midpoint `a` is the opaque base
/// and `b` is drawn over it at `value`; past it the roles swap and `a` is
/// drawn over `b` at `1 - value`, so both ends reproduce their deck exactly.
/// `b` is resampled to `a`'s size when they differ.
pub fn crossfade(a: &Framebuffer, b: &Framebuffer, value: f32) -> Framebuffer {
    let value = sanitize_unit(value);
    let b = if (a.width(), a.height()) == (b.width(), b.height()) {
        b.clone()
    } else {
        resample(b, a.width(), a.height())
    };

    if value <= 0.5 {
        overlay(a, &b, value)
    } else {
        overlay(&b, a, 1.0 - value)
    }
}

fn sanitize_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Area-averaging resample. Each output pixel is the coverage-weighted mean
/// of the source pixels under it, which makes downscaling smooth and the
/// result deterministic.
pub fn resample(src: &Framebuffer, width: u32, height: u32) -> Framebuffer {
    if (src.width(), src.height()) == (width, height) {
        return src.clone();
    }
    if src.is_empty() || width == 0 || height == 0 {
        return Framebuffer::filled(width, height, [0, 0, 0, 255]);
    }

    let src_w = src.width() as usize;
    let src_h = src.height() as usize;
    let dst_w = width as usize;
    let dst_h = height as usize;
    let columns = area_weights(src_w, dst_w);
    let rows = area_weights(src_h, dst_h);

    // Horizontal pass: src_h rows of dst_w pixels.
    let mut horizontal = vec![0.0_f32; src_h * dst_w * CHANNELS];
    for y in 0..src_h {
        for (x, weights) in columns.iter().enumerate() {
            let out = (y * dst_w + x) * CHANNELS;
            for &(sx, weight) in weights {
                let input = (y * src_w + sx) * CHANNELS;
                for c in 0..CHANNELS {
                    horizontal[out + c] += src.pixels()[input + c] as f32 * weight;
                }
            }
        }
    }

    let mut pixels = vec![0_u8; dst_h * dst_w * CHANNELS];
    for (y, weights) in rows.iter().enumerate() {
        for x in 0..dst_w {
            let mut acc = [0.0_f32; CHANNELS];
            for &(sy, weight) in weights {
                let input = (sy * dst_w + x) * CHANNELS;
                for (c, value) in acc.iter_mut().enumerate() {
                    *value += horizontal[input + c] * weight;
                }
            }
            let out = (y * dst_w + x) * CHANNELS;
            for (c, value) in acc.iter().enumerate() {
                pixels[out + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Framebuffer::from_parts(width, height, pixels)
}

/// For every destination index, the overlapped source indices and their
/// normalised coverage.
fn area_weights(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut weights = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src_len {
                let covered = end.min(s as f64 + 1.0) - start.max(s as f64);
                if covered > 0.0 {
                    weights.push((s, covered));
                }
                s += 1;
            }
            let total: f64 = weights.iter().map(|(_, w)| w).sum();
            weights
                .into_iter()
                .map(|(s, w)| (s, (w / total) as f32))
                .collect()
        })
        .collect()
}

/// Display colour correction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorCorrection {
    /// Added to every channel, in units of full scale. [-1, 1].
    pub brightness: f32,
    /// Scales distance from mid-grey by `1 + contrast`. [-1, 1].
    pub contrast: f32,
    /// Exponent of the output power curve.
    pub gamma: f32,
}

impl ColorCorrection {
    pub const IDENTITY: Self = Self {
        brightness: 0.0,
        contrast: 0.0,
        gamma: 1.0,
    };

    pub fn apply_channel(&self, input: u8) -> u8 {
        correct_channel(input, self.brightness, self.contrast, self.gamma)
    }

    pub fn lookup_table(&self) -> [u8; 256] {
        let mut table = [0_u8; 256];
        for (input, out) in table.iter_mut().enumerate() {
            *out = self.apply_channel(input as u8);
        }
        table
    }

    /// Corrects the colour channels; alpha is left untouched.
    pub fn apply(&self, image: &Framebuffer) -> Framebuffer {
        let table = self.lookup_table();
        let pixels = image
            .pixels()
            .chunks_exact(CHANNELS)
            .flat_map(|px| {
                [
                    table[px[0] as usize],
                    table[px[1] as usize],
                    table[px[2] as usize],
                    px[3],
                ]
            })
            .collect();
        Framebuffer::from_parts(image.width(), image.height(), pixels)
    }
}

impl Default for ColorCorrection {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Brightness shift, contrast around mid-grey, then a power curve. The
/// result is always a valid byte.
pub fn correct_channel(input: u8, brightness: f32, contrast: f32, gamma: f32) -> u8 {
    let mut value = input as f32 / 255.0 + brightness;
    value = (value - 0.5) * (1.0 + contrast).max(0.0) + 0.5;
    value = value.clamp(0.0, 1.0);
    if gamma > 0.0 && gamma != 1.0 {
        value = value.powf(gamma);
    }
    if value.is_nan() {
        return 0;
    }
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Output of one compositing cycle.
#[derive(Debug, Clone)]
pub struct ConvertedImages {
    /// Full-resolution crossfaded composite.
    pub preview: Framebuffer,
    /// Composite resampled to the display and colour corrected.
    pub display: Framebuffer,
}

/// Turns two deck framebuffers into the preview and display images. All
/// settings are parameters so UI controls and controller bindings can drive
/// them; they are read afresh on every conversion.
#[derive(Debug, Clone)]
pub struct ImageConverter {
    pub display_width: Parameter<i32>,
    pub display_height: Parameter<i32>,
    pub crossfade: Parameter<f32>,
    pub brightness: Parameter<f32>,
    pub contrast: Parameter<f32>,
    pub gamma: Parameter<f32>,
}

impl ImageConverter {
    pub fn new() -> Self {
        Self {
            display_width: Parameter::ranged("displayWidth", 32, 16, 64),
            display_height: Parameter::ranged("displayHeight", 16, 8, 32),
            crossfade: Parameter::ranged("crossfade", 0.0, 0.0, 1.0),
            brightness: Parameter::ranged("displayBrightness", 0.0, -1.0, 1.0),
            contrast: Parameter::ranged("displayContrast", 0.0, -1.0, 1.0),
            gamma: Parameter::ranged("displayGamma", 2.2, 1.5, 3.5),
        }
    }

    pub fn correction(&self) -> ColorCorrection {
        ColorCorrection {
            brightness: self.brightness.get(),
            contrast: self.contrast.get(),
            gamma: self.gamma.get(),
        }
    }

    pub fn convert(&self, a: &Framebuffer, b: &Framebuffer) -> ConvertedImages {
        let preview = crossfade(a, b, self.crossfade.get());
        let scaled = resample(
            &preview,
            self.display_width.get().max(0) as u32,
            self.display_height.get().max(0) as u32,
        );
        let display = self.correction().apply(&scaled);
        ConvertedImages { preview, display }
    }
}

impl Default for ImageConverter {
    fn default() -> Self {
        Self::new()
    }
}
