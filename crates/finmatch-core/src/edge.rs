//! Edge detection feeding the edge refiner.
//!
//! The refiner only needs a gradient-magnitude map, but the binary edge
//! map is returned too so callers can judge whether detection found
//! anything useful (see [`EdgeChannel::Auto`]).
//!
//! [`CannyEdgeDetector`] follows the usual Canny stages (Gaussian blur,
//! Sobel gradients, non-maximum suppression, hysteresis) with thresholds
//! given as fractions of the strongest thinned gradient instead of
//! absolute values, so the same settings work across exposures.
//! Hysteresis grows edges through all eight neighbours with explicit
//! bounds checks, so edges touching the image border are safe.

use std::fmt;

use image::{GrayImage, Luma, RgbaImage, imageops};
use imageproc::definitions::Image;
use imageproc::filter::{filter_clamped, gaussian_blur_f32};
use imageproc::kernel;
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, EngineError, Window};

/// Which image channel edge detection runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgeChannel {
    /// Grayscale first, cyan intensity if grayscale finds too few edges.
    #[default]
    Auto,
    Grayscale,
    /// CMYK cyan component; separates grey fins from blue water better
    /// than luminance does.
    Cyan,
}

/// Output of edge detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMaps {
    /// Binary map: 255 on edges, 0 elsewhere.
    pub edges: GrayImage,
    /// Gradient magnitude scaled to `0..=255`.
    pub magnitude: GrayImage,
}

impl EdgeMaps {
    /// Number of edge pixels in the binary map.
    #[must_use]
    pub fn edge_pixel_count(&self) -> usize {
        self.edges.pixels().filter(|p| p.0[0] > 0).count()
    }

    /// Place both maps at `window`'s offset inside a blank canvas of the
    /// given size.
    #[must_use]
    pub fn embed(&self, window: Window, dimensions: Dimensions) -> Self {
        Self {
            edges: embed_window(&self.edges, window, dimensions),
            magnitude: embed_window(&self.magnitude, window, dimensions),
        }
    }
}

/// Produces edge maps from a single-channel image.
pub trait EdgeDetector: fmt::Debug + Send + Sync {
    /// Detect edges after blurring with `sigma`; `low` and `high` are
    /// hysteresis thresholds in `(0, 1]`.
    fn detect(&self, image: &GrayImage, sigma: f32, low: f32, high: f32) -> EdgeMaps;
}

/// Default [`EdgeDetector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CannyEdgeDetector;

impl EdgeDetector for CannyEdgeDetector {
    fn detect(&self, image: &GrayImage, sigma: f32, low: f32, high: f32) -> EdgeMaps {
        let (w, h) = image.dimensions();
        if w < 3 || h < 3 {
            return EdgeMaps {
                edges: GrayImage::new(w, h),
                magnitude: GrayImage::new(w, h),
            };
        }

        let blurred = if sigma > 0.0 {
            gaussian_blur_f32(image, sigma)
        } else {
            image.clone()
        };
        let gx: Image<Luma<i16>> = filter_clamped(&blurred, kernel::SOBEL_HORIZONTAL_3X3);
        let gy: Image<Luma<i16>> = filter_clamped(&blurred, kernel::SOBEL_VERTICAL_3X3);
        let gradient = Gradient::new(&gx, &gy);

        let thinned = gradient.non_maximum_suppression();
        let strongest = thinned.iter().copied().fold(0.0_f32, f32::max);
        let edges = if strongest > 0.0 {
            let high_threshold = strongest * high;
            hysteresis(&thinned, w, h, high_threshold * low, high_threshold)
        } else {
            vec![0; thinned.len()]
        };

        EdgeMaps {
            edges: from_values(w, h, &edges),
            magnitude: from_values(w, h, &gradient.scaled_magnitude()),
        }
    }
}

fn from_values(w: u32, h: u32, values: &[u8]) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| Luma([values[(y * w + x) as usize]]))
}

/// Sobel gradients of one image, row-major.
struct Gradient {
    width: u32,
    height: u32,
    gx: Vec<f32>,
    gy: Vec<f32>,
    magnitude: Vec<f32>,
}

impl Gradient {
    fn new(gx: &Image<Luma<i16>>, gy: &Image<Luma<i16>>) -> Self {
        let (width, height) = gx.dimensions();
        let gx: Vec<f32> = gx.pixels().map(|p| f32::from(p.0[0])).collect();
        let gy: Vec<f32> = gy.pixels().map(|p| f32::from(p.0[0])).collect();
        let magnitude = gx.iter().zip(&gy).map(|(h, v)| h.hypot(*v)).collect();
        Self {
            width,
            height,
            gx,
            gy,
            magnitude,
        }
    }

    const fn at(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    /// Keep only pixels that are maxima along their gradient direction.
    fn non_maximum_suppression(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.magnitude.len()];
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                let i = self.at(x, y);
                let mut angle = self.gy[i].atan2(self.gx[i]).to_degrees();
                if angle < 0.0 {
                    angle += 180.0;
                }
                let (a, b) = if (22.5..67.5).contains(&angle) {
                    (self.at(x + 1, y + 1), self.at(x - 1, y - 1))
                } else if (67.5..112.5).contains(&angle) {
                    (self.at(x, y - 1), self.at(x, y + 1))
                } else if (112.5..157.5).contains(&angle) {
                    (self.at(x - 1, y + 1), self.at(x + 1, y - 1))
                } else {
                    (self.at(x - 1, y), self.at(x + 1, y))
                };
                let m = self.magnitude[i];
                if m >= self.magnitude[a] && m >= self.magnitude[b] {
                    out[i] = m;
                }
            }
        }
        out
    }

    /// Magnitude normalized so the strongest gradient is 255.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn scaled_magnitude(&self) -> Vec<u8> {
        let max = self.magnitude.iter().copied().fold(0.0_f32, f32::max);
        if max <= 0.0 {
            return vec![0; self.magnitude.len()];
        }
        self.magnitude
            .iter()
            .map(|m| (m / max * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect()
    }
}

/// Two-threshold edge tracking: pixels at or above `high` seed edges,
/// which then grow through 8-connected neighbours at or above `low`.
fn hysteresis(thinned: &[f32], w: u32, h: u32, low: f32, high: f32) -> Vec<u8> {
    let at = |x: u32, y: u32| (y * w + x) as usize;
    let mut out = vec![0_u8; thinned.len()];
    let mut stack = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            if thinned[at(x, y)] < high || out[at(x, y)] != 0 {
                continue;
            }
            out[at(x, y)] = 255;
            stack.push((x, y));
            while let Some((cx, cy)) = stack.pop() {
                for dy in -1_i32..=1 {
                    for dx in -1_i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let (Some(nx), Some(ny)) =
                            (cx.checked_add_signed(dx), cy.checked_add_signed(dy))
                        else {
                            continue;
                        };
                        if nx >= w || ny >= h {
                            continue;
                        }
                        let n = at(nx, ny);
                        if out[n] == 0 && thinned[n] >= low {
                            out[n] = 255;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
        }
    }
    out
}

/// Luma conversion with the `image` crate's Rec. 709 weights.
#[must_use = "returns the grayscale image"]
pub fn to_grayscale(image: &RgbaImage) -> GrayImage {
    imageops::grayscale(image)
}

/// Cyan component of the CMYK decomposition, scaled to `0..=255`.
///
/// Pure black has no defined cyan and maps to zero.
#[must_use = "returns the cyan intensity image"]
pub fn to_cyan_intensity(image: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        let r = f32::from(r) / 255.0;
        let key = 1.0 - r.max(f32::from(g) / 255.0).max(f32::from(b) / 255.0);
        if key >= 1.0 {
            return Luma([0]);
        }
        let cyan = (1.0 - r - key) / (1.0 - key);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = (cyan * 255.0).round().clamp(0.0, 255.0) as u8;
        Luma([value])
    })
}

/// Convert a photo to the single channel requested. [`EdgeChannel::Auto`]
/// means grayscale here; the fallback is the refiner's decision.
#[must_use]
pub fn channel_image(image: &RgbaImage, channel: EdgeChannel) -> GrayImage {
    match channel {
        EdgeChannel::Auto | EdgeChannel::Grayscale => to_grayscale(image),
        EdgeChannel::Cyan => to_cyan_intensity(image),
    }
}

/// Copy out the part of `image` inside `window` (clamped to the image).
#[must_use]
pub fn crop_window(image: &GrayImage, window: Window) -> GrayImage {
    let (w, h) = image.dimensions();
    let window = window.clamp_to(Dimensions {
        width: w,
        height: h,
    });
    imageops::crop_imm(image, window.left, window.top, window.width(), window.height())
        .to_image()
}

/// Paste `cropped` at `window`'s origin in a black canvas of
/// `dimensions`.
#[must_use]
pub fn embed_window(cropped: &GrayImage, window: Window, dimensions: Dimensions) -> GrayImage {
    let mut canvas = GrayImage::new(dimensions.width, dimensions.height);
    imageops::replace(
        &mut canvas,
        cropped,
        i64::from(window.left),
        i64::from(window.top),
    );
    canvas
}

/// Run `detector` on one channel of the windowed region of `image` and
/// return full-size maps with everything outside the window blank.
#[must_use]
pub fn detect_in_window(
    detector: &dyn EdgeDetector,
    image: &RgbaImage,
    window: Window,
    channel: EdgeChannel,
    sigma: f32,
    low: f32,
    high: f32,
) -> EdgeMaps {
    let dimensions = Dimensions {
        width: image.width(),
        height: image.height(),
    };
    let window = window.clamp_to(dimensions);
    let cropped = crop_window(&channel_image(image, channel), window);
    detector
        .detect(&cropped, sigma, low, high)
        .embed(window, dimensions)
}

/// Decode an encoded photo (PNG, JPEG, ...) into RGBA.
///
/// # Errors
///
/// Returns [`EngineError::ImageDecode`] if the bytes are not a
/// recognised image.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, EngineError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::Rgba;

    /// 20x20 image with a sharp vertical boundary at x = 10.
    fn sharp_edge_image() -> GrayImage {
        GrayImage::from_fn(20, 20, |x, _| if x < 10 { Luma([0]) } else { Luma([255]) })
    }

    #[test]
    fn blank_image_has_no_edges() {
        let img = GrayImage::from_pixel(20, 20, Luma([128]));
        let maps = CannyEdgeDetector.detect(&img, 1.0, 0.3, 0.8);
        assert_eq!(maps.edge_pixel_count(), 0);
        assert!(maps.magnitude.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn sharp_edge_is_found_near_boundary() {
        let maps = CannyEdgeDetector.detect(&sharp_edge_image(), 1.0, 0.3, 0.8);
        assert!(maps.edge_pixel_count() > 0);
        for (x, _, p) in maps.edges.enumerate_pixels() {
            if p.0[0] > 0 {
                assert!((7..=12).contains(&x), "edge pixel at x = {x}");
            }
        }
        assert_eq!(maps.magnitude.pixels().map(|p| p.0[0]).max(), Some(255));
    }

    #[test]
    fn border_edges_do_not_panic() {
        let img = GrayImage::from_fn(10, 10, |x, _| if x == 1 { Luma([255]) } else { Luma([0]) });
        let maps = CannyEdgeDetector.detect(&img, 0.5, 0.01, 0.02);
        assert_eq!(maps.edges.dimensions(), (10, 10));
    }

    #[test]
    fn tiny_images_return_empty_maps() {
        let maps = CannyEdgeDetector.detect(&GrayImage::new(2, 7), 1.0, 0.3, 0.8);
        assert_eq!(maps.edges.dimensions(), (2, 7));
        assert_eq!(maps.edge_pixel_count(), 0);
    }

    #[test]
    fn cyan_of_primaries() {
        let img = RgbaImage::from_fn(4, 1, |x, _| match x {
            0 => Rgba([0, 255, 255, 255]),
            1 => Rgba([255, 0, 0, 255]),
            2 => Rgba([0, 0, 0, 255]),
            _ => Rgba([255, 255, 255, 255]),
        });
        let cyan = to_cyan_intensity(&img);
        assert_eq!(cyan.get_pixel(0, 0).0[0], 255);
        assert_eq!(cyan.get_pixel(1, 0).0[0], 0);
        assert_eq!(cyan.get_pixel(2, 0).0[0], 0);
        assert_eq!(cyan.get_pixel(3, 0).0[0], 0);
    }

    #[test]
    fn window_detection_blanks_outside() {
        let img = RgbaImage::from_fn(40, 40, |x, _| {
            if x < 20 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let window = Window {
            left: 10,
            top: 10,
            right: 30,
            bottom: 30,
        };
        let maps = detect_in_window(
            &CannyEdgeDetector,
            &img,
            window,
            EdgeChannel::Grayscale,
            1.0,
            0.3,
            0.8,
        );
        assert_eq!(maps.edges.dimensions(), (40, 40));
        assert!(maps.edge_pixel_count() > 0);
        for (x, y, p) in maps.edges.enumerate_pixels() {
            if p.0[0] > 0 {
                assert!((10..30).contains(&x) && (10..30).contains(&y));
            }
        }
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(matches!(
            decode_image(&[0xFF, 0xFE, 0x00, 0x01]),
            Err(EngineError::ImageDecode(_))
        ));
    }
}
