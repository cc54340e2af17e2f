//! Snapping a rough trace onto the photo's edges.
//!
//! [`EdgeRefiner::refine`] runs the snake coarse-to-fine. The working
//! contour is evenly spaced, shrunk to the starting scale, and moved
//! against a nearest-neighbour resize of the edge-magnitude map. Each
//! pass doubles the scale (and the contour) until full resolution has
//! been processed. The iteration budget is split so that each pass gets
//! half as many iterations as the one before and the passes together use
//! `max_iterations`.
//!
//! Every [`PROGRESS_INTERVAL`]th iteration the contour is rescaled to full
//! resolution and handed to the progress callback for live redraw.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use tracing::{debug, info, warn};

use crate::contour::Contour;
use crate::edge::{CannyEdgeDetector, EdgeChannel, EdgeDetector, EdgeMaps, detect_in_window};
use crate::snake::move_contour;
use crate::types::{EngineError, SnakeConfig, Window};

/// Iterations between progress reports.
pub const PROGRESS_INTERVAL: u32 = 5;

/// Snaps contours onto image edges.
#[derive(Debug)]
pub struct EdgeRefiner {
    config: SnakeConfig,
    detector: Box<dyn EdgeDetector>,
}

impl EdgeRefiner {
    /// A refiner using Canny edge detection.
    #[must_use]
    pub fn new(config: SnakeConfig) -> Self {
        Self::with_detector(config, Box::new(CannyEdgeDetector))
    }

    #[must_use]
    pub fn with_detector(config: SnakeConfig, detector: Box<dyn EdgeDetector>) -> Self {
        Self { config, detector }
    }

    #[must_use]
    pub const fn config(&self) -> &SnakeConfig {
        &self.config
    }

    fn detect(&self, image: &RgbaImage, window: Window, channel: EdgeChannel) -> EdgeMaps {
        let c = &self.config;
        detect_in_window(
            self.detector.as_ref(),
            image,
            window,
            channel,
            c.gaussian_std_dev,
            c.canny_low,
            c.canny_high,
        )
    }

    /// Full-size edge maps for the windowed part of `image`.
    ///
    /// With [`EdgeChannel::Auto`], grayscale is tried first and cyan
    /// intensity is used when grayscale finds fewer edge pixels than
    /// `min_contour_points`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientContour`] when the chosen
    /// channel (or both, for `Auto`) finds too few edge pixels.
    pub fn edge_maps(&self, image: &RgbaImage, window: Window) -> Result<EdgeMaps, EngineError> {
        let required = self.config.min_contour_points;
        let channel = self.config.channel;
        let first = match channel {
            EdgeChannel::Auto | EdgeChannel::Grayscale => EdgeChannel::Grayscale,
            EdgeChannel::Cyan => EdgeChannel::Cyan,
        };
        let maps = self.detect(image, window, first);
        let count = maps.edge_pixel_count();
        if count >= required {
            debug!(?first, edge_pixels = count, "edge detection done");
            return Ok(maps);
        }
        if channel != EdgeChannel::Auto {
            return Err(EngineError::InsufficientContour {
                points: count,
                required,
            });
        }

        warn!(
            edge_pixels = count,
            required, "grayscale found too few edges; retrying with cyan intensity"
        );
        let maps = self.detect(image, window, EdgeChannel::Cyan);
        let count = maps.edge_pixel_count();
        if count < required {
            return Err(EngineError::InsufficientContour {
                points: count,
                required,
            });
        }
        Ok(maps)
    }

    /// Snap `contour` onto the edges of `image` inside `window`.
    ///
    /// `contour` holds pixel coordinates of `image` multiplied by its scale.
    /// The result is a new contour in the same coordinates and scale;
    /// `on_progress` receives intermediate contours in that frame too.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for a bad configuration,
    /// [`EngineError::InsufficientContour`] when the contour or the edge
    /// map is too small to refine, and spacing errors from resampling.
    pub fn refine<F>(
        &self,
        contour: &Contour,
        image: &RgbaImage,
        window: Window,
        mut on_progress: F,
    ) -> Result<Contour, EngineError>
    where
        F: FnMut(&Contour),
    {
        self.config.validate()?;
        let required = self.config.min_contour_points.max(3);
        if contour.len() < required {
            return Err(EngineError::InsufficientContour {
                points: contour.len(),
                required,
            });
        }
        let maps = self.edge_maps(image, window)?;

        let scale = contour.scale();
        let mut pixels = contour.clone();
        pixels.apply_scale();

        #[allow(clippy::cast_precision_loss)]
        let spacing = (pixels.total_length(false) / self.config.target_points as f64)
            .max(self.config.min_spacing);
        let even = pixels.evenly_space(spacing)?;

        let mut ratio = self.config.start_ratio;
        let passes = pass_count(ratio);
        let budgets = pass_budgets(self.config.max_iterations, passes);
        info!(
            points = even.len(),
            spacing,
            start_ratio = ratio,
            passes,
            "refining contour"
        );

        let mut working = even.scaled(f64::from(ratio) / 100.0, 0.0, 0.0);
        for (pass, &iterations) in budgets.iter().enumerate() {
            let magnitude = resized(&maps.magnitude, ratio);
            let mut moved_total = 0;
            for i in 0..iterations {
                moved_total += move_contour(
                    &mut working,
                    &magnitude,
                    self.config.search_radius,
                    &self.config.weights,
                );
                if i % PROGRESS_INTERVAL == 0 {
                    on_progress(&to_frame(&working, ratio, scale));
                }
            }
            debug!(pass, ratio, iterations, moved_total, "snake pass done");
            ratio *= 2;
            if ratio <= 100 {
                working = working.scaled(2.0, 0.0, 0.0);
            }
        }

        let mut refined = to_frame(&working, ratio / 2, scale);
        let removed = refined.remove_knots(spacing * scale);
        info!(points = refined.len(), removed, "refinement done");
        Ok(refined)
    }
}

/// Number of doubling passes from `start_ratio` until the ratio exceeds
/// 100. At least one.
fn pass_count(start_ratio: u32) -> u32 {
    let mut ratio = start_ratio.max(1);
    let mut passes = 1;
    while ratio * 2 <= 100 {
        ratio *= 2;
        passes += 1;
    }
    passes
}

/// Split `total` so each pass gets half of the previous one's budget.
fn pass_budgets(total: u32, passes: u32) -> Vec<u32> {
    let weight_sum = (1_u32 << passes) - 1;
    let chunk = total / weight_sum;
    (0..passes).rev().map(|k| chunk << k).collect()
}

/// Nearest-neighbour resize of `image` to `ratio` percent.
fn resized(image: &GrayImage, ratio: u32) -> GrayImage {
    if ratio >= 100 {
        return image.clone();
    }
    let scale = |v: u32| (u64::from(v) * u64::from(ratio) / 100).max(1);
    let (w, h) = image.dimensions();
    imageops::resize(
        image,
        u32::try_from(scale(w)).unwrap_or(w),
        u32::try_from(scale(h)).unwrap_or(h),
        FilterType::Nearest,
    )
}

/// A contour at `ratio` percent of image pixels, brought back to image
/// pixels and then to the trace's own scale.
fn to_frame(working: &Contour, ratio: u32, scale: f64) -> Contour {
    let back = working.scaled(100.0 / f64::from(ratio), 0.0, 0.0);
    let mut framed = back.scaled(scale, 0.0, 0.0);
    framed.set_scale(scale);
    framed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{Dimensions, Point};
    use image::Rgba;

    /// Dark disc of radius 40 centred in a light 160x160 image.
    fn disc() -> RgbaImage {
        RgbaImage::from_fn(160, 160, |x, y| {
            let (dx, dy) = (f64::from(x) - 80.0, f64::from(y) - 80.0);
            if dx.hypot(dy) < 40.0 {
                Rgba([40, 40, 40, 255])
            } else {
                Rgba([220, 220, 220, 255])
            }
        })
    }

    /// Upper arc of a circle of the given radius around the disc centre.
    fn arc(radius: f64) -> Contour {
        (0..=90)
            .map(|i| {
                let a = std::f64::consts::PI * (1.0 + f64::from(i) / 90.0);
                Point::new(radius.mul_add(a.cos(), 80.0), radius.mul_add(a.sin(), 80.0))
            })
            .collect()
    }

    fn full(image: &RgbaImage) -> Window {
        Window::full(Dimensions {
            width: image.width(),
            height: image.height(),
        })
    }

    fn mean_radius_error(c: &Contour) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let n = c.len() as f64;
        c.points()
            .iter()
            .map(|p| ((p.x - 80.0).hypot(p.y - 80.0) - 40.0).abs())
            .sum::<f64>()
            / n
    }

    #[test]
    fn budgets_halve_and_sum_to_total() {
        assert_eq!(pass_count(25), 3);
        assert_eq!(pass_count(100), 1);
        assert_eq!(pass_count(13), 3);
        assert_eq!(pass_budgets(300, 3), vec![168, 84, 42]);
        assert_eq!(pass_budgets(10, 1), vec![10]);
    }

    #[test]
    fn refined_arc_moves_toward_disc_edge() {
        let image = disc();
        let rough = arc(44.0);
        let config = SnakeConfig {
            min_contour_points: 20,
            ..SnakeConfig::default()
        };
        let mut reports = 0;
        let refined = EdgeRefiner::new(config)
            .refine(&rough, &image, full(&image), |_| reports += 1)
            .unwrap();
        assert!(reports > 0);
        assert!(refined.len() >= 3);
        assert!(mean_radius_error(&refined) < mean_radius_error(&rough));
    }

    #[test]
    fn blank_image_is_insufficient() {
        let image = RgbaImage::from_pixel(64, 64, Rgba([128, 128, 128, 255]));
        let config = SnakeConfig {
            min_contour_points: 20,
            ..SnakeConfig::default()
        };
        let err = EdgeRefiner::new(config)
            .refine(&arc(20.0), &image, full(&image), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientContour { required: 20, .. }
        ));
    }

    #[test]
    fn short_trace_is_refused_before_detection() {
        let image = disc();
        let err = EdgeRefiner::new(SnakeConfig::default())
            .refine(&arc(44.0), &image, full(&image), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientContour {
                points: 91,
                required: 100
            }
        ));
    }

    #[test]
    fn tiny_contour_is_insufficient() {
        let image = disc();
        let err = EdgeRefiner::new(SnakeConfig::default())
            .refine(
                &Contour::from_xy(&[(1.0, 1.0), (2.0, 2.0)]),
                &image,
                full(&image),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientContour { points: 2, .. }
        ));
    }

    #[test]
    fn auto_falls_back_to_cyan() {
        // Both colours have identical Rec. 709 luma; only cyan tells them apart.
        let image = RgbaImage::from_fn(100, 100, |x, y| {
            let (dx, dy) = (f64::from(x) - 50.0, f64::from(y) - 50.0);
            if dx.hypot(dy) < 25.0 {
                Rgba([18, 121, 80, 255])
            } else {
                Rgba([230, 60, 60, 255])
            }
        });
        let config = SnakeConfig {
            min_contour_points: 40,
            ..SnakeConfig::default()
        };
        let gray_only = EdgeRefiner::new(SnakeConfig {
            channel: EdgeChannel::Grayscale,
            ..config.clone()
        });
        assert!(gray_only.edge_maps(&image, full(&image)).is_err());
        let maps = EdgeRefiner::new(config)
            .edge_maps(&image, full(&image))
            .unwrap();
        assert!(maps.edge_pixel_count() >= 40);
    }
}
