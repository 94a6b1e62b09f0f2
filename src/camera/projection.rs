//! World-to-screen projection

use super::ViewMatrix;
use crate::config::{defaults, ViewportConfig};
use crate::math::{Vec2, Vec3};

/// Screen dimensions used for projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    width: f32,
    height: f32,
}

impl Viewport {
    /// Use `width` x `height`, falling back to the default resolution when
    /// either is not positive
    pub fn resolve(width: i32, height: i32) -> Self {
        let (width, height) = if width > 0 && height > 0 {
            (width, height)
        } else {
            (defaults::DEFAULT_WIDTH, defaults::DEFAULT_HEIGHT)
        };

        Self {
            width: width as f32,
            height: height as f32,
        }
    }

    /// Width in pixels
    pub fn width(&self) -> f32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> f32 {
        self.height
    }

    /// Screen center
    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width * 0.5, self.height * 0.5)
    }

    /// Whether `point` lies on screen, extended by `margin` on every side
    pub fn contains(&self, point: Vec2, margin: f32) -> bool {
        point.x >= -margin
            && point.x <= self.width + margin
            && point.y >= -margin
            && point.y <= self.height + margin
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::resolve(defaults::DEFAULT_WIDTH, defaults::DEFAULT_HEIGHT)
    }
}

impl From<ViewportConfig> for Viewport {
    fn from(config: ViewportConfig) -> Self {
        Self::resolve(config.width, config.height)
    }
}

/// On-screen filtering applied after projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScreenBounds {
    /// Accept any finite point in front of the camera
    Unchecked,
    /// Reject points outside the viewport
    Strict,
    /// Reject points further than the margin outside the viewport
    Tolerance(f32),
}

/// Field-of-view correction applied while looking through a magnified optic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeCorrection {
    /// Vertical field of view in degrees
    pub fov: f32,
    /// Width / height
    pub aspect: f32,
}

impl ScopeCorrection {
    /// Divisors for x and y, if the inputs are usable
    fn divisors(&self) -> Option<(f32, f32)> {
        if !(self.fov.is_finite() && self.fov > 0.0 && self.fov < 180.0) {
            return None;
        }
        if !(self.aspect.is_finite() && self.aspect > 0.0) {
            return None;
        }

        let half = self.fov.to_radians() * 0.5;
        let cotangent = half.cos() / half.sin();
        Some((cotangent * self.aspect * 0.5, cotangent * 0.5))
    }
}

/// Snapshot of everything needed to project points for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projector {
    matrix: ViewMatrix,
    viewport: Viewport,
    scope: Option<ScopeCorrection>,
    min_w: f32,
}

impl Projector {
    /// Projector without scope correction
    pub fn new(matrix: ViewMatrix, viewport: Viewport) -> Self {
        Self {
            matrix,
            viewport,
            scope: None,
            min_w: defaults::MIN_W,
        }
    }

    /// Apply (or clear) the optic correction
    pub fn with_scope(mut self, scope: Option<ScopeCorrection>) -> Self {
        self.scope = scope;
        self
    }

    /// Override the behind-camera cutoff
    pub fn with_min_w(mut self, min_w: f32) -> Self {
        self.min_w = min_w;
        self
    }

    /// Matrix in use
    pub fn matrix(&self) -> &ViewMatrix {
        &self.matrix
    }

    /// Viewport in use
    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Whether optic correction is active
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Project `world` to screen coordinates
    ///
    /// `None` when the point is behind the camera, the result is not finite,
    /// or it falls outside `bounds`.
    pub fn world_to_screen(&self, world: Vec3, bounds: ScreenBounds) -> Option<Vec2> {
        let m = &self.matrix;

        let w = m.translation().dot(world) + m.scale_term();
        if !(w >= self.min_w) {
            return None;
        }

        let mut x = m.right().dot(world) + m.m14();
        let mut y = m.up().dot(world) + m.m24();

        if let Some((x_div, y_div)) = self.scope.and_then(|scope| scope.divisors()) {
            x /= x_div;
            y /= y_div;
        }

        let center = self.viewport.center();
        let screen = Vec2::new(center.x * (1.0 + x / w), center.y * (1.0 - y / w));
        if !screen.is_finite() {
            return None;
        }

        let visible = match bounds {
            ScreenBounds::Unchecked => true,
            ScreenBounds::Strict => self.viewport.contains(screen, 0.0),
            ScreenBounds::Tolerance(margin) => self.viewport.contains(screen, margin),
        };

        visible.then_some(screen)
    }
}
