//! Shape geometry for the diagram: node bounds and connection curves.

use serde::Serialize;

/// Width of a queue or machine shape.
pub const NODE_WIDTH: f64 = 100.0;
/// Height of a queue or machine shape.
pub const NODE_HEIGHT: f64 = 60.0;
/// Upper bound on the horizontal pull of a connection's control points.
pub const MAX_CURVATURE: f64 = 80.0;
/// Side length of a connection's arrowhead.
pub const ARROWHEAD_SIZE: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Whether `p` lies within the node shape centered on `center`.
pub fn node_contains(center: Point, p: Point) -> bool {
    (p.x - center.x).abs() <= NODE_WIDTH / 2.0 && (p.y - center.y).abs() <= NODE_HEIGHT / 2.0
}

/// A cubic Bézier segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CubicBezier {
    pub start: Point,
    pub control1: Point,
    pub control2: Point,
    pub end: Point,
}

impl CubicBezier {
    /// Point on the curve at parameter `t` in `0.0..=1.0`.
    pub fn point_at(&self, t: f64) -> Point {
        let u = 1.0 - t;
        let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
        Point {
            x: a * self.start.x + b * self.control1.x + c * self.control2.x + d * self.end.x,
            y: a * self.start.y + b * self.control1.y + c * self.control2.y + d * self.end.y,
        }
    }

    /// Direction of travel at the end of the curve, in radians.
    pub fn end_angle(&self) -> f64 {
        (self.end.y - self.control2.y).atan2(self.end.x - self.control2.x)
    }

    /// SVG path data (`M .. C ..`).
    pub fn path_data(&self) -> String {
        format!(
            "M {} {} C {} {}, {} {}, {} {}",
            self.start.x,
            self.start.y,
            self.control1.x,
            self.control1.y,
            self.control2.x,
            self.control2.y,
            self.end.x,
            self.end.y
        )
    }
}

/// Triangle marking the target end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Arrowhead {
    pub tip: Point,
    /// Rotation in degrees, with 0 pointing up
    pub rotation: f64,
    pub size: f64,
}

/// Curve from the right edge of `source` to the left edge of `target`, with
/// horizontal tangents at both ends.
pub fn connection_curve(source: Point, target: Point) -> (CubicBezier, Arrowhead) {
    let start = Point::new(source.x + NODE_WIDTH / 2.0, source.y);
    let end = Point::new(target.x - NODE_WIDTH / 2.0, target.y);
    let curvature = ((end.x - start.x).abs() * 0.5).min(MAX_CURVATURE);

    let curve = CubicBezier {
        start,
        control1: Point::new(start.x + curvature, start.y),
        control2: Point::new(end.x - curvature, end.y),
        end,
    };
    let arrow = Arrowhead {
        tip: end,
        rotation: curve.end_angle().to_degrees() + 90.0,
        size: ARROWHEAD_SIZE,
    };
    (curve, arrow)
}
