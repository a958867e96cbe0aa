//! Geometric text orientation of a recognized region.

use serde::{Deserialize, Serialize};

/// A vertex of a text region, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Horizontal,
    Vertical,
    Rotated,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Horizontal => "horizontal",
            Orientation::Vertical => "vertical",
            Orientation::Rotated => "rotated",
        }
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a quadrilateral as horizontal, vertical or rotated text.
///
/// Rules, first match wins: height/width above 3.0 is vertical; a first edge
/// between 30 and 150 degrees is rotated; height/width above 2.0 is vertical;
/// anything else is horizontal. Degenerate or non-finite input is horizontal,
/// except a zero-width box which is vertical.
pub fn classify(quad: &[Point]) -> Orientation {
    if quad.len() < 4 {
        return Orientation::Horizontal;
    }

    let (min_x, max_x) = bounds(quad.iter().map(|p| p.x));
    let (min_y, max_y) = bounds(quad.iter().map(|p| p.y));
    let width = max_x - min_x;
    let height = max_y - min_y;

    if !width.is_finite() || !height.is_finite() {
        return Orientation::Horizontal;
    }
    if width == 0.0 {
        return Orientation::Vertical;
    }

    let aspect = height / width;
    let (p1, p2) = (quad[0], quad[1]);
    let angle = (p2.y - p1.y).atan2(p2.x - p1.x).to_degrees().abs();

    if !aspect.is_finite() || !angle.is_finite() {
        return Orientation::Horizontal;
    }
    from_geometry(aspect, angle)
}

/// `aspect` is height over width; `angle` is the absolute first-edge angle in
/// degrees. Both bounds on the angle are exclusive.
fn from_geometry(aspect: f64, angle: f64) -> Orientation {
    if aspect > 3.0 {
        Orientation::Vertical
    } else if angle > 30.0 && angle < 150.0 {
        Orientation::Rotated
    } else if aspect > 2.0 {
        Orientation::Vertical
    } else {
        Orientation::Horizontal
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Per-orientation block counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrientationTally {
    pub horizontal: usize,
    pub vertical: usize,
    pub rotated: usize,
}

impl OrientationTally {
    pub fn add(&mut self, orientation: Orientation) {
        match orientation {
            Orientation::Horizontal => self.horizontal += 1,
            Orientation::Vertical => self.vertical += 1,
            Orientation::Rotated => self.rotated += 1,
        }
    }
}

impl FromIterator<Orientation> for OrientationTally {
    fn from_iter<I: IntoIterator<Item = Orientation>>(iter: I) -> Self {
        let mut tally = Self::default();
        for orientation in iter {
            tally.add(orientation);
        }
        tally
    }
}
