//! Scan lattice and traversal order.
//!
//! A lattice is the cartesian product of up to three axis ranges. The x axis
//! is the fast axis, y the row axis and z (when present) the plane axis.
//! Point indices follow the traversal order and are dense from zero.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use hardware::stage::Position;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigFault;

/// Tolerance applied when deciding whether `stop` is reached by whole steps.
const STEP_EPSILON: f64 = 1e-9;

/// Largest lattice accepted, in points. Every point is held in memory and
/// visited by a physical stage.
pub const MAX_LATTICE_POINTS: usize = 10_000_000;

/// One axis of the lattice as `start:stop:step`, stop inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl AxisRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Check the range describes at least one point with a positive step.
    pub fn validate(&self) -> Result<(), String> {
        if !self.start.is_finite() || !self.stop.is_finite() || !self.step.is_finite() {
            return Err(format!("range {self} must be finite"));
        }
        if self.step <= 0.0 {
            return Err(format!("step must be positive, got {}", self.step));
        }
        if self.stop < self.start {
            return Err(format!(
                "stop ({}) must not be below start ({})",
                self.stop, self.start
            ));
        }
        let count = self.count_f64();
        if !count.is_finite() || count > MAX_LATTICE_POINTS as f64 {
            return Err(format!(
                "range {self} has {count:e} points, limit is {MAX_LATTICE_POINTS}"
            ));
        }
        Ok(())
    }

    fn count_f64(&self) -> f64 {
        ((self.stop - self.start) / self.step + STEP_EPSILON).floor() + 1.0
    }

    /// Number of points. Assumes a validated range; saturates otherwise.
    pub fn count(&self) -> usize {
        (self.count_f64() as usize).max(1)
    }

    /// All values, computed as `start + i * step` so errors do not accumulate.
    pub fn values(&self) -> Vec<f64> {
        (0..self.count())
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }

    /// Midpoint between the first and last lattice value.
    pub fn midpoint(&self) -> f64 {
        let last = self.start + (self.count() - 1) as f64 * self.step;
        0.5 * (self.start + last)
    }
}

impl FromStr for AxisRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err("Range must be in format 'start:stop:step'".to_string());
        }

        let start = parts[0]
            .trim()
            .parse::<f64>()
            .map_err(|_| "Invalid start value".to_string())?;
        let stop = parts[1]
            .trim()
            .parse::<f64>()
            .map_err(|_| "Invalid stop value".to_string())?;
        let step = parts[2]
            .trim()
            .parse::<f64>()
            .map_err(|_| "Invalid step value".to_string())?;

        let range = AxisRange::new(start, stop, step);
        range.validate()?;
        Ok(range)
    }
}

impl fmt::Display for AxisRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.stop, self.step)
    }
}

/// Lattice geometry. `z` absent means a planar scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatticeSpec {
    pub x: AxisRange,
    pub y: AxisRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<AxisRange>,
}

impl LatticeSpec {
    pub fn planar(x: AxisRange, y: AxisRange) -> Self {
        Self { x, y, z: None }
    }

    pub fn validate(&self) -> Result<(), ConfigFault> {
        let axes = [("x", Some(&self.x)), ("y", Some(&self.y)), ("z", self.z.as_ref())];
        for (axis, range) in axes {
            if let Some(range) = range {
                range
                    .validate()
                    .map_err(|reason| ConfigFault::InvalidRange { axis, reason })?;
            }
        }
        match self.checked_point_count() {
            Some(count) if count <= MAX_LATTICE_POINTS => Ok(()),
            count => Err(ConfigFault::TooManyPoints {
                count,
                max: MAX_LATTICE_POINTS,
            }),
        }
    }

    /// Total number of points, `None` when it does not fit in a `usize`.
    pub fn checked_point_count(&self) -> Option<usize> {
        self.x
            .count()
            .checked_mul(self.y.count())?
            .checked_mul(self.z.map_or(1, |z| z.count()))
    }

    /// Total number of lattice points. Saturates for lattices that fail
    /// [`LatticeSpec::validate`].
    pub fn point_count(&self) -> usize {
        self.checked_point_count().unwrap_or(usize::MAX)
    }

    /// Centre of the lattice, used as the safe reference position.
    pub fn center(&self) -> Position {
        Position {
            x: self.x.midpoint(),
            y: self.y.midpoint(),
            z: self.z.map(|z| z.midpoint()),
        }
    }
}

/// Order in which lattice points are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TraversalOrder {
    /// Row-major, every row scanned in the same direction.
    #[default]
    #[serde(alias = "z_shape")]
    #[value(alias = "z_shape")]
    Raster,
    /// Row direction alternates so consecutive rows join at the same edge.
    #[serde(alias = "snake")]
    #[value(alias = "snake")]
    Meander,
}

impl fmt::Display for TraversalOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalOrder::Raster => write!(f, "raster"),
            TraversalOrder::Meander => write!(f, "meander"),
        }
    }
}

/// Per-axis grid indices of a lattice point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridIndex {
    pub ix: usize,
    pub iy: usize,
    pub iz: usize,
}

/// A lattice point together with its position in scan order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticePoint {
    pub index: usize,
    pub grid: GridIndex,
    pub position: Position,
}

/// Fully enumerated lattice in traversal order.
#[derive(Debug, Clone)]
pub struct Lattice {
    spec: LatticeSpec,
    order: TraversalOrder,
    points: Vec<LatticePoint>,
}

impl Lattice {
    /// Enumerate the lattice. Pure function of geometry and order.
    pub fn new(spec: LatticeSpec, order: TraversalOrder) -> Result<Self, ConfigFault> {
        spec.validate()?;

        let xs = spec.x.values();
        let ys = spec.y.values();
        let zs = spec.z.map(|z| z.values());
        let planes = zs.as_ref().map_or(1, |z| z.len());

        let mut points = Vec::with_capacity(spec.point_count());
        let mut row = 0usize;
        for iz in 0..planes {
            let reverse_y = order == TraversalOrder::Meander && iz % 2 == 1;
            for iy_step in 0..ys.len() {
                let iy = if reverse_y { ys.len() - 1 - iy_step } else { iy_step };
                let reverse_x = order == TraversalOrder::Meander && row % 2 == 1;
                for ix_step in 0..xs.len() {
                    let ix = if reverse_x { xs.len() - 1 - ix_step } else { ix_step };
                    points.push(LatticePoint {
                        index: points.len(),
                        grid: GridIndex { ix, iy, iz },
                        position: Position {
                            x: xs[ix],
                            y: ys[iy],
                            z: zs.as_ref().map(|z| z[iz]),
                        },
                    });
                }
                row += 1;
            }
        }

        Ok(Self {
            spec,
            order,
            points,
        })
    }

    pub fn spec(&self) -> &LatticeSpec {
        &self.spec
    }

    pub fn order(&self) -> TraversalOrder {
        self.order
    }

    pub fn points(&self) -> &[LatticePoint] {
        &self.points
    }

    pub fn point(&self, index: usize) -> Option<&LatticePoint> {
        self.points.get(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn center(&self) -> Position {
        self.spec.center()
    }

    /// Number of points per row along the fast axis.
    pub fn row_len(&self) -> usize {
        self.spec.x.count()
    }
}
