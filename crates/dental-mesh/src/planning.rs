//! Stepped orthodontic treatment plans from accumulated tooth movement.
//!
//! A plan is derived data: it is rebuilt from the segments' movement
//! histories and never feeds back into positions.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DentalError, DentalResult};
use crate::movement::MovementAxis;
use crate::segment::{DentalModel, MovementHistory, SegmentId, ToothType};

/// Largest movement per aligner step, per axis, in mm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxMovementPerStep {
    pub anteroposterior: f64,
    pub vertical: f64,
    pub transverse: f64,
}

impl Default for MaxMovementPerStep {
    fn default() -> Self {
        Self {
            anteroposterior: 0.25,
            vertical: 0.2,
            transverse: 0.25,
        }
    }
}

impl MaxMovementPerStep {
    pub fn get(&self, axis: MovementAxis) -> f64 {
        match axis {
            MovementAxis::Anteroposterior => self.anteroposterior,
            MovementAxis::Vertical => self.vertical,
            MovementAxis::Transverse => self.transverse,
        }
    }
}

/// Minimum step counts by movement magnitude.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepBands {
    /// Upper bound of the small band, mm.
    pub small_max: f64,
    pub small_steps: u32,
    /// Upper bound of the medium band, mm.
    pub medium_max: f64,
    pub medium_steps: u32,
    pub large_steps: u32,
}

impl Default for StepBands {
    fn default() -> Self {
        Self {
            small_max: 1.0,
            small_steps: 2,
            medium_max: 3.0,
            medium_steps: 5,
            large_steps: 10,
        }
    }
}

impl StepBands {
    pub fn min_steps(&self, magnitude: f64) -> u32 {
        if magnitude <= self.small_max {
            self.small_steps
        } else if magnitude <= self.medium_max {
            self.medium_steps
        } else {
            self.large_steps
        }
    }
}

/// Plan generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningParams {
    /// Movements at or below this magnitude are ignored, mm.
    pub noise_threshold: f64,
    pub max_movement_per_step: MaxMovementPerStep,
    pub bands: StepBands,
    /// Movements beyond this get extra steps, mm.
    pub complex_threshold: f64,
    pub complexity_factor: f64,
}

impl Default for PlanningParams {
    fn default() -> Self {
        Self {
            noise_threshold: 0.1,
            max_movement_per_step: MaxMovementPerStep::default(),
            bands: StepBands::default(),
            complex_threshold: 5.0,
            complexity_factor: 1.2,
        }
    }
}

impl PlanningParams {
    /// Gentler plan: smaller steps per aligner.
    pub fn conservative() -> Self {
        Self {
            max_movement_per_step: MaxMovementPerStep {
                anteroposterior: 0.2,
                vertical: 0.15,
                transverse: 0.2,
            },
            complexity_factor: 1.5,
            ..Default::default()
        }
    }

    /// Recommended steps for a movement of `distance` along `axis`.
    ///
    /// `max(ceil(|d| / max_per_step), band minimum)`, scaled by the
    /// complexity factor beyond the complex threshold.
    pub fn recommended_steps(&self, axis: MovementAxis, distance: f64) -> u32 {
        let magnitude = distance.abs();
        let per_step = self.max_movement_per_step.get(axis);
        let by_rate = if per_step > 0.0 {
            // Guard against 3.0 / 0.2 = 15.000000000000002
            ((magnitude / per_step) - 1e-9).ceil().max(0.0) as u32
        } else {
            0
        };
        let mut steps = by_rate.max(self.bands.min_steps(magnitude));
        if magnitude > self.complex_threshold {
            steps = (steps as f64 * self.complexity_factor).ceil() as u32;
        }
        steps.max(1)
    }
}

/// One axis of one tooth's movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMovement {
    pub axis: MovementAxis,
    /// Signed distance, mm.
    pub distance: f64,
    pub recommended_steps: u32,
    pub override_steps: Option<u32>,
}

impl AxisMovement {
    pub fn steps(&self) -> u32 {
        self.override_steps.unwrap_or(self.recommended_steps)
    }

    pub fn per_step(&self) -> f64 {
        self.distance / self.steps() as f64
    }
}

/// All planned movement of one tooth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToothMovement {
    pub segment: SegmentId,
    pub name: String,
    pub tooth_type: ToothType,
    pub tooth_number: Option<u32>,
    pub movements: Vec<AxisMovement>,
}

impl ToothMovement {
    pub fn total_steps(&self) -> u32 {
        self.movements.iter().map(AxisMovement::steps).max().unwrap_or(0)
    }
}

/// Movement of one tooth along one axis within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMovement {
    pub segment: SegmentId,
    pub axis: MovementAxis,
    pub increment: f64,
}

/// One aligner stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentStep {
    /// 1-based.
    pub index: u32,
    pub movements: Vec<StepMovement>,
}

/// Per-tooth movements and the flattened step sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrthodonticTreatmentPlan {
    pub teeth_movements: Vec<ToothMovement>,
    pub treatment_steps: Vec<TreatmentStep>,
}

/// Input for one tooth, decoupled from the model.
#[derive(Debug, Clone)]
pub struct ToothHistory<'a> {
    pub segment: SegmentId,
    pub name: &'a str,
    pub tooth_type: ToothType,
    pub tooth_number: Option<u32>,
    pub history: &'a MovementHistory,
}

impl OrthodonticTreatmentPlan {
    /// Plan from every segment of the model.
    pub fn generate(model: &DentalModel, params: &PlanningParams) -> Self {
        Self::from_histories(
            model.segments().map(|s| ToothHistory {
                segment: s.id,
                name: &s.name,
                tooth_type: s.tooth_type,
                tooth_number: s.tooth_number,
                history: &s.movement_history,
            }),
            params,
        )
    }

    pub fn from_histories<'a>(
        teeth: impl IntoIterator<Item = ToothHistory<'a>>,
        params: &PlanningParams,
    ) -> Self {
        let teeth_movements: Vec<ToothMovement> = teeth
            .into_iter()
            .filter_map(|tooth| {
                let movements: Vec<AxisMovement> = MovementAxis::ALL
                    .iter()
                    .filter_map(|&axis| {
                        let distance = tooth.history.get(axis);
                        (distance.abs() > params.noise_threshold).then(|| AxisMovement {
                            axis,
                            distance,
                            recommended_steps: params.recommended_steps(axis, distance),
                            override_steps: None,
                        })
                    })
                    .collect();
                if movements.is_empty() {
                    return None;
                }
                Some(ToothMovement {
                    segment: tooth.segment,
                    name: tooth.name.to_string(),
                    tooth_type: tooth.tooth_type,
                    tooth_number: tooth.tooth_number,
                    movements,
                })
            })
            .collect();

        let mut plan = Self {
            teeth_movements,
            treatment_steps: Vec::new(),
        };
        plan.rebuild_steps();
        info!(
            teeth = plan.teeth_movements.len(),
            steps = plan.total_steps(),
            "Treatment plan generated"
        );
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.teeth_movements.is_empty()
    }

    pub fn total_steps(&self) -> u32 {
        self.treatment_steps.len() as u32
    }

    pub fn tooth(&self, segment: SegmentId) -> Option<&ToothMovement> {
        self.teeth_movements.iter().find(|t| t.segment == segment)
    }

    /// Set or clear a user step count for one tooth axis and rebuild the steps.
    pub fn set_override(
        &mut self,
        segment: SegmentId,
        axis: MovementAxis,
        steps: Option<u32>,
    ) -> DentalResult<()> {
        if steps == Some(0) {
            return Err(DentalError::invalid_parameter(
                "steps",
                "a step override must be at least 1",
            ));
        }
        let tooth = self
            .teeth_movements
            .iter_mut()
            .find(|t| t.segment == segment)
            .ok_or(DentalError::SegmentNotFound { id: segment })?;
        let movement = tooth
            .movements
            .iter_mut()
            .find(|m| m.axis == axis)
            .ok_or_else(|| {
                DentalError::invalid_parameter(
                    "axis",
                    format!("segment {segment} has no planned {axis} movement"),
                )
            })?;
        movement.override_steps = steps;
        debug!(%segment, %axis, ?steps, "Step override set");
        self.rebuild_steps();
        Ok(())
    }

    /// Step `k` holds every tooth axis whose step count is at least `k`.
    fn rebuild_steps(&mut self) {
        let total = self
            .teeth_movements
            .iter()
            .map(ToothMovement::total_steps)
            .max()
            .unwrap_or(0);
        self.treatment_steps = (1..=total)
            .map(|index| TreatmentStep {
                index,
                movements: self
                    .teeth_movements
                    .iter()
                    .flat_map(|tooth| {
                        tooth
                            .movements
                            .iter()
                            .filter(move |m| m.steps() >= index)
                            .map(move |m| StepMovement {
                                segment: tooth.segment,
                                axis: m.axis,
                                increment: m.per_step(),
                            })
                    })
                    .collect(),
            })
            .collect();
    }
}

impl fmt::Display for OrthodonticTreatmentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Treatment plan: {} teeth, {} steps",
            self.teeth_movements.len(),
            self.total_steps()
        )?;
        for tooth in &self.teeth_movements {
            write!(f, "  {} ({}):", tooth.name, tooth.tooth_type)?;
            for m in &tooth.movements {
                write!(f, " {} {:+.2} mm in {} steps", m.axis, m.distance, m.steps())?;
                if m.override_steps.is_some() {
                    write!(f, " (override)")?;
                }
                write!(f, ";")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(ap: f64, v: f64, t: f64) -> MovementHistory {
        MovementHistory {
            anteroposterior: ap,
            vertical: v,
            transverse: t,
            total_movements: 1,
            last_movement_type: None,
        }
    }

    fn plan_for(histories: &[MovementHistory]) -> OrthodonticTreatmentPlan {
        OrthodonticTreatmentPlan::from_histories(
            histories.iter().enumerate().map(|(i, h)| ToothHistory {
                segment: SegmentId(i as u64 + 1),
                name: "tooth",
                tooth_type: ToothType::Molar,
                tooth_number: None,
                history: h,
            }),
            &PlanningParams::default(),
        )
    }

    #[test]
    fn test_three_mm_vertical() {
        let params = PlanningParams::default();
        // ceil(3 / 0.2) = 15 beats the medium band minimum of 5
        assert_eq!(params.recommended_steps(MovementAxis::Vertical, 3.0), 15);
        assert_eq!(params.recommended_steps(MovementAxis::Vertical, -3.0), 15);
    }

    #[test]
    fn test_band_minimum_applies() {
        let params = PlanningParams::default();
        // 0.3 / 0.25 -> 2, small band -> 2
        assert_eq!(params.recommended_steps(MovementAxis::Anteroposterior, 0.3), 2);
        // 1.1 / 0.25 -> 5, medium band -> 5
        assert_eq!(params.recommended_steps(MovementAxis::Transverse, 1.1), 5);
    }

    #[test]
    fn test_complex_movement_inflated() {
        let params = PlanningParams::default();
        // 6 / 0.25 = 24, * 1.2 = 28.8 -> 29
        assert_eq!(params.recommended_steps(MovementAxis::Anteroposterior, 6.0), 29);
    }

    #[test]
    fn test_noise_filtered() {
        let plan = plan_for(&[history(0.05, 0.0, -0.09), history(0.0, 0.5, 0.0)]);
        assert_eq!(plan.teeth_movements.len(), 1);
        assert_eq!(plan.teeth_movements[0].segment, SegmentId(2));
    }

    #[test]
    fn test_flattened_steps() {
        let plan = plan_for(&[history(0.0, 3.0, 0.0), history(0.5, 0.0, 0.0)]);
        assert_eq!(plan.total_steps(), 15);
        // Second tooth takes 2 steps
        assert_eq!(plan.treatment_steps[0].movements.len(), 2);
        assert_eq!(plan.treatment_steps[1].movements.len(), 2);
        assert_eq!(plan.treatment_steps[2].movements.len(), 1);

        let total: f64 = plan
            .treatment_steps
            .iter()
            .flat_map(|s| &s.movements)
            .filter(|m| m.segment == SegmentId(1))
            .map(|m| m.increment)
            .sum();
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_override_regenerates() {
        let mut plan = plan_for(&[history(0.0, 3.0, 0.0)]);
        plan.set_override(SegmentId(1), MovementAxis::Vertical, Some(20))
            .expect("valid override");
        assert_eq!(plan.total_steps(), 20);
        plan.set_override(SegmentId(1), MovementAxis::Vertical, None)
            .expect("cleared");
        assert_eq!(plan.total_steps(), 15);

        assert!(plan.set_override(SegmentId(1), MovementAxis::Vertical, Some(0)).is_err());
        assert!(plan.set_override(SegmentId(1), MovementAxis::Transverse, Some(3)).is_err());
        assert!(plan.set_override(SegmentId(9), MovementAxis::Vertical, Some(3)).is_err());
    }

    #[test]
    fn test_empty_plan() {
        let plan = plan_for(&[]);
        assert!(plan.is_empty());
        assert_eq!(plan.total_steps(), 0);
    }
}
