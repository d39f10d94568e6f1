// src/verification.rs

//! Placement verifier and fault handler.
//!
//! After every placement the tray camera and the quality sensor of the
//! destination AGV are read and the outcome is classified three ways:
//! a faulty part is taken back off the tray and discarded, a good part
//! outside the planar tolerance is re-picked and re-placed once, anything
//! else is accepted. The fault check always wins over the pose check.

use serde::{Deserialize, Serialize};

use crate::KittingError;
use crate::core::{AgvId, Arm, CancelToken, Part, Pose, SensorRole, lowered, planar_offset, settle};
use crate::interfaces::{Motion, Perception, Placement, Quality, Target};

/// Verification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Largest accepted |dx| or |dy| between placed and required pose
    pub pose_tolerance: f64,
    /// How far below the observed pose a faulty part is gripped
    pub faulty_clearance: f64,
    /// Named location of the faulty-part bin
    pub discard_location: String,
    /// Pause after a recovery pick
    pub settle_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            pose_tolerance: 0.03,
            faulty_clearance: 0.19,
            discard_location: "agv_faulty".to_string(),
            settle_ms: 200,
        }
    }
}

/// Raw classification of a placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    /// Right part, right place
    Ok,
    /// Right part, planar offset beyond tolerance
    PoseOffset {
        /// |dx| in meters
        dx: f64,
        /// |dy| in meters
        dy: f64,
    },
    /// Quality sensor flagged the part
    Faulty,
}

/// Outcome reported to the scheduler after recovery ran
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Accepted as placed
    VerifiedOk,
    /// Re-placed once at the exact target
    PoseCorrected,
    /// Discarded; the product still needs a part
    VerifiedFaulty,
}

impl Verdict {
    /// The product requirement is satisfied
    pub fn satisfies_product(&self) -> bool {
        !matches!(self, Verdict::VerifiedFaulty)
    }
}

/// Classify a placement. Faulty first, then planar deviation.
pub fn classify(faulty: bool, observed: &Pose, target: &Pose, tolerance: f64) -> Classification {
    if faulty {
        return Classification::Faulty;
    }
    let (dx, dy) = planar_offset(observed, target);
    if dx > tolerance || dy > tolerance {
        Classification::PoseOffset { dx, dy }
    } else {
        Classification::Ok
    }
}

/// What was just placed and where it should be
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedProduct {
    /// Destination AGV
    pub agv: AgvId,
    /// Named approach location of that AGV
    pub station: String,
    /// Type of the placed part
    pub part_type: String,
    /// Target relative to the tray, as it was placed
    pub tray_pose: Pose,
    /// Same target in world coordinates
    pub world_target: Pose,
}

/// Post-placement checks and the two recovery maneuvers
#[derive(Debug, Clone)]
pub struct PlacementVerifier {
    config: VerificationConfig,
}

impl PlacementVerifier {
    /// Verifier with the given tolerances
    pub fn new(config: VerificationConfig) -> Self {
        PlacementVerifier { config }
    }

    /// Named location of the faulty-part bin
    pub fn discard_location(&self) -> &str {
        &self.config.discard_location
    }

    /// Inspect a placement and run whatever recovery it needs
    pub fn verify<P, M, Q>(
        &self,
        perception: &P,
        motion: &mut M,
        quality: &Q,
        placed: &PlacedProduct,
        cancel: &CancelToken,
    ) -> Result<Verdict, KittingError>
    where
        P: Perception + ?Sized,
        M: Motion + ?Sized,
        Q: Quality + ?Sized,
    {
        cancel.check()?;
        let observed = self.confirmed_pose(perception, placed);
        let reading = quality.inspect(placed.agv);

        match classify(reading.faulty, &observed, &placed.world_target, self.config.pose_tolerance) {
            Classification::Faulty => {
                log::warn!("Faulty {} detected on {}", placed.part_type, placed.agv);
                self.discard(motion, placed, &observed, cancel)?;
                Ok(Verdict::VerifiedFaulty)
            }
            Classification::PoseOffset { dx, dy } => {
                log::warn!(
                    "{} on {} is off target (dx {:.3}, dy {:.3}), re-placing",
                    placed.part_type, placed.agv, dx, dy
                );
                self.correct(motion, placed, &observed, cancel)?;
                Ok(Verdict::PoseCorrected)
            }
            Classification::Ok => {
                log::info!("{} placed on {} without any problem", placed.part_type, placed.agv);
                Ok(Verdict::VerifiedOk)
            }
        }
    }

    /// Pose of the placed part as the tray camera sees it. With several parts
    /// of the type on the tray the one closest to the target is used.
    fn confirmed_pose<P: Perception + ?Sized>(&self, perception: &P, placed: &PlacedProduct) -> Pose {
        let target = &placed.world_target;
        let closest = perception
            .snapshot()
            .into_iter()
            .filter(|obs| obs.sensor.role == SensorRole::AgvTray(placed.agv) && obs.part_type == placed.part_type)
            .map(|obs| {
                let (dx, dy) = planar_offset(&obs.pose, target);
                (dx * dx + dy * dy, obs.pose)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match closest {
            Some((_, pose)) => pose,
            None => {
                log::warn!(
                    "Tray camera of {} does not see the {}; assuming it sits on target",
                    placed.agv, placed.part_type
                );
                *target
            }
        }
    }

    fn discard<M: Motion + ?Sized>(
        &self,
        motion: &mut M,
        placed: &PlacedProduct,
        observed: &Pose,
        cancel: &CancelToken,
    ) -> Result<(), KittingError> {
        let grasp = Part::new(&placed.part_type, lowered(observed, self.config.faulty_clearance));
        let station = Target::Named(placed.station.clone());
        motion.move_to(&station)?;
        motion.pick(&grasp)?;
        settle(self.config.settle_ms, cancel)?;
        motion.move_to(&station)?;
        motion.move_to(&Target::Named(self.config.discard_location.clone()))?;
        motion.release(Arm::Left)?;
        log::info!("Faulty {} dropped at {}", placed.part_type, self.config.discard_location);
        Ok(())
    }

    fn correct<M: Motion + ?Sized>(
        &self,
        motion: &mut M,
        placed: &PlacedProduct,
        observed: &Pose,
        cancel: &CancelToken,
    ) -> Result<(), KittingError> {
        let station = Target::Named(placed.station.clone());
        motion.move_to(&station)?;
        motion.pick(&Part::new(&placed.part_type, *observed))?;
        settle(self.config.settle_ms, cancel)?;
        motion.move_to(&station)?;
        motion.place(
            &Placement { part_type: placed.part_type.clone(), tray_pose: placed.tray_pose, arm: Arm::Left },
            placed.agv,
        )?;
        log::info!("{} re-placed on {}", placed.part_type, placed.agv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Observation, SensorId, at};
    use crate::interfaces::{MockMotion, MockPerception, MockQuality, QualityReading};
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    #[rstest]
    #[case::correction_just_outside(false, 0.031, 0.0, "offset")]
    #[case::accepted_inside(false, 0.02, 0.0, "ok")]
    #[case::y_axis_counts_too(false, 0.0, -0.031, "offset")]
    #[case::faulty_on_target(true, 0.0, 0.0, "faulty")]
    #[case::faulty_wins_over_offset(true, 0.2, 0.2, "faulty")]
    fn three_way_classification(#[case] faulty: bool, #[case] dx: f64, #[case] dy: f64, #[case] expected: &str) {
        let target = at(0.5, 0.5, 0.8);
        let observed = at(0.5 + dx, 0.5 + dy, 0.8);
        let got = match classify(faulty, &observed, &target, 0.03) {
            Classification::Ok => "ok",
            Classification::PoseOffset { .. } => "offset",
            Classification::Faulty => "faulty",
        };
        assert_eq!(got, expected);
    }

    fn placed() -> PlacedProduct {
        PlacedProduct {
            agv: AgvId::Agv2,
            station: "agv2".to_string(),
            part_type: "disk_part_blue".to_string(),
            tray_pose: at(0.1, 0.1, 0.0),
            world_target: at(0.1, 6.0, 0.75),
        }
    }

    fn tray_sees(pose: Pose) -> MockPerception {
        let mut perception = MockPerception::new();
        perception.expect_snapshot().returning(move || {
            vec![
                Observation {
                    sensor: SensorId::tray(AgvId::Agv2, "logical_camera_11"),
                    slot: 0,
                    part_type: "disk_part_blue".to_string(),
                    pose,
                },
                Observation {
                    sensor: SensorId::tray(AgvId::Agv1, "logical_camera_10"),
                    slot: 0,
                    part_type: "disk_part_blue".to_string(),
                    pose: at(0.1, 6.0, 0.75),
                },
            ]
        });
        perception
    }

    fn quality(faulty: bool) -> MockQuality {
        let mut quality = MockQuality::new();
        quality
            .expect_inspect()
            .with(eq(AgvId::Agv2))
            .times(1)
            .returning(move |_| QualityReading { faulty });
        quality
    }

    fn verifier() -> PlacementVerifier {
        PlacementVerifier::new(VerificationConfig { settle_ms: 0, ..VerificationConfig::default() })
    }

    #[test]
    fn accepted_placement_moves_nothing() {
        let perception = tray_sees(at(0.12, 6.01, 0.75));
        let mut motion = MockMotion::new();
        let verdict = verifier()
            .verify(&perception, &mut motion, &quality(false), &placed(), &CancelToken::new())
            .unwrap();
        assert_eq!(verdict, Verdict::VerifiedOk);
    }

    #[test]
    fn faulty_part_is_picked_low_and_discarded() {
        let perception = tray_sees(at(0.1, 6.0, 0.75));
        let visited = Arc::new(Mutex::new(Vec::new()));
        let log = visited.clone();
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(move |target| {
            log.lock().unwrap().push(target.clone());
            Ok(())
        });
        motion
            .expect_pick()
            .withf(|part| (part.pose.translation.z - 0.56).abs() < 1e-9)
            .times(1)
            .returning(|_| Ok(()));
        motion.expect_release().with(eq(Arm::Left)).times(1).returning(|_| Ok(()));
        motion.expect_place().never();

        let verdict = verifier()
            .verify(&perception, &mut motion, &quality(true), &placed(), &CancelToken::new())
            .unwrap();
        assert_eq!(verdict, Verdict::VerifiedFaulty);
        assert!(!verdict.satisfies_product());
        assert_eq!(visited.lock().unwrap().last(), Some(&Target::named("agv_faulty")));
    }

    #[test]
    fn offset_part_is_replaced_at_target() {
        let perception = tray_sees(at(0.131, 6.0, 0.75));
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(|_| Ok(()));
        motion
            .expect_pick()
            .withf(|part| (part.pose.translation.x - 0.131).abs() < 1e-9)
            .times(1)
            .returning(|_| Ok(()));
        motion
            .expect_place()
            .withf(|placement, agv| *agv == AgvId::Agv2 && placement.tray_pose == at(0.1, 0.1, 0.0))
            .times(1)
            .returning(|_, _| Ok(()));

        let verdict = verifier()
            .verify(&perception, &mut motion, &quality(false), &placed(), &CancelToken::new())
            .unwrap();
        assert_eq!(verdict, Verdict::PoseCorrected);
        assert!(verdict.satisfies_product());
    }

    #[test]
    fn unseen_part_is_judged_by_quality_only() {
        let mut perception = MockPerception::new();
        perception.expect_snapshot().returning(Vec::new);
        let mut motion = MockMotion::new();
        let verdict = verifier()
            .verify(&perception, &mut motion, &quality(false), &placed(), &CancelToken::new())
            .unwrap();
        assert_eq!(verdict, Verdict::VerifiedOk);
    }
}
