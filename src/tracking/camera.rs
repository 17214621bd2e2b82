use std::collections::HashMap;
use std::f64::consts::PI;

use crate::tracking::imu::ImuSample;

const DEG_TO_RAD: f64 = PI / 180.0;

/// Links a board's `cam_id` to a camera in the rig.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraBinding {
    pub cam_id: String,
    pub camera_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSettings {
    pub cameras: Vec<CameraBinding>,
    /// Single-camera setup used when no binding resolves.
    pub target_camera: Option<String>,
    pub track_rotation: bool,
    pub track_location: bool,
    pub rotation_factor: f64,
    pub location_factor: f64,
    /// Radians, added after scaling.
    pub rotation_offset: [f64; 3],
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            target_camera: None,
            track_rotation: true,
            track_location: true,
            rotation_factor: 1.0,
            location_factor: 1.0,
            rotation_offset: [0.0; 3],
        }
    }
}

impl TrackingSettings {
    /// Euler rotation in radians for a sample, if rotation is tracked and the
    /// sample carries all three axes.
    pub fn rotation_for(&self, sample: &ImuSample) -> Option<[f64; 3]> {
        if !self.track_rotation {
            return None;
        }
        let degrees = sample.rotation?;
        let mut out = [0.0; 3];
        for axis in 0..3 {
            out[axis] = degrees[axis] * self.rotation_factor * DEG_TO_RAD + self.rotation_offset[axis];
        }
        Some(out)
    }

    pub fn location_for(&self, sample: &ImuSample) -> Option<[f64; 3]> {
        if !self.track_location {
            return None;
        }
        let raw = sample.location?;
        Some(raw.map(|v| v * self.location_factor))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    pub rotation: [f64; 3],
    pub location: [f64; 3],
}

/// The cameras samples can drive, by name.
#[derive(Debug, Default)]
pub struct CameraRig {
    poses: HashMap<String, Pose>,
}

impl CameraRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, name: &str) {
        self.poses.entry(name.to_string()).or_default();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.poses.contains_key(name)
    }

    pub fn pose(&self, name: &str) -> Option<Pose> {
        self.poses.get(name).copied()
    }

    /// Cameras a sample should move. A `cam_id` picks its first binding whose
    /// camera exists; no `cam_id` means every binding. Falls back to `target_camera`.
    pub fn targets(&self, settings: &TrackingSettings, cam_id: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = match cam_id {
            Some(id) => settings
                .cameras
                .iter()
                .find(|binding| binding.cam_id == id && self.contains(&binding.camera_name))
                .map(|binding| vec![binding.camera_name.clone()])
                .unwrap_or_default(),
            None => settings
                .cameras
                .iter()
                .filter(|binding| self.contains(&binding.camera_name))
                .map(|binding| binding.camera_name.clone())
                .collect(),
        };

        if names.is_empty() {
            if let Some(fallback) = settings.target_camera.as_deref() {
                if self.contains(fallback) {
                    names.push(fallback.to_string());
                } else {
                    log::warn!("camera '{}' not found", fallback);
                }
            }
        }
        names
    }

    /// Applies a sample and returns the names of the cameras it moved.
    pub fn apply(&mut self, settings: &TrackingSettings, sample: &ImuSample) -> Vec<String> {
        let targets = self.targets(settings, sample.cam_id.as_deref());
        if targets.is_empty() {
            log::debug!("no target cameras for sample (cam_id {:?})", sample.cam_id);
            return targets;
        }

        let rotation = settings.rotation_for(sample);
        let location = settings.location_for(sample);
        if rotation.is_none() && location.is_none() {
            return Vec::new();
        }

        for name in &targets {
            let Some(pose) = self.poses.get_mut(name) else {
                continue;
            };
            if let Some(rotation) = rotation {
                pose.rotation = rotation;
            }
            if let Some(location) = location {
                pose.location = location;
            }
            log::debug!("camera '{}' -> {:?}", name, pose);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(cam_id: &str, camera_name: &str) -> CameraBinding {
        CameraBinding {
            cam_id: cam_id.into(),
            camera_name: camera_name.into(),
        }
    }

    fn rig(names: &[&str]) -> CameraRig {
        let mut rig = CameraRig::new();
        for name in names {
            rig.add_camera(name);
        }
        rig
    }

    fn sample(cam_id: Option<&str>) -> ImuSample {
        ImuSample {
            cam_id: cam_id.map(str::to_string),
            rotation: Some([90.0, 0.0, -180.0]),
            location: Some([1.0, 2.0, 3.0]),
            timestamp: None,
        }
    }

    fn close(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn rotation_scaled_converted_and_offset() {
        let settings = TrackingSettings {
            rotation_factor: 0.5,
            rotation_offset: [0.1, 0.0, 0.0],
            ..TrackingSettings::default()
        };
        let rotation = settings.rotation_for(&sample(None)).unwrap();
        assert!(close(rotation, [PI / 4.0 + 0.1, 0.0, -PI / 2.0]));
    }

    #[test]
    fn location_scaled_and_toggles_respected() {
        let settings = TrackingSettings {
            location_factor: 2.0,
            track_rotation: false,
            ..TrackingSettings::default()
        };
        assert_eq!(settings.location_for(&sample(None)), Some([2.0, 4.0, 6.0]));
        assert_eq!(settings.rotation_for(&sample(None)), None);
    }

    #[test]
    fn cam_id_selects_single_binding() {
        let settings = TrackingSettings {
            cameras: vec![binding("A", "CamA"), binding("B", "CamB")],
            ..TrackingSettings::default()
        };
        let mut rig = rig(&["CamA", "CamB"]);
        assert_eq!(rig.apply(&settings, &sample(Some("B"))), vec!["CamB".to_string()]);
        assert_eq!(rig.pose("CamA"), Some(Pose::default()));
        assert_eq!(rig.pose("CamB").unwrap().location, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn cam_id_skips_bindings_to_missing_cameras() {
        let settings = TrackingSettings {
            cameras: vec![binding("A", "Missing"), binding("A", "CamA"), binding("A", "CamA2")],
            ..TrackingSettings::default()
        };
        let mut rig = rig(&["CamA", "CamA2"]);
        assert_eq!(rig.apply(&settings, &sample(Some("A"))), vec!["CamA".to_string()]);
        assert_eq!(rig.pose("CamA2"), Some(Pose::default()));
    }

    #[test]
    fn no_cam_id_moves_every_bound_camera() {
        let settings = TrackingSettings {
            cameras: vec![binding("A", "CamA"), binding("B", "CamB"), binding("C", "Missing")],
            ..TrackingSettings::default()
        };
        let mut rig = rig(&["CamA", "CamB"]);
        let moved = rig.apply(&settings, &sample(None));
        assert_eq!(moved, vec!["CamA".to_string(), "CamB".to_string()]);
    }

    #[test]
    fn falls_back_to_target_camera() {
        let settings = TrackingSettings {
            cameras: vec![binding("A", "CamA")],
            target_camera: Some("Legacy".into()),
            ..TrackingSettings::default()
        };
        let mut rig = rig(&["Legacy"]);
        assert_eq!(rig.apply(&settings, &sample(Some("zzz"))), vec!["Legacy".to_string()]);

        let mut empty = CameraRig::new();
        assert!(empty.apply(&settings, &sample(None)).is_empty());
    }

    #[test]
    fn partial_sample_keeps_other_half() {
        let settings = TrackingSettings {
            target_camera: Some("Cam".into()),
            ..TrackingSettings::default()
        };
        let mut rig = rig(&["Cam"]);
        rig.apply(&settings, &sample(None));
        let rotation_only = ImuSample {
            rotation: Some([0.0, 0.0, 0.0]),
            ..ImuSample::default()
        };
        rig.apply(&settings, &rotation_only);
        let pose = rig.pose("Cam").unwrap();
        assert_eq!(pose.rotation, [0.0; 3]);
        assert_eq!(pose.location, [1.0, 2.0, 3.0]);
    }
}
