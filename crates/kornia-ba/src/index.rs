use crate::error::BundleAdjustmentError;
use crate::types::Observation;

/// Observations grouped by camera and by point, in compressed row layout.
///
/// Within a group the observation indices are ascending, so any accumulation
/// that walks a group visits contributions in a fixed order.
#[derive(Debug, Clone)]
pub struct ObservationIndex {
    camera_offsets: Vec<usize>,
    camera_observations: Vec<usize>,
    point_offsets: Vec<usize>,
    point_observations: Vec<usize>,
}

fn group(keys: impl Iterator<Item = usize> + Clone, num_groups: usize) -> (Vec<usize>, Vec<usize>) {
    let mut offsets = vec![0usize; num_groups + 1];
    for k in keys.clone() {
        offsets[k + 1] += 1;
    }
    for g in 0..num_groups {
        offsets[g + 1] += offsets[g];
    }

    let mut cursor = offsets.clone();
    let mut members = vec![0usize; offsets[num_groups]];
    for (obs, k) in keys.enumerate() {
        members[cursor[k]] = obs;
        cursor[k] += 1;
    }
    (offsets, members)
}

impl ObservationIndex {
    /// Validate the observations and group them.
    ///
    /// # Errors
    ///
    /// Fails when any of the arrays is empty, when an observation refers to a
    /// missing camera or point, or when a camera or point is never observed.
    pub fn build(
        num_cameras: usize,
        num_points: usize,
        observations: &[Observation],
    ) -> Result<Self, BundleAdjustmentError> {
        if num_cameras == 0 {
            return Err(BundleAdjustmentError::EmptyCameras);
        }
        if num_points == 0 {
            return Err(BundleAdjustmentError::EmptyPoints);
        }
        if observations.is_empty() {
            return Err(BundleAdjustmentError::EmptyObservations);
        }

        for (i, obs) in observations.iter().enumerate() {
            if obs.camera >= num_cameras {
                return Err(BundleAdjustmentError::CameraIndexOutOfRange {
                    observation: i,
                    camera: obs.camera,
                    num_cameras,
                });
            }
            if obs.point >= num_points {
                return Err(BundleAdjustmentError::PointIndexOutOfRange {
                    observation: i,
                    point: obs.point,
                    num_points,
                });
            }
            if !obs.measurement.iter().all(|m| m.is_finite()) {
                return Err(BundleAdjustmentError::NonFiniteInput("observations"));
            }
        }

        let (camera_offsets, camera_observations) =
            group(observations.iter().map(|o| o.camera), num_cameras);
        let (point_offsets, point_observations) =
            group(observations.iter().map(|o| o.point), num_points);

        if let Some(c) = (0..num_cameras).find(|&c| camera_offsets[c] == camera_offsets[c + 1]) {
            return Err(BundleAdjustmentError::UnobservedCamera(c));
        }
        if let Some(p) = (0..num_points).find(|&p| point_offsets[p] == point_offsets[p + 1]) {
            return Err(BundleAdjustmentError::UnobservedPoint(p));
        }

        Ok(Self {
            camera_offsets,
            camera_observations,
            point_offsets,
            point_observations,
        })
    }

    /// Number of cameras.
    pub fn num_cameras(&self) -> usize {
        self.camera_offsets.len() - 1
    }

    /// Number of points.
    pub fn num_points(&self) -> usize {
        self.point_offsets.len() - 1
    }

    /// Number of observations.
    pub fn num_observations(&self) -> usize {
        self.camera_observations.len()
    }

    /// Observation indices of a camera, ascending.
    pub fn camera_observations(&self, camera: usize) -> &[usize] {
        &self.camera_observations[self.camera_offsets[camera]..self.camera_offsets[camera + 1]]
    }

    /// Observation indices of a point, ascending.
    pub fn point_observations(&self, point: usize) -> &[usize] {
        &self.point_observations[self.point_offsets[point]..self.point_offsets[point + 1]]
    }

    /// Observation indices grouped by camera, concatenated.
    pub(crate) fn camera_order(&self) -> &[usize] {
        &self.camera_observations
    }

    /// Range of a camera's group inside [`Self::camera_order`].
    pub(crate) fn camera_range(&self, camera: usize) -> std::ops::Range<usize> {
        self.camera_offsets[camera]..self.camera_offsets[camera + 1]
    }
}
