#![allow(dead_code)]

use glam::DVec3;
use kornia_ba::projection::project;
use kornia_ba::rotation::rodrigues;
use kornia_ba::{Camera, DistortionModel, Observation, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct Scene {
    pub cameras: Vec<Camera>,
    pub points: Vec<Point>,
    pub observations: Vec<Observation>,
}

/// Measurement whose undistorted value `m / (1 + d * |m|^2)` equals `predicted`.
fn distort_measurement(predicted: [f64; 2], d: f64) -> [f64; 2] {
    let mut m = predicted;
    for _ in 0..100 {
        let r2 = m[0] * m[0] + m[1] * m[1];
        m = [predicted[0] * (1.0 + d * r2), predicted[1] * (1.0 + d * r2)];
    }
    m
}

/// Cameras on a line looking at a cloud of points around `z = 6`, every camera
/// observing every point without noise.
pub fn ground_truth(
    num_cameras: usize,
    num_points: usize,
    focal: f64,
    distortion: f64,
    model: DistortionModel,
    seed: u64,
) -> Scene {
    let mut rng = StdRng::seed_from_u64(seed);

    let cameras: Vec<Camera> = (0..num_cameras)
        .map(|i| {
            let x = if num_cameras > 1 {
                -1.5 + 3.0 * i as f64 / (num_cameras - 1) as f64
            } else {
                0.0
            };
            let center = DVec3::new(x, rng.random_range(-0.2..0.2), rng.random_range(-0.2..0.2));
            let omega = DVec3::new(
                rng.random_range(-0.05..0.05),
                (x / 6.0).atan(),
                rng.random_range(-0.05..0.05),
            );
            let rotation = rodrigues(omega);
            let translation = -(rotation * center);
            let mut camera = Camera::new(focal, [[0.0; 3]; 3], translation.to_array())
                .with_distortion(distortion, model);
            camera.set_rotation_matrix(&rotation);
            camera
        })
        .collect();

    let points: Vec<Point> = (0..num_points)
        .map(|_| {
            Point::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-2.0..2.0),
                rng.random_range(5.0..8.0),
            )
        })
        .collect();

    let mut observations = Vec::with_capacity(num_cameras * num_points);
    for (p, point) in points.iter().enumerate() {
        for (c, camera) in cameras.iter().enumerate() {
            let predicted = project(camera, point, model);
            let measurement = match model {
                DistortionModel::Measurement => distort_measurement(predicted, distortion),
                DistortionModel::None | DistortionModel::Projection => predicted,
            };
            observations.push(Observation::new(c, p, measurement));
        }
    }

    Scene {
        cameras,
        points,
        observations,
    }
}

/// Perturb the poses of the non-fixed cameras and every point.
pub fn perturb(scene: &Scene, rotation: f64, translation: f64, position: f64, seed: u64) -> Scene {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut noise = |scale: f64| DVec3::new(
        rng.random_range(-scale..scale),
        rng.random_range(-scale..scale),
        rng.random_range(-scale..scale),
    );

    let cameras = scene
        .cameras
        .iter()
        .map(|camera| {
            if camera.fixed {
                return *camera;
            }
            let mut out = *camera;
            out.set_rotation_matrix(&(rodrigues(noise(rotation)) * camera.rotation_matrix()));
            out.translation = (camera.translation_vector() + noise(translation)).to_array();
            out
        })
        .collect();
    let points = scene
        .points
        .iter()
        .map(|p| Point::from((p.vector() + noise(position)).to_array()))
        .collect();

    Scene {
        cameras,
        points,
        observations: scene.observations.clone(),
    }
}

/// Add uniform pixel noise to every measurement.
pub fn add_measurement_noise(scene: &mut Scene, pixels: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for obs in scene.observations.iter_mut() {
        obs.measurement[0] += rng.random_range(-pixels..pixels);
        obs.measurement[1] += rng.random_range(-pixels..pixels);
    }
}
