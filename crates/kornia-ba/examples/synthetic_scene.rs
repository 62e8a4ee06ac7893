use argh::FromArgs;
use kornia_ba::projection::project;
use kornia_ba::rotation::rodrigues;
use kornia_ba::{
    BundleAdjuster, BundleAdjustmentConfig, Camera, DistortionModel, JacobianStorage,
    LinearSolverKind, Observation, Point,
};
use rand::Rng;

/// Refines a noisy synthetic scene with bundle adjustment
#[derive(Debug, FromArgs)]
struct Args {
    /// number of cameras
    #[argh(option, short = 'c', default = "10")]
    num_cameras: usize,

    /// number of points
    #[argh(option, short = 'p', default = "500")]
    num_points: usize,

    /// measurement noise in pixels
    #[argh(option, short = 'n', default = "0.5")]
    noise: f64,

    /// number of worker threads, 0 for all cores
    #[argh(option, short = 't', default = "0")]
    num_threads: usize,

    /// solve the reduced camera system
    #[argh(switch, short = 's')]
    schur: bool,

    /// recompute the jacobian inside every product instead of storing it
    #[argh(switch, short = 'i')]
    implicit: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();
    let mut rng = rand::rng();

    let focal = 800.0;
    let truth_cameras: Vec<Camera> = (0..args.num_cameras)
        .map(|i| {
            let angle = 0.6 * (i as f64 / args.num_cameras.max(1) as f64 - 0.5);
            let rotation = rodrigues(glam::DVec3::new(0.0, -angle, 0.0));
            let center = glam::DVec3::new(-6.0 * angle.sin(), 0.0, 6.0 - 6.0 * angle.cos());
            let mut camera = Camera::new(focal, [[0.0; 3]; 3], (-(rotation * center)).to_array());
            camera.set_rotation_matrix(&rotation);
            camera.with_fixed(i == 0)
        })
        .collect();
    let truth_points: Vec<Point> = (0..args.num_points)
        .map(|_| {
            Point::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-2.0..2.0),
                rng.random_range(5.0..8.0),
            )
        })
        .collect();

    let mut observations = Vec::new();
    for (p, point) in truth_points.iter().enumerate() {
        for (c, camera) in truth_cameras.iter().enumerate() {
            let m = project(camera, point, DistortionModel::None);
            observations.push(Observation::new(
                c,
                p,
                [
                    m[0] + rng.random_range(-args.noise..=args.noise),
                    m[1] + rng.random_range(-args.noise..=args.noise),
                ],
            ));
        }
    }

    let mut cameras: Vec<Camera> = truth_cameras
        .iter()
        .map(|camera| {
            if camera.fixed {
                return *camera;
            }
            let mut out = *camera;
            let omega = glam::DVec3::new(
                rng.random_range(-0.02..0.02),
                rng.random_range(-0.02..0.02),
                rng.random_range(-0.02..0.02),
            );
            out.set_rotation_matrix(&(rodrigues(omega) * camera.rotation_matrix()));
            for t in out.translation.iter_mut() {
                *t += rng.random_range(-0.1..0.1);
            }
            out
        })
        .collect();
    let mut points: Vec<Point> = truth_points
        .iter()
        .map(|p| {
            let mut position = p.position;
            for x in position.iter_mut() {
                *x += rng.random_range(-0.2..0.2);
            }
            Point { position }
        })
        .collect();

    let config = BundleAdjustmentConfig::default()
        .with_num_threads(args.num_threads)
        .with_linear_solver(if args.schur {
            LinearSolverKind::Schur
        } else {
            LinearSolverKind::Full
        })
        .with_jacobian_storage(if args.implicit {
            JacobianStorage::Implicit
        } else {
            JacobianStorage::ObservationOrder
        });
    log::info!("config: {}", config.to_json_string()?);

    let solver = BundleAdjuster::new(config)?;
    let summary = solver.solve(&mut cameras, &mut points, &observations)?;

    println!(
        "{} cameras, {} points, {} observations on {} threads",
        cameras.len(),
        points.len(),
        observations.len(),
        solver.pool().num_threads()
    );
    println!(
        "mse {:.4} -> {:.4} px^2 after {} iterations ({} accepted, {} cg iterations)",
        summary.initial_mse,
        summary.final_mse,
        summary.iterations,
        summary.accepted_steps,
        summary.cg_iterations
    );
    println!(
        "termination: {:?}, elapsed {:?}",
        summary.termination_reason, summary.elapsed
    );

    Ok(())
}
