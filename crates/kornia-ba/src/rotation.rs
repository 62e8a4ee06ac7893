use glam::{DMat3, DVec3};

/// Skew-symmetric matrix `[v]x` such that `[v]x * w = v x w`.
#[inline]
pub fn hat(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Rotation matrix of an angle-axis vector (Rodrigues formula).
///
/// Small angles use the Taylor expansion of the coefficients so the result stays
/// orthonormal to machine precision.
pub fn rodrigues(omega: DVec3) -> DMat3 {
    let theta2 = omega.length_squared();
    let k = hat(omega);
    let (a, b) = if theta2 < 1e-12 {
        (1.0 - theta2 / 6.0, 0.5 - theta2 / 24.0)
    } else {
        let theta = theta2.sqrt();
        (theta.sin() / theta, (1.0 - theta.cos()) / theta2)
    };
    DMat3::IDENTITY + k * a + (k * k) * b
}

/// Largest absolute entry of `R^T R - I`.
pub fn orthonormality_error(r: &DMat3) -> f64 {
    let e = r.transpose() * *r - DMat3::IDENTITY;
    e.to_cols_array()
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hat() {
        let v = DVec3::new(1.0, 2.0, 3.0);
        let w = DVec3::new(-0.5, 0.25, 2.0);
        let lhs = hat(v) * w;
        let rhs = v.cross(w);
        assert_relative_eq!(lhs.x, rhs.x);
        assert_relative_eq!(lhs.y, rhs.y);
        assert_relative_eq!(lhs.z, rhs.z);
    }

    #[test]
    fn test_rodrigues_matches_axis_angle() {
        let axis = DVec3::new(0.3, -0.4, 0.5).normalize();
        let angle = 0.7;
        let r = rodrigues(axis * angle);
        let expected = DMat3::from_axis_angle(axis, angle);
        for (a, b) in r.to_cols_array().iter().zip(expected.to_cols_array().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rodrigues_small_angle() {
        let r = rodrigues(DVec3::new(1e-9, -2e-9, 3e-9));
        assert!(orthonormality_error(&r) < 1e-15);
        assert_eq!(rodrigues(DVec3::ZERO), DMat3::IDENTITY);
    }

    #[test]
    fn test_composition_stays_orthonormal() {
        let mut r = DMat3::IDENTITY;
        for i in 0..1000 {
            let t = i as f64;
            r = rodrigues(DVec3::new(0.01 * t.sin(), 0.02, -0.015 * t.cos())) * r;
        }
        assert!(orthonormality_error(&r) < 1e-11);
    }
}
