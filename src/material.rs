//! Spatially varying elastic properties derived from a bitmap.
//!
//! Each pixel is a square cell of the domain. A point belongs to cell
//! `(floor(x), floor(y))` (in pixel units) under the half-open convention
//! `cell <= coord < cell + 1`; points on the far edges of the domain belong to
//! the last cell. The modulus maps intensity linearly onto `[back, high]`.

use crate::{
    config::SimulationConfig,
    datatypes::Vertex,
    error::{FeaError, Result},
    raster::{RasterImage, MAX_INTENSITY},
};

/// Isotropic elastic constants at a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub youngs_modulus: f64,
    pub poissons_ratio: f64,
}

impl Material {
    /// Lamé's first parameter λ = Eν / ((1+ν)(1-2ν)).
    pub fn lame_lambda(&self) -> f64 {
        let e = self.youngs_modulus;
        let nu = self.poissons_ratio;
        e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu))
    }

    /// Lamé's second parameter μ = E / (2(1+ν)).
    pub fn lame_mu(&self) -> f64 {
        self.youngs_modulus / (2.0 * (1.0 + self.poissons_ratio))
    }
}

/// Piecewise-constant modulus lookup table over the domain.
#[derive(Debug, Clone)]
pub struct MaterialField {
    size: usize,
    moduli: Vec<f64>,
    poissons_ratio: f64,
    lower: Vertex,
    pixel: (f64, f64),
    upper: Vertex,
}

impl MaterialField {
    pub fn from_raster(raster: &RasterImage, config: &SimulationConfig) -> MaterialField {
        let size = raster.size();
        let mut moduli = vec![0.0; size * size];
        for j in 0..size {
            for k in 0..size {
                moduli[j * size + k] = raster.intensity(j, k) / MAX_INTENSITY
                    * (config.high - config.back)
                    + config.back;
            }
        }

        let pixel = (
            (config.upper.x - config.lower.x) / size as f64,
            (config.upper.y - config.lower.y) / size as f64,
        );

        MaterialField {
            size,
            moduli,
            poissons_ratio: config.poisson_ratio,
            lower: config.lower,
            pixel,
            upper: config.upper,
        }
    }

    /// Material at `(x, y)`. Points outside the domain are an error.
    pub fn material_at(&self, x: f64, y: f64) -> Result<Material> {
        let inside = x >= self.lower.x && x <= self.upper.x && y >= self.lower.y && y <= self.upper.y;
        if !inside {
            return Err(FeaError::DomainQueryOutOfRange { x, y });
        }

        let cell = |p: f64, lo: f64, width: f64| -> usize {
            (((p - lo) / width).floor() as usize).min(self.size - 1)
        };
        let j = cell(x, self.lower.x, self.pixel.0);
        let k = cell(y, self.lower.y, self.pixel.1);

        Ok(Material {
            youngs_modulus: self.moduli[j * self.size + k],
            poissons_ratio: self.poissons_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_points() -> Vec<(f64, f64)> {
        let mut points = Vec::new();
        for i in 0..=56 {
            for j in 0..=56 {
                points.push((i as f64 * 0.5, j as f64 * 0.5));
            }
        }
        points.push((27.999, 0.001));
        points
    }

    #[test]
    fn uniform_images_map_to_limits() {
        let config = SimulationConfig::default();

        let black = MaterialField::from_raster(&RasterImage::uniform(28, 0.0).unwrap(), &config);
        let white = MaterialField::from_raster(&RasterImage::uniform(28, 255.0).unwrap(), &config);

        for (x, y) in sample_points() {
            assert_eq!(black.material_at(x, y).unwrap().youngs_modulus, config.back);
            assert_relative_eq!(
                white.material_at(x, y).unwrap().youngs_modulus,
                config.high,
                epsilon = 1e-12
            );
            assert_eq!(black.material_at(x, y).unwrap().poissons_ratio, 0.3);
        }
    }

    #[test]
    fn lookup_follows_half_open_cells() {
        let config = SimulationConfig::default();
        let raw: Vec<f64> = (0..784).map(|i| (i % 251) as f64).collect();
        let raster = RasterImage::from_raw(&raw, 28).unwrap();
        let field = MaterialField::from_raster(&raster, &config);

        let expected = |j: usize, k: usize| raster.intensity(j, k) / 255.0 * 99.0 + 1.0;

        for j in 0..28 {
            for k in 0..28 {
                let (x, y) = (j as f64 + 0.37, k as f64 + 0.81);
                assert_relative_eq!(
                    field.material_at(x, y).unwrap().youngs_modulus,
                    expected(j, k),
                    epsilon = 1e-12
                );
            }
        }

        // x == k belongs to cell k, not k - 1
        for line in [1usize, 7, 14, 27] {
            let e = field.material_at(line as f64, 3.5).unwrap().youngs_modulus;
            assert_relative_eq!(e, expected(line, 3), epsilon = 1e-12);
            let e = field.material_at(10.5, line as f64).unwrap().youngs_modulus;
            assert_relative_eq!(e, expected(10, line), epsilon = 1e-12);
        }

        // far edges fall back onto the last cell
        let e = field.material_at(28.0, 28.0).unwrap().youngs_modulus;
        assert_relative_eq!(e, expected(27, 27), epsilon = 1e-12);
    }

    #[test]
    fn outside_domain_is_an_error() {
        let config = SimulationConfig::default();
        let field = MaterialField::from_raster(&RasterImage::uniform(28, 10.0).unwrap(), &config);
        assert!(matches!(
            field.material_at(-0.01, 4.0),
            Err(FeaError::DomainQueryOutOfRange { .. })
        ));
        assert!(field.material_at(4.0, 28.01).is_err());
    }

    #[test]
    fn lame_parameters() {
        let m = Material {
            youngs_modulus: 2.6,
            poissons_ratio: 0.3,
        };
        assert_relative_eq!(m.lame_mu(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.lame_lambda(), 2.6 * 0.3 / (1.3 * 0.4), epsilon = 1e-12);
    }
}
