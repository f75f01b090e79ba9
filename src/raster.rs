//! Bitmap loading.
//!
//! Dataset files are plain text matrices with one flattened image per row.
//! Rows are reshaped row-major and then re-oriented so that the first index
//! runs along the physical x axis and the second along y.

use std::path::Path;

use tracing::debug;

use crate::error::{FeaError, Result};

/// Largest pixel intensity in the dataset files.
pub const MAX_INTENSITY: f64 = 255.0;

/// Immutable square bitmap indexed as `(column along x, row along y)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    size: usize,
    values: Vec<f64>,
}

impl RasterImage {
    /// Builds an oriented image from a raw row-major bitmap whose first row is
    /// the top of the picture: `oriented[j, k] = raw[size - 1 - k, j]`.
    pub fn from_raw(raw: &[f64], size: usize) -> Result<RasterImage> {
        if size == 0 || raw.len() != size * size {
            return Err(FeaError::Input(format!(
                "bitmap has {} values, expected {}",
                raw.len(),
                size * size
            )));
        }
        if let Some(bad) = raw
            .iter()
            .find(|v| !v.is_finite() || **v < 0.0 || **v > MAX_INTENSITY)
        {
            return Err(FeaError::Input(format!(
                "bitmap intensity {bad} outside [0, {MAX_INTENSITY}]"
            )));
        }

        let mut values = vec![0.0; size * size];
        for j in 0..size {
            for k in 0..size {
                values[j * size + k] = raw[(size - 1 - k) * size + j];
            }
        }

        Ok(RasterImage { size, values })
    }

    /// Image with every pixel set to `intensity`.
    pub fn uniform(size: usize, intensity: f64) -> Result<RasterImage> {
        RasterImage::from_raw(&vec![intensity; size * size], size)
    }

    /// Reads row `index` of a whitespace separated dataset file.
    ///
    /// Blank lines and `#` comments are skipped, as numpy's `loadtxt` does.
    pub fn load(path: &Path, index: usize, size: usize) -> Result<RasterImage> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) => {
                return Err(FeaError::Input(format!(
                    "Unable to open dataset file {}: {err}",
                    path.display()
                )))
            }
        };

        let mut rows = contents
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .filter(|l| !l.is_empty());

        let line = match rows.nth(index) {
            Some(line) => line,
            None => {
                let total = contents
                    .lines()
                    .map(|l| l.split('#').next().unwrap_or("").trim())
                    .filter(|l| !l.is_empty())
                    .count();
                return Err(FeaError::InvalidInputIndex {
                    index,
                    rows: total,
                    path: path.to_path_buf(),
                });
            }
        };

        let mut raw = Vec::with_capacity(size * size);
        for token in line.split_whitespace() {
            match token.parse::<f64>() {
                Ok(v) => raw.push(v),
                Err(_) => {
                    return Err(FeaError::Input(format!(
                        "Bad value '{token}' in row {index} of {}",
                        path.display()
                    )))
                }
            }
        }

        debug!(
            "loaded bitmap row {} from {} ({} values)",
            index,
            path.display(),
            raw.len()
        );

        RasterImage::from_raw(&raw, size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Intensity of the pixel in column `j` (x) and row `k` (y, counted from the bottom).
    pub fn intensity(&self, j: usize, k: usize) -> f64 {
        self.values[j * self.size + k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ramp(size: usize) -> Vec<f64> {
        (0..size * size).map(|i| (i % 256) as f64).collect()
    }

    #[test]
    fn orientation_remaps_rows_to_y_axis() {
        let size = 28;
        let raw = ramp(size);
        let image = RasterImage::from_raw(&raw, size).unwrap();

        for j in 0..size {
            for k in 0..size {
                assert_eq!(image.intensity(j, k), raw[(27 - k) * size + j]);
            }
        }
        // bottom-left of the domain is the first pixel of the last raw row
        assert_eq!(image.intensity(0, 0), raw[27 * size]);
        // top-left of the domain is the very first raw pixel
        assert_eq!(image.intensity(0, 27), raw[0]);
    }

    #[test]
    fn rejects_wrong_length_and_range() {
        assert!(matches!(
            RasterImage::from_raw(&[0.0; 10], 28),
            Err(FeaError::Input(_))
        ));
        let mut raw = vec![0.0; 4];
        raw[2] = 256.0;
        assert!(RasterImage::from_raw(&raw, 2).is_err());
        raw[2] = -1.0;
        assert!(RasterImage::from_raw(&raw, 2).is_err());
    }

    #[test]
    fn loads_requested_row() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0 0 0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "1 2 3 4  # second sample").unwrap();
        file.flush().unwrap();

        let image = RasterImage::load(file.path(), 1, 2).unwrap();
        // raw = [[1, 2], [3, 4]]; oriented[j, k] = raw[1 - k, j]
        assert_eq!(image.intensity(0, 0), 3.0);
        assert_eq!(image.intensity(1, 0), 4.0);
        assert_eq!(image.intensity(0, 1), 1.0);
        assert_eq!(image.intensity(1, 1), 2.0);
    }

    #[test]
    fn index_past_end_is_invalid_input_index() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0 0 0").unwrap();
        writeln!(file, "1 1 1 1").unwrap();
        file.flush().unwrap();

        match RasterImage::load(file.path(), 2, 2) {
            Err(FeaError::InvalidInputIndex { index, rows, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(rows, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_input_error() {
        let err = RasterImage::load(Path::new("/nonexistent/mnist.txt"), 0, 28).unwrap_err();
        assert!(matches!(err, FeaError::Input(_)));
    }
}
