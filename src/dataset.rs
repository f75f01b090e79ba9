//! Persisting a run.
//!
//! All files go to a hidden staging directory beside the target and the
//! directory is renamed into place once everything is written, so a dataset
//! directory only ever exists for a fully completed run.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use nalgebra::{DMatrix, DVector};
use tracing::{info, warn};

use crate::{
    error::{FeaError, Result},
    post_processor::SimulationRun,
};

/// Formats a value like numpy's `savetxt` default `%.18e`.
pub fn format_savetxt(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_owned();
    }

    let formatted = format!("{value:.18e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(FeaError::write_failure(path, err)),
    }
}

/// Writes a matrix, one row per line with space separated values
pub fn write_matrix(path: &Path, matrix: &DMatrix<f64>) -> Result<()> {
    let mut file = create(path)?;
    for row in matrix.row_iter() {
        let line: Vec<String> = row.iter().map(|v| format_savetxt(*v)).collect();
        writeln!(file, "{}", line.join(" ")).map_err(|e| FeaError::write_failure(path, e))?;
    }
    file.flush().map_err(|e| FeaError::write_failure(path, e))
}

/// Writes a vector, one value per line
pub fn write_vector(path: &Path, vector: &DVector<f64>) -> Result<()> {
    let mut file = create(path)?;
    for v in vector.iter() {
        writeln!(file, "{}", format_savetxt(*v)).map_err(|e| FeaError::write_failure(path, e))?;
    }
    file.flush().map_err(|e| FeaError::write_failure(path, e))
}

/// Staging directory that deletes itself unless committed.
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "could not remove staging directory {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetWriter {
    root: PathBuf,
    name: String,
    include_stress: bool,
}

impl DatasetWriter {
    /// # Arguments
    /// * `root` - Directory the run directory is created in
    /// * `name` - Name of the run directory
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> DatasetWriter {
        DatasetWriter {
            root: root.into(),
            name: name.into(),
            include_stress: false,
        }
    }

    /// Also write `max_von_mises.txt`.
    pub fn with_stress(mut self, include_stress: bool) -> DatasetWriter {
        self.include_stress = include_stress;
        self
    }

    /// Final location of the run directory.
    pub fn target(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn staging_path(&self) -> PathBuf {
        self.root
            .join(format!(".{}.partial-{}", self.name, std::process::id()))
    }

    /// Writes every artifact of `run` and moves the directory into place
    ///
    /// # Returns
    /// The path of the committed run directory
    pub fn write(&self, run: &SimulationRun) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root).map_err(|e| FeaError::write_failure(&self.root, e))?;

        let path = self.staging_path();
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| FeaError::write_failure(&path, e))?;
        }
        std::fs::create_dir(&path).map_err(|e| FeaError::write_failure(&path, e))?;
        let mut staging = Staging {
            path,
            committed: false,
        };

        for record in &run.steps {
            let k = record.report.step.index;
            write_matrix(
                &staging.path.join(format!("pixel_disp_step{k}_x.txt")),
                &record.pixels.x,
            )?;
            write_matrix(
                &staging.path.join(format!("pixel_disp_step{k}_y.txt")),
                &record.pixels.y,
            )?;
        }

        write_matrix(&staging.path.join("rxn_force.txt"), &run.reaction_table())?;
        write_vector(&staging.path.join("strain_energy.txt"), &run.strain_energy)?;
        if self.include_stress {
            write_vector(&staging.path.join("max_von_mises.txt"), &run.max_von_mises())?;
        }

        let target = self.target();
        if target.exists() {
            warn!("replacing existing output {}", target.display());
            std::fs::remove_dir_all(&target).map_err(|e| FeaError::write_failure(&target, e))?;
        }
        std::fs::rename(&staging.path, &target).map_err(|e| FeaError::write_failure(&target, e))?;
        staging.committed = true;

        info!("wrote {} steps to {}", run.steps.len(), target.display());

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        post_processor::{PixelDisplacements, ReactionForces, StepRecord},
        solver::{LoadStep, StepReport},
    };

    fn record(index: usize, value: f64) -> StepRecord {
        StepRecord {
            report: StepReport {
                step: LoadStep {
                    index,
                    applied_displacement: value,
                },
                iterations: 1,
                residual_norm: 0.0,
            },
            reactions: ReactionForces {
                top_x: 0.0,
                bottom_x: 0.0,
                top_y: value,
                bottom_y: -value,
            },
            pixels: PixelDisplacements {
                x: DMatrix::from_element(3, 3, value),
                y: DMatrix::from_element(3, 3, -value),
            },
            strain_energy: value,
            max_von_mises: value,
        }
    }

    fn run() -> SimulationRun {
        SimulationRun {
            steps: vec![record(0, 0.0), record(1, 0.5)],
            strain_energy: DVector::from_vec(vec![0.0, 0.25]),
        }
    }

    #[test]
    fn formats_like_numpy() {
        assert_eq!(format_savetxt(1.0), "1.000000000000000000e+00");
        assert_eq!(format_savetxt(0.0), "0.000000000000000000e+00");
        assert_eq!(format_savetxt(-0.0025), "-2.500000000000000000e-03");
        assert_eq!(format_savetxt(1.5e120), "1.500000000000000000e+120");
        assert_eq!(format_savetxt(f64::NAN), "nan");
    }

    #[test]
    fn writes_all_artifacts_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(dir.path(), "folder_test_data_0_ms_num4").with_stress(true);
        let target = writer.write(&run()).unwrap();

        assert_eq!(target, dir.path().join("folder_test_data_0_ms_num4"));
        for name in [
            "pixel_disp_step0_x.txt",
            "pixel_disp_step0_y.txt",
            "pixel_disp_step1_x.txt",
            "pixel_disp_step1_y.txt",
            "rxn_force.txt",
            "strain_energy.txt",
            "max_von_mises.txt",
        ] {
            assert!(target.join(name).is_file(), "missing {name}");
        }

        let rxn = std::fs::read_to_string(target.join("rxn_force.txt")).unwrap();
        let rows: Vec<&str> = rxn.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].split(' ').count(), 4);
        assert!(rows[1].ends_with("-5.000000000000000000e-01"));

        let energy = std::fs::read_to_string(target.join("strain_energy.txt")).unwrap();
        assert_eq!(energy.lines().count(), 2);

        // no staging directory left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn rewrite_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(dir.path(), "out");
        let target = writer.write(&run()).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        writer.write(&run()).unwrap();
        assert!(!target.join("stale.txt").exists());
        assert!(!target.join("max_von_mises.txt").exists());
    }

    #[test]
    fn uncommitted_staging_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".partial");
        std::fs::create_dir(&path).unwrap();
        drop(Staging {
            path: path.clone(),
            committed: false,
        });
        assert!(!path.exists());
    }
}
