//! Hyperelastic response dataset generator.
//!
//! A 28x28 bitmap is turned into a two-phase modulus field over a square
//! domain, the domain is stretched in a fixed sequence of quasi-static load
//! steps, and every converged step is reduced to pixel-centre displacements,
//! boundary reaction forces and strain energy.

pub mod config;
pub mod dataset;
pub mod datatypes;
pub mod error;
pub mod hyperelastic;
pub mod material;
pub mod mesher;
pub mod post_processor;
pub mod raster;
pub mod solver;

use std::path::PathBuf;

use indicatif::ProgressBar;
use tracing::info;

use crate::{
    config::SimulationConfig,
    dataset::DatasetWriter,
    error::Result,
    hyperelastic::HyperelasticModel,
    material::MaterialField,
    mesher::DomainMesh,
    post_processor::{PostProcessor, SimulationRun},
    raster::RasterImage,
    solver::IncrementalSolver,
};

/// One (sample, train/test, resolution) job.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    /// Row of the dataset file.
    pub index: usize,
    pub is_train: bool,
    /// Mesh divisions per side.
    pub mesh_divisions: usize,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl SampleRequest {
    pub fn dataset_file(&self) -> PathBuf {
        let name = if self.is_train {
            "mnist_img_train.txt"
        } else {
            "mnist_img_test.txt"
        };
        self.input_dir.join(name)
    }

    /// Output directory name, e.g. `folder_train_data_12_ms_num28`.
    pub fn output_name(&self) -> String {
        let split = if self.is_train { "train" } else { "test" };
        format!(
            "folder_{split}_data_{}_ms_num{}",
            self.index, self.mesh_divisions
        )
    }
}

/// Runs the full load sequence on one bitmap
///
/// # Arguments
/// * `config` - The run configuration
/// * `raster` - The oriented input bitmap
/// * `divisions` - Mesh divisions per side
/// * `trace_linear` - Log inner conjugate gradient iterations
///
/// # Returns
/// The extracted quantities of every load step
pub fn simulate(
    config: &SimulationConfig,
    raster: &RasterImage,
    divisions: usize,
    trace_linear: bool,
) -> Result<SimulationRun> {
    let mesh = DomainMesh::structured(config, divisions)?;
    let material = MaterialField::from_raster(raster, config);
    let model = HyperelasticModel::new(&mesh, &material, config)?;
    let solver = IncrementalSolver::new(&model, config)?.with_linear_trace(trace_linear);
    let mut post = PostProcessor::new(&model, config)?;

    info!(
        "solving {} load steps on {} elements ({} free dofs)",
        config.load_steps.len(),
        mesh.elements.len(),
        solver.free_dof_count()
    );

    let bar = ProgressBar::new(config.load_steps.len() as u64);
    let result = solver.run(|report, field| {
        post.record(report, field)?;
        bar.inc(1);
        Ok(())
    });
    match result {
        Ok(_) => bar.finish_with_message("all load steps converged"),
        Err(err) => {
            bar.abandon();
            return Err(err);
        }
    }

    Ok(post.finish())
}

/// Loads the requested sample, simulates it and writes its dataset directory.
///
/// # Returns
/// The path of the written directory
pub fn run_sample(
    config: &SimulationConfig,
    request: &SampleRequest,
    trace_linear: bool,
) -> Result<PathBuf> {
    let dataset = request.dataset_file();
    let raster = RasterImage::load(&dataset, request.index, config.raster_size)?;
    info!(
        "loaded sample {} from {}",
        request.index,
        dataset.display()
    );

    let run = simulate(config, &raster, request.mesh_divisions, trace_linear)?;

    DatasetWriter::new(&request.output_dir, request.output_name())
        .with_stress(config.write_stress)
        .write(&run)
}
