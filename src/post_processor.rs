use nalgebra::{DMatrix, DVector};
use tracing::info;

use crate::{
    config::SimulationConfig,
    datatypes::{BoundaryRegion, Node, Vertex},
    error::Result,
    hyperelastic::{von_mises, HyperelasticModel},
    mesher::DomainMesh,
    solver::{DisplacementField, StepReport},
};

/// Summed unknown nodal forces on the top and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReactionForces {
    pub top_x: f64,
    pub bottom_x: f64,
    pub top_y: f64,
    pub bottom_y: f64,
}

impl ReactionForces {
    /// Row layout of the reaction table: `top_x, bottom_x, top_y, bottom_y`.
    pub fn as_row(&self) -> [f64; 4] {
        [self.top_x, self.bottom_x, self.top_y, self.bottom_y]
    }
}

/// Sums `f_int - f_ext` over the dofs within `tolerance` of the top and
/// bottom coordinate extents of the mesh.
#[derive(Debug, Clone)]
pub struct ReactionForceExtractor {
    top_nodes: Vec<usize>,
    bottom_nodes: Vec<usize>,
}

impl ReactionForceExtractor {
    pub fn new(mesh: &DomainMesh, tolerance: f64) -> ReactionForceExtractor {
        let (y_min, y_max) = mesh
            .nodes
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), n| {
                (lo.min(n.vertex.y), hi.max(n.vertex.y))
            });

        let top = BoundaryRegion::above(y_max - tolerance);
        let bottom = BoundaryRegion::below(y_min + tolerance);

        ReactionForceExtractor {
            top_nodes: mesh.nodes_in(&top).collect(),
            bottom_nodes: mesh.nodes_in(&bottom).collect(),
        }
    }

    pub fn extract(&self, model: &HyperelasticModel, field: &DisplacementField) -> ReactionForces {
        let unknown = model.internal_forces(field.values()) - model.external_forces();

        let sum = |nodes: &[usize], component: usize| -> f64 {
            nodes
                .iter()
                .map(|n| unknown[Node::dofs(*n)[component]])
                .sum()
        };

        ReactionForces {
            top_x: sum(&self.top_nodes, 0),
            bottom_x: sum(&self.bottom_nodes, 0),
            top_y: sum(&self.top_nodes, 1),
            bottom_y: sum(&self.bottom_nodes, 1),
        }
    }
}

/// Displacements at the pixel centres, indexed `(row along y, column along x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDisplacements {
    pub x: DMatrix<f64>,
    pub y: DMatrix<f64>,
}

#[derive(Debug, Clone, Copy)]
struct SamplePoint {
    row: usize,
    col: usize,
    nodes: [usize; 3],
    weights: [f64; 3],
}

/// Interpolates the displacement field at every pixel centre. The containing
/// elements are located once, so the grid size never depends on the mesh.
#[derive(Debug, Clone)]
pub struct PixelSampler {
    size: usize,
    points: Vec<SamplePoint>,
}

impl PixelSampler {
    pub fn new(mesh: &DomainMesh, config: &SimulationConfig) -> Result<PixelSampler> {
        let size = config.raster_size;
        let (px, py) = config.pixel_size();

        let mut points = Vec::with_capacity(size * size);
        for row in 0..size {
            for col in 0..size {
                let centre = Vertex::new(
                    config.lower.x + (col as f64 + 0.5) * px,
                    config.lower.y + (row as f64 + 0.5) * py,
                );
                let (element, weights) = mesh.locate(centre)?;
                points.push(SamplePoint {
                    row,
                    col,
                    nodes: mesh.elements[element].nodes,
                    weights,
                });
            }
        }

        Ok(PixelSampler { size, points })
    }

    pub fn sample(&self, field: &DisplacementField) -> PixelDisplacements {
        let mut x = DMatrix::zeros(self.size, self.size);
        let mut y = DMatrix::zeros(self.size, self.size);

        for point in &self.points {
            let (mut ux, mut uy) = (0.0, 0.0);
            for (node, weight) in point.nodes.iter().zip(point.weights) {
                let (nx, ny) = field.node(*node);
                ux += weight * nx;
                uy += weight * ny;
            }
            x[(point.row, point.col)] = ux;
            y[(point.row, point.col)] = uy;
        }

        PixelDisplacements { x, y }
    }
}

/// Running record of the total strain energy, reported relative to the first
/// (reference) step.
#[derive(Debug, Clone, Default)]
pub struct StrainEnergyAccumulator {
    values: Vec<f64>,
}

impl StrainEnergyAccumulator {
    pub fn push(&mut self, energy: f64) {
        self.values.push(energy);
    }

    pub fn raw(&self) -> &[f64] {
        &self.values
    }

    /// Energies with the first entry subtracted from every entry.
    pub fn finish(self) -> DVector<f64> {
        let first = self.values.first().copied().unwrap_or(0.0);
        DVector::from_iterator(self.values.len(), self.values.iter().map(|v| v - first))
    }
}

/// Everything extracted from one converged load step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub report: StepReport,
    pub reactions: ReactionForces,
    pub pixels: PixelDisplacements,
    pub strain_energy: f64,
    pub max_von_mises: f64,
}

/// Extracted quantities of a completed run.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub steps: Vec<StepRecord>,
    /// Baseline-subtracted strain energy, one entry per step.
    pub strain_energy: DVector<f64>,
}

impl SimulationRun {
    /// `(n_steps x 4)` table of [`ReactionForces::as_row`].
    pub fn reaction_table(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.steps.len(), 4, |r, c| self.steps[r].reactions.as_row()[c])
    }

    pub fn max_von_mises(&self) -> DVector<f64> {
        DVector::from_iterator(self.steps.len(), self.steps.iter().map(|s| s.max_von_mises))
    }
}

/// Consumes converged fields step by step and collects a [`SimulationRun`].
pub struct PostProcessor<'m> {
    model: &'m HyperelasticModel<'m>,
    reactions: ReactionForceExtractor,
    sampler: PixelSampler,
    energy: StrainEnergyAccumulator,
    steps: Vec<StepRecord>,
}

impl<'m> PostProcessor<'m> {
    pub fn new(model: &'m HyperelasticModel<'m>, config: &SimulationConfig) -> Result<PostProcessor<'m>> {
        Ok(PostProcessor {
            model,
            reactions: ReactionForceExtractor::new(model.mesh(), config.boundary_tolerance),
            sampler: PixelSampler::new(model.mesh(), config)?,
            energy: StrainEnergyAccumulator::default(),
            steps: Vec::new(),
        })
    }

    pub fn record(&mut self, report: &StepReport, field: &DisplacementField) -> Result<()> {
        let reactions = self.reactions.extract(self.model, field);
        let pixels = self.sampler.sample(field);
        let strain_energy = self.model.strain_energy(field.values());
        let max_von_mises = self
            .model
            .cauchy_stresses(field.values())
            .iter()
            .map(von_mises)
            .fold(0.0, f64::max);

        self.energy.push(strain_energy);

        info!(
            "step {} reactions top ({:.4e}, {:.4e}) bottom ({:.4e}, {:.4e}), energy {:.6e}",
            report.step.index,
            reactions.top_x,
            reactions.top_y,
            reactions.bottom_x,
            reactions.bottom_y,
            strain_energy
        );

        self.steps.push(StepRecord {
            report: *report,
            reactions,
            pixels,
            strain_energy,
            max_von_mises,
        });

        Ok(())
    }

    pub fn finish(self) -> SimulationRun {
        SimulationRun {
            steps: self.steps,
            strain_energy: self.energy.finish(),
        }
    }
}
