use crate::{
    config::{NewtonSettings, SimulationConfig},
    datatypes::{Boundary, Node},
    error::{FeaError, Result},
    hyperelastic::HyperelasticModel,
    mesher::DomainMesh,
};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use tracing::{debug, info};

use argmin::{
    core::{observers::ObserverMode, Executor, Operator},
    solver::conjugategradient::ConjugateGradient,
};
use argmin_observer_slog::SlogLogger;

/// Upper bound on CG iterations, as a multiple of the system size.
pub const MAX_CG_ITER_FACTOR: u64 = 10;
/// CG stops once the residual drops below this fraction of the rhs norm.
pub const CG_RELATIVE_TARGET: f64 = 1e-10;
/// A CG solution whose true residual exceeds this fraction of the rhs norm is
/// discarded in favour of a dense factorisation.
pub const CG_ACCEPT_RELATIVE: f64 = 1e-8;

/// Nodal displacements, two dofs per node. Owned by the incremental solver
/// and moved from one load step into the next.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    values: DVector<f64>,
}

impl DisplacementField {
    pub fn zeros(mesh: &DomainMesh) -> DisplacementField {
        DisplacementField {
            values: DVector::zeros(mesh.dof_count()),
        }
    }

    /// Wraps nodal values laid out as `[ux0, uy0, ux1, uy1, ...]`.
    pub fn from_values(values: DVector<f64>) -> DisplacementField {
        DisplacementField { values }
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// `(ux, uy)` of node `index`.
    pub fn node(&self, index: usize) -> (f64, f64) {
        let [dx, dy] = Node::dofs(index);
        (self.values[dx], self.values[dy])
    }
}

/// One prescribed top-boundary displacement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadStep {
    pub index: usize,
    pub applied_displacement: f64,
}

/// Outcome of a converged load step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: LoadStep,
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Accepted trial state of a damped Newton update.
#[derive(Debug)]
struct LineSearchStep {
    displacement: DVector<f64>,
    residual: DVector<f64>,
    norm: f64,
    alpha: f64,
}

/// Split of the global dofs into free and Dirichlet-constrained ones. The
/// constrained set is the same for every load step; only the top values move.
#[derive(Debug)]
struct DofMap {
    free: Vec<usize>,
    free_index: Vec<Option<usize>>,
    bottom_nodes: Vec<usize>,
    top_nodes: Vec<usize>,
}

impl DofMap {
    fn new(mesh: &DomainMesh) -> DofMap {
        let mut bottom_nodes = Vec::new();
        let mut top_nodes = Vec::new();
        for (i, node) in mesh.nodes.iter().enumerate() {
            match node.boundary {
                Some(Boundary::Bottom) => bottom_nodes.push(i),
                Some(Boundary::Top) => top_nodes.push(i),
                None => {}
            }
        }

        let mut free = Vec::with_capacity(mesh.dof_count());
        let mut free_index = vec![None; mesh.dof_count()];
        for (i, node) in mesh.nodes.iter().enumerate() {
            if node.boundary.is_some() {
                continue;
            }
            for dof in Node::dofs(i) {
                free_index[dof] = Some(free.len());
                free.push(dof);
            }
        }

        DofMap {
            free,
            free_index,
            bottom_nodes,
            top_nodes,
        }
    }

    fn free_norm(&self, r: &DVector<f64>) -> f64 {
        self.free.iter().map(|d| r[*d] * r[*d]).sum::<f64>().sqrt()
    }
}

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let product = self.a * &DVector::from_column_slice(x);
        Ok(product.as_slice().to_vec())
    }
}

/// Solves a system of equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `Ax=b`
///
/// # Arguments
/// * `a` - A square positive definite matrix
/// * `b` - A vector of the solutions to the system
/// * `target` - Absolute residual norm at which to stop
/// * `trace` - Attach the terminal slog observer to the executor
fn run_conjugate_gradient(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    target: f64,
    trace: bool,
) -> Result<DVector<f64>> {
    let n = b.nrows();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b.as_slice().to_vec());
    let operator = ConjugateGradientOperator { a };

    let mut executor = Executor::new(operator, solver).configure(|state| {
        state
            .param(vec![0.0; n])
            .max_iters(MAX_CG_ITER_FACTOR * n as u64)
            .target_cost(target)
    });
    if trace {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }

    let res = match executor.run() {
        Ok(r) => r,
        Err(err) => {
            return Err(FeaError::Solver(format!(
                "Conjugate Gradient error: {err}"
            )))
        }
    };

    let best_param = match &res.state().best_param {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(FeaError::Solver(
                "Conjugate Gradient could not produce best parameter".to_owned(),
            ))
        }
    };

    Ok(best_param)
}

fn solve_dense(a: &CsrMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let mut dense: DMatrix<f64> = DMatrix::zeros(a.nrows(), a.ncols());
    for (i, j, v) in a.triplet_iter() {
        dense[(i, j)] += *v;
    }

    match dense.lu().solve(b) {
        Some(x) => Ok(x),
        None => Err(FeaError::Solver("tangent matrix is singular".to_owned())),
    }
}

/// Solves `a x = b`, preferring conjugate gradient and falling back to a dense
/// LU factorisation when CG does not reach the requested accuracy.
pub fn solve_linear_system(a: &CsrMatrix<f64>, b: &DVector<f64>, trace: bool) -> Result<DVector<f64>> {
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return Ok(DVector::zeros(b.nrows()));
    }

    match run_conjugate_gradient(a, b, CG_RELATIVE_TARGET * b_norm, trace) {
        Ok(x) => {
            let residual = (a * &x - b).norm();
            if residual.is_finite() && residual <= CG_ACCEPT_RELATIVE * b_norm {
                return Ok(x);
            }
            debug!(
                "conjugate gradient stalled at relative residual {:.3e}, using dense LU",
                residual / b_norm
            );
        }
        Err(err) => debug!("{err}, using dense LU"),
    }

    solve_dense(a, b)
}

/// Drives the quasi-static load sequence: one Newton solve per step, each
/// starting from the previous step's converged field.
pub struct IncrementalSolver<'a> {
    model: &'a HyperelasticModel<'a>,
    dofs: DofMap,
    settings: NewtonSettings,
    load_steps: Vec<f64>,
    trace_linear: bool,
}

impl<'a> IncrementalSolver<'a> {
    pub fn new(model: &'a HyperelasticModel<'a>, config: &SimulationConfig) -> Result<IncrementalSolver<'a>> {
        let dofs = DofMap::new(model.mesh());
        if dofs.bottom_nodes.is_empty() || dofs.top_nodes.is_empty() {
            return Err(FeaError::Mesher(
                "mesh has no nodes on the top or bottom boundary".to_owned(),
            ));
        }

        Ok(IncrementalSolver {
            model,
            dofs,
            settings: config.newton,
            load_steps: config.load_steps.clone(),
            trace_linear: false,
        })
    }

    /// Logs every inner CG iteration through argmin's slog observer.
    pub fn with_linear_trace(mut self, trace: bool) -> IncrementalSolver<'a> {
        self.trace_linear = trace;
        self
    }

    pub fn load_steps(&self) -> impl Iterator<Item = LoadStep> + '_ {
        self.load_steps
            .iter()
            .enumerate()
            .map(|(index, applied)| LoadStep {
                index,
                applied_displacement: *applied,
            })
    }

    /// Number of unconstrained dofs.
    pub fn free_dof_count(&self) -> usize {
        self.dofs.free.len()
    }

    /// Bottom fully clamped; top clamped in x and pulled to `applied` in y.
    fn impose_dirichlet(&self, u: &mut DVector<f64>, applied: f64) {
        for node in &self.dofs.bottom_nodes {
            let [dx, dy] = Node::dofs(*node);
            u[dx] = 0.0;
            u[dy] = 0.0;
        }
        for node in &self.dofs.top_nodes {
            let [dx, dy] = Node::dofs(*node);
            u[dx] = 0.0;
            u[dy] = applied;
        }
    }

    /// Assembles the tangent restricted to free rows and columns.
    fn assemble_free_tangent(&self, u: &DVector<f64>) -> CsrMatrix<f64> {
        let n = self.dofs.free.len();
        let mut coo = CooMatrix::new(n, n);

        self.model.for_each_element_tangent(u, |dofs, k| {
            for (r, row) in dofs.iter().enumerate() {
                let Some(free_row) = self.dofs.free_index[*row] else {
                    continue;
                };
                for (c, col) in dofs.iter().enumerate() {
                    if let Some(free_col) = self.dofs.free_index[*col] {
                        coo.push(free_row, free_col, k[(r, c)]);
                    }
                }
            }
        });

        CsrMatrix::from(&coo)
    }

    /// Backtracks along `increment` from `u`, halving the step until no
    /// element inverts and the residual stays finite. `None` when every
    /// allowed halving fails.
    fn line_search(&self, u: &DVector<f64>, increment: &DVector<f64>) -> Option<LineSearchStep> {
        let require_positive = self.model.min_jacobian(u) > 0.0;
        let mut alpha = 1.0;
        for _ in 0..=self.settings.max_line_search {
            let mut trial = u.clone();
            for (i, dof) in self.dofs.free.iter().enumerate() {
                trial[*dof] += alpha * increment[i];
            }

            if !require_positive || self.model.min_jacobian(&trial) > 0.0 {
                let residual = self.model.residual(&trial);
                let norm = self.dofs.free_norm(&residual);
                if norm.is_finite() {
                    return Some(LineSearchStep {
                        displacement: trial,
                        residual,
                        norm,
                        alpha,
                    });
                }
            }
            alpha *= 0.5;
        }
        None
    }

    /// Solves one load step by Newton-Raphson
    ///
    /// # Arguments
    /// * `field` - The previous step's converged field, consumed as the initial guess
    /// * `step` - The load step to solve
    ///
    /// # Returns
    /// The converged field and a report of the iteration
    pub fn solve_step(
        &self,
        field: DisplacementField,
        step: LoadStep,
    ) -> Result<(DisplacementField, StepReport)> {
        let mut u = field.values;
        self.impose_dirichlet(&mut u, step.applied_displacement);

        let failure = |iterations: usize, residual: f64| FeaError::NonlinearConvergenceFailure {
            step: step.index,
            applied: step.applied_displacement,
            iterations,
            residual,
        };

        let mut residual = self.model.residual(&u);
        let mut norm = self.dofs.free_norm(&residual);
        let initial_norm = norm;
        if !norm.is_finite() {
            return Err(failure(0, norm));
        }

        let mut iteration = 0;
        loop {
            debug!(
                "step {} newton iteration {}: residual {:.3e}",
                step.index, iteration, norm
            );

            let converged = norm <= self.settings.absolute_tolerance
                || norm <= self.settings.relative_tolerance * initial_norm;
            if converged {
                break;
            }
            if iteration >= self.settings.max_iterations {
                return Err(failure(iteration, norm));
            }
            iteration += 1;

            let tangent = self.assemble_free_tangent(&u);
            let rhs = DVector::from_iterator(
                self.dofs.free.len(),
                self.dofs.free.iter().map(|d| -residual[*d]),
            );
            let increment = solve_linear_system(&tangent, &rhs, self.trace_linear)?;

            match self.line_search(&u, &increment) {
                Some(accepted) => {
                    if accepted.alpha < 1.0 {
                        debug!("line search damped newton step to {}", accepted.alpha);
                    }
                    u = accepted.displacement;
                    residual = accepted.residual;
                    norm = accepted.norm;
                }
                None => return Err(failure(iteration, norm)),
            }
        }

        info!(
            "step {} (applied {}) converged in {} iterations, residual {:.3e}",
            step.index, step.applied_displacement, iteration, norm
        );

        Ok((
            DisplacementField { values: u },
            StepReport {
                step,
                iterations: iteration,
                residual_norm: norm,
            },
        ))
    }

    /// Runs the solver over every load step. `on_step` sees each converged field
    /// before the next step starts; the first failing step aborts the run.
    ///
    /// # Returns
    /// The field of the last load step
    pub fn run<F>(&self, mut on_step: F) -> Result<DisplacementField>
    where
        F: FnMut(&StepReport, &DisplacementField) -> Result<()>,
    {
        let mut field = DisplacementField::zeros(self.model.mesh());
        let steps: Vec<LoadStep> = self.load_steps().collect();

        for step in steps {
            let (next, report) = self.solve_step(field, step)?;
            on_step(&report, &next)?;
            field = next;
        }

        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{material::MaterialField, raster::RasterImage};
    use approx::assert_relative_eq;

    fn setup(divisions: usize, intensity: f64) -> (SimulationConfig, DomainMesh, MaterialField) {
        let config = SimulationConfig::default();
        let mesh = DomainMesh::structured(&config, divisions).unwrap();
        let material =
            MaterialField::from_raster(&RasterImage::uniform(28, intensity).unwrap(), &config);
        (config, mesh, material)
    }

    #[test]
    fn dof_map_constrains_top_and_bottom_rows() {
        let (_, mesh, _) = setup(3, 0.0);
        let dofs = DofMap::new(&mesh);
        assert_eq!(dofs.bottom_nodes, vec![0, 1, 2, 3]);
        assert_eq!(dofs.top_nodes, vec![12, 13, 14, 15]);
        assert_eq!(dofs.free.len(), 2 * 8);
        assert_eq!(dofs.free_index[0], None);
        assert_eq!(dofs.free_index[8], Some(0));
    }

    #[test]
    fn linear_system_solution() {
        let mut coo = CooMatrix::new(3, 3);
        for (i, j, v) in [
            (0, 0, 4.0),
            (0, 1, 1.0),
            (1, 0, 1.0),
            (1, 1, 3.0),
            (1, 2, -1.0),
            (2, 1, -1.0),
            (2, 2, 2.0),
        ] {
            coo.push(i, j, v);
        }
        let a = CsrMatrix::from(&coo);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let x = solve_linear_system(&a, &b, false).unwrap();
        let ax = &a * &x;
        assert_relative_eq!(ax, b, epsilon = 1e-8);

        let dense = solve_dense(&a, &b).unwrap();
        assert_relative_eq!(dense, x, epsilon = 1e-7);
    }

    #[test]
    fn singular_system_is_solver_error() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 1.0);
        coo.push(0, 1, 1.0);
        coo.push(1, 0, 1.0);
        coo.push(1, 1, 1.0);
        let a = CsrMatrix::from(&coo);
        let err = solve_dense(&a, &DVector::from_vec(vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, FeaError::Solver(_)));
    }

    #[test]
    fn reference_step_converges_immediately() {
        let (config, mesh, material) = setup(2, 128.0);
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let step = LoadStep {
            index: 0,
            applied_displacement: 0.0,
        };
        let (field, report) = solver.solve_step(DisplacementField::zeros(&mesh), step).unwrap();
        assert_eq!(report.iterations, 0);
        assert_eq!(field.values().norm(), 0.0);
    }

    #[test]
    fn stretch_step_satisfies_boundary_conditions_and_equilibrium() {
        let (config, mesh, material) = setup(3, 200.0);
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let step = LoadStep {
            index: 1,
            applied_displacement: 2.0,
        };
        let (field, report) = solver.solve_step(DisplacementField::zeros(&mesh), step).unwrap();
        assert!(report.iterations > 0);

        for (i, node) in mesh.nodes.iter().enumerate() {
            let (ux, uy) = field.node(i);
            match node.boundary {
                Some(Boundary::Bottom) => {
                    assert_eq!((ux, uy), (0.0, 0.0));
                }
                Some(Boundary::Top) => {
                    assert_eq!((ux, uy), (0.0, 2.0));
                }
                None => {
                    assert!(uy > 0.0 && uy < 2.0);
                }
            }
        }

        let residual = model.residual(field.values());
        assert!(solver.dofs.free_norm(&residual) <= 1e-6);
        assert!(model.min_jacobian(field.values()) > 0.0);
    }

    #[test]
    fn run_threads_state_through_every_step() {
        let (config, mesh, material) = setup(2, 64.0);
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let mut seen = Vec::new();
        let last = solver
            .run(|report, field| {
                let top = mesh.nodes.len() - 1;
                seen.push((report.step.index, field.node(top).1));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), config.load_steps.len());
        for (i, (index, top_uy)) in seen.iter().enumerate() {
            assert_eq!(*index, i);
            assert_eq!(*top_uy, config.load_steps[i]);
        }
        assert_eq!(last.node(mesh.nodes.len() - 1).1, 14.0);
    }

    #[test]
    fn iteration_cap_reports_convergence_failure() {
        let (mut config, mesh, material) = setup(2, 64.0);
        config.newton.max_iterations = 1;
        config.newton.absolute_tolerance = 0.0;
        config.newton.relative_tolerance = 0.0;
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let step = LoadStep {
            index: 4,
            applied_displacement: 5.0,
        };
        match solver.solve_step(DisplacementField::zeros(&mesh), step) {
            Err(FeaError::NonlinearConvergenceFailure {
                step, iterations, ..
            }) => {
                assert_eq!(step, 4);
                assert_eq!(iterations, 1);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    fn downward_increment() -> DVector<f64> {
        // middle row of a 2x2 mesh: uy dofs sit at odd free indices
        DVector::from_fn(6, |i, _| if i % 2 == 1 { -20.0 } else { 0.0 })
    }

    #[test]
    fn line_search_halves_inverting_step() {
        let (config, mesh, material) = setup(2, 64.0);
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();
        assert_eq!(solver.free_dof_count(), 6);

        let u = DVector::zeros(mesh.dof_count());
        let accepted = solver.line_search(&u, &downward_increment()).unwrap();
        assert_eq!(accepted.alpha, 0.5);
        assert_eq!(accepted.displacement[Node::dofs(4)[1]], -10.0);
        assert!(model.min_jacobian(&accepted.displacement) > 0.0);
        assert!(accepted.norm.is_finite());
    }

    #[test]
    fn line_search_gives_up_without_halvings() {
        let (mut config, mesh, material) = setup(2, 64.0);
        config.newton.max_line_search = 0;
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let u = DVector::zeros(mesh.dof_count());
        assert!(solver.line_search(&u, &downward_increment()).is_none());
    }

    #[test]
    fn cg_acceptance_is_looser_than_its_target() {
        assert_eq!(CG_RELATIVE_TARGET, 1e-10);
        assert_eq!(CG_ACCEPT_RELATIVE, 1e-8);
        assert!(CG_RELATIVE_TARGET < CG_ACCEPT_RELATIVE);
    }

    #[test]
    fn callback_error_aborts_run() {
        let (config, mesh, material) = setup(1, 64.0);
        let model = HyperelasticModel::new(&mesh, &material, &config).unwrap();
        let solver = IncrementalSolver::new(&model, &config).unwrap();

        let mut calls = 0;
        let result = solver.run(|report, _| {
            calls += 1;
            if report.step.index == 2 {
                return Err(FeaError::Input("stop".to_owned()));
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
