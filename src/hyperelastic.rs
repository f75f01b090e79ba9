//! Compressible neo-Hookean model on linear triangles.
//!
//! Strain-energy density, with `J = det F` and `I1 = F:F`:
//!
//! ```text
//! psi(F) = mu/2 (I1 - 3 - 2 ln J) + lambda/2 ((J^2 - 1)/2 - ln J)
//! ```
//!
//! The deformation gradient is 2x2 while the distortional term keeps the
//! three-dimensional offset, so the undeformed state carries `psi = -mu/2`.
//! Strain energies are therefore reported relative to the reference step.
//!
//! Fourth-order tensors are stored as 4x4 matrices indexed by `(2i + J, 2k + L)`.

use nalgebra::{DVector, Matrix2, Matrix4, SMatrix, SVector, Vector2};

use crate::{
    config::SimulationConfig,
    datatypes::{Node, DOF},
    error::Result,
    material::{Material, MaterialField},
    mesher::DomainMesh,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeoHookean {
    pub mu: f64,
    pub lambda: f64,
}

fn inverse_or_nan(f: &Matrix2<f64>) -> Matrix2<f64> {
    f.try_inverse()
        .unwrap_or_else(|| Matrix2::from_element(f64::NAN))
}

impl NeoHookean {
    pub fn new(material: &Material) -> NeoHookean {
        NeoHookean {
            mu: material.lame_mu(),
            lambda: material.lame_lambda(),
        }
    }

    /// Strain-energy density. NaN once the element is inverted (`J <= 0`).
    pub fn energy_density(&self, f: &Matrix2<f64>) -> f64 {
        let j = f.determinant();
        let i1 = f.norm_squared();
        let ln_j = j.ln();

        0.5 * self.mu * (i1 - 3.0 - 2.0 * ln_j) + 0.5 * self.lambda * (0.5 * (j * j - 1.0) - ln_j)
    }

    /// First Piola-Kirchhoff stress `P = dpsi/dF`.
    pub fn first_piola(&self, f: &Matrix2<f64>) -> Matrix2<f64> {
        let j = f.determinant();
        let f_inv_t = inverse_or_nan(f).transpose();

        (f - f_inv_t) * self.mu + f_inv_t * (0.5 * self.lambda * (j * j - 1.0))
    }

    /// Second Piola-Kirchhoff stress `S = F^-1 P`.
    pub fn second_piola(&self, f: &Matrix2<f64>) -> Matrix2<f64> {
        inverse_or_nan(f) * self.first_piola(f)
    }

    /// Cauchy stress `sigma = F S F^T / J`.
    pub fn cauchy_stress(&self, f: &Matrix2<f64>) -> Matrix2<f64> {
        let j = f.determinant();
        f * self.second_piola(f) * f.transpose() / j
    }

    /// Material tangent `dP/dF`.
    pub fn tangent(&self, f: &Matrix2<f64>) -> Matrix4<f64> {
        let j2 = f.determinant().powi(2);
        let g = inverse_or_nan(f);
        let geometric = self.mu - 0.5 * self.lambda * (j2 - 1.0);

        let mut c = Matrix4::zeros();
        for i in 0..DOF {
            for jj in 0..DOF {
                for k in 0..DOF {
                    for l in 0..DOF {
                        let identity = if i == k && jj == l { self.mu } else { 0.0 };
                        c[(DOF * i + jj, DOF * k + l)] = identity
                            + geometric * g[(l, i)] * g[(jj, k)]
                            + self.lambda * j2 * g[(jj, i)] * g[(l, k)];
                    }
                }
            }
        }
        c
    }
}

/// Plane von Mises measure of a 2D Cauchy stress.
pub fn von_mises(sigma: &Matrix2<f64>) -> f64 {
    let (sxx, syy, sxy) = (sigma[(0, 0)], sigma[(1, 1)], sigma[(0, 1)]);
    f64::sqrt(sxx * sxx - sxx * syy + syy * syy + 3.0 * sxy * sxy)
}

/// `F = I + grad u` for a linear triangle.
///
/// # Arguments
/// * `gradients` - Shape function gradients, one row per node
/// * `displacements` - Element displacements `[ux0, uy0, ux1, uy1, ux2, uy2]`
pub fn deformation_gradient(
    gradients: &SMatrix<f64, 3, 2>,
    displacements: &SVector<f64, 6>,
) -> Matrix2<f64> {
    let mut f = Matrix2::identity();
    for a in 0..3 {
        for i in 0..DOF {
            for jj in 0..DOF {
                f[(i, jj)] += displacements[DOF * a + i] * gradients[(a, jj)];
            }
        }
    }
    f
}

/// Internal virtual work of one element, `area * P : grad v`, per element dof.
pub fn element_internal_force(
    law: &NeoHookean,
    gradients: &SMatrix<f64, 3, 2>,
    area: f64,
    f: &Matrix2<f64>,
) -> SVector<f64, 6> {
    let p = law.first_piola(f);
    let mut force = SVector::<f64, 6>::zeros();
    for a in 0..3 {
        for i in 0..DOF {
            force[DOF * a + i] =
                area * (p[(i, 0)] * gradients[(a, 0)] + p[(i, 1)] * gradients[(a, 1)]);
        }
    }
    force
}

/// Linearisation of [`element_internal_force`] with respect to the element dofs.
pub fn element_tangent(
    law: &NeoHookean,
    gradients: &SMatrix<f64, 3, 2>,
    area: f64,
    f: &Matrix2<f64>,
) -> SMatrix<f64, 6, 6> {
    let c = law.tangent(f);
    let mut k = SMatrix::<f64, 6, 6>::zeros();
    for a in 0..3 {
        for b in 0..3 {
            for i in 0..DOF {
                for kk in 0..DOF {
                    let mut value = 0.0;
                    for jj in 0..DOF {
                        for l in 0..DOF {
                            value += gradients[(a, jj)]
                                * c[(DOF * i + jj, DOF * kk + l)]
                                * gradients[(b, l)];
                        }
                    }
                    k[(DOF * a + i, DOF * b + kk)] = area * value;
                }
            }
        }
    }
    k
}

/// Discrete hyperelastic problem on a mesh, with per-element coefficients
/// sampled at the element centroids (one-point quadrature).
#[derive(Debug)]
pub struct HyperelasticModel<'m> {
    mesh: &'m DomainMesh,
    laws: Vec<NeoHookean>,
    areas: Vec<f64>,
    gradients: Vec<SMatrix<f64, 3, 2>>,
    external: DVector<f64>,
}

impl<'m> HyperelasticModel<'m> {
    /// Samples the material at every element centroid and assembles the dead
    /// external load from the configured body force and traction.
    pub fn new(
        mesh: &'m DomainMesh,
        material: &MaterialField,
        config: &SimulationConfig,
    ) -> Result<HyperelasticModel<'m>> {
        let mut laws = Vec::with_capacity(mesh.elements.len());
        let mut areas = Vec::with_capacity(mesh.elements.len());
        let mut gradients = Vec::with_capacity(mesh.elements.len());

        for element in &mesh.elements {
            let centroid = mesh.centroid(element);
            let local = material.material_at(centroid.x, centroid.y)?;
            laws.push(NeoHookean::new(&local));
            areas.push(mesh.element_area(element).abs());
            gradients.push(mesh.shape_gradients(element));
        }

        let external = assemble_external(mesh, &areas, config.body_force, config.traction);

        Ok(HyperelasticModel {
            mesh,
            laws,
            areas,
            gradients,
            external,
        })
    }

    pub fn mesh(&self) -> &DomainMesh {
        self.mesh
    }

    pub fn element_law(&self, element: usize) -> &NeoHookean {
        &self.laws[element]
    }

    fn element_displacements(&self, element: usize, u: &DVector<f64>) -> SVector<f64, 6> {
        let dofs = self.mesh.elements[element].dofs();
        SVector::<f64, 6>::from_fn(|r, _| u[dofs[r]])
    }

    /// Deformation gradient of `element` under the nodal displacements `u`.
    pub fn deformation_gradient(&self, element: usize, u: &DVector<f64>) -> Matrix2<f64> {
        deformation_gradient(&self.gradients[element], &self.element_displacements(element, u))
    }

    /// Smallest element Jacobian; non-positive means some element is inverted.
    pub fn min_jacobian(&self, u: &DVector<f64>) -> f64 {
        (0..self.laws.len())
            .map(|e| self.deformation_gradient(e, u).determinant())
            .fold(f64::INFINITY, f64::min)
    }

    /// Assembled internal virtual work vector.
    pub fn internal_forces(&self, u: &DVector<f64>) -> DVector<f64> {
        let mut forces = DVector::zeros(self.mesh.dof_count());
        for (e, element) in self.mesh.elements.iter().enumerate() {
            let f = self.deformation_gradient(e, u);
            let local = element_internal_force(&self.laws[e], &self.gradients[e], self.areas[e], &f);
            for (r, dof) in element.dofs().iter().enumerate() {
                forces[*dof] += local[r];
            }
        }
        forces
    }

    /// Assembled external virtual work vector (independent of `u`).
    pub fn external_forces(&self) -> &DVector<f64> {
        &self.external
    }

    /// Out-of-balance force `R(u) = f_int(u) - f_ext`.
    pub fn residual(&self, u: &DVector<f64>) -> DVector<f64> {
        self.internal_forces(u) - &self.external
    }

    /// Calls `sink` with the dofs and tangent matrix of every element.
    pub fn for_each_element_tangent<S>(&self, u: &DVector<f64>, mut sink: S)
    where
        S: FnMut(&[usize; 3 * DOF], &SMatrix<f64, 6, 6>),
    {
        for (e, element) in self.mesh.elements.iter().enumerate() {
            let f = self.deformation_gradient(e, u);
            let k = element_tangent(&self.laws[e], &self.gradients[e], self.areas[e], &f);
            sink(&element.dofs(), &k);
        }
    }

    /// Integral of the strain-energy density over the domain.
    pub fn strain_energy(&self, u: &DVector<f64>) -> f64 {
        (0..self.laws.len())
            .map(|e| self.areas[e] * self.laws[e].energy_density(&self.deformation_gradient(e, u)))
            .sum()
    }

    /// Cauchy stress of every element.
    pub fn cauchy_stresses(&self, u: &DVector<f64>) -> Vec<Matrix2<f64>> {
        (0..self.laws.len())
            .map(|e| self.laws[e].cauchy_stress(&self.deformation_gradient(e, u)))
            .collect()
    }
}

/// Lumps `int B.v dx + int T.v ds` onto the nodes.
fn assemble_external(
    mesh: &DomainMesh,
    areas: &[f64],
    body_force: Vector2<f64>,
    traction: Vector2<f64>,
) -> DVector<f64> {
    let mut external = DVector::zeros(mesh.dof_count());

    for (element, area) in mesh.elements.iter().zip(areas) {
        for node in element.nodes {
            let [dx, dy] = Node::dofs(node);
            external[dx] += body_force.x * area / 3.0;
            external[dy] += body_force.y * area / 3.0;
        }
    }

    for [a, b] in mesh.boundary_edges() {
        let va = mesh.nodes[*a].vertex;
        let vb = mesh.nodes[*b].vertex;
        let length = ((vb.x - va.x).powi(2) + (vb.y - va.y).powi(2)).sqrt();
        for node in [*a, *b] {
            let [dx, dy] = Node::dofs(node);
            external[dx] += traction.x * length / 2.0;
            external[dy] += traction.y * length / 2.0;
        }
    }

    external
}
